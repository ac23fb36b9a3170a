//! Turntable placement tracking.
//!
//! The turntable holds two plate slots. One is always at the processing
//! position and the other at the loading position; a rotation swaps them.

use std::fmt;
use std::str::FromStr;

use crate::protocol::constants::{ROTATE_POSITION_LOADING, ROTATE_POSITION_PROCESSING};

/// One of the two turntable slots (`Rotate@nest`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Slot {
    One,
    Two,
}

impl Slot {
    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(Slot::One),
            2 => Some(Slot::Two),
            _ => None,
        }
    }

    pub fn number(self) -> u8 {
        match self {
            Slot::One => 1,
            Slot::Two => 2,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Slot::One => Slot::Two,
            Slot::Two => Slot::One,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.number())
    }
}

/// Turntable position a slot can be moved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Processing,
    Loading,
}

impl Location {
    /// `Rotate@position` value.
    pub fn rotate_position(self) -> u8 {
        match self {
            Location::Processing => ROTATE_POSITION_PROCESSING,
            Location::Loading => ROTATE_POSITION_LOADING,
        }
    }

    pub fn other(self) -> Self {
        match self {
            Location::Processing => Location::Loading,
            Location::Loading => Location::Processing,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Processing => write!(f, "processing"),
            Location::Loading => write!(f, "loading"),
        }
    }
}

impl FromStr for Location {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "processing" => Ok(Location::Processing),
            "loading" => Ok(Location::Loading),
            other => Err(format!(
                "unknown turntable location {:?} (expected \"processing\" or \"loading\")",
                other
            )),
        }
    }
}

/// Which slot is where, if known.
///
/// Only a rotation confirmed by a `Ready` event makes the placement known.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurntableState {
    #[default]
    Unknown,
    Known { at_processing: Slot },
}

impl TurntableState {
    /// Placement after `slot` has reached `location`.
    pub fn after_rotation(slot: Slot, location: Location) -> Self {
        let at_processing = match location {
            Location::Processing => slot,
            Location::Loading => slot.other(),
        };
        TurntableState::Known { at_processing }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, TurntableState::Known { .. })
    }

    /// Slot currently at `location`.
    pub fn slot_at(&self, location: Location) -> Option<Slot> {
        match (self, location) {
            (TurntableState::Unknown, _) => None,
            (TurntableState::Known { at_processing }, Location::Processing) => Some(*at_processing),
            (TurntableState::Known { at_processing }, Location::Loading) => {
                Some(at_processing.other())
            }
        }
    }

    /// Location of `slot`.
    pub fn location_of(&self, slot: Slot) -> Option<Location> {
        self.slot_at(Location::Processing).map(|p| {
            if p == slot {
                Location::Processing
            } else {
                Location::Loading
            }
        })
    }
}

impl fmt::Display for TurntableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TurntableState::Unknown => write!(f, "unknown"),
            TurntableState::Known { at_processing } => write!(
                f,
                "{} at processing, {} at loading",
                at_processing,
                at_processing.other()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_after_rotation_places_both_slots() {
        let state = TurntableState::after_rotation(Slot::One, Location::Loading);
        assert_eq!(state.slot_at(Location::Loading), Some(Slot::One));
        assert_eq!(state.slot_at(Location::Processing), Some(Slot::Two));
        assert_eq!(state.location_of(Slot::Two), Some(Location::Processing));

        let state = TurntableState::after_rotation(Slot::Two, Location::Processing);
        assert_eq!(
            state,
            TurntableState::Known {
                at_processing: Slot::Two
            }
        );
    }

    #[test]
    fn test_unknown_has_no_placement() {
        let state = TurntableState::default();
        assert!(!state.is_known());
        assert_eq!(state.slot_at(Location::Processing), None);
        assert_eq!(state.location_of(Slot::One), None);
        assert_eq!(state.to_string(), "unknown");
    }

    #[test]
    fn test_slot_and_location_parsing() {
        assert_eq!(Slot::from_number(2), Some(Slot::Two));
        assert_eq!(Slot::from_number(0), None);
        assert_eq!(Slot::from_number(3), None);
        assert_eq!("Loading".parse::<Location>(), Ok(Location::Loading));
        assert!("middle".parse::<Location>().is_err());
        assert_eq!(Location::Processing.rotate_position(), 1);
        assert_eq!(Location::Loading.rotate_position(), 2);
    }
}
