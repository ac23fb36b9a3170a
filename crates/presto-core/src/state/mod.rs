//! Instrument state: run progress, turntable placement and the controller
//! that keeps both in step with the session.

pub mod controller;
pub mod machine;
pub mod turntable;

pub use controller::{AckTarget, Acknowledgement, Presto, RunEvent};
pub use machine::{BusyPhase, RunState, RunTracker};
pub use turntable::{Location, Slot, TurntableState};
