use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use presto_core::bdz::BdzFile;
use presto_core::protocol::StatusReport;
use presto_core::{Event, NusbTransport, Presto, RunEvent, SessionConfig};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "KingFisher Presto HID client (Pure Rust)", long_about = None)]
struct Args {
    /// Session configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Select the instrument by USB serial number
    #[arg(long)]
    serial: Option<String>,

    /// Response timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Set the instrument clock on connect (`YYYY-MM-DD hh:mm:ss`)
    #[arg(long)]
    set_time: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Show instrument identity and status
    Status,
    /// List protocols stored on the instrument
    List,
    /// Show the estimated duration of a stored protocol
    Duration { protocol: String },
    /// Run a protocol and follow its events
    Run {
        protocol: String,
        #[arg(long)]
        tip: Option<String>,
        #[arg(long)]
        step: Option<String>,
        /// Acknowledge plate and pause prompts without asking
        #[arg(short, long)]
        yes: bool,
    },
    /// Follow a run that is already in progress
    Attach {
        #[arg(short, long)]
        yes: bool,
    },
    /// Move a turntable slot (1 or 2) to `processing` or `loading`
    Rotate { slot: u8, location: String },
    /// Abort the running protocol
    Abort,
    /// Store a .bdz file on the instrument
    Upload { protocol: String, file: PathBuf },
    /// Fetch a stored protocol into a .bdz file
    Download { protocol: String, file: PathBuf },
    /// Inspect a local .bdz file
    Inspect {
        file: PathBuf,
        /// Print both XML documents
        #[arg(long)]
        xml: bool,
    },
    /// Write the effective configuration to a file
    SaveConfig { file: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = load_config(&args)?;

    if let Err(e) = run(&args, config) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load_from_file(path)?,
        None => SessionConfig::default(),
    };
    if let Some(serial) = &args.serial {
        config.serial_number = Some(serial.clone());
    }
    if let Some(timeout) = args.timeout_ms {
        config.response_timeout_ms = timeout;
    }
    Ok(config)
}

fn run(args: &Args, config: SessionConfig) -> Result<()> {
    // Local-only commands never touch the device.
    match &args.command {
        Cmd::Inspect { file, xml } => return inspect(file, *xml),
        Cmd::SaveConfig { file } => {
            config.save_to_file(file)?;
            info!("Configuration written to {}", file.display());
            return Ok(());
        }
        _ => {}
    }

    info!("Opening KingFisher Presto (nusb backend)...");
    let mut presto = Presto::open_device(config).context("no instrument found")?;
    let status = presto.setup(args.set_time.as_deref())?;

    let result = execute(&mut presto, &args.command, &status);
    presto.stop();
    result
}

fn execute(presto: &mut Presto<NusbTransport>, command: &Cmd, status: &StatusReport) -> Result<()> {
    match command {
        Cmd::Status => {
            if let Some(info) = presto.instrument_info() {
                println!(
                    "Instrument: {}  Version: {}  Serial: {}",
                    info.instrument.as_deref().unwrap_or("-"),
                    info.version.as_deref().unwrap_or("-"),
                    info.serial.as_deref().unwrap_or("-"),
                );
            }
            println!("Status: {}", status.status);
            if let Some(err) = &status.error {
                println!("Error: {}", err);
            }
        }
        Cmd::List => {
            let list = presto.list_protocols()?;
            for name in &list.names {
                println!("{}", name);
            }
            println!("Memory used: {}%", list.memory_used_percent);
        }
        Cmd::Duration { protocol } => {
            let duration = presto.get_protocol_duration(protocol)?;
            println!("{}: {}", protocol, duration.total.as_deref().unwrap_or("-"));
            for tip in &duration.tips {
                println!("  {}: {}", tip.name, tip.duration.as_deref().unwrap_or("-"));
                for step in &tip.steps {
                    println!("    {}: {}", step.name, step.duration.as_deref().unwrap_or("-"));
                }
            }
        }
        Cmd::Run {
            protocol,
            tip,
            step,
            yes,
        } => {
            presto.start_protocol(protocol, tip.as_deref(), step.as_deref())?;
            follow(presto, None, *yes)?;
        }
        Cmd::Attach { yes } => {
            let first = presto.attach()?;
            follow(presto, Some(first), *yes)?;
        }
        Cmd::Rotate { slot, location } => {
            presto.rotate_raw(*slot, location)?;
            println!("Turntable: {}", presto.turntable());
        }
        Cmd::Abort => presto.abort()?,
        Cmd::Upload { protocol, file } => {
            let data =
                std::fs::read(file).with_context(|| format!("reading {}", file.display()))?;
            // Only well-formed BDZ files are uploaded.
            BdzFile::from_bytes(&data)
                .with_context(|| format!("{} is not a BDZ file", file.display()))?;
            presto.upload_protocol(protocol, &data)?;
            info!("Uploaded {} ({} bytes)", protocol, data.len());
        }
        Cmd::Download { protocol, file } => {
            let data = presto.download_protocol(protocol)?;
            std::fs::write(file, &data).with_context(|| format!("writing {}", file.display()))?;
            info!("Downloaded {} to {}", protocol, file.display());
        }
        Cmd::Inspect { .. } | Cmd::SaveConfig { .. } => {}
    }
    Ok(())
}

/// Print run events until the run ends, answering prompts as they come.
fn follow(
    presto: &mut Presto<NusbTransport>,
    mut next: Option<RunEvent>,
    auto_ack: bool,
) -> Result<()> {
    loop {
        let run_event = match next.take() {
            Some(event) => event,
            None => presto.next_event()?,
        };
        describe(&run_event.event);

        let terminal = run_event.is_terminal();
        if let Some(ack) = run_event.acknowledgement {
            if auto_ack || confirm("Continue?")? {
                presto.send_acknowledgement(ack)?;
            } else {
                warn!("Prompt left unanswered; aborting");
                presto.abort()?;
            }
        }
        if terminal {
            if let Event::Error(err) = &run_event.event {
                bail!("run ended with {}", err);
            }
            return Ok(());
        }
    }
}

fn describe(event: &Event) {
    match event {
        Event::Ready => println!("Ready"),
        Event::Aborted => println!("Aborted"),
        Event::Error(err) => println!("Error: {}", err),
        Event::LoadPlate { plate } => println!("Load plate {}", plate.as_deref().unwrap_or("?")),
        Event::RemovePlate { plate } => {
            println!("Remove plate {}", plate.as_deref().unwrap_or("?"))
        }
        Event::ChangePlate { remove, load } => println!(
            "Change plate: remove {}, load {}",
            remove.as_deref().unwrap_or("?"),
            load.as_deref().unwrap_or("?")
        ),
        Event::Pause { message } => println!("Paused: {}", message.as_deref().unwrap_or("")),
        Event::StepStarted { tip, step } => println!(
            "Step {} / {}",
            tip.as_deref().unwrap_or("-"),
            step.as_deref().unwrap_or("-")
        ),
        Event::ProtocolTimeLeft(left) => {
            println!("Time left: {}", left.time_left.as_deref().unwrap_or("-"))
        }
        Event::Unknown(el) => println!("Event: {}", el.to_xml()),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{} [Y/n] ", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let answer = line.trim().to_ascii_lowercase();
    Ok(answer.is_empty() || answer == "y" || answer == "yes")
}

fn inspect(path: &Path, xml: bool) -> Result<()> {
    let file = BdzFile::load(path).with_context(|| format!("reading {}", path.display()))?;
    let header = file.header();
    println!("Product: {}", header.product_name());
    println!("Version: {}", header.product_version());
    println!("Member 1: {} bytes compressed", header.block1_size());
    println!(
        "Spacer: prefix {:02x?}, suffix {}",
        file.spacer().prefix,
        file.spacer().suffix
    );
    println!("Properties: {} bytes", file.properties_xml().len());
    println!("Exported data: {} bytes", file.exported_data_xml().len());

    if xml {
        println!("{}", String::from_utf8_lossy(file.properties_xml()));
        println!("{}", String::from_utf8_lossy(file.exported_data_xml()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use presto_core::{Location, Slot};

    #[test]
    fn test_args_parse_rotate() {
        let args = Args::try_parse_from(["presto", "--serial", "PR1", "rotate", "1", "loading"])
            .unwrap();
        assert_eq!(args.serial.as_deref(), Some("PR1"));
        assert!(matches!(args.command, Cmd::Rotate { slot: 1, .. }));
    }

    #[test]
    fn test_overrides_apply_over_defaults() {
        let args = Args::try_parse_from(["presto", "--timeout-ms", "500", "status"]).unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.response_timeout_ms, 500);
        assert_eq!(config.serial_number, None);
    }

    #[test]
    fn test_location_names() {
        assert_eq!("processing".parse::<Location>().unwrap(), Location::Processing);
        assert_eq!(Slot::from_number(2), Some(Slot::Two));
    }
}
