//! picprog CLI - Command-line tool for programming PIC18 microcontrollers.
//!
//! ## Features
//!
//! - Program flash, ID locations, EEPROM and fuses from an Intel HEX file
//! - Read-back verification of every programmed window
//! - Erase-only mode
//! - Supported device listing (text or JSON)
//! - Configuration file and environment variable support

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn};
use picprog::port::{DEFAULT_BAUD, DEFAULT_PORT};
use picprog::session::DEFAULT_SETTLE_DELAY;
use picprog::{
    DeviceTable, HexImage, MemoryRegion, SerialConfig, SessionConfig, SessionReport, SessionState,
    SourceImage, VerifyOutcome,
};
use std::env;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Exit code for device-side failures (not recognized, erase, framing).
const EXIT_DEVICE: u8 = 1;
/// Exit code for usage, input and connection failures.
const EXIT_USAGE: u8 = 2;

/// Most mismatches listed per region before summarising.
const MAX_LISTED_MISMATCHES: usize = 16;

/// picprog - Program PIC18 microcontrollers through an Arduino programmer.
///
/// Environment variables:
///   PICPROG_PORT     - Default serial port
///   PICPROG_DEVICE   - Default target device
///   PICPROG_BAUD     - Default baud rate (default: 38400)
#[derive(Parser, Debug)]
#[command(name = "picprog")]
#[command(author, version, about, long_about = None)]
#[command(after_help = "Example: picprog -i firmware.hex -P /dev/ttyACM0")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Target device (e.g. 18f4550). Skips device identification.
    #[arg(short = 'p', long = "device", value_name = "NAME", env = "PICPROG_DEVICE")]
    device: Option<String>,

    /// Serial port the programmer is attached to.
    #[arg(short = 'P', long, env = "PICPROG_PORT")]
    port: Option<String>,

    /// Intel HEX file to program.
    #[arg(short, long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Erase the chip and stop.
    #[arg(short, long)]
    erase: bool,

    /// List supported devices.
    #[arg(short, long)]
    list: bool,

    /// Machine-readable JSON output (device list or session report).
    #[arg(long)]
    json: bool,

    /// Baud rate of the programmer link.
    #[arg(short, long, env = "PICPROG_BAUD")]
    baud: Option<u32>,

    /// Milliseconds to wait after opening the port before the handshake.
    #[arg(long, value_name = "MS")]
    settle_ms: Option<u64>,

    /// Read timeout in milliseconds (default: wait forever).
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Verbose output level (-v frames, -vv raw bytes).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,
}

/// CLI-level failures that are not library errors.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Invalid combination of arguments.
    #[error("{0}")]
    Usage(String),
    /// Explicit configuration file could not be used.
    #[error("{0}")]
    Config(String),
}

/// Effective settings after merging CLI, environment and config files.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Settings {
    port: String,
    baud: u32,
    settle_delay: Duration,
    read_timeout: Option<Duration>,
    device: Option<String>,
}

impl Settings {
    fn resolve(cli: &Cli, config: &Config) -> Self {
        let conn = &config.connection;
        Self {
            port: cli
                .port
                .clone()
                .or_else(|| conn.port.clone())
                .unwrap_or_else(|| DEFAULT_PORT.to_string()),
            baud: cli
                .baud
                .or(conn.baud)
                .unwrap_or(DEFAULT_BAUD),
            settle_delay: cli
                .settle_ms
                .or(conn.settle_ms)
                .map_or(DEFAULT_SETTLE_DELAY, Duration::from_millis),
            read_timeout: cli
                .timeout_ms
                .or(conn.timeout_ms)
                .map(Duration::from_millis),
            device: cli
                .device
                .clone()
                .or_else(|| config.target.device.clone()),
        }
    }

    fn session_config(&self, erase_only: bool) -> SessionConfig {
        let config = SessionConfig::default()
            .with_erase_only(erase_only)
            .with_settle_delay(self.settle_delay)
            .with_read_timeout(self.read_timeout);
        match &self.device {
            Some(device) => config.with_device(device.clone()),
            None => config,
        }
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "picprog v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    if cli.list {
        return cmd_list(cli.json);
    }

    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    let settings = Settings::resolve(cli, &config);

    let image = if cli.erase {
        None
    } else {
        let path = cli
            .input
            .as_deref()
            .ok_or_else(|| {
                CliError::Usage("no input file given (use -i FILE, or -e to only erase)".into())
            })?;
        Some(load_image(cli, path)?)
    };

    cmd_program(cli, &settings, image.as_ref())
}

/// Map an error chain to the process exit code.
fn exit_code(err: &anyhow::Error) -> u8 {
    if err
        .downcast_ref::<CliError>()
        .is_some()
    {
        return EXIT_USAGE;
    }
    match err
        .chain()
        .find_map(|cause| cause.downcast_ref::<picprog::Error>())
    {
        Some(e) if e.is_transport() => EXIT_USAGE,
        Some(
            picprog::Error::DeviceNotRecognized(_)
            | picprog::Error::EraseFailed(_)
            | picprog::Error::Framing(_),
        ) => EXIT_DEVICE,
        Some(_) => EXIT_USAGE,
        None => EXIT_DEVICE,
    }
}

fn load_image(cli: &Cli, path: &Path) -> Result<HexImage> {
    if !cli.quiet {
        eprintln!(
            "{} Loading {}",
            style("📦").cyan(),
            path.display()
        );
    }

    let image = HexImage::from_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} {} flash, {} ID, {} EEPROM, {} config byte(s)",
            style("ℹ").blue(),
            image.region_len(MemoryRegion::Flash),
            image.region_len(MemoryRegion::DeviceId),
            image.region_len(MemoryRegion::Eeprom),
            image.region_len(MemoryRegion::Fuses),
        );
    }
    let stray = image.stray_len();
    if stray > 0 {
        warn!("{stray} byte(s) outside device memory will be ignored");
    }
    Ok(image)
}

fn cmd_program(cli: &Cli, settings: &Settings, image: Option<&HexImage>) -> Result<()> {
    if !cli.quiet {
        eprintln!(
            "{} Using port {} @ {} baud",
            style("🔌").cyan(),
            settings.port,
            settings.baud
        );
    }

    let serial = SerialConfig::new(&settings.port, settings.baud).with_timeout(settings.read_timeout);
    let mut session = picprog::open_session(&serial, settings.session_config(cli.erase))
        .with_context(|| format!("cannot open {}", settings.port))?;

    if !cli.quiet {
        eprintln!("{} Waiting for the programmer...", style("⏳").yellow());
    }

    // Create progress bar
    let pb = if cli.quiet || cli.json || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(100);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let mut current_state = None;
    let result = session.run(
        image.map(|i| i as &dyn SourceImage),
        &mut |state: SessionState, current: usize, total: usize| {
            if current_state != Some(state) {
                current_state = Some(state);
                pb.set_message(state.to_string());
            }
            if total > 0 {
                pb.set_position((current * 100 / total) as u64);
            }
        },
    );
    pb.finish_and_clear();

    let report = result?;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !cli.quiet {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SessionReport) {
    if let Some(device) = &report.device {
        eprintln!("{} Your MCU: {}", style("✓").green(), device.part_name());
    }
    if report.erased {
        eprintln!("{} Chip erased", style("✓").green());
    }

    for region in &report.regions {
        let name = region.region;
        if region.skipped {
            eprintln!("  {} {name}: no data, skipped", style("•").dim());
            continue;
        }
        match &region.verification {
            Some(VerifyOutcome::Verified { windows }) => eprintln!(
                "{} {name}: {} window(s) written, {windows} verified",
                style("✓").green(),
                region.windows_written
            ),
            Some(VerifyOutcome::Mismatch { mismatches }) => {
                eprintln!(
                    "{} {name}: verification failed, {} byte(s) differ",
                    style("✗").red(),
                    mismatches.len()
                );
                for m in mismatches
                    .iter()
                    .take(MAX_LISTED_MISMATCHES)
                {
                    eprintln!(
                        "    {} 0x{:06X}: expected 0x{:02X}, read 0x{:02X}",
                        style("•").dim(),
                        m.address,
                        m.expected,
                        m.actual
                    );
                }
                if mismatches.len() > MAX_LISTED_MISMATCHES {
                    eprintln!(
                        "    {} ...and {} more",
                        style("•").dim(),
                        mismatches.len() - MAX_LISTED_MISMATCHES
                    );
                }
            },
            Some(VerifyOutcome::Framing { cause }) => eprintln!(
                "{} {name}: verification aborted ({cause})",
                style("✗").red()
            ),
            None => {},
        }
    }

    if !report.fuses_written.is_empty() {
        eprintln!(
            "{} {} fuse(s) programmed",
            style("✓").green(),
            report.fuses_written.len()
        );
    }

    if report.all_verified() {
        eprintln!("\n{} {}", style("🎉").green().bold(), style("Done").bold());
    } else {
        eprintln!(
            "\n{} {}",
            style("⚠").yellow().bold(),
            style("Done, with verification errors").yellow()
        );
    }
}

fn cmd_list(json: bool) -> Result<()> {
    let devices = DeviceTable::default().devices();

    if json {
        let list: Vec<serde_json::Value> = devices
            .iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.name,
                    "part": d.part_name(),
                    "device_id": d.device_id,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    println!("{}", style("Supported devices:").bold().underlined());
    for device in devices {
        println!(
            "  {} {:<12} {}",
            style("•").green(),
            style(device.part_name()).cyan(),
            style(format!("(ID 0x{:04X})", device.device_id)).dim()
        );
    }
    Ok(())
}
