//! uvflash CLI - command-line programmer for Quansheng K5, K1 and TK11 radios.
//!
//! ## Features
//!
//! - EEPROM backup, restore and cleaning with calibration protection
//! - Calibration backup and restore
//! - Firmware inspection, unpacking and packing
//! - K5 bootloader flashing
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use uvflash::{ClaimGuard, ConnectionManager, Radio, RadioFamily, SerialConfig, Transport};

mod commands;
mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress bars and symbols should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or missing setup (exit 2).
    #[error("{0}")]
    Usage(String),
    /// Connection held by another owner (exit 3).
    #[error("{0}")]
    Busy(String),
    /// Interrupted by the user (exit 130).
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) => 2,
            Self::Busy(_) => 3,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for any error reaching `main`.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    match err.downcast_ref::<uvflash::Error>() {
        Some(uvflash::Error::Cancelled) => 130,
        Some(uvflash::Error::Config(_)) => 2,
        _ => 1,
    }
}

/// uvflash - program Quansheng K5, K1 and TK11 radios over the serial cable.
///
/// Environment variables:
///   UVFLASH_PORT              - Default serial port
///   UVFLASH_BAUD              - Baud rate (default: 38400)
///   UVFLASH_RADIO             - Radio family (k5, k1, tk11)
///   UVFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "uvflash")]
#[command(author, version, about, long_about = None)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "UVFLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the programming cable.
    #[arg(short, long, global = true, env = "UVFLASH_BAUD")]
    baud: Option<u32>,

    /// Radio family.
    #[arg(short, long, global = true, env = "UVFLASH_RADIO")]
    radio: Option<RadioArg>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "UVFLASH_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Confirm port selection even for auto-detected ports.
    #[arg(long, global = true)]
    confirm_port: bool,

    /// Offer all ports, not only recognised programming cables.
    #[arg(long, global = true)]
    list_all_ports: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Radio families selectable on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum RadioArg {
    /// Quansheng UV-K5 (8 KiB EEPROM, default).
    K5,
    /// Quansheng UV-K1 (64 KiB EEPROM).
    K1,
    /// Quansheng TK11 (internal flash).
    Tk11,
}

impl From<RadioArg> for RadioFamily {
    fn from(radio: RadioArg) -> Self {
        match radio {
            RadioArg::K5 => RadioFamily::K5,
            RadioArg::K1 => RadioFamily::K1,
            RadioArg::Tk11 => RadioFamily::Tk11,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Connect to the radio and show its firmware version.
    Info,

    /// Read the whole memory, calibration included, into a file.
    Backup {
        /// Output file.
        output: PathBuf,
    },

    /// Write a full-memory backup back to the radio.
    Restore {
        /// Backup file.
        input: PathBuf,

        /// Also overwrite the calibration region.
        #[arg(long)]
        include_calibration: bool,
    },

    /// Back up or restore the calibration region only.
    Calibration {
        #[command(subcommand)]
        action: CalibrationAction,
    },

    /// Fill everything outside the calibration region with 0xFF.
    Clean {
        /// Confirm erasing the radio's settings and channels.
        #[arg(long)]
        yes: bool,
    },

    /// Reboot the radio into normal operation.
    Reboot,

    /// Show information about a firmware file.
    FirmwareInfo {
        /// Firmware file (raw or packed).
        firmware: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Unpack a firmware file into a flashable body.
    Unpack {
        /// Firmware file (raw or packed).
        firmware: PathBuf,

        /// Output file for the body.
        #[arg(short, long)]
        output: PathBuf,

        /// Reject packed images without a valid CRC.
        #[arg(long)]
        require_crc: bool,
    },

    /// Pack a flashable body into a distributable firmware file.
    Pack {
        /// Body file.
        body: PathBuf,

        /// Version string stored in the image (at most 16 bytes).
        #[arg(long = "version", value_name = "VERSION")]
        fw_version: String,

        /// Output file.
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Flash firmware through the K5 bootloader.
    Flash {
        /// Firmware file (raw or packed).
        firmware: PathBuf,

        /// Reject packed images without a valid CRC.
        #[arg(long)]
        require_crc: bool,

        /// Seconds to wait for the radio to enter bootloader mode.
        #[arg(long, default_value = "30")]
        wait: u64,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type for completions (auto-detected with --install).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions into your shell configuration.
        #[arg(long)]
        install: bool,
    },
}

/// Calibration subcommands.
#[derive(Subcommand)]
enum CalibrationAction {
    /// Save the calibration region to a file.
    Backup {
        /// Output file.
        output: PathBuf,
    },
    /// Write a calibration file back to the radio.
    Restore {
        /// Calibration file.
        input: PathBuf,
    },
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if std::env::var_os("NO_COLOR").is_some() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // Help and version go to stdout with exit 0, usage errors exit 2.
            let _ = err.print();
            return ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(2));
        },
    };

    init_logging(&cli);

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Failed to install Ctrl-C handler: {e}");
    }
    uvflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn init_logging(cli: &Cli) {
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
        "uvflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::ports::cmd_list_ports(*json),
        Commands::Info => commands::memory::cmd_info(cli, &mut config)?,
        Commands::Backup { output } => commands::memory::cmd_backup(cli, &mut config, output)?,
        Commands::Restore {
            input,
            include_calibration,
        } => commands::memory::cmd_restore(cli, &mut config, input, *include_calibration)?,
        Commands::Calibration { action } => match action {
            CalibrationAction::Backup { output } => {
                commands::memory::cmd_calibration_backup(cli, &mut config, output)?;
            },
            CalibrationAction::Restore { input } => {
                commands::memory::cmd_calibration_restore(cli, &mut config, input)?;
            },
        },
        Commands::Clean { yes } => commands::memory::cmd_clean(cli, &mut config, *yes)?,
        Commands::Reboot => commands::memory::cmd_reboot(cli, &mut config)?,
        Commands::FirmwareInfo { firmware, json } => {
            commands::firmware::cmd_firmware_info(firmware, *json, &config)?;
        },
        Commands::Unpack {
            firmware,
            output,
            require_crc,
        } => commands::firmware::cmd_unpack(
            cli,
            firmware,
            output,
            *require_crc || config.firmware.require_crc,
        )?,
        Commands::Pack {
            body,
            fw_version,
            output,
        } => commands::firmware::cmd_pack(cli, body, fw_version, output)?,
        Commands::Flash {
            firmware,
            require_crc,
            wait,
        } => {
            let require_crc = *require_crc || config.firmware.require_crc;
            commands::flash::cmd_flash(cli, &mut config, firmware, require_crc, *wait)?;
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)?;
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g. `uvflash completions bash`, \
                         or use `uvflash completions --install`"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
            }
        },
    }

    Ok(())
}

/// Radio family from flags, environment or config, K5 by default.
pub(crate) fn resolve_family(cli: &Cli, config: &Config) -> Result<RadioFamily> {
    if let Some(radio) = cli.radio {
        return Ok(radio.into());
    }
    match &config.radio.family {
        Some(name) => name
            .parse::<RadioFamily>()
            .map_err(|e| anyhow::Error::from(CliError::Usage(e.to_string()))),
        None => Ok(RadioFamily::default()),
    }
}

/// Get serial port from CLI args, config or interactive selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        list_all_ports: cli.list_all_ports,
        non_interactive: cli.non_interactive,
        confirm_port: cli.confirm_port,
    };

    let selected = select_serial_port(&options, config)?;

    if !selected.is_known && !cli.non_interactive && options.port.is_none() {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected.port.name)
}

/// An open, claimed connection to one radio.
///
/// The port is closed when this is dropped.
pub(crate) struct Connection {
    manager: ConnectionManager,
    claim: ClaimGuard,
    family: RadioFamily,
}

impl Connection {
    /// Pick a port, open it and claim it for `owner`.
    pub(crate) fn open(cli: &Cli, config: &mut Config, owner: &str) -> Result<Self> {
        let family = resolve_family(cli, config)?;
        let port = get_port(cli, config)?;
        let baud = cli
            .baud
            .or(config.port.connection.baud)
            .unwrap_or_else(|| family.default_baud());

        if !cli.quiet {
            eprintln!(
                "{} Using {} at {baud} baud ({family})",
                style("🔌").cyan(),
                style(&port).green()
            );
        }

        let manager = ConnectionManager::new();
        manager
            .connect(&SerialConfig::new(&port, baud))
            .with_context(|| format!("Failed to open {port}"))?;

        let Some(claim) = manager.try_claim(owner) else {
            let holder = manager.state().owner.unwrap_or_default();
            manager.disconnect();
            return Err(CliError::Busy(format!("{port} is in use by {holder}")).into());
        };

        Ok(Self {
            manager,
            claim,
            family,
        })
    }

    /// Selected family.
    pub(crate) fn family(&self) -> RadioFamily {
        self.family
    }

    /// Radio session on the claimed port.
    pub(crate) fn radio(&self) -> Result<Radio> {
        Ok(self.claim.radio(self.family)?)
    }

    /// Raw transport, for the bootloader.
    pub(crate) fn transport(&self) -> Result<Transport> {
        Ok(self.claim.transport()?)
    }

    /// Open a session and record the reported firmware version.
    pub(crate) fn init(&self, radio: &Radio) -> Result<Option<String>> {
        let version = radio.init().map_err(lib_err).context("Radio did not answer")?;
        self.manager.set_firmware_version(version.clone());
        Ok(version)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.manager.disconnect();
    }
}

/// Turn a library cancellation into the CLI's cancelled error.
pub(crate) fn lib_err(err: uvflash::Error) -> anyhow::Error {
    match err {
        uvflash::Error::Cancelled => CliError::Cancelled("Interrupted".to_string()).into(),
        other => other.into(),
    }
}

/// Progress bar in percent, hidden in quiet or non-TTY mode.
pub(crate) fn progress_bar(cli: &Cli, message: &str) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb.set_message(message.to_string());
    pb
}

/// Progress callback driving `pb` from a 0..=1 fraction.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub(crate) fn track(pb: &ProgressBar) -> impl FnMut(f64) + '_ {
    move |fraction| pb.set_position((fraction * 100.0).round() as u64)
}
