//! Serial port selection for the programming cable.
//!
//! An explicit `--port` or a configured port wins. Otherwise ports are
//! enumerated, recognised cables are preferred, and the user is asked when
//! more than one candidate remains.

use std::io::IsTerminal;

use anyhow::Result;
use console::style;
use dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme};
use log::{debug, error, info};
use uvflash::{DetectedPort, detect_ports};

use crate::CliError;
use crate::config::Config;

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Offer every port, not only recognised cables.
    pub list_all_ports: bool,
    /// Never prompt; fail unless exactly one candidate exists.
    pub non_interactive: bool,
    /// Ask even when a single recognised cable is found.
    pub confirm_port: bool,
}

/// A chosen port and whether it matched a known cable.
pub struct SelectedPort {
    pub port: DetectedPort,
    pub is_known: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn cancelled() -> anyhow::Error {
    CliError::Cancelled("Port selection cancelled".to_string()).into()
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    if let Some(port_name) = &config.port.connection.serial {
        debug!("Using port from config: {port_name}");
        return Ok(find_port_by_name(port_name, detect_ports()));
    }

    let ports = detect_ports();
    if ports.is_empty() {
        return Err(usage_err(
            "No serial ports found. Is the programming cable plugged in?",
        ));
    }

    let candidates = candidate_ports(ports, options.list_all_ports, config);

    if options.non_interactive {
        return select_non_interactive_port(candidates, config);
    }

    match candidates.len() {
        0 => Err(usage_err("No serial ports available")),
        1 => {
            let mut candidates = candidates;
            let Some(port) = candidates.pop() else {
                return Err(usage_err("No serial ports available"));
            };
            let is_known = is_known_device(&port, config);

            if is_known && !options.confirm_port {
                info!("Auto-selected port: {} [{}]", port.name, port.device.name());
                Ok(SelectedPort { port, is_known })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        _ => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates, config)
        },
    }
}

/// Recognised cables, unless there are none or every port was requested.
fn candidate_ports(ports: Vec<DetectedPort>, all: bool, config: &Config) -> Vec<DetectedPort> {
    if all {
        return ports;
    }
    let known: Vec<DetectedPort> = ports
        .iter()
        .filter(|p| is_known_device(p, config))
        .cloned()
        .collect();
    if known.is_empty() { ports } else { known }
}

/// Exactly one candidate or a usage error; never prompts.
fn select_non_interactive_port(
    mut candidates: Vec<DetectedPort>,
    config: &Config,
) -> Result<SelectedPort> {
    match candidates.len() {
        0 => Err(usage_err("No serial ports available")),
        1 => {
            let Some(port) = candidates.pop() else {
                return Err(usage_err("No serial ports available"));
            };
            Ok(SelectedPort {
                is_known: is_known_device(&port, config),
                port,
            })
        },
        n => Err(usage_err(&format!(
            "{n} serial ports found; pass --port to choose one"
        ))),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs a terminal; pass --port or --non-interactive",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) if io_err.kind() == std::io::ErrorKind::Interrupted => {
            cancelled()
        },
        DialoguerError::IO(io_err) => usage_err(&format!("Prompt failed: {io_err}")),
    }
}

/// Match `name` against `ports`, falling back to a bare entry for ports
/// enumeration does not report.
fn find_port_by_name(name: &str, ports: Vec<DetectedPort>) -> SelectedPort {
    let found = ports
        .into_iter()
        .find(|p| p.name == name || p.name.eq_ignore_ascii_case(name));

    match found {
        Some(port) => SelectedPort {
            is_known: port.device.is_known(),
            port,
        },
        None => SelectedPort {
            port: DetectedPort::named(name),
            is_known: false,
        },
    }
}

/// Built-in cable bridge or a cable listed in the config.
fn is_known_device(port: &DetectedPort, config: &Config) -> bool {
    if port.device.is_known() {
        return true;
    }
    match (port.vid, port.pid) {
        (Some(vid), Some(pid)) => config
            .port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid)),
        _ => false,
    }
}

fn port_label(port: &DetectedPort, config: &Config) -> String {
    let name = if is_known_device(port, config) {
        style(&port.name).bold().to_string()
    } else {
        port.name.clone()
    };

    let device_info = if port.device.is_known() {
        format!(" [{}]", style(port.device.name()).yellow())
    } else if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
        format!(" ({vid:04X}:{pid:04X})")
    } else {
        String::new()
    };

    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();

    format!("{name}{device_info}{product}")
}

fn select_port_interactive(mut ports: Vec<DetectedPort>, config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Found {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );
    eprintln!("{}", style("Recognised cables are shown in bold").dim());

    ports.sort_by_key(|p| !is_known_device(p, config));

    let max_item_width = usize::from(console::Term::stderr().size().1).saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            console::truncate_str(&port_label(port, config), max_item_width, "\u{2026}")
                .into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the programming cable")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    let Some(index) = selection else {
        return Err(cancelled());
    };
    let port = ports
        .into_iter()
        .nth(index)
        .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
    let is_known = is_known_device(&port, config);
    Ok(SelectedPort { port, is_known })
}

fn confirm_single_port(port: DetectedPort) -> Result<SelectedPort> {
    let product_info = port
        .product
        .as_ref()
        .map(|p| format!(" - {p}"))
        .unwrap_or_default();

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}{product_info}?", port.name))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            is_known: false,
        })
    } else {
        Err(cancelled())
    }
}

/// Offer to save an unrecognised cable so it is picked automatically next time.
pub fn ask_remember_port(port: &DetectedPort, config: &mut Config) -> Result<()> {
    if is_known_device(port, config) || !std::io::stdin().is_terminal() {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {} for next time?", port.name))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        match config.remember_port(&port.name, port.vid, port.pid) {
            Ok(path) => eprintln!(
                "{} Saved to {}",
                style("✓").green(),
                path.display()
            ),
            Err(e) => error!("Failed to save port configuration: {e}"),
        }
    }

    Ok(())
}
