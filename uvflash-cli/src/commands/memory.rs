//! Radio memory commands: info, backup, restore, calibration, clean, reboot.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use uvflash::{CancelToken, Radio, bulk};

use crate::config::Config;
use crate::{Cli, CliError, Connection, lib_err, progress_bar, resolve_family, track};

struct Session {
    conn: Connection,
    radio: Radio,
    version: Option<String>,
}

/// Open a claimed connection and run the init handshake.
fn session(cli: &Cli, config: &mut Config, owner: &str) -> Result<Session> {
    let conn = Connection::open(cli, config, owner)?;
    let radio = conn.radio()?;
    let version = conn.init(&radio)?;
    if !cli.quiet {
        eprintln!(
            "{} Connected to {} (firmware {})",
            style("✓").green(),
            conn.family(),
            version.as_deref().unwrap_or("unknown")
        );
    }
    Ok(Session {
        conn,
        radio,
        version,
    })
}

/// Read `path` and make sure it is exactly `expected` bytes.
fn read_sized(path: &Path, expected: usize, what: &str) -> Result<Vec<u8>> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    if data.len() != expected {
        return Err(CliError::Usage(format!(
            "{} is {} bytes, a {what} image must be {expected} bytes",
            path.display(),
            data.len()
        ))
        .into());
    }
    Ok(data)
}

fn write_output(cli: &Cli, path: &Path, data: &[u8]) -> Result<()> {
    fs::write(path, data).with_context(|| format!("Failed to write {}", path.display()))?;
    if !cli.quiet {
        eprintln!(
            "{} Saved {} bytes to {}",
            style("💾").cyan(),
            data.len(),
            path.display()
        );
    }
    Ok(())
}

/// Print the firmware version reported by the radio.
pub(crate) fn cmd_info(cli: &Cli, config: &mut Config) -> Result<()> {
    let Session {
        conn,
        radio,
        version,
    } = session(cli, config, "info")?;
    let layout = radio.layout();

    println!("{}", version.as_deref().unwrap_or("unknown"));
    if !cli.quiet {
        eprintln!(
            "  {} {}, {:#x} bytes, calibration {:#06x}..{:#06x}",
            style("•").dim(),
            conn.family(),
            layout.size,
            layout.calibration.start,
            layout.calibration.end
        );
    }
    Ok(())
}

/// Save the whole memory, calibration included.
pub(crate) fn cmd_backup(cli: &Cli, config: &mut Config, output: &Path) -> Result<()> {
    let link = session(cli, config, "backup")?;

    let pb = progress_bar(cli, "Reading");
    let image =
        bulk::backup(&link.radio, &CancelToken::new(), &mut track(&pb)).map_err(lib_err)?;
    pb.finish_with_message("Complete");

    write_output(cli, output, &image)
}

/// Write a saved image back, calibration only on request.
pub(crate) fn cmd_restore(
    cli: &Cli,
    config: &mut Config,
    input: &Path,
    include_calibration: bool,
) -> Result<()> {
    let family = resolve_family(cli, config)?;
    let image = read_sized(input, family.layout().size, &family.to_string())?;

    let link = session(cli, config, "restore")?;

    let pb = progress_bar(cli, "Writing");
    bulk::restore(
        &link.radio,
        &image,
        include_calibration,
        &CancelToken::new(),
        &mut track(&pb),
    )
    .map_err(lib_err)?;
    pb.finish_with_message("Complete");

    if !cli.quiet {
        eprintln!(
            "{} Restored {}{}",
            style("✓").green(),
            input.display(),
            if include_calibration {
                " including calibration"
            } else {
                ""
            }
        );
    }
    Ok(())
}

/// Save the calibration window.
pub(crate) fn cmd_calibration_backup(cli: &Cli, config: &mut Config, output: &Path) -> Result<()> {
    let link = session(cli, config, "calibration")?;

    let pb = progress_bar(cli, "Reading calibration");
    let data = bulk::backup_calibration(&link.radio, &CancelToken::new(), &mut track(&pb))
        .map_err(lib_err)?;
    pb.finish_with_message("Complete");

    write_output(cli, output, &data)
}

/// Write a saved calibration window back.
pub(crate) fn cmd_calibration_restore(cli: &Cli, config: &mut Config, input: &Path) -> Result<()> {
    let family = resolve_family(cli, config)?;
    let data = read_sized(input, family.layout().calibration.len(), "calibration")?;

    let link = session(cli, config, "calibration")?;

    let pb = progress_bar(cli, "Writing calibration");
    bulk::restore_calibration(&link.radio, &data, &CancelToken::new(), &mut track(&pb))
        .map_err(lib_err)?;
    pb.finish_with_message("Complete");
    Ok(())
}

/// Erase everything outside the calibration window.
pub(crate) fn cmd_clean(cli: &Cli, config: &mut Config, yes: bool) -> Result<()> {
    if !yes {
        return Err(CliError::Usage(
            "clean erases all channels and settings; pass --yes to confirm".to_string(),
        )
        .into());
    }

    let link = session(cli, config, "clean")?;

    let pb = progress_bar(cli, "Erasing");
    bulk::clean(&link.radio, &CancelToken::new(), &mut track(&pb)).map_err(lib_err)?;
    pb.finish_with_message("Complete");

    if !cli.quiet {
        eprintln!(
            "{} Memory cleaned; calibration kept. Reboot the radio to apply.",
            style("✓").green()
        );
    }
    Ok(())
}

/// Restart the radio.
pub(crate) fn cmd_reboot(cli: &Cli, config: &mut Config) -> Result<()> {
    let link = session(cli, config, "reboot")?;
    link.radio.reboot().map_err(lib_err)?;
    if !cli.quiet {
        eprintln!("{} {} rebooting", style("🔄").cyan(), link.conn.family());
    }
    Ok(())
}
