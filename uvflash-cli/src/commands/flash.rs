//! `flash` command: write firmware through the K5 bootloader.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use console::style;
use uvflash::flash::MAX_BODY_LEN;
use uvflash::{CancelToken, Firmware, K5Flasher, RadioFamily, UnpackOptions};

use crate::config::Config;
use crate::{Cli, CliError, Connection, lib_err, progress_bar, resolve_family, track};

/// Refuse families without a bootloader path and bodies that cannot fit.
fn check_flashable(family: RadioFamily, firmware: &Firmware) -> Result<()> {
    if !family.supports_flashing() {
        return Err(CliError::Usage(format!(
            "firmware flashing is not supported on {family}"
        ))
        .into());
    }
    let len = firmware.body().len();
    if len == 0 || len > MAX_BODY_LEN {
        return Err(CliError::Usage(format!(
            "firmware body is {len} bytes, the radio takes 1..={MAX_BODY_LEN} bytes"
        ))
        .into());
    }
    Ok(())
}

/// Flash command implementation.
pub(crate) fn cmd_flash(
    cli: &Cli,
    config: &mut Config,
    firmware: &Path,
    require_crc: bool,
    wait_secs: u64,
) -> Result<()> {
    let family = resolve_family(cli, config)?;

    if !cli.quiet {
        eprintln!(
            "{} Loading firmware: {}",
            style("📦").cyan(),
            firmware.display()
        );
    }
    let image = Firmware::from_file(firmware, UnpackOptions { require_crc })
        .with_context(|| format!("Failed to load firmware {}", firmware.display()))?;
    check_flashable(family, &image)?;

    if !cli.quiet {
        eprintln!(
            "    {} {}, version {}, {} bytes",
            style("•").dim(),
            image.form(),
            style(image.version()).cyan(),
            image.body().len()
        );
    }

    let conn = Connection::open(cli, config, "flash")?;
    let flasher = K5Flasher::new(conn.transport()?)
        .with_bootloader_timeout(Duration::from_secs(wait_secs))
        .with_cancel(CancelToken::new());

    if !cli.quiet {
        eprintln!(
            "{} Turn the radio on while holding PTT to enter the bootloader (waiting {wait_secs}s)",
            style("⏳").yellow()
        );
    }
    // The bootloader repeats its beacon until a version is announced.
    let bootloader = flasher.wait_for_bootloader().map_err(lib_err)?;
    if !cli.quiet {
        eprintln!(
            "{} Bootloader {} detected",
            style("✓").green(),
            style(&bootloader).cyan()
        );
    }

    let pb = progress_bar(cli, "Flashing");
    flasher.flash(&image, &mut track(&pb)).map_err(lib_err)?;
    pb.finish_with_message("Complete");

    if !cli.quiet {
        eprintln!(
            "\n{} Flashed {} to the {family}. The radio restarts on its own.",
            style("🎉").green().bold(),
            image.version()
        );
    }
    Ok(())
}
