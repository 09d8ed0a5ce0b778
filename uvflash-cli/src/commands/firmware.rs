//! Offline firmware image commands: firmware-info, unpack, pack.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use uvflash::image::{classify, has_crc_validation};
use uvflash::{Firmware, FirmwareForm, UnpackOptions, pack_firmware};

use crate::Cli;
use crate::config::Config;

fn read_image(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read firmware {}", path.display()))
}

fn crc_status(form: FirmwareForm) -> &'static str {
    match form {
        FirmwareForm::PackedWithCrc => "valid",
        FirmwareForm::Packed => "missing or invalid",
        FirmwareForm::Raw => "not applicable",
    }
}

fn info_json(path: &Path, file_len: usize, firmware: &Firmware) -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "data": {
            "file": path.display().to_string(),
            "file_size": file_len,
            "form": firmware.form(),
            "version": firmware.version(),
            "body_size": firmware.body().len(),
            "crc": crc_status(firmware.form()),
        }
    })
}

/// Describe a firmware file without touching a radio.
pub(crate) fn cmd_firmware_info(path: &Path, json: bool, config: &Config) -> Result<()> {
    let data = read_image(path)?;
    let firmware = Firmware::unpack_with(&data, UnpackOptions {
        require_crc: config.firmware.require_crc,
    })
    .with_context(|| format!("Failed to unpack {}", path.display()))?;

    if json {
        println!("{:#}", info_json(path, data.len(), &firmware));
        return Ok(());
    }

    let form = classify(&data);
    eprintln!("\n{}", style("Firmware").bold().underlined());
    eprintln!("  {} {}", style("File:").dim(), path.display());
    eprintln!("  {} {form}", style("Form:").dim());
    eprintln!(
        "  {} {}",
        style("Version:").dim(),
        style(firmware.version()).cyan()
    );
    eprintln!(
        "  {} {} bytes ({} bytes on disk)",
        style("Body:").dim(),
        firmware.body().len(),
        data.len()
    );
    let crc = if has_crc_validation(&data) {
        style(crc_status(form)).green()
    } else {
        style(crc_status(form)).yellow()
    };
    eprintln!("  {} {crc}", style("CRC:").dim());
    Ok(())
}

/// Write the flashable body of a firmware file.
pub(crate) fn cmd_unpack(cli: &Cli, firmware: &Path, output: &Path, require_crc: bool) -> Result<()> {
    let image = Firmware::from_file(firmware, UnpackOptions { require_crc })
        .with_context(|| format!("Failed to unpack {}", firmware.display()))?;

    fs::write(output, image.body())
        .with_context(|| format!("Failed to write {}", output.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Unpacked {} ({}, version {}) to {} ({} bytes)",
            style("✓").green(),
            firmware.display(),
            image.form(),
            image.version(),
            output.display(),
            image.body().len()
        );
    }
    Ok(())
}

/// Build a packed image with CRC from a raw body.
pub(crate) fn cmd_pack(cli: &Cli, body: &Path, version: &str, output: &Path) -> Result<()> {
    let raw = read_image(body)?;
    let packed = pack_firmware(&raw, version)
        .with_context(|| format!("Failed to pack {}", body.display()))?;

    fs::write(output, &packed).with_context(|| format!("Failed to write {}", output.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} Packed {} as version {version} to {} ({} bytes)",
            style("📦").cyan(),
            body.display(),
            output.display(),
            packed.len()
        );
    }
    Ok(())
}
