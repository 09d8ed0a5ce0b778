//! Integration tests for core CLI contract behavior.

use std::fs;
use std::path::Path;

use predicates::prelude::*;
use tempfile::tempdir;

fn cli_cmd(dir: &Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("uvflash");
    cmd.current_dir(dir)
        .env_remove("UVFLASH_PORT")
        .env_remove("UVFLASH_BAUD")
        .env_remove("UVFLASH_RADIO")
        .env("NO_COLOR", "1");
    cmd
}

/// A raw image: stack pointer first, version block at 0x2000.
fn raw_image(len: usize, version: &str) -> Vec<u8> {
    let mut image: Vec<u8> = (0..len).map(|i| (i % 239) as u8).collect();
    image[..4].copy_from_slice(&0x2000_1000u32.to_le_bytes());
    image[0x2000..0x2010].fill(0);
    image[0x2000..0x2000 + version.len()].copy_from_slice(version.as_bytes());
    image
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let dir = tempdir().unwrap();
    for flag in ["--help", "-h"] {
        cli_cmd(dir.path())
            .arg(flag)
            .assert()
            .success()
            .stdout(predicate::str::contains("uvflash"))
            .stdout(predicate::str::contains("backup"))
            .stderr(predicate::str::is_empty());
    }
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let dir = tempdir().unwrap();
    for flag in ["--version", "-V"] {
        cli_cmd(dir.path())
            .arg(flag)
            .assert()
            .success()
            .stdout(predicate::str::starts_with("uvflash "))
            .stderr(predicate::str::is_empty());
    }
}

#[test]
fn unknown_subcommand_is_usage_error() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .arg("erase-everything")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn unknown_radio_is_usage_error() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .args(["--radio", "uv5r", "info"])
        .assert()
        .code(2);
}

#[test]
fn completions_bash_writes_script() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("uvflash"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .arg("completions")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("completions bash"));
}

#[test]
fn list_ports_json_is_an_envelope() {
    let dir = tempdir().unwrap();
    let output = cli_cmd(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .unwrap();

    assert!(output.status.success());
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(parsed["ok"], true);
    assert!(parsed["data"]["ports"].is_array());
}

#[test]
fn pack_info_unpack_round_trip() {
    let dir = tempdir().unwrap();
    let body = raw_image(0x3000, "");
    fs::write(dir.path().join("body.bin"), &body).unwrap();

    cli_cmd(dir.path())
        .args(["pack", "body.bin", "--version", "v2.01.32", "-o", "fw.bin"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    let packed = fs::read(dir.path().join("fw.bin")).unwrap();
    assert_eq!(packed.len(), body.len() + 16 + 2);

    let output = cli_cmd(dir.path())
        .args(["firmware-info", "fw.bin", "--json"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(info["data"]["form"], "packed-with-crc");
    assert_eq!(info["data"]["version"], "v2.01.32");
    assert_eq!(info["data"]["body_size"], 0x3000);

    cli_cmd(dir.path())
        .args(["unpack", "fw.bin", "-o", "out.bin", "--require-crc"])
        .assert()
        .success();
    assert_eq!(fs::read(dir.path().join("out.bin")).unwrap(), body);
}

#[test]
fn raw_firmware_info_reports_version() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("raw.bin"), raw_image(0x2400, "raw-7.7")).unwrap();

    cli_cmd(dir.path())
        .args(["firmware-info", "raw.bin", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"raw\""))
        .stdout(predicate::str::contains("raw-7.7"));
}

#[test]
fn require_crc_rejects_corrupted_image() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("body.bin"), raw_image(0x2800, "")).unwrap();
    cli_cmd(dir.path())
        .args(["pack", "body.bin", "--version", "1.0", "-o", "fw.bin"])
        .assert()
        .success();

    let path = dir.path().join("fw.bin");
    let mut packed = fs::read(&path).unwrap();
    let last = packed.len() - 1;
    packed[last] ^= 0xFF;
    fs::write(&path, packed).unwrap();

    cli_cmd(dir.path())
        .args(["unpack", "fw.bin", "-o", "out.bin", "--require-crc"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("CRC"));
    assert!(!dir.path().join("out.bin").exists());
}

#[test]
fn require_crc_from_local_config() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("body.bin"), raw_image(0x2800, "")).unwrap();
    cli_cmd(dir.path())
        .args(["pack", "body.bin", "--version", "1.0", "-o", "fw.bin"])
        .assert()
        .success();
    let path = dir.path().join("fw.bin");
    let mut packed = fs::read(&path).unwrap();
    packed.truncate(packed.len() - 2);
    fs::write(&path, packed).unwrap();

    cli_cmd(dir.path())
        .args(["unpack", "fw.bin", "-o", "lenient.bin"])
        .assert()
        .success();

    fs::write(
        dir.path().join("uvflash.toml"),
        "[firmware]\nrequire_crc = true\n",
    )
    .unwrap();
    cli_cmd(dir.path())
        .args(["unpack", "fw.bin", "-o", "strict.bin"])
        .assert()
        .failure();
}

#[test]
fn missing_firmware_keeps_stdout_clean() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .args(["firmware-info", "not_there.bin", "--json"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn pack_rejects_long_version() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("body.bin"), raw_image(0x2100, "")).unwrap();
    cli_cmd(dir.path())
        .args([
            "pack",
            "body.bin",
            "--version",
            "a-version-far-too-long",
            "-o",
            "fw.bin",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("16 bytes"));
}

#[test]
fn clean_requires_confirmation() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .args(["--port", "/dev/uvflash-none", "clean"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--yes"));
}

#[test]
fn restore_rejects_wrong_size_before_connecting() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("small.bin"), [0u8; 100]).unwrap();
    cli_cmd(dir.path())
        .args(["--port", "/dev/uvflash-none", "restore", "small.bin"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("8192"));
}

#[test]
fn flash_is_refused_for_tk11() {
    let dir = tempdir().unwrap();
    fs::write(dir.path().join("raw.bin"), raw_image(0x2400, "1.0")).unwrap();
    cli_cmd(dir.path())
        .args(["--radio", "tk11", "--port", "/dev/uvflash-none", "flash", "raw.bin"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not supported"));
}

#[test]
fn missing_port_fails_without_stdout() {
    let dir = tempdir().unwrap();
    cli_cmd(dir.path())
        .args(["--port", "/dev/uvflash-none", "--non-interactive", "backup", "b.bin"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("/dev/uvflash-none"));
    assert!(!dir.path().join("b.bin").exists());
}
