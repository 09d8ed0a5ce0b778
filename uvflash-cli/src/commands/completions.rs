//! Shell completion generation and installation.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::CommandFactory;
use clap_complete::{Shell, generate};
use console::style;
use directories::BaseDirs;

use crate::Cli;

const BIN_NAME: &str = "uvflash";

fn script(shell: Shell, out: &mut dyn io::Write) {
    generate(shell, &mut Cli::command(), BIN_NAME, out);
}

/// Generate shell completions to stdout.
pub(crate) fn cmd_completions(shell: Shell) {
    script(shell, &mut io::stdout());
}

/// Current shell from `$SHELL`, or PowerShell on Windows.
fn detect_shell_type() -> Option<Shell> {
    if let Ok(shell_path) = env::var("SHELL") {
        return shell_from_path(&shell_path);
    }
    if cfg!(windows) && env::var("PSModulePath").is_ok() {
        return Some(Shell::PowerShell);
    }
    None
}

fn shell_from_path(shell_path: &str) -> Option<Shell> {
    let name = Path::new(shell_path).file_name()?.to_str()?;
    match name.trim_end_matches(".exe") {
        "bash" => Some(Shell::Bash),
        "zsh" => Some(Shell::Zsh),
        "fish" => Some(Shell::Fish),
        "elvish" => Some(Shell::Elvish),
        "pwsh" | "powershell" => Some(Shell::PowerShell),
        _ => None,
    }
}

/// Where `shell` looks for a completion script, given the user's base dirs.
fn install_path(shell: Shell, home: &Path, data: &Path, config: &Path) -> Result<PathBuf> {
    let path = match shell {
        Shell::Bash => data.join("bash-completion/completions").join(BIN_NAME),
        Shell::Zsh => home.join(".zfunc").join(format!("_{BIN_NAME}")),
        Shell::Fish => config.join("fish/completions").join(format!("{BIN_NAME}.fish")),
        Shell::PowerShell => config
            .join("powershell/completions")
            .join(format!("{BIN_NAME}.ps1")),
        Shell::Elvish => config.join("elvish/lib").join(format!("{BIN_NAME}.elv")),
        _ => anyhow::bail!("Unsupported shell for auto-install"),
    };
    Ok(path)
}

fn activation_hint(shell: Shell, path: &Path) -> String {
    match shell {
        Shell::Bash => format!(
            "Loaded on new terminals; to activate now run: source {}",
            path.display()
        ),
        Shell::Zsh => {
            "Add `fpath=(~/.zfunc $fpath)` before `compinit` in ~/.zshrc, then restart zsh"
                .to_string()
        },
        Shell::PowerShell => format!("Add `. {}` to your PowerShell profile", path.display()),
        _ => "Loaded automatically by new shell sessions".to_string(),
    }
}

/// Write the completion script where the shell will find it.
pub(crate) fn cmd_completions_install(shell_arg: Option<Shell>) -> Result<()> {
    let shell = match shell_arg {
        Some(shell) => shell,
        None => detect_shell_type().context(
            "Could not detect your shell. Please specify it explicitly:\n  \
             uvflash completions --install bash",
        )?,
    };

    let dirs = BaseDirs::new().context("Could not determine home directory")?;
    let path = install_path(shell, dirs.home_dir(), dirs.data_dir(), dirs.config_dir())?;

    let mut buf = Vec::new();
    script(shell, &mut buf);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    fs::write(&path, &buf)
        .with_context(|| format!("Failed to write completion file: {}", path.display()))?;

    eprintln!(
        "{} Installed {} completions to {}",
        style("✓").green().bold(),
        style(shell).cyan(),
        style(path.display()).yellow()
    );
    eprintln!("{}", activation_hint(shell, &path));
    Ok(())
}
