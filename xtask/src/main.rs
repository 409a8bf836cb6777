use std::{fs, path::PathBuf, process::Command};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Regenerate the vmlinux type bindings used by the eBPF crate from the
    /// running kernel's BTF.
    Codegen,
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Codegen => codegen(),
    }
}

fn codegen() -> Result<()> {
    let tool = which::which("aya-tool")
        .context("aya-tool not found; install it with `cargo install aya-tool`")?;

    let output = Command::new(tool)
        .args(["generate", "linux_binprm", "task_struct"])
        .output()
        .context("failed to run aya-tool")?;
    if !output.status.success() {
        bail!(
            "aya-tool failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let out = PathBuf::from("execguard-ebpf").join("src").join("vmlinux.rs");
    fs::write(&out, &output.stdout)
        .with_context(|| format!("failed to write {}", out.display()))?;
    println!("wrote {}", out.display());

    Ok(())
}
