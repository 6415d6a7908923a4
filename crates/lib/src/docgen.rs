use std::fs::OpenOptions;
use std::io::BufWriter;

use anyhow::{Context, Result};
use camino::Utf8Path;
use clap::{Command, CommandFactory};
use fn_error_context::context;

use crate::cli::Opt;

/// Write `uefi-manager.8` plus one page per visible subcommand to `directory`.
#[context("Generating man pages")]
pub(crate) fn generate_manpages(directory: &Utf8Path) -> Result<()> {
    let cmd = Opt::command();
    generate_one(directory, cmd.clone(), "uefi-manager")?;
    for sub in cmd.get_subcommands().filter(|c| !c.is_hide_set()) {
        let name = format!("uefi-manager-{}", sub.get_name());
        generate_one(directory, sub.clone(), &name)?;
    }
    Ok(())
}

fn generate_one(directory: &Utf8Path, cmd: Command, name: &str) -> Result<()> {
    let path = directory.join(format!("{name}.8"));
    println!("Generating {path}...");
    let mut out = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&path)
        .map(BufWriter::new)
        .with_context(|| format!("Failed to open {path}"))?;
    clap_mangen::Man::new(cmd)
        .section("8")
        .render(&mut out)
        .with_context(|| format!("Failed to render {path}"))?;
    Ok(())
}
