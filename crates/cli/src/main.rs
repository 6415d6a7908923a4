//! The main entrypoint for uefi-manager, the firmware boot entry manager.

use std::io::Write as _;

use owo_colors::OwoColorize;

fn run() -> anyhow::Result<()> {
    tracing::trace!("starting {}", env!("CARGO_PKG_NAME"));
    uefimgr_lib::cli::run_from_iter(std::env::args_os())
}

fn main() {
    uefimgr_utils::initialize_tracing();
    if let Err(e) = run() {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
