use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::Result;

/// Environment variable holding a reference to our original binary
pub const ORIG: &str = "_UEFIMGR_ORIG_EXE";

/// Return the path to our own executable. If we were started through a
/// wrapper that copied or relocated the binary, this environment variable
/// will hold the path to the original one.
pub fn executable_path() -> Result<PathBuf> {
    if let Some(p) = std::env::var_os(ORIG) {
        Ok(p.into())
    } else {
        std::env::current_exe().map_err(Into::into)
    }
}

/// The argument vector that would re-run the current invocation: our own
/// executable followed by the original arguments. Privilege escalation
/// helpers such as `pkexec` take this as their command line.
pub fn self_argv() -> Result<Vec<OsString>> {
    let mut argv = vec![executable_path()?.into_os_string()];
    argv.extend(std::env::args_os().skip(1));
    tracing::debug!("Re-invocation argv: {argv:?}");
    Ok(argv)
}
