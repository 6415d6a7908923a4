use std::ffi::OsStr;
use std::fmt::Display;
use std::os::unix::ffi::OsStrExt;

/// Format a command argument the way a POSIX shell would need it written.
///
/// Plain words (alphanumerics plus `/`, `.`, `-`, `_`, `=`) are emitted as-is; anything else
/// goes through [`shlex`]. Non-UTF-8 bytes are rendered lossily.
#[derive(Debug)]
pub struct QuotedArg<'a>(&'a OsStr);

impl<'a> QuotedArg<'a> {
    /// Wrap an argument for display.
    pub fn new<S: AsRef<OsStr> + ?Sized>(arg: &'a S) -> Self {
        Self(arg.as_ref())
    }
}

fn is_plain(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '-' | '_' | '='))
}

impl Display for QuotedArg<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(s) = self.0.to_str() {
            if is_plain(s) {
                return f.write_str(s);
            }
        }
        match shlex::bytes::try_quote(self.0.as_bytes()) {
            Ok(r) => f.write_str(&String::from_utf8_lossy(&r)),
            // Interior NUL; cannot be passed to a process anyway
            Err(_) => Err(std::fmt::Error),
        }
    }
}
