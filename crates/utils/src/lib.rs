//! The inevitable catchall "utils" crate. Generally only add
//! things here that only depend on the standard library and
//! "core" crates.
//!
mod command;
pub use command::*;
mod quote;
pub use quote::*;
mod tracing_util;
pub use tracing_util::*;
/// Re-execute the current process, possibly with elevated privileges
pub mod reexec;
