//! # UEFI boot entry manager
//!
//! This crate reads and edits the firmware's `Boot####` table through
//! efivarfs, correlates entries with the partitions they point at, and
//! migrates frugal installs to direct-boot (EFI stub) entries.

pub mod cli;
pub mod config;
pub mod device_path;
pub mod efivars;
mod errors;
pub mod frugal;
pub mod load_option;
pub mod migrate;
mod parsers;
pub mod registry;
pub mod resolver;
pub mod services;
pub mod stub;

#[cfg(feature = "docgen")]
mod docgen;

pub use errors::{Error, Result};
