//! Parsers for bootloader configuration found on disk.

pub(crate) mod grub_menuconfig;
