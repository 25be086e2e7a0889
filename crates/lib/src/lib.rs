//! # Boot slot selection for multiboot set-top boxes
//!
//! Boxes of this kind keep several firmware images in numbered slots.
//! The bootloader reads a small `STARTUP` file from the boot partition
//! (and on some boxes a flag byte from a raw device) to decide which one
//! to start. This crate lists the installed images and records the
//! user's choice, then reboots.

pub mod activator;
pub mod booted;
pub mod cli;
pub mod config;
mod consts;
pub mod descriptor;
pub mod enumerate;
mod kernel_cmdline;
pub mod menu;
pub mod reboot;
pub mod strategy;

pub use activator::{Activation, BootSlotActivator, Phase, SelectionError, SystemActivator};
pub use config::Capabilities;
pub use menu::MenuEntry;
