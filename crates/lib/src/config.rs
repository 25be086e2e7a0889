//! Box capabilities, loaded from a TOML file.
//!
//! These are the facts about the hardware that decide how a selection is
//! recorded: which partition holds the boot data, whether the box can boot
//! an image in two modes, and whether the bootloader reads a raw flag byte.

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;
use serde::{Deserialize, Serialize};

use crate::consts::{
    DEFAULT_BOOTARGS, DEFAULT_FLAG_DEVICE, DEFAULT_MOUNT_DIR, MODE_12, MODE_DEFAULT,
};

/// The pair of kernel argument strings swapped when a plain descriptor is
/// rewritten for mode 12.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Mode12Tokens {
    /// Text present in the mode 1 descriptor
    pub from: String,
    /// Replacement used for mode 12
    pub to: String,
}

/// Capability flags and device paths for this box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Capabilities {
    /// Block device holding the `STARTUP*` files
    pub boot_device: String,
    /// Where the boot device is mounted while selecting
    #[serde(default = "default_mount_dir")]
    pub mount_dir: Utf8PathBuf,
    /// Whether the bootloader also reads the slot number from a raw flag device
    #[serde(default)]
    pub dual_boot: bool,
    /// The raw flag device
    #[serde(default = "default_flag_device")]
    pub flag_device: Utf8PathBuf,
    /// Where the running kernel's boot arguments can be read
    #[serde(default = "default_bootargs")]
    pub bootargs: Utf8PathBuf,
    /// Command executed to reboot the box
    #[serde(default = "default_restart_command")]
    pub restart_command: Vec<String>,
    /// Present if the box supports booting each image in mode 1 or mode 12
    #[serde(default)]
    pub mode12: Option<Mode12Tokens>,
}

fn default_mount_dir() -> Utf8PathBuf {
    DEFAULT_MOUNT_DIR.into()
}

fn default_flag_device() -> Utf8PathBuf {
    DEFAULT_FLAG_DEVICE.into()
}

fn default_bootargs() -> Utf8PathBuf {
    DEFAULT_BOOTARGS.into()
}

fn default_restart_command() -> Vec<String> {
    vec!["reboot".into()]
}

impl Capabilities {
    /// Parse and validate capabilities from TOML text.
    pub fn parse(s: &str) -> Result<Self> {
        let r: Self = toml::from_str(s)?;
        r.validate()?;
        Ok(r)
    }

    /// Load capabilities from a file.
    #[context("Loading {path}")]
    pub fn load(path: &Utf8Path) -> Result<Self> {
        let s = std::fs::read_to_string(path).with_context(|| format!("Reading {path}"))?;
        Self::parse(&s)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.boot_device.is_empty(), "boot-device must not be empty");
        anyhow::ensure!(
            !self.restart_command.is_empty(),
            "restart-command must not be empty"
        );
        if let Some(tokens) = self.mode12.as_ref() {
            // An empty pattern would match between every character.
            anyhow::ensure!(!tokens.from.is_empty(), "mode12.from must not be empty");
        }
        Ok(())
    }

    /// Whether each image can be booted in mode 1 and mode 12.
    pub fn supports_mode12(&self) -> bool {
        self.mode12.is_some()
    }

    /// The boot modes offered for every non-empty slot.
    pub fn modes(&self) -> &'static [u32] {
        if self.supports_mode12() {
            &[MODE_DEFAULT, MODE_12]
        } else {
            &[MODE_DEFAULT]
        }
    }
}
