//! How a selection is recorded for the bootloader.
//!
//! Which of the strategies applies depends only on the box and on the
//! descriptor of the chosen slot; it is decided once per activation by
//! [`ActivationStrategy::select`].

use std::io::Write;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;

use crate::activator::SelectionError;
use crate::config::{Capabilities, Mode12Tokens};
use crate::consts::{BOXMODE_12_ARG, BOXMODE_1_ARG, MODE_12, STARTUP};
use crate::descriptor::SlotDescriptor;

/// The way the activation record is produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivationStrategy {
    /// One descriptor file per mode exists; copy the one for the chosen mode.
    ModeTemplate,
    /// A single descriptor exists; for mode 12 its arguments are rewritten.
    ModeRewrite {
        /// The memory layout arguments swapped for mode 12
        tokens: Mode12Tokens,
    },
    /// Copy the descriptor unchanged; on dual-boot flag boxes also record
    /// the slot number on the flag device.
    DirectCopy {
        /// The raw flag device, if the box uses one
        flag_device: Option<Utf8PathBuf>,
    },
}

/// A single byte destined for the raw flag device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagWrite {
    /// The device to write to
    pub device: Utf8PathBuf,
    /// The slot number
    pub value: u8,
}

/// Everything an activation writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationRecord {
    /// New contents of `STARTUP`
    pub startup: Vec<u8>,
    /// Flag byte, for the dual-boot flag convention
    pub flag: Option<FlagWrite>,
}

impl ActivationStrategy {
    /// Choose the strategy for activating `desc` on this box.
    pub fn select(caps: &Capabilities, desc: &SlotDescriptor) -> Self {
        match caps.mode12.as_ref() {
            Some(_) if desc.is_mode_templated() => Self::ModeTemplate,
            Some(tokens) => Self::ModeRewrite {
                tokens: tokens.clone(),
            },
            None => Self::DirectCopy {
                flag_device: caps.dual_boot.then(|| caps.flag_device.clone()),
            },
        }
    }

    /// Compute the record for booting `desc` in `mode`, reading descriptors
    /// from the mounted boot partition.
    #[context("Preparing activation of slot {} mode {mode}", desc.slot)]
    pub fn plan(&self, bootdir: &Dir, desc: &SlotDescriptor, mode: u32) -> Result<ActivationRecord> {
        let r = match self {
            Self::ModeTemplate => {
                let name = desc.startupfile_for_mode(mode);
                let startup = bootdir.read(&name).with_context(|| format!("Reading {name}"))?;
                ActivationRecord {
                    startup,
                    flag: None,
                }
            }
            Self::ModeRewrite { tokens } => {
                let name = &desc.startupfile;
                let text = bootdir
                    .read_to_string(name)
                    .with_context(|| format!("Reading {name}"))?;
                let text = if mode == MODE_12 {
                    rewrite_for_mode12(&text, tokens)
                } else {
                    text
                };
                ActivationRecord {
                    startup: text.into_bytes(),
                    flag: None,
                }
            }
            Self::DirectCopy { flag_device } => {
                let name = &desc.startupfile;
                let startup = bootdir.read(name).with_context(|| format!("Reading {name}"))?;
                let flag = flag_device
                    .as_ref()
                    .map(|device| -> Result<_> {
                        let value = u8::try_from(desc.slot)
                            .map_err(|_| SelectionError::FlagOutOfRange(desc.slot))?;
                        Ok(FlagWrite {
                            device: device.clone(),
                            value,
                        })
                    })
                    .transpose()?;
                ActivationRecord { startup, flag }
            }
        };
        Ok(r)
    }
}

fn rewrite_for_mode12(text: &str, tokens: &Mode12Tokens) -> String {
    text.replace(BOXMODE_1_ARG, BOXMODE_12_ARG)
        .replace(&tokens.from, &tokens.to)
}

impl ActivationRecord {
    /// Write `STARTUP` to the boot partition, then the flag byte if any.
    #[context("Writing activation record")]
    pub fn write(&self, bootdir: &Dir) -> Result<()> {
        bootdir
            .atomic_write(STARTUP, &self.startup)
            .with_context(|| format!("Writing {STARTUP}"))?;
        tracing::debug!("Wrote {} bytes to {STARTUP}", self.startup.len());
        if let Some(flag) = self.flag.as_ref() {
            flag.write()?;
        }
        Ok(())
    }
}

impl FlagWrite {
    /// The device must already exist; it is never created.
    #[context("Writing boot flag to {}", self.device)]
    fn write(&self) -> Result<()> {
        let mut f = std::fs::OpenOptions::new().write(true).open(&self.device)?;
        f.write_all(&[self.value])?;
        f.sync_all()?;
        tracing::debug!("Wrote flag {} to {}", self.value, self.device);
        Ok(())
    }
}
