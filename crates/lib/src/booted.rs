//! Which slot and mode the running system was booted from.

use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;
use serde::Serialize;

use crate::consts::MODE_12;
use crate::descriptor::SlotTable;
use crate::kernel_cmdline::Cmdline;

/// The slot and mode of the running image, as far as the boot arguments tell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CurrentBoot {
    /// The slot the running image was booted from
    pub slot: Option<u32>,
    /// The `boxmode=` the running image was booted with
    pub mode: Option<u32>,
}

impl CurrentBoot {
    /// Read the boot arguments from `path` and match them against `slots`.
    ///
    /// Unreadable boot arguments are not fatal; nothing is marked current.
    #[context("Determining current image")]
    pub fn detect(path: &Utf8Path, slots: &SlotTable) -> Result<Self> {
        match Cmdline::from_path(path) {
            Ok(cmdline) => Ok(Self::from_cmdline(&cmdline, slots)),
            Err(e) => {
                tracing::warn!("Cannot determine current image: {e:#}");
                Ok(Self::default())
            }
        }
    }

    fn from_cmdline(cmdline: &Cmdline, slots: &SlotTable) -> Self {
        let slot = match cmdline.value_of("rootsubdir") {
            Some(subdir) => trailing_number(subdir),
            None => cmdline.value_of("root").and_then(|root| {
                slots
                    .values()
                    .find(|desc| desc.device == root)
                    .map(|desc| desc.slot)
            }),
        };
        // The key is often namespaced by the platform, e.g. `h7_4.boxmode=12`.
        let mode = cmdline
            .iter()
            .filter(|p| p.key == "boxmode" || p.key.ends_with(".boxmode"))
            .filter_map(|p| p.value?.parse().ok())
            .last();
        Self { slot, mode }
    }

    /// Whether the running image uses mode 12; anything else counts as mode 1.
    pub fn is_mode12(&self) -> bool {
        self.mode == Some(MODE_12)
    }
}

fn trailing_number(s: &str) -> Option<u32> {
    let digits = s.len() - s.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    s[s.len() - digits..].parse().ok()
}
