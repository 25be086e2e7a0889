//! Discovery of the per-slot `STARTUP_*` descriptor files on the boot partition.
//!
//! A descriptor is a one-line bootloader script such as
//!
//! ```text
//! boot emmcflash0.kernel2 'root=/dev/mmcblk0p5 rootsubdir=linuxrootfs2 kernel=/dev/mmcblk0p4 rw rootwait h7_4.boxmode=1'
//! ```
//!
//! Boxes that boot in two modes carry one file per mode, named like
//! `STARTUP_LINUX_2_BOXMODE_12`.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use cap_std_ext::cap_std::fs::Dir;
use fn_error_context::context;
use regex::Regex;
use serde::Serialize;

use crate::consts::{BOXMODE_MARKER, STARTUP_PREFIX};
use crate::kernel_cmdline::Cmdline;

/// What the boot partition says about one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotDescriptor {
    /// The slot number
    pub slot: u32,
    /// Filename of the descriptor, relative to the boot partition
    pub startupfile: String,
    /// Root device of the slot's image
    pub device: String,
    /// Subdirectory of `device` holding the image, for boxes that share one
    /// partition between several slots
    pub rootsubdir: Option<String>,
}

/// Slot descriptors, keyed and ordered by slot number.
pub type SlotTable = BTreeMap<u32, SlotDescriptor>;

impl SlotDescriptor {
    /// Whether this slot has one descriptor file per boot mode.
    pub fn is_mode_templated(&self) -> bool {
        self.startupfile.contains(BOXMODE_MARKER)
    }

    /// The descriptor filename for `mode`, replacing the trailing `_<mode>`
    /// of a templated name.
    pub(crate) fn startupfile_for_mode(&self, mode: u32) -> String {
        let prefix = self
            .startupfile
            .rsplit_once('_')
            .map(|(prefix, _)| prefix)
            .unwrap_or(&self.startupfile);
        format!("{prefix}_{mode}")
    }
}

/// Extract the slot number from a descriptor filename.
fn slot_of_filename(name: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^STARTUP_(?:[A-Za-z]+_)*(\d+)(?:_BOXMODE_\d+)?$").expect("valid regex")
    });
    re.captures(name)?.get(1)?.as_str().parse().ok()
}

/// Kernel arguments of a descriptor line: the single-quoted part of
/// `boot <kernel> '<args>'`, or the whole line if it is not quoted.
fn args_of_line(line: &str) -> &str {
    match (line.find('\''), line.rfind('\'')) {
        (Some(start), Some(end)) if start < end => &line[start + 1..end],
        _ => line,
    }
}

fn parse_descriptor(slot: u32, startupfile: &str, contents: &str) -> Option<SlotDescriptor> {
    contents.lines().find_map(|line| {
        let cmdline = Cmdline::from(args_of_line(line));
        let device = cmdline.value_of("root")?;
        Some(SlotDescriptor {
            slot,
            startupfile: startupfile.to_owned(),
            device: device.to_owned(),
            rootsubdir: cmdline.value_of("rootsubdir").map(ToOwned::to_owned),
        })
    })
}

/// Scan the mounted boot partition for slot descriptors.
///
/// Files are visited in name order and the first descriptor seen for a slot
/// wins, so for templated boxes `..._BOXMODE_1` is the one recorded.
/// Descriptors without a `root=` argument are ignored.
#[context("Scanning for slot descriptors")]
pub fn discover_slots(bootdir: &Dir) -> Result<SlotTable> {
    let mut names = Vec::new();
    for ent in bootdir.entries()? {
        let ent = ent?;
        let Ok(name) = ent.file_name().into_string() else {
            continue;
        };
        if name.starts_with(STARTUP_PREFIX) && ent.file_type()?.is_file() {
            names.push(name);
        }
    }
    names.sort();

    let mut slots = SlotTable::new();
    for name in names {
        let Some(slot) = slot_of_filename(&name) else {
            tracing::trace!("Ignoring {name}");
            continue;
        };
        if slots.contains_key(&slot) {
            continue;
        }
        let contents = bootdir
            .read_to_string(&name)
            .with_context(|| format!("Reading {name}"))?;
        match parse_descriptor(slot, &name, &contents) {
            Some(desc) => {
                tracing::debug!("Found slot {slot} in {name}: {}", desc.device);
                slots.insert(slot, desc);
            }
            None => tracing::debug!("No root= in {name}"),
        }
    }
    Ok(slots)
}
