//! The list of choices presented to the user.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use serde::Serialize;

use crate::booted::CurrentBoot;
use crate::consts::{MODE_12, MODE_DEFAULT};
use crate::enumerate::ImageInfo;

const CURRENT_SUFFIX: &str = "  (current image)";

/// A snapshot of one slot as seen during enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSlot {
    /// The slot number
    pub id: u32,
    /// The image name
    pub name: String,
    /// Boot modes this slot can be activated with
    pub modes: BTreeSet<u32>,
    /// Whether the running system was booted from this slot
    pub is_current: bool,
    /// Whether nothing bootable is installed in the slot
    pub is_empty: bool,
}

impl ImageSlot {
    /// Combine the enumerator's answer with the box's supported modes.
    pub fn collect(
        images: &BTreeMap<u32, ImageInfo>,
        modes: &[u32],
        current: &CurrentBoot,
    ) -> Vec<Self> {
        images
            .iter()
            .map(|(&id, info)| Self {
                id,
                name: info.imagename.clone(),
                modes: modes.iter().copied().collect(),
                is_current: current.slot == Some(id),
                is_empty: info.is_empty(),
            })
            .collect()
    }
}

/// Why the list has nothing to choose from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Placeholder {
    /// Enumeration has not finished yet
    Waiting,
    /// Enumeration finished without finding a bootable image
    NoImages,
}

impl Display for Placeholder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Placeholder::Waiting => f.write_str("Retrieving image slots - Please wait..."),
            Placeholder::NoImages => f.write_str("No images found"),
        }
    }
}

/// One row of the selection list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MenuEntry {
    /// A non-actionable message row
    Placeholder {
        /// Which message
        reason: Placeholder,
    },
    /// A blank row between the mode 1 and mode 12 groups
    Separator,
    /// A (slot, mode) pair that can be activated
    Selectable {
        /// The slot number
        slot: u32,
        /// The boot mode
        mode: u32,
        /// The rendered label
        label: String,
        /// Whether this is the running slot and mode
        current: bool,
    },
}

impl MenuEntry {
    /// The (slot, mode) this row activates, if any.
    pub fn selection(&self) -> Option<(u32, u32)> {
        match self {
            MenuEntry::Selectable { slot, mode, .. } => Some((*slot, *mode)),
            MenuEntry::Placeholder { .. } | MenuEntry::Separator => None,
        }
    }
}

impl Display for MenuEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MenuEntry::Placeholder { reason } => reason.fmt(f),
            MenuEntry::Separator => f.write_str(" "),
            MenuEntry::Selectable { label, .. } => f.write_str(label),
        }
    }
}

/// The list shown while enumeration is still running.
pub fn waiting() -> Vec<MenuEntry> {
    vec![MenuEntry::Placeholder {
        reason: Placeholder::Waiting,
    }]
}

/// Build the selection list from an enumeration snapshot.
///
/// Empty slots are left out. On dual-mode boxes the mode 1 entries of all
/// slots come first, then a separator, then the mode 12 entries; each group
/// is in ascending slot order. If nothing is selectable the list is a single
/// [`Placeholder::NoImages`] row.
pub fn build(slots: &[ImageSlot], current: &CurrentBoot) -> Vec<MenuEntry> {
    let mut slots: Vec<_> = slots.iter().filter(|s| !s.is_empty).collect();
    slots.sort_by_key(|s| s.id);

    let dual = slots.iter().any(|s| s.modes.contains(&MODE_12));
    let entry = |slot: &ImageSlot, mode: u32| {
        let is_current = slot.is_current && (!dual || current.is_mode12() == (mode == MODE_12));
        let suffix = if is_current { CURRENT_SUFFIX } else { "" };
        let label = if dual {
            format!("Slot {}: {} - Mode {mode}{suffix}", slot.id, slot.name)
        } else {
            format!("Slot {}: {}{suffix}", slot.id, slot.name)
        };
        MenuEntry::Selectable {
            slot: slot.id,
            mode,
            label,
            current: is_current,
        }
    };

    let mut r: Vec<_> = slots
        .iter()
        .filter(|s| s.modes.contains(&MODE_DEFAULT))
        .map(|s| entry(s, MODE_DEFAULT))
        .collect();
    if dual {
        r.push(MenuEntry::Separator);
        r.extend(
            slots
                .iter()
                .filter(|s| s.modes.contains(&MODE_12))
                .map(|s| entry(s, MODE_12)),
        );
    }
    if r.is_empty() {
        r.push(MenuEntry::Placeholder {
            reason: Placeholder::NoImages,
        });
    }
    r
}
