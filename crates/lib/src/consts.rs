/// Where the boot-data partition is mounted while the selector is open
pub(crate) const DEFAULT_MOUNT_DIR: &str = "/tmp/startupmount";
/// The activation record read by the bootloader, relative to the boot partition
pub(crate) const STARTUP: &str = "STARTUP";
/// Prefix shared by all per-slot descriptor files on the boot partition
pub(crate) const STARTUP_PREFIX: &str = "STARTUP_";
/// Marker in descriptor filenames that carry one file per boot mode
pub(crate) const BOXMODE_MARKER: &str = "BOXMODE";

/// Raw partition holding the slot number on dual-boot flag devices
pub(crate) const DEFAULT_FLAG_DEVICE: &str = "/dev/block/by-name/flag";
/// Kernel command line as passed by the bootloader
pub(crate) const DEFAULT_BOOTARGS: &str = "/sys/firmware/devicetree/base/chosen/bootargs";
/// Default configuration file
pub(crate) const DEFAULT_CONFIG: &str = "/etc/bootslot.toml";

/// Image name reported for a slot with nothing bootable in it
pub const EMPTY_SLOT: &str = "Empty slot";

/// The default boot mode; every slot supports it
pub const MODE_DEFAULT: u32 = 1;
/// The alternate boot mode on boxes with dual-mode support
pub const MODE_12: u32 = 12;

/// Text of the rewrite applied to plain descriptors when booting in mode 12
pub(crate) const BOXMODE_1_ARG: &str = "boxmode=1'";
pub(crate) const BOXMODE_12_ARG: &str = "boxmode=12'";
