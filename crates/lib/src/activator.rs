//! The selection session: mount the boot partition, list the installed
//! images, record the chosen one and reboot into it.
//!
//! A session moves through [`Phase`]s:
//!
//! ```text
//! Idle → Mounting → Enumerating → Presenting → Activating → Rebooting
//!                                            ↘ Cancelling → Closed
//! ```
//!
//! Mounting and enumerating can be preempted at any point through the
//! session's [`CancellationToken`]; the in-flight stage is dropped (killing
//! any child process) and the session is closed without writing anything.

use std::collections::BTreeMap;
use std::future::Future;

use anyhow::{Context, Result};
use camino::Utf8Path;
use cap_std_ext::cap_std::{self, fs::Dir};
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::booted::CurrentBoot;
use crate::config::Capabilities;
use crate::descriptor::{discover_slots, SlotTable};
use crate::enumerate::{ImageEnumerator, ImageInfo, ProbeEnumerator};
use crate::menu::{self, ImageSlot, MenuEntry};
use crate::reboot::{CommandRestarter, RestartKind, Restarter};
use crate::strategy::ActivationStrategy;

/// Reasons a (slot, mode) pair cannot be activated.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    /// The slot was not part of the last enumeration
    #[error("Slot {0} was not found")]
    UnknownSlot(u32),
    /// Nothing bootable is installed in the slot
    #[error("Slot {0} is empty")]
    EmptySlot(u32),
    /// The box cannot boot images in this mode
    #[error("Mode {0} is not supported on this box")]
    UnsupportedMode(u32),
    /// The flag device holds a single byte
    #[error("Slot {0} cannot be recorded on the boot flag device")]
    FlagOutOfRange(u32),
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Created, nothing done yet
    Idle,
    /// Waiting for the boot partition to be mounted
    Mounting,
    /// Waiting for the image list
    Enumerating,
    /// The menu is available for selection
    Presenting,
    /// Writing the activation record
    Activating,
    /// A restart was requested
    Rebooting,
    /// Tearing down the mount
    Cancelling,
    /// Finished without activating anything
    Closed,
}

/// The result of [`BootSlotActivator::activate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// The entry does not activate anything; nothing was written
    Ignored,
    /// The session was cancelled before activation; nothing was written
    Cancelled,
    /// The record was written and a reboot requested
    Rebooting {
        /// The activated slot
        slot: u32,
        /// The activated mode
        mode: u32,
    },
}

/// Access to the boot partition mount.
pub trait Mounter {
    /// Whether something is mounted on `dir`.
    fn is_mounted(&self, dir: &Utf8Path) -> Result<bool>;
    /// Mount `device` on `dir`, optionally with `-o options`.
    fn mount(
        &self,
        device: &str,
        dir: &Utf8Path,
        options: Option<&str>,
    ) -> impl Future<Output = Result<()>> + Send;
    /// Unmount `dir`.
    fn unmount(&self, dir: &Utf8Path) -> impl Future<Output = Result<()>> + Send;
    /// Lazily detach `dir` without awaiting; used when an unmount cannot
    /// be awaited any more.
    fn detach(&self, dir: &Utf8Path) -> Result<()>;
}

/// Mounts using the system `mount` and `umount` commands.
#[derive(Debug, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn is_mounted(&self, dir: &Utf8Path) -> Result<bool> {
        bootslot_mount::is_mountpoint(dir)
    }

    async fn mount(&self, device: &str, dir: &Utf8Path, options: Option<&str>) -> Result<()> {
        bootslot_mount::mount(device, dir, options).await
    }

    async fn unmount(&self, dir: &Utf8Path) -> Result<()> {
        bootslot_mount::unmount(dir).await
    }

    fn detach(&self, dir: &Utf8Path) -> Result<()> {
        bootslot_mount::detach(dir)
    }
}

/// What one enumeration pass found.
#[derive(Debug, Default)]
struct Snapshot {
    table: SlotTable,
    images: BTreeMap<u32, ImageInfo>,
    current: CurrentBoot,
}

/// One interactive selection session.
#[derive(Debug)]
pub struct BootSlotActivator<M, E, R> {
    caps: Capabilities,
    mounter: M,
    enumerator: E,
    restarter: R,
    phase: Phase,
    cancel: CancellationToken,
    snapshot: Snapshot,
    menu: Vec<MenuEntry>,
}

/// A session using the real mount, enumeration and reboot implementations.
pub type SystemActivator = BootSlotActivator<SystemMounter, ProbeEnumerator, CommandRestarter>;

impl SystemActivator {
    /// Create a session for this box.
    pub fn system(caps: Capabilities) -> Self {
        let restarter = CommandRestarter::new(caps.restart_command.clone());
        Self::new(caps, SystemMounter, ProbeEnumerator::default(), restarter)
    }
}

#[context("Mounting boot partition")]
async fn ensure_mounted<M: Mounter>(caps: &Capabilities, mounter: &M) -> Result<()> {
    let dir = caps.mount_dir.as_path();
    if mounter.is_mounted(dir)? {
        tracing::debug!("{dir} is already mounted");
        return Ok(());
    }
    if !dir.try_exists()? {
        std::fs::create_dir_all(dir).with_context(|| format!("Creating {dir}"))?;
    }
    mounter.mount(&caps.boot_device, dir, None).await
}

fn open_bootdir(caps: &Capabilities) -> Result<Dir> {
    let dir = caps.mount_dir.as_path();
    Dir::open_ambient_dir(dir, cap_std::ambient_authority()).with_context(|| format!("Opening {dir}"))
}

/// Mount, scan and enumerate. Failures along the way are logged and end up
/// as an empty snapshot, which is presented as "No images found".
async fn load<M: Mounter, E: ImageEnumerator>(
    caps: &Capabilities,
    mounter: &M,
    enumerator: &E,
    phase: &mut Phase,
) -> Snapshot {
    *phase = Phase::Mounting;
    if let Err(e) = ensure_mounted(caps, mounter).await {
        tracing::warn!("{e:#}");
        return Snapshot::default();
    }

    *phase = Phase::Enumerating;
    let table = match open_bootdir(caps).and_then(|d| discover_slots(&d)) {
        Ok(table) => table,
        Err(e) => {
            tracing::warn!("{e:#}");
            return Snapshot::default();
        }
    };
    let images = match enumerator.enumerate(&table).await {
        Ok(images) => images,
        Err(e) => {
            tracing::warn!("Enumerating images: {e:#}");
            BTreeMap::new()
        }
    };
    let current = CurrentBoot::detect(&caps.bootargs, &table).unwrap_or_default();
    tracing::debug!("Current image: {current:?}");
    Snapshot {
        table,
        images,
        current,
    }
}

impl<M: Mounter, E: ImageEnumerator, R: Restarter> BootSlotActivator<M, E, R> {
    /// Create an idle session.
    pub fn new(caps: Capabilities, mounter: M, enumerator: E, restarter: R) -> Self {
        Self {
            caps,
            mounter,
            enumerator,
            restarter,
            phase: Phase::Idle,
            cancel: CancellationToken::new(),
            snapshot: Snapshot::default(),
            menu: menu::waiting(),
        }
    }

    /// The current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The capabilities this session was created with.
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// The list as it should be displayed right now.
    pub fn entries(&self) -> &[MenuEntry] {
        &self.menu
    }

    /// The slot and mode of the running system, once enumerated.
    pub fn current(&self) -> CurrentBoot {
        self.snapshot.current
    }

    /// A token that, when cancelled, preempts mounting and enumeration.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Mount the boot partition and enumerate the installed images.
    ///
    /// Returns the menu, or `None` if the session was cancelled meanwhile
    /// (in which case it is already closed).
    pub async fn open(&mut self) -> Result<Option<&[MenuEntry]>> {
        anyhow::ensure!(
            self.phase == Phase::Idle,
            "Cannot open a session in phase {:?}",
            self.phase
        );
        let token = self.cancel.clone();
        let loaded = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            snapshot = load(&self.caps, &self.mounter, &self.enumerator, &mut self.phase) => Some(snapshot),
        };
        let Some(snapshot) = loaded else {
            tracing::info!("Cancelled while {:?}", self.phase);
            self.close().await;
            return Ok(None);
        };

        let slots = ImageSlot::collect(&snapshot.images, self.caps.modes(), &snapshot.current);
        self.menu = menu::build(&slots, &snapshot.current);
        self.snapshot = snapshot;
        self.phase = Phase::Presenting;
        Ok(Some(self.menu.as_slice()))
    }

    /// Find the menu entry for `slot` booted in `mode`.
    pub fn entry_for(&self, slot: u32, mode: u32) -> Result<&MenuEntry, SelectionError> {
        self.validate(slot, mode)?;
        self.menu
            .iter()
            .find(|e| e.selection() == Some((slot, mode)))
            .ok_or(SelectionError::UnknownSlot(slot))
    }

    fn validate(&self, slot: u32, mode: u32) -> Result<(), SelectionError> {
        if !self.snapshot.table.contains_key(&slot) {
            return Err(SelectionError::UnknownSlot(slot));
        }
        match self.snapshot.images.get(&slot) {
            Some(info) if !info.is_empty() => {}
            _ => return Err(SelectionError::EmptySlot(slot)),
        }
        if !self.caps.modes().contains(&mode) {
            return Err(SelectionError::UnsupportedMode(mode));
        }
        Ok(())
    }

    /// Record `entry` as the next boot target and request a reboot.
    ///
    /// Placeholder and separator rows are ignored without touching the disk.
    /// If writing or restarting fails the session goes back to
    /// [`Phase::Presenting`], so it can still be cancelled.
    pub async fn activate(&mut self, entry: &MenuEntry) -> Result<Activation> {
        let Some((slot, mode)) = entry.selection() else {
            tracing::debug!("Ignoring activation of {entry:?}");
            return Ok(Activation::Ignored);
        };
        if self.cancel.is_cancelled() {
            self.close().await;
            return Ok(Activation::Cancelled);
        }
        anyhow::ensure!(
            self.phase == Phase::Presenting,
            "Cannot activate in phase {:?}",
            self.phase
        );
        self.validate(slot, mode)?;

        // On failure nothing reboots, so the session stays closeable.
        self.phase = Phase::Activating;
        if let Err(e) = self.write_record(slot, mode) {
            self.phase = Phase::Presenting;
            return Err(e);
        }
        self.phase = Phase::Rebooting;
        if let Err(e) = self.restarter.restart(RestartKind::Reboot).await {
            self.phase = Phase::Presenting;
            return Err(e);
        }
        Ok(Activation::Rebooting { slot, mode })
    }

    fn write_record(&self, slot: u32, mode: u32) -> Result<()> {
        let desc = &self.snapshot.table[&slot];
        let strategy = ActivationStrategy::select(&self.caps, desc);
        tracing::info!("Activating slot {slot} mode {mode} via {strategy:?}");
        let bootdir = open_bootdir(&self.caps)?;
        let record = strategy.plan(&bootdir, desc, mode)?;
        record.write(&bootdir)?;
        rustix::fs::sync();
        Ok(())
    }

    /// Leave without activating anything.
    pub async fn cancel(&mut self) -> Result<()> {
        self.cancel.cancel();
        match self.phase {
            Phase::Closed => Ok(()),
            Phase::Activating | Phase::Rebooting => {
                anyhow::bail!("Cannot cancel in phase {:?}", self.phase)
            }
            _ => {
                self.close().await;
                Ok(())
            }
        }
    }

    /// Unmount (best-effort) and remove the mount directory once nothing is
    /// mounted on it.
    async fn close(&mut self) {
        self.phase = Phase::Cancelling;
        let dir = self.caps.mount_dir.as_path();
        match self.mounter.is_mounted(dir) {
            Ok(true) => {
                if let Err(e) = self.mounter.unmount(dir).await {
                    tracing::warn!("{e:#}");
                }
            }
            Ok(false) => {}
            Err(e) => tracing::warn!("{e:#}"),
        }
        match self.mounter.is_mounted(dir) {
            Ok(false) => {
                if let Err(e) = std::fs::remove_dir(dir) {
                    tracing::debug!("Not removing {dir}: {e}");
                }
            }
            _ => tracing::debug!("{dir} is still mounted"),
        }
        self.menu.clear();
        self.phase = Phase::Closed;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use camino::Utf8PathBuf;

    use crate::consts::{EMPTY_SLOT, STARTUP};
    use crate::menu::Placeholder;

    use super::*;

    const TOKENS: &str = r#"
[mode12]
from = "brcm_cma=440M@328M"
to = "brcm_cma=520M@248M"
"#;

    /// Pretends to mount by populating the mount directory.
    #[derive(Debug, Default)]
    struct FakeMounter {
        mounted: AtomicBool,
        fail: bool,
        hang: bool,
        files: Vec<(String, String)>,
        unmounts: AtomicUsize,
    }

    impl Mounter for FakeMounter {
        fn is_mounted(&self, _dir: &Utf8Path) -> Result<bool> {
            Ok(self.mounted.load(Ordering::SeqCst))
        }

        async fn mount(&self, _device: &str, dir: &Utf8Path, _options: Option<&str>) -> Result<()> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            anyhow::ensure!(!self.fail, "mount: wrong fs type");
            for (name, contents) in &self.files {
                std::fs::write(dir.join(name), contents)?;
            }
            self.mounted.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn unmount(&self, dir: &Utf8Path) -> Result<()> {
            self.unmounts.fetch_add(1, Ordering::SeqCst);
            for (name, _) in &self.files {
                let _ = std::fs::remove_file(dir.join(name));
            }
            let _ = std::fs::remove_file(dir.join(STARTUP));
            self.mounted.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn detach(&self, _dir: &Utf8Path) -> Result<()> {
            self.mounted.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Names every discovered slot from a fixed list.
    #[derive(Debug, Default)]
    struct FakeEnumerator {
        names: BTreeMap<u32, &'static str>,
        hang: bool,
    }

    impl ImageEnumerator for FakeEnumerator {
        async fn enumerate(&self, slots: &SlotTable) -> Result<BTreeMap<u32, ImageInfo>> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(slots
                .values()
                .map(|d| {
                    let imagename = self.names.get(&d.slot).copied().unwrap_or(EMPTY_SLOT);
                    (
                        d.slot,
                        ImageInfo {
                            imagename: imagename.into(),
                            startupfile: d.startupfile.clone(),
                        },
                    )
                })
                .collect())
        }
    }

    #[derive(Debug, Default, Clone)]
    struct FakeRestarter(Arc<Mutex<Vec<RestartKind>>>);

    impl Restarter for FakeRestarter {
        async fn restart(&self, kind: RestartKind) -> Result<()> {
            self.0.lock().unwrap().push(kind);
            Ok(())
        }
    }

    struct Fixture {
        _td: tempfile::TempDir,
        mount_dir: Utf8PathBuf,
        flag: Utf8PathBuf,
        restarts: FakeRestarter,
        activator: BootSlotActivator<FakeMounter, FakeEnumerator, FakeRestarter>,
    }

    impl Fixture {
        fn new(extra_caps: &str, mounter: FakeMounter, enumerator: FakeEnumerator) -> Self {
            let td = tempfile::tempdir().unwrap();
            let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
            let mount_dir = root.join("startupmount");
            let flag = root.join("flag");
            std::fs::write(&flag, [0u8]).unwrap();
            std::fs::write(
                root.join("bootargs"),
                "root=/dev/mmcblk0p5 rootsubdir=linuxrootfs2 rw h7_4.boxmode=12\0",
            )
            .unwrap();
            let caps = Capabilities::parse(&format!(
                "boot-device = \"/dev/mmcblk0p1\"\nmount-dir = \"{mount_dir}\"\nflag-device = \"{flag}\"\nbootargs = \"{}\"\n{extra_caps}",
                root.join("bootargs")
            ))
            .unwrap();
            let restarts = FakeRestarter::default();
            let activator = BootSlotActivator::new(caps, mounter, enumerator, restarts.clone());
            Self {
                _td: td,
                mount_dir,
                flag,
                restarts,
                activator,
            }
        }

        fn startup(&self) -> Option<String> {
            std::fs::read_to_string(self.mount_dir.join(STARTUP)).ok()
        }

        fn restarts(&self) -> usize {
            self.restarts.0.lock().unwrap().len()
        }

        fn flag_byte(&self) -> u8 {
            std::fs::read(&self.flag).unwrap()[0]
        }
    }

    fn plain_files() -> Vec<(String, String)> {
        (1..=3)
            .map(|slot| {
                (
                    format!("STARTUP_{slot}"),
                    format!("boot emmcflash0.kernel{slot} 'root=/dev/mmcblk0p{} rootsubdir=linuxrootfs{slot} brcm_cma=440M@328M boxmode=1'\n", slot + 2),
                )
            })
            .collect()
    }

    fn templated_files() -> Vec<(String, String)> {
        let mut r = Vec::new();
        for slot in 1..=2 {
            for mode in [1, 12] {
                r.push((
                    format!("STARTUP_LINUX_{slot}_BOXMODE_{mode}"),
                    format!("boot emmcflash0.linuxkernel{slot} 'root=/dev/mmcblk0p{} rw boxmode={mode}'\n", slot + 2),
                ));
            }
        }
        r
    }

    fn names(v: &[(u32, &'static str)]) -> FakeEnumerator {
        FakeEnumerator {
            names: v.iter().copied().collect(),
            hang: false,
        }
    }

    #[tokio::test]
    async fn test_templated_mode12() -> Result<()> {
        let mounter = FakeMounter {
            files: templated_files(),
            ..Default::default()
        };
        let mut f = Fixture::new(TOKENS, mounter, names(&[(1, "OpenATV 7.4"), (2, "OpenPLi 9.0")]));
        assert_eq!(f.activator.phase(), Phase::Idle);
        let menu = f.activator.open().await?.unwrap().to_vec();
        assert_eq!(f.activator.phase(), Phase::Presenting);
        assert_eq!(menu.len(), 5);
        assert_eq!(menu[2], MenuEntry::Separator);
        assert!(menu[4].to_string().ends_with("Mode 12  (current image)"));

        let entry = f.activator.entry_for(1, 12)?.clone();
        let r = f.activator.activate(&entry).await?;
        assert_eq!(r, Activation::Rebooting { slot: 1, mode: 12 });
        assert_eq!(f.activator.phase(), Phase::Rebooting);
        similar_asserts::assert_eq!(
            f.startup().unwrap(),
            "boot emmcflash0.linuxkernel1 'root=/dev/mmcblk0p3 rw boxmode=12'\n"
        );
        assert_eq!(f.restarts(), 1);
        assert_eq!(f.flag_byte(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_rewrite() -> Result<()> {
        for (mode, expected) in [
            (1, "boot emmcflash0.kernel3 'root=/dev/mmcblk0p5 rootsubdir=linuxrootfs3 brcm_cma=440M@328M boxmode=1'\n"),
            (12, "boot emmcflash0.kernel3 'root=/dev/mmcblk0p5 rootsubdir=linuxrootfs3 brcm_cma=520M@248M boxmode=12'\n"),
        ] {
            let mounter = FakeMounter {
                files: plain_files(),
                ..Default::default()
            };
            let mut f = Fixture::new(TOKENS, mounter, names(&[(1, "a"), (3, "c")]));
            let menu = f.activator.open().await?.unwrap().to_vec();
            // slot 2 is empty
            assert_eq!(menu.len(), 5);
            let entry = f.activator.entry_for(3, mode)?.clone();
            f.activator.activate(&entry).await?;
            similar_asserts::assert_eq!(f.startup().unwrap(), expected);
            assert_eq!(f.restarts(), 1);
            assert_eq!(f.flag_byte(), 0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_dual_boot_flag() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            ..Default::default()
        };
        let mut f = Fixture::new("dual-boot = true", mounter, names(&[(1, "a"), (2, "b"), (3, "c")]));
        let menu = f.activator.open().await?.unwrap().to_vec();
        assert_eq!(menu.len(), 3);
        assert!(menu.iter().all(|e| !matches!(e, MenuEntry::Separator)));
        // Booted from linuxrootfs2
        assert!(menu[1].to_string().ends_with("(current image)"));

        let entry = menu[2].clone();
        f.activator.activate(&entry).await?;
        assert_eq!(f.startup().unwrap(), plain_files()[2].1);
        assert_eq!(f.flag_byte(), 3);
        assert_eq!(f.restarts(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_plain_copy_leaves_flag() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            ..Default::default()
        };
        let mut f = Fixture::new("", mounter, names(&[(1, "a")]));
        f.activator.open().await?;
        let entry = f.activator.entry_for(1, 1)?.clone();
        f.activator.activate(&entry).await?;
        assert_eq!(f.startup().unwrap(), plain_files()[0].1);
        assert_eq!(f.flag_byte(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_images() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            ..Default::default()
        };
        let mut f = Fixture::new("dual-boot = true", mounter, names(&[]));
        let menu = f.activator.open().await?.unwrap().to_vec();
        assert_eq!(
            menu,
            [MenuEntry::Placeholder {
                reason: Placeholder::NoImages
            }]
        );
        assert_eq!(f.activator.activate(&menu[0]).await?, Activation::Ignored);
        assert!(f.startup().is_none());
        assert_eq!(f.flag_byte(), 0);
        assert_eq!(f.restarts(), 0);
        assert!(matches!(
            f.activator.entry_for(1, 1),
            Err(SelectionError::EmptySlot(1))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_mount_failure() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            fail: true,
            ..Default::default()
        };
        let mut f = Fixture::new("", mounter, names(&[(1, "a")]));
        let menu = f.activator.open().await?.unwrap().to_vec();
        assert_eq!(menu.len(), 1);
        assert_eq!(menu[0].to_string(), "No images found");
        assert!(f.mount_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_selection_errors() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            ..Default::default()
        };
        let mut f = Fixture::new("", mounter, names(&[(1, "a"), (3, "c")]));
        f.activator.open().await?;
        assert!(matches!(
            f.activator.entry_for(9, 1),
            Err(SelectionError::UnknownSlot(9))
        ));
        assert!(matches!(
            f.activator.entry_for(2, 1),
            Err(SelectionError::EmptySlot(2))
        ));
        assert!(matches!(
            f.activator.entry_for(3, 12),
            Err(SelectionError::UnsupportedMode(12))
        ));
        // Separators are never activated
        assert_eq!(
            f.activator.activate(&MenuEntry::Separator).await?,
            Activation::Ignored
        );
        // A hand-built entry is checked against the enumeration too
        let bogus = MenuEntry::Selectable {
            slot: 2,
            mode: 1,
            label: "Slot 2".into(),
            current: false,
        };
        assert!(f.activator.activate(&bogus).await.is_err());
        assert!(f.startup().is_none());
        assert_eq!(f.restarts(), 0);
        // Sessions are single-use
        assert!(f.activator.open().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_while_mounting() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            hang: true,
            ..Default::default()
        };
        let mut f = Fixture::new("dual-boot = true", mounter, names(&[(1, "a")]));
        let token = f.activator.cancellation_token();
        let (r, ()) = tokio::join!(f.activator.open(), async move {
            tokio::task::yield_now().await;
            token.cancel();
        });
        assert!(r?.is_none());
        assert_eq!(f.activator.phase(), Phase::Closed);
        assert!(f.activator.entries().is_empty());
        // Never mounted, so nothing to unmount; the empty directory is removed.
        assert_eq!(f.activator.mounter.unmounts.load(Ordering::SeqCst), 0);
        assert!(!f.mount_dir.exists());
        assert!(f.startup().is_none());
        assert_eq!(f.flag_byte(), 0);
        assert_eq!(f.restarts(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_while_enumerating() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            ..Default::default()
        };
        let enumerator = FakeEnumerator {
            hang: true,
            ..Default::default()
        };
        let mut f = Fixture::new("", mounter, enumerator);
        let token = f.activator.cancellation_token();
        let (r, ()) = tokio::join!(f.activator.open(), async move {
            for _ in 0..10 {
                tokio::task::yield_now().await;
            }
            token.cancel();
        });
        assert!(r?.is_none());
        assert_eq!(f.activator.phase(), Phase::Closed);
        assert_eq!(f.activator.mounter.unmounts.load(Ordering::SeqCst), 1);
        assert!(!f.mount_dir.exists());
        assert!(f.startup().is_none());
        assert_eq!(f.restarts(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_after_presenting() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            ..Default::default()
        };
        let mut f = Fixture::new("", mounter, names(&[(1, "a")]));
        f.activator.open().await?;
        let entry = f.activator.entry_for(1, 1)?.clone();
        f.activator.cancel().await?;
        assert_eq!(f.activator.phase(), Phase::Closed);
        assert_eq!(f.activator.mounter.unmounts.load(Ordering::SeqCst), 1);
        assert_eq!(f.activator.activate(&entry).await?, Activation::Cancelled);
        assert!(f.startup().is_none());
        assert_eq!(f.restarts(), 0);
        // Cancelling twice is harmless
        f.activator.cancel().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_already_mounted() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            mounted: AtomicBool::new(true),
            ..Default::default()
        };
        let mut f = Fixture::new("", mounter, names(&[(1, "a")]));
        // Already mounted: the mount command is not run, so the directory
        // is whatever was there before.
        std::fs::create_dir(&f.mount_dir)?;
        for (name, contents) in plain_files() {
            std::fs::write(f.mount_dir.join(name), contents)?;
        }
        let menu = f.activator.open().await?.unwrap().to_vec();
        assert_eq!(menu.len(), 1);
        assert_eq!(menu[0].selection(), Some((1, 1)));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_descriptor_fails() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            ..Default::default()
        };
        let mut f = Fixture::new("", mounter, names(&[(1, "a")]));
        f.activator.open().await?;
        let entry = f.activator.entry_for(1, 1)?.clone();
        std::fs::remove_file(f.mount_dir.join("STARTUP_1"))?;

        let e = f.activator.activate(&entry).await.unwrap_err();
        assert!(format!("{e:#}").contains("Reading STARTUP_1"), "{e:#}");
        assert!(f.startup().is_none());
        assert_eq!(f.restarts(), 0);
        assert_eq!(f.activator.phase(), Phase::Presenting);

        // The mount can still be released
        f.activator.cancel().await?;
        assert_eq!(f.activator.phase(), Phase::Closed);
        assert_eq!(f.activator.mounter.unmounts.load(Ordering::SeqCst), 1);
        assert!(!f.mount_dir.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_flag_device_fails() -> Result<()> {
        let mounter = FakeMounter {
            files: plain_files(),
            ..Default::default()
        };
        let mut f = Fixture::new("dual-boot = true", mounter, names(&[(1, "a"), (2, "b")]));
        f.activator.open().await?;
        let entry = f.activator.entry_for(2, 1)?.clone();
        std::fs::remove_file(&f.flag)?;

        let e = f.activator.activate(&entry).await.unwrap_err();
        assert!(format!("{e:#}").contains("Writing boot flag"), "{e:#}");
        // STARTUP goes first; the flag device is never created
        assert_eq!(f.startup().unwrap(), plain_files()[1].1);
        assert!(!f.flag.exists());
        assert_eq!(f.restarts(), 0);
        assert_eq!(f.activator.phase(), Phase::Presenting);

        f.activator.cancel().await?;
        assert_eq!(f.activator.phase(), Phase::Closed);
        assert_eq!(f.activator.mounter.unmounts.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
