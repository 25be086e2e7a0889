//! Finding out which image is installed in each slot.

use std::collections::BTreeMap;
use std::future::Future;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std::{self, fs::Dir};
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::Serialize;

use crate::activator::{Mounter, SystemMounter};
use crate::consts::EMPTY_SLOT;
use crate::descriptor::{SlotDescriptor, SlotTable};

/// What the enumerator found in one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    /// Human readable image name, or [`EMPTY_SLOT`]
    pub imagename: String,
    /// The slot's descriptor filename
    pub startupfile: String,
}

impl ImageInfo {
    /// Whether nothing bootable was found in the slot.
    pub fn is_empty(&self) -> bool {
        self.imagename == EMPTY_SLOT
    }
}

/// Source of the installed image list.
pub trait ImageEnumerator {
    /// Report the image found in each slot of `slots`. Slots may be left out
    /// of the result; they are treated as empty.
    fn enumerate(
        &self,
        slots: &SlotTable,
    ) -> impl Future<Output = Result<BTreeMap<u32, ImageInfo>>> + Send;
}

/// Enumerates images by mounting each slot's root filesystem read-only and
/// reading its release information.
#[derive(Debug, Default)]
pub struct ProbeEnumerator<M = SystemMounter> {
    mounter: M,
}

/// A slot root mounted on a temporary directory. Dropping it while still
/// mounted (a cancelled enumeration) detaches the mount.
struct ProbeMount<'m, M: Mounter> {
    mounter: &'m M,
    target: Utf8PathBuf,
    mounted: bool,
    _td: tempfile::TempDir,
}

impl<M: Mounter> Drop for ProbeMount<'_, M> {
    fn drop(&mut self) {
        if self.mounted {
            if let Err(e) = self.mounter.detach(&self.target) {
                tracing::warn!("{e:#}");
            }
        }
    }
}

impl<M: Mounter + Sync> ProbeEnumerator<M> {
    /// Probe slot roots through `mounter`.
    pub fn new(mounter: M) -> Self {
        Self { mounter }
    }

    #[context("Probing slot {}", desc.slot)]
    async fn probe(&self, desc: &SlotDescriptor) -> Result<String> {
        if !Utf8Path::new(&desc.device).try_exists()? {
            tracing::debug!("Slot {}: {} does not exist", desc.slot, desc.device);
            return Ok(EMPTY_SLOT.to_owned());
        }
        let td = tempfile::Builder::new().prefix("bootslot-probe").tempdir()?;
        // Armed before mounting: a mount killed midway may still have landed.
        let mut guard = ProbeMount {
            mounter: &self.mounter,
            target: Utf8PathBuf::try_from(td.path().to_path_buf())?,
            mounted: true,
            _td: td,
        };
        if let Err(e) = self
            .mounter
            .mount(&desc.device, &guard.target, Some("ro"))
            .await
        {
            guard.mounted = false;
            return Err(e);
        }
        let target = &guard.target;
        let name = Dir::open_ambient_dir(target, cap_std::ambient_authority())
            .with_context(|| format!("Opening {target}"))
            .and_then(|root| {
                let root = match desc.rootsubdir.as_deref() {
                    Some(sub) => root.open_dir(sub).with_context(|| format!("Opening {sub}"))?,
                    None => root,
                };
                image_name(&root)
            });
        match self.mounter.unmount(&guard.target).await {
            Ok(()) => guard.mounted = false,
            Err(e) => tracing::warn!("{e:#}"),
        }
        Ok(name?.unwrap_or_else(|| EMPTY_SLOT.to_owned()))
    }
}

impl<M: Mounter + Sync> ImageEnumerator for ProbeEnumerator<M> {
    async fn enumerate(&self, slots: &SlotTable) -> Result<BTreeMap<u32, ImageInfo>> {
        let mut r = BTreeMap::new();
        for desc in slots.values() {
            let imagename = match self.probe(desc).await {
                Ok(name) => name,
                Err(e) => {
                    tracing::warn!("{e:#}");
                    EMPTY_SLOT.to_owned()
                }
            };
            tracing::debug!("Slot {}: {imagename}", desc.slot);
            r.insert(
                desc.slot,
                ImageInfo {
                    imagename,
                    startupfile: desc.startupfile.clone(),
                },
            );
        }
        Ok(r)
    }
}

/// Value of `key` in an os-release style file.
fn os_release_value<'a>(contents: &'a str, key: &str) -> Option<&'a str> {
    contents.lines().find_map(|line| {
        let (k, v) = line.trim().split_once('=')?;
        if k != key {
            return None;
        }
        let v = v.trim();
        let v = v
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| v.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(v);
        Some(v).filter(|v| !v.is_empty())
    })
}

/// The display name of the image rooted at `root`, if any.
///
/// Prefers `PRETTY_NAME` from `etc/os-release` (or `NAME` plus
/// `VERSION_ID`), then the first line of `etc/issue` with the getty escape
/// sequences removed.
pub(crate) fn image_name(root: &Dir) -> Result<Option<String>> {
    for path in ["etc/os-release", "usr/lib/os-release"] {
        let Some(contents) = root.read_to_string_optional(path)? else {
            continue;
        };
        if let Some(pretty) = os_release_value(&contents, "PRETTY_NAME") {
            return Ok(Some(pretty.to_owned()));
        }
        if let Some(name) = os_release_value(&contents, "NAME") {
            let r = match os_release_value(&contents, "VERSION_ID") {
                Some(v) => format!("{name} {v}"),
                None => name.to_owned(),
            };
            return Ok(Some(r));
        }
    }
    if let Some(issue) = root.read_to_string_optional("etc/issue")? {
        let first = issue.lines().next().unwrap_or_default();
        let name = first.replace("\\n", "").replace("\\l", "");
        let name = name.trim();
        if !name.is_empty() {
            return Ok(Some(name.to_owned()));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use cap_std_ext::cap_tempfile;
    use indoc::indoc;

    use super::*;

    #[test]
    fn test_os_release_value() {
        let s = indoc! { r#"
            NAME="OpenPLi"
            VERSION_ID='9.0'
            EMPTY=
            ID=openpli
        "# };
        assert_eq!(os_release_value(s, "NAME"), Some("OpenPLi"));
        assert_eq!(os_release_value(s, "VERSION_ID"), Some("9.0"));
        assert_eq!(os_release_value(s, "ID"), Some("openpli"));
        assert_eq!(os_release_value(s, "EMPTY"), None);
        assert_eq!(os_release_value(s, "MISSING"), None);
    }

    #[test]
    fn test_image_name() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        assert_eq!(image_name(&td)?, None);

        td.create_dir("etc")?;
        td.write("etc/issue", "OpenATV 7.4 \\n \\l\n\n")?;
        assert_eq!(image_name(&td)?.as_deref(), Some("OpenATV 7.4"));

        td.write("etc/os-release", "NAME=\"OpenPLi\"\nVERSION_ID=9.0\n")?;
        assert_eq!(image_name(&td)?.as_deref(), Some("OpenPLi 9.0"));

        td.write(
            "etc/os-release",
            "NAME=\"OpenPLi\"\nPRETTY_NAME=\"OpenPLi 9.0 (2024-05-01)\"\n",
        )?;
        assert_eq!(
            image_name(&td)?.as_deref(),
            Some("OpenPLi 9.0 (2024-05-01)")
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_device_is_empty() -> Result<()> {
        let slots: SlotTable = [(
            1,
            SlotDescriptor {
                slot: 1,
                startupfile: "STARTUP_1".into(),
                device: "/dev/this-does-not-exist-42".into(),
                rootsubdir: None,
            },
        )]
        .into_iter()
        .collect();
        let images = ProbeEnumerator::<SystemMounter>::default()
            .enumerate(&slots)
            .await?;
        assert_eq!(images.len(), 1);
        assert!(images[&1].is_empty());
        assert_eq!(images[&1].startupfile, "STARTUP_1");
        Ok(())
    }

    /// Records calls; `unmount` never completes when `hang` is set.
    #[derive(Debug, Default)]
    struct RecordingMounter {
        hang: bool,
        fail: bool,
        mounted: std::sync::Mutex<Vec<Utf8PathBuf>>,
        unmounted: std::sync::Mutex<Vec<Utf8PathBuf>>,
        detached: std::sync::Mutex<Vec<Utf8PathBuf>>,
    }

    impl Mounter for RecordingMounter {
        fn is_mounted(&self, _dir: &Utf8Path) -> Result<bool> {
            Ok(false)
        }

        async fn mount(&self, _device: &str, dir: &Utf8Path, options: Option<&str>) -> Result<()> {
            assert_eq!(options, Some("ro"));
            anyhow::ensure!(!self.fail, "mount: unknown filesystem type");
            self.mounted.lock().unwrap().push(dir.to_owned());
            Ok(())
        }

        async fn unmount(&self, dir: &Utf8Path) -> Result<()> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            self.unmounted.lock().unwrap().push(dir.to_owned());
            Ok(())
        }

        fn detach(&self, dir: &Utf8Path) -> Result<()> {
            self.detached.lock().unwrap().push(dir.to_owned());
            Ok(())
        }
    }

    fn one_slot(device: &Utf8Path) -> SlotTable {
        [(
            1,
            SlotDescriptor {
                slot: 1,
                startupfile: "STARTUP_1".into(),
                device: device.to_string(),
                rootsubdir: None,
            },
        )]
        .into_iter()
        .collect()
    }

    #[tokio::test]
    async fn test_probe_unmounts() -> Result<()> {
        let dev = tempfile::NamedTempFile::new()?;
        let slots = one_slot(Utf8Path::from_path(dev.path()).unwrap());
        let e = ProbeEnumerator::new(RecordingMounter::default());
        let images = e.enumerate(&slots).await?;
        // Nothing readable in the fake root
        assert!(images[&1].is_empty());
        let mounted = e.mounter.mounted.lock().unwrap().clone();
        assert_eq!(mounted.len(), 1);
        assert_eq!(*e.mounter.unmounted.lock().unwrap(), mounted);
        assert!(e.mounter.detached.lock().unwrap().is_empty());
        assert!(!mounted[0].exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_probe_mount_failure() -> Result<()> {
        let dev = tempfile::NamedTempFile::new()?;
        let slots = one_slot(Utf8Path::from_path(dev.path()).unwrap());
        let e = ProbeEnumerator::new(RecordingMounter {
            fail: true,
            ..Default::default()
        });
        let images = e.enumerate(&slots).await?;
        assert!(images[&1].is_empty());
        assert!(e.mounter.unmounted.lock().unwrap().is_empty());
        assert!(e.mounter.detached.lock().unwrap().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancelled_probe_detaches() -> Result<()> {
        let dev = tempfile::NamedTempFile::new()?;
        let slots = one_slot(Utf8Path::from_path(dev.path()).unwrap());
        let e = ProbeEnumerator::new(RecordingMounter {
            hang: true,
            ..Default::default()
        });
        // Drop the enumeration while it waits for the unmount.
        tokio::select! {
            biased;
            _ = e.enumerate(&slots) => panic!("unmount completed"),
            _ = tokio::task::yield_now() => {}
        }
        let mounted = e.mounter.mounted.lock().unwrap().clone();
        assert_eq!(mounted.len(), 1);
        assert!(e.mounter.unmounted.lock().unwrap().is_empty());
        assert_eq!(*e.mounter.detached.lock().unwrap(), mounted);
        Ok(())
    }
}
