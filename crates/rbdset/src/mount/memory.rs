//! Bookkeeping-only mounter
//!
//! Records mounts in memory instead of touching the host mount table. Mount
//! targets must still exist as directories, matching `mount(2)`.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::Mounter;
use crate::config::Filesystem;

#[derive(Debug, Clone)]
struct MountEntry {
    device: PathBuf,
    data: String,
}

/// In-memory mount table
#[derive(Debug, Default)]
pub struct MemoryMounter {
    mounts: Mutex<HashMap<PathBuf, MountEntry>>,
    formatted: Mutex<Vec<PathBuf>>,
    fail_next_mount: Mutex<bool>,
    fail_next_unmount: Mutex<bool>,
}

impl MemoryMounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Targets currently mounted
    pub fn active_mounts(&self) -> Vec<PathBuf> {
        let mut targets: Vec<PathBuf> = self.mounts.lock().keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Mount data used for `target`
    pub fn mount_data(&self, target: &Path) -> Option<String> {
        self.mounts.lock().get(target).map(|m| m.data.clone())
    }

    /// Device mounted at `target`
    pub fn mounted_device(&self, target: &Path) -> Option<PathBuf> {
        self.mounts.lock().get(target).map(|m| m.device.clone())
    }

    /// Number of filesystems built so far
    pub fn format_count(&self) -> usize {
        self.formatted.lock().len()
    }

    /// Drop every mount, as an out-of-band `umount -a` would
    pub fn unmount_all(&self) {
        self.mounts.lock().clear();
    }

    /// Make the next mount call fail
    pub fn fail_next_mount(&self) {
        *self.fail_next_mount.lock() = true;
    }

    /// Make the next unmount call fail
    pub fn fail_next_unmount(&self) {
        *self.fail_next_unmount.lock() = true;
    }
}

impl Mounter for MemoryMounter {
    fn make_filesystem(&self, device: &Path, _fs: Filesystem, _args: &[String]) -> io::Result<()> {
        self.formatted.lock().push(device.to_path_buf());
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path, _fs: Filesystem, data: &str) -> io::Result<()> {
        if std::mem::take(&mut *self.fail_next_mount.lock()) {
            return Err(io::Error::other("injected mount failure"));
        }
        if !target.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("mount point {target:?} does not exist"),
            ));
        }
        let mut mounts = self.mounts.lock();
        if mounts.contains_key(target) {
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                format!("{target:?} is already mounted"),
            ));
        }
        mounts.insert(
            target.to_path_buf(),
            MountEntry {
                device: device.to_path_buf(),
                data: data.to_string(),
            },
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        if std::mem::take(&mut *self.fail_next_unmount.lock()) {
            return Err(io::Error::other("injected unmount failure"));
        }
        self.mounts.lock().remove(target);
        Ok(())
    }

    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        Ok(self.mounts.lock().contains_key(target))
    }
}
