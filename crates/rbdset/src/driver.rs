//! Graph-driver adapter
//!
//! Maps a container engine's layer-driver calls onto [`RbdSet`]. Each layer
//! is mounted at `<home>/mnt/<id>`; the engine works inside its `rootfs`
//! subdirectory, and an `id` file next to it names the layer for manual
//! recovery.

use std::collections::BTreeMap;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

use crate::error::{RbdError, RbdResult};
use crate::set::{MOUNT_DIR, RbdSet};

/// Driver name registered with the engine
pub const DRIVER_NAME: &str = "rbd";

const ROOTFS_DIR: &str = "rootfs";
const ID_FILE: &str = "id";

fn make_dir(path: &Path) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(0o755).create(path)
}

/// Layer driver backed by an [`RbdSet`]
pub struct RbdDriver {
    home: PathBuf,
    set: RbdSet,
}

impl RbdDriver {
    /// Create the home directory and open (initializing if needed) the
    /// device set inside it.
    pub fn init<S: AsRef<str>>(home: impl AsRef<Path>, options: &[S]) -> RbdResult<Self> {
        let home = home.as_ref().to_path_buf();
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&home)
            .map_err(|e| RbdError::io("create home", home.display(), e))?;
        let set = RbdSet::new(&home, true, options)?;
        Ok(Self::with_set(set))
    }

    /// Wrap an already opened device set.
    pub fn with_set(set: RbdSet) -> Self {
        Self {
            home: set.home().to_path_buf(),
            set,
        }
    }

    /// Driver name
    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    /// Underlying device set
    pub fn set(&self) -> &RbdSet {
        &self.set
    }

    fn mount_point(&self, id: &str) -> PathBuf {
        self.home.join(MOUNT_DIR).join(id)
    }

    /// Create layer `id` on top of `parent` (empty for a base layer).
    pub fn create(&self, id: &str, parent: &str) -> RbdResult<()> {
        self.set.add_device(id, Some(parent))
    }

    /// Remove layer `id` and its mount point. Unknown ids are ignored.
    pub fn remove(&self, id: &str) -> RbdResult<()> {
        if !self.set.has_device(id) {
            return Ok(());
        }
        self.set.delete_device(id)?;

        let mount_point = self.mount_point(id);
        match fs::remove_dir_all(&mount_point) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RbdError::io("remove mount point", mount_point.display(), e)),
        }
    }

    /// Mount layer `id` and return the root filesystem directory inside it.
    pub fn get(&self, id: &str, mount_label: &str) -> RbdResult<PathBuf> {
        if !self.set.has_device(id) {
            return Err(RbdError::NotFound(id.to_string()));
        }
        let mount_point = self.mount_point(id);
        make_dir(&mount_point).map_err(|e| RbdError::io("create mount point", mount_point.display(), e))?;

        self.set.mount_device(id, &mount_point, mount_label)?;

        let rootfs = mount_point.join(ROOTFS_DIR);
        if let Err(e) = make_dir(&rootfs) {
            self.unmount_after_failure(id);
            return Err(RbdError::io("create rootfs", rootfs.display(), e));
        }

        let id_file = mount_point.join(ID_FILE);
        if !id_file.exists()
            && let Err(e) = write_id_file(&id_file, id)
        {
            self.unmount_after_failure(id);
            return Err(RbdError::io("write id file", id_file.display(), e));
        }

        Ok(rootfs)
    }

    fn unmount_after_failure(&self, id: &str) {
        if let Err(e) = self.set.unmount_device(id) {
            warn!("Failed to unmount {} after failed get: {}", id, e);
        }
    }

    /// Release a mount taken by [`Self::get`].
    pub fn put(&self, id: &str) -> RbdResult<()> {
        self.set.unmount_device(id).inspect_err(|e| {
            error!("Error unmounting device {}: {}", id, e);
        })
    }

    /// Check if layer `id` exists
    pub fn exists(&self, id: &str) -> bool {
        self.set.has_device(id)
    }

    /// Engine-facing metadata of layer `id`
    pub fn metadata(&self, id: &str) -> RbdResult<BTreeMap<String, String>> {
        let meta = self.set.export_device_metadata(id)?;
        Ok(BTreeMap::from([
            ("DeviceId".to_string(), meta.device_id.to_string()),
            ("DeviceSize".to_string(), meta.size_bytes.to_string()),
            ("DeviceName".to_string(), meta.name),
        ]))
    }

    /// Key/value status lines shown by the engine
    pub fn status(&self) -> Vec<(String, String)> {
        let status = self.set.status();
        vec![
            ("Backend".to_string(), status.backend.to_string()),
            ("Pool".to_string(), status.pool),
            ("Image Prefix".to_string(), status.image_prefix),
            ("Base Device Size".to_string(), status.base_size.to_string()),
            ("Backing Filesystem".to_string(), status.filesystem.to_string()),
            ("Pool Objects".to_string(), status.devices.to_string()),
            ("Mounted Devices".to_string(), status.mounted.to_string()),
        ]
    }

    /// Shut the device set down.
    pub fn cleanup(&self) -> RbdResult<()> {
        info!("Cleaning up {} driver at {:?}", DRIVER_NAME, self.home);
        self.set.shutdown()
    }
}

fn write_id_file(path: &Path, id: &str) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(id.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn driver(home: &Path) -> RbdDriver {
        RbdDriver::init(home, &["rbd.backend=memory", "rbd.basesize=16M"]).unwrap()
    }

    #[test]
    fn test_get_creates_rootfs_and_id_file() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        driver.create("base", "").unwrap();

        let rootfs = driver.get("base", "").unwrap();
        assert_eq!(rootfs, dir.path().join("mnt").join("base").join("rootfs"));
        assert!(rootfs.is_dir());
        let id = fs::read_to_string(dir.path().join("mnt/base/id")).unwrap();
        assert_eq!(id, "base");

        // A second get keeps the existing id file
        driver.put("base").unwrap();
        driver.get("base", "").unwrap();
        driver.put("base").unwrap();
    }

    #[test]
    fn test_rootfs_failure_unmounts() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        driver.create("base", "").unwrap();

        // A plain file where the rootfs directory should go
        let mount_point = dir.path().join("mnt").join("base");
        fs::create_dir_all(&mount_point).unwrap();
        fs::write(mount_point.join("rootfs"), b"").unwrap();

        let result = driver.get("base", "");
        assert!(matches!(result, Err(RbdError::Io { op: "create rootfs", .. })));
        assert_eq!(driver.set().status().mounted, 0);
    }

    #[test]
    fn test_metadata_and_status() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        driver.create("base", "").unwrap();
        driver.create("child", "base").unwrap();

        let meta = driver.metadata("child").unwrap();
        assert_eq!(meta["DeviceId"], "2");
        assert_eq!(meta["DeviceSize"], (16 * 1024 * 1024).to_string());
        assert_eq!(meta["DeviceName"], "layer_child");

        let status: BTreeMap<_, _> = driver.status().into_iter().collect();
        assert_eq!(status["Backend"], "memory");
        assert_eq!(status["Pool Objects"], "2");
        assert_eq!(driver.name(), "rbd");
    }

    #[test]
    fn test_remove_unknown_and_mount_point() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        driver.remove("ghost").unwrap();

        driver.create("base", "").unwrap();
        driver.get("base", "").unwrap();
        driver.remove("base").unwrap();
        assert!(!driver.exists("base"));
        assert!(!dir.path().join("mnt").join("base").exists());
    }

    #[test]
    fn test_dot_ids_never_touch_home() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        let db = dir.path().join("metadata").join("devices.redb");

        for id in [".", ".."] {
            assert!(matches!(driver.create(id, ""), Err(RbdError::InvalidId(_))));
            assert!(matches!(driver.get(id, ""), Err(RbdError::NotFound(_))));
            driver.remove(id).unwrap();
        }
        assert!(db.exists());
        assert!(dir.path().join("mnt").is_dir());
    }

    #[test]
    fn test_cleanup_closes_set() {
        let dir = tempdir().unwrap();
        let driver = driver(dir.path());
        driver.create("base", "").unwrap();
        driver.get("base", "").unwrap();

        driver.cleanup().unwrap();
        assert!(matches!(driver.create("other", ""), Err(RbdError::Closed)));
    }
}
