//! Attaching and mounting layer devices
//!
//! [`MountManager`] pairs the backend's map/unmap with the host's
//! mount/unmount. The host side sits behind the [`Mounter`] trait:
//!
//! - [`HostMounter`]: real mounts via `mount(2)` and `mkfs`
//! - [`MemoryMounter`]: bookkeeping only, for development and tests

pub mod host;
pub mod memory;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::BlockBackend;
use crate::config::{Filesystem, RbdConfig};
use crate::device::Device;
use crate::error::{RbdError, RbdResult};

pub use host::HostMounter;
pub use memory::MemoryMounter;

/// Host filesystem-mount facility
pub trait Mounter: Send + Sync {
    /// Build a filesystem on a block device
    fn make_filesystem(&self, device: &Path, fs: Filesystem, args: &[String]) -> io::Result<()>;

    /// Mount `device` at `target`
    fn mount(&self, device: &Path, target: &Path, fs: Filesystem, data: &str) -> io::Result<()>;

    /// Unmount `target`; succeeds when nothing is mounted there
    fn unmount(&self, target: &Path) -> io::Result<()>;

    /// Check if something is mounted at `target`
    fn is_mounted(&self, target: &Path) -> io::Result<bool>;
}

/// Append an SELinux context for `label` to comma separated mount data.
pub fn format_mount_label(options: &str, label: &str) -> String {
    if label.is_empty() {
        return options.to_string();
    }
    let context = format!("context=\"{label}\"");
    if options.is_empty() {
        context
    } else {
        format!("{options},{context}")
    }
}

/// Attaches, formats and mounts layer devices
pub struct MountManager {
    backend: Arc<dyn BlockBackend>,
    mounter: Arc<dyn Mounter>,
    filesystem: Filesystem,
    mkfs_args: Vec<String>,
    mount_options: String,
}

impl MountManager {
    pub fn new(backend: Arc<dyn BlockBackend>, mounter: Arc<dyn Mounter>, config: &RbdConfig) -> Self {
        Self {
            backend,
            mounter,
            filesystem: config.filesystem,
            mkfs_args: config.mkfs_args.clone(),
            mount_options: config.mount_options.clone(),
        }
    }

    /// Map the device's image to a local block device.
    pub fn attach(&self, device: &Device) -> RbdResult<PathBuf> {
        let path = self.backend.map(&device.block_ref.image)?;
        debug!("Attached {} at {:?}", device.block_ref, path);
        Ok(path)
    }

    /// Build a filesystem on a freshly attached image.
    pub fn format(&self, device_path: &Path) -> RbdResult<()> {
        info!(
            "Creating {} filesystem on {:?}",
            self.filesystem.as_str(),
            device_path
        );
        self.mounter
            .make_filesystem(device_path, self.filesystem, &self.mkfs_args)
            .map_err(|e| RbdError::io("mkfs", device_path.display(), e))
    }

    /// Mount `device_path` at `target`, creating the mount point if needed.
    pub fn mount_at(&self, device_path: &Path, target: &Path, label: &str) -> RbdResult<()> {
        std::fs::create_dir_all(target)
            .map_err(|e| RbdError::io("create mount point", target.display(), e))?;

        let data = format_mount_label(&self.mount_options, label);
        self.mounter
            .mount(device_path, target, self.filesystem, &data)
            .map_err(|e| RbdError::io("mount", target.display(), e))?;
        debug!("Mounted {:?} at {:?}", device_path, target);
        Ok(())
    }

    /// Unmount `target`. Unmounting an unmounted target succeeds.
    pub fn unmount(&self, target: &Path) -> RbdResult<()> {
        self.mounter
            .unmount(target)
            .map_err(|e| RbdError::io("unmount", target.display(), e))?;
        debug!("Unmounted {:?}", target);
        Ok(())
    }

    /// Unmap a local block device.
    pub fn detach(&self, device_path: &Path) -> RbdResult<()> {
        self.backend.unmap(device_path)?;
        debug!("Detached {:?}", device_path);
        Ok(())
    }

    /// Check if something is mounted at `target`
    pub fn is_mounted(&self, target: &Path) -> RbdResult<bool> {
        self.mounter
            .is_mounted(target)
            .map_err(|e| RbdError::io("check mount", target.display(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryCluster;
    use crate::device::BlockRef;
    use tempfile::tempdir;

    #[test]
    fn test_format_mount_label() {
        assert_eq!(format_mount_label("", ""), "");
        assert_eq!(format_mount_label("noatime", ""), "noatime");
        assert_eq!(
            format_mount_label("", "system_u:object_r:svirt_sandbox_file_t:s0"),
            "context=\"system_u:object_r:svirt_sandbox_file_t:s0\""
        );
        assert_eq!(
            format_mount_label("noatime", "l"),
            "noatime,context=\"l\""
        );
    }

    #[test]
    fn test_attach_mount_unmount_detach() {
        let dir = tempdir().unwrap();
        let cluster = MemoryCluster::new();
        let backend = Arc::new(cluster.connect("rbd"));
        backend.create_image("layer_a", 1024).unwrap();
        let mounter = Arc::new(MemoryMounter::new());
        let manager = MountManager::new(backend, mounter.clone(), &RbdConfig::default());

        let device = Device::new("a".to_string(), None, BlockRef::new("rbd", "layer_a"), 1024);
        let target = dir.path().join("a");

        let dev_path = manager.attach(&device).unwrap();
        manager.format(&dev_path).unwrap();
        manager.mount_at(&dev_path, &target, "label").unwrap();
        assert!(manager.is_mounted(&target).unwrap());
        assert_eq!(mounter.format_count(), 1);
        assert_eq!(
            mounter.mount_data(&target).as_deref(),
            Some("context=\"label\"")
        );

        manager.unmount(&target).unwrap();
        // Second unmount is a no-op
        manager.unmount(&target).unwrap();
        manager.detach(&dev_path).unwrap();
        assert_eq!(cluster.mapped_count(), 0);
    }
}
