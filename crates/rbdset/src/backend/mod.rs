//! Block-storage backend abstraction
//!
//! The layer store only needs a small set of image operations from the
//! cluster: create, snapshot, clone, remove and map to a local device.
//!
//! # Backends
//!
//! - `rbd`: Ceph RBD through the `rbd` command-line tool
//! - `memory`: in-process cluster for development and tests

pub mod memory;
pub mod rbd;

use std::path::{Path, PathBuf};

use crate::error::RbdResult;

pub use memory::{MemoryBackend, MemoryCluster};
pub use rbd::RbdCliBackend;

/// Connection to a block-storage pool.
///
/// Image names are relative to the pool the backend was connected to.
pub trait BlockBackend: Send + Sync {
    /// Backend name for identification
    fn name(&self) -> &'static str;

    /// Names of all images in the pool
    fn list_images(&self) -> RbdResult<Vec<String>>;

    /// Check if an image exists
    fn image_exists(&self, image: &str) -> RbdResult<bool>;

    /// Provisioned size of an image in bytes
    fn image_size(&self, image: &str) -> RbdResult<u64>;

    /// Create an empty image
    fn create_image(&self, image: &str, size_bytes: u64) -> RbdResult<()>;

    /// Check if a snapshot exists
    fn snapshot_exists(&self, image: &str, snapshot: &str) -> RbdResult<bool>;

    /// Check if a snapshot is protected; fails if it does not exist
    fn snapshot_protected(&self, image: &str, snapshot: &str) -> RbdResult<bool>;

    /// Take a point-in-time snapshot
    fn create_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()>;

    /// Protect a snapshot so it can be cloned and cannot be removed.
    /// Fails if it is already protected.
    fn protect_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()>;

    /// Lift snapshot protection; fails while clones exist or if it is not
    /// protected
    fn unprotect_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()>;

    /// Remove an unprotected snapshot
    fn remove_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()>;

    /// Create `child` as a copy-on-write clone of `image@snapshot`
    fn clone_image(&self, image: &str, snapshot: &str, child: &str) -> RbdResult<()>;

    /// Images cloned from `image@snapshot`
    fn children(&self, image: &str, snapshot: &str) -> RbdResult<Vec<String>>;

    /// Remove an image; fails while it has snapshots
    fn remove_image(&self, image: &str) -> RbdResult<()>;

    /// Map an image to a local block device
    fn map(&self, image: &str) -> RbdResult<PathBuf>;

    /// Unmap a local block device
    fn unmap(&self, device: &Path) -> RbdResult<()>;

    /// Release the connection. Called exactly once.
    fn close(&self) -> RbdResult<()>;
}
