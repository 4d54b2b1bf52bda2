//! Device data model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Backing block-storage object of a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    /// Storage pool
    pub pool: String,
    /// Image name inside the pool
    pub image: String,
}

impl BlockRef {
    pub fn new(pool: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            image: image.into(),
        }
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pool, self.image)
    }
}

/// Persisted transaction state of a device record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Backing object is being allocated
    Creating,
    /// Device is usable
    Ready,
    /// Backing object is being released
    Deleting,
}

impl From<i32> for DeviceState {
    fn from(value: i32) -> Self {
        match value {
            1 => DeviceState::Creating,
            3 => DeviceState::Deleting,
            _ => DeviceState::Ready,
        }
    }
}

impl From<DeviceState> for i32 {
    fn from(state: DeviceState) -> i32 {
        match state {
            DeviceState::Creating => 1,
            DeviceState::Ready => 2,
            DeviceState::Deleting => 3,
        }
    }
}

/// A layer backed by a block device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// Caller-supplied layer id
    pub id: String,
    /// Parent layer, `None` for a base layer
    pub parent_id: Option<String>,
    /// Backing image
    pub block_ref: BlockRef,
    /// Capacity in bytes
    pub size_bytes: u64,
    /// Stable small integer used for naming and export
    pub numeric_id: u32,
    /// Mount point while mounted
    pub mount_path: Option<PathBuf>,
    /// Active mount holders
    pub mount_count: u32,
    /// Local block device while attached
    pub device_path: Option<PathBuf>,
    /// Whether a filesystem has been built on the backing image
    pub formatted: bool,
    /// Filesystem state captured by the frozen snapshot, set on first clone
    pub frozen_formatted: Option<bool>,
    /// Transaction state
    pub state: DeviceState,
    /// Creation timestamp (unix seconds)
    pub created_at: u64,
}

impl Device {
    /// Create a new device record in the `Creating` state
    pub fn new(id: String, parent_id: Option<String>, block_ref: BlockRef, size_bytes: u64) -> Self {
        Self {
            id,
            parent_id,
            block_ref,
            size_bytes,
            numeric_id: 0,
            mount_path: None,
            mount_count: 0,
            device_path: None,
            formatted: false,
            frozen_formatted: None,
            state: DeviceState::Creating,
            created_at: chrono::Utc::now().timestamp().max(0) as u64,
        }
    }

    /// Check if the device is currently mounted
    pub fn is_mounted(&self) -> bool {
        self.mount_path.is_some()
    }

    /// Forget mount and attach state
    pub fn clear_mount(&mut self) {
        self.mount_path = None;
        self.mount_count = 0;
        self.device_path = None;
    }

    /// Exported view of the device
    pub fn metadata(&self) -> DeviceMetadata {
        DeviceMetadata {
            device_id: self.numeric_id,
            size_bytes: self.size_bytes,
            name: self.block_ref.image.clone(),
        }
    }
}

/// Device information handed back to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceMetadata {
    /// Numeric id
    pub device_id: u32,
    /// Capacity in bytes
    pub size_bytes: u64,
    /// Backing image name
    pub name: String,
}
