#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use rbdset::set::MOUNT_DIR;
use rbdset::{BackendKind, MemoryCluster, MemoryMounter, RbdConfig, RbdResult, RbdSet};
use tempfile::TempDir;

pub const MIB: u64 = 1024 * 1024;

/// A home directory plus a cluster and mount table that outlive any one
/// `RbdSet`, so tests can reopen the set as a restarted process would.
pub struct Harness {
    _dir: TempDir,
    pub home: PathBuf,
    pub cluster: Arc<MemoryCluster>,
    pub mounter: Arc<MemoryMounter>,
    pub config: RbdConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut RbdConfig)) -> Self {
        let mut config = RbdConfig {
            backend: BackendKind::Memory,
            base_size: 64 * MIB,
            reconcile_attempts: 2,
            ..RbdConfig::default()
        };
        adjust(&mut config);
        let dir = tempfile::tempdir().unwrap();
        Self {
            home: dir.path().join("rbd"),
            _dir: dir,
            cluster: MemoryCluster::new(),
            mounter: Arc::new(MemoryMounter::new()),
            config,
        }
    }

    pub fn open(&self) -> RbdResult<RbdSet> {
        self.open_with(self.mounter.clone())
    }

    /// Open with a different mount table, as after a host reboot
    pub fn open_with(&self, mounter: Arc<MemoryMounter>) -> RbdResult<RbdSet> {
        RbdSet::with_parts(
            &self.home,
            true,
            self.config.clone(),
            Arc::new(self.cluster.connect(&self.config.pool)),
            mounter,
        )
    }

    pub fn target(&self, id: &str) -> PathBuf {
        self.home.join(MOUNT_DIR).join(id)
    }

    pub fn images(&self) -> Vec<String> {
        self.cluster.images(&self.config.pool)
    }
}
