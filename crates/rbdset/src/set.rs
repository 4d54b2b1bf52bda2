//! Device lifecycle controller
//!
//! [`RbdSet`] ties the registry, pool allocator and mount manager together
//! and drives each layer through `absent -> created -> mounted <-> unmounted
//! -> absent`. Every per-device operation runs under that device's lock;
//! operations on different devices proceed in parallel.
//!
//! Creation and deletion are bracketed by persisted `Creating` / `Deleting`
//! markers. A crash between the metadata write and the backend call is
//! repaired when the set is next opened.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::backend::{BlockBackend, MemoryCluster, RbdCliBackend};
use crate::config::{BackendKind, MountPolicy, RbdConfig, SizeRequest};
use crate::device::{Device, DeviceMetadata, DeviceState};
use crate::error::{RbdError, RbdResult};
use crate::locks::DeviceLocks;
use crate::mount::{HostMounter, MemoryMounter, MountManager, Mounter};
use crate::pool::PoolAllocator;
use crate::registry::DeviceRegistry;
use crate::store::MetadataStore;

/// Metadata directory under the home directory
pub const METADATA_DIR: &str = "metadata";
/// Metadata database file name
pub const METADATA_FILE: &str = "devices.redb";
/// Mount target directory under the home directory
pub const MOUNT_DIR: &str = "mnt";

/// Base delay between reconciliation retries, multiplied by the attempt
const RECONCILE_BACKOFF: Duration = Duration::from_millis(100);

/// Outcome of startup reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Interrupted creations that were rolled back
    pub rolled_back: Vec<String>,
    /// Interrupted deletions that were completed
    pub completed_deletes: Vec<String>,
    /// Records whose image was gone and that were dropped
    pub dropped_orphans: Vec<String>,
    /// Records whose image was gone but that still have children
    pub kept_orphans: Vec<String>,
    /// Devices whose recorded mount no longer existed
    pub stale_mounts: Vec<String>,
    /// Images carrying the store prefix without a record
    pub untracked_images: Vec<String>,
}

impl ReconcileReport {
    /// Check if reconciliation changed or reported anything
    pub fn is_clean(&self) -> bool {
        self.rolled_back.is_empty()
            && self.completed_deletes.is_empty()
            && self.dropped_orphans.is_empty()
            && self.kept_orphans.is_empty()
            && self.stale_mounts.is_empty()
            && self.untracked_images.is_empty()
    }
}

/// Summary of a device set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetStatus {
    pub backend: &'static str,
    pub pool: String,
    pub image_prefix: String,
    pub base_size: u64,
    pub filesystem: &'static str,
    pub devices: usize,
    pub mounted: usize,
}

/// Layer ids become image names and mount point names, so keep them to a
/// safe alphabet. A leading dot would allow `.` and `..`.
fn validate_id(id: &str) -> RbdResult<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'));
    if valid {
        Ok(())
    } else {
        Err(RbdError::InvalidId(id.to_string()))
    }
}

/// Copy-on-write layer store over a block-storage pool
pub struct RbdSet {
    home: PathBuf,
    config: RbdConfig,
    backend: Arc<dyn BlockBackend>,
    registry: DeviceRegistry,
    pool: PoolAllocator,
    mounts: MountManager,
    locks: DeviceLocks,
    closed: AtomicBool,
    report: ReconcileReport,
}

impl RbdSet {
    /// Open the device set under `home`, building the backend and mounter
    /// named by `options`.
    ///
    /// The `memory` backend keeps its images in this process only.
    pub fn new<S: AsRef<str>>(
        home: impl AsRef<Path>,
        initialize: bool,
        options: &[S],
    ) -> RbdResult<Self> {
        let config = RbdConfig::from_options(options)?;
        let backend: Arc<dyn BlockBackend>;
        let mounter: Arc<dyn Mounter>;
        match config.backend {
            BackendKind::Rbd => {
                backend = Arc::new(RbdCliBackend::new(&config)?);
                mounter = Arc::new(HostMounter::new());
            }
            BackendKind::Memory => {
                backend = Arc::new(MemoryCluster::new().connect(&config.pool));
                mounter = Arc::new(MemoryMounter::new());
            }
        }
        Self::with_parts(home, initialize, config, backend, mounter)
    }

    /// Open the device set with an explicit backend and mounter.
    pub fn with_parts(
        home: impl AsRef<Path>,
        initialize: bool,
        config: RbdConfig,
        backend: Arc<dyn BlockBackend>,
        mounter: Arc<dyn Mounter>,
    ) -> RbdResult<Self> {
        let home = home.as_ref().to_path_buf();
        if initialize {
            let mnt = home.join(MOUNT_DIR);
            fs::create_dir_all(&mnt).map_err(|e| RbdError::io("create home", mnt.display(), e))?;
        }

        let store = MetadataStore::open(home.join(METADATA_DIR).join(METADATA_FILE), initialize)?;
        let records = store.load()?;
        info!(
            "Opening device set at {:?} ({} record(s), backend {}, pool {})",
            home,
            records.len(),
            backend.name(),
            config.pool
        );

        let mut set = Self {
            pool: PoolAllocator::new(Arc::clone(&backend), &config),
            mounts: MountManager::new(Arc::clone(&backend), mounter, &config),
            registry: DeviceRegistry::new(Arc::new(store)),
            locks: DeviceLocks::new(),
            closed: AtomicBool::new(false),
            report: ReconcileReport::default(),
            home,
            config,
            backend,
        };

        match set.reconcile(records) {
            Ok(report) => set.report = report,
            Err(e) => {
                error!("Startup reconciliation failed: {}", e);
                if let Err(close_err) = set.backend.close() {
                    warn!("Failed to close backend: {}", close_err);
                }
                set.closed.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }

        if !set.report.is_clean() {
            info!("Reconciliation: {:?}", set.report);
        }
        info!("Device set ready with {} device(s)", set.registry.len());
        Ok(set)
    }

    /// Home directory of the set
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Effective configuration
    pub fn config(&self) -> &RbdConfig {
        &self.config
    }

    /// What startup reconciliation found and repaired
    pub fn reconcile_report(&self) -> &ReconcileReport {
        &self.report
    }

    // ── Startup reconciliation ───────────────────────────────────────────────

    /// Retry a read-style backend call on transient failures.
    fn with_retry<T>(&self, what: &str, mut call: impl FnMut() -> RbdResult<T>) -> RbdResult<T> {
        let attempts = self.config.reconcile_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call() {
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        what, attempt, attempts, e
                    );
                    thread::sleep(RECONCILE_BACKOFF * attempt);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn reconcile(&self, mut records: HashMap<String, Device>) -> RbdResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let store = self.registry.store();

        // Finish interrupted transactions first
        let mut pending: Vec<Device> = records
            .values()
            .filter(|d| d.state != DeviceState::Ready)
            .cloned()
            .collect();
        pending.sort_by_key(|d| d.numeric_id);
        let mut unfinished = HashSet::new();
        for device in pending {
            records.remove(&device.id);
            let verb = match device.state {
                DeviceState::Creating => "roll back creation of",
                _ => "complete deletion of",
            };
            let present = self.with_retry("image check", || self.pool.exists(&device.block_ref))?;
            let released = if present {
                self.pool.release(&device.block_ref)
            } else {
                Ok(())
            };
            match released {
                Ok(()) => {
                    store.remove(&device.id)?;
                    warn!("Had to {} device {}", verb, device.id);
                    match device.state {
                        DeviceState::Creating => report.rolled_back.push(device.id),
                        _ => report.completed_deletes.push(device.id),
                    }
                }
                Err(e) => {
                    // Record stays on disk so the next start tries again
                    error!("Failed to {} device {}: {}", verb, device.id, e);
                    unfinished.insert(device.block_ref.image.clone());
                }
            }
        }

        // Drop records whose backing image is gone
        let mut missing = HashSet::new();
        let mut ids: Vec<String> = records.keys().cloned().collect();
        ids.sort();
        for id in &ids {
            let block_ref = &records[id].block_ref;
            if !self.with_retry("image check", || self.pool.exists(block_ref))? {
                missing.insert(id.clone());
            }
        }
        loop {
            let parents: HashSet<&str> = records
                .values()
                .filter_map(|d| d.parent_id.as_deref())
                .collect();
            let mut droppable: Vec<String> = missing
                .iter()
                .filter(|id| !parents.contains(id.as_str()))
                .cloned()
                .collect();
            if droppable.is_empty() {
                break;
            }
            droppable.sort();
            for id in droppable {
                missing.remove(&id);
                records.remove(&id);
                store.remove(&id)?;
                warn!("Dropped device {}: backing image is gone", id);
                report.dropped_orphans.push(id);
            }
        }
        let mut kept: Vec<String> = missing.into_iter().collect();
        kept.sort();
        for id in &kept {
            warn!(
                "Device {} has no backing image but child layers still reference it",
                id
            );
        }
        report.kept_orphans = kept;

        // Verify recorded mounts against the host
        let mut ids: Vec<String> = records.keys().cloned().collect();
        ids.sort();
        for id in ids {
            let Some(device) = records.get_mut(&id) else {
                continue;
            };
            if self.reconcile_mount(device)? {
                report.stale_mounts.push(id);
            }
        }

        // Report images nobody owns
        let known: HashSet<&str> = records
            .values()
            .map(|d| d.block_ref.image.as_str())
            .collect();
        let mut untracked: Vec<String> = self
            .with_retry("image listing", || self.pool.list_images())?
            .into_iter()
            .filter(|image| !known.contains(image.as_str()) && !unfinished.contains(image))
            .collect();
        untracked.sort();
        for image in &untracked {
            warn!("Image {} has no device record", image);
        }
        report.untracked_images = untracked;

        self.registry.restore(records.into_values());
        Ok(report)
    }

    /// Clear mount state the host no longer backs. Returns whether the
    /// record was stale.
    fn reconcile_mount(&self, device: &mut Device) -> RbdResult<bool> {
        if let Some(target) = &device.mount_path {
            match self.mounts.is_mounted(target) {
                Ok(true) => {
                    if device.mount_count == 0 {
                        device.mount_count = 1;
                    }
                    return Ok(false);
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Cannot verify mount of device {}: {}", device.id, e);
                    return Ok(false);
                }
            }
        } else if device.device_path.is_none() {
            return Ok(false);
        }

        warn!(
            "Device {} was recorded as mounted at {:?} but is not; clearing",
            device.id, device.mount_path
        );
        if let Some(device_path) = &device.device_path
            && let Err(e) = self.mounts.detach(device_path)
        {
            warn!("Failed to detach {:?}: {}", device_path, e);
        }
        device.clear_mount();
        self.registry.store().save(device)?;
        Ok(true)
    }

    // ── Per-device operations ────────────────────────────────────────────────

    fn ensure_open(&self) -> RbdResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RbdError::Closed);
        }
        Ok(())
    }

    fn lookup(&self, id: &str) -> RbdResult<Device> {
        self.registry
            .get(id)
            .ok_or_else(|| RbdError::NotFound(id.to_string()))
    }

    /// Create layer `id`, empty or as a copy-on-write clone of `parent_id`.
    pub fn add_device(&self, id: &str, parent_id: Option<&str>) -> RbdResult<()> {
        self.add_device_with_size(id, parent_id, SizeRequest::Default)
    }

    /// Create layer `id` with an explicit size. Clones always take the
    /// parent's size.
    pub fn add_device_with_size(
        &self,
        id: &str,
        parent_id: Option<&str>,
        size: SizeRequest,
    ) -> RbdResult<()> {
        validate_id(id)?;
        let parent_id = parent_id.filter(|p| !p.is_empty());

        let (first, second) = match parent_id {
            Some(parent) => self.locks.get_pair(id, parent),
            None => (self.locks.get(id), None),
        };
        let _first = first.lock();
        let _second = second.as_ref().map(|lock| lock.lock());
        self.ensure_open()?;

        if self.registry.has(id) {
            return Err(RbdError::AlreadyExists(id.to_string()));
        }
        let parent = parent_id.map(|p| self.lookup(p)).transpose()?;

        let size_bytes = match &parent {
            Some(p) => p.size_bytes,
            None => self.pool.resolve_size(size),
        };
        let mut device = Device::new(
            id.to_string(),
            parent_id.map(str::to_string),
            self.pool.block_ref_for(id),
            size_bytes,
        );
        self.registry.store().insert_new(&mut device)?;

        let allocated = match &parent {
            Some(p) => self.pool.clone_from(&p.block_ref, id),
            None => self.pool.provision(id, size),
        };
        match allocated {
            Ok(block_ref) => device.block_ref = block_ref,
            Err(e) => {
                if let Err(store_err) = self.registry.store().remove(id) {
                    warn!("Failed to drop creation record of {}: {}", id, store_err);
                }
                return Err(e);
            }
        }

        if let Some(p) = &parent {
            device.formatted = p.frozen_formatted.unwrap_or(p.formatted);
        }
        device.state = DeviceState::Ready;
        if let Err(e) = self.registry.add(device.clone()) {
            error!("Failed to commit device {}: {}", id, e);
            match self.pool.release(&device.block_ref) {
                Ok(()) => {
                    if let Err(store_err) = self.registry.store().remove(id) {
                        warn!("Failed to drop creation record of {}: {}", id, store_err);
                    }
                }
                Err(release_err) => warn!("Failed to release {}: {}", device.block_ref, release_err),
            }
            return Err(e);
        }

        // Remember what the frozen snapshot holds for later clones
        if let Some(mut p) = parent
            && p.frozen_formatted.is_none()
        {
            p.frozen_formatted = Some(p.formatted);
            if let Err(e) = self.registry.update(p) {
                warn!("Failed to record frozen state of parent: {}", e);
            }
        }

        info!(
            "Added device {} (parent {:?}, numeric id {}, {} bytes)",
            id, parent_id, device.numeric_id, device.size_bytes
        );
        Ok(())
    }

    /// Check if layer `id` is registered
    pub fn has_device(&self, id: &str) -> bool {
        self.registry.has(id)
    }

    /// Delete layer `id`, unmounting it first. Refused while child layers
    /// exist.
    pub fn delete_device(&self, id: &str) -> RbdResult<()> {
        let lock = self.locks.get(id);
        let _guard = lock.lock();
        self.ensure_open()?;

        let mut device = self.lookup(id)?;
        let children = self.registry.children(id);
        if !children.is_empty() {
            return Err(RbdError::HasChildren {
                id: id.to_string(),
                count: children.len(),
            });
        }

        if device.is_mounted() || device.device_path.is_some() {
            self.release_mount(&mut device)?;
        }

        device.state = DeviceState::Deleting;
        self.registry.update(device.clone())?;

        if let Err(e) = self.pool.release(&device.block_ref) {
            error!("Failed to release image of {}: {}", id, e);
            device.state = DeviceState::Ready;
            if let Err(store_err) = self.registry.update(device) {
                warn!("Failed to restore state of {}: {}", id, store_err);
            }
            return Err(e);
        }

        self.registry.remove(id)?;
        self.locks.prune(id);
        info!("Deleted device {}", id);
        Ok(())
    }

    /// Mount layer `id` at `target`, building its filesystem on first use.
    ///
    /// Mounting again at the current target succeeds (and takes another
    /// reference under [`MountPolicy::RefCounted`]); any other target is a
    /// [`RbdError::MountConflict`].
    pub fn mount_device(&self, id: &str, target: &Path, label: &str) -> RbdResult<()> {
        let lock = self.locks.get(id);
        let _guard = lock.lock();
        self.ensure_open()?;

        let mut device = self.lookup(id)?;
        if let Some(current) = &device.mount_path {
            if current != target {
                return Err(RbdError::MountConflict {
                    id: id.to_string(),
                    current: current.clone(),
                    requested: target.to_path_buf(),
                });
            }
            if self.config.mount_policy == MountPolicy::RefCounted {
                device.mount_count += 1;
                debug!("Device {} mount count now {}", id, device.mount_count);
                self.registry.update(device)?;
            }
            return Ok(());
        }

        if let Some(leftover) = device.device_path.take()
            && let Err(e) = self.mounts.detach(&leftover)
        {
            warn!("Failed to detach leftover {:?} of {}: {}", leftover, id, e);
        }

        let device_path = self.mounts.attach(&device)?;

        if !device.formatted {
            if let Err(e) = self.mounts.format(&device_path) {
                self.detach_quietly(&device_path);
                return Err(e);
            }
            device.formatted = true;
        }

        if let Err(e) = self.mounts.mount_at(&device_path, target, label) {
            self.detach_quietly(&device_path);
            device.device_path = None;
            if let Err(store_err) = self.registry.update(device) {
                warn!("Failed to persist state of {}: {}", id, store_err);
            }
            return Err(e);
        }

        device.mount_path = Some(target.to_path_buf());
        device.mount_count = 1;
        device.device_path = Some(device_path.clone());
        if let Err(e) = self.registry.update(device) {
            error!("Failed to record mount of {}: {}", id, e);
            if let Err(unmount_err) = self.mounts.unmount(target) {
                warn!("Failed to unmount {:?}: {}", target, unmount_err);
            } else {
                self.detach_quietly(&device_path);
            }
            return Err(e);
        }

        info!("Mounted device {} at {:?}", id, target);
        Ok(())
    }

    /// Unmount layer `id`. Unmounting a device that is not mounted succeeds.
    pub fn unmount_device(&self, id: &str) -> RbdResult<()> {
        let lock = self.locks.get(id);
        let _guard = lock.lock();
        self.ensure_open()?;

        let mut device = self.lookup(id)?;
        if !device.is_mounted() {
            debug!("Device {} is not mounted", id);
            return Ok(());
        }

        if self.config.mount_policy == MountPolicy::RefCounted && device.mount_count > 1 {
            device.mount_count -= 1;
            debug!("Device {} mount count now {}", id, device.mount_count);
            return self.registry.update(device);
        }

        self.release_mount(&mut device)?;
        info!("Unmounted device {}", id);
        Ok(())
    }

    /// Numeric id, size and image name of layer `id`
    pub fn export_device_metadata(&self, id: &str) -> RbdResult<DeviceMetadata> {
        let lock = self.locks.get(id);
        let _guard = lock.lock();
        self.ensure_open()?;
        Ok(self.lookup(id)?.metadata())
    }

    /// All registered devices ordered by numeric id
    pub fn list_devices(&self) -> Vec<Device> {
        let mut devices = self.registry.list();
        devices.sort_by_key(|d| d.numeric_id);
        devices
    }

    /// Summary of the set
    pub fn status(&self) -> SetStatus {
        let devices = self.registry.list();
        SetStatus {
            backend: self.backend.name(),
            pool: self.config.pool.clone(),
            image_prefix: self.config.image_prefix.clone(),
            base_size: self.config.base_size,
            filesystem: self.config.filesystem.as_str(),
            devices: devices.len(),
            mounted: devices.iter().filter(|d| d.is_mounted()).count(),
        }
    }

    /// Unmount every mounted device and close the backend.
    ///
    /// Afterwards every operation fails with [`RbdError::Closed`]. Calling
    /// it again is a no-op. Devices that could not be released are
    /// reported through [`RbdError::ShutdownIncomplete`].
    pub fn shutdown(&self) -> RbdResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("Device set already shut down");
            return Ok(());
        }
        info!("Shutting down device set at {:?}", self.home);

        // Lock entries cover adds that passed the open check but are not
        // registered yet
        let mut ids: Vec<String> = self.registry.list().into_iter().map(|d| d.id).collect();
        ids.extend(self.locks.ids());
        ids.sort();
        ids.dedup();

        let mut failures = Vec::new();
        for id in ids {
            // Waits for in-flight work on this device
            let lock = self.locks.get(&id);
            let _guard = lock.lock();
            let Some(mut device) = self.registry.get(&id) else {
                continue;
            };
            if !device.is_mounted() && device.device_path.is_none() {
                continue;
            }
            match self.release_mount(&mut device) {
                Ok(()) => debug!("Released device {}", id),
                Err(e) => {
                    warn!("Failed to release device {}: {}", id, e);
                    failures.push((id, e.to_string()));
                }
            }
        }

        if let Err(e) = self.backend.close() {
            warn!("Failed to close backend: {}", e);
            failures.push((self.backend.name().to_string(), e.to_string()));
        }

        if failures.is_empty() {
            info!("Device set shut down");
            Ok(())
        } else {
            Err(RbdError::ShutdownIncomplete(failures))
        }
    }

    /// Unmount and detach `device`, persisting the cleared state even when
    /// a step fails. The attach record survives a failed unmount or detach
    /// so a later call can retry.
    fn release_mount(&self, device: &mut Device) -> RbdResult<()> {
        let mut first_err = None;

        let unmounted = match device.mount_path.as_deref() {
            Some(target) => match self.mounts.unmount(target) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to unmount device {}: {}", device.id, e);
                    first_err = Some(e);
                    false
                }
            },
            None => true,
        };

        if unmounted && let Some(device_path) = device.device_path.clone() {
            match self.mounts.detach(&device_path) {
                Ok(()) => device.device_path = None,
                Err(e) => {
                    warn!("Failed to detach device {}: {}", device.id, e);
                    first_err = Some(e);
                }
            }
        }

        device.mount_path = None;
        device.mount_count = 0;
        if let Err(e) = self.registry.update(device.clone()) {
            error!("Failed to persist unmount of {}: {}", device.id, e);
            first_err.get_or_insert(e);
        }

        first_err.map_or(Ok(()), Err)
    }

    fn detach_quietly(&self, device_path: &Path) {
        if let Err(e) = self.mounts.detach(device_path) {
            warn!("Failed to detach {:?}: {}", device_path, e);
        }
    }
}

impl Drop for RbdSet {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            debug!("Device set at {:?} dropped without shutdown", self.home);
        }
    }
}
