//! In-process block-storage cluster
//!
//! Models the subset of RBD semantics the layer store relies on: protected
//! snapshots, clone dependencies, and mapping to local device names. A
//! [`MemoryCluster`] outlives the [`MemoryBackend`] connections made to it,
//! which lets tests restart a device set against the same data.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::BlockBackend;
use crate::error::{RbdError, RbdResult};

#[derive(Debug, Clone, Default)]
struct MemSnapshot {
    protected: bool,
}

#[derive(Debug, Clone)]
struct MemImage {
    size_bytes: u64,
    snapshots: BTreeMap<String, MemSnapshot>,
    /// (image, snapshot) this image was cloned from
    parent: Option<(String, String)>,
    mapped: Option<PathBuf>,
}

/// Shared state of an in-process cluster
#[derive(Default)]
pub struct MemoryCluster {
    /// Images by pool, then by name
    pools: RwLock<HashMap<String, BTreeMap<String, MemImage>>>,
    /// Next local device number
    next_device: AtomicU32,
    /// Simulated network partition
    unreachable: AtomicBool,
    /// One-shot failures keyed by operation name
    fail_next: Mutex<HashSet<&'static str>>,
}

impl MemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a connection to `pool`
    pub fn connect(self: &Arc<Self>, pool: &str) -> MemoryBackend {
        self.pools.write().entry(pool.to_string()).or_default();
        MemoryBackend {
            cluster: Arc::clone(self),
            pool: pool.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    /// Simulate the cluster becoming unreachable (or reachable again)
    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Make the next call of `op` fail with a backend error
    pub fn fail_next(&self, op: &'static str) {
        self.fail_next.lock().insert(op);
    }

    /// Image names in `pool`
    pub fn images(&self, pool: &str) -> Vec<String> {
        self.pools
            .read()
            .get(pool)
            .map(|images| images.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of images currently mapped to a local device
    pub fn mapped_count(&self) -> usize {
        self.pools
            .read()
            .values()
            .flat_map(BTreeMap::values)
            .filter(|image| image.mapped.is_some())
            .count()
    }

    /// Delete an image behind the device set's back
    pub fn destroy_image(&self, pool: &str, image: &str) {
        if let Some(images) = self.pools.write().get_mut(pool) {
            images.remove(image);
        }
    }
}

/// Connection to one pool of a [`MemoryCluster`]
pub struct MemoryBackend {
    cluster: Arc<MemoryCluster>,
    pool: String,
    closed: AtomicBool,
}

impl MemoryBackend {
    fn check(&self, op: &'static str, target: &str) -> RbdResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RbdError::BackendUnavailable {
                op,
                target: target.to_string(),
                transient: false,
                reason: "connection closed".to_string(),
            });
        }
        if self.cluster.unreachable.load(Ordering::SeqCst) {
            return Err(RbdError::BackendUnavailable {
                op,
                target: target.to_string(),
                transient: true,
                reason: "cluster unreachable".to_string(),
            });
        }
        if self.cluster.fail_next.lock().remove(op) {
            return Err(RbdError::backend(op, target, "injected failure"));
        }
        Ok(())
    }

    fn with_images<T>(&self, f: impl FnOnce(&mut BTreeMap<String, MemImage>) -> T) -> T {
        let mut pools = self.cluster.pools.write();
        f(pools.entry(self.pool.clone()).or_default())
    }

    fn spec(&self, image: &str) -> String {
        format!("{}/{}", self.pool, image)
    }
}

impl BlockBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn list_images(&self) -> RbdResult<Vec<String>> {
        self.check("list", &self.pool)?;
        Ok(self.with_images(|images| images.keys().cloned().collect()))
    }

    fn image_exists(&self, image: &str) -> RbdResult<bool> {
        self.check("info", &self.spec(image))?;
        Ok(self.with_images(|images| images.contains_key(image)))
    }

    fn image_size(&self, image: &str) -> RbdResult<u64> {
        let spec = self.spec(image);
        self.check("info", &spec)?;
        self.with_images(|images| {
            images
                .get(image)
                .map(|img| img.size_bytes)
                .ok_or_else(|| RbdError::backend("info", &spec, "image not found"))
        })
    }

    fn create_image(&self, image: &str, size_bytes: u64) -> RbdResult<()> {
        let spec = self.spec(image);
        self.check("create", &spec)?;
        self.with_images(|images| {
            if images.contains_key(image) {
                return Err(RbdError::backend("create", &spec, "image already exists"));
            }
            images.insert(
                image.to_string(),
                MemImage {
                    size_bytes,
                    snapshots: BTreeMap::new(),
                    parent: None,
                    mapped: None,
                },
            );
            Ok(())
        })
    }

    fn snapshot_exists(&self, image: &str, snapshot: &str) -> RbdResult<bool> {
        self.check("snap ls", &self.spec(image))?;
        Ok(self.with_images(|images| {
            images
                .get(image)
                .is_some_and(|img| img.snapshots.contains_key(snapshot))
        }))
    }

    fn snapshot_protected(&self, image: &str, snapshot: &str) -> RbdResult<bool> {
        let spec = format!("{}@{snapshot}", self.spec(image));
        self.check("snap ls", &spec)?;
        self.with_images(|images| {
            images
                .get(image)
                .and_then(|img| img.snapshots.get(snapshot))
                .map(|snap| snap.protected)
                .ok_or_else(|| RbdError::backend("snap ls", &spec, "snapshot not found"))
        })
    }

    fn create_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()> {
        let spec = format!("{}@{snapshot}", self.spec(image));
        self.check("snap create", &spec)?;
        self.with_images(|images| {
            let img = images
                .get_mut(image)
                .ok_or_else(|| RbdError::backend("snap create", &spec, "image not found"))?;
            if img.snapshots.contains_key(snapshot) {
                return Err(RbdError::backend("snap create", &spec, "snapshot exists"));
            }
            img.snapshots
                .insert(snapshot.to_string(), MemSnapshot::default());
            Ok(())
        })
    }

    fn protect_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()> {
        let spec = format!("{}@{snapshot}", self.spec(image));
        self.check("snap protect", &spec)?;
        self.with_images(|images| {
            let snap = images
                .get_mut(image)
                .and_then(|img| img.snapshots.get_mut(snapshot))
                .ok_or_else(|| RbdError::backend("snap protect", &spec, "snapshot not found"))?;
            if snap.protected {
                return Err(RbdError::backend(
                    "snap protect",
                    &spec,
                    "snap is already protected",
                ));
            }
            snap.protected = true;
            Ok(())
        })
    }

    fn unprotect_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()> {
        let spec = format!("{}@{snapshot}", self.spec(image));
        self.check("snap unprotect", &spec)?;
        self.with_images(|images| {
            let parent = (image.to_string(), snapshot.to_string());
            if images
                .values()
                .any(|img| img.parent.as_ref() == Some(&parent))
            {
                return Err(RbdError::backend(
                    "snap unprotect",
                    &spec,
                    "snapshot has dependent clones",
                ));
            }
            let snap = images
                .get_mut(image)
                .and_then(|img| img.snapshots.get_mut(snapshot))
                .ok_or_else(|| {
                    RbdError::backend("snap unprotect", &spec, "snapshot not found")
                })?;
            if !snap.protected {
                return Err(RbdError::backend(
                    "snap unprotect",
                    &spec,
                    "snap is already unprotected",
                ));
            }
            snap.protected = false;
            Ok(())
        })
    }

    fn remove_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()> {
        let spec = format!("{}@{snapshot}", self.spec(image));
        self.check("snap rm", &spec)?;
        self.with_images(|images| {
            let img = images
                .get_mut(image)
                .ok_or_else(|| RbdError::backend("snap rm", &spec, "image not found"))?;
            match img.snapshots.get(snapshot) {
                None => Err(RbdError::backend("snap rm", &spec, "snapshot not found")),
                Some(snap) if snap.protected => {
                    Err(RbdError::backend("snap rm", &spec, "snapshot is protected"))
                }
                Some(_) => {
                    img.snapshots.remove(snapshot);
                    Ok(())
                }
            }
        })
    }

    fn clone_image(&self, image: &str, snapshot: &str, child: &str) -> RbdResult<()> {
        let spec = format!("{}@{snapshot}", self.spec(image));
        self.check("clone", &spec)?;
        self.with_images(|images| {
            let size_bytes = match images.get(image).and_then(|img| {
                img.snapshots
                    .get(snapshot)
                    .map(|snap| (img.size_bytes, snap.protected))
            }) {
                None => return Err(RbdError::backend("clone", &spec, "snapshot not found")),
                Some((_, false)) => {
                    return Err(RbdError::backend("clone", &spec, "snapshot is not protected"));
                }
                Some((size, true)) => size,
            };
            if images.contains_key(child) {
                return Err(RbdError::backend("clone", &spec, "target image already exists"));
            }
            images.insert(
                child.to_string(),
                MemImage {
                    size_bytes,
                    snapshots: BTreeMap::new(),
                    parent: Some((image.to_string(), snapshot.to_string())),
                    mapped: None,
                },
            );
            Ok(())
        })
    }

    fn children(&self, image: &str, snapshot: &str) -> RbdResult<Vec<String>> {
        self.check("children", &self.spec(image))?;
        let parent = (image.to_string(), snapshot.to_string());
        Ok(self.with_images(|images| {
            images
                .iter()
                .filter(|(_, img)| img.parent.as_ref() == Some(&parent))
                .map(|(name, _)| name.clone())
                .collect()
        }))
    }

    fn remove_image(&self, image: &str) -> RbdResult<()> {
        let spec = self.spec(image);
        self.check("rm", &spec)?;
        self.with_images(|images| {
            let img = images
                .get(image)
                .ok_or_else(|| RbdError::backend("rm", &spec, "image not found"))?;
            if !img.snapshots.is_empty() {
                return Err(RbdError::backend("rm", &spec, "image has snapshots"));
            }
            if img.mapped.is_some() {
                return Err(RbdError::backend("rm", &spec, "image is mapped"));
            }
            images.remove(image);
            Ok(())
        })
    }

    fn map(&self, image: &str) -> RbdResult<PathBuf> {
        let spec = self.spec(image);
        self.check("map", &spec)?;
        let path = self.with_images(|images| -> RbdResult<PathBuf> {
            let img = images
                .get_mut(image)
                .ok_or_else(|| RbdError::backend("map", &spec, "image not found"))?;
            if let Some(path) = &img.mapped {
                return Ok(path.clone());
            }
            let n = self.cluster.next_device.fetch_add(1, Ordering::SeqCst);
            let path = PathBuf::from(format!("/dev/rbd{n}"));
            img.mapped = Some(path.clone());
            Ok(path)
        })?;
        debug!("Mapped {} at {:?}", spec, path);
        Ok(path)
    }

    fn unmap(&self, device: &Path) -> RbdResult<()> {
        let target = device.display().to_string();
        self.check("unmap", &target)?;
        self.with_images(|images| {
            let img = images
                .values_mut()
                .find(|img| img.mapped.as_deref() == Some(device))
                .ok_or_else(|| RbdError::backend("unmap", &target, "device not mapped"))?;
            img.mapped = None;
            Ok(())
        })
    }

    fn close(&self) -> RbdResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_requires_protected_snapshot() {
        let cluster = MemoryCluster::new();
        let backend = cluster.connect("rbd");
        backend.create_image("base", 1024).unwrap();
        backend.create_snapshot("base", "frozen").unwrap();

        assert!(backend.clone_image("base", "frozen", "child").is_err());

        backend.protect_snapshot("base", "frozen").unwrap();
        backend.clone_image("base", "frozen", "child").unwrap();
        assert_eq!(backend.image_size("child").unwrap(), 1024);
        assert_eq!(
            backend.children("base", "frozen").unwrap(),
            vec!["child".to_string()]
        );

        // Dependent clone pins the snapshot and the image
        assert!(backend.unprotect_snapshot("base", "frozen").is_err());
        assert!(backend.remove_image("base").is_err());

        backend.remove_image("child").unwrap();
        backend.unprotect_snapshot("base", "frozen").unwrap();
        backend.remove_snapshot("base", "frozen").unwrap();
        backend.remove_image("base").unwrap();
        assert!(cluster.images("rbd").is_empty());
    }

    #[test]
    fn test_protection_changes_state_once() {
        let cluster = MemoryCluster::new();
        let backend = cluster.connect("rbd");
        backend.create_image("base", 1024).unwrap();
        backend.create_snapshot("base", "frozen").unwrap();
        assert!(!backend.snapshot_protected("base", "frozen").unwrap());
        assert!(backend.unprotect_snapshot("base", "frozen").is_err());

        backend.protect_snapshot("base", "frozen").unwrap();
        assert!(backend.snapshot_protected("base", "frozen").unwrap());
        assert!(backend.protect_snapshot("base", "frozen").is_err());

        assert!(backend.snapshot_protected("base", "missing").is_err());
    }

    #[test]
    fn test_map_is_stable_until_unmapped() {
        let cluster = MemoryCluster::new();
        let backend = cluster.connect("rbd");
        backend.create_image("img", 1024).unwrap();

        let first = backend.map("img").unwrap();
        assert_eq!(backend.map("img").unwrap(), first);
        assert_eq!(cluster.mapped_count(), 1);
        assert!(backend.remove_image("img").is_err());

        backend.unmap(&first).unwrap();
        assert_eq!(cluster.mapped_count(), 0);
        assert!(backend.unmap(&first).is_err());
    }

    #[test]
    fn test_unreachable_and_closed() {
        let cluster = MemoryCluster::new();
        let backend = cluster.connect("rbd");

        cluster.set_reachable(false);
        let err = backend.list_images().unwrap_err();
        assert!(err.is_transient());
        cluster.set_reachable(true);
        backend.list_images().unwrap();

        backend.close().unwrap();
        let err = backend.list_images().unwrap_err();
        assert!(matches!(
            err,
            RbdError::BackendUnavailable {
                transient: false,
                ..
            }
        ));

        // The cluster keeps its data for new connections
        let again = cluster.connect("rbd");
        again.create_image("img", 1).unwrap();
        assert_eq!(cluster.images("rbd"), vec!["img".to_string()]);
    }

    #[test]
    fn test_fail_next_is_one_shot() {
        let cluster = MemoryCluster::new();
        let backend = cluster.connect("rbd");
        cluster.fail_next("create");
        assert!(backend.create_image("img", 1).is_err());
        backend.create_image("img", 1).unwrap();
    }
}
