//! Pool allocation of layer images
//!
//! Base layers get a freshly provisioned image; child layers are
//! copy-on-write clones of their parent's frozen snapshot. The frozen
//! snapshot is created and protected on the first clone and stays protected
//! while any clone depends on it.

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::BlockBackend;
use crate::config::{RbdConfig, SizeRequest};
use crate::device::BlockRef;
use crate::error::{RbdError, RbdResult};

/// Name of the point-in-time snapshot every clone of an image is made from
pub const FROZEN_SNAPSHOT: &str = "frozen";

/// Allocates and releases backing images in one pool
pub struct PoolAllocator {
    backend: Arc<dyn BlockBackend>,
    pool: String,
    image_prefix: String,
    base_size: u64,
}

impl PoolAllocator {
    pub fn new(backend: Arc<dyn BlockBackend>, config: &RbdConfig) -> Self {
        Self {
            backend,
            pool: config.pool.clone(),
            image_prefix: config.image_prefix.clone(),
            base_size: config.base_size,
        }
    }

    /// Block reference a layer id maps to
    pub fn block_ref_for(&self, id: &str) -> BlockRef {
        BlockRef::new(self.pool.clone(), format!("{}_{}", self.image_prefix, id))
    }

    /// Whether an image name was created by this allocator
    pub fn owns_image(&self, image: &str) -> bool {
        image
            .strip_prefix(&self.image_prefix)
            .is_some_and(|rest| rest.starts_with('_'))
    }

    /// Size used for a base layer request
    pub fn resolve_size(&self, size: SizeRequest) -> u64 {
        match size {
            SizeRequest::Default => self.base_size,
            SizeRequest::Exact(bytes) => bytes,
        }
    }

    /// Provision a fresh image for base layer `id`.
    pub fn provision(&self, id: &str, size: SizeRequest) -> RbdResult<BlockRef> {
        let block_ref = self.block_ref_for(id);
        let size_bytes = self.resolve_size(size);
        self.backend.create_image(&block_ref.image, size_bytes)?;
        info!("Provisioned {} ({} bytes)", block_ref, size_bytes);
        Ok(block_ref)
    }

    /// Clone `parent` into a new image for layer `id`.
    pub fn clone_from(&self, parent: &BlockRef, id: &str) -> RbdResult<BlockRef> {
        self.ensure_frozen(parent)?;
        let block_ref = self.block_ref_for(id);
        self.backend
            .clone_image(&parent.image, FROZEN_SNAPSHOT, &block_ref.image)?;
        info!("Cloned {}@{} into {}", parent, FROZEN_SNAPSHOT, block_ref);
        Ok(block_ref)
    }

    fn ensure_frozen(&self, parent: &BlockRef) -> RbdResult<()> {
        if self.backend.snapshot_exists(&parent.image, FROZEN_SNAPSHOT)? {
            // A crash between create and protect leaves it unprotected
            if !self
                .backend
                .snapshot_protected(&parent.image, FROZEN_SNAPSHOT)?
            {
                self.backend
                    .protect_snapshot(&parent.image, FROZEN_SNAPSHOT)?;
                debug!("Protected leftover {}@{}", parent, FROZEN_SNAPSHOT);
            }
            return Ok(());
        }
        self.backend
            .create_snapshot(&parent.image, FROZEN_SNAPSHOT)?;
        self.backend
            .protect_snapshot(&parent.image, FROZEN_SNAPSHOT)?;
        debug!("Froze {}@{}", parent, FROZEN_SNAPSHOT);
        Ok(())
    }

    /// Remove the image behind `block_ref`.
    ///
    /// Refused while clones depend on its frozen snapshot. A missing image
    /// counts as released.
    pub fn release(&self, block_ref: &BlockRef) -> RbdResult<()> {
        if !self.backend.image_exists(&block_ref.image)? {
            debug!("Image {} already gone", block_ref);
            return Ok(());
        }

        if self
            .backend
            .snapshot_exists(&block_ref.image, FROZEN_SNAPSHOT)?
        {
            let clones = self.backend.children(&block_ref.image, FROZEN_SNAPSHOT)?;
            if !clones.is_empty() {
                return Err(RbdError::HasChildren {
                    id: block_ref.to_string(),
                    count: clones.len(),
                });
            }
            if self
                .backend
                .snapshot_protected(&block_ref.image, FROZEN_SNAPSHOT)?
            {
                self.backend
                    .unprotect_snapshot(&block_ref.image, FROZEN_SNAPSHOT)?;
            }
            self.backend
                .remove_snapshot(&block_ref.image, FROZEN_SNAPSHOT)?;
        }

        self.backend.remove_image(&block_ref.image)?;
        info!("Released {}", block_ref);
        Ok(())
    }

    /// Check if the image behind `block_ref` exists
    pub fn exists(&self, block_ref: &BlockRef) -> RbdResult<bool> {
        self.backend.image_exists(&block_ref.image)
    }

    /// All images in the pool created by this allocator
    pub fn list_images(&self) -> RbdResult<Vec<String>> {
        Ok(self
            .backend
            .list_images()?
            .into_iter()
            .filter(|image| self.owns_image(image))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryCluster;

    fn allocator() -> (Arc<MemoryCluster>, PoolAllocator) {
        let cluster = MemoryCluster::new();
        let config = RbdConfig {
            base_size: 8 * 1024 * 1024,
            ..RbdConfig::default()
        };
        let backend: Arc<dyn BlockBackend> = Arc::new(cluster.connect(&config.pool));
        (cluster, PoolAllocator::new(backend, &config))
    }

    #[test]
    fn test_provision_default_and_exact_size() {
        let (cluster, pool) = allocator();
        let a = pool.provision("a", SizeRequest::Default).unwrap();
        let b = pool.provision("b", SizeRequest::Exact(4096)).unwrap();

        assert_eq!(a.to_string(), "rbd/layer_a");
        let backend = cluster.connect("rbd");
        assert_eq!(backend.image_size(&a.image).unwrap(), 8 * 1024 * 1024);
        assert_eq!(backend.image_size(&b.image).unwrap(), 4096);
    }

    #[test]
    fn test_clone_freezes_parent_once() {
        let (cluster, pool) = allocator();
        let parent = pool.provision("parent", SizeRequest::Default).unwrap();
        pool.clone_from(&parent, "c1").unwrap();
        pool.clone_from(&parent, "c2").unwrap();

        let backend = cluster.connect("rbd");
        assert!(backend.snapshot_exists(&parent.image, FROZEN_SNAPSHOT).unwrap());
        assert!(backend.snapshot_protected(&parent.image, FROZEN_SNAPSHOT).unwrap());
        assert_eq!(backend.children(&parent.image, FROZEN_SNAPSHOT).unwrap().len(), 2);
    }

    #[test]
    fn test_half_frozen_parent_recovers() {
        let (cluster, pool) = allocator();
        let parent = pool.provision("parent", SizeRequest::Default).unwrap();
        let backend = cluster.connect("rbd");

        // Snapshot taken but never protected
        backend.create_snapshot(&parent.image, FROZEN_SNAPSHOT).unwrap();
        let child = pool.clone_from(&parent, "child").unwrap();
        pool.clone_from(&parent, "sibling").unwrap();

        // Clones gone, protection already lifted
        pool.release(&child).unwrap();
        pool.release(&pool.block_ref_for("sibling")).unwrap();
        backend
            .unprotect_snapshot(&parent.image, FROZEN_SNAPSHOT)
            .unwrap();
        pool.release(&parent).unwrap();
        assert!(cluster.images("rbd").is_empty());
    }

    #[test]
    fn test_release_refused_while_cloned() {
        let (cluster, pool) = allocator();
        let parent = pool.provision("parent", SizeRequest::Default).unwrap();
        let child = pool.clone_from(&parent, "child").unwrap();

        let result = pool.release(&parent);
        assert!(matches!(result, Err(RbdError::HasChildren { count: 1, .. })));

        pool.release(&child).unwrap();
        pool.release(&parent).unwrap();
        assert!(cluster.images("rbd").is_empty());

        // Releasing again is a no-op
        pool.release(&parent).unwrap();
    }

    #[test]
    fn test_list_only_owned_images() {
        let (cluster, pool) = allocator();
        pool.provision("a", SizeRequest::Default).unwrap();
        cluster.connect("rbd").create_image("foreign", 1).unwrap();
        cluster.connect("rbd").create_image("layerish", 1).unwrap();

        assert_eq!(pool.list_images().unwrap(), vec!["layer_a".to_string()]);
        assert!(pool.owns_image("layer_x"));
        assert!(!pool.owns_image("layerish"));
    }
}
