//! In-memory device index
//!
//! The registry is the only path through which committed devices change.
//! Each mutation is written to the [`MetadataStore`] first and applied to
//! memory only once the write succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::warn;

use crate::device::Device;
use crate::error::{RbdError, RbdResult};
use crate::store::MetadataStore;

/// Index of committed devices by layer id
pub struct DeviceRegistry {
    /// Devices by id
    devices: RwLock<HashMap<String, Device>>,
    /// Children by parent id
    children: RwLock<HashMap<String, HashSet<String>>>,
    /// Durable backing store
    store: Arc<MetadataStore>,
}

impl DeviceRegistry {
    /// Create an empty registry over `store`
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            devices: RwLock::new(HashMap::new()),
            children: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// The backing metadata store
    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Populate from records loaded at startup.
    ///
    /// Parents are not required to be inserted first; dangling parent
    /// references are only logged.
    pub fn restore(&self, devices: impl IntoIterator<Item = Device>) {
        let mut map = self.devices.write();
        let mut children = self.children.write();
        for device in devices {
            if let Some(parent) = &device.parent_id {
                children
                    .entry(parent.clone())
                    .or_default()
                    .insert(device.id.clone());
            }
            map.insert(device.id.clone(), device);
        }
        for (parent, kids) in children.iter() {
            if !map.contains_key(parent) {
                warn!(
                    "Parent layer {} of {} child layer(s) has no metadata record",
                    parent,
                    kids.len()
                );
            }
        }
    }

    /// Register a new device.
    pub fn add(&self, device: Device) -> RbdResult<()> {
        if self.has(&device.id) {
            return Err(RbdError::AlreadyExists(device.id));
        }
        if let Some(parent) = &device.parent_id {
            if !self.has(parent) {
                return Err(RbdError::NotFound(parent.clone()));
            }
        }

        self.store.save(&device)?;

        if let Some(parent) = &device.parent_id {
            self.children
                .write()
                .entry(parent.clone())
                .or_default()
                .insert(device.id.clone());
        }
        self.devices.write().insert(device.id.clone(), device);
        Ok(())
    }

    /// Replace the record of an existing device.
    pub fn update(&self, device: Device) -> RbdResult<()> {
        if !self.has(&device.id) {
            return Err(RbdError::NotFound(device.id));
        }
        self.store.save(&device)?;
        self.devices.write().insert(device.id.clone(), device);
        Ok(())
    }

    /// Get a device by id
    pub fn get(&self, id: &str) -> Option<Device> {
        self.devices.read().get(id).cloned()
    }

    /// Check if a device is registered
    pub fn has(&self, id: &str) -> bool {
        self.devices.read().contains_key(id)
    }

    /// List all devices
    pub fn list(&self) -> Vec<Device> {
        self.devices.read().values().cloned().collect()
    }

    /// Ids of the direct children of `id`
    pub fn children(&self, id: &str) -> HashSet<String> {
        self.children.read().get(id).cloned().unwrap_or_default()
    }

    /// Unregister a device and erase its record. Refused while children exist.
    pub fn remove(&self, id: &str) -> RbdResult<Device> {
        let device = self
            .get(id)
            .ok_or_else(|| RbdError::NotFound(id.to_string()))?;

        let count = self.children.read().get(id).map_or(0, HashSet::len);
        if count > 0 {
            return Err(RbdError::HasChildren {
                id: id.to_string(),
                count,
            });
        }

        self.store.remove(id)?;

        self.devices.write().remove(id);
        let mut children = self.children.write();
        children.remove(id);
        if let Some(parent) = &device.parent_id {
            if let Some(kids) = children.get_mut(parent) {
                kids.remove(id);
                if kids.is_empty() {
                    children.remove(parent);
                }
            }
        }
        Ok(device)
    }

    /// Number of registered devices
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Check if the registry is empty
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }
}
