//! Persistent device metadata store using Redb
//!
//! Every device record lives in one table keyed by layer id; each save is a
//! single write transaction, so a crash leaves either the old or the new
//! record on disk, never a torn one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::device::{BlockRef, Device, DeviceState};
use crate::error::{RbdError, RbdResult};

// ── Table definitions ─────────────────────────────────────────────────────────

/// Devices: layer id (str) → JSON(DeviceRecord)
const DEVICES: TableDefinition<&str, &str> = TableDefinition::new("devices");
/// Counters: name (str) → u32
const COUNTERS: TableDefinition<&str, u32> = TableDefinition::new("counters");

const NEXT_DEVICE_ID: &str = "next_device_id";

// ── Serialisable records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DeviceRecord {
    id: String,
    parent_id: Option<String>,
    pool: String,
    image: String,
    size_bytes: u64,
    numeric_id: u32,
    mount_path: Option<PathBuf>,
    mount_count: u32,
    device_path: Option<PathBuf>,
    formatted: bool,
    #[serde(default)]
    frozen_formatted: Option<bool>,
    state: i32,
    created_at: u64,
}

impl From<&Device> for DeviceRecord {
    fn from(d: &Device) -> Self {
        Self {
            id: d.id.clone(),
            parent_id: d.parent_id.clone(),
            pool: d.block_ref.pool.clone(),
            image: d.block_ref.image.clone(),
            size_bytes: d.size_bytes,
            numeric_id: d.numeric_id,
            mount_path: d.mount_path.clone(),
            mount_count: d.mount_count,
            device_path: d.device_path.clone(),
            formatted: d.formatted,
            frozen_formatted: d.frozen_formatted,
            state: d.state.into(),
            created_at: d.created_at,
        }
    }
}

impl From<DeviceRecord> for Device {
    fn from(r: DeviceRecord) -> Self {
        Self {
            id: r.id,
            parent_id: r.parent_id,
            block_ref: BlockRef::new(r.pool, r.image),
            size_bytes: r.size_bytes,
            numeric_id: r.numeric_id,
            mount_path: r.mount_path,
            mount_count: r.mount_count,
            device_path: r.device_path,
            formatted: r.formatted,
            frozen_formatted: r.frozen_formatted,
            state: DeviceState::from(r.state),
            created_at: r.created_at,
        }
    }
}

// ── MetadataStore ─────────────────────────────────────────────────────────────

/// Durable record of every known device, backed by Redb.
pub struct MetadataStore {
    db: Database,
    path: PathBuf,
}

impl MetadataStore {
    /// Open the store at `path`, creating it only when `create` is set.
    pub fn open(path: impl AsRef<Path>, create: bool) -> RbdResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            if !create {
                return Err(RbdError::NotInitialized(path.to_path_buf()));
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| RbdError::io("create metadata dir", parent.display(), e))?;
            }
        }

        let db = Database::create(path)?;

        // Create all tables eagerly so later read txns don't fail
        let wtx = db.begin_write()?;
        {
            let _t = wtx.open_table(DEVICES)?;
            let _t = wtx.open_table(COUNTERS)?;
        }
        wtx.commit()?;

        debug!("Opened metadata store at {:?}", path);
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Location of the database file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every persisted device record.
    ///
    /// Records that fail to decode are logged and skipped.
    pub fn load(&self) -> RbdResult<HashMap<String, Device>> {
        let rtx = self.db.begin_read()?;
        let table = rtx.open_table(DEVICES)?;
        let mut devices = HashMap::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match serde_json::from_str::<DeviceRecord>(value.value()) {
                Ok(rec) => {
                    devices.insert(rec.id.clone(), Device::from(rec));
                }
                Err(e) => error!("Failed to decode device record '{}': {}", key.value(), e),
            }
        }
        Ok(devices)
    }

    /// Persist a device record. Call after every mutation.
    pub fn save(&self, device: &Device) -> RbdResult<()> {
        let json = serde_json::to_string(&DeviceRecord::from(device))?;
        let wtx = self.db.begin_write()?;
        wtx.open_table(DEVICES)?
            .insert(device.id.as_str(), json.as_str())?;
        wtx.commit()?;
        Ok(())
    }

    /// Assign the next numeric id to `device` and persist it in the same
    /// transaction. Numeric ids are never handed out twice.
    pub fn insert_new(&self, device: &mut Device) -> RbdResult<()> {
        let wtx = self.db.begin_write()?;
        {
            let mut counters = wtx.open_table(COUNTERS)?;
            let next = counters
                .get(NEXT_DEVICE_ID)?
                .map(|v| v.value())
                .unwrap_or(1);
            let after = next
                .checked_add(1)
                .ok_or_else(|| RbdError::Metadata("device id space exhausted".to_string()))?;
            counters.insert(NEXT_DEVICE_ID, after)?;
            device.numeric_id = next;

            let json = serde_json::to_string(&DeviceRecord::from(&*device))?;
            wtx.open_table(DEVICES)?
                .insert(device.id.as_str(), json.as_str())?;
        }
        wtx.commit()?;
        Ok(())
    }

    /// Remove a device record.
    pub fn remove(&self, id: &str) -> RbdResult<()> {
        let wtx = self.db.begin_write()?;
        wtx.open_table(DEVICES)?.remove(id)?;
        wtx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn device(id: &str, parent: Option<&str>) -> Device {
        Device::new(
            id.to_string(),
            parent.map(str::to_string),
            BlockRef::new("rbd", format!("layer_{id}")),
            4096,
        )
    }

    #[test]
    fn test_open_requires_init() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metadata").join("devices.redb");

        let result = MetadataStore::open(&path, false);
        assert!(matches!(result, Err(RbdError::NotInitialized(_))));

        let store = MetadataStore::open(&path, true).unwrap();
        assert!(store.load().unwrap().is_empty());
        drop(store);

        // Existing store opens without init
        MetadataStore::open(&path, false).unwrap();
    }

    #[test]
    fn test_numeric_ids_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("devices.redb");

        {
            let store = MetadataStore::open(&path, true).unwrap();
            let mut a = device("a", None);
            let mut b = device("b", Some("a"));
            store.insert_new(&mut a).unwrap();
            store.insert_new(&mut b).unwrap();
            assert_eq!(a.numeric_id, 1);
            assert_eq!(b.numeric_id, 2);
            store.remove("b").unwrap();
        }

        let store = MetadataStore::open(&path, false).unwrap();
        let mut c = device("c", None);
        store.insert_new(&mut c).unwrap();
        // Removed ids are not handed out again
        assert_eq!(c.numeric_id, 3);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains_key("a"));
        assert!(!loaded.contains_key("b"));
    }

    #[test]
    fn test_save_overwrites_record() {
        let dir = tempdir().unwrap();
        let store = MetadataStore::open(dir.path().join("devices.redb"), true).unwrap();

        let mut dev = device("a", None);
        store.insert_new(&mut dev).unwrap();

        dev.state = DeviceState::Ready;
        dev.formatted = true;
        dev.mount_path = Some(PathBuf::from("/mnt/a"));
        dev.mount_count = 1;
        store.save(&dev).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.get("a"), Some(&dev));
    }
}
