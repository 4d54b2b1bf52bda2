#![allow(clippy::result_large_err)]
//! RBD layer store
//!
//! Stores container image and container layers as block devices in a Ceph
//! RBD pool. A base layer is a freshly provisioned image; every other layer
//! is a copy-on-write clone of its parent, so creating a layer costs a
//! snapshot and a clone instead of a copy.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RbdDriver     │  (engine graph-driver calls)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │     RbdSet      │
//! │  - Registry     │──── MetadataStore (redb)
//! │  - PoolAllocator│
//! │  - MountManager │──── Mounter (mount(2) / mkfs)
//! └────────┬────────┘
//!          │
//! ┌────────▼────────┐
//! │  BlockBackend   │  (rbd CLI, or in-memory)
//! └─────────────────┘
//! ```

pub mod backend;
pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod locks;
pub mod mount;
pub mod pool;
pub mod registry;
pub mod set;
pub mod store;

pub use backend::{BlockBackend, MemoryBackend, MemoryCluster, RbdCliBackend};
pub use config::{BackendKind, Filesystem, MountPolicy, RbdConfig, SizeRequest, parse_size};
pub use device::{BlockRef, Device, DeviceMetadata, DeviceState};
pub use driver::{DRIVER_NAME, RbdDriver};
pub use error::{RbdError, RbdResult};
pub use mount::{HostMounter, MemoryMounter, MountManager, Mounter};
pub use pool::{FROZEN_SNAPSHOT, PoolAllocator};
pub use set::{ReconcileReport, RbdSet, SetStatus};
