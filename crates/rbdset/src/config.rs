//! Configuration for the layer store
//!
//! The container engine hands storage options over as `key=value` strings
//! (`rbd.basesize=20G`). They are parsed exactly once into [`RbdConfig`];
//! unknown keys are rejected instead of being ignored.

use crate::error::{RbdError, RbdResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Prefix accepted in front of every option key.
const OPTION_PREFIX: &str = "rbd.";

/// Default base layer size: 10 GiB
pub const DEFAULT_BASE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Which block-storage backend to connect to
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Ceph cluster driven through the `rbd` tool
    #[default]
    Rbd,
    /// In-process cluster (development and tests)
    Memory,
}

/// Filesystem built on fresh base layers
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Filesystem {
    #[default]
    Ext4,
    Xfs,
}

impl Filesystem {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
        }
    }
}

/// How repeated mounts of the same device are counted
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountPolicy {
    /// Boolean mounted flag; remounting at the same path is a no-op and a
    /// single unmount releases the device.
    #[default]
    Exclusive,
    /// Nested mount/unmount pairs; the device is released when the last
    /// holder unmounts.
    RefCounted,
}

/// Requested size of a fresh base layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SizeRequest {
    /// Use the configured base size
    Default,
    /// Exact size in bytes
    Exact(u64),
}

impl From<u64> for SizeRequest {
    fn from(size: u64) -> Self {
        if size == 0 {
            Self::Default
        } else {
            Self::Exact(size)
        }
    }
}

/// Layer store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RbdConfig {
    /// Backend to connect to
    pub backend: BackendKind,
    /// Storage pool holding layer images
    pub pool: String,
    /// Prefix of every image name created by this store
    pub image_prefix: String,
    /// Size of base layers when none is requested
    pub base_size: u64,
    /// Filesystem for base layers
    pub filesystem: Filesystem,
    /// Extra arguments passed to `mkfs`
    pub mkfs_args: Vec<String>,
    /// Mount data passed on every mount (comma separated)
    pub mount_options: String,
    /// Ceph configuration file
    pub ceph_conf: Option<PathBuf>,
    /// Ceph client user (without the `client.` prefix)
    pub user: String,
    /// Mount reference policy
    pub mount_policy: MountPolicy,
    /// Attempts for read-only backend queries during startup reconciliation
    pub reconcile_attempts: u32,
}

impl Default for RbdConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Rbd,
            pool: "rbd".to_string(),
            image_prefix: "layer".to_string(),
            base_size: DEFAULT_BASE_SIZE,
            filesystem: Filesystem::Ext4,
            mkfs_args: Vec::new(),
            mount_options: String::new(),
            ceph_conf: None,
            user: "admin".to_string(),
            mount_policy: MountPolicy::Exclusive,
            reconcile_attempts: 3,
        }
    }
}

impl RbdConfig {
    /// Parse engine storage options on top of the defaults.
    pub fn from_options<S: AsRef<str>>(options: &[S]) -> RbdResult<Self> {
        let mut config = Self::default();
        for option in options {
            config.apply(option.as_ref())?;
        }
        config.validate()?;
        Ok(config)
    }

    fn apply(&mut self, option: &str) -> RbdResult<()> {
        let (key, value) = option
            .split_once('=')
            .ok_or_else(|| RbdError::InvalidConfig(format!("expected key=value, got '{option}'")))?;
        let key = key.trim().to_ascii_lowercase();
        let key = key.strip_prefix(OPTION_PREFIX).unwrap_or(key.as_str());
        let value = value.trim();

        match key {
            "backend" => {
                self.backend = match value {
                    "rbd" => BackendKind::Rbd,
                    "memory" => BackendKind::Memory,
                    other => return Err(invalid_value(key, other)),
                }
            }
            "pool" => self.pool = value.to_string(),
            "imageprefix" => self.image_prefix = value.to_string(),
            "basesize" => self.base_size = parse_size(value)?,
            "fs" => {
                self.filesystem = match value {
                    "ext4" => Filesystem::Ext4,
                    "xfs" => Filesystem::Xfs,
                    other => return Err(invalid_value(key, other)),
                }
            }
            "mkfsarg" => self.mkfs_args.push(value.to_string()),
            "mountopt" => {
                if self.mount_options.is_empty() {
                    self.mount_options = value.to_string();
                } else {
                    self.mount_options = format!("{},{value}", self.mount_options);
                }
            }
            "conf" => self.ceph_conf = Some(PathBuf::from(value)),
            "user" => self.user = value.to_string(),
            "mountpolicy" => {
                self.mount_policy = match value {
                    "exclusive" => MountPolicy::Exclusive,
                    "refcounted" => MountPolicy::RefCounted,
                    other => return Err(invalid_value(key, other)),
                }
            }
            "reconcileattempts" => {
                self.reconcile_attempts = value
                    .parse()
                    .map_err(|_| invalid_value(key, value))?;
            }
            _ => {
                return Err(RbdError::InvalidConfig(format!(
                    "unknown option '{option}'"
                )));
            }
        }
        Ok(())
    }

    fn validate(&self) -> RbdResult<()> {
        if self.pool.is_empty() {
            return Err(RbdError::InvalidConfig("pool must not be empty".to_string()));
        }
        if self.image_prefix.is_empty() || self.image_prefix.contains(['/', '@']) {
            return Err(RbdError::InvalidConfig(format!(
                "invalid image prefix '{}'",
                self.image_prefix
            )));
        }
        if self.base_size == 0 {
            return Err(RbdError::InvalidConfig("base size must be positive".to_string()));
        }
        if self.reconcile_attempts == 0 {
            return Err(RbdError::InvalidConfig(
                "reconcile attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn invalid_value(key: &str, value: &str) -> RbdError {
    RbdError::InvalidConfig(format!("invalid value '{value}' for option '{key}'"))
}

/// Parse a human-readable size string (e.g. "10G", "1T", "500M") into bytes.
pub fn parse_size(s: &str) -> RbdResult<u64> {
    let s = s.trim();
    let upper = s.to_ascii_uppercase();
    let trimmed = upper.strip_suffix('B').unwrap_or(upper.as_str());
    let (num, multiplier) = if let Some(n) = trimmed.strip_suffix('T') {
        (n, 1024 * 1024 * 1024 * 1024)
    } else if let Some(n) = trimmed.strip_suffix('G') {
        (n, 1024 * 1024 * 1024)
    } else if let Some(n) = trimmed.strip_suffix('M') {
        (n, 1024 * 1024)
    } else if let Some(n) = trimmed.strip_suffix('K') {
        (n, 1024)
    } else {
        // Assume bytes if no suffix
        (trimmed, 1)
    };
    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| RbdError::InvalidConfig(format!("invalid size: '{s}'")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| RbdError::InvalidConfig(format!("size overflows: '{s}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RbdConfig::from_options::<&str>(&[]).unwrap();
        assert_eq!(config.backend, BackendKind::Rbd);
        assert_eq!(config.pool, "rbd");
        assert_eq!(config.base_size, DEFAULT_BASE_SIZE);
        assert_eq!(config.mount_policy, MountPolicy::Exclusive);
    }

    #[test]
    fn test_parse_options() {
        let config = RbdConfig::from_options(&[
            "rbd.pool=layers",
            "rbd.basesize=20G",
            "rbd.fs=xfs",
            "rbd.mkfsarg=-K",
            "rbd.mountopt=noatime",
            "rbd.mountopt=nouuid",
            "rbd.backend=memory",
            "mountpolicy=refcounted",
        ])
        .unwrap();
        assert_eq!(config.pool, "layers");
        assert_eq!(config.base_size, 20 * 1024 * 1024 * 1024);
        assert_eq!(config.filesystem, Filesystem::Xfs);
        assert_eq!(config.mkfs_args, vec!["-K".to_string()]);
        assert_eq!(config.mount_options, "noatime,nouuid");
        assert_eq!(config.backend, BackendKind::Memory);
        assert_eq!(config.mount_policy, MountPolicy::RefCounted);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let result = RbdConfig::from_options(&["rbd.thinpooldev=foo"]);
        assert!(matches!(result, Err(RbdError::InvalidConfig(_))));
    }

    #[test]
    fn test_bad_values_rejected() {
        assert!(RbdConfig::from_options(&["rbd.fs=btrfs"]).is_err());
        assert!(RbdConfig::from_options(&["rbd.basesize=lots"]).is_err());
        assert!(RbdConfig::from_options(&["rbd.basesize=0"]).is_err());
        assert!(RbdConfig::from_options(&["rbd.imageprefix=a/b"]).is_err());
        assert!(RbdConfig::from_options(&["rbd.pool"]).is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("4k").unwrap(), 4096);
        assert_eq!(parse_size("500M").unwrap(), 500 * 1024 * 1024);
        assert_eq!(parse_size("10GB").unwrap(), 10 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1T").unwrap(), 1024 * 1024 * 1024 * 1024);
        assert!(parse_size("99999999999T").is_err());
    }
}
