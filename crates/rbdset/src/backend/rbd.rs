//! Ceph RBD backend driven through the `rbd` command-line tool

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;
use tracing::{debug, info};

use super::BlockBackend;
use crate::config::RbdConfig;
use crate::error::{RbdError, RbdResult};

const RBD_BIN: &str = "rbd";

const MIB: u64 = 1024 * 1024;

/// Substrings of `rbd` stderr that indicate the cluster could not be reached
const UNREACHABLE_MARKERS: &[&str] = &[
    "timed out",
    "connection refused",
    "error connecting to the cluster",
    "no route to host",
];

const NOT_FOUND_MARKER: &str = "no such file or directory";

#[derive(Debug, Deserialize)]
struct ImageInfo {
    size: u64,
}

#[derive(Debug, Deserialize)]
struct SnapshotInfo {
    name: String,
    #[serde(default)]
    protected: ProtectedFlag,
}

/// `protected` as printed by `rbd snap ls --format json`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ProtectedFlag {
    /// Most releases print `"true"` / `"false"`
    Text(String),
    Bool(bool),
}

impl Default for ProtectedFlag {
    fn default() -> Self {
        Self::Bool(false)
    }
}

impl ProtectedFlag {
    fn is_set(&self) -> bool {
        match self {
            Self::Text(text) => text.eq_ignore_ascii_case("true"),
            Self::Bool(flag) => *flag,
        }
    }
}

/// Child entry as printed by `rbd children --format json`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ChildEntry {
    /// Older releases print `pool/image` strings
    Spec(String),
    /// Newer releases print objects
    Object { image: String },
}

impl ChildEntry {
    fn image(self) -> String {
        match self {
            Self::Spec(spec) => spec
                .rsplit_once('/')
                .map_or(spec.clone(), |(_, image)| image.to_string()),
            Self::Object { image } => image,
        }
    }
}

/// Connection parameters for one pool, applied to every `rbd` invocation
pub struct RbdCliBackend {
    pool: String,
    user: String,
    conf: Option<PathBuf>,
    closed: AtomicBool,
}

impl RbdCliBackend {
    /// Connect to the pool described by `config`
    pub fn new(config: &RbdConfig) -> RbdResult<Self> {
        let backend = Self {
            pool: config.pool.clone(),
            user: config.user.clone(),
            conf: config.ceph_conf.clone(),
            closed: AtomicBool::new(false),
        };
        info!(
            "Using rbd pool {} as client.{}{}",
            backend.pool,
            backend.user,
            backend
                .conf
                .as_ref()
                .map(|c| format!(" ({})", c.display()))
                .unwrap_or_default()
        );
        Ok(backend)
    }

    fn spec(&self, image: &str) -> String {
        format!("{}/{}", self.pool, image)
    }

    fn snap_spec(&self, image: &str, snapshot: &str) -> String {
        format!("{}/{}@{}", self.pool, image, snapshot)
    }

    fn run(&self, op: &'static str, target: &str, args: &[&str]) -> RbdResult<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RbdError::BackendUnavailable {
                op,
                target: target.to_string(),
                transient: false,
                reason: "connection closed".to_string(),
            });
        }

        let mut cmd = Command::new(RBD_BIN);
        cmd.arg("--id").arg(&self.user);
        if let Some(conf) = &self.conf {
            cmd.arg("--conf").arg(conf);
        }
        cmd.args(args);
        debug!("Running {:?}", cmd);

        let output = cmd.output().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RbdError::BackendUnavailable {
                    op,
                    target: target.to_string(),
                    transient: false,
                    reason: format!("{RBD_BIN} tool not found"),
                }
            } else {
                RbdError::io(op, target, e)
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(op, target, stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn classify_failure(op: &'static str, target: &str, stderr: &str) -> RbdError {
    let lower = stderr.to_ascii_lowercase();
    if UNREACHABLE_MARKERS.iter().any(|m| lower.contains(m)) {
        RbdError::BackendUnavailable {
            op,
            target: target.to_string(),
            transient: true,
            reason: stderr.to_string(),
        }
    } else {
        RbdError::backend(op, target, stderr)
    }
}

fn is_not_found(err: &RbdError) -> bool {
    matches!(err, RbdError::Backend { reason, .. } if reason.to_ascii_lowercase().contains(NOT_FOUND_MARKER))
}

/// `rbd create --size` takes MiB; round up so the image is never smaller
/// than requested.
fn size_in_mib(size_bytes: u64) -> u64 {
    size_bytes.div_ceil(MIB).max(1)
}

fn parse_json<T: serde::de::DeserializeOwned>(
    op: &'static str,
    target: &str,
    out: &str,
) -> RbdResult<T> {
    // `rbd ls` prints nothing at all for an empty pool
    let out = if out.trim().is_empty() { "[]" } else { out };
    serde_json::from_str(out)
        .map_err(|e| RbdError::backend(op, target, format!("unparseable output: {e}")))
}

impl BlockBackend for RbdCliBackend {
    fn name(&self) -> &'static str {
        "rbd"
    }

    fn list_images(&self) -> RbdResult<Vec<String>> {
        let out = self.run("ls", &self.pool, &["ls", "--pool", &self.pool, "--format", "json"])?;
        parse_json("ls", &self.pool, &out)
    }

    fn image_exists(&self, image: &str) -> RbdResult<bool> {
        let spec = self.spec(image);
        match self.run("info", &spec, &["info", &spec, "--format", "json"]) {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn image_size(&self, image: &str) -> RbdResult<u64> {
        let spec = self.spec(image);
        let out = self.run("info", &spec, &["info", &spec, "--format", "json"])?;
        let info: ImageInfo = parse_json("info", &spec, &out)?;
        Ok(info.size)
    }

    fn create_image(&self, image: &str, size_bytes: u64) -> RbdResult<()> {
        let spec = self.spec(image);
        let size = size_in_mib(size_bytes).to_string();
        self.run("create", &spec, &["create", "--size", &size, &spec])?;
        Ok(())
    }

    fn snapshot_exists(&self, image: &str, snapshot: &str) -> RbdResult<bool> {
        let spec = self.spec(image);
        let out = self.run("snap ls", &spec, &["snap", "ls", &spec, "--format", "json"])?;
        let snaps: Vec<SnapshotInfo> = parse_json("snap ls", &spec, &out)?;
        Ok(snaps.iter().any(|s| s.name == snapshot))
    }

    fn snapshot_protected(&self, image: &str, snapshot: &str) -> RbdResult<bool> {
        let spec = self.spec(image);
        let out = self.run("snap ls", &spec, &["snap", "ls", &spec, "--format", "json"])?;
        let snaps: Vec<SnapshotInfo> = parse_json("snap ls", &spec, &out)?;
        snaps
            .iter()
            .find(|s| s.name == snapshot)
            .map(|s| s.protected.is_set())
            .ok_or_else(|| {
                RbdError::backend("snap ls", &self.snap_spec(image, snapshot), "snapshot not found")
            })
    }

    fn create_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()> {
        let spec = self.snap_spec(image, snapshot);
        self.run("snap create", &spec, &["snap", "create", &spec])?;
        Ok(())
    }

    fn protect_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()> {
        let spec = self.snap_spec(image, snapshot);
        self.run("snap protect", &spec, &["snap", "protect", &spec])?;
        Ok(())
    }

    fn unprotect_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()> {
        let spec = self.snap_spec(image, snapshot);
        self.run("snap unprotect", &spec, &["snap", "unprotect", &spec])?;
        Ok(())
    }

    fn remove_snapshot(&self, image: &str, snapshot: &str) -> RbdResult<()> {
        let spec = self.snap_spec(image, snapshot);
        self.run("snap rm", &spec, &["snap", "rm", &spec])?;
        Ok(())
    }

    fn clone_image(&self, image: &str, snapshot: &str, child: &str) -> RbdResult<()> {
        let parent = self.snap_spec(image, snapshot);
        let child = self.spec(child);
        self.run("clone", &child, &["clone", &parent, &child])?;
        Ok(())
    }

    fn children(&self, image: &str, snapshot: &str) -> RbdResult<Vec<String>> {
        let spec = self.snap_spec(image, snapshot);
        let out = self.run("children", &spec, &["children", &spec, "--format", "json"])?;
        let entries: Vec<ChildEntry> = parse_json("children", &spec, &out)?;
        Ok(entries.into_iter().map(ChildEntry::image).collect())
    }

    fn remove_image(&self, image: &str) -> RbdResult<()> {
        let spec = self.spec(image);
        self.run("rm", &spec, &["rm", "--no-progress", &spec])?;
        Ok(())
    }

    fn map(&self, image: &str) -> RbdResult<PathBuf> {
        let spec = self.spec(image);
        let out = self.run("map", &spec, &["map", &spec])?;
        let device = out.trim();
        if device.is_empty() {
            return Err(RbdError::backend("map", &spec, "no device path reported"));
        }
        Ok(PathBuf::from(device))
    }

    fn unmap(&self, device: &Path) -> RbdResult<()> {
        let target = device.display().to_string();
        self.run("unmap", &target, &["unmap", &target])?;
        Ok(())
    }

    fn close(&self) -> RbdResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        info!("Closed rbd pool {}", self.pool);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_in_mib_rounds_up() {
        assert_eq!(size_in_mib(0), 1);
        assert_eq!(size_in_mib(1), 1);
        assert_eq!(size_in_mib(MIB), 1);
        assert_eq!(size_in_mib(MIB + 1), 2);
        assert_eq!(size_in_mib(10 * 1024 * MIB), 10 * 1024);
    }

    #[test]
    fn test_classify_failure() {
        let err = classify_failure("create", "rbd/x", "rbd: error connecting to the cluster");
        assert!(err.is_transient());

        let err = classify_failure(
            "info",
            "rbd/x",
            "rbd: error opening image x: (2) No such file or directory",
        );
        assert!(is_not_found(&err));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_children_both_formats() {
        let old: Vec<ChildEntry> =
            parse_json("children", "t", r#"["rbd/layer_a", "rbd/layer_b"]"#).unwrap();
        let new: Vec<ChildEntry> = parse_json(
            "children",
            "t",
            r#"[{"pool":"rbd","pool_namespace":"","image":"layer_a"}]"#,
        )
        .unwrap();

        let old: Vec<String> = old.into_iter().map(ChildEntry::image).collect();
        let new: Vec<String> = new.into_iter().map(ChildEntry::image).collect();
        assert_eq!(old, vec!["layer_a".to_string(), "layer_b".to_string()]);
        assert_eq!(new, vec!["layer_a".to_string()]);
    }

    #[test]
    fn test_parse_snapshot_protection() {
        let snaps: Vec<SnapshotInfo> = parse_json(
            "snap ls",
            "rbd/x",
            r#"[{"id":4,"name":"frozen","size":1024,"protected":"true","timestamp":"x"},
                {"id":5,"name":"other","size":1024,"protected":"false"},
                {"id":6,"name":"bare","size":1024}]"#,
        )
        .unwrap();
        let flags: Vec<bool> = snaps.iter().map(|s| s.protected.is_set()).collect();
        assert_eq!(flags, vec![true, false, false]);
    }

    #[test]
    fn test_parse_empty_listing() {
        let images: Vec<String> = parse_json("ls", "rbd", "").unwrap();
        assert!(images.is_empty());

        let info: ImageInfo =
            parse_json("info", "rbd/x", r#"{"name":"x","size":10737418240,"objects":2560}"#)
                .unwrap();
        assert_eq!(info.size, 10 * 1024 * 1024 * 1024);
    }
}
