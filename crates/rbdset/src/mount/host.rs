//! Host mounts through `mount(2)` and `mkfs`

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use tracing::{debug, warn};

use super::Mounter;
use crate::config::Filesystem;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Mounts on the local host
#[derive(Debug, Default)]
pub struct HostMounter;

impl HostMounter {
    pub fn new() -> Self {
        Self
    }
}

/// Decode the octal escapes (`\040` for space) used in mountinfo paths
fn unescape_mount_path(raw: &str) -> PathBuf {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits.iter().fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(String::from_utf8_lossy(&out).into_owned())
}

/// Mount points listed in mountinfo content
fn mount_points(mountinfo: &str) -> impl Iterator<Item = PathBuf> + '_ {
    mountinfo
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(unescape_mount_path)
}

impl Mounter for HostMounter {
    fn make_filesystem(&self, device: &Path, fs: Filesystem, args: &[String]) -> io::Result<()> {
        let program = format!("mkfs.{}", fs.as_str());
        let output = Command::new(&program)
            .arg("-q")
            .args(args)
            .arg(device)
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "{program} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        debug!("Built {} on {:?}", fs.as_str(), device);
        Ok(())
    }

    fn mount(&self, device: &Path, target: &Path, fs: Filesystem, data: &str) -> io::Result<()> {
        let data = (!data.is_empty()).then_some(data);
        mount(Some(device), target, Some(fs.as_str()), MsFlags::empty(), data)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> io::Result<()> {
        match umount2(target, MntFlags::empty()) {
            Ok(()) => Ok(()),
            // Not a mount point, or already gone
            Err(Errno::EINVAL | Errno::ENOENT) => {
                debug!("{:?} was not mounted", target);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn is_mounted(&self, target: &Path) -> io::Result<bool> {
        let target = match fs::canonicalize(target) {
            Ok(path) => path,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        let content = fs::read_to_string(MOUNTINFO).inspect_err(|e| {
            warn!("Failed to read {}: {}", MOUNTINFO, e);
        })?;
        Ok(mount_points(&content).any(|point| point == target))
    }
}
