// File: src/vfs.rs
//
// Docker-style virtual filesystem for the Ember VM. Script-visible paths
// are virtual; mounts map a virtual prefix to a host prefix with a
// read-only or read-write mode. Resolution rejects `..` segments
// outright and re-checks the canonical host path against the mount's
// host prefix, so neither lexical traversal nor symlinks can escape.

use crate::errors::EmberError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone)]
pub struct Mount {
    pub virtual_prefix: String,
    pub host_prefix: PathBuf,
    pub mode: MountMode,
}

/// Per-VM mount table. Not shared between VMs.
#[derive(Debug, Clone, Default)]
pub struct Vfs {
    mounts: Vec<Mount>,
}

impl Vfs {
    pub fn new() -> Self {
        Self { mounts: Vec::new() }
    }

    /// Default mounts: `/app` -> current working directory and
    /// `/tmp` -> the system temp directory, both read-write.
    pub fn with_defaults() -> Self {
        let mut vfs = Self::new();
        if let Ok(cwd) = std::env::current_dir() {
            let _ = vfs.mount("/app", cwd, MountMode::ReadWrite);
        }
        let _ = vfs.mount("/tmp", std::env::temp_dir(), MountMode::ReadWrite);
        vfs
    }

    /// Add a mount. The virtual prefix must be absolute and clean; a
    /// later mount with the same prefix replaces the earlier one.
    pub fn mount(
        &mut self,
        virtual_prefix: &str,
        host_prefix: impl Into<PathBuf>,
        mode: MountMode,
    ) -> Result<(), EmberError> {
        let segments = canonical_segments(virtual_prefix)?;
        let normalized = format!("/{}", segments.join("/"));
        let host_prefix = host_prefix.into();
        self.mounts.retain(|m| m.virtual_prefix != normalized);
        self.mounts.push(Mount { virtual_prefix: normalized, host_prefix, mode });
        Ok(())
    }

    /// Parse a `MOUNTS`-style spec: `v1:h1,v2:h2:ro,...`
    pub fn apply_mount_spec(&mut self, spec: &str) -> Result<(), EmberError> {
        for entry in spec.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            self.apply_mount_entry(entry)?;
        }
        Ok(())
    }

    /// Parse a single `virtual:host[:ro|:rw]` entry (the `--mount` flag)
    pub fn apply_mount_entry(&mut self, entry: &str) -> Result<(), EmberError> {
        let parts: Vec<&str> = entry.split(':').collect();
        let (virtual_prefix, host, mode) = match parts.as_slice() {
            [v, h] => (*v, *h, MountMode::ReadWrite),
            [v, h, "ro"] => (*v, *h, MountMode::ReadOnly),
            [v, h, "rw"] => (*v, *h, MountMode::ReadWrite),
            _ => {
                return Err(EmberError::security(format!(
                    "Invalid mount specification '{}'",
                    entry
                )))
            }
        };
        self.mount(virtual_prefix, host, mode)
    }

    pub fn mounts(&self) -> &[Mount] {
        &self.mounts
    }

    /// Resolve a virtual path to a host path, enforcing the mount mode.
    pub fn resolve(&self, virtual_path: &str, write: bool) -> Result<PathBuf, EmberError> {
        let segments = canonical_segments(virtual_path)?;

        // Longest matching virtual prefix wins
        let mut best: Option<(&Mount, usize)> = None;
        for mount in &self.mounts {
            let mount_segments: Vec<&str> =
                mount.virtual_prefix.split('/').filter(|s| !s.is_empty()).collect();
            if mount_segments.len() <= segments.len()
                && mount_segments.iter().zip(segments.iter()).all(|(a, b)| a == b)
            {
                match best {
                    Some((_, n)) if n >= mount_segments.len() => {}
                    _ => best = Some((mount, mount_segments.len())),
                }
            }
        }
        let (mount, prefix_len) = best.ok_or_else(|| {
            EmberError::security(format!("No mount for path '{}'", virtual_path))
        })?;

        if write && mount.mode == MountMode::ReadOnly {
            return Err(EmberError::security(format!(
                "Write to read-only mount '{}'",
                mount.virtual_prefix
            )));
        }

        let mut host_path = mount.host_prefix.clone();
        for segment in &segments[prefix_len..] {
            host_path.push(segment);
        }

        // Symlink defense: the canonical form of the target (or of its
        // parent, for files being created) must stay under the canonical
        // mount prefix.
        let canonical_prefix = fs::canonicalize(&mount.host_prefix).map_err(|e| {
            EmberError::io(format!(
                "Mount host path '{}' is not accessible: {}",
                mount.host_prefix.display(),
                e
            ))
        })?;
        let canonical_target = canonicalize_allowing_new(&host_path)?;
        if !canonical_target.starts_with(&canonical_prefix) {
            return Err(EmberError::security(format!(
                "Path '{}' escapes its mount",
                virtual_path
            )));
        }

        Ok(canonical_target)
    }

    pub fn read(&self, virtual_path: &str) -> Result<String, EmberError> {
        let host = self.resolve(virtual_path, false)?;
        fs::read_to_string(&host)
            .map_err(|e| EmberError::io(format!("Failed to read '{}': {}", virtual_path, e)))
    }

    pub fn write(&self, virtual_path: &str, data: &str, append: bool) -> Result<(), EmberError> {
        let host = self.resolve(virtual_path, true)?;
        let result = if append {
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&host)
                .and_then(|mut f| f.write_all(data.as_bytes()))
        } else {
            fs::write(&host, data)
        };
        result.map_err(|e| EmberError::io(format!("Failed to write '{}': {}", virtual_path, e)))
    }

    pub fn exists(&self, virtual_path: &str) -> bool {
        self.resolve(virtual_path, false).map(|host| host.exists()).unwrap_or(false)
    }

    pub fn dir_exists(&self, virtual_path: &str) -> bool {
        self.resolve(virtual_path, false).map(|host| host.is_dir()).unwrap_or(false)
    }
}

/// Split a virtual path into clean segments. `.` segments collapse;
/// `..` segments are rejected outright rather than resolved.
fn canonical_segments(virtual_path: &str) -> Result<Vec<String>, EmberError> {
    if !virtual_path.starts_with('/') {
        return Err(EmberError::security(format!(
            "Virtual path '{}' must be absolute",
            virtual_path
        )));
    }
    let mut segments = Vec::new();
    for segment in virtual_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(EmberError::security(format!(
                    "Path traversal rejected in '{}'",
                    virtual_path
                )))
            }
            other => segments.push(other.to_string()),
        }
    }
    Ok(segments)
}

/// Canonicalize a host path that may not exist yet: an existing path
/// canonicalizes directly, otherwise the parent directory must exist and
/// the final component is appended to its canonical form.
fn canonicalize_allowing_new(path: &Path) -> Result<PathBuf, EmberError> {
    match fs::canonicalize(path) {
        Ok(canonical) => Ok(canonical),
        Err(_) => {
            let parent = path.parent().ok_or_else(|| {
                EmberError::io(format!("Path '{}' has no parent directory", path.display()))
            })?;
            let name = path.file_name().ok_or_else(|| {
                EmberError::io(format!("Path '{}' has no file name", path.display()))
            })?;
            let canonical_parent = fs::canonicalize(parent).map_err(|e| {
                EmberError::io(format!(
                    "Parent directory '{}' is not accessible: {}",
                    parent.display(),
                    e
                ))
            })?;
            Ok(canonical_parent.join(name))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn unique_temp_dir(prefix: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        let dir = std::env::temp_dir().join(format!(
            "ember_vfs_{}_{}_{}",
            prefix,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir_all(&dir).expect("failed to create temp dir");
        dir
    }

    #[test]
    fn test_resolve_within_mount() {
        let dir = unique_temp_dir("resolve");
        fs::write(dir.join("data.txt"), "hello").unwrap();
        let mut vfs = Vfs::new();
        vfs.mount("/app", &dir, MountMode::ReadWrite).unwrap();

        assert_eq!(vfs.read("/app/data.txt").unwrap(), "hello");
        assert!(vfs.exists("/app/data.txt"));
        assert!(!vfs.exists("/app/missing.txt"));
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_dot_dot_is_rejected() {
        let dir = unique_temp_dir("traversal");
        let mut vfs = Vfs::new();
        vfs.mount("/app", &dir, MountMode::ReadWrite).unwrap();

        let err = vfs.resolve("/app/../etc/passwd", true).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Security);
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_write_to_read_only_mount_is_security_error() {
        let dir = unique_temp_dir("readonly");
        let mut vfs = Vfs::new();
        vfs.mount("/data", &dir, MountMode::ReadOnly).unwrap();

        let err = vfs.write("/data/out.txt", "x", false).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Security);
        assert!(!dir.join("out.txt").exists());

        // Reading is still allowed
        fs::write(dir.join("in.txt"), "ok").unwrap();
        assert_eq!(vfs.read("/data/in.txt").unwrap(), "ok");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_no_mount_for_path() {
        let vfs = Vfs::new();
        let err = vfs.resolve("/nowhere/file", false).unwrap_err();
        assert_eq!(err.kind, crate::errors::ErrorKind::Security);
        assert!(err.message.contains("No mount"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let outer = unique_temp_dir("outer");
        let inner = unique_temp_dir("inner");
        fs::write(inner.join("f.txt"), "inner").unwrap();
        fs::write(outer.join("f.txt"), "outer").unwrap();

        let mut vfs = Vfs::new();
        vfs.mount("/app", &outer, MountMode::ReadWrite).unwrap();
        vfs.mount("/app/sub", &inner, MountMode::ReadWrite).unwrap();

        assert_eq!(vfs.read("/app/f.txt").unwrap(), "outer");
        assert_eq!(vfs.read("/app/sub/f.txt").unwrap(), "inner");
        fs::remove_dir_all(&outer).ok();
        fs::remove_dir_all(&inner).ok();
    }

    #[test]
    fn test_write_append_round_trip() {
        let dir = unique_temp_dir("write");
        let mut vfs = Vfs::new();
        vfs.mount("/app", &dir, MountMode::ReadWrite).unwrap();

        vfs.write("/app/log.txt", "a", false).unwrap();
        vfs.write("/app/log.txt", "b", true).unwrap();
        assert_eq!(vfs.read("/app/log.txt").unwrap(), "ab");
        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_symlink_escape_is_refused() {
        #[cfg(unix)]
        {
            let sandbox = unique_temp_dir("sandbox");
            let outside = unique_temp_dir("outside");
            fs::write(outside.join("secret.txt"), "secret").unwrap();
            std::os::unix::fs::symlink(&outside, sandbox.join("link")).unwrap();

            let mut vfs = Vfs::new();
            vfs.mount("/app", &sandbox, MountMode::ReadWrite).unwrap();

            let err = vfs.resolve("/app/link/secret.txt", false).unwrap_err();
            assert_eq!(err.kind, crate::errors::ErrorKind::Security);
            fs::remove_dir_all(&sandbox).ok();
            fs::remove_dir_all(&outside).ok();
        }
    }

    #[test]
    fn test_mount_spec_parsing() {
        let dir = unique_temp_dir("spec");
        let mut vfs = Vfs::new();
        vfs.apply_mount_spec(&format!("/a:{},/b:{}:ro", dir.display(), dir.display()))
            .unwrap();
        assert_eq!(vfs.mounts().len(), 2);
        assert_eq!(vfs.mounts()[1].mode, MountMode::ReadOnly);

        assert!(vfs.apply_mount_entry("garbage").is_err());
        fs::remove_dir_all(&dir).ok();
    }
}
