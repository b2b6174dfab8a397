//! On-disk layout of VM snapshots.
//!
//! Each snapshot is two artifacts under a per-instance directory:
//!
//! ```text
//! <snapshot_root>/<instance_id>/<snapshot_id>.vmstate
//! <snapshot_root>/<instance_id>/<snapshot_id>.mem
//! ```

use crate::error::{Result, VmError};
use std::path::{Path, PathBuf};

/// Artifact paths for one `(instance, snapshot)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPaths {
    /// VM device/CPU state file.
    pub state: PathBuf,
    /// Guest memory image.
    pub memory: PathBuf,
}

impl SnapshotPaths {
    /// Compute the artifact paths. Fails on IDs that could escape the directory.
    pub fn new(snapshot_root: &Path, instance_id: &str, snapshot_id: &str) -> Result<Self> {
        validate_id("instance", instance_id)?;
        validate_id("snapshot", snapshot_id)?;
        let dir = instance_dir(snapshot_root, instance_id);
        Ok(Self {
            state: dir.join(format!("{snapshot_id}.vmstate")),
            memory: dir.join(format!("{snapshot_id}.mem")),
        })
    }

    /// Create the parent directory.
    pub async fn prepare(&self) -> Result<()> {
        if let Some(parent) = self.state.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Confirm both artifacts exist and are non-empty.
    pub async fn verify(&self) -> Result<()> {
        for path in [&self.state, &self.memory] {
            match tokio::fs::metadata(path).await {
                Ok(meta) if meta.len() > 0 => {}
                Ok(_) => {
                    return Err(VmError::Artifact {
                        path: path.clone(),
                        reason: "empty".into(),
                    })
                }
                Err(e) => {
                    return Err(VmError::Artifact {
                        path: path.clone(),
                        reason: format!("missing ({e})"),
                    })
                }
            }
        }
        Ok(())
    }

    /// Remove both artifacts. Missing files are not an error.
    pub async fn remove(&self) -> Result<()> {
        for path in [&self.state, &self.memory] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Directory holding every snapshot of one instance.
pub fn instance_dir(snapshot_root: &Path, instance_id: &str) -> PathBuf {
    snapshot_root.join(instance_id)
}

fn validate_id(kind: &'static str, id: &str) -> Result<()> {
    let unsafe_component =
        id.is_empty() || id == "." || id.contains("..") || id.contains(['/', '\\', '\0']);
    if unsafe_component {
        return Err(VmError::InvalidId {
            kind,
            id: id.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = SnapshotPaths::new(Path::new("/var/snap"), "vm-1", "node-7").unwrap();
        assert_eq!(paths.state, PathBuf::from("/var/snap/vm-1/node-7.vmstate"));
        assert_eq!(paths.memory, PathBuf::from("/var/snap/vm-1/node-7.mem"));
    }

    #[test]
    fn test_rejects_traversal() {
        assert!(SnapshotPaths::new(Path::new("/s"), "vm-1", "../etc").is_err());
        assert!(SnapshotPaths::new(Path::new("/s"), "vm-1", "a/b").is_err());
        assert!(SnapshotPaths::new(Path::new("/s"), "", "a").is_err());
        assert!(SnapshotPaths::new(Path::new("/s"), "vm-1", "").is_err());
    }

    #[tokio::test]
    async fn test_verify_requires_both_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SnapshotPaths::new(dir.path(), "vm-1", "s1").unwrap();
        paths.prepare().await.unwrap();

        tokio::fs::write(&paths.state, b"state").await.unwrap();
        assert!(paths.verify().await.is_err());

        tokio::fs::write(&paths.memory, b"").await.unwrap();
        assert!(paths.verify().await.is_err());

        tokio::fs::write(&paths.memory, b"memory").await.unwrap();
        assert!(paths.verify().await.is_ok());

        paths.remove().await.unwrap();
        assert!(!paths.state.exists());
        assert!(!paths.memory.exists());
        // Removing again is fine
        paths.remove().await.unwrap();
    }
}
