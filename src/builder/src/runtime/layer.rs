//! Layer creation and extraction for the directory-backed runtime.
//!
//! A layer is a gzip-compressed tar of the paths a step added or modified.
//! Deleted paths are recorded as `.wh.<name>` whiteout entries and removed
//! again when the layer is extracted.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use strata_core::error::{BuildError, Result};
use tar::Archive;

use crate::digest::sha256_file;

const WHITEOUT_PREFIX: &str = ".wh.";

/// Metadata for a single file in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    /// Relative path from rootfs root
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Modification time (nanoseconds since epoch)
    pub mtime: i128,
    /// Permission bits
    pub mode: u32,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// A snapshot of a directory's file state.
#[derive(Debug, Clone, Default)]
pub struct DirSnapshot {
    /// Map of relative path → file entry
    pub entries: HashMap<PathBuf, FileEntry>,
}

/// Paths that differ between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotDiff {
    /// Added or modified, sorted
    pub changed: Vec<PathBuf>,
    /// Present before but gone after, sorted
    pub removed: Vec<PathBuf>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty()
    }
}

impl DirSnapshot {
    /// Take a snapshot of a directory, recording all files and their metadata.
    pub fn capture(root: &Path) -> Result<Self> {
        let mut entries = HashMap::new();
        if root.exists() {
            walk_dir(root, root, &mut entries)?;
        }
        Ok(DirSnapshot { entries })
    }

    /// Compute the diff between this snapshot (before) and another (after).
    pub fn diff(&self, after: &DirSnapshot) -> SnapshotDiff {
        let mut changed = Vec::new();

        for (path, after_entry) in &after.entries {
            match self.entries.get(path) {
                None => changed.push(path.clone()),
                Some(before_entry) => {
                    if before_entry.size != after_entry.size
                        || before_entry.mtime != after_entry.mtime
                        || before_entry.mode != after_entry.mode
                        || before_entry.is_dir != after_entry.is_dir
                    {
                        changed.push(path.clone());
                    }
                }
            }
        }

        // Only the topmost removed path needs a whiteout
        let mut removed: Vec<PathBuf> = self
            .entries
            .keys()
            .filter(|path| !after.entries.contains_key(*path))
            .cloned()
            .collect();
        removed.sort();
        let mut topmost: Vec<PathBuf> = Vec::new();
        for path in removed {
            if !topmost.iter().any(|parent| path.starts_with(parent)) {
                topmost.push(path);
            }
        }

        changed.sort();
        SnapshotDiff {
            changed,
            removed: topmost,
        }
    }
}

/// Recursively walk a directory and collect file entries.
fn walk_dir(root: &Path, current: &Path, entries: &mut HashMap<PathBuf, FileEntry>) -> Result<()> {
    let read_dir = std::fs::read_dir(current).map_err(|e| {
        BuildError::Runtime(format!(
            "Failed to read directory {}: {}",
            current.display(),
            e
        ))
    })?;

    for entry in read_dir {
        let entry = entry
            .map_err(|e| BuildError::Runtime(format!("Failed to read directory entry: {}", e)))?;

        let path = entry.path();
        let relative = path
            .strip_prefix(root)
            .map_err(|e| {
                BuildError::Runtime(format!(
                    "Failed to compute relative path for {}: {}",
                    path.display(),
                    e
                ))
            })?
            .to_path_buf();

        let metadata = std::fs::symlink_metadata(&path).map_err(|e| {
            BuildError::Runtime(format!(
                "Failed to read metadata for {}: {}",
                path.display(),
                e
            ))
        })?;

        let mtime = metadata
            .modified()
            .map(|t| {
                t.duration_since(std::time::UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_nanos() as i128
            })
            .unwrap_or(0);

        entries.insert(
            relative.clone(),
            FileEntry {
                path: relative,
                size: metadata.len(),
                mtime,
                mode: mode_bits(&metadata),
                is_dir: metadata.is_dir(),
            },
        );

        if metadata.is_dir() {
            walk_dir(root, &path, entries)?;
        }
    }

    Ok(())
}

#[cfg(unix)]
fn mode_bits(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn mode_bits(_metadata: &std::fs::Metadata) -> u32 {
    0
}

/// Information about a created layer.
#[derive(Debug, Clone)]
pub struct LayerInfo {
    /// Path to the layer tar.gz file
    pub path: PathBuf,
    /// SHA256 digest (hex string, without "sha256:" prefix)
    pub digest: String,
    /// Size in bytes
    pub size: u64,
}

/// Create a tar.gz layer from a snapshot diff of a rootfs.
pub fn create_layer(rootfs: &Path, diff: &SnapshotDiff, output_path: &Path) -> Result<LayerInfo> {
    let file = File::create(output_path).map_err(|e| {
        BuildError::Runtime(format!(
            "Failed to create layer file {}: {}",
            output_path.display(),
            e
        ))
    })?;

    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for relative_path in &diff.changed {
        let full_path = rootfs.join(relative_path);
        let metadata = match std::fs::symlink_metadata(&full_path) {
            Ok(m) => m,
            Err(_) => continue,
        };

        let appended = if metadata.is_dir() {
            builder.append_dir(relative_path, &full_path)
        } else {
            builder.append_path_with_name(&full_path, relative_path)
        };
        appended.map_err(|e| {
            BuildError::Runtime(format!(
                "Failed to add {} to layer: {}",
                relative_path.display(),
                e
            ))
        })?;
    }

    for removed in &diff.removed {
        let name = removed
            .file_name()
            .map(|n| format!("{}{}", WHITEOUT_PREFIX, n.to_string_lossy()))
            .unwrap_or_default();
        let whiteout = removed.with_file_name(name);

        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &whiteout, std::io::empty())
            .map_err(|e| {
                BuildError::Runtime(format!(
                    "Failed to add whiteout for {} to layer: {}",
                    removed.display(),
                    e
                ))
            })?;
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| BuildError::Runtime(format!("Failed to finalize layer: {}", e)))?;
    encoder
        .finish()
        .map_err(|e| BuildError::Runtime(format!("Failed to finalize layer: {}", e)))?;

    let digest = sha256_file(output_path)?;
    let size = std::fs::metadata(output_path).map(|m| m.len()).unwrap_or(0);

    Ok(LayerInfo {
        path: output_path.to_path_buf(),
        digest,
        size,
    })
}

/// Create a tar.gz layer from an entire directory.
pub fn create_layer_from_dir(src_dir: &Path, output_path: &Path) -> Result<LayerInfo> {
    let snapshot = DirSnapshot::capture(src_dir)?;
    let diff = DirSnapshot::default().diff(&snapshot);
    create_layer(src_dir, &diff, output_path)
}

/// Extract a single layer (tar.gz) to target directory, applying whiteouts.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<()> {
    if !layer_path.exists() {
        return Err(BuildError::Runtime(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }

    std::fs::create_dir_all(target_dir).map_err(|e| {
        BuildError::Runtime(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let file = File::open(layer_path).map_err(|e| {
        BuildError::Runtime(format!(
            "Failed to open layer file {}: {}",
            layer_path.display(),
            e
        ))
    })?;

    let mut archive = Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);

    let entries = archive.entries().map_err(|e| {
        BuildError::Runtime(format!(
            "Failed to read layer {}: {}",
            layer_path.display(),
            e
        ))
    })?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| BuildError::Runtime(format!("Failed to read layer entry: {}", e)))?;
        let path = entry
            .path()
            .map_err(|e| BuildError::Runtime(format!("Invalid layer entry path: {}", e)))?
            .into_owned();

        let whiteout = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix(WHITEOUT_PREFIX))
            .map(|n| path.with_file_name(n));

        if let Some(removed) = whiteout {
            let target = target_dir.join(&removed);
            match std::fs::symlink_metadata(&target) {
                Ok(m) if m.is_dir() => std::fs::remove_dir_all(&target)?,
                Ok(_) => std::fs::remove_file(&target)?,
                Err(_) => {}
            }
            continue;
        }

        entry.unpack_in(target_dir).map_err(|e| {
            BuildError::Runtime(format!(
                "Failed to extract {} to {}: {}",
                path.display(),
                target_dir.display(),
                e
            ))
        })?;
    }

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        "Extracted layer"
    );

    Ok(())
}
