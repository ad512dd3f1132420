//! Build context: the file tree ADD and COPY read from.
//!
//! Every path handed out by [`BuildContext`] has been canonicalized and
//! verified to lie under the context root. Resolution outside the root is
//! an error, never clamped.

use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use strata_core::error::{BuildError, Result};
use tempfile::TempDir;

use crate::digest::{sha256_fields, sha256_file};

/// Name of the Dockerfile read from the context root by default.
pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Kind of a resolved context entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// A path resolved inside the build context.
#[derive(Debug, Clone)]
pub struct ContextPath {
    /// The path as written in the instruction
    pub requested: String,
    /// Canonical host path
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Permission bits
    pub mode: u32,
}

impl ContextPath {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Final component of the requested path, used when a file source is
    /// placed inside a directory destination.
    pub fn file_name(&self) -> String {
        Path::new(self.requested.trim_end_matches('/'))
            .file_name()
            .or_else(|| self.path.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// One entry produced by walking a context directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkEntry {
    /// Path relative to the walked directory
    pub relative: PathBuf,
    /// Host path to read from (symlinks already followed)
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Permission bits
    pub mode: u32,
}

impl WalkEntry {
    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// Rooted file tree supplied with the Dockerfile.
#[derive(Debug)]
pub struct BuildContext {
    root: PathBuf,
    /// Keeps an unpacked archive alive for the lifetime of the context
    _unpacked: Option<TempDir>,
}

impl BuildContext {
    /// Open a context rooted at an existing directory.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let canonical = root.canonicalize().map_err(|e| {
            BuildError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open build context {}: {}", root.display(), e),
            ))
        })?;

        if !canonical.is_dir() {
            return Err(BuildError::Config(format!(
                "Build context {} is not a directory",
                root.display()
            )));
        }

        Ok(Self {
            root: canonical,
            _unpacked: None,
        })
    }

    /// Unpack a tar (optionally gzip-compressed) stream into a temporary
    /// directory and use it as the context.
    pub fn from_archive<R: Read>(reader: R) -> Result<Self> {
        let tmp = TempDir::new().map_err(|e| {
            BuildError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create context directory: {}", e),
            ))
        })?;

        let mut reader = BufReader::new(reader);
        let compressed = reader.fill_buf()?.starts_with(&GZIP_MAGIC);

        let unpacked = if compressed {
            tar::Archive::new(flate2::read::GzDecoder::new(reader)).unpack(tmp.path())
        } else {
            tar::Archive::new(reader).unpack(tmp.path())
        };
        unpacked.map_err(|e| {
            BuildError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to unpack build context archive: {}", e),
            ))
        })?;

        tracing::debug!(
            root = %tmp.path().display(),
            compressed,
            "Unpacked build context archive"
        );

        let mut context = Self::new(tmp.path())?;
        context._unpacked = Some(tmp);
        Ok(context)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Read the Dockerfile at the context root.
    ///
    /// `name` overrides the default `Dockerfile` and is resolved like any
    /// other context path.
    pub fn read_dockerfile(&self, name: Option<&str>) -> Result<String> {
        let entry = self.resolve(name.unwrap_or(DEFAULT_DOCKERFILE))?;
        if entry.is_dir() {
            return Err(BuildError::Config(format!(
                "{} is a directory, not a Dockerfile",
                entry.requested
            )));
        }
        Ok(std::fs::read_to_string(&entry.path)?)
    }

    /// Resolve a context-relative path.
    ///
    /// Leading `/` and `./` are relative to the root. The path is first
    /// normalised lexically and prefix-checked, then checked for existence,
    /// then canonicalized (following symlinks) and prefix-checked again.
    pub fn resolve(&self, requested: &str) -> Result<ContextPath> {
        let relative = strip_leading(requested);
        let normalized = normalize_lexically(&self.root.join(relative));

        if !normalized.starts_with(&self.root) {
            return Err(BuildError::ForbiddenPath {
                requested: requested.to_string(),
                resolved: normalized,
            });
        }

        let not_found = || BuildError::NotFound {
            requested: requested.to_string(),
        };

        std::fs::symlink_metadata(&normalized).map_err(|_| not_found())?;
        // A dangling symlink exists but cannot be canonicalized
        let canonical = normalized.canonicalize().map_err(|_| not_found())?;

        if !canonical.starts_with(&self.root) {
            return Err(BuildError::ForbiddenPath {
                requested: requested.to_string(),
                resolved: canonical,
            });
        }

        let metadata = std::fs::metadata(&canonical).map_err(|_| not_found())?;
        let kind = if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        Ok(ContextPath {
            requested: requested.to_string(),
            path: canonical,
            kind,
            mode: file_mode(&metadata),
        })
    }

    /// Recursively enumerate a directory in sorted order.
    ///
    /// Symlinked files are followed when their target stays inside the
    /// context; symlinked directories are skipped.
    pub fn walk(&self, dir: &ContextPath) -> Result<Vec<WalkEntry>> {
        let mut entries = Vec::new();
        if dir.is_dir() {
            self.walk_dir(&dir.path, &dir.path, &mut entries)?;
        }
        Ok(entries)
    }

    fn walk_dir(&self, base: &Path, current: &Path, out: &mut Vec<WalkEntry>) -> Result<()> {
        let read_dir = std::fs::read_dir(current).map_err(|e| {
            BuildError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read directory {}: {}", current.display(), e),
            ))
        })?;

        let mut children = Vec::new();
        for entry in read_dir {
            children.push(entry?.path());
        }
        children.sort();

        for path in children {
            let relative = path
                .strip_prefix(base)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| path.clone());
            let metadata = std::fs::symlink_metadata(&path)?;

            if metadata.file_type().is_symlink() {
                let target = match path.canonicalize() {
                    Ok(target) => target,
                    Err(_) => {
                        tracing::warn!(
                            path = %path.display(),
                            "Skipping dangling symlink in build context"
                        );
                        continue;
                    }
                };
                if !target.starts_with(&self.root) {
                    return Err(BuildError::ForbiddenPath {
                        requested: relative.to_string_lossy().to_string(),
                        resolved: target,
                    });
                }
                if target.is_dir() {
                    tracing::warn!(
                        path = %path.display(),
                        target = %target.display(),
                        "Skipping symlinked directory in build context; its contents are not copied"
                    );
                    continue;
                }
                let mode = file_mode(&std::fs::metadata(&target)?);
                out.push(WalkEntry {
                    relative,
                    path: target,
                    kind: EntryKind::File,
                    mode,
                });
            } else if metadata.is_dir() {
                out.push(WalkEntry {
                    relative,
                    path: path.clone(),
                    kind: EntryKind::Directory,
                    mode: file_mode(&metadata),
                });
                self.walk_dir(base, &path, out)?;
            } else if metadata.is_file() {
                out.push(WalkEntry {
                    relative,
                    path,
                    kind: EntryKind::File,
                    mode: file_mode(&metadata),
                });
            }
        }

        Ok(())
    }

    /// Content identity of a resolved path.
    ///
    /// A file hashes to its byte digest. A directory hashes every entry's
    /// kind, relative path, content digest and executable bit, so any byte
    /// change, rename or mode flip anywhere below it changes the result.
    pub fn fingerprint(&self, entry: &ContextPath) -> Result<String> {
        if !entry.is_dir() {
            return sha256_file(&entry.path);
        }

        let mut parts = Vec::new();
        for item in self.walk(entry)? {
            let relative = item.relative.to_string_lossy().to_string();
            let (kind, digest) = match item.kind {
                EntryKind::File => ("file", sha256_file(&item.path)?),
                EntryKind::Directory => ("dir", String::new()),
            };
            let exec = if item.is_executable() { "x" } else { "-" };
            parts.push(sha256_fields([kind, relative.as_str(), digest.as_str(), exec]));
        }
        Ok(sha256_fields(parts.iter().map(String::as_str)))
    }
}

/// Drop leading `/` and `./` so the path is relative to the context root.
fn strip_leading(requested: &str) -> &str {
    let mut rest = requested;
    loop {
        if let Some(stripped) = rest.strip_prefix('/') {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        } else {
            return rest;
        }
    }
}

/// Resolve `.` and `..` without touching the filesystem. `..` at the
/// filesystem root stays at the root.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(name) => out.push(name),
        }
    }
    out
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}
