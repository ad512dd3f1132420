//! Directory-backed runtime.
//!
//! Layout under the runtime root:
//!
//! ```text
//! images/<id>/image.json     parent, config, history
//! images/<id>/layer.tar.gz   filesystem delta against the parent
//! tags.json                  name → image id
//! containers/<id>/rootfs/    materialised container filesystem
//! ```
//!
//! RUN executes through `chroot <rootfs> /bin/sh` and therefore needs
//! Linux and sufficient privileges.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use strata_core::error::{BuildError, Result};

use super::layer::{create_layer, create_layer_from_dir, extract_layer, DirSnapshot};
use super::{ImageInfo, Runtime, StagedFile, StagedSource};
use crate::digest::sha256_bytes;
use crate::state::{ContainerId, ImageConfig, ImageId};

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// One history entry of an image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub created: DateTime<Utc>,
    pub created_by: String,
    /// True when the step changed no files
    #[serde(default)]
    pub empty_layer: bool,
}

/// On-disk image metadata (`image.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: ImageId,
    pub parent: Option<ImageId>,
    pub config: ImageConfig,
    pub history: Vec<HistoryEntry>,
}

struct LocalContainer {
    image: ImageId,
    command: Vec<String>,
    config: ImageConfig,
    rootfs: PathBuf,
    baseline: DirSnapshot,
}

/// Runtime that stores images as layer tarballs under a root directory.
pub struct LocalRuntime {
    root: PathBuf,
    containers: DashMap<ContainerId, LocalContainer>,
    tags_lock: parking_lot::Mutex<()>,
}

impl LocalRuntime {
    /// Open (or create) a runtime rooted at `root`.
    pub fn new(root: &Path) -> Result<Self> {
        for dir in [root.join("images"), root.join("containers")] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                BuildError::Runtime(format!(
                    "Failed to create runtime directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        Ok(Self {
            root: root.to_path_buf(),
            containers: DashMap::new(),
            tags_lock: parking_lot::Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Register the contents of `dir` as a base image called `name`.
    pub fn import_rootfs(&self, name: &str, dir: &Path, config: ImageConfig) -> Result<ImageId> {
        let id = new_image_id();
        let image_dir = self.image_dir(&id);
        std::fs::create_dir_all(&image_dir)?;
        create_layer_from_dir(dir, &image_dir.join("layer.tar.gz"))?;

        let record = ImageRecord {
            id: id.clone(),
            parent: None,
            config,
            history: vec![HistoryEntry {
                created: Utc::now(),
                created_by: format!("import {}", dir.display()),
                empty_layer: false,
            }],
        };
        self.write_record(&record)?;
        self.tag(name, &id)?;

        tracing::info!(name, image = %id, "Imported base image");
        Ok(id)
    }

    /// Point `name` at an image.
    pub fn tag(&self, name: &str, image: &ImageId) -> Result<()> {
        let _guard = self.tags_lock.lock();
        let mut tags = self.load_tags()?;
        tags.insert(name.to_string(), image.clone());

        let path = self.root.join("tags.json");
        let tmp = self.root.join("tags.json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(&tags)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Read a full image record, resolving tags.
    pub fn record(&self, image: &str) -> Result<ImageRecord> {
        let id = self
            .load_tags()?
            .get(image)
            .cloned()
            .unwrap_or_else(|| ImageId::new(image));

        let path = self.image_dir(&id).join("image.json");
        let data = std::fs::read_to_string(&path)
            .map_err(|_| BuildError::Runtime(format!("No such image: {}", image)))?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Extract an image's full filesystem into `target`.
    pub fn export_rootfs(&self, image: &ImageId, target: &Path) -> Result<()> {
        for layer in self.layer_chain(image)? {
            extract_layer(&layer, target)?;
        }
        Ok(())
    }

    fn image_dir(&self, image: &ImageId) -> PathBuf {
        self.root.join("images").join(image.as_str())
    }

    fn write_record(&self, record: &ImageRecord) -> Result<()> {
        let path = self.image_dir(&record.id).join("image.json");
        std::fs::write(&path, serde_json::to_string_pretty(record)?).map_err(|e| {
            BuildError::Runtime(format!(
                "Failed to write image metadata {}: {}",
                path.display(),
                e
            ))
        })
    }

    fn load_tags(&self) -> Result<BTreeMap<String, ImageId>> {
        let path = self.root.join("tags.json");
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Layer files from the base image up to `image`.
    fn layer_chain(&self, image: &ImageId) -> Result<Vec<PathBuf>> {
        let mut layers = Vec::new();
        let mut current = Some(image.clone());
        while let Some(id) = current {
            let record = self.record(id.as_str())?;
            let layer = self.image_dir(&id).join("layer.tar.gz");
            if layer.exists() {
                layers.push(layer);
            }
            current = record.parent;
        }
        layers.reverse();
        Ok(layers)
    }

    fn container_rootfs(&self, container: &ContainerId) -> Result<PathBuf> {
        self.containers
            .get(container)
            .map(|c| c.rootfs.clone())
            .ok_or_else(|| BuildError::Runtime(format!("No such container: {}", container)))
    }
}

#[async_trait]
impl Runtime for LocalRuntime {
    async fn inspect(&self, image: &str) -> Result<ImageInfo> {
        let record = self.record(image)?;
        Ok(ImageInfo {
            id: record.id,
            parent: record.parent,
            config: record.config,
        })
    }

    async fn create_container(
        &self,
        image: &ImageId,
        command: Vec<String>,
        config: &ImageConfig,
    ) -> Result<ContainerId> {
        let id = ContainerId::new(uuid::Uuid::new_v4().simple().to_string());
        let rootfs = self
            .root
            .join("containers")
            .join(id.as_str())
            .join("rootfs");
        std::fs::create_dir_all(&rootfs).map_err(|e| {
            BuildError::Runtime(format!(
                "Failed to create container rootfs {}: {}",
                rootfs.display(),
                e
            ))
        })?;

        if let Err(e) = self.export_rootfs(image, &rootfs) {
            let _ = std::fs::remove_dir_all(rootfs.parent().unwrap_or(&rootfs));
            return Err(e);
        }
        let baseline = DirSnapshot::capture(&rootfs)?;

        tracing::debug!(container = %id, image = %image, "Created container");
        self.containers.insert(
            id.clone(),
            LocalContainer {
                image: image.clone(),
                command,
                config: config.clone(),
                rootfs,
                baseline,
            },
        );
        Ok(id)
    }

    async fn start_and_wait(&self, container: &ContainerId) -> Result<i64> {
        let (rootfs, command, config) = {
            let ctr = self
                .containers
                .get(container)
                .ok_or_else(|| BuildError::Runtime(format!("No such container: {}", container)))?;
            (ctr.rootfs.clone(), ctr.command.clone(), ctr.config.clone())
        };
        run_chroot(&rootfs, &command, &config).await
    }

    async fn copy_into_container(
        &self,
        container: &ContainerId,
        files: Vec<StagedFile>,
    ) -> Result<()> {
        let rootfs = self.container_rootfs(container)?;

        for file in files {
            let target = rootfs.join(file.path.trim_start_matches('/'));
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let written = match file.source {
                StagedSource::Bytes(ref bytes) => std::fs::write(&target, bytes),
                StagedSource::Host(ref source) => std::fs::copy(source, &target).map(|_| ()),
                StagedSource::Directory => std::fs::create_dir_all(&target),
            };
            written.map_err(|e| {
                BuildError::Runtime(format!(
                    "Failed to copy into container {}: {}",
                    file.path, e
                ))
            })?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(&target, std::fs::Permissions::from_mode(file.mode))?;
            }
        }
        Ok(())
    }

    async fn is_directory(&self, container: &ContainerId, path: &str) -> Result<bool> {
        let rootfs = self.container_rootfs(container)?;
        Ok(rootfs.join(path.trim_start_matches('/')).is_dir())
    }

    async fn commit(
        &self,
        container: &ContainerId,
        config: &ImageConfig,
        created_by: &str,
    ) -> Result<ImageId> {
        let ctr = self
            .containers
            .get(container)
            .ok_or_else(|| BuildError::Runtime(format!("No such container: {}", container)))?;

        let after = DirSnapshot::capture(&ctr.rootfs)?;
        let diff = ctr.baseline.diff(&after);

        let id = new_image_id();
        let image_dir = self.image_dir(&id);
        std::fs::create_dir_all(&image_dir)?;

        let empty_layer = diff.is_empty();
        if !empty_layer {
            let info = create_layer(&ctr.rootfs, &diff, &image_dir.join("layer.tar.gz"))?;
            tracing::debug!(
                image = %id,
                digest = %info.digest,
                size = info.size,
                changed = diff.changed.len(),
                removed = diff.removed.len(),
                "Created layer"
            );
        }

        self.write_record(&ImageRecord {
            id: id.clone(),
            parent: Some(ctr.image.clone()),
            config: config.clone(),
            history: vec![HistoryEntry {
                created: Utc::now(),
                created_by: created_by.to_string(),
                empty_layer,
            }],
        })?;

        Ok(id)
    }

    async fn remove_container(&self, container: &ContainerId) -> Result<()> {
        if let Some((_, ctr)) = self.containers.remove(container) {
            if let Some(dir) = ctr.rootfs.parent() {
                std::fs::remove_dir_all(dir).map_err(|e| {
                    BuildError::Runtime(format!(
                        "Failed to remove container {}: {}",
                        container, e
                    ))
                })?;
            }
            tracing::debug!(container = %container, "Removed container");
        }
        Ok(())
    }
}

fn new_image_id() -> ImageId {
    ImageId::new(sha256_bytes(uuid::Uuid::new_v4().as_bytes()))
}

/// Run `command` inside `rootfs` via chroot, in the configured working
/// directory and environment.
#[cfg(target_os = "linux")]
async fn run_chroot(rootfs: &Path, command: &[String], config: &ImageConfig) -> Result<i64> {
    let mut cmd = tokio::process::Command::new("chroot");
    if !config.user.is_empty() {
        cmd.arg(format!("--userspec={}", config.user));
    }
    cmd.arg(rootfs)
        .arg("/bin/sh")
        .arg("-c")
        .arg(r#"mkdir -p "$0" && cd "$0" && exec "$@""#)
        .arg(config.workdir())
        .args(command);

    cmd.env_clear();
    if config.env.get("PATH").is_none() {
        cmd.env("PATH", DEFAULT_PATH);
    }
    cmd.env("HOME", "/root");
    for (key, value) in config.env.iter() {
        cmd.env(key, value);
    }
    cmd.kill_on_drop(true);

    tracing::debug!(rootfs = %rootfs.display(), ?command, "Running command");
    let status = cmd
        .status()
        .await
        .map_err(|e| BuildError::Runtime(format!("Failed to execute RUN command: {}", e)))?;

    let code = match status.code() {
        Some(code) => code as i64,
        None => {
            use std::os::unix::process::ExitStatusExt;
            128 + status.signal().unwrap_or(0) as i64
        }
    };
    Ok(code)
}

#[cfg(not(target_os = "linux"))]
async fn run_chroot(_rootfs: &Path, command: &[String], _config: &ImageConfig) -> Result<i64> {
    Err(BuildError::Runtime(format!(
        "RUN requires a Linux host (command: {:?})",
        command
    )))
}
