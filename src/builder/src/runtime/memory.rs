//! In-memory runtime.
//!
//! Images are file maps plus a config and a parent pointer. RUN commands
//! are not executed by a real shell: a handful of trivial scripts (`true`,
//! `false`, `exit N`, `[ a = b ]`, optionally wrapped in `sh -c`) are
//! evaluated, everything else succeeds unless a failure rule or run hook
//! says otherwise.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use strata_core::error::{BuildError, Result};

use super::{ImageInfo, Runtime, StagedFile, StagedSource};
use crate::digest::{sha256_bytes, sha256_fields};
use crate::state::{ContainerId, ImageConfig, ImageId};

/// A node in an in-memory filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File { data: Vec<u8>, mode: u32 },
    Dir { mode: u32 },
}

/// Flat in-memory filesystem keyed by absolute path.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    nodes: BTreeMap<String, Node>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<&Node> {
        self.nodes.get(&normalize(path))
    }

    pub fn read(&self, path: &str) -> Option<&[u8]> {
        match self.get(path) {
            Some(Node::File { data, .. }) => Some(data),
            _ => None,
        }
    }

    pub fn is_dir(&self, path: &str) -> bool {
        let path = normalize(path);
        path == "/" || matches!(self.nodes.get(&path), Some(Node::Dir { .. }))
    }

    /// Create a directory and all missing parents.
    pub fn mkdir_all(&mut self, path: &str, mode: u32) {
        let path = normalize(path);
        let mut current = String::new();
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            match self.nodes.get(&current) {
                Some(Node::Dir { .. }) => {}
                _ => {
                    self.nodes.insert(current.clone(), Node::Dir { mode });
                }
            }
        }
    }

    /// Write a file, creating parent directories.
    pub fn write(&mut self, path: &str, data: impl Into<Vec<u8>>, mode: u32) {
        let path = normalize(path);
        if let Some((parent, _)) = path.rsplit_once('/') {
            if !parent.is_empty() {
                self.mkdir_all(parent, 0o755);
            }
        }
        self.nodes.insert(
            path,
            Node::File {
                data: data.into(),
                mode,
            },
        );
    }

    /// All paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

/// Script hook consulted before any built-in evaluation.
///
/// Receives the argv, the container config and its filesystem; returning
/// `Some(code)` decides the exit status.
pub type RunHook = Arc<dyn Fn(&[String], &ImageConfig, &mut MemFs) -> Option<i64> + Send + Sync>;

#[derive(Debug, Clone)]
struct MemImage {
    parent: Option<ImageId>,
    config: ImageConfig,
    fs: MemFs,
    history: Vec<String>,
}

#[derive(Debug, Clone)]
struct MemContainer {
    image: ImageId,
    command: Vec<String>,
    config: ImageConfig,
    fs: MemFs,
}

#[derive(Default)]
struct Inner {
    images: HashMap<ImageId, MemImage>,
    names: HashMap<String, ImageId>,
    containers: HashMap<ContainerId, MemContainer>,
    failures: HashMap<String, i64>,
    started: Vec<Vec<String>>,
    commits: usize,
}

/// Runtime whose images and containers live entirely in memory.
pub struct MemoryRuntime {
    inner: Mutex<Inner>,
    hook: Mutex<Option<RunHook>>,
    run_delay: Mutex<Option<Duration>>,
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuntime {
    /// An empty runtime with a `scratch` base image registered.
    pub fn new() -> Self {
        let runtime = Self {
            inner: Mutex::new(Inner::default()),
            hook: Mutex::new(None),
            run_delay: Mutex::new(None),
        };
        runtime.add_base_image("scratch", ImageConfig::default(), Vec::<(String, Vec<u8>)>::new());
        runtime
    }

    /// Register a named base image. Its id is derived from the name.
    pub fn add_base_image<P, D>(
        &self,
        name: &str,
        config: ImageConfig,
        files: impl IntoIterator<Item = (P, D)>,
    ) -> ImageId
    where
        P: AsRef<str>,
        D: Into<Vec<u8>>,
    {
        let id = ImageId::new(sha256_fields(["base", name]));
        let mut fs = MemFs::new();
        for (path, data) in files {
            fs.write(path.as_ref(), data, 0o644);
        }

        let mut inner = self.inner.lock();
        inner.images.insert(
            id.clone(),
            MemImage {
                parent: None,
                config,
                fs,
                history: vec![format!("base image {}", name)],
            },
        );
        inner.names.insert(name.to_string(), id.clone());
        id
    }

    /// Make any RUN whose final argument equals `script` exit with `code`.
    pub fn fail_when(&self, script: impl Into<String>, code: i64) {
        self.inner.lock().failures.insert(script.into(), code);
    }

    pub fn set_run_hook(&self, hook: RunHook) {
        *self.hook.lock() = Some(hook);
    }

    /// Make every started container sleep this long before exiting.
    pub fn set_run_delay(&self, delay: Duration) {
        *self.run_delay.lock() = Some(delay);
    }

    pub fn read_file(&self, image: &ImageId, path: &str) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        inner.images.get(image)?.fs.read(path).map(<[u8]>::to_vec)
    }

    pub fn file_mode(&self, image: &ImageId, path: &str) -> Option<u32> {
        let inner = self.inner.lock();
        match inner.images.get(image)?.fs.get(path)? {
            Node::File { mode, .. } | Node::Dir { mode } => Some(*mode),
        }
    }

    pub fn is_dir(&self, image: &ImageId, path: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .images
            .get(image)
            .map(|img| img.fs.is_dir(path))
            .unwrap_or(false)
    }

    pub fn paths(&self, image: &ImageId) -> Vec<String> {
        let inner = self.inner.lock();
        inner
            .images
            .get(image)
            .map(|img| img.fs.paths())
            .unwrap_or_default()
    }

    /// Layer history of an image, oldest first.
    pub fn history(&self, image: &ImageId) -> Vec<String> {
        let inner = self.inner.lock();
        let mut chain = Vec::new();
        let mut current = inner.images.get(image);
        while let Some(img) = current {
            chain.extend(img.history.iter().rev().cloned());
            current = img.parent.as_ref().and_then(|p| inner.images.get(p));
        }
        chain.reverse();
        chain
    }

    /// Number of containers that exist right now.
    pub fn container_count(&self) -> usize {
        self.inner.lock().containers.len()
    }

    /// Total commits performed.
    pub fn commit_count(&self) -> usize {
        self.inner.lock().commits
    }

    /// Argv of every container started, in order.
    pub fn started_commands(&self) -> Vec<Vec<String>> {
        self.inner.lock().started.clone()
    }

    fn unknown_container(container: &ContainerId) -> BuildError {
        BuildError::Runtime(format!("No such container: {}", container))
    }
}

#[async_trait]
impl Runtime for MemoryRuntime {
    async fn inspect(&self, image: &str) -> Result<ImageInfo> {
        let inner = self.inner.lock();
        let id = inner
            .names
            .get(image)
            .cloned()
            .unwrap_or_else(|| ImageId::new(image));
        let img = inner
            .images
            .get(&id)
            .ok_or_else(|| BuildError::Runtime(format!("No such image: {}", image)))?;
        Ok(ImageInfo {
            id,
            parent: img.parent.clone(),
            config: img.config.clone(),
        })
    }

    async fn create_container(
        &self,
        image: &ImageId,
        command: Vec<String>,
        config: &ImageConfig,
    ) -> Result<ContainerId> {
        let mut inner = self.inner.lock();
        let fs = inner
            .images
            .get(image)
            .map(|img| img.fs.clone())
            .ok_or_else(|| BuildError::Runtime(format!("No such image: {}", image)))?;

        let id = ContainerId::new(uuid::Uuid::new_v4().simple().to_string());
        inner.containers.insert(
            id.clone(),
            MemContainer {
                image: image.clone(),
                command,
                config: config.clone(),
                fs,
            },
        );
        tracing::trace!(container = %id, image = %image, "Created container");
        Ok(id)
    }

    async fn start_and_wait(&self, container: &ContainerId) -> Result<i64> {
        let delay = *self.run_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let hook = self.hook.lock().clone();
        let mut inner = self.inner.lock();
        let Inner {
            containers,
            failures,
            started,
            ..
        } = &mut *inner;

        let ctr = containers
            .get_mut(container)
            .ok_or_else(|| Self::unknown_container(container))?;
        started.push(ctr.command.clone());

        if let Some(hook) = hook {
            if let Some(code) = hook(&ctr.command, &ctr.config, &mut ctr.fs) {
                return Ok(code);
            }
        }

        if let Some(code) = ctr.command.last().and_then(|script| failures.get(script)) {
            return Ok(*code);
        }

        Ok(ctr
            .command
            .last()
            .and_then(|script| builtin_status(script))
            .unwrap_or(0))
    }

    async fn copy_into_container(
        &self,
        container: &ContainerId,
        files: Vec<StagedFile>,
    ) -> Result<()> {
        // Read host files before taking the lock
        let mut resolved = Vec::with_capacity(files.len());
        for file in files {
            let data = match file.source {
                StagedSource::Bytes(bytes) => Some(bytes),
                StagedSource::Host(ref path) => Some(tokio::fs::read(path).await.map_err(|e| {
                    BuildError::Runtime(format!("Failed to read {}: {}", path.display(), e))
                })?),
                StagedSource::Directory => None,
            };
            resolved.push((file.path, data, file.mode));
        }

        let mut inner = self.inner.lock();
        let ctr = inner
            .containers
            .get_mut(container)
            .ok_or_else(|| Self::unknown_container(container))?;
        for (path, data, mode) in resolved {
            match data {
                Some(bytes) => ctr.fs.write(&path, bytes, mode),
                None => ctr.fs.mkdir_all(&path, mode),
            }
        }
        Ok(())
    }

    async fn is_directory(&self, container: &ContainerId, path: &str) -> Result<bool> {
        let inner = self.inner.lock();
        let ctr = inner
            .containers
            .get(container)
            .ok_or_else(|| Self::unknown_container(container))?;
        Ok(ctr.fs.is_dir(path))
    }

    async fn commit(
        &self,
        container: &ContainerId,
        config: &ImageConfig,
        created_by: &str,
    ) -> Result<ImageId> {
        let mut inner = self.inner.lock();
        let ctr = inner
            .containers
            .get(container)
            .cloned()
            .ok_or_else(|| Self::unknown_container(container))?;

        let id = ImageId::new(sha256_bytes(uuid::Uuid::new_v4().as_bytes()));
        inner.images.insert(
            id.clone(),
            MemImage {
                parent: Some(ctr.image),
                config: config.clone(),
                fs: ctr.fs,
                history: vec![created_by.to_string()],
            },
        );
        inner.commits += 1;
        tracing::trace!(container = %container, image = %id, "Committed container");
        Ok(id)
    }

    async fn remove_container(&self, container: &ContainerId) -> Result<()> {
        self.inner.lock().containers.remove(container);
        Ok(())
    }
}

/// Exit status of the trivial scripts the in-memory runtime understands.
fn builtin_status(script: &str) -> Option<i64> {
    let script = script.trim();

    for prefix in ["/bin/sh -c ", "sh -c "] {
        if let Some(inner) = script.strip_prefix(prefix) {
            return builtin_status(&unquote(inner.trim()));
        }
    }

    match script {
        "true" | ":" => return Some(0),
        "false" => return Some(1),
        _ => {}
    }

    if let Some(code) = script.strip_prefix("exit ") {
        return code.trim().parse().ok();
    }

    if let Some(test) = script.strip_prefix("[ ").and_then(|s| s.strip_suffix(" ]")) {
        let words: Vec<String> = test.split_whitespace().map(unquote).collect();
        if let [left, op, right] = words.as_slice() {
            return match op.as_str() {
                "=" | "==" => Some(if left == right { 0 } else { 1 }),
                "!=" => Some(if left != right { 0 } else { 1 }),
                _ => None,
            };
        }
    }

    None
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(script: &str) -> Vec<String> {
        vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()]
    }

    // --- MemFs ---

    #[test]
    fn test_memfs_write_creates_parents() {
        let mut fs = MemFs::new();
        fs.write("/a/b/c.txt", "x", 0o644);
        assert!(fs.is_dir("/a"));
        assert!(fs.is_dir("/a/b/"));
        assert_eq!(fs.read("a/b/c.txt"), Some(&b"x"[..]));
        assert!(fs.is_dir("/"));
    }

    // --- builtin_status ---

    #[test]
    fn test_builtin_status() {
        assert_eq!(builtin_status("true"), Some(0));
        assert_eq!(builtin_status("false"), Some(1));
        assert_eq!(builtin_status("exit 23"), Some(23));
        assert_eq!(builtin_status(r#"sh -c "exit 23""#), Some(23));
        assert_eq!(builtin_status(r#"[ "BAZ" = "BAZ" ]"#), Some(0));
        assert_eq!(builtin_status(r#"[ "BAR" = "BAZ" ]"#), Some(1));
        assert_eq!(builtin_status("make install"), None);
    }

    // --- Runtime ---

    #[tokio::test]
    async fn test_inspect_by_name_and_id() {
        let rt = MemoryRuntime::new();
        let config = ImageConfig {
            cmd: vec!["sh".to_string()],
            ..Default::default()
        };
        let id = rt.add_base_image("busybox", config, [("/bin/sh", "elf")]);

        let by_name = rt.inspect("busybox").await.unwrap();
        assert_eq!(by_name.id, id);
        assert_eq!(by_name.config.cmd, vec!["sh"]);

        let by_id = rt.inspect(id.as_str()).await.unwrap();
        assert_eq!(by_id.id, id);

        assert!(rt.inspect("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_run_commit_lifecycle() {
        let rt = MemoryRuntime::new();
        let base = rt.add_base_image("base", ImageConfig::default(), [("/etc/os", "test")]);

        let ctr = rt
            .create_container(&base, argv("true"), &ImageConfig::default())
            .await
            .unwrap();
        assert_eq!(rt.container_count(), 1);
        assert_eq!(rt.start_and_wait(&ctr).await.unwrap(), 0);

        rt.copy_into_container(
            &ctr,
            vec![StagedFile {
                path: "/app/hello".to_string(),
                source: StagedSource::Bytes(b"hi".to_vec()),
                mode: 0o600,
            }],
        )
        .await
        .unwrap();
        assert!(rt.is_directory(&ctr, "/app").await.unwrap());

        let image = rt
            .commit(&ctr, &ImageConfig::default(), "ADD hello /app/")
            .await
            .unwrap();
        rt.remove_container(&ctr).await.unwrap();

        assert_eq!(rt.container_count(), 0);
        assert_eq!(rt.read_file(&image, "/app/hello"), Some(b"hi".to_vec()));
        assert_eq!(rt.read_file(&image, "/etc/os"), Some(b"test".to_vec()));
        assert_eq!(rt.file_mode(&image, "/app/hello"), Some(0o600));
        assert_eq!(rt.inspect(image.as_str()).await.unwrap().parent, Some(base));
        assert_eq!(rt.history(&image).last().map(String::as_str), Some("ADD hello /app/"));
    }

    #[tokio::test]
    async fn test_fail_when_and_hook() {
        let rt = MemoryRuntime::new();
        let base = rt.add_base_image("base", ImageConfig::default(), Vec::<(String, Vec<u8>)>::new());
        rt.fail_when("make", 2);

        let ctr = rt
            .create_container(&base, argv("make"), &ImageConfig::default())
            .await
            .unwrap();
        assert_eq!(rt.start_and_wait(&ctr).await.unwrap(), 2);

        rt.set_run_hook(Arc::new(|argv: &[String], _: &ImageConfig, fs: &mut MemFs| {
            if argv.last().map(String::as_str) == Some("touch /marker") {
                fs.write("/marker", "", 0o644);
                return Some(0);
            }
            None
        }));
        let ctr = rt
            .create_container(&base, argv("touch /marker"), &ImageConfig::default())
            .await
            .unwrap();
        assert_eq!(rt.start_and_wait(&ctr).await.unwrap(), 0);
        let image = rt.commit(&ctr, &ImageConfig::default(), "RUN").await.unwrap();
        assert!(rt.read_file(&image, "/marker").is_some());
    }

    #[tokio::test]
    async fn test_unknown_container() {
        let rt = MemoryRuntime::new();
        let missing = ContainerId::new("nope");
        assert!(rt.start_and_wait(&missing).await.is_err());
        assert!(rt.remove_container(&missing).await.is_ok());
    }
}
