//! Container runtime contract consumed by the executor.
//!
//! The executor drives builds entirely through [`Runtime`]; it never looks
//! at layer bytes, only image identifiers and the configs returned by
//! [`Runtime::inspect`]. Two implementations ship with the crate:
//! [`MemoryRuntime`] keeps images as in-memory file maps, and
//! [`LocalRuntime`] materialises containers as directories on disk.

pub mod layer;
pub mod local;
pub mod memory;

use std::path::PathBuf;

use async_trait::async_trait;
use strata_core::error::Result;

use crate::state::{ContainerId, ImageConfig, ImageId};

pub use local::LocalRuntime;
pub use memory::MemoryRuntime;

/// What `inspect` reports about an image.
#[derive(Debug, Clone)]
pub struct ImageInfo {
    pub id: ImageId,
    pub parent: Option<ImageId>,
    pub config: ImageConfig,
}

/// Content of a staged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagedSource {
    /// Literal bytes (remote ADD sources)
    Bytes(Vec<u8>),
    /// A host file to copy (build context files)
    Host(PathBuf),
    /// An empty directory
    Directory,
}

/// One entry to write into a container's filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Absolute path inside the container
    pub path: String,
    pub source: StagedSource,
    /// Permission bits
    pub mode: u32,
}

/// Container runtime collaborator.
///
/// Implementations must be safe to share across concurrent builds.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Look up an image by id or by a name registered with the runtime.
    async fn inspect(&self, image: &str) -> Result<ImageInfo>;

    /// Create (but do not start) a container from `image`.
    ///
    /// `command` is the argv the container runs if started; `config`
    /// supplies its environment, working directory and user.
    async fn create_container(
        &self,
        image: &ImageId,
        command: Vec<String>,
        config: &ImageConfig,
    ) -> Result<ContainerId>;

    /// Start a created container and wait for it to exit.
    ///
    /// Returns the exit status. Dropping the future must not leave the
    /// container running.
    async fn start_and_wait(&self, container: &ContainerId) -> Result<i64>;

    /// Write files into a container's filesystem, creating parent
    /// directories as needed.
    async fn copy_into_container(
        &self,
        container: &ContainerId,
        files: Vec<StagedFile>,
    ) -> Result<()>;

    /// Whether `path` exists as a directory in the container.
    async fn is_directory(&self, container: &ContainerId, path: &str) -> Result<bool>;

    /// Commit the container's filesystem as a new image carrying `config`.
    ///
    /// `created_by` is recorded as the layer's history entry.
    async fn commit(
        &self,
        container: &ContainerId,
        config: &ImageConfig,
        created_by: &str,
    ) -> Result<ImageId>;

    /// Tear down a container. Removing an unknown container is not an error.
    async fn remove_container(&self, container: &ContainerId) -> Result<()>;
}
