//! Image identity, image configuration and the mutable build state.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dockerfile::Instruction;
use crate::expand::Environment;

/// Opaque identifier of a committed image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(pub String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, as shown in progress output.
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of a container created by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Runtime configuration baked into an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Environment variables, insertion-ordered
    pub env: Environment,

    /// Working directory; empty means `/`
    pub working_dir: String,

    /// User (and optional group) the container runs as
    pub user: String,

    /// MAINTAINER value
    pub author: String,

    /// Exposed ports (e.g. "80", "53/udp")
    pub exposed_ports: BTreeSet<String>,

    /// Declared volume mount points
    pub volumes: BTreeSet<String>,

    /// Entrypoint argv
    pub entrypoint: Vec<String>,

    /// Default command argv
    pub cmd: Vec<String>,
}

impl ImageConfig {
    /// Effective working directory for commands and relative destinations.
    pub fn workdir(&self) -> &str {
        if self.working_dir.is_empty() {
            "/"
        } else {
            &self.working_dir
        }
    }
}

/// Mutable record threaded through a build.
#[derive(Debug, Clone)]
pub struct BuildState {
    /// Parent for the next instruction
    pub image: ImageId,

    /// Config the next commit will carry
    pub config: ImageConfig,

    /// Whether a CMD instruction has been applied in this build
    cmd_set: bool,
}

impl BuildState {
    /// Start from a base image and its inherited config.
    pub fn new(image: ImageId, config: ImageConfig) -> Self {
        Self {
            image,
            config,
            cmd_set: false,
        }
    }

    /// Apply an (already expanded) instruction's effect on the config.
    ///
    /// Called both when the step executes and when it is served from cache,
    /// so that in-memory state matches the committed image either way.
    /// RUN, ADD and COPY change only the filesystem.
    pub fn apply(&mut self, instruction: &Instruction) {
        let config = &mut self.config;
        match instruction {
            Instruction::Env { vars } => {
                for (key, value) in vars {
                    config.env.set(key.as_str(), value.as_str());
                }
            }
            Instruction::Cmd(form) => {
                config.cmd = form.to_argv();
                self.cmd_set = true;
            }
            Instruction::Entrypoint(form) => {
                config.entrypoint = form.to_argv();
                if !self.cmd_set {
                    config.cmd.clear();
                }
            }
            Instruction::Expose { ports } => {
                config.exposed_ports.extend(ports.iter().cloned());
            }
            Instruction::Volume { paths } => {
                config.volumes.extend(paths.iter().cloned());
            }
            Instruction::User { user } => config.user = user.clone(),
            Instruction::Maintainer { name } => config.author = name.clone(),
            Instruction::Workdir { path } => {
                config.working_dir = resolve_container_path(config.workdir(), path);
            }
            Instruction::From { .. }
            | Instruction::Run(_)
            | Instruction::Add { .. }
            | Instruction::Copy { .. } => {}
        }
    }
}

/// Resolve `path` against `base` inside the image, normalising `.` and `..`.
///
/// A trailing `/` on `path` is preserved since it marks a directory
/// destination.
pub fn resolve_container_path(base: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let mut resolved = format!("/{}", parts.join("/"));
    if path.ends_with('/') && resolved != "/" {
        resolved.push('/');
    }
    resolved
}
