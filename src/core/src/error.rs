use std::path::PathBuf;

use thiserror::Error;

/// Strata build error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// The Dockerfile has no content at all.
    ///
    /// Checked before parsing; never reported as a parse error.
    #[error("Dockerfile cannot be empty")]
    EmptyDockerfile,

    /// Malformed instruction, unknown opcode or missing leading FROM
    #[error("Line {line}: {message}")]
    Parse { line: usize, message: String },

    /// A build context path resolved outside the context root
    #[error("Forbidden path outside the build context: {requested} ({})", resolved.display())]
    ForbiddenPath { requested: String, resolved: PathBuf },

    /// A build context path does not exist
    #[error("{requested}: no such file or directory")]
    NotFound { requested: String },

    /// Remote ADD source could not be retrieved
    #[error("Failed to fetch {url}: {message}")]
    Network {
        url: String,
        status: Option<u16>,
        message: String,
    },

    /// RUN exited with a non-zero status
    #[error("The command {command} returned a non-zero code: {code}")]
    Execution { command: String, code: i64 },

    /// Writing a cache entry failed
    #[error("Cache store error: {0}")]
    CacheStore(String),

    /// The container runtime reported a failure
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// The build was cancelled by the caller
    #[error("Build cancelled")]
    Cancelled,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl BuildError {
    /// Exit status of a failed RUN step, if this is one.
    pub fn exit_code(&self) -> Option<i64> {
        match self {
            BuildError::Execution { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the error comes from resolving a build context path.
    pub fn is_context_error(&self) -> bool {
        matches!(
            self,
            BuildError::ForbiddenPath { .. } | BuildError::NotFound { .. }
        )
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for Strata build operations
pub type Result<T> = std::result::Result<T, BuildError>;
