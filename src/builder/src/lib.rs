//! Strata Builder - Layered Image Build Engine
//!
//! Turns a Dockerfile and a build context into an image by executing
//! each instruction against a container runtime, committing one image
//! per instruction and reusing earlier results through a content-keyed
//! layer cache.
//!
//! ```text
//! Dockerfile ──parse──▶ [Statement] ──▶ Executor ──▶ Runtime
//!                                          │
//!                                          ├── BuildContext (ADD/COPY sources)
//!                                          ├── Fetcher (remote ADD)
//!                                          └── BuildCache (step → image)
//! ```

#![allow(clippy::result_large_err)]

pub mod cache;
pub mod context;
pub mod digest;
pub mod dockerfile;
pub mod engine;
pub mod expand;
pub mod fetch;
pub mod runtime;
pub mod state;

pub use cache::{BuildCache, CacheKey, KeyGuard};
pub use context::BuildContext;
pub use dockerfile::{CommandForm, Dockerfile, Instruction, Opcode};
pub use engine::{BuildJob, BuildPhase, Executor};
pub use expand::Environment;
pub use fetch::{Fetcher, HttpFetcher, StaticFetcher};
pub use runtime::{LocalRuntime, MemoryRuntime, Runtime};
pub use state::{ContainerId, ImageConfig, ImageId};

pub use strata_core::{BuildError, BuilderConfig, Result};
