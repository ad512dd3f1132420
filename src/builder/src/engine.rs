//! Build engine for constructing images from Dockerfiles.
//!
//! Orchestrates the build: parses the Dockerfile, resolves the base image,
//! then drives each instruction against the runtime. Every instruction
//! after FROM either reuses a cached image or runs in a fresh container
//! whose result is committed as the parent for the next instruction.

use std::fmt;
use std::future::Future;
use std::io::Read;
use std::sync::Arc;

use strata_core::config::BuilderConfig;
use strata_core::error::{BuildError, Result};
use tokio_util::sync::CancellationToken;

use crate::cache::{BuildCache, CacheKey};
use crate::context::{BuildContext, ContextPath, EntryKind};
use crate::digest::sha256_fields;
use crate::dockerfile::{CommandForm, Dockerfile, Instruction, Statement};
use crate::expand::Environment;
use crate::fetch::{is_remote, Fetched, Fetcher, HttpFetcher, REMOTE_FILE_MODE};
use crate::runtime::{Runtime, StagedFile, StagedSource};
use crate::state::{resolve_container_path, BuildState, ContainerId, ImageId};

/// Where a build currently stands.
#[derive(Debug, Clone, PartialEq)]
pub enum BuildPhase {
    /// No instruction has run yet
    NotStarted,
    /// `step` instructions have completed
    Running {
        step: usize,
        image: ImageId,
        env: Environment,
    },
    Succeeded(ImageId),
    Failed(String),
}

/// Builds images by driving a [`Runtime`].
///
/// Holds everything a build needs by injection; nothing is read from
/// process-global state. A single executor can run many builds
/// concurrently, all sharing its cache.
pub struct Executor {
    config: BuilderConfig,
    runtime: Arc<dyn Runtime>,
    fetcher: Arc<dyn Fetcher>,
    cache: Arc<BuildCache>,
}

impl Executor {
    pub fn new(
        config: BuilderConfig,
        runtime: Arc<dyn Runtime>,
        fetcher: Arc<dyn Fetcher>,
        cache: Arc<BuildCache>,
    ) -> Self {
        Self {
            config,
            runtime,
            fetcher,
            cache,
        }
    }

    /// Executor with an HTTP fetcher and a cache built from `config`.
    pub fn from_config(config: BuilderConfig, runtime: Arc<dyn Runtime>) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(&config.network)?);
        let cache = Arc::new(BuildCache::from_config(&config)?);
        Ok(Self::new(config, runtime, fetcher, cache))
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<BuildCache> {
        &self.cache
    }

    /// Build `dockerfile` against `context`, returning the final image.
    pub async fn build(&self, dockerfile: &str, context: &BuildContext) -> Result<ImageId> {
        self.build_with_cancel(dockerfile, context, CancellationToken::new())
            .await
    }

    /// Like [`Executor::build`], aborting with [`BuildError::Cancelled`]
    /// once `cancel` fires. The in-flight container is removed first.
    pub async fn build_with_cancel(
        &self,
        dockerfile: &str,
        context: &BuildContext,
        cancel: CancellationToken,
    ) -> Result<ImageId> {
        let dockerfile = Dockerfile::parse(dockerfile)?;
        self.job(dockerfile, context, cancel).run().await
    }

    /// Build from a context archive (tar or tar.gz) that carries the
    /// Dockerfile at its root, or at `dockerfile` when given.
    pub async fn build_archive<R: Read>(
        &self,
        archive: R,
        dockerfile: Option<&str>,
    ) -> Result<ImageId> {
        let context = BuildContext::from_archive(archive)?;
        let text = context.read_dockerfile(dockerfile)?;
        self.build(&text, &context).await
    }

    /// Prepare a build that can be driven step by step.
    pub fn job<'a>(
        &'a self,
        dockerfile: Dockerfile,
        context: &'a BuildContext,
        cancel: CancellationToken,
    ) -> BuildJob<'a> {
        BuildJob {
            executor: self,
            context,
            dockerfile,
            cancel,
            phase: BuildPhase::NotStarted,
            state: None,
            next: 0,
            cache_valid: true,
        }
    }
}

/// A resolved ADD/COPY source.
#[derive(Debug)]
enum Source {
    Local(ContextPath),
    Remote(Fetched),
}

/// Sources of one ADD/COPY step plus their combined content identity.
#[derive(Debug)]
struct ResolvedSources {
    items: Vec<Source>,
    fingerprint: String,
}

/// One build in progress.
pub struct BuildJob<'a> {
    executor: &'a Executor,
    context: &'a BuildContext,
    dockerfile: Dockerfile,
    cancel: CancellationToken,
    phase: BuildPhase,
    state: Option<BuildState>,
    /// Index of the next statement to execute
    next: usize,
    /// Cleared at the first cache miss; later steps are never looked up
    cache_valid: bool,
}

impl<'a> BuildJob<'a> {
    pub fn phase(&self) -> &BuildPhase {
        &self.phase
    }

    pub fn state(&self) -> Option<&BuildState> {
        self.state.as_ref()
    }

    /// Run every remaining step and return the final image.
    pub async fn run(mut self) -> Result<ImageId> {
        while self.step().await? {}
        match self.phase {
            BuildPhase::Succeeded(image) => Ok(image),
            other => Err(BuildError::Runtime(format!(
                "Build ended in unexpected phase {:?}",
                other
            ))),
        }
    }

    /// Advance the build by one instruction, or finalize it once every
    /// instruction has run.
    ///
    /// Returns `false` when the build has succeeded. Once a step fails,
    /// every further call fails too.
    pub async fn step(&mut self) -> Result<bool> {
        match self.phase {
            BuildPhase::Succeeded(_) => return Ok(false),
            BuildPhase::Failed(ref message) => {
                return Err(BuildError::Runtime(format!(
                    "Build has already failed: {}",
                    message
                )))
            }
            _ => {}
        }

        let result = if self.next < self.dockerfile.len() {
            self.execute_next().await.map(|_| true)
        } else {
            self.finish().await.map(|_| false)
        };

        if let Err(ref e) = result {
            tracing::warn!(step = self.next + 1, error = %e, "Build step failed");
            self.phase = BuildPhase::Failed(e.to_string());
        }
        result
    }

    async fn execute_next(&mut self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }

        let statement = self.dockerfile.statements[self.next].clone();
        let step = self.next + 1;
        let total = self.dockerfile.len();

        let state = match statement.instruction {
            Instruction::From { ref image } => {
                self.progress(format_args!("Step {}/{} : FROM {}", step, total, image));
                let info = self.cancellable(self.executor.runtime.inspect(image)).await?;
                tracing::info!(step, image = %info.id, "Resolved base image");
                BuildState::new(info.id, info.config)
            }
            _ => {
                let mut state = self.state.take().ok_or_else(|| BuildError::Parse {
                    line: statement.line,
                    message: "Instruction before FROM".to_string(),
                })?;
                self.run_step(&statement, step, total, &mut state).await?;
                state
            }
        };

        self.progress(format_args!(" ---> {}", state.image.short()));
        self.phase = BuildPhase::Running {
            step,
            image: state.image.clone(),
            env: state.config.env.clone(),
        };
        self.state = Some(state);
        self.next += 1;
        Ok(())
    }

    async fn run_step(
        &mut self,
        statement: &Statement,
        step: usize,
        total: usize,
        state: &mut BuildState,
    ) -> Result<()> {
        let expanded = statement.instruction.expand(&state.config.env);
        self.progress(format_args!("Step {}/{} : {}", step, total, expanded));
        tracing::info!(step, instruction = %expanded.opcode(), "Executing step");

        let sources = match expanded {
            Instruction::Add { ref sources, .. } | Instruction::Copy { ref sources, .. } => {
                Some(self.resolve_sources(&expanded, sources, statement.line).await?)
            }
            _ => None,
        };
        let fingerprint = sources
            .as_ref()
            .map(|s| s.fingerprint.as_str())
            .unwrap_or("");

        let key = CacheKey::compute(&state.image, expanded.opcode(), &expanded.args(), fingerprint);
        let cache = &self.executor.cache;
        let _guard = self
            .cancellable(async { Ok(cache.lock(&key).await) })
            .await?;

        if let Some(cached) = self.lookup(&key).await {
            tracing::debug!(step, key = %key, image = %cached, "Cache hit");
            self.progress(format_args!(" ---> Using cache"));
            state.apply(&expanded);
            state.image = cached;
            return Ok(());
        }

        if self.cache_valid && self.executor.config.use_cache {
            tracing::debug!(step, key = %key, "Cache miss");
        }
        self.cache_valid = false;

        state.apply(&expanded);
        let image = self
            .commit_step(&expanded, statement.line, sources, state)
            .await?;
        self.record(&key, &image);
        state.image = image;
        Ok(())
    }

    /// Cached image for `key`, if lookups are still allowed and the
    /// runtime still knows the image.
    async fn lookup(&self, key: &CacheKey) -> Option<ImageId> {
        if !self.executor.config.use_cache || !self.cache_valid {
            return None;
        }
        let cached = self.executor.cache.lookup(key)?;
        match self.executor.runtime.inspect(cached.as_str()).await {
            Ok(_) => Some(cached),
            Err(e) => {
                tracing::warn!(image = %cached, error = %e, "Cached image is gone; rebuilding");
                None
            }
        }
    }

    fn record(&self, key: &CacheKey, image: &ImageId) {
        if let Err(e) = self.executor.cache.store(key, image) {
            tracing::warn!(key = %key, image = %image, error = %e, "Failed to store cache entry");
        }
    }

    async fn resolve_sources(
        &self,
        instruction: &Instruction,
        sources: &[String],
        line: usize,
    ) -> Result<ResolvedSources> {
        let mut items = Vec::with_capacity(sources.len());
        let mut identities = Vec::with_capacity(sources.len());

        for source in sources {
            if is_remote(source) {
                if matches!(instruction, Instruction::Copy { .. }) {
                    return Err(BuildError::Parse {
                        line,
                        message: format!("COPY does not accept remote sources: {}", source),
                    });
                }
                let fetched = self.cancellable(self.executor.fetcher.fetch(source)).await?;
                identities.push(sha256_fields(["url", fetched.digest.as_str()]));
                items.push(Source::Remote(fetched));
            } else {
                let entry = self.context.resolve(source)?;
                let kind = match entry.kind {
                    EntryKind::File => "file",
                    EntryKind::Directory => "dir",
                };
                let digest = self.context.fingerprint(&entry)?;
                identities.push(sha256_fields([kind, digest.as_str()]));
                items.push(Source::Local(entry));
            }
        }

        Ok(ResolvedSources {
            items,
            fingerprint: sha256_fields(identities.iter().map(String::as_str)),
        })
    }

    /// Run an instruction in a fresh container and commit the result.
    ///
    /// The container is always torn down on failure or cancellation, and
    /// after a successful commit when intermediates are not kept.
    async fn commit_step(
        &self,
        instruction: &Instruction,
        line: usize,
        sources: Option<ResolvedSources>,
        state: &BuildState,
    ) -> Result<ImageId> {
        let (command, created_by) = match instruction {
            Instruction::Run(form) => {
                let created_by = match form {
                    CommandForm::Shell(script) => format!("/bin/sh -c {}", script),
                    CommandForm::Exec(argv) => argv.join(" "),
                };
                (form.to_argv(), created_by)
            }
            other => {
                let nop = format!("#(nop) {}", other);
                (
                    vec!["/bin/sh".to_string(), "-c".to_string(), nop.clone()],
                    format!("/bin/sh -c {}", nop),
                )
            }
        };

        if self.cancel.is_cancelled() {
            return Err(BuildError::Cancelled);
        }
        let runtime = &self.executor.runtime;
        let container = runtime
            .create_container(&state.image, command.clone(), &state.config)
            .await?;
        tracing::debug!(container = %container, image = %state.image, "Created container");

        let outcome = match self
            .populate(&container, instruction, line, sources, state, &command)
            .await
        {
            Ok(()) => {
                self.cancellable(runtime.commit(&container, &state.config, &created_by))
                    .await
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok(image) => {
                if self.executor.config.remove_intermediate {
                    if let Err(e) = runtime.remove_container(&container).await {
                        tracing::warn!(container = %container, error = %e, "Failed to remove intermediate container");
                    }
                }
                Ok(image)
            }
            Err(e) => {
                self.teardown(&container).await;
                Err(e)
            }
        }
    }

    /// Apply the instruction's effect inside the container.
    async fn populate(
        &self,
        container: &ContainerId,
        instruction: &Instruction,
        line: usize,
        sources: Option<ResolvedSources>,
        state: &BuildState,
        command: &[String],
    ) -> Result<()> {
        let runtime = &self.executor.runtime;
        match instruction {
            Instruction::Run(_) => {
                let code = self.cancellable(runtime.start_and_wait(container)).await?;
                if code != 0 {
                    return Err(BuildError::Execution {
                        command: format!("[{}]", command.join(" ")),
                        code,
                    });
                }
            }
            Instruction::Add { dest, .. } | Instruction::Copy { dest, .. } => {
                let sources = sources.ok_or_else(|| BuildError::Parse {
                    line,
                    message: format!("{} has no sources", instruction.opcode()),
                })?;
                let files = self.stage(container, dest, line, sources, state).await?;
                tracing::debug!(container = %container, files = files.len(), "Staging files");
                self.cancellable(runtime.copy_into_container(container, files))
                    .await?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Work out where every source lands inside the container.
    async fn stage(
        &self,
        container: &ContainerId,
        dest: &str,
        line: usize,
        sources: ResolvedSources,
        state: &BuildState,
    ) -> Result<Vec<StagedFile>> {
        let target = resolve_container_path(state.config.workdir(), dest);
        let dir_hint = dest.ends_with('/') || dest == "." || dest.ends_with("/.");
        let target_dir = dir_hint
            || self
                .executor
                .runtime
                .is_directory(container, &target)
                .await?;
        let base = match target.trim_end_matches('/') {
            "" => "/".to_string(),
            trimmed => trimmed.to_string(),
        };

        if sources.items.len() > 1 && !target_dir {
            return Err(BuildError::Parse {
                line,
                message: format!(
                    "When using ADD or COPY with more than one source, the destination must be a directory: {}",
                    dest
                ),
            });
        }

        let mut files = Vec::new();
        for source in sources.items {
            match source {
                Source::Local(entry) if entry.is_dir() => {
                    files.push(StagedFile {
                        path: base.clone(),
                        source: StagedSource::Directory,
                        mode: entry.mode,
                    });
                    for item in self.context.walk(&entry)? {
                        let path = join_path(&base, &item.relative.to_string_lossy());
                        let source = match item.kind {
                            EntryKind::File => StagedSource::Host(item.path),
                            EntryKind::Directory => StagedSource::Directory,
                        };
                        files.push(StagedFile {
                            path,
                            source,
                            mode: item.mode,
                        });
                    }
                }
                Source::Local(entry) => {
                    let path = if target_dir {
                        join_path(&base, &entry.file_name())
                    } else {
                        base.clone()
                    };
                    files.push(StagedFile {
                        path,
                        source: StagedSource::Host(entry.path),
                        mode: entry.mode,
                    });
                }
                Source::Remote(fetched) => {
                    let path = if target_dir {
                        let name = fetched.file_name.as_deref().ok_or_else(|| BuildError::Parse {
                            line,
                            message: format!(
                                "Cannot determine a file name for {}; give the destination a file name",
                                fetched.url
                            ),
                        })?;
                        join_path(&base, name)
                    } else {
                        base.clone()
                    };
                    files.push(StagedFile {
                        path,
                        source: StagedSource::Bytes(fetched.bytes),
                        mode: REMOTE_FILE_MODE,
                    });
                }
            }
        }
        Ok(files)
    }

    /// Bake the final config onto the last image if it differs from what
    /// that image already carries.
    async fn finish(&mut self) -> Result<()> {
        let state = self.state.as_ref().ok_or_else(|| BuildError::Parse {
            line: 1,
            message: "No FROM instruction found".to_string(),
        })?;

        let current = self
            .cancellable(self.executor.runtime.inspect(state.image.as_str()))
            .await?;

        let image = if current.config == state.config {
            state.image.clone()
        } else {
            self.commit_config(state).await?
        };

        self.progress(format_args!("Successfully built {}", image.short()));
        tracing::info!(image = %image, "Build succeeded");
        self.phase = BuildPhase::Succeeded(image);
        Ok(())
    }

    async fn commit_config(&self, state: &BuildState) -> Result<ImageId> {
        let key = CacheKey::for_config(&state.image, &state.config)?;
        let cache = &self.executor.cache;
        let _guard = self
            .cancellable(async { Ok(cache.lock(&key).await) })
            .await?;
        if let Some(cached) = self.lookup(&key).await {
            return Ok(cached);
        }

        let runtime = &self.executor.runtime;
        let nop = "#(nop) config".to_string();
        let container = runtime
            .create_container(
                &state.image,
                vec!["/bin/sh".to_string(), "-c".to_string(), nop.clone()],
                &state.config,
            )
            .await?;
        let image = match self
            .cancellable(runtime.commit(&container, &state.config, &format!("/bin/sh -c {}", nop)))
            .await
        {
            Ok(image) => image,
            Err(e) => {
                self.teardown(&container).await;
                return Err(e);
            }
        };
        if let Err(e) = runtime.remove_container(&container).await {
            tracing::warn!(container = %container, error = %e, "Failed to remove intermediate container");
        }
        self.record(&key, &image);
        Ok(image)
    }

    async fn teardown(&self, container: &ContainerId) {
        if let Err(e) = self.executor.runtime.remove_container(container).await {
            tracing::warn!(container = %container, error = %e, "Failed to tear down container");
        } else {
            tracing::debug!(container = %container, "Tore down container");
        }
    }

    async fn cancellable<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(BuildError::Cancelled),
            result = fut => result,
        }
    }

    fn progress(&self, line: fmt::Arguments<'_>) {
        if !self.executor.config.quiet {
            println!("{}", line);
        }
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::StaticFetcher;
    use crate::runtime::MemoryRuntime;
    use tempfile::TempDir;

    fn executor(runtime: Arc<MemoryRuntime>) -> Executor {
        let config = BuilderConfig {
            quiet: true,
            ..Default::default()
        };
        Executor::new(
            config,
            runtime,
            Arc::new(StaticFetcher::new()),
            Arc::new(BuildCache::in_memory()),
        )
    }

    #[test]
    fn test_join_path() {
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/x/y", "a"), "/x/y/a");
    }

    #[tokio::test]
    async fn test_job_phases() {
        let runtime = Arc::new(MemoryRuntime::new());
        let exec = executor(runtime.clone());
        let tmp = TempDir::new().unwrap();
        let ctx = BuildContext::new(tmp.path()).unwrap();

        let df = Dockerfile::parse("FROM scratch\nENV A=1").unwrap();
        let mut job = exec.job(df, &ctx, CancellationToken::new());
        assert_eq!(job.phase(), &BuildPhase::NotStarted);

        assert!(job.step().await.unwrap());
        assert!(matches!(job.phase(), BuildPhase::Running { step: 1, .. }));

        assert!(job.step().await.unwrap());
        match job.phase() {
            BuildPhase::Running { step, env, .. } => {
                assert_eq!(*step, 2);
                assert_eq!(env.get("A"), Some("1"));
            }
            other => panic!("unexpected phase {:?}", other),
        }

        assert!(!job.step().await.unwrap());
        assert!(matches!(job.phase(), BuildPhase::Succeeded(_)));
        assert!(!job.step().await.unwrap());
    }

    #[tokio::test]
    async fn test_failed_job_stays_failed() {
        let runtime = Arc::new(MemoryRuntime::new());
        let exec = executor(runtime.clone());
        let tmp = TempDir::new().unwrap();
        let ctx = BuildContext::new(tmp.path()).unwrap();

        let df = Dockerfile::parse("FROM scratch\nRUN exit 3\nRUN true").unwrap();
        let mut job = exec.job(df, &ctx, CancellationToken::new());
        job.step().await.unwrap();

        let err = job.step().await.unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert!(matches!(job.phase(), BuildPhase::Failed(_)));
        assert!(job.step().await.is_err());
        assert_eq!(runtime.container_count(), 0);
        assert_eq!(exec.cache().active_locks(), 0);
    }

    #[tokio::test]
    async fn test_unknown_base_image() {
        let runtime = Arc::new(MemoryRuntime::new());
        let exec = executor(runtime);
        let tmp = TempDir::new().unwrap();
        let ctx = BuildContext::new(tmp.path()).unwrap();

        let err = exec.build("FROM nothere", &ctx).await.unwrap_err();
        assert!(matches!(err, BuildError::Runtime(_)));
    }

    #[tokio::test]
    async fn test_relative_destination_uses_workdir() {
        let runtime = Arc::new(MemoryRuntime::new());
        let exec = executor(runtime.clone());
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("app.py"), "print()").unwrap();
        let ctx = BuildContext::new(tmp.path()).unwrap();

        let image = exec
            .build("FROM scratch\nWORKDIR /srv\nCOPY app.py .\nCOPY app.py main.py", &ctx)
            .await
            .unwrap();
        assert_eq!(runtime.read_file(&image, "/srv/app.py"), Some(b"print()".to_vec()));
        assert_eq!(runtime.read_file(&image, "/srv/main.py"), Some(b"print()".to_vec()));
    }
}
