//! End-to-end build tests against the in-memory runtime.
//!
//! Every build here runs through [`Executor`] with a [`MemoryRuntime`] and
//! a [`StaticFetcher`], so no container tooling or network access is
//! needed.
//!
//! ## Running
//!
//! ```bash
//! cargo test -p strata-builder --test build
//! ```

use std::sync::Arc;
use std::time::Duration;

use strata_builder::{
    BuildCache, BuildContext, BuildError, BuilderConfig, Executor, ImageConfig, ImageId,
    MemoryRuntime, Runtime, StaticFetcher,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    runtime: Arc<MemoryRuntime>,
    fetcher: Arc<StaticFetcher>,
    executor: Executor,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(quiet())
    }

    fn with_config(config: BuilderConfig) -> Self {
        let runtime = Arc::new(MemoryRuntime::new());
        let fetcher = Arc::new(StaticFetcher::new());
        let executor = Executor::new(
            config,
            runtime.clone(),
            fetcher.clone(),
            Arc::new(BuildCache::in_memory()),
        );
        // Rooted two levels below `/` so `../../` lands exactly on `/`
        let dir = tempfile::Builder::new()
            .prefix("strata-ctx")
            .tempdir_in("/tmp")
            .unwrap();
        Self {
            runtime,
            fetcher,
            executor,
            dir,
        }
    }

    fn write(&self, path: &str, content: &str) {
        let full = self.dir.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    fn context(&self) -> BuildContext {
        BuildContext::new(self.dir.path()).unwrap()
    }

    async fn build(&self, dockerfile: &str) -> strata_builder::Result<ImageId> {
        self.executor.build(dockerfile, &self.context()).await
    }

    async fn config(&self, image: &ImageId) -> ImageConfig {
        self.runtime.inspect(image.as_str()).await.unwrap().config
    }
}

fn quiet() -> BuilderConfig {
    BuilderConfig {
        quiet: true,
        ..Default::default()
    }
}

fn read(h: &Harness, image: &ImageId, path: &str) -> Option<String> {
    h.runtime
        .read_file(image, path)
        .map(|b| String::from_utf8(b).unwrap())
}

// --- caching ---

#[tokio::test]
async fn test_rebuild_is_idempotent() {
    let h = Harness::new();
    h.write("app/main.sh", "echo hi");
    let dockerfile = "FROM scratch\nENV APP /app\nADD app $APP\nRUN true\nCMD [\"/app/main.sh\"]";

    let first = h.build(dockerfile).await.unwrap();
    let commits = h.runtime.commit_count();
    let second = h.build(dockerfile).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(h.runtime.commit_count(), commits);
}

#[tokio::test]
async fn test_content_change_invalidates_later_steps() {
    let h = Harness::new();
    h.write("conf.txt", "v1");
    let dockerfile = "FROM scratch\nRUN true\nADD conf.txt /etc/conf.txt\nRUN true\nENV DONE yes";

    let first = h.build(dockerfile).await.unwrap();
    let history_first = h.runtime.history(&first);

    h.write("conf.txt", "v2");
    let second = h.build(dockerfile).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(read(&h, &second, "/etc/conf.txt").as_deref(), Some("v2"));

    // Every step from the ADD onwards got a fresh commit
    let commits = h.runtime.commit_count();
    assert_eq!(commits, 4 + 3);
    assert_eq!(h.runtime.history(&second).len(), history_first.len());

    // Building the changed inputs again hits the cache recorded by the rebuild
    let third = h.build(dockerfile).await.unwrap();
    assert_eq!(third, second);
    assert_eq!(h.runtime.commit_count(), commits);
}

#[tokio::test]
async fn test_directory_content_change_invalidates() {
    let h = Harness::new();
    h.write("site/index.html", "<h1>a</h1>");
    h.write("site/css/app.css", "body{}");
    let dockerfile = "FROM scratch\nCOPY site /var/www";

    let first = h.build(dockerfile).await.unwrap();
    assert_eq!(h.build(dockerfile).await.unwrap(), first);

    h.write("site/css/app.css", "body{color:red}");
    let second = h.build(dockerfile).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(
        read(&h, &second, "/var/www/css/app.css").as_deref(),
        Some("body{color:red}")
    );
}

#[tokio::test]
async fn test_cache_disabled_always_executes() {
    let h = Harness::with_config(quiet().without_cache());
    let dockerfile = "FROM scratch\nRUN true";

    let first = h.build(dockerfile).await.unwrap();
    let second = h.build(dockerfile).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(h.runtime.commit_count(), 2);
    assert_eq!(h.runtime.started_commands().len(), 2);
}

#[tokio::test]
async fn test_persisted_cache_survives_new_executor() {
    let runtime = Arc::new(MemoryRuntime::new());
    let state = TempDir::new().unwrap();
    let ctx_dir = TempDir::new().unwrap();
    let context = BuildContext::new(ctx_dir.path()).unwrap();
    let config = BuilderConfig {
        cache_index: Some(state.path().join("cache").join("index.json")),
        ..quiet()
    };
    let dockerfile = "FROM scratch\nRUN true\nENV A 1";

    let first = {
        let executor = Executor::from_config(config.clone(), runtime.clone()).unwrap();
        executor.build(dockerfile, &context).await.unwrap()
    };
    let commits = runtime.commit_count();

    let executor = Executor::from_config(config, runtime.clone()).unwrap();
    assert_eq!(executor.cache().len(), 2);
    let second = executor.build(dockerfile, &context).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(runtime.commit_count(), commits);
}

#[tokio::test]
async fn test_cache_store_failure_does_not_fail_build() {
    let runtime = Arc::new(MemoryRuntime::new());
    let state = TempDir::new().unwrap();
    let blocker = state.path().join("not-a-dir");
    std::fs::write(&blocker, "x").unwrap();
    let config = BuilderConfig {
        cache_index: Some(blocker.join("index.json")),
        ..quiet()
    };
    let executor = Executor::from_config(config, runtime.clone()).unwrap();
    let context = BuildContext::new(state.path()).unwrap();

    let image = executor
        .build("FROM scratch\nRUN true", &context)
        .await
        .unwrap();
    assert!(runtime.inspect(image.as_str()).await.is_ok());
    assert_eq!(executor.cache().len(), 1);
}

#[tokio::test]
async fn test_concurrent_builds_share_cache() {
    let h = Harness::new();
    h.runtime.set_run_delay(Duration::from_millis(20));
    h.write("data.txt", "payload");
    let dockerfile = "FROM scratch\nRUN make\nADD data.txt /data.txt\nRUN make install";
    let context = h.context();

    let (a, b) = tokio::join!(
        h.executor.build(dockerfile, &context),
        h.executor.build(dockerfile, &context)
    );

    assert_eq!(a.unwrap(), b.unwrap());
    // One commit per step: the second build waited and then hit the cache
    assert_eq!(h.runtime.commit_count(), 3);
}

// --- build context ---

#[tokio::test]
async fn test_path_escape_is_rejected() {
    let h = Harness::new();
    let err = h
        .build("FROM scratch\nADD ../../ test/")
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Forbidden path outside the build context: ../../ (/)"
    );
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_missing_file_is_rejected() {
    let h = Harness::new();
    let err = h
        .build("FROM scratch\nADD foo /usr/local/bar")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "foo: no such file or directory");
    assert!(err.is_context_error());
}

#[cfg(unix)]
#[tokio::test]
async fn test_symlink_escape_is_rejected() {
    let h = Harness::new();
    std::os::unix::fs::symlink("/etc", h.dir.path().join("etc-link")).unwrap();
    let err = h
        .build("FROM scratch\nCOPY etc-link /x")
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::ForbiddenPath { .. }));
}

#[tokio::test]
async fn test_build_from_archive() {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, body) in [
        ("Dockerfile", "FROM scratch\nCOPY hello.txt /hello.txt\n"),
        ("hello.txt", "hello"),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, body.as_bytes())
            .unwrap();
    }
    let archive = builder.into_inner().unwrap();

    let h = Harness::new();
    let image = h
        .executor
        .build_archive(archive.as_slice(), None)
        .await
        .unwrap();
    assert_eq!(read(&h, &image, "/hello.txt").as_deref(), Some("hello"));
}

// --- ADD / COPY ---

#[tokio::test]
async fn test_directory_add_semantics() {
    let h = Harness::new();
    h.write("d/ga", "bu");
    h.write("f", "single");

    let image = h
        .build("FROM scratch\nADD d /somewhere\nADD d /elsewhere/\nADD f /x/y/d/")
        .await
        .unwrap();

    assert_eq!(read(&h, &image, "/somewhere/ga").as_deref(), Some("bu"));
    assert_eq!(read(&h, &image, "/elsewhere/ga").as_deref(), Some("bu"));
    assert_eq!(read(&h, &image, "/x/y/d/f").as_deref(), Some("single"));
    assert!(h.runtime.is_dir(&image, "/somewhere"));
}

#[tokio::test]
async fn test_file_into_existing_directory() {
    let h = Harness::new();
    h.runtime.add_base_image(
        "base",
        ImageConfig::default(),
        [("/etc/app/defaults.conf", "x")],
    );
    h.write("local.conf", "y");

    let image = h
        .build("FROM base\nCOPY local.conf /etc/app\nCOPY local.conf /etc/renamed.conf")
        .await
        .unwrap();

    assert_eq!(read(&h, &image, "/etc/app/local.conf").as_deref(), Some("y"));
    assert_eq!(read(&h, &image, "/etc/app/defaults.conf").as_deref(), Some("x"));
    assert_eq!(read(&h, &image, "/etc/renamed.conf").as_deref(), Some("y"));
}

#[tokio::test]
async fn test_multiple_sources_need_directory() {
    let h = Harness::new();
    h.write("a", "1");
    h.write("b", "2");

    let err = h
        .build("FROM scratch\nCOPY a b /target")
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Parse { line: 2, .. }));
    assert_eq!(h.runtime.container_count(), 0);

    let image = h.build("FROM scratch\nCOPY a b /target/").await.unwrap();
    assert_eq!(read(&h, &image, "/target/a").as_deref(), Some("1"));
    assert_eq!(read(&h, &image, "/target/b").as_deref(), Some("2"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_copy_preserves_mode() {
    use std::os::unix::fs::PermissionsExt;

    let h = Harness::new();
    h.write("run.sh", "#!/bin/sh");
    std::fs::set_permissions(
        h.dir.path().join("run.sh"),
        std::fs::Permissions::from_mode(0o755),
    )
    .unwrap();

    let image = h.build("FROM scratch\nCOPY run.sh /bin/").await.unwrap();
    assert_eq!(h.runtime.file_mode(&image, "/bin/run.sh"), Some(0o755));
}

#[tokio::test]
async fn test_remote_add() {
    let h = Harness::new();
    h.fetcher
        .insert("http://files.example.com/pkg/tool.tar", "remote-bytes");

    let image = h
        .build(
            "FROM scratch\n\
             ADD http://files.example.com/pkg/tool.tar /opt/\n\
             ADD http://files.example.com/pkg/tool.tar /opt/renamed",
        )
        .await
        .unwrap();

    assert_eq!(
        read(&h, &image, "/opt/tool.tar").as_deref(),
        Some("remote-bytes")
    );
    assert_eq!(
        read(&h, &image, "/opt/renamed").as_deref(),
        Some("remote-bytes")
    );
    assert_eq!(h.runtime.file_mode(&image, "/opt/tool.tar"), Some(0o600));
}

#[tokio::test]
async fn test_remote_add_query_and_bare_host() {
    let h = Harness::new();
    h.fetcher.insert("http://files.example.com/x?foo=bar", "query");
    h.fetcher.insert("http://files.example.com", "index");

    let image = h
        .build(
            "FROM scratch\n\
             ADD http://files.example.com/x?foo=bar /\n\
             ADD http://files.example.com /e",
        )
        .await
        .unwrap();

    assert_eq!(read(&h, &image, "/x").as_deref(), Some("query"));
    assert_eq!(read(&h, &image, "/e").as_deref(), Some("index"));
    assert!(!h.runtime.is_dir(&image, "/e"));
}

#[tokio::test]
async fn test_remote_add_bare_host_into_directory() {
    let h = Harness::new();
    h.fetcher.insert("http://files.example.com", "index");

    let err = h
        .build("FROM scratch\nADD http://files.example.com /srv/")
        .await
        .unwrap_err();

    assert!(matches!(err, BuildError::Parse { line: 2, .. }));
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.runtime.commit_count(), 0);
}

#[tokio::test]
async fn test_remote_content_change_invalidates() {
    let h = Harness::new();
    let url = "http://files.example.com/v.txt";
    let dockerfile = format!("FROM scratch\nADD {} /v.txt", url);

    h.fetcher.insert(url, "1");
    let first = h.build(&dockerfile).await.unwrap();
    assert_eq!(h.build(&dockerfile).await.unwrap(), first);

    h.fetcher.insert(url, "2");
    let second = h.build(&dockerfile).await.unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_remote_fetch_failure() {
    let h = Harness::new();
    let err = h
        .build("FROM scratch\nRUN true\nADD http://files.example.com/missing /m")
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BuildError::Network {
            status: Some(404),
            ..
        }
    ));
    assert_eq!(h.runtime.commit_count(), 1);
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_copy_rejects_url() {
    let h = Harness::new();
    h.fetcher.insert("http://files.example.com/a", "a");
    let err = h
        .build("FROM scratch\nCOPY http://files.example.com/a /a")
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Parse { line: 2, .. }));
}

// --- environment and config ---

#[tokio::test]
async fn test_env_override_is_visible_to_run() {
    let h = Harness::new();
    let image = h
        .build("FROM scratch\nENV FOO BAR\nENV FOO BAZ\nRUN [ \"$FOO\" = \"BAZ\" ]")
        .await
        .unwrap();
    assert_eq!(h.config(&image).await.env.get("FOO"), Some("BAZ"));

    let err = h
        .build("FROM scratch\nENV FOO BAR\nRUN [ \"$FOO\" = \"BAZ\" ]")
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(1));
}

#[tokio::test]
async fn test_env_references_earlier_values() {
    let h = Harness::new();
    h.write("bin/tool", "x");
    let image = h
        .build(
            "FROM scratch\n\
             ENV BAR hello\n\
             ENV BAZ $BAR\n\
             ENV FOO /opt\n\
             ENV PATH /usr/bin:$FOO\n\
             ADD bin ${FOO}/bin",
        )
        .await
        .unwrap();

    let config = h.config(&image).await;
    assert_eq!(config.env.get("BAZ"), Some("hello"));
    assert_eq!(config.env.get("PATH"), Some("/usr/bin:/opt"));
    assert_eq!(read(&h, &image, "/opt/bin/tool").as_deref(), Some("x"));
}

#[tokio::test]
async fn test_entrypoint_clears_stale_cmd() {
    let h = Harness::new();
    h.runtime.add_base_image(
        "shell",
        ImageConfig {
            cmd: vec!["/bin/bash".to_string()],
            ..Default::default()
        },
        Vec::<(String, Vec<u8>)>::new(),
    );
    h.write("app", "bin");
    let dockerfile = "FROM shell\nRUN true\nADD app /app\nENTRYPOINT [\"/app\"]";

    for _ in 0..2 {
        let image = h.build(dockerfile).await.unwrap();
        let config = h.config(&image).await;
        assert_eq!(config.entrypoint, vec!["/app".to_string()]);
        assert!(config.cmd.is_empty());
    }
}

#[tokio::test]
async fn test_explicit_cmd_survives_entrypoint() {
    let h = Harness::new();
    let image = h
        .build("FROM scratch\nCMD [\"--help\"]\nENTRYPOINT [\"/app\"]")
        .await
        .unwrap();
    let config = h.config(&image).await;
    assert_eq!(config.cmd, vec!["--help".to_string()]);
    assert_eq!(config.entrypoint, vec!["/app".to_string()]);
}

#[tokio::test]
async fn test_shell_form_cmd() {
    let h = Harness::new();
    let image = h.build("FROM scratch\nCMD echo hi").await.unwrap();
    assert_eq!(
        h.config(&image).await.cmd,
        vec!["/bin/sh".to_string(), "-c".to_string(), "echo hi".to_string()]
    );
}

#[tokio::test]
async fn test_scalar_and_set_fields() {
    let h = Harness::new();
    let image = h
        .build(
            "FROM scratch\n\
             MAINTAINER Ops Team <ops@example.com>\n\
             USER daemon\n\
             WORKDIR /srv\n\
             WORKDIR app\n\
             EXPOSE 80 443\n\
             EXPOSE 80\n\
             VOLUME [\"/data\", \"/logs\"]\n\
             VOLUME /data",
        )
        .await
        .unwrap();

    let config = h.config(&image).await;
    assert_eq!(config.author, "Ops Team <ops@example.com>");
    assert_eq!(config.user, "daemon");
    assert_eq!(config.working_dir, "/srv/app");
    assert_eq!(
        config.exposed_ports.iter().collect::<Vec<_>>(),
        vec!["443", "80"]
    );
    assert_eq!(
        config.volumes.iter().collect::<Vec<_>>(),
        vec!["/data", "/logs"]
    );
}

#[tokio::test]
async fn test_inherits_config_from_built_image() {
    let h = Harness::new();
    let parent = h
        .build("FROM scratch\nENV LANG C.UTF-8\nEXPOSE 8080\nVOLUME /data\nCMD [\"serve\"]")
        .await
        .unwrap();

    let child = h
        .build(&format!("FROM {}\nEXPOSE 9090", parent))
        .await
        .unwrap();
    let config = h.config(&child).await;

    assert_eq!(config.env.get("LANG"), Some("C.UTF-8"));
    assert!(config.exposed_ports.contains("8080"));
    assert!(config.exposed_ports.contains("9090"));
    assert!(config.volumes.contains("/data"));
    assert_eq!(config.cmd, vec!["serve".to_string()]);
}

#[tokio::test]
async fn test_from_only_returns_base() {
    let h = Harness::new();
    let base = h
        .runtime
        .add_base_image("alpine", ImageConfig::default(), [("/etc/os-release", "alpine")]);
    assert_eq!(h.build("FROM alpine").await.unwrap(), base);
    assert_eq!(h.runtime.commit_count(), 0);
}

// --- failures ---

#[tokio::test]
async fn test_run_exit_code_is_exposed() {
    let h = Harness::new();
    let err = h
        .build("FROM scratch\nRUN sh -c \"exit 23\"")
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(23));
    assert!(matches!(err, BuildError::Execution { code: 23, .. }));
    assert_eq!(h.runtime.container_count(), 0);
}

#[tokio::test]
async fn test_earlier_layers_stay_cached_after_failure() {
    let h = Harness::new();
    h.runtime.fail_when("make test", 2);

    let err = h
        .build("FROM scratch\nRUN make\nRUN make test")
        .await
        .unwrap_err();
    assert_eq!(err.exit_code(), Some(2));
    assert_eq!(h.runtime.commit_count(), 1);

    h.build("FROM scratch\nRUN make\nRUN true").await.unwrap();
    assert_eq!(h.runtime.commit_count(), 2);
}

#[tokio::test]
async fn test_empty_dockerfile() {
    let h = Harness::new();
    for text in ["", "   \n\t\n"] {
        let err = h.build(text).await.unwrap_err();
        assert!(matches!(err, BuildError::EmptyDockerfile));
    }
}

#[tokio::test]
async fn test_missing_from() {
    let h = Harness::new();
    let err = h.build("# only a comment\n").await.unwrap_err();
    assert!(matches!(err, BuildError::Parse { .. }));

    let err = h.build("RUN true").await.unwrap_err();
    assert!(matches!(err, BuildError::Parse { line: 1, .. }));
    assert_eq!(h.runtime.started_commands().len(), 0);
}

#[tokio::test]
async fn test_cancellation_tears_down_container() {
    let h = Harness::new();
    h.runtime.set_run_delay(Duration::from_secs(30));
    let context = h.context();
    let cancel = CancellationToken::new();

    let (result, _) = tokio::join!(
        h.executor
            .build_with_cancel("FROM scratch\nRUN sleep 30", &context, cancel.clone()),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        }
    );

    assert!(matches!(result, Err(BuildError::Cancelled)));
    assert_eq!(h.runtime.container_count(), 0);
    assert_eq!(h.runtime.commit_count(), 0);
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let h = Harness::new();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = h
        .executor
        .build_with_cancel("FROM scratch", &h.context(), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, BuildError::Cancelled));
}

#[tokio::test]
async fn test_dockerfile_from_context_dir() {
    let h = Harness::new();
    h.write("Dockerfile", "FROM scratch\nRUN true\n");
    let context = h.context();
    let text = context.read_dockerfile(None).unwrap();
    let image = h.executor.build(&text, &context).await.unwrap();
    assert!(context.root().is_dir());
    assert_eq!(h.runtime.history(&image).len(), 2);
}
