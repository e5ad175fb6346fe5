/// Backup run driver
///
/// One run walks `Enumerating → ProcessingWorkload(i) → Finalizing → HandingOff → Done`.
/// A database dump that exhausts its retries, a catalog that fails validation, or a
/// sink failure aborts the run. Everything else (a vanished workload, a volume that
/// cannot be archived) is logged and the run continues.
///
/// The working directory is a `TempDir`: it is removed when the run future completes
/// or is dropped, whichever exit path is taken.

use chrono::Utc;
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;

use crate::core::archiver::{ArchiveOutcome, Archiver, DedupSet};
use crate::core::catalog::{Catalog, CatalogBuilder, CatalogError};
use crate::core::classifier::{classify, EngineKind};
use crate::core::dump::{trigger_redis_save, DumpArtifact, DumpError, Dumper, RedisSave};
use crate::core::process::ProcessRunner;
use crate::core::retry::RetryPolicy;
use crate::core::runtime::{ResourceKind, RuntimeError, Workload, WorkloadRuntime};
use crate::core::sink::{ArchivalSink, SinkError};
use crate::utils::{
    format_bytes, run_archive_name, AppConfig, ConfigError, BINDS_DIR, DUMPS_DIR, VOLUMES_DIR,
    WORKDIR_PREFIX,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Enumerating,
    ProcessingWorkload(usize),
    Finalizing,
    HandingOff,
    Done,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Enumerating => f.write_str("enumerating"),
            RunState::ProcessingWorkload(i) => write!(f, "processing workload #{}", i),
            RunState::Finalizing => f.write_str("finalizing"),
            RunState::HandingOff => f.write_str("handing off"),
            RunState::Done => f.write_str("done"),
            RunState::Aborted => f.write_str("aborted"),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("could not create working directory under {path}: {source}")]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not enumerate workloads: {0}")]
    Enumerate(#[source] RuntimeError),

    #[error("dump of {engine} workload {workload} failed: {source}")]
    Dump {
        workload: String,
        engine: EngineKind,
        #[source]
        source: DumpError,
    },

    #[error("could not record workload {workload} in the catalog: {source}")]
    Record {
        workload: String,
        #[source]
        source: CatalogError,
    },

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("hand-off to the archival sink failed: {0}")]
    Sink(#[from] SinkError),
}

impl RunError {
    /// State the run was in when it aborted
    pub fn failed_in(&self) -> &'static str {
        match self {
            RunError::Workdir { .. } | RunError::Enumerate(_) => "enumerating",
            RunError::Dump { .. } | RunError::Record { .. } => "processing",
            RunError::Catalog(_) => "finalizing",
            RunError::Sink(_) => "handing off",
        }
    }
}

/// Settings for one run
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub work_root: PathBuf,
    pub hostname: String,
    pub archive_name_prefix: String,
    pub archive_image: String,
    pub exclude: Vec<Regex>,
    pub retry: RetryPolicy,
    pub dump_timeout: Duration,
    pub archive_timeout: Duration,
    pub redis_save_timeout: Duration,
}

impl RunSettings {
    pub fn from_config(config: &AppConfig, hostname: impl Into<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            work_root: config.work_root.clone(),
            hostname: hostname.into(),
            archive_name_prefix: config.archive_name_prefix.clone(),
            archive_image: config.archive_image.clone(),
            exclude: config.exclude_patterns()?,
            retry: RetryPolicy::new(config.retry.max_attempts, config.retry.initial_delay),
            dump_timeout: config.timeouts.dump,
            archive_timeout: config.timeouts.archive,
            redis_save_timeout: config.timeouts.redis_save,
        })
    }
}

/// A resource left out of the catalog
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNote {
    pub workload: String,
    pub kind: ResourceKind,
    pub identity: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    pub snapshot_id: String,
    pub archive_name: String,
    pub catalog: Catalog,
    pub dumps: Vec<DumpArtifact>,
    pub skipped_workloads: Vec<String>,
    pub skipped_resources: Vec<ResourceNote>,
    pub failed_resources: Vec<ResourceNote>,
    pub redis: Vec<(String, RedisSave)>,
}

/// Facts gathered while processing workloads
#[derive(Debug, Default)]
struct Progress {
    dumps: Vec<DumpArtifact>,
    skipped_workloads: Vec<String>,
    skipped_resources: Vec<ResourceNote>,
    failed_resources: Vec<ResourceNote>,
    redis: Vec<(String, RedisSave)>,
}

pub struct Orchestrator<'a> {
    runtime: &'a dyn WorkloadRuntime,
    runner: &'a dyn ProcessRunner,
    sink: &'a dyn ArchivalSink,
    settings: RunSettings,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        runtime: &'a dyn WorkloadRuntime,
        runner: &'a dyn ProcessRunner,
        sink: &'a dyn ArchivalSink,
        settings: RunSettings,
    ) -> Self {
        Self {
            runtime,
            runner,
            sink,
            settings,
        }
    }

    /// Execute one backup run
    pub async fn run(&self) -> Result<RunReport, RunError> {
        let workdir = tempfile::Builder::new()
            .prefix(WORKDIR_PREFIX)
            .tempdir_in(&self.settings.work_root)
            .map_err(|source| RunError::Workdir {
                path: self.settings.work_root.clone(),
                source,
            })?;

        let result = self.execute(&workdir).await;

        if let Err(err) = &result {
            tracing::error!(
                state = %RunState::Aborted,
                failed_in = err.failed_in(),
                error = %err,
                "backup run aborted"
            );
        }

        let path = workdir.path().to_path_buf();
        if let Err(err) = workdir.close() {
            tracing::warn!(path = %path.display(), error = %err, "could not remove working directory");
        }

        result
    }

    fn enter(&self, state: RunState) {
        tracing::info!(state = %state, "run state");
    }

    async fn execute(&self, workdir: &TempDir) -> Result<RunReport, RunError> {
        let started = Utc::now();
        let root = workdir.path();
        for sub in [DUMPS_DIR, VOLUMES_DIR, BINDS_DIR] {
            std::fs::create_dir_all(root.join(sub)).map_err(|source| RunError::Workdir {
                path: root.join(sub),
                source,
            })?;
        }

        self.enter(RunState::Enumerating);
        let ids = self.enumerate().await?;
        tracing::info!(count = ids.len(), "workloads to process");

        let mut builder = CatalogBuilder::begin(self.settings.hostname.as_str());
        let mut dedup = DedupSet::new();
        let mut progress = Progress::default();

        for (index, id) in ids.iter().enumerate() {
            self.enter(RunState::ProcessingWorkload(index));
            self.process_workload(id, root, &mut builder, &mut dedup, &mut progress)
                .await?;
        }

        self.enter(RunState::Finalizing);
        let promoted = builder.finalize(root, started)?;
        tracing::info!(
            path = %promoted.path.display(),
            workloads = promoted.catalog.containers.len(),
            volumes = promoted.catalog.backed_up_volumes.len(),
            binds = promoted.catalog.backed_up_binds.len(),
            "catalog written"
        );

        self.enter(RunState::HandingOff);
        let archive_name = run_archive_name(
            &self.settings.archive_name_prefix,
            &self.settings.hostname,
            started,
        );
        let mut sources = BTreeMap::new();
        sources.insert(archive_name.clone(), root.to_path_buf());
        let snapshot_id = self.sink.submit(&sources).await?;
        tracing::info!(archive = %archive_name, snapshot = %snapshot_id, "archive stored");

        self.enter(RunState::Done);
        Ok(RunReport {
            state: RunState::Done,
            snapshot_id,
            archive_name,
            catalog: promoted.catalog,
            dumps: progress.dumps,
            skipped_workloads: progress.skipped_workloads,
            skipped_resources: progress.skipped_resources,
            failed_resources: progress.failed_resources,
            redis: progress.redis,
        })
    }

    async fn enumerate(&self) -> Result<Vec<String>, RunError> {
        let ids = self
            .runtime
            .list_running()
            .await
            .map_err(RunError::Enumerate)?;

        Ok(ids
            .into_iter()
            .filter(|id| {
                let excluded = self.settings.exclude.iter().any(|re| re.is_match(id));
                if excluded {
                    tracing::info!(workload = %id, "excluded by configuration");
                }
                !excluded
            })
            .collect())
    }

    async fn process_workload(
        &self,
        id: &str,
        root: &Path,
        builder: &mut CatalogBuilder,
        dedup: &mut DedupSet,
        progress: &mut Progress,
    ) -> Result<(), RunError> {
        let workload = match self.runtime.inspect(id).await {
            Ok(workload) => workload,
            Err(err) => {
                tracing::warn!(workload = %id, error = %err, "skipping workload that could not be inspected");
                progress.skipped_workloads.push(id.to_string());
                return Ok(());
            }
        };

        let engine = classify(&workload.image);
        tracing::info!(
            workload = %workload.id,
            image = %workload.image,
            engine = engine.map(|e| e.as_str()).unwrap_or("none"),
            resources = workload.resources.len(),
            "processing workload"
        );

        match engine {
            Some(EngineKind::Redis) => {
                tracing::info!(
                    workload = %workload.id,
                    engine = "redis",
                    "redis is treated as an ephemeral cache, no dump is taken"
                );
                let save = trigger_redis_save(self.runtime, &workload, self.settings.redis_save_timeout).await;
                progress.redis.push((workload.id.clone(), save));
            }
            Some(engine) => {
                let dumper = Dumper::new(self.runtime, self.settings.retry, self.settings.dump_timeout);
                let artifact = dumper
                    .dump(&workload, engine, &root.join(DUMPS_DIR))
                    .await
                    .map_err(|source| RunError::Dump {
                        workload: workload.id.clone(),
                        engine,
                        source,
                    })?;
                tracing::info!(
                    workload = %workload.id,
                    engine = %engine,
                    size = %format_bytes(artifact.size),
                    "database dumped"
                );
                progress.dumps.push(artifact);
            }
            None => {}
        }

        let (volumes, binds) = self.archive_resources(&workload, root, dedup, progress).await;

        builder
            .add_workload(
                &workload.id,
                &workload.image,
                volumes,
                binds,
                workload.env.clone(),
                engine,
            )
            .map_err(|source| RunError::Record {
                workload: workload.id.clone(),
                source,
            })?;
        Ok(())
    }

    /// Archive each resource once per run; returns the identities that have an archive
    async fn archive_resources(
        &self,
        workload: &Workload,
        root: &Path,
        dedup: &mut DedupSet,
        progress: &mut Progress,
    ) -> (Vec<String>, Vec<String>) {
        let archiver = Archiver::new(
            self.runner,
            self.settings.archive_image.as_str(),
            self.settings.archive_timeout,
        );
        let mut volumes: Vec<String> = Vec::new();
        let mut binds: Vec<String> = Vec::new();

        for resource in &workload.resources {
            let list = match resource.kind {
                ResourceKind::Volume => &mut volumes,
                ResourceKind::Bind => &mut binds,
            };
            if list.contains(&resource.identity) {
                continue;
            }

            if let Some(artifact) = dedup.get(resource) {
                tracing::debug!(
                    workload = %workload.id,
                    resource = %resource.identity,
                    artifact = %artifact.display(),
                    "already archived in this run"
                );
                list.push(resource.identity.clone());
                continue;
            }

            let outcome = match resource.kind {
                ResourceKind::Volume => archiver
                    .archive_volume(&resource.identity, &root.join(VOLUMES_DIR))
                    .await
                    .map(ArchiveOutcome::Archived),
                ResourceKind::Bind => {
                    archiver
                        .archive_bind(&resource.identity, &root.join(BINDS_DIR))
                        .await
                }
            };

            match outcome {
                Ok(ArchiveOutcome::Archived(path)) => {
                    tracing::info!(
                        workload = %workload.id,
                        resource = %resource.identity,
                        kind = %resource.kind,
                        "archived"
                    );
                    dedup.insert(resource, path);
                    list.push(resource.identity.clone());
                }
                Ok(ArchiveOutcome::ControlPlane) => {
                    tracing::info!(
                        workload = %workload.id,
                        resource = %resource.identity,
                        kind = %resource.kind,
                        "skipping control-plane mount"
                    );
                    progress.skipped_resources.push(ResourceNote {
                        workload: workload.id.clone(),
                        kind: resource.kind,
                        identity: resource.identity.clone(),
                        reason: "control-plane mount".to_string(),
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        workload = %workload.id,
                        resource = %resource.identity,
                        kind = %resource.kind,
                        error = %err,
                        "archiving failed, leaving resource out of the catalog"
                    );
                    progress.failed_resources.push(ResourceNote {
                        workload: workload.id.clone(),
                        kind: resource.kind,
                        identity: resource.identity.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        (volumes, binds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runtime::Resource;
    use crate::core::sink::MockArchivalSink;
    use crate::core::testing::{ExecBehavior, FakeRunner, FakeRuntime};
    use crate::utils::parse_env_pairs;
    use std::sync::{Arc, Mutex};

    fn workload(id: &str, image: &str, env: &[&str], resources: Vec<Resource>) -> Workload {
        Workload {
            id: id.to_string(),
            image: image.to_string(),
            env: parse_env_pairs(env.iter().copied()),
            resources,
        }
    }

    fn settings(work_root: &Path) -> RunSettings {
        RunSettings {
            work_root: work_root.to_path_buf(),
            hostname: "test-host".to_string(),
            archive_name_prefix: "containers".to_string(),
            archive_image: "alpine:3".to_string(),
            exclude: Vec::new(),
            retry: RetryPolicy::default(),
            dump_timeout: Duration::from_secs(600),
            archive_timeout: Duration::from_secs(600),
            redis_save_timeout: Duration::from_secs(10),
        }
    }

    /// Relative paths of every file under `root`
    fn list_files(root: &Path) -> Vec<String> {
        fn walk(dir: &Path, root: &Path, out: &mut Vec<String>) {
            for entry in std::fs::read_dir(dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    walk(&path, root, out);
                } else {
                    out.push(path.strip_prefix(root).unwrap().display().to_string());
                }
            }
        }
        let mut out = Vec::new();
        walk(root, root, &mut out);
        out.sort();
        out
    }

    /// Sink that records the files it was handed
    fn recording_sink(seen: Arc<Mutex<Vec<String>>>) -> MockArchivalSink {
        let mut sink = MockArchivalSink::new();
        sink.expect_submit().times(1).returning(move |sources| {
            assert_eq!(sources.len(), 1);
            let (name, path) = sources.iter().next().unwrap();
            assert!(name.starts_with("containers-test-host-"));
            *seen.lock().unwrap() = list_files(path);
            Ok("snap-1".to_string())
        });
        sink
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_shared_volume_postgres_redis_web() {
        let work_root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::with_workloads(vec![
            workload(
                "app-db",
                "postgres:16",
                &["POSTGRES_USER=app", "POSTGRES_DB=appdb"],
                vec![Resource::volume("shared-data", "/var/lib/postgresql/data")],
            ),
            workload("cache", "redis:7", &[], vec![Resource::volume("redis-data", "/data")]),
            workload("web", "nginx:1.25", &[], vec![Resource::volume("shared-data", "/srv")]),
        ]);
        runtime.set_exec("app-db", ExecBehavior::Output(vec![b'P'; 4096]));
        runtime.set_exec("cache", ExecBehavior::Output(b"save\n\n".to_vec()));
        let runner = FakeRunner::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = recording_sink(seen.clone());

        let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings(work_root.path()));
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.state, RunState::Done);
        assert_eq!(report.snapshot_id, "snap-1");
        assert_eq!(report.catalog.containers.len(), 3);

        // one dump, named after the postgres workload
        assert_eq!(report.dumps.len(), 1);
        let files = seen.lock().unwrap().clone();
        assert!(files.contains(&"dumps/app-db.dump".to_string()));
        assert!(!files.iter().any(|f| f.starts_with("dumps/cache")));
        assert!(files.contains(&"catalog.json".to_string()));

        // the pg_dump invocation carried the workload's own credentials
        let request = runtime.last_request("app-db").unwrap();
        assert!(request.argv.contains(&"app".to_string()));
        assert!(request.argv.contains(&"appdb".to_string()));

        // shared volume archived once, listed once
        let volume_runs = runner
            .calls()
            .iter()
            .filter(|c| c.args.contains(&"shared-data:/source:ro".to_string()))
            .count();
        assert_eq!(volume_runs, 1);
        assert_eq!(
            report.catalog.backed_up_volumes.iter().filter(|v| *v == "shared-data").count(),
            1
        );
        assert_eq!(report.catalog.entry("web").unwrap().volumes, vec!["shared-data"]);

        let db = report.catalog.entry("app-db").unwrap();
        assert!(db.is_database);
        assert_eq!(db.db_type, Some(EngineKind::Postgres));
        let cache = report.catalog.entry("cache").unwrap();
        assert_eq!(cache.db_type, Some(EngineKind::Redis));
        assert_eq!(report.redis.len(), 1);

        // working directory is gone
        assert!(std::fs::read_dir(work_root.path()).unwrap().next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_dump_failure_aborts() {
        let work_root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::with_workloads(vec![
            workload("web", "nginx", &[], vec![Resource::volume("www", "/srv")]),
            workload("app-db", "postgres:16", &[], vec![]),
        ]);
        runtime.set_exec("app-db", ExecBehavior::Fail("FATAL: password authentication failed".to_string()));
        let runner = FakeRunner::default();
        let mut sink = MockArchivalSink::new();
        sink.expect_submit().times(0);

        let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings(work_root.path()));
        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(err, RunError::Dump { engine: EngineKind::Postgres, .. }));
        assert_eq!(err.failed_in(), "processing");
        assert_eq!(runtime.exec_count("app-db"), 3);
        // no catalog promoted anywhere, working directory removed
        assert!(std::fs::read_dir(work_root.path()).unwrap().next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scenario_control_plane_bind_skipped() {
        let work_root = tempfile::tempdir().unwrap();
        let app_dir = tempfile::tempdir().unwrap();
        let app_path = app_dir.path().display().to_string();
        let runtime = FakeRuntime::with_workloads(vec![workload(
            "agent",
            "portainer/agent",
            &[],
            vec![
                Resource::bind("/var/run/docker.sock", "/var/run/docker.sock"),
                Resource::bind(app_path.as_str(), "/config"),
            ],
        )]);
        let runner = FakeRunner::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = recording_sink(seen);

        let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings(work_root.path()));
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.skipped_resources.len(), 1);
        assert_eq!(report.skipped_resources[0].identity, "/var/run/docker.sock");
        assert!(!report.catalog.backed_up_binds.contains("/var/run/docker.sock"));
        assert!(report.catalog.backed_up_binds.contains(&app_path));
        assert_eq!(report.catalog.entry("agent").unwrap().binds, vec![app_path]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_archive_failure_is_not_fatal() {
        let work_root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::with_workloads(vec![workload(
            "web",
            "nginx",
            &[],
            vec![Resource::volume("broken-vol", "/a"), Resource::volume("good-vol", "/b")],
        )]);
        let runner = FakeRunner::default();
        runner.fail_when("broken-vol");
        let sink = recording_sink(Arc::new(Mutex::new(Vec::new())));

        let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings(work_root.path()));
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.failed_resources.len(), 1);
        assert_eq!(report.failed_resources[0].identity, "broken-vol");
        assert_eq!(
            report.catalog.backed_up_volumes.iter().cloned().collect::<Vec<_>>(),
            vec!["good-vol".to_string()]
        );
        assert_eq!(report.catalog.entry("web").unwrap().volumes, vec!["good-vol"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vanished_and_excluded_workloads_are_skipped() {
        let work_root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::with_workloads(vec![
            workload("gone", "nginx", &[], vec![]),
            workload("buildkit-1", "moby/buildkit", &[], vec![]),
            workload("web", "nginx", &[], vec![]),
        ]);
        runtime.vanish("gone");
        let runner = FakeRunner::default();
        let sink = recording_sink(Arc::new(Mutex::new(Vec::new())));
        let mut settings = settings(work_root.path());
        settings.exclude = vec![Regex::new("^buildkit").unwrap()];

        let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings);
        let report = orchestrator.run().await.unwrap();

        assert_eq!(report.skipped_workloads, vec!["gone".to_string()]);
        let ids: Vec<&str> = report.catalog.containers.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["web"]);
    }

    #[tokio::test]
    async fn test_no_workloads_still_hands_off_empty_catalog() {
        let work_root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::default();
        let runner = FakeRunner::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = recording_sink(seen.clone());

        let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings(work_root.path()));
        let report = orchestrator.run().await.unwrap();

        assert!(report.catalog.containers.is_empty());
        assert_eq!(*seen.lock().unwrap(), vec!["catalog.json".to_string()]);
    }

    #[tokio::test]
    async fn test_sink_failure_aborts() {
        let work_root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::with_workloads(vec![workload("web", "nginx", &[], vec![])]);
        let runner = FakeRunner::default();
        let mut sink = MockArchivalSink::new();
        sink.expect_submit()
            .times(1)
            .returning(|_| Err(SinkError::Output("repository locked".to_string())));

        let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings(work_root.path()));
        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(err, RunError::Sink(_)));
        assert_eq!(err.failed_in(), "handing off");
        assert!(std::fs::read_dir(work_root.path()).unwrap().next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_removes_working_directory() {
        let work_root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::with_workloads(vec![
            workload("web", "nginx", &[], vec![Resource::volume("www", "/srv")]),
            workload("app-db", "postgres:16", &[], vec![]),
        ]);
        runtime.set_exec("app-db", ExecBehavior::Hang);
        let runner = FakeRunner::default();
        let mut sink = MockArchivalSink::new();
        sink.expect_submit().times(0);

        let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings(work_root.path()));
        let outcome = tokio::time::timeout(Duration::from_secs(30), orchestrator.run()).await;

        assert!(outcome.is_err());
        // the volume was archived into the working directory before the hang
        assert_eq!(runner.calls().len(), 1);
        assert!(std::fs::read_dir(work_root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_catalog_write_failure_aborts_in_finalizing() {
        let work_root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::with_workloads(vec![workload(
            "web",
            "nginx",
            &[],
            vec![Resource::volume("www", "/srv")],
        )]);
        let runner = FakeRunner::default();
        // a directory squatting on the temp catalog path makes the write fail
        runner.on_run(|spec| {
            if let Some(volumes_dir) = FakeRunner::backup_mount(spec) {
                let run_dir = volumes_dir.parent().unwrap();
                std::fs::create_dir_all(run_dir.join(crate::utils::CATALOG_TMP_FILE)).unwrap();
            }
        });
        let mut sink = MockArchivalSink::new();
        sink.expect_submit().times(0);

        let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings(work_root.path()));
        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(err, RunError::Catalog(CatalogError::Io { .. })));
        assert_eq!(err.failed_in(), "finalizing");
        assert!(std::fs::read_dir(work_root.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_workload_aborts_in_processing() {
        let work_root = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::with_workloads(vec![
            workload("web", "nginx", &[], vec![]),
            workload("web", "nginx", &[], vec![]),
        ]);
        let runner = FakeRunner::default();
        let mut sink = MockArchivalSink::new();
        sink.expect_submit().times(0);

        let orchestrator = Orchestrator::new(&runtime, &runner, &sink, settings(work_root.path()));
        let err = orchestrator.run().await.unwrap_err();

        assert!(matches!(
            &err,
            RunError::Record { workload, source: CatalogError::Duplicate(_) } if workload == "web"
        ));
        assert_eq!(err.failed_in(), "processing");
        assert!(std::fs::read_dir(work_root.path()).unwrap().next().is_none());
    }
}
