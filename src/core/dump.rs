/// Database dump strategies
///
/// Each dumped engine has a strategy: which environment keys hold its
/// credentials, the dump command, the artifact extension and the smallest
/// size a healthy dump is expected to have. Dumps run inside the workload
/// so the client tools always match the server version.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::classifier::EngineKind;
use crate::core::process::ProcessOutput;
use crate::core::retry::{validate, RetryPolicy, Validation};
use crate::core::runtime::{ExecRequest, RuntimeError, Workload, WorkloadRuntime};

const ORPHAN_KILL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DumpError {
    #[error("{engine} is not dumped")]
    NotDumpable { engine: EngineKind },

    #[error("dump command failed in {workload}: {detail}")]
    Command { workload: String, detail: String },

    #[error("dump of {workload} produced an empty file")]
    Empty { workload: String },

    #[error("dump of {workload} produced no file at {path}")]
    Missing { workload: String, path: PathBuf },

    #[error("dump of {workload} timed out after {timeout:?}")]
    Timeout { workload: String, timeout: Duration },

    #[error("runtime error while dumping {workload}: {source}")]
    Runtime {
        workload: String,
        #[source]
        source: RuntimeError,
    },
}

/// Credentials resolved from a workload environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    /// `None` means every database
    pub database: Option<String>,
    /// Set when the MySQL root credential stood in for a missing user
    pub root_fallback: bool,
}

/// How to dump one engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpStrategy {
    pub engine: EngineKind,
    pub extension: &'static str,
    pub min_size: u64,
    user_keys: &'static [&'static str],
    password_keys: &'static [&'static str],
    database_keys: &'static [&'static str],
    default_user: &'static str,
    default_database: Option<&'static str>,
}

const POSTGRES: DumpStrategy = DumpStrategy {
    engine: EngineKind::Postgres,
    extension: ".dump",
    min_size: 512,
    user_keys: &["POSTGRES_USER"],
    password_keys: &["POSTGRES_PASSWORD"],
    database_keys: &["POSTGRES_DB"],
    default_user: "postgres",
    default_database: Some("postgres"),
};

const MYSQL: DumpStrategy = DumpStrategy {
    engine: EngineKind::Mysql,
    extension: ".sql",
    min_size: 1024,
    user_keys: &["MYSQL_USER", "MARIADB_USER"],
    password_keys: &["MYSQL_PASSWORD", "MARIADB_PASSWORD"],
    database_keys: &["MYSQL_DATABASE", "MARIADB_DATABASE"],
    default_user: "root",
    default_database: Some("mysql"),
};

const MONGO: DumpStrategy = DumpStrategy {
    engine: EngineKind::Mongo,
    extension: ".archive",
    min_size: 256,
    user_keys: &["MONGO_INITDB_ROOT_USERNAME"],
    password_keys: &["MONGO_INITDB_ROOT_PASSWORD"],
    database_keys: &["MONGO_INITDB_DATABASE"],
    default_user: "",
    default_database: None,
};

const MYSQL_ROOT_PASSWORD_KEYS: &[&str] = &["MYSQL_ROOT_PASSWORD", "MARIADB_ROOT_PASSWORD"];

fn first_value(env: &BTreeMap<String, String>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| env.get(*key))
        .find(|value| !value.is_empty())
        .cloned()
}

impl DumpStrategy {
    /// Strategy registry; `None` for engines that are never dumped
    pub fn for_engine(engine: EngineKind) -> Option<&'static DumpStrategy> {
        match engine {
            EngineKind::Postgres => Some(&POSTGRES),
            EngineKind::Mysql => Some(&MYSQL),
            EngineKind::Mongo => Some(&MONGO),
            EngineKind::Redis => None,
        }
    }

    /// Dump file name for a workload
    pub fn file_name(&self, workload_id: &str) -> String {
        format!("{}{}", workload_id, self.extension)
    }

    /// Resolve credentials: engine keys first, then defaults, then the
    /// MySQL root credential when no dedicated user/password pair exists.
    pub fn resolve_credentials(&self, env: &BTreeMap<String, String>) -> Credentials {
        let user = first_value(env, self.user_keys);
        let password = first_value(env, self.password_keys);
        let database = first_value(env, self.database_keys)
            .or_else(|| self.default_database.map(String::from));

        if self.engine == EngineKind::Mysql && (user.is_none() || password.is_none()) {
            return Credentials {
                user: "root".to_string(),
                password: first_value(env, MYSQL_ROOT_PASSWORD_KEYS),
                database,
                root_fallback: true,
            };
        }

        Credentials {
            user: user.unwrap_or_else(|| self.default_user.to_string()),
            password,
            database,
            root_fallback: false,
        }
    }

    /// Command executed inside the workload; stdout is the dump
    pub fn command(&self, creds: &Credentials) -> ExecRequest {
        match self.engine {
            EngineKind::Postgres => {
                let mut request = ExecRequest::new(["pg_dump", "-Fc", "-U", creds.user.as_str()]);
                if let Some(db) = &creds.database {
                    request.argv.push("-d".to_string());
                    request.argv.push(db.clone());
                }
                if let Some(password) = &creds.password {
                    request = request.env("PGPASSWORD", password.as_str());
                }
                request
            }
            EngineKind::Mysql => {
                let mut request = ExecRequest::new([
                    "mysqldump",
                    "--single-transaction",
                    "--routines",
                    "--triggers",
                    "-u",
                    creds.user.as_str(),
                ]);
                match &creds.database {
                    Some(db) => request.argv.push(db.clone()),
                    None => request.argv.push("--all-databases".to_string()),
                }
                if let Some(password) = &creds.password {
                    request = request.env("MYSQL_PWD", password.as_str());
                }
                request
            }
            EngineKind::Mongo => {
                let mut request = ExecRequest::new(["mongodump", "--archive"]);
                if !creds.user.is_empty() {
                    request.argv.extend([
                        "--username".to_string(),
                        creds.user.clone(),
                        "--authenticationDatabase".to_string(),
                        "admin".to_string(),
                    ]);
                    // mongodump has no password environment variable
                    if let Some(password) = &creds.password {
                        request.argv.push("--password".to_string());
                        request.argv.push(password.clone());
                    }
                }
                if let Some(db) = &creds.database {
                    request.argv.push("--db".to_string());
                    request.argv.push(db.clone());
                }
                request
            }
            EngineKind::Redis => ExecRequest::default(),
        }
    }
}

/// A validated dump on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpArtifact {
    pub workload: String,
    pub engine: EngineKind,
    pub path: PathBuf,
    pub size: u64,
    pub validation: Validation,
}

/// Runs dump strategies against a workload runtime
pub struct Dumper<'a> {
    runtime: &'a dyn WorkloadRuntime,
    retry: RetryPolicy,
    timeout: Duration,
}

impl<'a> Dumper<'a> {
    pub fn new(runtime: &'a dyn WorkloadRuntime, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            runtime,
            retry,
            timeout,
        }
    }

    /// Dump `workload` into `dest_dir`, retrying failed or invalid attempts
    pub async fn dump(
        &self,
        workload: &Workload,
        engine: EngineKind,
        dest_dir: &Path,
    ) -> Result<DumpArtifact, DumpError> {
        let strategy = DumpStrategy::for_engine(engine).ok_or(DumpError::NotDumpable { engine })?;
        let creds = strategy.resolve_credentials(&workload.env);
        if creds.root_fallback {
            tracing::warn!(
                workload = %workload.id,
                engine = %engine,
                "no dedicated user/password pair, dumping with the root credential"
            );
        }

        let request = strategy.command(&creds);
        let path = dest_dir.join(strategy.file_name(&workload.id));
        let label = format!("dump {}", workload.id);

        self.retry
            .run(&label, |attempt| {
                let request = &request;
                let path = &path;
                async move {
                    tracing::info!(
                        workload = %workload.id,
                        engine = %engine,
                        attempt,
                        command = %request.display(),
                        "dumping database"
                    );
                    self.attempt(workload, strategy, request, path).await
                }
            })
            .await
    }

    async fn attempt(
        &self,
        workload: &Workload,
        strategy: &DumpStrategy,
        request: &ExecRequest,
        path: &Path,
    ) -> Result<DumpArtifact, DumpError> {
        let exec = self.runtime.exec_to_file(&workload.id, request, path);
        let output: ProcessOutput = match tokio::time::timeout(self.timeout, exec).await {
            Ok(result) => result.map_err(|source| DumpError::Runtime {
                workload: workload.id.clone(),
                source,
            })?,
            Err(_) => {
                self.stop_orphan(workload, request).await;
                discard(path).await;
                return Err(DumpError::Timeout {
                    workload: workload.id.clone(),
                    timeout: self.timeout,
                });
            }
        };

        if !output.success() {
            discard(path).await;
            return Err(DumpError::Command {
                workload: workload.id.clone(),
                detail: output.describe_failure(),
            });
        }

        let validation = validate(path, strategy.min_size).await;
        match validation {
            Validation::Missing => Err(DumpError::Missing {
                workload: workload.id.clone(),
                path: path.to_path_buf(),
            }),
            Validation::Empty => {
                discard(path).await;
                Err(DumpError::Empty {
                    workload: workload.id.clone(),
                })
            }
            Validation::Undersized { size, min_size } => {
                tracing::warn!(
                    workload = %workload.id,
                    engine = %strategy.engine,
                    size,
                    min_size,
                    "dump is smaller than expected, keeping it"
                );
                Ok(self.artifact(workload, strategy, path, validation))
            }
            Validation::Ok { .. } => Ok(self.artifact(workload, strategy, path, validation)),
        }
    }

    /// Dropping a timed-out exec does not stop the client inside the workload
    async fn stop_orphan(&self, workload: &Workload, request: &ExecRequest) {
        let Some(program) = request.argv.first() else {
            return;
        };
        let kill = ExecRequest::new(["pkill", "-x", program.as_str()]);
        let outcome = tokio::time::timeout(
            ORPHAN_KILL_TIMEOUT,
            self.runtime.exec_capture(&workload.id, &kill),
        )
        .await;

        match outcome {
            Ok(Ok(output)) if output.success() => {
                tracing::warn!(workload = %workload.id, program = %program, "stopped timed-out dump client");
            }
            Ok(Ok(output)) => {
                tracing::warn!(
                    workload = %workload.id,
                    program = %program,
                    detail = %output.describe_failure(),
                    "timed-out dump client may still be running"
                );
            }
            Ok(Err(err)) => {
                tracing::warn!(
                    workload = %workload.id,
                    program = %program,
                    error = %err,
                    "timed-out dump client may still be running"
                );
            }
            Err(_) => {
                tracing::warn!(workload = %workload.id, program = %program, "timed-out dump client may still be running");
            }
        }
    }

    fn artifact(
        &self,
        workload: &Workload,
        strategy: &DumpStrategy,
        path: &Path,
        validation: Validation,
    ) -> DumpArtifact {
        DumpArtifact {
            workload: workload.id.clone(),
            engine: strategy.engine,
            path: path.to_path_buf(),
            size: validation.size(),
            validation,
        }
    }
}

async fn discard(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            tracing::debug!(path = %path.display(), error = %err, "could not remove failed dump");
        }
    }
}

/// Result of asking Redis to persist its dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedisSave {
    Triggered,
    NotPersistent,
    Failed(String),
    TimedOut,
}

/// Ask a Redis workload for a background save when persistence is configured.
///
/// Never fails the run and never produces an artifact: the saved RDB/AOF lands
/// in the workload's own volume, which the archiver picks up.
pub async fn trigger_redis_save(
    runtime: &dyn WorkloadRuntime,
    workload: &Workload,
    timeout: Duration,
) -> RedisSave {
    let outcome = tokio::time::timeout(timeout, redis_save(runtime, workload)).await;
    let result = match outcome {
        Ok(result) => result,
        Err(_) => RedisSave::TimedOut,
    };

    match &result {
        RedisSave::Triggered => {
            tracing::info!(workload = %workload.id, engine = "redis", "background save requested")
        }
        RedisSave::NotPersistent => tracing::info!(
            workload = %workload.id,
            engine = "redis",
            "persistence disabled, nothing to save"
        ),
        RedisSave::Failed(reason) => tracing::warn!(
            workload = %workload.id,
            engine = "redis",
            reason = %reason,
            "background save failed, continuing"
        ),
        RedisSave::TimedOut => tracing::warn!(
            workload = %workload.id,
            engine = "redis",
            timeout = ?timeout,
            "background save timed out, continuing"
        ),
    }

    result
}

fn redis_cli(workload: &Workload, args: &[&str]) -> ExecRequest {
    let mut argv = vec!["redis-cli"];
    argv.extend_from_slice(args);
    let request = ExecRequest::new(argv);
    match workload.env.get("REDIS_PASSWORD").filter(|p| !p.is_empty()) {
        Some(password) => request.env("REDISCLI_AUTH", password.as_str()),
        None => request,
    }
}

async fn redis_save(runtime: &dyn WorkloadRuntime, workload: &Workload) -> RedisSave {
    let mut persistent = false;

    for (key, idle) in [("save", ""), ("appendonly", "no")] {
        let request = redis_cli(workload, &["CONFIG", "GET", key]);
        match runtime.exec_capture(&workload.id, &request).await {
            Ok(output) if output.success() => {
                // Reply is the key on one line and its value on the next
                let reply = output.stdout_text();
                let value = reply.lines().nth(1).unwrap_or("").trim();
                if value != idle {
                    persistent = true;
                }
            }
            Ok(output) => return RedisSave::Failed(output.describe_failure()),
            Err(err) => return RedisSave::Failed(err.to_string()),
        }
    }

    if !persistent {
        return RedisSave::NotPersistent;
    }

    match runtime
        .exec_capture(&workload.id, &redis_cli(workload, &["BGSAVE"]))
        .await
    {
        Ok(output) if output.success() => RedisSave::Triggered,
        Ok(output) => RedisSave::Failed(output.describe_failure()),
        Err(err) => RedisSave::Failed(err.to_string()),
    }
}
