/// Workload runtime integration
///
/// Enumerates running containers, inspects their image, environment and mounts,
/// and executes commands inside them. The Docker implementation talks to the
/// daemon through bollard.

use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions, LogOutput};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{MountPoint, MountPointTypeEnum};
use bollard::Docker;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::core::process::ProcessOutput;
use crate::utils::parse_env_pairs;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to connect to Docker daemon: {0}")]
    Connect(#[source] bollard::errors::Error),

    #[error("docker request failed: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("failed to write exec output to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Inspection failures are transient: the driver skips the workload
#[derive(Debug, Error)]
pub enum InspectionError {
    #[error("workload {id} disappeared before it could be inspected")]
    Vanished { id: String },

    #[error("failed to inspect workload {id}: {source}")]
    Runtime {
        id: String,
        #[source]
        source: bollard::errors::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Volume,
    Bind,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Volume => f.write_str("volume"),
            ResourceKind::Bind => f.write_str("bind"),
        }
    }
}

/// Persistent storage attached to a workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub kind: ResourceKind,
    /// Volume name or absolute host path
    pub identity: String,
    /// Mount point inside the workload
    pub destination: String,
}

impl Resource {
    pub fn volume(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Volume,
            identity: name.into(),
            destination: destination.into(),
        }
    }

    pub fn bind(path: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Bind,
            identity: path.into(),
            destination: destination.into(),
        }
    }
}

/// Read-only view of a running workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    pub id: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub resources: Vec<Resource>,
}

/// A command executed inside a workload
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecRequest {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ExecRequest {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: Vec::new(),
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line for log messages (environment is never included)
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// Names of all running workloads, in runtime order
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError>;

    async fn inspect(&self, id: &str) -> Result<Workload, InspectionError>;

    /// Run a command inside the workload and capture both streams in memory
    async fn exec_capture(&self, id: &str, request: &ExecRequest)
        -> Result<ProcessOutput, RuntimeError>;

    /// Run a command inside the workload streaming stdout into `dest`.
    /// The returned output carries the exit status and stderr only.
    async fn exec_to_file(
        &self,
        id: &str,
        request: &ExecRequest,
        dest: &Path,
    ) -> Result<ProcessOutput, RuntimeError>;
}

#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(RuntimeError::Connect)?;
        Ok(Self { docker })
    }

    /// Run an exec and stream its stdout into `stdout`
    async fn exec_into<W>(
        &self,
        id: &str,
        request: &ExecRequest,
        stdout: &mut W,
        dest: &str,
    ) -> Result<ProcessOutput, RuntimeError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let env: Vec<String> = request
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(request.argv.clone()),
                    env: Some(env),
                    ..Default::default()
                },
            )
            .await?;

        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } =
            self.docker.start_exec(&exec.id, None).await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => {
                        stdout
                            .write_all(&message)
                            .await
                            .map_err(|source| RuntimeError::Io {
                                path: dest.to_string(),
                                source,
                            })?;
                    }
                    LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        }

        stdout.flush().await.map_err(|source| RuntimeError::Io {
            path: dest.to_string(),
            source,
        })?;

        let inspect = self.docker.inspect_exec(&exec.id).await?;

        Ok(ProcessOutput {
            status: inspect.exit_code.map(|code| code as i32),
            stdout: Vec::new(),
            stderr,
        })
    }
}

#[async_trait]
impl WorkloadRuntime for DockerRuntime {
    async fn list_running(&self) -> Result<Vec<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("status".to_string(), vec!["running".to_string()]);

        let options = Some(ListContainersOptions {
            all: false,
            filters,
            ..Default::default()
        });

        let containers = self.docker.list_containers(options).await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                c.names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                    .or(c.id)
            })
            .collect())
    }

    async fn inspect(&self, id: &str) -> Result<Workload, InspectionError> {
        let inspect = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .map_err(|source| match source {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => InspectionError::Vanished { id: id.to_string() },
                source => InspectionError::Runtime {
                    id: id.to_string(),
                    source,
                },
            })?;

        let image = inspect
            .config
            .as_ref()
            .and_then(|c| c.image.clone())
            .or(inspect.image.clone())
            .unwrap_or_default();

        let env = inspect
            .config
            .as_ref()
            .and_then(|c| c.env.as_ref())
            .map(|env| parse_env_pairs(env))
            .unwrap_or_default();

        let resources = inspect
            .mounts
            .as_deref()
            .map(|mounts| mounts.iter().filter_map(mount_to_resource).collect())
            .unwrap_or_default();

        Ok(Workload {
            id: id.to_string(),
            image,
            env,
            resources,
        })
    }

    async fn exec_capture(
        &self,
        id: &str,
        request: &ExecRequest,
    ) -> Result<ProcessOutput, RuntimeError> {
        let mut stdout: Vec<u8> = Vec::new();
        let mut output = self.exec_into(id, request, &mut stdout, "<memory>").await?;
        output.stdout = stdout;
        Ok(output)
    }

    async fn exec_to_file(
        &self,
        id: &str,
        request: &ExecRequest,
        dest: &Path,
    ) -> Result<ProcessOutput, RuntimeError> {
        let display = dest.display().to_string();
        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|source| RuntimeError::Io {
                path: display.clone(),
                source,
            })?;
        self.exec_into(id, request, &mut file, &display).await
    }
}

/// Convert a Docker mount to a resource; tmpfs and other kinds carry no state
fn mount_to_resource(mount: &MountPoint) -> Option<Resource> {
    let destination = mount.destination.clone().unwrap_or_default();
    match mount.typ {
        Some(MountPointTypeEnum::VOLUME) => mount
            .name
            .clone()
            .map(|name| Resource::volume(name, destination)),
        Some(MountPointTypeEnum::BIND) => mount
            .source
            .clone()
            .map(|source| Resource::bind(source, destination)),
        _ => None,
    }
}
