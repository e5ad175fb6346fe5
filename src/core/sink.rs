/// Archival sink
///
/// The sink durably stores named sources and hands back a snapshot id. Chunking,
/// encryption and transport belong to the backup client; roleback only drives it.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::process::{CommandSpec, ProcessError, ProcessRunner};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("backup client failed: {0}")]
    Process(#[from] ProcessError),

    #[error("{action} failed: {detail}")]
    Command { action: &'static str, detail: String },

    #[error("could not parse backup client output: {0}")]
    Output(String),

    #[error("snapshot {snapshot} has no archive named {name}")]
    UnknownArchive { snapshot: String, name: String },

    #[error("nothing to submit")]
    Empty,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArchivalSink: Send + Sync {
    /// Store every `archive name → source path` and return the snapshot id
    async fn submit(&self, sources: &BTreeMap<String, PathBuf>) -> Result<String, SinkError>;

    /// Restore the archive `name` of `snapshot` into `dest`
    async fn retrieve(&self, snapshot: &str, name: &str, dest: &Path) -> Result<(), SinkError>;
}

/// restic driven through the process port
pub struct ResticSink<'a> {
    runner: &'a dyn ProcessRunner,
    binary: String,
    repository: String,
    host: String,
}

#[derive(Debug, Deserialize)]
struct BackupMessage {
    message_type: String,
    #[serde(default)]
    snapshot_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotInfo {
    #[serde(default)]
    paths: Vec<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl<'a> ResticSink<'a> {
    pub fn new(
        runner: &'a dyn ProcessRunner,
        binary: impl Into<String>,
        repository: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            runner,
            binary: binary.into(),
            repository: repository.into(),
            host: host.into(),
        }
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(self.binary.as_str()).args(["-r", self.repository.as_str()])
    }

    async fn run(&self, action: &'static str, spec: CommandSpec) -> Result<String, SinkError> {
        tracing::debug!(command = %spec.display(), "running backup client");
        let output = self.runner.run(&spec).await?;
        if !output.success() {
            return Err(SinkError::Command {
                action,
                detail: output.describe_failure(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn snapshot(&self, snapshot: &str) -> Result<Vec<SnapshotInfo>, SinkError> {
        let listing = self
            .run(
                "restic snapshots",
                self.command().args(["snapshots", "--json", snapshot]),
            )
            .await?;

        serde_json::from_str(&listing).map_err(|err| SinkError::Output(err.to_string()))
    }

    /// Archive names recorded on a snapshot
    pub async fn archives(&self, snapshot: &str) -> Result<Vec<String>, SinkError> {
        let mut names: Vec<String> = self
            .snapshot(snapshot)
            .await?
            .into_iter()
            .flat_map(|info| info.tags)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// The snapshot id is in the final `summary` message of `restic backup --json`
fn parse_snapshot_id(stdout: &str) -> Result<String, SinkError> {
    stdout
        .lines()
        .filter_map(|line| serde_json::from_str::<BackupMessage>(line).ok())
        .filter(|msg| msg.message_type == "summary")
        .filter_map(|msg| msg.snapshot_id)
        .last()
        .ok_or_else(|| SinkError::Output("no summary with a snapshot id".to_string()))
}

#[async_trait]
impl ArchivalSink for ResticSink<'_> {
    async fn submit(&self, sources: &BTreeMap<String, PathBuf>) -> Result<String, SinkError> {
        if sources.is_empty() {
            return Err(SinkError::Empty);
        }

        let mut spec = self
            .command()
            .args(["backup", "--json", "--host", self.host.as_str()]);
        for name in sources.keys() {
            spec = spec.arg("--tag").arg(name.as_str());
        }
        for path in sources.values() {
            spec = spec.arg(path.display().to_string());
        }

        let stdout = self.run("restic backup", spec).await?;
        parse_snapshot_id(&stdout)
    }

    async fn retrieve(&self, snapshot: &str, name: &str, dest: &Path) -> Result<(), SinkError> {
        let snapshots = self.snapshot(snapshot).await?;

        let source = snapshots
            .iter()
            .find(|info| info.tags.iter().any(|tag| tag == name))
            .and_then(|info| info.paths.first())
            .ok_or_else(|| SinkError::UnknownArchive {
                snapshot: snapshot.to_string(),
                name: name.to_string(),
            })?;

        // `<id>:<path>` restores the directory contents without the absolute prefix
        let spec = self
            .command()
            .arg("restore")
            .arg(format!("{}:{}", snapshot, source))
            .arg("--target")
            .arg(dest.display().to_string());
        self.run("restic restore", spec).await?;
        Ok(())
    }
}
