/// Volume and bind mount archiving
///
/// Named volumes are tarred by a throwaway helper container that mounts the
/// volume read-only next to the run's working directory:
///   docker run --rm -v <volume>:/source:ro -v <dir>:/backup alpine \
///     tar czf /backup/<volume>.tar.gz -C /source .
/// Bind mounts are tarred directly on the host, stored relative to `/` so a
/// file and a directory both come back with `tar xzf <archive> -C /`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::core::process::{CommandSpec, ProcessError, ProcessRunner};
use crate::core::runtime::{Resource, ResourceKind};
use crate::utils::{bind_archive_name, is_control_plane_path, volume_archive_name};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("failed to archive {kind} {identity}: {detail}")]
    Command {
        kind: ResourceKind,
        identity: String,
        detail: String,
    },

    #[error("failed to archive {kind} {identity}: {source}")]
    Process {
        kind: ResourceKind,
        identity: String,
        #[source]
        source: ProcessError,
    },

    #[error("bind source {path} does not exist on this host")]
    MissingSource { path: String },
}

/// What happened to one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Archived(PathBuf),
    /// Kernel/runtime mount, never archived
    ControlPlane,
}

pub struct Archiver<'a> {
    runner: &'a dyn ProcessRunner,
    archive_image: String,
    timeout: Duration,
}

impl<'a> Archiver<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, archive_image: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            archive_image: archive_image.into(),
            timeout,
        }
    }

    pub async fn archive_volume(&self, name: &str, dest_dir: &Path) -> Result<PathBuf, ArchiveError> {
        let file = volume_archive_name(name);
        let spec = CommandSpec::new("docker")
            .args(["run", "--rm", "--network", "none"])
            .arg("-v")
            .arg(format!("{}:/source:ro", name))
            .arg("-v")
            .arg(format!("{}:/backup", dest_dir.display()))
            .arg(self.archive_image.as_str())
            .args(["tar", "czf"])
            .arg(format!("/backup/{}", file))
            .args(["-C", "/source", "."])
            .timeout(self.timeout);

        self.execute(ResourceKind::Volume, name, &spec).await?;
        Ok(dest_dir.join(file))
    }

    pub async fn archive_bind(&self, path: &str, dest_dir: &Path) -> Result<ArchiveOutcome, ArchiveError> {
        if is_control_plane_path(path) {
            return Ok(ArchiveOutcome::ControlPlane);
        }
        if !Path::new(path).exists() {
            return Err(ArchiveError::MissingSource {
                path: path.to_string(),
            });
        }

        let target = dest_dir.join(bind_archive_name(path));
        let relative = path.trim_start_matches('/');
        let entry = if relative.is_empty() { "." } else { relative };

        let spec = CommandSpec::new("tar")
            .arg("czf")
            .arg(target.display().to_string())
            .args(["-C", "/", entry])
            .timeout(self.timeout);

        self.execute(ResourceKind::Bind, path, &spec).await?;
        Ok(ArchiveOutcome::Archived(target))
    }

    async fn execute(&self, kind: ResourceKind, identity: &str, spec: &CommandSpec) -> Result<(), ArchiveError> {
        tracing::debug!(resource = %identity, kind = %kind, command = %spec.display(), "archiving");

        let output = self
            .runner
            .run(spec)
            .await
            .map_err(|source| ArchiveError::Process {
                kind,
                identity: identity.to_string(),
                source,
            })?;

        if output.success() {
            Ok(())
        } else {
            Err(ArchiveError::Command {
                kind,
                identity: identity.to_string(),
                detail: output.describe_failure(),
            })
        }
    }
}

/// Per-run identity → artifact maps, one for volumes and one for binds.
///
/// Owned by the driver; a resource already present is reused, never archived twice.
#[derive(Debug, Default, Clone)]
pub struct DedupSet {
    volumes: BTreeMap<String, PathBuf>,
    binds: BTreeMap<String, PathBuf>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: ResourceKind) -> &BTreeMap<String, PathBuf> {
        match kind {
            ResourceKind::Volume => &self.volumes,
            ResourceKind::Bind => &self.binds,
        }
    }

    pub fn get(&self, resource: &Resource) -> Option<&PathBuf> {
        self.map(resource.kind).get(&resource.identity)
    }

    pub fn insert(&mut self, resource: &Resource, artifact: PathBuf) {
        let map = match resource.kind {
            ResourceKind::Volume => &mut self.volumes,
            ResourceKind::Bind => &mut self.binds,
        };
        map.insert(resource.identity.clone(), artifact);
    }
}
