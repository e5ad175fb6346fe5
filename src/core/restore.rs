/// Restore guide generation
///
/// Pairs catalog entries with files in an extracted run archive and produces
/// ordered instructions for an operator. Nothing here executes a restore.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::catalog::Catalog;
use crate::core::classifier::EngineKind;
use crate::core::dump::{Credentials, DumpStrategy};
use crate::core::runtime::ResourceKind;
use crate::utils::{bind_archive_name, shell_quote, volume_archive_name, BINDS_DIR, DUMPS_DIR, VOLUMES_DIR};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStep {
    /// A dump is present and can be loaded into a fresh workload
    Database {
        workload: String,
        engine: EngineKind,
        artifact: PathBuf,
        credentials: Credentials,
    },
    /// The catalog says a dump was taken but the file is not in the extraction
    MissingArtifact {
        workload: String,
        engine: EngineKind,
        expected: String,
    },
    /// Redis keeps its state in its volumes; nothing to load
    Cache { workload: String },
    Resource {
        kind: ResourceKind,
        identity: String,
        archive: PathBuf,
        workloads: Vec<String>,
    },
    MissingArchive {
        kind: ResourceKind,
        identity: String,
        expected: PathBuf,
    },
}

impl RestoreStep {
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            RestoreStep::MissingArtifact { .. } | RestoreStep::MissingArchive { .. }
        )
    }

    /// Shell commands for the operator, in order. Volume archives are
    /// unpacked with `archive_image`.
    pub fn commands(&self, archive_image: &str) -> Vec<String> {
        match self {
            RestoreStep::Database {
                workload,
                engine,
                artifact,
                credentials,
            } => vec![database_command(workload, *engine, artifact, credentials)],
            RestoreStep::Resource {
                kind: ResourceKind::Volume,
                identity,
                archive,
                ..
            } => {
                let dir = archive.parent().unwrap_or_else(|| Path::new("."));
                let file = archive
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_default();
                vec![
                    format!("docker volume create {}", shell_quote(identity)),
                    format!(
                        "docker run --rm -v {} -v {} {} tar xzf {} -C /target",
                        shell_quote(&format!("{}:/target", identity)),
                        shell_quote(&format!("{}:/backup:ro", dir.display())),
                        shell_quote(archive_image),
                        shell_quote(&format!("/backup/{}", file))
                    ),
                ]
            }
            // bind archives hold the host path relative to `/`
            RestoreStep::Resource {
                kind: ResourceKind::Bind,
                archive,
                ..
            } => vec![format!(
                "tar xzf {} -C /",
                shell_quote(&archive.display().to_string())
            )],
            RestoreStep::MissingArtifact { .. }
            | RestoreStep::Cache { .. }
            | RestoreStep::MissingArchive { .. } => Vec::new(),
        }
    }
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreStep::Database {
                workload,
                engine,
                artifact,
                credentials,
            } => {
                write!(
                    f,
                    "load {} dump for {} from {} (user {}",
                    engine,
                    workload,
                    artifact.display(),
                    credentials.user
                )?;
                if let Some(db) = &credentials.database {
                    write!(f, ", database {}", db)?;
                }
                f.write_str(")")
            }
            RestoreStep::MissingArtifact {
                workload,
                engine,
                expected,
            } => write!(
                f,
                "no {} dump found for {} (expected {})",
                engine, workload, expected
            ),
            RestoreStep::Cache { workload } => write!(
                f,
                "{} is a redis cache, its data comes back with its volumes",
                workload
            ),
            RestoreStep::Resource {
                kind,
                identity,
                archive,
                workloads,
            } => write!(
                f,
                "extract {} {} from {} (used by {})",
                kind,
                identity,
                archive.display(),
                workloads.join(", ")
            ),
            RestoreStep::MissingArchive {
                kind,
                identity,
                expected,
            } => write!(
                f,
                "archive for {} {} not found at {}",
                kind,
                identity,
                expected.display()
            ),
        }
    }
}

fn database_command(workload: &str, engine: EngineKind, artifact: &Path, creds: &Credentials) -> String {
    let password = creds.password.as_deref().unwrap_or("");
    let workload = shell_quote(workload);
    let user = shell_quote(&creds.user);
    let artifact = shell_quote(&artifact.display().to_string());
    match engine {
        EngineKind::Postgres => format!(
            "docker exec -i -e {} {} pg_restore -U {} -d {} --clean --if-exists < {}",
            shell_quote(&format!("PGPASSWORD={}", password)),
            workload,
            user,
            shell_quote(creds.database.as_deref().unwrap_or("postgres")),
            artifact
        ),
        EngineKind::Mysql => {
            let mut cmd = format!(
                "docker exec -i -e {} {} mysql -u {}",
                shell_quote(&format!("MYSQL_PWD={}", password)),
                workload,
                user
            );
            if let Some(db) = &creds.database {
                cmd.push(' ');
                cmd.push_str(&shell_quote(db));
            }
            format!("{} < {}", cmd, artifact)
        }
        EngineKind::Mongo => {
            let mut cmd = format!("docker exec -i {} mongorestore --archive --drop", workload);
            if !creds.user.is_empty() {
                cmd.push_str(&format!(
                    " --username {} --password {} --authenticationDatabase admin",
                    user,
                    shell_quote(password)
                ));
            }
            format!("{} < {}", cmd, artifact)
        }
        EngineKind::Redis => String::new(),
    }
}

/// Ordered steps plus every file found in the extraction
#[derive(Debug, Clone, Default)]
pub struct RestoreGuide {
    pub steps: Vec<RestoreStep>,
    pub artifacts: Vec<PathBuf>,
}

impl RestoreGuide {
    pub fn warnings(&self) -> usize {
        self.steps.iter().filter(|s| s.is_warning()).count()
    }
}

/// Build the guide: databases in catalog order, then volumes, then binds
pub fn generate(catalog: &Catalog, extracted: &Path) -> RestoreGuide {
    let mut steps = Vec::new();

    for (id, entry) in &catalog.containers {
        let Some(engine) = entry.db_type else {
            continue;
        };
        let Some(strategy) = DumpStrategy::for_engine(engine) else {
            steps.push(RestoreStep::Cache {
                workload: id.clone(),
            });
            continue;
        };

        let file = strategy.file_name(id);
        match find_dump(extracted, &file) {
            Some(artifact) => steps.push(RestoreStep::Database {
                workload: id.clone(),
                engine,
                artifact,
                credentials: strategy.resolve_credentials(&entry.env),
            }),
            None => {
                tracing::warn!(workload = %id, engine = %engine, expected = %file, "dump missing from extraction");
                steps.push(RestoreStep::MissingArtifact {
                    workload: id.clone(),
                    engine,
                    expected: file,
                });
            }
        }
    }

    let users = resource_users(catalog);
    let resources = catalog
        .backed_up_volumes
        .iter()
        .map(|v| (ResourceKind::Volume, v, extracted.join(VOLUMES_DIR).join(volume_archive_name(v))))
        .chain(
            catalog
                .backed_up_binds
                .iter()
                .map(|b| (ResourceKind::Bind, b, extracted.join(BINDS_DIR).join(bind_archive_name(b)))),
        );

    for (kind, identity, archive) in resources {
        if archive.is_file() {
            steps.push(RestoreStep::Resource {
                kind,
                identity: identity.clone(),
                archive,
                workloads: users.get(&(kind, identity.as_str())).cloned().unwrap_or_default(),
            });
        } else {
            tracing::warn!(resource = %identity, kind = %kind, "archive missing from extraction");
            steps.push(RestoreStep::MissingArchive {
                kind,
                identity: identity.clone(),
                expected: archive,
            });
        }
    }

    RestoreGuide {
        steps,
        artifacts: list_artifacts(extracted),
    }
}

/// Dumps live under `dumps/`; a flat extraction is accepted too
fn find_dump(extracted: &Path, file: &str) -> Option<PathBuf> {
    [extracted.join(DUMPS_DIR).join(file), extracted.join(file)]
        .into_iter()
        .find(|candidate| candidate.is_file())
}

fn resource_users(catalog: &Catalog) -> BTreeMap<(ResourceKind, &str), Vec<String>> {
    let mut users: BTreeMap<(ResourceKind, &str), Vec<String>> = BTreeMap::new();
    for (id, entry) in &catalog.containers {
        for volume in &entry.volumes {
            users.entry((ResourceKind::Volume, volume.as_str())).or_default().push(id.clone());
        }
        for bind in &entry.binds {
            users.entry((ResourceKind::Bind, bind.as_str())).or_default().push(id.clone());
        }
    }
    users
}

fn list_artifacts(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(path = %dir.display(), error = %err, "cannot list extracted directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                found.push(path);
            }
        }
    }

    found.sort();
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::CatalogBuilder;
    use crate::utils::parse_env_pairs;
    use chrono::Utc;
    use std::fs;

    fn catalog() -> Catalog {
        let mut builder = CatalogBuilder::begin("host-1");
        builder
            .add_workload(
                "app-db",
                "postgres:16",
                vec!["shared-data".into()],
                vec![],
                parse_env_pairs(["POSTGRES_USER=app", "POSTGRES_DB=appdb", "POSTGRES_PASSWORD=s3cret"]),
                Some(EngineKind::Postgres),
            )
            .unwrap();
        builder
            .add_workload(
                "shop-db",
                "mariadb:11",
                vec![],
                vec![],
                parse_env_pairs(["MARIADB_ROOT_PASSWORD=rootpw"]),
                Some(EngineKind::Mysql),
            )
            .unwrap();
        builder
            .add_workload("cache", "redis:7", vec![], vec![], BTreeMap::new(), Some(EngineKind::Redis))
            .unwrap();
        builder
            .add_workload(
                "web",
                "nginx",
                vec!["shared-data".into()],
                vec!["/srv/www".into()],
                BTreeMap::new(),
                None,
            )
            .unwrap();
        builder.build(Utc::now())
    }

    fn extracted() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("dumps")).unwrap();
        fs::create_dir_all(dir.path().join("volumes")).unwrap();
        fs::write(dir.path().join("dumps/app-db.dump"), vec![0u8; 1024]).unwrap();
        fs::write(dir.path().join("volumes/shared-data.tar.gz"), b"x").unwrap();
        dir
    }

    #[test]
    fn test_steps_are_ordered_and_checked() {
        let dir = extracted();
        let guide = generate(&catalog(), dir.path());

        assert_eq!(guide.steps.len(), 5);
        assert!(matches!(&guide.steps[0], RestoreStep::Database { workload, .. } if workload == "app-db"));
        assert!(matches!(
            &guide.steps[1],
            RestoreStep::MissingArtifact { workload, expected, .. } if workload == "shop-db" && expected == "shop-db.sql"
        ));
        assert!(matches!(&guide.steps[2], RestoreStep::Cache { workload } if workload == "cache"));
        assert!(matches!(
            &guide.steps[3],
            RestoreStep::Resource { kind: ResourceKind::Volume, workloads, .. } if workloads == &["app-db", "web"]
        ));
        assert!(matches!(
            &guide.steps[4],
            RestoreStep::MissingArchive { kind: ResourceKind::Bind, identity, .. } if identity == "/srv/www"
        ));
        assert_eq!(guide.warnings(), 2);
    }

    #[test]
    fn test_database_step_carries_recorded_credentials() {
        let dir = extracted();
        let guide = generate(&catalog(), dir.path());

        let RestoreStep::Database { credentials, artifact, .. } = &guide.steps[0] else {
            panic!("expected a database step");
        };
        assert_eq!(credentials.user, "app");
        assert_eq!(credentials.password.as_deref(), Some("s3cret"));
        assert_eq!(artifact, &dir.path().join("dumps/app-db.dump"));

        let commands = guide.steps[0].commands("alpine:3");
        assert_eq!(commands.len(), 1);
        assert!(commands[0].contains("pg_restore -U app -d appdb"));
        assert!(commands[0].contains("PGPASSWORD=s3cret"));
    }

    #[test]
    fn test_flat_extraction_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("shop-db.sql"), b"CREATE TABLE t;").unwrap();
        let guide = generate(&catalog(), dir.path());

        let step = guide
            .steps
            .iter()
            .find(|s| matches!(s, RestoreStep::Database { workload, .. } if workload == "shop-db"))
            .unwrap();
        let commands = step.commands("alpine:3");
        assert!(commands[0].contains("MYSQL_PWD=rootpw"));
        assert!(commands[0].contains("mysql -u root mysql"));
    }

    #[test]
    fn test_artifact_listing() {
        let dir = extracted();
        let guide = generate(&catalog(), dir.path());
        assert_eq!(
            guide.artifacts,
            vec![
                dir.path().join("dumps/app-db.dump"),
                dir.path().join("volumes/shared-data.tar.gz"),
            ]
        );
    }

    #[test]
    fn test_volume_commands() {
        let dir = extracted();
        let guide = generate(&catalog(), dir.path());
        let commands = guide.steps[3].commands("registry.local/tools/busybox:1.36");
        assert_eq!(commands[0], "docker volume create shared-data");
        assert!(commands[1].contains(" registry.local/tools/busybox:1.36 tar xzf /backup/shared-data.tar.gz -C /target"));
        assert!(!commands[1].contains("alpine"));
    }

    #[test]
    fn test_single_file_bind_extracts_at_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("binds")).unwrap();
        let archive = dir.path().join("binds").join(bind_archive_name("/etc/app/app.ini"));
        fs::write(&archive, b"x").unwrap();

        let mut builder = CatalogBuilder::begin("host-1");
        builder
            .add_workload("app", "nginx", vec![], vec!["/etc/app/app.ini".into()], BTreeMap::new(), None)
            .unwrap();
        let guide = generate(&builder.build(Utc::now()), dir.path());

        assert_eq!(guide.steps.len(), 1);
        let commands = guide.steps[0].commands("alpine:3");
        assert_eq!(commands, vec![format!("tar xzf {} -C /", shell_quote(&archive.display().to_string()))]);
        assert!(!commands[0].contains("mkdir"));
    }

    #[test]
    fn test_commands_quote_credentials_and_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app-db.dump"), vec![0u8; 1024]).unwrap();
        let mut builder = CatalogBuilder::begin("host-1");
        builder
            .add_workload(
                "app-db",
                "postgres:16",
                vec![],
                vec![],
                parse_env_pairs(["POSTGRES_USER=app", "POSTGRES_PASSWORD=p@ss $word'1"]),
                Some(EngineKind::Postgres),
            )
            .unwrap();
        let guide = generate(&builder.build(Utc::now()), dir.path());

        let commands = guide.steps[0].commands("alpine:3");
        assert!(commands[0].contains("-e 'PGPASSWORD=p@ss $word'\\''1' app-db pg_restore -U app -d postgres"));

        let volume = RestoreStep::Resource {
            kind: ResourceKind::Volume,
            identity: "data vol".to_string(),
            archive: PathBuf::from("/mnt/run 1/volumes/data vol.tar.gz"),
            workloads: vec![],
        };
        let commands = volume.commands("alpine:3");
        assert_eq!(commands[0], "docker volume create 'data vol'");
        assert_eq!(
            commands[1],
            "docker run --rm -v 'data vol:/target' -v '/mnt/run 1/volumes:/backup:ro' alpine:3 \
             tar xzf '/backup/data vol.tar.gz' -C /target"
        );
    }
}
