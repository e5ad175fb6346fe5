/// Run catalog
///
/// The catalog records every workload of a run together with the resources
/// that were archived for it. It is built in memory, serialized once, checked
/// by parsing it back, then renamed into place with owner-only permissions
/// because the environment snapshots contain database credentials.

use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core::classifier::EngineKind;
use crate::utils::{CATALOG_FILE, CATALOG_TMP_FILE};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("workload {0} was already added to the catalog")]
    Duplicate(String),

    #[error("failed to serialize catalog: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("catalog at {path} is malformed: {detail}")]
    Malformed { path: PathBuf, detail: String },

    #[error("catalog I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Per-workload catalog entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub image: String,
    pub volumes: Vec<String>,
    pub binds: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub is_database: bool,
    pub db_type: Option<EngineKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    pub generated: DateTime<Utc>,
    pub hostname: String,
    /// Workloads in discovery order
    #[serde(with = "ordered_entries")]
    pub containers: Vec<(String, CatalogEntry)>,
    pub backed_up_volumes: BTreeSet<String>,
    pub backed_up_binds: BTreeSet<String>,
}

impl Catalog {
    pub fn entry(&self, id: &str) -> Option<&CatalogEntry> {
        self.containers
            .iter()
            .find(|(name, _)| name == id)
            .map(|(_, entry)| entry)
    }

    /// Read a catalog from disk
    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let bytes = fs::read(path).map_err(|source| CatalogError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&bytes, path)
    }

    fn parse(bytes: &[u8], path: &Path) -> Result<Self, CatalogError> {
        let catalog: Self = serde_json::from_slice(bytes).map_err(|err| CatalogError::Malformed {
            path: path.to_path_buf(),
            detail: err.to_string(),
        })?;
        catalog.check_consistency(path)?;
        Ok(catalog)
    }

    /// Summary sets must be exactly the union of per-workload resources
    fn check_consistency(&self, path: &Path) -> Result<(), CatalogError> {
        let mut volumes = BTreeSet::new();
        let mut binds = BTreeSet::new();
        let mut seen = HashSet::new();

        for (id, entry) in &self.containers {
            if !seen.insert(id.as_str()) {
                return Err(CatalogError::Malformed {
                    path: path.to_path_buf(),
                    detail: format!("workload {} appears twice", id),
                });
            }
            volumes.extend(entry.volumes.iter().cloned());
            binds.extend(entry.binds.iter().cloned());
        }

        if volumes != self.backed_up_volumes || binds != self.backed_up_binds {
            return Err(CatalogError::Malformed {
                path: path.to_path_buf(),
                detail: "summary sets do not match per-workload resources".to_string(),
            });
        }
        Ok(())
    }
}

/// Accumulates workloads during a run
#[derive(Debug)]
pub struct CatalogBuilder {
    hostname: String,
    entries: Vec<(String, CatalogEntry)>,
    ids: HashSet<String>,
    volumes: BTreeSet<String>,
    binds: BTreeSet<String>,
}

/// Catalog promoted to its final location
#[derive(Debug, Clone)]
pub struct PromotedCatalog {
    pub path: PathBuf,
    pub catalog: Catalog,
}

impl CatalogBuilder {
    pub fn begin(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            entries: Vec::new(),
            ids: HashSet::new(),
            volumes: BTreeSet::new(),
            binds: BTreeSet::new(),
        }
    }

    /// Append a workload. `volumes` and `binds` must only name resources whose
    /// archive exists; they feed the run-wide summary sets.
    pub fn add_workload(
        &mut self,
        id: &str,
        image: &str,
        volumes: Vec<String>,
        binds: Vec<String>,
        env: BTreeMap<String, String>,
        engine: Option<EngineKind>,
    ) -> Result<(), CatalogError> {
        if !self.ids.insert(id.to_string()) {
            return Err(CatalogError::Duplicate(id.to_string()));
        }

        self.volumes.extend(volumes.iter().cloned());
        self.binds.extend(binds.iter().cloned());
        self.entries.push((
            id.to_string(),
            CatalogEntry {
                image: image.to_string(),
                volumes,
                binds,
                env,
                is_database: engine.is_some(),
                db_type: engine,
            },
        ));
        Ok(())
    }

    /// Build the catalog without touching the filesystem
    pub fn build(self, generated: DateTime<Utc>) -> Catalog {
        Catalog {
            generated,
            hostname: self.hostname,
            containers: self.entries,
            backed_up_volumes: self.volumes,
            backed_up_binds: self.binds,
        }
    }

    /// Serialize into `dir`, validate, promote to `catalog.json` (mode 0600)
    pub fn finalize(self, dir: &Path, generated: DateTime<Utc>) -> Result<PromotedCatalog, CatalogError> {
        let catalog = self.build(generated);
        let bytes = serde_json::to_vec_pretty(&catalog).map_err(CatalogError::Serialize)?;

        let tmp = dir.join(CATALOG_TMP_FILE);
        write_private(&tmp, &bytes)?;

        let written = fs::read(&tmp).map_err(|source| CatalogError::Io {
            path: tmp.clone(),
            source,
        })?;
        let parsed = match Catalog::parse(&written, &tmp) {
            Ok(parsed) => parsed,
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                return Err(err);
            }
        };
        if parsed.containers.len() != catalog.containers.len() {
            let _ = fs::remove_file(&tmp);
            return Err(CatalogError::Malformed {
                path: tmp,
                detail: "workload count changed while writing".to_string(),
            });
        }

        let path = dir.join(CATALOG_FILE);
        fs::rename(&tmp, &path).map_err(|source| CatalogError::Io {
            path: path.clone(),
            source,
        })?;

        Ok(PromotedCatalog { path, catalog })
    }
}

fn write_private(path: &Path, bytes: &[u8]) -> Result<(), CatalogError> {
    let io_err = |source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(io_err)?;
    file.write_all(bytes).map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    Ok(())
}

/// `containers` is a JSON object whose key order is the discovery order
mod ordered_entries {
    use super::*;

    pub fn serialize<S: Serializer>(
        entries: &[(String, CatalogEntry)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (id, entry) in entries {
            map.serialize_entry(id, entry)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, CatalogEntry)>, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = Vec<(String, CatalogEntry)>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of workload id to catalog entry")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((id, entry)) = access.next_entry::<String, CatalogEntry>()? {
                    entries.push((id, entry));
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_map(EntriesVisitor)
    }
}
