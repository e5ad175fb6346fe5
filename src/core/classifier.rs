/// Database engine classification from image references

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Postgres,
    Mysql,
    Mongo,
    Redis,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Postgres => "postgres",
            EngineKind::Mysql => "mysql",
            EngineKind::Mongo => "mongo",
            EngineKind::Redis => "redis",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered (pattern, engine) pairs; the patterns never overlap in practice
const ENGINE_PATTERNS: &[(&str, EngineKind)] = &[
    ("postgres", EngineKind::Postgres),
    ("mysql", EngineKind::Mysql),
    ("mariadb", EngineKind::Mysql),
    ("mongo", EngineKind::Mongo),
    ("redis", EngineKind::Redis),
];

/// Classify an image reference; `None` means no database engine.
///
/// Case-sensitive substring match, first pattern wins.
pub fn classify(image: &str) -> Option<EngineKind> {
    ENGINE_PATTERNS
        .iter()
        .find(|(pattern, _)| image.contains(pattern))
        .map(|(_, kind)| *kind)
}
