/// Shared names, paths and defaults for roleback
///
/// The working directory of a run is laid out as:
///   catalog.json          run catalog (owner-only)
///   dumps/<id><ext>       database dumps
///   volumes/<name>.tar.gz named volume archives
///   binds/<path>.tar.gz   bind mount archives

use std::time::Duration;

/// Final catalog file name inside the working directory
pub const CATALOG_FILE: &str = "catalog.json";

/// Temporary name the catalog is written to before promotion
pub const CATALOG_TMP_FILE: &str = "catalog.json.tmp";

pub const DUMPS_DIR: &str = "dumps";
pub const VOLUMES_DIR: &str = "volumes";
pub const BINDS_DIR: &str = "binds";

/// Suffix of every volume and bind archive
pub const ARCHIVE_EXTENSION: &str = ".tar.gz";

/// Host paths that are kernel or runtime provided and never hold workload state.
/// A bind whose source is one of these, or lives beneath one, is skipped.
pub const CONTROL_PLANE_PREFIXES: &[&str] = &[
    "/proc",
    "/sys",
    "/dev",
    "/run",
    "/var/run",
];

/// Default retry policy for database dumps
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Hard ceilings for external invocations
pub const DEFAULT_DUMP_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_ARCHIVE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
pub const DEFAULT_REDIS_SAVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Helper image used to tar named volumes
pub const DEFAULT_ARCHIVE_IMAGE: &str = "alpine:3";

pub const DEFAULT_ARCHIVE_PREFIX: &str = "containers";
pub const DEFAULT_LOCK_FILE: &str = "/run/lock/roleback.lock";
pub const DEFAULT_WORK_ROOT: &str = "/var/tmp";
pub const DEFAULT_SINK_BINARY: &str = "restic";

/// Prefix of the per-run working directory
pub const WORKDIR_PREFIX: &str = "roleback-";
