/// Helper utilities for roleback

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::Path;

use crate::utils::{ARCHIVE_EXTENSION, CONTROL_PLANE_PREFIXES};

/// Hostname of the machine running the backup
pub fn host_name() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string())
}

/// Parse Docker style `KEY=value` environment entries.
///
/// Entries without `=` are ignored; a repeated key keeps its last value,
/// matching how the container runtime resolves duplicates.
pub fn parse_env_pairs<I, S>(entries: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    entries
        .into_iter()
        .filter_map(|entry| {
            entry
                .as_ref()
                .split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// Check whether a host path is a kernel/runtime control-plane mount.
///
/// The runtime sockets live under `/run` and `/var/run`, so they are covered
/// by the prefixes; other `.sock` files and `/var/lib/docker` are ordinary state.
pub fn is_control_plane_path(path: &str) -> bool {
    let path = Path::new(path);
    CONTROL_PLANE_PREFIXES
        .iter()
        .any(|prefix| path.starts_with(prefix))
}

/// Archive file name for a named volume
pub fn volume_archive_name(volume: &str) -> String {
    format!("{}{}", volume, ARCHIVE_EXTENSION)
}

/// Archive file name for a bind mount.
///
/// `%` and `/` are percent-escaped so distinct host paths never share a file name.
pub fn bind_archive_name(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    let escaped = trimmed.replace('%', "%25").replace('/', "%2F");
    let stem = if escaped.is_empty() { "root".to_string() } else { escaped };
    format!("{}{}", stem, ARCHIVE_EXTENSION)
}

/// Archive name handed to the sink for one run
pub fn run_archive_name(prefix: &str, host: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}-{}", prefix, host, at.format("%Y%m%dT%H%M%SZ"))
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Mask sensitive data (show only first and last N characters)
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    if value.chars().count() <= visible_chars * 2 {
        "*".repeat(value.chars().count())
    } else {
        let chars: Vec<char> = value.chars().collect();
        let start: String = chars[..visible_chars].iter().collect();
        let end: String = chars[chars.len() - visible_chars..].iter().collect();
        format!("{}...{}", start, end)
    }
}

/// Whether an environment key probably holds a secret
pub fn is_sensitive_key(key: &str) -> bool {
    ["PASSWORD", "SECRET", "KEY", "TOKEN", "AUTH"]
        .iter()
        .any(|marker| key.contains(marker))
}

/// Quote a word for a POSIX shell; plain words are left alone
pub fn shell_quote(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./:=@%+-,".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}
