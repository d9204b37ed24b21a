//! Startup file loading and small helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use log::error;

use crate::egress::{self, Egress};
use crate::error::StartupError;

/// Load the process bearer credential. Missing or empty files are fatal.
pub fn load_credential(path: &str) -> Result<String, StartupError> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        error!("Failed to load credential from {}: {}", path, source);
        StartupError {
            what: "credential",
            path: path.to_string(),
            source,
        }
    })?;
    let token = content.trim();
    if token.is_empty() {
        error!("Credential file {} is empty", path);
        return Err(StartupError {
            what: "credential",
            path: path.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, "file is empty"),
        });
    }
    Ok(token.to_string())
}

/// Load the ordered egress backlog. A missing file is fatal; an empty
/// backlog is not (the pool simply never admits anyone).
pub fn load_backlog(path: &str) -> Result<Vec<Egress>, StartupError> {
    let content = std::fs::read_to_string(path).map_err(|source| {
        error!("Failed to load backlog from {}: {}", path, source);
        StartupError {
            what: "backlog",
            path: path.to_string(),
            source,
        }
    })?;
    Ok(egress::parse_backlog(&content))
}

/// Seconds since the Unix epoch.
pub(crate) fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
