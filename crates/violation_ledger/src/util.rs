use std::fs;
use std::path::Path;

use chrono::{SecondsFormat, Utc};

use crate::error::{LedgerError, Result};

#[must_use]
pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Writes `content` to `path`, creating missing parent directories.
pub fn write_string(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)?;
    Ok(())
}

pub fn ensure_exists(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    Err(LedgerError::MissingPath {
        path: path.to_path_buf(),
    })
}
