//! Store location, build metadata and the option surface hosts embed.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::tracer::WritablePath;
use crate::util::ensure_exists;

pub const DEFAULT_STORE_URL: &str = "sqlite:///violations.sqlite";

const SQLITE_SCHEME: &str = "sqlite://";
const SQLITE_FILE_PREFIX: &str = "sqlite:///";
const MEMORY_MARKER: &str = ":memory:";

/// Options a host test runner flattens into its own CLI.
#[derive(Debug, Clone, Default, Args)]
pub struct CollectorOptions {
    /// Network or filesystem access from tests will be reported as violations.
    #[arg(long = "collect-violations")]
    pub collect_violations: bool,

    #[command(flatten)]
    pub store: StoreArgs,

    /// JSON object with optional `branch`, `revision` and `submitstamp` keys.
    #[arg(long = "build-info")]
    pub build_info: Option<String>,
}

#[derive(Debug, Clone, Default, Args)]
pub struct StoreArgs {
    /// URL of the SQL database to store violations [default: sqlite:///violations.sqlite].
    #[arg(long = "violation-db-url", conflicts_with = "violation_db_config")]
    pub violation_db_url: Option<String>,

    /// YAML file describing the SQL database to store violations.
    #[arg(long = "violation-db-config")]
    pub violation_db_config: Option<PathBuf>,
}

impl StoreArgs {
    pub fn location(&self) -> Result<StoreLocation> {
        resolve_store_location(
            self.violation_db_url.as_deref(),
            self.violation_db_config.as_deref(),
        )
    }
}

/// File-backed SQLite store, validated to be visible to other processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreLocation {
    url: String,
    path: PathBuf,
}

impl StoreLocation {
    pub fn parse(url: &str) -> Result<Self> {
        let url = url.trim();
        if url.contains(MEMORY_MARKER) {
            return Err(LedgerError::EphemeralStore {
                url: url.to_string(),
            });
        }
        let Some(rest) = url.strip_prefix(SQLITE_SCHEME) else {
            return Err(LedgerError::UnsupportedBackend {
                url: url.to_string(),
            });
        };
        let rest = rest.split_once('?').map_or(rest, |(path, _)| path);
        // `sqlite://` and `sqlite:///` with no path both mean an in-memory database.
        if rest.is_empty() || rest == "/" {
            return Err(LedgerError::EphemeralStore {
                url: url.to_string(),
            });
        }
        let Some(raw) = rest.strip_prefix('/') else {
            return Err(LedgerError::invalid(format!(
                "store URL {url} names a host, not a file; use {SQLITE_FILE_PREFIX}<path>"
            )));
        };

        Ok(Self {
            url: url.to_string(),
            path: normalize_lexically(&std::path::absolute(raw)?),
        })
    }

    #[must_use]
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            url: format!("{SQLITE_FILE_PREFIX}{}", path.display()),
            path,
        }
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Connection parameters read from `--violation-db-config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfigFile {
    pub drivername: String,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl StoreConfigFile {
    pub fn from_path(path: &Path) -> Result<Self> {
        ensure_exists(path)?;
        let content = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str::<Self>(&content)?)
    }

    #[must_use]
    pub fn to_url(&self) -> String {
        let mut url = format!("{}://", self.drivername);
        if let Some(username) = &self.username {
            url.push_str(username);
            if let Some(password) = &self.password {
                url.push(':');
                url.push_str(password);
            }
            url.push('@');
        }
        if let Some(host) = &self.host {
            url.push_str(host);
        }
        if let Some(port) = self.port {
            url.push_str(&format!(":{port}"));
        }
        if let Some(database) = &self.database {
            url.push('/');
            url.push_str(database);
        }
        url
    }
}

/// Drops `.` segments and folds `..` into its parent without touching the
/// filesystem, so the path matches what the tracer reports after resolution.
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

/// Exactly one of `url` and `config` may be given; neither means the default URL.
pub fn resolve_store_location(url: Option<&str>, config: Option<&Path>) -> Result<StoreLocation> {
    match (url, config) {
        (Some(_), Some(_)) => Err(LedgerError::ConflictingStoreConfig),
        (Some(url), None) => StoreLocation::parse(url),
        (None, Some(config)) => StoreLocation::parse(&StoreConfigFile::from_path(config)?.to_url()),
        (None, None) => StoreLocation::parse(DEFAULT_STORE_URL),
    }
}

/// Build context stamped onto every persisted row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub branch: String,
    pub revision: String,
    pub submitstamp: i64,
}

#[derive(Debug, Default, Deserialize)]
struct RawBuildInfo {
    branch: Option<String>,
    revision: Option<String>,
    submitstamp: Option<f64>,
}

impl BuildInfo {
    /// Parses the `--build-info` blob; missing keys fall back to empty
    /// strings and the current time, unknown keys are ignored.
    pub fn parse(raw: Option<&str>, clock: &dyn Clock) -> Result<Self> {
        let parsed = match raw.map(str::trim).filter(|value| !value.is_empty()) {
            Some(raw) => serde_json::from_str::<RawBuildInfo>(raw)
                .map_err(|error| LedgerError::invalid(format!("invalid build info: {error}")))?,
            None => RawBuildInfo::default(),
        };

        #[allow(clippy::cast_possible_truncation)]
        let submitstamp = parsed
            .submitstamp
            .map_or_else(|| clock.now().timestamp(), |stamp| stamp as i64);

        Ok(Self {
            branch: parsed.branch.unwrap_or_default(),
            revision: parsed.revision.unwrap_or_default(),
            submitstamp,
        })
    }
}

/// Paths the traced worker may write without raising a violation: the null
/// device, and the store file together with its journal siblings.
pub fn writable_paths(location: &StoreLocation) -> Result<Vec<WritablePath>> {
    let store_pattern = format!(
        "^{}.*$",
        regex_lite::escape(&location.path().display().to_string())
    );
    Ok(vec![
        WritablePath::exact("/dev/null"),
        WritablePath::pattern(&store_pattern)?,
    ])
}
