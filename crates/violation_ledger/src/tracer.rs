//! Boundary with the syscall-interception engine.
//!
//! The engine itself lives outside this crate. It runs the test program under
//! interception, consults a [`SandboxPolicy`] for every write or network
//! operation, and calls back once per operation the policy does not permit.

use std::path::{Path, PathBuf};

use regex_lite::Regex;

use crate::cache::ViolationCollector;
use crate::config::{StoreLocation, writable_paths};
use crate::error::{LedgerError, Result};

const NETWORK_OPERATIONS: [&str; 8] = [
    "socket",
    "socketcall",
    "connect",
    "bind",
    "listen",
    "accept",
    "sendto",
    "sendmsg",
];

#[derive(Debug, Clone)]
pub enum WritablePath {
    Exact(PathBuf),
    Pattern(Regex),
}

impl WritablePath {
    pub fn exact(path: impl Into<PathBuf>) -> Self {
        Self::Exact(path.into())
    }

    pub fn pattern(pattern: &str) -> Result<Self> {
        Regex::new(pattern).map(Self::Pattern).map_err(|error| {
            LedgerError::invalid(format!("invalid writable path pattern: {error}"))
        })
    }

    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        match self {
            Self::Exact(exact) => exact == path,
            Self::Pattern(re) => re.is_match(&path.to_string_lossy()),
        }
    }
}

/// What the traced worker may do without it counting as a violation.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub writable: Vec<WritablePath>,
    pub allow_network: bool,
}

impl SandboxPolicy {
    /// Collection-mode policy: the given writable paths and no network.
    #[must_use]
    pub fn collect_only(writable: Vec<WritablePath>) -> Self {
        Self {
            writable,
            allow_network: false,
        }
    }

    #[must_use]
    pub fn permits_write(&self, path: &Path) -> bool {
        self.writable.iter().any(|candidate| candidate.matches(path))
    }

    #[must_use]
    pub fn permits(&self, operation: &str, path: &Path) -> bool {
        if is_network_operation(operation) {
            self.allow_network
        } else {
            self.permits_write(path)
        }
    }
}

#[must_use]
pub fn is_network_operation(operation: &str) -> bool {
    NETWORK_OPERATIONS.contains(&operation)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TracerCapabilities {
    /// Writable paths may be given as regular expressions.
    pub pattern_matching: bool,
}

/// Syscall-interception engine.
pub trait Tracer {
    fn capabilities(&self) -> TracerCapabilities;

    /// Runs `program` under interception and returns its exit code.
    /// `on_violation(operation, resolved_path)` may be invoked from any
    /// thread while `program` runs.
    fn run(
        &mut self,
        policy: &SandboxPolicy,
        program: &mut dyn FnMut() -> i32,
        on_violation: &(dyn Fn(&str, &str) + Sync),
    ) -> Result<i32>;
}

/// Fails before any test runs when no usable tracer is available.
pub fn require_tracer<T: Tracer + ?Sized>(tracer: Option<&mut T>) -> Result<&mut T> {
    let tracer = tracer.ok_or(LedgerError::MissingTracer)?;
    if !tracer.capabilities().pattern_matching {
        return Err(LedgerError::TracerCapability {
            capability: "pattern matching",
        });
    }
    Ok(tracer)
}

/// Runs `program` under `tracer`, routing every violation to `collector`.
pub fn run_traced<T: Tracer + ?Sized>(
    tracer: &mut T,
    location: &StoreLocation,
    program: &mut dyn FnMut() -> i32,
    collector: &ViolationCollector,
) -> Result<i32> {
    let policy = SandboxPolicy::collect_only(writable_paths(location)?);
    tracing::info!(
        store = %location,
        writable = policy.writable.len(),
        "running program under tracer"
    );
    let on_violation = |operation: &str, resolved_path: &str| {
        collector.collect(operation, resolved_path);
    };
    tracer.run(&policy, program, &on_violation)
}
