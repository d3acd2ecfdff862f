//! Handler-side view of "which test is running now".

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::channel::AttributionReceiver;
use crate::clock::Clock;
use crate::error::Result;
use crate::store::ViolationStore;
use crate::violator::{Violation, ViolationRecord, Violator};

/// Bound on how long a lookup may wait for a fresh announcement.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(10);

/// Last violator seen on the attribution channel.
///
/// Starts out [`Violator::undefined`] and only moves when a complete frame
/// arrives; failed or empty polls leave the previous value in place.
pub struct ViolatorCache {
    receiver: AttributionReceiver,
    last: Violator,
    poll_timeout: Duration,
}

impl ViolatorCache {
    #[must_use]
    pub fn new(receiver: AttributionReceiver) -> Self {
        Self {
            receiver,
            last: Violator::undefined(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn get_violator(&mut self) -> &Violator {
        if let Some(latest) = self.receiver.recv_latest(self.poll_timeout) {
            self.last = latest;
        }
        &self.last
    }

    /// Cached value without touching the channel.
    #[must_use]
    pub fn current(&self) -> &Violator {
        &self.last
    }
}

/// Context shared by the tracer callback and the lifecycle reporter.
///
/// All methods take `&self`; the cache and the per-violator tally sit behind
/// their own mutexes so the tracer may call back from a different thread than
/// the one running lifecycle hooks.
pub struct ViolationCollector {
    cache: Mutex<ViolatorCache>,
    store: Arc<ViolationStore>,
    clock: Arc<dyn Clock>,
    tally: Mutex<BTreeMap<Violator, BTreeMap<String, usize>>>,
}

impl ViolationCollector {
    pub fn new(cache: ViolatorCache, store: Arc<ViolationStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            cache: Mutex::new(cache),
            store,
            clock,
            tally: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<ViolationStore> {
        &self.store
    }

    /// Drains the attribution channel and returns the current violator.
    pub fn get_violator(&self) -> Violator {
        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache.get_violator().clone()
    }

    /// Tracer callback entry point. Never fails: anything that goes wrong is
    /// logged and the violation is dropped.
    pub fn collect(&self, operation: &str, resolved_path: &str) {
        if let Err(error) = self.try_collect(operation, resolved_path) {
            tracing::error!(
                %error,
                syscall = operation,
                path = resolved_path,
                "error collecting violation data"
            );
        }
    }

    fn try_collect(&self, operation: &str, resolved_path: &str) -> Result<()> {
        let violator = self.get_violator();
        let violation = Violation::new(operation, resolved_path);
        *self
            .tally
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(violator.clone())
            .or_default()
            .entry(violation.syscall.clone())
            .or_default() += 1;
        self.report_violation(&violator, &violation)
    }

    /// Persists one violation unless it belongs to no test.
    pub fn report_violation(&self, violator: &Violator, violation: &Violation) -> Result<()> {
        if violator.is_undefined() {
            return Ok(());
        }
        violator.validate()?;

        let record = ViolationRecord::new(violator, violation, self.clock.now());
        tracing::debug!(
            class = %record.class_name,
            method = %record.method_name,
            syscall = %record.syscall,
            path = %record.syscall_args,
            at = %record.timestamp.to_rfc3339(),
            "sandbox violation"
        );
        self.store.add_violation(&record);
        Ok(())
    }

    /// Per-syscall counts of the violations seen for `violator` during this
    /// process, persisted or not.
    #[must_use]
    pub fn violation_tally(&self, violator: &Violator) -> BTreeMap<String, usize> {
        self.tally
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(violator)
            .cloned()
            .unwrap_or_default()
    }
}
