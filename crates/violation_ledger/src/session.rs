//! Wiring for one collection run: store, channel, collector and reporter.

use std::sync::Arc;

use crate::cache::{ViolationCollector, ViolatorCache};
#[cfg(not(unix))]
use crate::channel::{MAX_RECORD_SIZE, memory_channel};
use crate::channel::{AttributionReceiver, AttributionSender};
#[cfg(unix)]
use crate::channel::{DEFAULT_WRITE_TIMEOUT, socket_channel};
use crate::clock::Clock;
use crate::config::{BuildInfo, CollectorOptions, StoreLocation};
use crate::error::Result;
use crate::reporter::ViolationReporter;
use crate::store::ViolationStore;
use crate::tracer::{Tracer, require_tracer, run_traced};

/// Everything a run needs, built once before the first test starts.
pub struct CollectionSession {
    pub location: StoreLocation,
    pub collector: Arc<ViolationCollector>,
    pub reporter: ViolationReporter,
}

impl CollectionSession {
    /// Returns `None` when collection is switched off. Configuration problems
    /// (no tracer, tracer lacking pattern support, bad store settings) fail
    /// here, before any test executes.
    pub fn prepare<T: Tracer + ?Sized>(
        options: &CollectorOptions,
        clock: Arc<dyn Clock>,
        tracer: Option<&mut T>,
    ) -> Result<Option<Self>> {
        if !options.collect_violations {
            return Ok(None);
        }
        require_tracer(tracer)?;
        #[cfg(unix)]
        let (sender, receiver) = socket_channel(DEFAULT_WRITE_TIMEOUT)?;
        #[cfg(not(unix))]
        let (sender, receiver) = memory_channel(16 * MAX_RECORD_SIZE);
        Self::with_channel(options, clock, sender, receiver).map(Some)
    }

    /// Builds the session over an existing channel; the tracer check is the
    /// caller's responsibility.
    pub fn with_channel(
        options: &CollectorOptions,
        clock: Arc<dyn Clock>,
        sender: AttributionSender,
        receiver: AttributionReceiver,
    ) -> Result<Self> {
        let location = options.store.location()?;
        let build = BuildInfo::parse(options.build_info.as_deref(), clock.as_ref())?;
        let store = Arc::new(ViolationStore::create(&location, build)?);
        let collector = Arc::new(ViolationCollector::new(
            ViolatorCache::new(receiver),
            store,
            clock,
        ));
        let reporter = ViolationReporter::new(sender, Arc::clone(&collector));

        Ok(Self {
            location,
            collector,
            reporter,
        })
    }

    /// Runs `program` under `tracer`. The program drives the lifecycle hooks
    /// through the reporter it is handed.
    pub fn run<T: Tracer + ?Sized>(
        &mut self,
        tracer: &mut T,
        program: &mut dyn FnMut(&mut ViolationReporter) -> i32,
    ) -> Result<i32> {
        let Self {
            location,
            collector,
            reporter,
        } = self;
        let mut traced = || program(reporter);
        run_traced(tracer, location, &mut traced, collector)
    }
}
