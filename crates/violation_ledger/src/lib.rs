#![forbid(unsafe_code)]
//! Attribution of sandbox syscall violations to the test that caused them.
//!
//! The controller announces each test phase over the [`channel`] as it begins.
//! The violation handler, which may run in another process, reads the most
//! recent announcement through a [`cache::ViolatorCache`] whenever the tracer
//! reports a violation, and persists the attributed record in a
//! [`store::ViolationStore`]. At the end of the run the [`reporter`] prints
//! per-syscall totals and per-test groups.

pub mod cache;
pub mod channel;
pub mod check;
pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod output;
pub mod reporter;
pub mod session;
pub mod store;
pub mod tracer;
pub mod util;
pub mod violator;

pub use cache::{ViolationCollector, ViolatorCache};
pub use channel::{AttributionReceiver, AttributionSender, MAX_RECORD_SIZE};
pub use cli::{Cli, Commands, run, run_from_env};
pub use config::{BuildInfo, CollectorOptions, StoreLocation};
pub use error::{ErrorKind, LedgerError, Result};
pub use reporter::{TestLifecycle, ViolationReporter};
pub use session::CollectionSession;
pub use store::ViolationStore;
pub use tracer::{SandboxPolicy, Tracer, TracerCapabilities, WritablePath};
pub use violator::{Violation, Violator};
