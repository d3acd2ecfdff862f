use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rusqlite::Connection;
use tempfile::tempdir;
use violation_ledger::clock::FixedClock;
use violation_ledger::config::StoreArgs;
use violation_ledger::reporter::render_report;
use violation_ledger::{
    CollectionSession, CollectorOptions, LedgerError, Result, SandboxPolicy, TestLifecycle,
    Tracer, TracerCapabilities, Violator,
};

type SyscallEvent = (String, String, SyncSender<()>);

/// Delivers violations on a separate handler thread, the way an interception
/// engine does, and blocks the traced program until the handler is done.
struct ThreadedTracer {
    events: Mutex<Receiver<SyscallEvent>>,
    denied: Arc<Mutex<Vec<String>>>,
}

impl Tracer for ThreadedTracer {
    fn capabilities(&self) -> TracerCapabilities {
        TracerCapabilities {
            pattern_matching: true,
        }
    }

    fn run(
        &mut self,
        policy: &SandboxPolicy,
        program: &mut dyn FnMut() -> i32,
        on_violation: &(dyn Fn(&str, &str) + Sync),
    ) -> Result<i32> {
        let done = AtomicBool::new(false);
        let events = &self.events;
        let denied = &self.denied;
        let code = thread::scope(|scope| {
            scope.spawn(|| {
                let events = events.lock().unwrap_or_else(PoisonError::into_inner);
                while !done.load(Ordering::Acquire) {
                    let Ok((operation, path, ack)) =
                        events.recv_timeout(Duration::from_millis(5))
                    else {
                        continue;
                    };
                    if !policy.permits(&operation, Path::new(&path)) {
                        denied
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(operation.clone());
                        on_violation(&operation, &path);
                    }
                    let _ = ack.send(());
                }
            });
            let code = program();
            done.store(true, Ordering::Release);
            code
        });
        Ok(code)
    }
}

fn syscall(events: &SyncSender<SyscallEvent>, operation: &str, path: &str) {
    let (ack, acked) = sync_channel(0);
    events
        .send((operation.to_string(), path.to_string(), ack))
        .expect("tracer alive");
    acked.recv().expect("handled");
}

fn options_for(db: &Path) -> CollectorOptions {
    CollectorOptions {
        collect_violations: true,
        store: StoreArgs {
            violation_db_url: Some(format!("sqlite:///{}", db.display())),
            violation_db_config: None,
        },
        build_info: Some(
            r#"{"branch": "main", "revision": "abc123", "submitstamp": 1700000000}"#.to_string(),
        ),
    }
}

fn test_id(class: &str, method: &str) -> Violator {
    Violator::new(class, method, "mod_a").expect("violator")
}

fn prepare(db: &Path) -> (CollectionSession, ThreadedTracer, SyncSender<SyscallEvent>) {
    let (events_tx, events_rx) = sync_channel(0);
    let mut tracer = ThreadedTracer {
        events: Mutex::new(events_rx),
        denied: Arc::default(),
    };
    let session = CollectionSession::prepare(
        &options_for(db),
        Arc::new(FixedClock::from_unix(1_700_000_100)),
        Some(&mut tracer),
    )
    .expect("prepare")
    .expect("collection enabled");
    (session, tracer, events_tx)
}

#[test]
fn announced_test_owns_its_violation() {
    let temp = tempdir().expect("tempdir");
    let db = temp.path().join("violations.sqlite");
    let (mut session, mut tracer, events) = prepare(&db);

    let code = session
        .run(&mut tracer, &mut |reporter| {
            reporter.test_start(&test_id("TestA", "test_x"));
            syscall(&events, "open", "/etc/passwd");
            reporter.test_complete();
            0
        })
        .expect("run");
    assert_eq!(code, 0);

    let conn = Connection::open(&db).expect("open");
    let rows = conn
        .prepare(
            "SELECT branch, revision, submitstamp, module, class_name, method_name, syscall, syscall_args \
             FROM violations",
        )
        .expect("prepare")
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })
        .expect("query")
        .collect::<std::result::Result<Vec<_>, _>>()
        .expect("rows");

    assert_eq!(
        rows,
        vec![(
            "main".to_string(),
            "abc123".to_string(),
            1_700_000_000,
            "mod_a".to_string(),
            "TestA".to_string(),
            "test_x".to_string(),
            "open".to_string(),
            "/etc/passwd".to_string(),
        )]
    );
}

#[test]
fn same_syscall_from_two_tests_forms_two_groups() {
    let temp = tempdir().expect("tempdir");
    let db = temp.path().join("violations.sqlite");
    let (mut session, mut tracer, events) = prepare(&db);

    session
        .run(&mut tracer, &mut |reporter| {
            reporter.test_start(&test_id("TestA", "test_x"));
            syscall(&events, "connect", "");
            reporter.test_complete();
            reporter.test_start(&test_id("TestB", "test_y"));
            syscall(&events, "connect", "");
            reporter.test_complete();
            0
        })
        .expect("run");

    let counts = session.collector.store().violation_counts().expect("counts");
    let groups = counts
        .iter()
        .map(|group| {
            (
                group.class_name.as_str(),
                group.method_name.as_str(),
                group.syscall.as_str(),
                group.count,
            )
        })
        .collect::<Vec<_>>();
    assert_eq!(
        groups,
        vec![
            ("TestA", "test_x", "connect", 1),
            ("TestB", "test_y", "connect", 1),
        ]
    );
}

#[test]
fn permitted_writes_are_not_violations() {
    let temp = tempdir().expect("tempdir");
    let db = temp.path().join("violations.sqlite");
    let (mut session, mut tracer, events) = prepare(&db);
    let journal = format!("{}-journal", db.display());

    session
        .run(&mut tracer, &mut |reporter| {
            reporter.test_start(&test_id("TestA", "test_x"));
            syscall(&events, "open", "/dev/null");
            syscall(&events, "open", &journal);
            reporter.test_complete();
            0
        })
        .expect("run");

    assert!(tracer.denied.lock().expect("denied").is_empty());
    assert!(session.collector.store().violation_counts().expect("counts").is_empty());
}

#[test]
fn clean_run_renders_only_success_line() {
    let temp = tempdir().expect("tempdir");
    let db = temp.path().join("violations.sqlite");
    let (mut session, mut tracer, _events) = prepare(&db);

    session
        .run(&mut tracer, &mut |reporter| {
            reporter.test_start(&test_id("TestA", "test_x"));
            reporter.test_complete();
            0
        })
        .expect("run");

    let counts = session.collector.store().violation_counts().expect("counts");
    assert_eq!(render_report(&counts), vec!["No syscall violations! \\o/".to_string()]);
    assert_eq!(session.collector.store().test_count().expect("tests"), 1);
}

#[test]
fn violation_before_any_announcement_is_discarded() {
    let temp = tempdir().expect("tempdir");
    let db = temp.path().join("violations.sqlite");
    let (mut session, mut tracer, events) = prepare(&db);

    session
        .run(&mut tracer, &mut |_reporter| {
            syscall(&events, "open", "/etc/passwd");
            0
        })
        .expect("run");

    assert_eq!(tracer.denied.lock().expect("denied").len(), 1);
    assert!(session.collector.store().violation_counts().expect("counts").is_empty());
    assert_eq!(
        session.collector.violation_tally(&Violator::undefined())["open"],
        1
    );
}

#[test]
fn in_memory_store_fails_before_any_test_runs() {
    let (_events_tx, events_rx) = sync_channel(0);
    let mut tracer = ThreadedTracer {
        events: Mutex::new(events_rx),
        denied: Arc::default(),
    };
    let mut options = options_for(Path::new("unused.sqlite"));
    options.store.violation_db_url = Some("sqlite:///:memory:".to_string());

    let error = CollectionSession::prepare(
        &options,
        Arc::new(FixedClock::from_unix(0)),
        Some(&mut tracer),
    )
    .err()
    .expect("configuration error");

    assert!(matches!(error, LedgerError::EphemeralStore { .. }));
    assert_eq!(error.exit_code(), 2);
}
