//! Lifecycle hooks that announce the running test, and the end-of-run summary.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use serde::Serialize;
use serde_json::json;

use crate::cache::ViolationCollector;
use crate::channel::AttributionSender;
use crate::config::StoreArgs;
use crate::error::Result;
use crate::output::Console;
use crate::store::{ViolationCount, ViolationStore};
use crate::util::{now_utc_iso, write_string};
use crate::violator::{TestRecord, Violator};

pub const NO_VIOLATIONS_LINE: &str = "No syscall violations! \\o/";

const RULE_WIDTH: usize = 72;

/// Callbacks a host test framework fires around every test phase.
///
/// Each `*_start` hook receives the identity of the code about to run.
pub trait TestLifecycle {
    fn case_start(&mut self, test: &Violator);
    fn case_complete(&mut self);
    fn class_setup_start(&mut self, test: &Violator);
    fn class_setup_complete(&mut self);
    fn class_teardown_start(&mut self, test: &Violator);
    fn class_teardown_complete(&mut self);
    fn setup_start(&mut self, test: &Violator);
    fn setup_complete(&mut self);
    fn test_start(&mut self, test: &Violator);
    fn test_complete(&mut self);
    fn teardown_start(&mut self, test: &Violator);
    fn teardown_complete(&mut self);
    /// Called once after every test has finished.
    fn report(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyscallTotal {
    pub syscall: String,
    pub count: i64,
}

/// Per-syscall totals, least frequent first; ties by name.
#[must_use]
pub fn syscall_totals(counts: &[ViolationCount]) -> Vec<SyscallTotal> {
    let mut by_syscall = BTreeMap::<&str, i64>::new();
    for group in counts {
        *by_syscall.entry(group.syscall.as_str()).or_default() += group.count;
    }
    let mut totals = by_syscall
        .into_iter()
        .map(|(syscall, count)| SyscallTotal {
            syscall: syscall.to_string(),
            count,
        })
        .collect::<Vec<_>>();
    totals.sort_by_key(|total| total.count);
    totals
}

#[must_use]
pub fn total_violations(counts: &[ViolationCount]) -> i64 {
    counts.iter().map(|group| group.count).sum()
}

/// Human-readable report lines, in print order.
#[must_use]
pub fn render_report(counts: &[ViolationCount]) -> Vec<String> {
    if counts.is_empty() {
        return vec![NO_VIOLATIONS_LINE.to_string()];
    }

    let mut lines = vec![
        String::new(),
        "=".repeat(RULE_WIDTH),
        "VIOLATIONS:".to_string(),
        String::new(),
    ];
    lines.extend(
        syscall_totals(counts)
            .into_iter()
            .map(|total| format!("{}\t{}", total.syscall, total.count)),
    );
    lines.push(String::new());
    lines.extend(counts.iter().map(|group| {
        format!(
            "{}.{}\t{}\t{}",
            group.class_name, group.method_name, group.syscall, group.count
        )
    }));
    lines
}

/// Machine-readable form of the report.
#[derive(Debug, Clone, Serialize)]
pub struct ReportSummary {
    pub generated_at: String,
    pub tests_recorded: i64,
    pub total_violations: i64,
    pub syscalls: Vec<SyscallTotal>,
    pub violations: Vec<ViolationCount>,
}

impl ReportSummary {
    pub fn from_store(store: &ViolationStore) -> Result<Self> {
        let violations = store.violation_counts()?;
        Ok(Self {
            generated_at: now_utc_iso(),
            tests_recorded: store.test_count()?,
            total_violations: total_violations(&violations),
            syscalls: syscall_totals(&violations),
            violations,
        })
    }
}

#[derive(Debug, Clone, Args)]
pub struct ReportArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Also write the summary as JSON to this file.
    #[arg(long = "output-json")]
    pub output_json: Option<PathBuf>,
}

/// Prints the aggregated report for a store written by an earlier run.
pub fn run_report(args: ReportArgs) -> Result<()> {
    let console = Console::detect();
    let location = args.store.location()?;
    let store = ViolationStore::open_existing(&location)?;
    let summary = ReportSummary::from_store(&store)?;

    if let Some(path) = &args.output_json {
        write_string(path, &serde_json::to_string_pretty(&summary)?)?;
        tracing::info!(path = %path.display(), "wrote report summary");
    }

    console.lines(render_report(&summary.violations));
    let status = if summary.total_violations == 0 {
        "clean"
    } else {
        "violations"
    };
    console.status(
        "report",
        status,
        json!({
            "store": location.url(),
            "tests_recorded": summary.tests_recorded,
            "total_violations": summary.total_violations,
            "output_json": args.output_json.as_ref().map(|path| path.display().to_string()),
        }),
    );

    Ok(())
}

/// Controller-side hook implementation.
pub struct ViolationReporter {
    sender: AttributionSender,
    collector: Arc<ViolationCollector>,
    out: Box<dyn Write + Send>,
}

impl ViolationReporter {
    pub fn new(sender: AttributionSender, collector: Arc<ViolationCollector>) -> Self {
        Self::with_output(sender, collector, Box::new(std::io::stderr()))
    }

    pub fn with_output(
        sender: AttributionSender,
        collector: Arc<ViolationCollector>,
        out: Box<dyn Write + Send>,
    ) -> Self {
        Self {
            sender,
            collector,
            out,
        }
    }

    /// Announces `test` as the current violator and records the phase start.
    pub fn set_violator(&mut self, test: &Violator) {
        if let Err(error) = self.sender.publish(test) {
            tracing::warn!(%error, test = %test, "failed to announce running test");
        }
        self.collector.store().add_test(&TestRecord::from(test));
    }

    fn refresh(&mut self) {
        self.collector.get_violator();
    }
}

impl TestLifecycle for ViolationReporter {
    fn case_start(&mut self, test: &Violator) {
        self.set_violator(test);
    }

    fn case_complete(&mut self) {
        self.refresh();
    }

    fn class_setup_start(&mut self, test: &Violator) {
        self.set_violator(test);
    }

    fn class_setup_complete(&mut self) {
        self.refresh();
    }

    fn class_teardown_start(&mut self, test: &Violator) {
        self.set_violator(test);
    }

    fn class_teardown_complete(&mut self) {
        self.refresh();
    }

    fn setup_start(&mut self, test: &Violator) {
        self.set_violator(test);
    }

    fn setup_complete(&mut self) {
        self.refresh();
    }

    fn test_start(&mut self, test: &Violator) {
        self.set_violator(test);
    }

    fn test_complete(&mut self) {
        self.refresh();
    }

    fn teardown_start(&mut self, test: &Violator) {
        self.set_violator(test);
    }

    fn teardown_complete(&mut self) {
        self.refresh();
    }

    fn report(&mut self) -> Result<()> {
        let counts = self.collector.store().violation_counts()?;
        for line in render_report(&counts) {
            writeln!(self.out, "{line}")?;
        }
        self.out.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{
        NO_VIOLATIONS_LINE, ReportArgs, TestLifecycle, ViolationReporter, render_report,
        run_report, syscall_totals, total_violations,
    };
    use crate::cache::{ViolationCollector, ViolatorCache};
    use crate::channel::{MAX_RECORD_SIZE, memory_channel};
    use crate::clock::FixedClock;
    use crate::config::{BuildInfo, StoreArgs, StoreLocation};
    use crate::error::LedgerError;
    use crate::store::{ViolationCount, ViolationStore};
    use crate::violator::Violator;

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        fn text(&self) -> String {
            let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            String::from_utf8_lossy(&bytes).into_owned()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn reporter_in(
        dir: &std::path::Path,
    ) -> (ViolationReporter, Arc<ViolationCollector>, SharedBuffer) {
        let location = StoreLocation::from_path(dir.join("violations.sqlite"));
        let store =
            Arc::new(ViolationStore::create(&location, BuildInfo::default()).expect("store"));
        let (sender, receiver) = memory_channel(4 * MAX_RECORD_SIZE);
        let collector = Arc::new(ViolationCollector::new(
            ViolatorCache::new(receiver).with_poll_timeout(Duration::from_millis(1)),
            store,
            Arc::new(FixedClock::from_unix(100)),
        ));
        let out = SharedBuffer::default();
        let reporter =
            ViolationReporter::with_output(sender, Arc::clone(&collector), Box::new(out.clone()));
        (reporter, collector, out)
    }

    fn group(class: &str, method: &str, syscall: &str, count: i64) -> ViolationCount {
        ViolationCount {
            class_name: class.to_string(),
            method_name: method.to_string(),
            syscall: syscall.to_string(),
            count,
        }
    }

    fn sample() -> Vec<ViolationCount> {
        vec![
            group("fake_class1", "fake_method1", "fake_violation1", 5),
            group("fake_class1", "fake_method2", "fake_violation2", 5),
            group("fake_class2", "fake_method3", "fake_violation3", 5),
            group("fake_class3", "fake_method4", "fake_violation1", 5),
        ]
    }

    #[test]
    fn syscall_totals_sum_and_sort_ascending() {
        let totals = syscall_totals(&sample())
            .into_iter()
            .map(|total| (total.syscall, total.count))
            .collect::<Vec<_>>();
        assert_eq!(
            totals,
            vec![
                ("fake_violation2".to_string(), 5),
                ("fake_violation3".to_string(), 5),
                ("fake_violation1".to_string(), 10),
            ]
        );
    }

    #[test]
    fn total_violations_sums_every_group() {
        assert_eq!(total_violations(&sample()), 20);
        assert_eq!(total_violations(&[]), 0);
    }

    #[test]
    fn empty_report_is_only_the_success_line() {
        assert_eq!(render_report(&[]), vec![NO_VIOLATIONS_LINE.to_string()]);
    }

    #[test]
    fn report_lists_totals_then_groups_in_store_order() {
        let lines = render_report(&sample());
        let totals_at = lines
            .iter()
            .position(|line| line == "VIOLATIONS:")
            .expect("header");

        assert_eq!(lines[totals_at + 2], "fake_violation2\t5");
        assert_eq!(lines[totals_at + 4], "fake_violation1\t10");
        assert_eq!(lines[totals_at + 5], "");
        assert_eq!(
            &lines[totals_at + 6..],
            &[
                "fake_class1.fake_method1\tfake_violation1\t5".to_string(),
                "fake_class1.fake_method2\tfake_violation2\t5".to_string(),
                "fake_class2.fake_method3\tfake_violation3\t5".to_string(),
                "fake_class3.fake_method4\tfake_violation1\t5".to_string(),
            ]
        );
    }

    #[test]
    fn hooks_attribute_violations_to_the_announced_phase() {
        let temp = tempdir().expect("tempdir");
        let (mut reporter, collector, out) = reporter_in(temp.path());
        let test = Violator::new("TestA", "test_x", "mod_a").expect("violator");
        let class_setup = Violator::new("TestA", "class_setup", "mod_a").expect("violator");

        reporter.class_setup_start(&class_setup);
        collector.collect("open", "/tmp/a");
        reporter.class_setup_complete();

        reporter.test_start(&test);
        collector.collect("open", "/tmp/b");
        collector.collect("connect", "");
        reporter.test_complete();

        assert_eq!(collector.store().test_count().expect("tests"), 2);
        reporter.report().expect("report");

        let text = out.text();
        assert!(text.contains("VIOLATIONS:"));
        assert!(text.contains("open\t2"));
        assert!(text.contains("TestA.test_x\topen\t1"));
        assert!(text.contains("TestA.test_x\tconnect\t1"));
        assert!(text.contains("TestA.class_setup\topen\t1"));
    }

    #[test]
    fn clean_run_reports_success_line() {
        let temp = tempdir().expect("tempdir");
        let (mut reporter, _collector, out) = reporter_in(temp.path());
        reporter.case_start(&Violator::new("TestA", "run", "mod_a").expect("violator"));
        reporter.case_complete();
        reporter.report().expect("report");
        assert_eq!(out.text(), format!("{NO_VIOLATIONS_LINE}\n"));
    }

    #[test]
    fn report_command_requires_existing_store() {
        let temp = tempdir().expect("tempdir");
        let missing = temp.path().join("missing.sqlite");
        let result = run_report(ReportArgs {
            store: StoreArgs {
                violation_db_url: Some(format!("sqlite:///{}", missing.display())),
                violation_db_config: None,
            },
            output_json: None,
        });
        match result.expect_err("missing store") {
            LedgerError::MissingPath { path } => assert_eq!(path, missing),
            other => panic!("expected MissingPath, got {other}"),
        }
    }
}
