use clap::Args;
use serde_json::json;

use crate::clock::SystemClock;
use crate::config::{BuildInfo, CollectorOptions, writable_paths};
use crate::error::Result;
use crate::output::Console;
use crate::tracer::WritablePath;

#[derive(Debug, Clone, Args)]
pub struct CheckArgs {
    #[command(flatten)]
    pub options: CollectorOptions,
}

fn describe(path: &WritablePath) -> String {
    match path {
        WritablePath::Exact(exact) => exact.display().to_string(),
        WritablePath::Pattern(re) => format!("~{}", re.as_str()),
    }
}

/// Validates collector options without touching the store.
pub fn run_check(args: CheckArgs) -> Result<()> {
    let console = Console::detect();

    console.heading("violation_ledger check");
    let location = args.options.store.location()?;
    console.ok(&format!("store={location}"));
    console.note(&format!("store_path={}", location.path().display()));

    let build = BuildInfo::parse(args.options.build_info.as_deref(), &SystemClock)?;
    console.ok(&format!(
        "build branch={} revision={} submitstamp={}",
        build.branch, build.revision, build.submitstamp
    ));

    console.heading("writable paths");
    let writable = writable_paths(&location)?
        .iter()
        .map(describe)
        .collect::<Vec<_>>();
    for path in &writable {
        console.note(path);
    }

    if !args.options.collect_violations {
        console.warn("collection disabled; pass --collect-violations to enable");
    }
    console.ok("configuration ok");

    console.status(
        "check",
        "ok",
        json!({
            "store": location.url(),
            "store_path": location.path().display().to_string(),
            "collect_violations": args.options.collect_violations,
            "build": build,
            "writable_paths": writable,
        }),
    );

    Ok(())
}
