#![forbid(unsafe_code)]

use violation_ledger::output::Console;

fn main() {
    if let Err(error) = violation_ledger::run_from_env() {
        Console::detect().failure(&error);
        std::process::exit(error.exit_code());
    }
}
