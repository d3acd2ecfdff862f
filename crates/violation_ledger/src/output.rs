//! Terminal output for the `violation_ledger` commands.
//!
//! Humans get rich status lines. In JSON mode (`SQLMODEL_JSON=1`, or an
//! agent environment detected by sqlmodel-console) each command prints one
//! JSON status object on stdout, and failures print one JSON object on stderr.

use fastapi_output::RichOutput;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlmodel_console::OutputMode as ConsoleMode;

use crate::error::LedgerError;

/// What the output stack detected about the caller, echoed in JSON payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    pub rich_mode: String,
    pub console_mode: String,
    pub agent: bool,
    pub ci: bool,
    pub tty: bool,
}

impl Environment {
    #[must_use]
    pub fn detect() -> Self {
        let detected = fastapi_output::detect_environment();
        Self {
            rich_mode: fastapi_output::OutputMode::auto().as_str().to_string(),
            console_mode: ConsoleMode::detect().as_str().to_string(),
            agent: detected.is_agent || ConsoleMode::is_agent_environment(),
            ci: detected.is_ci,
            tty: detected.is_tty,
        }
    }

    #[must_use]
    pub fn wants_json(&self) -> bool {
        self.console_mode == "json"
    }
}

#[derive(Debug, Clone)]
pub struct Console {
    env: Environment,
    rich: Option<RichOutput>,
}

impl Console {
    #[must_use]
    pub fn detect() -> Self {
        Self::new(Environment::detect())
    }

    #[must_use]
    pub fn new(env: Environment) -> Self {
        let rich = (!env.wants_json()).then(RichOutput::auto);
        Self { env, rich }
    }

    #[must_use]
    pub fn json(&self) -> bool {
        self.env.wants_json()
    }

    pub fn heading(&self, title: &str) {
        if let Some(rich) = &self.rich {
            rich.rule(Some(title));
        }
    }

    pub fn note(&self, message: &str) {
        if let Some(rich) = &self.rich {
            rich.info(message);
        }
    }

    pub fn ok(&self, message: &str) {
        if let Some(rich) = &self.rich {
            rich.success(message);
        }
    }

    pub fn warn(&self, message: &str) {
        if let Some(rich) = &self.rich {
            rich.warning(message);
        }
    }

    /// Plain text for humans, verbatim on stdout. Suppressed in JSON mode.
    pub fn lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.json() {
            return;
        }
        for line in lines {
            println!("{}", line.as_ref());
        }
    }

    /// Prints the command's status object in JSON mode.
    pub fn status(&self, command: &str, status: &str, fields: Value) {
        if self.json() {
            println!("{}", self.payload(Some(command), status, fields));
        }
    }

    /// Reports a failed command on stderr in the caller's preferred format.
    pub fn failure(&self, error: &LedgerError) {
        if self.json() {
            let fields = serde_json::json!({
                "error": error.to_string(),
                "kind": format!("{:?}", error.kind()),
                "exit_code": error.exit_code(),
            });
            eprintln!("{}", self.payload(None, "error", fields));
        } else {
            eprintln!("{error}");
        }
    }

    fn payload(&self, command: Option<&str>, status: &str, fields: Value) -> Value {
        let mut object = Map::new();
        if let Some(command) = command {
            object.insert("command".to_string(), Value::from(command));
        }
        object.insert("status".to_string(), Value::from(status));
        if let Value::Object(fields) = fields {
            object.extend(fields);
        }
        object.insert(
            "environment".to_string(),
            serde_json::to_value(&self.env).unwrap_or(Value::Null),
        );
        Value::Object(object)
    }
}
