//! Identity of the code a violation is charged to, and the records built from it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

const UNDEFINED_CLASS: &str = "UndefinedTestCase";
const UNDEFINED_METHOD: &str = "UndefinedMethod";
const UNDEFINED_MODULE: &str = "UndefinedPath";

/// The (test class, test method, module) triple announced by the controller.
///
/// A violator is well-formed when all three fields are non-empty, or when it
/// is the [`Violator::undefined`] sentinel used for framework activity that
/// cannot be charged to any test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Violator {
    pub test_class: String,
    pub test_method: String,
    pub module_path: String,
}

impl Violator {
    pub fn new(
        test_class: impl Into<String>,
        test_method: impl Into<String>,
        module_path: impl Into<String>,
    ) -> Result<Self> {
        let violator = Self {
            test_class: test_class.into(),
            test_method: test_method.into(),
            module_path: module_path.into(),
        };
        violator.validate()?;
        Ok(violator)
    }

    #[must_use]
    pub fn undefined() -> Self {
        Self {
            test_class: UNDEFINED_CLASS.to_string(),
            test_method: UNDEFINED_METHOD.to_string(),
            module_path: UNDEFINED_MODULE.to_string(),
        }
    }

    #[must_use]
    pub fn is_undefined(&self) -> bool {
        self.test_class == UNDEFINED_CLASS
            && self.test_method == UNDEFINED_METHOD
            && self.module_path == UNDEFINED_MODULE
    }

    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("test_class", &self.test_class),
            ("test_method", &self.test_method),
            ("module_path", &self.module_path),
        ];
        for (name, value) in fields {
            if value.is_empty() {
                return Err(LedgerError::invalid(format!("violator {name} is empty")));
            }
        }
        Ok(())
    }
}

impl Default for Violator {
    fn default() -> Self {
        Self::undefined()
    }
}

impl fmt::Display for Violator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.test_class, self.test_method)
    }
}

/// A disallowed operation as reported by the tracer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub syscall: String,
    pub resolved_path: String,
}

impl Violation {
    pub fn new(syscall: impl Into<String>, resolved_path: impl Into<String>) -> Self {
        Self {
            syscall: syscall.into(),
            resolved_path: resolved_path.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationRecord {
    pub module: String,
    pub class_name: String,
    pub method_name: String,
    pub syscall: String,
    pub syscall_args: String,
    pub timestamp: DateTime<Utc>,
}

impl ViolationRecord {
    #[must_use]
    pub fn new(violator: &Violator, violation: &Violation, timestamp: DateTime<Utc>) -> Self {
        Self {
            module: violator.module_path.clone(),
            class_name: violator.test_class.clone(),
            method_name: violator.test_method.clone(),
            syscall: violation.syscall.clone(),
            syscall_args: violation.resolved_path.clone(),
            timestamp,
        }
    }
}

/// One row per lifecycle phase start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestRecord {
    pub module: String,
    pub class_name: String,
    pub method_name: String,
}

impl From<&Violator> for TestRecord {
    fn from(violator: &Violator) -> Self {
        Self {
            module: violator.module_path.clone(),
            class_name: violator.test_class.clone(),
            method_name: violator.test_method.clone(),
        }
    }
}
