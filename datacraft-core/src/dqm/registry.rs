//! Named custom quality checks.
//!
//! A custom rule names a function registered here at startup. The check
//! receives the filtered column values and returns a pass/fail mask of the
//! same length. Unknown names are rejected when the configuration snapshot
//! loads, so a running pipeline never discovers a missing check.

use arrow::array::{ArrayRef, BooleanArray};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// A custom check over one column. `true` in the returned mask means the row
/// passes. The mask must be as long as the input; the engine rejects
/// mismatched lengths.
pub type CheckFn = Arc<dyn Fn(&ArrayRef) -> Result<BooleanArray> + Send + Sync>;

/// Registry of custom check functions, keyed by the name configured rules
/// refer to.
#[derive(Clone, Default)]
pub struct CustomCheckRegistry {
    checks: HashMap<String, CheckFn>,
}

impl CustomCheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a check under a name. Re-registering a name replaces the
    /// previous function.
    pub fn register<F>(&mut self, name: impl Into<String>, check: F)
    where
        F: Fn(&ArrayRef) -> Result<BooleanArray> + Send + Sync + 'static,
    {
        self.checks.insert(name.into(), Arc::new(check));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.checks.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&CheckFn> {
        self.checks.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.checks.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for CustomCheckRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomCheckRegistry")
            .field("checks", &self.names())
            .finish()
    }
}
