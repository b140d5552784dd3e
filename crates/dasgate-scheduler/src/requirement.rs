//! Requirement evaluation — the gate between a firing and a delivery.
//!
//! The expression language itself belongs to the data store; this module only
//! turns its answers into yes/no and refuses to guess when no store is there.

use std::sync::Arc;

use crate::error::{TaskError, TaskResult};

/// Result of evaluating an expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EvalValue {
    Bool(bool),
    Number(f64),
}

impl EvalValue {
    /// Numbers are true when non-zero and not NaN.
    pub fn truthy(self) -> bool {
        match self {
            Self::Bool(b) => b,
            Self::Number(n) => n != 0.0 && !n.is_nan(),
        }
    }
}

/// The gateway's live data store.
pub trait DataProviding: Send + Sync {
    fn get_text(&self, key: &str) -> Option<String>;
    /// Store a value. Returns true when it differs from the previous one.
    fn set_text(&self, key: &str, value: &str) -> bool;
    fn remove_text(&self, key: &str) -> bool;
    fn evaluate(&self, expr: &str, issues: &[String]) -> TaskResult<EvalValue>;
    fn raise_flag(&self, id: &str) -> bool;
    fn lower_flag(&self, id: &str) -> bool;
    /// Substitute store references inside a payload line.
    fn parse_line(&self, line: &str) -> String;
}

/// Source of currently active fault identifiers.
pub trait ActiveIssues: Send + Sync {
    fn active(&self) -> Vec<String>;
}

/// Evaluates `when` gates and requirement expressions.
#[derive(Clone, Default)]
pub struct RequirementEvaluator {
    store: Option<Arc<dyn DataProviding>>,
    issues: Option<Arc<dyn ActiveIssues>>,
}

fn is_vacuous(expr: &str) -> bool {
    let expr = expr.trim();
    expr.is_empty() || expr.eq_ignore_ascii_case("always")
}

impl RequirementEvaluator {
    pub fn new(
        store: Option<Arc<dyn DataProviding>>,
        issues: Option<Arc<dyn ActiveIssues>>,
    ) -> Self {
        Self { store, issues }
    }

    pub fn store(&self) -> Option<&Arc<dyn DataProviding>> {
        self.store.as_ref()
    }

    fn require_store(&self) -> TaskResult<&Arc<dyn DataProviding>> {
        self.store
            .as_ref()
            .ok_or_else(|| TaskError::Evaluation("no data store attached".into()))
    }

    /// Evaluate a requirement expression.
    pub fn evaluate(&self, expr: &str) -> TaskResult<bool> {
        if is_vacuous(expr) {
            return Ok(true);
        }
        let store = self.require_store()?;
        let issues = self.issues.as_ref().map(|i| i.active()).unwrap_or_default();
        store.evaluate(expr.trim(), &issues).map(EvalValue::truthy)
    }

    /// Check a `key:value` state gate, case-insensitively.
    pub fn check_state(&self, when: &str) -> TaskResult<bool> {
        if is_vacuous(when) {
            return Ok(true);
        }
        let (key, value) = when
            .split_once(':')
            .ok_or_else(|| TaskError::Evaluation(format!("state gate '{when}' is not key:value")))?;
        let store = self.require_store()?;
        Ok(store
            .get_text(key.trim())
            .is_some_and(|current| current.eq_ignore_ascii_case(value.trim())))
    }
}
