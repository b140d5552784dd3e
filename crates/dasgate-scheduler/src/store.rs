//! In-memory data store — text values, flags and a small comparison language.
//!
//! Expressions: `a && b`, `a || b`, `!a`, comparisons (`== != < > <= >=`)
//! between numbers, quoted text or store keys, plus `flag:<id>`,
//! `issue:<id>`, `true` and `false`. No parentheses; `&&` binds tighter.
//! Payload lines may reference values as `{d:key}` or `{t:key}`.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{TaskError, TaskResult};
use crate::requirement::{DataProviding, EvalValue};

/// Process-local store used by the binary and the tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, String>>,
    flags: RwLock<HashSet<String>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

const COMPARATORS: [&str; 6] = [">=", "<=", "==", "!=", ">", "<"];

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_flag_up(&self, id: &str) -> bool {
        read(&self.flags).contains(id)
    }

    fn eval_or(&self, expr: &str, issues: &[String]) -> TaskResult<EvalValue> {
        let parts: Vec<&str> = expr.split("||").collect();
        if parts.len() == 1 {
            return self.eval_and(expr, issues);
        }
        let mut any = false;
        for part in parts {
            any |= self.eval_and(part, issues)?.truthy();
        }
        Ok(EvalValue::Bool(any))
    }

    fn eval_and(&self, expr: &str, issues: &[String]) -> TaskResult<EvalValue> {
        let parts: Vec<&str> = expr.split("&&").collect();
        if parts.len() == 1 {
            return self.eval_not(expr, issues);
        }
        let mut all = true;
        for part in parts {
            all &= self.eval_not(part, issues)?.truthy();
        }
        Ok(EvalValue::Bool(all))
    }

    fn eval_not(&self, expr: &str, issues: &[String]) -> TaskResult<EvalValue> {
        let expr = expr.trim();
        match expr.strip_prefix('!') {
            Some(rest) if !rest.starts_with('=') => {
                Ok(EvalValue::Bool(!self.eval_not(rest, issues)?.truthy()))
            }
            _ => self.eval_compare(expr, issues),
        }
    }

    fn eval_compare(&self, expr: &str, issues: &[String]) -> TaskResult<EvalValue> {
        let found = COMPARATORS
            .iter()
            .filter_map(|op| expr.find(op).map(|pos| (pos, *op)))
            .min_by_key(|(pos, op)| (*pos, std::cmp::Reverse(op.len())));
        let Some((pos, op)) = found else {
            return self.eval_atom(expr, issues);
        };
        let lhs = self.operand(&expr[..pos])?;
        let rhs = self.right_operand(&expr[pos + op.len()..])?;
        let result = match (lhs.parse::<f64>(), rhs.parse::<f64>()) {
            (Ok(l), Ok(r)) => match op {
                ">=" => l >= r,
                "<=" => l <= r,
                "==" => l == r,
                "!=" => l != r,
                ">" => l > r,
                _ => l < r,
            },
            _ => match op {
                "==" => lhs.eq_ignore_ascii_case(&rhs),
                "!=" => !lhs.eq_ignore_ascii_case(&rhs),
                _ => {
                    return Err(TaskError::Evaluation(format!(
                        "cannot order text values in '{expr}'"
                    )));
                }
            },
        };
        Ok(EvalValue::Bool(result))
    }

    fn eval_atom(&self, atom: &str, issues: &[String]) -> TaskResult<EvalValue> {
        let atom = atom.trim();
        if atom.eq_ignore_ascii_case("true") {
            return Ok(EvalValue::Bool(true));
        }
        if atom.eq_ignore_ascii_case("false") {
            return Ok(EvalValue::Bool(false));
        }
        if let Some(id) = atom.strip_prefix("flag:") {
            return Ok(EvalValue::Bool(self.is_flag_up(id.trim())));
        }
        if let Some(id) = atom.strip_prefix("issue:") {
            return Ok(EvalValue::Bool(issues.iter().any(|i| i == id.trim())));
        }
        let text = self.operand(atom)?;
        match text.parse::<f64>() {
            Ok(n) => Ok(EvalValue::Number(n)),
            Err(_) => Ok(EvalValue::Bool(text.eq_ignore_ascii_case("true"))),
        }
    }

    /// Literal or stored text for one side of a comparison.
    fn operand(&self, raw: &str) -> TaskResult<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TaskError::Evaluation("missing operand".into()));
        }
        if let Some(quoted) = raw
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .or_else(|| raw.strip_prefix('\'').and_then(|r| r.strip_suffix('\'')))
        {
            return Ok(quoted.to_string());
        }
        if raw.parse::<f64>().is_ok() {
            return Ok(raw.to_string());
        }
        let key = strip_reference(raw).unwrap_or(raw);
        self.get_text(key)
            .ok_or_else(|| TaskError::Evaluation(format!("unknown value '{key}'")))
    }

    /// Like [`Self::operand`], but an unknown bare word is taken literally.
    fn right_operand(&self, raw: &str) -> TaskResult<String> {
        let raw = raw.trim();
        match self.operand(raw) {
            Err(_) if !raw.is_empty() && strip_reference(raw).is_none() => Ok(raw.to_string()),
            other => other,
        }
    }
}

/// `{d:key}` / `{t:key}` → `key`.
fn strip_reference(raw: &str) -> Option<&str> {
    let inner = raw.strip_prefix('{')?.strip_suffix('}')?;
    let (_, key) = inner.split_once(':')?;
    Some(key.trim())
}

impl DataProviding for MemoryStore {
    fn get_text(&self, key: &str) -> Option<String> {
        read(&self.values).get(key).cloned()
    }

    fn set_text(&self, key: &str, value: &str) -> bool {
        let mut values = write(&self.values);
        match values.insert(key.to_string(), value.to_string()) {
            Some(old) => old != value,
            None => true,
        }
    }

    fn remove_text(&self, key: &str) -> bool {
        write(&self.values).remove(key).is_some()
    }

    fn evaluate(&self, expr: &str, issues: &[String]) -> TaskResult<EvalValue> {
        self.eval_or(expr, issues)
    }

    fn raise_flag(&self, id: &str) -> bool {
        write(&self.flags).insert(id.to_string())
    }

    fn lower_flag(&self, id: &str) -> bool {
        write(&self.flags).remove(id)
    }

    fn parse_line(&self, line: &str) -> String {
        let mut out = String::with_capacity(line.len());
        let mut rest = line;
        while let Some(start) = rest.find('{') {
            out.push_str(&rest[..start]);
            let tail = &rest[start..];
            let Some(end) = tail.find('}') else {
                out.push_str(tail);
                return out;
            };
            let token = &tail[..=end];
            let value = match token.get(1..3) {
                Some("d:") | Some("t:") => strip_reference(token).and_then(|k| self.get_text(k)),
                _ => None,
            };
            out.push_str(value.as_deref().unwrap_or(token));
            rest = &tail[end + 1..];
        }
        out.push_str(rest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        let store = MemoryStore::new();
        store.set_text("temp", "21.5");
        store.set_text("mode", "Day");
        store.set_text("door", "true");
        store
    }

    fn eval(store: &MemoryStore, expr: &str) -> bool {
        store.evaluate(expr, &[]).unwrap().truthy()
    }

    #[test]
    fn test_set_text_reports_change() {
        let store = MemoryStore::new();
        assert!(store.set_text("a", "1"));
        assert!(!store.set_text("a", "1"));
        assert!(store.set_text("a", "2"));
        assert!(store.remove_text("a"));
        assert!(!store.remove_text("a"));
    }

    #[test]
    fn test_comparisons() {
        let store = store();
        assert!(eval(&store, "temp > 20"));
        assert!(eval(&store, "{d:temp} <= 21.5"));
        assert!(!eval(&store, "temp >= 22"));
        assert!(eval(&store, "mode == \"day\""));
        assert!(eval(&store, "mode != night"));
        assert!(eval(&store, "mode == day"));
        assert!(eval(&store, "temp != mode"));
        assert!(store.evaluate("mode > 2", &[]).is_err());
        assert!(store.evaluate("pressure == high", &[]).is_err());
        assert!(store.evaluate("mode == {d:missing}", &[]).is_err());
        assert!(store.evaluate("mode == ", &[]).is_err());
    }

    #[test]
    fn test_boolean_connectives() {
        let store = store();
        assert!(eval(&store, "temp > 20 && door"));
        assert!(eval(&store, "temp > 30 || door"));
        assert!(!eval(&store, "!door"));
        assert!(eval(&store, "false || true && true"));
    }

    #[test]
    fn test_flags_and_issues() {
        let store = store();
        assert!(!eval(&store, "flag:pump"));
        assert!(store.raise_flag("pump"));
        assert!(eval(&store, "flag:pump"));
        assert!(store.lower_flag("pump"));
        let issues = vec!["dry".to_string()];
        assert!(store.evaluate("issue:dry", &issues).unwrap().truthy());
    }

    #[test]
    fn test_unknown_value_is_an_error() {
        let store = store();
        assert!(matches!(
            store.evaluate("pressure > 2", &[]),
            Err(TaskError::Evaluation(_))
        ));
    }

    #[test]
    fn test_parse_line_substitutes_known_keys() {
        let store = store();
        assert_eq!(
            store.parse_line("t={d:temp} m={t:mode} x={d:none} {utcstamp}"),
            "t=21.5 m=Day x={d:none} {utcstamp}"
        );
    }
}
