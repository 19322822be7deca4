//! Structural matching of expressions against actual values
//!
//! Rules, in priority order: predicates, patterns, literals, positional
//! arrays, then object clauses (a conjunction of field recursion and directive
//! operators). A missing value is passed as `None` so that `$exists` can tell
//! "absent" from "present but null".

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use tracing::trace;

use crate::error::FailureKind;
use crate::expression::{Check, Clause, Directive, Expression, Operator, Predicate};

/// Why a match failed and where
#[derive(Debug, Clone, PartialEq)]
pub struct Mismatch {
    pub kind: FailureKind,
    /// Location inside the actual value, `$` being the root
    pub path: String,
    pub reason: String,
}

/// Verdict of [`matches`]
#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Pass,
    Fail(Mismatch),
}

impl MatchResult {
    pub fn is_pass(&self) -> bool {
        matches!(self, MatchResult::Pass)
    }

    fn fail(kind: FailureKind, path: &str, reason: impl Into<String>) -> Self {
        MatchResult::Fail(Mismatch {
            kind,
            path: path.to_string(),
            reason: reason.into(),
        })
    }

    fn json(path: &str, reason: impl Into<String>) -> Self {
        Self::fail(FailureKind::JsonExpressionFailure, path, reason)
    }
}

/// Evaluate `expr` against `actual`
pub fn matches<'a>(expr: &'a Expression, actual: Option<&'a Value>) -> BoxFuture<'a, MatchResult> {
    match_at(expr, actual, "$".to_string())
}

fn match_at<'a>(expr: &'a Expression, actual: Option<&'a Value>, path: String) -> BoxFuture<'a, MatchResult> {
    async move {
        trace!("match {} against {:?}", path, actual);
        match expr {
            Expression::Predicate(p) => match_predicate(p, actual, &path).await,
            Expression::Pattern(re) => match actual {
                Some(value) if re.is_match(&text_form(value)) => MatchResult::Pass,
                Some(value) => MatchResult::fail(
                    FailureKind::TextComparisonFailure,
                    &path,
                    format!("{} does not match /{}/", value, re.as_str()),
                ),
                None => MatchResult::fail(
                    FailureKind::TextComparisonFailure,
                    &path,
                    format!("value is absent, expected a match for /{}/", re.as_str()),
                ),
            },
            Expression::Literal(expected) => {
                if literal_eq(expected, actual) {
                    MatchResult::Pass
                } else {
                    MatchResult::json(&path, format!("expected {} but found {}", expected, render(actual)))
                }
            }
            Expression::Check(check) => match_check(*check, actual, &path),
            Expression::Array(items) => {
                let values = match actual {
                    Some(Value::Array(values)) if values.len() == items.len() => values,
                    Some(Value::Array(values)) => {
                        return MatchResult::json(
                            &path,
                            format!("expected an array of length {} but found length {}", items.len(), values.len()),
                        )
                    }
                    other => {
                        return MatchResult::json(&path, format!("expected an array but found {}", render(other)))
                    }
                };
                for (i, (item, value)) in items.iter().zip(values).enumerate() {
                    if let MatchResult::Fail(m) = match_at(item, Some(value), format!("{}[{}]", path, i)).await {
                        return MatchResult::Fail(m);
                    }
                }
                MatchResult::Pass
            }
            Expression::Object(clauses) => {
                for clause in clauses {
                    let verdict = match clause {
                        Clause::Field(key, inner) => match_field(key, inner, actual, &path).await,
                        Clause::Directive(d) => match_directive(d, actual, &path).await,
                    };
                    if !verdict.is_pass() {
                        return verdict;
                    }
                }
                MatchResult::Pass
            }
        }
    }
    .boxed()
}

async fn match_predicate(p: &Predicate, actual: Option<&Value>, path: &str) -> MatchResult {
    let value = actual.cloned().unwrap_or(Value::Null);
    match AssertUnwindSafe(p.call(value)).catch_unwind().await {
        Ok(Ok(true)) => MatchResult::Pass,
        Ok(Ok(false)) => MatchResult::fail(
            FailureKind::PredicateFailure,
            path,
            format!("{} not satisfied for {}", p.name(), render(actual)),
        ),
        Ok(Err(e)) => MatchResult::fail(
            FailureKind::PredicateFailure,
            path,
            format!("{} failed: {:#}", p.name(), e),
        ),
        Err(_) => MatchResult::fail(FailureKind::PredicateFailure, path, format!("{} panicked", p.name())),
    }
}

async fn match_field(key: &str, inner: &Expression, actual: Option<&Value>, path: &str) -> MatchResult {
    let child = match actual {
        Some(Value::Object(map)) => map.get(key),
        Some(Value::Array(items)) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        other => {
            return MatchResult::json(
                path,
                format!("expected an object with field '{}' but found {}", key, render(other)),
            )
        }
    };
    match_at(inner, child, format!("{}.{}", path, key)).await
}

async fn match_directive(d: &Directive, actual: Option<&Value>, path: &str) -> MatchResult {
    match d.op {
        Operator::Not => match match_at(&d.operand, actual, path.to_string()).await {
            MatchResult::Pass => MatchResult::json(
                path,
                format!("{} matched under $not", render(actual)),
            ),
            MatchResult::Fail(_) => MatchResult::Pass,
        },
        Operator::Unordered | Operator::Contains => {
            let Expression::Array(expected) = d.operand.as_ref() else {
                return MatchResult::json(path, format!("{} expects a list operand", d.op.key()));
            };
            let Some(Value::Array(values)) = actual else {
                return MatchResult::json(path, format!("{} expected an array but found {}", d.op.key(), render(actual)));
            };
            if d.op == Operator::Unordered && expected.len() != values.len() {
                return MatchResult::json(
                    path,
                    format!("$unordered expected {} elements but found {}", expected.len(), values.len()),
                );
            }
            claim_each(expected, values, path).await
        }
        Operator::Length => {
            let Some(n) = operand_number(&d.operand) else {
                return MatchResult::json(path, "$length expects a numeric operand");
            };
            let len = match actual {
                Some(Value::Array(items)) => Some(items.len()),
                Some(Value::String(s)) => Some(s.chars().count()),
                _ => None,
            };
            match len {
                Some(len) if len as f64 == n => MatchResult::Pass,
                Some(len) => MatchResult::json(path, format!("expected length {} but found {}", n, len)),
                None => MatchResult::json(path, format!("{} has no length", render(actual))),
            }
        }
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            let Some(bound) = operand_number(&d.operand) else {
                return MatchResult::json(path, format!("{} expects a numeric operand", d.op.key()));
            };
            let Some(value) = actual.and_then(Value::as_f64) else {
                return MatchResult::json(path, format!("{} expected a number but found {}", d.op.key(), render(actual)));
            };
            let holds = match d.op {
                Operator::Gt => value > bound,
                Operator::Gte => value >= bound,
                Operator::Lt => value < bound,
                _ => value <= bound,
            };
            if holds {
                MatchResult::Pass
            } else {
                MatchResult::json(path, format!("{} {} {} does not hold", value, d.op.key(), bound))
            }
        }
    }
}

/// Greedy first-fit: each expected element, in declared order, claims the
/// first unclaimed actual element it matches. Not a maximum matching.
async fn claim_each(expected: &[Expression], values: &[Value], path: &str) -> MatchResult {
    let mut claimed = vec![false; values.len()];
    'expected: for (n, item) in expected.iter().enumerate() {
        for (i, value) in values.iter().enumerate() {
            if claimed[i] {
                continue;
            }
            if match_at(item, Some(value), format!("{}[{}]", path, i)).await.is_pass() {
                claimed[i] = true;
                continue 'expected;
            }
        }
        return MatchResult::json(
            path,
            format!("no unclaimed element matches expected element {} ({})", n, item.to_display_value()),
        );
    }
    MatchResult::Pass
}

fn match_check(check: Check, actual: Option<&Value>, path: &str) -> MatchResult {
    let holds = match (check, actual) {
        (Check::Exists, Some(v)) => !v.is_null(),
        (Check::String, Some(v)) => v.is_string(),
        (Check::Int, Some(Value::Number(n))) => {
            n.is_i64() || n.is_u64() || n.as_f64().map_or(false, |f| f.is_finite() && f.fract() == 0.0)
        }
        (Check::Date, Some(v)) => parses_as_date(v),
        _ => false,
    };
    if holds {
        MatchResult::Pass
    } else {
        MatchResult::json(path, format!("{} does not satisfy {}", render(actual), check.marker()))
    }
}

/// Numbers are taken as epoch milliseconds; strings must parse as RFC 3339,
/// RFC 2822, an ISO date-time without offset, or a plain date.
fn parses_as_date(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::String(s) => {
            DateTime::parse_from_rfc3339(s).is_ok()
                || DateTime::parse_from_rfc2822(s).is_ok()
                || NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
                || NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").is_ok()
                || NaiveDate::parse_from_str(s, "%Y-%m-%d").is_ok()
        }
        _ => false,
    }
}

fn operand_number(operand: &Expression) -> Option<f64> {
    match operand {
        Expression::Literal(v) => v.as_f64(),
        _ => None,
    }
}

fn literal_eq(expected: &Value, actual: Option<&Value>) -> bool {
    match (expected, actual) {
        (_, None) => false,
        (Value::Number(a), Some(Value::Number(b))) => match (a.as_i64(), b.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (a.as_u64(), b.as_u64()) {
                (Some(x), Some(y)) => x == y,
                _ => a.as_f64() == b.as_f64(),
            },
        },
        (e, Some(a)) => e == a,
    }
}

fn text_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn render(value: Option<&Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => "<absent>".to_string(),
    }
}

/// Line diff of an expression against the actual value, `-` for expected and
/// `+` for actual. Matching leaves are printed without a marker.
pub fn render_diff(expected: &Value, actual: Option<&Value>) -> String {
    let mut out = String::new();
    diff_into(&mut out, 0, "", expected, actual);
    out
}

fn diff_into(out: &mut String, depth: usize, label: &str, expected: &Value, actual: Option<&Value>) {
    let pad = "  ".repeat(depth);
    match (expected, actual) {
        (Value::Object(exp), Some(Value::Object(act))) => {
            out.push_str(&format!(" {}{}{{\n", pad, label));
            for (key, e) in exp {
                diff_into(out, depth + 1, &format!("{}: ", key), e, act.get(key));
            }
            for (key, a) in act.iter().filter(|(k, _)| !exp.contains_key(*k)) {
                out.push_str(&format!("+{}  {}: {}\n", pad, key, a));
            }
            out.push_str(&format!(" {}}}\n", pad));
        }
        (Value::Array(exp), Some(Value::Array(act))) => {
            out.push_str(&format!(" {}{}[\n", pad, label));
            for (i, e) in exp.iter().enumerate() {
                diff_into(out, depth + 1, "", e, act.get(i));
            }
            for a in act.iter().skip(exp.len()) {
                out.push_str(&format!("+{}  {}\n", pad, a));
            }
            out.push_str(&format!(" {}]\n", pad));
        }
        (e, Some(a)) if e == a => out.push_str(&format!(" {}{}{}\n", pad, label, e)),
        (e, Some(a)) => {
            out.push_str(&format!("-{}{}{}\n", pad, label, e));
            out.push_str(&format!("+{}{}{}\n", pad, label, a));
        }
        (e, None) => out.push_str(&format!("-{}{}{}\n", pad, label, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_literal_numbers_compare_numerically() {
        assert!(literal_eq(&json!(1), Some(&json!(1.0))));
        assert!(!literal_eq(&json!(1), Some(&json!("1"))));
        assert!(!literal_eq(&Value::Null, None));
    }

    #[test]
    fn test_date_parsing() {
        assert!(parses_as_date(&json!("2024-03-01T10:00:00Z")));
        assert!(parses_as_date(&json!("2024-03-01")));
        assert!(parses_as_date(&json!(1700000000000u64)));
        assert!(!parses_as_date(&json!("yesterday-ish")));
        assert!(!parses_as_date(&json!(true)));
    }

    #[test]
    fn test_diff_marks_missing_and_changed_fields() {
        let diff = render_diff(&json!({"a": 1, "b": 2}), Some(&json!({"a": 1, "b": 3, "c": 4})));
        assert!(diff.contains(" a: 1") || diff.contains("  a: 1"));
        assert!(diff.contains("-  b: 2"));
        assert!(diff.contains("+  b: 3"));
        assert!(diff.contains("+  c: 4"));
    }
}
