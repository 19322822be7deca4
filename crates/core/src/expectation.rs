//! Expectations: a status code and/or a body expression, plus where they were
//! declared

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::panic::Location;
use tracing::debug;

use crate::error::{ArgumentError, ContextError, ExpectationError, FailureKind};
use crate::expression::{Expression, Predicate};
use crate::http::HttpResponse;
use crate::matcher::{self, MatchResult};
use crate::stash::Stash;

/// What an `expect`/`until`/`never` declaration asks for. A bare number is
/// always a status code.
#[derive(Debug, Clone)]
pub struct Expected {
    pub status: Option<u16>,
    pub body: Option<Expression>,
}

// Status codes are accepted as `u16` or as an unsuffixed integer literal
// (which defaults to `i32`).
macro_rules! status_conversions {
    ($($ty:ty),*) => {$(
        impl From<$ty> for Expected {
            fn from(status: $ty) -> Self {
                Self {
                    status: Some(status_code(status as i64)),
                    body: None,
                }
            }
        }

        impl From<($ty, Expression)> for Expected {
            fn from((status, body): ($ty, Expression)) -> Self {
                Self {
                    status: Some(status_code(status as i64)),
                    body: Some(body),
                }
            }
        }

        impl From<($ty, Value)> for Expected {
            fn from((status, body): ($ty, Value)) -> Self {
                (status, Expression::body(body)).into()
            }
        }

        impl From<($ty, &str)> for Expected {
            fn from((status, text): ($ty, &str)) -> Self {
                (status, Expression::body(Value::String(text.to_string()))).into()
            }
        }
    )*};
}

status_conversions!(u16, i32);

/// Out-of-range codes map to 0, which no response carries
fn status_code(n: i64) -> u16 {
    u16::try_from(n).unwrap_or(0)
}

impl From<Expression> for Expected {
    fn from(body: Expression) -> Self {
        Self {
            status: None,
            body: Some(body),
        }
    }
}

impl From<Predicate> for Expected {
    fn from(predicate: Predicate) -> Self {
        Expression::from(predicate).into()
    }
}

impl From<Value> for Expected {
    fn from(body: Value) -> Self {
        Expression::body(body).into()
    }
}

impl From<&str> for Expected {
    fn from(text: &str) -> Self {
        Expression::body(Value::String(text.to_string())).into()
    }
}

/// A declared expectation
#[derive(Debug, Clone)]
pub struct Expectation {
    pub status: Option<u16>,
    pub body: Option<Expression>,
    /// Declaration site, reported on failure
    pub origin: String,
}

impl Expectation {
    /// At least one of `status` and `body` must be given
    pub fn new(
        status: Option<u16>,
        body: Option<Expression>,
        origin: impl Into<String>,
    ) -> Result<Self, ArgumentError> {
        if status.is_none() && body.is_none() {
            return Err(ArgumentError(
                "Invalid expectation: neither a status code nor a body expression was given".to_string(),
            ));
        }
        Ok(Self {
            status,
            body,
            origin: origin.into(),
        })
    }

    /// Declare an expectation, recording the caller's source location
    #[track_caller]
    pub fn declare(expected: impl Into<Expected>) -> Self {
        let expected = expected.into();
        let location = Location::caller();
        Self {
            status: expected.status,
            body: expected.body,
            origin: format!("{}:{}:{}", location.file(), location.line(), location.column()),
        }
    }

    /// Resolve stash references in the body expression
    pub fn substitute<'a>(&'a self, stash: &'a Stash) -> BoxFuture<'a, Result<Expectation, ContextError>> {
        async move {
            let body = match &self.body {
                Some(body) => Some(body.substitute(stash).await?),
                None => None,
            };
            Ok(Expectation {
                status: self.status,
                body,
                origin: self.origin.clone(),
            })
        }
        .boxed()
    }

    /// Check the expectation against a response.
    ///
    /// Top-level string and pattern bodies compare against the response text;
    /// a top-level predicate sees the whole response; anything else is a JSON
    /// expression over the parsed body.
    pub async fn check(&self, actual: &HttpResponse) -> Result<(), ExpectationError> {
        if let Some(status) = self.status {
            if status != actual.status {
                let body = actual.body_value();
                let rendered = serde_json::to_string_pretty(&body).unwrap_or_else(|_| body.to_string());
                return Err(self.fail(
                    FailureKind::StatusFailure,
                    format!(
                        "Expected HTTP status code of {} but got {}\nResponse Body:\n{}",
                        status, actual.status, rendered
                    ),
                ));
            }
        }

        let Some(body) = &self.body else {
            return Ok(());
        };

        match body {
            Expression::Pattern(re) => {
                let text = actual.text.as_deref().unwrap_or_default();
                if !re.is_match(text) {
                    return Err(self.fail(
                        FailureKind::TextComparisonFailure,
                        format!("Expected:\n/{}/\nBut not found:\n\"{}\"", re.as_str(), text),
                    ));
                }
            }
            Expression::Literal(Value::String(expected)) => {
                let text = actual.text.as_deref().unwrap_or_default();
                if expected != text {
                    return Err(self.fail(
                        FailureKind::TextComparisonFailure,
                        format!("Expected:\n\"{}\"\nBut not found:\n\"{}\"", expected, text),
                    ));
                }
            }
            Expression::Predicate(_) => {
                let whole = actual.to_value();
                if let MatchResult::Fail(m) = matcher::matches(body, Some(&whole)).await {
                    return Err(self.fail(FailureKind::PredicateFailure, m.reason));
                }
            }
            other => {
                if let MatchResult::Fail(m) = matcher::matches(other, actual.json.as_ref()).await {
                    let diff = matcher::render_diff(&other.to_display_value(), actual.json.as_ref());
                    return Err(self
                        .fail(FailureKind::JsonExpressionFailure, format!("at {}: {}", m.path, m.reason))
                        .with_diff(diff));
                }
            }
        }
        Ok(())
    }

    fn fail(&self, kind: FailureKind, message: String) -> ExpectationError {
        debug!("{} at {}", kind, self.origin);
        ExpectationError::new(kind, message, self.origin.clone())
    }
}

/// Check every expectation in order and report the first failure
pub async fn check_all(expectations: &[Expectation], actual: &HttpResponse) -> Result<(), ExpectationError> {
    for expectation in expectations {
        expectation.check(actual).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_neither_status_nor_body_is_argument_error() {
        assert!(Expectation::new(None, None, "here").is_err());
        assert!(Expectation::new(Some(200), None, "here").is_ok());
    }

    #[test]
    fn test_declare_captures_call_site() {
        let expectation = Expectation::declare(200);
        assert!(expectation.origin.contains("expectation.rs"));
        assert_eq!(expectation.status, Some(200));
    }

    #[tokio::test]
    async fn test_status_mismatch_reports_status_failure() {
        let err = Expectation::declare(200)
            .check(&HttpResponse::new(404).with_text("Not Found"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::StatusFailure);
        assert!(err.message.contains("but got 404"));
    }

    #[tokio::test]
    async fn test_string_body_compares_text() {
        let res = HttpResponse::new(401).with_text("Unauthorized");
        assert!(Expectation::declare((401, "Unauthorized")).check(&res).await.is_ok());
        let err = Expectation::declare("Forbidden").check(&res).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::TextComparisonFailure);
    }

    #[tokio::test]
    async fn test_top_level_marker_string_is_plain_text() {
        let res = HttpResponse::new(200).with_text("$exists");
        assert!(Expectation::declare((200, "$exists")).check(&res).await.is_ok());
        assert!(Expectation::declare(json!("$exists")).check(&res).await.is_ok());

        let other = HttpResponse::new(200).with_text("present");
        let err = Expectation::declare((200, "$exists")).check(&other).await.unwrap_err();
        assert_eq!(err.kind, FailureKind::TextComparisonFailure);
    }

    #[tokio::test]
    async fn test_json_failure_carries_diff() {
        let res = HttpResponse::new(200).with_json(json!({}));
        let err = Expectation::declare((200, json!({"title": "$exists"})))
            .check(&res)
            .await
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::JsonExpressionFailure);
        assert!(err.diff.unwrap().contains("title"));
    }
}
