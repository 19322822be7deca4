//! Canned predicates for common error responses
//!
//! Each one checks the status code and the exact response text, and is meant
//! to be passed straight to `expect`:
//!
//! ```ignore
//! Request::get("/admin").expect(responses::forbidden())
//! ```

use anyhow::ensure;
use serde_json::Value;

use crate::expression::Predicate;

fn status_with_text(name: &'static str, status: u16, text: &'static str) -> Predicate {
    Predicate::new(move |response: Value| async move {
        let actual_status = response.get("statusCode").and_then(Value::as_u64);
        ensure!(
            actual_status == Some(u64::from(status)),
            "expected status {} but got {}",
            status,
            actual_status.map_or_else(|| "none".to_string(), |s| s.to_string())
        );
        let actual_text = response.get("text").and_then(Value::as_str);
        ensure!(
            actual_text == Some(text),
            "expected text {:?} but got {:?}",
            text,
            actual_text.unwrap_or_default()
        );
        Ok(true)
    })
    .named(name)
}

/// 401 with the body `Unauthorized`
pub fn unauthorized() -> Predicate {
    status_with_text("Unauthorized", 401, "Unauthorized")
}

/// 403 with the body `Forbidden`
pub fn forbidden() -> Predicate {
    status_with_text("Forbidden", 403, "Forbidden")
}

/// 404 with the body `Not Found`
pub fn not_found() -> Predicate {
    status_with_text("NotFound", 404, "Not Found")
}
