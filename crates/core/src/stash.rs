//! The stash: values captured during a script run, referenced symbolically
//!
//! References are strings starting with `:`. `":user"` resolves to whatever was
//! stashed under `user`; `":user.address.zip"` walks into it. In routes,
//! `:key` is percent-encoded on insertion and `::key` is inserted verbatim.
//!
//! Every write is appended to a per-key history. Lookups read the newest write,
//! so re-stashing a key shadows the older value without destroying it. Writes
//! carry a sequence number so that a forked copy can later hand back exactly
//! the writes it made after the fork.

use futures::future::{BoxFuture, FutureExt, Shared};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use tracing::{debug, trace};

use crate::error::ContextError;

type DeferredValue = Shared<BoxFuture<'static, Result<Value, ContextError>>>;

/// A stashed value, either available now or still being computed
#[derive(Clone)]
pub enum StashValue {
    Ready(Value),
    Deferred(DeferredValue),
}

impl StashValue {
    async fn resolve(&self) -> Result<Value, ContextError> {
        match self {
            StashValue::Ready(v) => Ok(v.clone()),
            StashValue::Deferred(fut) => fut.clone().await,
        }
    }
}

impl fmt::Debug for StashValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StashValue::Ready(v) => write!(f, "Ready({})", v),
            StashValue::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

#[derive(Debug, Clone)]
struct StashEntry {
    seq: u64,
    value: StashValue,
}

/// Layered key/value store for captured values
#[derive(Debug, Clone, Default)]
pub struct Stash {
    entries: HashMap<String, Vec<StashEntry>>,
    next_seq: u64,
}

/// `:key` references in a route, not preceded by `:` or an escape
static PLAIN_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|[^:\\])(:[\w.]+)").expect("static regex"));

static ENCODED_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|[^\\])(::[\w.]+)").expect("static regex"));

impl Stash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value under `key`, shadowing any earlier write
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.push(key.into(), StashValue::Ready(value));
    }

    /// Store a value that will be produced by `future`. Readers of `key` wait
    /// for it; a failure surfaces to every reader.
    pub fn set_deferred<F>(&mut self, key: impl Into<String>, future: F)
    where
        F: Future<Output = Result<Value, ContextError>> + Send + 'static,
    {
        self.push(key.into(), StashValue::Deferred(future.boxed().shared()));
    }

    fn push(&mut self, key: String, value: StashValue) {
        trace!("stash.set: {}", key);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.entry(key).or_default().push(StashEntry { seq, value });
    }

    /// Whether anything was ever stashed under `key`
    pub fn contains(&self, key: &str) -> bool {
        self.entries.get(key).map_or(false, |writes| !writes.is_empty())
    }

    /// Number of distinct keys
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Position in the write sequence; writes made after this point are the
    /// ones [`Stash::absorb`] picks up.
    pub fn watermark(&self) -> u64 {
        self.next_seq
    }

    /// Append the writes `other` made at or after `since` onto this stash, in
    /// their original order. Used to fold a forked branch back in.
    pub fn absorb(&mut self, other: &Stash, since: u64) {
        let mut writes: Vec<(&String, &StashEntry)> = other
            .entries
            .iter()
            .flat_map(|(key, list)| list.iter().map(move |e| (key, e)))
            .filter(|(_, e)| e.seq >= since)
            .collect();
        writes.sort_by_key(|(_, e)| e.seq);

        for (key, entry) in writes {
            self.push(key.clone(), entry.value.clone());
        }
    }

    /// The newest value stashed under `key`
    pub async fn get(&self, key: &str) -> Result<Value, ContextError> {
        let entry = self
            .entries
            .get(key)
            .and_then(|writes| writes.last())
            .ok_or_else(|| ContextError::UnknownStashKey(key.to_string()))?;

        entry.value.resolve().await.map_err(|e| match e {
            ContextError::Unresolved { .. } => e,
            other => ContextError::Unresolved {
                key: key.to_string(),
                reason: other.to_string(),
            },
        })
    }

    /// Resolve `key.path.to.field`. Array elements are addressed by index.
    pub async fn get_keypath(&self, keypath: &str) -> Result<Value, ContextError> {
        let mut parts = keypath.split('.');
        let key = parts.next().unwrap_or_default();
        let mut value = self.get(key).await?;

        for part in parts {
            let next = match &value {
                Value::Object(map) => map.get(part).cloned(),
                Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
                _ => None,
            };
            value = next.ok_or_else(|| ContextError::MissingKeypath {
                keypath: keypath.to_string(),
                segment: part.to_string(),
            })?;
        }

        Ok(value)
    }

    /// Replace every stash reference inside `value`, preserving its shape
    pub fn substitute_value<'a>(&'a self, value: &'a Value) -> BoxFuture<'a, Result<Value, ContextError>> {
        async move {
            match value {
                Value::String(s) if s.starts_with(':') => self.get_keypath(&s[1..]).await,
                Value::Array(items) => {
                    let items = futures::future::try_join_all(
                        items.iter().map(|item| self.substitute_value(item)),
                    )
                    .await?;
                    Ok(Value::Array(items))
                }
                Value::Object(map) => {
                    let values = futures::future::try_join_all(
                        map.values().map(|item| self.substitute_value(item)),
                    )
                    .await?;
                    Ok(Value::Object(map.keys().cloned().zip(values).collect()))
                }
                other => Ok(other.clone()),
            }
        }
        .boxed()
    }

    /// Splice stash references into a route.
    ///
    /// `:key` values are percent-encoded so they stay a single URL segment;
    /// `::key` values are inserted as-is. All references are resolved in one
    /// batch before any splicing happens.
    pub async fn substitute_route(&self, route: &str) -> Result<String, ContextError> {
        // (start, end, keypath, encode)
        let mut refs: Vec<(usize, usize, &str, bool)> = Vec::new();

        for caps in ENCODED_REF.captures_iter(route) {
            if let Some(m) = caps.get(2) {
                refs.push((m.start(), m.end(), &route[m.start() + 2..m.end()], false));
            }
        }
        for caps in PLAIN_REF.captures_iter(route) {
            if let Some(m) = caps.get(2) {
                refs.push((m.start(), m.end(), &route[m.start() + 1..m.end()], true));
            }
        }

        if refs.is_empty() {
            return Ok(route.to_string());
        }
        refs.sort_by_key(|r| r.0);

        let values = futures::future::try_join_all(
            refs.iter().map(|(_, _, keypath, _)| self.get_keypath(keypath)),
        )
        .await?;

        let mut out = String::with_capacity(route.len());
        let mut cursor = 0;
        for ((start, end, _, encode), value) in refs.iter().zip(values) {
            out.push_str(&route[cursor..*start]);
            let text = route_text(&value);
            if *encode {
                out.push_str(&encode_component(&text));
            } else {
                out.push_str(&text);
            }
            cursor = *end;
        }
        out.push_str(&route[cursor..]);

        debug!("stash.substitute_route: {} -> {}", route, out);
        Ok(out)
    }

    /// Wait for every deferred value and report the first failure
    pub async fn settle(&self) -> Result<(), ContextError> {
        for (key, writes) in &self.entries {
            for entry in writes {
                if let StashValue::Deferred(fut) = &entry.value {
                    fut.clone().await.map_err(|e| ContextError::Unresolved {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
                }
            }
        }
        Ok(())
    }
}

/// Percent-encode a route component. The marks `!'()*` stay literal, as
/// browsers' `encodeURIComponent` leaves them.
fn encode_component(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut buf = [0u8; 4];
    for c in text.chars() {
        if matches!(c, '!' | '\'' | '(' | ')' | '*') {
            out.push(c);
        } else {
            out.push_str(&urlencoding::encode(c.encode_utf8(&mut buf)));
        }
    }
    out
}

fn route_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_restash_shadows_older_value() {
        let mut stash = Stash::new();
        stash.set("token", json!("first"));
        stash.set("token", json!("second"));
        assert_eq!(stash.get("token").await.unwrap(), json!("second"));
        assert_eq!(stash.len(), 1);
    }

    #[tokio::test]
    async fn test_keypath_walks_arrays_by_index() {
        let mut stash = Stash::new();
        stash.set("list", json!({"items": [{"id": 7}, {"id": 9}]}));
        assert_eq!(stash.get_keypath("list.items.1.id").await.unwrap(), json!(9));
    }

    #[tokio::test]
    async fn test_absorb_takes_only_writes_after_watermark() {
        let mut base = Stash::new();
        base.set("k", json!(1));
        let mark = base.watermark();

        let mut branch = base.clone();
        branch.set("k", json!(2));
        branch.set("other", json!("x"));

        let untouched = base.clone();
        base.absorb(&untouched, mark);
        assert_eq!(base.get("k").await.unwrap(), json!(1));

        base.absorb(&branch, mark);
        assert_eq!(base.get("k").await.unwrap(), json!(2));
        assert_eq!(base.get("other").await.unwrap(), json!("x"));
    }

    #[tokio::test]
    async fn test_deferred_failure_surfaces_on_settle() {
        let mut stash = Stash::new();
        stash.set_deferred("later", async {
            Err::<Value, _>(ContextError::UnknownStashKey("missing".into()))
        });
        let err = stash.settle().await.unwrap_err();
        assert!(matches!(err, ContextError::Unresolved { ref key, .. } if key == "later"));
    }

    #[tokio::test]
    async fn test_route_leaves_escaped_and_plain_text_alone() {
        let stash = Stash::new();
        assert_eq!(stash.substitute_route("/health").await.unwrap(), "/health");
    }
}
