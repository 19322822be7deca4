//! Run observers
//!
//! An [`Observer`] is attached to a script run and hears about step
//! boundaries, finished requests and documentation notes. Every context
//! branched from the run shares the same observer.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::http::{Method, Profile};

/// One finished request, as reported to observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub stack: Vec<String>,
    pub actor: Option<String>,
    pub method: Method,
    pub url: String,
    pub status: u16,
    pub profile: Profile,
}

/// Listener for run events. All methods default to doing nothing.
pub trait Observer: Send + Sync {
    fn step_started(&self, _stack: &[String]) {}

    fn step_finished(&self, _stack: &[String]) {}

    fn request_finished(&self, _record: &RequestRecord) {}

    fn doc(&self, _message: &str) {}
}

/// Ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullObserver;

impl Observer for NullObserver {}

/// Logs events through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl Observer for TracingObserver {
    fn step_started(&self, stack: &[String]) {
        debug!("step started: {}", stack.join(" > "));
    }

    fn step_finished(&self, stack: &[String]) {
        debug!("step finished: {}", stack.join(" > "));
    }

    fn request_finished(&self, record: &RequestRecord) {
        info!(
            actor = record.actor.as_deref().unwrap_or("-"),
            status = record.status,
            duration_ms = record.profile.duration_ms(),
            "{} {}",
            record.method,
            record.url
        );
    }

    fn doc(&self, message: &str) {
        info!("doc: {}", message);
    }
}

/// Keeps every request record and doc note for later reporting
#[derive(Debug, Default)]
pub struct Recorder {
    requests: Mutex<Vec<RequestRecord>>,
    docs: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<RequestRecord> {
        self.requests.lock().clone()
    }

    pub fn docs(&self) -> Vec<String> {
        self.docs.lock().clone()
    }
}

impl Observer for Recorder {
    fn request_finished(&self, record: &RequestRecord) {
        TracingObserver.request_finished(record);
        self.requests.lock().push(record.clone());
    }

    fn doc(&self, message: &str) {
        TracingObserver.doc(message);
        self.docs.lock().push(message.to_string());
    }
}
