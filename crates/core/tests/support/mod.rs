//! Shared fixtures for the apidrive integration tests

#![allow(dead_code)]

use apidrive::{Executor, HttpRequest, HttpResponse, Method, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

/// Executor that replays canned responses per `METHOD url` and records every
/// request it sees. The last queued response for a route repeats forever.
#[derive(Default)]
pub struct ScriptedExecutor {
    responses: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    seen: Mutex<Vec<HttpRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, method: Method, url: &str, responses: Vec<HttpResponse>) -> Self {
        self.responses
            .lock()
            .insert(format!("{} {}", method, url), responses.into());
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.seen.lock().clone()
    }

    pub fn urls(&self) -> Vec<String> {
        self.seen.lock().iter().map(|r| r.url.clone()).collect()
    }

    pub fn count(&self, url: &str) -> usize {
        self.seen.lock().iter().filter(|r| r.url == url).count()
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let key = format!("{} {}", request.method, request.url);
        self.seen.lock().push(request);

        let mut responses = self.responses.lock();
        let response = match responses.get_mut(&key) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| HttpResponse::new(404).with_text("Not Found")))
    }
}
