//! Script context: actors, the stash, and the step stack
//!
//! A [`Context`] is threaded through every step of a run. Entering a
//! concurrent fan-out branches it (actor table and jars shared, stash copied,
//! stack copied); afterwards the branches are merged back into one.

use parking_lot::RwLock;
use reqwest::cookie::Jar;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ContextError;
use crate::observer::{NullObserver, Observer};
use crate::stash::Stash;

/// Shared handle to one actor's cookie jar. Clones refer to the same jar.
#[derive(Debug, Clone)]
pub struct JarHandle {
    id: Uuid,
    jar: Arc<Jar>,
}

impl JarHandle {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            jar: Arc::new(Jar::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    /// Whether two handles point at the same jar
    pub fn same_jar(&self, other: &JarHandle) -> bool {
        Arc::ptr_eq(&self.jar, &other.jar)
    }
}

impl Default for JarHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// State owned by the whole run rather than by any one context
pub struct RunState {
    observer: RwLock<Arc<dyn Observer>>,
    expectations_passed: AtomicUsize,
}

impl RunState {
    fn new(observer: Arc<dyn Observer>) -> Self {
        Self {
            observer: RwLock::new(observer),
            expectations_passed: AtomicUsize::new(0),
        }
    }

    pub fn observer(&self) -> Arc<dyn Observer> {
        self.observer.read().clone()
    }

    /// Stop reporting to the attached observer
    pub fn detach(&self) {
        *self.observer.write() = Arc::new(NullObserver);
    }

    pub fn expectations_passed(&self) -> usize {
        self.expectations_passed.load(Ordering::SeqCst)
    }
}

/// Per-flow script state
pub struct Context {
    actors: BTreeMap<String, JarHandle>,
    current_actor: Option<String>,
    stash: Stash,
    stack: Vec<String>,
    run: Arc<RunState>,
}

impl Context {
    /// A fresh context with no observer
    pub fn new() -> Self {
        Self::with_observer(Arc::new(NullObserver))
    }

    pub fn with_observer(observer: Arc<dyn Observer>) -> Self {
        Self {
            actors: BTreeMap::new(),
            current_actor: None,
            stash: Stash::new(),
            stack: Vec::new(),
            run: Arc::new(RunState::new(observer)),
        }
    }

    pub fn run_state(&self) -> Arc<RunState> {
        self.run.clone()
    }

    pub fn observer(&self) -> Arc<dyn Observer> {
        self.run.observer()
    }

    /// Register `alias` with its own jar
    pub fn add_actor(&mut self, alias: impl Into<String>, jar: JarHandle) {
        self.actors.insert(alias.into(), jar);
    }

    pub fn jar_for(&self, alias: &str) -> Result<&JarHandle, ContextError> {
        self.actors
            .get(alias)
            .ok_or_else(|| ContextError::UnknownActor(alias.to_string()))
    }

    pub fn set_current_actor(&mut self, alias: &str) -> Result<(), ContextError> {
        self.jar_for(alias)?;
        self.current_actor = Some(alias.to_string());
        Ok(())
    }

    pub fn clear_current_actor(&mut self) {
        self.current_actor = None;
    }

    pub fn current_actor(&self) -> Option<&str> {
        self.current_actor.as_deref()
    }

    /// Jar of the current actor, `None` when nobody has been introduced
    pub fn jar_for_current_actor(&self) -> Result<Option<JarHandle>, ContextError> {
        match &self.current_actor {
            Some(alias) => self.jar_for(alias).map(|jar| Some(jar.clone())),
            None => Ok(None),
        }
    }

    pub fn actors(&self) -> impl Iterator<Item = &str> {
        self.actors.keys().map(String::as_str)
    }

    pub fn stash(&self) -> &Stash {
        &self.stash
    }

    pub fn stash_mut(&mut self) -> &mut Stash {
        &mut self.stash
    }

    pub fn stack(&self) -> &[String] {
        &self.stack
    }

    pub fn push_step(&mut self, title: impl Into<String>) {
        self.stack.push(title.into());
    }

    pub fn pop_step(&mut self) -> Option<String> {
        self.stack.pop()
    }

    pub fn record_passed(&self, count: usize) {
        self.run.expectations_passed.fetch_add(count, Ordering::SeqCst);
    }

    pub fn expectations_passed(&self) -> usize {
        self.run.expectations_passed()
    }

    /// Copy for a concurrent branch. Jars are shared, the stash is an
    /// independent copy so siblings never see each other's writes.
    pub fn branch(&self) -> Context {
        Context {
            actors: self.actors.clone(),
            current_actor: self.current_actor.clone(),
            stash: self.stash.clone(),
            stack: self.stack.clone(),
            run: self.run.clone(),
        }
    }

    /// Fold finished branches back in, in declared order. Actor tables are
    /// unioned and each branch's new stash writes are appended, so on a key
    /// collision the later branch wins.
    pub fn merge(mut self, branches: Vec<Context>) -> Context {
        let fork = self.stash.watermark();
        for branch in branches {
            self.actors.extend(branch.actors);
            self.stash.absorb(&branch.stash, fork);
        }
        self
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}
