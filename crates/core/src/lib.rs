//! apidrive core
//!
//! Building blocks for declarative end-to-end API test scripts:
//! - an expression [`matcher`] that checks JSON values against expected shapes
//! - a [`poller`] that retries requests until expectations hold (or must
//!   never hold)
//! - a [`stash`] of captured values, referenced as `:key.path` in routes,
//!   bodies and expectations
//! - a [`context`] of actors with their own cookie jars, which branches for
//!   concurrent flows and merges back afterwards
//! - a [`script`] composer tying these into runnable steps
//! - canned [`responses`] predicates for common error replies

pub mod config;
pub mod context;
pub mod error;
pub mod expectation;
pub mod expression;
pub mod http;
pub mod matcher;
pub mod observer;
pub mod poller;
pub mod responses;
pub mod script;
pub mod stash;

// Re-export commonly used types
pub use config::DriverConfig;
pub use context::{Context, JarHandle};
pub use error::{ArgumentError, ContextError, Error, ExpectationError, FailureKind, Result};
pub use expectation::{Expectation, Expected};
pub use expression::{Expression, Predicate};
pub use http::{Executor, HttpRequest, HttpResponse, Method, ReqwestExecutor};
pub use matcher::{matches, MatchResult};
pub use observer::{NullObserver, Observer, Recorder, RequestRecord, TracingObserver};
pub use poller::{poll, Clock, PollSpec, TokioClock};
pub use script::{
    as_actor, as_actor_with, clear_stash, concurrently, doc, introduce, log, sequence, stash, step, wait,
    BoxStep, Driver, Request, ScriptReport, Step, StepExt,
};
pub use stash::Stash;

/// apidrive version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
