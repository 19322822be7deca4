//! apidrive script runner
//!
//! Runs declarative YAML scripts against a live API:
//! - parses script files into step trees built from `apidrive` combinators
//! - runs each script with its own context and a recording observer
//! - tallies the suite and writes `test-results.json`
//!
//! ```text
//! scripts/*.yaml ──> ScriptFile ──compile──> Step tree ──Driver::run──> ScriptResult
//!                                                                          │
//!                                       SuiteRunner ──> SuiteResult ──> test-results.json
//! ```

pub mod error;
pub mod runner;
pub mod script;

pub use error::{RunnerError, RunnerResult};
pub use runner::{RunnerConfig, ScriptResult, SuiteResult, SuiteRunner};
pub use script::{ScriptFile, ScriptStep};
