//! Suite runner: loads script files, runs them against the endpoint, and
//! writes a JSON report

use apidrive::{
    Driver, DriverConfig, Executor, ExpectationError, Recorder, ReqwestExecutor, RequestRecord,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::script::ScriptFile;

/// Result of running a single script
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptResult {
    pub name: String,
    pub success: bool,
    pub skipped: bool,
    pub duration_ms: u64,
    pub expectations_passed: usize,
    /// The expectation that failed, if any
    pub failure: Option<ExpectationError>,
    /// Infrastructure or authoring error that stopped the script
    pub error: Option<String>,
    pub requests: Vec<RequestRecord>,
    pub docs: Vec<String>,
}

impl ScriptResult {
    fn skipped(name: &str) -> Self {
        Self {
            name: name.to_string(),
            success: true,
            skipped: true,
            duration_ms: 0,
            expectations_passed: 0,
            failure: None,
            error: None,
            requests: vec![],
            docs: vec![],
        }
    }

    fn errored(name: &str, error: String) -> Self {
        Self {
            success: false,
            skipped: false,
            error: Some(error),
            ..Self::skipped(name)
        }
    }
}

/// Result of running all scripts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Failures caused by errors rather than unmet expectations
    pub errored: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub results: Vec<ScriptResult>,
}

impl SuiteResult {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// Configuration for the suite runner
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory searched for `*.yaml` / `*.yml` scripts
    pub scripts_dir: PathBuf,

    /// Output directory for results
    pub output_dir: PathBuf,

    /// Base driver settings; scripts may override parts of them
    pub driver: DriverConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            scripts_dir: PathBuf::from("scripts"),
            output_dir: PathBuf::from("test-results"),
            driver: DriverConfig::default(),
        }
    }
}

/// Runs script files one after another
pub struct SuiteRunner {
    config: RunnerConfig,
    executor: Arc<dyn Executor>,
}

impl SuiteRunner {
    /// Create a runner that talks HTTP through reqwest
    pub fn new(config: RunnerConfig) -> RunnerResult<Self> {
        let executor = ReqwestExecutor::new(config.driver.request_timeout())?;
        Ok(Self::with_executor(config, Arc::new(executor)))
    }

    pub fn with_executor(config: RunnerConfig, executor: Arc<dyn Executor>) -> Self {
        Self { config, executor }
    }

    /// Run all scripts in the scripts directory
    pub async fn run_all(&self) -> RunnerResult<SuiteResult> {
        let scripts = ScriptFile::load_all(&self.config.scripts_dir)?;
        Ok(self.run_scripts(&scripts).await)
    }

    /// Run scripts carrying a tag
    pub async fn run_tagged(&self, tag: &str) -> RunnerResult<SuiteResult> {
        let scripts = ScriptFile::load_all(&self.config.scripts_dir)?;
        let filtered: Vec<ScriptFile> = ScriptFile::filter_by_tag(&scripts, tag).into_iter().cloned().collect();
        Ok(self.run_scripts(&filtered).await)
    }

    /// Run one script by name
    pub async fn run_named(&self, name: &str) -> RunnerResult<SuiteResult> {
        let scripts = ScriptFile::load_all(&self.config.scripts_dir)?;
        let script = scripts
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| RunnerError::ScriptNotFound(name.to_string()))?;
        Ok(self.run_scripts(std::slice::from_ref(&script)).await)
    }

    /// Run a list of scripts. Errors inside a script are recorded in its
    /// result rather than stopping the suite.
    pub async fn run_scripts(&self, scripts: &[ScriptFile]) -> SuiteResult {
        let started_at = chrono::Utc::now();
        let start = Instant::now();
        let mut results = Vec::with_capacity(scripts.len());
        let (mut passed, mut failed, mut errored, mut skipped) = (0, 0, 0, 0);

        info!("Running {} script(s)...", scripts.len());

        for script in scripts {
            if script.skip {
                skipped += 1;
                info!("- {} (skipped)", script.name);
                results.push(ScriptResult::skipped(&script.name));
                continue;
            }

            let result = match self.run_script(script).await {
                Ok(result) => result,
                Err(e) => ScriptResult::errored(&script.name, e.to_string()),
            };

            if result.success {
                passed += 1;
                info!(
                    "✓ {} ({} expectations, {} ms)",
                    result.name, result.expectations_passed, result.duration_ms
                );
            } else if let Some(failure) = &result.failure {
                failed += 1;
                error!("✗ {} - {}", result.name, failure);
            } else {
                failed += 1;
                errored += 1;
                error!("✗ {} - {}", result.name, result.error.as_deref().unwrap_or("unknown error"));
            }
            results.push(result);
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!("");
        info!(
            "Script Results: {} passed, {} failed, {} skipped ({} ms)",
            passed, failed, skipped, duration_ms
        );

        SuiteResult {
            started_at,
            total: scripts.len(),
            passed,
            failed,
            errored,
            skipped,
            duration_ms,
            results,
        }
    }

    /// Run a single script
    pub async fn run_script(&self, script: &ScriptFile) -> RunnerResult<ScriptResult> {
        let start = Instant::now();
        debug!("Running script: {}", script.name);

        let config = script.config.apply(&self.config.driver);
        config.validate()?;
        let compiled = script.compile()?;

        let recorder = Arc::new(Recorder::new());
        let driver = Driver::new(self.executor.clone(), config);
        let outcome = driver.run(compiled.as_ref(), recorder.clone()).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (expectations_passed, failure, error) = match outcome {
            Ok(report) => (report.expectations_passed, report.failure, None),
            Err(e) => {
                warn!("{} stopped: {}", script.name, e);
                (0, None, Some(e.to_string()))
            }
        };

        Ok(ScriptResult {
            name: script.name.clone(),
            success: failure.is_none() && error.is_none(),
            skipped: false,
            duration_ms,
            expectations_passed,
            failure,
            error,
            requests: recorder.requests(),
            docs: recorder.docs(),
        })
    }

    /// Write suite results to `test-results.json` in the output directory
    pub fn write_results(&self, results: &SuiteResult) -> RunnerResult<PathBuf> {
        write_results(&self.config.output_dir, results)
    }
}

pub fn write_results(output_dir: &Path, results: &SuiteResult) -> RunnerResult<PathBuf> {
    std::fs::create_dir_all(output_dir)?;
    let path = output_dir.join("test-results.json");
    let json = serde_json::to_string_pretty(results)?;
    std::fs::write(&path, json)?;
    info!("Results written to: {}", path.display());
    Ok(path)
}
