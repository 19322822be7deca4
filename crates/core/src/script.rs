//! Script composition
//!
//! A script is a tree of [`Step`]s. Each step takes the [`Context`] by value
//! and hands it back, so sequential steps see each other's stash writes and
//! actor changes in order. [`Concurrent`] branches the context for each child,
//! runs them together, and merges the results.
//!
//! ```ignore
//! let script = sequence(steps![
//!     introduce(["mia"]),
//!     Request::post("/users", json!({"name": "mia"}))
//!         .expect((201, json!({"id": "$int"})))
//!         .stash("user"),
//!     Request::get("/users/:user.id").until(200),
//! ]);
//! let report = driver.run(&script, Arc::new(TracingObserver)).await?;
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::context::{Context, JarHandle};
use crate::error::{ArgumentError, ContextError, Error, ExpectationError, Result};
use crate::expectation::{check_all, Expectation, Expected};
use crate::http::{build_url, Executor, HttpRequest, HttpResponse, Method};
use crate::observer::{Observer, RequestRecord};
use crate::poller::{poll, Clock, PollSpec, TokioClock};

/// Everything a step needs besides the context
pub struct Driver {
    executor: Arc<dyn Executor>,
    config: DriverConfig,
    clock: Arc<dyn Clock>,
    default_expectation: Option<Expected>,
}

impl Driver {
    pub fn new(executor: Arc<dyn Executor>, config: DriverConfig) -> Self {
        let default_expectation = config.default_status.map(Expected::from);
        Self {
            executor,
            config,
            clock: Arc::new(TokioClock),
            default_expectation,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Expectation applied to requests that declare none of their own
    pub fn with_default_expectation(mut self, expected: impl Into<Expected>) -> Self {
        self.default_expectation = Some(expected.into());
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Run `script` with `observer` attached for the duration of the run.
    ///
    /// Expectation failures come back as a normal [`ScriptReport`]; context,
    /// argument and transport errors are returned as `Err`.
    pub async fn run(&self, script: &dyn Step, observer: Arc<dyn Observer>) -> Result<ScriptReport> {
        let ctx = Context::with_observer(observer);
        let run = ctx.run_state();

        let outcome = match script.run(self, ctx).await {
            Ok(ctx) => ctx.stash().settle().await.map_err(Error::from),
            Err(e) => Err(e),
        };

        let expectations_passed = run.expectations_passed();
        run.detach();

        match outcome {
            Ok(()) => Ok(ScriptReport {
                expectations_passed,
                failure: None,
            }),
            Err(Error::Expectation(failure)) => {
                warn!("script failed after {} passing expectations: {}", expectations_passed, failure);
                Ok(ScriptReport {
                    expectations_passed,
                    failure: Some(failure),
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Outcome of a script whose infrastructure held up
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptReport {
    pub expectations_passed: usize,
    pub failure: Option<ExpectationError>,
}

impl ScriptReport {
    pub fn success(&self) -> bool {
        self.failure.is_none()
    }
}

/// One unit of a script
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, driver: &Driver, ctx: Context) -> Result<Context>;
}

pub type BoxStep = Box<dyn Step>;

pub trait StepExt: Step + Sized + 'static {
    fn boxed(self) -> BoxStep {
        Box::new(self)
    }
}

impl<S: Step + Sized + 'static> StepExt for S {}

/// Build a `Vec<BoxStep>` from heterogeneous steps
#[macro_export]
macro_rules! steps {
    ($($step:expr),* $(,)?) => {
        vec![$(Box::new($step) as $crate::script::BoxStep),*]
    };
}

/// Run steps one after another
pub struct Sequence {
    steps: Vec<BoxStep>,
}

pub fn sequence(steps: Vec<BoxStep>) -> Sequence {
    Sequence { steps }
}

#[async_trait]
impl Step for Sequence {
    async fn run(&self, driver: &Driver, mut ctx: Context) -> Result<Context> {
        for step in &self.steps {
            ctx = step.run(driver, ctx).await?;
        }
        Ok(ctx)
    }
}

/// Run steps at the same time on branched contexts, then merge
pub struct Concurrent {
    steps: Vec<BoxStep>,
}

pub fn concurrently(steps: Vec<BoxStep>) -> Concurrent {
    Concurrent { steps }
}

#[async_trait]
impl Step for Concurrent {
    async fn run(&self, driver: &Driver, ctx: Context) -> Result<Context> {
        debug!("fanning out {} branches", self.steps.len());
        let results = join_all(self.steps.iter().map(|step| step.run(driver, ctx.branch()))).await;

        let mut branches = Vec::with_capacity(results.len());
        for result in results {
            branches.push(result?);
        }
        Ok(ctx.merge(branches))
    }
}

/// A titled group of steps, recorded on the context stack
pub struct Titled {
    title: String,
    steps: Sequence,
}

pub fn step(title: impl Into<String>, steps: Vec<BoxStep>) -> Titled {
    Titled {
        title: title.into(),
        steps: sequence(steps),
    }
}

#[async_trait]
impl Step for Titled {
    async fn run(&self, driver: &Driver, mut ctx: Context) -> Result<Context> {
        ctx.push_step(self.title.clone());
        let observer = ctx.observer();
        observer.step_started(ctx.stack());

        let mut ctx = self.steps.run(driver, ctx).await?;
        observer.step_finished(ctx.stack());
        ctx.pop_step();
        Ok(ctx)
    }
}

/// Give each alias its own cookie jar; the last one becomes current
pub struct Introduce {
    aliases: Vec<String>,
}

pub fn introduce<I, S>(aliases: I) -> Introduce
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Introduce {
        aliases: aliases.into_iter().map(Into::into).collect(),
    }
}

#[async_trait]
impl Step for Introduce {
    async fn run(&self, _driver: &Driver, mut ctx: Context) -> Result<Context> {
        let Some(last) = self.aliases.last() else {
            return Err(ArgumentError("introduce needs at least one alias".to_string()).into());
        };
        for alias in &self.aliases {
            ctx.add_actor(alias.clone(), JarHandle::new());
        }
        ctx.set_current_actor(last)?;
        Ok(ctx)
    }
}

/// Switch the current actor, either for the rest of the flow or only while
/// running a nested sequence
pub struct AsActor {
    alias: String,
    steps: Option<Sequence>,
}

pub fn as_actor(alias: impl Into<String>) -> AsActor {
    AsActor {
        alias: alias.into(),
        steps: None,
    }
}

pub fn as_actor_with(alias: impl Into<String>, steps: Vec<BoxStep>) -> AsActor {
    AsActor {
        alias: alias.into(),
        steps: Some(sequence(steps)),
    }
}

#[async_trait]
impl Step for AsActor {
    async fn run(&self, driver: &Driver, mut ctx: Context) -> Result<Context> {
        let previous = ctx.current_actor().map(str::to_string);
        ctx.set_current_actor(&self.alias)?;

        let Some(steps) = &self.steps else {
            return Ok(ctx);
        };
        let mut ctx = steps.run(driver, ctx).await?;
        match previous {
            Some(alias) => ctx.set_current_actor(&alias)?,
            None => ctx.clear_current_actor(),
        }
        Ok(ctx)
    }
}

/// Pause the flow
pub struct Wait {
    duration: Duration,
}

pub fn wait(ms: u64) -> Wait {
    Wait {
        duration: Duration::from_millis(ms),
    }
}

#[async_trait]
impl Step for Wait {
    async fn run(&self, driver: &Driver, ctx: Context) -> Result<Context> {
        driver.clock().sleep(self.duration).await;
        Ok(ctx)
    }
}

/// Stash a literal. References inside it resolve lazily against the stash as
/// it stood when this step ran.
pub struct StashLiteral {
    key: String,
    value: Value,
}

pub fn stash(key: impl Into<String>, value: Value) -> StashLiteral {
    StashLiteral {
        key: key.into(),
        value,
    }
}

#[async_trait]
impl Step for StashLiteral {
    async fn run(&self, _driver: &Driver, mut ctx: Context) -> Result<Context> {
        let snapshot = ctx.stash().clone();
        let value = self.value.clone();
        ctx.stash_mut()
            .set_deferred(self.key.clone(), async move { snapshot.substitute_value(&value).await });
        Ok(ctx)
    }
}

pub struct ClearStash;

pub fn clear_stash() -> ClearStash {
    ClearStash
}

#[async_trait]
impl Step for ClearStash {
    async fn run(&self, _driver: &Driver, mut ctx: Context) -> Result<Context> {
        ctx.stash_mut().clear();
        Ok(ctx)
    }
}

/// Log a stash reference such as `":user.id"`. A missing value is logged, not
/// raised.
pub struct LogStash {
    reference: String,
}

pub fn log(reference: impl Into<String>) -> LogStash {
    LogStash {
        reference: reference.into(),
    }
}

#[async_trait]
impl Step for LogStash {
    async fn run(&self, _driver: &Driver, ctx: Context) -> Result<Context> {
        let keypath = self.reference.trim_start_matches(':');
        match ctx.stash().get_keypath(keypath).await {
            Ok(value) => {
                let rendered = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
                info!("log:\nvvvvvvvvv\n:{} =\n{}\n^^^^^^^^^", keypath, rendered);
            }
            Err(e) => warn!("log:\nvvvvvvvvv\n{}\n^^^^^^^^^", e),
        }
        Ok(ctx)
    }
}

/// Pass a documentation note to the observer
pub struct Doc {
    message: String,
}

pub fn doc(message: impl Into<String>) -> Doc {
    Doc {
        message: message.into(),
    }
}

#[async_trait]
impl Step for Doc {
    async fn run(&self, _driver: &Driver, ctx: Context) -> Result<Context> {
        ctx.observer().doc(&self.message);
        Ok(ctx)
    }
}

/// Derives a stash value from stashed dependencies and the response
pub type Scraper = Arc<dyn Fn(&[Value], &HttpResponse) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Clone)]
enum Stasher {
    Body(String),
    Scraped {
        key: String,
        deps: Vec<String>,
        scraper: Scraper,
    },
    Literal(String, Value),
}

/// A request with its expectations and stash captures
#[derive(Clone)]
pub struct Request {
    method: Method,
    route: String,
    headers: BTreeMap<String, String>,
    body: Option<Value>,
    form: Option<BTreeMap<String, Value>>,
    expectations: Vec<Expectation>,
    untils: Vec<Expectation>,
    nevers: Vec<Expectation>,
    timeout: Option<Duration>,
    stashers: Vec<Stasher>,
    log: bool,
}

impl Request {
    pub fn new(method: Method, route: impl Into<String>) -> Self {
        Self {
            method,
            route: route.into(),
            headers: BTreeMap::new(),
            body: None,
            form: None,
            expectations: Vec::new(),
            untils: Vec::new(),
            nevers: Vec::new(),
            timeout: None,
            stashers: Vec::new(),
            log: false,
        }
    }

    pub fn get(route: impl Into<String>) -> Self {
        Self::new(Method::Get, route)
    }

    pub fn delete(route: impl Into<String>) -> Self {
        Self::new(Method::Delete, route)
    }

    pub fn head(route: impl Into<String>) -> Self {
        Self::new(Method::Head, route)
    }

    pub fn post(route: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Post, route).body(body)
    }

    pub fn put(route: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Put, route).body(body)
    }

    pub fn patch(route: impl Into<String>, body: Value) -> Self {
        Self::new(Method::Patch, route).body(body)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Send a url-encoded form instead of a JSON body
    pub fn form(mut self, form: BTreeMap<String, Value>) -> Self {
        self.form = Some(form);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[track_caller]
    pub fn expect(self, expected: impl Into<Expected>) -> Self {
        self.expectation(Expectation::declare(expected))
    }

    /// Retry until `expected` holds, within the default poll budget
    #[track_caller]
    pub fn until(self, expected: impl Into<Expected>) -> Self {
        self.until_expectation(Expectation::declare(expected))
    }

    #[track_caller]
    pub fn until_within(mut self, expected: impl Into<Expected>, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self.until_expectation(Expectation::declare(expected))
    }

    /// Keep checking that `expected` does not hold for the whole budget
    #[track_caller]
    pub fn never(self, expected: impl Into<Expected>) -> Self {
        self.never_expectation(Expectation::declare(expected))
    }

    #[track_caller]
    pub fn never_within(mut self, expected: impl Into<Expected>, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self.never_expectation(Expectation::declare(expected))
    }

    pub fn expectation(mut self, expectation: Expectation) -> Self {
        self.expectations.push(expectation);
        self
    }

    pub fn until_expectation(mut self, expectation: Expectation) -> Self {
        self.untils.push(expectation);
        self
    }

    pub fn never_expectation(mut self, expectation: Expectation) -> Self {
        self.nevers.push(expectation);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Capture the response body (JSON if it parsed, else the text)
    pub fn stash(mut self, key: impl Into<String>) -> Self {
        self.stashers.push(Stasher::Body(key.into()));
        self
    }

    /// Capture a derived value. `scraper` receives the values stashed under
    /// `deps`, in order, followed by the response.
    pub fn stash_with<F>(mut self, key: impl Into<String>, deps: &[&str], scraper: F) -> Self
    where
        F: Fn(&[Value], &HttpResponse) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.stashers.push(Stasher::Scraped {
            key: key.into(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            scraper: Arc::new(scraper),
        });
        self
    }

    /// Capture a constant once the request has passed. References inside it
    /// are resolved before storing.
    pub fn stash_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.stashers.push(Stasher::Literal(key.into(), value));
        self
    }

    /// Log the response when it arrives
    pub fn log(mut self) -> Self {
        self.log = true;
        self
    }

    fn expectation_count(&self) -> usize {
        self.expectations.len() + self.untils.len() + self.nevers.len()
    }

    async fn resolve(&self, driver: &Driver, ctx: &Context) -> Result<HttpRequest> {
        let stash = ctx.stash();
        let route = stash.substitute_route(&self.route).await?;

        let mut headers = driver.config().request_headers.clone();
        for (name, value) in &self.headers {
            let value = stash.substitute_value(&Value::String(value.clone())).await?;
            headers.insert(name.clone(), value_text(&value));
        }

        let body = match &self.body {
            Some(body) => Some(stash.substitute_value(body).await?),
            None => None,
        };

        let form = match &self.form {
            Some(form) => {
                let mut resolved = BTreeMap::new();
                for (name, value) in form {
                    resolved.insert(name.clone(), value_text(&stash.substitute_value(value).await?));
                }
                Some(resolved)
            }
            None => None,
        };

        Ok(HttpRequest {
            method: self.method,
            url: build_url(&driver.config().endpoint, &route)?,
            headers,
            body,
            form,
            jar: ctx.jar_for_current_actor()?,
        })
    }

    async fn apply_stashers(&self, ctx: &mut Context, result: &HttpResponse) -> Result<()> {
        for stasher in &self.stashers {
            match stasher {
                Stasher::Body(key) => ctx.stash_mut().set(key.clone(), result.body_value()),
                Stasher::Scraped { key, deps, scraper } => {
                    let mut values = Vec::with_capacity(deps.len());
                    for dep in deps {
                        values.push(ctx.stash().get_keypath(dep.trim_start_matches(':')).await?);
                    }
                    let value = scraper(&values, result).map_err(|e| ContextError::Unresolved {
                        key: key.clone(),
                        reason: format!("{:#}", e),
                    })?;
                    ctx.stash_mut().set(key.clone(), value);
                }
                Stasher::Literal(key, value) => {
                    let value = ctx.stash().substitute_value(value).await?;
                    ctx.stash_mut().set(key.clone(), value);
                }
            }
        }
        Ok(())
    }
}

async fn substitute_all(expectations: &[Expectation], ctx: &Context) -> Result<Vec<Expectation>> {
    let resolved = futures::future::try_join_all(expectations.iter().map(|e| e.substitute(ctx.stash()))).await?;
    Ok(resolved)
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl Step for Request {
    async fn run(&self, driver: &Driver, mut ctx: Context) -> Result<Context> {
        if !self.untils.is_empty() && !self.nevers.is_empty() {
            return Err(ArgumentError("a request cannot declare both until and never".to_string()).into());
        }

        let delay = driver.config().delay();
        if !delay.is_zero() {
            driver.clock().sleep(delay).await;
        }

        let request = self.resolve(driver, &ctx).await?;
        let expectations = substitute_all(&self.expectations, &ctx).await?;
        let untils = substitute_all(&self.untils, &ctx).await?;
        let nevers = substitute_all(&self.nevers, &ctx).await?;

        let executor = driver.executor.clone();
        let attempt = || executor.execute(request.clone());
        let polled = |expectations: Vec<Expectation>, negate| PollSpec {
            expectations,
            delay: driver.config().poll_delay(),
            timeout: self.timeout.unwrap_or_else(|| driver.config().poll_timeout()),
            negate,
        };

        let result = if !untils.is_empty() {
            poll(attempt, &polled(untils, false), driver.clock()).await?
        } else if !nevers.is_empty() {
            poll(attempt, &polled(nevers, true), driver.clock()).await?
        } else {
            attempt().await?
        };

        if self.log {
            let shown = serde_json::json!({
                "statusCode": result.status,
                "headers": result.headers,
                "body": result.body_value(),
            });
            let rendered = serde_json::to_string_pretty(&shown).unwrap_or_else(|_| shown.to_string());
            info!("log:\nvvvvvvvvv\n{}\n^^^^^^^^^", rendered);
        }

        // The default expectation stands in for missing plain expects, polled
        // or not, and is not counted in the tally.
        if !expectations.is_empty() {
            check_all(&expectations, &result).await?;
        } else if let Some(default) = &driver.default_expectation {
            let expectation = Expectation {
                status: default.status,
                body: default.body.clone(),
                origin: format!("default expectation for {} {}", self.method, self.route),
            };
            expectation.check(&result).await?;
        }

        ctx.observer().request_finished(&RequestRecord {
            stack: ctx.stack().to_vec(),
            actor: ctx.current_actor().map(str::to_string),
            method: request.method,
            url: request.url.clone(),
            status: result.status,
            profile: result.profile.clone(),
        });
        ctx.record_passed(self.expectation_count());

        self.apply_stashers(&mut ctx, &result).await?;
        Ok(ctx)
    }
}
