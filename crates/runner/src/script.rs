//! Declarative YAML scripts
//!
//! A script file describes one flow against the API. Its steps compile into
//! the same [`Step`](apidrive::Step) tree a hand-written Rust script builds,
//! with origins of the form `path#steps[2].expect[0]` so failures point back
//! into the file.

use apidrive::{
    as_actor, as_actor_with, clear_stash, concurrently, doc, introduce, log, sequence, stash, step, wait,
    BoxStep, DriverConfig, Expectation, Expression, Method, Request, StepExt,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{RunnerError, RunnerResult};

/// A complete script parsed from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFile {
    /// Unique name for this script
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Tags for filtering scripts
    #[serde(default)]
    pub tags: Vec<String>,

    /// Listed in the report but not run
    #[serde(default)]
    pub skip: bool,

    /// Per-script overrides of the driver configuration
    #[serde(default)]
    pub config: ConfigOverrides,

    /// Steps to execute in order
    pub steps: Vec<ScriptStep>,

    /// File the script was loaded from
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

/// Driver settings a script may override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub delay_ms: Option<u64>,
    #[serde(default)]
    pub poll_timeout_ms: Option<u64>,
    #[serde(default)]
    pub poll_delay_ms: Option<u64>,
    #[serde(default)]
    pub default_status: Option<u16>,
    /// Merged over the base headers
    #[serde(default)]
    pub request_headers: BTreeMap<String, String>,
}

impl ConfigOverrides {
    pub fn apply(&self, base: &DriverConfig) -> DriverConfig {
        let mut config = base.clone();
        if let Some(endpoint) = &self.endpoint {
            config.endpoint = endpoint.clone();
        }
        if let Some(ms) = self.delay_ms {
            config.delay_ms = ms;
        }
        if let Some(ms) = self.poll_timeout_ms {
            config.poll_timeout_ms = ms;
        }
        if let Some(ms) = self.poll_delay_ms {
            config.poll_delay_ms = ms;
        }
        if self.default_status.is_some() {
            config.default_status = self.default_status;
        }
        config
            .request_headers
            .extend(self.request_headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        config
    }
}

/// A single step in a script
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Create actors, each with its own cookie jar; the last becomes current
    Introduce { actors: Vec<String> },

    /// Switch actor, for the rest of the flow or only for nested steps
    As {
        actor: String,
        #[serde(default)]
        steps: Option<Vec<ScriptStep>>,
    },

    /// Send a request and check it
    Request(RequestStep),

    /// Pause for a fixed time
    Wait { ms: u64 },

    /// Run nested steps at the same time
    Concurrent { steps: Vec<ScriptStep> },

    /// Run nested steps in order, optionally under a title
    Sequence {
        #[serde(default)]
        title: Option<String>,
        steps: Vec<ScriptStep>,
    },

    /// Stash a literal; `:key` references inside it are resolved
    Stash { key: String, value: Value },

    /// Forget everything stashed so far
    ClearStash,

    /// Log a stashed value, e.g. `:user.id`
    Log { key: String },

    /// Documentation note passed to the observer
    Doc { message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestStep {
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub form: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub expect: Vec<ExpectSpec>,
    #[serde(default)]
    pub until: Vec<ExpectSpec>,
    #[serde(default)]
    pub never: Vec<ExpectSpec>,
    #[serde(default)]
    pub stash: Vec<StashSpec>,
    #[serde(default)]
    pub log: bool,
}

/// One expectation as written in YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectSpec {
    #[serde(default)]
    pub status: Option<u16>,
    /// JSON expression, or a string compared with the response text
    #[serde(default)]
    pub body: Option<Value>,
    /// Regular expression over the response text
    #[serde(default)]
    pub text_matches: Option<String>,
    /// Poll budget override; only valid under `until` and `never`
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// A value to capture once the request passes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StashSpec {
    /// JSON pointer into the response body
    Pointer { key: String, pointer: String },
    /// A literal, references resolved
    Value { key: String, value: Value },
    /// The whole response body
    Whole { key: String },
}

impl ScriptFile {
    /// Parse a script from a YAML string
    pub fn from_yaml(yaml: &str) -> RunnerResult<Self> {
        serde_yaml::from_str(yaml).map_err(RunnerError::from)
    }

    /// Parse a script from a YAML file
    pub fn from_file(path: &Path) -> RunnerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut script: Self = serde_yaml::from_str(&content).map_err(|e| RunnerError::ScriptParse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        script.source = Some(path.to_path_buf());
        Ok(script)
    }

    /// Load all scripts under a directory, in path order
    pub fn load_all(dir: &Path) -> RunnerResult<Vec<Self>> {
        let mut scripts = Vec::new();

        for entry in walkdir::WalkDir::new(dir)
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.path()
                    .extension()
                    .map(|ext| ext == "yaml" || ext == "yml")
                    .unwrap_or(false)
            })
        {
            scripts.push(Self::from_file(entry.path())?);
        }

        Ok(scripts)
    }

    /// Filter scripts by tag
    pub fn filter_by_tag<'a>(scripts: &'a [Self], tag: &str) -> Vec<&'a Self> {
        scripts.iter().filter(|s| s.tags.iter().any(|t| t == tag)).collect()
    }

    /// Where failures in this script are reported as coming from
    pub fn origin(&self) -> String {
        match &self.source {
            Some(path) => path.display().to_string(),
            None => self.name.clone(),
        }
    }

    /// Build the runnable step tree
    pub fn compile(&self) -> RunnerResult<BoxStep> {
        let steps = compile_steps(&self.steps, &format!("{}#steps", self.origin()))?;
        Ok(sequence(steps).boxed())
    }
}

fn compile_steps(steps: &[ScriptStep], at: &str) -> RunnerResult<Vec<BoxStep>> {
    steps
        .iter()
        .enumerate()
        .map(|(i, s)| s.compile(&format!("{}[{}]", at, i)))
        .collect()
}

impl ScriptStep {
    fn compile(&self, at: &str) -> RunnerResult<BoxStep> {
        let nested = || format!("{}.steps", at);
        let compiled = match self {
            ScriptStep::Introduce { actors } => introduce(actors.clone()).boxed(),
            ScriptStep::As { actor, steps: None } => as_actor(actor.clone()).boxed(),
            ScriptStep::As {
                actor,
                steps: Some(steps),
            } => as_actor_with(actor.clone(), compile_steps(steps, &nested())?).boxed(),
            ScriptStep::Request(request) => request.compile(at)?.boxed(),
            ScriptStep::Wait { ms } => wait(*ms).boxed(),
            ScriptStep::Concurrent { steps } => concurrently(compile_steps(steps, &nested())?).boxed(),
            ScriptStep::Sequence {
                title: Some(title),
                steps,
            } => step(title.clone(), compile_steps(steps, &nested())?).boxed(),
            ScriptStep::Sequence { title: None, steps } => sequence(compile_steps(steps, &nested())?).boxed(),
            ScriptStep::Stash { key, value } => stash(key.clone(), value.clone()).boxed(),
            ScriptStep::ClearStash => clear_stash().boxed(),
            ScriptStep::Log { key } => log(key.clone()).boxed(),
            ScriptStep::Doc { message } => doc(message.clone()).boxed(),
        };
        Ok(compiled)
    }
}

impl RequestStep {
    pub fn compile(&self, at: &str) -> RunnerResult<Request> {
        let mut request = Request::new(self.method, self.path.clone());
        if let Some(body) = &self.body {
            request = request.body(body.clone());
        }
        if let Some(form) = &self.form {
            request = request.form(form.clone());
        }
        for (name, value) in &self.headers {
            request = request.header(name.clone(), value.clone());
        }

        for (j, spec) in self.expect.iter().enumerate() {
            let origin = format!("{}.expect[{}]", at, j);
            if spec.timeout_ms.is_some() {
                return Err(RunnerError::InvalidStep {
                    at: origin,
                    reason: "timeout_ms only applies to until and never".to_string(),
                });
            }
            request = request.expectation(spec.to_expectation(origin)?);
        }
        for (j, spec) in self.until.iter().enumerate() {
            if let Some(ms) = spec.timeout_ms {
                request = request.timeout(Duration::from_millis(ms));
            }
            request = request.until_expectation(spec.to_expectation(format!("{}.until[{}]", at, j))?);
        }
        for (j, spec) in self.never.iter().enumerate() {
            if let Some(ms) = spec.timeout_ms {
                request = request.timeout(Duration::from_millis(ms));
            }
            request = request.never_expectation(spec.to_expectation(format!("{}.never[{}]", at, j))?);
        }

        for capture in &self.stash {
            request = match capture {
                StashSpec::Pointer { key, pointer } => {
                    let pointer = pointer.clone();
                    request.stash_with(key.clone(), &[], move |_, response| {
                        response
                            .body_value()
                            .pointer(&pointer)
                            .cloned()
                            .ok_or_else(|| anyhow::anyhow!("nothing at {} in the response body", pointer))
                    })
                }
                StashSpec::Value { key, value } => request.stash_value(key.clone(), value.clone()),
                StashSpec::Whole { key } => request.stash(key.clone()),
            };
        }

        if self.log {
            request = request.log();
        }
        Ok(request)
    }
}

impl ExpectSpec {
    pub fn to_expectation(&self, origin: String) -> RunnerResult<Expectation> {
        let body = match (&self.body, &self.text_matches) {
            (Some(_), Some(_)) => {
                return Err(RunnerError::InvalidStep {
                    at: origin,
                    reason: "body and text_matches cannot both be given".to_string(),
                })
            }
            (Some(body), None) => Some(Expression::body(body.clone())),
            (None, Some(pattern)) => Some(Expression::pattern(pattern).map_err(|e| RunnerError::InvalidStep {
                at: origin.clone(),
                reason: e.to_string(),
            })?),
            (None, None) => None,
        };
        Ok(Expectation::new(self.status, body, origin).map_err(apidrive::Error::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_script() {
        let yaml = r#"
name: user-signup
description: Sign up and fetch the profile
tags:
  - auth
  - smoke
steps:
  - action: introduce
    actors: [mia]
  - action: request
    method: POST
    path: /users
    body: {name: mia}
    expect:
      - status: 201
        body: {id: $int}
    stash:
      - key: user
      - key: user_id
        pointer: /id
  - action: request
    method: get
    path: /users/:user_id
    until:
      - status: 200
        timeout_ms: 2000
"#;
        let script = ScriptFile::from_yaml(yaml).unwrap();
        assert_eq!(script.name, "user-signup");
        assert_eq!(script.steps.len(), 3);

        let ScriptStep::Request(request) = &script.steps[1] else {
            panic!("expected a request step");
        };
        assert_eq!(request.method, Method::Post);
        assert!(matches!(request.stash[0], StashSpec::Whole { .. }));
        assert!(matches!(request.stash[1], StashSpec::Pointer { ref pointer, .. } if pointer == "/id"));

        let ScriptStep::Request(poll) = &script.steps[2] else {
            panic!("expected a request step");
        };
        assert_eq!(poll.method, Method::Get);
        assert_eq!(poll.until[0].timeout_ms, Some(2000));
        assert!(script.compile().is_ok());
    }

    #[test]
    fn test_parse_nested_steps() {
        let yaml = r#"
name: fan-out
steps:
  - action: introduce
    actors: [mia, ella]
  - action: concurrent
    steps:
      - action: as
        actor: mia
        steps:
          - action: request
            method: GET
            path: /inbox
      - action: sequence
        title: ella checks in
        steps:
          - action: wait
            ms: 10
          - action: clear_stash
  - action: stash
    key: note
    value: {text: hello}
  - action: log
    key: ":note.text"
  - action: doc
    message: done
"#;
        let script = ScriptFile::from_yaml(yaml).unwrap();
        assert_eq!(script.steps.len(), 5);
        let ScriptStep::Concurrent { steps } = &script.steps[1] else {
            panic!("expected concurrent step");
        };
        assert!(matches!(steps[0], ScriptStep::As { steps: Some(_), .. }));
        assert!(matches!(steps[1], ScriptStep::Sequence { title: Some(_), .. }));
        assert!(script.compile().is_ok());
    }

    #[test]
    fn test_expectation_needs_status_or_body() {
        let err = ExpectSpec::default().to_expectation("x#steps[0].expect[0]".into()).unwrap_err();
        assert!(matches!(err, RunnerError::Driver(apidrive::Error::Argument(_))));
    }

    #[test]
    fn test_timeout_rejected_on_plain_expect() {
        let step = RequestStep {
            method: Method::Get,
            path: "/".into(),
            body: None,
            headers: BTreeMap::new(),
            form: None,
            expect: vec![ExpectSpec {
                status: Some(200),
                timeout_ms: Some(100),
                ..Default::default()
            }],
            until: vec![],
            never: vec![],
            stash: vec![],
            log: false,
        };
        assert!(matches!(step.compile("s#steps[0]"), Err(RunnerError::InvalidStep { .. })));
    }

    #[test]
    fn test_overrides_merge_headers_and_keep_defaults() {
        let overrides = ConfigOverrides {
            poll_timeout_ms: Some(500),
            request_headers: BTreeMap::from([("X-Trace".to_string(), "1".to_string())]),
            ..Default::default()
        };
        let config = overrides.apply(&DriverConfig::default());
        assert_eq!(config.poll_timeout_ms, 500);
        assert_eq!(config.poll_delay_ms, 10);
        assert_eq!(config.request_headers["X-Trace"], "1");
        assert_eq!(config.request_headers["Content-Type"], "application/json");
    }
}
