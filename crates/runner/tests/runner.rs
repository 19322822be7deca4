use apidrive::{DriverConfig, Executor, FailureKind, HttpRequest, HttpResponse, Result};
use apidrive_runner::{RunnerConfig, RunnerError, SuiteRunner};
use async_trait::async_trait;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Mutex};
use test_case::test_case;

/// A tiny in-memory users API
#[derive(Default)]
struct UsersApi {
    created: Mutex<Vec<String>>,
}

#[async_trait]
impl Executor for UsersApi {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let path = request.url.trim_start_matches("http://api.test");
        let response = match (request.method.as_str(), path) {
            ("GET", "/health") => HttpResponse::new(200).with_text("OK"),
            ("POST", "/users") => {
                let name = request
                    .body
                    .as_ref()
                    .and_then(|b| b.get("name"))
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                let mut created = self.created.lock().unwrap();
                created.push(name.clone());
                HttpResponse::new(201).with_json(json!({"id": created.len(), "name": name}))
            }
            ("GET", p) if p.starts_with("/users/") => {
                let id: usize = p["/users/".len()..].parse().unwrap_or(0);
                match self.created.lock().unwrap().get(id.wrapping_sub(1)) {
                    Some(name) => HttpResponse::new(200).with_json(json!({"id": id, "name": name})),
                    None => HttpResponse::new(404).with_text("Not Found"),
                }
            }
            _ => HttpResponse::new(404).with_text("Not Found"),
        };
        Ok(response)
    }
}

fn write(dir: &Path, file: &str, yaml: &str) {
    std::fs::write(dir.join(file), yaml).unwrap();
}

fn runner(scripts: &Path, output: &Path) -> SuiteRunner {
    let config = RunnerConfig {
        scripts_dir: scripts.to_path_buf(),
        output_dir: output.to_path_buf(),
        driver: DriverConfig {
            endpoint: "http://api.test".to_string(),
            ..Default::default()
        },
    };
    SuiteRunner::with_executor(config, Arc::new(UsersApi::default()))
}

const SIGNUP: &str = r#"
name: signup
tags: [smoke]
steps:
  - action: introduce
    actors: [mia]
  - action: request
    method: POST
    path: /users
    body: {name: mia}
    expect:
      - status: 201
        body: {id: $int, name: mia}
    stash:
      - key: user
      - key: user_id
        pointer: /id
  - action: request
    method: GET
    path: /users/:user_id
    expect:
      - status: 200
        body: {name: ":user.name"}
  - action: doc
    message: signup round trip
"#;

const BROKEN: &str = r#"
name: broken
steps:
  - action: request
    method: GET
    path: /health
    expect:
      - status: 200
      - text_matches: "^UP$"
"#;

const MISSING_STASH: &str = r#"
name: missing-stash
steps:
  - action: request
    method: GET
    path: /users/:nobody
"#;

const SKIPPED: &str = r#"
name: later
skip: true
steps: []
"#;

#[tokio::test]
async fn suite_tallies_passes_failures_and_errors() {
    let scripts = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write(scripts.path(), "a_signup.yaml", SIGNUP);
    write(scripts.path(), "b_broken.yml", BROKEN);
    write(scripts.path(), "c_missing.yaml", MISSING_STASH);
    write(scripts.path(), "d_later.yaml", SKIPPED);
    write(scripts.path(), "notes.txt", "not a script");

    let suite = runner(scripts.path(), output.path()).run_all().await.unwrap();
    assert_eq!(suite.total, 4);
    assert_eq!(suite.passed, 1);
    assert_eq!(suite.failed, 2);
    assert_eq!(suite.errored, 1);
    assert_eq!(suite.skipped, 1);
    assert!(!suite.success());

    let signup = &suite.results[0];
    assert!(signup.success);
    assert_eq!(signup.expectations_passed, 2);
    assert_eq!(signup.requests.len(), 2);
    assert_eq!(signup.requests[1].url, "http://api.test/users/1");
    assert_eq!(signup.docs, vec!["signup round trip".to_string()]);

    let broken = &suite.results[1];
    let failure = broken.failure.as_ref().unwrap();
    assert_eq!(failure.kind, FailureKind::TextComparisonFailure);
    assert!(failure.origin.ends_with("b_broken.yml#steps[0].expect[1]"), "{}", failure.origin);
    assert_eq!(broken.expectations_passed, 0);

    let missing = &suite.results[2];
    assert!(missing.failure.is_none());
    assert!(missing.error.as_deref().unwrap().contains("nobody"));
}

#[test_case(SIGNUP, (1, 0, 0, 0) ; "passing script")]
#[test_case(BROKEN, (0, 1, 0, 0) ; "unmet expectation")]
#[test_case(MISSING_STASH, (0, 1, 1, 0) ; "missing stash key is an error")]
#[test_case(SKIPPED, (0, 0, 0, 1) ; "skipped script")]
#[tokio::test]
async fn single_script_outcome(yaml: &str, tally: (usize, usize, usize, usize)) {
    let scripts = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write(scripts.path(), "only.yaml", yaml);

    let suite = runner(scripts.path(), output.path()).run_all().await.unwrap();
    assert_eq!((suite.passed, suite.failed, suite.errored, suite.skipped), tally);
    assert_eq!(suite.success(), tally.1 == 0);
}

#[tokio::test]
async fn tag_and_name_filters() {
    let scripts = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write(scripts.path(), "signup.yaml", SIGNUP);
    write(scripts.path(), "broken.yaml", BROKEN);
    let runner = runner(scripts.path(), output.path());

    let tagged = runner.run_tagged("smoke").await.unwrap();
    assert_eq!(tagged.total, 1);
    assert!(tagged.success());

    let named = runner.run_named("broken").await.unwrap();
    assert_eq!(named.total, 1);
    assert_eq!(named.failed, 1);

    assert!(matches!(runner.run_named("nope").await, Err(RunnerError::ScriptNotFound(_))));
}

#[tokio::test]
async fn results_are_written_as_json() {
    let scripts = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write(scripts.path(), "signup.yaml", SIGNUP);
    let runner = runner(scripts.path(), &output.path().join("nested"));

    let suite = runner.run_all().await.unwrap();
    let path = runner.write_results(&suite).unwrap();
    assert!(path.ends_with("test-results.json"));

    let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(written["passed"], 1);
    assert_eq!(written["results"][0]["name"], "signup");
    assert_eq!(written["results"][0]["requests"][0]["method"], "POST");
}

#[tokio::test]
async fn malformed_script_fails_loading() {
    let scripts = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write(scripts.path(), "bad.yaml", "name: bad\nsteps:\n  - action: teleport\n");

    let err = runner(scripts.path(), output.path()).run_all().await.unwrap_err();
    assert!(matches!(err, RunnerError::ScriptParse { ref path, .. } if path.ends_with("bad.yaml")));
}

#[tokio::test]
async fn script_config_overrides_endpoint() {
    let scripts = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    write(
        scripts.path(),
        "elsewhere.yaml",
        r#"
name: elsewhere
config:
  endpoint: http://other.test
steps:
  - action: request
    method: GET
    path: /health
    expect:
      - status: 404
"#,
    );

    let suite = runner(scripts.path(), output.path()).run_all().await.unwrap();
    assert!(suite.success());
    assert_eq!(suite.results[0].requests[0].url, "http://other.test/health");
}
