//! HTTP executor contract and the reqwest-backed implementation
//!
//! The engine only ever sees [`HttpRequest`] going out and [`HttpResponse`]
//! coming back. Connection handling, TLS and decompression belong to the
//! executor.

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::cookie::CookieStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::context::JarHandle;
use crate::error::{Error, Result};

/// Request methods supported by scripts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "delete")]
    Delete,
    #[serde(alias = "head")]
    Head,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
            Method::Head => "HEAD",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Method> for reqwest::Method {
    fn from(m: Method) -> Self {
        match m {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Patch => reqwest::Method::PATCH,
            Method::Delete => reqwest::Method::DELETE,
            Method::Head => reqwest::Method::HEAD,
        }
    }
}

/// A fully resolved request, ready for the executor
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Value>,
    pub form: Option<BTreeMap<String, String>>,
    pub jar: Option<JarHandle>,
}

/// Timing and size information for one exchange
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Milliseconds since the epoch
    pub request_start_ms: i64,
    pub response_end_ms: i64,
    pub raw_size: usize,
    pub decoded_size: usize,
}

impl Profile {
    pub fn duration_ms(&self) -> i64 {
        self.response_end_ms - self.request_start_ms
    }
}

/// Read access to the cookies an actor holds for the request URL
#[derive(Clone, Default)]
pub struct Cookies {
    jar: Option<JarHandle>,
    url: Option<reqwest::Url>,
}

impl Cookies {
    pub fn new(jar: Option<JarHandle>, url: &str) -> Self {
        Self {
            jar,
            url: reqwest::Url::parse(url).ok(),
        }
    }

    /// Value of the cookie called `name`, if the jar holds one for this URL
    pub fn get(&self, name: &str) -> Option<String> {
        let (jar, url) = (self.jar.as_ref()?, self.url.as_ref()?);
        let header = jar.jar().cookies(url)?;
        let header = header.to_str().ok()?;
        header.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == name).then(|| v.to_string())
        })
    }
}

impl fmt::Debug for Cookies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cookies")
            .field("jar", &self.jar.as_ref().map(JarHandle::id))
            .field("url", &self.url.as_ref().map(reqwest::Url::as_str))
            .finish()
    }
}

/// Normalised result of one request
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub text: Option<String>,
    /// Parsed body, `None` when the body is not JSON
    pub json: Option<Value>,
    pub cookies: Cookies,
    pub profile: Profile,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    /// Set the body text, parsing it as JSON when possible
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        let text = text.into();
        self.json = serde_json::from_str(&text).ok();
        self.text = if text.is_empty() { None } else { Some(text) };
        self
    }

    pub fn with_json(mut self, json: Value) -> Self {
        self.text = Some(json.to_string());
        self.json = Some(json);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    /// What a plain `stash(key)` captures: the JSON body, else the text,
    /// else null
    pub fn body_value(&self) -> Value {
        match (&self.json, &self.text) {
            (Some(json), _) => json.clone(),
            (None, Some(text)) => Value::String(text.clone()),
            (None, None) => Value::Null,
        }
    }

    /// The whole result as JSON, as seen by top-level predicates
    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "statusCode": self.status,
            "headers": self.headers,
            "text": self.text,
            "json": self.json,
            "profile": self.profile,
        })
    }
}

/// Performs requests on behalf of the engine
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Join a route onto the endpoint. Routes starting with `//` are taken
/// relative to the endpoint's origin, ignoring any path it carries.
pub fn build_url(endpoint: &str, route: &str) -> Result<String> {
    let base = reqwest::Url::parse(endpoint).map_err(|e| Error::Url(format!("{}: {}", endpoint, e)))?;

    if let Some(absolute) = route.strip_prefix("//") {
        let origin = base.origin().ascii_serialization();
        return Ok(format!("{}/{}", origin, absolute));
    }

    let prefix = endpoint.trim_end_matches('/');
    if route.is_empty() || route.starts_with('/') || route.starts_with('?') {
        Ok(format!("{}{}", prefix, route))
    } else {
        Ok(format!("{}/{}", prefix, route))
    }
}

/// [`Executor`] backed by reqwest. Each cookie jar gets its own client so that
/// requests made as one actor share one cookie store.
pub struct ReqwestExecutor {
    timeout: Duration,
    anonymous: reqwest::Client,
    clients: Mutex<HashMap<Uuid, reqwest::Client>>,
}

impl ReqwestExecutor {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            timeout,
            anonymous: reqwest::Client::builder().timeout(timeout).build()?,
            clients: Mutex::new(HashMap::new()),
        })
    }

    fn client_for(&self, jar: Option<&JarHandle>) -> Result<reqwest::Client> {
        let Some(jar) = jar else {
            return Ok(self.anonymous.clone());
        };
        let mut clients = self.clients.lock();
        if let Some(client) = clients.get(&jar.id()) {
            return Ok(client.clone());
        }
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .cookie_provider(jar.jar().clone())
            .build()?;
        clients.insert(jar.id(), client.clone());
        Ok(client)
    }
}

#[async_trait]
impl Executor for ReqwestExecutor {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!("{} {}", request.method, request.url);
        let client = self.client_for(request.jar.as_ref())?;

        let mut builder = client.request(request.method.into(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(form) = &request.form {
            builder = builder.form(form);
        } else if let Some(body) = &request.body {
            builder = builder.body(serde_json::to_vec(body)?);
        }

        let start = chrono::Utc::now().timestamp_millis();
        let response = builder.send().await?;

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
            .collect();
        let raw_size = response.content_length().map(|n| n as usize);
        let bytes = response.bytes().await?;
        let end = chrono::Utc::now().timestamp_millis();

        let text = String::from_utf8_lossy(&bytes).into_owned();
        let mut result = HttpResponse::new(status).with_text(text);
        result.headers = headers;
        result.cookies = Cookies::new(request.jar.clone(), &request.url);
        result.profile = Profile {
            request_start_ms: start,
            response_end_ms: end,
            raw_size: raw_size.unwrap_or(bytes.len()),
            decoded_size: bytes.len(),
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_build_url_joins_routes() {
        assert_eq!(build_url("http://localhost:3000", "/users").unwrap(), "http://localhost:3000/users");
        assert_eq!(build_url("http://localhost:3000/api/", "/users").unwrap(), "http://localhost:3000/api/users");
        assert_eq!(build_url("http://localhost:3000/api", "users").unwrap(), "http://localhost:3000/api/users");
    }

    #[test]
    fn test_build_url_double_slash_is_origin_relative() {
        assert_eq!(build_url("http://localhost:3000/api", "//health").unwrap(), "http://localhost:3000/health");
    }

    #[test]
    fn test_build_url_rejects_bad_endpoint() {
        assert!(matches!(build_url("not a url", "/x"), Err(Error::Url(_))));
    }

    #[test]
    fn test_with_text_parses_json_when_possible() {
        let res = HttpResponse::new(200).with_text(r#"{"id": 3}"#);
        assert_eq!(res.json, Some(json!({"id": 3})));
        assert_eq!(res.body_value(), json!({"id": 3}));

        let res = HttpResponse::new(200).with_text("Not Found");
        assert_eq!(res.json, None);
        assert_eq!(res.body_value(), json!("Not Found"));
    }

    #[test]
    fn test_cookies_read_from_actor_jar() {
        let jar = JarHandle::new();
        let url = reqwest::Url::parse("http://localhost/login").unwrap();
        jar.jar().add_cookie_str("session=abc123; Path=/", &url);

        let cookies = Cookies::new(Some(jar), "http://localhost/profile");
        assert_eq!(cookies.get("session").as_deref(), Some("abc123"));
        assert_eq!(cookies.get("missing"), None);
    }
}
