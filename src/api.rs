use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::{multipart, Client as HttpClient, RequestBuilder, Response};
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::error::ApiError;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

pub trait TokenProvider: Send + Sync {
    fn token(&self) -> Result<Option<String>>;
}

pub struct StaticToken(pub Option<String>);

impl TokenProvider for StaticToken {
    fn token(&self) -> Result<Option<String>> {
        Ok(self.0.clone())
    }
}

/// Authenticated JSON access to the backend.
pub trait Backend: Send + Sync {
    fn fetch_resource(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError>;

    fn upload_file(&self, path: &str, form: multipart::Form) -> Result<Value, ApiError>;

    fn base_url(&self) -> &Url;
}

#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub base_url: Option<String>,
    pub user_agent: String,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct ApiClient {
    http: HttpClient,
    base_url: Url,
    user_agent: String,
    tokens: Arc<dyn TokenProvider>,
}

impl ApiClient {
    pub fn new(tokens: Arc<dyn TokenProvider>, config: ClientConfig) -> Result<Self> {
        let base = config
            .base_url
            .filter(|b| !b.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let mut base_url = Url::parse(&base).with_context(|| format!("api: parse base url {base}"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let user_agent = if config.user_agent.trim().is_empty() {
            format!("postdeck/{}", crate::VERSION)
        } else {
            config.user_agent
        };
        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()
                .context("api: build http client")?,
        };

        Ok(Self {
            http,
            base_url,
            user_agent,
            tokens,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| ApiError::Transport(format!("invalid path {path}: {err}")))
    }

    fn authorized(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let token = self
            .tokens
            .token()
            .map_err(|err| ApiError::Transport(format!("read session: {err:#}")))?
            .filter(|t| !t.is_empty())
            .ok_or(ApiError::Unauthenticated)?;
        let url = self.url(path)?;
        Ok(self
            .http
            .request(method, url)
            .header(USER_AGENT, self.user_agent.clone())
            .header(AUTHORIZATION, format!("Bearer {}", token)))
    }

    fn send(&self, req: RequestBuilder, path: &str) -> Result<Value, ApiError> {
        let resp = req
            .send()
            .map_err(|err| ApiError::Transport(err.to_string()))?;
        let status = resp.status();
        tracing::debug!(path, status = status.as_u16(), "api response");
        if status.is_success() {
            read_json(resp)
        } else {
            let body = resp.text().unwrap_or_default();
            Err(status_error(status.as_u16(), &body))
        }
    }
}

impl Backend for ApiClient {
    fn fetch_resource(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let mut req = self.authorized(method, path)?;
        if let Some(body) = body {
            req = req.json(body);
        }
        self.send(req, path)
    }

    fn upload_file(&self, path: &str, form: multipart::Form) -> Result<Value, ApiError> {
        let req = self.authorized(Method::POST, path)?.multipart(form);
        self.send(req, path)
    }

    fn base_url(&self) -> &Url {
        &self.base_url
    }
}

fn read_json(resp: Response) -> Result<Value, ApiError> {
    let text = resp
        .text()
        .map_err(|err| ApiError::Transport(err.to_string()))?;
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&text).map_err(|err| ApiError::Decode(err.to_string()))
}

fn status_error(status: u16, body: &str) -> ApiError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|payload| error_message(&payload))
        .unwrap_or_else(|| format!("request failed with status {}", status));
    ApiError::Status { status, message }
}

fn error_message(payload: &Value) -> Option<String> {
    ["error", "detail", "message"].iter().find_map(|key| {
        match payload.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Object(inner) => inner
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string),
            Value::Null => None,
            other => Some(other.to_string()),
        }
    })
}

pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|err| ApiError::Decode(err.to_string()))
}
