use std::fmt;
use std::time::{Duration, SystemTime};

use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::entity::EntityKind;

const DEFAULT_BASE_URL: &str = "http://localhost:3000";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayOp {
    Create,
    Update,
    Delete,
    FetchAll,
}

impl GatewayOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayOp::Create => "create",
            GatewayOp::Update => "update",
            GatewayOp::Delete => "delete",
            GatewayOp::FetchAll => "fetch_all",
        }
    }
}

impl fmt::Display for GatewayOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("base url cannot carry path segments")]
    CannotBeABase,
    #[error("{op} {kind}: request failed: {source}")]
    Request {
        kind: EntityKind,
        op: GatewayOp,
        #[source]
        source: reqwest::Error,
    },
    #[error("{op} {kind}: api returned {status}: {body}")]
    Api {
        kind: EntityKind,
        op: GatewayOp,
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },
    #[error("{op} {kind}: invalid json body: {source}")]
    Decode {
        kind: EntityKind,
        op: GatewayOp,
        #[source]
        source: serde_json::Error,
    },
    #[error("{op} {kind}: response is not an entity collection")]
    UnexpectedPayload { kind: EntityKind, op: GatewayOp },
    #[error("health probe failed: {0}")]
    Probe(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// HTTP gateway for the TaskMaster entity collections. One method call is one request.
#[derive(Clone)]
pub struct TaskmasterClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
}

impl TaskmasterClient {
    pub fn new(token: impl Into<String>) -> Result<Self, GatewayError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, GatewayError> {
        let token = token.into();
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: (!token.is_empty()).then_some(token),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Client without a session token, for servers that scope by cookie or not at all.
    pub fn anonymous(base_url: &str) -> Result<Self, GatewayError> {
        Self::with_base_url(base_url, String::new())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `POST /api/{kind}s`. The idempotency key lets a server drop a replayed create.
    pub async fn create(
        &self,
        kind: EntityKind,
        data: &Value,
        idempotency_key: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let url = self.collection_url(kind)?;
        let mut request = self.request(Method::POST, url).json(data);
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        let response = send(request, kind, GatewayOp::Create).await?;
        let body = Self::handle_response(response, kind, GatewayOp::Create).await?;
        Ok(unwrap_entity(kind, body))
    }

    /// `PUT /api/{kind}s/{id}`.
    pub async fn update(
        &self,
        kind: EntityKind,
        id: &str,
        data: &Value,
    ) -> Result<Value, GatewayError> {
        let url = self.item_url(kind, id)?;
        let request = self.request(Method::PUT, url).json(data);
        let response = send(request, kind, GatewayOp::Update).await?;
        let body = Self::handle_response(response, kind, GatewayOp::Update).await?;
        Ok(unwrap_entity(kind, body))
    }

    /// `DELETE /api/{kind}s/{id}`. A 404 means the entity is already gone and counts as success.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), GatewayError> {
        let url = self.item_url(kind, id)?;
        let response = send(self.request(Method::DELETE, url), kind, GatewayOp::Delete).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::handle_response(response, kind, GatewayOp::Delete).await?;
        Ok(())
    }

    /// `GET /api/{kind}s`.
    pub async fn fetch_all(&self, kind: EntityKind) -> Result<Vec<Value>, GatewayError> {
        let url = self.collection_url(kind)?;
        let response = send(self.request(Method::GET, url), kind, GatewayOp::FetchAll).await?;
        let body = Self::handle_response(response, kind, GatewayOp::FetchAll).await?;
        extract_collection(kind, body).ok_or(GatewayError::UnexpectedPayload {
            kind,
            op: GatewayOp::FetchAll,
        })
    }

    /// `GET /api/health`. Any HTTP answer proves connectivity, so the status is returned as-is.
    pub async fn health(&self) -> Result<StatusCode, GatewayError> {
        let url = self.api_url(&["health"])?;
        let response = self.request(Method::GET, url).send().await?;
        Ok(response.status())
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let request = self.http.request(method, url).timeout(self.timeout);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    // Appends under the base path, so `https://host/app` serves `/app/api/...`.
    fn api_url(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::CannotBeABase)?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    fn collection_url(&self, kind: EntityKind) -> Result<Url, GatewayError> {
        self.api_url(&[kind.collection()])
    }

    fn item_url(&self, kind: EntityKind, id: &str) -> Result<Url, GatewayError> {
        self.api_url(&[kind.collection(), id])
    }

    async fn handle_response(
        response: reqwest::Response,
        kind: EntityKind,
        op: GatewayOp,
    ) -> Result<Value, GatewayError> {
        let status = response.status();
        if !status.is_success() {
            let retry_after = parse_retry_after(response.headers().get(RETRY_AFTER));
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Api {
                kind,
                op,
                status,
                body,
                retry_after,
            });
        }
        let text = response
            .text()
            .await
            .map_err(|source| GatewayError::Request { kind, op, source })?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|source| GatewayError::Decode { kind, op, source })
    }
}

async fn send(
    request: RequestBuilder,
    kind: EntityKind,
    op: GatewayOp,
) -> Result<reqwest::Response, GatewayError> {
    request
        .send()
        .await
        .map_err(|source| GatewayError::Request { kind, op, source })
}

impl GatewayError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            GatewayError::Api { status, .. } => Some(classify_api_status(*status)),
            GatewayError::Request { .. } | GatewayError::Probe(_) => Some(ApiErrorClass::Transient),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn entity_kind(&self) -> Option<EntityKind> {
        match self {
            GatewayError::Request { kind, .. }
            | GatewayError::Api { kind, .. }
            | GatewayError::Decode { kind, .. }
            | GatewayError::UnexpectedPayload { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            GatewayError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

fn parse_retry_after(value: Option<&reqwest::header::HeaderValue>) -> Option<Duration> {
    let value = value?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or_default())
}

// Route handlers answer either with the bare entity or `{ "<kind>": {...} }`.
fn unwrap_entity(kind: EntityKind, body: Value) -> Value {
    match body {
        Value::Object(mut map) if !map.contains_key("id") => match map.remove(kind.as_str()) {
            Some(inner @ Value::Object(_)) => inner,
            Some(other) => {
                map.insert(kind.as_str().to_string(), other);
                Value::Object(map)
            }
            None => Value::Object(map),
        },
        other => other,
    }
}

fn extract_collection(kind: EntityKind, body: Value) -> Option<Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(mut map) => [kind.collection(), "data", "items"]
            .into_iter()
            .find_map(|key| match map.remove(key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            }),
        _ => None,
    }
}
