//! Cluster client for a Kubernetes-style REST API.
//!
//! Resources live under `/apis/{group}/{version}/namespaces/{ns}/{plural}`.
//! The bearer token is resolved from the fabric's credential reference:
//!
//! - `env:NAME` reads the environment variable `NAME`
//! - `file:/path` reads the file at `/path`
//! - `token:<value>` uses the value as is
//!
//! An empty reference connects anonymously.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use tracing::debug;

use super::{ClusterClient, ClusterConnector, ClusterError};
use crate::fabric::ClusterCredentials;
use crate::resource::{ResourceKey, ResourceKind, ResourceSpec};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connector creating reqwest-backed sessions.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    request_timeout: Duration,
    accept_invalid_certs: bool,
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            accept_invalid_certs: false,
        }
    }
}

impl HttpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Skip certificate verification (lab clusters with self-signed certs).
    pub fn with_insecure_tls(mut self, insecure: bool) -> Self {
        self.accept_invalid_certs = insecure;
        self
    }
}

/// Resolve a credential reference into a bearer token.
pub async fn resolve_token(
    credentials: &ClusterCredentials,
) -> Result<Option<String>, ClusterError> {
    if credentials.is_empty() {
        return Ok(None);
    }
    let reference = credentials.reference().trim();
    let token = match reference.split_once(':') {
        Some(("env", name)) => std::env::var(name).map_err(|_| {
            ClusterError::InvalidConfig(format!("credential variable {} is not set", name))
        })?,
        Some(("file", path)) => tokio::fs::read_to_string(path).await.map_err(|e| {
            ClusterError::InvalidConfig(format!("cannot read credential file {}: {}", path, e))
        })?,
        Some(("token", value)) => value.to_string(),
        _ => {
            return Err(ClusterError::InvalidConfig(format!(
                "unsupported credential reference {:?}",
                credentials
            )));
        }
    };
    let token = token.trim().to_string();
    if token.is_empty() {
        return Err(ClusterError::InvalidConfig(format!(
            "credential {:?} resolved to an empty token",
            credentials
        )));
    }
    Ok(Some(token))
}

fn parse_endpoint(endpoint: &str) -> Result<Url, ClusterError> {
    let url = Url::parse(endpoint.trim())
        .map_err(|e| ClusterError::InvalidConfig(format!("endpoint {}: {}", endpoint, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ClusterError::InvalidConfig(format!(
            "endpoint {} has unsupported scheme {}",
            endpoint, other
        ))),
    }
}

fn group_path(base: &Url, kind: ResourceKind) -> String {
    format!(
        "{}/apis/{}/{}",
        base.as_str().trim_end_matches('/'),
        kind.api_group(),
        kind.api_version()
    )
}

fn collection_path(base: &Url, kind: ResourceKind, namespace: &str) -> String {
    format!(
        "{}/namespaces/{}/{}",
        group_path(base, kind),
        namespace,
        kind.plural()
    )
}

fn item_path(base: &Url, key: &ResourceKey) -> String {
    format!(
        "{}/{}",
        collection_path(base, key.kind, &key.namespace),
        key.name
    )
}

fn transport_error(e: reqwest::Error) -> ClusterError {
    if e.is_timeout() {
        return ClusterError::Timeout(e.to_string());
    }
    let mut detail = e.to_string();
    let mut source = std::error::Error::source(&e);
    while let Some(inner) = source {
        detail = format!("{}: {}", detail, inner);
        source = inner.source();
    }
    let lowered = detail.to_lowercase();
    if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("handshake") {
        ClusterError::Tls(detail)
    } else {
        ClusterError::Unreachable(detail)
    }
}

/// Map a non-success status onto a classified error.
pub fn status_error(status: StatusCode, message: String) -> ClusterError {
    match status {
        StatusCode::UNAUTHORIZED => ClusterError::Unauthorized(message),
        StatusCode::FORBIDDEN => ClusterError::Forbidden(message),
        StatusCode::NOT_FOUND => ClusterError::NotFound(message),
        StatusCode::CONFLICT => ClusterError::Conflict(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ClusterError::Timeout(message),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
            ClusterError::Unreachable(message)
        }
        other => ClusterError::Rejected {
            status: other.as_u16(),
            message,
        },
    }
}

async fn check(response: Response) -> Result<Response, ClusterError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or(body);
    Err(status_error(status, message))
}

#[async_trait]
impl ClusterConnector for HttpConnector {
    async fn connect(
        &self,
        endpoint: &str,
        credentials: &ClusterCredentials,
    ) -> Result<Box<dyn ClusterClient>, ClusterError> {
        let base = parse_endpoint(endpoint)?;
        let token = resolve_token(credentials).await?;
        let client = Client::builder()
            .timeout(self.request_timeout)
            .danger_accept_invalid_certs(self.accept_invalid_certs)
            .build()
            .map_err(|e| ClusterError::InvalidConfig(format!("http client: {}", e)))?;

        let session = HttpClient {
            client,
            base,
            token,
        };
        // Discovery doubles as the reachability and credential check.
        let discovery = group_path(&session.base, ResourceKind::Switch);
        session.send(Method::GET, &discovery, None).await?;
        debug!(endpoint = %endpoint, "Cluster session opened");
        Ok(Box::new(session))
    }
}

struct HttpClient {
    client: Client,
    base: Url,
    token: Option<String>,
}

impl HttpClient {
    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Response, ClusterError> {
        let mut builder = self.request(method, url);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await.map_err(transport_error)?;
        check(response).await
    }

    async fn send_object(
        &self,
        method: Method,
        url: &str,
        body: &Value,
    ) -> Result<ResourceSpec, ClusterError> {
        let response = self.send(method, url, Some(body)).await?;
        let object: Value = response.json().await.map_err(transport_error)?;
        ResourceSpec::from_object(&object).ok_or_else(|| ClusterError::Rejected {
            status: 200,
            message: format!("unexpected object in response from {}", url),
        })
    }
}

#[async_trait]
impl ClusterClient for HttpClient {
    async fn list(&self, kind: ResourceKind) -> Result<Vec<ResourceSpec>, ClusterError> {
        let url = format!("{}/{}", group_path(&self.base, kind), kind.plural());
        let response = self.send(Method::GET, &url, None).await?;
        let body: Value = response.json().await.map_err(transport_error)?;
        Ok(body
            .get("items")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let mut item = item.clone();
                        // list responses omit kind on items
                        if let Some(object) = item.as_object_mut() {
                            object
                                .entry("kind")
                                .or_insert_with(|| Value::String(kind.kind_name().to_string()));
                        }
                        ResourceSpec::from_object(&item)
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(&self, resource: &ResourceSpec) -> Result<ResourceSpec, ClusterError> {
        let url = collection_path(&self.base, resource.key.kind, &resource.key.namespace);
        let mut body = resource.clone();
        body.server = None;
        self.send_object(Method::POST, &url, &body.to_object()).await
    }

    async fn update(&self, resource: &ResourceSpec) -> Result<ResourceSpec, ClusterError> {
        let url = item_path(&self.base, &resource.key);
        self.send_object(Method::PUT, &url, &resource.to_object()).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError> {
        let url = item_path(&self.base, key);
        self.send(Method::DELETE, &url, None).await?;
        Ok(())
    }

    fn release(&self) {
        debug!(endpoint = %self.base, "Cluster session released");
    }
}
