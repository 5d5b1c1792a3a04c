//! HTTP control-plane client.
//!
//! Speaks a small REST protocol:
//!
//! | Call     | Request                                   |
//! |----------|-------------------------------------------|
//! | schemas  | `GET /schemas`                            |
//! | create   | `POST /resources/{type}`                  |
//! | read     | `GET /resources/{type}/{id}`              |
//! | update   | `PUT /resources/{type}/{id}`              |
//! | delete   | `DELETE /resources/{type}/{id}`           |
//! | status   | `GET /resources/{type}/{id}/status`       |
//!
//! Retries are not done here; the executor owns the retry policy.

use super::{Provider, RemoteResource, RemoteStatus, ResourceRequest, SchemaRegistry, TypeSchema};
use crate::error::{FatalKind, ProviderError, ProviderResult, Result, TransientKind};
use crate::graph::Properties;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, trace};

/// HTTP provider.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    base_url: String,
    /// Bearer token.
    token: Option<String>,
    /// Schemas fetched with `discover_schemas`.
    schemas: SchemaRegistry,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    state: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    outputs: Properties,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

impl HttpProvider {
    /// Creates a client for the control plane at `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
            token,
            schemas: SchemaRegistry::new(),
        })
    }

    /// Fetches type schemas from the control plane.
    ///
    /// A control plane without a `/schemas` endpoint yields no schemas.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the body is malformed.
    pub async fn discover_schemas(&mut self) -> ProviderResult<usize> {
        let response = self.send(self.client.get(self.url("schemas"))).await;
        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(0),
            Err(e) => return Err(e),
        };

        let schemas: HashMap<String, TypeSchema> = Self::json(response).await?;
        let count = schemas.len();
        self.schemas.merge(schemas);
        debug!("Discovered {count} type schemas");
        Ok(count)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn resource_url(resource_type: &str, id: &str) -> String {
        format!("resources/{resource_type}/{id}")
    }

    /// Sends a request and maps non-success statuses onto `ProviderError`.
    async fn send(&self, builder: RequestBuilder) -> ProviderResult<Response> {
        let builder = builder.header(header::ACCEPT, "application/json");
        let builder = match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };

        let response = builder
            .send()
            .await
            .map_err(|e| ProviderError::network(format!("Request failed: {e}")))?;

        let status = response.status();
        trace!("{} {}", status.as_u16(), response.url());

        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok());
        let path = response.url().path().to_string();
        let body = response.text().await.unwrap_or_default();

        Err(classify(status, retry_after, &path, &body))
    }

    async fn json<T: for<'de> Deserialize<'de>>(response: Response) -> ProviderResult<T> {
        response.json().await.map_err(|e| {
            ProviderError::fatal(
                FatalKind::InvalidResponse,
                format!("Failed to parse response: {e}"),
            )
        })
    }
}

/// Maps an error response onto the provider error taxonomy.
fn classify(status: StatusCode, retry_after: Option<u64>, path: &str, body: &str) -> ProviderError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|b| b.message.clone())
        .unwrap_or_else(|| body.trim().to_string());
    let message = if message.is_empty() {
        status.to_string()
    } else {
        message
    };
    let mentions_quota = parsed
        .as_ref()
        .and_then(|b| b.code.as_deref())
        .is_some_and(|c| c.eq_ignore_ascii_case("quota_exceeded"))
        || message.to_ascii_lowercase().contains("quota");

    match status.as_u16() {
        429 => ProviderError::Transient {
            kind: TransientKind::RateLimited,
            message,
            retry_after_secs: retry_after,
        },
        409 => ProviderError::Transient {
            kind: TransientKind::Consistency,
            message,
            retry_after_secs: retry_after,
        },
        500..=599 => ProviderError::Transient {
            kind: TransientKind::Unavailable,
            message,
            retry_after_secs: retry_after,
        },
        401 | 403 => ProviderError::fatal(FatalKind::Authorization, message),
        402 => ProviderError::fatal(FatalKind::Quota, message),
        400 | 422 if mentions_quota => ProviderError::fatal(FatalKind::Quota, message),
        400 | 422 => ProviderError::fatal(FatalKind::Validation, message),
        404 => {
            let mut segments = path.trim_start_matches('/').split('/').skip(1);
            let resource_type = segments.next().unwrap_or_default().to_string();
            let id = segments.next().unwrap_or_default().to_string();
            ProviderError::NotFound { resource_type, id }
        }
        code => ProviderError::fatal(
            FatalKind::InvalidResponse,
            format!("unexpected status {code}: {message}"),
        ),
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn name(&self) -> &str {
        &self.base_url
    }

    fn schemas(&self) -> SchemaRegistry {
        self.schemas.clone()
    }

    async fn create(&self, request: &ResourceRequest) -> ProviderResult<RemoteResource> {
        debug!("POST {} ({})", request.resource_type, request.name);
        let url = self.url(&format!("resources/{}", request.resource_type));
        let response = self.send(self.client.post(url).json(request)).await?;
        Self::json(response).await
    }

    async fn read(&self, resource_type: &str, id: &str) -> ProviderResult<Option<RemoteResource>> {
        let url = self.url(&Self::resource_url(resource_type, id));
        match self.send(self.client.get(url)).await {
            Ok(response) => Self::json(response).await.map(Some),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update(&self, id: &str, request: &ResourceRequest) -> ProviderResult<RemoteResource> {
        debug!("PUT {} {id} ({})", request.resource_type, request.name);
        let url = self.url(&Self::resource_url(&request.resource_type, id));
        let response = self.send(self.client.put(url).json(request)).await?;
        Self::json(response).await
    }

    async fn delete(&self, resource_type: &str, id: &str) -> ProviderResult<()> {
        debug!("DELETE {resource_type} {id}");
        let url = self.url(&Self::resource_url(resource_type, id));
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn status(&self, resource_type: &str, id: &str) -> ProviderResult<RemoteStatus> {
        let url = self.url(&format!("{}/status", Self::resource_url(resource_type, id)));
        let response = self.send(self.client.get(url)).await?;
        let body: StatusBody = Self::json(response).await?;

        match body.state.to_ascii_lowercase().as_str() {
            "pending" => Ok(RemoteStatus::Pending),
            "stable" => Ok(RemoteStatus::Stable {
                outputs: body.outputs,
            }),
            "failed" => Ok(RemoteStatus::Failed {
                message: body
                    .message
                    .unwrap_or_else(|| String::from("no reason given")),
            }),
            other => Err(ProviderError::fatal(
                FatalKind::InvalidResponse,
                format!("unknown status '{other}'"),
            )),
        }
    }
}
