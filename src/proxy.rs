//! Request proxy: the handler a host server calls once per inbound request.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use axum::http::HeaderMap;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::bundler::Bundler;
use crate::compiler;
use crate::config::SandboxConfig;
use crate::entrypoint::EntrypointDescriptor;
use crate::error::{EdgeError, Fatal};
use crate::lifecycle;
use crate::sandbox::{self, SandboxHandle};

/// Marks a response produced by the harness's error path.
pub const FAILURE_HEADER: &str = "x-edge-failed";
pub const FAILURE_HEADER_VALUE: &str = "edge-wrapper";

/// One header's value(s), as they appear in the wire payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValues {
    One(String),
    Many(Vec<String>),
}

/// What the host hands the proxy. The body is drained on use.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: Option<String>,
    pub url: Option<String>,
    pub headers: BTreeMap<String, HeaderValues>,
    pub body: Body,
}

impl InboundRequest {
    /// Convert an http request; `url` becomes the path and query.
    pub fn from_http(request: axum::extract::Request) -> Self {
        let (parts, body) = request.into_parts();
        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.to_string());
        Self {
            method: Some(parts.method.as_str().to_string()),
            url: Some(url),
            headers: group_headers(&parts.headers),
            body,
        }
    }
}

/// Group repeated header names; non-UTF-8 values are decoded lossily.
pub fn group_headers(headers: &HeaderMap) -> BTreeMap<String, HeaderValues> {
    let mut grouped = BTreeMap::new();
    for name in headers.keys() {
        let mut values: Vec<String> = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        let entry = if values.len() == 1 {
            HeaderValues::One(values.remove(0))
        } else {
            HeaderValues::Many(values)
        };
        grouped.insert(name.as_str().to_string(), entry);
    }
    grouped
}

/// Wire payload posted to the sandbox endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct SerializedRequest {
    pub url: Option<String>,
    pub method: Option<String>,
    pub headers: BTreeMap<String, HeaderValues>,
    pub body: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Utf8,
}

/// The response shape returned to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: String,
    pub encoding: Encoding,
}

impl axum::response::IntoResponse for ProxyResponse {
    fn into_response(self) -> axum::response::Response {
        let mut response = axum::response::Response::new(Body::from(self.body));
        *response.status_mut() = axum::http::StatusCode::from_u16(self.status_code)
            .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
        let headers = response.headers_mut();
        for (name, values) in self.headers {
            // Recomputed for the re-encoded body.
            if name == "content-length" || name == "transfer-encoding" {
                continue;
            }
            let Ok(name) = axum::http::HeaderName::from_bytes(name.as_bytes()) else {
                continue;
            };
            for value in values {
                if let Ok(value) = axum::http::HeaderValue::from_str(&value) {
                    headers.append(name.clone(), value);
                }
            }
        }
        response
    }
}

/// Compiled entrypoint plus its running sandbox, if startup succeeded.
#[derive(Debug)]
pub struct EdgeHandler {
    entrypoint: EntrypointDescriptor,
    sandbox: Option<SandboxHandle>,
    client: reqwest::Client,
}

impl EdgeHandler {
    /// Compile the entrypoint and start its sandbox.
    ///
    /// Compile and startup failures are logged and leave the handler without
    /// a sandbox; the first request through it then ends the process.
    pub async fn create(
        entrypoint: EntrypointDescriptor,
        config: &SandboxConfig,
        bundler: Arc<dyn Bundler>,
    ) -> Result<Self, EdgeError> {
        let program = compiler::compile(
            bundler,
            &entrypoint.full_path,
            &entrypoint.relative_path,
            entrypoint.is_middleware,
        )
        .await;
        let sandbox = sandbox::start(program, config, &entrypoint.relative_path).await;
        Self::new(entrypoint, sandbox)
    }

    pub(crate) fn new(
        entrypoint: EntrypointDescriptor,
        sandbox: Option<SandboxHandle>,
    ) -> Result<Self, EdgeError> {
        // The sandbox endpoint is always on loopback.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| EdgeError::Transport(e.to_string()))?;
        Ok(Self {
            entrypoint,
            sandbox,
            client,
        })
    }

    pub fn entrypoint(&self) -> &EntrypointDescriptor {
        &self.entrypoint
    }

    pub fn sandbox(&self) -> Option<&SandboxHandle> {
        self.sandbox.as_ref()
    }

    /// Proxy one request, ending the process on a fatal outcome.
    ///
    /// Transport and request errors are returned; fatal conditions are logged
    /// and exit with status 1 after the exit hooks have run.
    pub async fn handle(&self, request: InboundRequest) -> Result<ProxyResponse, EdgeError> {
        match self.proxy(request).await {
            Err(EdgeError::Fatal(fatal)) => {
                tracing::error!("{}", fatal);
                lifecycle::terminate(fatal.exit_code())
            }
            other => other,
        }
    }

    /// Proxy one request, reporting fatal outcomes as [`EdgeError::Fatal`].
    pub async fn proxy(&self, request: InboundRequest) -> Result<ProxyResponse, EdgeError> {
        let sandbox = self.sandbox.as_ref().ok_or_else(|| Fatal::SandboxUnavailable {
            relative_path: self.entrypoint.relative_path.clone(),
        })?;

        let body = axum::body::to_bytes(request.body, usize::MAX)
            .await
            .map_err(|e| EdgeError::InvalidRequest(e.to_string()))?;
        let payload = SerializedRequest {
            url: request.url,
            method: request.method,
            headers: request.headers,
            body: base64::engine::general_purpose::STANDARD.encode(&body),
        };
        let payload =
            serde_json::to_vec(&payload).map_err(|e| EdgeError::InvalidRequest(e.to_string()))?;

        let response = self
            .client
            .post(sandbox.url())
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| EdgeError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in response.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let body = response
            .text()
            .await
            .map_err(|e| EdgeError::Transport(e.to_string()))?;

        let user_failed = headers
            .get(FAILURE_HEADER)
            .is_some_and(|values| values.iter().any(|v| v == FAILURE_HEADER_VALUE));
        if user_failed && status >= 500 {
            return Err(Fatal::UserCode {
                route: format!("/{}", self.entrypoint.route_label().trim_start_matches('/')),
                relative_path: self.entrypoint.relative_path.clone(),
                status,
                body,
            }
            .into());
        }

        Ok(ProxyResponse {
            status_code: status,
            headers,
            body,
            encoding: Encoding::Utf8,
        })
    }

    /// Close the sandbox now instead of at process exit. Idempotent.
    pub fn shutdown(&self) -> bool {
        self.sandbox.as_ref().is_some_and(SandboxHandle::close)
    }
}
