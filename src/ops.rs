//! Shared ops module - used by both build.rs (snapshot) and runtime.rs
//!
//! This module contains all custom ops and the extension! macro definition.
//! It must be importable by both the main crate and the build script, so it
//! only depends on crates listed in both dependency tables.

use base64::Engine;
use deno_core::{op2, OpState};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

// ============================================================================
// Context capabilities
// ============================================================================

/// Values handed to the isolate by the context-extension step.
///
/// Placed in `OpState` before the compiled script runs. The environment is a
/// snapshot taken at sandbox start; WASM bytes are moved out as they are
/// compiled into `WebAssembly.Module` globals.
#[derive(Debug, Default, Clone)]
pub struct SandboxGlobals {
    /// Label used to tag console output (the entrypoint's relative path).
    pub label: String,
    pub env: BTreeMap<String, String>,
    pub wasm: BTreeMap<String, Vec<u8>>,
}

#[op2]
#[serde]
pub fn op_edge_env(state: &mut OpState) -> BTreeMap<String, String> {
    state
        .try_borrow::<SandboxGlobals>()
        .map(|globals| globals.env.clone())
        .unwrap_or_default()
}

#[op2]
#[serde]
pub fn op_edge_wasm_ids(state: &mut OpState) -> Vec<String> {
    state
        .try_borrow::<SandboxGlobals>()
        .map(|globals| globals.wasm.keys().cloned().collect())
        .unwrap_or_default()
}

#[op2]
#[buffer]
pub fn op_edge_wasm_take(
    state: &mut OpState,
    #[string] id: &str,
) -> Result<Vec<u8>, deno_core::error::AnyError> {
    state
        .try_borrow_mut::<SandboxGlobals>()
        .and_then(|globals| globals.wasm.remove(id))
        .ok_or_else(|| anyhow::anyhow!("Unknown or already bound WASM module: {}", id))
}

// ============================================================================
// Console Output
// ============================================================================

fn console_label(state: &OpState) -> &str {
    state
        .try_borrow::<SandboxGlobals>()
        .map(|globals| globals.label.as_str())
        .unwrap_or("sandbox")
}

#[op2(fast)]
pub fn op_console_log(state: &mut OpState, #[string] msg: &str) {
    tracing::info!(target: "edge::console", "[{}] {}", console_label(state), msg.trim_end());
}

#[op2(fast)]
pub fn op_console_warn(state: &mut OpState, #[string] msg: &str) {
    tracing::warn!(target: "edge::console", "[{}] {}", console_label(state), msg.trim_end());
}

#[op2(fast)]
pub fn op_console_error(state: &mut OpState, #[string] msg: &str) {
    tracing::error!(target: "edge::console", "[{}] {}", console_label(state), msg.trim_end());
}

// ============================================================================
// Encoding Ops
// ============================================================================

#[op2]
#[string]
pub fn op_edge_base64_encode(#[buffer] data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

#[op2]
#[buffer]
pub fn op_edge_base64_decode(#[string] data: &str) -> Result<Vec<u8>, deno_core::error::AnyError> {
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| anyhow::anyhow!("Invalid base64: {}", e))
}

// ============================================================================
// Fetch API
// ============================================================================

/// Configuration for fetch allowlist
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Allowed origins (scheme + host + port). `*` allows every origin.
    pub allowed_origins: Vec<String>,
}

impl FetchConfig {
    pub fn is_origin_allowed(&self, url: &url::Url) -> bool {
        if self.allowed_origins.is_empty() {
            return false;
        }
        let origin = url.origin().ascii_serialization();
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || origin == *allowed)
    }
}

/// Request info passed from JS. `body` is base64.
#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<Vec<(String, String)>>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response info returned to JS. `body` is base64.
#[derive(Debug, Serialize)]
pub struct FetchResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub url: String,
    pub body: String,
}

#[op2(async)]
#[serde]
pub async fn op_edge_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    let config = {
        let state_ref = state.borrow();
        state_ref
            .try_borrow::<FetchConfig>()
            .cloned()
            .unwrap_or_default()
    };

    do_fetch(request, config).await
}

/// Internal fetch implementation (can be called recursively for redirects)
async fn do_fetch(
    request: FetchRequest,
    config: FetchConfig,
) -> Result<FetchResponse, deno_core::error::AnyError> {
    use anyhow::anyhow;
    use reqwest::{Client, Method};
    use url::Url;

    let url = Url::parse(&request.url)
        .map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?;

    if !config.is_origin_allowed(&url) {
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not in the allowlist. Allowed: {:?}",
            url.origin().ascii_serialization(),
            config.allowed_origins
        ));
    }

    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let method_name = request.method.as_deref().unwrap_or("GET").to_uppercase();
    let method = Method::from_bytes(method_name.as_bytes())
        .map_err(|_| anyhow!("Unsupported HTTP method: {}", method_name))?;

    let mut req_builder = client.request(method, url.clone());

    if let Some(ref headers) = request.headers {
        for (key, value) in headers {
            req_builder = req_builder.header(key, value);
        }
    }

    if let Some(ref body) = request.body {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(body)
            .map_err(|e| anyhow!("Invalid request body encoding: {}", e))?;
        req_builder = req_builder.body(bytes);
    }

    let response = req_builder
        .send()
        .await
        .map_err(|e| anyhow!("Fetch failed: {}", e))?;

    let status = response.status();
    let final_url = response.url().clone();

    // Only same-origin redirects are followed
    if status.is_redirection() {
        if let Some(location) = response.headers().get("location") {
            let location_str = location
                .to_str()
                .map_err(|_| anyhow!("Invalid redirect location"))?;
            let redirect_url = final_url
                .join(location_str)
                .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;

            if redirect_url.origin() != url.origin() {
                return Err(anyhow!(
                    "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                    redirect_url.origin().ascii_serialization(),
                    url.origin().ascii_serialization()
                ));
            }

            let redirect_request = FetchRequest {
                url: redirect_url.to_string(),
                method: Some("GET".to_string()),
                headers: request.headers.clone(),
                body: None,
            };

            return Box::pin(do_fetch(redirect_request, config)).await;
        }
    }

    let mut headers = Vec::with_capacity(response.headers().len());
    for (key, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.push((key.to_string(), v.to_string()));
        }
    }

    let body = response
        .bytes()
        .await
        .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

    Ok(FetchResponse {
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
        headers,
        url: final_url.to_string(),
        body: base64::engine::general_purpose::STANDARD.encode(&body),
    })
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    edge_runtime,
    ops = [
        op_console_log,
        op_console_warn,
        op_console_error,
        op_edge_env,
        op_edge_wasm_ids,
        op_edge_wasm_take,
        op_edge_base64_encode,
        op_edge_base64_decode,
        op_edge_fetch,
    ],
    esm_entry_point = "ext:edge_runtime/bootstrap.js",
    esm = ["ext:edge_runtime/bootstrap.js" = "src/bootstrap.js"],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_matching() {
        let config = FetchConfig {
            allowed_origins: vec![
                "https://api.example.com".to_string(),
                "http://localhost:3000".to_string(),
            ],
        };

        // Allowed
        assert!(config.is_origin_allowed(&url::Url::parse("https://api.example.com/users").unwrap()));
        assert!(config.is_origin_allowed(&url::Url::parse("http://localhost:3000/api").unwrap()));

        // Not allowed
        assert!(!config.is_origin_allowed(&url::Url::parse("https://evil.com/api").unwrap()));
        assert!(!config.is_origin_allowed(&url::Url::parse("http://api.example.com/users").unwrap())); // http vs https
        assert!(!config.is_origin_allowed(&url::Url::parse("https://api.example.com:8080/").unwrap())); // different port
    }

    #[test]
    fn test_empty_allowlist() {
        let config = FetchConfig {
            allowed_origins: vec![],
        };

        assert!(!config.is_origin_allowed(&url::Url::parse("https://anything.com").unwrap()));
    }

    #[test]
    fn test_wildcard_allowlist() {
        let config = FetchConfig {
            allowed_origins: vec!["*".to_string()],
        };

        assert!(config.is_origin_allowed(&url::Url::parse("https://anything.com/x").unwrap()));
    }

    async fn redirect_server() -> std::net::SocketAddr {
        use axum::response::Redirect;
        use axum::routing::get;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Same port, different host: a different origin.
        let elsewhere = format!("http://localhost:{}/end", addr.port());
        let app = axum::Router::new()
            .route("/same", get(|| async { Redirect::temporary("/end") }))
            .route(
                "/cross",
                get(move || async move { Redirect::temporary(&elsewhere) }),
            )
            .route("/end", get(|| async { "arrived" }));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn get_request(url: String) -> FetchRequest {
        FetchRequest {
            url,
            method: Some("GET".to_string()),
            headers: None,
            body: None,
        }
    }

    fn any_origin() -> FetchConfig {
        FetchConfig {
            allowed_origins: vec!["*".to_string()],
        }
    }

    #[tokio::test]
    async fn test_fetch_follows_same_origin_redirect() {
        let addr = redirect_server().await;
        let response = do_fetch(get_request(format!("http://{}/same", addr)), any_origin())
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.url, format!("http://{}/end", addr));
        let body = base64::engine::general_purpose::STANDARD
            .decode(&response.body)
            .unwrap();
        assert_eq!(body, b"arrived");
    }

    #[tokio::test]
    async fn test_fetch_blocks_cross_origin_redirect() {
        let addr = redirect_server().await;
        let err = do_fetch(get_request(format!("http://{}/cross", addr)), any_origin())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("redirect to different origin"));
    }

    #[tokio::test]
    async fn test_fetch_rejects_origin_outside_allowlist() {
        let addr = redirect_server().await;
        let config = FetchConfig {
            allowed_origins: vec!["https://api.example.com".to_string()],
        };
        let err = do_fetch(get_request(format!("http://{}/end", addr)), config)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not in the allowlist"));
    }
}
