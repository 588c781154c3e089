//! Sandbox host: one isolate per entrypoint, reachable over a local endpoint.
//!
//! The isolate lives on its own OS thread with a single-threaded tokio
//! runtime. A small axum server on an ephemeral port accepts the proxy's
//! POSTs and hands each body to the isolate; invocations run one at a time.

use std::net::SocketAddr;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use base64::Engine;
use tokio::sync::{mpsc, oneshot};

use crate::compiler::CompiledProgram;
use crate::config::{EnvSnapshot, SandboxConfig};
use crate::error::EdgeError;
use crate::lifecycle::{self, ShutdownHook};
use crate::runtime::{self, HarnessReply};
use crate::wasm::WasmBindings;

/// Headers the endpoint recomputes itself.
const SKIPPED_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

type Invocation = (String, oneshot::Sender<Result<HarnessReply, String>>);

/// A running sandbox. Cloning shares the same isolate.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    url: String,
    hook: ShutdownHook,
}

impl SandboxHandle {
    pub(crate) fn from_parts(url: impl Into<String>, hook: ShutdownHook) -> Self {
        Self {
            url: url.into(),
            hook,
        }
    }

    /// Base URL of the local endpoint, e.g. `http://127.0.0.1:41234/`.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn shutdown_hook(&self) -> &ShutdownHook {
        &self.hook
    }

    /// Stop the endpoint and let the isolate wind down. Idempotent.
    pub fn close(&self) -> bool {
        self.hook.close()
    }
}

/// Start a sandbox for `program`.
///
/// Absent program in, absent handle out. Startup failures are logged and
/// also yield `None`; the handle's shutdown hook is registered for process
/// exit before it is returned.
pub async fn start(
    program: Option<CompiledProgram>,
    config: &SandboxConfig,
    relative_path: &str,
) -> Option<SandboxHandle> {
    let program = program?;
    match spawn(program, config.clone(), relative_path).await {
        Ok(handle) => {
            tracing::debug!(entrypoint = relative_path, url = handle.url(), "sandbox started");
            Some(handle)
        }
        Err(err) => {
            tracing::error!("{}", err);
            None
        }
    }
}

async fn spawn(
    program: CompiledProgram,
    config: SandboxConfig,
    relative_path: &str,
) -> Result<SandboxHandle, EdgeError> {
    let startup_error = |message: String| EdgeError::Startup {
        path: relative_path.to_string(),
        message,
    };

    let wasm = program
        .wasm_assets
        .resolve_all()
        .map_err(|e| startup_error(e.to_string()))?;
    let env = EnvSnapshot::capture();
    let (hook, shutdown_rx) = ShutdownHook::new(format!("sandbox {}", relative_path));
    let (ready_tx, ready_rx) = oneshot::channel();

    let boot = IsolateBoot {
        script: program.script,
        label: relative_path.to_string(),
        env,
        wasm,
        config,
    };
    std::thread::Builder::new()
        .name(format!("edge-sandbox:{}", relative_path))
        .spawn(move || run_isolate_thread(boot, shutdown_rx, ready_tx))
        .map_err(|e| startup_error(e.to_string()))?;

    let addr = ready_rx
        .await
        .map_err(|_| startup_error("sandbox thread exited during startup".to_string()))?
        .map_err(startup_error)?;

    lifecycle::register_exit_hook(hook.clone());
    Ok(SandboxHandle::from_parts(format!("http://{}/", addr), hook))
}

struct IsolateBoot {
    script: String,
    label: String,
    env: EnvSnapshot,
    wasm: WasmBindings,
    config: SandboxConfig,
}

fn run_isolate_thread(
    boot: IsolateBoot,
    shutdown_rx: oneshot::Receiver<()>,
    ready_tx: oneshot::Sender<Result<SocketAddr, String>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("Failed to build runtime: {}", e)));
            return;
        }
    };

    let local = tokio::task::LocalSet::new();
    local.block_on(&rt, serve_isolate(boot, shutdown_rx, ready_tx));
}

async fn serve_isolate(
    boot: IsolateBoot,
    shutdown_rx: oneshot::Receiver<()>,
    ready_tx: oneshot::Sender<Result<SocketAddr, String>>,
) {
    let IsolateBoot {
        script,
        label,
        env,
        wasm,
        config,
    } = boot;

    let mut js = match runtime::create_runtime(&config).and_then(|mut js| {
        runtime::extend_context(&mut js, &label, env, wasm)?;
        runtime::load_program(&mut js, script)?;
        Ok(js)
    }) {
        Ok(js) => js,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };

    let listener = match tokio::net::TcpListener::bind((config.bind_host, 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("Failed to bind endpoint: {}", e)));
            return;
        }
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<Invocation>(64);
    let app = Router::new()
        .route("/", post(invoke_endpoint))
        .with_state(tx);

    let server_label = label.clone();
    tokio::spawn(async move {
        let shutdown = async {
            let _ = shutdown_rx.await;
        };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!("[{}] sandbox endpoint failed: {}", server_label, e);
        }
    });

    if ready_tx.send(Ok(addr)).is_err() {
        return;
    }

    // Ends once the server has shut down and dropped every sender.
    while let Some((payload, reply_tx)) = rx.recv().await {
        let reply = runtime::invoke(&mut js, &payload)
            .await
            .map_err(|e| e.to_string());
        if let Err(ref message) = reply {
            tracing::error!("[{}] invocation failed: {}", label, message);
        }
        let _ = reply_tx.send(reply);
    }
    tracing::debug!("[{}] isolate stopped", label);
}

async fn invoke_endpoint(State(tx): State<mpsc::Sender<Invocation>>, body: Bytes) -> Response {
    let payload = match String::from_utf8(body.to_vec()) {
        Ok(payload) => payload,
        Err(_) => return (StatusCode::BAD_REQUEST, "payload is not UTF-8").into_response(),
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if tx.send((payload, reply_tx)).await.is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "sandbox stopped").into_response();
    }

    match reply_rx.await {
        Ok(Ok(reply)) => reply_to_response(reply),
        Ok(Err(message)) => (StatusCode::INTERNAL_SERVER_ERROR, message).into_response(),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "sandbox stopped").into_response(),
    }
}

fn reply_to_response(reply: HarnessReply) -> Response {
    let body = match base64::engine::general_purpose::STANDARD.decode(&reply.body) {
        Ok(body) => body,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Malformed harness body: {}", e),
            )
                .into_response()
        }
    };

    let mut response = Response::new(Body::from(body));
    *response.status_mut() =
        StatusCode::from_u16(reply.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let headers = response.headers_mut();
    for (name, value) in reply.headers {
        if SKIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => tracing::warn!("dropping invalid response header {:?}", name),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::wrap_bundle;
    use crate::wasm::WasmAssetSet;

    fn program(bundle: &str) -> CompiledProgram {
        CompiledProgram {
            script: wrap_bundle(bundle, false, "api/test.js").unwrap(),
            wasm_assets: WasmAssetSet::default(),
        }
    }

    fn loopback_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    fn payload(body: &str) -> String {
        serde_json::json!({
            "url": "/api/test",
            "method": "POST",
            "headers": { "host": "localhost" },
            "body": base64::engine::general_purpose::STANDARD.encode(body),
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_absent_program_yields_no_handle() {
        assert!(start(None, &SandboxConfig::default(), "api/none.js")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_endpoint_round_trip() {
        let handle = start(
            Some(program(
                "module.exports = { default: async (req) => new Response('got ' + await req.text(), { status: 201, headers: [['set-cookie', 'a=1'], ['set-cookie', 'b=2']] }) };",
            )),
            &SandboxConfig::default(),
            "api/test.js",
        )
        .await
        .expect("sandbox");
        assert!(handle.url().starts_with("http://127.0.0.1:"));

        let response = loopback_client()
            .post(handle.url())
            .body(payload("ping"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 201);
        let cookies: Vec<_> = response
            .headers()
            .get_all("set-cookie")
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(response.text().await.unwrap(), "got ping");

        assert!(handle.close());
        assert!(!handle.close());
    }

    #[tokio::test]
    async fn test_startup_failure_yields_no_handle() {
        let broken = CompiledProgram {
            script: "this is not javascript (".to_string(),
            wasm_assets: WasmAssetSet::default(),
        };
        assert!(start(Some(broken), &SandboxConfig::default(), "api/broken.js")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_wasm_module_bound_as_global() {
        let dir = tempfile::tempdir().unwrap();
        let wasm_path = dir.path().join("empty.wasm");
        std::fs::write(&wasm_path, b"\0asm\x01\0\0\0").unwrap();

        let mut assets = WasmAssetSet::default();
        let id = assets.declare(&wasm_path);
        let bundle = format!(
            "module.exports = {{ default: () => new Response(String(globalThis[{:?}] instanceof WebAssembly.Module)) }};",
            id
        );
        let program = CompiledProgram {
            script: wrap_bundle(&bundle, false, "api/wasm.js").unwrap(),
            wasm_assets: assets,
        };

        let handle = start(Some(program), &SandboxConfig::default(), "api/wasm.js")
            .await
            .expect("sandbox");
        let response = loopback_client()
            .post(handle.url())
            .body(payload(""))
            .send()
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "true");
        handle.close();
    }

    #[tokio::test]
    async fn test_missing_wasm_file_fails_startup() {
        let mut assets = WasmAssetSet::default();
        assets.declare(std::path::Path::new("/definitely/not/here.wasm"));
        let program = CompiledProgram {
            script: wrap_bundle("module.exports = {};", false, "api/x.js").unwrap(),
            wasm_assets: assets,
        };
        assert!(start(Some(program), &SandboxConfig::default(), "api/x.js")
            .await
            .is_none());
    }
}
