//! Edge Runtime - executes the compiled script in a sandboxed V8 isolate.
//!
//! Provides the web platform subset an edge function expects:
//! - console.log/warn/error (forwarded to tracing)
//! - URL, URLSearchParams, TextEncoder, TextDecoder, atob, btoa
//! - timers, streams, Blob, AbortController, crypto
//! - Headers, Request, Response and an allowlisted fetch()
//! - process.env (read-only snapshot) and WASM module globals
//! - No fs, child processes, or module loading

use crate::config::{EnvSnapshot, SandboxConfig};
use crate::ops::{edge_runtime, FetchConfig, SandboxGlobals};
use crate::wasm::WasmBindings;
use anyhow::{anyhow, Error};
use deno_core::{JsRuntime, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use std::sync::Arc;

static EDGE_SNAPSHOT: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/EDGE_SNAPSHOT.bin"));

/// What the harness hands back for one invocation. `body` is base64.
#[derive(Debug, Deserialize)]
pub struct HarnessReply {
    pub status: u16,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: String,
}

/// Create a sandboxed JS runtime with the edge extensions loaded.
pub fn create_runtime(config: &SandboxConfig) -> Result<JsRuntime, Error> {
    // Configure V8 heap limits if specified
    let create_params = config.max_heap_size.map(|max_bytes| {
        deno_core::v8::Isolate::create_params().heap_limits(0, max_bytes)
    });

    let blob_store = Arc::new(deno_web::BlobStore::default());

    let mut runtime = JsRuntime::new(RuntimeOptions {
        startup_snapshot: Some(EDGE_SNAPSHOT),
        extensions: vec![
            // Same order as the snapshot in build.rs
            deno_webidl::deno_webidl::init_ops(),
            deno_console::deno_console::init_ops(),
            deno_url::deno_url::init_ops(),
            deno_web::deno_web::init_ops::<deno_permissions::PermissionsContainer>(
                blob_store, None,
            ),
            deno_crypto::deno_crypto::init_ops(None),
            edge_runtime::init_ops(),
        ],
        create_params,
        ..Default::default()
    });

    if config.max_heap_size.is_some() {
        runtime.add_near_heap_limit_callback(|current, initial| {
            // Keep the limit; V8 raises an OOM error instead of growing.
            tracing::warn!(
                "Near heap limit: current={}MB, initial={}MB",
                current / (1024 * 1024),
                initial / (1024 * 1024)
            );
            current
        });
    }

    runtime.op_state().borrow_mut().put(FetchConfig {
        allowed_origins: config.allowed_origins.clone(),
    });

    Ok(runtime)
}

/// The context-extension step: module stub, `process.env`, WASM globals.
///
/// Must run before the compiled script, which expects `module` to exist.
pub fn extend_context(
    runtime: &mut JsRuntime,
    label: &str,
    env: EnvSnapshot,
    wasm: WasmBindings,
) -> Result<(), Error> {
    runtime.op_state().borrow_mut().put(SandboxGlobals {
        label: label.to_string(),
        env: env.into_inner(),
        wasm: wasm.into_inner(),
    });

    runtime
        .execute_script("[edge:context]", "globalThis.__edgeExtendContext();")
        .map_err(|e| anyhow!("Context setup failed: {}", e))?;
    Ok(())
}

/// Evaluate the compiled script (bundle + harness).
pub fn load_program(runtime: &mut JsRuntime, script: String) -> Result<(), Error> {
    runtime.execute_script("[edge:program]", script)?;

    let installed = runtime.execute_script(
        "[edge:check]",
        "typeof globalThis.__edgeInvoke === 'function'",
    )?;
    let scope = &mut runtime.handle_scope();
    let local = deno_core::v8::Local::new(scope, &installed);
    if !local.is_true() {
        return Err(anyhow!("Harness did not install an invocation entry point"));
    }
    Ok(())
}

/// Run one request through the harness.
///
/// `payload` is the serialized request JSON exactly as it arrived at the
/// sandbox endpoint.
pub async fn invoke(runtime: &mut JsRuntime, payload: &str) -> Result<HarnessReply, Error> {
    let call = format!(
        "globalThis.__edgeInvoke({})",
        serde_json::to_string(payload)?
    );
    let promise = runtime.execute_script("[edge:invoke]", call)?;

    let resolved = Box::pin(runtime.resolve(promise));
    let value = runtime
        .with_event_loop_promise(resolved, PollEventLoopOptions::default())
        .await?;

    let text = {
        let scope = &mut runtime.handle_scope();
        let local = deno_core::v8::Local::new(scope, &value);
        if !local.is_string() {
            return Err(anyhow!("Harness must resolve to a string"));
        }
        local.to_rust_string_lossy(scope)
    };

    serde_json::from_str(&text).map_err(|e| anyhow!("Malformed harness reply: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::wrap_bundle;

    fn boot(bundle: &str, is_middleware: bool) -> JsRuntime {
        let mut runtime = create_runtime(&SandboxConfig::default()).unwrap();
        let env: EnvSnapshot = [("EDGE_TEST_VAR".to_string(), "visible".to_string())]
            .into_iter()
            .collect();
        extend_context(&mut runtime, "test.js", env, WasmBindings::default()).unwrap();
        let script = wrap_bundle(bundle, is_middleware, "api/test.js").unwrap();
        load_program(&mut runtime, script).unwrap();
        runtime
    }

    fn payload(method: &str, body: &str) -> String {
        use base64::Engine;
        serde_json::json!({
            "url": "/api/test?x=1",
            "method": method,
            "headers": { "host": "localhost:3000" },
            "body": base64::engine::general_purpose::STANDARD.encode(body),
        })
        .to_string()
    }

    fn body_text(reply: &HarnessReply) -> String {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(&reply.body)
            .unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[tokio::test]
    async fn test_default_export_echoes_body() {
        let mut runtime = boot(
            "module.exports = { default: async (req) => new Response(await req.text(), { headers: { 'x-url': req.url } }) };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("POST", "hello")).await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(body_text(&reply), "hello");
        assert!(reply
            .headers
            .contains(&("x-url".to_string(), "http://localhost:3000/api/test?x=1".to_string())));
    }

    #[tokio::test]
    async fn test_constants_and_env_are_visible() {
        let mut runtime = boot(
            "module.exports = { default: () => new Response(JSON.stringify([IS_MIDDLEWARE, ENTRYPOINT_LABEL, process.env.EDGE_TEST_VAR])) };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("GET", "")).await.unwrap();
        assert_eq!(body_text(&reply), r#"[false,"api/test.js","visible"]"#);
    }

    #[tokio::test]
    async fn test_user_error_sets_failure_header() {
        let mut runtime = boot(
            "module.exports = { default: () => { throw new Error('kaboom'); } };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("GET", "")).await.unwrap();
        assert_eq!(reply.status, 500);
        assert_eq!(body_text(&reply), "kaboom");
        assert!(reply.headers.contains(&(
            crate::proxy::FAILURE_HEADER.to_string(),
            crate::proxy::FAILURE_HEADER_VALUE.to_string()
        )));
    }

    #[tokio::test]
    async fn test_middleware_without_response_continues() {
        let mut runtime = boot("module.exports = { default: () => undefined };", true);
        let reply = invoke(&mut runtime, &payload("GET", "")).await.unwrap();
        assert_eq!(reply.status, 200);
        assert!(reply
            .headers
            .contains(&("x-middleware-next".to_string(), "1".to_string())));
    }

    #[tokio::test]
    async fn test_method_exports_dispatch() {
        let mut runtime = boot(
            "module.exports = { GET: () => new Response('got') };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("GET", "")).await.unwrap();
        assert_eq!(body_text(&reply), "got");

        let reply = invoke(&mut runtime, &payload("DELETE", "")).await.unwrap();
        assert_eq!(reply.status, 405);
    }

    #[tokio::test]
    async fn test_streamed_response_body() {
        let mut runtime = boot(
            "module.exports = { default: () => new Response(new ReadableStream({ start(c) { const enc = new TextEncoder(); c.enqueue(enc.encode('chunk-1 ')); c.enqueue(enc.encode('chunk-2')); c.close(); } })) };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("GET", "")).await.unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(body_text(&reply), "chunk-1 chunk-2");
    }

    #[tokio::test]
    async fn test_async_pulled_stream_body() {
        let mut runtime = boot(
            "module.exports = { default: () => { let n = 0; return new Response(new ReadableStream({ async pull(c) { await new Promise((r) => setTimeout(r, 1)); if (n < 3) { c.enqueue(new TextEncoder().encode(String(n++))); } else { c.close(); } } })); } };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("GET", "")).await.unwrap();
        assert_eq!(body_text(&reply), "012");
    }

    #[tokio::test]
    async fn test_blob_response_body() {
        let mut runtime = boot(
            "module.exports = { default: () => new Response(new Blob(['blob ', 'body']), { status: 202 }) };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("GET", "")).await.unwrap();
        assert_eq!(reply.status, 202);
        assert_eq!(body_text(&reply), "blob body");
    }

    #[tokio::test]
    async fn test_request_with_stream_and_blob_bodies() {
        let mut runtime = boot(
            "module.exports = { default: async () => { const fromBlob = await new Request('http://x/', { method: 'POST', body: new Blob(['ab']) }).text(); const fromStream = await new Request('http://x/', { method: 'POST', body: new Response('cd').body }).text(); return new Response(fromBlob + fromStream); } };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("GET", "")).await.unwrap();
        assert_eq!(body_text(&reply), "abcd");
    }

    #[tokio::test]
    async fn test_clone_leaves_original_unread() {
        let mut runtime = boot(
            "module.exports = { default: async (req) => { const copy = req.clone(); const first = await copy.text(); const used = req.bodyUsed; return new Response(JSON.stringify([used, first, await req.text()])); } };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("POST", "hello")).await.unwrap();
        assert_eq!(body_text(&reply), r#"[false,"hello","hello"]"#);
    }

    #[tokio::test]
    async fn test_body_cannot_be_read_twice() {
        let mut runtime = boot(
            "module.exports = { default: async (req) => { await req.text(); try { await req.text(); return new Response('read twice'); } catch (e) { return new Response(e instanceof TypeError ? 'type-error' : 'other'); } } };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("POST", "hello")).await.unwrap();
        assert_eq!(body_text(&reply), "type-error");
    }

    #[tokio::test]
    async fn test_process_env_is_read_only() {
        let mut runtime = boot(
            "module.exports = { default: () => { process.env.EDGE_TEST_VAR = 'changed'; return new Response(process.env.EDGE_TEST_VAR); } };",
            false,
        );
        let reply = invoke(&mut runtime, &payload("GET", "")).await.unwrap();
        // Strict-mode write to a frozen object throws inside user code.
        assert_eq!(reply.status, 500);
    }

    #[tokio::test]
    async fn test_missing_harness_is_rejected() {
        let mut runtime = create_runtime(&SandboxConfig::default()).unwrap();
        extend_context(&mut runtime, "x.js", EnvSnapshot::default(), WasmBindings::default()).unwrap();
        let err = load_program(&mut runtime, "\"use strict\";".to_string()).unwrap_err();
        assert!(err.to_string().contains("invocation entry point"));
    }
}
