//! Turns an entrypoint into the script the sandbox executes.

use std::path::Path;
use std::sync::Arc;

use crate::bundler::Bundler;
use crate::error::EdgeError;
use crate::wasm::{WasmAssetPlugin, WasmAssetSet};

/// Adapter from the user module's exports to `globalThis.__edgeInvoke`.
///
/// Inputs: the `IS_MIDDLEWARE` and `ENTRYPOINT_LABEL` constants declared
/// immediately before it.
pub const HARNESS_TEMPLATE: &str = include_str!("harness.js");

/// Result of a successful compile. Consumed by value by the sandbox host.
#[derive(Debug)]
pub struct CompiledProgram {
    pub script: String,
    pub wasm_assets: WasmAssetSet,
}

/// Compile the entrypoint, or log why it could not be compiled.
///
/// Never returns an error: a failed compile yields `None`, and the handler
/// reports it on its first request.
pub async fn compile(
    bundler: Arc<dyn Bundler>,
    full_path: &Path,
    relative_path: &str,
    is_middleware: bool,
) -> Option<CompiledProgram> {
    let full_path = full_path.to_path_buf();
    let relative = relative_path.to_string();

    let result = tokio::task::spawn_blocking(move || {
        compile_blocking(bundler.as_ref(), &full_path, &relative, is_middleware)
    })
    .await;

    match result {
        Ok(Ok(program)) => {
            tracing::debug!(
                entrypoint = relative_path,
                bytes = program.script.len(),
                wasm_assets = program.wasm_assets.len(),
                "compiled"
            );
            Some(program)
        }
        Ok(Err(err)) => {
            tracing::error!("{}", err);
            None
        }
        Err(join_err) => {
            tracing::error!(
                "{}",
                EdgeError::Compile {
                    path: relative_path.to_string(),
                    message: join_err.to_string(),
                }
            );
            None
        }
    }
}

fn compile_blocking(
    bundler: &dyn Bundler,
    full_path: &Path,
    relative_path: &str,
    is_middleware: bool,
) -> Result<CompiledProgram, EdgeError> {
    let compile_error = |message: String| EdgeError::Compile {
        path: relative_path.to_string(),
        message,
    };

    let plugin = Arc::new(WasmAssetPlugin::new());
    let bundle = bundler
        .bundle(full_path, Arc::clone(&plugin))
        .map_err(|e| compile_error(e.to_string()))?
        .ok_or_else(|| compile_error("bundler produced no output".to_string()))?;

    let script = wrap_bundle(&bundle, is_middleware, relative_path)
        .map_err(|e| compile_error(e.to_string()))?;

    Ok(CompiledProgram {
        script,
        wasm_assets: plugin.take_assets(),
    })
}

/// Prologue, bundle, the two harness inputs, then the harness itself.
pub fn wrap_bundle(
    bundle: &str,
    is_middleware: bool,
    entrypoint_label: &str,
) -> Result<String, serde_json::Error> {
    let label = serde_json::to_string(entrypoint_label)?;
    let mut script = String::with_capacity(bundle.len() + HARNESS_TEMPLATE.len() + 128);
    script.push_str("\"use strict\";\n");
    script.push_str(bundle);
    script.push_str("\nconst IS_MIDDLEWARE = ");
    script.push_str(if is_middleware { "true" } else { "false" });
    script.push_str(";\nconst ENTRYPOINT_LABEL = ");
    script.push_str(&label);
    script.push_str(";\n");
    script.push_str(HARNESS_TEMPLATE);
    Ok(script)
}
