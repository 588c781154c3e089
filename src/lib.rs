//! # Edge Sandbox
//!
//! Local emulation of an edge function: bundle an entrypoint, run it in a
//! V8 isolate, and proxy HTTP requests into it.
//!
//! ## Pipeline
//!
//! 1. **Compile**: the entrypoint and its imports are bundled into one
//!    script; `.wasm` imports become references to globals bound later.
//! 2. **Start**: a fresh isolate gets `process.env` (a snapshot of the host
//!    environment), the WASM modules and the compiled script, then listens
//!    on an ephemeral local port.
//! 3. **Proxy**: each inbound request is posted to that port as JSON and
//!    the response is handed back. A user-code failure (5xx with the failure
//!    header) or a missing sandbox ends the process with status 1.
//!
//! ## Sandbox limits
//!
//! - **No filesystem or module loading**: everything is bundled up front
//! - **No network access** unless the origin is allowlisted for `fetch()`
//! - **Bounded heap**: 64MB by default
//!
//! ## Usage
//!
//! ```rust,ignore
//! use edge_sandbox::{EdgeHandler, EntrypointDescriptor, SandboxConfig, SwcBundler};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let entrypoint = EntrypointDescriptor::new("/app/api/hello.js", "api/hello.js", false);
//!     let handler = EdgeHandler::create(
//!         entrypoint,
//!         &SandboxConfig::default(),
//!         Arc::new(SwcBundler::default()),
//!     )
//!     .await?;
//!     // handler.handle(InboundRequest::from_http(request)).await
//!     Ok(())
//! }
//! ```

mod bundler;
mod compiler;
mod config;
mod entrypoint;
mod error;
mod lifecycle;
mod ops;
mod proxy;
mod runtime;
mod sandbox;
mod wasm;

pub use bundler::{Bundler, SwcBundler};
pub use compiler::{compile, wrap_bundle, CompiledProgram, HARNESS_TEMPLATE};
pub use config::{EnvSnapshot, SandboxConfig};
pub use entrypoint::{route_label, EntrypointDescriptor};
pub use error::{EdgeError, Fatal};
pub use lifecycle::{
    register_exit_hook, run_exit_hooks, shutdown_signal, terminate, ShutdownHook,
};
pub use ops::FetchConfig;
pub use proxy::{
    group_headers, EdgeHandler, Encoding, HeaderValues, InboundRequest, ProxyResponse,
    SerializedRequest, FAILURE_HEADER, FAILURE_HEADER_VALUE,
};
pub use sandbox::{start as start_sandbox, SandboxHandle};
pub use wasm::{WasmAssetPlugin, WasmAssetSet, WasmBindings};
