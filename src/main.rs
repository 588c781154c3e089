//! Edge Sandbox CLI
//!
//! Serves one edge function on a local port:
//!   edge-sandbox api/hello.js --root ./my-app --listen 127.0.0.1:3000
//!
//! Every request to the listen address goes through the function. A
//! function that throws (or fails to compile) ends the process with
//! status 1, the same as the production launcher.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Router;
use clap::Parser;
use edge_sandbox::{
    run_exit_hooks, shutdown_signal, EdgeHandler, EntrypointDescriptor, InboundRequest,
    SandboxConfig, SwcBundler,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "edge-sandbox", version, about = "Run an edge function locally")]
struct Cli {
    /// Entrypoint file, JavaScript or TypeScript
    entrypoint: PathBuf,

    /// Project root; the entrypoint label is relative to it
    #[arg(long, env = "EDGE_ROOT", default_value = ".")]
    root: PathBuf,

    /// Treat the entrypoint as middleware
    #[arg(long, env = "EDGE_MIDDLEWARE")]
    middleware: bool,

    /// Address the dev server listens on
    #[arg(long, env = "EDGE_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Isolate heap limit in MB (0 = unlimited)
    #[arg(long, env = "EDGE_MAX_HEAP_MB", default_value_t = 64)]
    max_heap_mb: usize,

    /// Origin fetch() may reach, e.g. https://api.example.com ("*" for any)
    #[arg(long = "allow-fetch-origin", env = "EDGE_ALLOW_FETCH", value_delimiter = ',')]
    allow_fetch_origins: Vec<String>,
}

impl Cli {
    fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            max_heap_size: (self.max_heap_mb > 0).then(|| self.max_heap_mb * 1024 * 1024),
            allowed_origins: self.allow_fetch_origins.clone(),
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let root = std::fs::canonicalize(&cli.root)
        .with_context(|| format!("Project root not found: {}", cli.root.display()))?;
    let entrypoint = EntrypointDescriptor::from_root(&root, &cli.entrypoint, cli.middleware);
    if !entrypoint.full_path.is_file() {
        return Err(anyhow!(
            "Entrypoint not found: {}",
            entrypoint.full_path.display()
        ));
    }

    let handler = EdgeHandler::create(
        entrypoint,
        &cli.sandbox_config(),
        Arc::new(SwcBundler::default()),
    )
    .await?;
    let handler = Arc::new(handler);

    let app = Router::new().fallback(forward).with_state(Arc::clone(&handler));
    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;

    tracing::info!(
        "Serving {} on http://{}",
        handler.entrypoint().relative_path,
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let closed = run_exit_hooks();
    tracing::debug!(closed, "shut down");
    Ok(())
}

async fn forward(State(handler): State<Arc<EdgeHandler>>, request: Request) -> Response {
    match handler.handle(InboundRequest::from_http(request)).await {
        Ok(response) => response.into_response(),
        Err(err) => {
            tracing::error!("{}", err);
            (StatusCode::BAD_GATEWAY, err.to_string()).into_response()
        }
    }
}
