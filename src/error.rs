/// Errors surfaced across the handler's public boundary.
///
/// Compilation and startup failures never reach a caller as values: they are
/// logged (message only) and the handler carries on without a sandbox. The
/// variants exist so the log line and the internal propagation share one
/// wording.
#[derive(Debug, thiserror::Error)]
pub enum EdgeError {
    /// The bundler failed or produced nothing for the entrypoint.
    #[error("Failed to compile {path}: {message}")]
    Compile { path: String, message: String },

    /// The isolate or its local endpoint could not be started.
    #[error("Failed to start sandbox for {path}: {message}")]
    Startup { path: String, message: String },

    /// The inbound request could not be read or serialized.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The call to the sandbox endpoint failed before a response arrived.
    #[error("sandbox transport error: {0}")]
    Transport(String),

    /// A condition that must end the process.
    #[error(transparent)]
    Fatal(#[from] Fatal),
}

/// Conditions that terminate the host process with [`Fatal::EXIT_CODE`].
///
/// These mirror the production launcher, which exits when a function cannot
/// be initialised or throws while handling a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fatal {
    /// A request arrived but compilation or sandbox startup had failed.
    #[error("No sandbox is available for {relative_path}; see the earlier error")]
    SandboxUnavailable { relative_path: String },

    /// User code failed inside the harness (failure header with a 5xx status).
    #[error("Error from API Route {route}: {body}\n    at ({relative_path})")]
    UserCode {
        route: String,
        relative_path: String,
        status: u16,
        body: String,
    },
}

impl Fatal {
    pub const EXIT_CODE: i32 = 1;

    pub fn exit_code(&self) -> i32 {
        Self::EXIT_CODE
    }
}
