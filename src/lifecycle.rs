//! Process-exit plumbing: idempotent teardown hooks and fatal termination.

use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::oneshot;

static EXIT_HOOKS: OnceLock<ExitHooks> = OnceLock::new();

/// Releases one resource, at most once.
///
/// Cloned freely; every clone closes the same resource. Closing a resource
/// that has already been closed (or whose owner already went away) is a
/// no-op.
#[derive(Debug, Clone)]
pub struct ShutdownHook {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug)]
struct ShutdownInner {
    name: String,
    signal: Mutex<Option<oneshot::Sender<()>>>,
}

impl ShutdownHook {
    /// A hook plus the receiver its owner waits on.
    pub fn new(name: impl Into<String>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let hook = Self {
            inner: Arc::new(ShutdownInner {
                name: name.into(),
                signal: Mutex::new(Some(tx)),
            }),
        };
        (hook, rx)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns `true` only for the call that actually closed the resource.
    pub fn close(&self) -> bool {
        let sender = self
            .inner
            .signal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        match sender {
            Some(tx) => {
                // The owner may already be gone; that still counts as closed.
                let _ = tx.send(());
                tracing::debug!(resource = %self.inner.name, "closed");
                true
            }
            None => false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner
            .signal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// A set of hooks run together on exit.
#[derive(Debug, Default)]
pub struct ExitHooks {
    hooks: Mutex<Vec<ShutdownHook>>,
}

impl ExitHooks {
    /// Adds `hook`, dropping any registered hooks that are already closed.
    pub fn register(&self, hook: ShutdownHook) {
        let mut hooks = self
            .hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        hooks.retain(|registered| !registered.is_closed());
        hooks.push(hook);
    }

    /// Close every registered resource and forget it. Safe to call repeatedly.
    ///
    /// Returns how many resources this call closed.
    pub fn run(&self) -> usize {
        let registered = std::mem::take(
            &mut *self
                .hooks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        registered.iter().filter(|hook| hook.close()).count()
    }

    pub fn len(&self) -> usize {
        self.hooks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn process_hooks() -> &'static ExitHooks {
    EXIT_HOOKS.get_or_init(ExitHooks::default)
}

/// Register `hook` to run when the process exits through this module.
pub fn register_exit_hook(hook: ShutdownHook) {
    process_hooks().register(hook);
}

/// Close every process-wide registered resource.
pub fn run_exit_hooks() -> usize {
    process_hooks().run()
}

/// Run the exit hooks, then end the process with `code`.
pub fn terminate(code: i32) -> ! {
    run_exit_hooks();
    std::process::exit(code)
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}
