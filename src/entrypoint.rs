//! The user-authored file a handler is built from.

use std::path::{Path, PathBuf};

/// Immutable description of an entrypoint, supplied once per handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrypointDescriptor {
    /// Absolute path handed to the bundler.
    pub full_path: PathBuf,
    /// Project-relative path; becomes `ENTRYPOINT_LABEL` and the route label.
    pub relative_path: String,
    pub is_middleware: bool,
}

impl EntrypointDescriptor {
    pub fn new(
        full_path: impl Into<PathBuf>,
        relative_path: impl Into<String>,
        is_middleware: bool,
    ) -> Self {
        Self {
            full_path: full_path.into(),
            relative_path: relative_path.into(),
            is_middleware,
        }
    }

    /// Build a descriptor for `path`, labelled relative to `root`.
    ///
    /// Falls back to the path as given when it does not live under `root`.
    pub fn from_root(root: &Path, path: &Path, is_middleware: bool) -> Self {
        let full_path = if path.is_absolute() {
            path.to_path_buf()
        } else {
            root.join(path)
        };
        let relative = match full_path.strip_prefix(root) {
            Ok(rel) => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            Err(_) => path.to_string_lossy().into_owned(),
        };
        Self::new(full_path, relative, is_middleware)
    }

    pub fn route_label(&self) -> String {
        route_label(&self.relative_path)
    }
}

/// Derive the logical route label from an entrypoint's relative path.
///
/// Strips the final dot-delimited suffix of the file name:
/// `api/some.func.js` becomes `api/some.func`. Paths whose file name has no
/// dot are returned unchanged.
pub fn route_label(relative_path: &str) -> String {
    let name_start = relative_path.rfind('/').map(|i| i + 1).unwrap_or(0);
    match relative_path[name_start..].rfind('.') {
        Some(dot) if dot > 0 => relative_path[..name_start + dot].to_string(),
        _ => relative_path.to_string(),
    }
}
