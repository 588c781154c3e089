//! Binary-module (WASM) assets referenced by the entrypoint.
//!
//! Two phases. During bundling, [`WasmAssetPlugin`] only records an
//! identifier and a location for each `*.wasm` / `*.wasm?module` import (no
//! I/O). After a successful compile the collected [`WasmAssetSet`] travels
//! with the program, and the sandbox host calls [`WasmAssetSet::resolve_all`]
//! exactly once; that call consumes the set and is the only place the bytes
//! are read.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Virtual module namespace the bundler uses for rewritten WASM imports.
pub const WASM_NAMESPACE: &str = "edge-wasm:";

/// Identifier to source location, filled in while bundling.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WasmAssetSet {
    assets: BTreeMap<String, PathBuf>,
}

impl WasmAssetSet {
    /// Record `path` and return the global identifier the bundle will use.
    ///
    /// The identifier is derived from the path, so declaring the same file
    /// twice yields the same binding.
    pub fn declare(&mut self, path: &Path) -> String {
        let id = asset_identifier(path);
        self.assets
            .entry(id.clone())
            .or_insert_with(|| path.to_path_buf());
        id
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn path(&self, id: &str) -> Option<&Path> {
        self.assets.get(id).map(PathBuf::as_path)
    }

    /// Read every recorded asset into a binding.
    pub fn resolve_all(self) -> Result<WasmBindings> {
        let mut modules = BTreeMap::new();
        for (id, path) in self.assets {
            let bytes = std::fs::read(&path)
                .map_err(|e| anyhow!("Failed to read WASM asset '{}': {}", path.display(), e))?;
            if !bytes.starts_with(WASM_MAGIC) {
                return Err(anyhow!(
                    "'{}' is not a WebAssembly binary",
                    path.display()
                ));
            }
            modules.insert(id, bytes);
        }
        Ok(WasmBindings { modules })
    }
}

/// Loaded WASM bytes keyed by global identifier.
///
/// Each entry becomes a `WebAssembly.Module` global inside the sandbox.
#[derive(Debug, Default)]
pub struct WasmBindings {
    modules: BTreeMap<String, Vec<u8>>,
}

impl WasmBindings {
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, Vec<u8>> {
        self.modules
    }
}

/// Bundler extension that rewrites binary-module imports.
///
/// One instance per compilation. Shared with the bundler's resolver, hence
/// the lock around the asset set.
#[derive(Debug, Default)]
pub struct WasmAssetPlugin {
    assets: Mutex<WasmAssetSet>,
}

impl WasmAssetPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `specifier` names a binary module this plugin handles.
    pub fn matches(specifier: &str) -> bool {
        let path = specifier.strip_suffix("?module").unwrap_or(specifier);
        path.to_ascii_lowercase().ends_with(".wasm")
    }

    /// Register the import `specifier` seen in a file under `base_dir`.
    ///
    /// Returns the virtual module name the import is rewritten to.
    pub fn intercept(&self, specifier: &str, base_dir: &Path) -> Result<String> {
        let relative = specifier.strip_suffix("?module").unwrap_or(specifier);
        let location = if Path::new(relative).is_absolute() {
            PathBuf::from(relative)
        } else {
            base_dir.join(relative)
        };
        let mut assets = self
            .assets
            .lock()
            .map_err(|_| anyhow!("WASM asset registry lock poisoned"))?;
        let id = assets.declare(&normalize(&location));
        Ok(format!("{}{}", WASM_NAMESPACE, id))
    }

    /// Source of the virtual module standing in for a WASM import.
    pub fn virtual_module(name: &str) -> Option<String> {
        let id = name.strip_prefix(WASM_NAMESPACE)?;
        Some(format!(
            "export default globalThis[{}];",
            serde_json::to_string(id).ok()?
        ))
    }

    /// Hand over everything recorded so far.
    pub fn take_assets(&self) -> WasmAssetSet {
        match self.assets.lock() {
            Ok(mut assets) => std::mem::take(&mut *assets),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

fn asset_identifier(path: &Path) -> String {
    let digest = Sha256::digest(path.to_string_lossy().as_bytes());
    let hex: String = digest[..20].iter().map(|b| format!("{:02x}", b)).collect();
    format!("wasm_{}", hex)
}

/// Lexically resolve `.` and `..` so one file maps to one identifier.
fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
