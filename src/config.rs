use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};

/// Configuration for the edge sandbox
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum heap size in bytes (default: 64MB, None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Allowed origins for fetch() (empty = fetch disabled, "*" = any origin)
    pub allowed_origins: Vec<String>,
    /// Address the sandbox's local endpoint binds to (port is always ephemeral)
    pub bind_host: IpAddr,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(64 * 1024 * 1024), // 64MB default
            allowed_origins: vec![],               // fetch disabled by default
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

/// Read-only copy of the host environment handed to the sandbox as `process.env`.
///
/// Taken once at sandbox start; later changes to the host environment are not
/// visible inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvSnapshot(BTreeMap<String, String>);

impl EnvSnapshot {
    /// Every host variable, unfiltered. Non-UTF-8 entries are skipped.
    pub fn capture() -> Self {
        Self(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl FromIterator<(String, String)> for EnvSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
