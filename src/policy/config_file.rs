//! On-disk configuration for a search node.
//!
//! Each configurable search node keeps one small JSON file recording its
//! policy, the administrator-supplied custom path list, and the network
//! defaults blob. A separate marker file records which policy is active
//! for the Authentication node; it is rewritten remove-then-recreate on
//! every switch and is a best-effort indicator, not a source of truth.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::types::SearchPolicy;

pub const CONFIG_VERSION: &str = "1";

/// Network directory defaults carried for the LDAP collaborator. The
/// resolver only consults `enabled`; the server list is persisted and
/// served back through the custom-call surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkDefaults {
    pub enabled: bool,
    #[serde(default)]
    pub servers: Vec<String>,
}

impl Default for NetworkDefaults {
    fn default() -> Self {
        Self {
            enabled: true,
            servers: Vec::new(),
        }
    }
}

/// Persisted state of one search node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchNodeConfig {
    pub version: String,
    pub policy: SearchPolicy,
    #[serde(default)]
    pub custom_paths: Vec<String>,
    #[serde(default)]
    pub network_defaults: NetworkDefaults,
}

impl Default for SearchNodeConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            policy: SearchPolicy::Automatic,
            custom_paths: Vec::new(),
            network_defaults: NetworkDefaults::default(),
        }
    }
}

/// Handle to a search node's backing config file.
///
/// Loading never fails: a missing file yields defaults, an unparseable one
/// is quarantined aside (`<file>.corrupt`) and replaced with defaults.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: Option<PathBuf>,
    config: SearchNodeConfig,
}

impl ConfigSource {
    pub fn load(dir: &Path, prefix: &str) -> Self {
        let path = dir.join(format!("{prefix}-search-node.json"));
        let config = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<SearchNodeConfig>(&bytes) {
                Ok(config) => {
                    debug!(path = %path.display(), policy = %config.policy, "loaded search node config");
                    config
                }
                Err(err) => {
                    let quarantine = path.with_extension("json.corrupt");
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "config file unparseable, quarantining and rebuilding defaults"
                    );
                    if let Err(err) = fs::rename(&path, &quarantine) {
                        warn!(error = %err, "could not quarantine corrupted config");
                    }
                    SearchNodeConfig::default()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => SearchNodeConfig::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config file unreadable, using defaults");
                SearchNodeConfig::default()
            }
        };
        Self {
            path: Some(path),
            config,
        }
    }

    /// A source with no backing file (the Network search node).
    pub fn in_memory(config: SearchNodeConfig) -> Self {
        Self { path: None, config }
    }

    pub fn config(&self) -> &SearchNodeConfig {
        &self.config
    }

    pub fn policy(&self) -> SearchPolicy {
        self.config.policy
    }

    pub fn set_policy(&mut self, policy: SearchPolicy) {
        self.config.policy = policy;
    }

    pub fn set_custom_paths(&mut self, paths: Vec<String>) {
        self.config.custom_paths = paths;
    }

    pub fn set_network_defaults(&mut self, defaults: NetworkDefaults) {
        self.config.network_defaults = defaults;
    }

    /// Write the current config back to disk. No-op for in-memory sources.
    pub fn save(&self) -> io::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&self.config).map_err(io::Error::other)?;
        fs::write(path, bytes)
    }
}

const MARKER_NAMES: [&str; 3] = [
    ".search-policy-1",
    ".search-policy-2",
    ".search-policy-3",
];

/// Active-policy marker for the Authentication search node.
#[derive(Debug, Clone)]
pub struct PolicyMarker {
    dir: PathBuf,
}

impl PolicyMarker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Rewrite the marker: remove every candidate, then create the one for
    /// `policy`. Deliberately remove-then-create, not an atomic rename; a
    /// reader can observe the gap.
    pub fn set(&self, policy: SearchPolicy) {
        if let Err(err) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %err, "cannot create marker dir");
            return;
        }
        self.clear();
        let name = MARKER_NAMES[(policy.marker_index() - 1) as usize];
        if let Err(err) = fs::write(self.dir.join(name), []) {
            warn!(error = %err, "cannot write policy marker");
        }
    }

    pub fn clear(&self) {
        for name in MARKER_NAMES {
            let _ = fs::remove_file(self.dir.join(name));
        }
    }

    /// Which policy the marker currently indicates, if any.
    pub fn active(&self) -> Option<SearchPolicy> {
        for (i, name) in MARKER_NAMES.iter().enumerate() {
            if self.dir.join(name).exists() {
                return match i {
                    0 => Some(SearchPolicy::Automatic),
                    1 => Some(SearchPolicy::LocalOnly),
                    _ => Some(SearchPolicy::Custom),
                };
            }
        }
        None
    }
}
