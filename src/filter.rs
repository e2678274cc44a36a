//! Which events reach the sink.

use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::event::{ChangeType, ResourceKind};

/// Per-kind change types to keep, plus namespaces whose events are always dropped.
///
/// Deserializes from TOML; missing fields fall back to [`FilterPolicy::default`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterPolicy {
    /// Kinds absent from the table keep nothing.
    pub keep: HashMap<ResourceKind, HashSet<ChangeType>>,
    pub excluded_namespaces: HashSet<String>,
}

impl Default for FilterPolicy {
    /// Pods are reported when they come and go, network policies and deployments when they
    /// drift. Nothing in `kube-system` is reported.
    fn default() -> Self {
        Self {
            keep: HashMap::from([
                (
                    ResourceKind::Pod,
                    HashSet::from([ChangeType::Added, ChangeType::Deleted]),
                ),
                (
                    ResourceKind::NetworkPolicy,
                    HashSet::from([ChangeType::Modified]),
                ),
                (
                    ResourceKind::Deployment,
                    HashSet::from([ChangeType::Modified]),
                ),
            ]),
            excluded_namespaces: HashSet::from(["kube-system".to_owned()]),
        }
    }
}

impl FilterPolicy {
    pub fn keep(&self, kind: ResourceKind, change: ChangeType, namespace: &str) -> bool {
        if self.excluded_namespaces.contains(namespace) {
            return false;
        }
        self.keep
            .get(&kind)
            .is_some_and(|changes| changes.contains(&change))
    }

    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let source = fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&source).map_err(|source| PolicyError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("cannot read filter policy {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid filter policy {}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
