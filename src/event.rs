//! Values flowing between discovery, sessions and sinks.

use std::{fmt, path::PathBuf, str::FromStr};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;

/// A kubeconfig found under the watched root.
///
/// Identified by its path; two discoveries of the same path are the same credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialFile {
    pub path: PathBuf,
    pub discovered_at: DateTime<Utc>,
}

impl CredentialFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            discovered_at: Utc::now(),
        }
    }
}

/// Emitted by the directory watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discovery {
    /// A credential file exists at this path, either found by the walk or newly created.
    Found(CredentialFile),
    /// A credential file was deleted or moved out of the tree.
    Removed(PathBuf),
}

/// The object categories a session watches.
///
/// Parsed from its snake_case name (`pod`, `network_policy`, `deployment`), also when used as
/// a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum ResourceKind {
    Pod,
    NetworkPolicy,
    Deployment,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Pod,
        ResourceKind::NetworkPolicy,
        ResourceKind::Deployment,
    ];

    /// Lowercase singular name, used in records.
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::NetworkPolicy => "networkpolicy",
            ResourceKind::Deployment => "deployment",
        }
    }

    /// Lowercase plural name, used for sink destinations.
    pub fn plural(self) -> &'static str {
        match self {
            ResourceKind::Pod => "pods",
            ResourceKind::NetworkPolicy => "networkpolicies",
            ResourceKind::Deployment => "deployments",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown resource kind {0:?}, expected pod, network_policy or deployment")]
pub struct UnknownResourceKind(String);

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pod" => Ok(ResourceKind::Pod),
            "network_policy" => Ok(ResourceKind::NetworkPolicy),
            "deployment" => Ok(ResourceKind::Deployment),
            _ => Err(UnknownResourceKind(s.to_owned())),
        }
    }
}

impl TryFrom<String> for ResourceKind {
    type Error = UnknownResourceKind;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Added,
    Modified,
    Deleted,
    Error,
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeType::Added => "ADDED",
            ChangeType::Modified => "MODIFIED",
            ChangeType::Deleted => "DELETED",
            ChangeType::Error => "ERROR",
        })
    }
}

/// A single change notification from one of a session's subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEvent {
    pub kind: ResourceKind,
    pub change: ChangeType,
    pub namespace: String,
    pub name: String,
    /// Pod status phase; always `None` for other kinds.
    pub phase: Option<String>,
}

impl ResourceEvent {
    /// Formats the event as a single sink line, without the trailing newline.
    pub fn to_record(&self, at: DateTime<Utc>) -> String {
        let mut record = format!(
            "{} {} {} {}/{}",
            at.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.change,
            self.kind,
            self.namespace,
            self.name,
        );
        if self.kind == ResourceKind::Pod {
            record.push_str(" phase=");
            record.push_str(self.phase.as_deref().unwrap_or("Unknown"));
        }
        record
    }
}
