//! kubeconfig-fanout watches a directory tree for kubeconfig files
//! and keeps one watch session per file against the cluster it describes.
//!
//! Each session subscribes to pods, network policies and deployments in all namespaces,
//! filters the change events through a [`FilterPolicy`]
//! and appends the survivors to an [`EventSink`].
//! Sessions are created as kubeconfigs appear, stopped when they are removed,
//! and fail independently of each other and of discovery.

pub mod config;
pub use config::Settings;
pub mod discovery;
pub mod event;
pub use event::{ChangeType, CredentialFile, Discovery, ResourceEvent, ResourceKind};
pub mod filter;
pub use filter::FilterPolicy;
mod runner;
pub use runner::{run, RunError, SessionInfo, SessionState, Supervisor};
pub mod session;
pub mod sink;
pub use sink::EventSink;
