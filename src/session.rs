//! One long-lived watch per credential file.
//!
//! A session opens a client for the first context of its kubeconfig, subscribes to pods,
//! network policies and deployments across all namespaces, and forwards the events the
//! [`FilterPolicy`] keeps to an [`EventSink`]. It has no successful end: it runs until a
//! stream breaks, the sink fails, or it is cancelled.

use std::{convert::Infallible, error::Error as StdError, io, path::PathBuf};

use chrono::Utc;
use futures::{future::BoxFuture, stream::BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::{
    event::{ChangeType, CredentialFile, ResourceEvent, ResourceKind},
    filter::FilterPolicy,
    sink::EventSink,
};

pub mod cluster;
pub use cluster::KubeConnector;

/// A change-event stream for one resource kind across all namespaces.
///
/// Runs until it yields an error. Server-side watch timeouts are the connector's to resume;
/// a subscription that ends anyway is treated as a failure.
pub type Subscription = BoxStream<'static, Result<ResourceEvent, StreamError>>;

/// The result of [`Connector::open`].
pub struct Connection<Client> {
    /// Name of the kubeconfig context the client was built for.
    pub context: String,
    pub client: Client,
}

/// Turns a credential file into a client and the client into subscriptions.
pub trait Connector: Send + Sync + 'static {
    type Client: Send + Sync + 'static;

    /// Parses the credential file and builds a client for its first context.
    fn open(
        &self,
        credential: &CredentialFile,
    ) -> BoxFuture<'static, Result<Connection<Self::Client>, SessionError>>;

    fn subscribe(
        &self,
        client: &Self::Client,
        kind: ResourceKind,
    ) -> BoxFuture<'static, Result<Subscription, SessionError>>;
}

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Why a session ended in the failed state.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The kubeconfig is unreadable, malformed or declares no context.
    #[error("cannot load kubeconfig {}", path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: BoxError,
    },
    /// No client could be built for the context.
    #[error("cannot connect to context {context}")]
    Connection {
        context: String,
        #[source]
        source: BoxError,
    },
    #[error("cannot subscribe to {kind} events")]
    Subscribe {
        kind: ResourceKind,
        #[source]
        source: BoxError,
    },
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("cannot write {kind} event for context {context}")]
    Io {
        context: String,
        kind: ResourceKind,
        #[source]
        source: io::Error,
    },
    #[error("session panicked: {message}")]
    Panicked { message: String },
}

/// A subscription broke. Every variant is fatal to the session.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("{kind} watch failed")]
    Transport {
        kind: ResourceKind,
        #[source]
        source: kube_client::Error,
    },
    #[error("{kind} watch returned {code}: {message}")]
    Remote {
        kind: ResourceKind,
        code: u16,
        message: String,
    },
    #[error("{kind} watch delivered an error event for {namespace}/{name}")]
    Signalled {
        kind: ResourceKind,
        namespace: String,
        name: String,
    },
    #[error("{kind} watch delivered an event without an object")]
    MissingPayload { kind: ResourceKind },
    #[error("{kind} watch closed")]
    Closed { kind: ResourceKind },
}

/// Borrowed view of what a session needs; the supervisor owns the pieces.
pub struct WatchSession<'a, C> {
    connector: &'a C,
    policy: &'a FilterPolicy,
    sink: &'a dyn EventSink,
}

impl<'a, C: Connector> WatchSession<'a, C> {
    pub fn new(connector: &'a C, policy: &'a FilterPolicy, sink: &'a dyn EventSink) -> Self {
        Self {
            connector,
            policy,
            sink,
        }
    }

    /// Runs until cancelled (`Ok`) or until anything goes wrong (`Err`).
    ///
    /// `on_active` is called with the context name once all three subscriptions are open.
    /// Subscriptions are dropped on every exit path.
    pub async fn run(
        &self,
        credential: &CredentialFile,
        cancel: &CancellationToken,
        on_active: impl FnOnce(&str) + Send,
    ) -> Result<(), SessionError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Ok(()),
            result = self.watch(credential, on_active) => match result {
                Ok(never) => match never {},
                Err(err) => Err(err),
            },
        }
    }

    async fn watch(
        &self,
        credential: &CredentialFile,
        on_active: impl FnOnce(&str),
    ) -> Result<Infallible, SessionError> {
        let Connection { context, client } = self.connector.open(credential).await?;
        log::debug!(
            "Opened context {context} from {}",
            credential.path.display()
        );

        let (mut pods, mut network_policies, mut deployments) = futures::try_join!(
            self.connector.subscribe(&client, ResourceKind::Pod),
            self.connector.subscribe(&client, ResourceKind::NetworkPolicy),
            self.connector.subscribe(&client, ResourceKind::Deployment),
        )?;
        on_active(&context);

        loop {
            let event = tokio::select! {
                next = pods.next() => closed_as_error(next, ResourceKind::Pod),
                next = network_policies.next() => closed_as_error(next, ResourceKind::NetworkPolicy),
                next = deployments.next() => closed_as_error(next, ResourceKind::Deployment),
            }?;
            self.forward(&context, event).await?;
        }
    }

    async fn forward(&self, context: &str, event: ResourceEvent) -> Result<(), SessionError> {
        if event.change == ChangeType::Error {
            return Err(StreamError::Signalled {
                kind: event.kind,
                namespace: event.namespace,
                name: event.name,
            }
            .into());
        }

        if !self.policy.keep(event.kind, event.change, &event.namespace) {
            log::trace!(
                "[{context}] dropped {} {} {}/{}",
                event.change,
                event.kind,
                event.namespace,
                event.name
            );
            return Ok(());
        }

        let record = event.to_record(Utc::now());
        self.sink
            .write(context, event.kind, &record)
            .await
            .map_err(|source| SessionError::Io {
                context: context.to_owned(),
                kind: event.kind,
                source,
            })
    }
}

fn closed_as_error(
    next: Option<Result<ResourceEvent, StreamError>>,
    kind: ResourceKind,
) -> Result<ResourceEvent, StreamError> {
    next.unwrap_or(Err(StreamError::Closed { kind }))
}
