use std::fmt::Debug;

use futures::{
    future::{self, BoxFuture},
    stream::{self, BoxStream},
    FutureExt, StreamExt,
};
use k8s_openapi::api::{apps::v1::Deployment, core::v1::Pod, networking::v1::NetworkPolicy};
use kube_client::{
    config::{KubeConfigOptions, Kubeconfig},
    Api, Client, Config,
};
use kube_core::{params::WatchParams, Resource, WatchEvent};
use serde::de::DeserializeOwned;

use super::{Connection, Connector, SessionError, StreamError, Subscription};
use crate::event::{ChangeType, CredentialFile, ResourceEvent, ResourceKind};

/// [`Connector`] talking to a real apiserver through `kube-client`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeConnector;

impl Connector for KubeConnector {
    type Client = Client;

    fn open(
        &self,
        credential: &CredentialFile,
    ) -> future::BoxFuture<'static, Result<Connection<Client>, SessionError>> {
        let path = credential.path.clone();
        async move {
            let kubeconfig = Kubeconfig::read_from(&path).map_err(|err| SessionError::Config {
                path: path.clone(),
                source: err.into(),
            })?;
            let Some(context) = kubeconfig.contexts.first().map(|ctx| ctx.name.clone()) else {
                return Err(SessionError::Config {
                    path,
                    source: "kubeconfig declares no context".into(),
                });
            };

            let options = KubeConfigOptions {
                context: Some(context.clone()),
                ..KubeConfigOptions::default()
            };
            let config = Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|err| SessionError::Config {
                    path: path.clone(),
                    source: err.into(),
                })?;
            let client = Client::try_from(config).map_err(|err| SessionError::Connection {
                context: context.clone(),
                source: err.into(),
            })?;

            Ok(Connection { context, client })
        }
        .boxed()
    }

    fn subscribe(
        &self,
        client: &Client,
        kind: ResourceKind,
    ) -> future::BoxFuture<'static, Result<Subscription, SessionError>> {
        let client = client.clone();
        match kind {
            ResourceKind::Pod => watch_all::<Pod>(client, kind, pod_phase).boxed(),
            ResourceKind::NetworkPolicy => {
                watch_all::<NetworkPolicy>(client, kind, |_| None).boxed()
            }
            ResourceKind::Deployment => watch_all::<Deployment>(client, kind, |_| None).boxed(),
        }
    }
}

fn pod_phase(pod: &Pod) -> Option<String> {
    pod.status.as_ref()?.phase.clone()
}

type RawWatch<K> = BoxStream<'static, Result<WatchEvent<K>, kube_client::Error>>;

/// Opens a raw watch on `K` in every namespace.
///
/// The apiserver closes healthy watches at their timeout. The subscription reopens them
/// from the last resource version it saw, so only errors end it.
async fn watch_all<K>(
    client: Client,
    kind: ResourceKind,
    phase: fn(&K) -> Option<String>,
) -> Result<Subscription, SessionError>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    K::DynamicType: Default,
{
    let api = Api::<K>::all(client);
    let first = api
        .watch(&WatchParams::default(), "0")
        .await
        .map_err(|err| SessionError::Subscribe {
            kind,
            source: err.into(),
        })?;

    let reopen = move |version: String| {
        let api = api.clone();
        async move {
            let stream = api.watch(&WatchParams::default(), &version).await?;
            Ok::<RawWatch<K>, kube_client::Error>(stream.boxed())
        }
        .boxed()
    };
    Ok(resuming(kind, first.boxed(), "0".into(), reopen, phase))
}

struct Resume<K, F> {
    current: Option<RawWatch<K>>,
    version: String,
    reopen: F,
}

/// Chains watches: whenever `current` ends, `reopen` is called with the last seen version.
fn resuming<K, F>(
    kind: ResourceKind,
    first: RawWatch<K>,
    version: String,
    reopen: F,
    phase: fn(&K) -> Option<String>,
) -> Subscription
where
    K: Resource + Send + 'static,
    F: FnMut(String) -> BoxFuture<'static, Result<RawWatch<K>, kube_client::Error>>
        + Send
        + 'static,
{
    let state = Resume {
        current: Some(first),
        version,
        reopen,
    };
    stream::unfold(state, move |mut state| async move {
        loop {
            let Some(current) = state.current.as_mut() else {
                log::debug!("Resuming {kind} watch from version {}", state.version);
                match (state.reopen)(state.version.clone()).await {
                    Ok(stream) => state.current = Some(stream),
                    Err(source) => {
                        return Some((Err(StreamError::Transport { kind, source }), state))
                    }
                }
                continue;
            };

            let next = current.next().await;
            match next {
                None => state.current = None,
                Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                    state.version = bookmark.metadata.resource_version;
                }
                Some(event) => {
                    if let Ok(
                        WatchEvent::Added(object)
                        | WatchEvent::Modified(object)
                        | WatchEvent::Deleted(object),
                    ) = &event
                    {
                        if let Some(version) = &object.meta().resource_version {
                            state.version.clone_from(version);
                        }
                    }
                    if let Some(item) = translate(kind, event, phase) {
                        return Some((item, state));
                    }
                }
            }
        }
    })
    .boxed()
}

/// `None` for events that carry no change (bookmarks).
fn translate<K: Resource>(
    kind: ResourceKind,
    event: Result<WatchEvent<K>, kube_client::Error>,
    phase: fn(&K) -> Option<String>,
) -> Option<Result<ResourceEvent, StreamError>> {
    let (change, object) = match event {
        Ok(WatchEvent::Added(object)) => (ChangeType::Added, object),
        Ok(WatchEvent::Modified(object)) => (ChangeType::Modified, object),
        Ok(WatchEvent::Deleted(object)) => (ChangeType::Deleted, object),
        Ok(WatchEvent::Bookmark(_)) => return None,
        Ok(WatchEvent::Error(response)) => {
            return Some(Err(StreamError::Remote {
                kind,
                code: response.code,
                message: response.message,
            }))
        }
        Err(source) => return Some(Err(StreamError::Transport { kind, source })),
    };

    let meta = object.meta();
    let Some(name) = meta.name.clone() else {
        return Some(Err(StreamError::MissingPayload { kind }));
    };
    Some(Ok(ResourceEvent {
        kind,
        change,
        namespace: meta.namespace.clone().unwrap_or_default(),
        name,
        phase: phase(&object),
    }))
}
