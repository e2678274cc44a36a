use std::{
    any::Any,
    collections::{hash_map, HashMap},
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    event::{CredentialFile, Discovery},
    filter::FilterPolicy,
    session::{Connector, SessionError, WatchSession},
    sink::EventSink,
};

/// Feeds discoveries into `supervisor` until `shutdown` resolves, then stops every session.
pub async fn run<C: Connector>(
    supervisor: &Supervisor<C>,
    discovery: impl Stream<Item = Discovery>,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RunError> {
    tokio::pin!(discovery);
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            () = &mut shutdown => {
                log::info!("Shutting down {} session(s)", supervisor.sessions().len());
                break Ok(());
            }
            next = discovery.next() => match next {
                Some(Discovery::Found(credential)) => supervisor.on_discovered(credential),
                Some(Discovery::Removed(path)) => supervisor.on_removed(&path).await,
                None => break Err(RunError::DiscoveryEnded),
            },
        }
    };

    supervisor.shutdown().await;
    result
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("directory discovery stopped unexpectedly")]
    DiscoveryEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Opening the client or its subscriptions.
    Starting,
    /// All three subscriptions are open.
    Active,
    Failed,
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Failed => "failed",
            SessionState::Stopped => "stopped",
        })
    }
}

/// A snapshot of one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub path: PathBuf,
    /// Known once the kubeconfig has been opened.
    pub context: Option<String>,
    pub state: SessionState,
}

/// Owns the set of live sessions, keyed by credential file path.
///
/// Sessions are independent tokio tasks; a failing session is removed from the set and never
/// restarted, while the others keep running. Rediscovering its path starts a fresh one.
pub struct Supervisor<C> {
    inner: Arc<Inner<C>>,
}

struct Inner<C> {
    connector: C,
    policy: FilterPolicy,
    sink: Arc<dyn EventSink>,
    sessions: Mutex<HashMap<PathBuf, Handle>>,
    next_generation: AtomicU64,
}

struct Handle {
    /// Distinguishes a session from a later one for the same path.
    generation: u64,
    context: Option<String>,
    state: SessionState,
    task: CancellableTask,
}

impl<C: Connector> Supervisor<C> {
    pub fn new(connector: C, policy: FilterPolicy, sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                policy,
                sink,
                sessions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Starts a session for `credential` unless one is already starting or active.
    ///
    /// Returns immediately; the session runs on its own task.
    pub fn on_discovered(&self, credential: CredentialFile) {
        let mut sessions = self.inner.sessions.lock();
        let entry = match sessions.entry(credential.path.clone()) {
            hash_map::Entry::Occupied(existing)
                if matches!(
                    existing.get().state,
                    SessionState::Starting | SessionState::Active
                ) =>
            {
                log::debug!(
                    "Session for {} is already {}",
                    credential.path.display(),
                    existing.get().state
                );
                return;
            }
            entry => entry,
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let path = credential.path.clone();
        let task = CancellableTask::spawn(
            {
                let inner = Arc::clone(&self.inner);
                move |token| async move {
                    let session =
                        WatchSession::new(&inner.connector, &inner.policy, &*inner.sink);
                    session
                        .run(&credential, &token, |context| {
                            inner.mark_active(&credential.path, generation, context)
                        })
                        .await
                }
            },
            {
                let inner = Arc::clone(&self.inner);
                move |result| inner.on_session_ended(&path, generation, result)
            },
        );

        log::info!("Starting session for {}", entry.key().display());
        let handle = Handle {
            generation,
            context: None,
            state: SessionState::Starting,
            task,
        };
        match entry {
            hash_map::Entry::Occupied(mut entry) => {
                entry.insert(handle);
            }
            hash_map::Entry::Vacant(entry) => {
                entry.insert(handle);
            }
        }
    }

    /// Stops the session for a credential file that no longer exists.
    pub async fn on_removed(&self, path: &Path) {
        let Some(handle) = self.inner.sessions.lock().remove(path) else {
            return;
        };
        log::info!(
            "Session for {} is now {}: credential file removed",
            path.display(),
            SessionState::Stopped
        );
        handle.task.cancel().await;
    }

    /// Stops every session and waits for all of them to release their subscriptions.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.inner.sessions.lock().drain().collect();
        for (path, handle) in handles {
            log::debug!("Stopping session for {}", path.display());
            handle.task.cancel().await;
        }
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.inner.sessions.lock();
        let mut infos: Vec<_> = sessions
            .iter()
            .map(|(path, handle)| SessionInfo {
                path: path.clone(),
                context: handle.context.clone(),
                state: handle.state,
            })
            .collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));
        infos
    }
}

impl<C> Inner<C> {
    fn mark_active(&self, path: &Path, generation: u64, context: &str) {
        let mut sessions = self.sessions.lock();
        let Some(handle) = sessions.get_mut(path) else {
            return;
        };
        if handle.generation == generation {
            handle.state = SessionState::Active;
            handle.context = Some(context.to_owned());
            log::info!(
                "Session for {} is {} on context {context}",
                path.display(),
                handle.state
            );
        }
    }

    /// Forgets the session unless it was already replaced or reclaimed.
    fn on_session_ended(&self, path: &Path, generation: u64, result: Result<(), SessionError>) {
        let state = match &result {
            Ok(()) => SessionState::Stopped,
            Err(_) => SessionState::Failed,
        };
        {
            let mut sessions = self.sessions.lock();
            if sessions
                .get(path)
                .is_some_and(|handle| handle.generation == generation)
            {
                sessions.remove(path);
            }
        }

        match result {
            Ok(()) => log::info!("Session for {} is now {state}", path.display()),
            Err(err) => log::error!(
                "Session for {} is now {state}: {}",
                path.display(),
                ErrorChain(&err)
            ),
        }
    }
}

/// Displays an error followed by each of its sources.
struct ErrorChain<'a>(&'a (dyn std::error::Error + 'static));

impl fmt::Display for ErrorChain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;
        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

/// A spawned session together with the token that stops it.
struct CancellableTask {
    join_handle: JoinHandle<()>,
    token: CancellationToken,
}

impl CancellableTask {
    /// Spawns the future built by `run` and hands its outcome to `on_exit`.
    ///
    /// A panic inside the session reaches `on_exit` as [`SessionError::Panicked`] and never
    /// unwinds into the supervisor.
    fn spawn<F, Fut, E>(run: F, on_exit: E) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), SessionError>> + Send + 'static,
        E: FnOnce(Result<(), SessionError>) + Send + 'static,
    {
        let token = CancellationToken::new();
        let session = run(token.clone());
        let join_handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(session)
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(SessionError::Panicked {
                        message: panic_message(&*panic),
                    })
                });
            on_exit(result);
        });
        Self { join_handle, token }
    }

    async fn cancel(self) {
        self.token.cancel();
        if let Err(err) = self.join_handle.await {
            log::error!("Session task did not finish cleanly: {err}");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string payload".to_owned()
    }
}
