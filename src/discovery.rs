//! Finds kubeconfigs under a directory tree, now and as they appear.
//!
//! Every directory is watched non-recursively and is registered *before* it is enumerated,
//! so a file created between the two steps shows up either in the listing or as an event.
//! A directory that appears later (created or moved in already populated) is registered
//! and enumerated when its own event arrives.
//!
//! The same path may be reported more than once; consumers must be idempotent.

use std::{
    collections::HashSet,
    ffi::OsStr,
    io,
    path::{Path, PathBuf},
    pin::Pin,
    task::{Context, Poll},
    thread,
};

use crossbeam::channel;
use futures::Stream;
use notify::{
    event::{ModifyKind, RenameMode},
    EventKind, RecommendedWatcher, RecursiveMode, Watcher,
};
use tokio::sync::mpsc;
use walkdir::WalkDir;

use crate::event::{CredentialFile, Discovery};

/// The suffix recognised when none is configured.
pub const DEFAULT_SUFFIX: &str = "kubeconfig";

/// A directory could not be watched.
#[derive(Debug, thiserror::Error)]
#[error("cannot watch {}", path.display())]
pub struct WatchRegistrationError {
    pub path: PathBuf,
    #[source]
    pub source: notify::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    /// The root itself could not be watched; nothing can be discovered.
    #[error(transparent)]
    Register(#[from] WatchRegistrationError),
    #[error("cannot start discovery thread")]
    Spawn(#[source] io::Error),
}

/// Starts watching `root` for files whose name ends with `suffix`.
///
/// The root is registered before this returns. The walk and all later events are handled
/// on a dedicated thread, which exits once the returned stream is dropped.
pub fn watch(
    root: impl Into<PathBuf>,
    suffix: impl Into<String>,
) -> Result<DiscoveryStream, DiscoveryError> {
    let root = root.into();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (mut tree, raw_rx) =
        Tree::new(suffix.into(), events_tx).map_err(|source| WatchRegistrationError {
            path: root.clone(),
            source,
        })?;
    tree.register(&root)?;
    log::info!("Watching {} for *{} files", root.display(), tree.suffix);

    let (stop_tx, stop_rx) = channel::bounded::<()>(0);
    thread::Builder::new()
        .name("discovery".into())
        .spawn(move || tree.run(&root, &raw_rx, &stop_rx))
        .map_err(DiscoveryError::Spawn)?;

    Ok(DiscoveryStream {
        events: events_rx,
        _stop: stop_tx,
    })
}

/// Discoveries in the order the watcher made them.
///
/// Ends only if the underlying filesystem watcher shuts down.
pub struct DiscoveryStream {
    events: mpsc::UnboundedReceiver<Discovery>,
    /// Dropping this disconnects the discovery thread's stop channel.
    _stop: channel::Sender<()>,
}

impl Stream for DiscoveryStream {
    type Item = Discovery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Discovery>> {
        self.events.poll_recv(cx)
    }
}

type RawEvents = channel::Receiver<notify::Result<notify::Event>>;

/// State owned by the discovery thread.
struct Tree {
    watcher: RecommendedWatcher,
    watched: HashSet<PathBuf>,
    /// Credential files reported as found and not yet as removed.
    found: HashSet<PathBuf>,
    suffix: String,
    events: mpsc::UnboundedSender<Discovery>,
}

impl Tree {
    /// Returns the tree, watching nothing yet, and the receiver its watcher reports into.
    fn new(
        suffix: String,
        events: mpsc::UnboundedSender<Discovery>,
    ) -> notify::Result<(Self, RawEvents)> {
        let (raw_tx, raw_rx) = channel::unbounded();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // receiver gone means the discovery thread has exited
            let _ = raw_tx.send(res);
        })?;
        let tree = Self {
            watcher,
            watched: HashSet::new(),
            found: HashSet::new(),
            suffix,
            events,
        };
        Ok((tree, raw_rx))
    }

    fn run(
        mut self,
        root: &Path,
        raw: &RawEvents,
        stop: &channel::Receiver<()>,
    ) {
        self.enumerate(root);

        while !self.events.is_closed() {
            channel::select! {
                recv(raw) -> msg => match msg {
                    Ok(Ok(event)) => self.handle(event),
                    Ok(Err(err)) => log::warn!("Filesystem watch error: {err}"),
                    Err(_) => break,
                },
                recv(stop) -> _ => break,
            }
        }
        log::debug!("Discovery under {} stopped", root.display());
    }

    fn handle(&mut self, event: notify::Event) {
        let notify::Event { kind, paths, .. } = event;
        match kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in &paths {
                    self.appeared(path);
                }
            }
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &paths {
                    self.disappeared(path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to] = paths.as_slice() {
                    self.disappeared(from);
                    self.appeared(to);
                }
            }
            // backends that cannot tell the direction of a rename
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in &paths {
                    if path.exists() {
                        self.appeared(path);
                    } else {
                        self.disappeared(path);
                    }
                }
            }
            _ => {}
        }
    }

    fn appeared(&mut self, path: &Path) {
        if path.is_dir() {
            if self.try_register(path) {
                self.enumerate(path);
            }
        } else {
            self.offer(path);
        }
    }

    /// Forgets `path` and everything below it, reporting each credential file it held.
    fn disappeared(&mut self, path: &Path) {
        let dirs: Vec<_> = self
            .watched
            .iter()
            .filter(|dir| dir.starts_with(path))
            .cloned()
            .collect();
        for dir in dirs {
            self.watched.remove(&dir);
            // a renamed directory keeps its watch under the old name until it is dropped
            let _ = self.watcher.unwatch(&dir);
            log::debug!("Stopped watching {}", dir.display());
        }

        let files: Vec<_> = self
            .found
            .iter()
            .filter(|file| file.starts_with(path))
            .cloned()
            .collect();
        for file in files {
            self.found.remove(&file);
            log::info!("Credential file {} removed", file.display());
            self.emit(Discovery::Removed(file));
        }
    }

    /// Lists `dir` one level deep, registering each subdirectory before descending.
    fn enumerate(&mut self, dir: &Path) {
        let entries = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("Cannot list entry under {}: {err}", dir.display());
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                if self.try_register(entry.path()) {
                    self.enumerate(entry.path());
                }
            } else {
                self.offer(entry.path());
            }
        }
    }

    fn register(&mut self, dir: &Path) -> Result<(), WatchRegistrationError> {
        if self.watched.contains(dir) {
            return Ok(());
        }
        self.watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchRegistrationError {
                path: dir.to_path_buf(),
                source,
            })?;
        self.watched.insert(dir.to_path_buf());
        log::debug!("Watching directory {}", dir.display());
        Ok(())
    }

    /// Subdirectories that cannot be watched are left uncovered.
    fn try_register(&mut self, dir: &Path) -> bool {
        match self.register(dir) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("{err}, its subtree will not be monitored: {}", err.source);
                false
            }
        }
    }

    fn matches(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(OsStr::to_str)
            .is_some_and(|name| name.ends_with(&self.suffix))
    }

    fn offer(&mut self, path: &Path) {
        if self.matches(path) {
            log::info!("Discovered credential file {}", path.display());
            self.found.insert(path.to_path_buf());
            self.emit(Discovery::Found(CredentialFile::new(path)));
        }
    }

    fn emit(&self, discovery: Discovery) {
        if self.events.send(discovery).is_err() {
            log::debug!("Discovery stream dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, time::Duration};

    use futures::StreamExt;
    use notify::event::CreateKind;

    use super::*;

    /// Collects discoveries up to and including the first one `done` accepts.
    async fn until(
        stream: &mut DiscoveryStream,
        what: &str,
        done: impl Fn(&Discovery) -> bool,
    ) -> Vec<Discovery> {
        let mut seen = Vec::new();
        loop {
            let next = tokio::time::timeout(Duration::from_secs(10), stream.next())
                .await
                .unwrap_or_else(|_| panic!("{what} not reported, saw {seen:?}"))
                .expect("discovery stream ended");
            let finished = done(&next);
            seen.push(next);
            if finished {
                return seen;
            }
        }
    }

    async fn next_found(stream: &mut DiscoveryStream, wanted: &Path) -> Vec<Discovery> {
        let what = wanted.display().to_string();
        until(stream, &what, |next| {
            matches!(next, Discovery::Found(file) if file.path == wanted)
        })
        .await
    }

    async fn next_removed(stream: &mut DiscoveryStream, wanted: &Path) -> Vec<Discovery> {
        let what = format!("removal of {}", wanted.display());
        until(stream, &what, |next| {
            matches!(next, Discovery::Removed(path) if path == wanted)
        })
        .await
    }

    fn canonical_tempdir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    #[tokio::test]
    async fn walk_finds_existing_files() {
        let (_dir, root) = canonical_tempdir();
        fs::create_dir_all(root.join("a/nested")).unwrap();
        fs::write(root.join("a/kubeconfig"), "").unwrap();
        fs::write(root.join("a/nested/prod.kubeconfig"), "").unwrap();
        fs::write(root.join("a/notes.txt"), "").unwrap();

        let mut stream = watch(&root, DEFAULT_SUFFIX).unwrap();
        let seen = next_found(&mut stream, &root.join("a/kubeconfig")).await;
        assert_eq!(seen.len(), 1, "{seen:?}");
        let seen = next_found(&mut stream, &root.join("a/nested/prod.kubeconfig")).await;
        assert_eq!(seen.len(), 1, "{seen:?}");
    }

    #[tokio::test]
    async fn finds_files_in_directories_created_later() {
        let (_dir, root) = canonical_tempdir();
        let mut stream = watch(&root, DEFAULT_SUFFIX).unwrap();

        fs::create_dir(root.join("b")).unwrap();
        fs::write(root.join("b/kubeconfig"), "").unwrap();

        next_found(&mut stream, &root.join("b/kubeconfig")).await;
    }

    #[tokio::test]
    async fn finds_files_in_directories_moved_in() {
        let (_dir, root) = canonical_tempdir();
        let (_staging_dir, staging) = canonical_tempdir();
        fs::create_dir_all(staging.join("c/deep")).unwrap();
        fs::write(staging.join("c/deep/kubeconfig"), "").unwrap();

        let mut stream = watch(&root, DEFAULT_SUFFIX).unwrap();
        // same filesystem is required for an atomic rename
        let moved = root.join("c");
        if fs::rename(staging.join("c"), &moved).is_err() {
            return;
        }

        next_found(&mut stream, &moved.join("deep/kubeconfig")).await;
    }

    #[tokio::test]
    async fn reports_removed_files() {
        let (_dir, root) = canonical_tempdir();
        fs::create_dir(root.join("a")).unwrap();
        let file = root.join("a/kubeconfig");
        fs::write(&file, "").unwrap();

        let mut stream = watch(&root, DEFAULT_SUFFIX).unwrap();
        next_found(&mut stream, &file).await;
        fs::remove_file(&file).unwrap();

        next_removed(&mut stream, &file).await;
    }

    #[tokio::test]
    async fn renamed_directory_removes_old_paths_and_finds_new_ones() {
        let (_dir, root) = canonical_tempdir();
        fs::create_dir_all(root.join("a/nested")).unwrap();
        fs::write(root.join("a/kubeconfig"), "").unwrap();
        fs::write(root.join("a/nested/kubeconfig"), "").unwrap();

        let mut stream = watch(&root, DEFAULT_SUFFIX).unwrap();
        next_found(&mut stream, &root.join("a/nested/kubeconfig")).await;
        fs::rename(root.join("a"), root.join("b")).unwrap();

        let mut seen = next_found(&mut stream, &root.join("b/kubeconfig")).await;
        seen.extend(next_found(&mut stream, &root.join("b/nested/kubeconfig")).await);
        for old in ["a/kubeconfig", "a/nested/kubeconfig"] {
            assert!(
                seen.contains(&Discovery::Removed(root.join(old))),
                "{old} not removed: {seen:?}"
            );
        }

        // the new location is watched, the old name is not
        fs::remove_file(root.join("b/nested/kubeconfig")).unwrap();
        next_removed(&mut stream, &root.join("b/nested/kubeconfig")).await;
    }

    #[tokio::test]
    async fn directory_moved_out_removes_its_files() {
        let (_dir, root) = canonical_tempdir();
        let (_outside_dir, outside) = canonical_tempdir();
        fs::create_dir_all(root.join("w/a")).unwrap();
        let file = root.join("w/a/kubeconfig");
        fs::write(&file, "").unwrap();

        let mut stream = watch(&root, DEFAULT_SUFFIX).unwrap();
        next_found(&mut stream, &file).await;
        // same filesystem is required for an atomic rename
        if fs::rename(root.join("w/a"), outside.join("a")).is_err() {
            return;
        }

        next_removed(&mut stream, &file).await;
    }

    #[test]
    fn unwatchable_subdirectory_is_skipped() {
        let (_dir, root) = canonical_tempdir();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (mut tree, _raw) = Tree::new(DEFAULT_SUFFIX.into(), events_tx).unwrap();
        tree.register(&root).unwrap();

        // listed, then deleted before it could be registered
        let gone = root.join("gone");
        fs::create_dir(&gone).unwrap();
        fs::remove_dir(&gone).unwrap();
        assert!(!tree.try_register(&gone));
        assert!(!tree.watched.contains(&gone));

        fs::create_dir(root.join("ok")).unwrap();
        fs::write(root.join("ok/kubeconfig"), "").unwrap();
        let created = notify::Event::new(EventKind::Create(CreateKind::Folder));
        tree.handle(created.add_path(root.join("ok")));

        match events_rx.try_recv() {
            Ok(Discovery::Found(file)) => assert_eq!(file.path, root.join("ok/kubeconfig")),
            other => panic!("expected a discovery, got {other:?}"),
        }
        assert!(tree.watched.contains(&root.join("ok")));
    }

    #[test]
    fn missing_root_is_fatal() {
        let (_dir, root) = canonical_tempdir();
        let err = watch(root.join("absent"), DEFAULT_SUFFIX).err().unwrap();
        assert!(matches!(err, DiscoveryError::Register(_)));
    }
}
