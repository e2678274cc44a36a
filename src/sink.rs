//! Destinations for kept events.

use std::{
    io,
    path::{Path, PathBuf},
};

use futures::{future::BoxFuture, FutureExt};
use tokio::{fs, io::AsyncWriteExt};

use crate::event::ResourceKind;

/// Appends one record per call to the destination of `(context, kind)`.
///
/// Implementations are shared by every session, so they must tolerate concurrent writers for
/// the same context.
pub trait EventSink: Send + Sync + 'static {
    fn write<'a>(
        &'a self,
        context: &'a str,
        kind: ResourceKind,
        record: &'a str,
    ) -> BoxFuture<'a, io::Result<()>>;
}

/// Writes `<root>/<context>/<kind plural>.log`, reopening the file for every record.
#[derive(Debug, Clone)]
pub struct FileSink {
    root: PathBuf,
}

impl FileSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn target(&self, context: &str, kind: ResourceKind) -> PathBuf {
        self.root
            .join(sanitize(context))
            .join(format!("{}.log", kind.plural()))
    }
}

impl EventSink for FileSink {
    fn write<'a>(
        &'a self,
        context: &'a str,
        kind: ResourceKind,
        record: &'a str,
    ) -> BoxFuture<'a, io::Result<()>> {
        let target = self.target(context, kind);
        async move {
            if let Some(dir) = target.parent() {
                fs::create_dir_all(dir).await?;
            }
            append_line(&target, record).await
        }
        .boxed()
    }
}

async fn append_line(path: &Path, record: &str) -> io::Result<()> {
    let mut line = String::with_capacity(record.len() + 1);
    line.push_str(record);
    line.push('\n');

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    // single write so concurrent appenders interleave whole lines
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    // dropping the handle closes it silently, so surface deferred write errors here
    file.sync_data().await
}

/// Context names come from user-supplied kubeconfigs and often contain `/` or `:`
/// (e.g. EKS ARNs).
fn sanitize(context: &str) -> String {
    let name: String = context
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match name.as_str() {
        "" | "." | ".." => format!("_{name}"),
        _ => name,
    }
}

/// Emits every record on the `events` log target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn write<'a>(
        &'a self,
        context: &'a str,
        _kind: ResourceKind,
        record: &'a str,
    ) -> BoxFuture<'a, io::Result<()>> {
        log::info!(target: "events", "[{context}] {record}");
        futures::future::ready(Ok(())).boxed()
    }
}
