//! Single-writer persistence queue.
//!
//! Configuration and destination-cache saves go through one background
//! task fed by an mpsc queue. Writes queued for the same path before the task gets to
//! them are coalesced, so only the newest contents reach the disk. Every
//! write lands atomically via a temp file and a rename.

use crate::error::BeaconError;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

/// Write `bytes` to `path` atomically.
///
/// The data goes to a sibling temp file which is synced and renamed over
/// the target, so readers see either the old or the new contents.
///
/// # Errors
///
/// Returns any I/O error from creating, writing or renaming the file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

enum Command {
    Write { path: PathBuf, bytes: Vec<u8> },
    Flush(oneshot::Sender<()>),
}

/// Handle to the background writer.
#[derive(Clone)]
pub struct Persister {
    tx: mpsc::UnboundedSender<Command>,
}

impl Persister {
    /// Spawn the writer task. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(rx));
        Self { tx }
    }

    /// Queue `bytes` for `path`. Never blocks and never fails; a write that
    /// cannot be queued or performed is logged.
    pub fn save(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        let path = path.into();
        if self.tx.send(Command::Write { path, bytes }).is_err() {
            let err = BeaconError::persistence("persistence task has stopped");
            tracing::error!("{}", err);
        }
    }

    /// Wait until every write queued before this call is on disk.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Command::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(first) = rx.recv().await {
        let mut pending: VecDeque<(PathBuf, Vec<u8>)> = VecDeque::new();
        let mut waiters = Vec::new();

        let mut next = Some(first);
        while let Some(command) = next {
            match command {
                Command::Write { path, bytes } => {
                    if let Some(slot) = pending.iter_mut().find(|(p, _)| *p == path) {
                        slot.1 = bytes;
                    } else {
                        pending.push_back((path, bytes));
                    }
                }
                Command::Flush(done) => waiters.push(done),
            }
            next = rx.try_recv().ok();
        }

        for (path, bytes) in pending {
            let target = path.clone();
            let result = tokio::task::spawn_blocking(move || write_atomic(&target, &bytes)).await;
            match result {
                Ok(Ok(())) => tracing::debug!("Saved {}", path.display()),
                Ok(Err(e)) => {
                    let err = BeaconError::Persistence(Cow::Owned(format!(
                        "{}: {}",
                        path.display(),
                        e
                    )));
                    tracing::error!("{}", err);
                }
                Err(e) => tracing::error!("Save task for {} panicked: {}", path.display(), e),
            }
        }

        for done in waiters {
            let _ = done.send(());
        }
    }
}
