//! Operational audit record.
//!
//! One line per event, `[05Mar2024 1432:07 UTC]message`, appended to
//! `record<DDMonYYYY>` in the storage directory. When the active file grows
//! past the rotation threshold it is renamed with an `.HH` suffix and the
//! next record starts a fresh file. Writing the record never fails the
//! caller; problems go to the tracing log.
//!
//! Async code records through a [`RecordQueue`], which hands lines to a
//! single writer task so event handling never waits on the file.

use chrono::{DateTime, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};

/// Size after which the active record file is rotated (5 MiB)
pub const ROTATE_BYTES: u64 = 5 * 1024 * 1024;

const LINE_TIME_FORMAT: &str = "%d%b%Y %H%M:%S UTC";
const FILE_DATE_FORMAT: &str = "%d%b%Y";

/// Appends audit lines to the dated record file.
#[derive(Debug)]
pub struct Recorder {
    dir: PathBuf,
    enabled: bool,
    rotate_bytes: u64,
    guard: Mutex<()>,
}

impl Recorder {
    /// Recorder writing into `dir`; `enabled = false` makes every call a no-op
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            enabled,
            rotate_bytes: ROTATE_BYTES,
            guard: Mutex::new(()),
        }
    }

    /// A recorder that never writes
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(PathBuf::new(), false)
    }

    /// Override the rotation threshold
    #[must_use]
    pub fn with_rotate_bytes(mut self, rotate_bytes: u64) -> Self {
        self.rotate_bytes = rotate_bytes;
        self
    }

    /// Whether records are written
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Active record file for `now`
    #[must_use]
    pub fn active_path(&self, now: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("record{}", now.format(FILE_DATE_FORMAT)))
    }

    /// Append `message` stamped with the current time.
    pub fn record(&self, message: impl AsRef<str>) {
        self.record_at(Utc::now(), message.as_ref());
    }

    /// Append `message` stamped with `now`.
    pub fn record_at(&self, now: DateTime<Utc>, message: &str) {
        if !self.enabled {
            return;
        }
        let _guard = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = self.append(now, message) {
            tracing::error!("Failed to write record: {}", e);
        }
    }

    fn append(&self, now: DateTime<Utc>, message: &str) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.active_path(now);
        {
            let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
            writeln!(file, "[{}]{}", now.format(LINE_TIME_FORMAT), message)?;
        }

        if fs::metadata(&path)?.len() > self.rotate_bytes {
            let rotated = rotated_path(&path, now);
            fs::rename(&path, &rotated)?;
            tracing::info!("Rotated record to {}", rotated.display());
        }
        Ok(())
    }
}

enum Queued {
    Line(DateTime<Utc>, String),
    Flush(oneshot::Sender<()>),
}

/// Ordered, non-blocking front end to a [`Recorder`].
#[derive(Clone)]
pub struct RecordQueue {
    recorder: Arc<Recorder>,
    tx: mpsc::UnboundedSender<Queued>,
}

impl RecordQueue {
    /// Spawn the writer task. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn spawn(recorder: Arc<Recorder>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_queued(Arc::clone(&recorder), rx));
        Self { recorder, tx }
    }

    /// Queue `message`, stamped now. Lines reach the file in call order.
    pub fn record(&self, message: impl Into<String>) {
        if !self.recorder.is_enabled() {
            return;
        }
        if self.tx.send(Queued::Line(Utc::now(), message.into())).is_err() {
            tracing::error!("Record writer has stopped, line dropped");
        }
    }

    /// Wait until every line queued before this call is written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Queued::Flush(done_tx)).is_err() {
            return;
        }
        let _ = done_rx.await;
    }
}

async fn write_queued(recorder: Arc<Recorder>, mut rx: mpsc::UnboundedReceiver<Queued>) {
    while let Some(first) = rx.recv().await {
        let mut lines = Vec::new();
        let mut waiters = Vec::new();

        let mut next = Some(first);
        while let Some(queued) = next {
            match queued {
                Queued::Line(at, message) => lines.push((at, message)),
                Queued::Flush(done) => waiters.push(done),
            }
            next = rx.try_recv().ok();
        }

        if !lines.is_empty() {
            let recorder = Arc::clone(&recorder);
            let written = tokio::task::spawn_blocking(move || {
                for (at, message) in lines {
                    recorder.record_at(at, &message);
                }
            })
            .await;
            if let Err(e) = written {
                tracing::error!("Record writer failed: {}", e);
            }
        }

        for done in waiters {
            let _ = done.send(());
        }
    }
}

fn rotated_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{}", now.format("%H")));
    PathBuf::from(name)
}
