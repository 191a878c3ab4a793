//! Senders that write JSON lines locally instead of publishing.

use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::File;
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::event::Envelope;
use crate::queued::DEFAULT_BUFFER_SIZE;
use crate::sender::{EventSender, SenderError};

fn json_line(envelope: &Envelope) -> Result<Vec<u8>, SenderError> {
    let mut line = envelope.event.to_json()?;
    line.push(b'\n');
    Ok(line)
}

/// Writes each event as one JSON line to a writer.
pub struct WriterEventSender {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl WriterEventSender {
    /// Write to `writer`.
    #[must_use]
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Write to standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Write to standard error.
    #[must_use]
    pub fn stderr() -> Self {
        Self::new(Box::new(io::stderr()))
    }

    fn write(&self, envelope: &Envelope) -> Result<(), SenderError> {
        let line = json_line(envelope)?;
        self.writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_all(&line)
            .map_err(|e| SenderError::Io(e.to_string()))
    }
}

impl std::fmt::Debug for WriterEventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriterEventSender").finish_non_exhaustive()
    }
}

impl EventSender for WriterEventSender {
    fn send(&self, envelope: Envelope) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        if let Err(err) = self.write(&envelope) {
            tracing::warn!(event_type = envelope.event_type(), error = %err, "Failed to write event");
        }
        Box::pin(async {})
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        let flushed = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .flush()
            .map_err(|e| SenderError::Io(e.to_string()));
        Box::pin(async move { flushed })
    }
}

/// Writes JSON lines into a gzip file from a dedicated blocking worker.
///
/// `send` waits for queue space, so no event is dropped.
pub struct GzipEventSender {
    path: PathBuf,
    queue: Mutex<Option<mpsc::Sender<Envelope>>>,
    worker: Mutex<Option<JoinHandle<Result<(), SenderError>>>>,
}

impl GzipEventSender {
    /// Create (or truncate) `path` and start the worker.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Io`] if the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SenderError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .map_err(|e| SenderError::Io(format!("open file {}: {e}", path.display())))?;

        let (tx, rx) = mpsc::channel(DEFAULT_BUFFER_SIZE);
        let worker = tokio::task::spawn_blocking(move || write_gzip(file, rx));

        tracing::info!(path = %path.display(), "Writing events to gzip file");
        Ok(Self {
            path,
            queue: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The output file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_gzip(file: File, mut queue: mpsc::Receiver<Envelope>) -> Result<(), SenderError> {
    let mut gz = GzEncoder::new(file, Compression::fast());
    let io_error = |e: io::Error| SenderError::Io(e.to_string());

    while let Some(envelope) = queue.blocking_recv() {
        match json_line(&envelope) {
            Ok(line) => gz.write_all(&line).map_err(io_error)?,
            Err(err) => {
                tracing::warn!(event_type = envelope.event_type(), error = %err, "Skipping event");
            }
        }
    }

    gz.finish().map_err(io_error)?.sync_all().map_err(io_error)
}

impl std::fmt::Debug for GzipEventSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GzipEventSender")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl EventSender for GzipEventSender {
    fn send(&self, envelope: Envelope) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let queue = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        Box::pin(async move {
            let Some(queue) = queue else {
                tracing::warn!(event_type = envelope.event_type(), "Gzip sender is closed");
                return;
            };
            if queue.send(envelope).await.is_err() {
                tracing::warn!("Gzip worker stopped, event discarded");
            }
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), SenderError>> + Send + '_>> {
        drop(self.queue.lock().unwrap_or_else(PoisonError::into_inner).take());
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        Box::pin(async move {
            match worker {
                Some(worker) => worker
                    .await
                    .map_err(|e| SenderError::Worker(e.to_string()))?,
                None => Ok(()),
            }
        })
    }
}
