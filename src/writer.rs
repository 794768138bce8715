//! Resumable write sessions.
//!
//! A [`BlobWriter`] buffers bytes into a bounded channel that a single
//! background task drains into one segmented put: a leading copy segment
//! covering the already-stored range when resuming, then a direct
//! segment consuming the live stream. Appending therefore never buffers
//! the previously stored bytes locally.
//!
//! The session is single-use: `close`, `commit` and `cancel` are
//! mutually exclusive terminal transitions, each of which joins the
//! background task before returning. A failure captured inside the
//! background task re-surfaces on the next `write`, `close` or `commit`.

use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

use crate::errors::{DriverError, SessionState};
use crate::invalidator::CacheInvalidator;
use crate::remote::{ByteStream, ObjectStore, Segment};

/// Chunks buffered between the producer and the upload task before
/// `write` starts blocking.
const PIPE_DEPTH: usize = 8;

/// A single-use write session for one backend key.
pub struct BlobWriter {
    store: Arc<dyn ObjectStore>,
    invalidator: CacheInvalidator,
    key: String,

    /// Bytes accepted, including the resumed range.
    size: u64,
    /// Size of the already-stored object when resuming; 0 for a fresh
    /// write.
    from: u64,

    state: Option<SessionState>,
    /// Error captured from the background task, re-surfaced on every
    /// subsequent call until a terminal transition succeeds.
    err: Option<DriverError>,

    tx: Option<mpsc::Sender<Bytes>>,
    task: Option<JoinHandle<Result<(), DriverError>>>,
}

impl BlobWriter {
    pub(crate) fn new(
        store: Arc<dyn ObjectStore>,
        invalidator: CacheInvalidator,
        key: String,
        from: u64,
    ) -> BlobWriter {
        BlobWriter {
            store,
            invalidator,
            key,
            size: from,
            from,
            state: None,
            err: None,
            tx: None,
            task: None,
        }
    }

    /// Append `buf` to the session. The upload task and its stream are
    /// created lazily on the first call.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, DriverError> {
        self.ensure_open()?;
        if let Some(err) = &self.err {
            return Err(err.clone());
        }
        if buf.is_empty() {
            return Ok(0);
        }

        if self.tx.is_none() {
            self.start_upload();
        }
        let tx = self.tx.as_ref().expect("upload channel exists after start");
        if tx.send(Bytes::copy_from_slice(buf)).await.is_err() {
            // The upload task ended early; harvest its error.
            self.join_upload().await;
            let err = self.err.get_or_insert_with(|| {
                DriverError::Transport("upload task ended unexpectedly".into())
            });
            return Err(err.clone());
        }
        self.size += buf.len() as u64;
        Ok(buf.len())
    }

    /// Bytes accepted so far, including the resumed range. Safe to call
    /// in any state.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Flush buffered bytes and wait for the upload to finish. The
    /// object is only promised durable by a successful [`commit`].
    ///
    /// [`commit`]: BlobWriter::commit
    pub async fn close(&mut self) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.join_upload().await;
        if let Some(err) = &self.err {
            warn!(key = self.key, %err, "close surfacing background upload failure");
            return Err(err.clone());
        }
        self.state = Some(SessionState::Closed);
        Ok(())
    }

    /// Flush, wait for the upload, mark the session committed and queue
    /// a CDN invalidation for the key.
    pub async fn commit(&mut self) -> Result<(), DriverError> {
        self.ensure_open()?;
        self.join_upload().await;
        if let Some(err) = &self.err {
            warn!(key = self.key, %err, "commit surfacing background upload failure");
            return Err(err.clone());
        }
        self.state = Some(SessionState::Committed);
        self.invalidator.enqueue(self.key.clone()).await;
        Ok(())
    }

    /// Stop the upload and best-effort delete whatever was already
    /// written. A failed cleanup delete is logged, never escalated.
    pub async fn cancel(&mut self) -> Result<(), DriverError> {
        self.ensure_open()?;

        self.tx = None;
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.state = Some(SessionState::Cancelled);

        if let Err(err) = self.store.delete_object(&self.key).await {
            if !err.is_not_found() {
                warn!(key = self.key, %err, "cleanup delete after cancel failed");
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), DriverError> {
        match self.state {
            Some(state) => Err(DriverError::SessionFinalized { state }),
            None => Ok(()),
        }
    }

    fn start_upload(&mut self) {
        let (tx, rx) = mpsc::channel::<Bytes>(PIPE_DEPTH);
        let store = self.store.clone();
        let key = self.key.clone();
        let from = self.from;

        debug!(key, from, "starting background segmented upload");
        self.task = Some(tokio::spawn(async move {
            let mut segments = Vec::with_capacity(2);
            if from > 0 {
                segments.push(Segment::copy(key.clone(), 0, from as i64));
            }
            let stream: ByteStream =
                Box::pin(ReceiverStream::new(rx).map(Ok::<_, std::io::Error>));
            segments.push(Segment::direct(stream));
            store.put_parts(&key, segments).await
        }));
        self.tx = Some(tx);
    }

    /// Signal end-of-input and wait for the upload task, capturing its
    /// outcome. Idempotent.
    async fn join_upload(&mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => self.err = Some(err),
                Err(join) => {
                    self.err = Some(DriverError::Transport(format!("upload task panicked: {join}")))
                }
            }
        }
    }
}

// -- Tests -------------------------------------------------------------------
