//! Delivery of diagnostic envelopes.
//!
//! The watchdog hands finished events and session updates to a
//! [`Transport`]. Delivery to a remote collector belongs to the embedder;
//! [`JsonLinesTransport`] writes one JSON object per line to any writer and
//! is the default (stderr).

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::TransportError;
use crate::event::DiagnosticEvent;
use crate::unit::Session;

/// A unit of delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Envelope {
    Event(Box<DiagnosticEvent>),
    Session(Session),
}

impl Envelope {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Event(_) => "event",
            Self::Session(_) => "session",
        }
    }
}

/// Delivery sink for envelopes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue or deliver one envelope.
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError>;

    /// Wait up to `timeout` for queued envelopes to be delivered.
    ///
    /// Returns `Ok(false)` if anything may still be pending at the deadline.
    async fn flush(&self, timeout: Duration) -> Result<bool, TransportError>;
}

/// Writes each envelope as a single JSON line.
///
/// Writes and flushes run on tokio's blocking pool, so a stalled pipe
/// parks a blocking thread instead of the supervisor's tick loop. Must be
/// used from within a tokio runtime.
pub struct JsonLinesTransport<W> {
    writer: Arc<Mutex<W>>,
}

impl<W: Write + Send + 'static> JsonLinesTransport<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(writer)),
        }
    }

    /// Recover the writer. `None` while a write is still in flight.
    pub fn into_inner(self) -> Option<W> {
        Arc::try_unwrap(self.writer).ok().map(Mutex::into_inner)
    }

    async fn with_writer<F>(&self, op: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut W) -> std::io::Result<()> + Send + 'static,
    {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || op(&mut writer.lock()))
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

impl JsonLinesTransport<std::io::Stderr> {
    #[must_use]
    pub fn stderr() -> Self {
        Self::new(std::io::stderr())
    }
}

impl<W> std::fmt::Debug for JsonLinesTransport<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonLinesTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl<W: Write + Send + 'static> Transport for JsonLinesTransport<W> {
    async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');
        let bytes = line.len();
        self.with_writer(move |writer| writer.write_all(&line)).await?;
        trace!(kind = envelope.kind(), bytes, "Envelope written");
        Ok(())
    }

    async fn flush(&self, _timeout: Duration) -> Result<bool, TransportError> {
        self.with_writer(|writer| writer.flush()).await?;
        Ok(true)
    }
}
