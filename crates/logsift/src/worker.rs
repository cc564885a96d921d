//! Runs an engine on a tokio task behind a message channel.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::engine::AnomalyEngine;
use crate::error::{Result, SiftError};
use crate::types::{Anomaly, LogEntry};

enum Command {
    Entry(Box<LogEntry>),
    Flush(oneshot::Sender<Vec<Anomaly>>),
    Shutdown(oneshot::Sender<()>),
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Entry(entry) => f.debug_tuple("Entry").field(entry).finish(),
            Self::Flush(_) => f.write_str("Flush"),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

/// Spawns engine tasks.
#[derive(Debug, Clone, Copy)]
pub struct EngineWorker;

impl EngineWorker {
    /// Moves `engine` onto a new task.
    ///
    /// Entries submitted through the returned handle are processed in order;
    /// anomalies they raise are streamed on the returned receiver. Both
    /// channels hold at most `capacity` items. Dropping the receiver does not
    /// stop the worker.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        engine: Arc<AnomalyEngine>,
        capacity: usize,
    ) -> (EngineHandle, mpsc::Receiver<Anomaly>) {
        let capacity = capacity.max(1);
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let (anomaly_tx, anomaly_rx) = mpsc::channel(capacity);

        tokio::spawn(run(engine, cmd_rx, anomaly_tx));
        info!(capacity, "engine worker started");

        (EngineHandle { tx: cmd_tx }, anomaly_rx)
    }
}

async fn run(
    engine: Arc<AnomalyEngine>,
    mut commands: mpsc::Receiver<Command>,
    anomalies: mpsc::Sender<Anomaly>,
) {
    let mut listener_gone = false;
    let mut acks = Vec::new();
    // after a shutdown request the channel is closed and drained
    while let Some(command) = commands.recv().await {
        match command {
            Command::Entry(entry) => {
                for anomaly in engine.process(&entry) {
                    if listener_gone {
                        break;
                    }
                    if anomalies.send(anomaly).await.is_err() {
                        warn!("anomaly receiver dropped; discarding further anomalies");
                        listener_gone = true;
                    }
                }
            }
            Command::Flush(reply) => {
                if reply.send(engine.detect_current_anomalies()).is_err() {
                    debug!("flush requester went away");
                }
            }
            Command::Shutdown(ack) => {
                commands.close();
                acks.push(ack);
            }
        }
    }
    info!(entries = engine.entries_processed(), "engine worker stopped");
    for ack in acks {
        let _ = ack.send(());
    }
}

/// Cloneable sender side of an [`EngineWorker`].
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    /// Queues an entry, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns [`SiftError::EngineStopped`] once the worker has shut down.
    pub async fn submit(&self, entry: LogEntry) -> Result<()> {
        self.tx
            .send(Command::Entry(Box::new(entry)))
            .await
            .map_err(|_| SiftError::EngineStopped)
    }

    /// Returns the engine's summary anomalies after all queued entries.
    ///
    /// # Errors
    ///
    /// Returns [`SiftError::EngineStopped`] once the worker has shut down.
    pub async fn flush(&self) -> Result<Vec<Anomaly>> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(Command::Flush(reply))
            .await
            .map_err(|_| SiftError::EngineStopped)?;
        response.await.map_err(|_| SiftError::EngineStopped)
    }

    /// Stops the worker after it finishes the entries already queued.
    ///
    /// # Errors
    ///
    /// Returns [`SiftError::EngineStopped`] if the worker was already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(ack))
            .await
            .map_err(|_| SiftError::EngineStopped)?;
        done.await.map_err(|_| SiftError::EngineStopped)
    }

    /// Whether the worker has stopped accepting commands.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogLevel;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn streams_anomalies_from_submitted_entries() {
        let engine = Arc::new(AnomalyEngine::new());
        let (handle, mut rx) = EngineWorker::spawn(Arc::clone(&engine), 16);

        handle
            .submit(LogEntry::new(ts(0), LogLevel::Error, "CRITICAL disk failure").with_source("db"))
            .await
            .unwrap();

        let anomaly = rx.recv().await.unwrap();
        assert_eq!(anomaly.detector, "rules");
        assert_eq!(anomaly.source.as_deref(), Some("db"));

        handle.shutdown().await.unwrap();
        assert_eq!(engine.entries_processed(), 1);
    }

    #[tokio::test]
    async fn flush_sees_queued_entries() {
        let engine = Arc::new(AnomalyEngine::new());
        let (handle, _rx) = EngineWorker::spawn(Arc::clone(&engine), 64);
        for i in 0..5 {
            handle
                .submit(LogEntry::new(ts(i), LogLevel::Info, "plain").with_source("web"))
                .await
                .unwrap();
        }
        handle.flush().await.unwrap();
        assert_eq!(engine.entries_processed(), 5);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn submit_after_shutdown_fails() {
        let (handle, _rx) = EngineWorker::spawn(Arc::new(AnomalyEngine::new()), 4);
        let other = handle.clone();
        handle.shutdown().await.unwrap();

        assert!(other.is_closed());
        let err = other
            .submit(LogEntry::new(ts(0), LogLevel::Info, "late"))
            .await
            .unwrap_err();
        assert!(matches!(err, SiftError::EngineStopped));
        assert!(matches!(other.flush().await, Err(SiftError::EngineStopped)));
        assert!(matches!(other.shutdown().await, Err(SiftError::EngineStopped)));
    }

    #[tokio::test]
    async fn dropped_receiver_does_not_stop_worker() {
        let engine = Arc::new(AnomalyEngine::new());
        let (handle, rx) = EngineWorker::spawn(Arc::clone(&engine), 1);
        drop(rx);
        for i in 0..3 {
            handle
                .submit(LogEntry::new(ts(i), LogLevel::Error, "ERROR again"))
                .await
                .unwrap();
        }
        handle.flush().await.unwrap();
        assert_eq!(engine.entries_processed(), 3);
    }
}
