//! Output sinks for console replies and observer broadcasts.
//!
//! Command handlers and plugins write through an `OutputSink`. A
//! `ConnectionSink` writes to one console connection; a `BroadcastSink` writes
//! to every registered observer and drops observers whose connection failed.

use async_trait::async_trait;
use futures::future::join_all;
use log::{debug, warn};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Line-oriented output target.
#[async_trait]
pub trait OutputSink: Send + Sync {
    /// Writes one line; a trailing newline is added when missing.
    async fn write_line(&self, line: &str) -> io::Result<()>;

    /// Flushes buffered output.
    async fn flush(&self) -> io::Result<()>;
}

/// Sink writing to a single connection.
///
/// Clones share the same underlying writer, so a connection registered as an
/// observer and used for command replies keeps its lines in order.
#[derive(Clone)]
pub struct ConnectionSink {
    id: Uuid,
    writer: Arc<tokio::sync::Mutex<BoxedWriter>>,
}

impl ConnectionSink {
    /// Wraps a writer.
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id: Uuid::new_v4(),
            writer: Arc::new(tokio::sync::Mutex::new(Box::new(writer))),
        }
    }

    /// Identity used to unregister the sink from the observer set.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Writes raw text without adding a newline.
    pub async fn write_raw(&self, text: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(text.as_bytes()).await?;
        writer.flush().await
    }
}

#[async_trait]
impl OutputSink for ConnectionSink {
    async fn write_line(&self, line: &str) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        if !line.ends_with('\n') {
            writer.write_all(b"\n").await?;
        }
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        self.writer.lock().await.flush().await
    }
}

/// Console connections that receive status and file-operation records.
#[derive(Default)]
pub struct Observers {
    sinks: Mutex<Vec<ConnectionSink>>,
}

impl Observers {
    /// Creates an empty observer set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection.
    pub fn add(&self, sink: ConnectionSink) {
        self.sinks.lock().push(sink);
    }

    /// Unregisters a connection; unknown ids are ignored.
    pub fn remove(&self, id: Uuid) {
        self.sinks.lock().retain(|s| s.id != id);
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Whether no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.sinks.lock().is_empty()
    }

    /// Writes a line to every observer.
    ///
    /// Observers whose write fails are closed and removed; the broadcast
    /// itself never fails.
    pub async fn broadcast(&self, line: &str) {
        let sinks: Vec<ConnectionSink> = self.sinks.lock().clone();
        if sinks.is_empty() {
            return;
        }

        let results = join_all(sinks.iter().map(|sink| async move {
            sink.write_line(line).await?;
            sink.flush().await
        }))
        .await;

        let failed: Vec<Uuid> = sinks
            .iter()
            .zip(results)
            .filter_map(|(sink, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!("Dropping observer {}: {}", sink.id, e);
                    Some(sink.id)
                }
            })
            .collect();

        if !failed.is_empty() {
            self.sinks.lock().retain(|s| !failed.contains(&s.id));
            debug!("{} observers left", self.len());
        }
    }
}

/// Sink forwarding every line to all observers.
pub struct BroadcastSink<'a> {
    observers: &'a Observers,
}

impl<'a> BroadcastSink<'a> {
    /// Creates a sink over the given observer set.
    pub fn new(observers: &'a Observers) -> Self {
        Self { observers }
    }
}

#[async_trait]
impl OutputSink for BroadcastSink<'_> {
    async fn write_line(&self, line: &str) -> io::Result<()> {
        self.observers.broadcast(line).await;
        Ok(())
    }

    async fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_connection_sink_appends_newline() -> anyhow::Result<()> {
        let (client, server) = duplex(1024);
        let sink = ConnectionSink::new(server);
        sink.write_line("hello").await?;
        sink.write_line("world\n").await?;
        sink.flush().await?;

        let mut lines = BufReader::new(client).lines();
        assert_eq!(lines.next_line().await?.as_deref(), Some("hello"));
        assert_eq!(lines.next_line().await?.as_deref(), Some("world"));
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_observers() -> anyhow::Result<()> {
        let observers = Observers::new();
        let (a_client, a_server) = duplex(1024);
        let (b_client, b_server) = duplex(1024);
        observers.add(ConnectionSink::new(a_server));
        observers.add(ConnectionSink::new(b_server));

        BroadcastSink::new(&observers)
            .write_line(r#"{"state":"success"}"#)
            .await?;

        for client in [a_client, b_client] {
            let mut lines = BufReader::new(client).lines();
            assert_eq!(
                lines.next_line().await?.as_deref(),
                Some(r#"{"state":"success"}"#)
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_broken_observer_is_dropped() {
        let observers = Observers::new();
        let (client, server) = duplex(64);
        drop(client);
        observers.add(ConnectionSink::new(server));
        let (_alive_client, alive_server) = duplex(1024);
        observers.add(ConnectionSink::new(alive_server));

        observers.broadcast("line").await;
        assert_eq!(observers.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_observer() {
        let observers = Observers::new();
        let (_client, server) = duplex(64);
        let sink = ConnectionSink::new(server);
        let id = sink.id();
        observers.add(sink);
        observers.remove(id);
        observers.remove(id);
        assert!(observers.is_empty());
    }
}
