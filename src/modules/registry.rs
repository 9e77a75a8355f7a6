//! Registry of live client sessions.
//!
//! Sessions are added by discovery once their handshake succeeded. Every
//! removal, whether a session reports its own failure or discovery sees its
//! socket disappear, goes through one queue drained by a single task, so the
//! live set is never mutated while a removal is half done.

use super::proto::Command;
use super::session::ClientSession;
use futures::future::join_all;
use log::{debug, info};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Live sessions keyed by control socket path.
pub struct SessionRegistry {
    sessions: Mutex<BTreeMap<PathBuf, Arc<ClientSession>>>,
    removal_tx: mpsc::UnboundedSender<Arc<ClientSession>>,
    removal_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<ClientSession>>>,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        let (removal_tx, removal_rx) = mpsc::unbounded_channel();
        SessionRegistry {
            sessions: Mutex::new(BTreeMap::new()),
            removal_tx,
            removal_rx: tokio::sync::Mutex::new(removal_rx),
        }
    }

    /// Sender end of the removal queue, handed to each new session.
    pub fn removal_sender(&self) -> mpsc::UnboundedSender<Arc<ClientSession>> {
        self.removal_tx.clone()
    }

    /// Registers a session. A stale session at the same path is queued for removal.
    pub fn add(&self, session: Arc<ClientSession>) {
        let previous = self
            .sessions
            .lock()
            .insert(session.path().to_path_buf(), session.clone());
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &session) {
                debug!("Replacing stale session at {}", previous.path().display());
                previous.request_removal();
            }
        }
    }

    /// Queues the session registered at `path` for removal, if any.
    pub fn remove_path(&self, path: &Path) {
        let session = self.sessions.lock().get(path).cloned();
        match session {
            Some(session) => session.request_removal(),
            None => debug!("No session registered at {}", path.display()),
        }
    }

    /// Drains the removal queue until `stop` is cancelled.
    ///
    /// A session is dropped from the live set only if it is still the one
    /// registered at its path; it is closed either way. Closing an already
    /// closed session is a no-op, which makes removal idempotent.
    pub async fn run_removals(&self, stop: CancellationToken) {
        let mut queue = self.removal_rx.lock().await;
        loop {
            let session = tokio::select! {
                _ = stop.cancelled() => break,
                next = queue.recv() => match next {
                    Some(session) => session,
                    None => break,
                },
            };

            let removed = {
                let mut sessions = self.sessions.lock();
                match sessions.get(session.path()) {
                    Some(current) if Arc::ptr_eq(current, &session) => {
                        sessions.remove(session.path());
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                info!("Removing session {}", session.describe());
            }
            session.close().await;
        }
        debug!("Removal queue stopped");
    }

    /// Closes every live session. Used during shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<ClientSession>> = std::mem::take(&mut *self.sessions.lock())
            .into_values()
            .collect();
        info!("Closing {} sessions", sessions.len());
        join_all(sessions.iter().map(|s| s.close())).await;
    }

    /// Live sessions, ordered by socket path.
    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.lock().values().cloned().collect()
    }

    /// Session registered at `path`.
    pub fn get(&self, path: &Path) -> Option<Arc<ClientSession>> {
        self.sessions.lock().get(path).cloned()
    }

    /// First session whose announced user or mount point equals `selector`.
    pub fn find(&self, selector: &str) -> Option<Arc<ClientSession>> {
        self.snapshot().into_iter().find(|session| {
            let details = session.details();
            details.user.as_deref() == Some(selector) || details.mountpoint == selector
        })
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Writes `command` to every live session concurrently.
    ///
    /// Returns the number of sessions the write succeeded on. Failing
    /// sessions schedule their own removal.
    pub async fn sendall(&self, command: &Command) -> usize {
        let sessions = self.snapshot();
        debug!("Sending {} to {} sessions", command, sessions.len());
        join_all(sessions.iter().map(|s| s.write(command)))
            .await
            .into_iter()
            .filter(|sent| *sent)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use crate::modules::context::testing;
    use crate::modules::proto::Command;
    use crate::modules::session::SessionState;
    use anyhow::Result;
    use std::path::Path;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_find_by_user_or_mountpoint() {
        let (_dir, ctx) = testing::context();
        let (a, _pa) = testing::attach(&ctx, "/run/a.sock", "001002", "/mnt/a").await;
        let (b, _pb) = testing::attach(&ctx, "/run/b.sock", "001003", "/mnt/b").await;

        assert_eq!(ctx.sessions().find("001003").map(|s| s.id()), Some(b.id()));
        assert_eq!(ctx.sessions().find("/mnt/a").map(|s| s.id()), Some(a.id()));
        assert!(ctx.sessions().find("nobody").is_none());
        assert_eq!(ctx.sessions().len(), 2);
        ctx.sessions().close_all().await;
        assert!(ctx.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_sendall_reaches_every_session() -> Result<()> {
        let (_dir, ctx) = testing::context();
        let (_a, pa) = testing::attach(&ctx, "/run/a.sock", "001002", "/mnt/a").await;
        let (_b, pb) = testing::attach(&ctx, "/run/b.sock", "001003", "/mnt/b").await;

        assert_eq!(ctx.sessions().sendall(&Command::ForceReload).await, 2);
        for peer in [pa, pb] {
            let mut lines = BufReader::new(peer).lines();
            assert_eq!(lines.next_line().await?.as_deref(), Some("FORCE-RELOAD"));
        }
        ctx.sessions().close_all().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_sendall_without_sessions_is_a_no_op() {
        let (_dir, ctx) = testing::context();
        assert_eq!(ctx.sessions().sendall(&Command::ClearCache).await, 0);
    }

    #[tokio::test]
    async fn test_removal_is_idempotent_and_spares_replacements() -> Result<()> {
        let (_dir, ctx) = testing::context();
        let stop = CancellationToken::new();
        let worker = tokio::spawn({
            let ctx = ctx.clone();
            let stop = stop.clone();
            async move { ctx.sessions().run_removals(stop).await }
        });

        let (old, _old_peer) = testing::attach(&ctx, "/run/a.sock", "001002", "/mnt/a").await;
        let (new, _new_peer) = testing::attach(&ctx, "/run/a.sock", "001002", "/mnt/a").await;

        old.request_removal();
        old.request_removal();
        ctx.sessions().remove_path(Path::new("/run/missing.sock"));

        for _ in 0..100 {
            if old.state() == SessionState::Closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(old.state(), SessionState::Closed);
        assert_eq!(
            ctx.sessions().get(Path::new("/run/a.sock")).map(|s| s.id()),
            Some(new.id())
        );

        ctx.sessions().remove_path(Path::new("/run/a.sock"));
        for _ in 0..100 {
            if ctx.sessions().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ctx.sessions().is_empty());

        stop.cancel();
        worker.await?;
        Ok(())
    }
}
