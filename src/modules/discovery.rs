//! Discovery of mount-instance control sockets.
//!
//! The socket directory is scanned once at startup and then watched with
//! inotify. Every socket that appears gets a client session; a socket that
//! disappears has its session queued for removal.

use super::context::DaemonContext;
use super::session::ClientSession;
use anyhow::{Context, Result};
use log::{debug, info, warn};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio_util::sync::CancellationToken;

/// Change observed in the socket directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A directory entry was created or moved in.
    Appeared(PathBuf),
    /// A directory entry was deleted or moved out.
    Vanished(PathBuf),
    /// The kernel queue overflowed; events were lost.
    Overflow,
}

/// Owns the inotify descriptor and closes it on drop.
struct InotifyFd(Inotify);

impl AsRawFd for InotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl Drop for InotifyFd {
    fn drop(&mut self) {
        if let Err(e) = nix::unistd::close(self.0.as_raw_fd()) {
            debug!("Closing inotify descriptor: {}", e);
        }
    }
}

/// Inotify watch on one directory, readable from async code.
pub struct SocketWatcher {
    dir: PathBuf,
    fd: AsyncFd<InotifyFd>,
}

impl SocketWatcher {
    /// Starts watching `dir` for entries being created, deleted or moved.
    pub fn new(dir: &Path) -> Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .context("initialising inotify")?;
        let fd = InotifyFd(inotify);
        fd.0.add_watch(
            dir,
            AddWatchFlags::IN_CREATE
                | AddWatchFlags::IN_DELETE
                | AddWatchFlags::IN_MOVED_TO
                | AddWatchFlags::IN_MOVED_FROM,
        )
        .with_context(|| format!("watching {}", dir.display()))?;

        Ok(SocketWatcher {
            dir: dir.to_path_buf(),
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Waits for the next batch of directory changes.
    pub async fn next_events(&self) -> io::Result<Vec<SocketEvent>> {
        loop {
            let mut guard = self.fd.readable().await?;
            let read = guard.try_io(|fd| fd.get_ref().0.read_events().map_err(io::Error::from));
            match read {
                Ok(events) => return Ok(self.translate(events?)),
                Err(_would_block) => continue,
            }
        }
    }

    fn translate(&self, events: Vec<nix::sys::inotify::InotifyEvent>) -> Vec<SocketEvent> {
        events
            .into_iter()
            .filter_map(|event| {
                if event.mask.contains(AddWatchFlags::IN_Q_OVERFLOW) {
                    return Some(SocketEvent::Overflow);
                }
                let path = self.dir.join(event.name?);
                if event
                    .mask
                    .intersects(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO)
                {
                    Some(SocketEvent::Appeared(path))
                } else if event
                    .mask
                    .intersects(AddWatchFlags::IN_DELETE | AddWatchFlags::IN_MOVED_FROM)
                {
                    Some(SocketEvent::Vanished(path))
                } else {
                    None
                }
            })
            .collect()
    }
}

/// Whether `path` is a Unix socket (symlinks are not followed).
pub fn is_socket(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_socket())
        .unwrap_or(false)
}

/// Sockets currently in `dir`, sorted by path.
pub fn existing_sockets(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut sockets = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if is_socket(&path) {
            sockets.push(path);
        }
    }
    sockets.sort();
    Ok(sockets)
}

/// Connects to a socket in its own task so a silent peer never blocks discovery.
fn spawn_session(ctx: &Arc<DaemonContext>, path: PathBuf) {
    if !is_socket(&path) {
        debug!("Ignoring non-socket {}", path.display());
        return;
    }
    let ctx = ctx.clone();
    tokio::spawn(async move {
        if ctx.is_shutting_down() {
            return;
        }
        if let Err(e) = ClientSession::connect(ctx, path.clone()).await {
            warn!("Could not start session on {}: {}", path.display(), e);
        }
    });
}

/// Watches the configured socket directory until `stop` is cancelled.
pub async fn watch(ctx: Arc<DaemonContext>, stop: CancellationToken) -> Result<()> {
    let dir = ctx.config().socket_dir.clone();
    fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    // Watch before scanning so a socket created in between is not missed.
    let watcher = SocketWatcher::new(&dir)?;
    let existing = existing_sockets(&dir)?;
    info!("Found {} existing sockets in {}", existing.len(), dir.display());
    for path in existing {
        spawn_session(&ctx, path);
    }

    loop {
        let events = tokio::select! {
            _ = stop.cancelled() => break,
            events = watcher.next_events() => events.context("reading inotify events")?,
        };
        for event in events {
            match event {
                SocketEvent::Appeared(path) => {
                    if ctx.sessions().get(&path).is_none() {
                        spawn_session(&ctx, path);
                    }
                }
                SocketEvent::Vanished(path) => {
                    debug!("Socket {} removed", path.display());
                    ctx.sessions().remove_path(&path);
                }
                SocketEvent::Overflow => {
                    warn!("Inotify queue overflowed, rescanning {}", dir.display());
                    for path in existing_sockets(&dir)? {
                        if ctx.sessions().get(&path).is_none() {
                            spawn_session(&ctx, path);
                        }
                    }
                }
            }
        }
    }
    debug!("Socket watcher stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::context::testing;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_existing_sockets_ignores_other_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("notes.txt"), "x")?;
        fs::create_dir(dir.path().join("sub"))?;
        let _b = UnixListener::bind(dir.path().join("b.sock"))?;
        let _a = UnixListener::bind(dir.path().join("a.sock"))?;

        assert_eq!(
            existing_sockets(dir.path())?,
            vec![dir.path().join("a.sock"), dir.path().join("b.sock")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_watcher_reports_appearing_and_vanishing_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let watcher = SocketWatcher::new(dir.path())?;
        let path = dir.path().join("m.sock");

        let listener = UnixListener::bind(&path)?;
        let events = watcher.next_events().await?;
        assert!(events.contains(&SocketEvent::Appeared(path.clone())));

        drop(listener);
        fs::remove_file(&path)?;
        let events = watcher.next_events().await?;
        assert!(events.contains(&SocketEvent::Vanished(path)));
        Ok(())
    }

    #[tokio::test]
    async fn test_watch_connects_and_removes_sessions() -> Result<()> {
        let (_dir, ctx) = testing::context();
        let socket_dir = ctx.config().socket_dir.clone();
        let early = UnixListener::bind(socket_dir.join("early.sock"))?;

        let stop = CancellationToken::new();
        let removals = tokio::spawn({
            let ctx = ctx.clone();
            let stop = stop.clone();
            async move { ctx.sessions().run_removals(stop).await }
        });
        let watching = tokio::spawn(watch(ctx.clone(), stop.clone()));

        let (mut early_peer, _) = early.accept().await?;
        early_peer
            .write_all(b"{\"op\":\"hello\",\"user\":\"001002\",\"mountpoint\":\"/mnt/a\"}\n")
            .await?;

        let late_path = socket_dir.join("late.sock");
        let late = UnixListener::bind(&late_path)?;
        let (mut late_peer, _) = late.accept().await?;
        late_peer
            .write_all(b"{\"op\":\"hello\",\"user\":\"001003\",\"mountpoint\":\"/mnt/b\"}\n")
            .await?;

        for _ in 0..200 {
            if ctx.sessions().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(ctx.sessions().len(), 2);

        drop(late);
        fs::remove_file(&late_path)?;
        for _ in 0..200 {
            if ctx.sessions().get(&late_path).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ctx.sessions().get(&late_path).is_none());
        assert!(ctx.sessions().find("001002").is_some());

        let mut lines = BufReader::new(late_peer).lines();
        assert_eq!(lines.next_line().await?, None);

        stop.cancel();
        watching.await??;
        removals.await?;
        ctx.sessions().close_all().await;
        Ok(())
    }
}
