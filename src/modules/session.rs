//! Client sessions with mount instances.
//!
//! A session owns one control-socket connection. After the hello handshake
//! two tasks run per session: the read loop, which classifies incoming
//! records, and the dispatch loop, which hands file operations to the plugins
//! in arrival order. Keeping them apart lets a plugin issue a `request` on the
//! same session while the read loop delivers the answer.

use super::constants::QUEUE_LIMIT;
use super::context::DaemonContext;
use super::error::SessionError;
use super::proto::{classify, parse_hello, response_payload, Command, FileOp, Inbound};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket found, connection not yet established.
    Connecting,
    /// Connected, waiting for the hello record.
    AwaitingHello,
    /// Handshake done; records are being processed.
    Ready,
    /// `close` is running.
    Closing,
    /// Both loops have stopped and the socket is shut down.
    Closed,
}

/// Metadata of the mount instance behind a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionDetails {
    /// Owning user id, announced in the hello.
    pub user: Option<String>,
    /// Mount point of the instance.
    pub mountpoint: String,
    /// Volume holding the user's anonymous shares, once known.
    pub anonym_raid: Option<String>,
}

type RecordLines = Lines<BufReader<OwnedReadHalf>>;

/// One connected mount instance.
pub struct ClientSession {
    id: Uuid,
    path: PathBuf,
    me: Weak<ClientSession>,
    state: Mutex<SessionState>,
    details: Mutex<SessionDetails>,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    // Holding the receiver lock is what makes a caller the single in-flight request.
    responses: tokio::sync::Mutex<mpsc::Receiver<Value>>,
    request_pending: AtomicBool,
    removals: mpsc::UnboundedSender<Arc<ClientSession>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &*self.state.lock())
            .finish()
    }
}

/// Clears the pending-request flag when the request ends, however it ends.
struct PendingGuard<'a>(&'a AtomicBool);

impl<'a> PendingGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        PendingGuard(flag)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ClientSession {
    /// Connects to the control socket at `path` and runs the session.
    pub async fn connect(
        ctx: Arc<DaemonContext>,
        path: PathBuf,
    ) -> Result<Arc<ClientSession>, SessionError> {
        debug!("Connecting to {}", path.display());
        let stream = UnixStream::connect(&path).await?;
        Self::serve(ctx, path, stream).await
    }

    /// Runs the handshake on `stream`, registers the session and starts its loops.
    ///
    /// `on_client_connect` has returned for every plugin by the time this
    /// returns, and no file operation is dispatched before that point.
    ///
    /// # Errors
    ///
    /// Fails if the peer closes the connection or its first record is not a
    /// valid hello; the connection is dropped in that case.
    pub async fn serve(
        ctx: Arc<DaemonContext>,
        path: PathBuf,
        stream: UnixStream,
    ) -> Result<Arc<ClientSession>, SessionError> {
        let (read_half, write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let first = loop {
            match lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => break line,
                None => return Err(SessionError::Closed),
            }
        };
        let hello = match parse_hello(&first) {
            Ok(hello) => hello,
            Err(e) => {
                warn!("Rejecting {}: {}", path.display(), e);
                return Err(e);
            }
        };

        let (response_tx, response_rx) = mpsc::channel(QUEUE_LIMIT);
        let (file_op_tx, file_op_rx) = mpsc::channel(QUEUE_LIMIT);
        let removals = ctx.sessions().removal_sender();
        let session = Arc::new_cyclic(|me| ClientSession {
            id: Uuid::new_v4(),
            path,
            me: me.clone(),
            state: Mutex::new(SessionState::Ready),
            details: Mutex::new(SessionDetails {
                user: Some(hello.user),
                mountpoint: hello.mountpoint,
                anonym_raid: hello.anonym_raid,
            }),
            writer: tokio::sync::Mutex::new(write_half),
            responses: tokio::sync::Mutex::new(response_rx),
            request_pending: AtomicBool::new(false),
            removals,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        info!("New client connected: {}", session.describe());

        ctx.sessions().add(session.clone());

        let reader = tokio::spawn(read_loop(
            ctx.clone(),
            session.clone(),
            lines,
            response_tx,
            file_op_tx,
        ));
        session.tasks.lock().push(reader);

        ctx.plugins().client_connected(&ctx, &session).await;

        let dispatcher = tokio::spawn(dispatch_loop(ctx.clone(), session.clone(), file_op_rx));
        session.tasks.lock().push(dispatcher);

        Ok(session)
    }

    /// Unique id of this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Control socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Snapshot of the instance metadata.
    pub fn details(&self) -> SessionDetails {
        self.details.lock().clone()
    }

    /// Mount point announced in the hello.
    pub fn mountpoint(&self) -> String {
        self.details.lock().mountpoint.clone()
    }

    /// Short human-readable description for logs and the `clients` command.
    pub fn describe(&self) -> String {
        let details = self.details.lock();
        format!(
            "{} user={} mountpoint={} raid={}",
            self.path.display(),
            details.user.as_deref().unwrap_or("?"),
            details.mountpoint,
            details.anonym_raid.as_deref().unwrap_or("?")
        )
    }

    /// Owning user, queried from the instance if not already known.
    pub async fn user(&self) -> Result<String, SessionError> {
        if let Some(user) = self.details.lock().user.clone() {
            return Ok(user);
        }
        let user = payload_string(response_payload(self.request(&Command::User).await?)?);
        self.details.lock().user = Some(user.clone());
        Ok(user)
    }

    /// Volume holding the user's anonymous shares, queried once and memoized.
    pub async fn anonym_raid(&self) -> Result<String, SessionError> {
        if let Some(raid) = self.details.lock().anonym_raid.clone() {
            return Ok(raid);
        }
        let raid = payload_string(response_payload(self.request(&Command::AnonymRaid).await?)?);
        self.details.lock().anonym_raid = Some(raid.clone());
        Ok(raid)
    }

    /// Sends `command` and waits for the next record the instance sends back.
    ///
    /// At most one request per session is in flight; concurrent callers
    /// queue up. Responses left over from an earlier, abandoned request are
    /// discarded first. There is no timeout of its own, callers inside a
    /// plugin hook are bounded by the hook timeout.
    pub async fn request(&self, command: &Command) -> Result<Value, SessionError> {
        let mut responses = self.responses.lock().await;
        while let Ok(stale) = responses.try_recv() {
            debug!("Discarding stale response on {}: {}", self.path.display(), stale);
        }

        let _pending = PendingGuard::set(&self.request_pending);
        if let Err(e) = self.send_line(&command.to_line()).await {
            self.request_removal();
            return Err(e.into());
        }
        responses.recv().await.ok_or(SessionError::Closed)
    }

    /// Sends `command` without waiting for an answer.
    ///
    /// Returns whether the line went out. A failed write is logged and
    /// schedules the session for removal; the error stays here.
    pub async fn write(&self, command: &Command) -> bool {
        debug!("Sending {} to {}", command, self.path.display());
        match self.send_line(&command.to_line()).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Write to {} failed: {}", self.path.display(), e);
                self.request_removal();
                false
            }
        }
    }

    async fn send_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    /// Schedules this session for removal by the registry.
    pub fn request_removal(&self) {
        if let Some(me) = self.me.upgrade() {
            // The registry only goes away at shutdown, when sessions are closed directly.
            let _ = self.removals.send(me);
        }
    }

    /// Stops both loops, waits for them and shuts the socket down.
    ///
    /// An in-flight plugin dispatch is allowed to finish; queued file
    /// operations behind it are dropped with a warning. Calling `close` again
    /// is a no-op.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Closing | SessionState::Closed) {
                return;
            }
            *state = SessionState::Closing;
        }
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Session task of {} panicked", self.path.display());
                }
            }
        }

        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!("Shutting down {}: {}", self.path.display(), e);
        }
        *self.state.lock() = SessionState::Closed;
        info!("Client disconnected: {}", self.path.display());
    }

    async fn handle_record(
        &self,
        ctx: &DaemonContext,
        line: &str,
        responses: &mpsc::Sender<Value>,
        file_ops: &mpsc::Sender<FileOp>,
    ) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                warn!("Dropping malformed record from {}: {}", self.path.display(), e);
                return;
            }
        };

        if self.request_pending.load(Ordering::SeqCst) {
            if responses.send(value).await.is_err() {
                debug!("Response queue of {} is gone", self.path.display());
            }
            return;
        }

        match classify(value) {
            Inbound::Status(value) => ctx.observers().broadcast(&value.to_string()).await,
            Inbound::FileOp(op, raw) => {
                ctx.observers().broadcast(&raw.to_string()).await;
                if file_ops.send(op).await.is_err() {
                    debug!("Dispatch loop of {} has stopped", self.path.display());
                }
            }
            Inbound::NameChange(change) => ctx.plugins().name_change(ctx, &change).await,
            Inbound::Unknown(value) => {
                warn!("Unknown data received from {}: {}", self.path.display(), value)
            }
        }
    }
}

fn payload_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        other => other.to_string(),
    }
}

async fn read_loop(
    ctx: Arc<DaemonContext>,
    session: Arc<ClientSession>,
    mut lines: RecordLines,
    responses: mpsc::Sender<Value>,
    file_ops: mpsc::Sender<FileOp>,
) {
    loop {
        let next = tokio::select! {
            _ = session.cancel.cancelled() => break,
            next = lines.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                session
                    .handle_record(&ctx, &line, &responses, &file_ops)
                    .await
            }
            Ok(None) => {
                debug!("{} closed the connection", session.path.display());
                break;
            }
            Err(e) => {
                warn!("Reading from {} failed: {}", session.path.display(), e);
                break;
            }
        }
    }
    session.request_removal();
}

async fn dispatch_loop(
    ctx: Arc<DaemonContext>,
    session: Arc<ClientSession>,
    mut file_ops: mpsc::Receiver<FileOp>,
) {
    loop {
        let op = tokio::select! {
            biased;
            _ = session.cancel.cancelled() => break,
            op = file_ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };
        ctx.plugins().file_op(&ctx, &session, &op).await;
    }

    file_ops.close();
    let mut dropped = 0usize;
    while file_ops.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!(
            "Dropped {} queued file operations of {}",
            dropped,
            session.path.display()
        );
    }
}
