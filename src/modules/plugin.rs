//! Plugin hooks, console command registry and event dispatch.
//!
//! A plugin implements the hooks it cares about; the others default to
//! no-ops. Every hook call is isolated: an error or a panic is logged with the
//! plugin's name and the remaining plugins still run. `on_file_op` and
//! `on_name_change` are additionally bounded by `PLUGIN_CALL_TIMEOUT`.

use super::constants::PLUGIN_CALL_TIMEOUT;
use super::context::DaemonContext;
use super::proto::{FileOp, NameChange};
use super::session::ClientSession;
use super::sink::{BroadcastSink, OutputSink};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use log::{debug, error, warn};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

/// Handler object reacting to daemon events.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Name used in logs and in the config's plugin list.
    fn name(&self) -> &'static str;

    /// A mount instance finished its handshake. Runs before any of its
    /// file operations is dispatched.
    async fn on_client_connect(
        &self,
        _ctx: &DaemonContext,
        _session: &Arc<ClientSession>,
    ) -> Result<()> {
        Ok(())
    }

    /// A mount instance reported a file operation.
    async fn on_file_op(
        &self,
        _ctx: &DaemonContext,
        _session: &Arc<ClientSession>,
        _op: &FileOp,
        _out: &dyn OutputSink,
    ) -> Result<()> {
        Ok(())
    }

    /// A user changed their display name.
    async fn on_name_change(
        &self,
        _ctx: &DaemonContext,
        _change: &NameChange,
        _out: &dyn OutputSink,
    ) -> Result<()> {
        Ok(())
    }

    /// The daemon is shutting down.
    async fn teardown(&self, _ctx: &DaemonContext) -> Result<()> {
        Ok(())
    }
}

/// Callback for an administrative console command.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Name shown by `help` when no per-command help exists.
    fn name(&self) -> &'static str;

    /// One-line description of `command`.
    fn help(&self, _command: &str) -> Option<String> {
        None
    }

    /// Runs the command. `args[0]` is the command name itself.
    async fn call(&self, ctx: &DaemonContext, out: &dyn OutputSink, args: &[String]) -> Result<()>;
}

/// Outcome of invoking a console command.
#[derive(Debug)]
pub enum Invocation {
    /// No handler is registered for the command.
    NotFound,
    /// All handlers ran; these are the errors some of them returned.
    Done(Vec<anyhow::Error>),
}

/// Command name to handlers. Several handlers may share a name; they are
/// invoked concurrently and in no particular order.
#[derive(Default)]
pub struct CommandRegistry {
    handlers: RwLock<BTreeMap<String, Vec<Arc<dyn CommandHandler>>>>,
}

impl CommandRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for `command`.
    pub fn register(&self, command: &str, handler: Arc<dyn CommandHandler>) {
        debug!("Registering command {} for {}", command, handler.name());
        self.handlers
            .write()
            .entry(command.to_string())
            .or_default()
            .push(handler);
    }

    /// Handlers for `command`.
    pub fn handlers(&self, command: &str) -> Vec<Arc<dyn CommandHandler>> {
        self.handlers.read().get(command).cloned().unwrap_or_default()
    }

    /// All commands, sorted by name, with their handlers.
    pub fn commands(&self) -> Vec<(String, Vec<Arc<dyn CommandHandler>>)> {
        self.handlers
            .read()
            .iter()
            .map(|(name, handlers)| (name.clone(), handlers.clone()))
            .collect()
    }

    /// Runs every handler of `args[0]` and waits for all of them.
    pub async fn invoke(
        &self,
        ctx: &DaemonContext,
        out: &dyn OutputSink,
        args: &[String],
    ) -> Invocation {
        let Some(command) = args.first() else {
            return Invocation::NotFound;
        };
        let handlers = self.handlers(command);
        if handlers.is_empty() {
            return Invocation::NotFound;
        }

        let results = join_all(handlers.iter().map(|handler| {
            let fut = handler.call(ctx, out, args);
            async move {
                match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("handler {} panicked", handler.name())),
                }
            }
        }))
        .await;

        Invocation::Done(results.into_iter().filter_map(Result::err).collect())
    }
}

/// Ordered plugin list and the dispatch of events to it.
#[derive(Default)]
pub struct PluginHost {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

impl PluginHost {
    /// Creates a host without plugins.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a plugin.
    pub fn install(&self, plugin: Arc<dyn Plugin>) {
        self.plugins.write().push(plugin);
    }

    /// Names of the installed plugins, in dispatch order.
    pub fn names(&self) -> Vec<&'static str> {
        self.plugins.read().iter().map(|p| p.name()).collect()
    }

    fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins.read().clone()
    }

    /// Calls `on_client_connect` on every plugin.
    pub async fn client_connected(&self, ctx: &DaemonContext, session: &Arc<ClientSession>) {
        for plugin in self.snapshot() {
            guarded(plugin.name(), "on_client_connect", plugin.on_client_connect(ctx, session))
                .await;
        }
    }

    /// Calls `on_file_op` on every plugin, each bounded by the plugin timeout.
    ///
    /// Output goes to all observers. A timed-out call is logged and the event
    /// is not retried for that plugin.
    pub async fn file_op(&self, ctx: &DaemonContext, session: &Arc<ClientSession>, op: &FileOp) {
        let out = BroadcastSink::new(ctx.observers());
        for plugin in self.snapshot() {
            let call = guarded(plugin.name(), "on_file_op", plugin.on_file_op(ctx, session, op, &out));
            if tokio::time::timeout(PLUGIN_CALL_TIMEOUT, call).await.is_err() {
                warn!(
                    "Plugin {} timed out on {:?} {} {}; event dropped",
                    plugin.name(),
                    op.op,
                    op.module,
                    op.path
                );
            }
            if let Err(e) = out.flush().await {
                debug!("Flushing plugin output failed: {}", e);
            }
        }
    }

    /// Calls `on_name_change` on every plugin, each bounded by the plugin timeout.
    pub async fn name_change(&self, ctx: &DaemonContext, change: &NameChange) {
        let out = BroadcastSink::new(ctx.observers());
        for plugin in self.snapshot() {
            let call = guarded(
                plugin.name(),
                "on_name_change",
                plugin.on_name_change(ctx, change, &out),
            );
            if tokio::time::timeout(PLUGIN_CALL_TIMEOUT, call).await.is_err() {
                warn!("Plugin {} timed out on name change", plugin.name());
            }
        }
    }

    /// Calls `teardown` on every plugin.
    pub async fn teardown(&self, ctx: &DaemonContext) {
        for plugin in self.snapshot() {
            guarded(plugin.name(), "teardown", plugin.teardown(ctx)).await;
        }
    }
}

async fn guarded<F>(plugin: &str, hook: &str, fut: F)
where
    F: Future<Output = Result<()>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("Plugin {} failed in {}: {:#}", plugin, hook, e),
        Err(_) => error!("Plugin {} panicked in {}", plugin, hook),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::context::testing;
    use crate::modules::sink::ConnectionSink;
    use parking_lot::Mutex;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    struct Echo(&'static str);

    #[async_trait]
    impl CommandHandler for Echo {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn call(&self, _ctx: &DaemonContext, out: &dyn OutputSink, args: &[String]) -> Result<()> {
            out.write_line(&format!("{}: {}", self.0, args[1..].join(" "))).await?;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl CommandHandler for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn call(&self, _ctx: &DaemonContext, _out: &dyn OutputSink, _args: &[String]) -> Result<()> {
            anyhow::bail!("nope")
        }
    }

    /// Records the hooks it sees; optionally misbehaves.
    struct Recorder {
        name: &'static str,
        seen: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl Plugin for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn on_file_op(
            &self,
            _ctx: &DaemonContext,
            _session: &Arc<ClientSession>,
            op: &FileOp,
            _out: &dyn OutputSink,
        ) -> Result<()> {
            self.seen.lock().push(format!("{}:{}", self.name, op.path));
            Ok(())
        }

        async fn on_name_change(
            &self,
            _ctx: &DaemonContext,
            change: &NameChange,
            out: &dyn OutputSink,
        ) -> Result<()> {
            if self.fail {
                panic!("broken plugin");
            }
            self.seen.lock().push(format!("{}:{}->{}", self.name, change.source, change.dest));
            out.write_line("renamed").await?;
            Ok(())
        }
    }

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[tokio::test]
    async fn test_unknown_command_is_not_found() {
        let (_dir, ctx) = testing::context();
        let (_client, server) = duplex(1024);
        let out = ConnectionSink::new(server);
        assert!(matches!(
            ctx.commands().invoke(&ctx, &out, &args("nothing here")).await,
            Invocation::NotFound
        ));
        assert!(matches!(
            ctx.commands().invoke(&ctx, &out, &[]).await,
            Invocation::NotFound
        ));
    }

    #[tokio::test]
    async fn test_all_handlers_of_a_command_run() -> Result<()> {
        let (_dir, ctx) = testing::context();
        ctx.commands().register("say", Arc::new(Echo("one")));
        ctx.commands().register("say", Arc::new(Echo("two")));
        ctx.commands().register("say", Arc::new(Failing));

        let (client, server) = duplex(1024);
        let out = ConnectionSink::new(server);
        match ctx.commands().invoke(&ctx, &out, &args("say hi there")).await {
            Invocation::Done(errors) => assert_eq!(errors.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        out.flush().await?;
        drop(out);

        let mut lines = BufReader::new(client).lines();
        let mut got = Vec::new();
        while let Some(line) = lines.next_line().await? {
            got.push(line);
        }
        got.sort();
        assert_eq!(got, vec!["one: hi there", "two: hi there"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_plugin_does_not_stop_others() -> Result<()> {
        let (_dir, ctx) = testing::context();
        let seen = Arc::new(Mutex::new(Vec::new()));
        ctx.plugins().install(Arc::new(Recorder {
            name: "broken",
            seen: seen.clone(),
            fail: true,
        }));
        ctx.plugins().install(Arc::new(Recorder {
            name: "fine",
            seen: seen.clone(),
            fail: false,
        }));
        let (client, server) = duplex(1024);
        ctx.observers().add(ConnectionSink::new(server));

        let change = NameChange {
            source: "old".into(),
            dest: "new".into(),
        };
        ctx.plugins().name_change(&ctx, &change).await;

        assert_eq!(*seen.lock(), vec!["fine:old->new".to_string()]);
        let mut lines = BufReader::new(client).lines();
        assert_eq!(lines.next_line().await?.as_deref(), Some("renamed"));
        assert_eq!(ctx.plugins().names(), vec!["broken", "fine"]);
        Ok(())
    }
}
