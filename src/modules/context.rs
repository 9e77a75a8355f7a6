//! The daemon context.
//!
//! One `DaemonContext` is built at startup and shared by every component:
//! discovery, sessions, the console and the plugins. It owns the live state
//! and drives the start and ordered shutdown of the background tasks.

use super::anonmap::{BackupPolicy, MapLock, MapStore};
use super::config::DaemonConfig;
use super::console;
use super::discovery;
use super::plugin::{CommandRegistry, PluginHost};
use super::plugins;
use super::proto::Command;
use super::reconcile::Reconciler;
use super::registry::SessionRegistry;
use super::sink::Observers;
use anyhow::{Context, Result};
use log::{error, info, warn};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Shared state of a running daemon.
pub struct DaemonContext {
    config: DaemonConfig,
    sessions: SessionRegistry,
    observers: Observers,
    commands: CommandRegistry,
    plugins: PluginHost,
    anon_map: MapStore,
    _map_lock: MapLock,
    shutdown: CancellationToken,
}

impl DaemonContext {
    /// Builds the context and loads the anon map. No task is started yet.
    ///
    /// The map file stays locked against other shepherd processes until the
    /// context is dropped.
    pub fn new(config: DaemonConfig) -> Result<Arc<Self>> {
        let map_lock = MapLock::acquire(&config.anon_map_file)?;
        let backup = BackupPolicy::from_dir(config.anon_map_backup_dir.as_deref());
        let anon_map = MapStore::open(
            config.anon_map_file.clone(),
            backup,
            &config.export_prefix,
        )
        .with_context(|| {
            format!("loading anon map {}", config.anon_map_file.display())
        })?;

        Ok(Arc::new(DaemonContext {
            config,
            sessions: SessionRegistry::new(),
            observers: Observers::new(),
            commands: CommandRegistry::new(),
            plugins: PluginHost::new(),
            anon_map,
            _map_lock: map_lock,
            shutdown: CancellationToken::new(),
        }))
    }

    /// Effective configuration.
    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Live client sessions.
    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Console connections receiving broadcasts.
    pub fn observers(&self) -> &Observers {
        &self.observers
    }

    /// Console commands.
    pub fn commands(&self) -> &CommandRegistry {
        &self.commands
    }

    /// Loaded plugins.
    pub fn plugins(&self) -> &PluginHost {
        &self.plugins
    }

    /// The persistent anon map.
    pub fn anon_map(&self) -> &MapStore {
        &self.anon_map
    }

    /// Reconciler over the configured volumes.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(&self.config.volumes, self.config.report_dir.as_deref())
    }

    /// Writes `command` to every live session.
    pub async fn sendall(&self, command: &Command) -> usize {
        self.sessions.sendall(command).await
    }

    /// Asks `run` to tear the daemon down.
    pub fn request_shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Installs `help` and the configured plugins, in config order.
    ///
    /// Unknown plugin names are logged and skipped.
    pub fn load_plugins(self: &Arc<Self>) {
        let mut names = vec!["help".to_string()];
        names.extend(
            self.config
                .plugins
                .iter()
                .filter(|name| name.as_str() != "help")
                .cloned(),
        );

        for name in names {
            match plugins::create(&name, self) {
                Some(plugin) => {
                    info!("Loaded plugin {}", name);
                    self.plugins.install(plugin);
                }
                None => warn!("Unknown plugin {}, skipping", name),
            }
        }
    }

    /// Runs the daemon until a signal or the `shutdown` command, then tears down.
    ///
    /// The anon map is reconciled with the volumes before discovery starts.
    ///
    /// Teardown order: console, plugin teardown hooks, sessions, then the
    /// removal queue and the socket watcher.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        self.load_plugins();

        let reconciler = self.reconciler();
        let summary = self.anon_map.with_map(|map| reconciler.run(map));
        if summary.changed() {
            self.anon_map.persist().context("persisting reconciled anon map")?;
        }

        let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

        let background = CancellationToken::new();
        let console_stop = CancellationToken::new();

        let removals = tokio::spawn({
            let ctx = self.clone();
            let stop = background.clone();
            async move { ctx.sessions.run_removals(stop).await }
        });
        let mut watcher = tokio::spawn(discovery::watch(self.clone(), background.clone()));
        let console = tokio::spawn(console::run(self.clone(), console_stop.clone()));

        info!(
            "Daemon running, watching {}",
            self.config.socket_dir.display()
        );

        let mut watcher_result = None;
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            result = &mut watcher => {
                error!("Socket watcher stopped unexpectedly");
                watcher_result = Some(result);
            }
        }
        self.shutdown.cancel();

        console_stop.cancel();
        match console.await {
            Ok(Err(e)) => warn!("Console failed: {:#}", e),
            Err(e) => warn!("Console task failed: {}", e),
            Ok(Ok(())) => {}
        }

        self.plugins.teardown(&self).await;
        self.sessions.close_all().await;

        background.cancel();
        if let Err(e) = removals.await {
            warn!("Removal task failed: {}", e);
        }
        let watcher_result = match watcher_result {
            Some(result) => result,
            None => watcher.await,
        };
        info!("Daemon stopped");
        watcher_result.context("socket watcher task failed")?
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::modules::session::ClientSession;
    use std::fs;
    use std::path::PathBuf;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixStream;

    /// Context over two empty volumes `raid0` and `raid1` in a temp dir.
    pub(crate) fn context() -> (tempfile::TempDir, Arc<DaemonContext>) {
        context_with(|_| {})
    }

    pub(crate) fn context_with(
        adjust: impl FnOnce(&mut DaemonConfig),
    ) -> (tempfile::TempDir, Arc<DaemonContext>) {
        let dir = tempfile::tempdir().unwrap();
        let volumes = vec![dir.path().join("raid0"), dir.path().join("raid1")];
        for volume in &volumes {
            fs::create_dir_all(volume.join("anonym")).unwrap();
            fs::create_dir_all(volume.join("public")).unwrap();
        }
        fs::create_dir_all(dir.path().join("reports")).unwrap();
        let mut config = DaemonConfig {
            socket_dir: dir.path().join("sockets"),
            volumes,
            anon_map_file: dir.path().join("anon.map"),
            report_dir: Some(dir.path().join("reports")),
            ..DaemonConfig::default()
        };
        adjust(&mut config);
        fs::create_dir_all(&config.socket_dir).unwrap();
        let ctx = DaemonContext::new(config).unwrap();
        (dir, ctx)
    }

    /// Runs a session over a socket pair; returns the mount instance's end.
    pub(crate) async fn attach(
        ctx: &Arc<DaemonContext>,
        path: &str,
        user: &str,
        mountpoint: &str,
    ) -> (Arc<ClientSession>, UnixStream) {
        let (ours, mut theirs) = UnixStream::pair().unwrap();
        let hello = serde_json::json!({
            "op": "hello",
            "user": user,
            "mountpoint": mountpoint,
            "anonym_raid": "raid0",
        });
        theirs
            .write_all(format!("{}\n", hello).as_bytes())
            .await
            .unwrap();
        let session = ClientSession::serve(ctx.clone(), PathBuf::from(path), ours)
            .await
            .unwrap();
        (session, theirs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_help_is_always_loaded() {
        let (_dir, ctx) = testing::context_with(|config| {
            config.plugins = vec!["base".into(), "nonsense".into(), "help".into()];
        });
        ctx.load_plugins();
        assert_eq!(ctx.plugins().names(), vec!["help", "base"]);
        assert!(!ctx.commands().handlers("help").is_empty());
        assert!(!ctx.commands().handlers("reload").is_empty());
    }

    #[test]
    fn test_second_context_on_same_map_is_refused() {
        let (_dir, ctx) = testing::context();
        let err = match DaemonContext::new(ctx.config().clone()) {
            Ok(_) => panic!("map should be locked"),
            Err(e) => e,
        };
        assert!(format!("{:#}", err).contains("in use"));

        let config = ctx.config().clone();
        drop(ctx);
        assert!(DaemonContext::new(config).is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_command_stops_run() -> Result<()> {
        let (_dir, ctx) = testing::context_with(|config| {
            config.console.mode = crate::modules::config::ConsoleMode::Off;
        });
        let running = tokio::spawn(ctx.clone().run());
        tokio::task::yield_now().await;
        ctx.request_shutdown();
        running.await??;
        assert!(ctx.is_shutting_down());
        Ok(())
    }
}
