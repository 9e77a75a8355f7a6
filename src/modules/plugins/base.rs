//! `base`: everyday commands forwarded to the mount instances.
//!
//! Forwarding commands go to every session, or only to the selected one
//! after `select <user|mountpoint>`.

use crate::modules::context::DaemonContext;
use crate::modules::plugin::{CommandHandler, Plugin};
use crate::modules::proto::{Command, FileOp, FileOpKind, ModuleKind};
use crate::modules::session::ClientSession;
use crate::modules::sink::OutputSink;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use std::sync::Arc;

const COMMANDS: [&str; 9] = [
    "clear",
    "reload",
    "setconfig",
    "getconfig",
    "cmd",
    "clients",
    "select",
    "unselect",
    "shutdown",
];

/// Session selection and the forwarding commands.
pub struct BasePlugin {
    selected: Mutex<Option<String>>,
}

impl BasePlugin {
    /// Registers the base commands.
    pub fn init(ctx: &DaemonContext) -> Arc<Self> {
        let plugin = Arc::new(BasePlugin {
            selected: Mutex::new(None),
        });
        for command in COMMANDS {
            ctx.commands().register(command, plugin.clone());
        }
        plugin
    }

    /// Current selector, if any.
    pub fn selected(&self) -> Option<String> {
        self.selected.lock().clone()
    }

    fn target(&self, ctx: &DaemonContext) -> Target {
        match self.selected() {
            None => Target::All,
            Some(selector) => match ctx.sessions().find(&selector) {
                Some(session) => Target::One(session),
                None => Target::Gone(selector),
            },
        }
    }

    /// Writes `command` to the selected session, or to all of them.
    async fn forward(&self, ctx: &DaemonContext, out: &dyn OutputSink, command: Command) -> Result<()> {
        match self.target(ctx) {
            Target::All => {
                let reached = ctx.sendall(&command).await;
                out.write_line(&format!("sent {} to {} clients", command, reached))
                    .await?;
            }
            Target::One(session) => {
                let line = if session.write(&command).await {
                    format!("sent {} to {}", command, session.path().display())
                } else {
                    format!("{} is unreachable, removing it", session.path().display())
                };
                out.write_line(&line).await?;
            }
            Target::Gone(selector) => {
                out.write_line(&format!("selected client {} is not connected", selector))
                    .await?;
            }
        }
        Ok(())
    }

    /// Asks the selected session and prints its answer; broadcasts without a selection.
    async fn ask(&self, ctx: &DaemonContext, out: &dyn OutputSink, command: Command) -> Result<()> {
        match self.target(ctx) {
            Target::One(session) => {
                let response = session.request(&command).await?;
                out.write_line(&response.to_string()).await?;
                Ok(())
            }
            _ => self.forward(ctx, out, command).await,
        }
    }

    async fn clients(&self, ctx: &DaemonContext, out: &dyn OutputSink) -> Result<()> {
        let sessions = ctx.sessions().snapshot();
        if sessions.is_empty() {
            out.write_line("no clients connected").await?;
            return Ok(());
        }
        let selected = match self.target(ctx) {
            Target::One(session) => Some(session.id()),
            _ => None,
        };
        for session in sessions {
            let marker = if Some(session.id()) == selected { "*" } else { " " };
            out.write_line(&format!("{} {}", marker, session.describe()))
                .await?;
        }
        Ok(())
    }
}

enum Target {
    All,
    One(Arc<ClientSession>),
    Gone(String),
}

fn rest(args: &[String]) -> Option<String> {
    if args.len() < 2 {
        None
    } else {
        Some(args[1..].join(" "))
    }
}

#[async_trait]
impl Plugin for BasePlugin {
    fn name(&self) -> &'static str {
        "base"
    }

    async fn on_file_op(
        &self,
        ctx: &DaemonContext,
        _session: &Arc<ClientSession>,
        op: &FileOp,
        _out: &dyn OutputSink,
    ) -> Result<()> {
        let shares_changed = matches!(op.op, FileOpKind::Mkdir | FileOpKind::Rmdir)
            && op.module_kind() == Some(ModuleKind::Anonym)
            && op.is_top_level();
        // The anonmap plugin reloads itself once the map is persisted.
        if shares_changed && !ctx.plugins().names().contains(&"anonmap") {
            debug!("Anonymous share {} changed, reloading all clients", op.path);
            ctx.sendall(&Command::ForceReload).await;
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for BasePlugin {
    fn name(&self) -> &'static str {
        "base"
    }

    fn help(&self, command: &str) -> Option<String> {
        let text = match command {
            "clear" => "clear: drop the caches of the selected or all clients",
            "reload" => "reload: make the selected or all clients reload",
            "setconfig" => "setconfig <key>=<value>: change a client config value",
            "getconfig" => "getconfig <key>: query a client config value",
            "cmd" => "cmd <line>: send a raw line to the selected or all clients",
            "clients" => "clients: list connected clients (* marks the selection)",
            "select" => "select <user|mountpoint>: send following commands to one client",
            "unselect" => "unselect: send following commands to all clients",
            "shutdown" => "shutdown: stop the daemon",
            _ => return None,
        };
        Some(text.into())
    }

    async fn call(&self, ctx: &DaemonContext, out: &dyn OutputSink, args: &[String]) -> Result<()> {
        let command = args.first().map(String::as_str).unwrap_or_default();
        match command {
            "clear" => self.forward(ctx, out, Command::ClearCache).await,
            "reload" => self.forward(ctx, out, Command::ForceReload).await,
            "cmd" => {
                let line = rest(args).ok_or_else(|| anyhow!("usage: cmd <line>"))?;
                self.forward(ctx, out, Command::Raw(line)).await
            }
            "setconfig" => {
                let assignment = rest(args).ok_or_else(|| anyhow!("usage: setconfig <key>=<value>"))?;
                let Some((key, value)) = assignment.split_once('=') else {
                    bail!("usage: setconfig <key>=<value>");
                };
                let command = Command::SetConfig {
                    key: key.trim().to_string(),
                    value: value.trim().to_string(),
                };
                self.ask(ctx, out, command).await
            }
            "getconfig" => {
                let key = args.get(1).ok_or_else(|| anyhow!("usage: getconfig <key>"))?;
                self.ask(ctx, out, Command::Config(key.clone())).await
            }
            "clients" => self.clients(ctx, out).await,
            "select" => {
                let selector = args
                    .get(1)
                    .ok_or_else(|| anyhow!("usage: select <user|mountpoint>"))?;
                let session = ctx
                    .sessions()
                    .find(selector)
                    .ok_or_else(|| anyhow!("no client matches {}", selector))?;
                *self.selected.lock() = Some(selector.clone());
                info!("Selected client {}", session.describe());
                out.write_line(&format!("selected {}", session.describe()))
                    .await?;
                Ok(())
            }
            "unselect" => {
                *self.selected.lock() = None;
                out.write_line("selection cleared").await?;
                Ok(())
            }
            "shutdown" => {
                out.write_line("shutting down").await?;
                ctx.request_shutdown();
                Ok(())
            }
            other => bail!("base cannot handle {}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::console;
    use crate::modules::context::testing;
    use crate::modules::sink::ConnectionSink;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
    use tokio::net::UnixStream;

    async fn reply(ctx: &DaemonContext, line: &str) -> Vec<String> {
        let (client, server) = duplex(64 * 1024);
        let out = ConnectionSink::new(server);
        console::execute(ctx, &out, line).await.unwrap();
        drop(out);
        read_all(client).await
    }

    async fn read_all(client: DuplexStream) -> Vec<String> {
        let mut lines = BufReader::new(client).lines();
        let mut all = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            all.push(line);
        }
        all
    }

    async fn next_line_within(peer: &mut BufReader<UnixStream>, wait: Duration) -> Option<String> {
        let mut line = String::new();
        match tokio::time::timeout(wait, peer.read_line(&mut line)).await {
            Ok(Ok(n)) if n > 0 => Some(line.trim_end().to_string()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_select_then_reload_targets_one_client() {
        let (_dir, ctx) = testing::context();
        ctx.load_plugins();
        let (_a, pa) = testing::attach(&ctx, "/run/a.sock", "001002", "/mnt/a").await;
        let (_b, pb) = testing::attach(&ctx, "/run/b.sock", "001003", "/mnt/b").await;
        let mut pa = BufReader::new(pa);
        let mut pb = BufReader::new(pb);

        let selected = reply(&ctx, "select 001003").await;
        assert!(selected[0].starts_with("selected /run/b.sock"));
        reply(&ctx, "reload").await;

        assert_eq!(
            next_line_within(&mut pb, Duration::from_secs(1)).await.as_deref(),
            Some("FORCE-RELOAD")
        );
        assert_eq!(next_line_within(&mut pa, Duration::from_millis(100)).await, None);

        reply(&ctx, "unselect").await;
        reply(&ctx, "clear").await;
        for peer in [&mut pa, &mut pb] {
            assert_eq!(
                next_line_within(peer, Duration::from_secs(1)).await.as_deref(),
                Some("CLEARCACHE")
            );
        }
        ctx.sessions().close_all().await;
    }

    #[tokio::test]
    async fn test_select_unknown_client_fails() {
        let (_dir, ctx) = testing::context();
        ctx.load_plugins();
        let lines = reply(&ctx, "select 999999").await;
        assert_eq!(lines, vec!["ERROR: no client matches 999999".to_string(), String::new()]);
    }

    #[tokio::test]
    async fn test_getconfig_asks_selected_client() -> Result<()> {
        let (_dir, ctx) = testing::context();
        ctx.load_plugins();
        let (_a, peer) = testing::attach(&ctx, "/run/a.sock", "001002", "/mnt/a").await;
        let (read_half, mut write_half) = peer.into_split();
        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let reply = format!("{{\"state\":\"success\",\"response\":\"{}\"}}\n", line);
                if write_half.write_all(reply.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        reply(&ctx, "select /mnt/a").await;
        let lines = reply(&ctx, "getconfig quota").await;
        let value: serde_json::Value = serde_json::from_str(&lines[0])?;
        assert_eq!(value["response"], "CONFIG quota");

        let lines = reply(&ctx, "setconfig quota = 10").await;
        let value: serde_json::Value = serde_json::from_str(&lines[0])?;
        assert_eq!(value["response"], "SETCONFIG quota=10");
        ctx.sessions().close_all().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_clients_marks_selection() {
        let (_dir, ctx) = testing::context();
        ctx.load_plugins();
        assert_eq!(reply(&ctx, "clients").await[0], "no clients connected");

        let (_a, _pa) = testing::attach(&ctx, "/run/a.sock", "001002", "/mnt/a").await;
        let (_b, _pb) = testing::attach(&ctx, "/run/b.sock", "001003", "/mnt/b").await;
        reply(&ctx, "select 001002").await;

        let lines = reply(&ctx, "clients").await;
        assert!(lines[0].starts_with("* /run/a.sock"));
        assert!(lines[1].starts_with("  /run/b.sock"));
        ctx.sessions().close_all().await;
    }

    #[tokio::test]
    async fn test_anonym_root_change_reloads_without_map_driver() {
        let (_dir, ctx) = testing::context_with(|config| config.plugins = vec!["base".into()]);
        ctx.load_plugins();
        let (_a, pa) = testing::attach(&ctx, "/run/a.sock", "001002", "/mnt/a").await;
        let (_b, mut pb) = testing::attach(&ctx, "/run/b.sock", "001003", "/mnt/b").await;
        let mut pa = BufReader::new(pa);

        pb.write_all(b"{\"op\":\"MKDIR\",\"module\":\"anonym\",\"path\":\"/drop/inner\"}\n")
            .await
            .unwrap();
        pb.write_all(b"{\"op\":\"MKDIR\",\"module\":\"anonym\",\"path\":\"/drop\"}\n")
            .await
            .unwrap();

        assert_eq!(
            next_line_within(&mut pa, Duration::from_secs(1)).await.as_deref(),
            Some("FORCE-RELOAD")
        );
        assert_eq!(next_line_within(&mut pa, Duration::from_millis(100)).await, None);
        ctx.sessions().close_all().await;
    }

    #[tokio::test]
    async fn test_shutdown_command() {
        let (_dir, ctx) = testing::context();
        ctx.load_plugins();
        assert_eq!(reply(&ctx, "shutdown").await[0], "shutting down");
        assert!(ctx.is_shutting_down());
    }
}
