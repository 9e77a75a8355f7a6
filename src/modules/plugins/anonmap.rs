//! `anonmap`: keeps the anon map in step with the file operations.
//!
//! Creating a top-level directory in a user's `anonym` module exports it
//! under a generated name, removing it withdraws the export. After every
//! change the map is persisted, the user's report file is updated and all
//! clients are told to reload.

use crate::modules::anonmap::{AddOutcome, MapKey};
use crate::modules::context::DaemonContext;
use crate::modules::plugin::{CommandHandler, Plugin};
use crate::modules::proto::{Command, FileOp, FileOpKind, ModuleKind, NameChange};
use crate::modules::reconcile::{remove_report, write_report};
use crate::modules::session::ClientSession;
use crate::modules::sink::OutputSink;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;

const COMMANDS: [&str; 4] = ["anonmap-scan", "anonmap-lookup", "anonmap-move", "anonmap-list"];

/// Drives the anon map from file-operation events and console commands.
pub struct AnonMapPlugin;

impl AnonMapPlugin {
    /// Registers the `anonmap-*` commands.
    pub fn init(ctx: &DaemonContext) -> Arc<Self> {
        let plugin = Arc::new(AnonMapPlugin);
        for command in COMMANDS {
            ctx.commands().register(command, plugin.clone());
        }
        plugin
    }

    async fn share_created(
        &self,
        ctx: &DaemonContext,
        session: &ClientSession,
        op: &FileOp,
        out: &dyn OutputSink,
    ) -> Result<()> {
        let user = session.user().await?;
        let Some(key) = MapKey::derive(ModuleKind::Anonym, &user, &op.path) else {
            return Ok(());
        };
        if ctx.anon_map().with_map(|m| m.contains_key(&key)) {
            debug!("{} is already exported", key);
            return Ok(());
        }

        let raid = session.anonym_raid().await?;
        let source = key.source_on(&ctx.config().resolve_volume(&raid));
        let outcome = ctx.anon_map().add_entry(key.clone(), source)?;
        self.announce(ctx, &key, outcome, out).await
    }

    async fn share_removed(
        &self,
        ctx: &DaemonContext,
        session: &ClientSession,
        op: &FileOp,
        out: &dyn OutputSink,
    ) -> Result<()> {
        let user = session.user().await?;
        let Some(key) = MapKey::derive(ModuleKind::Anonym, &user, &op.path) else {
            return Ok(());
        };
        let Some(entry) = ctx.anon_map().remove_entry(&key)? else {
            debug!("{} was not exported", key);
            return Ok(());
        };
        info!("Withdrew export {} of {}", entry.export, key);
        if let Some(report_dir) = &ctx.config().report_dir {
            if let Err(e) = remove_report(report_dir, &key) {
                warn!("Cannot remove report for {}: {:#}", key, e);
            }
        }
        out.write_line(&format!("anonmap: removed {} ({})", key, entry.export))
            .await?;
        ctx.sendall(&Command::ForceReload).await;
        Ok(())
    }

    async fn public_touched(
        &self,
        ctx: &DaemonContext,
        session: &ClientSession,
        out: &dyn OutputSink,
    ) -> Result<()> {
        let user = session.user().await?;
        let key = MapKey::public(user);
        if ctx.anon_map().with_map(|m| m.contains_key(&key)) {
            return Ok(());
        }
        let raid = session.anonym_raid().await?;
        let source = key.source_on(&ctx.config().resolve_volume(&raid));
        let outcome = ctx.anon_map().add_entry(key.clone(), source)?;
        self.announce(ctx, &key, outcome, out).await
    }

    async fn announce(
        &self,
        ctx: &DaemonContext,
        key: &MapKey,
        outcome: AddOutcome,
        out: &dyn OutputSink,
    ) -> Result<()> {
        let export = match outcome {
            AddOutcome::Unchanged => return Ok(()),
            AddOutcome::Added(export) => {
                info!("Exported {} as {}", key, export);
                export
            }
            AddOutcome::Relocated { from } => {
                info!("Moved {} from {}", key, from.display());
                ctx.anon_map()
                    .with_map(|m| m.get(key).map(|e| e.export.clone()))
                    .ok_or_else(|| anyhow!("{} vanished from the map", key))?
            }
        };
        if let Some(report_dir) = &ctx.config().report_dir {
            if let Err(e) = write_report(report_dir, key, &export) {
                warn!("Cannot write report for {}: {:#}", key, e);
            }
        }
        out.write_line(&format!("anonmap: {} -> {}", key, export))
            .await?;
        ctx.sendall(&Command::ForceReload).await;
        Ok(())
    }

    async fn scan(&self, ctx: &DaemonContext, out: &dyn OutputSink) -> Result<()> {
        let reconciler = ctx.reconciler();
        let summary = ctx.anon_map().with_map(|m| reconciler.run(m));
        out.write_line(&summary.to_string()).await?;
        if summary.changed() {
            ctx.anon_map().persist()?;
            ctx.sendall(&Command::ForceReload).await;
        }
        Ok(())
    }

    async fn lookup(&self, ctx: &DaemonContext, out: &dyn OutputSink, args: &[String]) -> Result<()> {
        let [_, module, user, path] = args else {
            return Err(anyhow!("usage: anonmap-lookup <anonym|public> <user> <path>"));
        };
        let module =
            ModuleKind::from_name(module).ok_or_else(|| anyhow!("unknown module {}", module))?;
        match ctx.anon_map().translate(module, user, path) {
            Some(public) => out.write_line(&public.display().to_string()).await?,
            None => out.write_line("not found").await?,
        }
        Ok(())
    }

    async fn relocate(&self, ctx: &DaemonContext, out: &dyn OutputSink, args: &[String]) -> Result<()> {
        let [_, user, from, to] = args else {
            return Err(anyhow!("usage: anonmap-move <user> <from-volume> <to-volume>"));
        };
        let from = ctx.config().resolve_volume(from);
        let to = ctx.config().resolve_volume(to);
        let moved = ctx.anon_map().with_map(|m| m.relocate_user(user, &from, &to));
        if moved > 0 {
            ctx.anon_map().persist()?;
            ctx.sendall(&Command::ForceReload).await;
        }
        out.write_line(&format!(
            "moved {} entries of {} from {} to {}",
            moved,
            user,
            from.display(),
            to.display()
        ))
        .await?;
        Ok(())
    }

    async fn list(&self, ctx: &DaemonContext, out: &dyn OutputSink) -> Result<()> {
        let rendered = ctx.anon_map().with_map(|m| m.render());
        for line in rendered.lines() {
            out.write_line(line).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Plugin for AnonMapPlugin {
    fn name(&self) -> &'static str {
        "anonmap"
    }

    async fn on_file_op(
        &self,
        ctx: &DaemonContext,
        session: &Arc<ClientSession>,
        op: &FileOp,
        out: &dyn OutputSink,
    ) -> Result<()> {
        match (op.module_kind(), op.op) {
            (Some(ModuleKind::Anonym), FileOpKind::Mkdir) => {
                self.share_created(ctx, session, op, out).await
            }
            (Some(ModuleKind::Anonym), FileOpKind::Rmdir) if op.is_top_level() => {
                self.share_removed(ctx, session, op, out).await
            }
            (Some(ModuleKind::Public), FileOpKind::Mkdir | FileOpKind::Create) => {
                self.public_touched(ctx, session, out).await
            }
            _ => Ok(()),
        }
    }

    async fn on_name_change(
        &self,
        ctx: &DaemonContext,
        change: &NameChange,
        _out: &dyn OutputSink,
    ) -> Result<()> {
        info!("Display name changed from {} to {}", change.source, change.dest);
        ctx.sendall(&Command::ForceReload).await;
        Ok(())
    }

    async fn teardown(&self, ctx: &DaemonContext) -> Result<()> {
        ctx.anon_map()
            .persist()
            .context("persisting anon map on shutdown")
    }
}

#[async_trait]
impl CommandHandler for AnonMapPlugin {
    fn name(&self) -> &'static str {
        "anonmap"
    }

    fn help(&self, command: &str) -> Option<String> {
        let text = match command {
            "anonmap-scan" => "anonmap-scan: reconcile the anon map with the volumes",
            "anonmap-lookup" => "anonmap-lookup <module> <user> <path>: public path of a private one",
            "anonmap-move" => "anonmap-move <user> <from> <to>: follow a user to another volume",
            "anonmap-list" => "anonmap-list: print the anon map",
            _ => return None,
        };
        Some(text.into())
    }

    async fn call(&self, ctx: &DaemonContext, out: &dyn OutputSink, args: &[String]) -> Result<()> {
        match args.first().map(String::as_str) {
            Some("anonmap-scan") => self.scan(ctx, out).await.context("anon map scan"),
            Some("anonmap-lookup") => self.lookup(ctx, out, args).await,
            Some("anonmap-move") => self.relocate(ctx, out, args).await,
            Some("anonmap-list") => self.list(ctx, out).await,
            other => Err(anyhow!("anonmap cannot handle {:?}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::anonmap::AnonMap;
    use crate::modules::console;
    use crate::modules::context::testing;
    use crate::modules::sink::ConnectionSink;
    use std::fs;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixStream;

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn send(peer: &mut UnixStream, record: &str) {
        peer.write_all(format!("{}\n", record).as_bytes()).await.unwrap();
    }

    fn persisted(ctx: &DaemonContext) -> AnonMap {
        AnonMap::load(ctx.anon_map().path(), "a_").unwrap()
    }

    #[tokio::test]
    async fn test_mkdir_exports_and_rmdir_withdraws() {
        let (dir, ctx) = testing::context();
        ctx.load_plugins();
        let (_session, mut peer) = testing::attach(&ctx, "/run/a.sock", "001003", "/mnt/a").await;
        let key = MapKey::anonym("001003", "cooldrop");

        send(&mut peer, r#"{"op":"MKDIR","module":"anonym","path":"/cooldrop"}"#).await;
        wait_for(|| persisted(&ctx).contains_key(&key)).await;

        let map = persisted(&ctx);
        let entry = map.get(&key).unwrap();
        assert_eq!(entry.source, dir.path().join("raid0/anonym/001003/cooldrop"));
        assert!(entry.export.starts_with("a_cooldrop_"));
        let report = dir.path().join("reports/001003/anonym/cooldrop");
        assert_eq!(fs::read_to_string(&report).unwrap(), format!("{}\n", entry.export));

        let mut lines = BufReader::new(&mut peer).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("FORCE-RELOAD"));

        send(&mut peer, r#"{"op":"MKDIR","module":"anonym","path":"/cooldrop/deeper"}"#).await;
        send(&mut peer, r#"{"op":"RMDIR","module":"anonym","path":"/cooldrop/deeper"}"#).await;
        send(&mut peer, r#"{"op":"RMDIR","module":"anonym","path":"/cooldrop"}"#).await;
        send(&mut peer, r#"{"op":"RMDIR","module":"anonym","path":"/cooldrop"}"#).await;
        wait_for(|| !persisted(&ctx).contains_key(&key)).await;

        assert!(persisted(&ctx).is_empty());
        assert!(!report.exists());
        ctx.sessions().close_all().await;
    }

    #[tokio::test]
    async fn test_missing_report_dir_still_reloads_clients() {
        let (_dir, ctx) = testing::context_with(|config| {
            let root = config.socket_dir.parent().unwrap().to_path_buf();
            config.report_dir = Some(root.join("no/such/reports"));
        });
        ctx.load_plugins();
        let (_session, mut peer) = testing::attach(&ctx, "/run/a.sock", "001003", "/mnt/a").await;
        let key = MapKey::anonym("001003", "cooldrop");

        send(&mut peer, r#"{"op":"MKDIR","module":"anonym","path":"/cooldrop"}"#).await;
        let mut lines = BufReader::new(&mut peer).lines();
        let reload = tokio::time::timeout(Duration::from_secs(2), lines.next_line()).await;
        assert_eq!(reload.unwrap().unwrap().as_deref(), Some("FORCE-RELOAD"));
        assert!(persisted(&ctx).contains_key(&key));

        send(&mut peer, r#"{"op":"RMDIR","module":"anonym","path":"/cooldrop"}"#).await;
        let mut lines = BufReader::new(&mut peer).lines();
        let reload = tokio::time::timeout(Duration::from_secs(2), lines.next_line()).await;
        assert_eq!(reload.unwrap().unwrap().as_deref(), Some("FORCE-RELOAD"));
        assert!(persisted(&ctx).is_empty());
        ctx.sessions().close_all().await;
    }

    #[tokio::test]
    async fn test_public_entry_uses_user_id() {
        let (dir, ctx) = testing::context();
        ctx.load_plugins();
        let (_session, mut peer) = testing::attach(&ctx, "/run/a.sock", "001002", "/mnt/a").await;

        send(&mut peer, r#"{"op":"CREATE","module":"public","path":"/notes.txt"}"#).await;
        let key = MapKey::public("001002");
        wait_for(|| persisted(&ctx).contains_key(&key)).await;

        let map = persisted(&ctx);
        let entry = map.get(&key).unwrap();
        assert_eq!(entry.export, "001002");
        assert_eq!(entry.source, dir.path().join("raid0/public/001002"));
        ctx.sessions().close_all().await;
    }

    #[tokio::test]
    async fn test_commands() -> Result<()> {
        let (dir, ctx) = testing::context();
        ctx.load_plugins();
        let share = dir.path().join("raid1/anonym/001003/cooldrop");
        fs::create_dir_all(&share)?;
        fs::write(share.join("file"), "content")?;

        let (client, server) = duplex(64 * 1024);
        let out = ConnectionSink::new(server);
        console::execute(&ctx, &out, "anonmap-scan").await?;
        console::execute(&ctx, &out, "anonmap-list").await?;
        console::execute(&ctx, &out, "anonmap-lookup anonym 001003 /cooldrop/file").await?;
        console::execute(&ctx, &out, "anonmap-lookup anonym 001003 /elsewhere").await?;
        console::execute(&ctx, &out, "anonmap-move 001003 raid1 raid0").await?;
        drop(out);

        let mut lines = BufReader::new(client).lines();
        let mut all = Vec::new();
        while let Some(line) = lines.next_line().await? {
            all.push(line);
        }
        let replies: Vec<Vec<String>> = all
            .split(|l| l.is_empty())
            .map(|r| r.to_vec())
            .collect();

        let export = ctx
            .anon_map()
            .with_map(|m| m.get(&MapKey::anonym("001003", "cooldrop")).map(|e| e.export.clone()))
            .unwrap();
        assert_eq!(replies[1], vec![format!("{}:{}", export, share.display())]);
        assert_eq!(replies[2], vec![format!("{}/file", export)]);
        assert_eq!(replies[3], vec!["not found".to_string()]);
        assert!(replies[4][0].starts_with("moved 1 entries of 001003"));

        let moved = persisted(&ctx);
        assert_eq!(
            moved.get(&MapKey::anonym("001003", "cooldrop")).map(|e| e.source.clone()),
            Some(dir.path().join("raid0/anonym/001003/cooldrop"))
        );
        assert_eq!(
            moved.get(&MapKey::anonym("001003", "cooldrop")).map(|e| e.export.clone()),
            Some(export)
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_usage_error() -> Result<()> {
        let (_dir, ctx) = testing::context();
        ctx.load_plugins();
        let (client, server) = duplex(4096);
        let out = ConnectionSink::new(server);
        console::execute(&ctx, &out, "anonmap-lookup anonym").await?;
        drop(out);

        let mut lines = BufReader::new(client).lines();
        let first = lines.next_line().await?.unwrap_or_default();
        assert!(first.starts_with("ERROR: usage: anonmap-lookup"));
        Ok(())
    }
}
