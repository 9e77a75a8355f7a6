//! `help`: lists the console commands.

use crate::modules::context::DaemonContext;
use crate::modules::plugin::{CommandHandler, Plugin};
use crate::modules::sink::OutputSink;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Lists every registered command with the help line of each handler.
pub struct HelpPlugin;

impl HelpPlugin {
    /// Registers the `help` command.
    pub fn init(ctx: &DaemonContext) -> Arc<Self> {
        let plugin = Arc::new(HelpPlugin);
        ctx.commands().register("help", plugin.clone());
        plugin
    }
}

#[async_trait]
impl Plugin for HelpPlugin {
    fn name(&self) -> &'static str {
        "help"
    }
}

#[async_trait]
impl CommandHandler for HelpPlugin {
    fn name(&self) -> &'static str {
        "help"
    }

    fn help(&self, _command: &str) -> Option<String> {
        Some("help [command]: list commands".into())
    }

    async fn call(&self, ctx: &DaemonContext, out: &dyn OutputSink, args: &[String]) -> Result<()> {
        let filter = args.get(1);
        for (command, handlers) in ctx.commands().commands() {
            if filter.map_or(false, |f| *f != command) {
                continue;
            }
            out.write_line(&format!(" {}", command)).await?;
            for handler in handlers {
                let line = handler
                    .help(&command)
                    .unwrap_or_else(|| handler.name().to_string());
                out.write_line(&format!("\t|- {}", line)).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::console;
    use crate::modules::context::testing;
    use crate::modules::sink::ConnectionSink;
    use tokio::io::{duplex, AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_help_lists_commands() -> Result<()> {
        let (_dir, ctx) = testing::context();
        ctx.load_plugins();

        let (client, server) = duplex(64 * 1024);
        let out = ConnectionSink::new(server);
        console::execute(&ctx, &out, "help").await?;
        console::execute(&ctx, &out, "help select").await?;
        drop(out);

        let mut lines = BufReader::new(client).lines();
        let mut all = Vec::new();
        while let Some(line) = lines.next_line().await? {
            all.push(line);
        }
        let first_reply: Vec<&String> = all.iter().take_while(|l| !l.is_empty()).collect();
        assert!(first_reply.iter().any(|l| l.as_str() == " reload"));
        assert!(first_reply.iter().any(|l| l.as_str() == " anonmap-scan"));
        assert!(first_reply.iter().any(|l| l.as_str() == " help"));

        let second_reply: Vec<&String> = all
            .iter()
            .skip(first_reply.len() + 1)
            .take_while(|l| !l.is_empty())
            .collect();
        assert_eq!(second_reply[0], " select");
        assert_eq!(second_reply.len(), 2);
        Ok(())
    }
}
