//! Administrative console.
//!
//! Reads whitespace-separated command lines from stdin or from one TCP
//! connection at a time and runs the registered handlers. While a connection
//! is served it is also an observer and receives every broadcast.

use super::config::ConsoleMode;
use super::context::DaemonContext;
use super::plugin::Invocation;
use super::sink::{ConnectionSink, OutputSink};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Runs the console in the configured mode until `stop` is cancelled.
pub async fn run(ctx: Arc<DaemonContext>, stop: CancellationToken) -> Result<()> {
    let console = ctx.config().console.clone();
    match console.mode {
        ConsoleMode::Off => {
            debug!("Console disabled");
            Ok(())
        }
        ConsoleMode::Stdin => {
            info!("Console reading from stdin");
            serve(&ctx, tokio::io::stdin(), tokio::io::stdout(), &stop).await?;
            debug!("Console input closed");
            Ok(())
        }
        ConsoleMode::Tcp => {
            let listener = TcpListener::bind((console.address.as_str(), console.port))
                .await
                .with_context(|| {
                    format!("binding console to {}:{}", console.address, console.port)
                })?;
            info!("Console listening on {}:{}", console.address, console.port);
            loop {
                let (stream, peer) = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => accepted?,
                };
                info!("Console connection from {}", peer);
                let (reader, writer) = stream.into_split();
                if let Err(e) = serve(&ctx, reader, writer, &stop).await {
                    warn!("Console connection from {} failed: {}", peer, e);
                }
                info!("Console connection from {} closed", peer);
            }
            Ok(())
        }
    }
}

/// Serves one console connection until EOF or `stop`.
pub async fn serve<R, W>(
    ctx: &DaemonContext,
    reader: R,
    writer: W,
    stop: &CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let out = ConnectionSink::new(writer);
    ctx.observers().add(out.clone());
    let result = read_commands(ctx, reader, &out, stop).await;
    ctx.observers().remove(out.id());
    result
}

async fn read_commands<R>(
    ctx: &DaemonContext,
    reader: R,
    out: &ConnectionSink,
    stop: &CancellationToken,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            line = lines.next_line() => line?,
        };
        match line {
            Some(line) => execute(ctx, out, &line).await?,
            None => return Ok(()),
        }
    }
}

/// Runs one command line and writes its framed reply to `out`.
///
/// Handler errors become `ERROR: ...` lines and the reply ends with an empty
/// line. An unknown command gets a single `ERROR: command not found` line.
/// Blank lines are ignored.
pub async fn execute(ctx: &DaemonContext, out: &dyn OutputSink, line: &str) -> io::Result<()> {
    let args: Vec<String> = line.split_whitespace().map(String::from).collect();
    let Some(command) = args.first() else {
        return Ok(());
    };
    debug!("Console command: {}", line.trim());

    match ctx.commands().invoke(ctx, out, &args).await {
        Invocation::NotFound => {
            out.write_line(&format!("ERROR: command not found: {}", command))
                .await?;
        }
        Invocation::Done(errors) => {
            for error in errors {
                warn!("Command {} failed: {:#}", command, error);
                out.write_line(&format!("ERROR: {:#}", error)).await?;
            }
            out.write_line("").await?;
        }
    }
    out.flush().await
}
