use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, LevelFilter};
use shepherd::modules::anonmap::{BackupPolicy, MapLock, MapStore};
use shepherd::modules::config::ConsoleMode;
use shepherd::modules::daemon::Daemon;
use shepherd::modules::proto::ModuleKind;
use shepherd::{DaemonConfig, DaemonContext, Reconciler};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Config file
        #[arg(short, long)]
        config: PathBuf,
        /// Override the watched socket directory
        #[arg(long)]
        socket_dir: Option<PathBuf>,
        /// Override the console mode (stdin, tcp, off)
        #[arg(long)]
        console: Option<ConsoleMode>,
        /// Detach into the background
        #[arg(short, long)]
        detach: bool,
        /// PID file written when detached
        #[arg(long, default_value = "/run/shepherd.pid")]
        pid_file: PathBuf,
    },
    /// Reconcile the anon map with the volumes and persist it
    Scan {
        /// Config file
        #[arg(short, long)]
        config: PathBuf,
        /// Only print what would change
        #[arg(long)]
        dry_run: bool,
    },
    /// Point a user's entries at another volume, keeping export names
    Relocate {
        /// Config file
        #[arg(short, long)]
        config: PathBuf,
        /// User id
        user: String,
        /// Volume the user was moved from
        from: String,
        /// Volume the user was moved to
        to: String,
    },
    /// Print the public path of a private one
    Translate {
        /// Config file
        #[arg(short, long)]
        config: PathBuf,
        /// Module name (anonym or public)
        module: String,
        /// User id
        user: String,
        /// Path relative to the user's module root
        path: String,
    },
}

impl Commands {
    fn config(&self) -> &Path {
        match self {
            Commands::Run { config, .. }
            | Commands::Scan { config, .. }
            | Commands::Relocate { config, .. }
            | Commands::Translate { config, .. } => config,
        }
    }
}

fn init_logging(verbose: bool, configured: &str) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::from_str(configured).unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn open_store(config: &DaemonConfig) -> Result<MapStore> {
    MapStore::open(
        config.anon_map_file.clone(),
        BackupPolicy::from_dir(config.anon_map_backup_dir.as_deref()),
        &config.export_prefix,
    )
}

fn run_daemon(config: DaemonConfig, detach: bool, pid_file: PathBuf) -> Result<()> {
    let daemon = detach.then(|| Daemon::new(pid_file, PathBuf::from("/")));
    if let Some(daemon) = &daemon {
        daemon.detach()?;
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the runtime")?;
    let result = runtime.block_on(async {
        let ctx = DaemonContext::new(config)?;
        ctx.run().await
    });
    // A console blocked on stdin must not keep the process alive.
    runtime.shutdown_timeout(Duration::from_secs(1));

    if let Some(daemon) = &daemon {
        daemon.remove_pid_file();
    }
    result
}

fn scan(config: &DaemonConfig, dry_run: bool) -> Result<()> {
    // A dry run only reads, so it may run next to the daemon.
    let _lock = (!dry_run)
        .then(|| MapLock::acquire(&config.anon_map_file))
        .transpose()?;
    let store = open_store(config)?;
    let report_dir = if dry_run {
        None
    } else {
        config.report_dir.as_deref()
    };
    let reconciler = Reconciler::new(&config.volumes, report_dir);
    let summary = store.with_map(|map| reconciler.run(map));

    for (key, source) in &summary.relocated {
        println!("relocated {} -> {}", key, source.display());
    }
    for (key, export) in &summary.dropped {
        println!("dropped   {} ({})", key, export);
    }
    for (key, export) in &summary.added {
        println!("added     {} as {}", key, export);
    }
    println!("{}", summary);

    if summary.changed() && !dry_run {
        store.persist()?;
    }
    Ok(())
}

fn relocate(config: &DaemonConfig, user: &str, from: &str, to: &str) -> Result<()> {
    let _lock = MapLock::acquire(&config.anon_map_file)?;
    let store = open_store(config)?;
    let from = config.resolve_volume(from);
    let to = config.resolve_volume(to);
    let moved = store.with_map(|map| map.relocate_user(user, &from, &to));
    if moved > 0 {
        store.persist()?;
    }
    println!(
        "Moved {} entries of {} from {} to {}",
        moved,
        user,
        from.display(),
        to.display()
    );
    Ok(())
}

fn translate(config: &DaemonConfig, module: &str, user: &str, path: &str) -> Result<()> {
    let module = ModuleKind::from_name(module).ok_or_else(|| anyhow!("unknown module {}", module))?;
    let store = open_store(config)?;
    let public = store
        .translate(module, user, path)
        .ok_or_else(|| anyhow!("no {} entry for {} covering {}", module, user, path))?;
    println!("{}", public.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = DaemonConfig::load(cli.command.config())?;
    init_logging(cli.verbose, &config.log_level);

    match cli.command {
        Commands::Run {
            socket_dir,
            console,
            detach,
            pid_file,
            ..
        } => {
            if let Some(dir) = socket_dir {
                config.socket_dir = dir;
            }
            if let Some(mode) = console {
                config.console.mode = mode;
            }
            if detach && config.console.mode == ConsoleMode::Stdin {
                info!("Detached, disabling the stdin console");
                config.console.mode = ConsoleMode::Off;
            }
            config.validate()?;
            info!("Starting shepherd...");
            run_daemon(config, detach, pid_file)
        }
        Commands::Scan { dry_run, .. } => scan(&config, dry_run),
        Commands::Relocate { user, from, to, .. } => relocate(&config, &user, &from, &to),
        Commands::Translate {
            module, user, path, ..
        } => translate(&config, &module, &user, &path),
    }
}
