//! Detaching the daemon from the terminal.
//!
//! Must run before the tokio runtime is built: forking a process that already
//! has runtime threads leaves the child with only the forking thread.

use anyhow::{Context, Result};
use log::{debug, error, info};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{dup2, fork, setsid, ForkResult};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Background process setup with a PID file.
#[derive(Debug, Clone)]
pub struct Daemon {
    pid_file: PathBuf,
    work_dir: PathBuf,
}

impl Daemon {
    /// # Arguments
    ///
    /// * `pid_file` - Receives the daemon's process id
    /// * `work_dir` - Working directory of the detached process
    pub fn new(pid_file: PathBuf, work_dir: PathBuf) -> Self {
        Self { pid_file, work_dir }
    }

    /// Path of the PID file.
    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Double-forks into the background.
    ///
    /// Only the final grandchild returns; both parents exit. The grandchild
    /// runs in a new session with stdin, stdout and stderr on `/dev/null` and
    /// has written its PID file.
    pub fn detach(&self) -> Result<()> {
        // SAFETY: called before any other thread is started.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { .. }) => std::process::exit(0),
            Ok(ForkResult::Child) => {}
            Err(err) => {
                error!("First fork failed: {}", err);
                return Err(err).context("first fork");
            }
        }

        setsid().context("starting a new session")?;

        // SAFETY: still single-threaded.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { .. }) => std::process::exit(0),
            Ok(ForkResult::Child) => {}
            Err(err) => {
                error!("Second fork failed: {}", err);
                return Err(err).context("second fork");
            }
        }

        // Report dirs are created with explicit modes; keep group/other write off elsewhere.
        umask(Mode::from_bits_truncate(0o022));
        std::env::set_current_dir(&self.work_dir)
            .with_context(|| format!("changing to {}", self.work_dir.display()))?;
        redirect_std_streams()?;
        self.write_pid_file()?;

        info!("Detached as pid {}", std::process::id());
        Ok(())
    }

    /// Writes the current process id to the PID file.
    pub fn write_pid_file(&self) -> Result<()> {
        let mut file = File::create(&self.pid_file)
            .with_context(|| format!("creating {}", self.pid_file.display()))?;
        writeln!(file, "{}", std::process::id())?;
        Ok(())
    }

    /// Deletes the PID file; a missing file is fine.
    pub fn remove_pid_file(&self) {
        match fs::remove_file(&self.pid_file) {
            Ok(()) => debug!("Removed {}", self.pid_file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => error!("Cannot remove {}: {}", self.pid_file.display(), e),
        }
    }
}

fn redirect_std_streams() -> Result<()> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("opening /dev/null")?;
    for fd in 0..3 {
        dup2(null.as_raw_fd(), fd)?;
    }
    Ok(())
}
