// Background startup with a readiness report
//
// The parent forks and then blocks on a pipe until the child says whether the
// index opened and the filesystem mounted. Startup errors therefore reach the
// invoking shell and its exit status instead of a detached /dev/null stderr.

use anyhow::Context;
use nix::unistd::{ForkResult, dup2_stderr, dup2_stdin, dup2_stdout, fork, pipe, setsid};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};

const READY: &str = "ready";
const FAILED: &str = "error: ";

/// Write end of the startup pipe, held by the detached child
#[derive(Debug)]
pub struct Readiness {
    pipe: File,
}

impl Readiness {
    pub fn new(pipe: File) -> Self {
        Self { pipe }
    }

    /// Startup succeeded; the waiting parent exits with status 0
    pub fn ready(self) {
        self.send(READY);
    }

    /// Startup failed; the waiting parent prints `err` and exits non-zero
    pub fn fail(self, err: &anyhow::Error) {
        // One line per report
        let message = format!("{:#}", err).replace('\n', " ");
        self.send(&format!("{}{}", FAILED, message));
    }

    fn send(mut self, message: &str) {
        if let Err(e) = writeln!(self.pipe, "{}", message) {
            tracing::warn!(error = %e, "Failed to report startup outcome");
        }
    }
}

/// Outcome reported by the child, read until it closes its end of the pipe
pub fn read_outcome(mut pipe: impl Read) -> anyhow::Result<()> {
    let mut message = String::new();
    pipe.read_to_string(&mut message).context("Failed to read startup outcome")?;

    let message = message.trim_end();
    if message == READY {
        return Ok(());
    }
    match message.strip_prefix(FAILED) {
        Some(err) => anyhow::bail!("{}", err),
        None => anyhow::bail!("Background process exited before reporting readiness"),
    }
}

/// Fork into the background, returning in the child only.
///
/// The parent waits for the child's `Readiness` report and exits with status 0
/// on success or 1 on failure. Must run before any other thread exists.
pub fn daemonize() -> anyhow::Result<Readiness> {
    let (read_end, write_end) = pipe().context("Failed to create readiness pipe")?;

    // SAFETY: the process is still single-threaded, so the child gets a consistent copy
    match unsafe { fork() }.context("Failed to fork")? {
        ForkResult::Parent { child } => {
            drop(write_end);
            match read_outcome(File::from(read_end)) {
                Ok(()) => {
                    tracing::info!(pid = child.as_raw(), "Running in background");
                    std::process::exit(0)
                }
                Err(e) => {
                    tracing::error!("{:#}", e);
                    std::process::exit(1)
                }
            }
        }
        ForkResult::Child => {
            drop(read_end);
            let readiness = Readiness::new(File::from(write_end));
            match detach() {
                Ok(()) => Ok(readiness),
                Err(e) => {
                    readiness.fail(&e);
                    Err(e)
                }
            }
        }
    }
}

/// New session, stdio on /dev/null; the working directory is kept so relative
/// paths still resolve
fn detach() -> anyhow::Result<()> {
    setsid().context("Failed to start a new session")?;

    let null = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    dup2_stdin(&null)?;
    dup2_stdout(&null)?;
    dup2_stderr(&null)?;
    Ok(())
}
