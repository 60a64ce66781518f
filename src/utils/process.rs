//! Blocking helpers for running short-lived external programs.
//!
//! Used for probes, tooling (`gpg`, `docker`, `atomic`, `ip`) and
//! pre-commands, not for collection commands, which go through the async
//! collector. Every run is bounded: the child leads its own process group
//! and the whole group is killed when the timeout expires.

use anyhow::{Context, Result};
use log::{debug, warn};
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::{COMMAND_LOCALE, PROBE_TIMEOUT_SECS, TIMEOUT_EXIT_STATUS};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn timed_out(&self) -> bool {
        self.status == TIMEOUT_EXIT_STATUS
    }
}

/// Default bound for tool probes.
pub fn probe_timeout() -> Duration {
    Duration::from_secs(PROBE_TIMEOUT_SECS)
}

/// Run `program` with `args` under the C locale and capture its output.
///
/// A run that outlives `timeout` is killed with its process group and
/// reported with status 130 and empty output.
pub fn run_program(program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
    debug!("Running {} {}", program, args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .env("LC_ALL", COMMAND_LOCALE)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .context(format!("Failed to execute {}", program))?;

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = match wait_until(&mut child, Instant::now() + timeout)? {
        Some(status) => status,
        None => {
            kill_group(&mut child);
            warn!("{} timed out after {}s", program, timeout.as_secs());
            // Reader threads are left to finish on their own once the
            // pipes close.
            return Ok(CommandOutput {
                status: TIMEOUT_EXIT_STATUS,
                stdout: String::new(),
                stderr: String::new(),
            });
        }
    };

    Ok(CommandOutput {
        status: status.code().unwrap_or(-1),
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

/// Run a command line through `/bin/sh -c`, for rule-supplied pipelines.
pub fn run_shell(command_line: &str, timeout: Duration) -> Result<CommandOutput> {
    run_program("/bin/sh", &["-c", command_line], timeout)
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait().context("Failed to wait for child")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn kill_group(child: &mut Child) {
    // The child leads its own process group.
    unsafe {
        libc::killpg(child.id() as libc::pid_t, libc::SIGKILL);
    }
    let _ = child.kill();
    let _ = child.wait();
}
