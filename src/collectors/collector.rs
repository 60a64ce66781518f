use anyhow::{Context, Result};
use futures::future;
use log::{debug, info, warn};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, Semaphore};

use super::pipeline::{read_line_bounded, LineFilter};
use super::special::is_hostname_command;
use crate::constants::{
    COMMAND_DENYLIST, COMMAND_LOCALE, DEFAULT_COMMAND_TIMEOUT_SECS, MAX_CONCURRENT_TASKS,
    MAX_LINE_BYTES, NOT_EXECUTABLE_EXIT_STATUS, NOT_FOUND_EXIT_STATUS, TIMEOUT_EXIT_STATUS,
};
use crate::models::{ArchiveEntry, CollectionTask, Payload, TaskKind};
use crate::security::{log_security_event, ContentNormalizer, SecurityEvent};
use crate::targets::determine_hostname;

/// Executes one collection task.
///
/// Ordinary failures (missing file, missing executable, timeout) come back
/// as entries with an exit status; `Err` is reserved for local I/O problems
/// such as an unusable spool directory.
#[async_trait::async_trait]
pub trait TaskCollector: Send + Sync {
    async fn run(&self, task: &CollectionTask) -> Result<ArchiveEntry>;
}

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub command_timeout: Duration,
    /// Where command and file output is spooled before archiving
    pub spool_dir: PathBuf,
    pub normalizer: Arc<ContentNormalizer>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            spool_dir: std::env::temp_dir(),
            normalizer: Arc::new(ContentNormalizer::builtin()),
        }
    }
}

/// Collector for files and commands on the local machine.
#[derive(Debug, Clone, Default)]
pub struct Collector {
    settings: CollectorSettings,
}

fn text_entry(task: &CollectionTask, text: String, status: Option<i32>) -> ArchiveEntry {
    ArchiveEntry {
        kind: task.kind,
        archive_path: task.archive_path.clone(),
        payload: Payload::Text(text),
        exit_status: status,
    }
}

/// True when the executable's basename is on the denylist.
pub fn is_denylisted(argv0: &str) -> bool {
    let name = argv0.rsplit('/').next().unwrap_or(argv0);
    COMMAND_DENYLIST.contains(&name)
}

fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // The child leads its own process group, so this also reaches
        // anything it spawned.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        match read_line_bounded(&mut reader, &mut line, MAX_LINE_BYTES).await {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Stopped reading command output: {}", e);
                break;
            }
        }
    }
}

impl Collector {
    pub fn new(settings: CollectorSettings) -> Self {
        Self { settings }
    }

    fn line_filter(&self, task: &CollectionTask) -> LineFilter {
        LineFilter::new(
            Arc::clone(&self.settings.normalizer),
            &task.line_include_patterns,
            &task.line_exclude_patterns,
        )
    }

    fn new_spool(&self) -> Result<NamedTempFile> {
        tempfile::Builder::new()
            .prefix("insights-spool-")
            .tempfile_in(&self.settings.spool_dir)
            .context(format!(
                "Failed to create spool file in {}",
                self.settings.spool_dir.display()
            ))
    }

    async fn collect_file(&self, task: &CollectionTask) -> Result<ArchiveEntry> {
        let file = match tokio::fs::File::open(&task.source).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("File {} does not exist", task.source);
                return Ok(text_entry(
                    task,
                    format!("File not found: {}\n", task.source),
                    Some(NOT_FOUND_EXIT_STATUS),
                ));
            }
            Err(e) => {
                warn!("Could not open {}: {}", task.source, e);
                return Ok(text_entry(task, format!("Could not read {}: {}\n", task.source, e), Some(1)));
            }
        };

        let spool = self.new_spool()?;
        let mut writer = BufWriter::new(tokio::fs::File::from_std(spool.reopen()?));
        let mut reader = BufReader::new(file);

        match self.line_filter(task).filter_stream(&mut reader, &mut writer).await {
            Ok(_) => Ok(ArchiveEntry {
                kind: TaskKind::File,
                archive_path: task.archive_path.clone(),
                payload: Payload::Spooled(spool.into_temp_path()),
                exit_status: None,
            }),
            Err(e) => {
                warn!("Failed reading {}: {}", task.source, e);
                Ok(text_entry(task, format!("Could not read {}: {}\n", task.source, e), Some(1)))
            }
        }
    }

    async fn collect_command(&self, task: &CollectionTask) -> Result<ArchiveEntry> {
        if is_hostname_command(&task.source) {
            let hostname = determine_hostname(None);
            return Ok(text_entry(task, format!("{}\n", hostname), Some(0)));
        }

        let argv = match shlex::split(&task.source) {
            Some(argv) if !argv.is_empty() => argv,
            _ => {
                warn!("Cannot parse command line: {}", task.source);
                return Ok(text_entry(task, format!("Could not parse command: {}\n", task.source), Some(1)));
            }
        };

        if is_denylisted(&argv[0]) {
            log_security_event(SecurityEvent::CommandDenied {
                command: task.source.clone(),
            });
            return Ok(text_entry(
                task,
                format!("Command is on the denylist and was not run: {}\n", task.source),
                Some(NOT_EXECUTABLE_EXIT_STATUS),
            ));
        }

        let mut std_cmd = std::process::Command::new(&argv[0]);
        std_cmd
            .args(&argv[1..])
            .env("LC_ALL", COMMAND_LOCALE)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        let mut command = tokio::process::Command::from(std_cmd);
        command.kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Command not found: {}", task.source);
                return Ok(text_entry(task, "Command not found\n".to_string(), Some(NOT_FOUND_EXIT_STATUS)));
            }
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                return Ok(text_entry(
                    task,
                    format!("Could not find cmd: {}\n", task.source),
                    Some(NOT_EXECUTABLE_EXIT_STATUS),
                ));
            }
            Err(e) => {
                warn!("Failed to start {}: {}", task.source, e);
                return Ok(text_entry(task, format!("Failed to start command: {}\n", e), Some(1)));
            }
        };

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(stderr, tx.clone()));
        }
        drop(tx);

        let spool = self.new_spool()?;
        let mut writer = BufWriter::new(tokio::fs::File::from_std(spool.reopen()?));
        let filter = self.line_filter(task);
        let pid = child.id();

        let run = async {
            while let Some(line) = rx.recv().await {
                if let Some(out) = filter.apply(&line) {
                    writer.write_all(&out).await?;
                }
            }
            writer.flush().await?;
            child.wait().await
        };
        let outcome = tokio::time::timeout(self.settings.command_timeout, run).await;

        let status = match outcome {
            Err(_) => {
                kill_process_group(pid);
                let _ = child.kill().await;
                warn!(
                    "Command timed out after {}s: {}",
                    self.settings.command_timeout.as_secs(),
                    task.source
                );
                return Ok(text_entry(
                    task,
                    format!(
                        "Command timed out after {} seconds\n",
                        self.settings.command_timeout.as_secs()
                    ),
                    Some(TIMEOUT_EXIT_STATUS),
                ));
            }
            Ok(Err(e)) => {
                warn!("Failed collecting output of {}: {}", task.source, e);
                return Ok(text_entry(task, format!("Failed to collect output: {}\n", e), Some(1)));
            }
            Ok(Ok(status)) => status,
        };

        let code = status
            .code()
            .or_else(|| status.signal().map(|signal| 128 + signal))
            .unwrap_or(-1);

        if code == NOT_FOUND_EXIT_STATUS || code == NOT_EXECUTABLE_EXIT_STATUS {
            return Ok(text_entry(task, format!("Could not find cmd: {}\n", task.source), Some(code)));
        }
        if code != 0 {
            debug!("Command {} exited with status {}", task.source, code);
        }

        Ok(ArchiveEntry {
            kind: TaskKind::Command,
            archive_path: task.archive_path.clone(),
            payload: Payload::Spooled(spool.into_temp_path()),
            exit_status: Some(code),
        })
    }
}

#[async_trait::async_trait]
impl TaskCollector for Collector {
    async fn run(&self, task: &CollectionTask) -> Result<ArchiveEntry> {
        match task.kind {
            TaskKind::File => self.collect_file(task).await,
            TaskKind::Command => self.collect_command(task).await,
        }
    }
}

/// Run tasks with bounded concurrency; results keep task order.
///
/// Tasks whose collection fails locally are logged and left out.
pub async fn collect_tasks_parallel(
    collector: Arc<dyn TaskCollector>,
    tasks: Vec<CollectionTask>,
) -> Vec<ArchiveEntry> {
    let max_concurrent = std::cmp::min(num_cpus::get() * 2, MAX_CONCURRENT_TASKS);
    let semaphore = Arc::new(Semaphore::new(max_concurrent));
    info!("Collecting {} tasks ({} at a time)", tasks.len(), max_concurrent);

    let futures = tasks.into_iter().map(|task| {
        let collector = Arc::clone(&collector);
        let semaphore = Arc::clone(&semaphore);
        async move {
            let _permit = semaphore.acquire().await.ok()?;
            debug!("Collecting {}", task.source);
            match collector.run(&task).await {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!("Failed to collect {}: {:#}", task.source, e);
                    None
                }
            }
        }
    });

    future::join_all(futures).await.into_iter().flatten().collect()
}

/// Synchronous wrapper that drives [`collect_tasks_parallel`] on a fresh runtime
pub fn collect_tasks(
    collector: Arc<dyn TaskCollector>,
    tasks: Vec<CollectionTask>,
) -> Result<Vec<ArchiveEntry>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    Ok(runtime.block_on(collect_tasks_parallel(collector, tasks)))
}
