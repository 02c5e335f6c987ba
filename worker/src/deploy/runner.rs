//! Build subprocess supervision
//!
//! [`BuildRunner::run`] spawns the build and hands back a [`BuildProcess`],
//! which yields output lines as they arrive on either pipe and finally one
//! [`BuildOutcome`]. The outcome is only reported after both pipes reached
//! end-of-file, so no output can arrive after it.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::models::deployment::BuildCommand;

/// Exit code reported when the build could not be started
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;

/// Exit code reported when the build exceeded its time limit
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Exit code for failures that carry no code of their own
pub const GENERIC_FAILURE_EXIT_CODE: i32 = 1;

/// Longer output lines are forwarded in slices of at most this many bytes
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 8 * 1024;

/// Which pipe a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of build output, without its terminator
///
/// Lines end at `\n`, `\r\n` or a lone `\r` (progress redraws). Lines longer
/// than the chunk limit arrive as several chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: OutputStream,
    pub line: String,
}

/// How the build ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// Exited with code 0
    Success,

    /// Exited with a non-zero code
    Failure(i32),

    /// Killed by a signal (unix), or its status could not be collected
    Terminated(Option<i32>),

    /// Never started: missing interpreter, bad working directory, empty command
    SpawnFailed(String),

    /// Killed after exceeding the configured time limit
    TimedOut(Duration),
}

impl BuildOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, BuildOutcome::Success)
    }

    /// Process exit code the worker mirrors for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildOutcome::Success => 0,
            BuildOutcome::Failure(code) => *code,
            BuildOutcome::Terminated(Some(signal)) => 128 + signal,
            BuildOutcome::Terminated(None) => GENERIC_FAILURE_EXIT_CODE,
            BuildOutcome::SpawnFailed(_) => SPAWN_FAILED_EXIT_CODE,
            BuildOutcome::TimedOut(_) => TIMEOUT_EXIT_CODE,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            BuildOutcome::Success => "build succeeded".to_string(),
            BuildOutcome::Failure(code) => format!("build exited with code {}", code),
            BuildOutcome::Terminated(Some(signal)) => {
                format!("build terminated by signal {}", signal)
            }
            BuildOutcome::Terminated(None) => "build terminated abnormally".to_string(),
            BuildOutcome::SpawnFailed(reason) => format!("build could not start: {}", reason),
            BuildOutcome::TimedOut(limit) => format!("build timed out after {:?}", limit),
        }
    }
}

/// Something the build produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    Output(OutputChunk),
    Exited(BuildOutcome),
}

/// Spawns build commands
#[derive(Debug, Clone)]
pub struct BuildRunner {
    timeout: Option<Duration>,
    max_chunk_bytes: usize,
}

impl Default for BuildRunner {
    fn default() -> Self {
        Self {
            timeout: None,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
        }
    }
}

impl BuildRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Split output lines longer than `max_chunk_bytes`
    pub fn with_max_chunk_bytes(mut self, max_chunk_bytes: usize) -> Self {
        // Room for at least one complete UTF-8 character.
        self.max_chunk_bytes = max_chunk_bytes.max(4);
        self
    }

    /// Kill builds that run longer than `timeout`
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Start `command` inside `source_dir`
    ///
    /// Spawn failures are not returned as errors; the process reports them as
    /// its outcome.
    pub fn run(&self, source_dir: &Path, command: &BuildCommand) -> BuildProcess {
        let mut cmd = match build_command(command) {
            Some(cmd) => cmd,
            None => return BuildProcess::failed("empty build command".to_string()),
        };
        cmd.current_dir(source_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(
                    command = %command,
                    source_dir = %source_dir.display(),
                    error = %e,
                    "Failed to spawn build"
                );
                return BuildProcess::failed(e.to_string());
            }
        };

        info!(
            command = %command,
            source_dir = %source_dir.display(),
            pid = child.id(),
            "Build started"
        );

        let max = self.max_chunk_bytes;
        let stdout = child.stdout.take().map(|pipe| LineReader::new(pipe, max));
        let stderr = child.stderr.take().map(|pipe| LineReader::new(pipe, max));
        BuildProcess {
            child: Some(child),
            stdout,
            stderr,
            timeout: self.timeout,
            deadline: self.timeout.map(|t| Instant::now() + t),
            outcome: None,
            finished: false,
        }
    }
}

fn build_command(command: &BuildCommand) -> Option<Command> {
    if command.is_empty() {
        return None;
    }
    match command {
        BuildCommand::Shell(script) => {
            #[cfg(unix)]
            let cmd = {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(script);
                cmd
            };
            #[cfg(not(unix))]
            let cmd = {
                let mut cmd = Command::new("cmd");
                cmd.arg("/C").arg(script);
                cmd
            };
            Some(cmd)
        }
        BuildCommand::Argv(argv) => {
            let (program, args) = argv.split_first()?;
            let mut cmd = Command::new(program);
            cmd.args(args);
            Some(cmd)
        }
    }
}

/// Splits a pipe into lines as soon as their terminator arrives
///
/// Only bytes already consumed from the pipe are buffered, so a cancelled
/// read loses nothing. Invalid UTF-8 is replaced rather than treated as an
/// error so the pipe is always drained to the end.
struct LineReader<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    max_chunk_bytes: usize,
    after_cr: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R, max_chunk_bytes: usize) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            max_chunk_bytes,
            after_cr: false,
        }
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.take(self.buf.len())));
            }

            // The `\n` of a `\r\n` pair was already accounted for by the `\r`.
            if std::mem::take(&mut self.after_cr) && available[0] == b'\n' {
                self.reader.consume(1);
                continue;
            }

            let room = self.max_chunk_bytes.saturating_sub(self.buf.len());
            let window = &available[..available.len().min(room)];
            match window.iter().position(|b| *b == b'\n' || *b == b'\r') {
                Some(end) => {
                    self.after_cr = window[end] == b'\r';
                    self.buf.extend_from_slice(&window[..end]);
                    self.reader.consume(end + 1);
                    return Ok(Some(self.take(self.buf.len())));
                }
                None => {
                    let n = window.len();
                    self.buf.extend_from_slice(window);
                    self.reader.consume(n);
                    if self.buf.len() >= self.max_chunk_bytes {
                        let end = utf8_boundary(&self.buf);
                        return Ok(Some(self.take(end)));
                    }
                }
            }
        }
    }

    fn take(&mut self, end: usize) -> String {
        let rest = self.buf.split_off(end);
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf = rest;
        line
    }
}

/// Length of `buf` without a trailing incomplete UTF-8 sequence
fn utf8_boundary(buf: &[u8]) -> usize {
    match std::str::from_utf8(buf) {
        Ok(_) => buf.len(),
        Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => e.valid_up_to(),
        Err(_) => buf.len(),
    }
}

async fn next_line<R: AsyncRead + Unpin>(
    reader: &mut Option<LineReader<R>>,
) -> std::io::Result<Option<String>> {
    match reader.as_mut() {
        Some(reader) => reader.next_line().await,
        None => std::future::pending().await,
    }
}

/// A running (or failed-to-start) build
pub struct BuildProcess {
    child: Option<Child>,
    stdout: Option<LineReader<ChildStdout>>,
    stderr: Option<LineReader<ChildStderr>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    outcome: Option<BuildOutcome>,
    finished: bool,
}

impl BuildProcess {
    fn failed(reason: String) -> Self {
        Self {
            child: None,
            stdout: None,
            stderr: None,
            timeout: None,
            deadline: None,
            outcome: Some(BuildOutcome::SpawnFailed(reason)),
            finished: false,
        }
    }

    /// Next output line or the final outcome; `None` after the outcome
    pub async fn next_event(&mut self) -> Option<BuildEvent> {
        if self.finished {
            return None;
        }
        if let Some(outcome) = self.outcome.take() {
            self.finished = true;
            return Some(BuildEvent::Exited(outcome));
        }

        while self.stdout.is_some() || self.stderr.is_some() {
            let deadline = self.deadline;
            tokio::select! {
                line = next_line(&mut self.stdout), if self.stdout.is_some() => {
                    match line {
                        Ok(Some(line)) => return Some(chunk(OutputStream::Stdout, line)),
                        Ok(None) => self.stdout = None,
                        Err(e) => {
                            warn!(error = %e, "Error reading build stdout");
                            self.stdout = None;
                        }
                    }
                }
                line = next_line(&mut self.stderr), if self.stderr.is_some() => {
                    match line {
                        Ok(Some(line)) => return Some(chunk(OutputStream::Stderr, line)),
                        Ok(None) => self.stderr = None,
                        Err(e) => {
                            warn!(error = %e, "Error reading build stderr");
                            self.stderr = None;
                        }
                    }
                }
                _ = sleep_until(deadline), if deadline.is_some() => {
                    let outcome = self.kill_after_timeout().await;
                    return Some(self.finish(outcome));
                }
            }
        }

        let outcome = self.wait().await;
        Some(self.finish(outcome))
    }

    fn finish(&mut self, outcome: BuildOutcome) -> BuildEvent {
        self.finished = true;
        self.stdout = None;
        self.stderr = None;
        self.child = None;
        BuildEvent::Exited(outcome)
    }

    async fn wait(&mut self) -> BuildOutcome {
        let Some(child) = self.child.as_mut() else {
            return BuildOutcome::Terminated(None);
        };

        let waited = match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, child.wait()).await.ok(),
            None => Some(child.wait().await),
        };
        let Some(status) = waited else {
            return self.kill_after_timeout().await;
        };

        match status {
            Ok(status) => outcome_from_status(status),
            Err(e) => {
                error!(error = %e, "Failed to wait for build");
                BuildOutcome::Terminated(None)
            }
        }
    }

    async fn kill_after_timeout(&mut self) -> BuildOutcome {
        let limit = self.timeout.unwrap_or_default();
        warn!("Build exceeded {:?}, killing it", limit);
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill build");
            }
        }
        BuildOutcome::TimedOut(limit)
    }
}

fn chunk(stream: OutputStream, line: String) -> BuildEvent {
    BuildEvent::Output(OutputChunk { stream, line })
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn outcome_from_status(status: ExitStatus) -> BuildOutcome {
    match status.code() {
        Some(0) => BuildOutcome::Success,
        Some(code) => BuildOutcome::Failure(code),
        None => {
            #[cfg(unix)]
            let signal = {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            };
            #[cfg(not(unix))]
            let signal = None;
            debug!(?signal, "Build ended without an exit code");
            BuildOutcome::Terminated(signal)
        }
    }
}
