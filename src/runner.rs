//! Direct (shell-free) execution of the external binary with streamed,
//! redacted output.
//!
//! A run moves through Starting -> Streaming -> one of Completed, TimedOut,
//! or Cancelled. Failure to start never produces a result; it surfaces as
//! `AppError::Spawn` before any process exists. Every line crosses the
//! redaction rule set before it reaches the stream, the captured buffers,
//! or any log sink.

use crate::errors::AppError;
use crate::security::redact::RuleSet;
use crate::security::sanitizer;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

/// One invocation of the external binary. Immutable once built; the
/// argument list holds discrete tokens that are never joined into a shell
/// line.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub binary: PathBuf,
    args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub pass_env: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(binary: PathBuf, cwd: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary,
            args: Vec::new(),
            cwd,
            env: Vec::new(),
            pass_env: Vec::new(),
            timeout,
        }
    }

    /// Append an argument token after the defense-in-depth check.
    pub fn push_arg(&mut self, arg: impl Into<String>) -> Result<(), AppError> {
        let arg = arg.into();
        sanitizer::command_arg(&arg)?;
        self.args.push(arg);
        Ok(())
    }

    pub fn push_args<I, S>(&mut self, args: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self.push_arg(arg)?;
        }
        Ok(())
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A single redacted line of child output.
#[derive(Debug, Clone, Serialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    /// None when the process was killed (timeout/cancel) or ended on a
    /// signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub cancelled: bool,
    /// Captured buffers were capped; the live stream was not.
    pub truncated: bool,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled
    }

    /// Completion event payload for streaming callers; output already went
    /// out line-by-line, so the buffers are not repeated here.
    pub fn summary_json(&self) -> serde_json::Value {
        json!({
            "exit_code": self.exit_code,
            "success": self.success(),
            "duration_ms": self.duration_ms,
            "timed_out": self.timed_out,
            "cancelled": self.cancelled,
            "truncated": self.truncated,
        })
    }
}

/// Caller-side handle to request termination of a running command.
#[derive(Clone, Default)]
pub struct CancelHandle {
    notify: Arc<Notify>,
    requested: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_cancelled(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    async fn triggered(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Limits applied to every run, from the config.
#[derive(Debug, Clone, Copy)]
pub struct RunnerSettings {
    pub cancel_grace: Duration,
    pub max_capture_bytes: usize,
}

/// A spawned command: a finite, non-restartable stream of redacted lines
/// plus a separate completion future. Dropping it kills the child.
pub struct RunningCommand {
    pub lines: mpsc::Receiver<OutputLine>,
    pub cancel: CancelHandle,
    done: tokio::task::JoinHandle<ExecutionResult>,
}

impl RunningCommand {
    /// Drain any unconsumed lines and wait for the final result.
    pub async fn wait(mut self) -> ExecutionResult {
        while self.lines.recv().await.is_some() {}
        finish(self.done).await
    }
}

async fn finish(done: tokio::task::JoinHandle<ExecutionResult>) -> ExecutionResult {
    done.await.unwrap_or_else(|e| {
        warn!(error = %e, "runner task failed");
        ExecutionResult {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            timed_out: false,
            cancelled: false,
            truncated: false,
        }
    })
}

/// Spawn the binary directly with an argument vector. The environment is
/// cleared and rebuilt from the pass-through list plus explicit overrides;
/// stdin is null; on Windows no console window is created.
pub fn spawn(
    spec: &CommandSpec,
    rules: Arc<RuleSet>,
    settings: RunnerSettings,
) -> Result<RunningCommand, AppError> {
    for arg in &spec.args {
        sanitizer::command_arg(arg)?;
    }

    let mut command = Command::new(&spec.binary);
    command.args(&spec.args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    command.stdin(Stdio::null());
    command.stdout(Stdio::piped());
    command.stderr(Stdio::piped());
    command.env_clear();
    for key in &spec.pass_env {
        if let Ok(value) = std::env::var(key) {
            command.env(key, value);
        }
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command.kill_on_drop(true);
    #[cfg(windows)]
    {
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }

    let mut child = command
        .spawn()
        .map_err(|e| AppError::Spawn(format!("{}: {e}", spec.binary.display())))?;
    debug!(binary = %spec.binary.display(), args = spec.args.len(), "spawned");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (line_tx, line_rx) = mpsc::channel::<OutputLine>(256);
    if let Some(stdout) = stdout {
        tokio::spawn(pump(stdout, OutputStream::Stdout, line_tx.clone(), rules.clone()));
    }
    if let Some(stderr) = stderr {
        tokio::spawn(pump(stderr, OutputStream::Stderr, line_tx.clone(), rules));
    }
    drop(line_tx);

    let (out_tx, out_rx) = mpsc::channel::<OutputLine>(256);
    let cancel = CancelHandle::new();
    let done = tokio::spawn(drive(
        child,
        line_rx,
        out_tx,
        cancel.clone(),
        spec.timeout,
        settings,
    ));

    Ok(RunningCommand {
        lines: out_rx,
        cancel,
        done,
    })
}

/// Buffered convenience: collect the whole (redacted) output and return the
/// final result.
pub async fn run(
    spec: &CommandSpec,
    rules: Arc<RuleSet>,
    settings: RunnerSettings,
) -> Result<ExecutionResult, AppError> {
    let running = spawn(spec, rules, settings)?;
    Ok(running.wait().await)
}

/// Read one pipe to EOF, pushing each line through the redactor.
async fn pump<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
    rules: Arc<RuleSet>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let text = rules.redact(&line);
        if tx.send(OutputLine { stream, text }).await.is_err() {
            break;
        }
    }
}

async fn drive(
    mut child: Child,
    mut line_rx: mpsc::Receiver<OutputLine>,
    out_tx: mpsc::Sender<OutputLine>,
    cancel: CancelHandle,
    run_timeout: Duration,
    settings: RunnerSettings,
) -> ExecutionResult {
    let start = Instant::now();
    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut truncated = false;
    let mut timed_out = false;
    let mut cancelled = false;
    let mut reaped: Option<std::process::ExitStatus> = None;

    // the watchdog wraps the whole streaming phase, so it fires even if a
    // stalled consumer blocks a send in mid-arm
    let streaming = async {
        loop {
            tokio::select! {
                maybe = line_rx.recv() => match maybe {
                    Some(line) => {
                        capture(&line, &mut stdout, &mut stderr, settings.max_capture_bytes, &mut truncated);
                        let _ = out_tx.send(line).await;
                    }
                    // both pipes reached EOF
                    None => break false,
                },
                _ = cancel.triggered() => break true,
            }
        }
    };
    match timeout(run_timeout, streaming).await {
        Ok(false) => {}
        Ok(true) => {
            cancelled = true;
            reaped = terminate(&mut child, settings.cancel_grace).await;
        }
        Err(_) => {
            timed_out = true;
            warn!(timeout_ms = run_timeout.as_millis() as u64, "run timed out, killing child");
            let _ = child.start_kill();
        }
    }

    // pick up lines that were already buffered when we stopped streaming;
    // forwarding is best-effort here, capture still records them
    while let Ok(Some(line)) = timeout(Duration::from_millis(200), line_rx.recv()).await {
        capture(&line, &mut stdout, &mut stderr, settings.max_capture_bytes, &mut truncated);
        let _ = out_tx.try_send(line);
    }

    let status = match reaped {
        Some(status) => Some(status),
        None => match timeout(reap_window(timed_out, cancelled, run_timeout), child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(_)) => None,
            Err(_) => {
                if !timed_out && !cancelled {
                    timed_out = true;
                }
                let _ = child.start_kill();
                let _ = timeout(Duration::from_secs(5), child.wait()).await;
                None
            }
        },
    };

    let exit_code = if timed_out || cancelled {
        None
    } else {
        status.and_then(|s| s.code())
    };

    ExecutionResult {
        exit_code,
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
        timed_out,
        cancelled,
        truncated,
    }
}

fn reap_window(timed_out: bool, cancelled: bool, run_timeout: Duration) -> Duration {
    if timed_out || cancelled {
        Duration::from_secs(5)
    } else {
        // pipes are closed; a healthy child exits promptly, but keep the
        // watchdog bound in case it lingers
        run_timeout
    }
}

fn capture(
    line: &OutputLine,
    stdout: &mut String,
    stderr: &mut String,
    max_bytes: usize,
    truncated: &mut bool,
) {
    let target = match line.stream {
        OutputStream::Stdout => stdout,
        OutputStream::Stderr => stderr,
    };
    if target.len() + line.text.len() + 1 > max_bytes {
        *truncated = true;
        return;
    }
    if !target.is_empty() {
        target.push('\n');
    }
    target.push_str(&line.text);
}

/// Graceful termination: SIGTERM, a short grace period, then SIGKILL.
/// Returns the exit status if the child was reaped during the grace period.
async fn terminate(child: &mut Child, grace: Duration) -> Option<std::process::ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned and have not yet reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
        if let Ok(Ok(status)) = timeout(grace, child.wait()).await {
            return Some(status);
        }
    }
    #[cfg(not(unix))]
    let _ = grace;
    let _ = child.start_kill();
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::redact::{RuleSet, REDACTION_MARKER};

    fn settings() -> RunnerSettings {
        RunnerSettings {
            cancel_grace: Duration::from_millis(500),
            max_capture_bytes: 1024 * 1024,
        }
    }

    fn spec(binary: &str, args: &[&str], timeout: Duration) -> CommandSpec {
        let mut spec = CommandSpec::new(PathBuf::from(binary), None, timeout);
        spec.push_args(args.iter().copied()).unwrap();
        spec.pass_env = vec!["PATH".to_string()];
        spec
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error_not_exit_code() {
        let spec = spec("/no/such/binary-xyz", &[], Duration::from_secs(5));
        let err = run(&spec, Arc::new(RuleSet::empty()), settings())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_output_is_streamed_and_redacted() {
        let spec = spec(
            "/bin/echo",
            &["deploy key secret-token-123 accepted"],
            Duration::from_secs(5),
        );
        let rules = Arc::new(RuleSet::build(["secret-token-123"], &[]));
        let mut running = spawn(&spec, rules, settings()).unwrap();

        let mut seen = Vec::new();
        while let Some(line) = running.lines.recv().await {
            seen.push(line);
        }
        let result = running.wait().await;

        assert_eq!(result.exit_code, Some(0));
        assert!(result.success());
        let stdout_lines: Vec<&OutputLine> = seen
            .iter()
            .filter(|l| l.stream == OutputStream::Stdout)
            .collect();
        assert_eq!(stdout_lines.len(), 1);
        assert!(!stdout_lines[0].text.contains("secret-token-123"));
        assert!(stdout_lines[0].text.contains(REDACTION_MARKER));
        assert!(!result.stdout.contains("secret-token-123"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_a_result_not_an_error() {
        let spec = spec("/bin/sh", &["-c", "exit 3"], Duration::from_secs(5));
        // the runner itself never builds shell lines; this test just needs a
        // portable nonzero-exit binary
        let result = run(&spec, Arc::new(RuleSet::empty()), settings())
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success());
        assert!(!result.timed_out);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_child() {
        let spec = spec("/bin/sleep", &["30"], Duration::from_millis(300));
        let start = Instant::now();
        let result = run(&spec, Arc::new(RuleSet::empty()), settings())
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.cancelled);
        assert_eq!(result.exit_code, None);
        // the child did not run to completion
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_terminates_and_flags() {
        let spec = spec("/bin/sleep", &["30"], Duration::from_secs(60));
        let running = spawn(&spec, Arc::new(RuleSet::empty()), settings()).unwrap();
        let cancel = running.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });
        let start = Instant::now();
        let result = running.wait().await;
        assert!(result.cancelled);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn capture_is_capped_but_stream_continues() {
        let spec = spec("/bin/sh", &["-c", "seq 2000"], Duration::from_secs(10));
        let mut small = settings();
        small.max_capture_bytes = 256;
        let mut running = spawn(&spec, Arc::new(RuleSet::empty()), small).unwrap();
        let mut streamed = 0usize;
        while let Some(_line) = running.lines.recv().await {
            streamed += 1;
        }
        let result = running.wait().await;
        assert!(result.truncated);
        assert!(result.stdout.len() <= 256);
        assert_eq!(streamed, 2000);
        assert_eq!(result.exit_code, Some(0));
    }

    #[test]
    fn push_arg_enforces_defense_in_depth() {
        let mut spec = CommandSpec::new(PathBuf::from("x"), None, Duration::from_secs(1));
        assert!(spec.push_arg("ok").is_ok());
        assert!(spec.push_arg("bad\0arg").is_err());
        assert_eq!(spec.args().len(), 1);
    }
}
