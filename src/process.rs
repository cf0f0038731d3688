//! Supervised external processes.
//!
//! `ProcessHandle` is the single start/stop/wait primitive used by the
//! recorder, the clip capture, and the out-of-process detector. Every wait is
//! bounded; stopping escalates from a graceful request to a forced kill.
//!
//! On unix each child leads its own process group and signals go to the whole
//! group, so wrapper scripts cannot leave a forked descendant holding the
//! stderr pipe open.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::Result;

use crate::error::PipelineError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long an exited process's stderr reader is waited for before it is
/// detached.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

/// Program plus explicit argument list.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    /// Short name used in logs and errors (e.g. "recorder").
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Pipe stdout back to the caller instead of discarding it.
    pub capture_stdout: bool,
}

impl CommandSpec {
    pub fn new(label: impl Into<String>, program: impl Into<PathBuf>) -> Self {
        Self {
            label: label.into(),
            program: program.into(),
            args: Vec::new(),
            capture_stdout: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture_stdout = true;
        self
    }
}

/// How a stop request ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process had already exited before the stop request.
    AlreadyExited(ExitStatus),
    /// The process honoured the graceful request.
    Graceful(ExitStatus),
    /// The process had to be killed.
    Forced,
}

pub struct ProcessHandle {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_tail: Arc<Mutex<Option<String>>>,
    stderr_thread: Option<JoinHandle<()>>,
    started_at: Instant,
    exit_status: Option<ExitStatus>,
}

impl ProcessHandle {
    pub fn spawn(spec: &CommandSpec) -> Result<Self> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(if spec.capture_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|e| {
                PipelineError::ProcessSupervision(format!(
                    "{}: failed to spawn {}: {}",
                    spec.label,
                    spec.program.display(),
                    e
                ))
            })?;

        let stderr_tail = Arc::new(Mutex::new(None));
        let stderr_thread = child.stderr.take().and_then(|stderr| {
            let tail = stderr_tail.clone();
            let label = spec.label.clone();
            std::thread::Builder::new()
                .name(format!("{label}-stderr"))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        let Ok(line) = line else { break };
                        let line = line.trim().to_string();
                        if line.is_empty() {
                            continue;
                        }
                        log::debug!("{label}: {line}");
                        *tail.lock().unwrap_or_else(PoisonError::into_inner) = Some(line);
                    }
                })
                .ok()
        });

        log::debug!(
            "{}: spawned pid {} ({})",
            spec.label,
            child.id(),
            spec.program.display()
        );
        Ok(Self {
            label: spec.label.clone(),
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child,
            stderr_tail,
            stderr_thread,
            started_at: Instant::now(),
            exit_status: None,
        })
    }

    /// Spawn, wait up to `timeout`, and require a zero exit status.
    ///
    /// On timeout the process is killed.
    pub fn run_to_completion(spec: &CommandSpec, timeout: Duration) -> Result<ExitStatus> {
        let mut handle = Self::spawn(spec)?;
        // Nothing is fed to one-shot commands.
        handle.stdin.take();
        match handle.wait_timeout(timeout)? {
            Some(status) if status.success() => Ok(status),
            Some(status) => Err(PipelineError::ProcessSupervision(format!(
                "{} exited with {}{}",
                spec.label,
                status,
                handle
                    .last_stderr_line()
                    .map(|line| format!(": {line}"))
                    .unwrap_or_default()
            ))
            .into()),
            None => {
                handle.kill();
                Err(PipelineError::ProcessSupervision(format!(
                    "{} timed out after {:.1}s",
                    spec.label,
                    timeout.as_secs_f32()
                ))
                .into())
            }
        }
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn stdin_mut(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn last_stderr_line(&self) -> Option<String> {
        self.stderr_tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        let status = self.child.try_wait().map_err(|e| {
            PipelineError::ProcessSupervision(format!("{}: wait failed: {}", self.label, e))
        })?;
        if status.is_some() {
            self.exit_status = status;
            self.join_stderr();
        }
        Ok(status)
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }

    /// Wait up to `timeout` for the process to exit.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Stop the process.
    ///
    /// When `graceful` is set, the process is first asked to quit ('q' on
    /// stdin, then SIGINT on unix) and given `force_timeout` to exit before
    /// being killed.
    pub fn stop(&mut self, graceful: bool, force_timeout: Duration) -> Result<StopOutcome> {
        if let Some(status) = self.try_wait()? {
            return Ok(StopOutcome::AlreadyExited(status));
        }

        if graceful {
            let half = force_timeout / 2;
            if let Some(mut stdin) = self.stdin.take() {
                if let Err(e) = stdin.write_all(b"q").and_then(|_| stdin.flush()) {
                    log::debug!("{}: quit request not delivered: {}", self.label, e);
                }
            }
            if let Some(status) = self.wait_timeout(half)? {
                return Ok(StopOutcome::Graceful(status));
            }
            self.interrupt();
            if let Some(status) = self.wait_timeout(force_timeout.saturating_sub(half))? {
                return Ok(StopOutcome::Graceful(status));
            }
            log::warn!(
                "{}: did not exit within {:.1}s, killing",
                self.label,
                force_timeout.as_secs_f32()
            );
        }

        self.kill();
        Ok(StopOutcome::Forced)
    }

    /// Send `signal` to the child's process group.
    #[cfg(unix)]
    fn signal_group(&self, signal: libc::c_int) -> bool {
        let Ok(pid) = libc::pid_t::try_from(self.child.id()) else {
            return false;
        };
        // SAFETY: kill(2) on the group led by a child we spawned with
        // process_group(0) and have not yet reaped.
        let rc = unsafe { libc::kill(-pid, signal) };
        if rc != 0 {
            log::debug!(
                "{}: signal {} to group {} failed: {}",
                self.label,
                signal,
                pid,
                std::io::Error::last_os_error()
            );
        }
        rc == 0
    }

    #[cfg(unix)]
    fn interrupt(&self) {
        self.signal_group(libc::SIGINT);
    }

    #[cfg(not(unix))]
    fn interrupt(&self) {}

    fn kill(&mut self) {
        #[cfg(unix)]
        self.signal_group(libc::SIGKILL);
        if let Err(e) = self.child.kill() {
            log::debug!("{}: kill: {}", self.label, e);
        }
        match self.child.wait() {
            Ok(status) => self.exit_status = Some(status),
            Err(e) => log::warn!("{}: reap after kill failed: {}", self.label, e),
        }
        self.join_stderr();
    }

    /// Join the stderr reader, detaching it if the pipe is still held open
    /// after `STDERR_DRAIN`.
    fn join_stderr(&mut self) {
        let Some(handle) = self.stderr_thread.take() else {
            return;
        };
        let deadline = Instant::now() + STDERR_DRAIN;
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                log::debug!("{}: stderr still open after exit, detaching reader", self.label);
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.exit_status.is_none() && matches!(self.child.try_wait(), Ok(None)) {
            log::debug!("{}: killing on drop", self.label);
            self.kill();
        }
    }
}
