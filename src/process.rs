use std::fmt;
use std::io;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cancel::Cancellation;
use crate::error::{CommandError, SystemError};
use crate::posix;
use crate::stream::{ByteSink, ByteStream};

/// Exit code of a process that terminated normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExitCode(pub u32);

impl ExitCode {
    pub const SUCCESS: ExitCode = ExitCode(0);
    pub const FAILURE: ExitCode = ExitCode(1);

    pub fn code(self) -> u32 {
        self.0
    }

    /// True if this is [`ExitCode::SUCCESS`].
    pub fn success(self) -> bool {
        self == ExitCode::SUCCESS
    }
}

impl From<u32> for ExitCode {
    fn from(code: u32) -> ExitCode {
        ExitCode(code)
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit code {}", self.0)
    }
}

// Upper bound on the sleep between two polls of a running child.
const MAX_POLL_DELAY: Duration = Duration::from_millis(50);

/// A handle to a running or finished child process.
///
/// All methods take `&self`, and the handle is cheaply cloneable: clones share the
/// same underlying state, so an exit observed through one clone is visible to all.
/// Waiting never holds the internal lock while sleeping, which makes `exit_code`,
/// `kill` and `is_alive` safe to call concurrently from different threads.
///
/// When the last clone is dropped while the child is still running, the child is
/// reaped on a background thread, so dropping never blocks and leaves no zombie.
#[derive(Clone)]
pub struct ProcessHandle(Arc<InnerProcess>);

struct InnerProcess {
    pid: u32,
    state: Mutex<ProcessState>,
    kill_requested: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProcessState {
    Running,
    Exited(ExitCode),
    // Terminated by the signal with this number.
    Killed(i32),
    // Someone else reaped the child; its status is lost.
    Vanished,
}

enum WaitOutcome {
    Finished(ProcessState),
    TimedOut,
    Cancelled,
}

impl ProcessHandle {
    pub(crate) fn new(pid: u32) -> ProcessHandle {
        ProcessHandle(Arc::new(InnerProcess {
            pid,
            state: Mutex::new(ProcessState::Running),
            kill_requested: AtomicBool::new(false),
        }))
    }

    /// Returns the PID of the child.
    pub fn pid(&self) -> u32 {
        self.0.pid
    }

    /// Point-in-time liveness check; does not block.
    ///
    /// False once the child has exited or was terminated by a signal, and also as
    /// soon as a kill has been requested through this handle.
    pub fn is_alive(&self) -> bool {
        if self.0.kill_requested.load(Ordering::SeqCst) {
            return false;
        }
        let mut state = self.0.lock();
        // A failed poll leaves the state untouched; report what we knew.
        let _ = self.0.reap(&mut state);
        *state == ProcessState::Running
    }

    /// Wait for the child to exit and return its exit code.
    ///
    /// A child terminated by a signal has no exit code; that is reported as
    /// [`CommandError::Io`] naming the signal.
    pub fn exit_code(&self) -> Result<ExitCode, CommandError> {
        match self.0.wait(None, None)? {
            WaitOutcome::Finished(state) => self.0.result_of(state),
            WaitOutcome::TimedOut | WaitOutcome::Cancelled => unreachable!(),
        }
    }

    /// Like [`exit_code`](Self::exit_code), but gives up when `cancel` is triggered.
    ///
    /// On cancellation the child is sent `SIGTERM` before the error is returned, so
    /// abandoning the wait does not leave an orphan behind. The error has kind
    /// `io::ErrorKind::Interrupted`.
    pub fn exit_code_with_cancel(&self, cancel: &Cancellation) -> Result<ExitCode, CommandError> {
        match self.0.wait(None, Some(cancel))? {
            WaitOutcome::Finished(state) => self.0.result_of(state),
            WaitOutcome::Cancelled => {
                debug!(pid = self.0.pid, "exit code wait cancelled, terminating child");
                self.terminate();
                Err(CommandError::io(
                    io::ErrorKind::Interrupted,
                    format!("wait for process {} was cancelled", self.0.pid),
                ))
            }
            WaitOutcome::TimedOut => unreachable!(),
        }
    }

    /// Like [`exit_code`](Self::exit_code), but returns `Ok(None)` if the child does
    /// not finish within `timeout`.
    pub fn exit_code_timeout(&self, timeout: Duration) -> Result<Option<ExitCode>, CommandError> {
        let deadline = Instant::now() + timeout;
        match self.0.wait(Some(deadline), None)? {
            WaitOutcome::Finished(state) => self.0.result_of(state).map(Some),
            WaitOutcome::TimedOut => Ok(None),
            WaitOutcome::Cancelled => unreachable!(),
        }
    }

    /// Send `SIGTERM` and block until the child is gone.
    pub fn kill(&self) -> Result<(), CommandError> {
        self.kill_signal(posix::SIGTERM)
    }

    /// Send `SIGKILL` and block until the child is gone.
    pub fn kill_forcibly(&self) -> Result<(), CommandError> {
        self.kill_signal(posix::SIGKILL)
    }

    /// Send `signal` and block until the child is gone.
    ///
    /// If the child has already finished, nothing is sent. A child that ignores the
    /// signal keeps the caller blocked.
    pub fn kill_signal(&self, signal: i32) -> Result<(), CommandError> {
        debug!(pid = self.0.pid, signal = %posix::signal_name(signal), "killing child");
        self.0.send_signal(signal)?;
        self.0.kill_requested.store(true, Ordering::SeqCst);
        self.0.wait(None, None)?;
        Ok(())
    }

    // Send SIGTERM without waiting; failures are only logged.
    pub(crate) fn terminate(&self) {
        if let Err(e) = self.0.send_signal(posix::SIGTERM) {
            warn!(pid = self.0.pid, error = %e, "failed to terminate child");
        }
    }
}

impl InnerProcess {
    fn lock(&self) -> MutexGuard<'_, ProcessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Poll the child without holding the lock between polls, so that signals can be
    // delivered concurrently.
    fn wait(
        &self,
        deadline: Option<Instant>,
        cancel: Option<&Cancellation>,
    ) -> Result<WaitOutcome, CommandError> {
        let mut delay = Duration::from_millis(1);
        loop {
            {
                let mut state = self.lock();
                self.reap(&mut state)?;
                if *state != ProcessState::Running {
                    return Ok(WaitOutcome::Finished(*state));
                }
            }
            if cancel.is_some_and(Cancellation::is_cancelled) {
                return Ok(WaitOutcome::Cancelled);
            }
            let mut sleep = delay;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(WaitOutcome::TimedOut);
                }
                sleep = sleep.min(deadline - now);
            }
            thread::sleep(sleep);
            delay = (delay * 2).min(MAX_POLL_DELAY);
        }
    }

    // Non-blocking waitpid; records the outcome in `state` if the child has finished.
    fn reap(&self, state: &mut ProcessState) -> Result<(), CommandError> {
        if *state != ProcessState::Running {
            return Ok(());
        }
        match posix::waitpid(self.pid, posix::WNOHANG) {
            Ok((pid_out, status)) if pid_out == self.pid => {
                *state = match (posix::exited_code(status), posix::termination_signal(status)) {
                    (Some(code), _) => ProcessState::Exited(ExitCode(code)),
                    (None, Some(signal)) => ProcessState::Killed(signal),
                    // Stopped or continued; we did not ask for those.
                    (None, None) => return Ok(()),
                };
                debug!(pid = self.pid, state = ?*state, "child finished");
            }
            Ok(_) => {}
            Err(e) if e.raw_os_error() == Some(posix::ECHILD) => {
                *state = ProcessState::Vanished;
            }
            Err(e) => return Err(CommandError::Io(SystemError::from_io(&e, "waitpid"))),
        }
        Ok(())
    }

    fn send_signal(&self, signal: i32) -> Result<(), CommandError> {
        // Checking the state under the lock guarantees the PID has not been reaped and
        // possibly reused.
        let state = self.lock();
        match *state {
            ProcessState::Running => posix::kill(self.pid, signal)
                .map_err(|e| CommandError::Io(SystemError::from_io(&e, "kill"))),
            _ => Ok(()),
        }
    }

    fn result_of(&self, state: ProcessState) -> Result<ExitCode, CommandError> {
        match state {
            ProcessState::Exited(code) => Ok(code),
            ProcessState::Killed(signal) => Err(CommandError::Io(SystemError {
                syscall: Some("waitpid".to_owned()),
                ..SystemError::new(
                    io::ErrorKind::Other,
                    format!(
                        "process {} was killed by {}",
                        self.pid,
                        posix::signal_name(signal)
                    ),
                )
            })),
            ProcessState::Vanished => Err(CommandError::io(
                io::ErrorKind::Other,
                format!("exit status of process {} is unavailable", self.pid),
            )),
            ProcessState::Running => unreachable!(),
        }
    }
}

impl Drop for InnerProcess {
    fn drop(&mut self) {
        let mut state = *self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if self.reap(&mut state).is_err() || state != ProcessState::Running {
            return;
        }
        let pid = self.pid;
        let reaper = thread::Builder::new()
            .name(format!("procpipe-reap-{pid}"))
            .spawn(move || {
                let _ = posix::waitpid(pid, 0);
            });
        if let Err(e) = reaper {
            warn!(pid, error = %e, "cannot start reaper thread; child may linger as a zombie");
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.lock();
        f.debug_struct("ProcessHandle")
            .field("pid", &self.0.pid)
            .field("state", &*state)
            .finish()
    }
}

/// A started child process together with its standard streams.
///
/// Created by [`Executor::run`](crate::Executor::run). The stream fields are public
/// so they can be moved out independently; the handle methods are available
/// directly on `Process` and through [`handle`](Self::handle).
///
/// If stdout or stderr were not redirected to a pipe, the corresponding stream is
/// empty, as is stderr when it is merged into stdout. `stdin` is present only when
/// the command's input is [`ProcessInput::Pipe`](crate::ProcessInput::Pipe).
///
/// Reading neither stream of a child that produces a lot of output while waiting
/// for its exit code deadlocks once the pipe buffer is full. The convenience
/// operations on [`Executor`](crate::Executor) drain unread streams for you.
#[derive(Debug)]
#[non_exhaustive]
pub struct Process {
    // Streams are declared before the handle so that they are dropped first.
    /// Writing end of the child's stdin.
    pub stdin: Option<ByteSink>,
    /// The child's stdout.
    pub stdout: ByteStream,
    /// The child's stderr.
    pub stderr: ByteStream,
    handle: ProcessHandle,
    upstream: Vec<ProcessHandle>,
}

impl Process {
    pub(crate) fn new(
        handle: ProcessHandle,
        stdin: Option<ByteSink>,
        stdout: ByteStream,
        stderr: ByteStream,
    ) -> Process {
        Process {
            stdin,
            stdout,
            stderr,
            handle,
            upstream: Vec::new(),
        }
    }

    pub(crate) fn with_upstream(mut self, upstream: Vec<ProcessHandle>) -> Process {
        self.upstream = upstream;
        self
    }

    /// A cloneable handle to the child, independent of the streams.
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    /// Handles of the earlier stages of a pipeline, first stage first. Empty for a
    /// single command.
    pub fn upstream(&self) -> &[ProcessHandle] {
        &self.upstream
    }

    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    /// Move stdout out, leaving an empty stream in its place.
    pub fn take_stdout(&mut self) -> ByteStream {
        mem::take(&mut self.stdout)
    }

    /// Move stderr out, leaving an empty stream in its place.
    pub fn take_stderr(&mut self) -> ByteStream {
        mem::take(&mut self.stderr)
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    pub fn exit_code(&self) -> Result<ExitCode, CommandError> {
        self.handle.exit_code()
    }

    /// Like [`ProcessHandle::exit_code_with_cancel`]. On cancellation every
    /// earlier pipeline stage is sent `SIGTERM` as well.
    pub fn exit_code_with_cancel(&self, cancel: &Cancellation) -> Result<ExitCode, CommandError> {
        let result = self.handle.exit_code_with_cancel(cancel);
        if result.is_err() && cancel.is_cancelled() {
            for stage in &self.upstream {
                stage.terminate();
            }
        }
        result
    }

    pub fn exit_code_timeout(&self, timeout: Duration) -> Result<Option<ExitCode>, CommandError> {
        self.handle.exit_code_timeout(timeout)
    }

    pub fn kill(&self) -> Result<(), CommandError> {
        self.handle.kill()
    }

    pub fn kill_forcibly(&self) -> Result<(), CommandError> {
        self.handle.kill_forcibly()
    }

    pub fn kill_signal(&self, signal: i32) -> Result<(), CommandError> {
        self.handle.kill_signal(signal)
    }
}
