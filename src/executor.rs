use std::env;
use std::ffi::OsString;
use std::io;
use std::thread;

use tracing::{debug, trace, warn};

use crate::cancel::Cancellation;
use crate::command::{Command, ProcessInput, ProcessOutput, StandardCommand};
use crate::decode::{DecodeUtf8, Encoding, SplitLines, decode_utf8, split_lines};
use crate::error::{CommandError, SystemError};
use crate::process::{ExitCode, Process, ProcessHandle};
use crate::spawn::{self, SpawnRequest, Stdio};
use crate::stream::{ByteSink, ByteStream, DEFAULT_CHUNK_SIZE};

/// Settings shared by every command an [`Executor`] runs.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Environment of spawned processes, before the command's own overrides are
    /// applied. If a variable occurs more than once, the last value wins.
    pub env: Vec<(OsString, OsString)>,
    /// Maximum size of a chunk read from a child's stdout or stderr.
    pub chunk_size: usize,
}

impl ExecutorConfig {
    /// A configuration using a snapshot of the current process environment.
    pub fn from_current_env() -> ExecutorConfig {
        ExecutorConfig::with_env(env::vars_os())
    }

    /// A configuration using exactly the given environment.
    pub fn with_env(
        vars: impl IntoIterator<Item = (impl Into<OsString>, impl Into<OsString>)>,
    ) -> ExecutorConfig {
        ExecutorConfig {
            env: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> ExecutorConfig {
        ExecutorConfig::from_current_env()
    }
}

/// Starts the processes described by a [`Command`].
///
/// The executor carries the parent environment explicitly, so the environment seen
/// by the children does not depend on when the command is run. `Executor::default()`
/// snapshots the environment of the current process.
#[derive(Debug, Clone, Default)]
pub struct Executor {
    config: ExecutorConfig,
}

/// Exit code and complete output of a finished command, returned by
/// [`Executor::output`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub exit_code: ExitCode,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output {
    /// Returns the standard output decoded as UTF-8.
    pub fn stdout_str(&self) -> String {
        Encoding::Utf8.decode(&self.stdout)
    }

    /// Returns the standard error decoded as UTF-8.
    pub fn stderr_str(&self) -> String {
        Encoding::Utf8.decode(&self.stderr)
    }

    pub fn success(&self) -> bool {
        self.exit_code.success()
    }
}

/// The lines of a command's standard output, returned by
/// [`Executor::lines_stream`].
///
/// Lines are produced as the output arrives. Dropping the iterator closes the
/// stream.
#[derive(Debug)]
pub struct Lines {
    inner: SplitLines<DecodeUtf8<ByteStream>>,
}

impl Iterator for Lines {
    type Item = Result<String, CommandError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|line| line.map_err(CommandError::from))
    }
}

impl Executor {
    pub fn new(config: ExecutorConfig) -> Executor {
        Executor { config }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Start the command and return the process of its last stage.
    ///
    /// In a pipeline, the stdout of each stage is fed to the stdin of the next one.
    /// The earlier stages live as long as the stage after it keeps reading their
    /// output, and are reachable through [`Process::upstream`]. Their stderr, if
    /// piped, is discarded. Every working directory is checked before the first
    /// stage is spawned. If the first
    /// stage's input is [`ProcessInput::Pipe`], its writing end is moved to the
    /// returned process.
    ///
    /// Does not wait for the command to finish. A non-zero exit code is not an error
    /// here; see [`successful_exit_code`](Self::successful_exit_code).
    pub fn run(&self, command: &Command) -> Result<Process, CommandError> {
        let mut stages = command.flatten();
        for stage in &stages {
            if let Some(dir) = &stage.working_directory
                && !dir.exists()
            {
                return Err(CommandError::WorkingDirectoryMissing(dir.clone()));
            }
        }
        let Some(mut last) = stages.pop() else {
            unreachable!("flatten() never returns an empty pipeline");
        };
        if stages.is_empty() {
            return self.run_standard(last);
        }
        debug!(stages = stages.len() + 1, pipeline = %command, "starting pipeline");

        let mut head_stdin = None;
        let mut upstream = None;
        let mut handles = Vec::with_capacity(stages.len());
        for mut stage in stages {
            if let Some(output) = upstream.take() {
                stage.stdin = ProcessInput::stream(output);
            }
            stage.stdout = ProcessOutput::Pipe;
            let mut process = match self.run_standard(stage) {
                Ok(process) => process,
                Err(e) => return Err(abandon(&handles, e)),
            };
            handles.push(process.handle().clone());
            if head_stdin.is_none() {
                head_stdin = process.stdin.take();
            }
            discard_in_background(process.pid(), process.take_stderr());
            upstream = Some(process.take_stdout());
        }
        if let Some(output) = upstream {
            last.stdin = ProcessInput::stream(output);
        }
        let mut process = match self.run_standard(last) {
            Ok(process) => process.with_upstream(handles),
            Err(e) => return Err(abandon(&handles, e)),
        };
        process.stdin = head_stdin;
        Ok(process)
    }

    fn run_standard(&self, stage: StandardCommand) -> Result<Process, CommandError> {
        let mut env = self.config.env.clone();
        env.extend(stage.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let result = spawn::spawn(SpawnRequest {
            program: &stage.program,
            args: &stage.args,
            env,
            cwd: stage.working_directory.as_deref(),
            stdin: match stage.stdin {
                ProcessInput::Inherit => Stdio::Inherit,
                _ => Stdio::Pipe,
            },
            stdout: output_stdio(&stage.stdout),
            stderr: output_stdio(&stage.stderr),
            merge_stderr: stage.redirect_error_stream,
        })?;

        let handle = result.handle;
        let pid = handle.pid();
        let chunk_size = self.config.chunk_size;
        let stream = |pipe| ByteStream::from_pipe(pipe, handle.clone(), chunk_size);
        let stdout = result.stdout.map(stream).unwrap_or_default();
        let stderr = result.stderr.map(stream).unwrap_or_default();

        let mut stdin = result.stdin.map(ByteSink::new);
        if let Some(source) = stage.stdin.into_source()
            && let Some(sink) = stdin.take()
        {
            feed_in_background(pid, sink, source)?;
        }
        Ok(Process::new(handle, stdin, stdout, stderr))
    }

    /// Run the command and wait for it to finish.
    ///
    /// The output of the command, if piped, is read and discarded.
    pub fn exit_code(&self, command: &Command) -> Result<ExitCode, CommandError> {
        let process = self.run_detached(command)?;
        process.exit_code()
    }

    /// Like [`exit_code`](Self::exit_code), but stops waiting once `cancel` is
    /// triggered. Every stage is sent `SIGTERM` before the cancellation error is
    /// returned.
    pub fn exit_code_with_cancel(
        &self,
        command: &Command,
        cancel: &Cancellation,
    ) -> Result<ExitCode, CommandError> {
        let process = self.run_detached(command)?;
        process.exit_code_with_cancel(cancel)
    }

    /// Run the command, wait for it to finish, and fail with
    /// [`CommandError::NonZeroExitCode`] unless it exits successfully.
    pub fn successful_exit_code(&self, command: &Command) -> Result<ExitCode, CommandError> {
        let code = self.exit_code(command)?;
        if !code.success() {
            return Err(CommandError::NonZeroExitCode(code));
        }
        Ok(code)
    }

    /// Run the command and return its standard output decoded as UTF-8.
    pub fn string(&self, command: &Command) -> Result<String, CommandError> {
        self.string_with_encoding(command, Encoding::Utf8)
    }

    /// Run the command and return its standard output decoded as `encoding`.
    ///
    /// Returns once stdout reaches end-of-file; the exit code is not checked.
    pub fn string_with_encoding(
        &self,
        command: &Command,
        encoding: Encoding,
    ) -> Result<String, CommandError> {
        let bytes = self.stream(command)?.read_to_end()?;
        Ok(encoding.decode(&bytes))
    }

    /// Run the command and collect the lines of its standard output.
    pub fn lines(&self, command: &Command) -> Result<Vec<String>, CommandError> {
        self.lines_stream(command)?.collect()
    }

    /// Run the command and return an iterator over the lines of its standard
    /// output, decoded as UTF-8.
    pub fn lines_stream(&self, command: &Command) -> Result<Lines, CommandError> {
        let stdout = self.stream(command)?;
        Ok(Lines {
            inner: split_lines(decode_utf8(stdout)),
        })
    }

    /// Run the command and return its standard output as a stream of byte chunks.
    ///
    /// Stderr, if piped, is discarded. The stream is empty if stdout is not piped.
    pub fn stream(&self, command: &Command) -> Result<ByteStream, CommandError> {
        let mut process = self.run(command)?;
        drop(process.stdin.take());
        discard_in_background(process.pid(), process.take_stderr());
        Ok(process.take_stdout())
    }

    /// Run the command, capture stdout and stderr, and wait for it to finish.
    ///
    /// Both streams are read at the same time, stderr on a helper thread and stdout
    /// on the calling one, so a child filling either pipe cannot block the other.
    pub fn output(&self, command: &Command) -> Result<Output, CommandError> {
        let mut process = self.run(command)?;
        drop(process.stdin.take());
        let stderr = process.take_stderr();
        let stderr_reader = thread::Builder::new()
            .name(format!("procpipe-stderr-{}", process.pid()))
            .spawn(move || stderr.read_to_end())
            .map_err(|e| CommandError::Io(SystemError::from_io(&e, "thread spawn")))?;
        let stdout = process.take_stdout().read_to_end();
        let stderr = stderr_reader
            .join()
            .map_err(|_| CommandError::io(io::ErrorKind::Other, "stderr reader panicked"))?;
        Ok(Output {
            stdout: stdout?,
            stderr: stderr?,
            exit_code: process.exit_code()?,
        })
    }

    // Run the command for its exit code only, draining whatever it writes.
    fn run_detached(&self, command: &Command) -> Result<Process, CommandError> {
        let mut process = self.run(command)?;
        drop(process.stdin.take());
        let pid = process.pid();
        discard_in_background(pid, process.take_stdout());
        discard_in_background(pid, process.take_stderr());
        Ok(process)
    }
}

// A later stage failed to start; stop the ones already running.
fn abandon(started: &[ProcessHandle], error: CommandError) -> CommandError {
    debug!(started = started.len(), error = %error, "pipeline start failed");
    started.iter().for_each(ProcessHandle::terminate);
    error
}

fn output_stdio(output: &ProcessOutput) -> Stdio {
    match output {
        ProcessOutput::Pipe => Stdio::Pipe,
        ProcessOutput::Inherit => Stdio::Inherit,
        ProcessOutput::Redirect(file) => Stdio::File(file.clone()),
    }
}

// Copy `source` into the child's stdin on a detached thread. Failures are only
// logged: a child that stops reading its input is not an error of the caller.
fn feed_in_background(pid: u32, sink: ByteSink, source: ByteStream) -> Result<(), CommandError> {
    thread::Builder::new()
        .name(format!("procpipe-stdin-{pid}"))
        .spawn(move || match sink.drain(source) {
            Ok(written) => trace!(pid, written, "stdin fed"),
            Err(e) => debug!(pid, error = %e, "feeding stdin failed"),
        })
        .map(|_| ())
        .map_err(|e| CommandError::Io(SystemError::from_io(&e, "thread spawn")))
}

// Read `stream` to the end on a detached thread so the child never blocks on a full
// pipe nobody reads.
fn discard_in_background(pid: u32, stream: ByteStream) {
    if stream.is_exhausted() {
        return;
    }
    let reader = thread::Builder::new()
        .name(format!("procpipe-drain-{pid}"))
        .spawn(move || {
            let discarded = stream.read_to_end().map(|data| data.len());
            trace!(pid, ?discarded, "drained unread output");
        });
    if let Err(e) = reader {
        warn!(pid, error = %e, "cannot start drain thread");
    }
}

/// Shorthands running the command with `Executor::default()`.
impl Command {
    /// See [`Executor::run`].
    pub fn run(&self) -> Result<Process, CommandError> {
        Executor::default().run(self)
    }

    /// See [`Executor::exit_code`].
    pub fn exit_code(&self) -> Result<ExitCode, CommandError> {
        Executor::default().exit_code(self)
    }

    /// See [`Executor::exit_code_with_cancel`].
    pub fn exit_code_with_cancel(&self, cancel: &Cancellation) -> Result<ExitCode, CommandError> {
        Executor::default().exit_code_with_cancel(self, cancel)
    }

    /// See [`Executor::successful_exit_code`].
    pub fn successful_exit_code(&self) -> Result<ExitCode, CommandError> {
        Executor::default().successful_exit_code(self)
    }

    /// See [`Executor::string`].
    pub fn string(&self) -> Result<String, CommandError> {
        Executor::default().string(self)
    }

    /// See [`Executor::string_with_encoding`].
    pub fn string_with_encoding(&self, encoding: Encoding) -> Result<String, CommandError> {
        Executor::default().string_with_encoding(self, encoding)
    }

    /// See [`Executor::lines`].
    pub fn lines(&self) -> Result<Vec<String>, CommandError> {
        Executor::default().lines(self)
    }

    /// See [`Executor::lines_stream`].
    pub fn lines_stream(&self) -> Result<Lines, CommandError> {
        Executor::default().lines_stream(self)
    }

    /// See [`Executor::stream`].
    pub fn stream(&self) -> Result<ByteStream, CommandError> {
        Executor::default().stream(self)
    }

    /// See [`Executor::output`].
    pub fn output(&self) -> Result<Output, CommandError> {
        Executor::default().output(self)
    }
}

