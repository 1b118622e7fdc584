use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::Cursor;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::decode::Encoding;
use crate::stream::ByteStream;

/// Where the standard input of a child comes from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProcessInput {
    /// Share the parent's stdin.
    #[default]
    Inherit,

    /// Connect stdin to a pipe whose writing end is left in
    /// [`Process::stdin`](crate::Process::stdin) for the caller.
    Pipe,

    /// Feed these bytes to the child, then close its stdin.
    Bytes(Arc<[u8]>),

    /// Feed everything read from a stream to the child, then close its stdin.
    Stream(InputStream),
}

impl ProcessInput {
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> ProcessInput {
        let bytes: Vec<u8> = bytes.into();
        ProcessInput::Bytes(bytes.into())
    }

    pub fn stream(stream: ByteStream) -> ProcessInput {
        ProcessInput::Stream(InputStream::new(stream))
    }

    /// Feed `text` encoded as `encoding`.
    pub fn text(text: impl AsRef<str>, encoding: Encoding) -> ProcessInput {
        ProcessInput::Bytes(encoding.encode(text.as_ref()).into())
    }

    pub(crate) fn into_source(self) -> Option<ByteStream> {
        match self {
            ProcessInput::Inherit | ProcessInput::Pipe => None,
            ProcessInput::Bytes(bytes) => Some(ByteStream::from_reader(Cursor::new(bytes))),
            ProcessInput::Stream(stream) => Some(stream.take()),
        }
    }
}

impl From<&str> for ProcessInput {
    fn from(text: &str) -> ProcessInput {
        ProcessInput::bytes(text)
    }
}

impl From<String> for ProcessInput {
    fn from(text: String) -> ProcessInput {
        ProcessInput::bytes(text)
    }
}

impl From<&[u8]> for ProcessInput {
    fn from(bytes: &[u8]) -> ProcessInput {
        ProcessInput::bytes(bytes)
    }
}

impl<const N: usize> From<&[u8; N]> for ProcessInput {
    fn from(bytes: &[u8; N]) -> ProcessInput {
        ProcessInput::bytes(&bytes[..])
    }
}

impl From<Vec<u8>> for ProcessInput {
    fn from(bytes: Vec<u8>) -> ProcessInput {
        ProcessInput::bytes(bytes)
    }
}

impl From<ByteStream> for ProcessInput {
    fn from(stream: ByteStream) -> ProcessInput {
        ProcessInput::stream(stream)
    }
}

impl From<File> for ProcessInput {
    fn from(file: File) -> ProcessInput {
        ProcessInput::stream(ByteStream::from_reader(file))
    }
}

/// A byte stream used as the input of a command.
///
/// A stream can only be consumed once. The first run of the command takes it; the
/// command and its clones then feed an empty input to any later run.
#[derive(Clone)]
pub struct InputStream(Arc<Mutex<Option<ByteStream>>>);

impl InputStream {
    fn new(stream: ByteStream) -> InputStream {
        InputStream(Arc::new(Mutex::new(Some(stream))))
    }

    /// True until a run of the command has taken the stream.
    pub fn is_available(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn take(&self) -> ByteStream {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default()
    }
}

impl PartialEq for InputStream {
    fn eq(&self, other: &InputStream) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for InputStream {}

impl fmt::Debug for InputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("available", &self.is_available())
            .finish()
    }
}

/// Where the standard output or standard error of a child goes.
#[derive(Debug, Clone, Default)]
pub enum ProcessOutput {
    /// Capture the stream; it is available as a [`ByteStream`] on the
    /// [`Process`](crate::Process).
    #[default]
    Pipe,

    /// Share the parent's stream.
    Inherit,

    /// Write directly to an open file, without involving the parent.
    Redirect(Arc<File>),
}

impl ProcessOutput {
    pub fn redirect(file: File) -> ProcessOutput {
        ProcessOutput::Redirect(Arc::new(file))
    }
}

impl PartialEq for ProcessOutput {
    fn eq(&self, other: &ProcessOutput) -> bool {
        match (self, other) {
            (ProcessOutput::Pipe, ProcessOutput::Pipe) => true,
            (ProcessOutput::Inherit, ProcessOutput::Inherit) => true,
            (ProcessOutput::Redirect(a), ProcessOutput::Redirect(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl Eq for ProcessOutput {}

impl From<File> for ProcessOutput {
    fn from(file: File) -> ProcessOutput {
        ProcessOutput::redirect(file)
    }
}

/// A single program invocation: one stage of a pipeline.
///
/// Obtained from [`Command::flatten`]; build commands through [`Command`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardCommand {
    pub(crate) program: OsString,
    pub(crate) args: Vec<OsString>,
    pub(crate) env: BTreeMap<OsString, OsString>,
    pub(crate) working_directory: Option<PathBuf>,
    pub(crate) stdin: ProcessInput,
    pub(crate) stdout: ProcessOutput,
    pub(crate) stderr: ProcessOutput,
    pub(crate) redirect_error_stream: bool,
}

impl StandardCommand {
    fn new(program: &OsStr) -> StandardCommand {
        StandardCommand {
            program: program.to_owned(),
            args: vec![],
            env: BTreeMap::new(),
            working_directory: None,
            stdin: ProcessInput::Inherit,
            stdout: ProcessOutput::Pipe,
            stderr: ProcessOutput::Pipe,
            redirect_error_stream: false,
        }
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Environment overrides, applied on top of the executor's environment.
    pub fn env(&self) -> &BTreeMap<OsString, OsString> {
        &self.env
    }

    pub fn working_directory(&self) -> Option<&Path> {
        self.working_directory.as_deref()
    }

    pub fn stdin(&self) -> &ProcessInput {
        &self.stdin
    }

    pub fn stdout(&self) -> &ProcessOutput {
        &self.stdout
    }

    pub fn stderr(&self) -> &ProcessOutput {
        &self.stderr
    }

    /// True if stderr is merged into stdout (`2>&1`).
    pub fn redirect_error_stream(&self) -> bool {
        self.redirect_error_stream
    }

    fn display_escape(s: &OsStr) -> Cow<'_, str> {
        fn nice_char(c: char) -> bool {
            matches!(c, '-' | '_' | '.' | ',' | '/' | '=' | ':' | '+') || c.is_ascii_alphanumeric()
        }
        let s = s.to_string_lossy();
        if s.is_empty() || !s.chars().all(nice_char) {
            Cow::Owned(format!("'{}'", s.replace('\'', r#"'\''"#)))
        } else {
            s
        }
    }
}

impl fmt::Display for StandardCommand {
    /// Render the command line quoted in the Unix style, preceded by the
    /// environment overrides.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.env {
            write!(
                f,
                "{}={} ",
                k.to_string_lossy(),
                StandardCommand::display_escape(v)
            )?;
        }
        write!(f, "{}", StandardCommand::display_escape(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", StandardCommand::display_escape(arg))?;
        }
        Ok(())
    }
}

/// A description of what to run: a single program, or a pipeline of programs.
///
/// Commands are immutable values. Every combinator consumes the command and returns
/// a new one, and running a command does not change it, so the same command can be
/// run any number of times, each run starting new processes.
///
/// # Examples
///
/// ```no_run
/// # use procpipe::*;
/// # fn dummy() -> Result<(), CommandError> {
/// let sorted = (command("sort", ["-r"]) | Command::cmd("head").arg("-3"))
///     .feed("a\nb\nc\nd\n")
///     .lines()?;
/// assert_eq!(sorted, ["d", "c", "b"]);
/// # Ok(())
/// # }
/// ```
///
/// In a pipeline, the input combinators ([`stdin`](Self::stdin), [`feed`](Self::feed))
/// configure the first stage and the output combinators ([`stdout`](Self::stdout),
/// [`stderr`](Self::stderr), [`redirect_error_stream`](Self::redirect_error_stream))
/// the last one. [`env`](Self::env) and [`working_directory`](Self::working_directory)
/// apply to every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Standard(StandardCommand),
    /// `left | right`.
    Piped(Box<Command>, Box<Command>),
}

/// Create a command running `program` with `args`.
///
/// The program is looked up in the `PATH` of the environment it is run with, unless
/// it contains a slash.
pub fn command(
    program: impl AsRef<OsStr>,
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Command {
    Command::cmd(program).args(args)
}

/// Pipe the output of `left` into the input of `right`.
pub fn pipe_to(left: Command, right: Command) -> Command {
    Command::Piped(Box::new(left), Box::new(right))
}

impl Command {
    /// Create a command running `program` without arguments.
    ///
    /// The new command inherits stdin, pipes stdout and stderr, has no environment
    /// overrides and runs in the current directory.
    pub fn cmd(program: impl AsRef<OsStr>) -> Command {
        Command::Standard(StandardCommand::new(program.as_ref()))
    }

    /// Appends `arg` to the argument list of the last stage.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Command {
        self.last_mut().args.push(arg.as_ref().to_owned());
        self
    }

    /// Extends the argument list of the last stage with `args`.
    pub fn args(mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Command {
        self.last_mut()
            .args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Pipe the output of `self` into the input of `right`.
    pub fn pipe_to(self, right: Command) -> Command {
        pipe_to(self, right)
    }

    /// Sets an environment variable in every stage.
    ///
    /// Variables not overridden are taken from the [`Executor`](crate::Executor)'s
    /// environment.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Command {
        let (key, value) = (key.as_ref(), value.as_ref());
        self.for_each_stage(&mut |stage| {
            stage.env.insert(key.to_owned(), value.to_owned());
        });
        self
    }

    /// Sets multiple environment variables in every stage. If a variable is given
    /// more than once, the last value wins.
    pub fn envs(
        self,
        vars: impl IntoIterator<Item = (impl AsRef<OsStr>, impl AsRef<OsStr>)>,
    ) -> Command {
        vars.into_iter().fold(self, |cmd, (k, v)| cmd.env(k, v))
    }

    /// Sets the working directory of every stage.
    ///
    /// The directory is checked before anything is spawned; running the command fails
    /// with [`WorkingDirectoryMissing`](crate::CommandError::WorkingDirectoryMissing)
    /// if it does not exist.
    pub fn working_directory(mut self, dir: impl AsRef<Path>) -> Command {
        let dir = dir.as_ref();
        self.for_each_stage(&mut |stage| stage.working_directory = Some(dir.to_owned()));
        self
    }

    /// Sets the standard input of the first stage.
    ///
    /// Accepts a [`ProcessInput`], or anything convertible into one: a string or byte
    /// buffer to feed, a [`ByteStream`], or an open `File` to read from.
    pub fn stdin(mut self, input: impl Into<ProcessInput>) -> Command {
        self.first_mut().stdin = input.into();
        self
    }

    /// Sets the standard output of the last stage.
    pub fn stdout(mut self, output: impl Into<ProcessOutput>) -> Command {
        self.last_mut().stdout = output.into();
        self
    }

    /// Sets the standard error of the last stage.
    pub fn stderr(mut self, output: impl Into<ProcessOutput>) -> Command {
        self.last_mut().stderr = output.into();
        self
    }

    /// Merge the standard error of the last stage into its standard output (`2>&1`).
    pub fn redirect_error_stream(mut self, merge: bool) -> Command {
        self.last_mut().redirect_error_stream = merge;
        self
    }

    /// Feed `text` as UTF-8 to the standard input of the first stage.
    pub fn feed(self, text: impl AsRef<str>) -> Command {
        self.stdin(ProcessInput::text(text, Encoding::Utf8))
    }

    /// Inherit all three standard streams from the parent.
    pub fn inherit_io(self) -> Command {
        self.stdin(ProcessInput::Inherit)
            .stdout(ProcessOutput::Inherit)
            .stderr(ProcessOutput::Inherit)
    }

    /// The stages of the command in left-to-right order.
    ///
    /// Never empty. The result does not depend on how the pipeline was grouped:
    /// `(a | b) | c` and `a | (b | c)` both flatten to `[a, b, c]`.
    pub fn flatten(&self) -> Vec<StandardCommand> {
        let mut stages = vec![];
        self.collect_stages(&mut stages);
        stages
    }

    fn collect_stages(&self, out: &mut Vec<StandardCommand>) {
        match self {
            Command::Standard(cmd) => out.push(cmd.clone()),
            Command::Piped(left, right) => {
                left.collect_stages(out);
                right.collect_stages(out);
            }
        }
    }

    fn for_each_stage(&mut self, f: &mut impl FnMut(&mut StandardCommand)) {
        match self {
            Command::Standard(cmd) => f(cmd),
            Command::Piped(left, right) => {
                left.for_each_stage(f);
                right.for_each_stage(f);
            }
        }
    }

    fn first_mut(&mut self) -> &mut StandardCommand {
        match self {
            Command::Standard(cmd) => cmd,
            Command::Piped(left, _) => left.first_mut(),
        }
    }

    fn last_mut(&mut self) -> &mut StandardCommand {
        match self {
            Command::Standard(cmd) => cmd,
            Command::Piped(_, right) => right.last_mut(),
        }
    }
}

impl From<StandardCommand> for Command {
    fn from(cmd: StandardCommand) -> Command {
        Command::Standard(cmd)
    }
}

impl BitOr for Command {
    type Output = Command;

    /// Same as [`pipe_to`].
    fn bitor(self, rhs: Command) -> Command {
        pipe_to(self, rhs)
    }
}

impl fmt::Display for Command {
    /// Show the command as a Unix shell command line, with pipeline stages separated
    /// by `|`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Standard(cmd) => write!(f, "{cmd}"),
            Command::Piped(left, right) => write!(f, "{left} | {right}"),
        }
    }
}
