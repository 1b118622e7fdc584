use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::posix;
use crate::process::ExitCode;
use crate::stream::StreamError;

/// An operating-system failure, detached from `io::Error` so it can be cloned and
/// compared.
///
/// Besides the message, carries whatever the OS reported: the raw error code, its
/// symbolic name, the failing system call, and the path involved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemError {
    pub message: String,
    pub kind: io::ErrorKind,
    /// Raw OS error code, if the failure came from the OS.
    pub code: Option<i32>,
    /// Symbolic name of `code`, such as `"ENOENT"`.
    pub errno: Option<&'static str>,
    pub syscall: Option<String>,
    pub path: Option<PathBuf>,
}

impl SystemError {
    pub fn new(kind: io::ErrorKind, message: impl Into<String>) -> SystemError {
        SystemError {
            message: message.into(),
            kind,
            code: None,
            errno: None,
            syscall: None,
            path: None,
        }
    }

    /// Capture `err` as reported by `syscall`.
    pub fn from_io(err: &io::Error, syscall: &str) -> SystemError {
        let code = err.raw_os_error();
        SystemError {
            message: err.to_string(),
            kind: err.kind(),
            code,
            errno: code.and_then(posix::errno_name),
            syscall: Some(syscall.to_owned()),
            path: None,
        }
    }

    pub fn with_path(mut self, path: impl AsRef<Path>) -> SystemError {
        self.path = Some(path.as_ref().to_owned());
        self
    }

    fn has_errno(&self, name: &str) -> bool {
        self.errno == Some(name) || self.message.contains(name)
    }
}

impl fmt::Display for SystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(syscall) = &self.syscall {
            write!(f, "{syscall}")?;
            if let Some(path) = &self.path {
                write!(f, " {}", path.display())?;
            }
            write!(f, ": ")?;
        }
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SystemError {}

/// Why running a command failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// A generic OS failure: spawning, reading or writing a stream, waiting,
    /// signalling, or death by signal.
    #[error("{0}")]
    Io(SystemError),

    /// The program to spawn does not exist.
    #[error("program not found: {0}")]
    ProgramNotFound(SystemError),

    /// The OS refused to execute the program.
    #[error("permission denied: {0}")]
    PermissionDenied(SystemError),

    /// The process ran to completion but did not exit with [`ExitCode::SUCCESS`].
    #[error("command exited with non-zero {0}")]
    NonZeroExitCode(ExitCode),

    /// The requested working directory does not exist.
    #[error("working directory does not exist: {}", .0.display())]
    WorkingDirectoryMissing(PathBuf),
}

impl CommandError {
    /// Classify an error reported while spawning `program`.
    ///
    /// The most specific kind wins: program-not-found, then permission-denied, then
    /// the generic I/O failure.
    pub fn from_spawn_error(err: SystemError) -> CommandError {
        if err.code == Some(posix::ENOENT) || err.has_errno("ENOENT") {
            CommandError::ProgramNotFound(err)
        } else if matches!(err.code, Some(posix::EACCES) | Some(posix::EPERM))
            || err.has_errno("EACCES")
            || err.has_errno("EPERM")
        {
            CommandError::PermissionDenied(err)
        } else {
            CommandError::Io(err)
        }
    }

    pub(crate) fn io(kind: io::ErrorKind, message: impl Into<String>) -> CommandError {
        CommandError::Io(SystemError::new(kind, message))
    }

    /// The underlying OS failure, for the variants that carry one.
    pub fn system_error(&self) -> Option<&SystemError> {
        match self {
            CommandError::Io(e)
            | CommandError::ProgramNotFound(e)
            | CommandError::PermissionDenied(e) => Some(e),
            CommandError::NonZeroExitCode(_) | CommandError::WorkingDirectoryMissing(_) => None,
        }
    }
}

impl From<StreamError> for CommandError {
    fn from(err: StreamError) -> CommandError {
        match err {
            StreamError::Io { op, source } => CommandError::Io(SystemError::from_io(&source, op)),
            StreamError::Cancelled => {
                CommandError::io(io::ErrorKind::Interrupted, "stream read cancelled")
            }
        }
    }
}
