//! Running external commands and pipelines with typed streams and errors.
//!
//! A [`Command`] describes what to run: a program with its arguments, environment
//! overrides, working directory and the routing of its standard streams. Commands are
//! immutable values combined with `|` into pipelines. An [`Executor`] turns a command
//! into running processes and offers convenient ways to consume the result:
//!
//! ```no_run
//! # use procpipe::*;
//! # fn dummy() -> Result<(), CommandError> {
//! // Exit code, failing on anything but success:
//! Command::cmd("umount").arg("/mnt").successful_exit_code()?;
//!
//! // Output as a string:
//! let kernel = command("uname", ["-r"]).string()?;
//!
//! // Output of a pipeline, line by line:
//! let big_files = (command("du", ["-s", "/var/log"]) | command("sort", ["-n"]))
//!     .lines()?;
//! # Ok(())
//! # }
//! ```
//!
//! For finer control, [`Executor::run`] returns a [`Process`] whose stdout and stderr
//! are lazily read [`ByteStream`]s, and whose [`ProcessHandle`] can be polled,
//! signalled and waited on from any thread.
//!
//! Failures are reported as [`CommandError`], classified into program not found,
//! permission denied, missing working directory, non-zero exit code, and other OS
//! errors.
//!
//! The crate is Unix only. It logs through [`tracing`] and never installs a
//! subscriber.

#![cfg(unix)]
#![warn(missing_debug_implementations, rust_2018_idioms)]

mod cancel;
mod command;
pub mod decode;
mod error;
mod executor;
mod posix;
mod process;
mod spawn;
mod stream;

#[cfg(test)]
mod tests;

pub use cancel::Cancellation;
pub use command::{
    Command, InputStream, ProcessInput, ProcessOutput, StandardCommand, command, pipe_to,
};
pub use decode::Encoding;
pub use error::{CommandError, SystemError};
pub use executor::{Executor, ExecutorConfig, Lines, Output};
pub use process::{ExitCode, Process, ProcessHandle};
pub use stream::{ByteSink, ByteStream, DEFAULT_CHUNK_SIZE, StreamError};

/// Signal numbers accepted by [`ProcessHandle::kill_signal`].
pub mod signal {
    pub use libc::{SIGHUP, SIGINT, SIGKILL, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
}
