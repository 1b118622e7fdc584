use std::collections::HashSet;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{CommandError, SystemError};
use crate::posix;
use crate::process::ProcessHandle;

/// What a single standard stream of the child is connected to.
#[derive(Debug, Clone)]
pub(crate) enum Stdio {
    /// Shared with the parent.
    Inherit,
    /// A new pipe; the parent keeps the other end.
    Pipe,
    /// An open file handed over to the child.
    File(Arc<File>),
}

pub(crate) struct SpawnRequest<'a> {
    pub program: &'a OsStr,
    pub args: &'a [OsString],
    pub env: Vec<(OsString, OsString)>,
    pub cwd: Option<&'a Path>,
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
    /// Point the child's stderr at whatever its stdout is (`2>&1`).
    pub merge_stderr: bool,
}

pub(crate) struct SpawnResult {
    pub handle: ProcessHandle,
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

// Which step of the child-side setup failed, reported through the exec-fail pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum ChildStep {
    Chdir = 1,
    Redirect = 2,
    Signals = 3,
    Exec = 4,
}

impl ChildStep {
    fn from_raw(raw: u32) -> ChildStep {
        match raw {
            1 => ChildStep::Chdir,
            2 => ChildStep::Redirect,
            3 => ChildStep::Signals,
            _ => ChildStep::Exec,
        }
    }
}

struct ChildEnds {
    stdin: Option<Arc<File>>,
    stdout: Option<Arc<File>>,
    stderr: Option<Arc<File>>,
}

/// Spawn a child process.
///
/// Sets up the stream redirections, forks, and execs `program` in the child. Exec
/// failures are sent back to the parent through a close-on-exec pipe, so a program
/// that cannot be started is reported here rather than as a mysterious exit code 127.
pub(crate) fn spawn(req: SpawnRequest<'_>) -> Result<SpawnResult, CommandError> {
    let pre_fork = |e: io::Error| {
        CommandError::from_spawn_error(SystemError::from_io(&e, "spawn").with_path(req.program))
    };

    let mut argv = Vec::with_capacity(req.args.len() + 1);
    argv.push(req.program.to_owned());
    argv.extend(req.args.iter().cloned());
    let search_path = req
        .env
        .iter()
        .rev()
        .find(|(k, _)| k == "PATH")
        .map(|(_, v)| v.as_os_str());
    let envp = format_env(&req.env);
    let prepared =
        posix::PreparedExec::new(req.program, &argv, &envp, search_path).map_err(pre_fork)?;
    let cwd = req
        .cwd
        .map(|dir| posix::os_to_cstring(dir.as_os_str()))
        .transpose()
        .map_err(pre_fork)?;

    let (parent_stdin, child_stdin) = prepare_stream(&req.stdin, true).map_err(pre_fork)?;
    let (parent_stdout, child_stdout) = prepare_stream(&req.stdout, false).map_err(pre_fork)?;
    let (parent_stderr, child_stderr) = if req.merge_stderr {
        (None, None)
    } else {
        prepare_stream(&req.stderr, false).map_err(pre_fork)?
    };
    let child_ends = ChildEnds {
        stdin: child_stdin,
        stdout: child_stdout,
        stderr: child_stderr,
    };

    let (mut fail_read, mut fail_write) = posix::pipe().map_err(pre_fork)?;

    let pid = match unsafe { posix::fork() }.map_err(pre_fork)? {
        Some(pid) => pid,
        None => {
            drop(fail_read);
            let (step, err) =
                child_setup_and_exec(&prepared, cwd.as_ref(), &child_ends, req.merge_stderr);
            let code = err.raw_os_error().unwrap_or(0) as u32;
            let mut report = [0u8; 8];
            report[..4].copy_from_slice(&(step as u32).to_le_bytes());
            report[4..].copy_from_slice(&code.to_le_bytes());
            fail_write.write_all(&report).ok();
            posix::_exit(127);
        }
    };

    // Close the parent's copies of the child ends before blocking on the report, so
    // the parent does not keep the child's pipes open.
    drop(child_ends);
    drop(fail_write);

    match read_exact_or_eof::<8>(&mut fail_read) {
        Ok(None) => {}
        Ok(Some(report)) => {
            // The child has exited already; collect it so it does not linger.
            let _ = posix::waitpid(pid, 0);
            let (step, code) = report.split_at(4);
            let step = ChildStep::from_raw(u32::from_le_bytes(step.try_into().unwrap_or_default()));
            let code = i32::from_le_bytes(code.try_into().unwrap_or_default());
            return Err(classify_child_failure(&req, step, io::Error::from_raw_os_error(code)));
        }
        Err(e) => {
            let _ = posix::waitpid(pid, 0);
            return Err(CommandError::Io(SystemError::from_io(&e, "spawn")));
        }
    }

    debug!(
        pid,
        program = %req.program.to_string_lossy(),
        cwd = ?req.cwd,
        "spawned child"
    );
    Ok(SpawnResult {
        handle: ProcessHandle::new(pid),
        stdin: parent_stdin,
        stdout: parent_stdout,
        stderr: parent_stderr,
    })
}

fn classify_child_failure(req: &SpawnRequest<'_>, step: ChildStep, err: io::Error) -> CommandError {
    match step {
        ChildStep::Exec => CommandError::from_spawn_error(
            SystemError::from_io(&err, "spawn").with_path(req.program),
        ),
        ChildStep::Chdir => {
            let dir = req.cwd.unwrap_or(Path::new("."));
            match err.raw_os_error() {
                Some(posix::ENOENT) | Some(posix::ENOTDIR) => {
                    CommandError::WorkingDirectoryMissing(dir.to_owned())
                }
                _ => CommandError::Io(SystemError::from_io(&err, "chdir").with_path(dir)),
            }
        }
        ChildStep::Redirect => CommandError::Io(SystemError::from_io(&err, "dup2")),
        ChildStep::Signals => CommandError::Io(SystemError::from_io(&err, "sigprocmask")),
    }
}

// Runs in the forked child: only async-signal-safe calls from here on, and
// everything it touches was prepared before the fork.
fn child_setup_and_exec(
    prepared: &posix::PreparedExec,
    cwd: Option<&CString>,
    ends: &ChildEnds,
    merge_stderr: bool,
) -> (ChildStep, io::Error) {
    if let Some(dir) = cwd
        && let Err(e) = posix::chdir(dir)
    {
        return (ChildStep::Chdir, e);
    }
    let redirected = move_to_fd(ends.stdin.as_deref(), 0)
        .and_then(|()| move_to_fd(ends.stdout.as_deref(), 1))
        .and_then(|()| {
            if merge_stderr {
                posix::dup2(1, 2)
            } else {
                move_to_fd(ends.stderr.as_deref(), 2)
            }
        });
    if let Err(e) = redirected {
        return (ChildStep::Redirect, e);
    }
    if let Err(e) = posix::reset_sigpipe() {
        return (ChildStep::Signals, e);
    }
    (ChildStep::Exec, prepared.exec())
}

fn move_to_fd(end: Option<&File>, target_fd: i32) -> io::Result<()> {
    match end {
        None => Ok(()),
        Some(f) if f.as_raw_fd() == target_fd => posix::clear_cloexec(target_fd),
        Some(f) => posix::dup2(f.as_raw_fd(), target_fd),
    }
}

/// Translate one `Stdio` into the parent end (for pipes) and the child end.
fn prepare_stream(
    stdio: &Stdio,
    parent_writes: bool,
) -> io::Result<(Option<File>, Option<Arc<File>>)> {
    match stdio {
        Stdio::Inherit => Ok((None, None)),
        Stdio::File(f) => Ok((None, Some(Arc::clone(f)))),
        Stdio::Pipe => {
            let (read, write) = posix::pipe()?;
            Ok(if parent_writes {
                (Some(write), Some(Arc::new(read)))
            } else {
                (Some(read), Some(Arc::new(write)))
            })
        }
    }
}

/// Format `KEY=VALUE` entries, keeping only the last value of a repeated key.
fn format_env(env: &[(OsString, OsString)]) -> Vec<OsString> {
    let mut seen = HashSet::<&OsStr>::new();
    let mut formatted: Vec<_> = env
        .iter()
        .rev()
        .filter(|&(k, _)| seen.insert(k))
        .map(|(k, v)| {
            let mut entry = k.clone();
            entry.push("=");
            entry.push(v);
            entry
        })
        .collect();
    formatted.reverse();
    formatted
}

/// Read exactly N bytes, or return None on immediate EOF. A partial read is an
/// error.
fn read_exact_or_eof<const N: usize>(source: &mut File) -> io::Result<Option<[u8; N]>> {
    let mut buf = [0u8; N];
    let mut total_read = 0;
    while total_read < N {
        let n = match source.read(&mut buf[total_read..]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            break;
        }
        total_read += n;
    }
    match total_read {
        0 => Ok(None),
        n if n == N => Ok(Some(buf)),
        _ => Err(io::ErrorKind::UnexpectedEof.into()),
    }
}
