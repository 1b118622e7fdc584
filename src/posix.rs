use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io::{Error, Result};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::path::Path;
use std::ptr;

pub use libc::{EACCES, ECHILD, ENOENT, ENOTDIR, EPERM, SIGKILL, SIGTERM};

fn check_err<T: Ord + Default>(num: T) -> Result<T> {
    if num < T::default() {
        return Err(Error::last_os_error());
    }
    Ok(num)
}

/// Create a pipe whose both ends are close-on-exec.
///
/// The child ends are moved onto fds 0-2 with `dup2()`, which clears the flag on the
/// target, so no other fd leaks into the child.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    check_err(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    let pair = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    set_cloexec(&pair.0)?;
    set_cloexec(&pair.1)?;
    Ok(pair)
}

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn set_cloexec(f: &File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = f.as_raw_fd();
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    check_err(unsafe { libc::fcntl(fd, libc::F_SETFD, old | libc::FD_CLOEXEC) })?;
    Ok(())
}

/// Returns `Some(pid)` in the parent and `None` in the child.
///
/// # Safety
///
/// The child of a multi-threaded process may only call async-signal-safe functions
/// until it execs or exits.
pub unsafe fn fork() -> Result<Option<u32>> {
    let pid = check_err(unsafe { libc::fork() })?;
    Ok(if pid == 0 { None } else { Some(pid as u32) })
}

pub fn os_to_cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|_| Error::from_raw_os_error(libc::EINVAL))
}

/// A null-terminated vector of C strings, built before `fork()` so the child does
/// not allocate.
#[derive(Debug)]
pub struct CVec {
    // Pointed to by `ptrs`; never read directly.
    #[allow(dead_code)]
    strings: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

// The pointers only refer to the heap buffers owned by `strings`.
unsafe impl Send for CVec {}

impl CVec {
    pub fn new<S: AsRef<OsStr>>(items: &[S]) -> Result<CVec> {
        let strings = items
            .iter()
            .map(|s| os_to_cstring(s.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        let ptrs = strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        Ok(CVec { strings, ptrs })
    }

    pub fn as_c_vec(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

// Same fallback search path as glibc's execvp.
const DEFAULT_PATH: &str = "/bin:/usr/bin";

/// Everything `execve()` needs, prepared in the parent.
///
/// `execvpe` is not POSIX, so the `PATH` search is emulated by trying each candidate
/// in turn, resolved against the child's own environment.
#[derive(Debug)]
pub struct PreparedExec {
    candidates: Vec<CString>,
    argv: CVec,
    envp: CVec,
}

impl PreparedExec {
    pub fn new<S: AsRef<OsStr>>(
        program: &OsStr,
        argv: &[S],
        env: &[S],
        search_path: Option<&OsStr>,
    ) -> Result<PreparedExec> {
        let argv = CVec::new(argv)?;
        let envp = CVec::new(env)?;
        let candidates = if program.as_bytes().contains(&b'/') {
            vec![os_to_cstring(program)?]
        } else {
            std::env::split_paths(search_path.unwrap_or(OsStr::new(DEFAULT_PATH)))
                .map(|dir| {
                    let dir = if dir.as_os_str().is_empty() {
                        Path::new(".").to_path_buf()
                    } else {
                        dir
                    };
                    os_to_cstring(dir.join(program).as_os_str())
                })
                .collect::<Result<Vec<_>>>()?
        };
        Ok(PreparedExec {
            candidates,
            argv,
            envp,
        })
    }

    /// Replace the current process image. Only returns on failure.
    ///
    /// Like `execvp`, a permission error on some candidate is remembered and reported
    /// if no later candidate succeeds; otherwise the last error wins.
    pub fn exec(&self) -> Error {
        let mut saw_eacces = false;
        let mut last = libc::ENOENT;
        for candidate in &self.candidates {
            unsafe {
                libc::execve(candidate.as_ptr(), self.argv.as_c_vec(), self.envp.as_c_vec());
            }
            last = errno();
            if last == libc::EACCES {
                saw_eacces = true;
            }
        }
        if saw_eacces {
            Error::from_raw_os_error(libc::EACCES)
        } else {
            Error::from_raw_os_error(last)
        }
    }
}

fn errno() -> i32 {
    Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

pub fn chdir(dir: &CString) -> Result<()> {
    check_err(unsafe { libc::chdir(dir.as_ptr()) })?;
    Ok(())
}

pub fn dup2(oldfd: i32, newfd: i32) -> Result<()> {
    check_err(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

/// Clear close-on-exec on an fd that is already in its final place.
pub fn clear_cloexec(fd: i32) -> Result<()> {
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    check_err(unsafe { libc::fcntl(fd, libc::F_SETFD, old & !libc::FD_CLOEXEC) })?;
    Ok(())
}

pub fn _exit(status: u8) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

pub const WNOHANG: i32 = libc::WNOHANG;

/// Raw wait status as reported by `waitpid()`.
pub type RawStatus = i32;

pub fn waitpid(pid: u32, flags: i32) -> Result<(u32, RawStatus)> {
    let mut status = 0 as libc::c_int;
    let pid = check_err(unsafe {
        libc::waitpid(pid as libc::pid_t, &mut status as *mut libc::c_int, flags)
    })?;
    Ok((pid as u32, status))
}

pub fn exited_code(status: RawStatus) -> Option<u32> {
    libc::WIFEXITED(status).then(|| libc::WEXITSTATUS(status) as u32)
}

pub fn termination_signal(status: RawStatus) -> Option<i32> {
    libc::WIFSIGNALED(status).then(|| libc::WTERMSIG(status))
}

pub fn kill(pid: u32, signal: i32) -> Result<()> {
    check_err(unsafe { libc::kill(pid as libc::pid_t, signal) })?;
    Ok(())
}

/// Symbolic name of a signal number, for messages.
pub fn signal_name(signal: i32) -> String {
    match signal {
        libc::SIGHUP => "SIGHUP".to_owned(),
        libc::SIGINT => "SIGINT".to_owned(),
        libc::SIGQUIT => "SIGQUIT".to_owned(),
        libc::SIGABRT => "SIGABRT".to_owned(),
        libc::SIGKILL => "SIGKILL".to_owned(),
        libc::SIGSEGV => "SIGSEGV".to_owned(),
        libc::SIGPIPE => "SIGPIPE".to_owned(),
        libc::SIGALRM => "SIGALRM".to_owned(),
        libc::SIGTERM => "SIGTERM".to_owned(),
        libc::SIGUSR1 => "SIGUSR1".to_owned(),
        libc::SIGUSR2 => "SIGUSR2".to_owned(),
        other => format!("signal {other}"),
    }
}

/// Symbolic name of the errno values the error taxonomy cares about.
pub fn errno_name(code: i32) -> Option<&'static str> {
    Some(match code {
        libc::ENOENT => "ENOENT",
        libc::EACCES => "EACCES",
        libc::EPERM => "EPERM",
        libc::ENOTDIR => "ENOTDIR",
        libc::EPIPE => "EPIPE",
        libc::EINTR => "EINTR",
        libc::EINVAL => "EINVAL",
        libc::ENOEXEC => "ENOEXEC",
        libc::ECHILD => "ECHILD",
        libc::ESRCH => "ESRCH",
        libc::EAGAIN => "EAGAIN",
        libc::EMFILE => "EMFILE",
        libc::ENOMEM => "ENOMEM",
        libc::E2BIG => "E2BIG",
        _ => return None,
    })
}

/// Restore an empty signal mask and the default `SIGPIPE` action in the child.
///
/// The Rust runtime ignores `SIGPIPE`, and an ignored disposition survives `exec`.
/// A pipeline stage whose reader went away must die of `SIGPIPE` as it would under
/// a shell.
pub fn reset_sigpipe() -> Result<()> {
    unsafe {
        let mut set = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
        check_err(libc::sigemptyset(set.as_mut_ptr()))?;
        let set = set.assume_init();
        let rc = libc::pthread_sigmask(libc::SIG_SETMASK, &set, ptr::null_mut());
        if rc != 0 {
            return Err(Error::from_raw_os_error(rc));
        }
        if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}
