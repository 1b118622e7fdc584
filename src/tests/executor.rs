use std::env;
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use crate::{
    ByteStream, Cancellation, Command, CommandError, Encoding, Executor, ExecutorConfig,
    ExitCode, ProcessInput, ProcessOutput, command,
};

fn path_only_executor() -> Executor {
    let path = env::var("PATH").unwrap();
    Executor::new(ExecutorConfig::with_env([("PATH", path.as_str())]))
}

#[test]
fn echo_lines() {
    let lines = command("echo", ["-n", "1\n2\n3"]).lines().unwrap();
    assert_eq!(lines, ["1", "2", "3"]);
}

#[test]
fn three_stage_pipeline() {
    let cmd = (command("head", ["-2"]) | Command::cmd("sort") | Command::cmd("cat")).feed("2\n1\n3");
    assert_eq!(cmd.lines().unwrap(), ["1", "2"]);
}

#[test]
fn pipeline_grouping_does_not_matter() {
    let (a, b, c) = (
        command("printf", ["b\\na\\nc\\n"]),
        Command::cmd("sort"),
        command("tr", ["a-z", "A-Z"]),
    );
    let left = ((a.clone() | b.clone()) | c.clone()).string().unwrap();
    let right = (a | (b | c)).string().unwrap();
    assert_eq!(left, "A\nB\nC\n");
    assert_eq!(right, left);
}

#[test]
fn long_pipeline_preserves_order() {
    let cmd = command("seq", ["1", "20000"]) | Command::cmd("cat") | command("tail", ["-1"]);
    assert_eq!(cmd.string().unwrap(), "20000\n");
}

#[test]
fn downstream_exits_early() {
    let cmd = Command::cmd("yes") | command("head", ["-3"]);
    assert_eq!(cmd.lines().unwrap(), ["y", "y", "y"]);
}

#[test]
fn program_not_found() {
    match Command::cmd("nosuchcommand-procpipe").run() {
        Err(CommandError::ProgramNotFound(e)) => {
            assert_eq!(e.errno, Some("ENOENT"));
            assert_eq!(e.path.as_deref(), Some(Path::new("nosuchcommand-procpipe")));
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn program_not_found_in_pipeline() {
    let cmd = Command::cmd("cat") | Command::cmd("nosuchcommand-procpipe");
    assert!(matches!(
        cmd.feed("x").string(),
        Err(CommandError::ProgramNotFound(_))
    ));
}

#[test]
fn permission_denied() {
    let tmpdir = TempDir::new().unwrap();
    let script = tmpdir.path().join("script");
    fs::write(&script, "#!/bin/sh\necho hi\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
    assert!(matches!(
        Command::cmd(&script).run(),
        Err(CommandError::PermissionDenied(_))
    ));
}

#[test]
fn non_zero_exit_code() {
    assert_eq!(
        command("sh", ["-c", "exit 13"]).successful_exit_code(),
        Err(CommandError::NonZeroExitCode(ExitCode(13)))
    );
    assert_eq!(
        command("sh", ["-c", "exit 13"]).exit_code(),
        Ok(ExitCode(13))
    );
    assert_eq!(
        Command::cmd("true").successful_exit_code(),
        Ok(ExitCode::SUCCESS)
    );
}

#[test]
fn exit_code_of_noisy_command() {
    // Enough output to fill the pipe if nobody read it.
    let cmd = command("sh", ["-c", "head -c 300000 /dev/zero; head -c 300000 /dev/zero >&2"]);
    assert_eq!(cmd.exit_code().unwrap(), ExitCode::SUCCESS);
}

#[test]
fn working_directory_missing() {
    let tmpdir = TempDir::new().unwrap();
    let missing = tmpdir.path().join("gone");
    let cmd = Command::cmd("true").working_directory(&missing);
    for _ in 0..2 {
        match cmd.run() {
            Err(CommandError::WorkingDirectoryMissing(dir)) => assert_eq!(dir, missing),
            other => panic!("unexpected {other:?}"),
        }
    }
}

#[test]
fn working_directories_checked_before_spawning() {
    let tmpdir = TempDir::new().unwrap();
    let missing = tmpdir.path().join("gone");
    let cmd = command("touch", ["marker"]).working_directory(tmpdir.path())
        | Command::cmd("cat").working_directory(&missing);
    match cmd.run() {
        Err(CommandError::WorkingDirectoryMissing(dir)) => assert_eq!(dir, missing),
        other => panic!("unexpected {other:?}"),
    }
    thread::sleep(Duration::from_millis(200));
    assert!(!tmpdir.path().join("marker").exists());
}

#[test]
fn working_directory() {
    let tmpdir = TempDir::new().unwrap();
    fs::write(tmpdir.path().join("marker"), "").unwrap();
    let cmd = (Command::cmd("ls") | Command::cmd("cat")).working_directory(tmpdir.path());
    assert_eq!(cmd.lines().unwrap(), ["marker"]);
}

#[test]
fn env_from_executor() {
    let executor = path_only_executor();
    let code = executor
        .exit_code(&command("sh", ["-c", "test -z \"$HOME\""]))
        .unwrap();
    assert_eq!(code, ExitCode::SUCCESS);
}

#[test]
fn command_env_overrides_executor_env() {
    let path = env::var("PATH").unwrap();
    let executor = Executor::new(ExecutorConfig::with_env([
        ("PATH", path.as_str()),
        ("FOO", "executor"),
        ("BAR", "executor"),
    ]));
    let cmd = command("sh", ["-c", "printf %s-%s \"$FOO\" \"$BAR\""]).env("FOO", "command");
    assert_eq!(executor.string(&cmd).unwrap(), "command-executor");
}

#[test]
fn env_reaches_every_stage() {
    let cmd = (command("sh", ["-c", "printf %s \"$TAG\""])
        | command("sh", ["-c", "cat; printf %s \"$TAG\""]))
    .env("TAG", "x");
    assert_eq!(path_only_executor().string(&cmd).unwrap(), "xx");
}

#[test]
fn feed_text() {
    assert_eq!(Command::cmd("cat").feed("foo").string().unwrap(), "foo");
}

#[test]
fn feed_bytes_and_encodings() {
    let out = Command::cmd("cat")
        .stdin(ProcessInput::text("hé", Encoding::Latin1))
        .stream()
        .unwrap()
        .read_to_end()
        .unwrap();
    assert_eq!(out, b"h\xE9");
    let text = command("printf", ["\\150\\351"])
        .string_with_encoding(Encoding::Latin1)
        .unwrap();
    assert_eq!(text, "hé");
}

#[test]
fn feed_is_reused_across_runs() {
    let cmd = Command::cmd("cat").stdin(b"again");
    assert_eq!(cmd.string().unwrap(), "again");
    assert_eq!(cmd.string().unwrap(), "again");
}

#[test]
fn stream_input_is_consumed_once() {
    let cmd = Command::cmd("cat").stdin(ByteStream::from_bytes("once"));
    assert_eq!(cmd.string().unwrap(), "once");
    assert_eq!(cmd.string().unwrap(), "");
}

#[test]
fn input_from_process_stream() {
    let upstream = command("printf", ["a\\nb\\n"]).stream().unwrap();
    let cmd = command("wc", ["-l"]).stdin(upstream);
    assert_eq!(cmd.string().unwrap().trim(), "2");
}

#[test]
fn piped_stdin_on_pipeline() {
    let mut p = (Command::cmd("cat") | command("tr", ["a-z", "A-Z"]))
        .stdin(ProcessInput::Pipe)
        .run()
        .unwrap();
    let mut sink = p.stdin.take().unwrap();
    sink.write_chunk(b"abc").unwrap();
    sink.close();
    assert_eq!(p.take_stdout().read_to_end().unwrap(), b"ABC");
    assert!(p.exit_code().unwrap().success());
}

#[test]
fn stdin_inherited_by_default() {
    let p = Command::cmd("true").run().unwrap();
    assert!(p.stdin.is_none());
}

#[test]
fn short_first_line_arrives_before_exit() {
    let started = Instant::now();
    let mut lines = command("sh", ["-c", "printf 'y\\n'; sleep 10"]).lines_stream().unwrap();
    assert_eq!(lines.next().unwrap().unwrap(), "y");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn lines_stream_is_lazy() {
    let mut lines = command("sh", ["-c", "echo first; sleep 10"]).lines_stream().unwrap();
    assert_eq!(lines.next().unwrap().unwrap(), "first");
}

#[test]
fn output_captures_both_streams() {
    let out = command("sh", ["-c", "printf out; printf err >&2; exit 3"])
        .output()
        .unwrap();
    assert_eq!(out.stdout_str(), "out");
    assert_eq!(out.stderr_str(), "err");
    assert_eq!(out.exit_code, ExitCode(3));
    assert!(!out.success());
}

#[test]
fn output_large_on_both_streams() {
    let out = command(
        "sh",
        ["-c", "head -c 300000 /dev/zero; head -c 300000 /dev/zero >&2"],
    )
    .output()
    .unwrap();
    assert_eq!(out.stdout.len(), 300000);
    assert_eq!(out.stderr.len(), 300000);
}

#[test]
fn redirect_error_stream() {
    let out = command("sh", ["-c", "echo out; echo err >&2"])
        .redirect_error_stream(true)
        .output()
        .unwrap();
    assert_eq!(out.stdout_str(), "out\nerr\n");
    assert!(out.stderr.is_empty());
}

#[test]
fn stdout_to_file() {
    let tmpdir = TempDir::new().unwrap();
    let path = tmpdir.path().join("out");
    let cmd = (command("echo", ["hello"]) | command("tr", ["a-z", "A-Z"]))
        .stdout(File::create(&path).unwrap());
    cmd.successful_exit_code().unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "HELLO\n");
}

#[test]
fn stderr_to_file() {
    let tmpdir = TempDir::new().unwrap();
    let path = tmpdir.path().join("err");
    let cmd = command("sh", ["-c", "printf oops >&2"])
        .stderr(ProcessOutput::redirect(File::create(&path).unwrap()));
    cmd.successful_exit_code().unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "oops");
}

#[test]
fn exit_code_with_cancel() {
    let cancel = Cancellation::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        })
    };
    let result = command("sleep", ["10"]).exit_code_with_cancel(&cancel);
    canceller.join().unwrap();
    match result {
        Err(CommandError::Io(e)) => assert_eq!(e.kind, std::io::ErrorKind::Interrupted),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn cancel_terminates_every_stage() {
    let process = (command("sleep", ["10"]) | Command::cmd("cat")).run().unwrap();
    assert_eq!(process.upstream().len(), 1);
    let cancel = Cancellation::new();
    let canceller = {
        let cancel = cancel.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            cancel.cancel();
        })
    };
    let started = Instant::now();
    assert!(process.exit_code_with_cancel(&cancel).is_err());
    canceller.join().unwrap();
    let sleep = &process.upstream()[0];
    let err = sleep.exit_code().unwrap_err();
    assert!(err.to_string().contains("SIGTERM"), "{err}");
    assert!(!sleep.is_alive());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn single_command_has_no_upstream() {
    let process = Command::cmd("true").run().unwrap();
    assert!(process.upstream().is_empty());
    process.exit_code().unwrap();
}

#[test]
fn small_chunk_size() {
    let executor = Executor::new(ExecutorConfig {
        chunk_size: 1,
        ..ExecutorConfig::from_current_env()
    });
    let stream = executor.stream(&command("printf", ["abc"])).unwrap();
    let chunks: Vec<_> = stream.map(Result::unwrap).collect();
    assert_eq!(chunks, [b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
}
