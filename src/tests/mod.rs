mod decode;
mod executor;

use crate::decode::{LineSplitter, Utf8Decoder};
use crate::{
    ByteSink, ByteStream, Cancellation, Command, CommandError, Encoding, Executor,
    ExecutorConfig, ExitCode, InputStream, Lines, Output, Process, ProcessHandle, ProcessInput,
    ProcessOutput, StandardCommand, SystemError,
};

fn assert_send_sync<T: Send + Sync>() {}

fn assert_send<T: Send>() {}

#[test]
fn public_types_are_send_and_sync() {
    assert_send_sync::<Command>();
    assert_send_sync::<StandardCommand>();
    assert_send_sync::<ProcessInput>();
    assert_send_sync::<ProcessOutput>();
    assert_send_sync::<InputStream>();
    assert_send_sync::<Executor>();
    assert_send_sync::<ExecutorConfig>();
    assert_send_sync::<Output>();
    assert_send_sync::<ExitCode>();
    assert_send_sync::<ProcessHandle>();
    assert_send_sync::<ByteSink>();
    assert_send_sync::<Cancellation>();
    assert_send_sync::<CommandError>();
    assert_send_sync::<SystemError>();
    assert_send_sync::<Encoding>();
    assert_send_sync::<Utf8Decoder>();
    assert_send_sync::<LineSplitter>();
}

#[test]
fn streaming_types_are_send() {
    assert_send::<ByteStream>();
    assert_send::<Process>();
    assert_send::<Lines>();
}
