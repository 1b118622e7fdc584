//! Streaming text decoders.
//!
//! Both decoders are plain buffering state machines: feed them chunks with `push`,
//! then call `finish` once the input has ended to flush whatever was carried over.
//! [`DecodeUtf8`] and [`SplitLines`] wrap them as iterator adapters over fallible
//! chunk sequences such as [`ByteStream`](crate::ByteStream), passing errors through.

use std::collections::VecDeque;
use std::mem;

const BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

fn lossy(bytes: Vec<u8>) -> String {
    String::from_utf8(bytes)
        .unwrap_or_else(|e| String::from_utf8_lossy(&e.into_bytes()).into_owned())
}

/// Length of a trailing multi-byte sequence that may still be completed by the next
/// chunk, or 0 if the buffer can be decoded in full.
///
/// Only the last three bytes are inspected: a longer tail is either complete or not
/// UTF-8 at all.
fn incomplete_tail(buf: &[u8]) -> usize {
    for back in 1..=buf.len().min(3) {
        let byte = buf[buf.len() - back];
        let needed = match byte {
            b if b & 0xC0 == 0x80 => continue,
            b if b & 0xE0 == 0xC0 => 2,
            b if b & 0xF0 == 0xE0 => 3,
            b if b & 0xF8 == 0xF0 => 4,
            _ => return 0,
        };
        return if back < needed { back } else { 0 };
    }
    0
}

#[derive(Debug)]
enum BomState {
    // Leading bytes that are still a proper prefix of the BOM.
    Pending(Vec<u8>),
    Done,
}

/// Decodes a chunked byte stream as UTF-8 without splitting a multi-byte character
/// across chunk boundaries.
///
/// A leading byte-order mark is stripped. The decoder does not validate its input:
/// malformed bytes, including a truncated sequence at the very end of the stream,
/// are decoded lossily as U+FFFD rather than dropped.
#[derive(Debug)]
pub struct Utf8Decoder {
    leftover: Vec<u8>,
    bom: BomState,
}

impl Default for Utf8Decoder {
    fn default() -> Utf8Decoder {
        Utf8Decoder::new()
    }
}

impl Utf8Decoder {
    pub fn new() -> Utf8Decoder {
        Utf8Decoder {
            leftover: Vec::new(),
            bom: BomState::Pending(Vec::with_capacity(BOM.len())),
        }
    }

    /// Decode the next chunk, holding back an incomplete trailing character.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        if let BomState::Pending(head) = &mut self.bom {
            head.extend_from_slice(chunk);
            if head.len() < BOM.len() && BOM.starts_with(head) {
                return String::new();
            }
            let head = mem::take(head);
            self.bom = BomState::Done;
            let input = head.strip_prefix(&BOM[..]).unwrap_or(&head[..]);
            return self.decode(input);
        }
        self.decode(chunk)
    }

    /// Flush everything still buffered. The decoder can be reused afterwards.
    pub fn finish(&mut self) -> String {
        let mut rest = mem::take(&mut self.leftover);
        if let BomState::Pending(head) = mem::replace(&mut self.bom, BomState::Done) {
            rest.extend_from_slice(&head);
        }
        self.bom = BomState::Pending(Vec::with_capacity(BOM.len()));
        lossy(rest)
    }

    fn decode(&mut self, chunk: &[u8]) -> String {
        let mut buf = mem::take(&mut self.leftover);
        buf.extend_from_slice(chunk);
        let complete = buf.len() - incomplete_tail(&buf);
        self.leftover = buf.split_off(complete);
        lossy(buf)
    }
}

/// Splits chunked text into lines terminated by `\n` or `\r\n`.
///
/// Terminators are not included in the lines. A `\r` not followed by `\n` is ordinary
/// text, except that a `\r` ending a chunk is held back until the next chunk shows
/// whether it starts a split `\r\n`. Text after the last terminator is emitted as a
/// final line by [`finish`](Self::finish).
#[derive(Debug, Default)]
pub struct LineSplitter {
    carry: String,
    // The previous chunk ended with a `\r` that is not part of `carry`.
    pending_cr: bool,
}

impl LineSplitter {
    pub fn new() -> LineSplitter {
        LineSplitter::default()
    }

    /// Split the next chunk, returning the lines it completes.
    pub fn push(&mut self, text: &str) -> Vec<String> {
        let mut lines = Vec::new();
        let mut buf = mem::take(&mut self.carry);
        let mut text = text;
        if mem::take(&mut self.pending_cr) {
            match text.strip_prefix('\n') {
                Some(rest) => {
                    lines.push(mem::take(&mut buf));
                    text = rest;
                }
                None => buf.push('\r'),
            }
        }
        buf.push_str(text);

        let bytes = buf.as_bytes();
        let mut start = 0;
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\n' => {
                    lines.push(buf[start..i].to_owned());
                    start = i + 1;
                }
                b'\r' if i + 1 == bytes.len() => {
                    self.carry = buf[start..i].to_owned();
                    self.pending_cr = true;
                    return lines;
                }
                b'\r' if bytes[i + 1] == b'\n' => {
                    lines.push(buf[start..i].to_owned());
                    i += 1;
                    start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }
        self.carry = buf[start..].to_owned();
        lines
    }

    /// Emit the unterminated remainder, if any. A `\r` still held back at this point
    /// was not a line terminator and stays part of the line.
    pub fn finish(&mut self) -> Option<String> {
        let mut line = mem::take(&mut self.carry);
        if mem::take(&mut self.pending_cr) {
            line.push('\r');
        }
        (!line.is_empty()).then_some(line)
    }
}

/// Iterator adapter decoding a sequence of byte chunks as UTF-8.
///
/// Created by [`decode_utf8`]. Empty decoded chunks are skipped. After the source
/// yields an error, the error is passed on and the adapter ends.
#[derive(Debug)]
pub struct DecodeUtf8<I> {
    source: I,
    decoder: Utf8Decoder,
    done: bool,
}

pub fn decode_utf8<I, E>(source: I) -> DecodeUtf8<I::IntoIter>
where
    I: IntoIterator<Item = Result<Vec<u8>, E>>,
{
    DecodeUtf8 {
        source: source.into_iter(),
        decoder: Utf8Decoder::new(),
        done: false,
    }
}

impl<I, E> Iterator for DecodeUtf8<I>
where
    I: Iterator<Item = Result<Vec<u8>, E>>,
{
    type Item = Result<String, E>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            let text = match self.source.next() {
                Some(Ok(chunk)) => self.decoder.push(&chunk),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    self.decoder.finish()
                }
            };
            if !text.is_empty() {
                return Some(Ok(text));
            }
        }
        None
    }
}

/// Iterator adapter splitting a sequence of text chunks into lines.
///
/// Created by [`split_lines`]. After the source yields an error, the lines completed
/// before it are still delivered, then the error, and the adapter ends.
#[derive(Debug)]
pub struct SplitLines<I> {
    source: I,
    splitter: LineSplitter,
    ready: VecDeque<String>,
    done: bool,
}

pub fn split_lines<I, E>(source: I) -> SplitLines<I::IntoIter>
where
    I: IntoIterator<Item = Result<String, E>>,
{
    SplitLines {
        source: source.into_iter(),
        splitter: LineSplitter::new(),
        ready: VecDeque::new(),
        done: false,
    }
}

impl<I, E> Iterator for SplitLines<I>
where
    I: Iterator<Item = Result<String, E>>,
{
    type Item = Result<String, E>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.ready.pop_front() {
                return Some(Ok(line));
            }
            if self.done {
                return None;
            }
            match self.source.next() {
                Some(Ok(text)) => self.ready.extend(self.splitter.push(&text)),
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e));
                }
                None => {
                    self.done = true;
                    self.ready.extend(self.splitter.finish());
                }
            }
        }
    }
}

/// Text encodings understood by [`ProcessInput::text`](crate::ProcessInput::text) and
/// [`Executor::string_with_encoding`](crate::Executor::string_with_encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Utf16Le,
    /// ISO-8859-1: one byte per code point; unencodable characters become `?`.
    Latin1,
    /// 7-bit ASCII; unencodable characters become `?`.
    Ascii,
}

impl Encoding {
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            Encoding::Utf8 => text.as_bytes().to_vec(),
            Encoding::Utf16Le => text.encode_utf16().flat_map(u16::to_le_bytes).collect(),
            Encoding::Latin1 => text
                .chars()
                .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
                .collect(),
            Encoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }

    pub fn decode(self, bytes: &[u8]) -> String {
        match self {
            Encoding::Utf8 => {
                let mut decoder = Utf8Decoder::new();
                let mut text = decoder.push(bytes);
                text.push_str(&decoder.finish());
                text
            }
            Encoding::Utf16Le => {
                let units = bytes
                    .chunks_exact(2)
                    .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
                let mut text: String = char::decode_utf16(units)
                    .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                    .collect();
                if bytes.len() % 2 == 1 {
                    text.push(char::REPLACEMENT_CHARACTER);
                }
                text
            }
            Encoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            Encoding::Ascii => bytes
                .iter()
                .map(|&b| {
                    if b.is_ascii() {
                        char::from(b)
                    } else {
                        char::REPLACEMENT_CHARACTER
                    }
                })
                .collect(),
        }
    }
}
