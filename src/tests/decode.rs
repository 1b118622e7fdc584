use std::convert::Infallible;

use proptest::prelude::*;

use crate::Encoding;
use crate::decode::{LineSplitter, Utf8Decoder, decode_utf8, split_lines};

fn decode_chunks(chunks: &[&[u8]]) -> String {
    let mut decoder = Utf8Decoder::new();
    let mut out: String = chunks.iter().map(|c| decoder.push(c)).collect();
    out.push_str(&decoder.finish());
    out
}

fn split_chunks(chunks: &[&str]) -> Vec<String> {
    let mut splitter = LineSplitter::new();
    let mut lines: Vec<String> = chunks.iter().flat_map(|c| splitter.push(c)).collect();
    lines.extend(splitter.finish());
    lines
}

// Cut `data` at the given positions, taken modulo its length.
fn cut_at(data: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut cuts: Vec<usize> = cuts.iter().map(|&c| c % (data.len() + 1)).collect();
    cuts.sort_unstable();
    let mut chunks = vec![];
    let mut start = 0;
    for cut in cuts {
        chunks.push(data[start..cut].to_vec());
        start = cut;
    }
    chunks.push(data[start..].to_vec());
    chunks
}

#[test]
fn utf8_whole_chunk() {
    assert_eq!(decode_chunks(&[b"abc"]), "abc");
    assert_eq!(decode_chunks(&["é".as_bytes()]), "é");
}

#[test]
fn utf8_two_byte_char_split() {
    let bytes = "é".as_bytes();
    assert_eq!(decode_chunks(&[&bytes[..1], &bytes[1..]]), "é");
}

#[test]
fn utf8_three_and_four_byte_chars_split() {
    let bytes = "x€y😀z".as_bytes();
    let single: Vec<&[u8]> = bytes.chunks(1).collect();
    assert_eq!(decode_chunks(&single), "x€y😀z");
}

#[test]
fn utf8_holds_back_only_incomplete_tail() {
    let bytes = "a€".as_bytes();
    let mut decoder = Utf8Decoder::new();
    assert_eq!(decoder.push(&bytes[..3]), "a");
    assert_eq!(decoder.push(&bytes[3..]), "€");
    assert_eq!(decoder.push(b"bcd"), "bcd");
    assert_eq!(decoder.push(&"é".as_bytes()[..1]), "");
    assert_eq!(decoder.push(&"é".as_bytes()[1..]), "é");
}

#[test]
fn utf8_strips_bom() {
    assert_eq!(decode_chunks(&[b"\xEF\xBB\xBFabc"]), "abc");
    assert_eq!(decode_chunks(&[b"\xEF", b"\xBB", b"\xBFabc"]), "abc");
    assert_eq!(decode_chunks(&[b"ab\xEF\xBB\xBF"]), "ab\u{FEFF}");
}

#[test]
fn utf8_short_first_chunk_is_not_held() {
    let mut decoder = Utf8Decoder::new();
    assert_eq!(decoder.push(b"y\n"), "y\n");
    let mut decoder = Utf8Decoder::new();
    assert_eq!(decoder.push(b"\xEF"), "");
    assert_eq!(decoder.push(b"x"), "\u{FFFD}x");
}

#[test]
fn utf8_short_input_is_not_lost() {
    assert_eq!(decode_chunks(&[b"a"]), "a");
    assert_eq!(decode_chunks(&[b"a", b"b"]), "ab");
    assert_eq!(decode_chunks(&[]), "");
}

#[test]
fn utf8_truncated_tail_is_flushed() {
    assert_eq!(decode_chunks(&[b"abc\xE2\x82"]), "abc\u{FFFD}");
}

#[test]
fn utf8_decoder_is_reusable() {
    let mut decoder = Utf8Decoder::new();
    decoder.push(b"\xEF\xBB\xBFone");
    assert_eq!(decoder.finish(), "");
    assert_eq!(decoder.push(b"\xEF\xBB\xBFtwo"), "two");
    assert_eq!(decoder.finish(), "");
}

#[test]
fn lines_split_crlf_across_chunks() {
    assert_eq!(split_chunks(&["a\r", "\nb"]), ["a", "b"]);
}

#[test]
fn lines_crlf_in_one_chunk() {
    assert_eq!(split_chunks(&["a\r\n"]), ["a"]);
}

#[test]
fn lines_lone_cr_is_content() {
    assert_eq!(split_chunks(&["a\rb"]), ["a\rb"]);
    assert_eq!(split_chunks(&["a\r", "b"]), ["a\rb"]);
    assert_eq!(split_chunks(&["a\r"]), ["a\r"]);
}

#[test]
fn lines_mixed_terminators() {
    assert_eq!(
        split_chunks(&["one\ntwo\r\nthr", "ee\n\nfour"]),
        ["one", "two", "three", "", "four"]
    );
}

#[test]
fn lines_no_trailing_empty_line() {
    assert_eq!(split_chunks(&["a\nb\n"]), ["a", "b"]);
    assert!(split_chunks(&[""]).is_empty());
}

#[test]
fn lines_cr_then_empty_chunk_then_lf() {
    assert_eq!(split_chunks(&["a\r", "", "\nb"]), ["a", "b"]);
}

#[test]
fn adapters_pass_errors_through() {
    let chunks = vec![Ok(b"a\nb".to_vec()), Err("boom"), Ok(b"c\n".to_vec())];
    let lines: Vec<_> = split_lines(decode_utf8(chunks)).collect();
    assert_eq!(lines, [Ok("a".to_owned()), Err("boom")]);
}

#[test]
fn adapters_flush_at_end() {
    let bytes = "x\r\né\r".as_bytes();
    let chunks = bytes.chunks(1).map(|c| Ok::<_, Infallible>(c.to_vec()));
    let lines: Vec<_> = split_lines(decode_utf8(chunks))
        .map(|line| line.unwrap())
        .collect();
    assert_eq!(lines, ["x", "é\r"]);
}

#[test]
fn encodings() {
    assert_eq!(Encoding::Utf8.encode("hé"), "hé".as_bytes());
    assert_eq!(Encoding::Latin1.encode("hé€"), b"h\xE9?");
    assert_eq!(Encoding::Ascii.encode("hé"), b"h?");
    assert_eq!(Encoding::Utf16Le.encode("hé"), b"h\0\xE9\0");
    assert_eq!(Encoding::Latin1.decode(b"h\xE9"), "hé");
    assert_eq!(Encoding::Ascii.decode(b"h\xE9"), "h\u{FFFD}");
    assert_eq!(Encoding::Utf16Le.decode(b"h\0\xE9\0"), "hé");
    assert_eq!(Encoding::Utf16Le.decode(b"h\0x"), "h\u{FFFD}");
    assert_eq!(Encoding::Utf8.decode(b"\xEF\xBB\xBFok"), "ok");
}

// Straightforward line splitting of a complete text.
fn reference_lines(text: &str) -> Vec<String> {
    let mut lines = vec![];
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => lines.push(std::mem::take(&mut current)),
            '\r' if chars.peek() == Some(&'\n') => {
                chars.next();
                lines.push(std::mem::take(&mut current));
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    lines
}

proptest! {
    #[test]
    fn utf8_chunking_does_not_matter(
        text in any::<String>(),
        cuts in prop::collection::vec(any::<usize>(), 0..8),
    ) {
        prop_assume!(!text.starts_with('\u{FEFF}'));
        let chunks = cut_at(text.as_bytes(), &cuts);
        let chunks: Vec<&[u8]> = chunks.iter().map(Vec::as_slice).collect();
        prop_assert_eq!(decode_chunks(&chunks), text);
    }

    #[test]
    fn line_chunking_does_not_matter(
        text in "[ab\r\n]{0,40}",
        cuts in prop::collection::vec(any::<usize>(), 0..8),
    ) {
        let chunks = cut_at(text.as_bytes(), &cuts);
        let chunks: Vec<String> = chunks
            .into_iter()
            .map(|c| String::from_utf8(c).unwrap())
            .collect();
        let chunks: Vec<&str> = chunks.iter().map(String::as_str).collect();
        prop_assert_eq!(split_chunks(&chunks), reference_lines(&text));
    }
}
