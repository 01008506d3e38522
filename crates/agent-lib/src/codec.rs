//! Frame codec for the engine's streaming responses
//!
//! Streaming endpoints answer with HTTP chunked transfer encoding, and the
//! log endpoint additionally prefixes writes with an 8-byte stream header.
//! Neither boundary lines up with read boundaries, so everything here keeps
//! what it cannot resolve yet and waits for more input instead of failing.

use crate::observability::summarise;
use regex::bytes::Regex;
use std::sync::OnceLock;
use thiserror::Error;

/// Length of the stdout/stderr multiplexing header
pub const STREAM_HEADER_LEN: usize = 8;

/// Length of `2015-08-31T14:41:43.702708748Z`
pub const TIMESTAMP_LEN: usize = 30;

/// Prefix of the engine's in-band failure notice on the log endpoint
const ENGINE_NOTICE_PREFIX: &[u8] = b"Error running logs job:";

/// Longest hexadecimal size field accepted in a chunk header
const MAX_SIZE_DIGITS: usize = 16;

/// Errors for a single frame; never fatal to the stream
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("log frame has no timestamp: {excerpt}")]
    MissingTimestamp { excerpt: String },

    #[error("engine reported a log failure: {0}")]
    EngineNotice(String),

    #[error("empty log frame")]
    Empty,
}

/// Outcome of looking for one chunk at the start of a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus<'a> {
    /// A complete chunk; `consumed` spans header, payload and trailing CRLF
    Frame { payload: &'a [u8], consumed: usize },
    /// The terminating zero-size chunk
    End { consumed: usize },
    /// Not enough bytes yet, or not positioned on a chunk boundary
    Incomplete,
}

/// Decode the chunk at the start of `buf` without consuming anything.
pub fn next_chunk(buf: &[u8]) -> ChunkStatus<'_> {
    let Some(line_end) = find_crlf(buf) else {
        return ChunkStatus::Incomplete;
    };
    let Some(size) = parse_chunk_size(&buf[..line_end]) else {
        return ChunkStatus::Incomplete;
    };

    let body_start = line_end + 2;
    let needed = match size.checked_add(2) {
        Some(n) => n,
        None => return ChunkStatus::Incomplete,
    };
    if buf.len() - body_start < needed {
        return ChunkStatus::Incomplete;
    }

    if size == 0 {
        return ChunkStatus::End {
            consumed: body_start + 2,
        };
    }

    ChunkStatus::Frame {
        payload: &buf[body_start..body_start + size],
        consumed: body_start + needed,
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn parse_chunk_size(field: &[u8]) -> Option<usize> {
    if field.is_empty()
        || field.len() > MAX_SIZE_DIGITS
        || !field.iter().all(u8::is_ascii_hexdigit)
    {
        return None;
    }
    let digits = std::str::from_utf8(field).ok()?;
    usize::from_str_radix(digits, 16).ok()
}

/// Per-descriptor chunked-transfer decoder.
///
/// Holds the bytes read since the last complete chunk. The buffer is only
/// dropped together with the decoder, i.e. when the subscription closes.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    buf: Vec<u8>,
    finished: bool,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `input` and return every chunk payload that is now complete.
    pub fn feed(&mut self, input: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        if self.finished {
            return frames;
        }

        self.buf.extend_from_slice(input);

        let mut offset = 0;
        loop {
            match next_chunk(&self.buf[offset..]) {
                ChunkStatus::Frame { payload, consumed } => {
                    frames.push(payload.to_vec());
                    offset += consumed;
                }
                ChunkStatus::End { consumed } => {
                    offset += consumed;
                    self.finished = true;
                    break;
                }
                ChunkStatus::Incomplete => break,
            }
        }

        if self.finished {
            self.buf.clear();
        } else {
            self.buf.drain(..offset);
        }
        frames
    }

    /// True once the zero-size terminating chunk was seen
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Bytes waiting for the rest of their chunk
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

/// Output stream selected by the multiplexing header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum StreamKind {
    #[default]
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }

    fn from_selector(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(StreamKind::Stdout),
            2 => Some(StreamKind::Stderr),
            _ => None,
        }
    }
}

/// A log record recovered from one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub stream: StreamKind,
    /// The 30-byte engine timestamp, e.g. `2015-08-31T14:41:43.702708748Z`
    pub timestamp: String,
    pub text: String,
}

/// What a single log frame turned out to be
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Demuxed {
    /// Header-only frame; the running selector was updated
    Selector(StreamKind),
    Line(LogLine),
}

fn timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}\.\d{9}Z ").expect("valid timestamp regex")
    })
}

/// Recognise `[1|2, 0, 0, 0, len, len, len, len]`
fn parse_stream_header(frame: &[u8]) -> Option<StreamKind> {
    if frame.len() < STREAM_HEADER_LEN || frame[1..4] != [0, 0, 0] {
        return None;
    }
    StreamKind::from_selector(frame[0])
}

/// Demultiplexes log frames, keeping the stdout/stderr selector between
/// frames since the header and its text may arrive as separate chunks.
#[derive(Debug, Default)]
pub struct LogDemuxer {
    stream: StreamKind,
}

impl LogDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current stream selector
    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn demux(&mut self, frame: &[u8]) -> Result<Demuxed, FrameError> {
        if frame.is_empty() {
            return Err(FrameError::Empty);
        }

        let mut rest = frame;
        while let Some(stream) = parse_stream_header(rest) {
            self.stream = stream;
            rest = &rest[STREAM_HEADER_LEN..];
        }
        if rest.is_empty() {
            return Ok(Demuxed::Selector(self.stream));
        }

        if rest.starts_with(ENGINE_NOTICE_PREFIX) {
            return Err(FrameError::EngineNotice(
                String::from_utf8_lossy(rest).trim_end().to_string(),
            ));
        }

        // No header, or header bytes we do not recognise: resynchronise on
        // the timestamp the engine puts in front of every line.
        let start = timestamp_pattern()
            .find(rest)
            .map(|m| m.start())
            .ok_or_else(|| FrameError::MissingTimestamp {
                excerpt: summarise(&String::from_utf8_lossy(rest), 60),
            })?;
        let record = &rest[start..];

        let timestamp = String::from_utf8_lossy(&record[..TIMESTAMP_LEN]).into_owned();
        let text = record.get(TIMESTAMP_LEN + 1..).unwrap_or_default();
        let text = strip_newline(text);

        Ok(Demuxed::Line(LogLine {
            stream: self.stream,
            timestamp,
            text: String::from_utf8_lossy(text).into_owned(),
        }))
    }
}

fn strip_newline(text: &[u8]) -> &[u8] {
    let text = text.strip_suffix(b"\n").unwrap_or(text);
    text.strip_suffix(b"\r").unwrap_or(text)
}

/// Encode `payload` as one chunk; used by tests and fake servers.
pub fn encode_chunk(payload: &[u8]) -> Vec<u8> {
    let mut out = format!("{:x}\r\n", payload.len()).into_bytes();
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT: &[u8] = br#"{"status":"create","id":"46e344569d70e9cf849a217701d5ef2e866dff122c1d5f1641b490e680c15c5d","from":"centos:7","time":1445856406}
"#;

    fn header(selector: u8, len: u32) -> Vec<u8> {
        let mut h = vec![selector, 0, 0, 0];
        h.extend_from_slice(&len.to_be_bytes());
        h
    }

    #[test]
    fn test_next_chunk_complete() {
        let data = encode_chunk(EVENT);
        assert_eq!(
            next_chunk(&data),
            ChunkStatus::Frame {
                payload: EVENT,
                consumed: data.len()
            }
        );
    }

    #[test]
    fn test_next_chunk_missing_trailer_is_incomplete() {
        let mut data = b"80\r\n".to_vec();
        data.extend_from_slice(EVENT);
        assert_eq!(EVENT.len(), 0x80);
        assert_eq!(next_chunk(&data), ChunkStatus::Incomplete);
    }

    #[test]
    fn test_next_chunk_truncated_payload_is_incomplete() {
        let data = &encode_chunk(EVENT)[..40];
        assert_eq!(next_chunk(data), ChunkStatus::Incomplete);
    }

    #[test]
    fn test_next_chunk_uppercase_hex() {
        let payload = vec![b'x'; 0xAB];
        let mut data = b"AB\r\n".to_vec();
        data.extend_from_slice(&payload);
        data.extend_from_slice(b"\r\n");
        match next_chunk(&data) {
            ChunkStatus::Frame { payload: p, .. } => assert_eq!(p.len(), 0xAB),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_next_chunk_garbage_is_not_an_error() {
        assert_eq!(next_chunk(b"zz\r\nhello\r\n"), ChunkStatus::Incomplete);
        assert_eq!(next_chunk(b"\r\n\r\n"), ChunkStatus::Incomplete);
        assert_eq!(next_chunk(b""), ChunkStatus::Incomplete);
    }

    #[test]
    fn test_next_chunk_terminator() {
        assert_eq!(next_chunk(b"0\r\n\r\n"), ChunkStatus::End { consumed: 5 });
    }

    #[test]
    fn test_decoder_keeps_incomplete_tail() {
        let data = encode_chunk(b"hello");
        let mut decoder = ChunkDecoder::new();

        assert!(decoder.feed(&data[..4]).is_empty());
        assert_eq!(decoder.pending(), &data[..4]);

        let frames = decoder.feed(&data[4..]);
        assert_eq!(frames, vec![b"hello".to_vec()]);
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn test_decoder_one_call_matches_byte_by_byte() {
        let payloads: Vec<Vec<u8>> = vec![
            EVENT.to_vec(),
            header(1, 35),
            b"2015-08-31T14:41:43.702708748Z HERE".to_vec(),
            vec![0u8; 300],
            b"\r\n".to_vec(),
        ];
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend(encode_chunk(p));
        }
        stream.extend_from_slice(b"0\r\n\r\n");

        let mut whole = ChunkDecoder::new();
        let all_at_once = whole.feed(&stream);
        assert!(whole.is_finished());

        let mut split = ChunkDecoder::new();
        let mut byte_by_byte = Vec::new();
        for b in &stream {
            byte_by_byte.extend(split.feed(std::slice::from_ref(b)));
        }
        assert!(split.is_finished());

        assert_eq!(all_at_once, payloads);
        assert_eq!(byte_by_byte, payloads);
    }

    #[test]
    fn test_decoder_ignores_input_after_terminator() {
        let mut decoder = ChunkDecoder::new();
        let mut data = b"0\r\n\r\n".to_vec();
        data.extend(encode_chunk(b"late"));
        assert!(decoder.feed(&data).is_empty());
        assert!(decoder.is_finished());
        assert!(decoder.feed(&encode_chunk(b"later")).is_empty());
    }

    fn line(demuxer: &mut LogDemuxer, frame: &[u8]) -> LogLine {
        match demuxer.demux(frame).unwrap() {
            Demuxed::Line(line) => line,
            other => panic!("expected line, got {other:?}"),
        }
    }

    #[test]
    fn test_demux_single_header() {
        let mut frame = header(1, 35);
        frame.extend_from_slice(b"2015-08-31T14:41:43.702708748Z HERE");

        let line = line(&mut LogDemuxer::new(), &frame);
        assert_eq!(line.stream, StreamKind::Stdout);
        assert_eq!(line.timestamp, "2015-08-31T14:41:43.702708748Z");
        assert_eq!(line.text, "HERE");
    }

    #[test]
    fn test_demux_stderr_header() {
        let mut frame = header(2, 35);
        frame.extend_from_slice(b"2015-08-31T14:41:43.702708748Z HERE\n");

        let line = line(&mut LogDemuxer::new(), &frame);
        assert_eq!(line.stream, StreamKind::Stderr);
        assert_eq!(line.text, "HERE");
    }

    #[test]
    fn test_demux_double_header() {
        let mut frame = header(1, 0);
        frame.extend(header(1, 35));
        frame.extend_from_slice(b"2015-08-31T14:41:43.702708748Z HERE");

        assert_eq!(line(&mut LogDemuxer::new(), &frame).text, "HERE");
    }

    #[test]
    fn test_demux_no_header() {
        let frame = b"2015-08-31T14:36:35.179583676Z HERE";
        let line = line(&mut LogDemuxer::new(), frame);
        assert_eq!(line.text, "HERE");
        assert_eq!(line.stream, StreamKind::Stdout);
    }

    #[test]
    fn test_demux_bad_header() {
        let frame = b"\xb02015-08-31T14:41:43.702708748Z HERE";
        assert_eq!(line(&mut LogDemuxer::new(), frame).text, "HERE");
    }

    #[test]
    fn test_demux_missing_timestamp() {
        let err = LogDemuxer::new().demux(b"not a log line").unwrap_err();
        assert!(matches!(err, FrameError::MissingTimestamp { .. }));
    }

    #[test]
    fn test_demux_engine_notice() {
        let err = LogDemuxer::new()
            .demux(b"Error running logs job: context canceled\n")
            .unwrap_err();
        assert_eq!(
            err,
            FrameError::EngineNotice("Error running logs job: context canceled".into())
        );
    }

    #[test]
    fn test_demux_header_only_frame_sets_selector() {
        let mut demuxer = LogDemuxer::new();
        assert_eq!(
            demuxer.demux(&header(2, 35)).unwrap(),
            Demuxed::Selector(StreamKind::Stderr)
        );

        let line = line(&mut demuxer, b"2015-08-31T14:41:43.702708748Z oops");
        assert_eq!(line.stream, StreamKind::Stderr);
        assert_eq!(line.text, "oops");
    }

    #[test]
    fn test_demux_alternating_streams_independent_of_chunking() {
        let lines = [
            (1u8, "2015-08-31T14:41:43.702708748Z out one"),
            (2u8, "2015-08-31T14:41:44.702708748Z err one"),
            (1u8, "2015-08-31T14:41:45.702708748Z out two"),
            (2u8, "2015-08-31T14:41:46.702708748Z err two"),
        ];
        let mut wire = Vec::new();
        for (selector, text) in &lines {
            wire.extend(encode_chunk(&header(*selector, text.len() as u32)));
            wire.extend(encode_chunk(text.as_bytes()));
        }

        for split in [1usize, 3, 7, 16, 64, wire.len()] {
            let mut decoder = ChunkDecoder::new();
            let mut demuxer = LogDemuxer::new();
            let mut seen = Vec::new();
            for piece in wire.chunks(split) {
                for frame in decoder.feed(piece) {
                    if let Demuxed::Line(line) = demuxer.demux(&frame).unwrap() {
                        seen.push((line.stream, line.text));
                    }
                }
            }

            let expected: Vec<_> = lines
                .iter()
                .map(|(selector, text)| {
                    let stream = if *selector == 1 {
                        StreamKind::Stdout
                    } else {
                        StreamKind::Stderr
                    };
                    (stream, text[TIMESTAMP_LEN + 1..].to_string())
                })
                .collect();
            assert_eq!(seen, expected, "split size {split}");
        }
    }
}
