//! `data: <json>` line framing used by the LLM service's streaming endpoints.

use bytes::{Buf, BytesMut};
use futures_util::stream::{self, BoxStream, Stream, StreamExt};
use log::warn;
use serde_json::Value;
use std::fmt::Display;
use std::io;
use tokio_util::codec::Decoder;

/// Prefix that marks a payload line.
pub const DATA_PREFIX: &str = "data: ";

/// Payload content that ends the stream normally.
pub const DONE_SENTINEL: &str = "[DONE]";

/// One item of a streaming call.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A parsed payload frame, passed through verbatim.
    Frame(Value),
    /// The transport failed; always the last item of the stream.
    Error(String),
}

/// Lazy, forward-only sequence of events from a streaming call.
pub type EventStream = BoxStream<'static, StreamEvent>;

/// What a single text line contributes to the stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Line {
    Frame(Value),
    Done,
    Skip,
}

/// Interprets one line of the response body.
///
/// Non-`data: ` lines and payloads that are not valid JSON are skipped.
pub fn parse_line(line: &str) -> Line {
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
        return Line::Skip;
    };
    if payload.trim() == DONE_SENTINEL {
        return Line::Done;
    }
    match serde_json::from_str(payload) {
        Ok(value) => Line::Frame(value),
        Err(_) => Line::Skip,
    }
}

/// Turns a stream of body lines into stream events.
///
/// Ends at the sentinel, at the end of the body, or after emitting a single
/// [`StreamEvent::Error`] for the first line error.
pub fn frames<S, E>(lines: S) -> impl Stream<Item = StreamEvent> + Send
where
    S: Stream<Item = Result<String, E>> + Unpin + Send,
    E: Display + Send,
{
    stream::unfold(Some(lines), |state| async move {
        let mut lines = state?;
        loop {
            match lines.next().await? {
                Err(e) => return Some((StreamEvent::Error(e.to_string()), None)),
                Ok(line) => match parse_line(&line) {
                    Line::Frame(value) => return Some((StreamEvent::Frame(value), Some(lines))),
                    Line::Done => return None,
                    Line::Skip => continue,
                },
            }
        }
    })
}

/// A stream consisting of one error event.
pub fn error_stream(message: impl Into<String>) -> EventStream {
    stream::iter([StreamEvent::Error(message.into())]).boxed()
}

/// Longest body line kept, in bytes.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Splits a response body into lines without ever failing on content.
///
/// Invalid UTF-8 is decoded lossily and lines longer than the limit are
/// dropped, so a malformed frame is skipped like any other unparsable
/// payload. Only I/O errors from the body surface as decode errors.
#[derive(Debug, Clone)]
pub struct BodyLineCodec {
    max_length: usize,
    next_index: usize,
    discarding: bool,
}

impl BodyLineCodec {
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_LENGTH)
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
            discarding: false,
        }
    }
}

impl Default for BodyLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}

impl Decoder for BodyLineCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let read_to = buf.len().min(self.max_length.saturating_add(1));
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| self.next_index + offset);

            match (self.discarding, newline) {
                (true, Some(end)) => {
                    buf.advance(end + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return Ok(None);
                    }
                }
                (false, Some(end)) => {
                    self.next_index = 0;
                    let line = buf.split_to(end + 1);
                    return Ok(Some(decode_line(&line[..end])));
                }
                (false, None) if buf.len() > self.max_length => {
                    warn!("Dropping stream line longer than {} bytes", self.max_length);
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, io::Error> {
        if let Some(line) = self.decode(buf)? {
            return Ok(Some(line));
        }
        self.next_index = 0;
        if self.discarding {
            self.discarding = false;
            buf.clear();
            return Ok(None);
        }
        if buf.is_empty() {
            return Ok(None);
        }
        let line = buf.split_to(buf.len());
        Ok(Some(decode_line(&line)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lines(items: Vec<Result<&str, &str>>) -> impl Stream<Item = Result<String, String>> + Unpin {
        stream::iter(
            items
                .into_iter()
                .map(|r| r.map(str::to_string).map_err(str::to_string))
                .collect::<Vec<_>>(),
        )
    }

    #[test]
    fn test_parse_line_frame() {
        assert_eq!(parse_line(r#"data: {"a":1}"#), Line::Frame(json!({"a": 1})));
    }

    #[test]
    fn test_parse_line_sentinel() {
        assert_eq!(parse_line("data: [DONE]"), Line::Done);
        assert_eq!(parse_line("data: [DONE]  "), Line::Done);
    }

    #[test]
    fn test_parse_line_skips_invalid_json() {
        assert_eq!(parse_line("data: not-json"), Line::Skip);
        assert_eq!(parse_line("data: "), Line::Skip);
    }

    #[test]
    fn test_parse_line_ignores_other_lines() {
        assert_eq!(parse_line(""), Line::Skip);
        assert_eq!(parse_line(": keepalive"), Line::Skip);
        assert_eq!(parse_line("event: message"), Line::Skip);
        // The prefix includes the space.
        assert_eq!(parse_line(r#"data:{"a":1}"#), Line::Skip);
    }

    #[tokio::test]
    async fn test_frames_mixed_lines() {
        let events: Vec<_> = frames(lines(vec![
            Ok("event: message"),
            Ok(r#"data: {"a":1}"#),
            Ok("data: not-json"),
            Ok(""),
            Ok(r#"data: {"b":2}"#),
        ]))
        .collect()
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Frame(json!({"a": 1})),
                StreamEvent::Frame(json!({"b": 2})),
            ]
        );
    }

    #[tokio::test]
    async fn test_frames_stop_at_sentinel() {
        let events: Vec<_> = frames(lines(vec![
            Ok(r#"data: {"a":1}"#),
            Ok("data: [DONE]"),
            Ok(r#"data: {"never":true}"#),
        ]))
        .collect()
        .await;

        assert_eq!(events, vec![StreamEvent::Frame(json!({"a": 1}))]);
    }

    #[tokio::test]
    async fn test_frames_transport_error_after_two_frames() {
        let events: Vec<_> = frames(lines(vec![
            Ok(r#"data: {"n":1}"#),
            Ok(r#"data: {"n":2}"#),
            Err("connection reset"),
            Ok(r#"data: {"n":3}"#),
        ]))
        .collect()
        .await;

        assert_eq!(
            events,
            vec![
                StreamEvent::Frame(json!({"n": 1})),
                StreamEvent::Frame(json!({"n": 2})),
                StreamEvent::Error("connection reset".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_frames_empty_body() {
        let events: Vec<_> = frames(lines(vec![])).collect().await;
        assert!(events.is_empty());
    }

    fn decode_all(codec: &mut BodyLineCodec, input: &[u8]) -> Vec<String> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(line) = codec.decode(&mut buf).unwrap() {
            out.push(line);
        }
        while let Some(line) = codec.decode_eof(&mut buf).unwrap() {
            out.push(line);
        }
        out
    }

    #[test]
    fn test_body_lines_split_on_newlines() {
        let mut codec = BodyLineCodec::new();
        let lines = decode_all(&mut codec, b"data: {\"a\":1}\r\n\ndata: [DONE]");
        assert_eq!(lines, vec![r#"data: {"a":1}"#, "", "data: [DONE]"]);
    }

    #[test]
    fn test_body_lines_decode_invalid_utf8_lossily() {
        let mut codec = BodyLineCodec::new();
        let lines = decode_all(&mut codec, b"data: {\"n\":1}\ndata: \xff\xfe garbage\ndata: {\"n\":2}\n");
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "data: \u{fffd}\u{fffd} garbage");
        assert_eq!(parse_line(&lines[1]), Line::Skip);
        assert_eq!(parse_line(&lines[2]), Line::Frame(json!({"n": 2})));
    }

    #[test]
    fn test_body_lines_drop_overlong_line() {
        let mut codec = BodyLineCodec::with_max_length(16);
        let mut buf = BytesMut::from(&b"data: {\"a\":1}\ndata: 0123456789abcdef"[..]);

        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(r#"data: {"a":1}"#));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"0123456789\ndata: {\"b\":2}\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some(r#"data: {"b":2}"#));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_body_lines_overlong_tail_at_eof() {
        let mut codec = BodyLineCodec::with_max_length(8);
        let lines = decode_all(&mut codec, b"ok\n0123456789abcdef");
        assert_eq!(lines, vec!["ok"]);
    }

    #[tokio::test]
    async fn test_error_stream() {
        let events: Vec<_> = error_stream("refused").collect().await;
        assert_eq!(events, vec![StreamEvent::Error("refused".into())]);
    }
}
