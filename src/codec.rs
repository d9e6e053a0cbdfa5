//! IMAP4rev1 wire codec (spec §4.2): tag generation, command writing, and a
//! byte-level scanner that alternates line mode and literal mode so embedded
//! binary literals (`{n}\r\n<n bytes>`) never get misread as text lines.

use std::pin::Pin;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{ProtocolError, TransportError};
use crate::transport::{Duplex, with_io_timeout};

pub struct TagGenerator {
    counter: u32,
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl TagGenerator {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    pub fn next_tag(&mut self) -> String {
        self.counter += 1;
        format!("A{:04}", self.counter)
    }
}

/// Quote a string for use as an IMAP quoted astring, escaping backslashes
/// and double quotes.
pub fn quote(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// A fully read logical line of a response: raw bytes with any embedded
/// literal spans recorded so callers can slice out literal content without
/// reparsing `{n}` markers that might coincidentally appear inside literal
/// data.
#[derive(Debug, Clone, Default)]
pub struct RawLine {
    pub bytes: Vec<u8>,
    pub literals: Vec<(usize, usize)>,
}

impl RawLine {
    pub fn as_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }

    pub fn literal_bytes(&self, index: usize) -> Option<&[u8]> {
        let (offset, len) = *self.literals.get(index)?;
        self.bytes.get(offset..offset + len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    No,
    Bad,
}

pub enum ParsedLine {
    Untagged(RawLine),
    Continuation(RawLine),
    Tagged { tag: String, status: Status, rest: RawLine },
}

fn try_literal_marker(line: &[u8]) -> Option<usize> {
    if line.last() != Some(&b'}') {
        return None;
    }
    let open = line.iter().rposition(|&b| b == b'{')?;
    let digits = &line[open + 1..line.len() - 1];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse::<usize>().ok()
}

enum Mode {
    Line,
    Literal(usize),
}

/// Drives the byte-level scanner over a `Duplex` stream, producing one
/// `RawLine` per call to `read_line`. Buffer state persists across calls so
/// a logical line (or literal) split across multiple socket reads is
/// reassembled correctly.
pub struct Codec {
    stream: Pin<Box<dyn Duplex>>,
    cancel: CancellationToken,
    read_buf: Vec<u8>,
    line_buf: Vec<u8>,
    literal_spans: Vec<(usize, usize)>,
    mode: Mode,
}

impl Codec {
    pub fn new(stream: Pin<Box<dyn Duplex>>, cancel: CancellationToken) -> Self {
        Self {
            stream,
            cancel,
            read_buf: Vec::new(),
            line_buf: Vec::new(),
            literal_spans: Vec::new(),
            mode: Mode::Line,
        }
    }

    pub async fn write_command(&mut self, tag: &str, command: &str) -> Result<(), TransportError> {
        let bytes = format!("{tag} {command}\r\n").into_bytes();
        with_io_timeout(&self.cancel, async { self.stream.write_all(&bytes).await }).await
    }

    pub async fn write_raw(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        with_io_timeout(&self.cancel, async { self.stream.write_all(bytes).await }).await
    }

    /// Read one complete logical line, blocking on the socket as needed.
    pub async fn read_line(&mut self) -> Result<RawLine, ProtocolError> {
        loop {
            if let Some(line) = self.try_extract()? {
                return Ok(line);
            }
            let mut chunk = [0u8; 8192];
            let n = with_io_timeout(&self.cancel, async { self.stream.read(&mut chunk).await })
                .await
                .map_err(|e| ProtocolError::UnexpectedBytes(e.to_string()))?;
            if n == 0 {
                return Err(ProtocolError::UnexpectedBytes(
                    "connection closed mid-response".to_string(),
                ));
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read and classify one line as untagged, continuation, or (if it
    /// matches `tag`) tagged completion.
    pub async fn read_parsed_line(&mut self, tag: &str) -> Result<ParsedLine, ProtocolError> {
        let line = self.read_line().await?;
        classify(line, tag)
    }

    /// Read lines until the tagged completion for `tag` arrives, returning
    /// all untagged lines collected along the way plus the final status.
    pub async fn read_response(&mut self, tag: &str) -> Result<(Status, RawLine, Vec<RawLine>), ProtocolError> {
        let mut untagged = Vec::new();
        loop {
            match self.read_parsed_line(tag).await? {
                ParsedLine::Untagged(line) => untagged.push(line),
                ParsedLine::Continuation(_) => continue,
                ParsedLine::Tagged { status, rest, .. } => return Ok((status, rest, untagged)),
            }
        }
    }

    fn try_extract(&mut self) -> Result<Option<RawLine>, ProtocolError> {
        loop {
            match self.mode {
                Mode::Literal(remaining) => {
                    if remaining == 0 {
                        self.mode = Mode::Line;
                        continue;
                    }
                    if self.read_buf.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(self.read_buf.len());
                    self.line_buf.extend(self.read_buf.drain(0..take));
                    let left = remaining - take;
                    if left == 0 {
                        self.mode = Mode::Line;
                    } else {
                        self.mode = Mode::Literal(left);
                        return Ok(None);
                    }
                }
                Mode::Line => {
                    let Some(idx) = find_crlf(&self.read_buf) else {
                        // Keep a trailing lone CR unconsumed so a CRLF split
                        // across reads is still detected next time.
                        let keep_last = matches!(self.read_buf.last(), Some(b'\r'));
                        let move_len = if keep_last {
                            self.read_buf.len().saturating_sub(1)
                        } else {
                            self.read_buf.len()
                        };
                        self.line_buf.extend(self.read_buf.drain(0..move_len));
                        return Ok(None);
                    };
                    self.line_buf.extend(self.read_buf.drain(0..idx));
                    self.read_buf.drain(0..2); // consume the CRLF itself

                    if let Some(n) = try_literal_marker(&self.line_buf) {
                        let span_start = self.line_buf.len();
                        self.literal_spans.push((span_start, n));
                        self.mode = Mode::Literal(n);
                        continue;
                    }

                    let line = RawLine {
                        bytes: std::mem::take(&mut self.line_buf),
                        literals: std::mem::take(&mut self.literal_spans),
                    };
                    return Ok(Some(line));
                }
            }
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn classify(line: RawLine, tag: &str) -> Result<ParsedLine, ProtocolError> {
    let text = line.as_text();
    if let Some(rest) = text.strip_prefix("* ") {
        let _ = rest;
        return Ok(ParsedLine::Untagged(line));
    }
    if text.starts_with('+') {
        return Ok(ParsedLine::Continuation(line));
    }
    let mut parts = text.splitn(3, ' ');
    let found_tag = parts.next().unwrap_or("");
    if found_tag != tag {
        // Not our tag and not untagged/continuation: treat conservatively
        // as untagged so a stray response doesn't abort the read loop.
        return Ok(ParsedLine::Untagged(line));
    }
    let status_word = parts.next().unwrap_or("");
    let status = match status_word.to_ascii_uppercase().as_str() {
        "OK" => Status::Ok,
        "NO" => Status::No,
        "BAD" => Status::Bad,
        _ => return Err(ProtocolError::UnknownResponse(text.into_owned())),
    };
    Ok(ParsedLine::Tagged {
        tag: found_tag.to_string(),
        status,
        rest: line,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn feed_and_read(input: &[u8]) -> RawLine {
        let (mut writer, reader) = tokio::io::duplex(input.len() + 16);
        writer.write_all(input).await.unwrap();
        drop(writer);
        let mut codec = Codec::new(Box::pin(reader), CancellationToken::new());
        codec.read_line().await.unwrap()
    }

    #[tokio::test]
    async fn reads_simple_line() {
        let line = feed_and_read(b"* 1 EXISTS\r\n").await;
        assert_eq!(line.as_text(), "* 1 EXISTS");
        assert!(line.literals.is_empty());
    }

    #[tokio::test]
    async fn reads_line_with_embedded_literal() {
        let mut input = Vec::new();
        input.extend_from_slice(b"* 1 FETCH (BODY[] {5}\r\n");
        input.extend_from_slice(b"hello");
        input.extend_from_slice(b")\r\n");
        let line = feed_and_read(&input).await;
        assert_eq!(line.literal_bytes(0).unwrap(), b"hello");
        assert!(line.as_text().ends_with(")"));
    }

    #[tokio::test]
    async fn literal_containing_crlf_is_not_misparsed() {
        let mut input = Vec::new();
        input.extend_from_slice(b"* 1 FETCH (BODY[] {6}\r\n");
        input.extend_from_slice(b"a\r\nb}");
        input.extend_from_slice(b")\r\n");
        let line = feed_and_read(&input).await;
        assert_eq!(line.literal_bytes(0).unwrap(), b"a\r\nb}");
    }

    #[tokio::test]
    async fn zero_length_literal() {
        let mut input = Vec::new();
        input.extend_from_slice(b"* 1 FETCH (BODY[] {0}\r\n");
        input.extend_from_slice(b")\r\n");
        let line = feed_and_read(&input).await;
        assert_eq!(line.literal_bytes(0).unwrap(), b"");
    }

    #[tokio::test]
    async fn classifies_tagged_completion() {
        let (mut writer, reader) = tokio::io::duplex(64);
        writer.write_all(b"A0001 OK done\r\n").await.unwrap();
        drop(writer);
        let mut codec = Codec::new(Box::pin(reader), CancellationToken::new());
        match codec.read_parsed_line("A0001").await.unwrap() {
            ParsedLine::Tagged { status, .. } => assert_eq!(status, Status::Ok),
            _ => panic!("expected tagged line"),
        }
    }
}
