//! RESP (Redis Serialization Protocol) framing.
//!
//! The harness is a protocol consumer: it encodes requests as arrays of bulk
//! strings and decodes whatever reply frames the server sends back.
//! RESP is a binary-safe protocol that uses length-prefixed strings.

use bytes::{Bytes, BytesMut};

/// Largest bulk string a server may announce (matches the server-side default
/// `proto-max-bulk-len`).
const MAX_BULK_LEN: i64 = 512 * 1024 * 1024;

/// Deepest array nesting accepted in a reply
const MAX_DEPTH: usize = 64;

/// RESP frame types
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Simple string: +OK\r\n
    Simple(String),
    /// Error: -ERR message\r\n
    Error(String),
    /// Integer: :1000\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n or $-1\r\n (null)
    Bulk(Option<Bytes>),
    /// Array: *2\r\n... or *-1\r\n (null)
    Array(Option<Vec<Frame>>),
}

/// Reply-side encoding, only needed by the in-process test server.
#[cfg(test)]
impl Frame {
    /// Encode a frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }

    /// Encode a frame into an existing buffer
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Frame::Simple(s) => write_line(buf, b'+', s.as_bytes()),
            Frame::Error(s) => write_line(buf, b'-', s.as_bytes()),
            Frame::Integer(n) => write_line(buf, b':', n.to_string().as_bytes()),
            Frame::Bulk(None) => buf.extend_from_slice(b"$-1\r\n"),
            Frame::Bulk(Some(data)) => write_bulk(buf, data),
            Frame::Array(None) => buf.extend_from_slice(b"*-1\r\n"),
            Frame::Array(Some(frames)) => {
                write_line(buf, b'*', frames.len().to_string().as_bytes());
                for frame in frames {
                    frame.encode_into(buf);
                }
            }
        }
    }
}

/// Encode a request: an array of bulk strings, command name first.
pub fn encode_request<A: AsRef<[u8]>>(name: &str, args: &[A], buf: &mut BytesMut) {
    write_line(buf, b'*', (args.len() + 1).to_string().as_bytes());
    write_bulk(buf, name.as_bytes());
    for arg in args {
        write_bulk(buf, arg.as_ref());
    }
}

fn write_line(buf: &mut BytesMut, prefix: u8, body: &[u8]) {
    buf.extend_from_slice(&[prefix]);
    buf.extend_from_slice(body);
    buf.extend_from_slice(b"\r\n");
}

fn write_bulk(buf: &mut BytesMut, data: &[u8]) {
    write_line(buf, b'$', data.len().to_string().as_bytes());
    buf.extend_from_slice(data);
    buf.extend_from_slice(b"\r\n");
}

/// Parse result
#[derive(Debug)]
pub enum ParseResult {
    /// Successfully parsed a frame with bytes consumed
    Complete(Frame, usize),
    /// Need more data
    Incomplete,
    /// The bytes can never form a valid frame
    Error(String),
}

/// Parse one RESP frame from the front of a buffer
///
/// Every call starts again at the front of `buffer`.
pub fn parse(buffer: &[u8]) -> ParseResult {
    parse_frame(buffer, 0)
}

fn parse_frame(buffer: &[u8], depth: usize) -> ParseResult {
    let Some(&tag) = buffer.first() else {
        return ParseResult::Incomplete;
    };

    match tag {
        b'+' => parse_line(buffer, |s| Ok(Frame::Simple(s.to_string()))),
        b'-' => parse_line(buffer, |s| Ok(Frame::Error(s.to_string()))),
        b':' => parse_line(buffer, |s| {
            s.parse::<i64>()
                .map(Frame::Integer)
                .map_err(|_| format!("Invalid integer: {s}"))
        }),
        b'$' => parse_bulk_string(buffer),
        b'*' => parse_array(buffer, depth),
        other => ParseResult::Error(format!("Unknown frame type: {:?}", other as char)),
    }
}

/// Find CRLF in buffer, return position of \r
fn find_crlf(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\r\n")
}

/// Parse a single-line frame (+, -, :), handing the UTF-8 body to `build`.
fn parse_line<F>(buffer: &[u8], build: F) -> ParseResult
where
    F: FnOnce(&str) -> Result<Frame, String>,
{
    let Some(end) = find_crlf(buffer) else {
        return ParseResult::Incomplete;
    };
    let body = match std::str::from_utf8(&buffer[1..end]) {
        Ok(s) => s,
        Err(_) => return ParseResult::Error("Invalid UTF-8 in line frame".to_string()),
    };
    match build(body) {
        Ok(frame) => ParseResult::Complete(frame, end + 2),
        Err(e) => ParseResult::Error(e),
    }
}

/// Parse the `<len>\r\n` header shared by bulk strings and arrays.
fn parse_length(buffer: &[u8], what: &str) -> Result<Option<(i64, usize)>, String> {
    let Some(len_end) = find_crlf(buffer) else {
        return Ok(None);
    };
    let len_str = std::str::from_utf8(&buffer[1..len_end])
        .map_err(|_| format!("Invalid UTF-8 in {what} length"))?;
    let len: i64 = len_str
        .parse()
        .map_err(|_| format!("Invalid {what} length: {len_str}"))?;
    if len < -1 {
        return Err(format!("Negative {what} length: {len}"));
    }
    Ok(Some((len, len_end + 2)))
}

/// Parse a bulk string: $5\r\nhello\r\n or $-1\r\n
fn parse_bulk_string(buffer: &[u8]) -> ParseResult {
    let (len, data_start) = match parse_length(buffer, "bulk string") {
        Ok(Some(header)) => header,
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    if len == -1 {
        return ParseResult::Complete(Frame::Bulk(None), data_start);
    }
    if len > MAX_BULK_LEN {
        return ParseResult::Error(format!("Bulk string too large: {len}"));
    }

    let data_end = data_start + len as usize;
    let total_len = data_end + 2;
    if buffer.len() < total_len {
        return ParseResult::Incomplete;
    }
    if &buffer[data_end..total_len] != b"\r\n" {
        return ParseResult::Error("Bulk string missing trailing CRLF".to_string());
    }

    let data = Bytes::copy_from_slice(&buffer[data_start..data_end]);
    ParseResult::Complete(Frame::Bulk(Some(data)), total_len)
}

/// Parse an array: *2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n or *-1\r\n
fn parse_array(buffer: &[u8], depth: usize) -> ParseResult {
    if depth >= MAX_DEPTH {
        return ParseResult::Error("Array nesting too deep".to_string());
    }
    let (len, mut offset) = match parse_length(buffer, "array") {
        Ok(Some(header)) => header,
        Ok(None) => return ParseResult::Incomplete,
        Err(e) => return ParseResult::Error(e),
    };

    if len == -1 {
        return ParseResult::Complete(Frame::Array(None), offset);
    }

    // Element count is attacker-controlled; don't trust it for preallocation.
    let mut frames = Vec::with_capacity((len as usize).min(1024));
    for _ in 0..len {
        match parse_frame(&buffer[offset..], depth + 1) {
            ParseResult::Complete(frame, consumed) => {
                frames.push(frame);
                offset += consumed;
            }
            other => return other,
        }
    }

    ParseResult::Complete(Frame::Array(Some(frames)), offset)
}
