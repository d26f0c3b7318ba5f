//! Request head parsing and header field lookup. The head is parsed once
//! for the request line and framing; the raw header bytes are retained
//! per transaction so multi-valued lookups see the exact on-wire fields.

use crate::error::{Error, Result};
use crate::http::ContentLength;
use crate::io::buffer::Buffer;
use crate::io::sink::Sink;
use crate::io::source::Source;

/// Total cap on the request line plus all header fields.
pub(crate) const MAX_HEAD_SIZE: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;

pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub content_length: ContentLength,
    pub keep_alive: bool,
    /// Raw header field lines, each with its CRLF.
    pub fields: Buffer,
}

/// Locates the end of a request head, returning the length including the
/// terminating blank line.
pub(crate) fn find_head(data: &[u8]) -> Option<usize> {
    data.windows(4)
        .position(|window| b"\r\n\r\n" == window)
        .map(|position| position + 4)
}

/// Parses a complete request head (as delimited by [`find_head`]).
pub(crate) fn parse_head(raw: &[u8]) -> Result<RequestHead> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    match request
        .parse(raw)
        .map_err(|err| Error::parse(err.to_string()))?
    {
        httparse::Status::Complete(_) => (),
        httparse::Status::Partial => return Err(Error::parse("incomplete request head")),
    }

    let method = request
        .method
        .ok_or_else(|| Error::parse("missing method"))?
        .to_string();
    let target = request
        .path
        .ok_or_else(|| Error::parse("missing target"))?
        .to_string();
    let version = match request.version {
        Some(0) => "HTTP/1.0".to_string(),
        Some(1) => "HTTP/1.1".to_string(),
        _ => return Err(Error::parse("unsupported HTTP version")),
    };

    let mut content_length = ContentLength::Length(0);
    for header in request.headers.iter() {
        if header.name.eq_ignore_ascii_case("content-length") {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| Error::parse("malformed Content-Length"))?;
            let length: usize = value
                .trim()
                .parse()
                .map_err(|_| Error::parse("malformed Content-Length"))?;
            content_length = ContentLength::Length(length);
        } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
            let value = std::str::from_utf8(header.value).unwrap_or("");
            if value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("chunked"))
            {
                content_length = ContentLength::Chunked;
            }
        }
    }

    // Retain the header lines verbatim for per-field lookups.
    let line_end = find_crlf(raw).ok_or_else(|| Error::parse("missing request line"))?;
    let mut fields = Buffer::new();
    fields.append(&raw[line_end + 2..raw.len() - 2]);

    let keep_alive = match version.as_str() {
        "HTTP/1.0" => field_contains(fields.as_slice(), "Connection", "keep-alive", ","),
        _ => !field_contains(fields.as_slice(), "Connection", "close", ","),
    };

    Ok(RequestHead {
        method,
        target,
        version,
        content_length,
        keep_alive,
        fields,
    })
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|window| b"\r\n" == window)
}

/// The `index`-th occurrence of field `name`, trimmed.
pub(crate) fn field_value(fields: &[u8], name: &str, index: usize) -> Option<String> {
    let mut remaining = index;

    for line in fields.split(|&byte| b'\n' == byte) {
        let line = strip_cr(line);
        let (field_name, field_value) = match split_field(line) {
            Some(field) => field,
            None => continue,
        };

        if field_name.trim().eq_ignore_ascii_case(name) {
            if 0 == remaining {
                return Some(field_value.trim().to_string());
            }
            remaining -= 1;
        }
    }
    None
}

/// Whether `token` appears in any occurrence of the `delim`-separated
/// field `name`, compared case-insensitively.
pub(crate) fn field_contains(fields: &[u8], name: &str, token: &str, delim: &str) -> bool {
    let mut index = 0;
    while let Some(value) = field_value(fields, name, index) {
        let matched = value
            .split(|c| delim.contains(c))
            .any(|part| part.trim().eq_ignore_ascii_case(token));
        if matched {
            return true;
        }
        index += 1;
    }
    false
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

fn split_field(line: &[u8]) -> Option<(&str, &str)> {
    let colon = line.iter().position(|&byte| b':' == byte)?;
    let name = std::str::from_utf8(&line[..colon]).ok()?;
    let value = std::str::from_utf8(&line[colon + 1..]).ok()?;
    Some((name, value))
}

/// Writes one chunk of a chunked response body; empty data terminates
/// the body.
pub(crate) fn encode_chunk(out: &mut Buffer, data: &[u8]) {
    if data.is_empty() {
        out.append(b"0\r\n\r\n");
        return;
    }

    out.append(format!("{:x}\r\n", data.len()).as_bytes());
    out.append(data);
    out.append(b"\r\n");
}

/// Incremental decoder for chunked request bodies. Feeds decoded body
/// bytes into a sink, consuming the staged wire bytes as they become
/// available.
pub(crate) struct ChunkDecoder {
    state: ChunkState,
}

enum ChunkState {
    Size,
    Data { remaining: usize },
    DataCrlf,
    Trailer,
    Done,
}

impl ChunkDecoder {
    pub fn new() -> ChunkDecoder {
        ChunkDecoder {
            state: ChunkState::Size,
        }
    }

    pub fn done(&self) -> bool {
        matches!(self.state, ChunkState::Done)
    }

    /// Decodes as much as possible, writing at most `limit` body bytes
    /// into `sink`. Returns the number of body bytes written.
    pub fn decode(&mut self, staged: &mut Buffer, sink: &mut dyn Sink, limit: usize) -> Result<usize> {
        let mut written = 0;

        loop {
            match self.state {
                ChunkState::Size => {
                    let line_end = match find_crlf(staged.unread()) {
                        Some(position) => position,
                        None => {
                            if staged.unread().len() > 18 {
                                return Err(Error::parse("oversize chunk size line"));
                            }
                            return Ok(written);
                        }
                    };

                    let line = staged.consume(line_end + 2);
                    let line = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| Error::parse("malformed chunk size"))?;
                    let digits = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(digits, 16)
                        .map_err(|_| Error::parse("malformed chunk size"))?;

                    self.state = match size {
                        0 => ChunkState::Trailer,
                        size => ChunkState::Data { remaining: size },
                    };
                }
                ChunkState::Data { remaining } => {
                    if written >= limit {
                        return Ok(written);
                    }

                    let count = remaining
                        .min(staged.available())
                        .min(limit - written);
                    if 0 == count {
                        return Ok(written);
                    }

                    let data = staged.consume(count);
                    sink.produce_from(data)?;
                    written += count;

                    self.state = match remaining - count {
                        0 => ChunkState::DataCrlf,
                        remaining => ChunkState::Data { remaining },
                    };
                }
                ChunkState::DataCrlf => {
                    if staged.available() < 2 {
                        return Ok(written);
                    }
                    if b"\r\n" != staged.consume(2) {
                        return Err(Error::parse("missing chunk terminator"));
                    }
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let line_end = match find_crlf(staged.unread()) {
                        Some(position) => position,
                        None => return Ok(written),
                    };

                    let empty = 0 == line_end;
                    staged.consume(line_end + 2);
                    if empty {
                        self.state = ChunkState::Done;
                    }
                }
                ChunkState::Done => return Ok(written),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEAD: &[u8] = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: text/html\r\nAccept: text/plain\r\nConnection: keep-alive, Upgrade\r\n\r\n";

    #[test]
    fn test_find_head() {
        assert_eq!(find_head(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_head(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_head(HEAD), Some(HEAD.len()));
    }

    #[test]
    fn test_parse_request_line() {
        let head = parse_head(HEAD).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/index.html");
        assert_eq!(head.version, "HTTP/1.1");
        assert_eq!(head.content_length, ContentLength::Length(0));
        assert!(head.keep_alive);
    }

    #[test]
    fn test_parse_content_length() {
        let head =
            parse_head(b"POST / HTTP/1.1\r\nContent-Length: 42\r\n\r\n").unwrap();
        assert_eq!(head.content_length, ContentLength::Length(42));
    }

    #[test]
    fn test_parse_chunked() {
        let head =
            parse_head(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n").unwrap();
        assert_eq!(head.content_length, ContentLength::Chunked);
    }

    #[test]
    fn test_parse_connection_close() {
        let head = parse_head(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n").unwrap();
        assert!(!head.keep_alive);

        let head = parse_head(b"GET / HTTP/1.0\r\n\r\n").unwrap();
        assert!(!head.keep_alive);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_head(b"NOT A REQUEST\r\n\r\n").is_err());
        assert!(parse_head(b"GET / HTTP/2.2\r\n\r\n").is_err());
    }

    #[test]
    fn test_field_value_multi() {
        let head = parse_head(HEAD).unwrap();
        let fields = head.fields.as_slice();

        assert_eq!(field_value(fields, "Host", 0).unwrap(), "example.com");
        assert_eq!(field_value(fields, "accept", 0).unwrap(), "text/html");
        assert_eq!(field_value(fields, "accept", 1).unwrap(), "text/plain");
        assert_eq!(field_value(fields, "accept", 2), None);
        assert_eq!(field_value(fields, "missing", 0), None);
    }

    #[test]
    fn test_field_contains_token() {
        let head = parse_head(HEAD).unwrap();
        let fields = head.fields.as_slice();

        assert!(field_contains(fields, "Connection", "upgrade", ","));
        assert!(field_contains(fields, "Connection", "keep-alive", ","));
        assert!(!field_contains(fields, "Connection", "close", ","));
    }

    #[test]
    fn test_encode_chunk() {
        let mut out = Buffer::new();
        encode_chunk(&mut out, b"Hello World");
        assert_eq!(out.as_slice(), b"b\r\nHello World\r\n");

        let mut out = Buffer::new();
        encode_chunk(&mut out, b"");
        assert_eq!(out.as_slice(), b"0\r\n\r\n");
    }

    #[test]
    fn test_chunk_decoder_whole_body() {
        let mut staged = Buffer::from(&b"5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n"[..]);
        let mut sink = Buffer::new();
        let mut decoder = ChunkDecoder::new();

        let written = decoder.decode(&mut staged, &mut sink, usize::MAX).unwrap();
        assert_eq!(written, 11);
        assert!(decoder.done());
        assert_eq!(sink.as_slice(), b"Hello World");
    }

    #[test]
    fn test_chunk_decoder_incremental() {
        let wire = b"5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n";
        let mut staged = Buffer::new();
        let mut sink = Buffer::new();
        let mut decoder = ChunkDecoder::new();

        for &byte in wire.iter() {
            staged.append(&[byte]);
            decoder.decode(&mut staged, &mut sink, usize::MAX).unwrap();
            staged.compact();
        }

        assert!(decoder.done());
        assert_eq!(sink.as_slice(), b"Hello World");
    }

    #[test]
    fn test_chunk_decoder_respects_limit() {
        let mut staged = Buffer::from(&b"b\r\nHello World\r\n0\r\n\r\n"[..]);
        let mut sink = Buffer::new();
        let mut decoder = ChunkDecoder::new();

        assert_eq!(decoder.decode(&mut staged, &mut sink, 5).unwrap(), 5);
        assert_eq!(sink.as_slice(), b"Hello");
        assert!(!decoder.done());

        assert_eq!(decoder.decode(&mut staged, &mut sink, usize::MAX).unwrap(), 6);
        assert!(decoder.done());
        assert_eq!(sink.as_slice(), b"Hello World");
    }

    #[test]
    fn test_chunk_decoder_rejects_bad_size() {
        let mut staged = Buffer::from(&b"zz\r\nHello\r\n"[..]);
        let mut sink = Buffer::new();
        let mut decoder = ChunkDecoder::new();

        assert!(decoder.decode(&mut staged, &mut sink, usize::MAX).is_err());
    }
}
