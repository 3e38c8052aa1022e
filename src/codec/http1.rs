//! HTTP/1.1 over a session.
//!
//! Requests are [`http::Request`]s with a [`Bytes`] body or no body at all.
//! Responses are read with a [`ResponseParser`], which understands the three
//! ways an HTTP/1.1 response body can be delimited: `content-length`,
//! `transfer-encoding: chunked`, and connection close.

use std::fmt::Write as _;

use bytes::buf::Chain;
use bytes::{Buf as _, BufMut as _, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};

use super::{Encode, Parse};
use crate::BoxError;

/// Largest response head accepted, in bytes.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Largest chunk-size or trailer line accepted, in bytes.
const MAX_LINE_SIZE: usize = 4 * 1024;

/// Errors from encoding requests or parsing responses.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Http1Error {
    /// Only HTTP/1.0 and HTTP/1.1 can be written.
    #[error("unsupported HTTP version {0:?}")]
    UnsupportedVersion(Version),

    /// The response head did not end within [`MAX_HEAD_SIZE`] bytes.
    #[error("response head exceeds {MAX_HEAD_SIZE} bytes")]
    HeadTooLarge,

    /// The status line was malformed.
    #[error("invalid status line")]
    StatusLine,

    /// A header line was malformed.
    #[error("invalid header line")]
    Header,

    /// `content-length` was missing a value, repeated with different values,
    /// or not a number.
    #[error("invalid content-length")]
    ContentLength,

    /// The chunked body was malformed.
    #[error("invalid chunk encoding")]
    Chunk,

    /// The connection closed before the response was complete.
    #[error("connection closed before the response was complete")]
    Incomplete,
}

impl Encode for http::Request<Bytes> {
    type Buf = Chain<Bytes, Bytes>;

    fn encode(&self) -> Result<Self::Buf, BoxError> {
        let head = encode_head(self, Some(self.body().len()))?;
        Ok(head.chain(self.body().clone()))
    }
}

impl Encode for http::Request<()> {
    type Buf = Bytes;

    fn encode(&self) -> Result<Self::Buf, BoxError> {
        encode_head(self, None)
    }
}

/// Serialize the request line and headers.
///
/// `host` is filled in from the URI when absent. A body length is written as
/// `content-length` unless the caller set a length or a transfer coding.
fn encode_head<B>(request: &http::Request<B>, body: Option<usize>) -> Result<Bytes, BoxError> {
    let version = match request.version() {
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_10 => "HTTP/1.0",
        other => return Err(Http1Error::UnsupportedVersion(other).into()),
    };

    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut head = String::with_capacity(128);
    let _ = write!(head, "{} {} {}\r\n", request.method(), target, version);
    let mut buf = BytesMut::from(head.as_bytes());

    let headers = request.headers();
    if !headers.contains_key(HOST) {
        if let Some(authority) = request.uri().authority() {
            put_header(&mut buf, HOST.as_str(), authority.as_str().as_bytes());
        }
    }

    for (name, value) in headers {
        put_header(&mut buf, name.as_str(), value.as_bytes());
    }

    let framed = headers.contains_key(CONTENT_LENGTH) || headers.contains_key(TRANSFER_ENCODING);
    if !framed {
        match body {
            Some(len) if len > 0 || expects_body(request.method()) => {
                put_header(&mut buf, CONTENT_LENGTH.as_str(), len.to_string().as_bytes());
            }
            _ => {}
        }
    }

    buf.put_slice(b"\r\n");
    Ok(buf.freeze())
}

fn put_header(buf: &mut BytesMut, name: &str, value: &[u8]) {
    buf.reserve(name.len() + value.len() + 4);
    buf.put_slice(name.as_bytes());
    buf.put_slice(b": ");
    buf.put_slice(value);
    buf.put_slice(b"\r\n");
}

fn expects_body(method: &Method) -> bool {
    *method == Method::POST || *method == Method::PUT || *method == Method::PATCH
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunked {
    Size,
    Data(usize),
    DataEnd,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    Length(usize),
    Chunked(Chunked),
    UntilClose,
    Done,
}

#[derive(Debug)]
struct Head {
    version: Version,
    status: StatusCode,
    headers: HeaderMap,
}

/// Incremental parser for one HTTP/1.1 response.
///
/// Interim `1xx` responses other than `101 Switching Protocols` are skipped.
#[derive(Debug)]
pub struct ResponseParser {
    state: State,
    head_request: bool,
    head: Option<Head>,
    body: BytesMut,
    /// Bytes at the front of the buffer already searched for the end of the
    /// head.
    scanned: usize,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseParser {
    /// A parser for the response to any request other than `HEAD`.
    pub fn new() -> Self {
        Self {
            state: State::Head,
            head_request: false,
            head: None,
            body: BytesMut::new(),
            scanned: 0,
        }
    }

    /// A parser for the response to a `HEAD` request, which never has a body
    /// regardless of its framing headers.
    pub fn for_head() -> Self {
        Self {
            head_request: true,
            ..Self::new()
        }
    }

    /// The response status, once the head has been parsed.
    pub fn status(&self) -> Option<StatusCode> {
        self.head.as_ref().map(|head| head.status)
    }

    /// The response headers, once the head has been parsed.
    pub fn headers(&self) -> Option<&HeaderMap> {
        self.head.as_ref().map(|head| &head.headers)
    }

    /// Body bytes received so far.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Take the completed response.
    pub fn into_response(self) -> Result<http::Response<Bytes>, Http1Error> {
        match (self.state, self.head) {
            (State::Done, Some(head)) => {
                let mut response = http::Response::new(self.body.freeze());
                *response.status_mut() = head.status;
                *response.version_mut() = head.version;
                *response.headers_mut() = head.headers;
                Ok(response)
            }
            _ => Err(Http1Error::Incomplete),
        }
    }

    fn parse_head(&mut self, buf: &mut BytesMut) -> Result<bool, Http1Error> {
        // The terminator may straddle the previous search boundary.
        let from = self.scanned.min(buf.len()).saturating_sub(3);
        let Some(end) = find_header_end(&buf[from..]).map(|at| from + at) else {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(Http1Error::HeadTooLarge);
            }
            self.scanned = buf.len();
            return Ok(false);
        };
        if end > MAX_HEAD_SIZE {
            return Err(Http1Error::HeadTooLarge);
        }

        let raw = buf.split_to(end + 4);
        self.scanned = 0;
        let head = parse_response_head(&raw[..end])?;
        tracing::trace!(status = %head.status, "response head parsed");

        let status = head.status;
        if status.is_informational() && status != StatusCode::SWITCHING_PROTOCOLS {
            // Interim response; the final one follows.
            return Ok(true);
        }

        self.state = self.body_state(&head)?;
        self.head = Some(head);
        Ok(true)
    }

    fn body_state(&self, head: &Head) -> Result<State, Http1Error> {
        let status = head.status;
        if self.head_request
            || status.is_informational()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::NOT_MODIFIED
        {
            return Ok(State::Done);
        }

        if let Some(coding) = head.headers.get_all(TRANSFER_ENCODING).iter().last() {
            let chunked = coding
                .to_str()
                .ok()
                .and_then(|value| value.rsplit(',').next())
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
            if chunked {
                return Ok(State::Chunked(Chunked::Size));
            }
            return Ok(State::UntilClose);
        }

        match content_length(&head.headers)? {
            Some(0) => Ok(State::Done),
            Some(len) => Ok(State::Length(len)),
            None => Ok(State::UntilClose),
        }
    }

    fn parse_chunked(&mut self, mut chunk: Chunked, buf: &mut BytesMut) -> Result<(), Http1Error> {
        loop {
            match chunk {
                Chunked::Size => {
                    let Some(line) = take_line(buf)? else { break };
                    let size = parse_chunk_size(&line)?;
                    chunk = if size == 0 {
                        Chunked::Trailer
                    } else {
                        Chunked::Data(size)
                    };
                }
                Chunked::Data(remaining) => {
                    if buf.is_empty() {
                        break;
                    }
                    let n = remaining.min(buf.len());
                    self.body.extend_from_slice(&buf[..n]);
                    buf.advance(n);
                    chunk = if n == remaining {
                        Chunked::DataEnd
                    } else {
                        Chunked::Data(remaining - n)
                    };
                }
                Chunked::DataEnd => {
                    if buf.len() < 2 {
                        break;
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(Http1Error::Chunk);
                    }
                    buf.advance(2);
                    chunk = Chunked::Size;
                }
                Chunked::Trailer => {
                    let Some(line) = take_line(buf)? else { break };
                    if line.is_empty() {
                        self.state = State::Done;
                        return Ok(());
                    }
                }
            }
        }

        self.state = State::Chunked(chunk);
        Ok(())
    }
}

impl Parse for ResponseParser {
    fn parse(&mut self, buf: &mut BytesMut) -> Result<(), BoxError> {
        loop {
            match self.state {
                State::Head => {
                    if !self.parse_head(buf)? {
                        return Ok(());
                    }
                }
                State::Length(remaining) => {
                    let n = remaining.min(buf.len());
                    self.body.extend_from_slice(&buf[..n]);
                    buf.advance(n);
                    self.state = if n == remaining {
                        State::Done
                    } else {
                        State::Length(remaining - n)
                    };
                    return Ok(());
                }
                State::Chunked(chunk) => {
                    self.parse_chunked(chunk, buf)?;
                    return Ok(());
                }
                State::UntilClose => {
                    self.body.extend_from_slice(buf);
                    buf.clear();
                    return Ok(());
                }
                State::Done => return Ok(()),
            }
        }
    }

    fn is_done(&self) -> bool {
        self.state == State::Done
    }

    fn eof(&mut self) -> Result<(), BoxError> {
        match self.state {
            State::UntilClose | State::Done => {
                self.state = State::Done;
                Ok(())
            }
            _ => Err(Http1Error::Incomplete.into()),
        }
    }
}

/// Position of the `\r\n\r\n` ending a message head.
fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|window| window == b"\r\n\r\n")
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|window| window == b"\r\n")
}

/// Remove one CRLF-terminated line from the front of `buf`, without the CRLF.
fn take_line(buf: &mut BytesMut) -> Result<Option<BytesMut>, Http1Error> {
    match find_crlf(buf) {
        Some(end) => {
            let line = buf.split_to(end);
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_LINE_SIZE => Err(Http1Error::Chunk),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, Http1Error> {
    let line = std::str::from_utf8(line).map_err(|_| Http1Error::Chunk)?;
    // Chunk extensions (;name=value) are ignored.
    let size = line.split(';').next().unwrap_or_default().trim();
    usize::from_str_radix(size, 16).map_err(|_| Http1Error::Chunk)
}

fn parse_response_head(data: &[u8]) -> Result<Head, Http1Error> {
    let mut lines = data
        .split(|b| *b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line));

    let status_line = lines.next().ok_or(Http1Error::StatusLine)?;
    let mut parts = status_line.splitn(3, |b| *b == b' ');
    let version = match parts.next() {
        Some(b"HTTP/1.1") => Version::HTTP_11,
        Some(b"HTTP/1.0") => Version::HTTP_10,
        _ => return Err(Http1Error::StatusLine),
    };
    let status = parts
        .next()
        .filter(|code| code.len() == 3)
        .and_then(|code| StatusCode::from_bytes(code).ok())
        .ok_or(Http1Error::StatusLine)?;

    let mut headers = HeaderMap::new();
    for line in lines {
        if line.first().is_some_and(|b| *b == b' ' || *b == b'\t') {
            // Obsolete line folding.
            return Err(Http1Error::Header);
        }
        let colon = line
            .iter()
            .position(|b| *b == b':')
            .ok_or(Http1Error::Header)?;
        let name = HeaderName::from_bytes(&line[..colon]).map_err(|_| Http1Error::Header)?;
        let value =
            HeaderValue::from_bytes(trim(&line[colon + 1..])).map_err(|_| Http1Error::Header)?;
        headers.append(name, value);
    }

    Ok(Head {
        version,
        status,
        headers,
    })
}

fn trim(mut value: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = value {
        if !first.is_ascii_whitespace() {
            break;
        }
        value = rest;
    }
    while let [rest @ .., last] = value {
        if !last.is_ascii_whitespace() {
            break;
        }
        value = rest;
    }
    value
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>, Http1Error> {
    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|value| value.trim().parse::<usize>().ok())
            .ok_or(Http1Error::ContentLength)?;
        match length {
            Some(previous) if previous != parsed => return Err(Http1Error::ContentLength),
            _ => length = Some(parsed),
        }
    }
    Ok(length)
}

#[cfg(test)]
mod tests {
    use bytes::Buf as _;

    use super::*;

    fn feed(parser: &mut ResponseParser, data: &[u8]) -> BytesMut {
        let mut buf = BytesMut::from(data);
        parser.parse(&mut buf).unwrap();
        buf
    }

    #[test]
    fn request_head_gets_host_and_length() {
        let request = http::Request::post("http://example.com:8080/submit?x=1")
            .header("accept", "*/*")
            .body(Bytes::from_static(b"hello"))
            .unwrap();

        let mut buf = request.encode().unwrap();
        let wire = buf.copy_to_bytes(buf.remaining());
        assert_eq!(
            &wire[..],
            &b"POST /submit?x=1 HTTP/1.1\r\n\
               host: example.com:8080\r\n\
               accept: */*\r\n\
               content-length: 5\r\n\
               \r\n\
               hello"[..]
        );
    }

    #[test]
    fn request_without_body_has_no_length() {
        let request = http::Request::get("/index.html")
            .header(HOST, "localhost")
            .body(())
            .unwrap();

        let wire = request.encode().unwrap();
        assert_eq!(
            &wire[..],
            b"GET /index.html HTTP/1.1\r\nhost: localhost\r\n\r\n"
        );
    }

    #[test]
    fn http2_requests_are_rejected() {
        let request = http::Request::get("http://example.com/")
            .version(Version::HTTP_2)
            .body(())
            .unwrap();
        assert!(request.encode().is_err());
    }

    #[test]
    fn content_length_body_across_reads() {
        let mut parser = ResponseParser::new();
        let rest = feed(&mut parser, b"HTTP/1.1 200 OK\r\ncontent-length: 10\r\n\r\nhello");
        assert!(rest.is_empty());
        assert!(!parser.is_done());
        assert_eq!(parser.status(), Some(StatusCode::OK));

        let rest = feed(&mut parser, b"world!EXTRA");
        assert!(parser.is_done());
        assert_eq!(&rest[..], b"!EXTRA");

        let response = parser.into_response().unwrap();
        assert_eq!(response.body(), &Bytes::from_static(b"helloworld"));
        assert_eq!(response.version(), Version::HTTP_11);
    }

    #[test]
    fn chunked_body_with_trailers() {
        let mut parser = ResponseParser::new();
        feed(
            &mut parser,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;ext=1\r\nhel",
        );
        assert!(!parser.is_done());

        let rest = feed(&mut parser, b"lo\r\n6\r\n world\r\n0\r\nx-trailer: 1\r\n\r\nnext");
        assert!(parser.is_done());
        assert_eq!(&rest[..], b"next");
        assert_eq!(parser.body(), b"hello world");
    }

    #[test]
    fn malformed_chunk_is_an_error() {
        let mut parser = ResponseParser::new();
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\nzz\r\n"[..],
        );
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn body_until_close() {
        let mut parser = ResponseParser::new();
        feed(&mut parser, b"HTTP/1.0 200 OK\r\n\r\nsome");
        feed(&mut parser, b" bytes");
        assert!(!parser.is_done());

        parser.eof().unwrap();
        let response = parser.into_response().unwrap();
        assert_eq!(response.body(), &Bytes::from_static(b"some bytes"));
        assert_eq!(response.version(), Version::HTTP_10);
    }

    #[test]
    fn truncated_length_body_fails_on_eof() {
        let mut parser = ResponseParser::new();
        feed(&mut parser, b"HTTP/1.1 200 OK\r\ncontent-length: 4\r\n\r\nab");
        assert!(parser.eof().is_err());
        assert!(matches!(
            parser.into_response(),
            Err(Http1Error::Incomplete)
        ));
    }

    #[test]
    fn bodyless_statuses() {
        for status in ["204 No Content", "304 Not Modified"] {
            let mut parser = ResponseParser::new();
            let head = format!("HTTP/1.1 {status}\r\ncontent-length: 12\r\n\r\n");
            feed(&mut parser, head.as_bytes());
            assert!(parser.is_done(), "{status}");
        }

        let mut parser = ResponseParser::for_head();
        let rest = feed(&mut parser, b"HTTP/1.1 200 OK\r\ncontent-length: 12\r\n\r\n");
        assert!(parser.is_done());
        assert!(rest.is_empty());
    }

    #[test]
    fn head_arriving_one_byte_at_a_time() {
        let wire = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nx-pad: abcdef\r\n\r\nok";
        let mut parser = ResponseParser::new();
        let mut buf = BytesMut::new();

        for byte in wire {
            buf.extend_from_slice(&[*byte]);
            parser.parse(&mut buf).unwrap();
            if parser.status().is_none() {
                // Only the newest bytes are searched on the next call.
                assert_eq!(parser.scanned, buf.len());
            }
        }

        assert!(parser.is_done());
        assert_eq!(parser.scanned, 0);
        assert_eq!(parser.body(), b"ok");
        assert_eq!(
            parser.headers().unwrap().get("x-pad").unwrap(),
            "abcdef"
        );
    }

    #[test]
    fn head_terminator_split_across_reads() {
        let mut parser = ResponseParser::new();
        let mut buf = BytesMut::from(&b"HTTP/1.1 204 No Content\r\n\r"[..]);
        parser.parse(&mut buf).unwrap();
        assert!(parser.status().is_none());

        buf.extend_from_slice(b"\n");
        parser.parse(&mut buf).unwrap();
        assert!(parser.is_done());
        assert_eq!(parser.status(), Some(StatusCode::NO_CONTENT));
    }

    #[test]
    fn interim_responses_are_skipped() {
        let mut parser = ResponseParser::new();
        feed(
            &mut parser,
            b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 201 Created\r\ncontent-length: 2\r\n\r\nok",
        );
        assert!(parser.is_done());
        assert_eq!(parser.status(), Some(StatusCode::CREATED));
    }

    #[test]
    fn conflicting_lengths() {
        let mut parser = ResponseParser::new();
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\ncontent-length: 3\r\ncontent-length: 4\r\n\r\n"[..],
        );
        assert!(parser.parse(&mut buf).is_err());
    }

    #[test]
    fn bad_status_line() {
        let mut parser = ResponseParser::new();
        let mut buf = BytesMut::from(&b"SPDY/3 200 OK\r\n\r\n"[..]);
        assert!(parser.parse(&mut buf).is_err());
    }
}
