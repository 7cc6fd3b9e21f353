//! HTTP/1.1 message framing.
//!
//! Reads accumulate into a per-connection [`BytesMut`] so that bytes of a
//! pipelined next message are kept for the next call.

use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::warn;

use crate::http::{
    Headers, Method, Request, Response, StatusCode,
    request::RequestError,
};

/// Initial read buffer capacity per connection.
pub const INITIAL_BUF_SIZE: usize = 4096;

/// Largest request or response head we will buffer.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum number of headers accepted in a response head.
const MAX_RESPONSE_HEADERS: usize = 64;

/// Errors produced while reading or writing HTTP messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer closed the connection cleanly between messages.
    #[error("connection closed by peer")]
    Closed,

    #[error("connection closed in the middle of a message")]
    UnexpectedEof,

    #[error("bad request: {0}")]
    Request(#[from] RequestError),

    #[error("malformed response: {0}")]
    Response(httparse::Error),

    #[error("message head exceeds {max} bytes")]
    HeadTooLarge { max: usize },

    #[error("payload exceeds maximum allowed size of {max} bytes")]
    PayloadTooLarge { max: usize },

    #[error("invalid chunked transfer coding")]
    InvalidChunk,

    /// A read made no progress within its timeout.
    #[error("read timed out")]
    TimedOut,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// The status to answer with before dropping the connection, when the
    /// failure was the peer's fault.
    pub fn response_status(&self) -> Option<StatusCode> {
        match self {
            Self::Request(_) | Self::InvalidChunk => Some(StatusCode::BadRequest),
            Self::HeadTooLarge { .. } | Self::PayloadTooLarge { .. } => {
                Some(StatusCode::PayloadTooLarge)
            }
            _ => None,
        }
    }
}

/// How a response should be framed on the wire.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// HTTP minor version to answer with.
    pub version: u8,
    pub keep_alive: bool,
    /// Write the head only (responses to `HEAD`).
    pub head_only: bool,
}

/// Limits applied while reading one request.
#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub max_payload: usize,
    /// How long to wait for the first byte of a new request.
    pub idle_timeout: Option<Duration>,
    /// How long any later read may stall. Each read that returns data
    /// starts a fresh wait, so a slow but steady upload is not cut off.
    pub read_timeout: Option<Duration>,
}

impl ReadOptions {
    pub fn new(max_payload: usize) -> Self {
        Self {
            max_payload,
            idle_timeout: None,
            read_timeout: None,
        }
    }
}

/// Reads one complete request, body included.
///
/// Returns [`CodecError::Closed`] when the stream ends before the first byte
/// of a new request.
pub async fn read_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    opts: ReadOptions,
) -> Result<Request, CodecError>
where
    S: AsyncRead + Unpin,
{
    let max_payload = opts.max_payload;
    let limit = opts.read_timeout;
    let (mut request, body_offset) = loop {
        if !buf.is_empty() {
            match Request::parse(&buf[..]) {
                Ok(parsed) => break parsed,
                Err(RequestError::Incomplete) => {
                    if buf.len() > MAX_HEAD_SIZE {
                        return Err(CodecError::HeadTooLarge { max: MAX_HEAD_SIZE });
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        let wait = if buf.is_empty() { opts.idle_timeout } else { limit };
        if fill(stream, buf, wait).await? == 0 {
            return Err(if buf.is_empty() {
                CodecError::Closed
            } else {
                CodecError::UnexpectedEof
            });
        }
    };
    buf.advance(body_offset);

    let body = if request.is_chunked() {
        read_chunked(stream, buf, max_payload, limit).await?
    } else {
        let len = request.content_length()?.unwrap_or(0);
        if len > max_payload {
            return Err(CodecError::PayloadTooLarge { max: max_payload });
        }
        read_body(stream, buf, len, limit).await?
    };

    request.attach_body(body);
    Ok(request)
}

/// Writes `response`, draining its content provider if it has one.
///
/// Returns `false` when a content provider stopped before producing its
/// declared length; the connection must not be reused after that.
pub async fn write_response<S>(
    stream: &mut S,
    response: &mut Response,
    opts: WriteOptions,
) -> Result<bool, CodecError>
where
    S: AsyncWrite + Unpin,
{
    let Some(mut source) = response.take_content() else {
        let mut buf = response.encode_head(opts.version, response.content().len(), opts.keep_alive);
        if !opts.head_only {
            buf.extend_from_slice(response.content());
        }
        stream.write_all(&buf).await?;
        stream.flush().await?;
        return Ok(true);
    };

    let head = response.encode_head(opts.version, source.length, opts.keep_alive);
    stream.write_all(&head).await?;
    if opts.head_only {
        stream.flush().await?;
        return Ok(true);
    }

    let mut offset = 0;
    while offset < source.length {
        let remaining = source.length - offset;
        let Some(chunk) = (source.provider)(offset, remaining) else {
            break;
        };
        if chunk.is_empty() {
            break;
        }
        let take = chunk.len().min(remaining);
        stream.write_all(&chunk[..take]).await?;
        offset += take;
    }
    stream.flush().await?;

    if offset < source.length {
        warn!(
            produced = offset,
            declared = source.length,
            "content provider ended early"
        );
        return Ok(false);
    }
    Ok(true)
}

/// Writes one HTTP/1.1 request. `Content-Length` is added for non-empty bodies.
pub async fn write_request<S>(
    stream: &mut S,
    method: &Method,
    target: &str,
    headers: &Headers,
    body: &[u8],
) -> Result<(), CodecError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(128 + headers.len() * 64 + body.len());
    buf.extend_from_slice(format!("{method} {target} HTTP/1.1\r\n").as_bytes());
    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        buf.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }
    if !body.is_empty() {
        buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(body);

    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one complete response.
///
/// `head_request` suppresses the body, as responses to `HEAD` carry none.
pub async fn read_response<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    head_request: bool,
    max_payload: usize,
) -> Result<Response, CodecError>
where
    S: AsyncRead + Unpin,
{
    let (status, version, headers, body_offset) = loop {
        if !buf.is_empty() {
            if let Some(head) = parse_response_head(&buf[..])? {
                break head;
            }
            if buf.len() > MAX_HEAD_SIZE {
                return Err(CodecError::HeadTooLarge { max: MAX_HEAD_SIZE });
            }
        }
        if fill(stream, buf, None).await? == 0 {
            return Err(if buf.is_empty() {
                CodecError::Closed
            } else {
                CodecError::UnexpectedEof
            });
        }
    };
    buf.advance(body_offset);

    let bodiless = head_request || (100..200).contains(&status) || status == 204 || status == 304;
    let body = if bodiless {
        Bytes::new()
    } else if headers.has_token("transfer-encoding", "chunked") {
        read_chunked(stream, buf, max_payload, None).await?
    } else if let Some(len) = headers.get("content-length") {
        let len: usize = len.trim().parse().map_err(|_| {
            CodecError::Response(httparse::Error::HeaderValue)
        })?;
        if len > max_payload {
            return Err(CodecError::PayloadTooLarge { max: max_payload });
        }
        read_body(stream, buf, len, None).await?
    } else {
        read_to_end(stream, buf, max_payload).await?
    };

    Ok(Response::from_wire(status, version, headers, body))
}

fn parse_response_head(buf: &[u8]) -> Result<Option<(u16, u8, Headers, usize)>, CodecError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_RESPONSE_HEADERS];
    let mut raw = httparse::Response::new(&mut headers);
    let offset = match raw.parse(buf).map_err(CodecError::Response)? {
        httparse::Status::Complete(offset) => offset,
        httparse::Status::Partial => return Ok(None),
    };
    let status = raw
        .code
        .ok_or(CodecError::Response(httparse::Error::Status))?;
    let version = raw
        .version
        .ok_or(CodecError::Response(httparse::Error::Version))?;
    let mut map = Headers::with_capacity(raw.headers.len());
    for header in raw.headers.iter() {
        if let Ok(value) = std::str::from_utf8(header.value) {
            map.insert(header.name, value);
        }
    }
    Ok(Some((status, version, map, offset)))
}

async fn fill<S>(stream: &mut S, buf: &mut BytesMut, limit: Option<Duration>) -> Result<usize, CodecError>
where
    S: AsyncRead + Unpin,
{
    if buf.capacity() - buf.len() < 512 {
        buf.reserve(INITIAL_BUF_SIZE);
    }
    let n = match limit {
        Some(limit) => timeout(limit, stream.read_buf(buf))
            .await
            .map_err(|_| CodecError::TimedOut)??,
        None => stream.read_buf(buf).await?,
    };
    Ok(n)
}

async fn read_body<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    len: usize,
    limit: Option<Duration>,
) -> Result<Bytes, CodecError>
where
    S: AsyncRead + Unpin,
{
    if buf.len() < len {
        buf.reserve(len - buf.len());
    }
    while buf.len() < len {
        if fill(stream, buf, limit).await? == 0 {
            return Err(CodecError::UnexpectedEof);
        }
    }
    Ok(buf.split_to(len).freeze())
}

async fn read_to_end<S>(stream: &mut S, buf: &mut BytesMut, max: usize) -> Result<Bytes, CodecError>
where
    S: AsyncRead + Unpin,
{
    while fill(stream, buf, None).await? > 0 {
        if buf.len() > max {
            return Err(CodecError::PayloadTooLarge { max });
        }
    }
    Ok(buf.split().freeze())
}

async fn read_line<S>(stream: &mut S, buf: &mut BytesMut, limit: Option<Duration>) -> Result<Bytes, CodecError>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = memmem::find(&buf[..], b"\r\n") {
            let mut line = buf.split_to(pos + 2);
            line.truncate(pos);
            return Ok(line.freeze());
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(CodecError::InvalidChunk);
        }
        if fill(stream, buf, limit).await? == 0 {
            return Err(CodecError::UnexpectedEof);
        }
    }
}

async fn read_chunked<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    max: usize,
    limit: Option<Duration>,
) -> Result<Bytes, CodecError>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let line = read_line(stream, buf, limit).await?;
        let size = std::str::from_utf8(&line)
            .ok()
            .and_then(|l| l.split(';').next())
            .and_then(|s| usize::from_str_radix(s.trim(), 16).ok())
            .ok_or(CodecError::InvalidChunk)?;

        if size == 0 {
            // Trailer section ends with an empty line.
            while !read_line(stream, buf, limit).await?.is_empty() {}
            return Ok(body.freeze());
        }
        body.len()
            .checked_add(size)
            .filter(|total| *total <= max)
            .ok_or(CodecError::PayloadTooLarge { max })?;
        let chunk = read_body(stream, buf, size, limit).await?;
        body.extend_from_slice(&chunk);
        if !read_line(stream, buf, limit).await?.is_empty() {
            return Err(CodecError::InvalidChunk);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const MAX: usize = 1024;

    async fn request_from(raw: &[u8]) -> Result<Request, CodecError> {
        let mut stream = raw;
        let mut buf = BytesMut::new();
        read_request(&mut stream, &mut buf, ReadOptions::new(MAX)).await
    }

    #[tokio::test]
    async fn reads_request_with_body() {
        let req = request_from(b"POST /echo HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        assert_eq!(req.path(), "/echo");
        assert_eq!(req.body().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn keeps_pipelined_bytes_for_next_read() {
        let mut stream: &[u8] = b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n";
        let mut buf = BytesMut::new();
        let first = read_request(&mut stream, &mut buf, ReadOptions::new(MAX)).await.unwrap();
        let second = read_request(&mut stream, &mut buf, ReadOptions::new(MAX)).await.unwrap();
        assert_eq!(first.path(), "/a");
        assert_eq!(second.path(), "/b");
        assert!(matches!(
            read_request(&mut stream, &mut buf, ReadOptions::new(MAX)).await,
            Err(CodecError::Closed)
        ));
    }

    #[tokio::test]
    async fn clean_close_versus_truncation() {
        assert!(matches!(request_from(b"").await, Err(CodecError::Closed)));
        assert!(matches!(
            request_from(b"GET / HTTP/1.1\r\nHo").await,
            Err(CodecError::UnexpectedEof)
        ));
        assert!(matches!(
            request_from(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc").await,
            Err(CodecError::UnexpectedEof)
        ));
    }

    #[tokio::test]
    async fn rejects_oversize_payload() {
        let err = request_from(b"POST / HTTP/1.1\r\nContent-Length: 4096\r\n\r\n")
            .await
            .unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge { max: MAX }));
        assert_eq!(err.response_status(), Some(StatusCode::PayloadTooLarge));
    }

    #[tokio::test]
    async fn malformed_request_maps_to_400() {
        let err = request_from(b"NOT HTTP AT ALL\r\n\r\n").await.unwrap_err();
        assert_eq!(err.response_status(), Some(StatusCode::BadRequest));
    }

    #[tokio::test]
    async fn decodes_chunked_request() {
        let req = request_from(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2;ext=1\r\nde\r\n0\r\nX-Trailer: 1\r\n\r\n",
        )
        .await
        .unwrap();
        assert_eq!(req.body().as_ref(), b"abcde");
    }

    #[tokio::test]
    async fn huge_chunk_size_is_rejected() {
        let err = request_from(
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1\r\na\r\nFFFFFFFFFFFFFFFF\r\n",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge { max: MAX }));
        assert_eq!(err.response_status(), Some(StatusCode::PayloadTooLarge));
    }

    #[tokio::test]
    async fn idle_connection_times_out() {
        let (_client, mut server) = tokio::io::duplex(1024);
        let opts = ReadOptions {
            idle_timeout: Some(Duration::from_millis(50)),
            ..ReadOptions::new(MAX)
        };
        let err = read_request(&mut server, &mut BytesMut::new(), opts).await.unwrap_err();
        assert!(matches!(err, CodecError::TimedOut));
        assert_eq!(err.response_status(), None);
    }

    #[tokio::test]
    async fn slow_body_survives_while_bytes_keep_arriving() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let writer = tokio::spawn(async move {
            client.write_all(b"POST / HTTP/1.1\r\nContent-Length: 6\r\n\r\n").await.unwrap();
            for part in [&b"ab"[..], b"cd", b"ef"] {
                tokio::time::sleep(Duration::from_millis(120)).await;
                client.write_all(part).await.unwrap();
            }
            client
        });
        let opts = ReadOptions {
            idle_timeout: Some(Duration::from_millis(200)),
            read_timeout: Some(Duration::from_millis(200)),
            ..ReadOptions::new(MAX)
        };
        let req = read_request(&mut server, &mut BytesMut::new(), opts).await.unwrap();
        assert_eq!(req.body().as_ref(), b"abcdef");
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn stalled_body_times_out() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(b"POST / HTTP/1.1\r\nContent-Length: 6\r\n\r\nab").await.unwrap();
        let opts = ReadOptions {
            read_timeout: Some(Duration::from_millis(50)),
            ..ReadOptions::new(MAX)
        };
        let err = read_request(&mut server, &mut BytesMut::new(), opts).await.unwrap_err();
        assert!(matches!(err, CodecError::TimedOut));
    }

    #[tokio::test]
    async fn writes_body_response() {
        let mut out = Vec::new();
        let mut res = Response::new(StatusCode::Ok).body("hi");
        let opts = WriteOptions { version: 1, keep_alive: true, head_only: false };
        assert!(write_response(&mut out, &mut res, opts).await.unwrap());
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("Content-Length: 2\r\n\r\nhi"));
    }

    #[tokio::test]
    async fn head_only_omits_body() {
        let mut out = Vec::new();
        let mut res = Response::new(StatusCode::Ok).body("hidden");
        let opts = WriteOptions { version: 1, keep_alive: false, head_only: true };
        write_response(&mut out, &mut res, opts).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn drains_content_provider_by_offset() {
        let data = b"abcdefghij";
        let mut offsets = Vec::new();
        let (tx, rx) = std::sync::mpsc::channel();
        let mut res = Response::default();
        res.set_content_provider(data.len(), "text/plain", move |offset, len| {
            tx.send(offset).ok();
            let end = (offset + 4usize.min(len)).min(data.len());
            Some(Bytes::copy_from_slice(&data[offset..end]))
        });

        let mut out = Vec::new();
        let opts = WriteOptions { version: 1, keep_alive: true, head_only: false };
        assert!(write_response(&mut out, &mut res, opts).await.unwrap());
        offsets.extend(rx.try_iter());

        assert_eq!(offsets, vec![0, 4, 8]);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Content-Length: 10\r\n"));
        assert!(text.ends_with("\r\n\r\nabcdefghij"));
    }

    #[tokio::test]
    async fn short_content_provider_breaks_framing() {
        let mut res = Response::default();
        res.set_content_provider(10, "text/plain", |offset, _| {
            (offset == 0).then(|| Bytes::from_static(b"abc"))
        });
        let mut out = Vec::new();
        let opts = WriteOptions { version: 1, keep_alive: true, head_only: false };
        assert!(!write_response(&mut out, &mut res, opts).await.unwrap());
    }

    #[tokio::test]
    async fn request_round_trips_through_codec() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut headers = Headers::new();
        headers.insert("Host", "localhost");
        write_request(&mut client, &Method::Post, "/submit?x=1", &headers, b"payload")
            .await
            .unwrap();
        client.shutdown().await.unwrap();

        let mut buf = BytesMut::new();
        let req = read_request(&mut server, &mut buf, ReadOptions::new(MAX)).await.unwrap();
        assert_eq!(req.method(), &Method::Post);
        assert_eq!(req.param("x"), Some("1"));
        assert_eq!(req.body().as_ref(), b"payload");
    }

    #[tokio::test]
    async fn reads_response_variants() {
        let mut stream: &[u8] = b"HTTP/1.1 201 Created\r\nContent-Length: 2\r\n\r\nok";
        let res = read_response(&mut stream, &mut BytesMut::new(), false, MAX).await.unwrap();
        assert_eq!(res.status(), 201);
        assert_eq!(res.content().as_ref(), b"ok");

        let mut stream: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let res = read_response(&mut stream, &mut BytesMut::new(), false, MAX).await.unwrap();
        assert_eq!(res.text(), "hello");

        let mut stream: &[u8] = b"HTTP/1.0 200 OK\r\n\r\nuntil eof";
        let res = read_response(&mut stream, &mut BytesMut::new(), false, MAX).await.unwrap();
        assert_eq!(res.text(), "until eof");
        assert!(!res.is_keep_alive());

        let mut stream: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 9\r\n\r\n";
        let res = read_response(&mut stream, &mut BytesMut::new(), true, MAX).await.unwrap();
        assert!(res.content().is_empty());
        assert_eq!(res.get_header("content-length"), Some("9"));
    }
}
