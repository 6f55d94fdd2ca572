use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const MAX_HEAD_BYTES: usize = 64 * 1024;
const MAX_BUFFERED_BODY_BYTES: usize = 256 * 1024 * 1024;
const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug)]
pub enum HttpError {
    Io(std::io::Error),
    HeadTooLarge,
    BodyTooLarge,
    Malformed(String),
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpError::Io(error) => write!(f, "socket error: {}", error),
            HttpError::HeadTooLarge => write!(f, "request head exceeds limit"),
            HttpError::BodyTooLarge => write!(f, "buffered body exceeds limit"),
            HttpError::Malformed(reason) => write!(f, "malformed HTTP message: {}", reason),
        }
    }
}

impl std::error::Error for HttpError {}

impl From<std::io::Error> for HttpError {
    fn from(value: std::io::Error) -> Self {
        HttpError::Io(value)
    }
}

/// Ordered header collection with case-insensitive names. Original casing
/// and order are preserved so replayed messages look like the originals.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> HeaderMap {
        HeaderMap::default()
    }

    pub fn push(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_string(), value.to_string()));
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace every occurrence of `name` with a single entry.
    pub fn set(&mut self, name: &str, value: &str) {
        match self
            .entries
            .iter()
            .position(|(key, _)| key.eq_ignore_ascii_case(name))
        {
            Some(index) => {
                self.entries
                    .retain(|(key, _)| !key.eq_ignore_ascii_case(name));
                self.entries
                    .insert(index, (name.to_string(), value.to_string()));
            }
            None => self.push(name, value),
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|(key, _)| !key.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
}

/// How the message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Read one HTTP/1.1 message head (request line or status line plus
/// headers). Returns `None` on a clean EOF before any byte of the head.
pub async fn read_head<R>(reader: &mut R) -> Result<Option<Vec<u8>>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head: Vec<u8> = Vec::new();
    loop {
        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 {
            if head.is_empty() {
                return Ok(None);
            }
            return Err(HttpError::Malformed(
                "connection closed mid-head".to_string(),
            ));
        }
        let is_blank = line == b"\r\n" || line == b"\n";
        if is_blank && head.is_empty() {
            // Tolerate stray CRLFs between messages.
            continue;
        }
        head.extend_from_slice(&line);
        if head.len() > MAX_HEAD_BYTES {
            return Err(HttpError::HeadTooLarge);
        }
        if is_blank {
            return Ok(Some(head));
        }
    }
}

pub fn parse_request_head(raw: &[u8]) -> Result<RequestHead, HttpError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| HttpError::Malformed("head is not valid UTF-8".to_string()))?;
    let mut lines = text.lines();
    let request_line = lines
        .next()
        .ok_or_else(|| HttpError::Malformed("empty head".to_string()))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| HttpError::Malformed("missing method".to_string()))?;
    let target = parts
        .next()
        .ok_or_else(|| HttpError::Malformed("missing request target".to_string()))?;
    let version = parts.next().unwrap_or("HTTP/1.1");
    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        version: version.to_string(),
        headers: parse_header_lines(lines),
    })
}

pub fn parse_response_head(raw: &[u8]) -> Result<ResponseHead, HttpError> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| HttpError::Malformed("head is not valid UTF-8".to_string()))?;
    let mut lines = text.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| HttpError::Malformed("empty head".to_string()))?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| HttpError::Malformed("missing HTTP version".to_string()))?;
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| HttpError::Malformed("missing status code".to_string()))?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok(ResponseHead {
        version: version.to_string(),
        status,
        reason,
        headers: parse_header_lines(lines),
    })
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for line in lines {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push(name.trim(), value.trim());
        }
    }
    headers
}

pub fn request_body_framing(head: &RequestHead) -> BodyFraming {
    if header_has_token(&head.headers, "transfer-encoding", "chunked") {
        return BodyFraming::Chunked;
    }
    match content_length(&head.headers) {
        Some(0) | None => BodyFraming::None,
        Some(length) => BodyFraming::Length(length),
    }
}

pub fn response_body_framing(request_method: &str, head: &ResponseHead) -> BodyFraming {
    if request_method.eq_ignore_ascii_case("HEAD")
        || head.status / 100 == 1
        || head.status == 204
        || head.status == 304
    {
        return BodyFraming::None;
    }
    if header_has_token(&head.headers, "transfer-encoding", "chunked") {
        return BodyFraming::Chunked;
    }
    match content_length(&head.headers) {
        Some(length) => BodyFraming::Length(length),
        None => BodyFraming::UntilClose,
    }
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("content-length")
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get(name)
        .map(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

/// Read a complete body into memory, de-chunking when necessary.
pub async fn read_body<R>(reader: &mut R, framing: BodyFraming) -> Result<Vec<u8>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    match framing {
        BodyFraming::None => Ok(Vec::new()),
        BodyFraming::Length(length) => {
            if length as usize > MAX_BUFFERED_BODY_BYTES {
                return Err(HttpError::BodyTooLarge);
            }
            let mut body = vec![0u8; length as usize];
            reader.read_exact(&mut body).await?;
            Ok(body)
        }
        BodyFraming::Chunked => {
            let mut body = Vec::new();
            loop {
                let size = read_chunk_size(reader).await?;
                if size == 0 {
                    drain_trailers(reader).await?;
                    return Ok(body);
                }
                if body.len() + size > MAX_BUFFERED_BODY_BYTES {
                    return Err(HttpError::BodyTooLarge);
                }
                let start = body.len();
                body.resize(start + size, 0);
                reader.read_exact(&mut body[start..]).await?;
                read_chunk_terminator(reader).await?;
            }
        }
        BodyFraming::UntilClose => {
            let mut body = Vec::new();
            reader.read_to_end(&mut body).await?;
            if body.len() > MAX_BUFFERED_BODY_BYTES {
                return Err(HttpError::BodyTooLarge);
            }
            Ok(body)
        }
    }
}

/// Stream a body from `reader` to `writer` without reframing it.
pub async fn copy_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
) -> Result<(), HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None => Ok(()),
        BodyFraming::Length(length) => {
            copy_exact(reader, writer, length).await?;
            Ok(())
        }
        BodyFraming::Chunked => {
            loop {
                let mut size_line = Vec::new();
                let read = reader.read_until(b'\n', &mut size_line).await?;
                if read == 0 {
                    return Err(HttpError::Malformed("connection closed mid-chunk".to_string()));
                }
                let size = parse_chunk_size(&size_line)?;
                writer.write_all(&size_line).await?;
                if size == 0 {
                    // Trailers pass through untouched.
                    loop {
                        let mut trailer = Vec::new();
                        let read = reader.read_until(b'\n', &mut trailer).await?;
                        if read == 0 {
                            return Err(HttpError::Malformed(
                                "connection closed mid-trailer".to_string(),
                            ));
                        }
                        writer.write_all(&trailer).await?;
                        if trailer == b"\r\n" || trailer == b"\n" {
                            writer.flush().await?;
                            return Ok(());
                        }
                    }
                }
                copy_exact(reader, writer, size as u64 + 2).await?;
            }
        }
        BodyFraming::UntilClose => {
            let mut buf = vec![0u8; COPY_CHUNK];
            loop {
                let read = reader.read(&mut buf).await?;
                if read == 0 {
                    writer.flush().await?;
                    return Ok(());
                }
                writer.write_all(&buf[..read]).await?;
            }
        }
    }
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, mut remaining: u64) -> Result<(), HttpError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_CHUNK];
    while remaining > 0 {
        let want = remaining.min(COPY_CHUNK as u64) as usize;
        let read = reader.read(&mut buf[..want]).await?;
        if read == 0 {
            return Err(HttpError::Malformed("connection closed mid-body".to_string()));
        }
        writer.write_all(&buf[..read]).await?;
        remaining -= read as u64;
    }
    writer.flush().await?;
    Ok(())
}

async fn read_chunk_size<R>(reader: &mut R) -> Result<usize, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = reader.read_until(b'\n', &mut line).await?;
    if read == 0 {
        return Err(HttpError::Malformed("connection closed mid-chunk".to_string()));
    }
    parse_chunk_size(&line)
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, HttpError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpError::Malformed("chunk size is not ASCII".to_string()))?;
    let size_text = text
        .trim()
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    usize::from_str_radix(size_text, 16)
        .map_err(|_| HttpError::Malformed(format!("bad chunk size {:?}", size_text)))
}

async fn read_chunk_terminator<R>(reader: &mut R) -> Result<(), HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut terminator = Vec::new();
    reader.read_until(b'\n', &mut terminator).await?;
    if terminator == b"\r\n" || terminator == b"\n" {
        Ok(())
    } else {
        Err(HttpError::Malformed("missing chunk terminator".to_string()))
    }
}

async fn drain_trailers<R>(reader: &mut R) -> Result<(), HttpError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let read = reader.read_until(b'\n', &mut line).await?;
        if read == 0 || line == b"\r\n" || line == b"\n" {
            return Ok(());
        }
    }
}

pub fn format_request_head(method: &str, target: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = format!("{} {} HTTP/1.1\r\n", method, target).into_bytes();
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

pub fn format_response_head(status: u16, reason: &str, headers: &HeaderMap) -> Vec<u8> {
    let mut head = if reason.is_empty() {
        format!("HTTP/1.1 {}\r\n", status).into_bytes()
    } else {
        format!("HTTP/1.1 {} {}\r\n", status, reason).into_bytes()
    };
    for (name, value) in headers.iter() {
        head.extend_from_slice(name.as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");
    head
}

/// A stream that replays buffered bytes before reading from the inner
/// transport. Used when a buffered reader has consumed past a message
/// boundary and the remainder must be handed to a new protocol layer.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> PrefixedStream<S> {
        PrefixedStream {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.offset += take;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
