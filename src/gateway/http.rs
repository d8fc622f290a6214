//! HTTP/1.x message heads and body framing
//!
//! Only heads are parsed. Bodies are forwarded as raw bytes according to their
//! framing, so chunked bodies keep their chunk layout on the wire.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default limit for one header block
pub const DEFAULT_MAX_HEADER_BYTES: usize = 64 * 1024;

const MAX_HEADERS: usize = 128;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("peer closed in the middle of a message")]
    Truncated,

    #[error("header block exceeds {0} bytes")]
    HeadersTooLarge(usize),

    #[error("malformed message head: {0}")]
    Parse(#[from] httparse::Error),

    #[error("invalid body framing: {0}")]
    Framing(&'static str),

    #[error("HTTP I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HttpError {
    /// The peer sent bytes that are not a valid message
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            HttpError::HeadersTooLarge(_) | HttpError::Parse(_) | HttpError::Framing(_)
        )
    }
}

/// How a message body is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
    /// Response body runs until the sender closes
    UntilClose,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: Vec<u8>,
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Vec<Header> {
    parsed
        .iter()
        .map(|h| Header {
            name: h.name.to_string(),
            value: h.value.to_vec(),
        })
        .collect()
}

fn header_values<'a>(headers: &'a [Header], name: &'a str) -> impl Iterator<Item = &'a [u8]> {
    headers
        .iter()
        .filter(move |h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_slice())
}

/// Case-insensitive substring match over every header named `name`
fn header_contains(headers: &[Header], name: &str, needle: &str) -> bool {
    header_values(headers, name).any(|value| {
        String::from_utf8_lossy(value)
            .to_ascii_lowercase()
            .contains(needle)
    })
}

/// Case-insensitive match against comma separated tokens
fn has_token(headers: &[Header], name: &str, token: &str) -> bool {
    header_values(headers, name).any(|value| {
        String::from_utf8_lossy(value)
            .split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    })
}

fn content_length(headers: &[Header]) -> Result<Option<u64>, HttpError> {
    let mut found = None;
    for value in header_values(headers, "content-length") {
        let len = std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or(HttpError::Framing("invalid content-length"))?;
        if found.is_some_and(|prev| prev != len) {
            return Err(HttpError::Framing("conflicting content-length values"));
        }
        found = Some(len);
    }
    Ok(found)
}

/// `Some(true)` if the last transfer coding is chunked, `None` without the header
fn chunked_coding(headers: &[Header]) -> Option<bool> {
    let mut last = None;
    for value in header_values(headers, "transfer-encoding") {
        let value = String::from_utf8_lossy(value);
        if let Some(coding) = value.split(',').map(str::trim).filter(|c| !c.is_empty()).last() {
            last = Some(coding.eq_ignore_ascii_case("chunked"));
        }
    }
    last
}

/// A parsed request head, with the exact bytes it was parsed from
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub minor_version: u8,
    pub headers: Vec<Header>,
    raw: Vec<u8>,
}

impl RequestHead {
    /// Head bytes as received, including the terminating empty line
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// `Connection` mentions "upgrade" and `Upgrade` mentions "websocket"
    pub fn is_websocket_upgrade(&self) -> bool {
        header_contains(&self.headers, "connection", "upgrade")
            && header_contains(&self.headers, "upgrade", "websocket")
    }

    /// HTTP/1.1 or later without `Connection: close`
    pub fn wants_keep_alive(&self) -> bool {
        self.minor_version >= 1 && !has_token(&self.headers, "connection", "close")
    }

    pub fn body_framing(&self) -> Result<BodyFraming, HttpError> {
        let length = content_length(&self.headers)?;
        match chunked_coding(&self.headers) {
            Some(_) if length.is_some() => {
                return Err(HttpError::Framing(
                    "request has both transfer-encoding and content-length",
                ))
            }
            Some(true) => return Ok(BodyFraming::Chunked),
            Some(false) => return Err(HttpError::Framing("request transfer-encoding is not chunked")),
            None => {}
        }
        Ok(match length {
            Some(0) | None => BodyFraming::None,
            Some(len) => BodyFraming::Length(len),
        })
    }
}

/// A parsed response head, with the exact bytes it was parsed from
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub code: u16,
    pub minor_version: u8,
    pub headers: Vec<Header>,
    raw: Vec<u8>,
}

impl ResponseHead {
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// 1xx other than 101; a final response follows
    pub fn is_interim(&self) -> bool {
        (100..200).contains(&self.code) && self.code != 101
    }

    pub fn body_framing(&self, request_method: &str) -> Result<BodyFraming, HttpError> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.code)
            || self.code == 204
            || self.code == 304
        {
            return Ok(BodyFraming::None);
        }
        match chunked_coding(&self.headers) {
            Some(true) => return Ok(BodyFraming::Chunked),
            Some(false) => return Ok(BodyFraming::UntilClose),
            None => {}
        }
        Ok(match content_length(&self.headers)? {
            Some(0) => BodyFraming::None,
            Some(len) => BodyFraming::Length(len),
            None => BodyFraming::UntilClose,
        })
    }

    /// Serialize the head for the client.
    ///
    /// The status line and headers are kept except `Connection`, which is set
    /// to the decision taken for the client connection.
    pub fn rewritten(&self, keep_alive: bool) -> Vec<u8> {
        let status_line = match self.raw.iter().position(|&b| b == b'\n') {
            Some(end) => &self.raw[..=end],
            None => &self.raw[..],
        };

        let mut out = Vec::with_capacity(self.raw.len() + 32);
        out.extend_from_slice(status_line.strip_suffix(b"\n").unwrap_or(status_line));
        if !out.ends_with(b"\r") {
            out.push(b'\r');
        }
        out.push(b'\n');

        for header in &self.headers {
            if header.name.eq_ignore_ascii_case("connection") {
                continue;
            }
            out.extend_from_slice(header.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(&header.value);
            out.extend_from_slice(b"\r\n");
        }

        out.extend_from_slice(b"Connection: ");
        out.extend_from_slice(connection_value(keep_alive).as_bytes());
        out.extend_from_slice(b"\r\n\r\n");
        out
    }
}

pub fn connection_value(keep_alive: bool) -> &'static str {
    if keep_alive {
        "keep-alive"
    } else {
        "close"
    }
}

/// Plain-text response generated by the gateway itself
pub fn error_response(code: u16, reason: &str, keep_alive: bool) -> Vec<u8> {
    let body = format!("{code} {reason}\n");
    format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: {}\r\n\r\n{body}",
        body.len(),
        connection_value(keep_alive),
    )
    .into_bytes()
}

/// Read one line, `\n` included, of at most `limit` bytes
async fn read_line<R>(reader: &mut R, line: &mut Vec<u8>, limit: usize) -> Result<usize, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let start = line.len();
    let n = (&mut *reader)
        .take(limit as u64)
        .read_until(b'\n', line)
        .await?;
    if n > 0 && !line.ends_with(b"\n") {
        return Err(if line.len() - start >= limit {
            HttpError::HeadersTooLarge(limit)
        } else {
            HttpError::Truncated
        });
    }
    Ok(n)
}

/// Read a raw head up to and including the empty line.
///
/// `None` means the peer closed before sending anything.
async fn read_head<R>(reader: &mut R, limit: usize) -> Result<Option<Vec<u8>>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(1024);
    loop {
        let remaining = limit.saturating_sub(head.len());
        if remaining == 0 {
            return Err(HttpError::HeadersTooLarge(limit));
        }

        let start = head.len();
        let n = read_line(reader, &mut head, remaining)
            .await
            .map_err(|e| match e {
                HttpError::HeadersTooLarge(_) => HttpError::HeadersTooLarge(limit),
                other => other,
            })?;
        if n == 0 {
            return if head.is_empty() {
                Ok(None)
            } else {
                Err(HttpError::Truncated)
            };
        }

        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                // Stray empty lines between messages
                head.clear();
                continue;
            }
            return Ok(Some(head));
        }
    }
}

pub async fn read_request_head<R>(reader: &mut R, limit: usize) -> Result<Option<RequestHead>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(raw) = read_head(reader, limit).await? else {
        return Ok(None);
    };

    let (method, target, minor_version, headers) = {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut slots);
        if request.parse(&raw)?.is_partial() {
            return Err(HttpError::Truncated);
        }
        (
            request.method.unwrap_or_default().to_string(),
            request.path.unwrap_or_default().to_string(),
            request.version.unwrap_or(1),
            collect_headers(request.headers),
        )
    };

    Ok(Some(RequestHead {
        method,
        target,
        minor_version,
        headers,
        raw,
    }))
}

pub async fn read_response_head<R>(reader: &mut R, limit: usize) -> Result<Option<ResponseHead>, HttpError>
where
    R: AsyncBufRead + Unpin,
{
    let Some(raw) = read_head(reader, limit).await? else {
        return Ok(None);
    };

    let (code, minor_version, headers) = {
        let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut slots);
        if response.parse(&raw)?.is_partial() {
            return Err(HttpError::Truncated);
        }
        (
            response.code.unwrap_or_default(),
            response.version.unwrap_or(1),
            collect_headers(response.headers),
        )
    };

    Ok(Some(ResponseHead {
        code,
        minor_version,
        headers,
        raw,
    }))
}

async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, len: u64) -> Result<u64, HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = tokio::io::copy_buf(&mut (&mut *reader).take(len), writer).await?;
    if copied < len {
        return Err(HttpError::Truncated);
    }
    Ok(copied)
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W, limit: usize) -> Result<u64, HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut line = Vec::with_capacity(64);

    loop {
        line.clear();
        if read_line(reader, &mut line, limit).await? == 0 {
            return Err(HttpError::Truncated);
        }
        writer.write_all(&line).await?;
        total += line.len() as u64;

        let size = match httparse::parse_chunk_size(&line) {
            Ok(httparse::Status::Complete((_, size))) => size,
            _ => return Err(HttpError::Framing("invalid chunk size line")),
        };

        if size == 0 {
            // Trailer section up to the empty line
            loop {
                line.clear();
                if read_line(reader, &mut line, limit).await? == 0 {
                    return Err(HttpError::Truncated);
                }
                writer.write_all(&line).await?;
                total += line.len() as u64;
                if line == b"\r\n" || line == b"\n" {
                    return Ok(total);
                }
            }
        }

        let with_crlf = size
            .checked_add(2)
            .ok_or(HttpError::Framing("chunk size overflow"))?;
        total += copy_exact(reader, writer, with_crlf).await?;
    }
}

/// Forward one body exactly as framed on the wire; returns the bytes copied
pub async fn copy_body<R, W>(
    reader: &mut R,
    writer: &mut W,
    framing: BodyFraming,
    limit: usize,
) -> Result<u64, HttpError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match framing {
        BodyFraming::None => Ok(0),
        BodyFraming::Length(len) => copy_exact(reader, writer, len).await,
        BodyFraming::Chunked => copy_chunked(reader, writer, limit).await,
        BodyFraming::UntilClose => Ok(tokio::io::copy_buf(reader, writer).await?),
    }
}
