//! Async `Content-Length` framing for DAP messages.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

/// Upper bound on the `Content-Length` of a single incoming message.
pub const MAX_DAP_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Upper bound on a single header line.
pub const MAX_DAP_HEADER_LINE_BYTES: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum DapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(String),

    #[error("dap protocol error: {0}")]
    Protocol(String),
}

impl From<serde_json::Error> for DapError {
    fn from(err: serde_json::Error) -> Self {
        DapError::Json(sanitize_json_error_message(&err.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, DapError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: i64,
    #[serde(rename = "type")]
    pub message_type: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// A message queued for the client. The sequence number is assigned when it is written.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Response(Response),
    Event(Event),
}

impl Outgoing {
    pub fn response(request: &Request, success: bool, body: Option<Value>, message: Option<String>) -> Self {
        Outgoing::Response(make_response(0, request, success, body, message))
    }

    pub fn event(event: impl Into<String>, body: Option<Value>) -> Self {
        Outgoing::Event(make_event(0, event, body))
    }

    fn set_seq(&mut self, seq: i64) {
        match self {
            Outgoing::Response(response) => response.seq = seq,
            Outgoing::Event(event) => event.seq = seq,
        }
    }
}

pub fn make_response(seq: i64, request: &Request, success: bool, body: Option<Value>, message: Option<String>) -> Response {
    Response {
        seq,
        message_type: "response".to_string(),
        request_seq: request.seq,
        success,
        command: request.command.clone(),
        message,
        body,
    }
}

pub fn make_event(seq: i64, event: impl Into<String>, body: Option<Value>) -> Event {
    Event {
        seq,
        message_type: "event".to_string(),
        event: event.into(),
        body,
    }
}

/// Strip user-provided values out of a `serde_json` error message.
///
/// Quoted strings (escaped quotes included, unterminated ones to the end of the message) and the
/// first backticked segment (unknown field or variant names) are
/// replaced with `<redacted>`; launch arguments and evaluated expressions may be secret.
pub fn sanitize_json_error_message(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    let mut rest = message;
    while let Some(start) = rest.find('"') {
        out.push_str(&rest[..start + 1]);
        rest = &rest[start + 1..];

        let bytes = rest.as_bytes();
        let end = bytes.iter().enumerate().find_map(|(idx, &b)| {
            if b != b'"' {
                return None;
            }
            // A quote preceded by an odd number of backslashes is escaped.
            let backslashes = bytes[..idx].iter().rev().take_while(|&&b| b == b'\\').count();
            (backslashes % 2 == 0).then_some(idx)
        });
        let Some(end) = end else {
            out.push_str("<redacted>");
            return out;
        };
        out.push_str("<redacted>\"");
        rest = &rest[end + 1..];
    }
    out.push_str(rest);

    if let Some(start) = out.find('`') {
        if let Some(end_rel) = out[start + 1..].find('`') {
            let end = start + 1 + end_rel;
            out.replace_range(start + 1..end, "<redacted>");
        }
    }

    out
}

pub struct DapReader<R> {
    reader: BufReader<R>,
}

impl<R: AsyncRead + Unpin> DapReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    async fn read_line_limited(&mut self, max_len: usize) -> Result<Option<String>> {
        let mut buf = Vec::<u8>::new();
        loop {
            let available = self.reader.fill_buf().await?;
            if available.is_empty() {
                if buf.is_empty() {
                    return Ok(None);
                }
                break;
            }

            let newline_pos = available.iter().position(|&b| b == b'\n');
            let take = newline_pos.map(|pos| pos + 1).unwrap_or(available.len());
            if buf.len() + take > max_len {
                return Err(DapError::Protocol(format!(
                    "DAP header line exceeds maximum size ({max_len} bytes)"
                )));
            }

            buf.extend_from_slice(&available[..take]);
            self.reader.consume(take);
            if newline_pos.is_some() {
                break;
            }
        }

        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| DapError::Protocol("DAP header line is not UTF-8".to_string()))
    }

    /// Read the body of the next message. `Ok(None)` signals a clean end of stream.
    pub async fn read_raw(&mut self) -> Result<Option<Vec<u8>>> {
        let mut content_length: Option<usize> = None;
        let mut saw_header_line = false;

        loop {
            let Some(line) = self.read_line_limited(MAX_DAP_HEADER_LINE_BYTES).await? else {
                if !saw_header_line {
                    return Ok(None);
                }
                return Err(DapError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF while reading DAP headers",
                )));
            };
            saw_header_line = true;

            let trimmed = line.trim_end_matches(['\r', '\n']);
            if trimmed.is_empty() {
                break;
            }

            let Some((name, value)) = trimmed.split_once(':') else {
                continue;
            };

            if name.eq_ignore_ascii_case("Content-Length") {
                let value = value.trim();
                content_length = Some(value.parse::<usize>().map_err(|e| {
                    DapError::Protocol(format!("invalid Content-Length {value:?}: {e}"))
                })?);
            }
        }

        let Some(len) = content_length else {
            return Err(DapError::Protocol("missing Content-Length header".to_string()));
        };
        if len > MAX_DAP_MESSAGE_BYTES {
            return Err(DapError::Protocol(format!(
                "DAP message Content-Length {len} exceeds maximum allowed size {MAX_DAP_MESSAGE_BYTES}"
            )));
        }

        let mut buf = vec![0u8; len];
        self.reader.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    pub async fn read_value(&mut self) -> Result<Option<Value>> {
        let Some(bytes) = self.read_raw().await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice::<Value>(&bytes)?))
    }

    pub async fn read_request(&mut self) -> Result<Option<Request>> {
        let Some(value) = self.read_value().await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value::<Request>(value)?))
    }
}

pub struct DapWriter<W> {
    writer: W,
    next_seq: i64,
}

impl<W: AsyncWrite + Unpin> DapWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, next_seq: 1 }
    }

    pub async fn write_value(&mut self, value: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.writer
            .write_all(format!("Content-Length: {}\r\n\r\n", bytes.len()).as_bytes())
            .await?;
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Stamp `message` with the connection's next sequence number and write it.
    pub async fn write_outgoing(&mut self, mut message: Outgoing) -> Result<()> {
        message.set_seq(self.next_seq);
        self.next_seq += 1;
        let value = match &message {
            Outgoing::Response(response) => serde_json::to_value(response)?,
            Outgoing::Event(event) => serde_json::to_value(event)?,
        };
        self.write_value(&value).await
    }
}
