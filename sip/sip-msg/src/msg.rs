use crate::header::typed::ContentLength;
use crate::header::{Headers, Name};
use crate::uri::SipUri;
use crate::{MessageError, Method, StatusCode};
use bytes::{BufMut, Bytes, BytesMut};
use bytesstr::BytesStr;
use std::fmt;
use std::str::FromStr;

/// Start line of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: SipUri,
}

impl FromStr for RequestLine {
    type Err = MessageError;

    fn from_str(i: &str) -> Result<Self, Self::Err> {
        let mut parts = i.trim().split_whitespace();

        let (Some(method), Some(uri), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(MessageError::InvalidStartLine(i.into()));
        };

        if version != "SIP/2.0" {
            return Err(MessageError::InvalidStartLine(i.into()));
        }

        Ok(Self {
            method: Method::from_token(method),
            uri: uri.parse()?,
        })
    }
}

impl fmt::Display for RequestLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} SIP/2.0", self.method, self.uri)
    }
}

/// Start line of a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: Option<BytesStr>,
}

impl FromStr for StatusLine {
    type Err = MessageError;

    fn from_str(i: &str) -> Result<Self, Self::Err> {
        let rem = i
            .trim()
            .strip_prefix("SIP/2.0")
            .ok_or_else(|| MessageError::InvalidStartLine(i.into()))?
            .trim_start();

        let (code, reason) = match rem.split_once(' ') {
            Some((code, reason)) => (code, reason.trim()),
            None => (rem, ""),
        };

        let code = code
            .parse::<u16>()
            .map_err(|_| MessageError::InvalidStartLine(i.into()))?;

        if !(100..700).contains(&code) {
            return Err(MessageError::InvalidStartLine(i.into()));
        }

        Ok(Self {
            code: StatusCode::new(code),
            reason: (!reason.is_empty()).then(|| reason.into()),
        })
    }
}

impl fmt::Display for StatusLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SIP/2.0 {}", self.code)?;

        match &self.reason {
            Some(reason) => write!(f, " {reason}"),
            None => match self.code.text() {
                Some(text) => write!(f, " {text}"),
                None => Ok(()),
            },
        }
    }
}

/// Start line of any message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageLine {
    Request(RequestLine),
    Status(StatusLine),
}

impl MessageLine {
    pub fn is_request(&self) -> bool {
        matches!(self, MessageLine::Request(_))
    }

    pub fn request_method(&self) -> Option<&Method> {
        match self {
            MessageLine::Request(line) => Some(&line.method),
            MessageLine::Status(_) => None,
        }
    }
}

impl fmt::Display for MessageLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageLine::Request(line) => write!(f, "{line}"),
            MessageLine::Status(line) => write!(f, "{line}"),
        }
    }
}

/// A SIP request under construction
#[derive(Debug, Clone)]
pub struct Request {
    pub line: RequestLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Request {
    pub fn new(method: Method, uri: SipUri) -> Self {
        Self {
            line: RequestLine { method, uri },
            headers: Headers::with_capacity(8),
            body: Bytes::new(),
        }
    }
}

/// A SIP response under construction
#[derive(Debug, Clone)]
pub struct Response {
    pub line: StatusLine,
    pub headers: Headers,
    pub body: Bytes,
}

/// A parsed SIP message
#[derive(Debug, Clone)]
pub struct Message {
    pub line: MessageLine,
    pub headers: Headers,
    pub body: Bytes,
}

impl Message {
    /// Parse a complete message from a buffer.
    ///
    /// The buffer must contain the whole message; the transport is message
    /// framed so partial messages never reach the codec. The body length is
    /// validated against `Content-Length` when the header is present.
    pub fn parse(src: &Bytes) -> Result<Message, MessageError> {
        let head_end = find_head_end(src).ok_or(MessageError::TruncatedHeaders)?;

        let head = std::str::from_utf8(&src[..head_end])
            .map_err(|_| MessageError::InvalidEncoding)?;

        let mut lines = unfold_lines(head);

        let start_line = lines.next().ok_or(MessageError::MissingStartLine)?;

        let line = if start_line.starts_with("SIP/2.0") {
            MessageLine::Status(start_line.parse()?)
        } else {
            MessageLine::Request(start_line.parse()?)
        };

        let mut headers = Headers::with_capacity(8);

        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| MessageError::InvalidHeaderLine(line.clone().into()))?;

            headers.insert(Name::from_wire(name), value.trim());
        }

        let body = src.slice(head_end + 4..);

        if let Some(Ok(ContentLength(expected))) = headers.try_get_named::<ContentLength>() {
            if body.len() < expected {
                return Err(MessageError::InvalidContentLength {
                    expected,
                    actual: body.len(),
                });
            }

            return Ok(Message {
                line,
                headers,
                body: body.slice(..expected),
            });
        }

        Ok(Message {
            line,
            headers,
            body,
        })
    }

    /// Serialize the message, recomputing `Content-Length` from the body
    pub fn print(&self) -> Bytes {
        print_message(&self.line, &self.headers, &self.body)
    }
}

pub(crate) fn print_message(line: &dyn fmt::Display, headers: &Headers, body: &[u8]) -> Bytes {
    use std::fmt::Write;

    let mut headers = headers.clone();
    headers.set(Name::CONTENT_LENGTH, body.len().to_string());

    let mut buffer = BytesMut::new();

    // writing to BytesMut is infallible
    let _ = write!(buffer, "{line}\r\n{headers}\r\n");

    buffer.put_slice(body);
    buffer.freeze()
}

impl Request {
    pub fn print(&self) -> Bytes {
        print_message(&self.line, &self.headers, &self.body)
    }
}

impl Response {
    pub fn print(&self) -> Bytes {
        print_message(&self.line, &self.headers, &self.body)
    }
}

/// Offset of the `\r\n\r\n` separating head from body
fn find_head_end(src: &[u8]) -> Option<usize> {
    memchr::memmem::find(src, b"\r\n\r\n")
}

/// Iterate header lines, joining folded continuation lines
fn unfold_lines(head: &str) -> impl Iterator<Item = String> + '_ {
    let mut lines = head.split("\r\n").peekable();

    std::iter::from_fn(move || {
        let mut line = lines.next()?.to_string();

        while let Some(next) = lines.peek() {
            if next.starts_with(' ') || next.starts_with('\t') {
                line.push(' ');
                line.push_str(lines.next().unwrap_or_default().trim());
            } else {
                break;
            }
        }

        Some(line)
    })
}
