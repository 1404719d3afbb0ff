//! STOMP 1.2 text-frame codec for the push channel.
//!
//! Frames look like `COMMAND\nheader:value\n...\n\nbody\0`. Only the subset a
//! subscribing client needs is modelled; the broker is the timer server's
//! message broker reachable over a plain websocket.
//!
//! Header values are escaped (`\\`, `\n`, `\r`, `\c`) except on `CONNECT` and
//! `CONNECTED` frames, which STOMP 1.2 leaves unescaped for 1.0 compatibility.

use std::fmt::Write;

/// Error returned by [`decode_frame`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StompError {
    #[error("frame is missing its NUL terminator")]
    MissingTerminator,
    #[error("unknown STOMP command: {0}")]
    UnknownCommand(String),
    #[error("malformed header line: {0}")]
    MalformedHeader(String),
    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Send => "SEND",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
            Self::Disconnect => "DISCONNECT",
        }
    }

    fn parse(raw: &str) -> Result<Self, StompError> {
        match raw {
            "CONNECT" | "STOMP" => Ok(Self::Connect),
            "CONNECTED" => Ok(Self::Connected),
            "SUBSCRIBE" => Ok(Self::Subscribe),
            "UNSUBSCRIBE" => Ok(Self::Unsubscribe),
            "SEND" => Ok(Self::Send),
            "MESSAGE" => Ok(Self::Message),
            "RECEIPT" => Ok(Self::Receipt),
            "ERROR" => Ok(Self::Error),
            "DISCONNECT" => Ok(Self::Disconnect),
            other => Err(StompError::UnknownCommand(other.to_owned())),
        }
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

/// A single STOMP frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    /// Headers in wire order; repeated names keep the first value.
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self { command, headers: Vec::new(), body: String::new() }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_owned(), value.to_owned()));
        self
    }

    /// First value of header `name`, per STOMP 1.2 repeated-header rules.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// `CONNECT` frame with heart-beating disabled.
    #[must_use]
    pub fn connect(host: &str) -> Self {
        Self::new(Command::Connect)
            .with_header("accept-version", "1.2")
            .with_header("host", host)
            .with_header("heart-beat", "0,0")
    }

    #[must_use]
    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .with_header("id", id)
            .with_header("destination", destination)
            .with_header("ack", "auto")
    }

    #[must_use]
    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }
}

/// Encode a frame into its wire text, NUL terminator included.
#[must_use]
pub fn encode_frame(frame: &Frame) -> String {
    let escape = frame.command.escapes_headers();
    let mut out = String::with_capacity(frame.body.len() + 64);
    out.push_str(frame.command.as_str());
    out.push('\n');
    for (name, value) in &frame.headers {
        if escape {
            let _ = writeln!(out, "{}:{}", escape_header(name), escape_header(value));
        } else {
            let _ = writeln!(out, "{name}:{value}");
        }
    }
    if !frame.body.is_empty() && frame.header("content-length").is_none() {
        let _ = writeln!(out, "content-length:{}", frame.body.len());
    }
    out.push('\n');
    out.push_str(&frame.body);
    out.push('\0');
    out
}

/// Decode one frame from wire text.
///
/// Returns `Ok(None)` for a heart-beat (text made only of end-of-line bytes).
///
/// # Errors
///
/// Returns a [`StompError`] for unterminated frames, unknown commands, header
/// lines without a colon, and invalid escape sequences.
pub fn decode_frame(raw: &str) -> Result<Option<Frame>, StompError> {
    let raw = raw.trim_start_matches(['\r', '\n']);
    if raw.is_empty() {
        return Ok(None);
    }

    let Some((head, rest)) = raw
        .split_once("\n\n")
        .or_else(|| raw.split_once("\r\n\r\n"))
    else {
        return Err(StompError::MissingTerminator);
    };

    let mut lines = head.lines();
    let command = Command::parse(lines.next().unwrap_or_default().trim_end_matches('\r'))?;
    let unescape = command.escapes_headers();

    let mut headers = Vec::new();
    for line in lines {
        let line = line.trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            return Err(StompError::MalformedHeader(line.to_owned()));
        };
        if unescape {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_owned(), value.to_owned()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok());
    let body = match content_length {
        Some(len) => match (rest.get(..len), rest.get(len..)) {
            (Some(body), Some(tail)) if tail.starts_with('\0') => body,
            _ => return Err(StompError::MissingTerminator),
        },
        None => rest
            .split_once('\0')
            .map(|(body, _)| body)
            .ok_or(StompError::MissingTerminator)?,
    };

    Ok(Some(Frame { command, headers, body: body.to_owned() }))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, StompError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            _ => return Err(StompError::InvalidEscape(raw.to_owned())),
        }
    }
    Ok(out)
}

#[cfg(test)]
#[path = "stomp_test.rs"]
mod tests;
