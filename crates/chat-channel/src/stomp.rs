//! STOMP 1.2 text frame codec
//!
//! A frame is `COMMAND\n(header:value\n)*\n body \0`. Only the subset the
//! chat channel needs is modelled: the client frames it sends and the server
//! frames it reacts to. Header values are escaped per 1.2 except on
//! `CONNECT`/`CONNECTED`, which the protocol leaves raw.

use std::fmt;

use crate::error::{Error, Result};

pub const ACCEPT_VERSION: &str = "1.2";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    fn as_str(self) -> &'static str {
        match self {
            Self::Connect => "CONNECT",
            Self::Connected => "CONNECTED",
            Self::Send => "SEND",
            Self::Subscribe => "SUBSCRIBE",
            Self::Unsubscribe => "UNSUBSCRIBE",
            Self::Disconnect => "DISCONNECT",
            Self::Message => "MESSAGE",
            Self::Receipt => "RECEIPT",
            Self::Error => "ERROR",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            // STOMP is the 1.2 alias for CONNECT
            "CONNECT" | "STOMP" => Self::Connect,
            "CONNECTED" => Self::Connected,
            "SEND" => Self::Send,
            "SUBSCRIBE" => Self::Subscribe,
            "UNSUBSCRIBE" => Self::Unsubscribe,
            "DISCONNECT" => Self::Disconnect,
            "MESSAGE" => Self::Message,
            "RECEIPT" => Self::Receipt,
            "ERROR" => Self::Error,
            _ => return None,
        })
    }

    fn escapes_headers(self) -> bool {
        !matches!(self, Self::Connect | Self::Connected)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Frame {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    /// First occurrence wins, as 1.2 requires for repeated headers.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Handshake frame. `authorization` is the full header value.
    pub fn connect(host: &str, heartbeat_ms: u64, authorization: &str) -> Self {
        Self::new(Command::Connect)
            .header("accept-version", ACCEPT_VERSION)
            .header("host", host)
            .header("heart-beat", format!("{heartbeat_ms},{heartbeat_ms}"))
            .header("Authorization", authorization)
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Self::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Self::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, json: String) -> Self {
        Self::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .body(json)
    }

    pub fn disconnect() -> Self {
        Self::new(Command::Disconnect)
    }

    /// Serialize to wire text, NUL-terminated.
    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(64 + self.body.len());
        out.push_str(self.command.as_str());
        out.push('\n');
        for (name, value) in &self.headers {
            if escape {
                out.push_str(&escape_header(name));
                out.push(':');
                out.push_str(&escape_header(value));
            } else {
                out.push_str(name);
                out.push(':');
                out.push_str(value);
            }
            out.push('\n');
        }
        if !self.body.is_empty() && self.get("content-length").is_none() {
            out.push_str(&format!("content-length:{}\n", self.body.len()));
        }
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }

    /// Parse one frame from wire text.
    ///
    /// `Ok(None)` for a heart-beat (text made only of end-of-line bytes).
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let text = text.trim_start_matches(['\r', '\n']);
        if text.is_empty() {
            return Ok(None);
        }

        let (head, rest) = match text.find("\n\n") {
            Some(i) => (&text[..i], &text[i + 2..]),
            None => match text.find("\r\n\r\n") {
                Some(i) => (&text[..i], &text[i + 4..]),
                None => return Err(Error::MalformedFrame("missing header terminator".into())),
            },
        };

        let mut lines = head.lines();
        let command_line = lines.next().unwrap_or_default().trim_end_matches('\r');
        let command = Command::parse(command_line)
            .ok_or_else(|| Error::MalformedFrame(format!("unknown command {command_line:?}")))?;

        let mut headers = Vec::new();
        for line in lines {
            let line = line.trim_end_matches('\r');
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| Error::MalformedFrame(format!("bad header line {line:?}")))?;
            if command.escapes_headers() {
                headers.push((unescape_header(name)?, unescape_header(value)?));
            } else {
                headers.push((name.to_string(), value.to_string()));
            }
        }

        let frame = Self {
            command,
            headers,
            body: String::new(),
        };
        let body = match frame.get("content-length") {
            Some(len) => {
                let len: usize = len
                    .parse()
                    .map_err(|_| Error::MalformedFrame(format!("bad content-length {len:?}")))?;
                rest.get(..len)
                    .ok_or_else(|| Error::MalformedFrame("body shorter than content-length".into()))?
            }
            None => match rest.find('\0') {
                Some(end) => &rest[..end],
                None => return Err(Error::MalformedFrame("missing NUL terminator".into())),
            },
        };
        Ok(Some(Self {
            body: body.to_string(),
            ..frame
        }))
    }
}

fn escape_header(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            c => out.push(c),
        }
    }
    out
}

fn unescape_header(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('c') => out.push(':'),
            other => {
                return Err(Error::MalformedFrame(format!(
                    "undefined header escape \\{}",
                    other.map(String::from).unwrap_or_default()
                )));
            }
        }
    }
    Ok(out)
}
