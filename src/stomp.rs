//! Minimal STOMP 1.2 framing used to talk to the message broker over a
//! WebSocket.
//!
//! Only what the chat client needs is modelled: building client frames,
//! decoding server frames (several per WebSocket message are allowed, as are
//! bare EOL heart-beats) and heart-beat negotiation.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("malformed header line: {0}")]
    MalformedHeader(String),

    #[error("invalid escape sequence in header: {0}")]
    InvalidEscape(String),

    #[error("invalid content-length: {0}")]
    InvalidContentLength(String),

    #[error("frame is not terminated by NUL")]
    Unterminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Stomp,
    Connected,
    Send,
    Subscribe,
    Unsubscribe,
    Ack,
    Nack,
    Begin,
    Commit,
    Abort,
    Disconnect,
    Message,
    Receipt,
    Error,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Stomp => "STOMP",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Subscribe => "SUBSCRIBE",
            Command::Unsubscribe => "UNSUBSCRIBE",
            Command::Ack => "ACK",
            Command::Nack => "NACK",
            Command::Begin => "BEGIN",
            Command::Commit => "COMMIT",
            Command::Abort => "ABORT",
            Command::Disconnect => "DISCONNECT",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
        }
    }

    // CONNECT and CONNECTED headers are sent verbatim for 1.0 compatibility.
    fn escapes_headers(&self) -> bool {
        !matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}

impl FromStr for Command {
    type Err = FrameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let command = match s {
            "CONNECT" => Command::Connect,
            "STOMP" => Command::Stomp,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "SUBSCRIBE" => Command::Subscribe,
            "UNSUBSCRIBE" => Command::Unsubscribe,
            "ACK" => Command::Ack,
            "NACK" => Command::Nack,
            "BEGIN" => Command::Begin,
            "COMMIT" => Command::Commit,
            "ABORT" => Command::Abort,
            "DISCONNECT" => Command::Disconnect,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            other => return Err(FrameError::UnknownCommand(other.to_string())),
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
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

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = body;
        self
    }

    /// First value of a header; repeated headers after the first are ignored
    /// as STOMP 1.2 requires.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn connect(host: &str, token: &str, heartbeat: Heartbeat) -> Self {
        Frame::new(Command::Connect)
            .header("accept-version", "1.2,1.1")
            .header("host", host)
            .header("heart-beat", &heartbeat.header_value())
            .header("Authorization", &format!("Bearer {}", token))
    }

    pub fn subscribe(id: &str, destination: &str) -> Self {
        Frame::new(Command::Subscribe)
            .header("id", id)
            .header("destination", destination)
            .header("ack", "auto")
    }

    pub fn unsubscribe(id: &str) -> Self {
        Frame::new(Command::Unsubscribe).header("id", id)
    }

    pub fn send(destination: &str, json: String) -> Self {
        let length = json.len().to_string();
        Frame::new(Command::Send)
            .header("destination", destination)
            .header("content-type", "application/json")
            .header("content-length", &length)
            .with_body(json)
    }

    pub fn disconnect() -> Self {
        Frame::new(Command::Disconnect)
    }

    pub fn encode(&self) -> String {
        let escape = self.command.escapes_headers();
        let mut out = String::with_capacity(32 + self.body.len());
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
        out.push('\n');
        out.push_str(&self.body);
        out.push('\0');
        out
    }
}

/// Decodes every frame in one WebSocket text message. Heart-beats decode to
/// nothing. Fails on the first malformed frame.
pub fn decode(input: &str) -> Result<Vec<Frame>, FrameError> {
    let (frames, mut errors) = decode_lenient(input);
    if errors.is_empty() {
        Ok(frames)
    } else {
        Err(errors.swap_remove(0))
    }
}

/// Like [`decode`], but a malformed frame is skipped up to its terminating
/// NUL and decoding resumes with the next one.
pub fn decode_lenient(input: &str) -> (Vec<Frame>, Vec<FrameError>) {
    let mut frames = Vec::new();
    let mut errors = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start_matches(['\n', '\r']);
        if rest.is_empty() {
            break;
        }
        match decode_one(rest) {
            Ok((frame, remaining)) => {
                frames.push(frame);
                rest = remaining;
            }
            Err(e) => {
                errors.push(e);
                match rest.find('\0') {
                    Some(end) => rest = &rest[end + 1..],
                    None => break,
                }
            }
        }
    }
    (frames, errors)
}

fn decode_one(text: &str) -> Result<(Frame, &str), FrameError> {
    let (command_line, mut rest) = split_line(text).ok_or(FrameError::Unterminated)?;
    let command: Command = command_line.parse()?;
    let escaped = command.escapes_headers();

    let mut headers = Vec::new();
    loop {
        let (line, after) = split_line(rest).ok_or(FrameError::Unterminated)?;
        rest = after;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FrameError::MalformedHeader(line.to_string()))?;
        if escaped {
            headers.push((unescape_header(name)?, unescape_header(value)?));
        } else {
            headers.push((name.to_string(), value.to_string()));
        }
    }

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .map(|(_, v)| {
            v.trim()
                .parse::<usize>()
                .map_err(|_| FrameError::InvalidContentLength(v.clone()))
        })
        .transpose()?;

    let (body, after) = match content_length {
        Some(len) => {
            let body = rest.get(..len).ok_or(FrameError::Unterminated)?;
            let after = &rest[len..];
            let after = after.strip_prefix('\0').ok_or(FrameError::Unterminated)?;
            (body, after)
        }
        None => {
            let end = rest.find('\0').ok_or(FrameError::Unterminated)?;
            (&rest[..end], &rest[end + 1..])
        }
    };

    let frame = Frame {
        command,
        headers,
        body: body.to_string(),
    };
    Ok((frame, after))
}

fn split_line(text: &str) -> Option<(&str, &str)> {
    let idx = text.find('\n')?;
    let line = text[..idx].strip_suffix('\r').unwrap_or(&text[..idx]);
    Some((line, &text[idx + 1..]))
}

fn escape_header(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            ':' => out.push_str("\\c"),
            other => out.push(other),
        }
    }
    out
}

fn unescape_header(raw: &str) -> Result<String, FrameError> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
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
            _ => return Err(FrameError::InvalidEscape(raw.to_string())),
        }
    }
    Ok(out)
}

/// Heart-beat intervals; zero disables a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Heartbeat {
    pub outgoing: Duration,
    pub incoming: Duration,
}

impl Heartbeat {
    pub fn new(outgoing: Duration, incoming: Duration) -> Self {
        Self { outgoing, incoming }
    }

    pub fn header_value(&self) -> String {
        format!("{},{}", self.outgoing.as_millis(), self.incoming.as_millis())
    }

    pub fn parse(value: &str) -> Option<Self> {
        let (out, inc) = value.split_once(',')?;
        let out = out.trim().parse::<u64>().ok()?;
        let inc = inc.trim().parse::<u64>().ok()?;
        Some(Self::new(Duration::from_millis(out), Duration::from_millis(inc)))
    }

    /// Combines our offer with the broker's `CONNECTED` answer into the
    /// intervals actually used on this session.
    pub fn negotiate(&self, server: &Heartbeat) -> Heartbeat {
        let pick = |ours: Duration, theirs: Duration| {
            if ours.is_zero() || theirs.is_zero() {
                Duration::ZERO
            } else {
                ours.max(theirs)
            }
        };
        Heartbeat {
            outgoing: pick(self.outgoing, server.incoming),
            incoming: pick(self.incoming, server.outgoing),
        }
    }
}
