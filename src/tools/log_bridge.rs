//! Forwards kapp output to the operator log
//!
//! kapp interleaves timestamped progress lines (`3:04:05PM: message`) with
//! raw passthrough output. Lines are classified and re-logged with the
//! timestamp stripped.
//!
//! Routing is asymmetric: everything on stderr is logged as an error,
//! matched or not, while on stdout only timestamped lines are forwarded and
//! the remaining passthrough output is dropped.

use lazy_static::lazy_static;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{error, info};

lazy_static! {
    static ref PROGRESS_LINE: Regex =
        Regex::new(r"^[0-9]{1,2}:[0-9]{2}:[0-9]{2}(AM|PM):\s+(.*)$").unwrap();
}

/// Which output stream of the tool a line came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    Stdout,
    Stderr,
}

/// Severity a forwarded line is logged at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// Receiver of classified lines
pub trait LogSink: Send {
    fn emit(&mut self, severity: Severity, message: &str);
}

/// Sink writing to `tracing`, tagged with the tool and application
pub struct TracingSink {
    tool: &'static str,
    app: String,
}

impl TracingSink {
    pub fn new(tool: &'static str, app: impl Into<String>) -> Self {
        Self {
            tool,
            app: app.into(),
        }
    }
}

impl LogSink for TracingSink {
    fn emit(&mut self, severity: Severity, message: &str) {
        match severity {
            Severity::Info => info!(tool = self.tool, app = %self.app, "{}", message),
            Severity::Error => error!(tool = self.tool, app = %self.app, "{}", message),
        }
    }
}

impl LogSink for Vec<(Severity, String)> {
    fn emit(&mut self, severity: Severity, message: &str) {
        self.push((severity, message.to_string()));
    }
}

/// Classify one line; `None` means the line is dropped
pub fn classify(line: &str, channel: Channel) -> Option<(Severity, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let message = PROGRESS_LINE
        .captures(line)
        .and_then(|c| c.get(2))
        .map(|m| m.as_str());

    match (channel, message) {
        (Channel::Stderr, Some(message)) => Some((Severity::Error, message)),
        (Channel::Stderr, None) => Some((Severity::Error, line)),
        (Channel::Stdout, Some(message)) => Some((Severity::Info, message)),
        (Channel::Stdout, None) => None,
    }
}

/// Line-oriented adapter between raw tool output and a [`LogSink`]
///
/// Partial lines stay buffered until their newline arrives or the stream
/// ends.
pub struct LogBridge<S: LogSink> {
    channel: Channel,
    sink: S,
    buffer: Vec<u8>,
}

impl<S: LogSink> LogBridge<S> {
    pub fn new(channel: Channel, sink: S) -> Self {
        Self {
            channel,
            sink,
            buffer: Vec::new(),
        }
    }

    /// Feed a chunk of raw output
    pub fn write(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.forward(&line);
        }
    }

    /// Flush any trailing partial line and hand back the sink
    pub fn finish(mut self) -> S {
        if !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.forward(&line);
        }
        self.sink
    }

    fn forward(&mut self, raw: &[u8]) {
        let line = String::from_utf8_lossy(raw);
        if let Some((severity, message)) = classify(&line, self.channel) {
            self.sink.emit(severity, message);
        }
    }
}

/// Drain a reader through a bridge, returning everything that was read
pub async fn pump<R, S>(mut reader: R, mut bridge: LogBridge<S>) -> std::io::Result<(Vec<u8>, S)>
where
    R: AsyncRead + Unpin,
    S: LogSink,
{
    let mut captured = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        captured.extend_from_slice(&chunk[..n]);
        bridge.write(&chunk[..n]);
    }
    Ok((captured, bridge.finish()))
}
