//! The controller/worker protocol: framed JSON lines with length-prefixed
//! binary streams, over any byte channel (pipes to a local child, an SSH
//! subprocess, or a TLS socket).

pub mod pool;
pub mod remote;
pub mod worker;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::errors::{Error, Result};

pub const PROTOCOL_VERSION: u32 = 1;

/// Sent by the worker on accept; the controller validates compatibility
/// before the first command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greeting {
    pub name: String,
    pub version: String,
    pub protocol: u32,
}

impl Greeting {
    pub fn new() -> Greeting {
        Greeting {
            name: "walvault".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: PROTOCOL_VERSION,
        }
    }

    pub fn check(&self) -> Result<()> {
        if self.name != "walvault" || self.protocol != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "unexpected greeting: name '{}', protocol {} (expected walvault, {})",
                self.name, self.protocol, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }
}

impl Default for Greeting {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub verb: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub seq: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl Response {
    pub fn ok(seq: u64, payload: serde_json::Value) -> Response {
        Response {
            seq,
            ok: true,
            payload: Some(payload),
            code: None,
            message: None,
            stack: None,
        }
    }

    pub fn err(seq: u64, error: &Error) -> Response {
        Response {
            seq,
            ok: false,
            payload: None,
            code: Some(error.code()),
            message: Some(format!("[{}] {error}", error.kind_name())),
            stack: None,
        }
    }

    /// Turn a remote failure back into an engine error.
    pub fn into_result(self) -> Result<serde_json::Value> {
        if self.ok {
            Ok(self.payload.unwrap_or(serde_json::Value::Null))
        } else {
            Err(Error::Protocol(format!(
                "worker error {}: {}",
                self.code.unwrap_or(-1),
                self.message.unwrap_or_else(|| "no message".to_string())
            )))
        }
    }
}

/// Header announcing `n` raw bytes follow; `{"stream":0}` closes the stream.
#[derive(Debug, Serialize, Deserialize)]
struct StreamHeader {
    stream: u64,
}

/// One end of a protocol connection.
pub struct Channel<R, W> {
    reader: BufReader<R>,
    writer: W,
    line: String,
}

/// A channel over boxed transports, the shape the pool stores.
pub type BoxChannel = Channel<
    Box<dyn AsyncRead + Send + Unpin + 'static>,
    Box<dyn AsyncWrite + Send + Unpin + 'static>,
>;

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Channel<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Channel {
            reader: BufReader::new(reader),
            writer,
            line: String::new(),
        }
    }

    pub async fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let mut frame = serde_json::to_string(value)
            .map_err(|e| Error::Protocol(format!("unable to serialize frame: {e}")))?;
        frame.push('\n');
        self.writer
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| Error::Protocol(format!("unable to write frame: {e}")))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Protocol(format!("unable to flush frame: {e}")))
    }

    /// Receive one frame. A closed channel is a protocol error; workers
    /// treat it as the signal to exit.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T> {
        self.line.clear();
        let n = self
            .reader
            .read_line(&mut self.line)
            .await
            .map_err(|e| Error::Protocol(format!("unable to read frame: {e}")))?;
        if n == 0 {
            return Err(Error::Protocol("channel closed".to_string()));
        }
        serde_json::from_str(self.line.trim_end())
            .map_err(|e| Error::Protocol(format!("invalid frame '{}': {e}", self.line.trim_end())))
    }

    /// Send a binary payload as length-prefixed chunks with an explicit
    /// close frame.
    pub async fn send_stream(&mut self, bytes: &[u8], chunk_size: usize) -> Result<()> {
        for chunk in bytes.chunks(chunk_size.max(1)) {
            self.send(&StreamHeader {
                stream: chunk.len() as u64,
            })
            .await?;
            self.writer
                .write_all(chunk)
                .await
                .map_err(|e| Error::Protocol(format!("unable to write stream chunk: {e}")))?;
        }
        self.send(&StreamHeader { stream: 0 }).await?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::Protocol(format!("unable to flush stream: {e}")))
    }

    pub async fn recv_stream(&mut self) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        loop {
            let header: StreamHeader = self.recv().await?;
            if header.stream == 0 {
                return Ok(payload);
            }
            let start = payload.len();
            payload.resize(start + header.stream as usize, 0);
            self.reader
                .read_exact(&mut payload[start..])
                .await
                .map_err(|e| Error::Protocol(format!("unable to read stream chunk: {e}")))?;
        }
    }
}
