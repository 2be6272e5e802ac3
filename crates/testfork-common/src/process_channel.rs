// ProcessChannel: framed IPC between the dispatcher and a forked worker.
// The dispatcher binds a Unix domain socket, the worker connects to it, and
// both sides exchange length-prefixed frames.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

/// Upper bound on a single frame body; anything larger is treated as a
/// corrupt stream.
pub const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Message types for dispatcher ↔ worker communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageType {
    NotInitialized = -1,
    StartProcessing = 1,
    ProcessTestClass = 2,
    Stop = 3,
    TestEvent = 4,
}

impl MessageType {
    pub fn from_i32(value: i32) -> Self {
        match value {
            1 => MessageType::StartProcessing,
            2 => MessageType::ProcessTestClass,
            3 => MessageType::Stop,
            4 => MessageType::TestEvent,
            _ => MessageType::NotInitialized,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::NotInitialized => write!(f, "NotInitialized"),
            MessageType::StartProcessing => write!(f, "StartProcessing"),
            MessageType::ProcessTestClass => write!(f, "ProcessTestClass"),
            MessageType::Stop => write!(f, "Stop"),
            MessageType::TestEvent => write!(f, "TestEvent"),
        }
    }
}

/// A frame exchanged between dispatcher and worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerMessage {
    pub message_type: MessageType,
    pub body: String,
}

impl WorkerMessage {
    pub fn new(message_type: MessageType, body: impl Into<String>) -> Self {
        Self {
            message_type,
            body: body.into(),
        }
    }
}

/// Write one frame:
/// - 4 bytes: message type as little-endian i32
/// - 4 bytes: body length as little-endian u32
/// - N bytes: body as UTF-8
pub async fn write_frame<W>(writer: &mut W, message_type: MessageType, body: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body_bytes = body.as_bytes();
    anyhow::ensure!(
        body_bytes.len() <= MAX_BODY_LEN,
        "Frame body of {} bytes exceeds the {} byte limit",
        body_bytes.len(),
        MAX_BODY_LEN
    );

    let mut frame = Vec::with_capacity(8 + body_bytes.len());
    frame.extend_from_slice(&(message_type as i32).to_le_bytes());
    frame.extend_from_slice(&(body_bytes.len() as u32).to_le_bytes());
    frame.extend_from_slice(body_bytes);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the peer closed the stream at a
/// frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<WorkerMessage>>
where
    R: AsyncRead + Unpin,
{
    let mut type_buf = [0u8; 4];
    match reader.read_exact(&mut type_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("Failed to read frame header"),
    }
    let message_type = MessageType::from_i32(i32::from_le_bytes(type_buf));

    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .context("Truncated frame header")?;
    let body_len = u32::from_le_bytes(len_buf) as usize;
    anyhow::ensure!(
        body_len <= MAX_BODY_LEN,
        "Frame body length {} exceeds the {} byte limit",
        body_len,
        MAX_BODY_LEN
    );

    let mut body_buf = vec![0u8; body_len];
    reader
        .read_exact(&mut body_buf)
        .await
        .context("Truncated frame body")?;
    let body = String::from_utf8(body_buf).context("IPC message body is not valid UTF-8")?;

    Ok(Some(WorkerMessage::new(message_type, body)))
}

/// IPC channel between the dispatcher and a worker process.
///
/// The dispatcher calls [`start_server`](Self::start_server) and passes the
/// returned path to the worker, which calls [`start_client`](Self::start_client).
/// Once connected, either side can split the channel into independent read
/// and write halves.
#[derive(Default)]
pub struct ProcessChannel {
    socket_path: Option<PathBuf>,
    stream: Option<UnixStream>,
    listener: Option<UnixListener>,
}

impl ProcessChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a fresh socket inside `socket_dir`. Returns the socket path the
    /// worker should connect to.
    pub fn start_server(&mut self, socket_dir: &Path) -> Result<PathBuf> {
        let socket_path =
            socket_dir.join(format!("testfork_{}.sock", uuid::Uuid::new_v4().simple()));

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind Unix socket at {:?}", socket_path))?;

        self.socket_path = Some(socket_path.clone());
        self.listener = Some(listener);

        Ok(socket_path)
    }

    /// Accept the worker's connection, giving up after `timeout`.
    pub async fn accept(&mut self, timeout: Duration) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Server not started; call start_server first"))?;

        let (stream, _addr) = tokio::time::timeout(timeout, listener.accept())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Timed out after {:.1}s waiting for worker to connect",
                    timeout.as_secs_f64()
                )
            })?
            .context("Failed to accept connection on IPC socket")?;

        self.stream = Some(stream);
        // Only one worker ever connects.
        self.listener = None;
        Ok(())
    }

    /// Connect to the dispatcher's socket (worker side).
    pub async fn start_client(&mut self, socket_path: &Path) -> Result<()> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to IPC socket at {:?}", socket_path))?;

        self.stream = Some(stream);
        Ok(())
    }

    pub async fn send_async(&mut self, message_type: MessageType, body: &str) -> Result<()> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Channel not connected"))?;
        write_frame(stream, message_type, body).await
    }

    pub async fn receive_async(&mut self) -> Result<Option<WorkerMessage>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("Channel not connected"))?;
        read_frame(stream).await
    }

    /// Split a connected channel into read and write halves. The socket file
    /// is removed once both halves are obtained; the connection stays open.
    pub fn into_split(mut self) -> Result<(ChannelReader, ChannelWriter)> {
        let stream = self
            .stream
            .take()
            .ok_or_else(|| anyhow::anyhow!("Channel not connected"))?;
        let (read, write) = stream.into_split();
        Ok((ChannelReader { inner: read }, ChannelWriter { inner: write }))
    }
}

impl Drop for ProcessChannel {
    fn drop(&mut self) {
        if let Some(ref path) = self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Read half of a connected [`ProcessChannel`].
pub struct ChannelReader {
    inner: OwnedReadHalf,
}

impl ChannelReader {
    pub async fn receive_async(&mut self) -> Result<Option<WorkerMessage>> {
        read_frame(&mut self.inner).await
    }
}

/// Write half of a connected [`ProcessChannel`].
pub struct ChannelWriter {
    inner: OwnedWriteHalf,
}

impl ChannelWriter {
    pub async fn send_async(&mut self, message_type: MessageType, body: &str) -> Result<()> {
        write_frame(&mut self.inner, message_type, body).await
    }

    /// Half-close the connection so the peer sees end-of-stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.context("Failed to shut down IPC writer")
    }
}
