//! Framework-agnostic push-channel client.
//!
//! Spawns background reader/writer tasks and exposes channels so that the
//! session can send and receive frames without owning the transport
//! directly.
//!
//! Use [`NetClient::from_transport`] to construct a client over any
//! [`Transport`] implementation, then [`NetClient::handshake`] to wait for the
//! server's welcome and obtain a [`Connection`].

use std::time::Duration;

use pulse_core::protocol::{ClientFrame, ServerFrame};
use pulse_core::transport::{Transport, TransportError, TransportReader, TransportWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// ---------------------------------------------------------------------------
// Wire-level parsing
// ---------------------------------------------------------------------------

/// Outcome of parsing one text frame.
#[derive(Debug)]
pub enum ServerLine {
    /// A successfully deserialized frame.
    Frame(ServerFrame),
    /// Blank frame, skipped.
    Empty,
    /// Couldn't parse the frame (kept as raw text for logging).
    Unknown(String),
}

/// Parse a raw text frame received from the server.
pub fn parse_server_line(line: &str) -> ServerLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ServerLine::Empty;
    }
    match serde_json::from_str::<ServerFrame>(trimmed) {
        Ok(frame) => ServerLine::Frame(frame),
        Err(_) => ServerLine::Unknown(trimmed.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Channel-based network events
// ---------------------------------------------------------------------------

/// High-level events produced by the background reader task.
#[derive(Debug)]
pub enum NetEvent {
    /// A successfully parsed [`ServerFrame`].
    Frame(ServerFrame),
    /// An unrecognized frame from the server (kept for logging).
    Unknown(String),
    /// The server closed the connection cleanly.
    Disconnected,
    /// An I/O error occurred on the connection.
    Error(String),
}

/// Instructions for the writer task.
#[derive(Debug)]
pub enum WriterCommand {
    Frame(ClientFrame),
    Close,
}

/// Cloneable, non-blocking handle for enqueueing frames.
///
/// Sends never block and never fail loudly: once the writer task is gone the
/// frame is dropped and `send` returns `false`.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::UnboundedSender<WriterCommand>,
}

impl FrameSender {
    /// A sender whose commands land in the returned receiver instead of a
    /// transport.
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<WriterCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, frame: ClientFrame) -> bool {
        self.tx.send(WriterCommand::Frame(frame)).is_ok()
    }

    /// Ask the writer task to close the transport.
    pub fn close(&self) {
        let _ = self.tx.send(WriterCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

// ---------------------------------------------------------------------------
// NetClient
// ---------------------------------------------------------------------------

/// A channel-based client over one transport link.
///
/// The returned client exposes:
/// - [`incoming`](NetClient::incoming): an [`mpsc::UnboundedReceiver<NetEvent>`]
///   for server events.
/// - [`sender`](NetClient::sender): a cloneable [`FrameSender`] to enqueue
///   a [`ClientFrame`] for transmission.
///
/// Dropping the client closes the link.
pub struct NetClient {
    /// Receive parsed server events.
    pub incoming: mpsc::UnboundedReceiver<NetEvent>,
    outgoing: FrameSender,
    reader: JoinHandle<()>,
}

impl NetClient {
    /// Create a `NetClient` over any [`Transport`] implementation.
    ///
    /// Splits the transport into read/write halves, spawns background tasks,
    /// and returns the ready-to-use client. No frames are sent.
    pub fn from_transport<T: Transport>(transport: T) -> Self {
        let (reader, writer) = transport.split();

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (outgoing, cmd_rx) = FrameSender::detached();

        let reader = Self::spawn_reader_task(reader, event_tx);
        Self::spawn_writer_task(writer, cmd_rx);

        Self {
            incoming: event_rx,
            outgoing,
            reader,
        }
    }

    pub fn sender(&self) -> FrameSender {
        self.outgoing.clone()
    }

    /// Enqueue a [`ClientFrame`] for transmission to the server.
    pub fn send(&self, frame: ClientFrame) -> bool {
        self.outgoing.send(frame)
    }

    /// Wait for the server's `welcome` frame.
    ///
    /// An `error` frame before the welcome is treated as a refused
    /// credential. Frames that are neither are skipped.
    pub async fn handshake(mut self, timeout: Duration) -> Result<Connection, TransportError> {
        let wait = async {
            loop {
                match self.incoming.recv().await {
                    Some(NetEvent::Frame(ServerFrame::Welcome { sid })) => return Ok(sid),
                    Some(NetEvent::Frame(ServerFrame::Error { message })) => {
                        return Err(TransportError::Unauthorized(message));
                    }
                    Some(NetEvent::Frame(other)) => {
                        tracing::debug!(?other, "Frame before welcome, skipping");
                    }
                    Some(NetEvent::Unknown(raw)) => {
                        tracing::debug!(raw = %raw, "Unparseable frame before welcome");
                    }
                    Some(NetEvent::Error(e)) => return Err(TransportError::Io(e)),
                    Some(NetEvent::Disconnected) | None => {
                        return Err(TransportError::ConnectionClosed);
                    }
                }
            }
        };
        let sid = tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| TransportError::Timeout)??;
        Ok(Connection { sid, client: self })
    }

    /// Close the link. Further sends are dropped.
    pub fn close(&self) {
        self.outgoing.close();
    }

    // ------------------------------------------------------------------
    // Private: background task spawners
    // ------------------------------------------------------------------

    /// Spawn the generic reader task that reads from any [`TransportReader`].
    fn spawn_reader_task<R: TransportReader>(
        mut reader: R,
        event_tx: mpsc::UnboundedSender<NetEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(Some(line)) => {
                        let event = match parse_server_line(&line) {
                            ServerLine::Frame(frame) => NetEvent::Frame(frame),
                            ServerLine::Unknown(raw) => NetEvent::Unknown(raw),
                            ServerLine::Empty => continue,
                        };
                        if event_tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        let _ = event_tx.send(NetEvent::Disconnected);
                        break;
                    }
                    Err(e) => {
                        let _ = event_tx.send(NetEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        })
    }

    /// Spawn the generic writer task that writes to any [`TransportWriter`].
    ///
    /// The task ends (closing the transport) on [`WriterCommand::Close`] or
    /// once every [`FrameSender`] is dropped.
    fn spawn_writer_task<W: TransportWriter>(
        mut writer: W,
        mut cmd_rx: mpsc::UnboundedReceiver<WriterCommand>,
    ) {
        tokio::spawn(async move {
            while let Some(cmd) = cmd_rx.recv().await {
                let frame = match cmd {
                    WriterCommand::Frame(frame) => frame,
                    WriterCommand::Close => break,
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(j) => j,
                    Err(_) => continue,
                };
                if writer.send(&json).await.is_err() {
                    break;
                }
            }
            let _ = writer.close().await;
        });
    }
}

impl Drop for NetClient {
    fn drop(&mut self) {
        self.outgoing.close();
        self.reader.abort();
    }
}

/// An established, welcomed connection.
pub struct Connection {
    /// Identity the server assigned to this connection.
    pub sid: String,
    client: NetClient,
}

impl Connection {
    pub fn sender(&self) -> FrameSender {
        self.client.sender()
    }

    /// Await the next event. `None` means the reader task is gone.
    pub async fn recv(&mut self) -> Option<NetEvent> {
        self.client.incoming.recv().await
    }

    pub fn close(&self) {
        self.client.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("sid", &self.sid).finish()
    }
}
