//! Transport abstraction for the push channel.
//!
//! Decouples the connection client from any specific transport (WebSocket,
//! in-process memory pair, etc.). The client crate drives a [`Transport`]
//! without caring about the underlying protocol.

use std::future::Future;

use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The remote peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server refused the credential. Retrying with the same credential
    /// cannot succeed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The server did not complete the handshake in time.
    #[error("handshake timed out")]
    Timeout,

    /// An I/O or protocol-level error.
    #[error("{0}")]
    Io(String),
}

impl TransportError {
    /// Whether this error is an authentication failure.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

/// Read half of a transport connection.
///
/// Implementations receive text frames (JSON) from the remote peer.
pub trait TransportReader: Send + 'static {
    /// Receive the next text frame.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(&mut self) -> impl Future<Output = Result<Option<String>, TransportError>> + Send;
}

/// Write half of a transport connection.
///
/// Implementations send text frames (JSON) to the remote peer.
pub trait TransportWriter: Send + 'static {
    /// Send a text frame to the remote peer.
    fn send(&mut self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Close the connection from our side.
    fn close(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A bidirectional transport that can be split into independent read and write
/// halves.
///
/// This allows the reader and writer to be moved into separate async tasks
/// for concurrent I/O.
pub trait Transport: Send + 'static {
    /// The read half produced by [`split`](Transport::split).
    type Reader: TransportReader;
    /// The write half produced by [`split`](Transport::split).
    type Writer: TransportWriter;

    /// Split the transport into independent read and write halves.
    fn split(self) -> (Self::Reader, Self::Writer);
}
