//! In-process transport pair.
//!
//! [`pair`] returns a [`MemoryTransport`] for the client side and a
//! [`MemoryPeer`] that plays the server: it pushes [`ServerFrame`]s, reads
//! decoded [`ClientFrame`]s, and can drop the link to simulate a network loss
//! or server restart.

use tokio::sync::mpsc;

use crate::protocol::{ClientFrame, ServerFrame};
use crate::transport::{Transport, TransportError, TransportReader, TransportWriter};

/// Create a connected client transport / server peer pair.
pub fn pair() -> (MemoryTransport, MemoryPeer) {
    let (to_client_tx, to_client_rx) = mpsc::unbounded_channel();
    let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
    (
        MemoryTransport {
            reader: MemoryReader { rx: to_client_rx },
            writer: MemoryWriter {
                tx: Some(to_server_tx),
            },
        },
        MemoryPeer {
            tx: Some(to_client_tx),
            rx: to_server_rx,
        },
    )
}

/// Client side of an in-process link.
pub struct MemoryTransport {
    reader: MemoryReader,
    writer: MemoryWriter,
}

impl Transport for MemoryTransport {
    type Reader = MemoryReader;
    type Writer = MemoryWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (self.reader, self.writer)
    }
}

pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<String>,
}

impl TransportReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<String>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl TransportWriter for MemoryWriter {
    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(text.to_string())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// Server side of an in-process link.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<String>>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    /// Deliver a frame to the client. Returns `false` once the link is closed.
    pub fn send(&self, frame: &ServerFrame) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match serde_json::to_string(frame) {
            Ok(json) => tx.send(json).is_ok(),
            Err(_) => false,
        }
    }

    /// Deliver a raw text frame (for exercising the client's parser).
    pub fn send_raw(&self, text: &str) -> bool {
        self.tx
            .as_ref()
            .is_some_and(|tx| tx.send(text.to_string()).is_ok())
    }

    /// Await the next frame from the client.
    ///
    /// Returns `None` once the client has closed its side. Undecodable frames
    /// are skipped.
    pub async fn recv(&mut self) -> Option<ClientFrame> {
        loop {
            let text = self.rx.recv().await?;
            if let Ok(frame) = serde_json::from_str(&text) {
                return Some(frame);
            }
        }
    }

    /// Take the next frame from the client without waiting.
    pub fn try_recv(&mut self) -> Option<ClientFrame> {
        while let Ok(text) = self.rx.try_recv() {
            if let Ok(frame) = serde_json::from_str(&text) {
                return Some(frame);
            }
        }
        None
    }

    /// Drop the server side of the link. The client reader sees a clean
    /// close.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Whether the client has closed its side.
    pub fn is_client_closed(&self) -> bool {
        self.rx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn frames_cross_the_pair_in_both_directions() {
        let (transport, mut peer) = pair();
        let (mut reader, mut writer) = transport.split();

        assert!(peer.send(&ServerFrame::Welcome {
            sid: "s1".to_string()
        }));
        let text = assert_ok!(reader.recv().await).unwrap();
        assert_eq!(text, r#"{"type":"welcome","sid":"s1"}"#);

        assert_ok!(writer.send(r#"{"type":"join-room","roomId":"dev1"}"#).await);
        assert_eq!(peer.recv().await, Some(ClientFrame::join("dev1")));
    }

    #[tokio::test]
    async fn peer_close_reads_as_clean_end_of_stream() {
        let (transport, mut peer) = pair();
        let (mut reader, _writer) = transport.split();

        peer.close();
        assert_eq!(assert_ok!(reader.recv().await), None);
        assert!(!peer.send(&ServerFrame::Pong));
    }

    #[tokio::test]
    async fn writer_close_ends_the_peer_stream() {
        let (transport, mut peer) = pair();
        let (_reader, mut writer) = transport.split();

        assert_ok!(writer.close().await);
        assert_eq!(peer.recv().await, None);
        assert_err!(writer.send("{}").await);
    }
}
