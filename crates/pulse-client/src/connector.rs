//! Connection establishment.
//!
//! A [`Connector`] turns `(url, credential)` into a welcomed [`Connection`].
//! The session never touches a transport directly; swapping the connector is
//! how tests and embedders substitute the network.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use pulse_core::memory_transport::{self, MemoryPeer};
use pulse_core::protocol::{ServerFrame, TOKEN_PARAM};
use pulse_core::transport::TransportError;
use tokio::sync::mpsc;

use crate::net_client::{Connection, NetClient};

/// Opens authenticated connections to the push endpoint.
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `url` authenticated with `credential`, and wait up
    /// to `timeout` for the server's welcome.
    fn connect(
        &self,
        url: &str,
        credential: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Connection, TransportError>> + Send;
}

/// Append the credential to `url` as the `token` query parameter.
pub fn authenticated_url(url: &str, credential: &str) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    let token = utf8_percent_encode(credential, NON_ALPHANUMERIC);
    format!("{url}{sep}{TOKEN_PARAM}={token}")
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

/// Connects over WebSocket via [`pulse_core::ws_transport::WsTransport`].
#[cfg(feature = "native")]
#[derive(Debug, Default, Clone, Copy)]
pub struct WsConnector;

#[cfg(feature = "native")]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        credential: &str,
        timeout: Duration,
    ) -> Result<Connection, TransportError> {
        let target = authenticated_url(url, credential);
        let transport = tokio::time::timeout(
            timeout,
            pulse_core::ws_transport::WsTransport::connect(&target),
        )
        .await
        .map_err(|_| TransportError::Timeout)??;
        NetClient::from_transport(transport).handshake(timeout).await
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// One link accepted by a [`MemoryConnector`], handed to whoever plays the
/// server.
pub struct MemoryLink {
    /// Credential the client connected with.
    pub credential: String,
    /// Identity sent in the welcome frame.
    pub sid: String,
    pub peer: MemoryPeer,
}

/// In-process connector. Each successful `connect` creates a
/// [`memory_transport::pair`], welcomes the client and hands the server side
/// out through the receiver returned by [`MemoryConnector::new`].
///
/// Failures can be scripted with [`fail_next`](Self::fail_next) or made
/// permanent for a credential with [`reject`](Self::reject).
#[derive(Clone)]
pub struct MemoryConnector {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    accepted: mpsc::UnboundedSender<MemoryLink>,
    scripted: Mutex<VecDeque<TransportError>>,
    rejected: Mutex<Vec<String>>,
    // Server sides nobody claimed; held so their links stay open.
    unclaimed: Mutex<Vec<MemoryPeer>>,
    attempts: AtomicU32,
    next_sid: AtomicU64,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryLink>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let inner = MemoryInner {
            accepted,
            scripted: Mutex::new(VecDeque::new()),
            rejected: Mutex::new(Vec::new()),
            unclaimed: Mutex::new(Vec::new()),
            attempts: AtomicU32::new(0),
            next_sid: AtomicU64::new(1),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            rx,
        )
    }

    /// Make the next connection attempt fail with `err`.
    pub fn fail_next(&self, err: TransportError) {
        self.inner.scripted.lock().push_back(err);
    }

    /// Refuse every attempt made with `credential`.
    pub fn reject(&self, credential: &str) {
        self.inner.rejected.lock().push(credential.to_string());
    }

    /// Number of connection attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl Connector for MemoryConnector {
    async fn connect(
        &self,
        _url: &str,
        credential: &str,
        timeout: Duration,
    ) -> Result<Connection, TransportError> {
        self.inner.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.inner.scripted.lock().pop_front() {
            return Err(err);
        }
        if self.inner.rejected.lock().iter().any(|c| c == credential) {
            return Err(TransportError::Unauthorized("credential rejected".to_string()));
        }

        let sid = format!("mem-{}", self.inner.next_sid.fetch_add(1, Ordering::SeqCst));
        let (transport, peer) = memory_transport::pair();
        peer.send(&ServerFrame::Welcome { sid: sid.clone() });
        let connection = NetClient::from_transport(transport)
            .handshake(timeout)
            .await?;

        let link = MemoryLink {
            credential: credential.to_string(),
            sid,
            peer,
        };
        if let Err(mpsc::error::SendError(link)) = self.inner.accepted.send(link) {
            self.inner.unclaimed.lock().push(link.peer);
        }
        Ok(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;

    #[test]
    fn credential_is_percent_encoded_into_the_query() {
        assert_eq!(
            authenticated_url("ws://hub/ws", "a b/c"),
            "ws://hub/ws?token=a%20b%2Fc"
        );
        assert_eq!(
            authenticated_url("ws://hub/ws?v=2", "tok"),
            "ws://hub/ws?v=2&token=tok"
        );
    }

    #[tokio::test]
    async fn memory_connector_hands_out_the_server_side() {
        let (connector, mut links) = MemoryConnector::new();
        let conn = connector
            .connect("ws://unused", "tokA", Duration::from_secs(1))
            .await
            .unwrap();
        let link = links.recv().await.unwrap();
        assert_eq!(link.credential, "tokA");
        assert_eq!(link.sid, conn.sid);
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_come_first() {
        let (connector, _links) = MemoryConnector::new();
        connector.fail_next(TransportError::Io("refused".to_string()));
        connector.reject("stale");

        let err = assert_err!(
            connector
                .connect("ws://unused", "tokA", Duration::from_secs(1))
                .await
        );
        assert_eq!(err, TransportError::Io("refused".to_string()));

        let err = assert_err!(
            connector
                .connect("ws://unused", "stale", Duration::from_secs(1))
                .await
        );
        assert!(err.is_unauthorized());
        assert!(
            connector
                .connect("ws://unused", "tokA", Duration::from_secs(1))
                .await
                .is_ok()
        );
    }
}
