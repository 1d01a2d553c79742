//! Connection state machine and membership replay.
//!
//! [`ConnectionState`] is the single place where room membership meets the
//! live link. It is driven by the session task (lifecycle transitions) and by
//! consumers (`join`/`leave`), always under the manager's lock, so a
//! transition and a membership change can never interleave halfway.

use std::fmt;

use pulse_core::protocol::ClientFrame;

use crate::net_client::FrameSender;
use crate::rooms::RoomRegistry;

/// Lifecycle phase of the tab's single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No credential in the store; no connection exists.
    NoCredential,
    /// An attempt is in flight with the current credential.
    Connecting,
    /// Welcomed by the server; frames flow.
    Connected,
    /// The link dropped; a retry is pending.
    Disconnected,
    /// Retries exhausted or the credential was refused. Waits for a new
    /// credential.
    Failed,
    /// Torn down by the tab.
    Closed,
}

impl Phase {
    pub fn is_connected(self) -> bool {
        self == Phase::Connected
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::NoCredential => "no-credential",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Disconnected => "disconnected",
            Phase::Failed => "failed",
            Phase::Closed => "closed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of entering [`Phase::Connected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    /// Rooms sent as join requests, sorted.
    pub replayed: Vec<String>,
    /// `true` when this connection follows an observed drop, i.e. reconnect
    /// callbacks are due.
    pub recovered: bool,
}

#[derive(Debug)]
pub struct ConnectionState {
    phase: Phase,
    rooms: RoomRegistry,
    recovering: bool,
    link: Option<FrameSender>,
    sid: Option<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionState {
    pub fn new() -> Self {
        Self {
            phase: Phase::NoCredential,
            rooms: RoomRegistry::new(),
            recovering: false,
            link: None,
            sid: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    // ------------------------------------------------------------------
    // Membership
    // ------------------------------------------------------------------

    /// Record `room_id`. Returns `true` if a join request went out.
    pub fn join(&mut self, room_id: &str) -> bool {
        if !self.rooms.insert(room_id) {
            return false;
        }
        self.send(ClientFrame::join(room_id))
    }

    /// Forget `room_id`. Returns `true` if a leave request went out.
    pub fn leave(&mut self, room_id: &str) -> bool {
        if !self.rooms.remove(room_id) {
            return false;
        }
        self.send(ClientFrame::leave(room_id))
    }

    fn send(&self, frame: ClientFrame) -> bool {
        match &self.link {
            Some(link) if self.phase.is_connected() => link.send(frame),
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn connecting(&mut self) {
        self.phase = Phase::Connecting;
    }

    /// Enter `Connected` over `link`: replay every member room, then take
    /// the recovery flag.
    pub fn connected(&mut self, sid: String, link: FrameSender) -> Recovery {
        self.phase = Phase::Connected;
        self.sid = Some(sid);
        self.link = Some(link);

        let replayed = self.rooms.snapshot();
        for room in &replayed {
            self.send(ClientFrame::join(room));
        }
        let recovered = std::mem::take(&mut self.recovering);
        Recovery {
            replayed,
            recovered,
        }
    }

    /// The link dropped. Only a drop of a live connection arms recovery; a
    /// failed attempt does not.
    pub fn disconnected(&mut self) {
        if self.phase == Phase::Connected {
            self.recovering = true;
        }
        self.phase = Phase::Disconnected;
        self.link = None;
        self.sid = None;
    }

    /// The credential changed: the pending recovery belongs to the old
    /// session and is discarded. Membership stays, and the old link no
    /// longer counts as live.
    pub fn credential_changed(&mut self) {
        self.recovering = false;
        self.link = None;
        self.sid = None;
        self.phase = Phase::Connecting;
    }

    pub fn no_credential(&mut self) {
        self.credential_changed();
        self.phase = Phase::NoCredential;
    }

    pub fn failed(&mut self) {
        self.link = None;
        self.sid = None;
        self.phase = Phase::Failed;
    }

    /// Tear down. Returns the live link, if any, so the caller can close it.
    pub fn closed(&mut self) -> Option<FrameSender> {
        let link = self.link.take();
        self.credential_changed();
        self.phase = Phase::Closed;
        link
    }
}
