//! Presence toasts.
//!
//! Turns room-scoped `presence` events into user-facing notifications, at
//! most one per room per status change and never two for the same room
//! within the minimum interval. Pure reducer; the caller supplies the clock.
//!
//! A change that lands inside the interval is held, not lost: once the
//! interval has passed, [`PresenceNotifier::flush`] reports it if the room
//! still differs from what the user was last shown.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use pulse_core::protocol::{PRESENCE_EVENT, PresencePayload, PresenceStatus};

use crate::manager::{EventSubscription, RealtimeEvent};

/// A decoded presence event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceUpdate {
    pub room_id: String,
    pub status: PresenceStatus,
}

impl PresenceUpdate {
    /// Decode `event` if it is a well-formed presence event.
    pub fn from_event(event: &RealtimeEvent) -> Option<Self> {
        if event.name != PRESENCE_EVENT {
            return None;
        }
        match event.payload::<PresencePayload>() {
            Ok(payload) => Some(Self {
                room_id: payload.room_id,
                status: payload.status,
            }),
            Err(e) => {
                tracing::debug!(error = %e, "Malformed presence payload");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Success,
    Warning,
}

/// A toast to show. Toasts sharing an `id` collapse into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: String,
    pub room_id: String,
    pub status: PresenceStatus,
    pub level: Level,
    pub message: String,
}

impl Notification {
    fn new(room_id: &str, status: PresenceStatus) -> Self {
        let (level, message) = match status {
            PresenceStatus::Connected => (Level::Success, format!("Device {room_id} connected")),
            PresenceStatus::Disconnected => {
                (Level::Warning, format!("Device {room_id} disconnected"))
            }
        };
        Self {
            id: notification_id(room_id),
            room_id: room_id.to_string(),
            status,
            level,
            message,
        }
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Stable toast id for `room_id`.
pub fn notification_id(room_id: &str) -> String {
    format!("presence:{room_id}")
}

#[derive(Debug)]
struct PresenceRecord {
    /// Last status seen on the wire.
    status: PresenceStatus,
    /// Status of the last notification shown.
    shown: PresenceStatus,
    last_notified: Instant,
}

impl PresenceRecord {
    fn pending_since(&self) -> Option<Instant> {
        (self.status != self.shown).then_some(self.last_notified)
    }
}

#[derive(Debug)]
pub struct PresenceNotifier {
    min_interval: Duration,
    records: HashMap<String, PresenceRecord>,
}

impl PresenceNotifier {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            records: HashMap::new(),
        }
    }

    /// Fold one update in. The last-seen status always moves to
    /// `update.status`, whether or not a notification comes out.
    pub fn observe(&mut self, update: PresenceUpdate, now: Instant) -> Option<Notification> {
        let Some(record) = self.records.get_mut(&update.room_id) else {
            let notification = Notification::new(&update.room_id, update.status);
            self.records.insert(
                update.room_id,
                PresenceRecord {
                    status: update.status,
                    shown: update.status,
                    last_notified: now,
                },
            );
            return Some(notification);
        };

        let changed = record.status != update.status;
        record.status = update.status;
        if !changed {
            return None;
        }
        if now.saturating_duration_since(record.last_notified) < self.min_interval {
            tracing::debug!(room = %update.room_id, status = %update.status, "Presence toast held");
            return None;
        }
        record.shown = update.status;
        record.last_notified = now;
        Some(Notification::new(&update.room_id, update.status))
    }

    /// Earliest instant at which a held change becomes due.
    pub fn next_due(&self) -> Option<Instant> {
        self.records
            .values()
            .filter_map(PresenceRecord::pending_since)
            .min()
            .map(|at| at + self.min_interval)
    }

    /// Emit held changes whose interval has passed.
    pub fn flush(&mut self, now: Instant) -> Vec<Notification> {
        let mut due = Vec::new();
        for (room_id, record) in &mut self.records {
            let Some(since) = record.pending_since() else {
                continue;
            };
            if now.saturating_duration_since(since) < self.min_interval {
                continue;
            }
            record.shown = record.status;
            record.last_notified = now;
            due.push(Notification::new(room_id, record.status));
        }
        due.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        due
    }

    /// Last status seen for `room_id`.
    pub fn status(&self, room_id: &str) -> Option<PresenceStatus> {
        self.records.get(room_id).map(|r| r.status)
    }

    /// Consume `events` until the manager goes away, handing every
    /// notification to `notify`. Held changes are flushed when due.
    pub async fn run(mut self, mut events: EventSubscription, mut notify: impl FnMut(Notification)) {
        loop {
            let due = self.next_due();
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    let Some(update) = PresenceUpdate::from_event(&event) else {
                        continue;
                    };
                    if let Some(notification) = self.observe(update, Instant::now()) {
                        notify(notification);
                    }
                }
                _ = sleep_until(due) => {
                    for notification in self.flush(Instant::now()) {
                        notify(notification);
                    }
                }
            }
        }
    }
}

async fn sleep_until(due: Option<Instant>) {
    match due {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}
