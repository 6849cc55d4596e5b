//! Relay connection
//!
//! A connection is bound to one multicast source. It owns the ingest
//! handle and the set of attached sessions, and fans every ingested
//! payload out to those sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use super::packet::{RelayPacket, SourceKey};
use super::session::RelayClientSession;
use crate::error::CloseReason;
use crate::ingest::IngestHandle;
use crate::stats::{ConnectionStats, IngestCounters};

/// Lifecycle state of a relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepting clients and relaying
    Active,
    /// Torn down; no further attaches are accepted
    Closed,
}

/// Attached sessions, guarded together with the state so an attach can
/// never slip into a connection that is being closed
#[derive(Debug)]
struct Members {
    state: ConnectionState,
    sessions: Vec<Arc<RelayClientSession>>,
    /// Bumped on every attach and removal
    epoch: u64,
}

/// Result of removing one session from a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    /// Sessions still attached
    pub remaining: usize,
    /// Membership epoch right after the removal; an idle retire only
    /// proceeds while the epoch is unchanged
    pub(crate) epoch: u64,
}

/// Live fan-out unit for one source
#[derive(Debug)]
pub struct RelayConnection {
    source: SourceKey,
    created_at: DateTime<Utc>,
    started: Instant,
    /// Milliseconds since `started` at the last published packet
    last_activity_ms: AtomicU64,
    next_seq: AtomicU64,
    members: Mutex<Members>,
    ingest: Mutex<Option<IngestHandle>>,
    counters: IngestCounters,
}

impl RelayConnection {
    /// Create a connection with its first session already attached
    pub(crate) fn with_first_client(
        source: SourceKey,
        session_id: u64,
        client_addr: String,
        queue_slots: usize,
    ) -> (Arc<Self>, Arc<RelayClientSession>) {
        let session = Arc::new(RelayClientSession::new(
            session_id,
            source,
            client_addr,
            queue_slots,
        ));

        let conn = Arc::new(Self {
            source,
            created_at: Utc::now(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            next_seq: AtomicU64::new(0),
            members: Mutex::new(Members {
                state: ConnectionState::Active,
                sessions: vec![Arc::clone(&session)],
                epoch: 0,
            }),
            ingest: Mutex::new(None),
            counters: IngestCounters::new(),
        });

        (conn, session)
    }

    /// Source this connection relays
    pub fn source(&self) -> SourceKey {
        self.source
    }

    /// When the connection was created
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since the last packet was published (or since creation)
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    pub fn state(&self) -> ConnectionState {
        self.members.lock().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Number of attached sessions
    pub fn client_count(&self) -> usize {
        self.members.lock().sessions.len()
    }

    /// Snapshot of the attached sessions
    pub fn sessions(&self) -> Vec<Arc<RelayClientSession>> {
        self.members.lock().sessions.clone()
    }

    /// Ingest counters
    pub(crate) fn counters(&self) -> &IngestCounters {
        &self.counters
    }

    /// Ingest statistics
    pub fn stats(&self) -> ConnectionStats {
        self.counters.snapshot()
    }

    /// Attach a new session
    ///
    /// Returns `None` once the connection is closed.
    pub(crate) fn attach(
        &self,
        session_id: u64,
        client_addr: String,
        queue_slots: usize,
    ) -> Option<Arc<RelayClientSession>> {
        let mut members = self.members.lock();
        if members.state == ConnectionState::Closed {
            return None;
        }

        let session = Arc::new(RelayClientSession::new(
            session_id,
            self.source,
            client_addr,
            queue_slots,
        ));
        members.sessions.push(Arc::clone(&session));
        members.epoch += 1;
        Some(session)
    }

    /// Remove a session
    ///
    /// Returns `None` when the session was no longer attached, for example
    /// because an operator already dropped it.
    pub(crate) fn detach(&self, session: &RelayClientSession) -> Option<Departure> {
        let mut members = self.members.lock();
        let index = members.sessions.iter().position(|s| s.id() == session.id())?;
        members.sessions.remove(index);
        members.epoch += 1;
        Some(Departure {
            remaining: members.sessions.len(),
            epoch: members.epoch,
        })
    }

    /// Fan one payload out to every attached session
    ///
    /// Never waits: each session queue drops its oldest packet when full.
    /// Returns the number of sessions the packet was queued for.
    pub fn publish(&self, data: Bytes) -> usize {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let packet = RelayPacket::new(seq, data);

        self.last_activity_ms.store(
            self.started.elapsed().as_millis() as u64,
            Ordering::Relaxed,
        );
        self.counters.record_published();

        let members = self.members.lock();
        for session in &members.sessions {
            session.enqueue(packet.clone());
        }
        members.sessions.len()
    }

    /// Detach and close a single client by address
    ///
    /// Returns `None` when no such client is attached.
    pub fn remove_client(&self, client_addr: &str, reason: CloseReason) -> Option<Departure> {
        let (session, departure) = {
            let mut members = self.members.lock();
            let index = members.sessions.iter().position(|s| s.addr() == client_addr)?;
            let session = members.sessions.remove(index);
            members.epoch += 1;
            let departure = Departure {
                remaining: members.sessions.len(),
                epoch: members.epoch,
            };
            (session, departure)
        };

        session.close(reason);
        Some(departure)
    }

    /// Close every session and stop the ingest
    ///
    /// After this returns no session can be attached. Returns the sessions
    /// that were attached.
    pub fn drop_all(&self, reason: CloseReason) -> Vec<Arc<RelayClientSession>> {
        let sessions = {
            let mut members = self.members.lock();
            members.state = ConnectionState::Closed;
            std::mem::take(&mut members.sessions)
        };

        for session in &sessions {
            session.close(reason.clone());
        }
        self.stop_ingest();

        tracing::info!(
            source = %self.source,
            clients = sessions.len(),
            reason = %reason,
            "Relay connection closed"
        );

        sessions
    }

    /// Close the connection if it stayed empty since the departure that
    /// produced `epoch`
    ///
    /// Returns `true` if this call closed it.
    pub(crate) fn retire_if_idle(&self, epoch: u64) -> bool {
        {
            let mut members = self.members.lock();
            if members.state == ConnectionState::Closed
                || !members.sessions.is_empty()
                || members.epoch != epoch
            {
                return false;
            }
            members.state = ConnectionState::Closed;
        }
        self.stop_ingest();
        true
    }

    pub(crate) fn set_ingest(&self, handle: IngestHandle) {
        *self.ingest.lock() = Some(handle);
    }

    fn stop_ingest(&self) {
        if let Some(handle) = self.ingest.lock().take() {
            handle.stop();
        }
    }

    /// Management view of this connection
    pub fn info(&self) -> RelayInfo {
        let clients = self
            .members
            .lock()
            .sessions
            .iter()
            .map(|s| ClientInfo {
                addr: s.addr().to_string(),
                created_at: s.created_at(),
            })
            .collect();

        RelayInfo {
            addr: self.source.to_string(),
            created_at: self.created_at,
            clients,
        }
    }
}

/// Listing entry for one relay connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayInfo {
    pub addr: String,
    pub created_at: DateTime<Utc>,
    pub clients: Vec<ClientInfo>,
}

/// Listing entry for one client session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub addr: String,
    pub created_at: DateTime<Utc>,
}
