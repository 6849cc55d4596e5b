//! Relay client session
//!
//! One session per consumer. The fan-out only ever calls [`enqueue`];
//! the session's own writer loop ([`RelayClientSession::run`]) drains the
//! queue into the consumer transport.
//!
//! [`enqueue`]: RelayClientSession::enqueue

use std::io;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::packet::{RelayPacket, SourceKey};
use super::queue::SessionQueue;
use crate::error::CloseReason;
use crate::stats::{SessionCounters, SessionStats};

/// Upper bound on closing the transport after the loop ends
const SHUTDOWN_TIMEOUT: Duration = Duration::from_millis(500);

/// One outbound stream to one consumer
#[derive(Debug)]
pub struct RelayClientSession {
    id: u64,
    source: SourceKey,
    addr: String,
    created_at: DateTime<Utc>,
    started: Instant,
    queue: SessionQueue,
    counters: SessionCounters,
    cancel: CancellationToken,
    close_reason: Mutex<Option<CloseReason>>,
}

impl RelayClientSession {
    pub(crate) fn new(id: u64, source: SourceKey, addr: String, queue_slots: usize) -> Self {
        Self {
            id,
            source,
            addr,
            created_at: Utc::now(),
            started: Instant::now(),
            queue: SessionQueue::with_capacity(queue_slots),
            counters: SessionCounters::new(),
            cancel: CancellationToken::new(),
            close_reason: Mutex::new(None),
        }
    }

    /// Registry-unique session ID
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Source this session is attached to
    pub fn source(&self) -> SourceKey {
        self.source
    }

    /// Consumer address
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// When the session was attached
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Time since the session was attached
    pub fn duration(&self) -> Duration {
        self.started.elapsed()
    }

    /// Whether the writer loop is still running (or about to)
    pub fn is_alive(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Current statistics
    pub fn stats(&self) -> SessionStats {
        self.counters.snapshot()
    }

    /// Slots in the outbound queue
    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Why the session ended, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    /// Non-blocking hand-off from the fan-out
    pub(crate) fn enqueue(&self, packet: RelayPacket) {
        if let Some(evicted) = self.queue.push(packet) {
            self.counters.record_dropped();
            tracing::trace!(
                source = %self.source,
                client = %self.addr,
                seq = evicted.seq,
                "Dropped oldest queued packet"
            );
        }
    }

    /// Ask the writer loop to stop
    ///
    /// The first reason recorded wins; later calls only make sure the
    /// session is cancelled.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut slot = self.close_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.cancel.cancel();
    }

    /// Drain the queue into `writer` until the session ends
    ///
    /// Each write must complete within `write_timeout`. On exit the queue
    /// is released and the transport shut down. Returns the reason the
    /// session ended.
    pub async fn run<W>(&self, mut writer: W, write_timeout: Duration) -> CloseReason
    where
        W: AsyncWrite + Unpin,
    {
        let reason = loop {
            let packet = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                packet = self.queue.pop() => packet,
            };

            let write = tokio::time::timeout(write_timeout, writer.write_all(&packet.data));
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break None,
                result = write => result,
            };

            match result {
                Ok(Ok(())) => self.counters.record_sent(packet.len()),
                Ok(Err(e)) if is_disconnect(&e) => break Some(CloseReason::ClientGone),
                Ok(Err(e)) => break Some(CloseReason::WriteFailed(e.to_string())),
                Err(_) => break Some(CloseReason::WriteTimeout),
            }
        };

        // An external close already recorded its reason; our own failure
        // is recorded here.
        self.close(reason.unwrap_or(CloseReason::Shutdown));
        let reason = self.close_reason().unwrap_or(CloseReason::Shutdown);

        let discarded = self.queue.clear();
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await;

        tracing::debug!(
            source = %self.source,
            client = %self.addr,
            reason = %reason,
            discarded = discarded,
            "Session writer finished"
        );

        reason
    }
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}
