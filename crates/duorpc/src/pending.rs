//! # Pending Requests
//!
//! Correlates outgoing requests with their replies.
//!
//! Ids come from one monotonically increasing counter per table, so an id is
//! never handed out twice. A reply only completes a request when it arrives
//! from the connection the request went out on. A request that gives up
//! waiting leaves a marker behind; a reply that shows up later for a marked id
//! is discarded instead of being treated as unknown traffic.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::oneshot;

use duopack::Value;

use crate::error::Error;
use crate::error::Result;
use crate::message::reply_channel;
use crate::message::ConnectionId;

struct PendingRequest {
    channel: String,
    connection: Option<ConnectionId>,
    tx: oneshot::Sender<Result<Value>>,
}

/// What happened to an incoming reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Handed to the waiting caller.
    Delivered,
    /// The caller had already given up; the reply was dropped.
    Cancelled,
    /// The reply arrived on a channel that does not match the request.
    ChannelMismatch,
    /// The reply came from a connection the request was never sent to.
    WrongConnection,
    /// Nothing was waiting for this id.
    Unknown,
}

pub struct PendingTable {
    next_id: AtomicU64,
    entries: DashMap<u64, PendingRequest>,
    cancelled: DashMap<u64, (Option<ConnectionId>, Instant)>,
    marker_ttl: Duration,
}

impl PendingTable {
    pub fn new(marker_ttl: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: DashMap::new(),
            cancelled: DashMap::new(),
            marker_ttl,
        }
    }

    /// Allocates a correlation id and registers a waiter for it.
    pub fn allocate(
        &self,
        channel: &str,
        connection: Option<ConnectionId>,
    ) -> (u64, oneshot::Receiver<Result<Value>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            PendingRequest {
                channel: channel.to_string(),
                connection,
                tx,
            },
        );
        (id, rx)
    }

    /// Routes a reply that arrived on `channel` from `from` to the request it
    /// answers. The request stays pending unless this reply settles it.
    pub fn complete(
        &self,
        correlation_id: u64,
        channel: &str,
        from: Option<ConnectionId>,
        outcome: Result<Value>,
    ) -> Completion {
        if let Some(marker) = self.cancelled.get(&correlation_id) {
            if marker.0 != from {
                return Completion::WrongConnection;
            }
        }
        if self.cancelled.remove(&correlation_id).is_some() {
            return Completion::Cancelled;
        }

        let (expected_channel, expected_from) = match self.entries.get(&correlation_id) {
            Some(entry) => (reply_channel(&entry.channel, correlation_id), entry.connection),
            None => return Completion::Unknown,
        };
        if expected_from != from {
            return Completion::WrongConnection;
        }
        if expected_channel != channel {
            return Completion::ChannelMismatch;
        }

        match self.entries.remove(&correlation_id) {
            Some((_, request)) => {
                // The receiver may have been dropped by a caller that stopped
                // caring without going through `cancel`.
                let _ = request.tx.send(outcome);
                Completion::Delivered
            }
            None => Completion::Unknown,
        }
    }

    /// Stops waiting for `correlation_id` and leaves a cancellation marker.
    pub fn cancel(&self, correlation_id: u64) {
        if let Some((_, request)) = self.entries.remove(&correlation_id) {
            self.cancelled.insert(correlation_id, (request.connection, Instant::now()));
        }
        self.prune();
    }

    /// Forgets a request that never made it onto the wire.
    pub fn forget(&self, correlation_id: u64) {
        self.entries.remove(&correlation_id);
    }

    /// Fails every request sent over `connection`.
    pub fn fail_connection(&self, connection: ConnectionId, error: Error) -> usize {
        let ids: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.connection == Some(connection))
            .map(|e| *e.key())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, request)) = self.entries.remove(&id) {
                let _ = request.tx.send(Err(error.clone()));
                failed += 1;
            }
        }
        failed
    }

    /// Fails every outstanding request.
    pub fn fail_all(&self, error: Error) {
        let ids: Vec<u64> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, request)) = self.entries.remove(&id) {
                let _ = request.tx.send(Err(error.clone()));
            }
        }
    }

    /// Drops cancellation markers older than the configured TTL.
    pub fn prune(&self) {
        let ttl = self.marker_ttl;
        self.cancelled.retain(|_, (_, at)| at.elapsed() < ttl);
    }

    pub fn is_cancelled(&self, correlation_id: u64) -> bool {
        self.cancelled.contains_key(&correlation_id)
    }

    pub fn is_pending(&self, correlation_id: u64) -> bool {
        self.entries.contains_key(&correlation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_reaches_its_own_waiter() {
        let table = PendingTable::new(Duration::from_secs(60));
        let (a, mut rx_a) = table.allocate("ping", None);
        let (b, mut rx_b) = table.allocate("ping", None);
        assert_ne!(a, b);

        assert_eq!(table.complete(b, &reply_channel("ping", b), None, Ok(Value::from("b"))), Completion::Delivered);
        assert_eq!(table.complete(a, &reply_channel("ping", a), None, Ok(Value::from("a"))), Completion::Delivered);

        assert_eq!(rx_a.try_recv().unwrap().unwrap(), Value::from("a"));
        assert_eq!(rx_b.try_recv().unwrap().unwrap(), Value::from("b"));
        assert!(table.is_empty());
    }

    #[test]
    fn test_reply_on_wrong_channel_is_not_delivered() {
        let table = PendingTable::new(Duration::from_secs(60));
        let (id, mut rx) = table.allocate("ping", None);

        let outcome = table.complete(id, &reply_channel("pong", id), None, Ok(Value::Null));
        assert_eq!(outcome, Completion::ChannelMismatch);
        assert!(rx.try_recv().is_err());
        assert!(table.is_pending(id));
    }

    #[test]
    fn test_late_reply_after_cancel_is_discarded_once() {
        let table = PendingTable::new(Duration::from_secs(60));
        let (id, _rx) = table.allocate("slow", None);
        table.cancel(id);

        assert!(table.is_cancelled(id));
        assert_eq!(table.complete(id, &reply_channel("slow", id), None, Ok(Value::Null)), Completion::Cancelled);
        // A second copy of the reply is just unknown traffic.
        assert_eq!(table.complete(id, &reply_channel("slow", id), None, Ok(Value::Null)), Completion::Unknown);
    }

    #[test]
    fn test_markers_expire() {
        let table = PendingTable::new(Duration::ZERO);
        let (id, _rx) = table.allocate("slow", None);
        table.cancel(id);
        assert!(!table.is_cancelled(id));
    }

    #[test]
    fn test_fail_connection_only_touches_that_connection() {
        let table = PendingTable::new(Duration::from_secs(60));
        let (_, mut rx_a) = table.allocate("x", Some(ConnectionId(1)));
        let (_, mut rx_b) = table.allocate("x", Some(ConnectionId(2)));

        assert_eq!(table.fail_connection(ConnectionId(1), Error::ConnectionClosed), 1);
        assert!(matches!(rx_a.try_recv().unwrap(), Err(Error::ConnectionClosed)));
        assert!(rx_b.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reply_from_another_connection_is_not_delivered() {
        let table = PendingTable::new(Duration::from_secs(60));
        let (id, mut rx) = table.allocate("ask", Some(ConnectionId(1)));
        let channel = reply_channel("ask", id);

        let forged = table.complete(id, &channel, Some(ConnectionId(2)), Ok(Value::from("forged")));
        assert_eq!(forged, Completion::WrongConnection);
        assert!(rx.try_recv().is_err());
        assert!(table.is_pending(id));

        let genuine = table.complete(id, &channel, Some(ConnectionId(1)), Ok(Value::from("real")));
        assert_eq!(genuine, Completion::Delivered);
        assert_eq!(rx.try_recv().unwrap().unwrap(), Value::from("real"));
    }

    #[test]
    fn test_cancel_marker_is_only_consumed_by_its_connection() {
        let table = PendingTable::new(Duration::from_secs(60));
        let (id, _rx) = table.allocate("slow", Some(ConnectionId(1)));
        table.cancel(id);
        let channel = reply_channel("slow", id);

        assert_eq!(
            table.complete(id, &channel, Some(ConnectionId(2)), Ok(Value::Null)),
            Completion::WrongConnection
        );
        assert!(table.is_cancelled(id));
        assert_eq!(
            table.complete(id, &channel, Some(ConnectionId(1)), Ok(Value::Null)),
            Completion::Cancelled
        );
    }
}
