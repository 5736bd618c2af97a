//! Outbound delivery queue.
//!
//! Items are grouped into priority fleets (smaller value = served first) and
//! kept FIFO within a fleet. Lifecycle of one item:
//!
//! ```text
//!   enqueue ──> Virgin ──next()──> MarkedSent ──(write error / no ack
//!                                      │          within expiry)──> Failed
//!                                      └──acknowledge()──> delivered (message cleared)
//! ```
//!
//! `purge` removes delivered items, and Failed items once `expiry` has passed
//! since enqueue. A removed item that was never delivered and never handed
//! back through [`DeliveryQueue::take_for_store`] is returned as stranded so
//! the caller can store it for later.
//!
//! A single lock guards the fleets; it is held only while the lists are
//! mutated, never across I/O.

use std::collections::{BTreeMap, VecDeque};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use sg_proto::{codec, CertifiedMessage, ProtoError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Virgin,
    MarkedSent,
    Failed,
}

/// Snapshot of one queue entry.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: u64,
    pub priority: i32,
    /// Receipt token (base64 signature) of the message.
    pub signature: String,
    /// Encoded wire document.
    pub packet: Bytes,
    pub enqueued_at: DateTime<Utc>,
    pub state: DeliveryState,
    pub delivered: bool,
}

/// An item removed by [`DeliveryQueue::purge`].
#[derive(Debug)]
pub struct Purged {
    pub item: QueueItem,
    /// The message, if it still needs to be stored for later.
    pub stranded: Option<CertifiedMessage>,
}

struct Entry {
    id: u64,
    priority: i32,
    message: Option<CertifiedMessage>,
    packet: Bytes,
    signature: String,
    enqueued_at: DateTime<Utc>,
    sent_at: Option<DateTime<Utc>>,
    state: DeliveryState,
    surfaced: bool,
}

impl Entry {
    fn snapshot(&self) -> QueueItem {
        QueueItem {
            id: self.id,
            priority: self.priority,
            signature: self.signature.clone(),
            packet: self.packet.clone(),
            enqueued_at: self.enqueued_at,
            state: self.state,
            delivered: self.message.is_none(),
        }
    }

    fn is_claimable(&self) -> bool {
        self.state == DeliveryState::Virgin && self.message.is_some()
    }
}

#[derive(Default)]
struct Fleets {
    next_id: u64,
    by_priority: BTreeMap<i32, VecDeque<Entry>>,
}

impl Fleets {
    fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.by_priority.values().flat_map(|fleet| fleet.iter())
    }

    fn entries_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.by_priority.values_mut().flat_map(|fleet| fleet.iter_mut())
    }

    fn find_mut(&mut self, id: u64) -> Option<&mut Entry> {
        self.entries_mut().find(|e| e.id == id)
    }
}

pub struct DeliveryQueue {
    inner: Mutex<Fleets>,
    expiry: Duration,
}

impl DeliveryQueue {
    pub fn new(expiry: Duration) -> Self {
        Self {
            inner: Mutex::new(Fleets::default()),
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Append a message to its priority fleet as Virgin.
    ///
    /// A message whose signature is already queued, undelivered and not
    /// Failed is not added twice; the existing item is returned instead. A
    /// Failed copy does not count, so a message handed back for storing can
    /// be queued again.
    pub fn enqueue(&self, message: CertifiedMessage, priority: i32) -> Result<QueueItem, ProtoError> {
        let packet = codec::encode(&message)?;
        let signature = message.receipt_token();
        let now = Utc::now();

        let mut inner = self.inner.lock();
        if let Some(existing) = inner.entries().find(|e| {
            e.message.is_some() && e.state != DeliveryState::Failed && e.signature == signature
        }) {
            debug!(id = existing.id, "duplicate message not queued again");
            return Ok(existing.snapshot());
        }

        inner.next_id += 1;
        let entry = Entry {
            id: inner.next_id,
            priority,
            message: Some(message),
            packet,
            signature,
            enqueued_at: now,
            sent_at: None,
            state: DeliveryState::Virgin,
            surfaced: false,
        };
        let item = entry.snapshot();
        inner.by_priority.entry(priority).or_default().push_back(entry);
        Ok(item)
    }

    /// Claim the first Virgin item for transmission, marking it MarkedSent in
    /// the same critical section. Each item is handed out at most once.
    pub fn next(&self) -> Option<QueueItem> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let entry = inner.entries_mut().find(|e| e.is_claimable())?;
        entry.state = DeliveryState::MarkedSent;
        entry.sent_at = Some(now);
        Some(entry.snapshot())
    }

    /// Record a completed write for a claimed item; the expiry clock for
    /// its acknowledgement starts now.
    pub fn mark_sent(&self, id: u64) -> bool {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        match inner.find_mut(id) {
            Some(entry) if entry.state == DeliveryState::MarkedSent => {
                entry.sent_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// MarkedSent → Failed. Any other state is left untouched.
    pub fn mark_failed(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.find_mut(id) {
            Some(entry) if entry.state == DeliveryState::MarkedSent => {
                entry.state = DeliveryState::Failed;
                true
            }
            _ => false,
        }
    }

    /// Hand a Failed, undelivered message back for storing. Returns it only
    /// once; a later purge will not report it as stranded.
    pub fn take_for_store(&self, id: u64) -> Option<CertifiedMessage> {
        let mut inner = self.inner.lock();
        let entry = inner.find_mut(id)?;
        if entry.state != DeliveryState::Failed || entry.surfaced {
            return None;
        }
        let message = entry.message.clone()?;
        entry.surfaced = true;
        Some(message)
    }

    /// Clear the message whose receipt token matches. Returns `false` for
    /// unknown or already delivered messages, and for copies already handed
    /// back through [`take_for_store`](Self::take_for_store).
    pub fn acknowledge(&self, signature: &str) -> bool {
        let mut inner = self.inner.lock();
        let entry = inner
            .entries_mut()
            .find(|e| !e.surfaced && e.message.is_some() && e.signature == signature);
        match entry {
            Some(entry) => {
                entry.message = None;
                true
            }
            None => false,
        }
    }

    /// Time out stale sends, then remove delivered and expired Failed items.
    pub fn purge(&self, now: DateTime<Utc>) -> Vec<Purged> {
        let expiry = self.expiry;
        let mut purged = Vec::new();
        let mut inner = self.inner.lock();

        for fleet in inner.by_priority.values_mut() {
            let mut kept = VecDeque::with_capacity(fleet.len());
            for mut entry in fleet.drain(..) {
                if entry.state == DeliveryState::MarkedSent
                    && entry.message.is_some()
                    && entry.sent_at.map_or(false, |sent| now - sent > expiry)
                {
                    debug!(id = entry.id, "no acknowledgement within expiry, marking failed");
                    entry.state = DeliveryState::Failed;
                }

                if entry.message.is_none() {
                    purged.push(Purged {
                        item: entry.snapshot(),
                        stranded: None,
                    });
                } else if entry.state == DeliveryState::Failed && now - entry.enqueued_at > expiry {
                    let item = entry.snapshot();
                    let stranded = if entry.surfaced { None } else { entry.message.take() };
                    purged.push(Purged { item, stranded });
                } else {
                    kept.push_back(entry);
                }
            }
            *fleet = kept;
        }
        inner.by_priority.retain(|_, fleet| !fleet.is_empty());
        purged
    }

    /// Remove every message that was never handed to the gate.
    pub fn drain_virgin(&self) -> Vec<CertifiedMessage> {
        let mut drained = Vec::new();
        let mut inner = self.inner.lock();
        for fleet in inner.by_priority.values_mut() {
            fleet.retain_mut(|entry| {
                if entry.is_claimable() {
                    if let Some(message) = entry.message.take() {
                        drained.push(message);
                    }
                    false
                } else {
                    true
                }
            });
        }
        inner.by_priority.retain(|_, fleet| !fleet.is_empty());
        drained
    }

    pub fn state_of(&self, id: u64) -> Option<DeliveryState> {
        self.inner.lock().entries().find(|e| e.id == id).map(|e| e.state)
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.inner.lock().entries().map(Entry::snapshot).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use sg_proto::{Envelope, SealedMessage};

    use super::*;

    fn message(tag: u8) -> CertifiedMessage {
        CertifiedMessage {
            sealed: SealedMessage {
                envelope: Envelope::new("alice".into(), "bob".into()),
                data: vec![tag; 8],
                key: None,
            },
            signature: vec![tag; 64],
        }
    }

    fn queue() -> DeliveryQueue {
        DeliveryQueue::new(Duration::seconds(600))
    }

    #[test]
    fn priority_then_fifo_order() {
        let q = queue();
        let a = q.enqueue(message(1), 5).unwrap();
        let b = q.enqueue(message(2), 1).unwrap();
        let c = q.enqueue(message(3), 5).unwrap();
        let d = q.enqueue(message(4), 1).unwrap();

        let order: Vec<u64> = std::iter::from_fn(|| q.next()).map(|i| i.id).collect();
        assert_eq!(order, vec![b.id, d.id, a.id, c.id]);
    }

    #[test]
    fn claim_marks_sent_once() {
        let q = queue();
        let item = q.enqueue(message(1), 0).unwrap();
        assert_eq!(item.state, DeliveryState::Virgin);

        let claimed = q.next().unwrap();
        assert_eq!(claimed.id, item.id);
        assert_eq!(claimed.state, DeliveryState::MarkedSent);
        assert!(q.next().is_none());
        assert!(q.mark_sent(item.id));
    }

    #[test]
    fn concurrent_claims_have_single_winner() {
        for _ in 0..20 {
            let q = Arc::new(queue());
            q.enqueue(message(1), 0).unwrap();
            let winners = Arc::new(AtomicUsize::new(0));

            std::thread::scope(|scope| {
                for _ in 0..8 {
                    let q = Arc::clone(&q);
                    let winners = Arc::clone(&winners);
                    scope.spawn(move || {
                        if q.next().is_some() {
                            winners.fetch_add(1, Ordering::SeqCst);
                        }
                    });
                }
            });
            assert_eq!(winners.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn duplicate_signature_not_queued_twice() {
        let q = queue();
        let first = q.enqueue(message(7), 0).unwrap();
        let second = q.enqueue(message(7), 3).unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn stored_failure_can_be_queued_again() {
        let q = queue();
        let first = q.enqueue(message(7), 0).unwrap();
        q.next().unwrap();
        q.mark_failed(first.id);
        assert!(q.take_for_store(first.id).is_some());

        let again = q.enqueue(message(7), 0).unwrap();
        assert_ne!(again.id, first.id);
        assert_eq!(again.state, DeliveryState::Virgin);
        assert_eq!(q.next().map(|i| i.id), Some(again.id));

        assert!(q.acknowledge(&again.signature));
        assert_eq!(q.items().iter().filter(|i| i.delivered).count(), 1);
        assert_eq!(q.state_of(first.id), Some(DeliveryState::Failed));
    }

    #[test]
    fn acknowledge_skips_stored_copy() {
        let q = queue();
        let item = q.enqueue(message(1), 0).unwrap();
        q.next().unwrap();
        q.mark_failed(item.id);
        q.take_for_store(item.id).unwrap();
        assert!(!q.acknowledge(&item.signature));
    }

    #[test]
    fn failed_is_terminal() {
        let q = queue();
        let item = q.enqueue(message(1), 0).unwrap();
        assert!(!q.mark_failed(item.id), "virgin items cannot fail");
        q.next().unwrap();
        assert!(q.mark_failed(item.id));
        assert!(!q.mark_failed(item.id));
        assert!(!q.mark_sent(item.id));
        assert_eq!(q.state_of(item.id), Some(DeliveryState::Failed));
        assert!(q.next().is_none());
    }

    #[test]
    fn acknowledged_item_purged_without_store() {
        let q = queue();
        let item = q.enqueue(message(1), 0).unwrap();
        q.next().unwrap();
        assert!(q.acknowledge(&item.signature));
        assert!(!q.acknowledge(&item.signature));

        let purged = q.purge(Utc::now());
        assert_eq!(purged.len(), 1);
        assert!(purged[0].item.delivered);
        assert!(purged[0].stranded.is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn failed_item_stays_until_expiry() {
        let q = queue();
        let item = q.enqueue(message(1), 0).unwrap();
        q.next().unwrap();
        q.mark_failed(item.id);

        assert!(q.purge(Utc::now()).is_empty());
        assert_eq!(q.len(), 1);

        let later = Utc::now() + Duration::seconds(601);
        let purged = q.purge(later);
        assert_eq!(purged.len(), 1);
        assert!(purged[0].stranded.is_some());
        assert!(q.purge(later).is_empty());
    }

    #[test]
    fn surfaced_failure_not_stranded_again() {
        let q = queue();
        let item = q.enqueue(message(1), 0).unwrap();
        q.next().unwrap();
        q.mark_failed(item.id);

        assert!(q.take_for_store(item.id).is_some());
        assert!(q.take_for_store(item.id).is_none());

        let purged = q.purge(Utc::now() + Duration::seconds(601));
        assert_eq!(purged.len(), 1);
        assert!(purged[0].stranded.is_none());
    }

    #[test]
    fn unacknowledged_send_times_out_once() {
        let q = queue();
        let item = q.enqueue(message(1), 0).unwrap();
        q.next().unwrap();
        q.mark_sent(item.id);

        let later = Utc::now() + Duration::seconds(601);
        let purged = q.purge(later);
        assert_eq!(purged.len(), 1);
        assert_eq!(purged[0].item.state, DeliveryState::Failed);
        assert!(purged[0].stranded.is_some());
        assert!(q.purge(later + Duration::seconds(601)).is_empty());
    }

    #[test]
    fn virgin_items_never_expire() {
        let q = queue();
        q.enqueue(message(1), 0).unwrap();
        assert!(q.purge(Utc::now() + Duration::days(1)).is_empty());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn drain_virgin_leaves_claimed_items() {
        let q = queue();
        let sent = q.enqueue(message(1), 0).unwrap();
        q.enqueue(message(2), 0).unwrap();
        q.enqueue(message(3), 9).unwrap();
        q.next().unwrap();

        let drained = q.drain_virgin();
        assert_eq!(drained.len(), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.items()[0].id, sent.id);
    }
}
