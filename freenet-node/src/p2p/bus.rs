//! `MessageBus`: the receive-side demultiplexer (§4.2).
//!
//! Registered filters are kept in per-peer buckets (plus one bucket for
//! source-agnostic filters) so that dispatching an incoming message only
//! has to scan the candidates that could possibly match it. Delivery
//! itself always happens with no bus lock held (§4.2 delivery rule, §5
//! lock ordering: the bus never calls back into PRB/Transmitter while
//! holding its own lock).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use freenet_common::tokio::sync::Mutex;
use freenet_common::tokio::time::interval;
use metrics::counter;

use super::filter::{Deadline, DropReason, MessageFilter};
use super::message::Message;
use super::peer_link::PeerId;
use crate::config::FILTER_SWEEP_INTERVAL_MILLIS;

struct Entry {
    filter: MessageFilter,
}

#[derive(Default)]
struct BusState {
    peer_filters: HashMap<PeerId, Vec<Entry>>,
    global_filters: Vec<Entry>,
}

impl BusState {
    fn bucket_mut(&mut self, peer: Option<PeerId>) -> &mut Vec<Entry> {
        match peer {
            Some(p) => self.peer_filters.entry(p).or_default(),
            None => &mut self.global_filters,
        }
    }
}

/// Receive loop + registry: delivers each incoming message to the best
/// matching filter and evicts expired ones (§4.2).
#[derive(Default)]
pub struct MessageBus {
    state: Mutex<BusState>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `filter` under `peer`'s bucket, or the global bucket if
    /// `peer` is `None` (source-agnostic filter, §4.2). Insertion order
    /// within a bucket is preserved (`Vec::push`), which is what the bus
    /// uses to break ties between same-deadline matches.
    pub async fn register(&self, filter: MessageFilter, peer: Option<PeerId>) {
        let mut state = self.state.lock().await;
        state.bucket_mut(peer).push(Entry { filter });
    }

    /// Removes `filter` from the bus without delivering anything to it —
    /// used by an owner that no longer needs a registration it placed
    /// (e.g. a transmitter that terminated via a path other than the
    /// filter it registered matching).
    pub async fn deregister(&self, filter: &MessageFilter) -> bool {
        let mut state = self.state.lock().await;
        if remove_by_ptr(&mut state.global_filters, filter) {
            return true;
        }
        for bucket in state.peer_filters.values_mut() {
            if remove_by_ptr(bucket, filter) {
                return true;
            }
        }
        false
    }

    /// §4.2 steps 1-2: snapshot candidates for `msg.source` plus the
    /// global bucket, find the best match (earliest deadline, ties by
    /// insertion order — the first encountered in iteration wins), remove
    /// it from the registry and deliver. At most one filter is matched
    /// per message.
    pub async fn dispatch(&self, msg: Message) {
        let now = Instant::now();
        let candidates: Vec<MessageFilter> = {
            let state = self.state.lock().await;
            let mut v = Vec::new();
            if let Some(bucket) = state.peer_filters.get(&msg.source) {
                v.extend(bucket.iter().map(|e| e.filter.clone()));
            }
            v.extend(state.global_filters.iter().map(|e| e.filter.clone()));
            v
        };

        let mut best: Option<(MessageFilter, Deadline)> = None;
        for filter in &candidates {
            if !filter.match_message(&msg, now).await {
                continue;
            }
            let deadline = filter.earliest_deadline().await;
            let better = match &best {
                None => true,
                Some((_, best_deadline)) => deadline_is_earlier(&deadline, best_deadline),
            };
            if better {
                best = Some((filter.clone(), deadline));
            }
        }

        let Some((winner, _)) = best else {
            return;
        };

        {
            let mut state = self.state.lock().await;
            remove_by_ptr(&mut state.global_filters, &winner);
            if let Some(bucket) = state.peer_filters.get_mut(&msg.source) {
                remove_by_ptr(bucket, &winner);
            }
        }
        counter!("freenet_p2p_filter_matched").increment(1u64);
        winner.deliver_matched(msg).await;
    }

    /// §4.2 step 3: scan every registered filter for an expired deadline
    /// or `shouldTimeout()`; remove and deliver `onTimeout` to each.
    pub async fn sweep_timeouts(&self) {
        let now = Instant::now();
        let expired = {
            let mut state = self.state.lock().await;
            let mut expired = Vec::new();
            collect_expired(&mut state.global_filters, now, &mut expired).await;
            let peers: Vec<PeerId> = state.peer_filters.keys().copied().collect();
            for peer in peers {
                if let Some(bucket) = state.peer_filters.get_mut(&peer) {
                    collect_expired(bucket, now, &mut expired).await;
                }
            }
            expired
        };
        if !expired.is_empty() {
            counter!("freenet_p2p_filter_timeout").increment(expired.len() as u64);
        }
        for filter in expired {
            filter.deliver_timeout().await;
        }
    }

    /// §4.2 step 4: the peer disconnected. Delivers `onDisconnect` to
    /// every filter (in any bucket) whose `source` is `peer`, unless it
    /// already matched.
    pub async fn notify_disconnected(&self, peer: PeerId) {
        self.notify_connection_event(peer, peer, false).await;
    }

    /// §4.2 step 4: the peer restarted (its boot id changed to
    /// `new_boot_id`). Delivers `onRestarted` to affected filters.
    pub async fn notify_restarted(&self, peer: PeerId, new_boot_id: u64) {
        self.notify_connection_event(peer, new_boot_id, true).await;
    }

    async fn notify_connection_event(&self, peer: PeerId, current_boot_id: u64, restarted: bool) {
        let affected = {
            let mut state = self.state.lock().await;
            let mut affected = Vec::new();
            collect_dropped(&mut state.global_filters, peer, current_boot_id, restarted, &mut affected);
            if let Some(bucket) = state.peer_filters.get_mut(&peer) {
                collect_dropped(bucket, peer, current_boot_id, restarted, &mut affected);
            }
            affected
        };
        let reason = if restarted {
            DropReason::Restarted
        } else {
            DropReason::Disconnected
        };
        if !affected.is_empty() {
            counter!("freenet_p2p_filter_connection_dropped", "peer" => peer.to_string())
                .increment(affected.len() as u64);
        }
        for filter in affected {
            filter.deliver_connection_dropped(peer, reason).await;
        }
    }

    /// Spawns a background task that calls [`sweep_timeouts`] on a fixed
    /// interval (§4.2 step 3: "periodically, driven by a tick"). Aborting
    /// the returned handle stops the sweeper.
    pub fn spawn_sweeper(bus: std::sync::Arc<Self>) -> freenet_common::tokio::task::JoinHandle<()> {
        freenet_common::tokio::spawn(async move {
            let mut ticker = interval(Duration::from_millis(FILTER_SWEEP_INTERVAL_MILLIS));
            loop {
                ticker.tick().await;
                bus.sweep_timeouts().await;
            }
        })
    }
}

fn remove_by_ptr(bucket: &mut Vec<Entry>, filter: &MessageFilter) -> bool {
    let before = bucket.len();
    bucket.retain(|e| !e.filter.same_instance(filter));
    bucket.len() != before
}

/// Drains `bucket`, moving every entry whose deadline/`shouldTimeout()`
/// has fired into `out` and putting everything else back. A plain
/// `Vec::retain` can't be used here since the predicate is async.
async fn collect_expired(bucket: &mut Vec<Entry>, now: Instant, out: &mut Vec<MessageFilter>) {
    let mut keep = Vec::with_capacity(bucket.len());
    for entry in bucket.drain(..) {
        if entry.filter.should_timeout_now(now).await {
            out.push(entry.filter);
        } else {
            keep.push(entry);
        }
    }
    *bucket = keep;
}

fn collect_dropped(
    bucket: &mut Vec<Entry>,
    peer: PeerId,
    current_boot_id: u64,
    restarted: bool,
    out: &mut Vec<MessageFilter>,
) {
    bucket.retain(|e| {
        if e.filter.connections_dropped(peer, current_boot_id, restarted) {
            out.push(e.filter.clone());
            false
        } else {
            true
        }
    });
}

fn deadline_is_earlier(a: &Deadline, b: &Deadline) -> bool {
    match (a, b) {
        (Deadline::At(x), Deadline::At(y)) => x < y,
        (Deadline::At(_), Deadline::Never) => true,
        (Deadline::Never, Deadline::At(_)) => false,
        (Deadline::Never, Deadline::Never) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::filter::FilterBuilder;
    use crate::p2p::message::{types, FieldValue};
    use std::time::Duration as StdDuration;

    fn msg(t: &'static super::super::message::MessageType, source: PeerId, uid: i64) -> Message {
        Message::new(t, source, 1).with_field("uid", FieldValue::I64(uid))
    }

    #[tokio::test]
    async fn dispatch_delivers_to_matching_peer_bucket() {
        let bus = MessageBus::new();
        let (filter, wait) = FilterBuilder::new()
            .set_type(&types::BULK_RECEIVED_ALL)
            .set_source(7, 1)
            .set_field("uid", FieldValue::I64(42))
            .unwrap()
            .set_no_timeout()
            .build_waiter();
        bus.register(filter, Some(7)).await;

        bus.dispatch(msg(&types::BULK_RECEIVED_ALL, 7, 42)).await;

        match wait.wait().await {
            crate::p2p::filter::FilterOutcome::Matched(m) => {
                assert_eq!(m.field("uid"), Some(&FieldValue::I64(42)));
            }
            other => panic!("expected Matched, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_matching_message_leaves_filter_registered() {
        let bus = MessageBus::new();
        let (filter, _wait) = FilterBuilder::new()
            .set_type(&types::BULK_RECEIVED_ALL)
            .set_source(7, 1)
            .set_field("uid", FieldValue::I64(42))
            .unwrap()
            .set_no_timeout()
            .build_waiter();
        bus.register(filter.clone(), Some(7)).await;

        bus.dispatch(msg(&types::BULK_RECEIVED_ALL, 7, 99)).await;
        assert!(!filter.is_matched());
        assert!(bus.deregister(&filter).await);
    }

    #[tokio::test]
    async fn sweep_delivers_timeout_once_deadline_passes() {
        let bus = MessageBus::new();
        let (filter, wait) = FilterBuilder::new()
            .set_type(&types::BULK_RECEIVED_ALL)
            .set_timeout(StdDuration::from_millis(1))
            .build_waiter();
        bus.register(filter, None).await;
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        bus.sweep_timeouts().await;
        assert!(matches!(
            wait.wait().await,
            crate::p2p::filter::FilterOutcome::TimedOut
        ));
    }

    #[tokio::test]
    async fn disconnect_notifies_matching_source_filters() {
        let bus = MessageBus::new();
        let (filter, wait) = FilterBuilder::new()
            .set_type(&types::BULK_RECEIVE_ABORTED)
            .set_source(3, 1)
            .set_no_timeout()
            .build_waiter();
        bus.register(filter, Some(3)).await;
        bus.notify_disconnected(3).await;
        match wait.wait().await {
            crate::p2p::filter::FilterOutcome::ConnectionDropped(peer, reason) => {
                assert_eq!(peer, 3);
                assert_eq!(reason, DropReason::Disconnected);
            }
            other => panic!("expected ConnectionDropped, got {other:?}"),
        }
    }
}
