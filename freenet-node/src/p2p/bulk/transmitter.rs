//! `BulkTransmitter`: drives sending every block of a PRB to one peer,
//! handling acks, aborts and retries (§4.4).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, warn};
use metrics::counter;

use freenet_common::tokio::sync::{Mutex, Notify};
use freenet_common::tokio::time::sleep;

use crate::config::{
    BULK_FINAL_ACK_TIMEOUT_MILLIS, BULK_IDLE_POLL_INTERVAL_MILLIS, BULK_MESSAGE_HEADER_OVERHEAD,
    BULK_PACKET_ENVELOPE_OVERHEAD, BULK_PACKET_SEND_TIMEOUT_MILLIS, BULK_TRANSFER_TIMEOUT_MILLIS,
};

use super::super::bus::MessageBus;
use super::super::error::{P2pError, P2pResult};
use super::super::filter::{FilterBuilder, FilterCallback, MessageFilter};
use super::super::message::{types, FieldValue, Message};
use super::super::peer_link::{PeerId, PeerLink, UnsentPacketTag};
use super::prb::{Bitmap, BulkSubscriber, PartiallyReceivedBulk};

/// `packetSize = bulkPacketEnvelope(blockSize) + oneMessageHeaderOverhead(peer)`
/// (§4.4).
fn packet_size(block_size: u32) -> u32 {
    block_size + BULK_PACKET_ENVELOPE_OVERHEAD + BULK_MESSAGE_HEADER_OVERHEAD
}

struct TransmitterState {
    not_sent_but_present: Bitmap,
    finished: bool,
    cancelled: bool,
    last_sent_packet: Instant,
}

/// Drives sending of all blocks of a [`PartiallyReceivedBulk`] to one peer
/// (§3 `BulkTransmitter state`, §4.4).
pub struct BulkTransmitter {
    prb: Arc<PartiallyReceivedBulk>,
    peer: Arc<dyn PeerLink>,
    uid: u64,
    peer_boot_id: u64,
    no_wait: bool,
    packet_size: u32,
    bus: Arc<MessageBus>,
    state: Mutex<TransmitterState>,
    notify: Notify,
    tag: UnsentPacketTag,
    sent_cancel: AtomicBool,
    created_at: Instant,
    /// Millis-since-`created_at` at which `completed()` ran, or `u64::MAX`
    /// while still in flight. Read synchronously (no lock) by the
    /// completed-filter's `shouldTimeout()` (§4.4 "After completion...").
    finished_at_millis: AtomicU64,
    registered_filters: Mutex<Option<(MessageFilter, MessageFilter)>>,
}

impl BulkTransmitter {
    /// Binds `(prb, peer, uid)`, snapshots the presence bitmap while
    /// holding the PRB lock, subscribes, and registers the two control
    /// filters (§4.4 construction). Fails with `Disconnected` if the peer
    /// is already gone.
    pub async fn new(
        prb: Arc<PartiallyReceivedBulk>,
        peer: Arc<dyn PeerLink>,
        uid: u64,
        no_wait: bool,
        bus: Arc<MessageBus>,
    ) -> P2pResult<Arc<Self>> {
        if !peer.is_connected() {
            return Err(P2pError::Disconnected(peer.id()));
        }
        let peer_boot_id = peer.boot_id();
        let transmitter = Arc::new(Self {
            prb: prb.clone(),
            peer: peer.clone(),
            uid,
            peer_boot_id,
            no_wait,
            packet_size: packet_size(prb.block_size()),
            bus: bus.clone(),
            state: Mutex::new(TransmitterState {
                not_sent_but_present: Bitmap::empty(prb.total_blocks()),
                finished: false,
                cancelled: false,
                last_sent_packet: Instant::now(),
            }),
            notify: Notify::new(),
            tag: UnsentPacketTag::new(),
            sent_cancel: AtomicBool::new(false),
            created_at: Instant::now(),
            finished_at_millis: AtomicU64::new(u64::MAX),
            registered_filters: Mutex::new(None),
        });

        let snapshot = prb
            .snapshot_and_subscribe(transmitter.clone() as Arc<dyn BulkSubscriber>)
            .await;
        transmitter.state.lock().await.not_sent_but_present = snapshot;

        let abort_filter = FilterBuilder::new()
            .set_type(&types::BULK_RECEIVE_ABORTED)
            .set_source(peer.id(), peer_boot_id)
            .set_field("uid", FieldValue::I64(uid as i64))?
            .set_no_timeout()
            .build_callback(Arc::new(AbortCallback(transmitter.clone())));
        let completed_filter = FilterBuilder::new()
            .set_type(&types::BULK_RECEIVED_ALL)
            .set_source(peer.id(), peer_boot_id)
            .set_field("uid", FieldValue::I64(uid as i64))?
            .set_no_timeout()
            .build_callback(Arc::new(CompletedCallback(transmitter.clone())));

        bus.register(abort_filter.clone(), Some(peer.id())).await;
        bus.register(completed_filter.clone(), Some(peer.id()))
            .await;
        *transmitter.registered_filters.lock().await = Some((abort_filter, completed_filter));

        Ok(transmitter)
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer.id()
    }

    /// The outer send loop (§4.4 "Send loop"). Runs to completion
    /// (`finished`, returns `true`) or aborts (`cancelled`, returns
    /// `false`). Every exit path removes the transmitter from the PRB's
    /// subscriber set and deregisters its bus filters (§5 resource
    /// lifecycle).
    pub async fn send(self: &Arc<Self>) -> bool {
        loop {
            if self.prb.is_aborted().await {
                self.cancel("PRB aborted").await;
                return self.finish(false).await;
            }
            if self.peer.boot_id() != self.peer_boot_id {
                self.set_cancelled_flag().await;
                self.emit_cancel_if_needed("peer restarted").await;
                return self.finish(false).await;
            }

            let (block_no, should_return) = {
                let state = self.state.lock().await;
                if state.finished {
                    (None, Some(true))
                } else if state.cancelled {
                    (None, Some(false))
                } else {
                    (state.not_sent_but_present.first_set_bit(), None)
                }
            };
            if let Some(done) = should_return {
                return self.finish(done).await;
            }

            // Re-checked every time the loop re-enters its top, not only
            // after a real wakeup (§9 resolution of the spurious-wakeup
            // open question).
            let idle_for = self.state.lock().await.last_sent_packet.elapsed();
            if idle_for >= Duration::from_millis(BULK_TRANSFER_TIMEOUT_MILLIS) {
                self.cancel("Timeout awaiting BulkReceivedAll").await;
                return self.finish(false).await;
            }

            let Some(block_no) = block_no else {
                if self.no_wait && self.prb.has_whole_file().await {
                    self.completed().await;
                    return self.finish(true).await;
                }
                if self.tag.has_failed() {
                    self.cancel("packet send failed").await;
                    return self.finish(false).await;
                }
                self.wait_for_progress(idle_for).await;
                continue;
            };

            let Some(buf) = self.prb.get_block_data(block_no).await else {
                // PRB was aborted concurrently with us picking this block.
                return self.finish(false).await;
            };

            let msg = Message::new(&types::BULK_PACKET_SEND, self.peer.id(), self.peer_boot_id)
                .with_field("uid", FieldValue::I64(self.uid as i64))
                .with_field("blockNo", FieldValue::I32(block_no as i32))
                .with_field("bytes", FieldValue::Bytes(buf));

            match self
                .peer
                .send_throttled_message(
                    msg,
                    self.packet_size,
                    BULK_PACKET_SEND_TIMEOUT_MILLIS,
                    self.tag.clone(),
                )
                .await
            {
                Ok(()) => {
                    let mut state = self.state.lock().await;
                    state.not_sent_but_present.clear(block_no);
                    state.last_sent_packet = Instant::now();
                    drop(state);
                    counter!("freenet_p2p_bulk_packets_sent", "peer" => self.peer.short_id())
                        .increment(1u64);
                }
                Err(P2pError::WaitedTooLong(_)) => {
                    warn!(
                        "throttled send of block {} for transfer {} to {} waited too long, giving up",
                        block_no,
                        self.uid,
                        self.peer.short_id()
                    );
                    return self.finish(false).await;
                }
                Err(P2pError::NotConnected(_)) | Err(P2pError::PeerRestarted(_)) => {
                    self.cancel("Disconnected").await;
                    return self.finish(false).await;
                }
                Err(other) => {
                    self.cancel(&format!("send error: {other}")).await;
                    return self.finish(false).await;
                }
            }
        }
    }

    /// Waits for any of: a new block present, an ack/failure on the
    /// outstanding packet tag, or the bounded idle-poll interval — whichever
    /// comes first (§4.4 step 4, §5 suspension points: bounded to at most
    /// `BULK_IDLE_POLL_INTERVAL_MILLIS`).
    async fn wait_for_progress(&self, idle_for: Duration) {
        let remaining_until_timeout =
            Duration::from_millis(BULK_TRANSFER_TIMEOUT_MILLIS).saturating_sub(idle_for);
        let wait_bound = remaining_until_timeout.min(Duration::from_millis(
            BULK_IDLE_POLL_INTERVAL_MILLIS,
        ));

        // `enable()` registers each waiter before we start polling, so a
        // `notify_waiters()` racing this call (e.g. a callback firing
        // between our last state check and this wait) is still observed
        // instead of being silently dropped until the next 60s poll.
        let own_notified = self.notify.notified();
        let tag_notified = self.tag.notified();
        freenet_common::tokio::pin!(own_notified);
        freenet_common::tokio::pin!(tag_notified);
        own_notified.as_mut().enable();
        tag_notified.as_mut().enable();

        freenet_common::tokio::select! {
            _ = own_notified.as_mut() => {}
            _ = tag_notified.as_mut() => {}
            _ = sleep(wait_bound) => {}
        }
    }

    async fn set_cancelled_flag(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.finished || state.cancelled {
            return false;
        }
        state.cancelled = true;
        true
    }

    /// `cancel(reason)` (§4.4): idempotently emits a single
    /// `BulkSendAborted`, marks cancelled, wakes waiters, and removes
    /// itself from the PRB.
    pub async fn cancel(self: &Arc<Self>, reason: &str) {
        if !self.set_cancelled_flag().await {
            return;
        }
        self.emit_cancel_if_needed(reason).await;
    }

    async fn emit_cancel_if_needed(self: &Arc<Self>, reason: &str) {
        debug!(
            "cancelling transfer {} to {}: {}",
            self.uid,
            self.peer.short_id(),
            reason
        );
        counter!("freenet_p2p_bulk_cancelled", "reason" => reason.to_string()).increment(1u64);
        if !self.sent_cancel.swap(true, Ordering::SeqCst) && self.peer.is_connected() {
            let msg = Message::new(&types::BULK_SEND_ABORTED, self.peer.id(), self.peer_boot_id)
                .with_field("uid", FieldValue::I64(self.uid as i64));
            if let Err(e) = self.peer.send_async(msg).await {
                debug!("best-effort BulkSendAborted to {} failed: {e}", self.peer.short_id());
            }
        }
        self.notify.notify_waiters();
    }

    /// `completed()` (§4.4): sets `finished`, records the finish time,
    /// wakes waiters and removes itself from the PRB. Idempotent and safe
    /// to call even if `cancel` raced it (only one of `finished`/
    /// `cancelled` ever ends up set, P3).
    pub async fn completed(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().await;
            if state.finished || state.cancelled {
                return;
            }
            state.finished = true;
        }
        self.finished_at_millis
            .store(self.created_at.elapsed().as_millis() as u64, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// True once `now − finishTime > FINAL_ACK_TIMEOUT` (§4.4): lets the
    /// bus sweep away the completed-filter registration after the grace
    /// period even if no `BulkReceivedAll` ever arrived (e.g. the
    /// `noWait` early-completion path).
    fn completed_past_grace(&self) -> bool {
        let finished_at = self.finished_at_millis.load(Ordering::SeqCst);
        if finished_at == u64::MAX {
            return false;
        }
        let now = self.created_at.elapsed().as_millis() as u64;
        now.saturating_sub(finished_at) > BULK_FINAL_ACK_TIMEOUT_MILLIS
    }

    async fn finish(self: &Arc<Self>, result: bool) -> bool {
        if let Some((abort_filter, completed_filter)) =
            self.registered_filters.lock().await.take()
        {
            self.bus.deregister(&abort_filter).await;
            self.bus.deregister(&completed_filter).await;
        }
        self.prb.remove(&(self.clone() as Arc<dyn BulkSubscriber>)).await;
        result
    }

    #[cfg(test)]
    pub async fn is_finished(&self) -> bool {
        self.state.lock().await.finished
    }

    #[cfg(test)]
    pub async fn is_cancelled(&self) -> bool {
        self.state.lock().await.cancelled
    }

    #[cfg(test)]
    pub fn sent_cancel_count(&self) -> bool {
        self.sent_cancel.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BulkSubscriber for BulkTransmitter {
    async fn on_block_received(&self, block_no: u32) {
        self.state.lock().await.not_sent_but_present.set(block_no);
        self.notify.notify_waiters();
    }

    async fn on_aborted(&self) {
        self.notify.notify_waiters();
    }
}

struct AbortCallback(Arc<BulkTransmitter>);

#[async_trait]
impl FilterCallback for AbortCallback {
    async fn on_matched(&self, _msg: Message) {
        self.0.cancel("remote abort").await;
    }
}

struct CompletedCallback(Arc<BulkTransmitter>);

#[async_trait]
impl FilterCallback for CompletedCallback {
    async fn on_matched(&self, _msg: Message) {
        // Remote `BulkReceivedAll`: finished even if some bits remained
        // set locally — the receiver may have gotten them from another
        // source (§7).
        self.0.completed().await;
    }

    fn should_timeout(&self) -> bool {
        self.0.completed_past_grace()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::peer_link::ChannelPeerLink;

    #[tokio::test]
    async fn construction_fails_when_peer_already_disconnected() {
        let prb = PartiallyReceivedBulk::from_complete(4, b"abcd");
        let (peer, _rx) = ChannelPeerLink::pair(1, 2);
        peer.disconnect();
        let bus = Arc::new(MessageBus::new());
        let result = BulkTransmitter::new(prb, peer, 1, false, bus).await;
        assert!(matches!(result, Err(P2pError::Disconnected(_))));
    }

    #[tokio::test]
    async fn happy_path_sends_all_blocks_and_completes() {
        crate::test_support::init_logging();
        let prb = PartiallyReceivedBulk::from_complete(4, b"abcdefgh12");
        let (peer, mut rx) = ChannelPeerLink::pair(1, 2);
        let bus = Arc::new(MessageBus::new());
        let transmitter = BulkTransmitter::new(prb, peer.clone(), 7, false, bus.clone())
            .await
            .unwrap();

        let send_task = {
            let t = transmitter.clone();
            tokio::spawn(async move { t.send().await })
        };

        // Drain the three data packets, then feed back BulkReceivedAll.
        let mut seen_blocks = Vec::new();
        for _ in 0..3 {
            let msg = rx.recv().await.unwrap();
            assert_eq!(msg.msg_type, &types::BULK_PACKET_SEND);
            if let Some(FieldValue::I32(b)) = msg.field("blockNo") {
                seen_blocks.push(*b);
            }
        }
        seen_blocks.sort();
        assert_eq!(seen_blocks, vec![0, 1, 2]);

        let all_msg = Message::new(&types::BULK_RECEIVED_ALL, peer.id(), peer.boot_id())
            .with_field("uid", FieldValue::I64(7));
        bus.dispatch(all_msg).await;

        let result = send_task.await.unwrap();
        assert!(result);
        assert!(transmitter.is_finished().await);
        assert!(!transmitter.sent_cancel_count());
    }

    #[tokio::test]
    async fn empty_file_with_no_wait_completes_immediately() {
        let prb = PartiallyReceivedBulk::from_complete(32, b"");
        let (peer, _rx) = ChannelPeerLink::pair(1, 2);
        let bus = Arc::new(MessageBus::new());
        let transmitter = BulkTransmitter::new(prb, peer, 9, true, bus).await.unwrap();
        assert!(transmitter.send().await);
        assert!(transmitter.is_finished().await);
    }

    #[tokio::test]
    async fn remote_abort_cancels_the_transfer() {
        let prb = PartiallyReceivedBulk::from_complete(4, b"abcdefgh");
        let (peer, mut rx) = ChannelPeerLink::pair(1, 2);
        let bus = Arc::new(MessageBus::new());
        let transmitter = BulkTransmitter::new(prb, peer.clone(), 3, false, bus.clone())
            .await
            .unwrap();

        let send_task = {
            let t = transmitter.clone();
            tokio::spawn(async move { t.send().await })
        };

        let _first_block = rx.recv().await.unwrap();

        let abort_msg = Message::new(&types::BULK_RECEIVE_ABORTED, peer.id(), peer.boot_id())
            .with_field("uid", FieldValue::I64(3));
        bus.dispatch(abort_msg).await;

        let result = send_task.await.unwrap();
        assert!(!result);
        assert!(transmitter.is_cancelled().await);
        assert!(transmitter.sent_cancel_count());
    }

    #[tokio::test]
    async fn peer_restart_detected_at_top_of_send_loop() {
        // Construct while still on the original boot id (registration
        // requires the peer to be connected), then restart before the
        // first iteration of send() runs: the top-of-loop boot id check
        // (§4.4 step 2) must cancel before any block is transmitted.
        let prb = PartiallyReceivedBulk::from_complete(4, b"abcdefgh");
        let (peer, _rx) = ChannelPeerLink::pair(1, 2);
        let bus = Arc::new(MessageBus::new());
        let transmitter = BulkTransmitter::new(prb, peer.clone(), 4, false, bus)
            .await
            .unwrap();
        peer.restart();

        let result = transmitter.send().await;
        assert!(!result);
        assert!(transmitter.is_cancelled().await);
    }
}
