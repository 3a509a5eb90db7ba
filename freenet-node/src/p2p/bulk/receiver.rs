//! `BulkReceiver`: the symmetric receiving side of a bulk transfer (§4.5).
//!
//! Each incoming `BulkPacketSend` is caught by a one-shot blocking filter
//! that the receiver re-registers after every packet — the bus's normal
//! match-once-then-remove semantics (§4.2) turn "for each incoming
//! packet" into a loop rather than a single persistent registration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use metrics::counter;

use crate::config::BULK_PACKET_SEND_TIMEOUT_MILLIS;

use super::super::bus::MessageBus;
use super::super::error::{P2pError, P2pResult};
use super::super::filter::{FilterBuilder, FilterOutcome};
use super::super::message::{types, FieldValue, Message};
use super::super::peer_link::{PeerId, PeerLink};
use super::prb::PartiallyReceivedBulk;

/// Accepts `BulkPacketSend` packets for one transfer, writes them into the
/// shared PRB, and emits the terminal control message once the file is
/// complete or the transfer is given up on locally (§4.5).
pub struct BulkReceiver {
    prb: Arc<PartiallyReceivedBulk>,
    peer: Arc<dyn PeerLink>,
    uid: u64,
    peer_boot_id: u64,
    bus: Arc<MessageBus>,
    aborted_locally: AtomicBool,
}

impl BulkReceiver {
    pub fn new(
        prb: Arc<PartiallyReceivedBulk>,
        peer: Arc<dyn PeerLink>,
        uid: u64,
        bus: Arc<MessageBus>,
    ) -> P2pResult<Arc<Self>> {
        if !peer.is_connected() {
            return Err(P2pError::Disconnected(peer.id()));
        }
        let peer_boot_id = peer.boot_id();
        Ok(Arc::new(Self {
            prb,
            peer,
            uid,
            peer_boot_id,
            bus,
            aborted_locally: AtomicBool::new(false),
        }))
    }

    pub fn uid(&self) -> u64 {
        self.uid
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer.id()
    }

    /// Runs until the PRB has the whole file (emits `BulkReceivedAll`,
    /// returns `true`) or the transfer is given up on — aborted PRB,
    /// local abort, or the source connection dropped (returns `false`).
    pub async fn receive(self: &Arc<Self>) -> bool {
        loop {
            if self.prb.is_aborted().await {
                return false;
            }
            if self.peer.boot_id() != self.peer_boot_id {
                self.prb.abort().await;
                return false;
            }
            if self.prb.has_whole_file().await {
                self.emit_received_all().await;
                return true;
            }

            let (filter, wait) = FilterBuilder::new()
                .set_type(&types::BULK_PACKET_SEND)
                .set_source(self.peer.id(), self.peer_boot_id)
                .set_field("uid", FieldValue::I64(self.uid as i64))
                .expect("uid is declared I64 on BulkPacketSend")
                .set_timeout(Duration::from_millis(BULK_PACKET_SEND_TIMEOUT_MILLIS))
                .build_waiter();
            self.bus.register(filter, Some(self.peer.id())).await;

            match wait.wait().await {
                FilterOutcome::Matched(msg) => {
                    let Some(FieldValue::I32(block_no)) = msg.field("blockNo") else {
                        warn!("BulkPacketSend for transfer {} missing blockNo", self.uid);
                        continue;
                    };
                    let Some(FieldValue::Bytes(bytes)) = msg.field("bytes") else {
                        warn!("BulkPacketSend for transfer {} missing bytes", self.uid);
                        continue;
                    };
                    self.prb.block_received(*block_no as u32, bytes.clone()).await;
                    counter!("freenet_p2p_bulk_packets_received", "peer" => self.peer.short_id())
                        .increment(1u64);
                }
                FilterOutcome::TimedOut => {
                    // No packet within the per-packet window; loop back to
                    // re-check whole-file/aborted/restart before waiting again.
                    continue;
                }
                FilterOutcome::ConnectionDropped(_, _) => {
                    self.prb.abort().await;
                    return false;
                }
                FilterOutcome::Cancelled => return false,
            }
        }
    }

    async fn emit_received_all(&self) {
        debug!(
            "transfer {} from {} complete, emitting BulkReceivedAll",
            self.uid,
            self.peer.short_id()
        );
        if self.peer.is_connected() {
            let msg = Message::new(&types::BULK_RECEIVED_ALL, self.peer.id(), self.peer_boot_id)
                .with_field("uid", FieldValue::I64(self.uid as i64));
            if let Err(e) = self.peer.send_async(msg).await {
                debug!("failed to send BulkReceivedAll to {}: {e}", self.peer.short_id());
            }
        }
    }

    /// Gives up on the transfer locally: aborts the PRB and emits
    /// `BulkReceiveAborted` (at most once) so the sender stops promptly
    /// instead of waiting out its idle timeout (§4.5).
    pub async fn abort_locally(&self) {
        if self.aborted_locally.swap(true, Ordering::SeqCst) {
            return;
        }
        self.prb.abort().await;
        if self.peer.is_connected() {
            let msg = Message::new(&types::BULK_RECEIVE_ABORTED, self.peer.id(), self.peer_boot_id)
                .with_field("uid", FieldValue::I64(self.uid as i64));
            if let Err(e) = self.peer.send_async(msg).await {
                debug!(
                    "failed to send BulkReceiveAborted to {}: {e}",
                    self.peer.short_id()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::peer_link::ChannelPeerLink;

    #[tokio::test]
    async fn receives_blocks_out_of_order_and_completes() {
        let prb = PartiallyReceivedBulk::empty(4, 3);
        let (peer, _rx) = ChannelPeerLink::pair(2, 1);
        let bus = Arc::new(MessageBus::new());
        let receiver = BulkReceiver::new(prb.clone(), peer.clone(), 11, bus.clone()).unwrap();

        let recv_task = {
            let r = receiver.clone();
            tokio::spawn(async move { r.receive().await })
        };

        // Deliver out of order: 2, 0, 1.
        for block_no in [2u32, 0, 1] {
            freenet_common::tokio::task::yield_now().await;
            let msg = Message::new(&types::BULK_PACKET_SEND, peer.id(), peer.boot_id())
                .with_field("uid", FieldValue::I64(11))
                .with_field("blockNo", FieldValue::I32(block_no as i32))
                .with_field("bytes", FieldValue::Bytes(vec![block_no as u8; 4]));
            bus.dispatch(msg).await;
        }

        assert!(recv_task.await.unwrap());
        assert!(prb.has_whole_file().await);
        assert_eq!(prb.get_block_data(2).await, Some(vec![2u8; 4]));
    }

    #[tokio::test]
    async fn empty_file_completes_without_any_packet() {
        let prb = PartiallyReceivedBulk::empty(32, 0);
        let (peer, _rx) = ChannelPeerLink::pair(2, 1);
        let bus = Arc::new(MessageBus::new());
        let receiver = BulkReceiver::new(prb, peer, 12, bus).unwrap();
        assert!(receiver.receive().await);
    }

    #[tokio::test]
    async fn local_abort_flips_prb_and_is_idempotent() {
        let prb = PartiallyReceivedBulk::empty(4, 2);
        let (peer, _rx) = ChannelPeerLink::pair(2, 1);
        let bus = Arc::new(MessageBus::new());
        let receiver = BulkReceiver::new(prb.clone(), peer, 13, bus).unwrap();

        receiver.abort_locally().await;
        receiver.abort_locally().await;
        assert!(prb.is_aborted().await);
    }
}
