//! `PartiallyReceivedBulk` (PRB): the shared block buffer for one file
//! (§4.3). A PRB may be subscribed to by several [`BulkTransmitter`]s (the
//! same file sent to different peers) or a single
//! [`BulkReceiver`](super::receiver::BulkReceiver); subscribers hold weak
//! back-references so the PRB's subscriber set never keeps a transmitter
//! or receiver alive past its own lifetime (§9 design notes: shared
//! mutable cyclic references).

use std::sync::{Arc, Weak};

use async_trait::async_trait;

use freenet_common::tokio::sync::Mutex;

/// A block-indexed presence bitmap. Not bit-packed: nothing here is large
/// enough (tens of thousands of blocks at most) to make `Vec<bool>` worth
/// replacing with a packed representation.
#[derive(Clone, Debug)]
pub struct Bitmap {
    bits: Vec<bool>,
}

impl Bitmap {
    pub fn empty(len: u32) -> Self {
        Self {
            bits: vec![false; len as usize],
        }
    }

    pub fn all_set(len: u32) -> Self {
        Self {
            bits: vec![true; len as usize],
        }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn get(&self, block_no: u32) -> bool {
        self.bits.get(block_no as usize).copied().unwrap_or(false)
    }

    pub fn set(&mut self, block_no: u32) {
        if let Some(bit) = self.bits.get_mut(block_no as usize) {
            *bit = true;
        }
    }

    pub fn clear(&mut self, block_no: u32) {
        if let Some(bit) = self.bits.get_mut(block_no as usize) {
            *bit = false;
        }
    }

    /// The lowest-indexed set bit, matching the source's `firstSetBit`
    /// used to pick the next block to send (§4.4 step 3). Packets for a
    /// single transfer are therefore emitted in ascending-among-present
    /// order, not necessarily strictly ascending block index (§5).
    pub fn first_set_bit(&self) -> Option<u32> {
        self.bits.iter().position(|set| *set).map(|i| i as u32)
    }

    pub fn all_set_bits(&self) -> bool {
        self.bits.iter().all(|set| *set)
    }
}

/// A PRB subscriber: either a [`BulkTransmitter`](super::transmitter::BulkTransmitter)
/// (draining blocks out to a peer) or a [`BulkReceiver`](super::receiver::BulkReceiver)
/// (filling blocks in from a peer). Subscribers must not call back into
/// the PRB from these callbacks — the PRB lock is held across the call
/// (§4.3 invariant, §5).
#[async_trait]
pub trait BulkSubscriber: Send + Sync {
    async fn on_block_received(&self, block_no: u32);
    async fn on_aborted(&self);
}

struct Inner {
    present: Bitmap,
    data: Vec<Option<Vec<u8>>>,
    aborted: bool,
    subscribers: Vec<Weak<dyn BulkSubscriber>>,
}

/// Shared buffer of blocks for one file, tracking which blocks are
/// present (§3, §4.3).
pub struct PartiallyReceivedBulk {
    block_size: u32,
    total_blocks: u32,
    inner: Mutex<Inner>,
}

impl PartiallyReceivedBulk {
    /// An empty PRB awaiting incoming blocks — the receiver's view of a
    /// transfer.
    pub fn empty(block_size: u32, total_blocks: u32) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            total_blocks,
            inner: Mutex::new(Inner {
                present: Bitmap::empty(total_blocks),
                data: vec![None; total_blocks as usize],
                aborted: false,
                subscribers: Vec::new(),
            }),
        })
    }

    /// A fully-present PRB wrapping an in-memory file — the sender's view
    /// of a transfer. `block_size = 0` with empty `data` is rejected by
    /// construction elsewhere; here a zero-length file yields zero blocks.
    pub fn from_complete(block_size: u32, data: &[u8]) -> Arc<Self> {
        let total_blocks = if data.is_empty() {
            0
        } else {
            (data.len() as u32).div_ceil(block_size)
        };
        let blocks: Vec<Option<Vec<u8>>> = data
            .chunks(block_size.max(1) as usize)
            .map(|chunk| Some(chunk.to_vec()))
            .collect();
        Arc::new(Self {
            block_size,
            total_blocks,
            inner: Mutex::new(Inner {
                present: Bitmap::all_set(total_blocks),
                data: blocks,
                aborted: false,
                subscribers: Vec::new(),
            }),
        })
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    /// `add(subscriber)` (§4.3): atomic under the PRB lock.
    pub async fn add(&self, subscriber: Arc<dyn BulkSubscriber>) {
        self.inner.lock().await.subscribers.push(Arc::downgrade(&subscriber));
    }

    /// `remove(subscriber)` (§4.3): atomic under the PRB lock. The
    /// transmitter/receiver calls this on every terminal path (success,
    /// cancel, abort) so the subscriber set never leaks a dead weak
    /// reference indefinitely (§5 resource lifecycle).
    pub async fn remove(&self, subscriber: &Arc<dyn BulkSubscriber>) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.retain(|weak| match weak.upgrade() {
            Some(strong) => !Arc::ptr_eq(&strong, subscriber),
            None => false,
        });
    }

    /// Snapshots the presence bitmap and subscribes `subscriber` in one
    /// lock acquisition, so it observes either the cloned bit set or a
    /// later `onBlockReceived` call for that block — never both, never
    /// neither (§4.3 invariant, §5 concurrency model).
    pub async fn snapshot_and_subscribe(&self, subscriber: Arc<dyn BulkSubscriber>) -> Bitmap {
        let mut inner = self.inner.lock().await;
        let snapshot = inner.present.clone();
        inner.subscribers.push(Arc::downgrade(&subscriber));
        snapshot
    }

    pub async fn clone_blocks_received(&self) -> Bitmap {
        self.inner.lock().await.present.clone()
    }

    /// `blockReceived(n, bytes)` (§4.3): writes the block, sets its
    /// presence bit, and fans out `onBlockReceived(n)` to every live
    /// subscriber — all under the PRB lock, exactly as §5 requires.
    pub async fn block_received(&self, block_no: u32, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().await;
        if inner.aborted {
            return;
        }
        let idx = block_no as usize;
        if idx >= inner.data.len() {
            return;
        }
        if !inner.present.get(block_no) {
            inner.present.set(block_no);
            inner.data[idx] = Some(bytes);
        }
        let subscribers: Vec<Arc<dyn BulkSubscriber>> =
            inner.subscribers.iter().filter_map(Weak::upgrade).collect();
        for subscriber in subscribers {
            subscriber.on_block_received(block_no).await;
        }
    }

    /// `abort()` (§4.3): sets `aborted` and fans out `onAborted`.
    pub async fn abort(&self) {
        let mut inner = self.inner.lock().await;
        if inner.aborted {
            return;
        }
        inner.aborted = true;
        let subscribers: Vec<Arc<dyn BulkSubscriber>> =
            inner.subscribers.iter().filter_map(Weak::upgrade).collect();
        for subscriber in subscribers {
            subscriber.on_aborted().await;
        }
    }

    pub async fn is_aborted(&self) -> bool {
        self.inner.lock().await.aborted
    }

    /// `getBlockData(n)` (§4.3): `None` if aborted or not yet present.
    pub async fn get_block_data(&self, block_no: u32) -> Option<Vec<u8>> {
        let inner = self.inner.lock().await;
        if inner.aborted {
            return None;
        }
        inner.data.get(block_no as usize).and_then(|b| b.clone())
    }

    /// `hasWholeFile()` (§4.3): vacuously true for a zero-block file.
    pub async fn has_whole_file(&self) -> bool {
        self.inner.lock().await.present.all_set_bits()
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .subscribers
            .iter()
            .filter(|w| w.upgrade().is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSubscriber {
        received: Mutex<Vec<u32>>,
        aborted: std::sync::atomic::AtomicBool,
    }

    impl RecordingSubscriber {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: Mutex::new(Vec::new()),
                aborted: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl BulkSubscriber for RecordingSubscriber {
        async fn on_block_received(&self, block_no: u32) {
            self.received.lock().await.push(block_no);
        }
        async fn on_aborted(&self) {
            self.aborted.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn from_complete_has_whole_file_immediately() {
        let prb = PartiallyReceivedBulk::from_complete(4, b"abcdefgh");
        assert_eq!(prb.total_blocks(), 2);
        assert!(prb.has_whole_file().await);
        assert_eq!(prb.get_block_data(0).await, Some(b"abcd".to_vec()));
        assert_eq!(prb.get_block_data(1).await, Some(b"efgh".to_vec()));
    }

    #[tokio::test]
    async fn empty_file_has_whole_file_vacuously() {
        let prb = PartiallyReceivedBulk::from_complete(32, b"");
        assert_eq!(prb.total_blocks(), 0);
        assert!(prb.has_whole_file().await);
    }

    #[tokio::test]
    async fn block_received_fans_out_and_sets_bit() {
        let prb = PartiallyReceivedBulk::empty(4, 2);
        let sub = RecordingSubscriber::new();
        prb.add(sub.clone() as Arc<dyn BulkSubscriber>).await;

        prb.block_received(0, b"abcd".to_vec()).await;
        assert!(!prb.has_whole_file().await);
        prb.block_received(1, b"efgh".to_vec()).await;
        assert!(prb.has_whole_file().await);

        assert_eq!(*sub.received.lock().await, vec![0, 1]);
    }

    #[tokio::test]
    async fn abort_blocks_further_reads_and_notifies_subscribers() {
        let prb = PartiallyReceivedBulk::empty(4, 2);
        let sub = RecordingSubscriber::new();
        prb.add(sub.clone() as Arc<dyn BulkSubscriber>).await;
        prb.block_received(0, b"abcd".to_vec()).await;

        prb.abort().await;
        assert!(sub.aborted.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(prb.get_block_data(0).await, None);
    }

    #[tokio::test]
    async fn snapshot_and_subscribe_is_atomic() {
        let prb = PartiallyReceivedBulk::empty(4, 3);
        prb.block_received(0, b"abcd".to_vec()).await;
        let sub = RecordingSubscriber::new();
        let snapshot = prb
            .snapshot_and_subscribe(sub.clone() as Arc<dyn BulkSubscriber>)
            .await;
        assert!(snapshot.get(0));
        assert!(!snapshot.get(1));

        // A block arriving after the snapshot is delivered via the callback,
        // not silently folded into a bit the subscriber never observed.
        prb.block_received(1, b"efgh".to_vec()).await;
        assert_eq!(*sub.received.lock().await, vec![1]);
    }

    #[tokio::test]
    async fn remove_drops_subscriber() {
        let prb = PartiallyReceivedBulk::empty(4, 1);
        let sub = RecordingSubscriber::new();
        let handle = sub.clone() as Arc<dyn BulkSubscriber>;
        prb.add(handle.clone()).await;
        assert_eq!(prb.subscriber_count().await, 1);
        prb.remove(&handle).await;
        assert_eq!(prb.subscriber_count().await, 0);
    }
}
