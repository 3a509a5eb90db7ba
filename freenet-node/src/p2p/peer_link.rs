//! The peer-connection boundary the dispatch/bulk-transfer core calls
//! through (§6). Packet framing, MAC/encryption and congestion control at
//! the UDP layer live outside this crate; `PeerLink` is the seam a real
//! transport implementation plugs into.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use freenet_common::tokio::sync::{mpsc, Mutex, Semaphore};
use freenet_common::tokio::time::timeout;

use super::error::{P2pError, P2pResult};
use super::message::Message;

/// Identifies one peer. Kept as a bare `u64` rather than a wrapper type,
/// since nothing in this core needs more than equality/hashing over it.
pub type PeerId = u64;

/// A tag tracking one outstanding (unacknowledged) packet submitted via
/// `sendThrottledMessage` (§4.4 `UnsentPacketTag`). Cloning shares the same
/// counter: every clone's `acknowledged`/`disconnected`/`fatal_error` call
/// affects the same transmitter wait.
#[derive(Clone)]
pub struct UnsentPacketTag {
    in_flight: Arc<AtomicU64>,
    failed: Arc<std::sync::atomic::AtomicBool>,
    notify: Arc<freenet_common::tokio::sync::Notify>,
}

impl UnsentPacketTag {
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            failed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            notify: Arc::new(freenet_common::tokio::sync::Notify::new()),
        }
    }

    /// Called by the link when a packet is handed to the socket. Purely
    /// informational per §4.4 — does not change wait state.
    pub fn sent(&self) {}

    /// Marks one outstanding packet submitted.
    pub fn submitted(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    /// Called by the link once the peer acks the packet.
    pub fn acknowledged(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Called by the link when the peer dropped before acking.
    pub fn disconnected(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Called by the link on any other unrecoverable send failure.
    pub fn fatal_error(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Returns the concrete `Notified` future (rather than `impl Future`)
    /// so callers can `enable()` it before checking their wait condition,
    /// closing the missed-wakeup window between the check and the await.
    pub fn notified(&self) -> freenet_common::tokio::sync::Notified<'_> {
        self.notify.notified()
    }
}

impl Default for UnsentPacketTag {
    fn default() -> Self {
        Self::new()
    }
}

/// Flow-control accounting exposed by a `PeerLink` (§2 table). Cheap,
/// lock-free atomic counters read by diagnostics code.
#[derive(Clone, Default)]
pub struct ByteCounter {
    sent: Arc<AtomicU64>,
    received: Arc<AtomicU64>,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sent(&self, bytes: u64) {
        self.sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_received(&self, bytes: u64) {
        self.received.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// A byte-budget limiter: permits are bytes of send credit. `acquire`
/// blocks (bounded by the caller's timeout) until enough credit is
/// available.
pub struct Throttle {
    semaphore: Semaphore,
}

impl Throttle {
    /// `capacity` is the number of bytes of credit outstanding at once.
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity.max(1)),
        }
    }

    /// Admits a packet of `size` bytes, waiting up to `timeout_ms` for
    /// enough credit. Returns `WaitedTooLong` on timeout; the permits are
    /// forgotten (not released) so throttling behaves as a leaky bucket
    /// replenished by whoever owns the `Throttle` (the link), not by the
    /// sender.
    pub async fn acquire(
        &self,
        peer: PeerId,
        size: u32,
        timeout_ms: u64,
    ) -> P2pResult<()> {
        let permits = size.max(1) as u32;
        match timeout(
            Duration::from_millis(timeout_ms),
            self.semaphore.acquire_many(permits),
        )
        .await
        {
            Ok(Ok(permit)) => {
                permit.forget();
                Ok(())
            }
            Ok(Err(_closed)) => Err(P2pError::NotConnected(peer)),
            Err(_elapsed) => Err(P2pError::WaitedTooLong(peer)),
        }
    }

    /// Replenishes `amount` bytes of credit, capped implicitly by the
    /// semaphore never exceeding its original capacity in practice (the
    /// caller is expected to add back only what it drained).
    pub fn replenish(&self, amount: usize) {
        self.semaphore.add_permits(amount);
    }
}

/// The peer-connection boundary exposed to the dispatch/bulk-transfer core
/// (§6). A real implementation frames, encrypts and MACs each `Message`
/// before handing it to the UDP socket; none of that is modeled here.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn id(&self) -> PeerId;

    /// Changes exactly when the peer restarts (§6).
    fn boot_id(&self) -> u64;

    fn is_connected(&self) -> bool;

    /// For diagnostics (§6).
    fn short_id(&self) -> String;

    fn byte_counter(&self) -> &ByteCounter;

    /// Enqueues a message; fails immediately if the peer is gone.
    async fn send_async(&self, msg: Message) -> P2pResult<()>;

    /// Blocks until the packet is admitted by the throttle, then enqueues
    /// it. `tag` is updated by the link as the packet's lifecycle
    /// advances (submitted → acknowledged | disconnected | fatal_error).
    async fn send_throttled_message(
        &self,
        msg: Message,
        size: u32,
        timeout_ms: u64,
        tag: UnsentPacketTag,
    ) -> P2pResult<()>;
}

impl fmt::Debug for dyn PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerLink[{}]", self.short_id())
    }
}

/// An in-memory `PeerLink` built on a pair of `mpsc` channels. Used to
/// exercise the bulk transfer and message-bus logic in tests without
/// real UDP framing.
pub struct ChannelPeerLink {
    id: PeerId,
    boot_id: AtomicU64,
    connected: std::sync::atomic::AtomicBool,
    counter: ByteCounter,
    throttle: Throttle,
    outbound: mpsc::Sender<Message>,
    /// Acks are delivered synchronously in this harness: every submitted
    /// packet is immediately acknowledged unless `drop_next_ack` was set.
    ack_mode: Mutex<AckMode>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum AckMode {
    /// Acknowledge every packet as soon as it is sent.
    Immediate,
    /// Never acknowledge packets (simulates a stalled/unresponsive peer).
    Never,
}

impl ChannelPeerLink {
    /// Creates a connected pair of links sharing one channel.
    pub fn pair(id_a: PeerId, id_b: PeerId) -> (Arc<Self>, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(1024);
        let link = Arc::new(Self {
            id: id_a,
            boot_id: AtomicU64::new(1),
            connected: std::sync::atomic::AtomicBool::new(true),
            counter: ByteCounter::new(),
            throttle: Throttle::new(16 * 1024 * 1024),
            outbound: tx,
            ack_mode: Mutex::new(AckMode::Immediate),
        });
        let _ = id_b;
        (link, rx)
    }

    pub async fn stall_acks(&self) {
        *self.ack_mode.lock().await = AckMode::Never;
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn restart(&self) {
        self.boot_id.fetch_add(1, Ordering::SeqCst);
    }

    pub fn throttle(&self) -> &Throttle {
        &self.throttle
    }
}

#[async_trait]
impl PeerLink for ChannelPeerLink {
    fn id(&self) -> PeerId {
        self.id
    }

    fn boot_id(&self) -> u64 {
        self.boot_id.load(Ordering::SeqCst)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn short_id(&self) -> String {
        format!("peer#{}", self.id)
    }

    fn byte_counter(&self) -> &ByteCounter {
        &self.counter
    }

    async fn send_async(&self, msg: Message) -> P2pResult<()> {
        if !self.is_connected() {
            return Err(P2pError::NotConnected(self.id));
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| P2pError::SendError(self.id))
    }

    async fn send_throttled_message(
        &self,
        msg: Message,
        size: u32,
        timeout_ms: u64,
        tag: UnsentPacketTag,
    ) -> P2pResult<()> {
        if !self.is_connected() {
            return Err(P2pError::NotConnected(self.id));
        }
        self.throttle.acquire(self.id, size, timeout_ms).await?;
        self.counter.add_sent(size as u64);
        tag.submitted();
        self.outbound.send(msg).await.map_err(|_| {
            tag.fatal_error();
            P2pError::SendError(self.id)
        })?;
        tag.sent();
        let ack_mode = *self.ack_mode.lock().await;
        match ack_mode {
            AckMode::Immediate => tag.acknowledged(),
            AckMode::Never => {}
        }
        Ok(())
    }
}
