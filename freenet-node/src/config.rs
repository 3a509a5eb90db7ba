// Message filter/bus rules
// How often the bus sweeps registered filters for expired deadlines, millis
pub const FILTER_SWEEP_INTERVAL_MILLIS: u64 = 1_000;

// Bulk transfer rules (§6: transfer of a PartiallyReceivedBulk)
// Per-transfer idle timeout: cancel if no packet was successfully sent in this window, millis
pub const BULK_TRANSFER_TIMEOUT_MILLIS: u64 = 300_000;
// Grace period after completion during which the receive-all filter is kept
// around for late/duplicate BulkReceivedAll delivery, millis
pub const BULK_FINAL_ACK_TIMEOUT_MILLIS: u64 = 10_000;
// Upper bound on how long the send loop sleeps with nothing to do before
// re-checking its deadlines, millis
pub const BULK_IDLE_POLL_INTERVAL_MILLIS: u64 = 60_000;
// Fixed per-packet envelope overhead on top of the block payload itself:
// uid (8 bytes) + blockNo (4 bytes) — `bulkPacketEnvelope(blockSize)` in §4.4
pub const BULK_PACKET_ENVELOPE_OVERHEAD: u32 = 12;
// Approximate per-message framing overhead charged against the peer's
// throttle budget on top of the envelope — `oneMessageHeaderOverhead(peer)`
pub const BULK_MESSAGE_HEADER_OVERHEAD: u32 = 32;
// Per-packet throttle admission timeout (`BulkReceiver.TIMEOUT` in §6),
// also used by the receiver as the per-packet wait deadline before
// re-checking whether the transfer completed or was aborted, millis
pub const BULK_PACKET_SEND_TIMEOUT_MILLIS: u64 = 15_000;
