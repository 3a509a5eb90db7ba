//! Multi-block file transfer on top of the message bus: a shared block
//! buffer ([`prb`]), the sending side ([`transmitter`]) and the receiving
//! side ([`receiver`]) (§4.3-§4.5).

pub mod prb;
pub mod receiver;
pub mod transmitter;

pub use prb::{Bitmap, BulkSubscriber, PartiallyReceivedBulk};
pub use receiver::BulkReceiver;
pub use transmitter::BulkTransmitter;
