use thiserror::Error;

use super::message::IncorrectTypeError;

/// Errors surfaced by the message-dispatch and bulk-transfer core.
///
/// Disposition for each variant is described in the design notes: most are
/// terminal for the operation that raised them (a transfer cancels, a send
/// fails) rather than being retried internally.
#[derive(Debug, Error)]
pub enum P2pError {
    /// The peer was already gone when we tried to register against it.
    #[error("peer {0} is not connected")]
    Disconnected(u64),

    /// The link reported the peer as gone mid-operation.
    #[error("peer {0} is no longer connected")]
    NotConnected(u64),

    /// The peer's `bootId` changed since we last observed it: it restarted.
    #[error("peer {0} restarted (boot id changed)")]
    PeerRestarted(u64),

    /// The outbound throttle would not admit the packet in time.
    #[error("throttled send to peer {0} waited too long")]
    WaitedTooLong(u64),

    /// A filter was told to compare a field against a type its schema rejects.
    #[error(transparent)]
    IncorrectType(#[from] IncorrectTypeError),

    #[error("channel closed while sending to peer {0}")]
    SendError(u64),
}

pub type P2pResult<T> = Result<T, P2pError>;
