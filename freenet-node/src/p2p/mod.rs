// The message-dispatch and bulk-transfer core.
//
// `message` and `peer_link` define the data model and the transport
// boundary; `filter` and `bus` implement the async demultiplexing engine;
// `bulk` implements the multi-block transfer on top of them.

pub mod bulk;
pub mod bus;
pub mod error;
pub mod filter;
pub mod message;
pub mod peer_link;
