// Freenet node library
// Message-dispatch and bulk-transfer core, plus the node-level constants
// the rest of the overlay (routing, datastore, FCP) builds on top of.

#[macro_use]
extern crate log;

pub mod config;
pub mod p2p;

/// Test-only logging bootstrap, mirroring the teacher's binaries' use of
/// `env_logger` at process start — here invoked per-test so `RUST_LOG` can
/// surface the trace/debug logs the bus and transmitter emit.
#[cfg(test)]
pub(crate) mod test_support {
    pub fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }
}
