//! Thin re-export of the tokio runtime, with wrapped sync primitives.
//!
//! Downstream code depends on `freenet_common::tokio` instead of `tokio`
//! directly so that the `sync` submodule can be swapped for debug wrappers
//! (see [`sync`]) without touching call sites.

pub use tokio::{net, pin, runtime, select, spawn, task, time};

pub mod sync;
