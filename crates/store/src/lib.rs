//! kmirror store: the key-indexed cache and the per-key delta queue that feeds
//! the controller loop.

#![forbid(unsafe_code)]

mod cache;
mod fifo;

pub use cache::Store;
pub use fifo::{DeltaFifo, PopError};
