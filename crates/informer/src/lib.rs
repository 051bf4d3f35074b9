//! kmirror informer: the pop-process loop that turns queued deltas into
//! client-state mutations and handler callbacks.

#![forbid(unsafe_code)]

mod controller;
mod handler;
mod informer;

pub use controller::{Controller, ControllerError, ControllerState, DeltaProcessor};
pub use handler::{HandlerFns, HandlerProcessor, ResourceEventHandler};
pub use informer::{new_informer, Informer};
