//! kmirror kubehub: the list+watch reflector and the sources it drives.

#![forbid(unsafe_code)]

mod kube_source;
mod memory;
mod reflector;

pub use kube_source::{client, discover, ClientOptions, DiscoveredResource, KubeListerWatcher};
pub use memory::MemorySource;
pub use reflector::{Reflector, SyncVersion};
