use std::sync::Arc;

use kmirror_core::{ListerWatcher, WatchConfig};
use kmirror_store::{DeltaFifo, Store};
use tokio_util::sync::CancellationToken;

use crate::{Controller, ControllerError, ControllerState, HandlerProcessor, ResourceEventHandler};

/// A controller wired to a client [`Store`] and a handler set.
pub struct Informer<L: ?Sized, H> {
    controller: Controller<L, HandlerProcessor<H>>,
    store: Arc<Store>,
}

/// Build an informer over `source`. The returned store is the client state:
/// it holds exactly what the handler has been told about.
pub fn new_informer<L, H>(name: &str, source: Arc<L>, handler: H, config: WatchConfig) -> (Arc<Store>, Informer<L, H>)
where
    L: ListerWatcher + ?Sized + 'static,
    H: ResourceEventHandler,
{
    let store = Arc::new(Store::new());
    let queue = Arc::new(DeltaFifo::new(Some(store.clone())));
    let processor = HandlerProcessor::new(store.clone(), handler);
    let controller = Controller::new(name, source, queue, processor, config);
    (store.clone(), Informer { controller, store })
}

impl<L, H> Informer<L, H>
where
    L: ListerWatcher + ?Sized + 'static,
    H: ResourceEventHandler,
{
    /// Skip objects of any other kind.
    pub fn with_expected_kind(mut self, kind: &str) -> Self {
        self.controller = self.controller.with_expected_kind(kind);
        self
    }

    pub async fn run(&self, token: CancellationToken) -> Result<(), ControllerError> {
        self.controller.run(token).await
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn state(&self) -> ControllerState {
        self.controller.state()
    }

    /// True once the initial list has been handed to the handler.
    pub fn has_synced(&self) -> bool {
        self.controller.has_synced()
    }

    /// Wait until synced. False if `token` is cancelled before that.
    pub async fn wait_for_sync(&self, token: &CancellationToken) -> bool {
        tokio::select! {
            _ = token.cancelled() => self.has_synced(),
            _ = self.controller.queue().wait_synced() => true,
        }
    }
}
