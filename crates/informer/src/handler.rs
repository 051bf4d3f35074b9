use std::sync::Arc;

use kmirror_core::{Delta, DeltaType, ObjectKey, ObjectStore, Resource, Result};
use tracing::{debug, warn};

use crate::DeltaProcessor;

/// Consumer callbacks. Invoked on the controller loop, one at a time, in
/// per-key delta order. A handler that blocks stalls all processing.
pub trait ResourceEventHandler: Send + Sync {
    fn on_add(&self, _obj: &Resource) {}
    fn on_update(&self, _old: &Resource, _new: &Resource) {}
    fn on_delete(&self, _obj: &Resource) {}
    /// A re-list re-delivered `obj`. Fires before the `on_add`/`on_update`
    /// for the same delta.
    fn on_sync(&self, _obj: &Resource) {}
}

impl<H: ResourceEventHandler + ?Sized> ResourceEventHandler for Arc<H> {
    fn on_add(&self, obj: &Resource) {
        (**self).on_add(obj)
    }

    fn on_update(&self, old: &Resource, new: &Resource) {
        (**self).on_update(old, new)
    }

    fn on_delete(&self, obj: &Resource) {
        (**self).on_delete(obj)
    }

    fn on_sync(&self, obj: &Resource) {
        (**self).on_sync(obj)
    }
}

type ObjFn = Box<dyn Fn(&Resource) + Send + Sync>;
type PairFn = Box<dyn Fn(&Resource, &Resource) + Send + Sync>;

/// Handler built from optional closures; missing ones are no-ops.
#[derive(Default)]
pub struct HandlerFns {
    add: Option<ObjFn>,
    update: Option<PairFn>,
    delete: Option<ObjFn>,
    sync: Option<ObjFn>,
}

impl HandlerFns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_add(mut self, f: impl Fn(&Resource) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }

    pub fn on_update(mut self, f: impl Fn(&Resource, &Resource) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }

    pub fn on_delete(mut self, f: impl Fn(&Resource) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }

    pub fn on_sync(mut self, f: impl Fn(&Resource) + Send + Sync + 'static) -> Self {
        self.sync = Some(Box::new(f));
        self
    }
}

impl ResourceEventHandler for HandlerFns {
    fn on_add(&self, obj: &Resource) {
        if let Some(f) = &self.add {
            f(obj)
        }
    }

    fn on_update(&self, old: &Resource, new: &Resource) {
        if let Some(f) = &self.update {
            f(old, new)
        }
    }

    fn on_delete(&self, obj: &Resource) {
        if let Some(f) = &self.delete {
            f(obj)
        }
    }

    fn on_sync(&self, obj: &Resource) {
        if let Some(f) = &self.sync {
            f(obj)
        }
    }
}

/// Applies deltas to the client state and fires the matching callback.
///
/// `Sync` fires `on_sync`, then behaves like `Updated` for an object the
/// client state holds and like `Added` otherwise.
pub struct HandlerProcessor<H> {
    state: Arc<dyn ObjectStore>,
    handler: H,
}

impl<H: ResourceEventHandler> HandlerProcessor<H> {
    pub fn new(state: Arc<dyn ObjectStore>, handler: H) -> Self {
        Self { state, handler }
    }
}

impl<H: ResourceEventHandler> DeltaProcessor for HandlerProcessor<H> {
    fn process(&self, key: &ObjectKey, deltas: &[Delta]) -> Result<()> {
        for d in deltas {
            if d.kind == DeltaType::Sync {
                self.handler.on_sync(&d.object);
            }
            match d.kind {
                DeltaType::Added | DeltaType::Updated | DeltaType::Sync => match self.state.get(key) {
                    Some(old) => {
                        self.state.update(d.object.clone())?;
                        self.handler.on_update(&old, &d.object);
                    }
                    None => {
                        self.state.add(d.object.clone())?;
                        self.handler.on_add(&d.object);
                    }
                },
                DeltaType::Deleted => match self.state.get(key) {
                    Some(old) => {
                        self.state.delete(d.object.clone())?;
                        let last = if d.final_state_unknown { &old } else { &d.object };
                        self.handler.on_delete(last);
                    }
                    None => debug!(key = %key, "delete for an object never delivered; no callback"),
                },
                other => warn!(key = %key, kind = ?other, "unknown delta type; skipped"),
            }
        }
        Ok(())
    }
}
