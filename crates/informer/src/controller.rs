use std::sync::{Arc, Mutex, PoisonError};

use kmirror_core::{Delta, ListerWatcher, ObjectKey, Result, WatchConfig};
use kmirror_kubehub::Reflector;
use kmirror_store::{DeltaFifo, PopError};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a controller. One-shot: `Stopped` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("controller already ran (state: {0:?})")]
    AlreadyRun(ControllerState),
}

/// Consumes the deltas popped for one key. An error leaves them queued.
pub trait DeltaProcessor: Send + Sync {
    fn process(&self, key: &ObjectKey, deltas: &[Delta]) -> Result<()>;
}

impl<F> DeltaProcessor for F
where
    F: Fn(&ObjectKey, &[Delta]) -> Result<()> + Send + Sync,
{
    fn process(&self, key: &ObjectKey, deltas: &[Delta]) -> Result<()> {
        self(key, deltas)
    }
}

/// Runs a reflector into a [`DeltaFifo`] and drains the queue through a
/// [`DeltaProcessor`] on a single loop.
pub struct Controller<L: ?Sized, P> {
    name: String,
    config: WatchConfig,
    source: Arc<L>,
    queue: Arc<DeltaFifo>,
    processor: P,
    expected_kind: Option<String>,
    state: Mutex<ControllerState>,
}

impl<L, P> Controller<L, P>
where
    L: ListerWatcher + ?Sized + 'static,
    P: DeltaProcessor,
{
    pub fn new(name: &str, source: Arc<L>, queue: Arc<DeltaFifo>, processor: P, config: WatchConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            source,
            queue,
            processor,
            expected_kind: None,
            state: Mutex::new(ControllerState::Idle),
        }
    }

    pub fn with_expected_kind(mut self, kind: &str) -> Self {
        self.expected_kind = Some(kind.to_string());
        self
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, to: ControllerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    pub fn queue(&self) -> &Arc<DeltaFifo> {
        &self.queue
    }

    pub fn has_synced(&self) -> bool {
        self.queue.has_synced()
    }

    /// Run until `token` is cancelled, then wait for the reflector task to
    /// finish. Can be called once per controller.
    pub async fn run(&self, token: CancellationToken) -> std::result::Result<(), ControllerError> {
        {
            let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *st != ControllerState::Idle {
                return Err(ControllerError::AlreadyRun(*st));
            }
            *st = ControllerState::Running;
        }
        info!(controller = %self.name, retry_on_error = self.config.retry_on_error, "controller started");

        let reflector_token = token.child_token();
        let mut reflector = Reflector::new(&self.name, self.source.clone(), self.queue.clone(), &self.config);
        if let Some(kind) = &self.expected_kind {
            reflector = reflector.with_expected_kind(kind);
        }
        let reflector = tokio::spawn(reflector.run(reflector_token.clone()));

        self.process_loop(&token).await;

        reflector_token.cancel();
        self.queue.close();
        if let Err(e) = reflector.await {
            warn!(controller = %self.name, error = %e, "reflector task ended abnormally");
        }
        self.transition(ControllerState::Stopped);
        info!(controller = %self.name, "controller stopped");
        Ok(())
    }

    async fn process_loop(&self, token: &CancellationToken) {
        let mut backoff = self.config.backoff();
        loop {
            let popped = tokio::select! {
                _ = token.cancelled() => break,
                r = self.queue.pop(|key, deltas| self.processor.process(key, deltas)) => r,
            };
            let (key, failures, source) = match popped {
                Ok(()) => {
                    backoff.reset();
                    counter!("kmirror_controller_processed_total").increment(1);
                    continue;
                }
                Err(PopError::Closed) => {
                    debug!(controller = %self.name, "queue closed");
                    break;
                }
                Err(PopError::Process { key, failures, source }) => (key, failures, source),
            };

            counter!("kmirror_controller_errors_total").increment(1);
            if !self.config.retry_on_error && failures > 1 {
                let dropped = self.queue.discard_failed(&key);
                counter!("kmirror_controller_dropped_total").increment(dropped as u64);
                warn!(controller = %self.name, key = %key, failures, dropped, error = %source, "processing failed after retry; deltas dropped");
            } else {
                warn!(controller = %self.name, key = %key, failures, error = %source, "processing failed; will retry");
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
