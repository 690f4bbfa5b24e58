//! Network activity indicator
//!
//! Counts operations with traffic in flight and drives an [`ActivitySink`],
//! typically a platform status-bar spinner. Turning the signal off is delayed
//! by a short idle period so operations started back to back do not make it
//! flicker.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::transfer::worker;

/// Default idle period before the signal is turned off
pub const DEFAULT_IDLE_DELAY: Duration = Duration::from_millis(250);

/// Receiver of the aggregated activity signal.
///
/// Called with the indicator's lock held; must not call back into the
/// indicator.
pub trait ActivitySink: Send + Sync {
    /// Turn the platform's activity signal on or off
    fn set_network_active(&self, active: bool);
}

#[derive(Debug, Default)]
struct ActivityState {
    count: usize,
    generation: u64,
    active: bool,
}

/// Shared in-flight counter with a debounced on/off signal.
pub struct NetworkActivityIndicator {
    sink: Arc<dyn ActivitySink>,
    idle_delay: Duration,
    state: Mutex<ActivityState>,
}

impl NetworkActivityIndicator {
    /// An indicator with the default idle delay
    pub fn new(sink: Arc<dyn ActivitySink>) -> Arc<Self> {
        Self::with_idle_delay(sink, DEFAULT_IDLE_DELAY)
    }

    /// An indicator that waits `idle_delay` after the count drops to zero
    /// before turning the signal off.
    pub fn with_idle_delay(sink: Arc<dyn ActivitySink>, idle_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            sink,
            idle_delay,
            state: Mutex::new(ActivityState::default()),
        })
    }

    /// Whether the sink was last told the network is active
    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Operations currently counted as in flight
    pub fn active_count(&self) -> usize {
        self.lock().count
    }

    /// Count one more operation in flight.
    pub fn increment(self: &Arc<Self>) {
        let mut state = self.lock();
        state.count += 1;
        state.generation += 1;
        if !state.active {
            state.active = true;
            tracing::trace!("Network activity on");
            self.sink.set_network_active(true);
        }
    }

    /// Count one operation as done; the signal goes off after the idle delay
    /// unless another operation starts first.
    pub fn decrement(self: &Arc<Self>) {
        let generation = {
            let mut state = self.lock();
            if state.count == 0 {
                return;
            }
            state.count -= 1;
            if state.count > 0 {
                return;
            }
            state.generation += 1;
            state.generation
        };

        let indicator = Arc::clone(self);
        let delay = self.idle_delay;
        match worker::shared() {
            Ok(worker) => worker.spawn_detached(async move {
                tokio::time::sleep(delay).await;
                indicator.settle(generation);
            }),
            Err(e) => {
                tracing::warn!("No worker for the activity timer: {}", e);
                indicator.settle(generation);
            }
        }
    }

    fn settle(&self, generation: u64) {
        let mut state = self.lock();
        if state.generation == generation && state.count == 0 && state.active {
            state.active = false;
            tracing::trace!("Network activity off");
            self.sink.set_network_active(false);
        }
    }

    fn lock(&self) -> MutexGuard<'_, ActivityState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for NetworkActivityIndicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkActivityIndicator")
            .field("idle_delay", &self.idle_delay)
            .field("state", &*self.lock())
            .finish()
    }
}
