//! Availability detector: probes the local daemon and reports when its
//! reachability flips.

use parking_lot::Mutex;
use providers::ollama::DETECT_TIMEOUT;
use shared::events::{AvailabilityChange, ProbeReason};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::registry::EngineRegistry;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

pub struct AvailabilityDetector {
    registry: Arc<EngineRegistry>,
    timeout: Duration,
    last: Mutex<Option<bool>>,
    events: broadcast::Sender<AvailabilityChange>,
}

impl AvailabilityDetector {
    pub fn new(registry: Arc<EngineRegistry>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            registry,
            timeout: DETECT_TIMEOUT,
            last: Mutex::new(None),
            events,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AvailabilityChange> {
        self.events.subscribe()
    }

    /// Last observed reachability, `None` before the first probe.
    pub fn last_known(&self) -> Option<bool> {
        *self.last.lock()
    }

    /// Probe once. A change event is sent when the result differs from the
    /// previous probe (the first probe always counts as a change).
    pub async fn probe(&self, reason: ProbeReason) -> bool {
        let available = self.registry.probe_daemon(self.timeout).await;
        let changed = {
            let mut last = self.last.lock();
            let changed = *last != Some(available);
            *last = Some(available);
            changed
        };
        if changed {
            info!(available, reason = ?reason, "daemon availability changed");
            let _ = self.events.send(AvailabilityChange { available, reason });
        } else {
            debug!(available, reason = ?reason, "daemon probe");
        }
        available
    }

    /// Probe every `interval` until the detector is dropped.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick fires immediately; startup already probed
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(detector) = weak.upgrade() else {
                    break;
                };
                detector.probe(ProbeReason::Heartbeat).await;
            }
        })
    }
}
