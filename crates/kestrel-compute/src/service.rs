//! Service heartbeat.
//!
//! The compute daemon keeps a `(host, binary)` row in the store and bumps
//! its `last_seen_up` every report interval. The scheduler's service group
//! reads it to decide whether the host is up.

use std::time::Duration;

use kestrel_core::epoch_millis;
use kestrel_state::{ServiceRecord, StateResult, StateStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub struct ServiceReporter {
    store: StateStore,
    host: String,
    binary: String,
    interval: Duration,
}

impl ServiceReporter {
    pub fn new(
        store: StateStore,
        host: impl Into<String>,
        binary: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            host: host.into(),
            binary: binary.into(),
            interval,
        }
    }

    /// Create the service row if missing and mark it up.
    ///
    /// An existing row keeps its `disabled` and `forced_down` flags.
    pub fn register(&self) -> StateResult<ServiceRecord> {
        let now = epoch_millis();
        let mut service = match self.store.get_service(&self.host, &self.binary)? {
            Some(existing) => existing,
            None => {
                info!(host = %self.host, binary = %self.binary, "registering service");
                ServiceRecord::new(self.host.clone(), self.binary.clone(), now)
            }
        };
        service.last_seen_up = Some(now);
        self.store.put_service(&service)?;
        Ok(service)
    }

    pub fn report_once(&self) -> StateResult<ServiceRecord> {
        let service = self
            .store
            .touch_service(&self.host, &self.binary, epoch_millis())?;
        debug!(host = %self.host, binary = %self.binary, "service heartbeat");
        Ok(service)
    }

    /// Report until `shutdown` flips. Failed reports are logged and retried
    /// on the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.report_once() {
                        warn!(host = %self.host, binary = %self.binary, error = %e, "service heartbeat failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(host = %self.host, "heartbeat loop shutting down");
                    break;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
