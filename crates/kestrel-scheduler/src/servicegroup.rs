//! Service liveness.

use std::time::Duration;

use kestrel_core::epoch_millis;
use kestrel_state::ServiceRecord;

/// Decides whether a service is up from its heartbeat age.
#[derive(Debug, Clone, Copy)]
pub struct ServiceGroup {
    down_time: Duration,
}

impl ServiceGroup {
    pub fn new(down_time: Duration) -> Self {
        Self { down_time }
    }

    pub fn service_is_up(&self, service: &ServiceRecord) -> bool {
        self.is_up_at(service, epoch_millis())
    }

    /// A forced-down service is never up. Otherwise the last heartbeat,
    /// or the creation time if it never reported, must be within the
    /// down time of `now`.
    pub fn is_up_at(&self, service: &ServiceRecord, now: u64) -> bool {
        if service.forced_down {
            return false;
        }
        let last_heartbeat = service.last_seen_up.unwrap_or(service.created_at);
        now.saturating_sub(last_heartbeat) <= self.down_time.as_millis() as u64
    }
}
