//! Lifecycle sweeper
//!
//! Periodic backstop for the per-session timers: evicts sessions past their
//! absolute lifetime and detached sessions past the idle budget. Sessions
//! with a reattachment claim younger than the grace window are left alone.

use std::sync::Weak;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::registry::eviction_reason;
use crate::session::SessionState;

use super::core::BrokerInner;

/// Spawn the sweeper; it stops once the broker is dropped
pub(crate) fn spawn_sweeper(broker: Weak<BrokerInner>, period: Duration) -> JoinHandle<()> {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            let Some(broker) = broker.upgrade() else {
                break;
            };
            broker.sweep();
        }
        log::debug!("Sweeper stopped");
    })
}

impl BrokerInner {
    /// Evict every expired session, returning how many were removed
    pub(crate) fn sweep(&self) -> usize {
        let now = Instant::now();
        let budgets = self.budgets();
        let mut evicted = 0;

        for (session_id, _) in self.registry.expired(now, budgets) {
            // Re-evaluate under the lock: traffic or a claim may have arrived
            let reason = self
                .registry
                .with_session(&session_id, |session| {
                    let reason = eviction_reason(session, now, budgets);
                    if reason.is_some() {
                        session.state = SessionState::Closing;
                    }
                    reason
                })
                .flatten();

            if let Some(reason) = reason
                && self.registry.delete(&session_id, reason)
            {
                evicted += 1;
            }
        }

        if evicted > 0 {
            log::info!("Sweeper evicted {evicted} session(s)");
        }
        evicted
    }
}
