//! Idle tunnel sweeper

use crate::registry::TunnelRegistry;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Spawn the periodic sweep. Online tunnels are refreshed on every pass, so
/// the reap only catches tunnels that stayed dark for a full idle window.
pub fn spawn(
    registry: TunnelRegistry,
    interval: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // first tick completes immediately
        loop {
            ticker.tick().await;
            let reaped = registry.sweep(idle_timeout);
            if reaped.is_empty() {
                debug!(live_tunnels = registry.count(), "idle sweep, nothing to reap");
            } else {
                for subdomain in &reaped {
                    info!(subdomain = %subdomain, "reaped idle tunnel");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingRequests;
    use axum::extract::ws::Message;
    use tokio::sync::mpsc;
    use tokio::time::advance;

    #[tokio::test(start_paused = true)]
    async fn monitor_reaps_fully_idle_tunnel() {
        let registry = TunnelRegistry::new(PendingRequests::new());
        let (tx, _rx) = mpsc::channel::<Message>(8);
        registry.register("abc", tx);
        // Leave grace state so the sweep, not a grace timer, owns the reap.
        registry.mark_offline("abc", Duration::from_secs(3600));

        let handle = spawn(
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_secs(300),
        );

        // Within the idle window the tunnel survives sweeps.
        advance(Duration::from_secs(240)).await;
        tokio::task::yield_now().await;
        assert!(registry.contains("abc"));

        // One full idle window with no traffic and it is gone.
        advance(Duration::from_secs(200)).await;
        tokio::task::yield_now().await;
        assert!(!registry.contains("abc"));

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_keeps_online_tunnels_alive() {
        let registry = TunnelRegistry::new(PendingRequests::new());
        let (tx, _rx) = mpsc::channel::<Message>(8);
        registry.register("abc", tx);

        let handle = spawn(
            registry.clone(),
            Duration::from_secs(60),
            Duration::from_secs(300),
        );

        advance(Duration::from_secs(1800)).await;
        tokio::task::yield_now().await;
        assert!(registry.contains("abc"));

        handle.abort();
    }
}
