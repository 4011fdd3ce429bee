//! Tunnel registry and lifecycle state machine
//!
//! One entry per live subdomain. State transitions:
//!
//! ```text
//! [Absent] --register--> [Online]
//! [Online] --mark_offline--> [OfflineGrace]   (grace timer armed)
//! [OfflineGrace] --grace expiry--> reaped
//! [OfflineGrace] --reattach--> [Online]
//! [Online/OfflineGrace] --reap / idle sweep--> reaped
//! ```
//!
//! Reaped subdomains are never reused; a later agent gets a fresh one.
//! All observe+mutate pairs run under the registry lock, so a reattach can
//! never race a grace expiry: whichever takes the lock first wins, and the
//! loser sees the new state and backs off.

use crate::pending::PendingRequests;
use crate::TUNNEL_LOST_BODY;
use axum::extract::ws::Message;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Online,
    OfflineGrace,
}

struct TunnelEntry {
    control: mpsc::Sender<Message>,
    /// Secondary client channels, kept so a reap closes them too.
    clients: HashMap<u64, mpsc::Sender<Message>>,
    state: TunnelState,
    /// Identifies which armed grace timer may still reap this entry.
    grace_epoch: u64,
    grace_timer: Option<JoinHandle<()>>,
    last_active: Instant,
}

struct RegistryInner {
    tunnels: RwLock<HashMap<String, TunnelEntry>>,
    pending: PendingRequests,
    next_client_id: AtomicU64,
    next_epoch: AtomicU64,
}

/// Keyed mapping from subdomain to tunnel state.
#[derive(Clone)]
pub struct TunnelRegistry {
    inner: Arc<RegistryInner>,
}

impl TunnelRegistry {
    pub fn new(pending: PendingRequests) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                tunnels: RwLock::new(HashMap::new()),
                pending,
                next_client_id: AtomicU64::new(1),
                next_epoch: AtomicU64::new(1),
            }),
        }
    }

    /// Create a new Online entry bound to `control`.
    pub fn register(&self, subdomain: &str, control: mpsc::Sender<Message>) {
        let entry = TunnelEntry {
            control,
            clients: HashMap::new(),
            state: TunnelState::Online,
            grace_epoch: 0,
            grace_timer: None,
            last_active: Instant::now(),
        };
        let replaced = self
            .inner
            .tunnels
            .write()
            .unwrap()
            .insert(subdomain.to_string(), entry);
        if let Some(old) = replaced {
            // The allocator makes this effectively unreachable; clean up anyway.
            warn!(subdomain = %subdomain, "replacing existing tunnel entry");
            self.finish_reap(subdomain, old);
        }
        info!(subdomain = %subdomain, "tunnel registered");
    }

    /// Rebind a tunnel that is inside its grace window.
    /// Returns false when the entry is absent or already Online, in which
    /// case the caller should register a fresh tunnel instead.
    pub fn reattach(&self, subdomain: &str, control: mpsc::Sender<Message>) -> bool {
        let mut tunnels = self.inner.tunnels.write().unwrap();
        match tunnels.get_mut(subdomain) {
            Some(entry) if entry.state == TunnelState::OfflineGrace => {
                if let Some(timer) = entry.grace_timer.take() {
                    timer.abort();
                }
                entry.control = control;
                entry.state = TunnelState::Online;
                entry.last_active = Instant::now();
                info!(subdomain = %subdomain, "tunnel reattached within grace window");
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, subdomain: &str) -> bool {
        self.inner.tunnels.read().unwrap().contains_key(subdomain)
    }

    pub fn state_of(&self, subdomain: &str) -> Option<TunnelState> {
        self.inner
            .tunnels
            .read()
            .unwrap()
            .get(subdomain)
            .map(|e| e.state)
    }

    /// Clone out the control sender for an outbound frame.
    pub fn control_sender(&self, subdomain: &str) -> Option<mpsc::Sender<Message>> {
        self.inner
            .tunnels
            .read()
            .unwrap()
            .get(subdomain)
            .map(|e| e.control.clone())
    }

    /// Record activity on a tunnel.
    pub fn touch(&self, subdomain: &str) {
        if let Some(entry) = self.inner.tunnels.write().unwrap().get_mut(subdomain) {
            entry.last_active = Instant::now();
        }
    }

    /// Transition Online -> OfflineGrace and arm the grace timer.
    ///
    /// A second call while already in grace preserves the existing timer.
    pub fn mark_offline(&self, subdomain: &str, grace: Duration) {
        let epoch = self.inner.next_epoch.fetch_add(1, Ordering::Relaxed);
        {
            let mut tunnels = self.inner.tunnels.write().unwrap();
            let Some(entry) = tunnels.get_mut(subdomain) else {
                return;
            };
            if entry.state == TunnelState::OfflineGrace {
                debug!(subdomain = %subdomain, "already in grace window, keeping existing timer");
                return;
            }
            entry.state = TunnelState::OfflineGrace;
            entry.grace_epoch = epoch;
            entry.last_active = Instant::now();

            let registry = self.clone();
            let sub = subdomain.to_string();
            entry.grace_timer = Some(tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                registry.reap_expired(&sub, epoch);
            }));
        }
        info!(subdomain = %subdomain, grace_ms = grace.as_millis() as u64, "tunnel offline, grace window armed");
    }

    /// Reap invoked by a grace timer. No-ops unless the entry is still in
    /// the grace window armed by the same `mark_offline` call.
    fn reap_expired(&self, subdomain: &str, epoch: u64) {
        let removed = {
            let mut tunnels = self.inner.tunnels.write().unwrap();
            match tunnels.get(subdomain) {
                Some(entry)
                    if entry.state == TunnelState::OfflineGrace && entry.grace_epoch == epoch =>
                {
                    tunnels.remove(subdomain)
                }
                _ => None,
            }
        };
        if let Some(entry) = removed {
            debug!(subdomain = %subdomain, "grace window expired");
            self.finish_reap(subdomain, entry);
        }
    }

    /// Remove a tunnel unconditionally. Idempotent.
    pub fn reap(&self, subdomain: &str) {
        let removed = self.inner.tunnels.write().unwrap().remove(subdomain);
        if let Some(entry) = removed {
            self.finish_reap(subdomain, entry);
        }
    }

    /// Drop channels, cancel the timer, and fail the tunnel's pending
    /// requests. Runs outside the registry lock.
    fn finish_reap(&self, subdomain: &str, entry: TunnelEntry) {
        if let Some(timer) = entry.grace_timer {
            timer.abort();
        }
        // Dropping the senders ends the per-socket writer tasks, which close
        // the control channel and every secondary client channel.
        drop(entry.control);
        drop(entry.clients);
        let drained = self
            .inner
            .pending
            .fail_subdomain(subdomain, 502, TUNNEL_LOST_BODY);
        info!(subdomain = %subdomain, drained_requests = drained, "tunnel reaped");
    }

    /// Attach a secondary client channel. Returns its id, or None when the
    /// tunnel vanished between routing and the upgrade completing.
    pub fn add_client(&self, subdomain: &str, sender: mpsc::Sender<Message>) -> Option<u64> {
        let id = self.inner.next_client_id.fetch_add(1, Ordering::Relaxed);
        let mut tunnels = self.inner.tunnels.write().unwrap();
        let entry = tunnels.get_mut(subdomain)?;
        entry.clients.insert(id, sender);
        debug!(subdomain = %subdomain, client_id = id, "client channel attached");
        Some(id)
    }

    pub fn remove_client(&self, subdomain: &str, client_id: u64) {
        if let Some(entry) = self.inner.tunnels.write().unwrap().get_mut(subdomain) {
            entry.clients.remove(&client_id);
            debug!(subdomain = %subdomain, client_id, "client channel detached");
        }
    }

    /// Idle sweep: reap entries whose last activity exceeds `idle_timeout`,
    /// refresh the rest that are Online. Returns the reaped subdomains.
    pub fn sweep(&self, idle_timeout: Duration) -> Vec<String> {
        let mut reaped = Vec::new();
        {
            let mut tunnels = self.inner.tunnels.write().unwrap();
            let stale: Vec<String> = tunnels
                .iter()
                .filter(|(_, entry)| entry.last_active.elapsed() > idle_timeout)
                .map(|(sub, _)| sub.clone())
                .collect();
            for sub in stale {
                if let Some(entry) = tunnels.remove(&sub) {
                    reaped.push((sub, entry));
                }
            }
            let now = Instant::now();
            for entry in tunnels.values_mut() {
                if entry.state == TunnelState::Online {
                    entry.last_active = now;
                }
            }
        }
        reaped
            .into_iter()
            .map(|(sub, entry)| {
                self.finish_reap(&sub, entry);
                sub
            })
            .collect()
    }

    /// Reap every tunnel and fail anything left in the pending table.
    pub fn reap_all(&self) {
        let drained: Vec<(String, TunnelEntry)> =
            self.inner.tunnels.write().unwrap().drain().collect();
        for (sub, entry) in drained {
            self.finish_reap(&sub, entry);
        }
        self.inner.pending.fail_all(502, TUNNEL_LOST_BODY);
    }

    pub fn count(&self) -> usize {
        self.inner.tunnels.read().unwrap().len()
    }
}
