//! Pending request table
//!
//! Tracks HTTP requests sent through tunnels and routes responses back to
//! the waiting caller tasks. Every entry completes exactly once: by the
//! agent's response, by the caller's timeout (which cancels the entry), or
//! by a drain when the owning tunnel is reaped.

use bunnel_proto::{Headers, TunnelResponse};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

struct PendingEntry {
    /// Subdomain that owns this request, used by the reap drain.
    subdomain: String,
    tx: oneshot::Sender<TunnelResponse>,
}

/// Tracks in-flight requests awaiting agent responses.
#[derive(Clone)]
pub struct PendingRequests {
    requests: Arc<DashMap<String, PendingEntry>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
        }
    }

    /// Register a new pending request owned by `subdomain`.
    /// Returns the receiver the caller awaits on.
    ///
    /// The entry expires after `ttl` even if the caller never cancels it,
    /// e.g. because the caller's connection dropped mid-wait. The expiry
    /// timer tolerates the entry being long gone.
    pub fn register(
        &self,
        subdomain: &str,
        id: &str,
        ttl: Duration,
    ) -> oneshot::Receiver<TunnelResponse> {
        let (tx, rx) = oneshot::channel();
        self.requests.insert(
            id.to_string(),
            PendingEntry {
                subdomain: subdomain.to_string(),
                tx,
            },
        );
        debug!(request_id = %id, subdomain = %subdomain, "registered pending request");

        let requests = self.requests.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if requests.remove(&id).is_some() {
                debug!(request_id = %id, "expired abandoned pending request");
            }
        });
        rx
    }

    /// Deliver a response for a pending request.
    /// Returns true if a caller was completed; an unknown id is a no-op.
    pub fn respond(&self, response: TunnelResponse) -> bool {
        if let Some((id, entry)) = self.requests.remove(&response.id) {
            if entry.tx.send(response).is_err() {
                warn!(request_id = %id, "caller went away before the response arrived");
                return false;
            }
            return true;
        }
        debug!(request_id = %response.id, "dropping response for unknown request id");
        false
    }

    /// Remove an entry without completing it (caller-side timeout).
    pub fn cancel(&self, id: &str) {
        if self.requests.remove(id).is_some() {
            debug!(request_id = %id, "cancelled pending request");
        }
    }

    /// Complete every entry owned by `subdomain` with the given failure.
    /// Returns the number of callers drained.
    pub fn fail_subdomain(&self, subdomain: &str, status: u16, body: &str) -> usize {
        let ids: Vec<String> = self
            .requests
            .iter()
            .filter(|entry| entry.value().subdomain == subdomain)
            .map(|entry| entry.key().clone())
            .collect();
        self.fail_ids(&ids, status, body)
    }

    /// Complete every remaining entry with the given failure (shutdown).
    pub fn fail_all(&self, status: u16, body: &str) -> usize {
        let ids: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();
        self.fail_ids(&ids, status, body)
    }

    fn fail_ids(&self, ids: &[String], status: u16, body: &str) -> usize {
        let mut drained = 0;
        for id in ids {
            if let Some((id, entry)) = self.requests.remove(id) {
                let response = TunnelResponse {
                    id,
                    status,
                    headers: Headers::new(),
                    body: body.to_string(),
                };
                if entry.tx.send(response).is_ok() {
                    drained += 1;
                }
            }
        }
        drained
    }

    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn response(id: &str, status: u16) -> TunnelResponse {
        TunnelResponse {
            id: id.to_string(),
            status,
            headers: Headers::new(),
            body: String::new(),
        }
    }

    #[tokio::test]
    async fn register_and_respond() {
        let pending = PendingRequests::new();
        let rx = pending.register("abc", "r-1", TTL);
        assert_eq!(pending.count(), 1);

        assert!(pending.respond(response("r-1", 200)));
        assert_eq!(pending.count(), 0);

        let received = rx.await.unwrap();
        assert_eq!(received.status, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_entry_expires_after_ttl() {
        let pending = PendingRequests::new();
        let rx = pending.register("abc", "r-1", TTL);
        // The caller vanishes without cancelling.
        drop(rx);

        tokio::time::sleep(TTL + Duration::from_secs(1)).await;
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn respond_unknown_id_is_noop() {
        let pending = PendingRequests::new();
        assert!(!pending.respond(response("missing", 200)));
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn cancel_removes_without_completing() {
        let pending = PendingRequests::new();
        let rx = pending.register("abc", "r-1", TTL);
        pending.cancel("r-1");
        assert_eq!(pending.count(), 0);
        assert!(rx.await.is_err());

        // Cancelling again must not panic.
        pending.cancel("r-1");
    }

    #[tokio::test]
    async fn double_respond_first_writer_wins() {
        let pending = PendingRequests::new();
        let rx = pending.register("abc", "r-1", TTL);

        assert!(pending.respond(response("r-1", 200)));
        assert!(!pending.respond(response("r-1", 500)));

        assert_eq!(rx.await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn respond_with_dropped_receiver() {
        let pending = PendingRequests::new();
        let rx = pending.register("abc", "r-1", TTL);
        drop(rx);

        assert!(!pending.respond(response("r-1", 200)));
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn drain_only_touches_owned_entries() {
        let pending = PendingRequests::new();
        let rx_a1 = pending.register("aaa", "r-1", TTL);
        let rx_a2 = pending.register("aaa", "r-2", TTL);
        let rx_b = pending.register("bbb", "r-3", TTL);

        let drained = pending.fail_subdomain("aaa", 502, "Tunnel connection lost");
        assert_eq!(drained, 2);
        assert_eq!(pending.count(), 1);

        assert_eq!(rx_a1.await.unwrap().status, 502);
        let a2 = rx_a2.await.unwrap();
        assert_eq!(a2.status, 502);
        assert_eq!(a2.body, "Tunnel connection lost");

        // The other tunnel's entry is untouched.
        assert!(pending.respond(response("r-3", 204)));
        assert_eq!(rx_b.await.unwrap().status, 204);
    }

    #[tokio::test]
    async fn fail_all_drains_everything() {
        let pending = PendingRequests::new();
        let rx1 = pending.register("aaa", "r-1", TTL);
        let rx2 = pending.register("bbb", "r-2", TTL);

        assert_eq!(pending.fail_all(502, "Tunnel connection lost"), 2);
        assert_eq!(pending.count(), 0);
        assert_eq!(rx1.await.unwrap().status, 502);
        assert_eq!(rx2.await.unwrap().status, 502);
    }

    #[tokio::test]
    async fn concurrent_register_and_respond() {
        let pending = PendingRequests::new();

        let mut handles = vec![];
        for i in 0..20 {
            let pending = pending.clone();
            handles.push(tokio::spawn(async move {
                let id = format!("r-{i}");
                let rx = pending.register("abc", &id, TTL);
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                pending.respond(response(&id, 200));
                rx.await.unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().status, 200);
        }
        assert_eq!(pending.count(), 0);
    }
}
