//! Subdomain allocation

use crate::registry::TunnelRegistry;
use rand::Rng;
use tracing::warn;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Length of generated subdomains. 12 base-36 characters give ~62 bits of
/// entropy, which makes collisions negligible at any realistic tunnel count.
pub const SUBDOMAIN_LEN: usize = 12;

/// Produces fresh subdomains, unique across the live registry.
#[derive(Debug, Clone)]
pub struct SubdomainAllocator {
    length: usize,
}

impl SubdomainAllocator {
    pub fn new() -> Self {
        Self {
            length: SUBDOMAIN_LEN,
        }
    }

    /// Generate one candidate without checking for collisions.
    pub fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    }

    /// Allocate a subdomain not currently present in the registry.
    pub fn allocate(&self, registry: &TunnelRegistry) -> String {
        loop {
            let candidate = self.generate();
            if !registry.contains(&candidate) {
                return candidate;
            }
            warn!(subdomain = %candidate, "subdomain collision, retrying");
        }
    }
}

impl Default for SubdomainAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pending::PendingRequests;
    use std::collections::HashSet;

    #[test]
    fn generates_expected_shape() {
        let allocator = SubdomainAllocator::new();
        let sub = allocator.generate();
        assert_eq!(sub.len(), SUBDOMAIN_LEN);
        assert!(sub
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn consecutive_allocations_are_distinct() {
        let allocator = SubdomainAllocator::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(allocator.generate()));
        }
    }

    #[tokio::test]
    async fn allocate_skips_live_subdomains() {
        let registry = TunnelRegistry::new(PendingRequests::new());
        let allocator = SubdomainAllocator::new();
        let sub = allocator.allocate(&registry);
        assert!(!registry.contains(&sub));
    }
}
