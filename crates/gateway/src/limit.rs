// TzGate - Policy-enforcing reverse proxy for Tezos node RPC
// Copyright (C) 2026 TzGate contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Per-client fixed-window rate limiting
//!
//! Counters live in the shared store under the `rl:` namespace, so limits
//! hold across gateway replicas when a remote store is configured. The
//! window is fixed, not sliding: the first request from a client opens the
//! window and every later request counts against it until it expires.

use crate::store::SharedStore;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Outcome of one rate-limit check, mirrored into `X-RateLimit-*` headers
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDecision {
    /// Configured ceiling for the window
    pub limit: u64,
    /// Requests left before the ceiling, zero when reached
    pub remaining: u64,
    /// Unix timestamp at which the window resets
    pub reset: u64,
    /// Whether this request exceeded the ceiling
    pub reached: bool,
}

/// Fixed-window rate gate keyed by client identity
pub struct RateGate {
    store: Arc<dyn SharedStore>,
    max: u64,
    window: Duration,
}

impl RateGate {
    /// Creates a gate allowing `max` requests per `window`
    pub fn new(store: Arc<dyn SharedStore>, max: u64, window: Duration) -> Self {
        Self { store, max, window }
    }

    /// Counts this request against `client_key`'s window
    ///
    /// A store failure lets the request through with a full-window decision;
    /// the gate protects upstreams, it must not take the gateway down with
    /// the store.
    pub async fn check(&self, client_key: &str) -> RateLimitDecision {
        let key = format!("rl:{client_key}");
        match self.store.incr(&key, self.window).await {
            Ok((count, reset)) => {
                let reached = count > self.max;
                if reached {
                    warn!("Rate limit reached for {client_key} ({count}/{})", self.max);
                }
                RateLimitDecision {
                    limit: self.max,
                    remaining: self.max.saturating_sub(count),
                    reset,
                    reached,
                }
            }
            Err(e) => {
                debug!("Rate-limit store failure for {client_key}: {e}");
                RateLimitDecision { limit: self.max, remaining: self.max, reset: 0, reached: false }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use eyre::Result;
    use tokio::time::sleep;
    use tracing::info;

    #[tokio::test]
    async fn test_requests_below_ceiling_pass() {
        tzgate_common::logging::ensure_test_logging(None);

        let gate = RateGate::new(Arc::new(MemoryStore::new()), 3, Duration::from_secs(60));

        for expected_remaining in [2, 1, 0] {
            let decision = gate.check("10.0.0.1").await;
            assert!(!decision.reached);
            assert_eq!(decision.remaining, expected_remaining);
            assert_eq!(decision.limit, 3);
        }
    }

    #[tokio::test]
    async fn test_ceiling_is_enforced() {
        tzgate_common::logging::ensure_test_logging(None);
        info!("Testing rate ceiling");

        let gate = RateGate::new(Arc::new(MemoryStore::new()), 2, Duration::from_secs(60));

        assert!(!gate.check("10.0.0.2").await.reached);
        assert!(!gate.check("10.0.0.2").await.reached);

        let over = gate.check("10.0.0.2").await;
        assert!(over.reached);
        assert_eq!(over.remaining, 0);
    }

    #[tokio::test]
    async fn test_clients_are_counted_independently() {
        tzgate_common::logging::ensure_test_logging(None);

        let gate = RateGate::new(Arc::new(MemoryStore::new()), 1, Duration::from_secs(60));

        assert!(!gate.check("10.0.0.3").await.reached);
        assert!(gate.check("10.0.0.3").await.reached);
        // A different client still has a fresh window
        assert!(!gate.check("10.0.0.4").await.reached);
    }

    #[tokio::test]
    async fn test_window_resets_after_expiry() {
        tzgate_common::logging::ensure_test_logging(None);

        let gate = RateGate::new(Arc::new(MemoryStore::new()), 1, Duration::from_millis(40));

        assert!(!gate.check("10.0.0.5").await.reached);
        assert!(gate.check("10.0.0.5").await.reached);

        sleep(Duration::from_millis(70)).await;
        assert!(!gate.check("10.0.0.5").await.reached);
    }

    #[tokio::test]
    async fn test_store_failure_fails_open() {
        tzgate_common::logging::ensure_test_logging(None);

        struct BrokenStore;

        #[async_trait::async_trait]
        impl SharedStore for BrokenStore {
            async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
                eyre::bail!("store down")
            }
            async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<()> {
                eyre::bail!("store down")
            }
            async fn incr(&self, _key: &str, _ttl: Duration) -> Result<(u64, u64)> {
                eyre::bail!("store down")
            }
        }

        let gate = RateGate::new(Arc::new(BrokenStore), 1, Duration::from_secs(60));
        assert!(!gate.check("10.0.0.6").await.reached);
        assert!(!gate.check("10.0.0.6").await.reached);
    }
}
