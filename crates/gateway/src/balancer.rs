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

//! Sticky, failover-aware upstream selection
//!
//! Sessions are pinned to a target through the shared affinity store so a
//! client keeps talking to the same node (nodes advance independently, and
//! bouncing between sync heights confuses RPC consumers). New sessions are
//! spread randomly rather than round-robin to avoid correlating assignment
//! with request bursts. A separately provisioned retry target, outside the
//! regular set, receives replays so they land away from the node that
//! produced the original failure.

use crate::store::SharedStore;
use eyre::Result;
use rand::Rng;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, info};

/// An upstream origin the gateway may forward requests to
///
/// Immutable once constructed; the balancer's target list is the only
/// mutable collection referencing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Unique name within the target set
    pub name: String,
    /// Base URL of the origin, without a trailing slash
    pub base_url: String,
}

impl Target {
    /// Creates a target, normalizing away a trailing slash on the base URL
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { name: name.into(), base_url }
    }
}

/// Sticky load balancer over an ordered set of targets
///
/// `select` consults the affinity store for a pinned index and falls back to
/// a uniformly random assignment persisted with the configured TTL. The
/// target-set mutex covers only the in-memory list; store I/O happens after
/// the lock is released.
pub struct StickyBalancer {
    targets: Mutex<Vec<Target>>,
    retry_target: Option<Target>,
    store: Arc<dyn SharedStore>,
    affinity_ttl: Duration,
}

impl StickyBalancer {
    /// Creates a balancer over `targets` with an optional retry-only target
    ///
    /// # Errors
    /// Fails when two targets share a name; duplicate names would make
    /// `remove_target` ambiguous.
    pub fn new(
        targets: Vec<Target>,
        retry_target: Option<Target>,
        store: Arc<dyn SharedStore>,
        affinity_ttl: Duration,
    ) -> Result<Self> {
        for (i, target) in targets.iter().enumerate() {
            if targets[..i].iter().any(|t| t.name == target.name) {
                eyre::bail!("duplicate target name: {}", target.name);
            }
        }
        info!("Balancer initialized with {} targets", targets.len());
        Ok(Self { targets: Mutex::new(targets), retry_target, store, affinity_ttl })
    }

    /// Whether a dedicated retry target is provisioned
    pub fn has_retry_target(&self) -> bool {
        self.retry_target.is_some()
    }

    /// Number of targets currently in the set
    pub fn target_count(&self) -> usize {
        self.targets.lock().expect("target set lock poisoned").len()
    }

    /// Adds a target; returns false without changes when the name is taken
    pub fn add_target(&self, target: Target) -> bool {
        let mut targets = self.targets.lock().expect("target set lock poisoned");
        if targets.iter().any(|t| t.name == target.name) {
            return false;
        }
        debug!("Added target {} ({})", target.name, target.base_url);
        targets.push(target);
        true
    }

    /// Removes a target by name; returns false when no such target exists
    pub fn remove_target(&self, name: &str) -> bool {
        let mut targets = self.targets.lock().expect("target set lock poisoned");
        match targets.iter().position(|t| t.name == name) {
            Some(i) => {
                targets.remove(i);
                debug!("Removed target {name}");
                true
            }
            None => false,
        }
    }

    /// Selects the target for one dispatch attempt
    ///
    /// Returns `None` only when the target set is empty; the caller surfaces
    /// that as a gateway error. With a single target the affinity lookup is
    /// skipped. A replay (`is_retry`) goes to the retry target when one is
    /// provisioned, bypassing affinity.
    pub async fn select(&self, client_key: &str, is_retry: bool) -> Option<Target> {
        let snapshot: Vec<Target> = {
            let targets = self.targets.lock().expect("target set lock poisoned");
            if targets.is_empty() {
                return None;
            }
            if targets.len() == 1 {
                return Some(targets[0].clone());
            }
            if is_retry {
                if let Some(retry) = &self.retry_target {
                    return Some(retry.clone());
                }
            }
            targets.clone()
        };

        let key = format!("lb:{client_key}");
        match self.store.get(&key).await {
            Ok(Some(raw)) => {
                // A stored index may be stale after a target removal; out of
                // range counts as a miss.
                if let Some(index) = parse_index(&raw) {
                    if index < snapshot.len() {
                        debug!("Affinity hit for {client_key}: target {index}");
                        return Some(snapshot[index].clone());
                    }
                    debug!("Stale affinity index {index} for {client_key}, reassigning");
                }
            }
            Ok(None) => {}
            Err(e) => {
                // Affinity is a hint; a failing store degrades to random
                // assignment instead of failing the request.
                debug!("Affinity read failed for {client_key}: {e}");
            }
        }

        let index = rand::rng().random_range(0..snapshot.len());
        if let Err(e) =
            self.store.set(&key, index.to_string().as_bytes(), self.affinity_ttl).await
        {
            debug!("Affinity write failed for {client_key}: {e}");
        }
        debug!("Assigned {client_key} to target {index}");
        Some(snapshot[index].clone())
    }
}

fn parse_index(raw: &[u8]) -> Option<usize> {
    std::str::from_utf8(raw).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use tracing::info;

    fn make_balancer(names: &[&str], retry: Option<&str>) -> StickyBalancer {
        let targets = names
            .iter()
            .map(|n| Target::new(*n, format!("http://{n}.example:8732")))
            .collect();
        let retry_target = retry.map(|n| Target::new(n, format!("http://{n}.example:8732")));
        StickyBalancer::new(
            targets,
            retry_target,
            Arc::new(MemoryStore::new()),
            Duration::from_secs(600),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_empty_set_yields_none() {
        tzgate_common::logging::ensure_test_logging(None);

        let balancer = make_balancer(&[], None);
        assert!(balancer.select("10.0.0.1", false).await.is_none());
    }

    #[tokio::test]
    async fn test_single_target_shortcut() {
        tzgate_common::logging::ensure_test_logging(None);

        let balancer = make_balancer(&["only"], None);
        for _ in 0..5 {
            assert_eq!(balancer.select("10.0.0.1", false).await.unwrap().name, "only");
        }
    }

    #[tokio::test]
    async fn test_affinity_stickiness() {
        tzgate_common::logging::ensure_test_logging(None);
        info!("Testing that repeated selects pin to one target");

        let balancer = make_balancer(&["a", "b", "c", "d"], None);

        let first = balancer.select("203.0.113.7", false).await.unwrap();
        for _ in 0..20 {
            let again = balancer.select("203.0.113.7", false).await.unwrap();
            assert_eq!(again.name, first.name);
        }
    }

    #[tokio::test]
    async fn test_distinct_clients_get_independent_assignments() {
        tzgate_common::logging::ensure_test_logging(None);

        let balancer = make_balancer(&["a", "b", "c", "d", "e", "f", "g", "h"], None);

        // With 8 targets and 50 clients, seeing a single target for all of
        // them would mean assignment is not random at all.
        let mut seen = std::collections::HashSet::new();
        for i in 0..50 {
            let target = balancer.select(&format!("10.1.0.{i}"), false).await.unwrap();
            seen.insert(target.name);
        }
        assert!(seen.len() > 1);
    }

    #[tokio::test]
    async fn test_retry_goes_to_retry_target() {
        tzgate_common::logging::ensure_test_logging(None);

        let balancer = make_balancer(&["a", "b"], Some("spare"));

        // Pin the client first
        let pinned = balancer.select("198.51.100.2", false).await.unwrap();
        assert_ne!(pinned.name, "spare");

        // A retry attempt bypasses affinity entirely
        let replayed = balancer.select("198.51.100.2", true).await.unwrap();
        assert_eq!(replayed.name, "spare");

        // And the pin is untouched afterwards
        let again = balancer.select("198.51.100.2", false).await.unwrap();
        assert_eq!(again.name, pinned.name);
    }

    #[tokio::test]
    async fn test_removed_target_is_never_returned() {
        tzgate_common::logging::ensure_test_logging(None);
        info!("Testing stale-index fallback after target removal");

        let store = Arc::new(MemoryStore::new());
        let balancer = StickyBalancer::new(
            vec![Target::new("a", "http://a:1"), Target::new("b", "http://b:1")],
            None,
            store.clone(),
            Duration::from_secs(600),
        )
        .unwrap();

        // Force the pin onto index 1 ("b")
        store.set("lb:192.0.2.9", b"1", Duration::from_secs(600)).await.unwrap();
        assert_eq!(balancer.select("192.0.2.9", false).await.unwrap().name, "b");

        assert!(balancer.remove_target("b"));

        // The stored index is now out of range or shifted; either way the
        // removed target must not come back.
        for _ in 0..10 {
            assert_ne!(balancer.select("192.0.2.9", false).await.unwrap().name, "b");
        }
    }

    #[tokio::test]
    async fn test_add_rejects_duplicate_names() {
        tzgate_common::logging::ensure_test_logging(None);

        let balancer = make_balancer(&["a"], None);
        assert!(balancer.add_target(Target::new("b", "http://b:1")));
        assert!(!balancer.add_target(Target::new("b", "http://elsewhere:1")));
        assert_eq!(balancer.target_count(), 2);

        assert!(!balancer.remove_target("missing"));
        assert!(balancer.remove_target("b"));
        assert_eq!(balancer.target_count(), 1);
    }

    #[tokio::test]
    async fn test_constructor_rejects_duplicates() {
        tzgate_common::logging::ensure_test_logging(None);

        let result = StickyBalancer::new(
            vec![Target::new("a", "http://a:1"), Target::new("a", "http://b:1")],
            None,
            Arc::new(MemoryStore::new()),
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_store_failure_degrades_to_random() {
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

        let balancer = StickyBalancer::new(
            vec![Target::new("a", "http://a:1"), Target::new("b", "http://b:1")],
            None,
            Arc::new(BrokenStore),
            Duration::from_secs(600),
        )
        .unwrap();

        // Selection still succeeds on the cold path
        assert!(balancer.select("10.9.8.7", false).await.is_some());
    }
}
