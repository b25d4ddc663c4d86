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

//! Shared key/value store with TTL expiry
//!
//! The affinity table, the response cache and the rate-limit windows all go
//! through this interface, so a deployment can swap the in-process store for
//! a remote shared one without touching the policy code. Store failures are
//! degraded, not fatal: callers treat a failed read as a miss.

use async_trait::async_trait;
use eyre::Result;
use std::{
    collections::HashMap,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};
use tokio::sync::RwLock;
use tracing::debug;

/// Number of writes between expired-entry sweeps of the in-process store
const SWEEP_EVERY: usize = 1024;

/// Key/value store with per-entry TTL
///
/// Implementations must be safe to share across request tasks. Keys are
/// namespaced by the callers (`lb:` affinity, `rc:` response cache, `rl:`
/// rate-limit windows) so a single store instance can back all three.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Look up a live entry, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Insert or replace an entry, expiring after `ttl`
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()>;

    /// Atomically increment a counter, creating it with `ttl` when absent
    ///
    /// Returns the incremented count and the unix timestamp at which the
    /// counter expires. The TTL of an existing counter is left untouched,
    /// which is what makes a fixed rate-limit window out of this.
    async fn incr(&self, key: &str, ttl: Duration) -> Result<(u64, u64)>;
}

struct StoredValue {
    data: Vec<u8>,
    expires_at: Instant,
    expires_unix: u64,
}

/// In-process [`SharedStore`] backed by a `HashMap`
///
/// Entries expire lazily on read; a full sweep runs every [`SWEEP_EVERY`]
/// writes to keep dead entries from accumulating between reads.
pub struct MemoryStore {
    entries: RwLock<HashMap<String, StoredValue>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty in-process store
    pub fn new() -> Self {
        Self { entries: RwLock::new(HashMap::new()), writes: AtomicUsize::new(0) }
    }

    /// Number of live (unexpired) entries, for diagnostics and tests
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|v| v.expires_at > now).count()
    }

    /// Whether the store holds no live entries
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn stored(value: &[u8], ttl: Duration) -> StoredValue {
        let expires_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .saturating_add(ttl)
            .as_secs();
        StoredValue { data: value.to_vec(), expires_at: Instant::now() + ttl, expires_unix }
    }

    async fn maybe_sweep(&self) {
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY != SWEEP_EVERY - 1 {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, v| v.expires_at > now);
        debug!("Swept {} expired store entries", before - entries.len());
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(value) if value.expires_at > Instant::now() => Ok(Some(value.data.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        {
            let mut entries = self.entries.write().await;
            entries.insert(key.to_string(), Self::stored(value, ttl));
        }
        self.maybe_sweep().await;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<(u64, u64)> {
        let mut entries = self.entries.write().await;
        let now = Instant::now();

        if let Some(value) = entries.get_mut(key) {
            if value.expires_at > now {
                let count = u64::from_le_bytes(
                    value.data.as_slice().try_into().unwrap_or([0u8; 8]),
                ) + 1;
                value.data = count.to_le_bytes().to_vec();
                return Ok((count, value.expires_unix));
            }
        }

        let fresh = Self::stored(&1u64.to_le_bytes(), ttl);
        let expires_unix = fresh.expires_unix;
        entries.insert(key.to_string(), fresh);
        Ok((1, expires_unix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;
    use tracing::info;

    #[tokio::test]
    async fn test_get_set_roundtrip() {
        tzgate_common::logging::ensure_test_logging(None);
        info!("Testing store get/set");

        let store = MemoryStore::new();

        assert!(store.get("missing").await.unwrap().is_none());

        store.set("k", b"value", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"value");

        // Replacement is atomic at the entry level
        store.set("k", b"other", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().unwrap(), b"other");
    }

    #[tokio::test]
    async fn test_entries_expire() {
        tzgate_common::logging::ensure_test_logging(None);

        let store = MemoryStore::new();
        store.set("short", b"v", Duration::from_millis(50)).await.unwrap();
        assert!(store.get("short").await.unwrap().is_some());

        sleep(Duration::from_millis(80)).await;
        assert!(store.get("short").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incr_counts_within_window() {
        tzgate_common::logging::ensure_test_logging(None);

        let store = MemoryStore::new();
        let (c1, reset1) = store.incr("rl:1.2.3.4", Duration::from_secs(60)).await.unwrap();
        let (c2, reset2) = store.incr("rl:1.2.3.4", Duration::from_secs(60)).await.unwrap();

        assert_eq!(c1, 1);
        assert_eq!(c2, 2);
        // Same window, same reset timestamp
        assert_eq!(reset1, reset2);
    }

    #[tokio::test]
    async fn test_incr_restarts_after_expiry() {
        tzgate_common::logging::ensure_test_logging(None);

        let store = MemoryStore::new();
        let (c1, _) = store.incr("rl:ip", Duration::from_millis(40)).await.unwrap();
        assert_eq!(c1, 1);

        sleep(Duration::from_millis(70)).await;
        let (c2, _) = store.incr("rl:ip", Duration::from_millis(40)).await.unwrap();
        assert_eq!(c2, 1);
    }
}
