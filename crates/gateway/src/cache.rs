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

//! Response caching with content-negotiated keys
//!
//! Cache keys are derived from method, path, the canonicalized (sorted)
//! query string and the negotiated response representation, so a JSON
//! consumer and a binary consumer of the same route never share an entry,
//! and neither do clients that differ on compressed transfer. Entries
//! expire after a fixed TTL and are never invalidated proactively;
//! staleness up to one TTL window is the accepted price for keeping load
//! off the node.

use crate::store::SharedStore;
use axum::http::{header, HeaderMap, Method};
use eyre::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Representation tag for JSON responses
const REPR_JSON: &str = "json";
/// Representation tag for binary (bson / octet-stream) responses
const REPR_BINARY: &str = "bin";

/// Cacheability policy: which requests may be served from the cache
///
/// Live and streaming routes (mempool, head monitoring) must never be
/// served stale and are excluded by pattern.
pub struct CachePolicy {
    enabled: bool,
    ttl: Duration,
    disabled_routes: Vec<Regex>,
}

impl CachePolicy {
    /// Compiles a policy from disabled-route patterns
    ///
    /// # Errors
    /// Fails on a malformed pattern; this runs at load time only.
    pub fn new(enabled: bool, ttl: Duration, disabled_routes: &[String]) -> Result<Self> {
        let disabled_routes = disabled_routes
            .iter()
            .map(|p| {
                Regex::new(p).wrap_err_with(|| format!("unable to compile cache pattern {p:?}"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { enabled, ttl, disabled_routes })
    }

    /// Entry lifetime
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether a request's response is eligible for storage and reuse
    ///
    /// Only GET requests are cacheable, and only on routes not excluded by
    /// the disabled-route patterns.
    pub fn is_cacheable(&self, method: &Method, path: &str) -> bool {
        if !self.enabled || *method != Method::GET {
            return false;
        }
        !self.disabled_routes.iter().any(|regex| regex.is_match(path))
    }
}

/// Derives the canonical cache key for a request
///
/// The key concatenates method, path, sorted query string, the negotiated
/// representation and a compression bit. Two requests differing only in
/// query-parameter order map to the same key; two requests differing in
/// accepted representation never do.
pub fn derive_key(method: &Method, path: &str, query: Option<&str>, headers: &HeaderMap) -> String {
    let query = canonicalize_query(query.unwrap_or(""));

    let accept = header_str(headers, header::ACCEPT);
    let repr = if accepts_binary(accept) { REPR_BINARY } else { REPR_JSON };

    let encoding = header_str(headers, header::ACCEPT_ENCODING);
    let transfer = if encoding.contains("gzip") { "gz" } else { "id" };

    format!("rc:{method}|{path}|{query}|{repr}|{transfer}")
}

fn header_str<'h>(headers: &'h HeaderMap, name: header::HeaderName) -> &'h str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("")
}

/// Sorts query parameters so parameter order cannot split the cache
fn canonicalize_query(query: &str) -> String {
    if query.is_empty() {
        return String::new();
    }
    let mut params: Vec<&str> = query.split('&').collect();
    params.sort_unstable();
    params.join("&")
}

/// Whether the client negotiates a binary response representation
///
/// True when `application/bson` or `application/octet-stream` is accepted
/// with a quality strictly above both `*/*` and `application/json`, or when
/// neither of those is present at all.
fn accepts_binary(accept: &str) -> bool {
    media_is_preferred(accept, "application/bson")
        || media_is_preferred(accept, "application/octet-stream")
}

fn media_is_preferred(accept: &str, media: &str) -> bool {
    if !accept.contains(media) {
        return false;
    }

    let q_values = parse_q_values(accept);
    let Some(&media_q) = q_values.get(media) else { return false };

    let all_q = q_values.get("*/*");
    let json_q = q_values.get("application/json");
    if all_q.is_none() && json_q.is_none() {
        return true;
    }

    media_q > *all_q.unwrap_or(&0.0) && media_q > *json_q.unwrap_or(&0.0)
}

/// Parses an Accept header into media-type → quality, defaulting q to 1.0
fn parse_q_values(accept: &str) -> std::collections::HashMap<String, f32> {
    let mut q_values = std::collections::HashMap::new();

    for media_range in accept.split(',') {
        let mut parts = media_range.trim().split(';');
        let Some(media_type) = parts.next() else { continue };

        let mut q = 1.0f32;
        for param in parts {
            if let Some(value) = param.trim().strip_prefix("q=") {
                q = value.trim().parse().unwrap_or(1.0);
            }
        }

        q_values.insert(media_type.trim().to_string(), q);
    }

    q_values
}

/// A cached upstream response
///
/// Created on a cache miss whose response passes the cacheability checks;
/// replaced atomically at the store level, never mutated in place.
#[derive(Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    /// HTTP status code of the cached response
    pub status: u16,
    /// Response headers, in arrival order
    pub headers: Vec<(String, Vec<u8>)>,
    /// Response body bytes
    pub body: Vec<u8>,
}

/// Response cache over the shared store
///
/// Store failures degrade to the cold path: a failed read is a miss, a
/// failed write is logged and dropped.
pub struct ResponseCache {
    store: Arc<dyn SharedStore>,
    policy: CachePolicy,
}

impl ResponseCache {
    /// Creates a cache over `store` governed by `policy`
    pub fn new(store: Arc<dyn SharedStore>, policy: CachePolicy) -> Self {
        Self { store, policy }
    }

    /// The governing cacheability policy
    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Looks up a fresh entry for `key`
    pub async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let raw = match self.store.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("Cache miss: {key}");
                return None;
            }
            Err(e) => {
                debug!("Cache read failed, treating as miss: {e}");
                return None;
            }
        };

        match serde_json::from_slice(&raw) {
            Ok(entry) => {
                debug!("Cache hit: {key}");
                Some(entry)
            }
            Err(e) => {
                warn!("Discarding undecodable cache entry for {key}: {e}");
                None
            }
        }
    }

    /// Stores a completed response under `key` with the policy TTL
    ///
    /// Only successful (2xx) responses are kept; the caller has already
    /// established that the request itself was cacheable.
    pub async fn store_response(&self, key: &str, response: &CachedResponse) {
        if !(200..300).contains(&response.status) {
            debug!("Not caching non-success status {} for {key}", response.status);
            return;
        }

        let raw = match serde_json::to_vec(response) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to encode cache entry for {key}: {e}");
                return;
            }
        };

        if let Err(e) = self.store.set(key, &raw, self.policy.ttl).await {
            debug!("Cache write failed for {key}: {e}");
        } else {
            debug!("Cached entry: {key}");
        }
    }
}
