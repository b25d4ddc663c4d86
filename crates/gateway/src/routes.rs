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

//! Method-aware route authorization
//!
//! Rule sets are compiled once at load time into per-method regex buckets
//! and stay immutable for the process lifetime; malformed patterns abort
//! startup rather than surface at request time. Allow-lists fail closed
//! (no bucket for the method means denied), deny-lists fail open.

use axum::http::Method;
use eyre::{Context, Result};
use regex::Regex;
use std::collections::HashMap;
use tracing::info;

/// Methods a rule may be scoped to with a pattern prefix
const ALL_METHODS: &[Method] = &[
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::DELETE,
    Method::PATCH,
    Method::HEAD,
    Method::OPTIONS,
];

/// Compiled route patterns grouped by HTTP method
///
/// A pattern may be prefixed with a method name (`GET/chains/.*`); patterns
/// without a prefix apply to every method. Bucket order is insertion order
/// from configuration, and matching stops at the first hit.
pub struct RouteTable {
    buckets: HashMap<Method, Vec<Regex>>,
}

impl RouteTable {
    /// Compiles a pattern list into method buckets
    ///
    /// # Errors
    /// Fails on the first malformed regex; route tables are built at load
    /// time, so this is a startup error, never a per-request one.
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let mut buckets: HashMap<Method, Vec<Regex>> = HashMap::new();

        for pattern in patterns {
            match split_method_prefix(pattern) {
                Some((method, rest)) => {
                    let regex = Regex::new(rest)
                        .wrap_err_with(|| format!("unable to compile route pattern {pattern:?}"))?;
                    buckets.entry(method).or_default().push(regex);
                }
                None => {
                    let regex = Regex::new(pattern)
                        .wrap_err_with(|| format!("unable to compile route pattern {pattern:?}"))?;
                    for method in ALL_METHODS {
                        buckets.entry(method.clone()).or_default().push(regex.clone());
                    }
                }
            }
        }

        Ok(Self { buckets })
    }

    /// First-match lookup in the bucket for `method`
    ///
    /// Returns `None` when no bucket exists for the method at all, which
    /// callers interpret per their mode (fail-closed allow, fail-open deny).
    pub fn matches(&self, method: &Method, path: &str) -> Option<bool> {
        let bucket = self.buckets.get(method)?;
        Some(bucket.iter().any(|regex| regex.is_match(path)))
    }
}

/// Splits a leading method name off a route pattern, if present
fn split_method_prefix(pattern: &str) -> Option<(Method, &str)> {
    let upper = pattern.to_uppercase();
    ALL_METHODS
        .iter()
        .find(|m| upper.starts_with(m.as_str()))
        .map(|m| (m.clone(), &pattern[m.as_str().len()..]))
}

/// Allow/deny route authorization, evaluated before any other policy
///
/// Both lists may be active at once; deny is evaluated after allow.
pub struct RouteMatcher {
    allow: Option<RouteTable>,
    deny: Option<RouteTable>,
}

impl RouteMatcher {
    /// Creates a matcher from optional allow and deny tables
    ///
    /// `None` for a table disables that mode entirely.
    pub fn new(allow: Option<RouteTable>, deny: Option<RouteTable>) -> Self {
        if let Some(allow) = &allow {
            info!("Allow-list active for {} methods", allow.buckets.len());
        }
        if let Some(deny) = &deny {
            info!("Deny-list active for {} methods", deny.buckets.len());
        }
        Self { allow, deny }
    }

    /// Allow-list verdict; fail-closed, with an unconditional OPTIONS bypass
    ///
    /// OPTIONS passes regardless of rule buckets so CORS preflight keeps
    /// working against restricted deployments.
    pub fn is_allowed(&self, method: &Method, path: &str) -> bool {
        let Some(allow) = &self.allow else { return true };
        if *method == Method::OPTIONS {
            return true;
        }
        allow.matches(method, path).unwrap_or(false)
    }

    /// Deny-list verdict; fail-open when no rule covers the method
    pub fn is_denied(&self, method: &Method, path: &str) -> bool {
        let Some(deny) = &self.deny else { return false };
        deny.matches(method, path).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(patterns: &[&str]) -> RouteTable {
        let patterns: Vec<String> = patterns.iter().map(|s| s.to_string()).collect();
        RouteTable::compile(&patterns).unwrap()
    }

    #[test]
    fn test_malformed_pattern_is_fatal_at_load() {
        tzgate_common::logging::ensure_test_logging(None);

        let patterns = vec!["/chains/(".to_string()];
        assert!(RouteTable::compile(&patterns).is_err());
    }

    #[test]
    fn test_unprefixed_pattern_applies_to_all_methods() {
        tzgate_common::logging::ensure_test_logging(None);

        let table = table(&["/network.*"]);
        assert_eq!(table.matches(&Method::GET, "/network/peers"), Some(true));
        assert_eq!(table.matches(&Method::POST, "/network/peers"), Some(true));
        assert_eq!(table.matches(&Method::DELETE, "/network/peers"), Some(true));
        assert_eq!(table.matches(&Method::GET, "/chains/main"), Some(false));
    }

    #[test]
    fn test_method_prefix_scopes_the_rule() {
        tzgate_common::logging::ensure_test_logging(None);

        let table = table(&["GET/chains/.*"]);
        assert_eq!(table.matches(&Method::GET, "/chains/main/blocks"), Some(true));
        // No bucket at all for POST
        assert_eq!(table.matches(&Method::POST, "/chains/main/blocks"), None);
    }

    #[test]
    fn test_allow_list_fails_closed_without_bucket() {
        tzgate_common::logging::ensure_test_logging(None);

        let matcher = RouteMatcher::new(Some(table(&["GET/chains/.*"])), None);

        assert!(matcher.is_allowed(&Method::GET, "/chains/main/blocks/head"));
        assert!(!matcher.is_allowed(&Method::GET, "/injection/operation"));
        // Rules exist only for GET, so any POST is denied
        assert!(!matcher.is_allowed(&Method::POST, "/chains/main/blocks/head"));
        assert!(!matcher.is_allowed(&Method::POST, "/anything"));
    }

    #[test]
    fn test_options_bypasses_allow_list() {
        tzgate_common::logging::ensure_test_logging(None);

        let matcher = RouteMatcher::new(Some(table(&["GET/chains/.*"])), None);
        assert!(matcher.is_allowed(&Method::OPTIONS, "/injection/operation"));
        assert!(matcher.is_allowed(&Method::OPTIONS, "/anything/at/all"));
    }

    #[test]
    fn test_deny_list_fails_open() {
        tzgate_common::logging::ensure_test_logging(None);

        let matcher = RouteMatcher::new(None, Some(table(&["POST/injection/.*"])));

        assert!(matcher.is_denied(&Method::POST, "/injection/block"));
        // No deny bucket for GET means not denied
        assert!(!matcher.is_denied(&Method::GET, "/injection/block"));
        assert!(!matcher.is_denied(&Method::POST, "/chains/main/blocks"));
    }

    #[test]
    fn test_no_tables_means_everything_passes() {
        tzgate_common::logging::ensure_test_logging(None);

        let matcher = RouteMatcher::new(None, None);
        assert!(matcher.is_allowed(&Method::POST, "/injection/block"));
        assert!(!matcher.is_denied(&Method::POST, "/injection/block"));
    }

    #[test]
    fn test_default_deny_set_blocks_operator_routes() {
        tzgate_common::logging::ensure_test_logging(None);

        // The shipped deny defaults
        let matcher = RouteMatcher::new(None, Some(table(crate::proxy::DEFAULT_DENY_ROUTES)));

        assert!(matcher.is_denied(&Method::GET, "/network/points"));
        assert!(matcher.is_denied(&Method::GET, "/stats/gc"));
        assert!(matcher.is_denied(&Method::POST, "/injection/block"));
        assert!(matcher
            .is_denied(&Method::GET, "/chains/main/blocks/head/helpers/baking_rights"));
        // Full-context dumps are too expensive to expose by default
        assert!(matcher.is_denied(&Method::GET, "/chains/main/blocks/head/context/contracts"));
        assert!(matcher.is_denied(&Method::GET, "/chains/main/blocks/head/context/contracts/"));
        assert!(matcher.is_denied(&Method::GET, "/chains/main/blocks/head/context/raw/bytes"));
        assert!(!matcher.is_denied(&Method::GET, "/chains/main/blocks/head"));
        assert!(!matcher
            .is_denied(&Method::GET, "/chains/main/blocks/head/context/contracts/KT1abc"));
        assert!(!matcher.is_denied(&Method::POST, "/injection/operation"));
    }
}
