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

//! Gateway server and request pipeline
//!
//! Every request runs the same policy pipeline in order: route
//! authorization, rate limiting, cache lookup, then dispatch through the
//! retry coordinator (or straight pass-through for streaming routes).
//! Policies short-circuit: a denied request never counts against the rate
//! limit, a rate-limited request never reaches the cache.

use crate::{
    balancer::{StickyBalancer, Target},
    cache::{self, CachePolicy, CachedResponse, ResponseCache},
    limit::{RateGate, RateLimitDecision},
    retry::{extract_embedded_status, BufferedResponse, RetryCoordinator},
    routes::{RouteMatcher, RouteTable},
    store::{MemoryStore, SharedStore},
};
use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use bytes::Bytes;
use eyre::Result;
use std::{collections::HashSet, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

/// Routes denied out of the box: node operator and baker surfaces
pub const DEFAULT_DENY_ROUTES: &[&str] = &[
    "/injection/block",
    "/injection/protocol",
    "/network.*",
    "/workers.*",
    "/worker.*",
    "/stats.*",
    "/config",
    "/chains/.*/blocks/.*/helpers/baking_rights",
    "/chains/.*/blocks/.*/helpers/endorsing_rights",
    "/helpers/baking_rights",
    "/helpers/endorsing_rights",
    "/chains/.*/blocks/.*/context/contracts(/?)$",
    "/chains/.*/blocks/.*/context/raw/bytes",
];

/// Routes never cached: live and head-tracking surfaces
pub const DEFAULT_CACHE_DISABLED_ROUTES: &[&str] =
    &["/monitor/.*", "/chains/.*/mempool", "/chains/.*/blocks.*head"];

/// Largest request body the gateway will buffer for replay
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Builder for a [`Gateway`]
///
/// ```no_run
/// # use tzgate::GatewayBuilder;
/// # async fn run() -> eyre::Result<()> {
/// let gateway = GatewayBuilder::new()
///     .upstream("http://node-1:8732")
///     .upstream("http://node-2:8732")
///     .retry_upstream("http://archive:8732")
///     .rate_limit(300, std::time::Duration::from_secs(60))
///     .build()?;
/// gateway.serve("0.0.0.0:8080".parse()?).await
/// # }
/// ```
pub struct GatewayBuilder {
    upstreams: Vec<Target>,
    retry_upstream: Option<Target>,
    blocked_ips: Vec<String>,
    allow_routes: Option<Vec<String>>,
    deny_routes: Option<Vec<String>>,
    cache_enabled: bool,
    cache_ttl: Duration,
    cache_disabled_routes: Vec<String>,
    affinity_ttl: Duration,
    rate_limit: Option<(u64, Duration)>,
    cors_enabled: bool,
    gzip_enabled: bool,
    upstream_timeout: Duration,
    store: Option<Arc<dyn SharedStore>>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    /// Creates a builder with the shipped policy defaults
    pub fn new() -> Self {
        Self {
            upstreams: Vec::new(),
            retry_upstream: None,
            blocked_ips: Vec::new(),
            allow_routes: None,
            deny_routes: Some(DEFAULT_DENY_ROUTES.iter().map(|s| s.to_string()).collect()),
            cache_enabled: true,
            cache_ttl: Duration::from_secs(5),
            cache_disabled_routes: DEFAULT_CACHE_DISABLED_ROUTES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            affinity_ttl: Duration::from_secs(600),
            rate_limit: None,
            cors_enabled: true,
            gzip_enabled: true,
            upstream_timeout: Duration::from_secs(30),
            store: None,
        }
    }

    /// Adds an upstream node, auto-named by position
    pub fn upstream(mut self, base_url: impl Into<String>) -> Self {
        let name = format!("node-{}", self.upstreams.len());
        self.upstreams.push(Target::new(name, base_url));
        self
    }

    /// Adds an upstream node with an explicit name
    pub fn named_upstream(mut self, name: impl Into<String>, base_url: impl Into<String>) -> Self {
        self.upstreams.push(Target::new(name, base_url));
        self
    }

    /// Designates the node replays are routed to
    pub fn retry_upstream(mut self, base_url: impl Into<String>) -> Self {
        self.retry_upstream = Some(Target::new("retry", base_url));
        self
    }

    /// Rejects all traffic from the given client IPs
    ///
    /// Matched against the resolved client identity (the first
    /// `X-Forwarded-For` hop or the peer address) before any other policy.
    pub fn block_ips(mut self, ips: Vec<String>) -> Self {
        self.blocked_ips = ips;
        self
    }

    /// Restricts traffic to the given route patterns (fail-closed)
    pub fn allow_routes(mut self, patterns: Vec<String>) -> Self {
        self.allow_routes = Some(patterns);
        self
    }

    /// Replaces the default deny patterns
    pub fn deny_routes(mut self, patterns: Vec<String>) -> Self {
        self.deny_routes = Some(patterns);
        self
    }

    /// Removes the deny-list entirely
    pub fn no_deny_routes(mut self) -> Self {
        self.deny_routes = None;
        self
    }

    /// Enables or disables the response cache
    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Sets the response-cache entry lifetime
    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Replaces the default cache-excluded route patterns
    pub fn cache_disabled_routes(mut self, patterns: Vec<String>) -> Self {
        self.cache_disabled_routes = patterns;
        self
    }

    /// Sets the session-affinity pin lifetime
    pub fn affinity_ttl(mut self, ttl: Duration) -> Self {
        self.affinity_ttl = ttl;
        self
    }

    /// Enables rate limiting at `max` requests per `window`
    pub fn rate_limit(mut self, max: u64, window: Duration) -> Self {
        self.rate_limit = Some((max, window));
        self
    }

    /// Enables or disables permissive CORS
    pub fn cors_enabled(mut self, enabled: bool) -> Self {
        self.cors_enabled = enabled;
        self
    }

    /// Enables or disables gzip response compression
    pub fn gzip_enabled(mut self, enabled: bool) -> Self {
        self.gzip_enabled = enabled;
        self
    }

    /// Sets the upstream request timeout
    pub fn upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    /// Backs affinity, cache and rate windows with a caller-provided store
    ///
    /// Defaults to an in-process [`MemoryStore`]; deployments running
    /// multiple gateway replicas supply a shared store here.
    pub fn with_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Compiles policies and assembles the gateway
    ///
    /// # Errors
    /// Fails on malformed route or cache patterns and on duplicate upstream
    /// names; all of these are configuration errors caught at startup.
    pub fn build(self) -> Result<Gateway> {
        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));

        let allow = self.allow_routes.as_deref().map(RouteTable::compile).transpose()?;
        let deny = self.deny_routes.as_deref().map(RouteTable::compile).transpose()?;
        let matcher = RouteMatcher::new(allow, deny);

        let policy =
            CachePolicy::new(self.cache_enabled, self.cache_ttl, &self.cache_disabled_routes)?;
        let cache = ResponseCache::new(store.clone(), policy);

        let balancer = Arc::new(StickyBalancer::new(
            self.upstreams,
            self.retry_upstream,
            store.clone(),
            self.affinity_ttl,
        )?);

        let client = reqwest::Client::builder().timeout(self.upstream_timeout).build()?;
        let coordinator = RetryCoordinator::new(balancer.clone(), client);

        let gate = self.rate_limit.map(|(max, window)| RateGate::new(store, max, window));
        let blocked: HashSet<String> = self.blocked_ips.into_iter().collect();

        let state = Arc::new(GatewayState { blocked, matcher, gate, cache, coordinator });

        let mut router = Router::new().fallback(forward_request).with_state(state);
        if self.gzip_enabled {
            router = router.layer(CompressionLayer::new());
        }
        if self.cors_enabled {
            router = router.layer(CorsLayer::permissive());
        }
        router = router.layer(TraceLayer::new_for_http());

        Ok(Gateway { router })
    }
}

struct GatewayState {
    blocked: HashSet<String>,
    matcher: RouteMatcher,
    gate: Option<RateGate>,
    cache: ResponseCache,
    coordinator: RetryCoordinator,
}

/// The assembled gateway server
pub struct Gateway {
    router: Router,
}

impl Gateway {
    /// Binds `addr` and serves until interrupted
    pub async fn serve(self, addr: SocketAddr) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_on(listener).await
    }

    /// Serves on an already-bound listener until interrupted
    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        info!("Gateway listening on {}", listener.local_addr()?);
        axum::serve(
            listener,
            self.router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {e}");
        return;
    }
    info!("Shutdown signal received, draining connections");
}

/// Resolves the client identity used for affinity and rate limiting
///
/// The first hop recorded in `X-Forwarded-For` wins when an edge proxy sits
/// in front of the gateway; otherwise the peer address is used directly.
fn client_key(headers: &axum::http::HeaderMap, peer: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| peer.ip().to_string())
}

fn reject(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "success": false, "message": message });
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
        body.to_string(),
    )
        .into_response()
}

fn apply_rate_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&decision.limit.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-limit"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.remaining.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-remaining"), v);
    }
    if let Ok(v) = HeaderValue::from_str(&decision.reset.to_string()) {
        headers.insert(HeaderName::from_static("x-ratelimit-reset"), v);
    }
}

fn response_from_cache(entry: CachedResponse) -> Response {
    let mut response = Response::new(Body::from(entry.body));
    *response.status_mut() = StatusCode::from_u16(entry.status).unwrap_or(StatusCode::OK);
    for (name, value) in entry.headers {
        if let (Ok(name), Ok(value)) =
            (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_bytes(&value))
        {
            response.headers_mut().append(name, value);
        }
    }
    response
}

fn cache_entry_from_buffer(buffer: &BufferedResponse) -> Option<CachedResponse> {
    let status = buffer.status()?.as_u16();
    let headers = buffer
        .headers()
        .iter()
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect();
    Some(CachedResponse { status, headers, body: buffer.body().to_vec() })
}

/// The per-request policy pipeline
async fn forward_request(
    State(state): State<Arc<GatewayState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    let path = parts.uri.path().to_string();
    let path_and_query =
        parts.uri.path_and_query().map(|pq| pq.as_str().to_string()).unwrap_or_else(|| path.clone());
    let query = parts.uri.query();
    let key = client_key(&parts.headers, peer);

    // The client blocklist runs before every other policy
    if state.blocked.contains(&key) {
        debug!("Blocked client {key}");
        return reject(StatusCode::FORBIDDEN, "your IP is blocked");
    }

    // Route authorization comes next; nothing else runs for a blocked route
    if !state.matcher.is_allowed(&method, &path) {
        debug!("Blocked by allow-list: {method} {path}");
        return reject(StatusCode::FORBIDDEN, "you are not allowed to access this endpoint");
    }
    if state.matcher.is_denied(&method, &path) {
        debug!("Blocked by deny-list: {method} {path}");
        return reject(StatusCode::FORBIDDEN, "you are not allowed to access this endpoint");
    }

    let decision = match &state.gate {
        Some(gate) => Some(gate.check(&key).await),
        None => None,
    };
    if let Some(decision) = &decision {
        if decision.reached {
            let mut response = reject(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            apply_rate_headers(&mut response, decision);
            return response;
        }
    }

    let cacheable = state.cache.policy().is_cacheable(&method, &path);
    let cache_key = cache::derive_key(&method, &path, query, &parts.headers);
    if cacheable {
        if let Some(entry) = state.cache.lookup(&cache_key).await {
            let mut response = response_from_cache(entry);
            if let Some(decision) = &decision {
                apply_rate_headers(&mut response, decision);
            }
            return response;
        }
    }

    let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(body) => body,
        Err(e) => {
            debug!("Unable to buffer request body: {e}");
            return reject(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
    };

    // Streaming routes always bypass the buffer; without a retry target
    // the buffer only earns its copy when a cache fill needs the body
    let streaming = state.coordinator.is_passthrough(&path)
        || (!state.coordinator.has_retry_target() && !cacheable);

    let mut response = if streaming {
        stream_through(&state, &key, &method, &path_and_query, &parts.headers, body).await
    } else {
        dispatch_buffered(
            &state,
            &key,
            &method,
            &path,
            &path_and_query,
            &parts.headers,
            body,
            cacheable.then_some(cache_key.as_str()),
        )
        .await
    };

    if let Some(decision) = &decision {
        apply_rate_headers(&mut response, decision);
    }
    response
}

/// Buffered dispatch with retry and optional cache fill
#[allow(clippy::too_many_arguments)]
async fn dispatch_buffered(
    state: &GatewayState,
    key: &str,
    method: &Method,
    path: &str,
    path_and_query: &str,
    headers: &axum::http::HeaderMap,
    body: Bytes,
    cache_key: Option<&str>,
) -> Response {
    let buffer = match state
        .coordinator
        .dispatch(key, method, path, path_and_query, headers, body)
        .await
    {
        Ok(buffer) => buffer,
        Err(e) => {
            warn!("Dispatch failed for {method} {path}: {e}");
            let status = extract_embedded_status(&e.to_string())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            return reject(status, "upstream request failed");
        }
    };

    if let Some(cache_key) = cache_key {
        if let Some(entry) = cache_entry_from_buffer(&buffer) {
            state.cache.store_response(cache_key, &entry).await;
        }
    }

    buffer.commit()
}

/// Streaming pass-through for live routes, no buffering and no retry
async fn stream_through(
    state: &GatewayState,
    key: &str,
    method: &Method,
    path_and_query: &str,
    headers: &axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let target = match state.coordinator.select_target(key, false).await {
        Ok(target) => target,
        Err(e) => {
            warn!("No target for {method} {path_and_query}: {e}");
            return reject(StatusCode::BAD_GATEWAY, "upstream request failed");
        }
    };

    match state.coordinator.forward(&target, method, path_and_query, headers, body).await {
        Ok(upstream) => {
            // Read status and headers before the body stream takes the
            // response by value
            let status = upstream.status();
            let headers = upstream.headers().clone();
            let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
            *response.status_mut() = status;
            for (name, value) in &headers {
                if name == header::CONNECTION
                    || name == header::TRANSFER_ENCODING
                    || name == header::CONTENT_LENGTH
                {
                    continue;
                }
                response.headers_mut().append(name.clone(), value.clone());
            }
            response
        }
        Err(e) => {
            warn!("Pass-through dispatch failed for {method} {path_and_query}: {e}");
            let status = extract_embedded_status(&e.to_string())
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            reject(status, "upstream request failed")
        }
    }
}
