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

//! Bounded retry with response buffering
//!
//! The coordinator dispatches a request, buffers the response instead of
//! streaming it to the client, and decides whether to replay the request
//! against the designated retry target. Exactly one replay is permitted;
//! whatever the second attempt produces is final. The client observes a
//! single committed response and nothing of the replay machinery.
//!
//! A 404/403 on an idempotent read is treated as a possible affinity
//! artifact (the pinned node may lag behind chain head) rather than a
//! definitive answer. POSTs are only replayed for the script-execution
//! helpers, which are read-only despite the method, and only on an
//! embedded upstream 502.

use crate::balancer::{StickyBalancer, Target};
use axum::{
    body::Body,
    http::{header, HeaderMap, Method, StatusCode},
    response::Response,
};
use bytes::Bytes;
use eyre::Result;
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

static STATUS_CODE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"code=(\d+)").expect("embedded status regex"));

/// Script-execution helper routes: POSTs here are read-only and replayable
const DEFAULT_SCRIPT_ROUTE: &str = "/chains/[^/]+/blocks/[^/]+/helpers/scripts/";

/// Path fragments whose responses must stream live and bypass buffering
const PASSTHROUGH_FRAGMENTS: &[&str] = &["mempool", "monitor"];

/// Extracts a status code embedded in upstream error text
///
/// Matches the first integer after the literal token `code=`. A malformed
/// or absent token yields `None`, which can never satisfy the 502 replay
/// condition; only well-formed upstream error text triggers the POST-retry
/// path. Kept as a single seam so a structured error type can replace the
/// text scrape without touching the retry state machine.
pub fn extract_embedded_status(text: &str) -> Option<u16> {
    STATUS_CODE_RE.captures(text)?.get(1)?.as_str().parse().ok()
}

/// A fully buffered response awaiting commit
///
/// Nothing reaches the client connection until the buffered status line,
/// headers and body are committed in that order; a replay resets the
/// buffer and the client never sees the first attempt.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl BufferedResponse {
    /// Records one complete dispatch outcome into the buffer
    pub fn record(&mut self, status: StatusCode, headers: HeaderMap, body: &[u8]) {
        self.status = Some(status);
        self.headers = headers;
        self.body.extend_from_slice(body);
    }

    /// Discards all buffered state ahead of a replay
    pub fn reset(&mut self) {
        self.status = None;
        self.headers.clear();
        self.body.clear();
    }

    /// Buffered status, if any attempt completed
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// Buffered body bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Buffered response headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Commits the buffer as the final client response
    ///
    /// When no status was ever recorded the transport default (200) applies.
    pub fn commit(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        if let Some(status) = self.status {
            *response.status_mut() = status;
        }
        *response.headers_mut() = self.headers;
        response
    }
}

/// One dispatch attempt's outcome, as seen by the retry decision
enum Attempt {
    /// Upstream produced a response, clean or not
    Response(StatusCode, HeaderMap, Bytes),
    /// Dispatch failed; the error text may embed a status code
    Failed(eyre::Report),
}

/// Coordinates dispatch, decision and the single optional replay
pub struct RetryCoordinator {
    balancer: Arc<StickyBalancer>,
    client: reqwest::Client,
    script_route: Regex,
}

impl RetryCoordinator {
    /// Creates a coordinator dispatching through `client`
    pub fn new(balancer: Arc<StickyBalancer>, client: reqwest::Client) -> Self {
        let script_route = Regex::new(DEFAULT_SCRIPT_ROUTE).expect("script route regex");
        Self { balancer, client, script_route }
    }

    /// Whether this request bypasses buffering entirely
    ///
    /// Long-poll routes must stream live rather than buffer, so they are
    /// exempt from the retry machinery altogether.
    pub fn is_passthrough(&self, path: &str) -> bool {
        PASSTHROUGH_FRAGMENTS.iter().any(|fragment| path.contains(fragment))
    }

    /// Whether a dedicated retry target is provisioned
    pub fn has_retry_target(&self) -> bool {
        self.balancer.has_retry_target()
    }

    /// Selects a target and performs a single upstream dispatch
    ///
    /// Exposed for the pass-through path, which streams the response
    /// without the buffering coordinator.
    pub async fn select_target(&self, client_key: &str, is_retry: bool) -> Result<Target> {
        self.balancer
            .select(client_key, is_retry)
            .await
            .ok_or_else(|| eyre::eyre!("code=502, message=no upstream target available"))
    }

    /// Forwards the request to `target`, returning the raw upstream reply
    pub async fn forward(
        &self,
        target: &Target,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", target.base_url, path_and_query);
        let mut request = self.client.request(method.clone(), &url).body(body);

        for (name, value) in headers {
            // The client sets these itself for the rewritten request
            if name == header::HOST || name == header::CONTENT_LENGTH {
                continue;
            }
            request = request.header(name, value);
        }

        // Error text carries the embedded status the decision logic parses,
        // matching what upstream gateway errors have historically looked
        // like on the wire.
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                eyre::eyre!("code=504, message=upstream timeout: {e}")
            } else {
                eyre::eyre!("code=502, message=upstream dispatch failed: {e}")
            }
        })
    }

    async fn attempt(
        &self,
        client_key: &str,
        is_retry: bool,
        method: &Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Attempt> {
        let target = self.select_target(client_key, is_retry).await?;
        debug!(
            "Dispatching {method} {path_and_query} to {} (retry: {is_retry})",
            target.name
        );

        match self.forward(&target, method, path_and_query, headers, body).await {
            Ok(response) => {
                let status = response.status();
                let headers = sanitize_headers(response.headers());
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| eyre::eyre!("code=502, message=upstream body read failed: {e}"))?;
                Ok(Attempt::Response(status, headers, bytes))
            }
            Err(e) => Ok(Attempt::Failed(e)),
        }
    }

    /// Runs the buffered dispatch state machine for one request
    ///
    /// The request body is captured up front so it can be read twice: once
    /// for the initial attempt and once for the replay. Returns an error
    /// only when no target is available at all.
    pub async fn dispatch(
        &self,
        client_key: &str,
        method: &Method,
        path: &str,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<BufferedResponse> {
        let mut buffer = BufferedResponse::default();

        let first = self
            .attempt(client_key, false, method, path_and_query, headers, body.clone())
            .await?;

        if !self.should_retry(method, path, &first) {
            self.record_attempt(&mut buffer, first);
            return Ok(buffer);
        }

        info!("Triggering retry for {method} {path}");

        // Replay: reset the buffer, rewind the body, route to the retry
        // target. Whatever comes back is final.
        buffer.reset();
        let second = self
            .attempt(client_key, true, method, path_and_query, headers, body)
            .await?;

        match &second {
            Attempt::Response(status, ..) => info!("Retry attempt http status: {status}"),
            Attempt::Failed(e) => warn!("Retry attempt failed: {e}"),
        }
        self.record_attempt(&mut buffer, second);
        Ok(buffer)
    }

    /// The canonical replay condition
    ///
    /// GET with a final 404 or 403 (possibly a routing artifact of a
    /// lagging node), or POST to a script-execution route whose dispatch
    /// error embeds a 502. Without a provisioned retry target there is
    /// nothing useful to replay against.
    fn should_retry(&self, method: &Method, path: &str, attempt: &Attempt) -> bool {
        if !self.balancer.has_retry_target() {
            return false;
        }
        match attempt {
            Attempt::Response(status, ..) => {
                *method == Method::GET
                    && (*status == StatusCode::NOT_FOUND || *status == StatusCode::FORBIDDEN)
            }
            Attempt::Failed(e) => {
                let embedded = extract_embedded_status(&e.to_string()).unwrap_or(0);
                *method == Method::POST && embedded == 502 && self.script_route.is_match(path)
            }
        }
    }

    fn record_attempt(&self, buffer: &mut BufferedResponse, attempt: Attempt) {
        match attempt {
            Attempt::Response(status, headers, bytes) => {
                buffer.record(status, headers, &bytes);
            }
            Attempt::Failed(e) => {
                let status = extract_embedded_status(&e.to_string())
                    .and_then(|code| StatusCode::from_u16(code).ok())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                warn!("Upstream dispatch failed: {e}");
                let body = serde_json::json!({
                    "success": false,
                    "message": "upstream request failed",
                });
                let mut headers = HeaderMap::new();
                headers.insert(
                    header::CONTENT_TYPE,
                    header::HeaderValue::from_static("application/json"),
                );
                buffer.record(status, headers, body.to_string().as_bytes());
            }
        }
    }
}

/// Drops hop-by-hop headers that no longer describe the buffered body
fn sanitize_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = HeaderMap::new();
    for (name, value) in headers {
        if name == header::CONNECTION
            || name == header::TRANSFER_ENCODING
            || name == header::CONTENT_LENGTH
        {
            continue;
        }
        sanitized.insert(name.clone(), value.clone());
    }
    sanitized
}
