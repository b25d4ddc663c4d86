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

//! TzGate Gateway Library
//!
//! A reverse-proxy gateway that fronts one or more Tezos node RPC endpoints,
//! enforcing route policy, session affinity, bounded retries and response
//! caching before traffic reaches the upstream. Upstreams are treated as
//! opaque HTTP origins identified by URL.

pub mod balancer;
pub mod cache;
pub mod limit;
pub mod proxy;
pub mod retry;
pub mod routes;
pub mod store;

pub use balancer::{StickyBalancer, Target};
pub use cache::{CachedResponse, CachePolicy, ResponseCache};
pub use limit::{RateGate, RateLimitDecision};
pub use proxy::{Gateway, GatewayBuilder};
pub use retry::{BufferedResponse, RetryCoordinator};
pub use routes::{RouteMatcher, RouteTable};
pub use store::{MemoryStore, SharedStore};
