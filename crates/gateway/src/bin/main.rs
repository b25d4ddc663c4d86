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

//! TzGate Server
//!
//! A policy-enforcing reverse proxy that fronts one or more Tezos node RPC
//! endpoints, providing session affinity, bounded retries, response caching,
//! route authorization and rate limiting for public-facing deployments.

use clap::Parser;
use eyre::Result;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;
use tzgate::GatewayBuilder;
use tzgate_common::init_logging;

/// TzGate reverse proxy for Tezos node RPC
#[derive(Parser, Debug)]
#[command(name = "tzgate")]
#[command(about = "Policy-enforcing reverse proxy for Tezos node RPC")]
#[command(version)]
struct Args {
    // ========== General Configuration ==========
    /// Address to bind to
    /// Example: --host 0.0.0.0
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value = "8080")]
    port: u16,

    /// Upstream node RPC URLs (comma-separated)
    /// Example: --upstreams "http://node-1:8732,http://node-2:8732"
    #[arg(long, required = true)]
    upstreams: String,

    /// Dedicated node replays are routed to
    #[arg(long)]
    retry_upstream: Option<String>,

    /// Upstream request timeout in seconds
    #[arg(long, default_value = "30")]
    upstream_timeout: u64,

    // ========== Route Policy Configuration ==========
    /// Client IPs to reject outright (comma-separated)
    #[arg(long)]
    block_ips: Option<String>,

    /// Allowed route patterns (comma-separated, optional method prefix)
    /// Example: --allow-routes "GET/chains/.*,POST/injection/operation"
    #[arg(long)]
    allow_routes: Option<String>,

    /// Denied route patterns (comma-separated); replaces the defaults
    #[arg(long)]
    deny_routes: Option<String>,

    /// Disable the default deny-list entirely
    #[arg(long)]
    no_deny_routes: bool,

    // ========== Cache Configuration ==========
    /// Disable the response cache
    #[arg(long)]
    no_cache: bool,

    /// Cache entry lifetime in seconds
    #[arg(long, default_value = "5")]
    cache_ttl: u64,

    // ========== Affinity Configuration ==========
    /// Session-affinity pin lifetime in seconds
    #[arg(long, default_value = "600")]
    affinity_ttl: u64,

    // ========== Rate Limit Configuration ==========
    /// Maximum requests per client per window (0 = unlimited)
    #[arg(long, default_value = "0")]
    rate_limit: u64,

    /// Rate-limit window in seconds
    #[arg(long, default_value = "60")]
    rate_window: u64,

    // ========== HTTP Configuration ==========
    /// Disable permissive CORS headers
    #[arg(long)]
    no_cors: bool,

    /// Disable gzip response compression
    #[arg(long)]
    no_gzip: bool,

    /// Verbosity level (repeat for more: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set RUST_LOG based on verbosity
    if std::env::var("RUST_LOG").is_err() {
        let level = match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    init_logging("tzgate", true)?;

    let mut builder = GatewayBuilder::new()
        .cache_enabled(!args.no_cache)
        .cache_ttl(Duration::from_secs(args.cache_ttl))
        .affinity_ttl(Duration::from_secs(args.affinity_ttl))
        .cors_enabled(!args.no_cors)
        .gzip_enabled(!args.no_gzip)
        .upstream_timeout(Duration::from_secs(args.upstream_timeout));

    for url in split_list(&args.upstreams) {
        builder = builder.upstream(url);
    }

    if let Some(url) = args.retry_upstream {
        builder = builder.retry_upstream(url);
    }

    if let Some(ips) = args.block_ips {
        builder = builder.block_ips(split_list(&ips));
    }

    if let Some(patterns) = args.allow_routes {
        builder = builder.allow_routes(split_list(&patterns));
    }

    if args.no_deny_routes {
        builder = builder.no_deny_routes();
    } else if let Some(patterns) = args.deny_routes {
        builder = builder.deny_routes(split_list(&patterns));
    }

    if args.rate_limit > 0 {
        builder = builder.rate_limit(args.rate_limit, Duration::from_secs(args.rate_window));
    }

    let gateway = builder.build()?;

    let ip = IpAddr::from_str(&args.host)?;
    let addr = SocketAddr::from((ip, args.port));
    info!("Starting TzGate on {addr}");

    gateway.serve(addr).await
}

/// Splits a comma-separated CLI list, dropping empty segments
fn split_list(raw: &str) -> Vec<String> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
}
