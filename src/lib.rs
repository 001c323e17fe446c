//! Black-box security and integration test harness for a Saltcorn server.
//!
//! The harness drives a running server instance over HTTP and WebSocket and
//! asserts on authentication, authorization, session, multi-tenant isolation
//! and real-time messaging behavior. It is built from three pieces:
//!
//! - [`HttpSession`]: a cookie-jar-backed session that records the last
//!   response (status, body, redirect target) with redirect-following
//!   disabled, so intermediate 302s stay assertable.
//! - [`ServerBin`] / [`ServerHandle`]: spawns and kills the server under
//!   test, waits for its port to come up, and runs its administrative CLI
//!   for schema resets, fixtures, tenants and users.
//! - [`RealtimeClient`]: a WebSocket client that authenticates with a
//!   session cookie and records subscribed events.
//!
//! Scenario suites under `tests/e2e/` consume these against a real server
//! binary; the suites under `tests/` verify the harness itself.

use anyhow::{Context, Result};
use rand::Rng;
use tracing_subscriber::EnvFilter;

pub mod realtime;
pub mod server;
pub mod session;

pub use realtime::{Event, RealtimeClient};
pub use server::{fixture_file, ServerBin, ServerConfig, ServerHandle};
pub use session::HttpSession;

/// Install the global `tracing` subscriber. Safe to call from every suite
/// setup; later calls are no-ops.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .ok();
}

/// Ask the OS for a currently unused TCP port.
pub fn find_free_port() -> Result<u16> {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .context("binding to ephemeral port")?
        .local_addr()
        .context("reading socket address")?
        .port();
    Ok(port)
}

/// Random tenant subdomain so suites can re-run against a dirty database.
pub fn random_tenant_id(prefix: &str) -> String {
    let mut rng = rand::thread_rng();
    format!("{}{}", prefix, rng.gen_range(0u32..1_000_000))
}
