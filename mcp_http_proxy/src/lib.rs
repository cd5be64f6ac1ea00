//! # MCP HTTP Proxy
//!
//! A stdio-to-HTTP bridge for MCP servers.
//!
//! This crate provides the inverse of an HTTP front end: a small relay that
//! lets a client speaking JSON-RPC over stdin/stdout talk to a centralized
//! server that speaks JSON-RPC over HTTP with Server-Sent Events for
//! asynchronous pushes. Each input line is posted to
//! `{base_url}/{server}/message`; replies come back either in the HTTP
//! response body or later over the persistent `{base_url}/{server}/sse`
//! stream, and in both cases they are matched to their request through a
//! correlation table and written to stdout one JSON document per line.
//!
//! ## Architecture
//!
//! *   **Single event loop**: one logical thread multiplexes stdin reads,
//!     in-flight HTTP posts, and the push channel; any number of requests
//!     may be outstanding at once, and replies are emitted in completion
//!     order.
//! *   **Correlation table**: every message gets a process-unique id on the
//!     wire; the client's own `id` is restored before a reply is written
//!     back out.
//! *   **Output discipline**: stdout carries protocol traffic only. All
//!     diagnostics go to stderr or a rolling log file.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcp_http_proxy::{ProxyConfig, run_bridge};
//! use url::Url;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProxyConfig::new("memory", Url::parse("http://127.0.0.1:9090")?);
//!     run_bridge(config).await?;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod error;
pub mod framing;
pub mod logging;
pub mod session;
pub mod sse;

pub use bridge::{Bridge, ProxyConfig, run_bridge};
pub use error::{ProxyError, Result};
pub use session::{PendingRequest, ProxySession, error_reply};
pub use sse::{SseEvent, SseParser};
