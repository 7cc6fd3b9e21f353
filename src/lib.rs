//! # weblink
//!
//! An embeddable async HTTP/1.1 and WebSocket library: a regex-routed
//! server with hooks and static files, a blocking-style client, and
//! callback-driven WebSocket sessions for both roles.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use weblink::{Response, Server, StatusCode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut server = Server::new();
//!     server.get(r"/users/(\d+)", |ctx| async move {
//!         let id = ctx.capture(0).unwrap_or_default().to_owned();
//!         Ok(Response::new(StatusCode::Ok).body(format!("user {id}")))
//!     });
//!     server.listen("127.0.0.1", 8080).await?;
//!     Ok(())
//! }
//! ```

// ── Wire formats ──────────────────────────────────────────────────────────────
pub mod codec;
pub mod http;

// ── Server side ───────────────────────────────────────────────────────────────
pub mod config;
pub mod context;
pub mod listener;
pub mod router;
pub mod server;

// ── Client side and WebSocket sessions ────────────────────────────────────────
pub mod client;
pub mod ws;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use client::{Client, ClientError};
pub use config::{Admission, ClientConfig, ServerConfig};
pub use context::Context;
pub use http::{Headers, Method, Params, Request, Response, StatusCode};
pub use listener::{ServerError, ServerHandle};
pub use router::{HandlerError, HandlerResult, Router};
pub use server::{Routing, Server};
pub use ws::{WebSocketClient, WebSocketConnection, WebSocketMessage, WebSocketServer, WsError};
