//! Protocol codecs: turn bytes on a connected stream into structured
//! messages and back.
//!
//! - [`http`]: HTTP/1.1 request/response framing over any
//!   `AsyncRead + AsyncWrite` stream.
//! - [`ws`]: WebSocket handshake and frame I/O on top of `tokio-tungstenite`.
//!
//! Everything above this layer (routing, sessions, the client dispatcher)
//! only sees complete requests, responses, and messages.

pub mod http;
pub mod ws;

pub use http::CodecError;
