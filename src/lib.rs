//! JSON-RPC 2.0 over a single persistent WebSocket.
//!
//! This library provides:
//!
//! - `client` - the [`Client`] facade: connect, call, notify, subscribe
//! - `engine` - correlation of calls with responses and notification routing
//! - `transport` - the [`Transport`] trait with WebSocket and in-memory implementations
//! - `envelope` - the JSON-RPC wire envelopes
//! - `config` - timeouts and keepalive settings
//!
//! # Usage
//!
//! ```ignore
//! use jsonrpc_websockets::{Client, ClientConfig};
//! use serde_json::json;
//!
//! let client = Client::new(ClientConfig::from_env()?);
//! client.connect("ws://127.0.0.1:9000").await?;
//! let echoed: Option<String> = client.call("echo", json!({"text": "hi"})).await?;
//! ```

pub mod client;
pub mod config;
mod engine;
pub mod envelope;
pub mod transport;

pub use client::{Client, ClientError, ConnectionState};
pub use config::ClientConfig;
pub use transport::{
    MemoryPeer, MemoryTransport, Transport, TransportError, TransportEvent, TransportListener,
    WebSocketTransport,
};
