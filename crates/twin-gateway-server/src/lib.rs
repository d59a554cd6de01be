//! # twin-gateway-server
//!
//! WebSocket surface of the device-twin gateway.
//!
//! Devices connect over WebSocket; every frame carries one JSON-encoded CoAP
//! message. The server owns the sockets and correlates device responses,
//! everything else is handed to the [`twin_gateway::Service`] worker pool.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   WebSocket   ┌──────────────────────────────┐
//! │  device  │◄─────────────►│ GatewayServer                │
//! └──────────┘               │   WsConnection (per socket)  │
//! ┌──────────┐               │        │ dispatch            │
//! │  device  │◄─────────────►│        ▼                     │
//! └──────────┘               │   twin_gateway::Service      │
//!                            │        │                     │
//!                            │        ▼                     │
//!                            │   backend (aggregate, bus)   │
//!                            └──────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use twin_gateway_server::{standalone, FileConfig, GatewayServer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FileConfig::from_file("twin-gateway.toml")?;
//!     let gateway = standalone(&config)?;
//!     let server = GatewayServer::new(config.server_config(), gateway.service);
//!     server.serve().await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod server;
pub mod session;

pub use bootstrap::{standalone, Standalone};
pub use config::{FileConfig, ServerConfig, WebSocketConfig};
pub use error::{ServerError, ServerResult};
pub use server::GatewayServer;
pub use session::{ViolationTracker, WsConnection};
