//! # portmux
//!
//! Port forwarding over a single TCP connection. Up to 255 forwarded TCP
//! streams share one tunnel link between two processes.
//!
//! ## Roles
//!
//! - **Originator** listens for application clients and opens the tunnel
//! - **Terminator** accepts the tunnel and connects each forwarded stream to
//!   its target
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Controller                        │
//! │     (ID allocation, command dispatch, tick loop)     │
//! ├─────────────────────────────────────────────────────┤
//! │                  Protocol Pump                       │
//! │  (framing/escaping, round-robin mux, resumable demux)│
//! ├─────────────────────────────────────────────────────┤
//! │              Connections & Ring Buffers              │
//! │        (per-direction state, scatter/gather)         │
//! ├─────────────────────────────────────────────────────┤
//! │                 Connection Manager                   │
//! │      (mio readiness, accept/connect, shutdown)       │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Everything runs on one thread. A tick polls the sockets once, then moves
//! bytes between connection buffers and the tunnel buffers.

pub mod config;
pub mod controller;
pub mod protocol;
pub mod transport;
pub mod tunnel;

pub use config::{Config, Mode, TunnelConfig};
pub use controller::{Controller, Shutdown};

use tracing_subscriber::EnvFilter;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Install the global `tracing` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this more
/// than once keeps the first subscriber.
pub fn init_logging(config: &config::LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    };
    if result.is_err() {
        tracing::debug!("Logging already initialised");
    }
}
