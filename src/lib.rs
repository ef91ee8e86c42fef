//! pipecall - line-framed JSON calls between a host and a long-lived child
//!
//! The host spawns a child with piped stdio and talks to it one line per
//! message. Three call styles share the transport: fire-and-forget
//! notifications, callback requests, and awaited calls with a timeout. A
//! background reader tolerates any non-protocol output the child prints.
//!
//! - `channel` - host side: process supervision, framing, correlation, reader
//! - `server` - child side: handler dispatch, heartbeats, parent watch
//! - `config` - channel settings, optionally loaded from TOML
//! - `utils` - executable lookup under installation directories

pub mod channel;
pub mod config;
pub mod server;
pub mod utils;

mod error;

pub use channel::framing::{Payload, MAGIC_PREFIX};
pub use channel::registry::{CallHandler, FnHandler};
pub use channel::{ChannelEvent, IpcChannel};
pub use config::ChannelConfig;
pub use error::{Error, Result};
pub use server::IpcServer;

/// Install a stderr `tracing` subscriber filtered by `RUST_LOG`.
///
/// Logs never go to stdout: for a child process stdout is the protocol stream.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("pipecall=info"));

    // A second call (e.g. from tests) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
