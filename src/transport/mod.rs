//! The transport layer: version exchange, packet crypto, key exchange, dispatch.
pub use self::config::TransportConfig;
pub use self::service::{HostKeyVerifier, Service};
pub use self::transport::Transport;

mod config;
mod decoder;
mod encoder;
mod heartbeat;
mod kexer;
mod latch;
mod reader;
mod service;
mod transport;

#[cfg(test)]
mod tests;
