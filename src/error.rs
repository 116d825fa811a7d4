use std::fmt;
use std::sync::Arc;
use crate::codes::disconnect;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the whole crate.
///
/// The enum is `Clone` so that a single fatal error can be fanned out to every task and latch
/// waiter of a dying transport; I/O sources are therefore kept behind [`Arc`].
#[derive(Clone, Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("cryptography error: {0}")]
    Crypto(&'static str),
    #[error("randomness error: {0}")]
    Random(&'static str),
    #[error("mac verification failed")]
    Mac,
    #[error("signature verification failed")]
    Signature,
    #[error("server host key was not accepted by any verifier")]
    HostKeyUnverified,
    #[error("protocol error: {0}")]
    Protocol(&'static str),
    #[error("server does not support SSH 2.0, identified as: {0:?}")]
    ProtocolVersion(String),
    #[error("could not decode bytes: {0}")]
    Decode(&'static str),
    #[error("could not negotiate algorithm: {0}")]
    AlgoNegotiate(AlgoNegotiateError),
    #[error("compression error: {0}")]
    Compress(&'static str),
    #[error("packet {0} not implemented")]
    PacketNotImplemented(u8),
    #[error("IO error when reading: {0}")]
    ReadIo(Arc<std::io::Error>),
    #[error("IO error when writing: {0}")]
    WriteIo(Arc<std::io::Error>),
    #[error("connection unexpectedly closed by peer")]
    PeerClosed,
    #[error("peer disconnected: {0}")]
    PeerDisconnected(DisconnectError),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("transport is closed")]
    TransportClosed,
}

impl Error {
    /// The disconnect reason that best describes this error, [`disconnect::UNKNOWN`] when none
    /// does. A dying transport sends a final SSH_MSG_DISCONNECT only for non-UNKNOWN reasons.
    pub fn disconnect_reason(&self) -> u32 {
        match self {
            Error::Mac => disconnect::MAC_ERROR,
            Error::Compress(_) => disconnect::COMPRESSION_ERROR,
            Error::Protocol(_) | Error::Decode(_) | Error::PacketNotImplemented(_) =>
                disconnect::PROTOCOL_ERROR,
            Error::ProtocolVersion(_) => disconnect::PROTOCOL_VERSION_NOT_SUPPORTED,
            Error::AlgoNegotiate(_) | Error::Signature | Error::Crypto(_) =>
                disconnect::KEY_EXCHANGE_FAILED,
            Error::HostKeyUnverified => disconnect::HOST_KEY_NOT_VERIFIABLE,
            _ => disconnect::UNKNOWN,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("for {algo_name:}, our algos are {our_algos:?}, their algos are {their_algos:?}")]
pub struct AlgoNegotiateError {
    pub algo_name: String,
    pub our_algos: Vec<String>,
    pub their_algos: Vec<String>,
}

/// The payload of SSH_MSG_DISCONNECT, ours or the peer's.
#[derive(Debug, Clone, thiserror::Error)]
pub struct DisconnectError {
    pub reason_code: u32,
    pub description: String,
    pub description_lang: String,
}

impl DisconnectError {
    /// A disconnect with reason "by application", used for ordinary user-initiated shutdown.
    pub fn by_app() -> DisconnectError {
        DisconnectError {
            reason_code: disconnect::BY_APPLICATION,
            description: "disconnected by application".into(),
            description_lang: "".into(),
        }
    }
}

impl fmt::Display for DisconnectError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "peer returned ")?;
        if let Some(reason) = disconnect::to_str(self.reason_code) {
            write!(f, "`{}` ({})", reason, self.reason_code)?;
        } else {
            write!(f, "{}", self.reason_code)?;
        }
        if !self.description.is_empty() {
            write!(f, ": {:?}", self.description)?;
        }
        Ok(())
    }
}
