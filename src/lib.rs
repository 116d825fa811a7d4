pub use crate::codec::{PacketEncode, PacketDecode};
pub use crate::error::{Result, Error, AlgoNegotiateError, DisconnectError};
pub use crate::pubkey::Pubkey;
pub use crate::transport::{Transport, TransportConfig, Service, HostKeyVerifier};

pub mod cipher;
pub mod codec;
pub mod codes;
pub mod comp;
pub mod error;
pub mod kex;
pub mod mac;
pub mod pubkey;
pub mod transport;
