use crate::codec::PacketDecode;
use crate::error::{Error, Result};
use crate::pubkey::Pubkey;

/// A higher layer multiplexed over the transport (user authentication, the connection layer).
///
/// Exactly one service is active at a time; every decoded packet with a message id of 50 or higher
/// is handed to it on the transport's reader task, so [`handle`][Service::handle] should offload
/// long-running work. Errors returned from `handle` are fatal for the transport.
pub trait Service: Send + Sync {
    /// The name sent in SSH_MSG_SERVICE_REQUEST (e.g. "ssh-userauth").
    fn name(&self) -> &'static str;

    /// Handle a decoded packet addressed to this service.
    fn handle(&self, msg_id: u8, payload: &mut PacketDecode) -> Result<()>;

    /// The transport is disconnecting at the user's request.
    fn notify_disconnect(&self) -> Result<()> {
        Ok(())
    }

    /// The transport died with `error`; no further packets will be delivered.
    fn notify_error(&self, error: &Error) {
        let _ = error;
    }

    /// The peer answered one of our packets with SSH_MSG_UNIMPLEMENTED.
    fn notify_unimplemented(&self, packet_seq: u32) -> Result<()> {
        let _ = packet_seq;
        Ok(())
    }
}

/// The "no active service" sentinel: discards everything, so dispatch sites need no null checks.
pub(crate) struct NullService;

impl Service for NullService {
    fn name(&self) -> &'static str {
        "null-service"
    }

    fn handle(&self, msg_id: u8, _payload: &mut PacketDecode) -> Result<()> {
        log::trace!("null service is discarding packet {}", msg_id);
        Ok(())
    }
}

/// Decides whether a host key presented by the server is trusted.
///
/// Verifiers are registered with
/// [`Transport::add_host_key_verifier`][crate::transport::Transport::add_host_key_verifier]; a
/// single accepting vote passes the key, and a key exchange with no accepting verifier fails.
pub trait HostKeyVerifier: Send + Sync {
    fn verify(&self, host: &str, port: u16, pubkey: &Pubkey) -> bool;
}

impl<F> HostKeyVerifier for F
    where F: Fn(&str, u16, &Pubkey) -> bool + Send + Sync
{
    fn verify(&self, host: &str, port: u16, pubkey: &Pubkey) -> bool {
        self(host, port, pubkey)
    }
}
