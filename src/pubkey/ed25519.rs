use bytes::Bytes;
use std::fmt;
use crate::codec::PacketDecode;
use crate::error::{Result, Error};
use super::{PubkeyAlgo, Pubkey, SignatureVerified};

/// "ssh-ed25519" public key algorithm from RFC 8709.
///
/// This algorithm is compatible with [`Ed25519Pubkey`].
pub static SSH_ED25519: PubkeyAlgo = PubkeyAlgo {
    name: "ssh-ed25519",
    verify,
};

/// Ed25519 public key from RFC 8032.
///
/// This key is compatible with [`SSH_ED25519`].
#[derive(Debug, Clone)]
pub struct Ed25519Pubkey {
    pub(crate) pubkey: ed25519_dalek::PublicKey,
}

pub(super) fn decode_pubkey(blob: &mut PacketDecode) -> Result<Pubkey> {
    let pubkey_data = blob.get_byte_array::<32>()?;
    let pubkey = ed25519_dalek::PublicKey::from_bytes(&pubkey_data)
        .map_err(|_| Error::Decode("ed25519 public key is invalid"))?;
    Ok(Pubkey::Ed25519(Ed25519Pubkey { pubkey }))
}

fn verify(pubkey: &Pubkey, message: &[u8], signature: Bytes) -> Result<SignatureVerified> {
    let Pubkey::Ed25519(pubkey) = pubkey;

    let mut signature = PacketDecode::new(signature);
    if signature.get_string()? != "ssh-ed25519" {
        return Err(Error::Decode("expected signature format 'ssh-ed25519'"))
    }

    let signature_data = signature.get_byte_array::<64>()?;
    let ed_signature = ed25519_dalek::Signature::from(signature_data);

    match pubkey.pubkey.verify_strict(message, &ed_signature) {
        Ok(_) => Ok(SignatureVerified::assertion()),
        Err(_) => Err(Error::Signature),
    }
}

impl From<ed25519_dalek::PublicKey> for Ed25519Pubkey {
    fn from(pubkey: ed25519_dalek::PublicKey) -> Self {
        Self { pubkey }
    }
}

impl fmt::Display for Ed25519Pubkey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ed25519 {:x}", Bytes::copy_from_slice(self.pubkey.as_bytes()))
    }
}
