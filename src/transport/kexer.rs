use bytes::Bytes;
use parking_lot::Mutex;
use std::time::Duration;
use crate::cipher::{CipherAlgo, CipherAlgoVariant, PacketEncrypt, PacketDecrypt};
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::msg;
use crate::comp::CompressAlgo;
use crate::error::{AlgoNegotiateError, Error, Result};
use crate::kex::{Kex, KexAlgo, KexInput, KexOutput};
use crate::mac::MacAlgo;
use crate::pubkey::{Pubkey, PubkeyAlgo};
use super::config::TransportConfig;
use super::decoder::{Decoder, DecompressState};
use super::encoder::CompressState;
use super::latch::Latch;
use super::service::HostKeyVerifier;
use super::transport::{Inner, WriteEnd};

/// Drives the key exchange sub-protocol (RFC 4253, section 7).
///
/// The exchanger is fed kex packets by the supervisor on the reader task and writes its own
/// packets straight through the write mutex, bypassing the kex gating in
/// [`Transport::write`][super::Transport::write]. The outbound keys are installed into the
/// encoder in the same lock hold that sends SSH_MSG_NEWKEYS; the inbound keys are installed into
/// the decoder right after the peer's SSH_MSG_NEWKEYS is consumed.
pub(crate) struct KeyExchanger {
    st: Mutex<KexState>,
    verifiers: Mutex<Vec<Box<dyn HostKeyVerifier>>>,
    done: Latch,
    session_id: Mutex<Option<Vec<u8>>>,
}

#[derive(Default)]
struct KexState {
    ongoing: bool,
    our_kex_init: Option<Bytes>,
    their_kex_init: Option<TheirKexInit>,
    algos: Option<Algos>,
    kex: Option<Box<dyn Kex + Send>>,
    kex_output: Option<KexOutput>,
    new_keys_sent: bool,
    new_keys_recvd: bool,
}

#[derive(Debug)]
struct TheirKexInit {
    payload: Bytes,
    kex_algos: Vec<String>,
    server_pubkey_algos: Vec<String>,
    cipher_algos_cts: Vec<String>,
    cipher_algos_stc: Vec<String>,
    mac_algos_cts: Vec<String>,
    mac_algos_stc: Vec<String>,
    comp_algos_cts: Vec<String>,
    comp_algos_stc: Vec<String>,
}

struct Algos {
    kex: &'static KexAlgo,
    server_pubkey: &'static PubkeyAlgo,
    cipher_cts: &'static CipherAlgo,
    cipher_stc: &'static CipherAlgo,
    mac_cts: &'static MacAlgo,
    mac_stc: &'static MacAlgo,
    comp_cts: &'static CompressAlgo,
    comp_stc: &'static CompressAlgo,
}

impl KeyExchanger {
    pub fn new() -> KeyExchanger {
        KeyExchanger {
            st: Mutex::new(KexState::default()),
            verifiers: Mutex::new(Vec::new()),
            done: Latch::new("kex done"),
            session_id: Mutex::new(None),
        }
    }

    pub fn add_host_key_verifier(&self, verifier: Box<dyn HostKeyVerifier>) {
        self.verifiers.lock().push(verifier);
    }

    pub fn is_kex_ongoing(&self) -> bool {
        self.st.lock().ongoing
    }

    pub fn is_kex_done(&self) -> bool {
        self.done.is_set()
    }

    /// The exchange hash of the first key exchange; never changes afterwards.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.session_id.lock().clone()
    }

    pub async fn wait_for_done(&self, timeout: Duration) -> Result<()> {
        match tokio::time::timeout(timeout, self.done.wait()).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout("key exchange completion")),
        }
    }

    /// Fail every task waiting for the exchange; called when the transport dies.
    pub fn notify_error(&self, error: Error) {
        self.done.fail(error);
    }

    /// Start a key exchange unless one is already in flight; with `wait`, block until it
    /// completes or fails.
    pub async fn start_kex(&self, inner: &Inner, wait: bool) -> Result<()> {
        {
            let mut guard = inner.write.lock().await;
            let w = guard.as_mut().ok_or(Error::Protocol("transport is not initialized"))?;
            self.start_kex_locked(inner, w).await?;
        }
        if wait {
            self.wait_for_done(inner.config.timeout).await?;
        }
        Ok(())
    }

    /// Like [`start_kex`][Self::start_kex], for callers that already hold the write mutex
    /// (the sequence-wrap rekey fires inside `Transport::write`).
    pub async fn start_kex_locked(&self, inner: &Inner, w: &mut WriteEnd) -> Result<()> {
        {
            let mut st = self.st.lock();
            if st.ongoing {
                return Ok(())
            }
            st.ongoing = true;
            st.new_keys_sent = false;
            st.new_keys_recvd = false;
            self.done.clear();
        }

        log::debug!("starting key exchange");
        let payload = compose_kex_init(&inner.config)?;
        w.send_packet(&payload).await?;
        log::debug!("sent SSH_MSG_KEXINIT");
        self.st.lock().our_kex_init = Some(payload);
        Ok(())
    }

    /// Handle a packet from the kex ranges: KEXINIT, NEWKEYS, or a method-specific message.
    pub async fn handle(
        &self,
        msg_id: u8,
        payload: &mut PacketDecode,
        inner: &Inner,
        decoder: &mut Decoder,
    ) -> Result<()> {
        match msg_id {
            msg::KEXINIT => self.recv_kex_init(payload, inner).await,
            msg::NEWKEYS => self.recv_new_keys(decoder),
            30..=49 => self.recv_kex_packet(msg_id, payload, inner).await,
            _ => Err(Error::PacketNotImplemented(msg_id)),
        }
    }

    async fn recv_kex_init(&self, payload: &mut PacketDecode, inner: &Inner) -> Result<()> {
        let their_kex_init = parse_kex_init(payload)?;
        log::debug!("received SSH_MSG_KEXINIT: {:?}", their_kex_init);

        let mut guard = inner.write.lock().await;
        let w = guard.as_mut().ok_or(Error::Protocol("transport is not initialized"))?;

        // the peer may initiate a (re)key exchange before we do
        self.start_kex_locked(inner, w).await?;

        {
            let mut st = self.st.lock();
            if st.their_kex_init.is_some() {
                return Err(Error::Protocol("received SSH_MSG_KEXINIT during negotiation"))
            }

            let algos = negotiate_algos(&inner.config, &their_kex_init)?;
            let kex = (algos.kex.make_kex)()?;
            st.their_kex_init = Some(their_kex_init);
            st.algos = Some(algos);
            st.kex = Some(kex);
        }

        self.pump_kex_packets(w).await
    }

    /// Drain the packets that the kex method wants to send.
    async fn pump_kex_packets(&self, w: &mut WriteEnd) -> Result<()> {
        loop {
            let payload = match self.st.lock().kex.as_mut() {
                Some(kex) => kex.send_packet()?,
                None => None,
            };
            match payload {
                Some(payload) => { w.send_packet(&payload).await?; },
                None => return Ok(()),
            }
        }
    }

    async fn recv_kex_packet(&self, msg_id: u8, payload: &mut PacketDecode, inner: &Inner) -> Result<()> {
        let exchanged = {
            let mut st = self.st.lock();
            let kex = st.kex.as_mut()
                .ok_or(Error::Protocol("received unexpected key exchange message"))?;
            kex.recv_packet(msg_id, payload)?;
            kex.is_exchanged()
        };

        {
            let mut guard = inner.write.lock().await;
            let w = guard.as_mut().ok_or(Error::Protocol("transport is not initialized"))?;
            self.pump_kex_packets(w).await?;
        }

        if exchanged {
            self.finish_exchange(inner).await?;
        }
        Ok(())
    }

    async fn finish_exchange(&self, inner: &Inner) -> Result<()> {
        let output = {
            let server_ident = inner.server_ident.lock().clone()
                .ok_or(Error::Protocol("missing server identification"))?;
            let mut st = self.st.lock();
            let st = &mut *st;
            let input = KexInput {
                client_ident: inner.client_ident.as_bytes(),
                server_ident: server_ident.as_bytes(),
                client_kex_init: st.our_kex_init.as_deref()
                    .ok_or(Error::Protocol("key exchange was not initiated"))?,
                server_kex_init: &st.their_kex_init.as_ref()
                    .ok_or(Error::Protocol("key exchange was not negotiated"))?.payload,
            };
            st.kex.as_mut().unwrap().finish(input)?
        };
        log::debug!("finished key exchange computation");

        let pubkey = Pubkey::decode(output.server_pubkey.clone())?;
        log::debug!("server host key: {}", pubkey);

        let (host, port) = inner.conn_info()
            .ok_or(Error::Protocol("transport is not initialized"))?;
        let accepted = self.verifiers.lock().iter()
            .any(|verifier| verifier.verify(&host, port, &pubkey));
        if !accepted {
            return Err(Error::HostKeyUnverified)
        }
        log::debug!("server host key was accepted");

        let pubkey_algo = self.st.lock().algos.as_ref().unwrap().server_pubkey;
        (pubkey_algo.verify)(&pubkey, &output.exchange_hash, output.server_exchange_hash_sign.clone())?;
        log::debug!("verified signature of the exchange hash");

        {
            let mut session_id = self.session_id.lock();
            if session_id.is_none() {
                *session_id = Some(output.exchange_hash.clone());
            }
        }

        let mut newkeys = PacketEncode::new();
        newkeys.put_u8(msg::NEWKEYS);
        let newkeys = newkeys.finish();

        let mut guard = inner.write.lock().await;
        let w = guard.as_mut().ok_or(Error::Protocol("transport is not initialized"))?;
        self.st.lock().kex_output = Some(output);
        w.send_packet(&newkeys).await?;

        let mut st = self.st.lock();
        let st = &mut *st;
        let (encrypt, block_len, tag_len, compress) = self.make_outbound_state(st)?;
        w.encoder.new_keys(encrypt, block_len, tag_len, compress);
        st.new_keys_sent = true;
        log::debug!("sent SSH_MSG_NEWKEYS and applied new outbound keys");

        if st.new_keys_recvd {
            self.finish_kex(st);
        }
        Ok(())
    }

    fn recv_new_keys(&self, decoder: &mut Decoder) -> Result<()> {
        let mut st = self.st.lock();
        let st = &mut *st;
        if !st.ongoing || st.new_keys_recvd || st.kex_output.is_none() {
            return Err(Error::Protocol("received unexpected SSH_MSG_NEWKEYS"))
        }

        let (decrypt, block_len, tag_len, decompress) = self.make_inbound_state(st)?;
        decoder.new_keys(decrypt, block_len, tag_len, decompress);
        st.new_keys_recvd = true;
        log::debug!("received SSH_MSG_NEWKEYS and applied new inbound keys");

        if st.new_keys_sent {
            self.finish_kex(st);
        }
        Ok(())
    }

    fn finish_kex(&self, st: &mut KexState) {
        st.ongoing = false;
        st.our_kex_init = None;
        st.their_kex_init = None;
        st.algos = None;
        st.kex = None;
        st.kex_output = None;
        st.new_keys_sent = false;
        st.new_keys_recvd = false;
        self.done.set();
        log::debug!("key exchange is complete");
    }

    fn make_outbound_state(&self, st: &mut KexState)
        -> Result<(PacketEncrypt, usize, usize, Option<CompressState>)>
    {
        let session_id = self.session_id.lock().clone()
            .ok_or(Error::Protocol("session identifier is not established"))?;
        let algos = st.algos.as_ref().unwrap();
        let cipher_algo = algos.cipher_cts;
        let mac_algo = algos.mac_cts;
        let comp_algo = algos.comp_cts;

        let key = derive_key(st, &session_id, b'C', cipher_algo.key_len)?;
        let iv = derive_key(st, &session_id, b'A', cipher_algo.iv_len)?;

        let (encrypt, tag_len) = match &cipher_algo.variant {
            CipherAlgoVariant::Standard(standard) => {
                let mac_key = derive_key(st, &session_id, b'E', mac_algo.key_len)?;
                let mac = (mac_algo.make_mac)(&mac_key);
                (PacketEncrypt::EncryptAndMac((standard.make_encrypt)(&key, &iv), mac), mac_algo.tag_len)
            },
            CipherAlgoVariant::Aead(aead) =>
                (PacketEncrypt::Aead((aead.make_encrypt)(&key, &iv)), aead.tag_len),
        };

        let compress = if comp_algo.is_none() { None } else {
            Some(CompressState {
                compress: (comp_algo.make_compress)(),
                delayed: comp_algo.delayed,
            })
        };

        Ok((encrypt, cipher_algo.block_len, tag_len, compress))
    }

    fn make_inbound_state(&self, st: &mut KexState)
        -> Result<(PacketDecrypt, usize, usize, Option<DecompressState>)>
    {
        let session_id = self.session_id.lock().clone()
            .ok_or(Error::Protocol("session identifier is not established"))?;
        let algos = st.algos.as_ref().unwrap();
        let cipher_algo = algos.cipher_stc;
        let mac_algo = algos.mac_stc;
        let comp_algo = algos.comp_stc;

        let key = derive_key(st, &session_id, b'D', cipher_algo.key_len)?;
        let iv = derive_key(st, &session_id, b'B', cipher_algo.iv_len)?;

        let (decrypt, tag_len) = match &cipher_algo.variant {
            CipherAlgoVariant::Standard(standard) => {
                let mac_key = derive_key(st, &session_id, b'F', mac_algo.key_len)?;
                let mac = (mac_algo.make_mac)(&mac_key);
                (PacketDecrypt::EncryptAndMac((standard.make_decrypt)(&key, &iv), mac), mac_algo.tag_len)
            },
            CipherAlgoVariant::Aead(aead) =>
                (PacketDecrypt::Aead((aead.make_decrypt)(&key, &iv)), aead.tag_len),
        };

        let decompress = if comp_algo.is_none() { None } else {
            Some(DecompressState {
                decompress: (comp_algo.make_decompress)(),
                delayed: comp_algo.delayed,
            })
        };

        Ok((decrypt, cipher_algo.block_len, tag_len, decompress))
    }
}

fn derive_key(st: &KexState, session_id: &[u8], key_type: u8, key_len: usize) -> Result<Vec<u8>> {
    // RFC 4253, section 7.2
    let kex = st.kex.as_deref()
        .ok_or(Error::Protocol("key exchange method is not active"))?;
    let kex_output = st.kex_output.as_ref()
        .ok_or(Error::Protocol("key exchange did not produce keys"))?;

    let mut to_hash_prefix = PacketEncode::new();
    to_hash_prefix.put_biguint(&kex_output.shared_secret);
    to_hash_prefix.put_raw(&kex_output.exchange_hash);

    let mut key = {
        let mut to_hash = to_hash_prefix.clone();
        to_hash.put_u8(key_type);
        to_hash.put_raw(session_id);
        kex.compute_hash(&to_hash.finish())
    };

    while key.len() < key_len {
        let mut to_hash = to_hash_prefix.clone();
        to_hash.put_raw(&key);
        key.extend_from_slice(&kex.compute_hash(&to_hash.finish()));
    }

    key.truncate(key_len);
    Ok(key)
}

fn compose_kex_init(config: &TransportConfig) -> Result<Bytes> {
    use rand::RngCore as _;
    let mut cookie = [0; 16];
    rand::rngs::OsRng.try_fill_bytes(&mut cookie)
        .map_err(|_| Error::Random("could not generate random cookie"))?;

    fn get_algo_names<A: NamedAlgo>(algos: &[&'static A]) -> Vec<&'static str> {
        algos.iter().map(|algo| algo.name()).collect()
    }

    let kex_names = get_algo_names(&config.kex_algos);
    let pubkey_names = get_algo_names(&config.server_pubkey_algos);
    let cipher_names = get_algo_names(&config.cipher_algos);
    let mac_names = get_algo_names(&config.mac_algos);
    let comp_names = get_algo_names(&config.comp_algos);

    // RFC 4253, section 7.1
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::KEXINIT);
    payload.put_raw(&cookie);
    payload.put_name_list(&kex_names);
    payload.put_name_list(&pubkey_names);
    payload.put_name_list(&cipher_names);
    payload.put_name_list(&cipher_names);
    payload.put_name_list(&mac_names);
    payload.put_name_list(&mac_names);
    payload.put_name_list(&comp_names);
    payload.put_name_list(&comp_names);
    payload.put_name_list(&[]);
    payload.put_name_list(&[]);
    payload.put_bool(false);
    payload.put_u32(0);
    Ok(payload.finish())
}

fn parse_kex_init(payload: &mut PacketDecode) -> Result<TheirKexInit> {
    // RFC 4253, section 7.1
    payload.skip(16)?; // cookie
    let kex_algos = payload.get_name_list()?; // kex_algorithms
    let server_pubkey_algos = payload.get_name_list()?; // server_host_key_algorithms
    let cipher_algos_cts = payload.get_name_list()?; // encryption_algorithms_client_to_server
    let cipher_algos_stc = payload.get_name_list()?; // encryption_algorithms_server_to_client
    let mac_algos_cts = payload.get_name_list()?; // mac_algorithms_client_to_server
    let mac_algos_stc = payload.get_name_list()?; // mac_algorithms_server_to_client
    let comp_algos_cts = payload.get_name_list()?; // compression_algorithms_client_to_server
    let comp_algos_stc = payload.get_name_list()?; // compression_algorithms_server_to_client
    payload.get_name_list()?; // languages_client_to_server
    payload.get_name_list()?; // languages_server_to_client
    let first_kex_packet_follows = payload.get_bool()?; // first_kex_packet_follows
    payload.get_u32()?; // reserved

    if first_kex_packet_follows {
        return Err(Error::Protocol("received SSH_MSG_KEXINIT with first_kex_packet_follows set"))
    }

    Ok(TheirKexInit {
        payload: Bytes::copy_from_slice(payload.as_original_bytes()),
        kex_algos,
        server_pubkey_algos,
        cipher_algos_cts,
        cipher_algos_stc,
        mac_algos_cts,
        mac_algos_stc,
        comp_algos_cts,
        comp_algos_stc,
    })
}

fn negotiate_algos(config: &TransportConfig, their: &TheirKexInit) -> Result<Algos> {
    fn negotiate_algo<A: NamedAlgo>(
        our_algos: &[&'static A],
        their_algos: &[String],
        name: &'static str,
    ) -> Result<&'static A> {
        for our_algo in our_algos.iter() {
            for their_algo in their_algos.iter() {
                if our_algo.name() == their_algo.as_str() {
                    log::debug!("negotiated algo {:?} for {}", their_algo, name);
                    return Ok(our_algo)
                }
            }
        }

        Err(Error::AlgoNegotiate(AlgoNegotiateError {
            algo_name: name.into(),
            our_algos: our_algos.iter().map(|a| a.name().into()).collect(),
            their_algos: their_algos.into(),
        }))
    }

    let kex = negotiate_algo(&config.kex_algos, &their.kex_algos, "key exchange")?;
    let server_pubkey = negotiate_algo(
        &config.server_pubkey_algos, &their.server_pubkey_algos, "server host key")?;
    let cipher_cts = negotiate_algo(
        &config.cipher_algos, &their.cipher_algos_cts, "cipher client-to-server")?;
    let cipher_stc = negotiate_algo(
        &config.cipher_algos, &their.cipher_algos_stc, "cipher server-to-client")?;
    let mac_cts = negotiate_algo(
        &config.mac_algos, &their.mac_algos_cts, "mac client-to-server")?;
    let mac_stc = negotiate_algo(
        &config.mac_algos, &their.mac_algos_stc, "mac server-to-client")?;
    let comp_cts = negotiate_algo(
        &config.comp_algos, &their.comp_algos_cts, "compression client-to-server")?;
    let comp_stc = negotiate_algo(
        &config.comp_algos, &their.comp_algos_stc, "compression server-to-client")?;

    Ok(Algos { kex, server_pubkey, cipher_cts, cipher_stc, mac_cts, mac_stc, comp_cts, comp_stc })
}

trait NamedAlgo { fn name(&self) -> &'static str; }
impl NamedAlgo for KexAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for CipherAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for MacAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for PubkeyAlgo { fn name(&self) -> &'static str { self.name } }
impl NamedAlgo for CompressAlgo { fn name(&self) -> &'static str { self.name } }
