use bytes::{Bytes, BytesMut};
use ed25519_dalek::Signer as _;
use num_bigint_dig::BigUint;
use parking_lot::Mutex;
use sha2::digest::Digest as _;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream};
use crate::{cipher, comp, kex, mac, pubkey};
use crate::cipher::{CipherAlgo, CipherAlgoVariant, PacketDecrypt, PacketEncrypt};
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::{disconnect, msg};
use crate::comp::CompressAlgo;
use crate::error::{Error, Result};
use crate::mac::MacAlgo;
use super::config::TransportConfig;
use super::decoder::Decoder;
use super::encoder::Encoder;
use super::service::Service;
use super::transport::Transport;

const SERVER_IDENT: &str = "SSH-2.0-harness_1";

fn test_config(encrypted: bool) -> TransportConfig {
    TransportConfig {
        version: "minato_test".into(),
        kex_algos: vec![&kex::CURVE25519_SHA256],
        server_pubkey_algos: vec![&pubkey::SSH_ED25519],
        cipher_algos: if encrypted {
            vec![&cipher::CHACHA20_POLY1305]
        } else {
            vec![&cipher::NONE]
        },
        mac_algos: vec![&mac::NONE],
        comp_algos: vec![&comp::NONE],
        timeout: Duration::from_millis(500),
        heartbeat_interval: None,
    }
}

fn accept_all_transport(config: TransportConfig) -> Transport {
    let transport = Transport::new(config);
    transport.add_host_key_verifier(Box::new(|_: &str, _: u16, _: &crate::Pubkey| true));
    transport
}


struct RecordingService {
    service_name: &'static str,
    handled: Mutex<Vec<u8>>,
    unimplemented: Mutex<Vec<u32>>,
}

impl RecordingService {
    fn new(service_name: &'static str) -> Arc<RecordingService> {
        Arc::new(RecordingService {
            service_name,
            handled: Mutex::new(Vec::new()),
            unimplemented: Mutex::new(Vec::new()),
        })
    }
}

impl Service for RecordingService {
    fn name(&self) -> &'static str {
        self.service_name
    }

    fn handle(&self, msg_id: u8, _payload: &mut PacketDecode) -> Result<()> {
        self.handled.lock().push(msg_id);
        Ok(())
    }

    fn notify_unimplemented(&self, packet_seq: u32) -> Result<()> {
        self.unimplemented.lock().push(packet_seq);
        Ok(())
    }
}


/// A scripted SSH server speaking over an in-memory duplex stream. It reuses the crate's own
/// encoder and decoder for framing and performs a real curve25519 + ed25519 key exchange.
struct TestServer {
    stream: DuplexStream,
    encoder: Encoder,
    decoder: Decoder,
    keypair: ed25519_dalek::Keypair,
    client_ident: Option<String>,
    session_id: Option<Vec<u8>>,
    recv_log: Vec<u8>,
}

fn test_keypair() -> ed25519_dalek::Keypair {
    let secret = ed25519_dalek::SecretKey::from_bytes(&[7; 32]).unwrap();
    let public = ed25519_dalek::PublicKey::from(&secret);
    ed25519_dalek::Keypair { secret, public }
}

impl TestServer {
    fn new(stream: DuplexStream) -> TestServer {
        TestServer {
            stream,
            encoder: Encoder::new(Arc::new(AtomicBool::new(false))).unwrap(),
            decoder: Decoder::new(Arc::new(AtomicBool::new(false))),
            keypair: test_keypair(),
            client_ident: None,
            session_id: None,
            recv_log: Vec::new(),
        }
    }

    async fn exchange_idents(&mut self, motd: &[&str]) {
        for line in motd {
            self.stream.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        }
        self.stream.write_all(format!("{}\r\n", SERVER_IDENT).as_bytes()).await.unwrap();

        loop {
            if let Some(ident) = self.decoder.consume_ident().unwrap() {
                self.client_ident = Some(ident);
                return
            }
            let len = self.stream.read_buf(self.decoder.feed_buf()).await.unwrap();
            assert!(len > 0, "eof while waiting for the client identification");
        }
    }

    async fn recv_packet(&mut self) -> Option<Bytes> {
        loop {
            if let Some(packet) = self.decoder.consume_packet().unwrap() {
                self.recv_log.push(packet.payload[0]);
                return Some(packet.payload)
            }
            let len = self.stream.read_buf(self.decoder.feed_buf()).await.unwrap();
            if len == 0 {
                return None
            }
        }
    }

    /// Like [`recv_packet`][Self::recv_packet], but skips keepalive packets that the client's
    /// heartbeat may interleave.
    async fn recv_packet_skipping_ignores(&mut self) -> Option<Bytes> {
        loop {
            let payload = self.recv_packet().await?;
            if payload[0] != msg::IGNORE {
                return Some(payload)
            }
        }
    }

    async fn send_packet(&mut self, payload: &[u8]) -> u32 {
        let mut out = BytesMut::new();
        let packet_seq = self.encoder.encode(payload, &mut out).unwrap();
        self.stream.write_all(&out).await.unwrap();
        self.stream.flush().await.unwrap();
        packet_seq
    }

    /// Serve one key exchange initiated by the client. With `encrypted`, switches to
    /// chacha20-poly1305 at the NEWKEYS boundary; `install_outbound: false` deliberately keeps
    /// sending with the old keys to test the boundary.
    async fn serve_kex(&mut self, encrypted: bool, install_outbound: bool) -> Vec<u8> {
        let client_kex_init = loop {
            let payload = self.recv_packet().await.expect("eof while waiting for KEXINIT");
            if payload[0] == msg::KEXINIT {
                break payload
            }
        };

        let cipher_name = if encrypted { cipher::CHACHA20_POLY1305.name } else { cipher::NONE.name };
        let server_kex_init = compose_server_kex_init(cipher_name);
        self.send_packet(&server_kex_init).await;

        let ecdh_init = self.recv_packet_skipping_ignores().await
            .expect("eof while waiting for KEX_ECDH_INIT");
        assert_eq!(ecdh_init[0], msg::KEX_ECDH_INIT);
        let mut ecdh_init = PacketDecode::new(ecdh_init.clone());
        ecdh_init.get_u8().unwrap();
        let client_eph_pubkey = ecdh_init.get_bytes().unwrap();

        let server_eph_privkey = x25519_dalek::EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let server_eph_pubkey = x25519_dalek::PublicKey::from(&server_eph_privkey);
        let client_eph = x25519_dalek::PublicKey::from(
            <[u8; 32]>::try_from(client_eph_pubkey.as_ref()).unwrap());
        let shared_secret = server_eph_privkey.diffie_hellman(&client_eph);
        let shared_secret = BigUint::from_bytes_be(shared_secret.as_bytes());

        let mut host_key_blob = PacketEncode::new();
        host_key_blob.put_str("ssh-ed25519");
        host_key_blob.put_bytes(self.keypair.public.as_bytes());
        let host_key_blob = host_key_blob.finish();

        let mut exchange_data = PacketEncode::new();
        exchange_data.put_bytes(self.client_ident.as_ref().unwrap().as_bytes());
        exchange_data.put_bytes(SERVER_IDENT.as_bytes());
        exchange_data.put_bytes(&client_kex_init);
        exchange_data.put_bytes(&server_kex_init);
        exchange_data.put_bytes(&host_key_blob);
        exchange_data.put_bytes(&client_eph_pubkey);
        exchange_data.put_bytes(server_eph_pubkey.as_bytes());
        exchange_data.put_biguint(&shared_secret);
        let exchange_hash = sha2::Sha256::digest(&exchange_data.finish()).to_vec();

        if self.session_id.is_none() {
            self.session_id = Some(exchange_hash.clone());
        }

        let signature = self.keypair.sign(&exchange_hash);
        let mut signature_blob = PacketEncode::new();
        signature_blob.put_str("ssh-ed25519");
        signature_blob.put_bytes(&signature.to_bytes());

        let mut reply = PacketEncode::new();
        reply.put_u8(msg::KEX_ECDH_REPLY);
        reply.put_bytes(&host_key_blob);
        reply.put_bytes(server_eph_pubkey.as_bytes());
        reply.put_bytes(&signature_blob.finish());
        self.send_packet(&reply.finish()).await;

        self.send_packet(&[msg::NEWKEYS]).await;
        if encrypted && install_outbound {
            let key = self.derive_key(&shared_secret, &exchange_hash, b'D');
            let CipherAlgoVariant::Aead(ref aead) = cipher::CHACHA20_POLY1305.variant
                else { unreachable!() };
            self.encoder.new_keys(PacketEncrypt::Aead((aead.make_encrypt)(&key, &[])), 8, 16, None);
        }

        let new_keys = self.recv_packet_skipping_ignores().await
            .expect("eof while waiting for NEWKEYS");
        assert_eq!(new_keys[0], msg::NEWKEYS);
        if encrypted {
            let key = self.derive_key(&shared_secret, &exchange_hash, b'C');
            let CipherAlgoVariant::Aead(ref aead) = cipher::CHACHA20_POLY1305.variant
                else { unreachable!() };
            self.decoder.new_keys(PacketDecrypt::Aead((aead.make_decrypt)(&key, &[])), 8, 16, None);
        }

        exchange_hash
    }

    fn derive_key(&self, shared_secret: &BigUint, exchange_hash: &[u8], key_type: u8) -> Vec<u8> {
        let session_id = self.session_id.as_ref().unwrap();
        let key_len = cipher::CHACHA20_POLY1305.key_len;

        let mut prefix = PacketEncode::new();
        prefix.put_biguint(shared_secret);
        prefix.put_raw(exchange_hash);

        let mut key = {
            let mut to_hash = prefix.clone();
            to_hash.put_u8(key_type);
            to_hash.put_raw(session_id);
            sha2::Sha256::digest(&to_hash.finish()).to_vec()
        };
        while key.len() < key_len {
            let mut to_hash = prefix.clone();
            to_hash.put_raw(&key);
            key.extend_from_slice(&sha2::Sha256::digest(&to_hash.finish()));
        }
        key.truncate(key_len);
        key
    }

    async fn serve_service_accept(&mut self) -> String {
        let request = self.recv_packet_skipping_ignores().await
            .expect("eof while waiting for SERVICE_REQUEST");
        assert_eq!(request[0], msg::SERVICE_REQUEST);
        let mut request = PacketDecode::new(request.clone());
        request.get_u8().unwrap();
        let service_name = request.get_string().unwrap();

        let mut accept = PacketEncode::new();
        accept.put_u8(msg::SERVICE_ACCEPT);
        accept.put_str(&service_name);
        self.send_packet(&accept.finish()).await;
        service_name
    }

    /// Read packets until the stream ends, returning the observed DISCONNECT payloads.
    async fn drain_until_eof(&mut self) -> Vec<(u32, String)> {
        let mut disconnects = Vec::new();
        while let Some(payload) = self.recv_packet().await {
            if payload[0] == msg::DISCONNECT {
                let mut payload = PacketDecode::new(payload.clone());
                payload.get_u8().unwrap();
                let reason_code = payload.get_u32().unwrap();
                let description = payload.get_string().unwrap();
                disconnects.push((reason_code, description));
            }
        }
        disconnects
    }
}

fn compose_server_kex_init(cipher_name: &str) -> Bytes {
    let mut payload = PacketEncode::new();
    payload.put_u8(msg::KEXINIT);
    payload.put_raw(&[0; 16]);
    payload.put_name_list(&["curve25519-sha256"]);
    payload.put_name_list(&["ssh-ed25519"]);
    payload.put_name_list(&[cipher_name]);
    payload.put_name_list(&[cipher_name]);
    payload.put_name_list(&["none"]);
    payload.put_name_list(&["none"]);
    payload.put_name_list(&["none"]);
    payload.put_name_list(&["none"]);
    payload.put_name_list(&[]);
    payload.put_name_list(&[]);
    payload.put_bool(false);
    payload.put_u32(0);
    payload.finish()
}


#[tokio::test]
async fn test_end_to_end_session() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let transport = accept_all_transport(test_config(true));

    let server = tokio::spawn(async move {
        let mut server = TestServer::new(server_io);
        server.exchange_idents(&["welcome to the harness", "another motd line"]).await;
        let exchange_hash = server.serve_kex(true, true).await;
        let service_name = server.serve_service_accept().await;
        // leave the client a moment to install the accepted service
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.send_packet(&[50, 1, 2, 3]).await;
        server.send_packet(&[msg::UNIMPLEMENTED, 0, 0, 0, 5]).await;
        let disconnects = server.drain_until_eof().await;
        (exchange_hash, service_name, disconnects)
    });

    transport.init("testhost", 22, client_io).await.unwrap();
    assert_eq!(transport.server_version().as_deref(), Some("harness_1"));
    assert_eq!(transport.remote_host().as_deref(), Some("testhost"));
    assert_eq!(transport.remote_port(), Some(22));

    transport.do_kex().await.unwrap();
    assert!(transport.is_kex_done());
    assert!(transport.is_running());

    let service = RecordingService::new("ssh-userauth");
    transport.req_service(service.clone()).await.unwrap();

    for _ in 0..100 {
        if !service.handled.lock().is_empty() && !service.unimplemented.lock().is_empty() {
            break
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(*service.handled.lock(), vec![50]);
    assert_eq!(*service.unimplemented.lock(), vec![5]);

    transport.disconnect().await;
    transport.join().await.unwrap();
    assert!(!transport.is_running());
    assert!(matches!(transport.write(&[msg::IGNORE]).await, Err(_)));

    let (exchange_hash, service_name, disconnects) = server.await.unwrap();
    assert_eq!(transport.session_id(), Some(exchange_hash));
    assert_eq!(service_name, "ssh-userauth");
    assert_eq!(disconnects.len(), 1);
    assert_eq!(disconnects[0].0, disconnect::BY_APPLICATION);
}

#[tokio::test]
async fn test_kex_gating() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let transport = accept_all_transport(test_config(false));

    let server = tokio::spawn(async move {
        let mut server = TestServer::new(server_io);
        server.exchange_idents(&[]).await;
        // swallow whatever the client sends, but never answer the kex
        while server.recv_packet().await.is_some() {}
    });

    transport.init("testhost", 22, client_io).await.unwrap();
    transport.inner.kexer.start_kex(&transport.inner, false).await.unwrap();
    assert!(transport.inner.kexer.is_kex_ongoing());

    // transport-control packets pass while the kex is in flight
    transport.write(&[msg::IGNORE]).await.unwrap();

    // a service request blocks until the kex finishes (which it never does here)
    let mut request = PacketEncode::new();
    request.put_u8(msg::SERVICE_REQUEST);
    request.put_str("ssh-userauth");
    let request = request.finish();
    let blocked = tokio::time::timeout(Duration::from_millis(100), transport.write(&request)).await;
    assert!(blocked.is_err(), "SERVICE_REQUEST should be held back during kex");

    // a service-range packet blocks as well
    let blocked = tokio::time::timeout(Duration::from_millis(100), transport.write(&[50])).await;
    assert!(blocked.is_err(), "service packets should be held back during kex");

    transport.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_req_service_timeout_then_success() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let transport = accept_all_transport(test_config(false));

    let server = tokio::spawn(async move {
        let mut server = TestServer::new(server_io);
        server.exchange_idents(&[]).await;
        server.serve_kex(false, true).await;

        // ignore the first service request, answer the second
        let first = server.recv_packet().await.unwrap();
        assert_eq!(first[0], msg::SERVICE_REQUEST);
        server.serve_service_accept().await;
        server.drain_until_eof().await;
    });

    transport.init("testhost", 22, client_io).await.unwrap();
    transport.do_kex().await.unwrap();

    let service = RecordingService::new("ssh-userauth");
    let result = transport.req_service(service.clone()).await;
    assert!(matches!(result, Err(Error::Timeout(_))), "expected a timeout, got {:?}", result.is_ok());

    // the transport survives the timeout, so a retry can succeed
    transport.req_service(service).await.unwrap();

    transport.disconnect().await;
    transport.join().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_unknown_transport_message_gets_unimplemented() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let transport = accept_all_transport(test_config(false));

    let server = tokio::spawn(async move {
        let mut server = TestServer::new(server_io);
        server.exchange_idents(&[]).await;
        server.serve_kex(false, true).await;

        // message 7 is not handled by this transport
        let bogus_seq = server.send_packet(&[7, 0, 0, 0, 0]).await;

        let reply = server.recv_packet().await.unwrap();
        assert_eq!(reply[0], msg::UNIMPLEMENTED);
        let mut reply = PacketDecode::new(reply.clone());
        reply.get_u8().unwrap();
        assert_eq!(reply.get_u32().unwrap(), bogus_seq);

        server.drain_until_eof().await;
    });

    transport.init("testhost", 22, client_io).await.unwrap();
    transport.do_kex().await.unwrap();

    // give the reader time to answer the bogus packet, then shut down
    tokio::time::sleep(Duration::from_millis(100)).await;
    transport.disconnect().await;
    transport.join().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_disconnects_send_one_packet() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let transport = accept_all_transport(test_config(false));

    let server = tokio::spawn(async move {
        let mut server = TestServer::new(server_io);
        server.exchange_idents(&[]).await;
        server.serve_kex(false, true).await;
        server.drain_until_eof().await
    });

    transport.init("testhost", 22, client_io).await.unwrap();
    transport.do_kex().await.unwrap();

    let first = transport.clone();
    let second = transport.clone();
    tokio::join!(
        async move { first.disconnect().await },
        async move { second.disconnect().await },
    );

    transport.join().await.unwrap();

    // a late error is a no-op on the closed transport
    transport.die(Error::PeerClosed).await;
    transport.join().await.unwrap();

    let disconnects = server.await.unwrap();
    assert_eq!(disconnects.len(), 1);
}

#[tokio::test]
async fn test_rekey_on_sequence_wrap_keeps_session_id() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let transport = accept_all_transport(test_config(false));

    let server = tokio::spawn(async move {
        let mut server = TestServer::new(server_io);
        server.exchange_idents(&[]).await;
        server.serve_kex(false, true).await;
        server.serve_kex(false, true).await;
        let packet = server.recv_packet().await.unwrap();
        assert_eq!(packet[0], msg::IGNORE);
        server.drain_until_eof().await;
        server.recv_log
    });

    transport.init("testhost", 22, client_io).await.unwrap();
    transport.do_kex().await.unwrap();
    let session_id = transport.session_id().unwrap();

    // pretend that the outbound sequence number wrapped around
    transport.inner.write.lock().await.as_mut().unwrap().encoder.set_seq(0);

    // the next write triggers a rekey and goes out after it completes
    transport.write(&[msg::IGNORE]).await.unwrap();
    assert_eq!(transport.session_id().unwrap(), session_id);

    transport.disconnect().await;
    transport.join().await.unwrap();

    let recv_log = server.await.unwrap();
    let ignore_at = recv_log.iter().position(|&id| id == msg::IGNORE).unwrap();
    let rekey_at = recv_log.iter().rposition(|&id| id == msg::KEXINIT).unwrap();
    assert!(rekey_at < ignore_at, "the rekey KEXINIT must precede the gated packet");
}

#[tokio::test]
async fn test_packet_with_stale_keys_is_rejected() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let transport = accept_all_transport(test_config(true));

    let server = tokio::spawn(async move {
        let mut server = TestServer::new(server_io);
        server.exchange_idents(&[]).await;
        // the server "forgets" to switch its outbound keys at the NEWKEYS boundary
        server.serve_kex(true, false).await;
        server.send_packet(&[msg::IGNORE]).await;
        server.drain_until_eof().await;
    });

    transport.init("testhost", 22, client_io).await.unwrap();
    // the stale packet may kill the transport while do_kex still waits, so the result
    // of the kex itself is not interesting here
    let _ = transport.do_kex().await;

    assert!(transport.join().await.is_err());
    assert!(!transport.is_running());
    server.await.unwrap();
}

#[tokio::test]
async fn test_peer_disconnect_is_not_echoed() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let transport = accept_all_transport(test_config(false));

    let server = tokio::spawn(async move {
        let mut server = TestServer::new(server_io);
        server.exchange_idents(&[]).await;
        server.serve_kex(false, true).await;

        let mut goodbye = PacketEncode::new();
        goodbye.put_u8(msg::DISCONNECT);
        goodbye.put_u32(disconnect::PROTOCOL_ERROR);
        goodbye.put_str("goodbye");
        goodbye.put_str("");
        server.send_packet(&goodbye.finish()).await;

        server.drain_until_eof().await
    });

    transport.init("testhost", 22, client_io).await.unwrap();
    let _ = transport.do_kex().await;

    let result = transport.join().await;
    match result {
        Err(Error::PeerDisconnected(error)) => {
            assert_eq!(error.reason_code, disconnect::PROTOCOL_ERROR);
            assert_eq!(error.description, "goodbye");
        },
        other => panic!("expected a peer disconnect, got ok={}", other.is_ok()),
    }

    let disconnects = server.await.unwrap();
    assert!(disconnects.is_empty(), "the peer's DISCONNECT must not be echoed");
}

#[tokio::test]
async fn test_unexpected_service_accept_is_fatal() {
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let transport = accept_all_transport(test_config(false));

    let server = tokio::spawn(async move {
        let mut server = TestServer::new(server_io);
        server.exchange_idents(&[]).await;
        server.serve_kex(false, true).await;

        let mut accept = PacketEncode::new();
        accept.put_u8(msg::SERVICE_ACCEPT);
        accept.put_str("ssh-userauth");
        server.send_packet(&accept.finish()).await;

        server.drain_until_eof().await
    });

    transport.init("testhost", 22, client_io).await.unwrap();
    let _ = transport.do_kex().await;

    assert!(matches!(transport.join().await, Err(Error::Protocol(_))));

    // a fatal protocol error produces a final DISCONNECT
    let disconnects = server.await.unwrap();
    assert_eq!(disconnects.len(), 1);
    assert_eq!(disconnects[0].0, disconnect::PROTOCOL_ERROR);
}

#[tokio::test]
async fn test_heartbeat_sends_ignore_when_idle() {
    let mut config = test_config(false);
    config.heartbeat_interval = Some(Duration::from_millis(50));
    let (client_io, server_io) = tokio::io::duplex(1 << 16);
    let transport = accept_all_transport(config);

    let server = tokio::spawn(async move {
        let mut server = TestServer::new(server_io);
        server.exchange_idents(&[]).await;
        server.serve_kex(false, true).await;
        let packet = server.recv_packet().await.unwrap();
        assert_eq!(packet[0], msg::IGNORE);
        server.drain_until_eof().await;
    });

    transport.init("testhost", 22, client_io).await.unwrap();
    transport.do_kex().await.unwrap();

    // stay idle; the keepalive task speaks for us
    tokio::time::sleep(Duration::from_millis(200)).await;
    transport.disconnect().await;
    transport.join().await.unwrap();
    server.await.unwrap();
}


fn make_codec_pair(
    cipher_algo: &CipherAlgo,
    mac_algo: &MacAlgo,
    comp_algo: &'static CompressAlgo,
) -> (Encoder, Decoder) {
    let authed = Arc::new(AtomicBool::new(true));
    let mut encoder = Encoder::new(authed.clone()).unwrap();
    let mut decoder = Decoder::new(authed);
    decoder.skip_ident();

    let key = vec![0x42; cipher_algo.key_len];
    let iv = vec![0x24; cipher_algo.iv_len];
    let mac_key = vec![0x11; mac_algo.key_len];

    let (encrypt, decrypt, tag_len) = match &cipher_algo.variant {
        CipherAlgoVariant::Standard(standard) => (
            PacketEncrypt::EncryptAndMac((standard.make_encrypt)(&key, &iv), (mac_algo.make_mac)(&mac_key)),
            PacketDecrypt::EncryptAndMac((standard.make_decrypt)(&key, &iv), (mac_algo.make_mac)(&mac_key)),
            mac_algo.tag_len,
        ),
        CipherAlgoVariant::Aead(aead) => (
            PacketEncrypt::Aead((aead.make_encrypt)(&key, &iv)),
            PacketDecrypt::Aead((aead.make_decrypt)(&key, &iv)),
            aead.tag_len,
        ),
    };

    let compress = if comp_algo.is_none() { None } else {
        Some(super::encoder::CompressState {
            compress: (comp_algo.make_compress)(),
            delayed: comp_algo.delayed,
        })
    };
    let decompress = if comp_algo.is_none() { None } else {
        Some(super::decoder::DecompressState {
            decompress: (comp_algo.make_decompress)(),
            delayed: comp_algo.delayed,
        })
    };

    encoder.new_keys(encrypt, cipher_algo.block_len, tag_len, compress);
    decoder.new_keys(decrypt, cipher_algo.block_len, tag_len, decompress);
    (encoder, decoder)
}

#[test]
fn test_codec_roundtrip() {
    let combos: &[(&CipherAlgo, &MacAlgo, &'static CompressAlgo)] = &[
        (&cipher::NONE, &mac::NONE, &comp::NONE),
        (&cipher::NONE, &mac::HMAC_SHA2_256, &comp::NONE),
        (&cipher::AES128_CTR, &mac::HMAC_SHA2_256, &comp::NONE),
        (&cipher::AES256_CTR, &mac::HMAC_SHA2_512, &comp::NONE),
        (&cipher::CHACHA20_POLY1305, &mac::NONE, &comp::NONE),
        (&cipher::NONE, &mac::NONE, &comp::ZLIB),
        (&cipher::CHACHA20_POLY1305, &mac::NONE, &comp::ZLIB_OPENSSH),
    ];

    for (cipher_algo, mac_algo, comp_algo) in combos {
        let (mut encoder, mut decoder) = make_codec_pair(cipher_algo, mac_algo, comp_algo);

        for payload_len in [0usize, 1, 7, 8, 255, 256, 1000, 32 * 1024, 65535] {
            let payload: Vec<u8> = (0..payload_len).map(|i| (i % 251) as u8).collect();

            let mut wire = BytesMut::new();
            let send_seq = encoder.encode(&payload, &mut wire).unwrap();

            decoder.feed_buf().extend_from_slice(&wire);
            let packet = decoder.consume_packet().unwrap()
                .unwrap_or_else(|| panic!("no packet for len {} under {}", payload_len, cipher_algo.name));

            assert_eq!(packet.payload.as_ref(), payload.as_slice(),
                "payload mismatch for len {} under {}/{}/{}",
                payload_len, cipher_algo.name, mac_algo.name, comp_algo.name);
            assert_eq!(packet.packet_seq, send_seq,
                "sequence mismatch under {}", cipher_algo.name);
        }
    }
}

#[test]
fn test_codec_detects_corruption() {
    let (mut encoder, mut decoder) = make_codec_pair(
        &cipher::CHACHA20_POLY1305, &mac::NONE, &comp::NONE);

    let mut wire = BytesMut::new();
    encoder.encode(b"some payload", &mut wire).unwrap();
    let last = wire.len() - 1;
    wire[last] ^= 0x01;

    decoder.feed_buf().extend_from_slice(&wire);
    assert!(matches!(decoder.consume_packet(), Err(Error::Mac)));
}

#[test]
fn test_delayed_compression_arms_on_authentication() {
    let authed = Arc::new(AtomicBool::new(false));
    let mut encoder = Encoder::new(authed.clone()).unwrap();
    encoder.new_keys(
        PacketEncrypt::EncryptAndMac(Box::new(cipher::Identity), Box::new(mac::Empty)),
        8, 0,
        Some(super::encoder::CompressState {
            compress: (comp::ZLIB_OPENSSH.make_compress)(),
            delayed: true,
        }),
    );

    // before authentication the highly compressible payload goes out uncompressed
    let payload = vec![0x33; 4096];
    let mut wire = BytesMut::new();
    encoder.encode(&payload, &mut wire).unwrap();
    assert!(wire.len() > 4096);

    // and afterwards it shrinks
    authed.store(true, std::sync::atomic::Ordering::Relaxed);
    let mut wire = BytesMut::new();
    encoder.encode(&payload, &mut wire).unwrap();
    assert!(wire.len() < 1024);
}
