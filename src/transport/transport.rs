use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::task::JoinHandle;
use crate::codec::{PacketDecode, PacketEncode};
use crate::codes::{disconnect, msg};
use crate::error::{DisconnectError, Error, Result};
use super::config::TransportConfig;
use super::decoder::{Decoder, RecvPacket};
use super::encoder::Encoder;
use super::heartbeat;
use super::kexer::KeyExchanger;
use super::latch::Latch;
use super::reader;
use super::service::{HostKeyVerifier, NullService, Service};

/// A thread-safe client-side SSH transport (RFC 4253).
///
/// The transport performs the version exchange in [`init`][Transport::init], drives key exchange,
/// frames and encrypts packets, dispatches transport-level messages, and hands everything with a
/// message id of 50 or higher to the active [`Service`]. It is a cheap handle that can be cloned
/// and shared between tasks.
///
/// A typical session:
///
/// ```no_run
/// # async fn example(socket: tokio::net::TcpStream) -> minato::Result<()> {
/// let transport = minato::Transport::new(minato::TransportConfig::default());
/// transport.add_host_key_verifier(Box::new(|_host: &str, _port: u16, _key: &minato::Pubkey| true));
/// transport.init("example.com", 22, socket).await?;
/// transport.do_kex().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Transport {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: TransportConfig,
    pub(crate) client_ident: String,
    pub(crate) server_ident: Mutex<Option<String>>,
    pub(crate) conn: Mutex<Option<ConnInfo>>,
    pub(crate) write: tokio::sync::Mutex<Option<WriteEnd>>,
    pub(crate) kexer: KeyExchanger,
    pub(crate) authed: Arc<AtomicBool>,
    pub(crate) close: Latch,
    service: Mutex<Arc<dyn Service>>,
    service_accept: Latch,
    service_req: tokio::sync::Mutex<()>,
    closing: AtomicBool,
    last_msg: AtomicU8,
    recv_seq: AtomicU32,
    last_write: Arc<Mutex<Instant>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    heartbeater: Mutex<Option<JoinHandle<()>>>,
}

/// Remote endpoint of the connection, recorded once in `init`.
pub(crate) struct ConnInfo {
    pub host: String,
    pub port: u16,
}

/// The write half of the connection together with the encoder; everything that leaves the socket
/// goes through this struct while its mutex is held, which serializes writers and pins the
/// encoder state to the byte stream.
pub(crate) struct WriteEnd {
    stream: Box<dyn AsyncWrite + Send + Unpin>,
    pub(crate) encoder: Encoder,
    out: BytesMut,
    last_write: Arc<Mutex<Instant>>,
}

impl WriteEnd {
    pub(crate) async fn send_packet(&mut self, payload: &[u8]) -> Result<u32> {
        self.out.clear();
        let packet_seq = self.encoder.encode(payload, &mut self.out)?;
        self.stream.write_all(&self.out).await
            .map_err(|err| Error::WriteIo(Arc::new(err)))?;
        self.stream.flush().await
            .map_err(|err| Error::WriteIo(Arc::new(err)))?;
        *self.last_write.lock() = Instant::now();
        Ok(packet_seq)
    }

    async fn send_ident(&mut self, ident: &str) -> Result<()> {
        // RFC 4253, section 4.2
        self.stream.write_all(format!("{}\r\n", ident).as_bytes()).await
            .map_err(|err| Error::WriteIo(Arc::new(err)))?;
        self.stream.flush().await
            .map_err(|err| Error::WriteIo(Arc::new(err)))
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.stream.shutdown().await
    }
}

impl Inner {
    pub(crate) fn conn_info(&self) -> Option<(String, u16)> {
        self.conn.lock().as_ref().map(|conn| (conn.host.clone(), conn.port))
    }
}

impl Transport {
    pub fn new(config: TransportConfig) -> Transport {
        let client_ident = config.ident();
        Transport {
            inner: Arc::new(Inner {
                config,
                client_ident,
                server_ident: Mutex::new(None),
                conn: Mutex::new(None),
                write: tokio::sync::Mutex::new(None),
                kexer: KeyExchanger::new(),
                authed: Arc::new(AtomicBool::new(false)),
                close: Latch::new("transport close"),
                service: Mutex::new(Arc::new(NullService)),
                service_accept: Latch::new("service accept"),
                service_req: tokio::sync::Mutex::new(()),
                closing: AtomicBool::new(false),
                last_msg: AtomicU8::new(0),
                recv_seq: AtomicU32::new(0),
                last_write: Arc::new(Mutex::new(Instant::now())),
                reader: Mutex::new(None),
                heartbeater: Mutex::new(None),
            }),
        }
    }

    /// Perform the version exchange over `stream` and start the background tasks.
    ///
    /// Sends our identification string, then incrementally parses the server's banner (skipping
    /// MOTD lines), and finally spawns the reader task and, when configured, the keepalive task.
    /// Call [`do_kex`][Transport::do_kex] next.
    pub async fn init<IO>(&self, host: &str, port: u16, stream: IO) -> Result<()>
        where IO: AsyncRead + AsyncWrite + Send + 'static
    {
        let mut guard = self.inner.write.lock().await;
        if guard.is_some() {
            return Err(Error::Protocol("transport is already initialized"))
        }

        *self.inner.conn.lock() = Some(ConnInfo { host: host.into(), port });

        let (read_half, write_half) = tokio::io::split(stream);
        let mut write_end = WriteEnd {
            stream: Box::new(write_half),
            encoder: Encoder::new(self.inner.authed.clone())?,
            out: BytesMut::new(),
            last_write: self.inner.last_write.clone(),
        };
        let mut decoder = Decoder::new(self.inner.authed.clone());

        log::info!("client identification: {:?}", self.inner.client_ident);
        write_end.send_ident(&self.inner.client_ident).await?;

        let mut read_half: Box<dyn AsyncRead + Send + Unpin> = Box::new(read_half);
        let server_ident = loop {
            if let Some(ident) = decoder.consume_ident()? {
                break ident
            }
            let len = read_half.read_buf(decoder.feed_buf()).await
                .map_err(|err| Error::ReadIo(Arc::new(err)))?;
            if len == 0 {
                return Err(Error::PeerClosed)
            }
        };
        log::info!("server identification: {:?}", server_ident);
        *self.inner.server_ident.lock() = Some(server_ident);

        *guard = Some(write_end);
        drop(guard);

        *self.inner.reader.lock() =
            Some(tokio::spawn(reader::run(self.clone(), read_half, decoder)));
        if let Some(interval) = self.inner.config.heartbeat_interval {
            *self.inner.heartbeater.lock() =
                Some(tokio::spawn(heartbeat::run(self.clone(), interval)));
        }
        Ok(())
    }

    /// Register a verifier for the server host key. At least one verifier must accept the key
    /// during key exchange, otherwise the exchange fails.
    pub fn add_host_key_verifier(&self, verifier: Box<dyn HostKeyVerifier>) {
        self.inner.kexer.add_host_key_verifier(verifier);
    }

    /// Run a key exchange and wait for it to complete. Also used to rekey an established session.
    pub async fn do_kex(&self) -> Result<()> {
        self.inner.kexer.start_kex(&self.inner, true).await
    }

    pub fn is_kex_done(&self) -> bool {
        self.inner.kexer.is_kex_done()
    }

    /// The exchange hash of the first key exchange; `None` before the first exchange completes.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.inner.kexer.session_id()
    }

    /// Request `service` from the server and install it once the server accepts.
    ///
    /// Waits at most the configured timeout for SSH_MSG_SERVICE_ACCEPT; on elapse the call fails
    /// with [`Error::Timeout`] and the transport stays usable.
    pub async fn req_service(&self, service: Arc<dyn Service>) -> Result<()> {
        let _req_guard = self.inner.service_req.lock().await;
        self.inner.service_accept.clear();
        let accepted = self.inner.service_accept.wait();

        let mut payload = PacketEncode::new();
        payload.put_u8(msg::SERVICE_REQUEST);
        payload.put_str(service.name());
        log::debug!("sending SSH_MSG_SERVICE_REQUEST for {:?}", service.name());
        self.write(&payload.finish()).await?;

        match tokio::time::timeout(self.inner.config.timeout, accepted).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout("service accept")),
        }

        self.set_service(Some(service));
        Ok(())
    }

    /// Install `service` as the active service; `None` installs the discarding null service.
    pub fn set_service(&self, service: Option<Arc<dyn Service>>) {
        let service = service.unwrap_or_else(|| Arc::new(NullService));
        log::info!("setting active service to {:?}", service.name());
        *self.inner.service.lock() = service;
    }

    fn service(&self) -> Arc<dyn Service> {
        self.inner.service.lock().clone()
    }

    /// Mark the session as authenticated. The flag never reverts; it arms delayed compression
    /// ("zlib@openssh.com") in both directions.
    pub fn set_authenticated(&self) {
        log::debug!("marking transport as authenticated");
        self.inner.authed.store(true, Ordering::Relaxed);
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.authed.load(Ordering::Relaxed)
    }

    /// Encrypt and send one packet, returning the sequence number it was assigned.
    ///
    /// While a key exchange is in flight only transport-control payloads may pass; anything else
    /// waits for the exchange to finish. When the outbound sequence number wraps to 0, a rekey is
    /// started first and the packet is sent under the new keys.
    pub async fn write(&self, payload: &[u8]) -> Result<u32> {
        let msg_id = *payload.first()
            .ok_or(Error::Protocol("cannot send an empty packet"))?;

        loop {
            if self.inner.close.is_set() {
                return Err(self.inner.close.error().unwrap_or(Error::TransportClosed))
            }

            let mut guard = self.inner.write.lock().await;
            let w = guard.as_mut().ok_or(Error::Protocol("transport is not initialized"))?;

            if self.inner.kexer.is_kex_ongoing() {
                if !allowed_during_kex(msg_id) {
                    // release the lock while we wait, then re-check from scratch
                    drop(guard);
                    self.inner.kexer.wait_for_done(self.inner.config.timeout).await?;
                    continue;
                }
            } else if w.encoder.seq() == 0 {
                // we get here every 2^32-th packet
                self.inner.kexer.start_kex_locked(&self.inner, w).await?;
                drop(guard);
                self.inner.kexer.wait_for_done(self.inner.config.timeout).await?;
                continue;
            }

            match w.send_packet(payload).await {
                Ok(packet_seq) => return Ok(packet_seq),
                Err(error) => {
                    drop(guard);
                    self.die(error.clone()).await;
                    return Err(error)
                },
            }
        }
    }

    /// Tell the peer that its last packet was not understood.
    pub async fn send_unimplemented(&self) -> Result<u32> {
        let packet_seq = self.inner.recv_seq.load(Ordering::Relaxed);
        log::debug!("sending SSH_MSG_UNIMPLEMENTED for packet seq {}", packet_seq);
        let mut payload = PacketEncode::new();
        payload.put_u8(msg::UNIMPLEMENTED);
        payload.put_u32(packet_seq);
        self.write(&payload.finish()).await
    }

    /// Close the session with reason "by application".
    pub async fn disconnect(&self) {
        self.disconnect_with(disconnect::BY_APPLICATION, "").await
    }

    /// Close the session: notify the service, send SSH_MSG_DISCONNECT best-effort, stop the
    /// background tasks and set the close event. Only the first of racing
    /// `disconnect`/`die` calls performs the shutdown.
    pub async fn disconnect_with(&self, reason_code: u32, description: &str) {
        if !self.begin_close() {
            return
        }
        log::debug!("disconnecting: reason={}, msg={:?}", reason_code, description);

        if let Err(error) = self.service().notify_disconnect() {
            log::warn!("service did not handle disconnect cleanly: {}", error);
        }

        self.send_disconnect_packet(reason_code, description).await;
        self.finish_off().await;
        self.inner.close.set();
    }

    /// Wait for the close event; returns the error that killed the transport, if any.
    pub async fn join(&self) -> Result<()> {
        self.inner.close.wait().await
    }

    /// True while the reader task is alive and the close event is not set.
    pub fn is_running(&self) -> bool {
        let reader_alive = self.inner.reader.lock().as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false);
        reader_alive && !self.inner.close.is_set()
    }

    /// The software version we announce, without the "SSH-2.0-" prefix.
    pub fn client_version(&self) -> String {
        self.inner.config.version.clone()
    }

    /// The software version the server announced, without the "SSH-x.y-" prefix.
    pub fn server_version(&self) -> Option<String> {
        self.inner.server_ident.lock().as_ref()
            .map(|ident| ident.splitn(3, '-').nth(2).unwrap_or("").into())
    }

    pub fn remote_host(&self) -> Option<String> {
        self.inner.conn_info().map(|(host, _)| host)
    }

    pub fn remote_port(&self) -> Option<u16> {
        self.inner.conn_info().map(|(_, port)| port)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub(crate) fn last_write_elapsed(&self) -> Duration {
        self.inner.last_write.lock().elapsed()
    }

    /// Dispatch one decoded packet. Runs on the reader task; an error return kills the
    /// transport.
    pub(crate) async fn handle(&self, packet: RecvPacket, decoder: &mut Decoder) -> Result<()> {
        let mut payload = PacketDecode::new(packet.payload.clone());
        let msg_id = payload.get_u8()?;
        self.inner.last_msg.store(msg_id, Ordering::Relaxed);
        self.inner.recv_seq.store(packet.packet_seq, Ordering::Relaxed);
        log::trace!("received packet {}, seq {}", msg_id, packet.packet_seq);

        match msg_id {
            msg::DISCONNECT => self.recv_disconnect(&mut payload),
            msg::IGNORE => {
                log::debug!("received SSH_MSG_IGNORE");
                Ok(())
            },
            msg::UNIMPLEMENTED => self.recv_unimplemented(&mut payload),
            msg::DEBUG => self.recv_debug(&mut payload),
            msg::SERVICE_ACCEPT => self.recv_service_accept(&mut payload),
            msg::KEXINIT | msg::NEWKEYS | 30..=49 =>
                self.inner.kexer.handle(msg_id, &mut payload, &self.inner, decoder).await,
            50..=u8::MAX => self.service().handle(msg_id, &mut payload),
            _ => self.reply_unimplemented(packet.packet_seq).await,
        }
    }

    fn recv_disconnect(&self, payload: &mut PacketDecode) -> Result<()> {
        let disconnect = DisconnectError {
            reason_code: payload.get_u32()?,
            description: payload.get_string()?,
            description_lang: payload.get_string()?,
        };
        log::debug!("received SSH_MSG_DISCONNECT: {:?}", disconnect);
        Err(Error::PeerDisconnected(disconnect))
    }

    fn recv_unimplemented(&self, payload: &mut PacketDecode) -> Result<()> {
        let packet_seq = payload.get_u32()?;
        log::debug!("received SSH_MSG_UNIMPLEMENTED for packet seq {}", packet_seq);
        if self.inner.kexer.is_kex_ongoing() {
            return Err(Error::Protocol("received SSH_MSG_UNIMPLEMENTED during key exchange"))
        }
        self.service().notify_unimplemented(packet_seq)
    }

    fn recv_debug(&self, payload: &mut PacketDecode) -> Result<()> {
        let always_display = payload.get_bool()?;
        let message = payload.get_string()?;
        log::debug!("received SSH_MSG_DEBUG (display={}): {:?}", always_display, message);
        Ok(())
    }

    fn recv_service_accept(&self, payload: &mut PacketDecode) -> Result<()> {
        if payload.remaining_len() > 0 {
            let name = payload.get_string()?;
            log::debug!("received SSH_MSG_SERVICE_ACCEPT for {:?}", name);
        }
        if self.inner.service_accept.waiter_count() == 0 {
            return Err(Error::Protocol("received SSH_MSG_SERVICE_ACCEPT that nobody awaited"))
        }
        self.inner.service_accept.set();
        Ok(())
    }

    async fn reply_unimplemented(&self, packet_seq: u32) -> Result<()> {
        log::debug!("replying with SSH_MSG_UNIMPLEMENTED to packet seq {}", packet_seq);
        let mut payload = PacketEncode::new();
        payload.put_u8(msg::UNIMPLEMENTED);
        payload.put_u32(packet_seq);
        self.write(&payload.finish()).await?;
        Ok(())
    }

    /// Kill the transport with `error`: wake every waiter with the error, notify the key
    /// exchanger and the active service, send a final SSH_MSG_DISCONNECT when it makes sense,
    /// and set the close event. A transport that already closed ignores the call.
    pub(crate) async fn die(&self, error: Error) {
        if !self.begin_close() {
            log::debug!("transport already closing, ignoring error: {}", error);
            return
        }
        log::error!("transport is dying: {}", error);

        self.inner.service_accept.fail(error.clone());
        self.inner.kexer.notify_error(error.clone());
        self.service().notify_error(&error);
        self.set_service(None);

        // do not echo a DISCONNECT back at the peer, and stay quiet when we have no reason to give
        let got_disconnect = self.inner.last_msg.load(Ordering::Relaxed) == msg::DISCONNECT;
        let reason_code = error.disconnect_reason();
        if !got_disconnect && reason_code != disconnect::UNKNOWN {
            self.send_disconnect_packet(reason_code, &error.to_string()).await;
        }

        self.finish_off().await;
        self.inner.close.fail(error);
    }

    fn begin_close(&self) -> bool {
        self.inner.closing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    async fn send_disconnect_packet(&self, reason_code: u32, description: &str) {
        log::debug!("sending SSH_MSG_DISCONNECT: reason={}, msg={:?}", reason_code, description);
        let mut payload = PacketEncode::new();
        payload.put_u8(msg::DISCONNECT);
        payload.put_u32(reason_code);
        payload.put_str(description);
        payload.put_str("");
        let payload = payload.finish();

        // best effort: go straight through the write mutex, the transport may be in any state
        let mut guard = self.inner.write.lock().await;
        if let Some(w) = guard.as_mut() {
            if let Err(error) = w.send_packet(&payload).await {
                log::warn!("could not send SSH_MSG_DISCONNECT: {}", error);
            }
        }
    }

    async fn finish_off(&self) {
        if let Some(handle) = self.inner.heartbeater.lock().take() {
            handle.abort();
        }

        let mut guard = self.inner.write.lock().await;
        if let Some(w) = guard.as_mut() {
            if let Err(error) = w.shutdown().await {
                log::debug!("error shutting down the write half: {}", error);
            }
        }
        // the reader task exits on its own once the close latch is set
    }
}

/// While a key exchange is in flight, only transport-control messages may leave, and
/// SSH_MSG_SERVICE_REQUEST is explicitly excluded.
fn allowed_during_kex(msg_id: u8) -> bool {
    (1..=49).contains(&msg_id) && msg_id != msg::SERVICE_REQUEST
}
