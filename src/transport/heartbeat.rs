use rand::RngCore as _;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use crate::codec::PacketEncode;
use crate::codes::msg;
use super::transport::Transport;

/// The keepalive task: whenever `interval` passes without outbound traffic, send an
/// SSH_MSG_IGNORE with a small random payload. The packet goes through the ordinary write path,
/// so a keepalive that lands in the middle of a key exchange is held back naturally.
pub(crate) async fn run(transport: Transport, interval: Duration) {
    log::debug!("heartbeat task started with interval {:?}", interval);
    let closed = transport.inner.close.done();
    tokio::pin!(closed);

    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut closed => {
                log::debug!("heartbeat task finished");
                return
            },
            _ = ticker.tick() => {},
        }

        if transport.last_write_elapsed() < interval {
            continue
        }

        let mut data = [0; 16];
        rand::rngs::OsRng.fill_bytes(&mut data);
        let mut payload = PacketEncode::new();
        payload.put_u8(msg::IGNORE);
        payload.put_bytes(&data);

        if let Err(error) = transport.write(&payload.finish()).await {
            log::debug!("could not send keepalive: {}", error);
            return
        }
        log::trace!("sent keepalive SSH_MSG_IGNORE");
    }
}
