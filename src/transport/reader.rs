use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt as _};
use crate::error::{Error, Result};
use super::decoder::Decoder;
use super::transport::Transport;

/// The input-pumping task: reads bytes from the connection, feeds the decoder, and hands every
/// decoded packet to the supervisor. A fatal error escalates through
/// [`Transport::die`]; after the close event is set the task just winds down.
pub(crate) async fn run(
    transport: Transport,
    mut stream: Box<dyn AsyncRead + Send + Unpin>,
    mut decoder: Decoder,
) {
    log::debug!("reader task started");
    match pump(&transport, &mut stream, &mut decoder).await {
        Ok(()) => log::debug!("reader task finished"),
        Err(error) => {
            if transport.inner.close.is_set() {
                log::debug!("reader error after close: {}", error);
            } else {
                transport.die(error).await;
            }
        },
    }
}

async fn pump(
    transport: &Transport,
    stream: &mut Box<dyn AsyncRead + Send + Unpin>,
    decoder: &mut Decoder,
) -> Result<()> {
    let closed = transport.inner.close.done();
    tokio::pin!(closed);

    loop {
        while let Some(packet) = decoder.consume_packet()? {
            transport.handle(packet, decoder).await?;
        }

        tokio::select! {
            _ = &mut closed => return Ok(()),
            read = stream.read_buf(decoder.feed_buf()) => {
                let len = read.map_err(|err| Error::ReadIo(Arc::new(err)))?;
                if len == 0 {
                    return Err(Error::PeerClosed)
                }
                log::trace!("read {} bytes", len);
            },
        }
    }
}
