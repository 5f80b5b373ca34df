//! The post-handshake byte pump: two unidirectional copies with half-shutdown
//! propagation between them.
use crate::registry::{ClientInfo, Side, SHUT_RD, SHUT_WR};
use crate::Result;
use bytes::Bytes;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info};

/// Per-direction copy buffer. Reads never outrun writes by more than this,
/// which is the whole of the relay's flow control.
pub(crate) const RELAY_HALFBUFF: usize = 4096;

fn peer(side: Side) -> Side {
    match side {
        Side::Client => Side::Relay,
        Side::Relay => Side::Client,
    }
}

/// Relay bytes between the client socket and the upstream socket until both
/// directions saw EOF.
///
/// `to_client` and `to_relay` carry bytes the handshake already holds for
/// either side (the buffered HTTP reply head, over-read stream bytes); they
/// are delivered before anything else. A clean FIN on one side becomes a
/// `shutdown(SHUT_WR)` on the other once the direction is drained; any other
/// I/O error tears the client down.
pub(crate) async fn run<C, R>(
    client: C,
    relay: R,
    to_client: Bytes,
    to_relay: Bytes,
    info: &ClientInfo,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Send + Unpin,
    R: AsyncRead + AsyncWrite + Send + Unpin,
{
    info.mark_relaying();
    debug!("data relaying started");

    let (client_read, client_write) = tokio::io::split(client);
    let (relay_read, relay_write) = tokio::io::split(relay);

    tokio::try_join!(
        pump(client_read, relay_write, to_relay, info, Side::Client),
        pump(relay_read, client_write, to_client, info, Side::Relay),
    )?;

    debug!("both client and relay disconnected");
    Ok(())
}

/// One direction: read from `src`, write to the paired socket, convert EOF
/// into a half-shutdown of the destination.
async fn pump<SR, DW>(
    mut src: SR,
    mut dst: DW,
    prefix: Bytes,
    info: &ClientInfo,
    from: Side,
) -> Result<()>
where
    SR: AsyncRead + Unpin,
    DW: AsyncWrite + Unpin,
{
    if !prefix.is_empty() {
        if let Err(err) = dst.write_all(&prefix).await {
            info!(cause = %err, "{} write error", peer(from).name());
            return Err(err.into());
        }
        info.touch();
    }

    let mut buf = [0u8; RELAY_HALFBUFF];
    loop {
        let n = match src.read(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                info!(cause = %err, "{} read error", from.name());
                return Err(err.into());
            }
        };
        info.touch();
        if n == 0 {
            break;
        }
        if let Err(err) = dst.write_all(&buf[..n]).await {
            info!(cause = %err, "{} write error", peer(from).name());
            return Err(err.into());
        }
    }

    // EOF; every byte that preceded it has been written out, so the FIN may
    // be propagated now.
    info.mark_shut(from, SHUT_RD);
    match dst.shutdown().await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotConnected => {}
        Err(err) => {
            error!(cause = %err, "shutdown({}, SHUT_WR)", peer(from).name());
            return Err(err.into());
        }
    }
    info.mark_shut(peer(from), SHUT_WR);
    Ok(())
}
