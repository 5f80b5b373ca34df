//! SOCKS4 upstream handshake.
use crate::config::InstanceConfig;
use crate::{Connection, ConnectionStream, Error, Result};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddrV4;
use tracing::warn;

const VERSION: u8 = 4;
const CMD_CONNECT: u8 = 1;

const STATUS_GRANTED: u8 = 90;
const STATUS_REJECTED: u8 = 91;
const STATUS_NO_IDENT: u8 = 92;
const STATUS_IDENT_MISMATCH: u8 = 93;

const REPLY_LEN: usize = 8;

fn status_str(status: u8) -> &'static str {
    match status {
        STATUS_GRANTED => "request granted",
        STATUS_REJECTED => "request rejected or failed",
        STATUS_NO_IDENT => "request rejected, can't connect to ident",
        STATUS_IDENT_MISMATCH => "request rejected, ident mismatch",
        _ => "?",
    }
}

fn connect_request(dest: SocketAddrV4, login: Option<&str>) -> BytesMut {
    let login = login.unwrap_or("");
    let mut req = BytesMut::with_capacity(9 + login.len());
    req.put_u8(VERSION);
    req.put_u8(CMD_CONNECT);
    req.put_u16(dest.port());
    req.put_slice(&dest.ip().octets());
    req.put_slice(login.as_bytes());
    req.put_u8(0);
    req
}

/// Send the CONNECT request and wait for the 8-byte reply. Only status 90
/// lets the connection proceed to relaying.
pub(crate) async fn handshake<S: ConnectionStream>(
    conn: &mut Connection<S>,
    dest: SocketAddrV4,
    config: &InstanceConfig,
) -> Result<()> {
    if config.password.is_some() {
        warn!("password is ignored for socks4 connections");
    }

    conn.write_all(&connect_request(dest, config.login.as_deref()))
        .await?;
    conn.flush().await?;

    let reply = conn.read_exact(REPLY_LEN).await?;
    if reply[0] != 0 {
        return Err(Error::Protocol(format!(
            "socks4 server reported unexpected reply version {}",
            reply[0]
        )));
    }
    match reply[1] {
        STATUS_GRANTED => Ok(()),
        status => Err(Error::Protocol(format!(
            "socks4 server status: {} ({})",
            status_str(status),
            status
        ))),
    }
}
