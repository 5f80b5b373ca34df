//! SOCKS5 upstream handshake (RFC 1928), with optional username/password
//! sub-negotiation (RFC 1929).
use crate::config::InstanceConfig;
use crate::{Connection, ConnectionStream, Error, Result};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddrV4;
use tracing::warn;

const VERSION: u8 = 5;
const CMD_CONNECT: u8 = 1;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_INVALID: u8 = 0xff;

const PASSWORD_VERSION: u8 = 1;
const PASSWORD_PASSED: u8 = 0;

const ADDRTYPE_IPV4: u8 = 1;
const ADDRTYPE_DOMAIN: u8 = 3;
const ADDRTYPE_IPV6: u8 = 4;

const STATUS_SUCCEEDED: u8 = 0;

const STRSTATUS: [&str; 9] = [
    "ok",
    "server failure",
    "connection not allowed by ruleset",
    "network unreachable",
    "host unreachable",
    "connection refused",
    "TTL expired",
    "command not supported",
    "address type not supported",
];

fn status_str(status: u8) -> &'static str {
    STRSTATUS.get(status as usize).copied().unwrap_or("?")
}

/// Password auth is attempted only when both credentials are configured and
/// each fits the one-byte length field of RFC 1929.
fn valid_credentials(config: &InstanceConfig) -> bool {
    let (Some(login), Some(password)) = (&config.login, &config.password) else {
        return false;
    };
    if login.len() > 255 {
        warn!("socks5 login can't be more than 255 bytes, ignoring credentials");
        return false;
    }
    if password.len() > 255 {
        warn!("socks5 password can't be more than 255 bytes, ignoring credentials");
        return false;
    }
    true
}

fn method_request(do_password: bool) -> BytesMut {
    let mut req = BytesMut::with_capacity(3 + do_password as usize);
    req.put_u8(VERSION);
    req.put_u8(1 + do_password as u8);
    req.put_u8(AUTH_NONE);
    if do_password {
        req.put_u8(AUTH_PASSWORD);
    }
    req
}

fn password_request(login: &str, password: &str) -> BytesMut {
    let mut req = BytesMut::with_capacity(3 + login.len() + password.len());
    req.put_u8(PASSWORD_VERSION);
    req.put_u8(login.len() as u8);
    req.put_slice(login.as_bytes());
    req.put_u8(password.len() as u8);
    req.put_slice(password.as_bytes());
    req
}

fn connect_request(dest: SocketAddrV4) -> BytesMut {
    let mut req = BytesMut::with_capacity(10);
    req.put_u8(VERSION);
    req.put_u8(CMD_CONNECT);
    req.put_u8(0); // reserved
    req.put_u8(ADDRTYPE_IPV4);
    req.put_slice(&dest.ip().octets());
    req.put_u16(dest.port());
    req
}

/// Drive the full method / auth / CONNECT exchange. The bound-address tail
/// of the final reply is consumed before returning, so no byte of the
/// relayed stream is eaten by the handshake.
pub(crate) async fn handshake<S: ConnectionStream>(
    conn: &mut Connection<S>,
    dest: SocketAddrV4,
    config: &InstanceConfig,
) -> Result<()> {
    let do_password = valid_credentials(config);

    conn.write_all(&method_request(do_password)).await?;
    conn.flush().await?;

    let reply = conn.read_exact(2).await?;
    if reply[0] != VERSION {
        return Err(Error::Protocol(format!(
            "socks5 server reported unexpected auth methods reply version {}",
            reply[0]
        )));
    }
    match reply[1] {
        AUTH_NONE => {}
        AUTH_PASSWORD if do_password => {
            let (login, password) = (
                config.login.as_deref().unwrap_or_default(),
                config.password.as_deref().unwrap_or_default(),
            );
            conn.write_all(&password_request(login, password)).await?;
            conn.flush().await?;

            let reply = conn.read_exact(2).await?;
            if reply[0] != PASSWORD_VERSION {
                return Err(Error::Protocol(format!(
                    "socks5 server reported unexpected auth reply version {}",
                    reply[0]
                )));
            }
            if reply[1] != PASSWORD_PASSED {
                return Err(Error::Protocol(format!(
                    "socks5 server rejected password auth, status {}",
                    reply[1]
                )));
            }
        }
        AUTH_INVALID => {
            return Err(Error::Protocol(
                "socks5 server refused all our auth methods".into(),
            ));
        }
        method => {
            return Err(Error::Protocol(format!(
                "socks5 server requested unexpected auth method {method}"
            )));
        }
    }

    conn.write_all(&connect_request(dest)).await?;
    conn.flush().await?;

    // ver, status, reserved, addrtype
    let reply = conn.read_exact(4).await?;
    if reply[0] != VERSION {
        return Err(Error::Protocol(format!(
            "socks5 server reported unexpected reply version {}",
            reply[0]
        )));
    }
    if reply[1] != STATUS_SUCCEEDED {
        return Err(Error::Protocol(format!(
            "socks5 server status: {} ({})",
            status_str(reply[1]),
            reply[1]
        )));
    }

    // Skip the bound address so it is not delivered as application data.
    match reply[3] {
        ADDRTYPE_IPV4 => conn.skip(4 + 2).await,
        ADDRTYPE_IPV6 => conn.skip(16 + 2).await,
        ADDRTYPE_DOMAIN => {
            let len = conn.read_exact(1).await?[0] as usize;
            conn.skip(len + 2).await
        }
        addrtype => Err(Error::Protocol(format!(
            "socks5 server reported unexpected address type {addrtype}"
        ))),
    }
}
