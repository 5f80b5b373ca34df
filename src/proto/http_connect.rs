//! HTTP CONNECT upstream handshake, with one proxy-auth retry on `407`.
use super::{find_proxy_authenticate, parse_status_code, skip_headers, Outcome};
use crate::auth::{self, AuthState};
use crate::config::InstanceConfig;
use crate::{Connection, ConnectionStream, Error, Result};
use std::net::SocketAddrV4;

/// Run one CONNECT attempt on a freshly connected upstream socket.
///
/// On [`Outcome::RetryAuth`] the challenge from the `407` reply has been
/// stored in `auth` and the caller must close this socket, reconnect and call
/// again with `retried = true`; a second `407` is then fatal.
pub(crate) async fn attempt<S: ConnectionStream>(
    conn: &mut Connection<S>,
    dest: SocketAddrV4,
    config: &InstanceConfig,
    auth: &AuthState,
    retried: bool,
) -> Result<Outcome> {
    let (challenge, count) = auth.next_attempt();
    let target = format!("{}:{}", dest.ip(), dest.port());

    conn.write_all(format!("CONNECT {target} HTTP/1.0\r\n").as_bytes())
        .await?;
    if let (Some(challenge), Some(login), Some(password)) =
        (&challenge, &config.login, &config.password)
    {
        if let Some(authorization) =
            auth::proxy_authorization(challenge, login, password, "CONNECT", &target, count)
        {
            conn.write_all(format!("Proxy-Authorization: {authorization}\r\n").as_bytes())
                .await?;
        }
    }
    conn.write_all(b"\r\n").await?;
    conn.flush().await?;

    let line = conn.read_line().await?;
    let code = parse_status_code(&line)
        .ok_or_else(|| Error::Protocol(format!("malformed status line from proxy: {line}")))?;

    match code {
        200..=299 => {
            skip_headers(conn).await?;
            Ok(Outcome::Established)
        }
        407 => {
            handle_auth_required(conn, config, auth, retried).await?;
            Ok(Outcome::RetryAuth)
        }
        _ => Err(Error::Protocol(line)),
    }
}

/// Shared `407` handling for both HTTP modes: bounds the retry, captures the
/// challenge, decides whether reconnecting is worthwhile. `Ok(())` means a
/// retry with credentials is in order.
pub(super) async fn handle_auth_required<S: ConnectionStream>(
    conn: &mut Connection<S>,
    config: &InstanceConfig,
    auth: &AuthState,
    retried: bool,
) -> Result<()> {
    if retried {
        return Err(Error::Protocol("proxy auth failed".into()));
    }
    if config.login.is_none() || config.password.is_none() {
        return Err(Error::Protocol(
            "proxy auth required, but no login information provided".into(),
        ));
    }
    match find_proxy_authenticate(conn).await? {
        Some(challenge) => {
            auth.store_challenge(challenge);
            Ok(())
        }
        None => Err(Error::Protocol(
            "407 found, but no proxy auth challenge".into(),
        )),
    }
}
