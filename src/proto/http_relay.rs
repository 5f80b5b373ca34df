//! Transparent HTTP relaying: the captured connection carries plain HTTP and
//! the upstream is a forward proxy, so each request line is rewritten to
//! absolute-URI form before forwarding.
use super::{header_value, http_connect::handle_auth_required, parse_status_code};
use crate::auth::{self, AuthState};
use crate::config::InstanceConfig;
use crate::{Connection, ConnectionStream, Error, Result};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddrV4;

/// The client's request after header capture, ready to be (re)played against
/// the upstream proxy.
#[derive(Debug)]
pub(crate) struct RewrittenRequest {
    /// Request line with the URI rewritten to `http://<host><path>` form.
    firstline: String,
    /// Header block, hop-by-hop headers replaced, terminated by a blank line.
    headers: BytesMut,
    /// Request body bytes seen so far; grows while the upstream reply is
    /// pending so a proxy-auth retry can replay them.
    body: BytesMut,
}

/// How one upstream attempt ended.
#[derive(Debug)]
pub(crate) enum RelayOutcome {
    /// The proxy answered; its status line and headers are in `reply_head`,
    /// ready to be forwarded to the client before relaying starts.
    Established { reply_head: BytesMut },
    /// The proxy demanded authentication; reconnect and try once more.
    RetryAuth,
}

/// `<ip>` when the destination port is 80, `<ip>:<port>` otherwise.
fn fmt_http_host(addr: SocketAddrV4) -> String {
    if addr.port() == 80 {
        addr.ip().to_string()
    } else {
        addr.to_string()
    }
}

fn rewrite_firstline(line: &str, host: &str) -> Result<String> {
    let space = line
        .find(' ')
        .ok_or_else(|| Error::Protocol(format!("malformed request line: {line}")))?;
    let (method, rest) = line.split_at(space);
    let uri = &rest[1..];
    if uri.starts_with("http://") {
        return Ok(line.to_string());
    }
    Ok(format!("{method} http://{host}{uri}"))
}

fn method_and_uri(firstline: &str) -> Result<(&str, &str)> {
    let mut words = firstline.split_whitespace();
    match (words.next(), words.next()) {
        (Some(method), Some(uri)) => Ok((method, uri)),
        _ => Err(Error::Protocol(format!(
            "malformed request line: {firstline}"
        ))),
    }
}

/// Read the client's request headers and rewrite them for the proxy.
///
/// The first line's URI becomes absolute (preferring the client's `Host`
/// value, falling back to the discovered destination), a `Host` header is
/// synthesized when the client sent none, hop-by-hop `Connection` /
/// `Proxy-Connection` headers are replaced with `close`.
pub(crate) async fn read_request<S: ConnectionStream>(
    conn: &mut Connection<S>,
    dest: SocketAddrV4,
) -> Result<RewrittenRequest> {
    let mut firstline: Option<String> = None;
    let mut host: Option<String> = None;
    let mut headers = BytesMut::new();

    loop {
        let line = conn.read_line().await.map_err(|err| match err {
            Error::UnexpectedEof => Error::ClientGone,
            err => err,
        })?;
        if line.is_empty() {
            break;
        }
        if firstline.is_none() {
            firstline = Some(line);
            continue;
        }
        if header_value(&line, "Proxy-Connection").is_some()
            || header_value(&line, "Connection").is_some()
        {
            continue;
        }
        if let Some(value) = header_value(&line, "Host") {
            host = Some(value.to_string());
        }
        headers.extend_from_slice(line.as_bytes());
        headers.extend_from_slice(b"\r\n");
    }

    let firstline = firstline.ok_or_else(|| Error::Protocol("malformed request came".into()))?;
    let rewrite_host = host.clone().unwrap_or_else(|| fmt_http_host(dest));
    let firstline = rewrite_firstline(&firstline, &rewrite_host)?;
    if host.is_none() {
        headers.extend_from_slice(format!("Host: {}\r\n", fmt_http_host(dest)).as_bytes());
    }
    headers.extend_from_slice(b"Proxy-Connection: close\r\nConnection: close\r\n\r\n");

    Ok(RewrittenRequest {
        firstline,
        headers,
        body: BytesMut::new(),
    })
}

enum Event {
    Line(String),
    Chunk(Option<Bytes>),
}

/// Play the rewritten request against a freshly connected upstream and read
/// its reply head. Request body bytes keep streaming from the client while
/// the reply is pending; they are also retained on the request so a
/// [`RelayOutcome::RetryAuth`] replay carries them again.
pub(crate) async fn attempt<C, U>(
    client: &mut Connection<C>,
    upstream: &mut Connection<U>,
    req: &mut RewrittenRequest,
    config: &InstanceConfig,
    auth: &AuthState,
    retried: bool,
) -> Result<RelayOutcome>
where
    C: ConnectionStream,
    U: ConnectionStream,
{
    let (challenge, count) = auth.next_attempt();

    upstream.write_all(req.firstline.as_bytes()).await?;
    upstream.write_all(b"\r\n").await?;
    if let (Some(challenge), Some(login), Some(password)) =
        (&challenge, &config.login, &config.password)
    {
        let (method, uri) = method_and_uri(&req.firstline)?;
        if let Some(authorization) =
            auth::proxy_authorization(challenge, login, password, method, uri, count)
        {
            upstream
                .write_all(format!("Proxy-Authorization: {authorization}\r\n").as_bytes())
                .await?;
        }
    }
    upstream.write_all(&req.headers).await?;
    upstream.write_all(&req.body).await?;
    upstream.flush().await?;

    let mut client_eof = false;
    let mut reply_head = BytesMut::new();
    let mut status: Option<u16> = None;

    loop {
        let event = tokio::select! {
            line = upstream.read_line() => Event::Line(line?),
            chunk = client.read_some(), if !client_eof => Event::Chunk(chunk?),
        };
        match event {
            Event::Line(line) => {
                reply_head.extend_from_slice(line.as_bytes());
                reply_head.extend_from_slice(b"\r\n");
                match status {
                    None => {
                        let code = parse_status_code(&line).ok_or_else(|| {
                            Error::Protocol(format!("malformed status line from proxy: {line}"))
                        })?;
                        if code == 407 {
                            handle_auth_required(upstream, config, auth, retried).await?;
                            return Ok(RelayOutcome::RetryAuth);
                        }
                        status = Some(code);
                    }
                    Some(_) if line.is_empty() => {
                        return Ok(RelayOutcome::Established { reply_head });
                    }
                    Some(_) => {}
                }
            }
            Event::Chunk(Some(chunk)) => {
                req.body.extend_from_slice(&chunk);
                upstream.write_all(&chunk).await?;
                upstream.flush().await?;
            }
            Event::Chunk(None) => {
                // Client sent its FIN; propagate once the request is out and
                // keep waiting for the reply.
                client_eof = true;
                upstream.shutdown_write().await?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyKind;

    fn dest_80() -> SocketAddrV4 {
        SocketAddrV4::new([93, 184, 216, 34].into(), 80)
    }

    fn config() -> InstanceConfig {
        let mut config = InstanceConfig::new(
            SocketAddrV4::new([127, 0, 0, 1].into(), 12345),
            SocketAddrV4::new([127, 0, 0, 1].into(), 3128),
            ProxyKind::HttpRelay,
        );
        config.login = Some("u".to_string());
        config.password = Some("p".to_string());
        config
    }

    async fn request_from(raw: &[u8], dest: SocketAddrV4) -> RewrittenRequest {
        let stream = tokio_test::io::Builder::new().read(raw).build();
        let mut conn = Connection::new(stream);
        read_request(&mut conn, dest).await.unwrap()
    }

    #[tokio::test]
    async fn rewrites_uri_with_client_host() {
        let req = request_from(
            b"GET /foo HTTP/1.1\r\nHost: www.example.com\r\n\r\n",
            dest_80(),
        )
        .await;

        assert_eq!(req.firstline, "GET http://www.example.com/foo HTTP/1.1");
        let headers = String::from_utf8_lossy(&req.headers).into_owned();
        assert!(headers.contains("Host: www.example.com\r\n"));
        assert!(headers.contains("Proxy-Connection: close\r\n"));
        assert!(headers.contains("Connection: close\r\n"));
        assert!(headers.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn synthesizes_host_from_destination() {
        let req = request_from(b"GET /foo HTTP/1.1\r\n\r\n", dest_80()).await;

        assert_eq!(req.firstline, "GET http://93.184.216.34/foo HTTP/1.1");
        let headers = String::from_utf8_lossy(&req.headers).into_owned();
        assert!(headers.contains("Host: 93.184.216.34\r\n"));
    }

    #[tokio::test]
    async fn non_default_port_is_kept_in_host() {
        let dest = SocketAddrV4::new([93, 184, 216, 34].into(), 8080);
        let req = request_from(b"GET / HTTP/1.1\r\n\r\n", dest).await;

        assert_eq!(req.firstline, "GET http://93.184.216.34:8080/ HTTP/1.1");
        let headers = String::from_utf8_lossy(&req.headers).into_owned();
        assert!(headers.contains("Host: 93.184.216.34:8080\r\n"));
    }

    #[tokio::test]
    async fn absolute_uri_is_left_alone() {
        let req = request_from(
            b"GET http://other.example/ HTTP/1.1\r\nHost: www.example.com\r\n\r\n",
            dest_80(),
        )
        .await;

        assert_eq!(req.firstline, "GET http://other.example/ HTTP/1.1");
    }

    #[tokio::test]
    async fn drops_hop_by_hop_headers() {
        let req = request_from(
            b"GET /foo HTTP/1.1\r\nHost: h\r\nProxy-Connection: keep-alive\r\nConnection: keep-alive\r\nUser-Agent: x\r\n\r\n",
            dest_80(),
        )
        .await;

        let headers = String::from_utf8_lossy(&req.headers).into_owned();
        assert!(!headers.contains("keep-alive"));
        assert!(headers.contains("User-Agent: x\r\n"));
    }

    #[tokio::test]
    async fn eof_before_headers_end_is_client_gone() {
        let stream = tokio_test::io::Builder::new()
            .read(b"GET /foo HTTP/1.1\r\n")
            .build();
        let mut conn = Connection::new(stream);

        assert!(matches!(
            read_request(&mut conn, dest_80()).await,
            Err(Error::ClientGone)
        ));
    }

    fn upstream_request(req: &RewrittenRequest) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(req.firstline.as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&req.headers);
        out
    }

    #[tokio::test]
    async fn forwards_reply_head_on_success() {
        let mut req = request_from(
            b"GET /foo HTTP/1.1\r\nHost: www.example.com\r\n\r\n",
            dest_80(),
        )
        .await;

        let reply = b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n";
        let upstream = tokio_test::io::Builder::new()
            .write(&upstream_request(&req))
            .read(reply)
            .build();
        let mut upstream = Connection::new(upstream);

        let (client_io, _keep_alive) = tokio::io::duplex(64);
        let mut client = Connection::new(client_io);

        let outcome = attempt(
            &mut client,
            &mut upstream,
            &mut req,
            &config(),
            &AuthState::default(),
            false,
        )
        .await
        .unwrap();

        match outcome {
            RelayOutcome::Established { reply_head } => {
                assert_eq!(&reply_head[..], &reply[..]);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn streams_pipelined_body_before_reply() {
        let mut req = request_from(
            b"POST /submit HTTP/1.1\r\nHost: h\r\nContent-Length: 4\r\n\r\n",
            dest_80(),
        )
        .await;

        let upstream = tokio_test::io::Builder::new()
            .write(&upstream_request(&req))
            .write(b"ping")
            .read(b"HTTP/1.1 200 OK\r\n\r\n")
            .build();
        let mut upstream = Connection::new(upstream);

        let (client_io, mut client_end) = tokio::io::duplex(64);
        let mut client = Connection::new(client_io);
        tokio::io::AsyncWriteExt::write_all(&mut client_end, b"ping")
            .await
            .unwrap();

        let outcome = attempt(
            &mut client,
            &mut upstream,
            &mut req,
            &config(),
            &AuthState::default(),
            false,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, RelayOutcome::Established { .. }));
        // retained for a potential auth replay
        assert_eq!(&req.body[..], b"ping");
    }

    #[tokio::test]
    async fn retries_with_credentials_after_407() {
        let mut req = request_from(
            b"GET /foo HTTP/1.1\r\nHost: www.example.com\r\n\r\n",
            dest_80(),
        )
        .await;
        let auth = AuthState::default();
        let config = config();

        let first = tokio_test::io::Builder::new()
            .write(&upstream_request(&req))
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"r\"\r\n\r\n")
            .build();
        let mut first = Connection::new(first);
        let (client_io, _keep_alive) = tokio::io::duplex(64);
        let mut client = Connection::new(client_io);

        let outcome = attempt(&mut client, &mut first, &mut req, &config, &auth, false)
            .await
            .unwrap();
        assert!(matches!(outcome, RelayOutcome::RetryAuth));

        let mut authorized = Vec::new();
        authorized.extend_from_slice(req.firstline.as_bytes());
        authorized.extend_from_slice(b"\r\n");
        authorized.extend_from_slice(
            format!(
                "Proxy-Authorization: Basic {}\r\n",
                auth::basic_authentication_encode("u", "p")
            )
            .as_bytes(),
        );
        authorized.extend_from_slice(&req.headers);

        let second = tokio_test::io::Builder::new()
            .write(&authorized)
            .read(b"HTTP/1.1 200 OK\r\n\r\n")
            .build();
        let mut second = Connection::new(second);

        let outcome = attempt(&mut client, &mut second, &mut req, &config, &auth, true)
            .await
            .unwrap();
        assert!(matches!(outcome, RelayOutcome::Established { .. }));
        assert_eq!(auth.attempt_count(), 2);
    }

    #[tokio::test]
    async fn second_407_is_fatal() {
        let mut req = request_from(b"GET /foo HTTP/1.1\r\nHost: h\r\n\r\n", dest_80()).await;
        let auth = AuthState::default();
        auth.store_challenge("Basic realm=\"r\"".to_string());
        auth.next_attempt();

        let mut authorized = Vec::new();
        authorized.extend_from_slice(req.firstline.as_bytes());
        authorized.extend_from_slice(b"\r\n");
        authorized.extend_from_slice(
            format!(
                "Proxy-Authorization: Basic {}\r\n",
                auth::basic_authentication_encode("u", "p")
            )
            .as_bytes(),
        );
        authorized.extend_from_slice(&req.headers);

        let upstream = tokio_test::io::Builder::new()
            .write(&authorized)
            .read(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
            .build();
        let mut upstream = Connection::new(upstream);
        let (client_io, _keep_alive) = tokio::io::duplex(64);
        let mut client = Connection::new(client_io);

        let err = attempt(&mut client, &mut upstream, &mut req, &config(), &auth, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("proxy auth failed"));
    }
}
