//! Upstream proxy handshakes, one submodule per protocol.
//!
//! Each handshake is a sequential state machine over a
//! [`Connection`](crate::Connection); the relay engine takes over only after
//! a handshake resolves. The HTTP modes share the status-line parsing and
//! `Proxy-Authenticate` scanning below.
use crate::{Connection, ConnectionStream, Result};

pub(crate) mod http_connect;
pub(crate) mod http_relay;
pub(crate) mod socks4;
pub(crate) mod socks5;

/// How one upstream handshake attempt ended for the HTTP modes.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Handshake complete; the relay engine may be engaged.
    Established,
    /// The proxy demanded authentication and a usable challenge was stored;
    /// the caller must reconnect and run one more attempt.
    RetryAuth,
}

/// Extract the status code from `HTTP/x.y <code> ...`.
pub(crate) fn parse_status_code(line: &str) -> Option<u16> {
    let mut words = line.split_whitespace();
    let version = words.next()?;
    if !version.starts_with("HTTP/") {
        return None;
    }
    words.next()?.parse().ok()
}

/// If `line` is a `name: value` header with the given name (ASCII
/// case-insensitive), return the value with surrounding whitespace trimmed.
pub(crate) fn header_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let (found, value) = line.split_once(':')?;
    if found.trim().eq_ignore_ascii_case(name) {
        Some(value.trim())
    } else {
        None
    }
}

/// Scan header lines for the first `Proxy-Authenticate` value. Stops at the
/// blank line terminating the header block, or at a line that is not a
/// header at all.
pub(crate) async fn find_proxy_authenticate<S: ConnectionStream>(
    conn: &mut Connection<S>,
) -> Result<Option<String>> {
    loop {
        let line = conn.read_line().await?;
        if line.is_empty() || !line.contains(':') {
            return Ok(None);
        }
        if let Some(value) = header_value(&line, "Proxy-Authenticate") {
            return Ok(Some(value.to_string()));
        }
    }
}

/// Discard header lines up to and including the terminating blank line.
pub(crate) async fn skip_headers<S: ConnectionStream>(conn: &mut Connection<S>) -> Result<()> {
    while !conn.read_line().await?.is_empty() {}
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_lines() {
        assert_eq!(
            parse_status_code("HTTP/1.0 200 Connection established"),
            Some(200)
        );
        assert_eq!(
            parse_status_code("HTTP/1.1 407 Proxy Authentication Required"),
            Some(407)
        );
        assert_eq!(parse_status_code("HTTP/1.0 200"), Some(200));
        assert_eq!(parse_status_code("ICY 200 OK"), None);
        assert_eq!(parse_status_code("HTTP/1.0"), None);
        assert_eq!(parse_status_code("HTTP/1.0 abc"), None);
    }

    #[test]
    fn matches_header_names_case_insensitively() {
        assert_eq!(
            header_value("Proxy-Authenticate: Basic realm=\"r\"", "proxy-authenticate"),
            Some("Basic realm=\"r\"")
        );
        assert_eq!(header_value("HOST:  example.com  ", "Host"), Some("example.com"));
        assert_eq!(header_value("Host example.com", "Host"), None);
        assert_eq!(header_value("Connection: close", "Host"), None);
    }

    #[tokio::test]
    async fn finds_challenge_among_headers() {
        let stream = tokio_test::io::Builder::new()
            .read(b"Server: squid\r\nProxy-Authenticate: Digest realm=\"r\"\r\n\r\n")
            .build();
        let mut conn = Connection::new(stream);

        let challenge = find_proxy_authenticate(&mut conn).await.unwrap();
        assert_eq!(challenge.as_deref(), Some("Digest realm=\"r\""));
    }

    #[tokio::test]
    async fn challenge_scan_stops_at_blank_line() {
        let stream = tokio_test::io::Builder::new()
            .read(b"Server: squid\r\n\r\n")
            .build();
        let mut conn = Connection::new(stream);

        assert_eq!(find_proxy_authenticate(&mut conn).await.unwrap(), None);
    }
}
