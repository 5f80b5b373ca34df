//! HTTP proxy authentication: `Basic` (RFC 7617) and `Digest` (RFC 2617,
//! MD5 only) responses to a `Proxy-Authenticate` challenge.
use base64::{engine::general_purpose, Engine as _};
use md5::{Digest, Md5};
use std::sync::Mutex;

/// Proxy-auth state shared by every client of one instance.
///
/// The last challenge seen from the upstream proxy and the request counter
/// survive individual clients: once a proxy has demanded authentication,
/// later clients start out optimistically with credentials, and the counter
/// keeps growing so Digest `nc` values never repeat against the same nonce.
#[derive(Debug, Default)]
pub struct AuthState {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    last_auth_query: Option<String>,
    last_auth_count: u32,
}

impl AuthState {
    /// Account for one more upstream request: bumps the attempt counter and
    /// returns the stored challenge (if any) together with the new count.
    pub fn next_attempt(&self) -> (Option<String>, u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_auth_count += 1;
        (inner.last_auth_query.clone(), inner.last_auth_count)
    }

    /// Remember the challenge from a `407` reply for this and future clients.
    pub fn store_challenge(&self, challenge: String) {
        self.inner.lock().unwrap().last_auth_query = Some(challenge);
    }

    /// Number of upstream requests composed so far.
    pub fn attempt_count(&self) -> u32 {
        self.inner.lock().unwrap().last_auth_count
    }
}

/// Compute a `Proxy-Authorization` header value (scheme included) answering
/// `challenge` for the given request.
///
/// Returns `None` when the challenge uses a scheme we do not speak, or when a
/// `Digest` challenge is missing its mandatory fields; the caller then sends
/// the request without credentials.
pub fn proxy_authorization(
    challenge: &str,
    login: &str,
    password: &str,
    method: &str,
    uri: &str,
    nc: u32,
) -> Option<String> {
    if has_scheme(challenge, "Basic") {
        Some(format!(
            "Basic {}",
            basic_authentication_encode(login, password)
        ))
    } else if has_scheme(challenge, "Digest") {
        let params = &challenge["Digest".len()..];
        digest_authentication_encode(params, login, password, method, uri, nc, &make_cnonce())
            .map(|digest| format!("Digest {digest}"))
    } else {
        None
    }
}

fn has_scheme(challenge: &str, scheme: &str) -> bool {
    challenge
        .get(..scheme.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(scheme))
}

/// `base64("login:password")`, the whole of the Basic scheme.
pub fn basic_authentication_encode(login: &str, password: &str) -> String {
    general_purpose::STANDARD.encode(format!("{login}:{password}"))
}

/// RFC 2617 MD5 digest response over the challenge parameters (the part of
/// the challenge after the `Digest` keyword). `qop=auth` is used iff the
/// challenge offers it; `nc` is rendered as eight hex digits.
pub fn digest_authentication_encode(
    challenge_params: &str,
    login: &str,
    password: &str,
    method: &str,
    uri: &str,
    nc: u32,
    cnonce: &str,
) -> Option<String> {
    let params = parse_challenge_params(challenge_params);
    let realm = param(&params, "realm")?;
    let nonce = param(&params, "nonce")?;
    let opaque = param(&params, "opaque");
    let use_qop = param(&params, "qop")
        .map(|offered| offered.split(',').any(|q| q.trim() == "auth"))
        .unwrap_or(false);

    let ha1 = md5_hex(&format!("{login}:{realm}:{password}"));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    let nc = format!("{nc:08x}");
    let response = if use_qop {
        md5_hex(&format!("{ha1}:{nonce}:{nc}:{cnonce}:auth:{ha2}"))
    } else {
        md5_hex(&format!("{ha1}:{nonce}:{ha2}"))
    };

    let mut header = format!(
        "username=\"{login}\", realm=\"{realm}\", nonce=\"{nonce}\", \
         uri=\"{uri}\", response=\"{response}\""
    );
    if use_qop {
        header.push_str(&format!(", qop=auth, nc={nc}, cnonce=\"{cnonce}\""));
    }
    if let Some(opaque) = opaque {
        header.push_str(&format!(", opaque=\"{opaque}\""));
    }
    Some(header)
}

/// A fresh 16-hex-digit client nonce.
pub fn make_cnonce() -> String {
    format!("{:016x}", rand::random::<u64>())
}

fn md5_hex(input: &str) -> String {
    let digest = Md5::digest(input.as_bytes());
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

/// Split `realm="r", nonce="n", qop="auth,auth-int"` into key/value pairs.
/// Commas inside quoted values do not split; keys are lowercased and values
/// unquoted.
fn parse_challenge_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut rest = input.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_ascii_lowercase();
        let value_start = rest[eq + 1..].trim_start();
        let (value, remaining) = if let Some(quoted) = value_start.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            }
        } else {
            match value_start.find(',') {
                Some(end) => (value_start[..end].trim_end(), &value_start[end..]),
                None => (value_start.trim_end(), ""),
            }
        };
        if !key.is_empty() {
            params.push((key, value.to_string()));
        }
        rest = remaining.trim_start().trim_start_matches(',').trim_start();
    }
    params
}
