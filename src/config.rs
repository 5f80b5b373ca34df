//! Typed configuration tree consumed by [`crate::server::run`].
//!
//! The tree mirrors the three configuration sections of the service: one
//! process-wide redirector selection, one or more capture instances and zero
//! or more DNS-truncate listeners. Parsing a configuration file into this
//! tree is the caller's business; validation of the tree is ours.
use crate::{Error, Result};
use std::fmt;
use std::net::SocketAddrV4;
use std::str::FromStr;

/// Default listen backlog when `listenq` is not configured.
pub const DEFAULT_LISTENQ: u32 = 128;
/// Default lower bound for the accept backoff timer, in milliseconds.
pub const DEFAULT_MIN_ACCEPT_BACKOFF_MS: u16 = 100;
/// Default upper bound for the accept backoff timer, in milliseconds.
pub const DEFAULT_MAX_ACCEPT_BACKOFF_MS: u16 = 60_000;

/// Which kernel facility is queried for a redirected connection's original
/// destination. Selected once for the whole process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectorKind {
    /// Linux netfilter, `getsockopt(SO_ORIGINAL_DST)`.
    Iptables,
    /// BSD packet filter, `DIOCNATLOOK` on `/dev/pf`.
    Pf,
    /// IPFilter, `SIOCGNATL` on the NAT control device.
    Ipf,
    /// `getsockname`; correct only when the OS rewrites the local address in
    /// place (transparent proxying modes).
    Generic,
}

impl RedirectorKind {
    pub fn name(&self) -> &'static str {
        match self {
            RedirectorKind::Iptables => "iptables",
            RedirectorKind::Pf => "pf",
            RedirectorKind::Ipf => "ipf",
            RedirectorKind::Generic => "generic",
        }
    }
}

impl fmt::Display for RedirectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for RedirectorKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "iptables" => Ok(RedirectorKind::Iptables),
            "pf" => Ok(RedirectorKind::Pf),
            "ipf" => Ok(RedirectorKind::Ipf),
            "generic" => Ok(RedirectorKind::Generic),
            _ => Err(Error::Config(format!("invalid `redirector` `{s}`"))),
        }
    }
}

/// Upstream proxy protocol spoken by one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Socks4,
    Socks5,
    HttpConnect,
    HttpRelay,
}

impl ProxyKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Socks5 => "socks5",
            ProxyKind::HttpConnect => "http-connect",
            ProxyKind::HttpRelay => "http-relay",
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ProxyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "socks4" => Ok(ProxyKind::Socks4),
            "socks5" => Ok(ProxyKind::Socks5),
            "http-connect" => Ok(ProxyKind::HttpConnect),
            "http-relay" => Ok(ProxyKind::HttpRelay),
            _ => Err(Error::Config(format!("invalid `type` `{s}`"))),
        }
    }
}

/// One capture point: a listener plus the upstream proxy it forwards to.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Address the capture listener binds to.
    pub listen: SocketAddrV4,
    /// Upstream proxy address; always a literal IPv4 address and port.
    pub relay: SocketAddrV4,
    /// Upstream proxy protocol.
    pub proxy: ProxyKind,
    /// Upstream credentials; interpretation is per protocol.
    pub login: Option<String>,
    pub password: Option<String>,
    /// Listen backlog.
    pub listenq: u32,
    /// Bounds on the accept backoff timer, in milliseconds.
    pub min_accept_backoff: u16,
    pub max_accept_backoff: u16,
}

impl InstanceConfig {
    /// Creates an instance configuration with default backlog and backoff
    /// bounds and no credentials.
    pub fn new(listen: SocketAddrV4, relay: SocketAddrV4, proxy: ProxyKind) -> Self {
        Self {
            listen,
            relay,
            proxy,
            login: None,
            password: None,
            listenq: DEFAULT_LISTENQ,
            min_accept_backoff: DEFAULT_MIN_ACCEPT_BACKOFF_MS,
            max_accept_backoff: DEFAULT_MAX_ACCEPT_BACKOFF_MS,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.min_accept_backoff == 0 {
            return Err(Error::Config(
                "`min_accept_backoff` must be positive, 0 ms is too low".into(),
            ));
        }
        if self.max_accept_backoff == 0 {
            return Err(Error::Config(
                "`max_accept_backoff` must be positive, 0 ms is too low".into(),
            ));
        }
        if self.min_accept_backoff >= self.max_accept_backoff {
            return Err(Error::Config(
                "`min_accept_backoff` must be less than `max_accept_backoff`".into(),
            ));
        }
        Ok(())
    }
}

/// Bind address for one DNS-truncate helper listener.
#[derive(Debug, Clone)]
pub struct DnstcConfig {
    pub listen: SocketAddrV4,
}

/// The whole configuration tree.
#[derive(Debug, Clone)]
pub struct Config {
    pub redirector: RedirectorKind,
    pub instances: Vec<InstanceConfig>,
    pub dnstc: Vec<DnstcConfig>,
}

impl Config {
    /// Checks the tree for the errors that must fail startup before any
    /// socket is bound.
    pub fn validate(&self) -> Result<()> {
        if self.instances.is_empty() {
            return Err(Error::Config("no capture instances configured".into()));
        }
        for instance in &self.instances {
            instance.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    fn sample_instance() -> InstanceConfig {
        InstanceConfig::new(addr(12345), addr(1080), ProxyKind::Socks5)
    }

    #[test]
    fn kind_names_round_trip() {
        for name in ["socks4", "socks5", "http-connect", "http-relay"] {
            assert_eq!(name.parse::<ProxyKind>().unwrap().name(), name);
        }
        for name in ["iptables", "pf", "ipf", "generic"] {
            assert_eq!(name.parse::<RedirectorKind>().unwrap().name(), name);
        }
        assert!("socks6".parse::<ProxyKind>().is_err());
        assert!("nat".parse::<RedirectorKind>().is_err());
    }

    #[test]
    fn default_backoff_bounds_are_valid() {
        sample_instance().validate().unwrap();
    }

    #[test]
    fn zero_backoff_is_rejected() {
        let mut config = sample_instance();
        config.min_accept_backoff = 0;
        assert!(config.validate().is_err());

        let mut config = sample_instance();
        config.max_accept_backoff = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let mut config = sample_instance();
        config.min_accept_backoff = 500;
        config.max_accept_backoff = 500;
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_instance_list_is_rejected() {
        let config = Config {
            redirector: RedirectorKind::Generic,
            instances: vec![],
            dnstc: vec![],
        };
        assert!(config.validate().is_err());
    }
}
