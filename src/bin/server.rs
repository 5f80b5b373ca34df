use anyhow::Context;
use clap::Parser;
use redrelay::{server, Config, DnstcConfig, InstanceConfig, ProxyKind, RedirectorKind};
use std::net::SocketAddrV4;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = RedrelayCli::parse();
    let config = cli.into_config()?;

    server::run(config, tokio::signal::ctrl_c())
        .await
        .context("server error")?;

    Ok(())
}

#[derive(Debug, Parser)]
#[command(name = "redrelay", version, author)]
/// Transparent TCP-to-proxy redirector.
///
/// Accepts TCP connections redirected here by the packet filter, discovers
/// their original destination and forwards them through an upstream proxy.
struct RedrelayCli {
    /// Address to accept redirected connections on.
    #[arg(long, default_value = "127.0.0.1:12345")]
    listen: SocketAddrV4,
    /// Upstream proxy address (literal IPv4 address and port).
    #[arg(long)]
    relay: SocketAddrV4,
    /// Upstream proxy protocol: socks4, socks5, http-connect or http-relay.
    #[arg(long, default_value = "socks5")]
    proxy: String,
    /// Original-destination discovery backend: iptables, pf, ipf or generic.
    #[arg(long, default_value = "iptables")]
    redirector: String,
    /// Upstream proxy login.
    #[arg(long)]
    login: Option<String>,
    /// Upstream proxy password.
    #[arg(long)]
    password: Option<String>,
    /// Listen backlog.
    #[arg(long, default_value_t = redrelay::config::DEFAULT_LISTENQ)]
    listenq: u32,
    /// Lower bound of the accept backoff timer, in milliseconds.
    #[arg(long, default_value_t = redrelay::config::DEFAULT_MIN_ACCEPT_BACKOFF_MS)]
    min_accept_backoff: u16,
    /// Upper bound of the accept backoff timer, in milliseconds.
    #[arg(long, default_value_t = redrelay::config::DEFAULT_MAX_ACCEPT_BACKOFF_MS)]
    max_accept_backoff: u16,
    /// Also answer DNS queries on this address with truncated replies,
    /// forcing resolvers onto TCP. May be given more than once.
    #[arg(long)]
    dnstc: Vec<SocketAddrV4>,
}

impl RedrelayCli {
    fn into_config(self) -> anyhow::Result<Config> {
        let proxy: ProxyKind = self.proxy.parse()?;
        let redirector: RedirectorKind = self.redirector.parse()?;

        let mut instance = InstanceConfig::new(self.listen, self.relay, proxy);
        instance.login = self.login;
        instance.password = self.password;
        instance.listenq = self.listenq;
        instance.min_accept_backoff = self.min_accept_backoff;
        instance.max_accept_backoff = self.max_accept_backoff;

        Ok(Config {
            redirector,
            instances: vec![instance],
            dnstc: self
                .dnstc
                .into_iter()
                .map(|listen| DnstcConfig { listen })
                .collect(),
        })
    }
}
