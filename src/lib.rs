//! A transparent TCP-to-proxy redirector.
//!
//! Accepts TCP connections that the operating system has redirected into it
//! (iptables REDIRECT, BSD pf rdr, ...), discovers each connection's original
//! destination, performs the configured upstream proxy's handshake on the
//! client's behalf and then relays bytes in both directions until either side
//! closes. SOCKS4, SOCKS5 (with username/password), HTTP CONNECT and
//! transparent HTTP relaying are supported as upstream protocols, plus a small
//! UDP helper that forces DNS clients onto TCP by answering every query with a
//! truncated reply.

pub mod auth;
pub mod config;
pub mod error;
pub mod redirect;
pub mod registry;
pub mod server;

mod client;
mod connection;
mod dnstc;
mod proto;
mod relay;
mod shutdown;

pub use config::{Config, DnstcConfig, InstanceConfig, ProxyKind, RedirectorKind};
pub use error::Error;
pub use redirect::Redirector;

pub(crate) use connection::{Connection, ConnectionStream};
pub(crate) use shutdown::Shutdown;

pub type Result<T> = std::result::Result<T, Error>;
