//! Per-connection lifecycle: destination discovery, upstream connect, the
//! protocol handshake, and finally the hand-off to the relay engine.
use crate::config::ProxyKind;
use crate::proto::{self, http_relay::RelayOutcome, Outcome};
use crate::redirect::Redirector;
use crate::registry::{ClientInfo, Registry};
use crate::relay;
use crate::server::Instance;
use crate::{Connection, Error, Result, Shutdown};
use bytes::Bytes;
use std::fmt;
use std::net::{SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

/// Renders the `client -> destination` pair every client-scoped log record
/// is prefixed with.
struct ConnLabel {
    client: SocketAddrV4,
    dest: SocketAddrV4,
}

impl fmt::Display for ConnLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.client, self.dest)
    }
}

/// Per-connection handler. Owns the captured socket from accept to teardown.
#[derive(Debug)]
pub(crate) struct Handler {
    /// The instance this connection was captured by.
    pub(crate) instance: Arc<Instance>,
    /// Process-wide destination resolver.
    pub(crate) redirector: Arc<Redirector>,
    /// Registry for diagnostics and the fd-release hook.
    pub(crate) registry: Arc<Registry>,
    /// The captured client socket.
    pub(crate) stream: TcpStream,
    pub(crate) client_addr: SocketAddrV4,
    /// Listen for shutdown notifications.
    pub(crate) shutdown: Shutdown,
    /// Closes the shutdown-complete channel once every handler is gone.
    pub(crate) _shutdown_complete: mpsc::Sender<()>,
}

impl Handler {
    /// Drive the connection to completion. Never propagates errors: every
    /// failure is logged here and ends with this client alone being dropped.
    pub(crate) async fn run(self) {
        let Handler {
            instance,
            redirector,
            registry,
            stream,
            client_addr,
            mut shutdown,
            _shutdown_complete,
        } = self;

        let dest = match redirector.lookup(&stream, client_addr, instance.config.listen) {
            Ok(dest) => dest,
            Err(err) => {
                warn!(client = %client_addr, cause = %err, "dropping client");
                return;
            }
        };

        let span = info_span!("client", conn = %ConnLabel { client: client_addr, dest });
        async move {
            tokio::select! {
                res = serve(&instance, &registry, stream, client_addr, dest) => match res {
                    Ok(()) => info!("dropping client"),
                    Err(Error::ClientGone) => {
                        info!("client closed connection before handshake completed, dropping client")
                    }
                    Err(err) => info!(cause = %err, "dropping client"),
                },
                _ = shutdown.recv() => debug!("dropping client at shutdown"),
            }
        }
        .instrument(span)
        .await;
    }
}

async fn serve(
    instance: &Arc<Instance>,
    registry: &Arc<Registry>,
    stream: TcpStream,
    client_addr: SocketAddrV4,
    dest: SocketAddrV4,
) -> Result<()> {
    if let Err(err) = socket2::SockRef::from(&stream).set_keepalive(true) {
        warn!(cause = %err, "setsockopt(SO_KEEPALIVE)");
        return Err(err.into());
    }

    let info = Arc::new(ClientInfo::new(client_addr, dest, stream.as_raw_fd()));
    let _guard = registry.track(&instance.clients, info.clone());
    info!("accepted");

    match instance.config.proxy {
        ProxyKind::Socks4 | ProxyKind::Socks5 => serve_socks(instance, stream, dest, &info).await,
        ProxyKind::HttpConnect => serve_http_connect(instance, stream, dest, &info).await,
        ProxyKind::HttpRelay => serve_http_relay(instance, stream, dest, &info).await,
    }
}

/// Non-blocking connect to the configured upstream proxy.
async fn connect_upstream(instance: &Instance, info: &ClientInfo) -> Result<TcpStream> {
    match TcpStream::connect(SocketAddr::V4(instance.config.relay)).await {
        Ok(stream) => {
            info.set_relay_fd(stream.as_raw_fd());
            info.touch();
            Ok(stream)
        }
        Err(err) => {
            info!(cause = %err, "relay connection failed");
            Err(err.into())
        }
    }
}

/// Resolves when the client abandons the connection before the handshake is
/// done. The socket is only peeked at, so data a hasty client already sent
/// stays queued for the relay engine.
async fn client_abandoned(stream: &TcpStream) {
    let mut byte = [0u8; 1];
    match stream.peek(&mut byte).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending().await,
    }
}

/// Engage the relay engine on a completed upstream handshake. Bytes the
/// handshake over-read from the upstream belong to the client.
async fn engage_relay(
    client_stream: TcpStream,
    conn: Connection<TcpStream>,
    info: &ClientInfo,
) -> Result<()> {
    let (upstream, residual) = conn.into_parts();
    relay::run(
        client_stream,
        upstream,
        residual.freeze(),
        Bytes::new(),
        info,
    )
    .await
}

async fn serve_socks(
    instance: &Instance,
    client_stream: TcpStream,
    dest: SocketAddrV4,
    info: &ClientInfo,
) -> Result<()> {
    let mut conn = Connection::new(connect_upstream(instance, info).await?);

    let handshake = async {
        match instance.config.proxy {
            ProxyKind::Socks4 => proto::socks4::handshake(&mut conn, dest, &instance.config).await,
            _ => proto::socks5::handshake(&mut conn, dest, &instance.config).await,
        }
    };
    tokio::select! {
        res = handshake => res?,
        _ = client_abandoned(&client_stream) => return Err(Error::ClientGone),
    }
    info.touch();

    engage_relay(client_stream, conn, info).await
}

async fn serve_http_connect(
    instance: &Instance,
    client_stream: TcpStream,
    dest: SocketAddrV4,
    info: &ClientInfo,
) -> Result<()> {
    let mut retried = false;
    let conn = loop {
        let mut conn = Connection::new(connect_upstream(instance, info).await?);
        let attempt = proto::http_connect::attempt(
            &mut conn,
            dest,
            &instance.config,
            &instance.auth,
            retried,
        );
        let outcome = tokio::select! {
            res = attempt => res?,
            _ = client_abandoned(&client_stream) => return Err(Error::ClientGone),
        };
        match outcome {
            Outcome::Established => break conn,
            // the failed socket is dropped here; reconnect with credentials
            Outcome::RetryAuth => retried = true,
        }
    };
    info.touch();

    engage_relay(client_stream, conn, info).await
}

async fn serve_http_relay(
    instance: &Instance,
    client_stream: TcpStream,
    dest: SocketAddrV4,
    info: &ClientInfo,
) -> Result<()> {
    let mut client_conn = Connection::new(client_stream);
    let mut req = proto::http_relay::read_request(&mut client_conn, dest).await?;

    let mut retried = false;
    let (upstream_conn, reply_head) = loop {
        let mut conn = Connection::new(connect_upstream(instance, info).await?);
        let outcome = proto::http_relay::attempt(
            &mut client_conn,
            &mut conn,
            &mut req,
            &instance.config,
            &instance.auth,
            retried,
        )
        .await?;
        match outcome {
            RelayOutcome::Established { reply_head } => break (conn, reply_head),
            RelayOutcome::RetryAuth => retried = true,
        }
    };

    client_conn.write_all(&reply_head).await?;
    client_conn.flush().await?;
    info.touch();

    let (client_stream, client_residual) = client_conn.into_parts();
    let (upstream, upstream_residual) = upstream_conn.into_parts();
    relay::run(
        client_stream,
        upstream,
        upstream_residual.freeze(),
        client_residual.freeze(),
        info,
    )
    .await
}
