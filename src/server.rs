//! Server runtime: binds every configured listener, accepts redirected
//! connections and spawns a task per connection.
//!
//! Accept failures that mean "out of file descriptors" put the listener into
//! a randomized backoff instead of killing it; closing any client socket
//! anywhere in the process can end the backoff early. Everything else about
//! a connection lives in [`crate::client`].
use crate::auth::AuthState;
use crate::client::Handler;
use crate::config::{Config, InstanceConfig};
use crate::dnstc;
use crate::redirect::Redirector;
use crate::registry::{InstanceClients, Registry};
use crate::{Result, Shutdown};
use rand::Rng;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One configured capture point at runtime: its configuration, the proxy-auth
/// state shared by its clients, and its live-client list.
#[derive(Debug)]
pub(crate) struct Instance {
    pub(crate) config: InstanceConfig,
    pub(crate) auth: AuthState,
    pub(crate) clients: Arc<InstanceClients>,
}

/// Listener state for one instance.
struct Listener {
    instance: Arc<Instance>,
    listener: TcpListener,
    redirector: Arc<Redirector>,
    registry: Arc<Registry>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_tx: mpsc::Sender<()>,
    /// Current accept backoff ceiling; zero while accepts succeed.
    backoff_ms: u32,
}

/// Run the redirector until the `shutdown` future completes.
///
/// Validates the configuration and binds every listener up front, so a bad
/// address or an unsupported redirector fails startup instead of surfacing
/// at the first connection. On shutdown every live client is dropped,
/// discarding whatever was still queued in its buffers.
pub async fn run(config: Config, shutdown: impl Future) -> Result<()> {
    config.validate()?;
    let redirector = Arc::new(Redirector::open(config.redirector)?);
    let registry = Registry::new();

    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    let mut listeners = Vec::new();
    for instance_config in &config.instances {
        let listener = bind_listener(instance_config)?;
        let clients = registry.register_instance(format!(
            "{} ({})",
            instance_config.listen, instance_config.proxy
        ));
        listeners.push(Listener {
            instance: Arc::new(Instance {
                config: instance_config.clone(),
                auth: AuthState::default(),
                clients,
            }),
            listener,
            redirector: redirector.clone(),
            registry: registry.clone(),
            notify_shutdown: notify_shutdown.clone(),
            shutdown_complete_tx: shutdown_complete_tx.clone(),
            backoff_ms: 0,
        });
    }

    let mut dns_helpers = Vec::new();
    for dnstc_config in &config.dnstc {
        dns_helpers.push(dnstc::bind(dnstc_config).await?);
    }

    for mut listener in listeners {
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            tokio::select! {
                _ = listener.run() => {}
                _ = shutdown.recv() => {}
            }
        });
    }

    for socket in dns_helpers {
        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        let shutdown_complete_tx = shutdown_complete_tx.clone();
        tokio::spawn(async move {
            dnstc::run(socket, shutdown).await;
            drop(shutdown_complete_tx);
        });
    }

    // The developer-facing diagnostics trigger: SIGUSR1 dumps every
    // instance's live clients to the log.
    #[cfg(unix)]
    {
        let registry = registry.clone();
        let mut shutdown = Shutdown::new(notify_shutdown.subscribe());
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut dump_signal = match signal(SignalKind::user_defined1()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(cause = %err, "SIGUSR1 handler unavailable");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = dump_signal.recv() => registry.dump(),
                    _ = shutdown.recv() => return,
                }
            }
        });
    }

    shutdown.await;
    info!("shutting down");

    // Broadcast the shutdown to every listener, client and helper (the
    // listeners hold sender clones, so an explicit send is needed); dropping
    // our own mpsc sender lets the recv below complete once the last task is
    // gone.
    let _ = notify_shutdown.send(());
    drop(notify_shutdown);
    drop(shutdown_complete_tx);
    let _ = shutdown_complete_rx.recv().await;

    Ok(())
}

fn bind_listener(config: &InstanceConfig) -> Result<TcpListener> {
    let socket = TcpSocket::new_v4()?;
    socket.set_reuseaddr(true)?;
    socket.bind(SocketAddr::V4(config.listen))?;
    Ok(socket.listen(config.listenq)?)
}

/// Different systems use different `errno` values to signal "out of file
/// descriptors"; these are the usual suspects.
fn is_fd_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENFILE | libc::EMFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

fn next_backoff(current: u32, min: u16, max: u16) -> u32 {
    ((current << 1) + 1).clamp(min.into(), max.into())
}

/// Sleep out a backoff delay, ending early if a client fd is released once
/// at least `min` of the delay has passed.
async fn backoff_wait(registry: &Registry, delay: Duration, min: Duration) {
    let armed_at = Instant::now();
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return,
            _ = registry.fd_released() => {
                if armed_at.elapsed() > min {
                    debug!("client fd released, re-arming listener early");
                    return;
                }
            }
        }
    }
}

impl Listener {
    async fn run(&mut self) {
        info!(
            addr = %self.instance.config.listen,
            proxy = %self.instance.config.proxy,
            "accepting inbound connections"
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    self.backoff_ms = 0;
                    let SocketAddr::V4(client_addr) = peer else {
                        warn!(%peer, "dropping non-IPv4 client");
                        continue;
                    };
                    let handler = Handler {
                        instance: self.instance.clone(),
                        redirector: self.redirector.clone(),
                        registry: self.registry.clone(),
                        stream,
                        client_addr,
                        shutdown: Shutdown::new(self.notify_shutdown.subscribe()),
                        _shutdown_complete: self.shutdown_complete_tx.clone(),
                    };
                    tokio::spawn(handler.run());
                }
                Err(err) => self.accept_error(err).await,
            }
        }
    }

    /// Fd exhaustion deactivates the listener for a randomized delay bounded
    /// by the configured backoff window; any other accept error is just
    /// logged. A successful accept resets the window.
    async fn accept_error(&mut self, err: io::Error) {
        if !is_fd_exhaustion(&err) {
            warn!(cause = %err, "accept");
            return;
        }

        let min = self.instance.config.min_accept_backoff;
        let max = self.instance.config.max_accept_backoff;
        self.backoff_ms = next_backoff(self.backoff_ms, min, max);
        let delay = rand::thread_rng().gen_range(1..=self.backoff_ms);
        warn!(
            cause = %err,
            "accept: out of file descriptors, backing off for {delay} ms"
        );

        backoff_wait(
            &self.registry,
            Duration::from_millis(delay.into()),
            Duration::from_millis(min.into()),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DnstcConfig, ProxyKind, RedirectorKind};
    use crate::registry::ClientInfo;
    use std::net::SocketAddrV4;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    #[test]
    fn backoff_starts_at_min_and_doubles_up_to_max() {
        let mut backoff = 0;
        let mut ceilings = Vec::new();
        for _ in 0..12 {
            backoff = next_backoff(backoff, 100, 60_000);
            ceilings.push(backoff);
        }
        assert_eq!(ceilings[0], 100);
        assert_eq!(ceilings[1], 201);
        assert_eq!(ceilings[2], 403);
        assert!(ceilings.windows(2).all(|pair| pair[0] <= pair[1]));
        assert_eq!(*ceilings.last().unwrap(), 60_000);
    }

    #[test]
    fn fd_exhaustion_errnos_are_recognized() {
        for errno in [libc::ENFILE, libc::EMFILE, libc::ENOBUFS, libc::ENOMEM] {
            assert!(is_fd_exhaustion(&io::Error::from_raw_os_error(errno)));
        }
        assert!(!is_fd_exhaustion(&io::Error::from_raw_os_error(
            libc::ECONNABORTED
        )));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fd_release_ends_backoff_early_after_min() {
        let registry = Registry::new();
        let instance = registry.register_instance("test".to_string());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                backoff_wait(
                    &registry,
                    Duration::from_secs(30),
                    Duration::from_millis(10),
                )
                .await;
                started.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        let guard = registry.track(
            &instance,
            Arc::new(ClientInfo::new(addr(40000), addr(80), 7)),
        );
        drop(guard);

        let waited = waiter.await.unwrap();
        assert!(waited < Duration::from_secs(5), "waited {waited:?}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fd_release_before_min_backoff_is_ignored() {
        let registry = Registry::new();
        let instance = registry.register_instance("test".to_string());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let started = Instant::now();
                backoff_wait(
                    &registry,
                    Duration::from_millis(200),
                    Duration::from_secs(30),
                )
                .await;
                started.elapsed()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let guard = registry.track(
            &instance,
            Arc::new(ClientInfo::new(addr(40000), addr(80), 7)),
        );
        drop(guard);

        let waited = waiter.await.unwrap();
        assert!(waited >= Duration::from_millis(150), "waited {waited:?}");
    }

    #[tokio::test]
    async fn run_starts_and_shuts_down_cleanly() {
        let config = Config {
            redirector: RedirectorKind::Generic,
            instances: vec![InstanceConfig::new(addr(0), addr(1080), ProxyKind::Socks5)],
            dnstc: vec![DnstcConfig { listen: addr(0) }],
        };

        run(config, async {}).await.unwrap();
    }

    #[tokio::test]
    async fn run_rejects_invalid_configuration() {
        let config = Config {
            redirector: RedirectorKind::Generic,
            instances: vec![],
            dnstc: vec![],
        };

        assert!(run(config, async {}).await.is_err());
    }
}
