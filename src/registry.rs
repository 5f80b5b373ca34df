//! Bookkeeping for live clients: per-instance client lists used for
//! diagnostics and orderly teardown, plus the process-wide "an fd was just
//! released" notification that lets a backed-off listener re-arm early.
use std::net::SocketAddrV4;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Notify;
use tracing::debug;

pub(crate) const SHUT_RD: u8 = 0b01;
pub(crate) const SHUT_WR: u8 = 0b10;
pub(crate) const SHUT_RDWR: u8 = SHUT_RD | SHUT_WR;

/// Which of a client's two sockets an event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Client,
    Relay,
}

impl Side {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Relay => "relay",
        }
    }
}

fn shut_str(shut: u8) -> &'static str {
    match shut {
        SHUT_RD => " SHUT_RD",
        SHUT_WR => " SHUT_WR",
        SHUT_RDWR => " SHUT_RDWR",
        _ => "",
    }
}

fn enabled_str(enabled_read: bool, enabled_write: bool) -> &'static str {
    match (enabled_read, enabled_write) {
        (true, true) => "R/W",
        (true, false) => "R/-",
        (false, true) => "-/W",
        (false, false) => "-/-",
    }
}

/// One live client's observable state. Shared between the client task (which
/// updates it) and the registry (which dumps it on request).
#[derive(Debug)]
pub struct ClientInfo {
    client_addr: SocketAddrV4,
    dest: SocketAddrV4,
    client_fd: RawFd,
    relay_fd: AtomicI32,
    client_shut: AtomicU8,
    relay_shut: AtomicU8,
    relaying: AtomicBool,
    started: Instant,
    last_event_ms: AtomicU64,
}

impl ClientInfo {
    pub(crate) fn new(client_addr: SocketAddrV4, dest: SocketAddrV4, client_fd: RawFd) -> Self {
        Self {
            client_addr,
            dest,
            client_fd,
            relay_fd: AtomicI32::new(-1),
            client_shut: AtomicU8::new(0),
            relay_shut: AtomicU8::new(0),
            relaying: AtomicBool::new(false),
            started: Instant::now(),
            last_event_ms: AtomicU64::new(0),
        }
    }

    /// Stamp the last-event clock; called on every observable event.
    pub(crate) fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_event_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    pub(crate) fn set_relay_fd(&self, fd: RawFd) {
        self.relay_fd.store(fd, Ordering::Relaxed);
    }

    /// The handshake is over, the byte pump is running.
    pub(crate) fn mark_relaying(&self) {
        self.relaying.store(true, Ordering::Relaxed);
    }

    /// Record a half-shutdown on one side. Returns `true` once all four
    /// half-shutdown flags are set, i.e. the client is fully torn down.
    pub(crate) fn mark_shut(&self, side: Side, how: u8) -> bool {
        let flags = match side {
            Side::Client => &self.client_shut,
            Side::Relay => &self.relay_shut,
        };
        flags.fetch_or(how, Ordering::Relaxed);
        self.touch();
        self.client_shut.load(Ordering::Relaxed) == SHUT_RDWR
            && self.relay_shut.load(Ordering::Relaxed) == SHUT_RDWR
    }

    fn side_str(&self, shut: u8, read_watch_only: bool) -> &'static str {
        if self.relaying.load(Ordering::Relaxed) {
            enabled_str(shut & SHUT_RD == 0, shut & SHUT_WR == 0)
        } else if read_watch_only {
            // handshake phase: the client socket is watched for EOF only
            "R/-"
        } else {
            "R/W"
        }
    }

    fn dump(&self) {
        let client_shut = self.client_shut.load(Ordering::Relaxed);
        let relay_shut = self.relay_shut.load(Ordering::Relaxed);
        let age = self.started.elapsed().as_secs();
        let idle = age.saturating_sub(self.last_event_ms.load(Ordering::Relaxed) / 1000);
        debug!(
            "[{} -> {}] client: {} ({}){}, relay: {} ({}){}, age: {} sec, idle: {} sec.",
            self.client_addr,
            self.dest,
            self.client_fd,
            self.side_str(client_shut, true),
            shut_str(client_shut),
            self.relay_fd.load(Ordering::Relaxed),
            self.side_str(relay_shut, false),
            shut_str(relay_shut),
            age,
            idle,
        );
    }
}

/// The live-client list of one instance.
#[derive(Debug)]
pub struct InstanceClients {
    label: String,
    clients: Mutex<Vec<Arc<ClientInfo>>>,
}

/// Process-wide registry: one entry per instance plus the fd-release signal.
#[derive(Debug, Default)]
pub struct Registry {
    instances: Mutex<Vec<Arc<InstanceClients>>>,
    released: Notify,
}

impl Registry {
    pub fn new() -> Arc<Registry> {
        Arc::new(Registry::default())
    }

    pub(crate) fn register_instance(&self, label: String) -> Arc<InstanceClients> {
        let instance = Arc::new(InstanceClients {
            label,
            clients: Mutex::new(Vec::new()),
        });
        self.instances.lock().unwrap().push(instance.clone());
        instance
    }

    /// Insert a client into its instance's list. The returned guard removes
    /// it again on drop and fires the fd-release hook, which is what lets a
    /// listener in accept backoff re-arm as soon as any client goes away.
    pub(crate) fn track(
        self: &Arc<Self>,
        instance: &Arc<InstanceClients>,
        info: Arc<ClientInfo>,
    ) -> ClientGuard {
        instance.clients.lock().unwrap().push(info.clone());
        ClientGuard {
            registry: self.clone(),
            instance: instance.clone(),
            info,
        }
    }

    /// Wait until some client socket anywhere in the process is released.
    pub(crate) async fn fd_released(&self) {
        self.released.notified().await;
    }

    /// Log one line per live client of every instance; the developer-facing
    /// diagnostics dump.
    pub fn dump(&self) {
        for instance in self.instances.lock().unwrap().iter() {
            debug!("dumping client list for instance {}:", instance.label);
            for client in instance.clients.lock().unwrap().iter() {
                client.dump();
            }
            debug!("end of client list.");
        }
    }
}

impl InstanceClients {
    #[cfg(test)]
    pub(crate) fn live_clients(&self) -> usize {
        self.clients.lock().unwrap().len()
    }
}

/// Removes the client from its instance list on drop and signals the
/// fd-release hook.
#[derive(Debug)]
pub(crate) struct ClientGuard {
    registry: Arc<Registry>,
    instance: Arc<InstanceClients>,
    info: Arc<ClientInfo>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.instance
            .clients
            .lock()
            .unwrap()
            .retain(|entry| !Arc::ptr_eq(entry, &self.info));
        self.registry.released.notify_waiters();
    }
}
