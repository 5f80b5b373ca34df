use tokio::sync::broadcast::Receiver;

/// Listens for the process-wide shutdown signal.
///
/// Only a single value is ever sent on the backing broadcast channel; once it
/// arrives (or the sender is dropped) every listener, client task and helper
/// must wind down. The struct remembers that the signal was seen so callers
/// can poll it cheaply.
#[derive(Debug)]
pub(crate) struct Shutdown {
    /// `true` if the shutdown signal has been received.
    is_shutdown: bool,
    /// The receive half of the channel used to listen for shutdown signals.
    notify: Receiver<()>,
}

impl Shutdown {
    pub(crate) fn new(notify: Receiver<()>) -> Shutdown {
        Shutdown {
            is_shutdown: false,
            notify,
        }
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub(crate) async fn recv(&mut self) {
        if self.is_shutdown {
            return;
        }

        // Err means the sender side went away, which is shutdown as well.
        let _ = self.notify.recv().await;
        self.is_shutdown = true;
    }
}
