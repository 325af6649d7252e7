//! TCP inbox listener.
//!
//! Accepts inbound connections and hands each socket to an [`Acceptor`].
//! A failing or panicking acceptor never stops the accept loop.

use crate::utils::{NetworkError, Result};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const BACKLOG: u32 = 16;

/// Pause after a failed `accept` so a persistent error does not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Receives ownership of every accepted socket.
///
/// Returning an error drops the socket, which closes it.
pub trait Acceptor: Send + Sync + 'static {
    /// Take over an accepted connection
    fn accept(&self, stream: TcpStream, addr: SocketAddr) -> Result<()>;
}

impl<F> Acceptor for F
where
    F: Fn(TcpStream, SocketAddr) -> Result<()> + Send + Sync + 'static,
{
    fn accept(&self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        self(stream, addr)
    }
}

/// One accept loop and the handles that stop it. Each `start` gets a fresh
/// one, so a leftover wakeup cannot reach a later loop.
struct Run {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl Run {
    fn signal(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

/// Listening socket plus its accept loop
pub struct InboxListener {
    acceptor: Arc<dyn Acceptor>,
    join_timeout: Duration,
    running: AtomicBool,
    run: Mutex<Option<Run>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl InboxListener {
    /// Create a stopped listener that will hand sockets to `acceptor`
    pub fn new<A: Acceptor>(acceptor: A) -> Self {
        Self {
            acceptor: Arc::new(acceptor),
            join_timeout: Duration::from_millis(crate::defaults::JOIN_TIMEOUT_MS),
            running: AtomicBool::new(false),
            run: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Override how long `stop` waits for the accept loop
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    /// Whether the accept loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Bind `host:port` and start accepting. Port 0 picks an ephemeral port.
    ///
    /// Returns the port actually bound. Calling `start` on a running listener
    /// returns the current port without rebinding.
    ///
    /// # Errors
    ///
    /// Fails if the host does not resolve or the address cannot be bound.
    pub async fn start(&self, host: &str, port: u16) -> Result<u16> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(self.local_addr().map_or(port, |a| a.port()));
        }

        let listener = match bind_listener(host, port).await {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let bound = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(bound);

        let stop = Arc::new(AtomicBool::new(false));
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(accept_loop(listener, self.acceptor.clone(), stop.clone(), wake.clone()));
        *self.lock_run() = Some(Run { stop, wake, task });

        log::info!("Inbox listening on {}", bound);
        Ok(bound.port())
    }

    /// Stop accepting and release the port. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let run = self.lock_run().take();
        if let Some(run) = run {
            run.signal();
            if tokio::time::timeout(self.join_timeout, run.task).await.is_err() {
                log::warn!("Accept loop did not stop within {:?}", self.join_timeout);
            }
        }
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = None;
        log::info!("Inbox stopped");
    }

    fn lock_run(&self) -> std::sync::MutexGuard<'_, Option<Run>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for InboxListener {
    fn drop(&mut self) {
        if let Some(run) = self.lock_run().take() {
            run.signal();
        }
    }
}

async fn bind_listener(host: &str, port: u16) -> Result<TcpListener> {
    let address = format!("{host}:{port}");
    let bind_failed = |reason: String| NetworkError::BindFailed {
        address: address.clone(),
        reason,
    };

    let addr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| bind_failed(e.to_string()))?
        .next()
        .ok_or_else(|| NetworkError::InvalidAddress {
            address: address.clone(),
        })?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| bind_failed(e.to_string()))?;
    socket.set_reuseaddr(true).map_err(|e| bind_failed(e.to_string()))?;
    socket.bind(addr).map_err(|e| bind_failed(e.to_string()))?;
    Ok(socket.listen(BACKLOG).map_err(|e| bind_failed(e.to_string()))?)
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Arc<dyn Acceptor>,
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
) {
    while !stop.load(Ordering::SeqCst) {
        let accepted = tokio::select! {
            _ = wake.notified() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, addr)) => {
                log::debug!("Accepted connection from {}", addr);
                match catch_unwind(AssertUnwindSafe(|| acceptor.accept(stream, addr))) {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => log::warn!("Acceptor rejected {}: {}", addr, e),
                    Err(_) => log::error!("Acceptor panicked while handling {}", addr),
                }
            }
            Err(e) => {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!("Accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
    log::debug!("Accept loop finished");
}
