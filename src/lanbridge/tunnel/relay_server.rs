//! Per-tunnel pairing of public clients with LAN-supplied ready connections.
//!
//! Two listeners: the relay listener takes ready connections from the agent's
//! pool, the public listener takes application clients. Each public client is
//! paired with exactly one ready connection that first passes a handshake over
//! the tunnel secret.

use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use thiserror::Error;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{self, Instant},
};

use crate::lanbridge::{
    net, telemetry,
    tunnel::{handshake::Handshaker, relay},
};

/// Ready connections accepted but not yet paired.
pub const READY_QUEUE_CAPACITY: usize = 1024;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PairError {
    #[error("no ready connection within {0:?}")]
    Timeout(Duration),
    #[error("relay server closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct RelayServerOptions {
    /// Relay listener address; port 0 picks an ephemeral port.
    pub relay_bind_addr: String,
    /// Public listener address.
    pub open_addr: String,
    pub secret: String,
    pub handshake_timeout: Duration,
    pub pair_timeout: Duration,
    pub idle_timeout: Duration,
}

pub struct RelayServer {
    relay_addr: SocketAddr,
    public_addr: SocketAddr,
    handshaker: Handshaker,
    handshake_timeout: Duration,
    pair_timeout: Duration,
    idle_timeout: Duration,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<TcpStream>>,
    stop_tx: watch::Sender<bool>,
    closed: AtomicBool,
    active: Arc<AtomicUsize>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RelayServer {
    /// Bind both listeners and start accepting.
    pub async fn start(opts: RelayServerOptions) -> anyhow::Result<Arc<Self>> {
        let relay_ln = TcpListener::bind(net::normalize_bind_addr(&opts.relay_bind_addr).as_ref())
            .await
            .with_context(|| format!("bind relay listener {}", opts.relay_bind_addr))?;
        let public_ln = TcpListener::bind(net::normalize_bind_addr(&opts.open_addr).as_ref())
            .await
            .with_context(|| format!("bind public listener {}", opts.open_addr))?;

        let relay_addr = relay_ln.local_addr()?;
        let public_addr = public_ln.local_addr()?;

        let (ready_tx, ready_rx) = mpsc::channel(READY_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);

        let srv = Arc::new(Self {
            relay_addr,
            public_addr,
            handshaker: Handshaker::new(&opts.secret),
            handshake_timeout: opts.handshake_timeout,
            pair_timeout: opts.pair_timeout,
            idle_timeout: opts.idle_timeout,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            stop_tx,
            closed: AtomicBool::new(false),
            active: Arc::new(AtomicUsize::new(0)),
            tasks: Mutex::new(Vec::new()),
        });

        let ready_task = tokio::spawn(accept_ready(relay_ln, ready_tx, stop_rx.clone()));
        let public_task = tokio::spawn(accept_public(public_ln, Arc::downgrade(&srv), stop_rx));
        srv.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([ready_task, public_task]);

        tracing::info!(
            relay = %relay_addr,
            public = %public_addr,
            "relay: listening"
        );
        Ok(srv)
    }

    pub fn relay_addr(&self) -> SocketAddr {
        self.relay_addr
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// Paired relays currently running.
    pub fn active_relays(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Take one ready connection that passes the tunnel handshake.
    ///
    /// A ready connection that fails the handshake is dropped and the next one
    /// is tried, all within one `pair_timeout` budget.
    pub async fn pair(&self) -> Result<TcpStream, PairError> {
        let deadline = Instant::now() + self.pair_timeout;
        let mut stop = self.stop_tx.subscribe();

        loop {
            let next = async {
                let mut rx = self.ready_rx.lock().await;
                rx.recv().await
            };
            let mut ready = tokio::select! {
                _ = stopped(&mut stop) => return Err(PairError::Closed),
                r = time::timeout_at(deadline, next) => match r {
                    Err(_) => return Err(PairError::Timeout(self.pair_timeout)),
                    Ok(None) => return Err(PairError::Closed),
                    Ok(Some(c)) => c,
                },
            };

            // A stale connection may not eat past the pairing deadline.
            let checked = tokio::select! {
                _ = stopped(&mut stop) => return Err(PairError::Closed),
                r = time::timeout_at(
                    deadline,
                    self.handshaker.challenge(&mut ready, self.handshake_timeout),
                ) => match r {
                    Err(_) => return Err(PairError::Timeout(self.pair_timeout)),
                    Ok(r) => r,
                },
            };
            match checked {
                Ok(()) => return Ok(ready),
                Err(err) => {
                    tracing::debug!(
                        peer = %peer_of(&ready),
                        err = %err,
                        "relay: stale ready connection dropped"
                    );
                }
            }
        }
    }

    async fn serve_public(self: Arc<Self>, client: TcpStream, peer: SocketAddr) {
        let ready = match self.pair().await {
            Ok(c) => c,
            Err(err) => {
                metrics::counter!("lanbridge_pair_failures_total").increment(1);
                tracing::warn!(client = %peer, err = %err, "relay: pairing failed");
                return;
            }
        };

        tracing::debug!(client = %peer, ready = %peer_of(&ready), "relay: paired");

        let _metrics = telemetry::ActiveRelayGuard::new();
        let _active = ActiveCount::new(self.active.clone());
        let mut stop = self.stop_tx.subscribe();
        tokio::select! {
            stats = relay::relay(client, ready, self.idle_timeout, None) => {
                telemetry::record_relay_bytes("server", &stats);
                tracing::debug!(
                    client = %peer,
                    up = stats.a_to_b,
                    down = stats.b_to_a,
                    end = ?stats.end,
                    "relay: finished"
                );
            }
            _ = stopped(&mut stop) => {
                tracing::debug!(client = %peer, "relay: closed with tunnel");
            }
        }
    }

    /// Close both listeners, drop queued ready connections and end paired relays.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop_tx.send(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for t in tasks {
            let _ = t.await;
        }

        let mut rx = self.ready_rx.lock().await;
        rx.close();
        let mut drained = 0usize;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        tracing::info!(
            relay = %self.relay_addr,
            public = %self.public_addr,
            drained,
            "relay: closed"
        );
    }
}

async fn accept_ready(
    ln: TcpListener,
    tx: mpsc::Sender<TcpStream>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let conn = tokio::select! {
            _ = stopped(&mut stop) => break,
            res = ln.accept() => res,
        };
        match conn {
            Ok((c, peer)) => {
                let _ = c.set_nodelay(true);
                tracing::debug!(peer = %peer, "relay: ready connection accepted");
                // Blocks while the queue is full.
                let sent = tokio::select! {
                    _ = stopped(&mut stop) => break,
                    r = tx.send(c) => r,
                };
                if sent.is_err() {
                    break;
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "relay: accept ready failed");
                time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn accept_public(
    ln: TcpListener,
    srv: std::sync::Weak<RelayServer>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let conn = tokio::select! {
            _ = stopped(&mut stop) => break,
            res = ln.accept() => res,
        };
        match conn {
            Ok((c, peer)) => {
                let Some(srv) = srv.upgrade() else {
                    break;
                };
                let _ = c.set_nodelay(true);
                tracing::debug!(client = %peer, "relay: public connection accepted");
                tokio::spawn(srv.serve_public(c, peer));
            }
            Err(err) => {
                tracing::warn!(err = %err, "relay: accept public failed");
                time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Resolves once the stop flag is set or its sender is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn peer_of(c: &TcpStream) -> String {
    c.peer_addr().map(|a| a.to_string()).unwrap_or_default()
}

struct ActiveCount(Arc<AtomicUsize>);

impl ActiveCount {
    fn new(n: Arc<AtomicUsize>) -> Self {
        n.fetch_add(1, Ordering::Relaxed);
        Self(n)
    }
}

impl Drop for ActiveCount {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}
