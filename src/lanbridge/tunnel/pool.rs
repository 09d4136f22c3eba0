//! LAN-side pool of pre-dialed relay connections.
//!
//! The pool keeps up to `max_ready` connections to the relay port that have
//! not yet been claimed by a public client. A connection counts as in flight
//! from the moment it is dialed until its tunnel handshake resolves; only then
//! is a replacement dialed.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{net::TcpStream, sync::watch, time};

use crate::lanbridge::{
    net, telemetry,
    tunnel::{
        cryptor::{ChaCha20Cryptor, Cryptor},
        handshake::Handshaker,
        relay,
    },
};

const FULL_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub relay_addr: String,
    pub app_addr: String,
    /// Tunnel secret from the bind response.
    pub secret: String,
    pub max_ready: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    pub encrypt_key: Option<String>,
}

/// Readiness counter: connections dialed whose handshake has not resolved.
#[derive(Debug, Clone, Default)]
pub struct ReadyGauge(Arc<AtomicUsize>);

impl ReadyGauge {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn acquire(&self) -> ReadyGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        metrics::gauge!("lanbridge_pool_in_flight").increment(1.0);
        ReadyGuard(self.0.clone())
    }
}

struct ReadyGuard(Arc<AtomicUsize>);

impl Drop for ReadyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
        metrics::gauge!("lanbridge_pool_in_flight").decrement(1.0);
    }
}

/// Delay after the `failures`-th consecutive failed dial.
pub fn dial_backoff(failures: u32) -> Duration {
    match failures {
        0..=3 => Duration::from_millis(100),
        4..=8 => Duration::from_secs(1),
        _ => Duration::from_secs(5),
    }
}

pub struct ConnectionPool {
    opts: Arc<PoolOptions>,
    handshaker: Handshaker,
    in_flight: ReadyGauge,
}

impl ConnectionPool {
    pub fn new(opts: PoolOptions) -> Self {
        let handshaker = Handshaker::new(&opts.secret);
        Self {
            opts: Arc::new(opts),
            handshaker,
            in_flight: ReadyGauge::default(),
        }
    }

    pub fn in_flight(&self) -> ReadyGauge {
        self.in_flight.clone()
    }

    /// Keep the pool topped up until `closed` flips to true.
    ///
    /// Dial failures are retried forever with [`dial_backoff`].
    pub async fn run(&self, mut closed: watch::Receiver<bool>) {
        tracing::info!(
            relay = %self.opts.relay_addr,
            app = %self.opts.app_addr,
            max_ready = self.opts.max_ready,
            "pool: started"
        );

        let mut failures = 0u32;
        loop {
            if *closed.borrow() {
                break;
            }

            if self.in_flight.get() >= self.opts.max_ready {
                tokio::select! {
                    _ = closed_signal(&mut closed) => break,
                    _ = time::sleep(FULL_POLL_INTERVAL) => {}
                }
                continue;
            }

            let dialed = tokio::select! {
                _ = closed_signal(&mut closed) => break,
                r = net::dial_tcp(&self.opts.relay_addr, self.opts.connect_timeout) => r,
            };
            match dialed {
                Ok(conn) => {
                    failures = 0;
                    let guard = self.in_flight.acquire();
                    tracing::debug!(
                        relay = %self.opts.relay_addr,
                        in_flight = self.in_flight.get(),
                        max_ready = self.opts.max_ready,
                        "pool: ready connection dialed"
                    );
                    tokio::spawn(serve_ready(
                        self.opts.clone(),
                        self.handshaker.clone(),
                        conn,
                        guard,
                        closed.clone(),
                    ));
                }
                Err(err) => {
                    failures = failures.saturating_add(1);
                    let delay = dial_backoff(failures);
                    tracing::warn!(
                        relay = %self.opts.relay_addr,
                        failures,
                        err = %format!("{err:#}"),
                        "pool: dial relay failed; retrying in {}",
                        humantime::format_duration(delay)
                    );
                    tokio::select! {
                        _ = closed_signal(&mut closed) => break,
                        _ = time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!(relay = %self.opts.relay_addr, "pool: stopped");
    }
}

async fn serve_ready(
    opts: Arc<PoolOptions>,
    handshaker: Handshaker,
    mut relay_conn: TcpStream,
    guard: ReadyGuard,
    mut closed: watch::Receiver<bool>,
) {
    // Idle until the relay server pairs this connection with a public client.
    let res = tokio::select! {
        _ = closed_signal(&mut closed) => return,
        r = handshaker.respond(&mut relay_conn, None, opts.handshake_timeout) => r,
    };
    drop(guard);
    if let Err(err) = res {
        tracing::debug!(err = %err, "pool: relay handshake failed");
        return;
    }

    let app = match net::dial_tcp(&opts.app_addr, opts.connect_timeout).await {
        Ok(c) => c,
        Err(err) => {
            tracing::warn!(app = %opts.app_addr, err = %format!("{err:#}"), "pool: dial app failed");
            return;
        }
    };

    let cryptor = match opts.encrypt_key.as_deref() {
        None => None,
        Some(key) => match encrypt_handshake(&mut relay_conn, key, opts.handshake_timeout).await {
            Ok(c) => Some(c),
            Err(err) => {
                tracing::warn!(err = %format!("{err:#}"), "pool: encrypt handshake failed");
                return;
            }
        },
    };

    tracing::debug!(app = %opts.app_addr, encrypted = cryptor.is_some(), "pool: relaying");
    let stats = relay::relay(app, relay_conn, opts.idle_timeout, cryptor).await;
    telemetry::record_relay_bytes("agent", &stats);
    tracing::debug!(
        app = %opts.app_addr,
        up = stats.a_to_b,
        down = stats.b_to_a,
        end = ?stats.end,
        "pool: relay finished"
    );
}

/// Prove the encryption key to the decrypting client before switching the
/// stream to ciphertext.
async fn encrypt_handshake(
    conn: &mut TcpStream,
    key: &str,
    timeout: Duration,
) -> anyhow::Result<Arc<dyn Cryptor>> {
    let cryptor = ChaCha20Cryptor::new(key)?;
    Handshaker::new(key).challenge(conn, timeout).await?;
    Ok(Arc::new(cryptor))
}

async fn closed_signal(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|c| *c).await;
}
