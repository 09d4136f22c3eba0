//! WAN-side control listener.
//!
//! Per agent connection: authenticate with the bind key, read one bind
//! request, start a [`RelayServer`] for it, reply with the relay port and a
//! fresh tunnel secret, then echo liveness bytes until the connection ends.
//! The relay server lives exactly as long as the control connection.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};

use crate::lanbridge::{
    net,
    telemetry::{self, SharedTunnels, TunnelInfo},
    tunnel::{
        handshake::Handshaker,
        protocol::{self, BindResponse, MESSAGE_SUCCESS},
        relay_server::{RelayServer, RelayServerOptions},
        transport::{self, BoxedStream, ControlTransport, ServerTlsOptions},
    },
};

/// Missed heartbeats before the peer is considered gone.
pub const HEARTBEAT_MISSES: u32 = 3;

#[derive(Debug, Clone)]
pub struct BindServerOptions {
    pub listen_addr: String,
    pub bind_key: String,
    pub relay_bind_host: String,
    pub handshake_timeout: Duration,
    pub pair_timeout: Duration,
    pub idle_timeout: Duration,
    pub heartbeat: Duration,
    pub tls: ServerTlsOptions,
    pub tunnels: SharedTunnels,
}

pub struct BindServer {
    opts: Arc<BindServerOptions>,
    transport: Arc<dyn ControlTransport>,
}

impl BindServer {
    pub fn new(opts: BindServerOptions) -> anyhow::Result<Self> {
        let transport = transport::server_transport(&opts.tls)?;
        Ok(Self {
            opts: Arc::new(opts),
            transport,
        })
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("bind: listen {}", self.opts.listen_addr))?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            addr = %ln.local_addr()?,
            transport = %self.transport.name(),
            "bind: listening"
        );

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = ln.accept() => {
                    let (conn, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "bind: accept failed");
                            time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let opts = self.opts.clone();
                    let tr = self.transport.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_agent(opts, tr, conn, peer, shutdown).await {
                            metrics::counter!("lanbridge_bind_failures_total").increment(1);
                            tracing::warn!(peer = %peer, err = %format!("{err:#}"), "bind: agent rejected");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

async fn handle_agent(
    opts: Arc<BindServerOptions>,
    transport: Arc<dyn ControlTransport>,
    conn: TcpStream,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let _ = conn.set_nodelay(true);
    tracing::debug!(peer = %peer, "bind: connection accepted");

    let mut ctl = bounded(opts.handshake_timeout, transport.wrap(conn))
        .await
        .context("control transport")??;

    Handshaker::new(&opts.bind_key)
        .challenge(&mut ctl, opts.handshake_timeout)
        .await
        .context("bind handshake")?;

    let req = bounded(opts.handshake_timeout, protocol::read_bind_request(&mut ctl))
        .await
        .context("read bind request")??;

    let heartbeat = whole_seconds(opts.heartbeat);
    let secret = hex::encode(rand::random::<[u8; 16]>());
    let open_addr = req.open_address.to_bind_addr();
    let relay = RelayServer::start(RelayServerOptions {
        relay_bind_addr: net::join_host_port(&opts.relay_bind_host, 0),
        open_addr: open_addr.clone(),
        secret: secret.clone(),
        handshake_timeout: opts.handshake_timeout,
        pair_timeout: opts.pair_timeout,
        idle_timeout: opts.idle_timeout,
    })
    .await;
    let relay = match relay {
        Ok(r) => r,
        Err(err) => {
            let resp = BindResponse::failure(&req.client_name, format!("{err:#}"));
            let _ = bounded(opts.handshake_timeout, protocol::write_line(&mut ctl, &resp)).await;
            let _ = ctl.shutdown().await;
            return Err(err);
        }
    };

    let resp = BindResponse {
        message: MESSAGE_SUCCESS.into(),
        client_name: req.client_name.clone(),
        relay_address: relay.relay_addr().to_string(),
        relay_port: relay.relay_addr().port(),
        open_address: relay.public_addr().to_string(),
        handshake_key: secret,
        heartbeat: heartbeat_secs(heartbeat),
    };
    let written = bounded(opts.handshake_timeout, protocol::write_line(&mut ctl, &resp))
        .await
        .and_then(|r| r.map_err(anyhow::Error::from));
    if let Err(err) = written {
        relay.close().await;
        return Err(err.context("write bind response"));
    }

    let id = telemetry::new_tunnel_id();
    opts.tunnels.add(TunnelInfo {
        id: id.clone(),
        client_name: req.client_name.clone(),
        peer: peer.to_string(),
        public_addr: relay.public_addr().to_string(),
        relay_addr: relay.relay_addr().to_string(),
        started_at_unix_ms: telemetry::now_unix_ms(),
    });
    metrics::counter!("lanbridge_binds_total").increment(1);
    tracing::info!(
        tunnel = %id,
        peer = %peer,
        client = %req.client_name,
        public = %relay.public_addr(),
        relay = %relay.relay_addr(),
        "bind: tunnel up"
    );

    let res = keep_alive(&mut ctl, heartbeat, shutdown).await;

    relay.close().await;
    opts.tunnels.remove(&id);
    match res {
        Ok(()) => tracing::info!(tunnel = %id, peer = %peer, "bind: tunnel down"),
        Err(err) => tracing::info!(tunnel = %id, peer = %peer, err = %err, "bind: tunnel down"),
    }
    Ok(())
}

/// Echo every byte the agent sends until it closes, errors, or goes quiet for
/// [`HEARTBEAT_MISSES`] heartbeat intervals.
async fn keep_alive(
    ctl: &mut BoxedStream,
    heartbeat: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let dead_after = heartbeat * HEARTBEAT_MISSES;
    let mut buf = [0u8; 256];
    loop {
        let read = async {
            if heartbeat.is_zero() {
                ctl.read(&mut buf).await
            } else {
                time::timeout(dead_after, ctl.read(&mut buf))
                    .await
                    .unwrap_or_else(|_| {
                        Err(io::Error::new(io::ErrorKind::TimedOut, "heartbeat missed"))
                    })
            }
        };
        let n = tokio::select! {
            _ = shutdown.wait_for(|s| *s) => return Ok(()),
            r = read => r?,
        };
        if n == 0 {
            return Ok(());
        }
        ctl.write_all(&buf[..n]).await?;
        ctl.flush().await?;
    }
}

/// The agent only learns whole seconds, so the server must time out on the same value.
fn whole_seconds(hb: Duration) -> Duration {
    Duration::from_secs(hb.as_secs_f64().ceil() as u64)
}

fn heartbeat_secs(hb: Duration) -> Option<u64> {
    if hb.is_zero() {
        return None;
    }
    Some(hb.as_secs())
}

async fn bounded<F: std::future::Future>(t: Duration, fut: F) -> anyhow::Result<F::Output> {
    time::timeout(t, fut)
        .await
        .map_err(|_| anyhow::anyhow!("timed out after {t:?}"))
}
