use std::{io, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
    time,
};

use crate::lanbridge::{
    net, telemetry,
    tunnel::{
        bind_server::HEARTBEAT_MISSES,
        handshake::Handshaker,
        pool::{ConnectionPool, PoolOptions},
        protocol::{self, BindRequest, BindResponse, OpenAddress},
        transport::{self, BoxedStream, ClientTlsOptions, ControlTransport},
    },
};

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub server_addr: String,
    pub open_addr: String,
    pub app_addr: String,
    pub bind_key: String,
    pub max_ready: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
    /// Used when the bind server does not announce one.
    pub heartbeat: Duration,
    pub rebind_backoff: Duration,
    pub encrypt_key: Option<String>,
    pub tls: ClientTlsOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Binding,
    Bound {
        /// Public address allocated by the bind server.
        open_address: String,
        /// Relay listener the pool dials.
        relay_addr: String,
    },
}

/// Binds one tunnel and keeps its ready pool filled, rebinding after any
/// control-channel failure.
pub struct Agent {
    opts: AgentOptions,
    transport: Arc<dyn ControlTransport>,
    state: watch::Sender<AgentState>,
}

impl Agent {
    pub fn new(opts: AgentOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("agent: server_addr is required");
        }
        if opts.app_addr.trim().is_empty() {
            anyhow::bail!("agent: app_addr is required");
        }
        let transport = transport::client_transport(&opts.tls, &opts.server_addr)?;
        let (state, _) = watch::channel(AgentState::Disconnected);
        Ok(Self {
            opts,
            transport,
            state,
        })
    }

    pub fn state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.run_once(shutdown.clone()).await {
                Ok(()) => {
                    self.state.send_replace(AgentState::Disconnected);
                    return Ok(());
                }
                Err(err) => {
                    self.state.send_replace(AgentState::Disconnected);
                    tracing::warn!(
                        server = %self.opts.server_addr,
                        err = %format!("{err:#}"),
                        backoff = %humantime::format_duration(self.opts.rebind_backoff),
                        "agent: disconnected; rebinding"
                    );
                }
            }

            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
                _ = time::sleep(self.opts.rebind_backoff) => {}
            }
        }
    }

    /// One bind plus the pool it feeds. `Ok` only on shutdown.
    async fn run_once(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.state.send_replace(AgentState::Binding);
        let (ctl, resp) = self.connect_and_bind().await?;

        let relay_addr = net::with_port(&self.opts.server_addr, resp.relay_port);
        let heartbeat = resp
            .heartbeat
            .map(Duration::from_secs)
            .unwrap_or(self.opts.heartbeat);

        tracing::info!(
            server = %self.opts.server_addr,
            public = %resp.open_address,
            relay = %relay_addr,
            app = %self.opts.app_addr,
            "agent: bound"
        );
        self.state.send_replace(AgentState::Bound {
            open_address: resp.open_address.clone(),
            relay_addr: relay_addr.clone(),
        });

        let pool = Arc::new(ConnectionPool::new(PoolOptions {
            relay_addr,
            app_addr: self.opts.app_addr.clone(),
            secret: resp.handshake_key.clone(),
            max_ready: self.opts.max_ready,
            connect_timeout: self.opts.connect_timeout,
            handshake_timeout: self.opts.handshake_timeout,
            idle_timeout: self.opts.idle_timeout,
            encrypt_key: self.opts.encrypt_key.clone(),
        }));

        let (closed_tx, closed_rx) = watch::channel(false);
        let pool_task = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run(closed_rx).await }
        });

        let res = tokio::select! {
            r = liveness(ctl, heartbeat) => match r {
                Ok(()) => Err(anyhow::anyhow!("control connection closed by server")),
                Err(err) => Err(anyhow::Error::from(err).context("control connection")),
            },
            _ = shutdown.wait_for(|s| *s) => Ok(()),
        };

        let _ = closed_tx.send(true);
        let _ = pool_task.await;
        res
    }

    /// Dial, authenticate, and request the tunnel.
    pub async fn connect_and_bind(&self) -> anyhow::Result<(BoxedStream, BindResponse)> {
        let tcp = net::dial_tcp(&self.opts.server_addr, self.opts.connect_timeout).await?;
        let local = tcp
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let hs = self.opts.handshake_timeout;
        let mut ctl = time::timeout(hs, self.transport.wrap(tcp))
            .await
            .context("control transport timed out")??;

        Handshaker::new(&self.opts.bind_key)
            .respond(&mut ctl, Some(hs), hs)
            .await
            .context("bind handshake")?;

        let req = BindRequest::new(local, OpenAddress::parse(&self.opts.open_addr));
        time::timeout(hs, protocol::write_line(&mut ctl, &req))
            .await
            .context("bind request timed out")?
            .context("write bind request")?;

        let resp: BindResponse = time::timeout(hs, protocol::read_line(&mut ctl))
            .await
            .context("bind response timed out")?
            .context("read bind response")?;
        if !resp.is_success() {
            anyhow::bail!("bind refused: {}", resp.message);
        }
        if resp.relay_port == 0 || resp.handshake_key.is_empty() {
            anyhow::bail!("bind response missing relay port or tunnel key");
        }
        Ok((ctl, resp))
    }
}

/// Heartbeat writer plus echo reader on the control connection.
///
/// Returns when the server closes the connection or either side fails.
async fn liveness(ctl: BoxedStream, heartbeat: Duration) -> io::Result<()> {
    let (rd, wr) = tokio::io::split(ctl);
    tokio::select! {
        r = send_heartbeats(wr, heartbeat) => r,
        r = read_echoes(rd, heartbeat) => r,
    }
}

async fn send_heartbeats<W: AsyncWrite + Unpin>(mut wr: W, heartbeat: Duration) -> io::Result<()> {
    if heartbeat.is_zero() {
        return std::future::pending().await;
    }
    let mut tick = time::interval(heartbeat);
    // The first tick completes immediately.
    tick.tick().await;
    loop {
        tick.tick().await;
        wr.write_all(format!("{}\n", telemetry::now_unix_ms()).as_bytes())
            .await?;
        wr.flush().await?;
    }
}

async fn read_echoes<R: AsyncRead + Unpin>(mut rd: R, heartbeat: Duration) -> io::Result<()> {
    let dead_after = heartbeat * HEARTBEAT_MISSES;
    let mut buf = [0u8; 256];
    loop {
        let n = if heartbeat.is_zero() {
            rd.read(&mut buf).await?
        } else {
            time::timeout(dead_after, rd.read(&mut buf))
                .await
                .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "heartbeat missed")))?
        };
        if n == 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::lanbridge::{
        telemetry::TunnelRegistry,
        tunnel::{
            bind_server::{BindServer, BindServerOptions},
            transport::ServerTlsOptions,
        },
    };

    pub(crate) async fn spawn_echo_app() -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut c, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = c.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    pub(crate) async fn spawn_bind_server(key: &str, tls: bool) -> (String, Arc<TunnelRegistry>, watch::Sender<bool>) {
        let tunnels = Arc::new(TunnelRegistry::new());
        let srv = BindServer::new(BindServerOptions {
            listen_addr: "127.0.0.1:0".into(),
            bind_key: key.into(),
            relay_bind_host: "127.0.0.1".into(),
            handshake_timeout: Duration::from_secs(2),
            pair_timeout: Duration::from_secs(3),
            idle_timeout: Duration::ZERO,
            heartbeat: Duration::from_secs(30),
            tls: ServerTlsOptions {
                enabled: tls,
                ..Default::default()
            },
            tunnels: tunnels.clone(),
        })
        .unwrap();
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move { srv.serve(ln, rx).await });
        (addr, tunnels, tx)
    }

    pub(crate) fn agent_opts(server_addr: String, app_addr: String, key: &str) -> AgentOptions {
        AgentOptions {
            server_addr,
            open_addr: "127.0.0.1:0".into(),
            app_addr,
            bind_key: key.into(),
            max_ready: 2,
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            idle_timeout: Duration::ZERO,
            heartbeat: Duration::from_secs(30),
            rebind_backoff: Duration::from_millis(200),
            encrypt_key: None,
            tls: ClientTlsOptions::default(),
        }
    }

    pub(crate) async fn wait_bound(state: &mut watch::Receiver<AgentState>) -> String {
        let s = time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, AgentState::Bound { .. })),
        )
        .await
        .unwrap()
        .unwrap()
        .clone();
        match s {
            AgentState::Bound { open_address, .. } => open_address,
            _ => unreachable!(),
        }
    }

    async fn echo_roundtrip(public: &str, msg: &[u8]) -> Vec<u8> {
        let mut c = TcpStream::connect(public).await.unwrap();
        c.write_all(msg).await.unwrap();
        let mut got = vec![0u8; msg.len()];
        time::timeout(Duration::from_secs(5), c.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        got
    }

    #[tokio::test]
    async fn public_client_reaches_lan_app() {
        let app = spawn_echo_app().await;
        let (server, tunnels, _srv_tx) = spawn_bind_server("k", false).await;

        let agent = Arc::new(Agent::new(agent_opts(server, app, "k")).unwrap());
        let mut state = agent.state();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(rx).await }
        });

        let public = wait_bound(&mut state).await;
        assert_eq!(echo_roundtrip(&public, b"hello").await, b"hello");
        assert_eq!(echo_roundtrip(&public, b"again").await, b"again");
        assert_eq!(tunnels.len(), 1);
    }

    #[tokio::test]
    async fn tls_control_channel() {
        let app = spawn_echo_app().await;
        let (server, _tunnels, _srv_tx) = spawn_bind_server("k", true).await;

        let mut o = agent_opts(server, app, "k");
        o.tls = ClientTlsOptions {
            enabled: true,
            insecure_skip_verify: true,
            ..Default::default()
        };
        let agent = Arc::new(Agent::new(o).unwrap());
        let mut state = agent.state();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(rx).await }
        });

        let public = wait_bound(&mut state).await;
        assert_eq!(echo_roundtrip(&public, b"hello").await, b"hello");
    }

    #[tokio::test]
    async fn wrong_bind_key_never_binds() {
        let app = spawn_echo_app().await;
        let (server, tunnels, _srv_tx) = spawn_bind_server("k", false).await;

        let agent = Agent::new(agent_opts(server, app, "k2")).unwrap();
        let Err(err) = agent.connect_and_bind().await else {
            panic!("bind with the wrong key must fail");
        };
        assert!(format!("{err:#}").contains("bind handshake"), "{err:#}");
        assert_eq!(tunnels.len(), 0);
    }

    #[tokio::test]
    async fn stopping_agent_closes_public_listener() {
        let app = spawn_echo_app().await;
        let (server, tunnels, _srv_tx) = spawn_bind_server("k", false).await;

        let agent = Arc::new(Agent::new(agent_opts(server, app, "k")).unwrap());
        let mut state = agent.state();
        let (tx, rx) = watch::channel(false);
        let run = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(rx).await }
        });
        let public = wait_bound(&mut state).await;

        tx.send(true).unwrap();
        time::timeout(Duration::from_secs(3), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(*agent.state().borrow(), AgentState::Disconnected);

        let deadline = time::Instant::now() + Duration::from_secs(3);
        while TcpStream::connect(&public).await.is_ok() {
            assert!(time::Instant::now() < deadline, "public listener still open");
            time::sleep(Duration::from_millis(50)).await;
        }
        time::sleep(Duration::from_millis(50)).await;
        assert_eq!(tunnels.len(), 0);
    }

    #[tokio::test]
    async fn agent_rebinds_after_server_drops_tunnel() {
        let app = spawn_echo_app().await;
        let (server, _tunnels, srv_tx) = spawn_bind_server("k", false).await;

        let agent = Arc::new(Agent::new(agent_opts(server.clone(), app, "k")).unwrap());
        let mut state = agent.state();
        let (_tx, rx) = watch::channel(false);
        tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(rx).await }
        });
        wait_bound(&mut state).await;

        // Server shutdown ends the control connection; the agent falls back
        // to rebinding.
        srv_tx.send(true).unwrap();
        time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| !matches!(s, AgentState::Bound { .. })),
        )
        .await
        .unwrap()
        .unwrap();
    }

    #[tokio::test]
    async fn silent_server_is_a_dead_peer() {
        let (_server_side, agent_side) = tokio::io::duplex(64);
        let started = time::Instant::now();
        let err = time::timeout(
            Duration::from_secs(2),
            read_echoes(agent_side, Duration::from_millis(100)),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn echoes_keep_the_control_channel_alive() {
        let (mut server_side, agent_side) = tokio::io::duplex(64);
        let reader = tokio::spawn(read_echoes(agent_side, Duration::from_millis(100)));
        for _ in 0..6 {
            time::sleep(Duration::from_millis(100)).await;
            server_side.write_all(b"1\n").await.unwrap();
        }
        assert!(!reader.is_finished());
        drop(server_side);
        time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn own_heartbeat_used_when_server_announces_none() {
        let relay_ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay_ln.local_addr().unwrap().port();
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = ln.local_addr().unwrap().to_string();

        let (marker_tx, marker_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut c, _) = ln.accept().await.unwrap();
            Handshaker::new("k")
                .challenge(&mut c, Duration::from_secs(2))
                .await
                .unwrap();
            let req = protocol::read_bind_request(&mut c).await.unwrap();
            let resp = BindResponse {
                message: protocol::MESSAGE_SUCCESS.into(),
                client_name: req.client_name,
                relay_port,
                handshake_key: "tunnel".into(),
                heartbeat: None,
                ..Default::default()
            };
            protocol::write_line(&mut c, &resp).await.unwrap();

            let mut line = Vec::new();
            let mut b = [0u8; 1];
            while c.read_exact(&mut b).await.is_ok() && b[0] != b'\n' {
                line.push(b[0]);
            }
            let _ = marker_tx.send(line);
            // Hold the connection open.
            let _keep = relay_ln;
            time::sleep(Duration::from_secs(5)).await;
        });

        let mut o = agent_opts(server, "127.0.0.1:1".into(), "k");
        o.heartbeat = Duration::from_millis(200);
        let agent = Arc::new(Agent::new(o).unwrap());
        let (_tx, rx) = watch::channel(false);
        tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(rx).await }
        });

        let marker = time::timeout(Duration::from_secs(2), marker_rx)
            .await
            .unwrap()
            .unwrap();
        let sent_at: u64 = String::from_utf8(marker).unwrap().parse().unwrap();
        assert!(sent_at > 0);
    }
}
