//! Decrypting endpoint for encrypted tunnels.
//!
//! Listens locally and forwards each connection to a tunnel's public address.
//! With an encryption key it answers the agent's key handshake and relays
//! through a cryptor; without one it is a plain forwarder.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
    time,
};

use crate::lanbridge::{
    net, telemetry,
    tunnel::{
        cryptor::{ChaCha20Cryptor, Cryptor},
        handshake::Handshaker,
        relay,
    },
};

#[derive(Debug, Clone)]
pub struct LocalClientOptions {
    pub listen_addr: String,
    /// Public address of the tunnel.
    pub server_addr: String,
    pub encrypt_key: Option<String>,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub idle_timeout: Duration,
}

pub struct LocalClient {
    opts: Arc<LocalClientOptions>,
}

impl LocalClient {
    pub fn new(opts: LocalClientOptions) -> anyhow::Result<Self> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("client: server_addr is required");
        }
        if let Some(key) = opts.encrypt_key.as_deref() {
            ChaCha20Cryptor::new(key).context("client: encrypt_key")?;
        }
        Ok(Self {
            opts: Arc::new(opts),
        })
    }

    pub async fn listen_and_serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let bind_addr = net::normalize_bind_addr(&self.opts.listen_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("client: listen {}", self.opts.listen_addr))?;
        self.serve(ln, shutdown).await
    }

    pub async fn serve(
        &self,
        ln: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        tracing::info!(
            listen = %ln.local_addr()?,
            server = %self.opts.server_addr,
            encrypted = self.opts.encrypt_key.is_some(),
            "client: listening"
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
                            tracing::warn!(err = %err, "client: accept failed");
                            time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    let opts = self.opts.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_local(opts, conn, peer).await {
                            tracing::warn!(peer = %peer, err = %format!("{err:#}"), "client: connection failed");
                        }
                    });
                }
            }
        }
        Ok(())
    }
}

async fn handle_local(
    opts: Arc<LocalClientOptions>,
    local: TcpStream,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let _ = local.set_nodelay(true);
    let mut server = net::dial_tcp(&opts.server_addr, opts.connect_timeout).await?;

    let cryptor: Option<Arc<dyn Cryptor>> = match opts.encrypt_key.as_deref() {
        None => None,
        Some(key) => {
            let c = ChaCha20Cryptor::new(key)?;
            Handshaker::new(key)
                .respond(&mut server, Some(opts.handshake_timeout), opts.handshake_timeout)
                .await
                .context("encrypt handshake")?;
            Some(Arc::new(c))
        }
    };

    tracing::debug!(peer = %peer, server = %opts.server_addr, "client: relaying");
    let stats = relay::relay(local, server, opts.idle_timeout, cryptor).await;
    telemetry::record_relay_bytes("client", &stats);
    tracing::debug!(
        peer = %peer,
        up = stats.a_to_b,
        down = stats.b_to_a,
        end = ?stats.end,
        "client: relay finished"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::lanbridge::tunnel::agent::{
        Agent,
        tests::{agent_opts, spawn_bind_server, spawn_echo_app, wait_bound},
    };

    async fn encrypted_tunnel(key: &str) -> (String, watch::Sender<bool>, watch::Sender<bool>) {
        let app = spawn_echo_app().await;
        let (server, _tunnels, srv_tx) = spawn_bind_server("k", false).await;

        let mut o = agent_opts(server, app, "k");
        o.encrypt_key = Some(key.into());
        let agent = Arc::new(Agent::new(o).unwrap());
        let mut state = agent.state();
        let (agent_tx, rx) = watch::channel(false);
        tokio::spawn({
            let agent = agent.clone();
            async move { agent.run(rx).await }
        });
        (wait_bound(&mut state).await, srv_tx, agent_tx)
    }

    async fn spawn_client(server_addr: String, key: Option<&str>) -> (String, watch::Sender<bool>) {
        let client = LocalClient::new(LocalClientOptions {
            listen_addr: "127.0.0.1:0".into(),
            server_addr,
            encrypt_key: key.map(str::to_string),
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            idle_timeout: Duration::ZERO,
        })
        .unwrap();
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move { client.serve(ln, rx).await });
        (addr, tx)
    }

    #[tokio::test]
    async fn encrypted_tunnel_round_trips_through_client() {
        let (public, _s, _a) = encrypted_tunnel("secret").await;
        let (local, _c) = spawn_client(public, Some("secret")).await;

        let mut c = TcpStream::connect(&local).await.unwrap();
        c.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        time::timeout(Duration::from_secs(5), c.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"hello");
    }

    #[tokio::test]
    async fn public_side_carries_ciphertext() {
        let (public, _s, _a) = encrypted_tunnel("secret").await;

        let mut raw = TcpStream::connect(&public).await.unwrap();
        Handshaker::new("secret")
            .respond(&mut raw, Some(Duration::from_secs(3)), Duration::from_secs(2))
            .await
            .unwrap();
        let ours = ChaCha20Cryptor::new("secret").unwrap();

        let mut out = *b"hello";
        ours.encrypt(&mut out);
        raw.write_all(&out).await.unwrap();

        let mut wire = [0u8; 5];
        time::timeout(Duration::from_secs(5), raw.read_exact(&mut wire))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(&wire, b"hello");
        ours.decrypt(&mut wire);
        assert_eq!(&wire, b"hello");
    }

    #[tokio::test]
    async fn wrong_key_client_is_refused() {
        let (public, _s, _a) = encrypted_tunnel("secret").await;
        let (local, _c) = spawn_client(public, Some("guess")).await;

        let mut c = TcpStream::connect(&local).await.unwrap();
        let _ = c.write_all(b"hello").await;
        let mut got = Vec::new();
        let n = time::timeout(Duration::from_secs(5), c.read_to_end(&mut got))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn without_key_forwards_plain_bytes() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap().to_string();
        let seen = tokio::spawn(async move {
            let (mut c, _) = upstream.accept().await.unwrap();
            let mut b = [0u8; 5];
            c.read_exact(&mut b).await.unwrap();
            c.write_all(b"world").await.unwrap();
            b
        });

        let (local, _c) = spawn_client(upstream_addr, None).await;
        let mut c = TcpStream::connect(&local).await.unwrap();
        c.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        time::timeout(Duration::from_secs(5), c.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&got, b"world");
        // No handshake bytes precede the payload.
        assert_eq!(&seen.await.unwrap(), b"hello");
    }

    #[test]
    fn empty_key_is_rejected() {
        let err = LocalClient::new(LocalClientOptions {
            listen_addr: "127.0.0.1:0".into(),
            server_addr: "127.0.0.1:1".into(),
            encrypt_key: Some(String::new()),
            connect_timeout: Duration::from_secs(1),
            handshake_timeout: Duration::from_secs(1),
            idle_timeout: Duration::ZERO,
        })
        .err()
        .unwrap();
        assert!(format!("{err:#}").contains("empty encryption key"));
    }
}
