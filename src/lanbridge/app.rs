use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{net::TcpListener, sync::watch, task::JoinSet};

use crate::lanbridge::{
    admin,
    config::{self, AgentConfig, ClientConfig, ServerConfig},
    logging, net, telemetry,
    tunnel::{
        agent::{Agent, AgentOptions},
        bind_server::{BindServer, BindServerOptions},
        local_client::{LocalClient, LocalClientOptions},
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;
    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let _logrt = logging::init(&cfg.logging)?;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    tracing::info!(
        config = %resolved.path.display(),
        source = %resolved.source,
        servers = cfg.servers.len(),
        agents = cfg.agents.len(),
        clients = cfg.clients.len(),
        admin_addr = %cfg.admin_addr,
        "lanbridge: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let tunnels = Arc::new(telemetry::TunnelRegistry::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    if !cfg.admin_addr.is_empty() {
        let bind_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let ln = TcpListener::bind(bind_addr.as_ref())
            .await
            .with_context(|| format!("admin: listen {}", cfg.admin_addr))?;
        let state = admin::AdminState {
            prom: prom.clone(),
            tunnels: tunnels.clone(),
        };
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(ln, state, shutdown).await });
    }

    for (i, s) in cfg.servers.iter().enumerate() {
        let server = BindServer::new(server_options(s, tunnels.clone()))
            .with_context(|| format!("servers[{i}]"))?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { server.listen_and_serve(shutdown).await });
    }

    for (i, a) in cfg.agents.iter().enumerate() {
        let agent = Agent::new(agent_options(a)).with_context(|| format!("agents[{i}]"))?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { agent.run(shutdown).await });
    }

    for (i, c) in cfg.clients.iter().enumerate() {
        let client =
            LocalClient::new(client_options(c)).with_context(|| format!("clients[{i}]"))?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { client.listen_and_serve(shutdown).await });
    }

    // Run until a signal arrives or a role fails.
    let result = loop {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("shutdown: signal");
                break Ok(());
            }
            res = tasks.join_next() => match res {
                None => break Ok(()),
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(err))) => {
                    tracing::error!(err = %format!("{err:#}"), "lanbridge: role failed");
                    break Err(err);
                }
                Some(Err(join_err)) => break Err(join_err.into()),
            }
        }
    };

    let _ = shutdown_tx.send(true);

    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(
            timeout = %humantime::format_duration(DRAIN_TIMEOUT),
            "shutdown: drain timed out; aborting remaining tasks"
        );
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

fn server_options(s: &ServerConfig, tunnels: telemetry::SharedTunnels) -> BindServerOptions {
    BindServerOptions {
        listen_addr: s.listen_addr.clone(),
        bind_key: s.bind_key.clone(),
        relay_bind_host: s.relay_bind_host.clone(),
        handshake_timeout: s.handshake_timeout,
        pair_timeout: s.pair_timeout,
        idle_timeout: s.idle_timeout,
        heartbeat: s.heartbeat,
        tls: s.tls.clone(),
        tunnels,
    }
}

fn agent_options(a: &AgentConfig) -> AgentOptions {
    AgentOptions {
        server_addr: a.server_addr.clone(),
        open_addr: a.open_addr.clone(),
        app_addr: a.app_addr.clone(),
        bind_key: a.bind_key.clone(),
        max_ready: a.max_ready,
        connect_timeout: a.connect_timeout,
        handshake_timeout: a.handshake_timeout,
        idle_timeout: a.idle_timeout,
        heartbeat: a.heartbeat,
        rebind_backoff: a.rebind_backoff,
        encrypt_key: a.encrypt_key.clone(),
        tls: a.tls.clone(),
    }
}

fn client_options(c: &ClientConfig) -> LocalClientOptions {
    LocalClientOptions {
        listen_addr: c.listen_addr.clone(),
        server_addr: c.server_addr.clone(),
        encrypt_key: c.encrypt_key.clone(),
        connect_timeout: c.connect_timeout,
        handshake_timeout: c.handshake_timeout,
        idle_timeout: c.idle_timeout,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
