use std::{borrow::Cow, time::Duration};

use anyhow::Context;
use tokio::{net::TcpStream, time};

/// Normalize a bind/listen address.
///
/// Configs and bind requests commonly use the shorthand `":PORT"` to mean
/// "bind on all interfaces". Rust's `SocketAddr` parsing and Tokio bind APIs
/// do not accept `":PORT"`, so we normalize it to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Host part of a `host:port` / `[v6]:port` address, brackets kept for IPv6.
pub fn host_of(addr: &str) -> &str {
    let addr = addr.trim();
    match addr.rsplit_once(':') {
        Some((host, _port)) if !host.is_empty() => host,
        _ => addr,
    }
}

/// Replace the port of `addr` with `port`, keeping its host.
///
/// Used by the agent to reach the relay listener: the bind server reports a
/// port, and the relay lives on the same public host as the bind server.
pub fn with_port(addr: &str, port: u16) -> String {
    let host = host_of(addr);
    if host.is_empty() || host.starts_with(':') {
        return format!("127.0.0.1:{port}");
    }
    format!("{host}:{port}")
}

/// `host:port`, bracketing a bare IPv6 host.
pub fn join_host_port(host: &str, port: u16) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Dial a TCP address, bounding the attempt by `timeout` (zero = OS default).
pub async fn dial_tcp(addr: &str, timeout: Duration) -> anyhow::Result<TcpStream> {
    let c = if timeout > Duration::from_millis(0) {
        time::timeout(timeout, TcpStream::connect(addr))
            .await
            .with_context(|| format!("dial timeout {addr}"))?
            .with_context(|| format!("dial {addr}"))?
    } else {
        TcpStream::connect(addr)
            .await
            .with_context(|| format!("dial {addr}"))?
    };
    let _ = c.set_nodelay(true);
    Ok(c)
}
