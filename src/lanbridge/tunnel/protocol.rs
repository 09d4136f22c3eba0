//! Control-plane messages: one JSON object per line.
//!
//! Lines are read one byte at a time so nothing past the `\n` is consumed;
//! the same stream continues as the liveness channel right after the bind
//! response.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::lanbridge::net;

pub const ACTION_BIND: &str = "bind";
pub const MESSAGE_SUCCESS: &str = "success";

pub const MAX_CONTROL_LINE_BYTES: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("control line exceeds {0} bytes")]
    LineTooLong(usize),
    #[error("connection closed")]
    Closed,
    #[error("unexpected action {0:?}")]
    BadAction(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Public endpoint a bind request asks for: `"ip:port"`, `":port"` or a bare port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenAddress {
    Port(u16),
    Addr(String),
}

impl OpenAddress {
    /// A bare number is a port, anything else an address.
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        match s.parse::<u16>() {
            Ok(p) => OpenAddress::Port(p),
            Err(_) => OpenAddress::Addr(s.to_string()),
        }
    }

    pub fn to_bind_addr(&self) -> String {
        match self {
            OpenAddress::Port(p) => format!("0.0.0.0:{p}"),
            OpenAddress::Addr(a) => net::normalize_bind_addr(a).into_owned(),
        }
    }
}

impl std::fmt::Display for OpenAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenAddress::Port(p) => write!(f, ":{p}"),
            OpenAddress::Addr(a) => write!(f, "{a}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindRequest {
    pub action: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(alias = "openPort")]
    pub open_address: OpenAddress,
}

impl BindRequest {
    pub fn new(client_name: impl Into<String>, open_address: OpenAddress) -> Self {
        Self {
            action: ACTION_BIND.into(),
            client_name: client_name.into(),
            open_address,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindResponse {
    pub message: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default)]
    pub relay_address: String,
    #[serde(default)]
    pub relay_port: u16,
    #[serde(default)]
    pub open_address: String,
    #[serde(default)]
    pub handshake_key: String,
    /// Liveness interval in seconds chosen by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<u64>,
}

impl BindResponse {
    pub fn failure(client_name: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            client_name: client_name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.message == MESSAGE_SUCCESS
    }
}

pub async fn write_line<W, T>(w: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut b = serde_json::to_vec(msg)?;
    b.push(b'\n');
    w.write_all(&b).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_line<R, T>(r: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::with_capacity(256);
    loop {
        let mut b = [0u8; 1];
        let n = r.read(&mut b).await?;
        if n == 0 {
            return Err(ProtocolError::Closed);
        }
        if b[0] == b'\n' {
            break;
        }
        if buf.len() >= MAX_CONTROL_LINE_BYTES {
            return Err(ProtocolError::LineTooLong(MAX_CONTROL_LINE_BYTES));
        }
        buf.push(b[0]);
    }
    Ok(serde_json::from_slice(&buf)?)
}

pub async fn read_bind_request<R: AsyncRead + Unpin>(r: &mut R) -> Result<BindRequest, ProtocolError> {
    let mut req: BindRequest = read_line(r).await?;
    req.action = req.action.trim().to_ascii_lowercase();
    if req.action != ACTION_BIND {
        return Err(ProtocolError::BadAction(req.action));
    }
    req.client_name = req.client_name.trim().to_string();
    Ok(req)
}
