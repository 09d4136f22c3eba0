use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::lanbridge::tunnel::transport::{BoxedStream, ControlTransport};

pub struct PlainTransport;

impl PlainTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ControlTransport for PlainTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn wrap(&self, tcp: TcpStream) -> anyhow::Result<BoxedStream> {
        Ok(Box::new(tcp))
    }
}
