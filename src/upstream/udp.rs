//! Plain DNS over UDP, used for bootstrap lookups and `udp://` upstreams.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::{next_query_id, UpstreamClient};

/// Largest response accepted over UDP (EDNS-sized)
const MAX_UDP_RESPONSE: usize = 4096;

/// Send one query to `server` and wait for the response with a matching ID
pub(crate) async fn exchange_udp(
    server: SocketAddr,
    message: &Message,
    timeout: Duration,
) -> Result<Message> {
    let bind_addr: SocketAddr = if server.is_ipv4() {
        (Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (Ipv6Addr::UNSPECIFIED, 0).into()
    };

    let socket = UdpSocket::bind(bind_addr)
        .await
        .context("Failed to bind UDP socket")?;
    socket
        .connect(server)
        .await
        .with_context(|| format!("Failed to connect UDP socket to {}", server))?;

    let wire_format = message.to_vec()?;
    let expected_id = message.id();

    let exchange = async {
        socket.send(&wire_format).await?;
        trace!("Sent UDP query to {} ({} bytes)", server, wire_format.len());

        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        loop {
            let len = socket.recv(&mut buf).await?;
            match Message::from_bytes(&buf[..len]) {
                Ok(response) if response.id() == expected_id => {
                    return Ok::<_, anyhow::Error>(response);
                }
                Ok(response) => {
                    trace!(
                        "Ignoring UDP response from {} with id {} (expected {})",
                        server,
                        response.id(),
                        expected_id
                    );
                }
                Err(e) => {
                    trace!("Ignoring malformed UDP response from {}: {}", server, e);
                }
            }
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("UDP query to {} timed out after {:?}", server, timeout))?
}

/// Plain DNS upstream
pub struct UdpClient {
    name: String,
    server: SocketAddr,
    timeout: Duration,
}

impl UdpClient {
    pub fn new(name: String, server: SocketAddr, timeout: Duration) -> Self {
        Self {
            name,
            server,
            timeout,
        }
    }
}

#[async_trait]
impl UpstreamClient for UdpClient {
    async fn query(&self, mut message: Message) -> Result<Message> {
        message.set_id(next_query_id());

        debug!(
            "[{}] UDP query for {:?}",
            self.name,
            message.queries().first().map(|q| q.name().to_string())
        );

        exchange_udp(self.server, &message, self.timeout).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}
