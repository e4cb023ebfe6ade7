//! DNS over TLS (DOT) client implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use rustls::pki_types::ServerName;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace};

use super::{next_query_id, Bootstrap, UpstreamClient};

/// DNS over TLS client
pub struct DotClient {
    name: String,
    host: String,
    port: u16,
    server_name: ServerName<'static>,
    bootstrap: Bootstrap,
    tls_connector: TlsConnector,
}

impl DotClient {
    /// Create a new DOT client for `host:port`. A hostname is resolved
    /// through `bootstrap` on each connection.
    pub fn new(name: String, host: String, port: u16, bootstrap: Bootstrap) -> Result<Self> {
        // Build TLS config with default root certificates
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls_connector = TlsConnector::from(Arc::new(tls_config));

        let server_name = ServerName::try_from(host.clone())
            .map_err(|_| anyhow::anyhow!("Invalid server name: {}", host))?;

        Ok(Self {
            name,
            host,
            port,
            server_name,
            bootstrap,
            tls_connector,
        })
    }

    /// Connect to the first reachable address of the DOT server
    async fn connect(&self) -> Result<TcpStream> {
        let ips: Vec<IpAddr> = match self.host.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self.bootstrap.lookup(&self.host).await?,
        };

        let mut last_error = None;
        for ip in ips {
            let addr = SocketAddr::new(ip, self.port);
            trace!("Connecting to DOT server {} ({})", self.host, addr);
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.map(anyhow::Error::from).unwrap_or_else(|| anyhow::anyhow!("no addresses")))
            .with_context(|| format!("Failed to connect to DOT server {}:{}", self.host, self.port))
    }

    /// Send a DNS query over TLS
    async fn send_query(&self, message: &Message) -> Result<Message> {
        let tcp_stream = self.connect().await?;

        // Perform TLS handshake
        let mut tls_stream = self
            .tls_connector
            .connect(self.server_name.clone(), tcp_stream)
            .await
            .context("TLS handshake failed")?;

        // Serialize DNS message
        let wire_format = message.to_vec()?;
        let len = u16::try_from(wire_format.len()).context("DNS message too large for DOT")?;

        // Send length-prefixed message
        tls_stream.write_all(&len.to_be_bytes()).await?;
        tls_stream.write_all(&wire_format).await?;
        tls_stream.flush().await?;

        trace!("Sent DOT query ({} bytes)", wire_format.len());

        // Read response length
        let mut len_buf = [0u8; 2];
        tls_stream.read_exact(&mut len_buf).await?;
        let response_len = u16::from_be_bytes(len_buf) as usize;

        // Read response
        let mut response_buf = vec![0u8; response_len];
        tls_stream.read_exact(&mut response_buf).await?;

        trace!("Received DOT response ({} bytes)", response_len);

        let response = Message::from_bytes(&response_buf).context("Failed to parse DOT response")?;
        if response.id() != message.id() {
            anyhow::bail!(
                "DOT response id {} does not match query id {}",
                response.id(),
                message.id()
            );
        }

        Ok(response)
    }
}

#[async_trait]
impl UpstreamClient for DotClient {
    async fn query(&self, mut message: Message) -> Result<Message> {
        message.set_id(next_query_id());

        debug!(
            "[{}] DOT query for {:?}",
            self.name,
            message.queries().first().map(|q| q.name().to_string())
        );

        self.send_query(&message).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{build_query, domain_name};
    use hickory_proto::rr::RecordType;
    use std::time::Duration;

    #[test]
    fn test_new_accepts_ip_and_hostname() {
        let bootstrap = Bootstrap::parse(&["1.1.1.1".to_string()], Duration::from_secs(1)).unwrap();
        assert!(DotClient::new("ip".to_string(), "9.9.9.9".to_string(), 853, bootstrap.clone()).is_ok());
        assert!(DotClient::new("host".to_string(), "dns.quad9.net".to_string(), 853, bootstrap).is_ok());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Grab a free port, then close it so the connection is refused
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let bootstrap = Bootstrap::parse(&[], Duration::from_secs(1)).unwrap();
        let client = DotClient::new("local".to_string(), "127.0.0.1".to_string(), port, bootstrap).unwrap();

        let query = build_query(domain_name("example.test").unwrap(), RecordType::A);
        let err = client.query(query).await.unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to connect"));
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_dot_quad9() {
        let bootstrap = Bootstrap::parse(&["9.9.9.9".to_string()], Duration::from_secs(5)).unwrap();
        let client = DotClient::new(
            "quad9".to_string(),
            "dns.quad9.net".to_string(),
            853,
            bootstrap,
        )
        .unwrap();

        let query = build_query(domain_name("example.com").unwrap(), RecordType::A);
        let response = client.query(query).await.unwrap();

        assert!(!response.answers().is_empty());
    }
}
