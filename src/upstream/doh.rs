//! DNS over HTTPS (DOH) client implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinDecodable;
use reqwest::{Client, Url};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::{Bootstrap, UpstreamClient};
use crate::config::DohMethod;

const DNS_MESSAGE: &str = "application/dns-message";

/// DNS over HTTPS client
pub struct DohClient {
    name: String,
    url: Url,
    method: DohMethod,
    client: Client,
}

impl DohClient {
    /// Create a new DOH client. Hostnames in `url` are looked up through the
    /// bootstrap servers when the first connection is made.
    pub fn new(
        name: String,
        url: Url,
        bootstrap: &Bootstrap,
        timeout: Duration,
        method: DohMethod,
    ) -> Result<Self> {
        let mut builder = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .use_rustls_tls();

        if !bootstrap.is_empty() {
            builder = builder.dns_resolver(Arc::new(bootstrap.clone()));
        }

        let client = builder.build().context("Failed to create HTTP client")?;

        debug!("DOH client '{}' using {:?} requests", name, method);

        Ok(Self {
            name,
            url,
            method,
            client,
        })
    }

    /// Send query using GET method (RFC 8484)
    async fn query_get(&self, message: &Message) -> Result<Message> {
        let wire_format = message.to_vec()?;
        let encoded = URL_SAFE_NO_PAD.encode(&wire_format);

        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair("dns", &encoded);
        trace!("DOH GET request to {}", url);

        let response = self
            .client
            .get(url)
            .header("Accept", DNS_MESSAGE)
            .send()
            .await
            .context("DOH GET request failed")?;

        Self::read_response(response).await
    }

    /// Send query using POST method (RFC 8484)
    async fn query_post(&self, message: &Message) -> Result<Message> {
        let wire_format = message.to_vec()?;

        trace!("DOH POST request to {} ({} bytes)", self.url, wire_format.len());

        let response = self
            .client
            .post(self.url.clone())
            .header("Content-Type", DNS_MESSAGE)
            .header("Accept", DNS_MESSAGE)
            .body(wire_format)
            .send()
            .await
            .context("DOH POST request failed")?;

        Self::read_response(response).await
    }

    async fn read_response(response: reqwest::Response) -> Result<Message> {
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("DOH server returned error status: {}", status);
        }

        let body = response.bytes().await.context("Failed to read DOH response body")?;
        let dns_response = Message::from_bytes(&body).context("Failed to parse DOH response")?;

        Ok(dns_response)
    }
}

#[async_trait]
impl UpstreamClient for DohClient {
    async fn query(&self, message: Message) -> Result<Message> {
        debug!(
            "[{}] DOH query for {:?}",
            self.name,
            message.queries().first().map(|q| q.name().to_string())
        );

        match self.method {
            DohMethod::Post => self.query_post(&message).await,
            DohMethod::Get => self.query_get(&message).await,
        }
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
    use crate::testutil::serve_once;

    fn client(url: &str, method: DohMethod) -> DohClient {
        let bootstrap = Bootstrap::parse(&[], Duration::from_secs(1)).unwrap();
        DohClient::new(
            "test".to_string(),
            Url::parse(url).unwrap(),
            &bootstrap,
            Duration::from_secs(2),
            method,
        )
        .unwrap()
    }

    fn canned_answer() -> Vec<u8> {
        let mut response = build_query(domain_name("example.test").unwrap(), RecordType::A);
        response.set_message_type(hickory_proto::op::MessageType::Response);
        response.to_vec().unwrap()
    }

    #[tokio::test]
    async fn test_doh_get_encodes_query_parameter() {
        let (base, server) = serve_once("HTTP/1.1 200 OK", DNS_MESSAGE, canned_answer()).await;
        let url = format!("{}/dns-query", base);
        let client = client(&url, DohMethod::Get);

        let query = build_query(domain_name("example.test").unwrap(), RecordType::A);
        let response = client.query(query).await.unwrap();
        assert_eq!(response.queries().len(), 1);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /dns-query?dns="));
    }

    #[tokio::test]
    async fn test_doh_post_sends_wire_format() {
        let (base, server) = serve_once("HTTP/1.1 200 OK", DNS_MESSAGE, canned_answer()).await;
        let url = format!("{}/dns-query", base);
        let client = client(&url, DohMethod::Post);

        let query = build_query(domain_name("example.test").unwrap(), RecordType::A);
        client.query(query).await.unwrap();

        let request = server.await.unwrap().to_lowercase();
        assert!(request.starts_with("post /dns-query"));
        assert!(request.contains("content-type: application/dns-message"));
    }

    #[tokio::test]
    async fn test_doh_error_status() {
        let (base, _server) = serve_once("HTTP/1.1 502 Bad Gateway", DNS_MESSAGE, Vec::new()).await;
        let url = format!("{}/dns-query", base);
        let client = client(&url, DohMethod::Post);

        let query = build_query(domain_name("example.test").unwrap(), RecordType::A);
        let err = client.query(query).await.unwrap_err();
        assert!(err.to_string().contains("502"));
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_doh_cloudflare() {
        let bootstrap = Bootstrap::parse(&["1.1.1.1".to_string()], Duration::from_secs(5)).unwrap();
        let client = DohClient::new(
            "cloudflare".to_string(),
            Url::parse("https://cloudflare-dns.com/dns-query").unwrap(),
            &bootstrap,
            Duration::from_secs(5),
            DohMethod::Post,
        )
        .unwrap();

        let query = build_query(domain_name("example.com").unwrap(), RecordType::A);
        let response = client.query(query).await.unwrap();

        assert!(!response.answers().is_empty());
    }
}
