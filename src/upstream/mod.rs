//! Upstream DNS clients (DOH, DOT, plain UDP) and the set queried per domain.

mod bootstrap;
mod doh;
mod dot;
mod udp;

pub use bootstrap::Bootstrap;
pub use doh::DohClient;
pub use dot::DotClient;
pub use udp::UdpClient;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use reqwest::Url;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tracing::{debug, info, trace};

use crate::config::ResolverConfig;
use crate::error::{QueryError, UpstreamInitError};

/// Trait for upstream DNS clients
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send a DNS query and receive a response
    async fn query(&self, message: Message) -> Result<Message>;

    /// Get the name/identifier of this upstream
    fn name(&self) -> &str;
}

/// Parsed form of a configured upstream address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAddress {
    /// `https://host/path` (or `http://` for local endpoints)
    Https(Url),
    /// `tls://host[:port]`
    Tls { host: String, port: u16 },
    /// `udp://ip[:port]` or bare `ip[:port]`
    Udp(SocketAddr),
}

const DEFAULT_DOT_PORT: u16 = 853;
const DEFAULT_DNS_PORT: u16 = 53;

impl UpstreamAddress {
    /// Parse an upstream address, validating syntax only
    pub fn parse(address: &str) -> std::result::Result<Self, String> {
        let address = address.trim();
        if address.is_empty() {
            return Err("address is empty".to_string());
        }

        if !address.contains("://") {
            return parse_socket_addr(address, DEFAULT_DNS_PORT).map(UpstreamAddress::Udp);
        }

        let url = Url::parse(address).map_err(|e| e.to_string())?;
        match url.scheme() {
            "https" | "http" => {
                if url.host_str().map_or(true, str::is_empty) {
                    return Err("missing host".to_string());
                }
                Ok(UpstreamAddress::Https(url))
            }
            "tls" => {
                let host = url_host(&url)?;
                Ok(UpstreamAddress::Tls {
                    host,
                    port: url.port().unwrap_or(DEFAULT_DOT_PORT),
                })
            }
            "udp" => {
                let host = url_host(&url)?;
                let ip: IpAddr = host
                    .parse()
                    .map_err(|_| format!("udp upstream host must be an IP address, got '{}'", host))?;
                Ok(UpstreamAddress::Udp(SocketAddr::new(
                    ip,
                    url.port().unwrap_or(DEFAULT_DNS_PORT),
                )))
            }
            other => Err(format!("unsupported scheme '{}'", other)),
        }
    }

    /// Hostname that has to go through the bootstrap servers, if any
    pub fn hostname(&self) -> Option<&str> {
        let host = match self {
            UpstreamAddress::Https(url) => url.host_str()?,
            UpstreamAddress::Tls { host, .. } => host.as_str(),
            UpstreamAddress::Udp(_) => return None,
        };
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if bare.parse::<IpAddr>().is_ok() {
            None
        } else {
            Some(host)
        }
    }
}

/// Host of a non-special URL with IPv6 brackets removed
fn url_host(url: &Url) -> std::result::Result<String, String> {
    if !matches!(url.path(), "" | "/") {
        return Err(format!("unexpected path '{}'", url.path()));
    }
    let host = url.host_str().filter(|h| !h.is_empty()).ok_or("missing host")?;
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

/// Parse `ip` or `ip:port` (IPv6 with port must be bracketed)
pub(crate) fn parse_socket_addr(
    address: &str,
    default_port: u16,
) -> std::result::Result<SocketAddr, String> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Ok(addr);
    }
    address
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|_| "expected an IP address with optional port".to_string())
}

static NEXT_QUERY_ID: AtomicU16 = AtomicU16::new(1);

/// Message ID for transports that match responses by ID (UDP, TCP/TLS)
pub(crate) fn next_query_id() -> u16 {
    NEXT_QUERY_ID.fetch_add(1, Ordering::Relaxed)
}

/// Build a recursive query for `name`. The ID is left at 0 as RFC 8484
/// recommends for DoH; connection-oriented clients overwrite it.
pub fn build_query(name: Name, record_type: RecordType) -> Message {
    let mut message = Message::new();
    message.set_id(0);
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(name, record_type));
    message
}

/// Convert a registry domain into a fully-qualified DNS name
pub fn domain_name(domain: &str) -> std::result::Result<Name, QueryError> {
    let invalid = |reason: String| QueryError::InvalidName {
        domain: domain.to_string(),
        reason,
    };

    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(invalid("empty name".to_string()));
    }

    let mut name = Name::from_utf8(trimmed).map_err(|e| invalid(e.to_string()))?;
    name.set_fqdn(true);
    Ok(name)
}

/// The full set of upstreams every domain is broadcast to.
///
/// Built once per run and shared read-only between workers.
pub struct UpstreamSet {
    upstreams: Vec<Box<dyn UpstreamClient>>,
    timeout: Duration,
}

impl UpstreamSet {
    /// Build one client per configured upstream. Any invalid upstream or
    /// bootstrap address fails the whole set.
    pub fn build(config: &ResolverConfig) -> std::result::Result<Self, UpstreamInitError> {
        if config.upstream.is_empty() {
            return Err(UpstreamInitError::NoUpstreams);
        }

        let bootstrap = Bootstrap::parse(&config.bootstrap, config.timeout)?;

        let mut upstreams: Vec<Box<dyn UpstreamClient>> = Vec::with_capacity(config.upstream.len());
        for address in &config.upstream {
            let parsed = UpstreamAddress::parse(address).map_err(|reason| {
                UpstreamInitError::InvalidUpstream {
                    address: address.clone(),
                    reason,
                }
            })?;

            if let Some(host) = parsed.hostname() {
                if bootstrap.is_empty() {
                    return Err(UpstreamInitError::MissingBootstrap {
                        address: address.clone(),
                        host: host.to_string(),
                    });
                }
            }

            let client_error = |source: anyhow::Error| UpstreamInitError::Client {
                address: address.clone(),
                source,
            };

            let client: Box<dyn UpstreamClient> = match parsed {
                UpstreamAddress::Https(url) => Box::new(
                    DohClient::new(
                        address.clone(),
                        url,
                        &bootstrap,
                        config.timeout,
                        config.doh_method,
                    )
                    .map_err(client_error)?,
                ),
                UpstreamAddress::Tls { host, port } => Box::new(
                    DotClient::new(address.clone(), host, port, bootstrap.clone())
                        .map_err(client_error)?,
                ),
                UpstreamAddress::Udp(server) => {
                    Box::new(UdpClient::new(address.clone(), server, config.timeout))
                }
            };

            info!("Initialized upstream: {}", address);
            upstreams.push(client);
        }

        Ok(Self::from_clients(upstreams, config.timeout))
    }

    /// Assemble a set from already constructed clients
    pub fn from_clients(upstreams: Vec<Box<dyn UpstreamClient>>, timeout: Duration) -> Self {
        Self { upstreams, timeout }
    }

    /// Number of upstreams each query is broadcast to
    pub fn upstream_count(&self) -> usize {
        self.upstreams.len()
    }

    /// Send an A query for `domain` to every upstream at once.
    ///
    /// Returns every response that arrived within the timeout. Fails only
    /// if no upstream produced a response.
    pub async fn exchange_all(&self, domain: &str) -> std::result::Result<Vec<Message>, QueryError> {
        let name = domain_name(domain)?;
        let query = build_query(name, RecordType::A);

        let attempts = self.upstreams.iter().map(|upstream| {
            let message = query.clone();
            async move {
                match tokio::time::timeout(self.timeout, upstream.query(message)).await {
                    Ok(Ok(response)) => Ok(response),
                    Ok(Err(e)) => Err(format!("{}: {:#}", upstream.name(), e)),
                    Err(_) => Err(format!("{}: timed out after {:?}", upstream.name(), self.timeout)),
                }
            }
        });

        let mut responses = Vec::with_capacity(self.upstreams.len());
        let mut errors = Vec::new();
        for outcome in join_all(attempts).await {
            match outcome {
                Ok(response) => responses.push(response),
                Err(e) => {
                    debug!("Upstream failed for {}: {}", domain, e);
                    errors.push(e);
                }
            }
        }

        trace!(
            "{}: {} responses, {} upstream errors",
            domain,
            responses.len(),
            errors.len()
        );

        if responses.is_empty() {
            return Err(QueryError::AllUpstreamsFailed {
                domain: domain.to_string(),
                errors,
            });
        }

        Ok(responses)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use hickory_proto::rr::{RData, Record};
    use std::collections::HashMap;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    /// In-memory upstream answering from a fixed table
    pub(crate) struct StaticUpstream {
        pub name: String,
        pub answers: HashMap<String, Vec<Ipv4Addr>>,
        pub delay: Option<Duration>,
        pub calls: Arc<AtomicUsize>,
    }

    impl StaticUpstream {
        pub(crate) fn new(name: &str, answers: &[(&str, &[Ipv4Addr])]) -> Self {
            Self {
                name: name.to_string(),
                answers: answers
                    .iter()
                    .map(|(domain, ips)| (domain.to_string(), ips.to_vec()))
                    .collect(),
                delay: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl UpstreamClient for StaticUpstream {
        async fn query(&self, message: Message) -> Result<Message> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let query = message.queries().first().cloned().unwrap();
            let key = query.name().to_string().trim_end_matches('.').to_string();

            let mut response = Message::new();
            response.set_id(message.id());
            response.set_message_type(MessageType::Response);
            response.add_query(query.clone());
            match self.answers.get(&key) {
                Some(ips) => {
                    response.set_response_code(ResponseCode::NoError);
                    for ip in ips {
                        response.add_answer(Record::from_rdata(
                            query.name().clone(),
                            300,
                            RData::A((*ip).into()),
                        ));
                    }
                }
                None => {
                    response.set_response_code(ResponseCode::NXDomain);
                }
            }
            Ok(response)
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    /// Upstream that always errors
    pub(crate) struct FailingUpstream(pub String);

    #[async_trait]
    impl UpstreamClient for FailingUpstream {
        async fn query(&self, _message: Message) -> Result<Message> {
            anyhow::bail!("connection refused")
        }

        fn name(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn test_parse_upstream_addresses() {
        let doh = UpstreamAddress::parse("https://1.1.1.1/dns-query").unwrap();
        assert!(matches!(doh, UpstreamAddress::Https(_)));
        assert_eq!(doh.hostname(), None);

        let doh_named = UpstreamAddress::parse("https://dns.google/dns-query").unwrap();
        assert_eq!(doh_named.hostname(), Some("dns.google"));

        let dot = UpstreamAddress::parse("tls://dns.quad9.net").unwrap();
        assert_eq!(
            dot,
            UpstreamAddress::Tls {
                host: "dns.quad9.net".to_string(),
                port: 853
            }
        );

        let dot_ip = UpstreamAddress::parse("tls://9.9.9.9:8853").unwrap();
        assert_eq!(dot_ip.hostname(), None);

        let udp = UpstreamAddress::parse("udp://8.8.8.8").unwrap();
        assert_eq!(udp, UpstreamAddress::Udp("8.8.8.8:53".parse().unwrap()));

        let bare = UpstreamAddress::parse("8.8.4.4:5353").unwrap();
        assert_eq!(bare, UpstreamAddress::Udp("8.8.4.4:5353".parse().unwrap()));

        let bare_v6 = UpstreamAddress::parse("2001:4860:4860::8888").unwrap();
        assert_eq!(
            bare_v6,
            UpstreamAddress::Udp("[2001:4860:4860::8888]:53".parse().unwrap())
        );
    }

    #[test]
    fn test_parse_invalid_upstream_addresses() {
        assert!(UpstreamAddress::parse("").is_err());
        assert!(UpstreamAddress::parse("quic://dns.adguard.com").is_err());
        assert!(UpstreamAddress::parse("udp://dns.google").is_err());
        assert!(UpstreamAddress::parse("not an address").is_err());
        assert!(UpstreamAddress::parse("https://").is_err());
    }

    #[test]
    fn test_build_fails_as_a_whole() {
        let config = ResolverConfig::default().with_upstream(vec![
            "https://1.1.1.1/dns-query".to_string(),
            "bogus://nowhere".to_string(),
        ]);

        let err = UpstreamSet::build(&config).err().unwrap();
        assert!(matches!(err, UpstreamInitError::InvalidUpstream { ref address, .. } if address == "bogus://nowhere"));
    }

    #[test]
    fn test_build_rejects_bad_bootstrap() {
        let config = ResolverConfig::default().with_bootstrap(vec!["one.one.one.one".to_string()]);
        let err = UpstreamSet::build(&config).err().unwrap();
        assert!(matches!(err, UpstreamInitError::InvalidBootstrap { .. }));
    }

    #[test]
    fn test_build_requires_bootstrap_for_hostnames() {
        let config = ResolverConfig::default()
            .with_bootstrap(vec![])
            .with_upstream(vec!["https://dns.google/dns-query".to_string()]);
        let err = UpstreamSet::build(&config).err().unwrap();
        assert!(matches!(err, UpstreamInitError::MissingBootstrap { .. }));
    }

    #[test]
    fn test_build_default_set() {
        let set = UpstreamSet::build(&ResolverConfig::default()).unwrap();
        assert_eq!(set.upstream_count(), 2);
    }

    #[test]
    fn test_build_empty_set() {
        let config = ResolverConfig::default().with_upstream(vec![]);
        assert!(matches!(
            UpstreamSet::build(&config),
            Err(UpstreamInitError::NoUpstreams)
        ));
    }

    #[test]
    fn test_domain_name() {
        let name = domain_name("example.test").unwrap();
        assert!(name.is_fqdn());
        assert_eq!(name.to_string(), "example.test.");

        let trailing = domain_name("example.test.").unwrap();
        assert_eq!(trailing, name);

        assert!(domain_name("").is_err());
        assert!(domain_name(".").is_err());
    }

    #[tokio::test]
    async fn test_exchange_all_partial_failure() {
        let ip = Ipv4Addr::new(1, 2, 3, 4);
        let set = UpstreamSet::from_clients(
            vec![
                Box::new(FailingUpstream("down".to_string())),
                Box::new(StaticUpstream::new("up", &[("example.test", &[ip])])),
            ],
            Duration::from_secs(1),
        );

        let responses = set.exchange_all("example.test").await.unwrap();
        assert_eq!(responses.len(), 1);
    }

    #[tokio::test]
    async fn test_exchange_all_total_failure() {
        let set = UpstreamSet::from_clients(
            vec![
                Box::new(FailingUpstream("a".to_string())),
                Box::new(FailingUpstream("b".to_string())),
            ],
            Duration::from_secs(1),
        );

        let err = set.exchange_all("example.test").await.unwrap_err();
        match err {
            QueryError::AllUpstreamsFailed { domain, errors } => {
                assert_eq!(domain, "example.test");
                assert_eq!(errors.len(), 2);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exchange_all_applies_timeout_per_upstream() {
        let mut slow = StaticUpstream::new("slow", &[("example.test", &[Ipv4Addr::new(5, 6, 7, 8)])]);
        slow.delay = Some(Duration::from_secs(10));
        let fast = StaticUpstream::new("fast", &[("example.test", &[Ipv4Addr::new(1, 2, 3, 4)])]);

        let set = UpstreamSet::from_clients(
            vec![Box::new(slow), Box::new(fast)],
            Duration::from_millis(100),
        );

        let started = std::time::Instant::now();
        let responses = set.exchange_all("example.test").await.unwrap();
        assert_eq!(responses.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_default_upstreams_resolve() {
        let set = UpstreamSet::build(&ResolverConfig::default()).unwrap();
        let responses = set.exchange_all("example.com").await.unwrap();
        assert!(!responses.is_empty());
    }
}
