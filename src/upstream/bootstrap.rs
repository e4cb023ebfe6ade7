//! Bootstrap resolution of upstream hostnames over plain DNS.
//!
//! Bootstrap servers are never asked about registry domains, only about the
//! hosts named in upstream addresses (e.g. `dns.google` in
//! `https://dns.google/dns-query`).

use anyhow::{Context, Result};
use hickory_proto::rr::{RData, RecordType};
use reqwest::dns::{Addrs, Name as HttpName, Resolve, Resolving};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::udp::exchange_udp;
use super::{build_query, domain_name, next_query_id, parse_socket_addr, DEFAULT_DNS_PORT};
use crate::error::UpstreamInitError;

/// Plain DNS servers used to look up upstream hostnames
#[derive(Debug, Clone)]
pub struct Bootstrap {
    servers: Arc<[SocketAddr]>,
    timeout: Duration,
}

impl Bootstrap {
    /// Parse `ip` / `ip:port` entries; no lookups happen here
    pub fn parse(addresses: &[String], timeout: Duration) -> std::result::Result<Self, UpstreamInitError> {
        let servers = addresses
            .iter()
            .map(|address| {
                parse_socket_addr(address.trim(), DEFAULT_DNS_PORT).map_err(|reason| {
                    UpstreamInitError::InvalidBootstrap {
                        address: address.clone(),
                        reason,
                    }
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Self {
            servers: servers.into(),
            timeout,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Resolve `host` to its IPv4 addresses, trying servers in order
    pub async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let name = domain_name(host)?;
        let mut last_error = None;

        for server in self.servers.iter() {
            let mut query = build_query(name.clone(), RecordType::A);
            query.set_id(next_query_id());

            match exchange_udp(*server, &query, self.timeout).await {
                Ok(response) => {
                    let ips: Vec<IpAddr> = response
                        .answers()
                        .iter()
                        .filter_map(|record| match record.data() {
                            RData::A(a) => Some(IpAddr::V4(a.0)),
                            _ => None,
                        })
                        .collect();

                    if !ips.is_empty() {
                        debug!("Bootstrap {} resolved {} -> {:?}", server, host, ips);
                        return Ok(ips);
                    }
                    trace!("Bootstrap {} returned no addresses for {}", server, host);
                    last_error = Some(anyhow::anyhow!(
                        "bootstrap {} returned no addresses ({:?})",
                        server,
                        response.response_code()
                    ));
                }
                Err(e) => {
                    debug!("Bootstrap {} failed for {}: {:#}", server, host, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("no bootstrap servers configured")))
            .with_context(|| format!("Failed to bootstrap {}", host))
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Lets reqwest route its connection lookups through the bootstrap servers
impl Resolve for Bootstrap {
    fn resolve(&self, name: HttpName) -> Resolving {
        Box::pin(resolve_addrs(self.clone(), name.as_str().to_string()))
    }
}

async fn resolve_addrs(bootstrap: Bootstrap, host: String) -> Result<Addrs, BoxError> {
    let ips = bootstrap.lookup(&host).await?;
    // reqwest replaces port 0 with the port from the URL
    let addrs: Addrs = Box::new(ips.into_iter().map(|ip| SocketAddr::new(ip, 0)));
    Ok(addrs)
}
