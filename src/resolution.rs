//! Per-domain resolution outcome and answer merging.

use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::error::QueryError;

/// Outcome for one registry domain.
///
/// Every domain taken from the registry produces exactly one `Resolution`,
/// whether or not any upstream answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub domain: String,
    /// IPv4 addresses merged from all upstream answers, without duplicates
    pub addresses: BTreeSet<Ipv4Addr>,
    pub error: Option<QueryError>,
}

impl Resolution {
    pub fn resolved(domain: String, addresses: BTreeSet<Ipv4Addr>) -> Self {
        Self {
            domain,
            addresses,
            error: None,
        }
    }

    pub fn failed(domain: String, error: QueryError) -> Self {
        Self {
            domain,
            addresses: BTreeSet::new(),
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Collect A record addresses from every response into one set
pub fn merge_addresses(responses: &[Message]) -> BTreeSet<Ipv4Addr> {
    responses
        .iter()
        .flat_map(|response| response.answers())
        .filter_map(|answer| match answer.data() {
            RData::A(a) => Some(a.0),
            _ => None,
        })
        .collect()
}
