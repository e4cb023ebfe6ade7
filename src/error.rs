//! Error types for the resolution pipeline.
//!
//! Registry and upstream-initialization errors are fatal to a run. A
//! [`QueryError`] only ever affects the domain it was produced for.

use thiserror::Error;

/// Failure while fetching or decoding the domain registry
#[derive(Debug, Error)]
pub enum SourceError {
    /// The request could not be built or sent
    #[error("registry request to {url} failed: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The registry answered with something other than 200
    #[error("registry {url} returned bad status: {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    /// The connection broke while reading the body
    #[error("failed to read registry body after {received} domains: {source}")]
    Body {
        received: usize,
        #[source]
        source: reqwest::Error,
    },

    /// The body is not a container of strings
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Malformed registry JSON
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("decode opening delimiter at byte {offset}: {reason}")]
    Opening { offset: usize, reason: String },

    #[error("decode element {index} at byte {offset}: {reason}")]
    Element {
        index: usize,
        offset: usize,
        reason: String,
    },

    #[error("decode closing delimiter at byte {offset}: {reason}")]
    Closing { offset: usize, reason: String },

    #[error("unexpected end of registry body at byte {offset}")]
    UnexpectedEof { offset: usize },
}

/// An upstream or bootstrap address could not be turned into a client
#[derive(Debug, Error)]
pub enum UpstreamInitError {
    #[error("no upstream servers configured")]
    NoUpstreams,

    #[error("invalid upstream address '{address}': {reason}")]
    InvalidUpstream { address: String, reason: String },

    #[error("invalid bootstrap address '{address}': {reason}")]
    InvalidBootstrap { address: String, reason: String },

    #[error("upstream '{address}' uses hostname '{host}' but no bootstrap servers are configured")]
    MissingBootstrap { address: String, host: String },

    #[error("failed to build client for upstream '{address}': {source}")]
    Client {
        address: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Resolution failure for a single domain
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// The domain cannot be encoded as a DNS name
    #[error("invalid domain name '{domain}': {reason}")]
    InvalidName { domain: String, reason: String },

    /// Every upstream failed or timed out
    #[error("all {} upstreams failed for {domain}: {}", errors.len(), errors.join("; "))]
    AllUpstreamsFailed { domain: String, errors: Vec<String> },
}
