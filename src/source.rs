//! Streaming loader for the published domain registry.
//!
//! The registry body is a single JSON array of strings (optionally wrapped in
//! an object with one key). Domains are decoded incrementally as body chunks
//! arrive and handed off one at a time, so only the element currently being
//! decoded is ever buffered.

use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::RegistryConfig;
use crate::error::{DecodeError, SourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for `[` or `{`
    Start,
    /// Inside a wrapping object, waiting for its key
    Key,
    Colon,
    /// Waiting for the `[` of the wrapped array
    InnerOpen,
    /// Right after `[`: either an element or `]`
    FirstElement,
    /// After a `,`
    Element,
    /// After an element: `,` or `]`
    Separator,
    /// Wrapped array closed, waiting for `}`
    ObjectEnd,
    Done,
}

/// Incremental decoder for a container of JSON strings
#[derive(Debug)]
pub struct RegistryDecoder {
    buf: Vec<u8>,
    /// Parse position within `buf`
    pos: usize,
    /// Absolute body offset of `buf[0]`
    offset: usize,
    state: State,
    wrapped: bool,
    /// Index of the next element
    index: usize,
}

impl Default for RegistryDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryDecoder {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            offset: 0,
            state: State::Start,
            wrapped: false,
            index: 0,
        }
    }

    /// Append a body chunk, dropping input that was already decoded
    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.drain(..self.pos);
        self.offset += self.pos;
        self.pos = 0;
        self.buf.extend_from_slice(chunk);
    }

    /// True once the closing delimiter has been read
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Check that the body ended after a complete container
    pub fn finish(&self) -> std::result::Result<(), DecodeError> {
        if self.is_done() {
            Ok(())
        } else {
            Err(DecodeError::UnexpectedEof {
                offset: self.offset + self.buf.len(),
            })
        }
    }

    /// Decode the next domain.
    ///
    /// `Ok(None)` means more input is needed, or the container is closed
    /// (see [`is_done`](Self::is_done)).
    pub fn next_domain(&mut self) -> std::result::Result<Option<String>, DecodeError> {
        loop {
            if self.state == State::Done {
                return Ok(None);
            }
            let Some(byte) = self.skip_whitespace() else {
                return Ok(None);
            };

            match self.state {
                State::Start => match byte {
                    b'[' => {
                        self.pos += 1;
                        self.state = State::FirstElement;
                    }
                    b'{' => {
                        self.pos += 1;
                        self.wrapped = true;
                        self.state = State::Key;
                    }
                    other => {
                        return Err(self.opening_error(format!(
                            "expected '[' or '{{', found {}",
                            describe(other)
                        )))
                    }
                },
                State::Key => {
                    if byte != b'"' {
                        return Err(self.opening_error(format!(
                            "expected object key, found {}",
                            describe(byte)
                        )));
                    }
                    let Some(end) = self.string_end() else {
                        return Ok(None);
                    };
                    self.pos = end;
                    self.state = State::Colon;
                }
                State::Colon => {
                    if byte != b':' {
                        return Err(self.opening_error(format!("expected ':', found {}", describe(byte))));
                    }
                    self.pos += 1;
                    self.state = State::InnerOpen;
                }
                State::InnerOpen => {
                    if byte != b'[' {
                        return Err(self.opening_error(format!(
                            "expected '[' inside wrapping object, found {}",
                            describe(byte)
                        )));
                    }
                    self.pos += 1;
                    self.state = State::FirstElement;
                }
                State::FirstElement | State::Element => {
                    if byte == b']' && self.state == State::FirstElement {
                        self.pos += 1;
                        self.close_array();
                        continue;
                    }
                    if byte == b'}' {
                        return Err(self.closing_error("mismatched '}' closing an array".to_string()));
                    }
                    if byte != b'"' {
                        return Err(self.element_error(format!("expected string, found {}", describe(byte))));
                    }

                    let Some(end) = self.string_end() else {
                        return Ok(None);
                    };
                    let value: String = serde_json::from_slice(&self.buf[self.pos..end])
                        .map_err(|e| self.element_error(e.to_string()))?;

                    let index = self.index;
                    self.pos = end;
                    self.index += 1;
                    self.state = State::Separator;

                    let domain = normalize(&value);
                    if domain.is_empty() {
                        debug!("Skipping empty registry element {}", index);
                        continue;
                    }
                    return Ok(Some(domain.to_string()));
                }
                State::Separator => match byte {
                    b',' => {
                        self.pos += 1;
                        self.state = State::Element;
                    }
                    b']' => {
                        self.pos += 1;
                        self.close_array();
                    }
                    b'}' => {
                        return Err(self.closing_error("mismatched '}' closing an array".to_string()));
                    }
                    other => {
                        return Err(self.element_error(format!(
                            "expected ',' or ']' after element, found {}",
                            describe(other)
                        )))
                    }
                },
                State::ObjectEnd => {
                    if byte != b'}' {
                        return Err(self.closing_error(format!("expected '}}', found {}", describe(byte))));
                    }
                    self.pos += 1;
                    self.state = State::Done;
                }
                State::Done => return Ok(None),
            }
        }
    }

    /// Bytes currently held for the element being decoded
    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn close_array(&mut self) {
        self.state = if self.wrapped { State::ObjectEnd } else { State::Done };
    }

    fn skip_whitespace(&mut self) -> Option<u8> {
        while let Some(byte) = self.buf.get(self.pos) {
            if !matches!(byte, b' ' | b'\t' | b'\r' | b'\n') {
                return Some(*byte);
            }
            self.pos += 1;
        }
        None
    }

    /// End (exclusive) of the string starting at `pos`, if it is complete
    fn string_end(&self) -> Option<usize> {
        let mut i = self.pos + 1;
        while i < self.buf.len() {
            match self.buf[i] {
                b'\\' => i += 2,
                b'"' => return Some(i + 1),
                _ => i += 1,
            }
        }
        None
    }

    fn opening_error(&self, reason: String) -> DecodeError {
        DecodeError::Opening {
            offset: self.offset + self.pos,
            reason,
        }
    }

    fn element_error(&self, reason: String) -> DecodeError {
        DecodeError::Element {
            index: self.index,
            offset: self.offset + self.pos,
            reason,
        }
    }

    fn closing_error(&self, reason: String) -> DecodeError {
        DecodeError::Closing {
            offset: self.offset + self.pos,
            reason,
        }
    }
}

fn describe(byte: u8) -> String {
    if byte.is_ascii_graphic() {
        format!("'{}'", byte as char)
    } else {
        format!("byte 0x{:02x}", byte)
    }
}

/// Strip surrounding whitespace and one trailing root dot
fn normalize(value: &str) -> &str {
    let trimmed = value.trim();
    trimmed.strip_suffix('.').unwrap_or(trimmed)
}

/// How a registry fetch ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchSummary {
    /// Domains handed to the consumer
    pub domains: usize,
    /// Stopped early by cancellation or because the consumer went away
    pub cancelled: bool,
}

/// Fetches the registry and streams its domains
pub struct DomainSource {
    client: Client,
    url: String,
}

impl DomainSource {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .use_rustls_tls()
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    /// Stream every registry domain into `domains`, in registry order.
    ///
    /// The sender is consumed, so the stream is closed exactly once when
    /// this returns, whatever the outcome. Domains sent before an error
    /// remain valid.
    pub async fn run(
        self,
        domains: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> std::result::Result<FetchSummary, SourceError> {
        info!("Fetching domain registry from {}", self.url);

        let request = self.client.get(&self.url).send();
        let mut response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Registry fetch cancelled before response");
                return Ok(FetchSummary { domains: 0, cancelled: true });
            }
            response = request => response.map_err(|source| SourceError::Fetch {
                url: self.url.clone(),
                source,
            })?,
        };

        let status = response.status();
        if status != StatusCode::OK {
            return Err(SourceError::Status {
                url: self.url.clone(),
                status,
            });
        }

        let mut decoder = RegistryDecoder::new();
        let mut emitted = 0usize;
        let cancelled = |emitted: usize| -> std::result::Result<FetchSummary, SourceError> {
            info!("Registry fetch stopped after {} domains", emitted);
            Ok(FetchSummary {
                domains: emitted,
                cancelled: true,
            })
        };

        loop {
            while let Some(domain) = decoder.next_domain()? {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return cancelled(emitted),
                    sent = domains.send(domain) => {
                        if sent.is_err() {
                            debug!("Domain consumer closed the stream");
                            return cancelled(emitted);
                        }
                        emitted += 1;
                    }
                }
            }

            if decoder.is_done() {
                break;
            }

            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return cancelled(emitted),
                chunk = response.chunk() => chunk.map_err(|source| SourceError::Body {
                    received: emitted,
                    source,
                })?,
            };

            match chunk {
                Some(bytes) => decoder.feed(&bytes),
                None => {
                    decoder.finish()?;
                    break;
                }
            }
        }

        info!("Registry fetch complete: {} domains", emitted);
        Ok(FetchSummary {
            domains: emitted,
            cancelled: false,
        })
    }
}
