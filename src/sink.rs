//! Output formatting for domains and resolution results.

use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::resolution::Resolution;

/// What the program prints on stdout
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputMode {
    /// Registry domains, without resolving them
    Domains,
    /// Resolved IPv4 addresses, one per line
    #[default]
    Ips,
    /// Windows `route ADD` commands through the configured gateway
    Routes,
}

/// Whether an output error means the reader went away
pub fn is_broken_pipe(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::BrokenPipe
}

/// Print registry domains as they arrive. Returns the number printed.
pub async fn print_domains<W: AsyncWrite + Unpin>(
    mut domains: mpsc::Receiver<String>,
    out: &mut W,
) -> io::Result<usize> {
    let mut printed = 0;
    while let Some(domain) = domains.recv().await {
        out.write_all(format!("{}\n", domain).as_bytes()).await?;
        printed += 1;
    }
    out.flush().await?;
    Ok(printed)
}

/// Hold every domain in memory until the stream closes
pub async fn collect_domains(mut domains: mpsc::Receiver<String>) -> Vec<String> {
    let mut all = Vec::new();
    while let Some(domain) = domains.recv().await {
        all.push(domain);
    }
    debug!("Buffered {} domains", all.len());
    all
}

/// Print an already collected domain list
pub async fn write_domains<W: AsyncWrite + Unpin>(domains: &[String], out: &mut W) -> io::Result<usize> {
    for domain in domains {
        out.write_all(format!("{}\n", domain).as_bytes()).await?;
    }
    out.flush().await?;
    Ok(domains.len())
}

enum Format {
    Ips,
    Routes { gateway: Ipv4Addr },
}

/// Writes addresses from resolution results, each distinct address once
pub struct ResultSink<W> {
    out: W,
    format: Format,
    seen: HashSet<Ipv4Addr>,
}

impl<W: AsyncWrite + Unpin> ResultSink<W> {
    /// Print bare addresses
    pub fn ips(out: W) -> Self {
        Self::with_format(out, Format::Ips)
    }

    /// Print a host route per address through `gateway`
    pub fn routes(out: W, gateway: Ipv4Addr) -> Self {
        Self::with_format(out, Format::Routes { gateway })
    }

    fn with_format(out: W, format: Format) -> Self {
        Self {
            out,
            format,
            seen: HashSet::new(),
        }
    }

    /// Number of distinct addresses written so far
    pub fn written(&self) -> usize {
        self.seen.len()
    }

    pub async fn write(&mut self, resolution: &Resolution) -> io::Result<()> {
        if let Some(err) = &resolution.error {
            debug!("Skipping {}: {}", resolution.domain, err);
            return Ok(());
        }

        for ip in &resolution.addresses {
            if !self.seen.insert(*ip) {
                continue;
            }
            let line = match self.format {
                Format::Ips => format!("{}\n", ip),
                Format::Routes { gateway } => {
                    format!("route ADD {} MASK 255.255.255.255 {}\n", ip, gateway)
                }
            };
            self.out.write_all(line.as_bytes()).await?;
        }
        Ok(())
    }

    /// Drain `results` until the pool closes the stream
    pub async fn consume(&mut self, mut results: mpsc::Receiver<Resolution>) -> io::Result<()> {
        while let Some(resolution) = results.recv().await {
            self.write(&resolution).await?;
        }
        self.out.flush().await
    }
}
