//! blockroute - resolve a published domain blocklist into IPv4 addresses and host routes.

// Use jemalloc as the global allocator (Linux/macOS only, better performance)
#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

mod config;
mod error;
mod pool;
mod resolution;
mod sink;
mod source;
mod upstream;

#[cfg(test)]
mod testutil;

use anyhow::{Context, Result};
use clap::Parser;
use std::io;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, BufWriter};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use crate::config::{parse_timeout_secs, Config, DohMethod};
use crate::error::SourceError;
use crate::pool::ResolverPool;
use crate::sink::{
    collect_domains, is_broken_pipe, print_domains, write_domains, OutputMode, ResultSink,
};
use crate::source::{DomainSource, FetchSummary};
use crate::upstream::UpstreamSet;

/// blockroute - resolve a published domain blocklist into IPv4 addresses and host routes.
#[derive(Parser)]
#[command(version, about)]
struct Args {
    /// Path to an optional TOML configuration file
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// What to print on stdout
    #[arg(long, value_enum, default_value_t = OutputMode::default())]
    mode: OutputMode,

    /// Number of concurrent resolution workers
    #[arg(long)]
    workers: Option<usize>,

    /// Per-upstream query timeout in seconds (fractions allowed)
    #[arg(long, value_parser = parse_timeout)]
    timeout: Option<Duration>,

    /// Plain DNS server used to resolve upstream hostnames (repeatable)
    #[arg(long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<String>,

    /// Upstream resolver: https://, tls://, udp:// or a bare IP (repeatable)
    #[arg(long = "upstream", value_name = "ADDR")]
    upstream: Vec<String>,

    /// Registry endpoint returning a JSON list of domains
    #[arg(long)]
    registry_url: Option<String>,

    /// Gateway used in route commands
    #[arg(long)]
    gateway: Option<Ipv4Addr>,

    /// HTTP method for DoH upstreams
    #[arg(long, value_enum)]
    doh_method: Option<DohMethod>,

    /// Download the whole domain list before printing (domains mode)
    #[arg(long)]
    buffer: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Apply command line flags on top of the loaded configuration
    fn apply(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(url) = &self.registry_url {
            config.registry.url = url.clone();
        }
        if let Some(gateway) = self.gateway {
            config.output.gateway = gateway;
        }

        let mut resolver = config.resolver.clone();
        if let Some(workers) = self.workers {
            resolver = resolver.with_workers(workers);
        }
        if let Some(timeout) = self.timeout {
            resolver = resolver.with_timeout(timeout);
        }
        if !self.bootstrap.is_empty() {
            resolver = resolver.with_bootstrap(self.bootstrap.clone());
        }
        if !self.upstream.is_empty() {
            resolver = resolver.with_upstream(self.upstream.clone());
        }
        if let Some(method) = self.doh_method {
            resolver = resolver.with_doh_method(method);
        }
        config.resolver = resolver;
    }
}

fn parse_timeout(value: &str) -> std::result::Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("'{}' is not a number of seconds", value))?;
    parse_timeout_secs(secs)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    // Initialize logging
    init_logging(&config.log_level)?;

    info!("Starting blockroute in {:?} mode", args.mode);
    if let Some(path) = &args.config {
        info!("Config loaded from: {:?}", path);
    }

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    let mut stdout = BufWriter::new(tokio::io::stdout());
    match args.mode {
        OutputMode::Domains => run_domains(&config, args.buffer, &mut stdout, cancel).await,
        mode => run_resolve(&config, mode, &mut stdout, cancel).await,
    }
}

/// Print the registry without resolving it
async fn run_domains<W: AsyncWrite + Unpin>(
    config: &Config,
    buffer: bool,
    out: &mut W,
    cancel: CancellationToken,
) -> Result<()> {
    let source = DomainSource::new(&config.registry)?;
    let (domain_tx, domain_rx) = mpsc::channel(1);
    let source_task = tokio::spawn(source.run(domain_tx, cancel.clone()));

    if buffer {
        // Nothing is printed unless the whole list arrived
        let domains = collect_domains(domain_rx).await;
        let fetch = finish_fetch(source_task, &cancel, false).await?;
        if !check_output(write_domains(&domains, out).await, &cancel)? {
            info!("Printed {} domains", fetch.domains);
        }
        return Ok(());
    }

    let output_closed = check_output(print_domains(domain_rx, out).await, &cancel)?;
    let fetch = finish_fetch(source_task, &cancel, output_closed).await?;
    info!("Printed {} domains", fetch.domains);
    Ok(())
}

/// Resolve every registry domain and print addresses or routes
async fn run_resolve<W: AsyncWrite + Unpin>(
    config: &Config,
    mode: OutputMode,
    out: &mut W,
    cancel: CancellationToken,
) -> Result<()> {
    let resolver = &config.resolver;
    info!(
        "Resolving with {} workers, timeout {:?}",
        resolver.workers, resolver.timeout
    );

    // Upstreams come first: a bad address must fail before any fetch starts
    let upstreams = UpstreamSet::build(resolver).context("Failed to initialize upstreams")?;
    let upstreams = Arc::new(upstreams);

    let source = DomainSource::new(&config.registry)?;
    let (domain_tx, domain_rx) = mpsc::channel(1);
    let (result_tx, result_rx) = mpsc::channel(1);

    let source_task = tokio::spawn(source.run(domain_tx, cancel.clone()));

    let pool = ResolverPool::new(upstreams, resolver.workers);
    let pool_cancel = cancel.clone();
    let pool_task =
        tokio::spawn(async move { pool.run(domain_rx, result_tx, pool_cancel).await });

    let mut sink = match mode {
        OutputMode::Routes => ResultSink::routes(out, config.output.gateway),
        _ => ResultSink::ips(out),
    };
    let output_closed = check_output(sink.consume(result_rx).await, &cancel)?;

    let summary = pool_task.await.context("Resolver pool task failed")?;
    let fetch = finish_fetch(source_task, &cancel, output_closed).await?;

    info!(
        "Done: {} domains fetched, {} resolved, {} failed, {} unique addresses written",
        fetch.domains,
        summary.resolved,
        summary.failed,
        sink.written()
    );
    Ok(())
}

/// Wait for the registry fetch and fail the run if it did not complete.
///
/// Cancellation counts as a failure unless it came from the reader closing
/// the output.
async fn finish_fetch(
    task: JoinHandle<std::result::Result<FetchSummary, SourceError>>,
    cancel: &CancellationToken,
    output_closed: bool,
) -> Result<FetchSummary> {
    let fetch = task
        .await
        .context("Registry task failed")?
        .context("Failed to load domain registry")?;

    if cancel.is_cancelled() && !output_closed {
        warn!("Interrupted after {} domains, output is incomplete", fetch.domains);
        anyhow::bail!("interrupted after {} domains", fetch.domains);
    }
    Ok(fetch)
}

/// Stop the pipeline on output errors. Returns whether the reader went away,
/// which ends the run without an error.
fn check_output<T>(result: io::Result<T>, cancel: &CancellationToken) -> Result<bool> {
    match result {
        Ok(_) => Ok(false),
        Err(e) if is_broken_pipe(&e) => {
            debug!("Output closed by reader, stopping");
            cancel.cancel();
            Ok(true)
        }
        Err(e) => {
            cancel.cancel();
            Err(e).context("Failed to write output")
        }
    }
}

/// Cancel the pipeline on SIGINT, SIGTERM or SIGHUP
async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(mut term), Ok(mut hup)) => {
                tokio::select! {
                    _ = term.recv() => {}
                    _ = hup.recv() => {}
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, stopping"),
        _ = terminate => info!("Received termination signal, stopping"),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let level = level.parse::<Level>().unwrap_or(Level::INFO);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    // stdout carries the program output
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(!cfg!(windows))
        .init();

    Ok(())
}
