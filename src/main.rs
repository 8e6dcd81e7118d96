//! CLI entry point for the dispatch tool.

use std::io::{self, IsTerminal, Read};
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use dispatch_core::{
    AgentOptions, ConcurrencyProvider, ConfigBridge, DispatchAgent, DispatchError,
    DispatchRequest, ProxyController, ProxyEnv, RetryPolicy, SettingsChange,
};
use futures_util::future::join_all;
use tracing::{debug, info, warn};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    // Logs go to stderr so --status output on stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let input_text = if !args.urls.is_empty() {
        args.urls.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        info!("No input provided. Pipe URLs via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/file.bin' | dispatch");
        return Ok(());
    };

    let urls: Vec<&str> = input_text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .collect();
    if urls.is_empty() {
        info!("No URLs found in input");
        return Ok(());
    }

    let concurrency = ConcurrencyProvider::new(usize::from(args.max_sockets));
    let options = AgentOptions {
        retry: RetryPolicy::default().with_max_retries(u32::from(args.max_retries)),
        ..AgentOptions::default()
    };
    let agent = DispatchAgent::new(options, concurrency.clone())?;

    let proxy = Arc::new(ProxyController::new());
    let env_proxy = if args.no_env_proxy {
        None
    } else {
        ProxyEnv::from_env().default_proxy().map(str::to_string)
    };
    if let Some(default) = env_proxy.as_deref()
        && let Err(e) = proxy.set_default_proxy(Some(default))
    {
        warn!(error = %e, "ignoring proxy from environment");
    }
    proxy.add(Arc::new(agent.clone()));

    let bridge = ConfigBridge::new(concurrency, Arc::clone(&proxy));
    if let Some(url) = &args.proxy {
        bridge.apply(SettingsChange::HttpProxy(url.clone()));
    }
    bridge.apply(SettingsChange::HttpProxyEnabled(
        args.proxy.is_some() || env_proxy.is_some(),
    ));

    info!(urls = urls.len(), max_sockets = args.max_sockets, "Dispatching");

    let results = join_all(urls.iter().map(|url| fetch(&agent, url))).await;
    let failed = results.iter().filter(|ok| !**ok).count();

    if args.status {
        println!("{}", serde_json::to_string_pretty(&agent.get_status())?);
    }

    agent.close().await;

    info!(
        succeeded = urls.len() - failed,
        failed,
        total = urls.len(),
        "Dispatch complete"
    );

    if failed > 0 {
        bail!("{failed} of {} requests failed", urls.len());
    }
    Ok(())
}

/// Fetches one URL, draining its body. Returns whether it succeeded.
async fn fetch(agent: &DispatchAgent, url: &str) -> bool {
    match fetch_body(agent, url).await {
        Ok((status, bytes)) if status < 400 => {
            info!(url, status, bytes, "Fetched");
            true
        }
        Ok((status, bytes)) => {
            warn!(url, status, bytes, "Server returned an error status");
            false
        }
        Err(e) => {
            warn!(url, error = %e, "Request failed");
            false
        }
    }
}

async fn fetch_body(agent: &DispatchAgent, url: &str) -> Result<(u16, u64), DispatchError> {
    let mut response = agent.dispatch(DispatchRequest::get(url)).await?;
    let status = response.status().as_u16();
    let mut bytes = 0u64;
    while let Some(chunk) = response.chunk().await? {
        bytes += chunk.len() as u64;
    }
    Ok((status, bytes))
}
