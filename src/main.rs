//! Binary runner: load the credential and backlog, run the pool until
//! interrupted.

use anyhow::Context;
use heartbeat_pool::{load_backlog, load_credential, Pool, PoolConfig};
use log::{error, info};

const SESSION_URL: &str = "https://api.nodepay.ai/api/auth/session";
const PING_URLS: [&str; 2] = [
    "http://13.215.134.222/api/network/ping",
    "http://52.77.10.116/api/network/ping",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let token_path = std::env::var("TOKEN_FILE").unwrap_or_else(|_| "Token.txt".to_string());
    let proxy_path = std::env::var("PROXY_FILE").unwrap_or_else(|_| "Proxy.txt".to_string());

    let credential = load_credential(&token_path).context("exiting: could not load credential")?;
    let backlog = load_backlog(&proxy_path).context("exiting: could not load backlog")?;
    info!("Loaded {} egress candidates from {}", backlog.len(), proxy_path);

    let config = PoolConfig::builder(SESSION_URL, PING_URLS.to_vec())
        .origin("https://app.nodepay.ai")
        .referer("https://app.nodepay.ai/")
        .build();

    let pool = Pool::new(config, credential, backlog);
    let monitor = pool.monitor();
    let shutdown = pool.shutdown_token();

    // Periodic status line, in place of any richer reporting channel.
    let status_interval = std::time::Duration::from_secs(30);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(status_interval).await;
            let (active, connected) = monitor.stats();
            info!("Pool status: {}/{} workers connected", connected, active);
        }
    });

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Interrupt received, shutting down");
        shutdown.cancel();
    });

    pool.run().await;
    Ok(())
}
