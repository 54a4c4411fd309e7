//! # Herald CLI
//!
//! Terminal listener for the push channel.
//!
//! ## Usage
//! ```text
//! HERALD_TOKEN=<jwt> HERALD_BROKER_URL=wss://host/ws herald [config.toml]
//! ```
//!
//! Each line typed on stdin is parsed as JSON and published. A string
//! `destination` field picks the destination; otherwise the configured
//! outbound topic is used.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use herald_link::client::{DEFAULT_PUBLISH_ATTEMPTS, DEFAULT_PUBLISH_BACKOFF};
use herald_link::{ChannelNotifier, HeraldClient, LinkConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = LinkConfig::load(config_path).context("Failed to load configuration")?;

    let token = match std::env::var("HERALD_TOKEN") {
        Ok(token) if !token.is_empty() => token,
        _ => bail!("HERALD_TOKEN is not set"),
    };

    let (notifier, mut alerts) = ChannelNotifier::new(32);
    let client = HeraldClient::builder(config)
        .notifier(Arc::new(notifier))
        .build()?;

    let logged_out = Arc::new(Notify::new());
    let _logout = {
        let logged_out = logged_out.clone();
        client.register_logout_callback(move || {
            logged_out.notify_one();
            Ok(())
        })
    };

    client.sign_in(&token).await.context("Sign in failed")?;

    let mut status = client.subscribe_status();
    let mut feed = client.subscribe_feed();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,

            _ = logged_out.notified() => {
                println!("Session expired, sign in again.");
                break;
            }

            Ok(()) = status.changed() => {
                let status = status.borrow_and_update().clone();
                match status.last_error {
                    Some(err) => println!("[{}] {}", status.state, err),
                    None => println!("[{}]", status.state),
                }
            }

            Ok(()) = feed.changed() => {
                let feed = feed.borrow_and_update().clone();
                if let Some(latest) = feed.latest() {
                    println!(
                        "({} unread) {} [{}]: {}",
                        feed.unread(),
                        latest.title,
                        latest.category,
                        latest.body
                    );
                }
            }

            Some(alert) = alerts.recv() => {
                println!("\u{1F514} {}: {}", alert.title, alert.body);
            }

            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) if !line.trim().is_empty() => publish_line(&client, &line).await,
                    Ok(Some(_)) => {}
                    Ok(None) | Err(_) => stdin_open = false,
                }
            }
        }
    }

    client.shutdown().await.ok();
    info!("Herald stopped");
    Ok(())
}

async fn publish_line(client: &HeraldClient, line: &str) {
    let payload = match serde_json::from_str(line) {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Input is not JSON");
            return;
        }
    };
    match client
        .publish_with_retry(payload, DEFAULT_PUBLISH_ATTEMPTS, DEFAULT_PUBLISH_BACKOFF)
        .await
    {
        Ok(()) => info!("Published"),
        Err(e) => warn!(error = %e, "Publish failed"),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,herald_link=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
