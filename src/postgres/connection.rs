// ABOUTME: PostgreSQL connection helpers with TLS and retry
// ABOUTME: Spawns the connection driver task and hands back a Client

use anyhow::{Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use std::sync::OnceLock;
use std::time::Duration;
use tokio_postgres::Client;

use crate::utils::{retry_with_backoff, strip_password_from_url};

static ALLOW_SELF_SIGNED: OnceLock<bool> = OnceLock::new();

/// Set the process-wide TLS policy. Only the first call has an effect.
pub fn init_tls_policy(allow_self_signed_certs: bool) {
    if ALLOW_SELF_SIGNED.set(allow_self_signed_certs).is_err() {
        tracing::debug!("TLS policy already initialized");
    }
    if allow_self_signed_certs {
        tracing::warn!("Accepting self-signed TLS certificates - use only for testing");
    }
}

fn make_tls_connector() -> Result<MakeTlsConnector> {
    let allow_invalid = ALLOW_SELF_SIGNED.get().copied().unwrap_or(false);
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(allow_invalid)
        .build()
        .context("Failed to build TLS connector")?;
    Ok(MakeTlsConnector::new(connector))
}

/// Connect to PostgreSQL and spawn the connection task.
///
/// TLS is negotiated according to the URL's `sslmode` (tokio-postgres
/// defaults to `prefer`).
pub async fn connect(url: &str) -> Result<Client> {
    let display_url = strip_password_from_url(url).unwrap_or_else(|_| "<invalid url>".into());
    let tls = make_tls_connector()?;

    let (client, connection) = tokio_postgres::connect(url, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", display_url))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("Connection error ({}): {}", display_url, e);
        }
    });

    Ok(client)
}

/// Connect with exponential backoff, for flaky remote sources.
pub async fn connect_with_retry(url: &str, max_retries: u32) -> Result<Client> {
    retry_with_backoff(|| connect(url), max_retries, Duration::from_secs(1)).await
}
