use crate::error::{DevServeError, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout of a single refresh request.
pub const REFRESH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Tells connected clients that a new server is up.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RefreshNotifier: Send + Sync {
    async fn notify(&self, port: u16) -> Result<()>;
}

/// Posts to the server's live-reload endpoint.
pub struct HttpRefreshNotifier {
    http_client: Client,
}

impl HttpRefreshNotifier {
    pub fn new() -> Result<Self> {
        let http_client = Client::builder().timeout(REFRESH_REQUEST_TIMEOUT).build()?;
        Ok(Self { http_client })
    }

    pub fn refresh_url(port: u16) -> String {
        format!("http://localhost:{port}/__refresh")
    }
}

#[async_trait]
impl RefreshNotifier for HttpRefreshNotifier {
    async fn notify(&self, port: u16) -> Result<()> {
        let response = self
            .http_client
            .post(Self::refresh_url(port))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(DevServeError::ConnectionError(format!(
                "Refresh endpoint returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Best-effort refresh: one attempt, then one retry after `retry_delay`.
/// Returns whether a notification got through; failures are never errors.
pub async fn notify_refresh(notifier: &dyn RefreshNotifier, port: u16, retry_delay: Duration) -> bool {
    match notifier.notify(port).await {
        Ok(()) => return true,
        Err(e) => debug!("Refresh notification failed, retrying: {e}"),
    }

    tokio::time::sleep(retry_delay).await;

    match notifier.notify(port).await {
        Ok(()) => true,
        Err(e) => {
            warn!("Could not notify clients to refresh: {e}");
            false
        }
    }
}
