use std::time::Duration;

use common::config;
use derive_more::{Display, Error, From};
use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{debug, warn};

/// Timeout of a single webhook request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Webhook delivery errors.
#[derive(Debug, Display, From, Error)]
enum NotifyError {
    /// HTTP client error.
    Http(reqwest::Error),
}

/// Incoming webhook payload.
#[derive(Serialize)]
struct WebhookMessage<'a> {
    /// Message text.
    text: &'a str,
}

/// Best-effort team chat notifications.
pub(crate) struct Notifier {
    /// Incoming webhook URL, if configured.
    webhook_url: Option<String>,
}

impl Notifier {
    /// Create a notifier from the notification settings.
    pub fn new(config: &config::Notifications) -> Self {
        Self {
            webhook_url: config.webhook_url.clone(),
        }
    }

    /// Post a message to the webhook.
    ///
    /// Delivery failures never fail the calling operation, they are only logged.
    pub fn notify(&self, message: &str) {
        let Some(url) = &self.webhook_url else {
            debug!("no webhook configured, skipping notification");
            return;
        };

        if let Err(error) = Self::post(url, message) {
            warn!(%error, "unable to deliver notification");
        }
    }

    /// Deliver a single message.
    fn post(url: &str, message: &str) -> Result<(), NotifyError> {
        Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?
            .post(url)
            .json(&WebhookMessage { text: message })
            .send()?
            .error_for_status()?;

        Ok(())
    }
}
