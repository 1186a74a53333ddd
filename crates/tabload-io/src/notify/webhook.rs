//! Webhook notifier for run summaries and alerts.

use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use tabload_core::{retry, LoadError, RetryPolicy};

/// Alert severity, rendered into the message text and the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertLevel {
    Info,
    Warning,
    Error,
    Critical,
    Success,
}

impl AlertLevel {
    pub fn name(&self) -> &'static str {
        match self {
            AlertLevel::Info => "INFO",
            AlertLevel::Warning => "WARNING",
            AlertLevel::Error => "ERROR",
            AlertLevel::Critical => "CRITICAL",
            AlertLevel::Success => "SUCCESS",
        }
    }

    fn emoji(&self) -> &'static str {
        match self {
            AlertLevel::Info => "\u{2139}\u{fe0f}",
            AlertLevel::Warning => "\u{26a0}\u{fe0f}",
            AlertLevel::Error => "\u{274c}",
            AlertLevel::Critical => "\u{1f6a8}",
            AlertLevel::Success => "\u{2705}",
        }
    }
}

/// POSTs `{text, title, timestamp, level, details?}` to the configured URL.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
    policy: RetryPolicy,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url,
            policy: RetryPolicy::default(),
        }
    }

    /// Deliver one notification, best-effort. Returns whether the webhook
    /// accepted it.
    pub async fn notify(
        &self,
        level: AlertLevel,
        title: &str,
        message: &str,
        details: Option<serde_json::Value>,
    ) -> bool {
        let Some(url) = &self.url else {
            warn!("WEBHOOK_URL not configured, skipping webhook notification");
            return false;
        };

        let timestamp = Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
        let mut lines = vec![
            format!("{} *{}*", level.emoji(), level.name()),
            format!("*{title}*"),
            format!("*Timestamp:* {timestamp}"),
            format!("*Message:* {message}"),
        ];
        if let Some(serde_json::Value::Object(map)) = &details {
            lines.push("\n*Details:*".to_string());
            for (key, value) in map {
                lines.push(format!("\u{2022} *{key}:* {value}"));
            }
        }

        let mut payload = json!({
            "text": lines.join("\n"),
            "title": title,
            "timestamp": timestamp,
            "level": level.name(),
        });
        if let Some(details) = details {
            payload["details"] = details;
        }

        let outcome = retry(self.policy, "webhook notification", || {
            let request = self.client.post(url).json(&payload);
            async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| LoadError::storage("posting webhook", e))?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(LoadError::storage(
                        "posting webhook",
                        format!("webhook returned status {}", response.status()),
                    ))
                }
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                info!(title, "sent webhook notification");
                true
            }
            Err(e) => {
                error!(title, error = %e, "failed to send webhook notification after retries");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_url_is_a_quiet_no_op() {
        let notifier = WebhookNotifier::new(None);
        assert!(!notifier.notify(AlertLevel::Info, "t", "m", None).await);
    }

    #[test]
    fn level_names_are_uppercase() {
        assert_eq!(AlertLevel::Critical.name(), "CRITICAL");
        assert_eq!(AlertLevel::Success.name(), "SUCCESS");
    }
}
