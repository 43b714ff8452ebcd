//! Webhook alerts for operational events.
//!
//! This module provides:
//! - Alert level classification (Info, Warning, Critical)
//! - Alert formatting for control actions, fills and failures
//! - Simple rate limiting per webhook
//! - Optional configuration (gracefully disabled when no webhook URL)
//!
//! Alerts are best effort. A failed webhook call is logged and dropped; it
//! never blocks the trading path.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Webhook rate limit window
const RATE_LIMIT_REQUESTS: u32 = 30;
const RATE_LIMIT_WINDOW_SECS: u64 = 60;

// ============================================================================
// ALERT TYPES
// ============================================================================

/// Alert severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    #[default]
    Info,
    Warning,
    Critical,
}

impl AlertLevel {
    fn emoji(&self) -> &'static str {
        match self {
            AlertLevel::Info => "ℹ️",
            AlertLevel::Warning => "⚠️",
            AlertLevel::Critical => "🚨",
        }
    }
}

/// Outgoing webhook payload
#[derive(Debug, Serialize)]
struct WebhookPayload {
    content: String,
}

// ============================================================================
// RATE LIMITER
// ============================================================================

/// Sliding-window request counter
struct RateLimiter {
    timestamps: Mutex<Vec<std::time::Instant>>,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            timestamps: Mutex::new(Vec::new()),
        }
    }

    /// Whether another request fits in the window right now.
    async fn allow(&self) -> bool {
        let now = std::time::Instant::now();
        let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);

        let mut timestamps = self.timestamps.lock().await;
        timestamps.retain(|t| now.duration_since(*t) < window);

        if timestamps.len() as u32 >= RATE_LIMIT_REQUESTS {
            return false;
        }
        timestamps.push(now);
        true
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

/// Sends operational alerts to a webhook, when one is configured.
pub struct AlertNotifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
    min_level: AlertLevel,
    limiter: RateLimiter,
}

impl AlertNotifier {
    pub fn new(webhook_url: Option<String>, min_level: AlertLevel) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            http,
            webhook_url,
            min_level,
            limiter: RateLimiter::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    /// Send an alert. Silently drops when disabled, below the minimum
    /// level, or rate limited.
    pub async fn send(&self, level: AlertLevel, message: &str) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        if level < self.min_level {
            return;
        }
        if !self.limiter.allow().await {
            debug!("[ALERT] rate limited, dropping: {}", message);
            return;
        }

        let payload = WebhookPayload {
            content: format!("{} {}", level.emoji(), message),
        };

        match self.http.post(url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                debug!("[ALERT] sent {:?}: {}", level, message);
            }
            Ok(resp) => {
                warn!("[ALERT] webhook returned {}: {}", resp.status(), message);
            }
            Err(e) => {
                warn!("[ALERT] webhook call failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_ordering() {
        assert!(AlertLevel::Info < AlertLevel::Warning);
        assert!(AlertLevel::Warning < AlertLevel::Critical);
    }

    #[tokio::test]
    async fn test_disabled_notifier_is_a_noop() {
        let notifier = AlertNotifier::new(None, AlertLevel::Info);
        assert!(!notifier.is_enabled());
        // Must not panic or block without a URL
        notifier.send(AlertLevel::Critical, "system stopped").await;
    }

    #[tokio::test]
    async fn test_rate_limiter_window() {
        let limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_REQUESTS {
            assert!(limiter.allow().await);
        }
        assert!(!limiter.allow().await);
    }
}
