use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use trading_core::{Alert, AlertSeverity, AlertSink, LogAlertSink, TradingStore};

use crate::config::AgentConfig;

pub struct DiscordNotifier {
    client: Client,
    webhook_url: String,
}

impl DiscordNotifier {
    pub fn new(webhook_url: String) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(10)).build()?,
            webhook_url,
        })
    }

    pub fn is_configured(&self) -> bool {
        !self.webhook_url.is_empty()
    }

    pub async fn send_message(&self, content: &str) -> Result<()> {
        if !self.is_configured() {
            tracing::debug!("Discord webhook not configured, skipping notification");
            return Ok(());
        }

        let payload = json!({
            "content": content,
            "username": "Derivatives Trading Agent",
        });

        self.client
            .post(&self.webhook_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?;

        tracing::debug!("Discord notification sent");
        Ok(())
    }

    pub async fn send_alert(&self, alert: &Alert) -> Result<()> {
        self.send_message(&format_alert(alert)).await
    }
}

fn format_alert(alert: &Alert) -> String {
    let badge = match alert.severity {
        AlertSeverity::Info => "INFO",
        AlertSeverity::Warning => "WARNING",
        AlertSeverity::Critical => "CRITICAL",
        AlertSeverity::Emergency => "EMERGENCY",
    };
    format!("**[{}] {}**\n{}", badge, alert.title, alert.message)
}

/// Alert sink used by the binaries: every alert is logged and written to
/// the store, then posted to Discord when a webhook is configured. Delivery
/// failures are logged and never surface to the caller.
pub struct AlertDispatcher {
    store: Arc<dyn TradingStore>,
    discord: DiscordNotifier,
}

impl AlertDispatcher {
    pub fn new(store: Arc<dyn TradingStore>, discord: DiscordNotifier) -> Self {
        Self { store, discord }
    }

    pub fn from_config(store: Arc<dyn TradingStore>, config: &AgentConfig) -> Result<Self> {
        let discord = DiscordNotifier::new(config.discord_webhook_url.clone())?;
        if !discord.is_configured() {
            tracing::info!("DISCORD_WEBHOOK_URL not set; alerts are logged and stored only");
        }
        Ok(Self::new(store, discord))
    }
}

#[async_trait]
impl AlertSink for AlertDispatcher {
    async fn emit(&self, alert: Alert) {
        LogAlertSink.emit(alert.clone()).await;

        if let Err(e) = self.store.insert_alert(&alert).await {
            tracing::warn!("Failed to persist alert '{}': {}", alert.title, e);
        }

        if let Err(e) = self.discord.send_alert(&alert).await {
            tracing::warn!("Failed to deliver alert '{}' to Discord: {}", alert.title, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trading_core::{AlertKind, MemoryStore};

    #[test]
    fn alert_message_carries_severity_and_title() {
        let alert = Alert::new(
            AlertKind::EmergencyStop,
            AlertSeverity::Emergency,
            "Emergency stop",
            "Daily loss -10.4%",
        );
        let text = format_alert(&alert);
        assert!(text.starts_with("**[EMERGENCY] Emergency stop**"));
        assert!(text.ends_with("Daily loss -10.4%"));
    }

    #[tokio::test]
    async fn dispatcher_persists_without_webhook() {
        let store = Arc::new(MemoryStore::new());
        let dispatcher =
            AlertDispatcher::new(store.clone(), DiscordNotifier::new(String::new()).unwrap());

        dispatcher
            .emit(Alert::new(
                AlertKind::SignalCreated,
                AlertSeverity::Info,
                "New long signal: BTCUSDT",
                "Confidence 81.0",
            ))
            .await;

        let alerts = store.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SignalCreated);
    }
}
