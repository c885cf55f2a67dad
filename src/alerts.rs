use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::config::{Alert, Webhook};
use crate::discord::{DiscordManager, MessageBuilder};

/// Side channel used when the alert server itself is unreachable
///
/// Implementations handle their own failures; nothing is reported back.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_connectivity_degraded(&self, consecutive_failures: u32);

    async fn notify_connectivity_restored(&self);
}

#[derive(Debug, Clone)]
pub struct AlertManager {
    client: Client,
    alert: Alert,
    hostname: String,
    discord_manager: DiscordManager,
}

impl AlertManager {
    pub fn new(alert: Alert, hostname: impl Into<String>, timeout: Duration) -> Self {
        let hostname = hostname.into();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|e| {
                warn!("unable to configure notification client ({e}), using defaults");
                Client::new()
            });

        Self {
            discord_manager: DiscordManager::new(client.clone(), hostname.clone()),
            client,
            alert,
            hostname,
        }
    }

    fn format_degraded_message(&self, failures: u32) -> String {
        format!(
            "🔌 **Connection Lost**: Sensor client `{}` could not reach the alert server ({} consecutive failures)",
            self.hostname, failures
        )
    }

    fn format_restored_message(&self) -> String {
        format!(
            "✅ **Connection Restored**: Sensor client `{}` is connected to the alert server again",
            self.hostname
        )
    }

    #[instrument(skip(self, webhook))]
    async fn send_webhook_alert(&self, webhook: &Webhook, message: &str, failures: u32) {
        let payload = json!({
            "message": message,
            "client": self.hostname,
            "failures": failures,
            "timestamp": Utc::now().to_rfc3339()
        });

        match self.client.post(&webhook.url).json(&payload).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent webhook alert");
                } else {
                    error!("Webhook alert failed with status: {}", response.status());
                }
            }
            Err(e) => {
                error!("Failed to send webhook alert: {}", e);
            }
        }
    }
}

#[async_trait]
impl NotificationSink for AlertManager {
    #[instrument(skip(self))]
    async fn notify_connectivity_degraded(&self, consecutive_failures: u32) {
        match &self.alert {
            Alert::Discord(discord) => {
                let embed = self.discord_manager.build_degraded_embed(consecutive_failures);
                let mut message_builder = MessageBuilder::new().add_embed(embed);
                if let Some(user_id) = &discord.user_id {
                    message_builder = message_builder
                        .content(format!("🔌 ({}) <@{user_id}>", self.hostname));
                }

                self.discord_manager
                    .send_message(discord, &message_builder.build())
                    .await;
            }
            Alert::Webhook(webhook) => {
                let message = self.format_degraded_message(consecutive_failures);
                self.send_webhook_alert(webhook, &message, consecutive_failures)
                    .await;
            }
        }
    }

    #[instrument(skip(self))]
    async fn notify_connectivity_restored(&self) {
        match &self.alert {
            Alert::Discord(discord) => {
                let embed = self.discord_manager.build_restored_embed();
                let message = MessageBuilder::new().add_embed(embed).build();

                self.discord_manager.send_message(discord, &message).await;
            }
            Alert::Webhook(webhook) => {
                let message = self.format_restored_message();
                self.send_webhook_alert(webhook, &message, 0).await;
            }
        }
    }
}
