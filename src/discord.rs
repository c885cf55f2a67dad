use chrono::Utc;
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::config::Discord;

const RED: u32 = 15158332;
const GREEN: u32 = 3066993;

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Embed {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Default)]
pub struct MessageBuilder {
    content: Option<String>,
    embeds: Vec<Embed>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content(mut self, content: impl ToString) -> Self {
        self.content = Some(content.to_string());
        self
    }

    pub fn add_embed(mut self, embed: Embed) -> Self {
        self.embeds.push(embed);
        self
    }

    pub fn build(self) -> Message {
        Message {
            content: self.content,
            embeds: self.embeds,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscordManager {
    client: Client,
    hostname: String,
}

impl DiscordManager {
    pub fn new(client: Client, hostname: impl Into<String>) -> Self {
        Self {
            client,
            hostname: hostname.into(),
        }
    }

    pub fn build_degraded_embed(&self, failures: u32) -> Embed {
        Embed {
            title: Some("🔌 Alert Server Unreachable".to_string()),
            description: Some(format!(
                "Sensor client **{}** cannot reach the alert server",
                self.hostname
            )),
            color: Some(RED),
            fields: vec![EmbedField {
                name: "❌ Consecutive Failures".to_string(),
                value: failures.to_string(),
                inline: true,
            }],
            footer: Some(self.footer()),
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    pub fn build_restored_embed(&self) -> Embed {
        Embed {
            title: Some("✅ Alert Server Reachable".to_string()),
            description: Some(format!(
                "Sensor client **{}** is connected to the alert server again",
                self.hostname
            )),
            color: Some(GREEN),
            fields: vec![],
            footer: Some(self.footer()),
            timestamp: Some(Utc::now().to_rfc3339()),
        }
    }

    fn footer(&self) -> EmbedFooter {
        EmbedFooter {
            text: format!("Client: {}", self.hostname),
        }
    }

    #[instrument(skip(self, discord, message))]
    pub async fn send_message(&self, discord: &Discord, message: &Message) {
        match self.client.post(&discord.url).json(message).send().await {
            Ok(response) => {
                if response.status().is_success() {
                    info!("Successfully sent Discord message");
                } else {
                    error!("Discord message failed with status: {}", response.status());
                    if let Ok(error_text) = response.text().await {
                        error!("Discord API error response: {}", error_text);
                    }
                }
            }
            Err(e) => {
                error!("Failed to send Discord message: {}", e);
            }
        }
    }
}
