// =============================================================================
// Discord notifier — trade announcements over the bot REST API
// =============================================================================
//
// Best-effort only: a notification failure is logged and never touches the
// trading loop. Spot and options fills go to separate channels.
// =============================================================================

use serde_json::json;
use tracing::{debug, warn};

use crate::config::DiscordConfig;
use crate::types::TradeKind;

const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

/// Per-request timeout (seconds).
const REQUEST_TIMEOUT_SECS: u64 = 10;

pub struct DiscordNotifier {
    client: reqwest::Client,
    token: String,
    spot_channel: String,
    options_channel: String,
}

impl DiscordNotifier {
    /// Build a notifier from config; `None` when disabled or unusable.
    pub fn from_config(config: &DiscordConfig) -> Option<Self> {
        if !config.enabled {
            return None;
        }
        if config.token.is_empty() {
            warn!("discord notifications enabled but no bot token configured — disabled");
            return None;
        }

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");

        Some(Self {
            client,
            token: config.token.clone(),
            spot_channel: config.channels.spot.clone(),
            options_channel: config.channels.options.clone(),
        })
    }

    /// Post one trade line to the channel for its book.
    pub async fn notify_trade(&self, kind: TradeKind, content: &str) {
        let channel = match kind {
            TradeKind::Spot => &self.spot_channel,
            TradeKind::Options => &self.options_channel,
        };
        if channel.is_empty() {
            debug!(kind = %kind, "no channel configured for trade kind — notification skipped");
            return;
        }

        let url = format!("{DISCORD_API_BASE}/channels/{channel}/messages");
        let result = self
            .client
            .post(&url)
            .header("Authorization", format!("Bot {}", self.token))
            .json(&json!({ "content": content }))
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                debug!(%channel, "trade notification sent");
            }
            Ok(resp) => {
                warn!(%channel, status = %resp.status(), "discord rejected trade notification");
            }
            Err(err) => {
                warn!(%channel, error = %err, "failed to send trade notification");
            }
        }
    }
}

impl std::fmt::Debug for DiscordNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordNotifier")
            .field("spot_channel", &self.spot_channel)
            .field("options_channel", &self.options_channel)
            .finish()
    }
}
