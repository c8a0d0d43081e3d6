//! Telegram delivery for alerts and anomaly notifications.

use serde_json::json;
use std::time::Duration;
use tracing::{error, warn};

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Send one HTML-formatted message. Returns whether Telegram accepted
/// it; failures are logged and never propagate.
pub async fn send_message(bot_token: &str, chat_id: &str, text: &str) -> bool {
    let url = format!("https://api.telegram.org/bot{}/sendMessage", bot_token);
    let client = match reqwest::Client::builder().timeout(SEND_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            error!("telegram client build failed: {}", e);
            return false;
        }
    };

    match client
        .post(&url)
        .json(&json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML",
        }))
        .send()
        .await
    {
        Ok(response) if response.status().is_success() => true,
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!("telegram send failed ({}): {}", status, body);
            false
        }
        Err(e) => {
            error!("telegram send error: {}", e);
            false
        }
    }
}

/// Configuration test: sends a fixed probe message.
pub async fn test_send(bot_token: &str, chat_id: &str) -> Result<(), String> {
    let text = "\u{2705} <b>Test alert</b>\n\nNotifications configured successfully!";
    if send_message(bot_token, chat_id, text).await {
        Ok(())
    } else {
        Err("Telegram send failed".into())
    }
}
