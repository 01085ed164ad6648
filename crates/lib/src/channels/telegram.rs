//! Telegram channel: long-poll getUpdates or webhook, and sendMessage via Bot API.

use crate::channels::handle::{ChannelHandle, Reply, ReplyFormat};
use crate::channels::inbound::{InboundMessage, ReplyTarget};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
const ALLOWED_UPDATES: &[&str] = &["message"];

/// Bot API failure. `Api` carries the HTTP status Telegram answered with.
#[derive(Debug, Error)]
pub enum TelegramError {
    #[error("{method} request failed: {source}")]
    Http {
        method: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} failed: {status} {description}")]
    Api {
        method: &'static str,
        status: reqwest::StatusCode,
        description: String,
    },
}

impl TelegramError {
    /// Errors retrying cannot fix (bad token, bad request, conflicting webhook, ...).
    pub fn is_fatal(&self) -> bool {
        match self {
            TelegramError::Http { .. } => false,
            TelegramError::Api { status, .. } => matches!(status.as_u16(), 400 | 401 | 403 | 404 | 409),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram update payload (getUpdates result item or webhook POST body).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    #[serde(default)]
    pub message_thread_id: Option<i64>,
    #[serde(default)]
    pub from: Option<BotUser>,
    pub chat: TelegramChat,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

/// A Telegram user (message sender, or the bot itself from getMe).
#[derive(Debug, Clone, Deserialize)]
pub struct BotUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// Entry for setMyCommands.
#[derive(Debug, Clone, Serialize)]
pub struct BotCommandInfo {
    pub command: &'static str,
    pub description: &'static str,
}

impl TelegramUpdate {
    /// Text messages with a sender become inbound messages; everything else is dropped.
    pub fn into_inbound(self) -> Option<InboundMessage> {
        let msg = self.message?;
        let from = msg.from?;
        let text = msg.text?;
        Some(InboundMessage {
            sender_id: from.id,
            sender_username: from.username,
            text,
            target: ReplyTarget {
                chat_id: msg.chat.id,
                thread_id: msg.message_thread_id,
                message_id: msg.message_id,
            },
        })
    }
}

/// Telegram channel connector: long-polls for updates and sends replies via sendMessage.
pub struct TelegramChannel {
    id: String,
    token: String,
    api_base: String,
    stop: CancellationToken,
    client: reqwest::Client,
}

impl TelegramChannel {
    /// `api_base` overrides the official Bot API URL when non-empty.
    pub fn new(token: String, api_base: Option<&str>) -> Self {
        let api_base = api_base
            .map(|s| s.trim().trim_end_matches('/'))
            .filter(|s| !s.is_empty())
            .unwrap_or(TELEGRAM_API_BASE)
            .to_string();
        Self {
            id: "telegram".to_string(),
            token,
            api_base,
            stop: CancellationToken::new(),
            client: reqwest::Client::new(),
        }
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        body: &serde_json::Value,
    ) -> Result<T, TelegramError> {
        let res = self
            .client
            .post(self.method_url(method))
            .json(body)
            .send()
            .await
            .map_err(|source| TelegramError::Http { method, source })?;
        let status = res.status();
        let data: ApiResponse<T> = match res.json().await {
            Ok(d) => d,
            Err(source) if status.is_success() => return Err(TelegramError::Http { method, source }),
            Err(_) => {
                return Err(TelegramError::Api {
                    method,
                    status,
                    description: String::new(),
                })
            }
        };
        match data.result {
            Some(result) if data.ok && status.is_success() => Ok(result),
            _ => Err(TelegramError::Api {
                method,
                status,
                description: data.description.unwrap_or_default(),
            }),
        }
    }

    /// Start the getUpdates long-poll loop and forward messages to the gateway. Returns a handle to await on shutdown.
    pub fn start_inbound(
        self: Arc<Self>,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> JoinHandle<()> {
        log::info!("telegram channel: starting getUpdates long-poll loop");
        tokio::spawn(async move {
            run_get_updates_loop(self, inbound_tx).await;
        })
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(&self, offset: Option<i64>) -> Result<(Vec<TelegramUpdate>, Option<i64>), TelegramError> {
        let mut body = serde_json::json!({
            "timeout": LONG_POLL_TIMEOUT,
            "allowed_updates": ALLOWED_UPDATES,
        });
        if let Some(off) = offset {
            body["offset"] = serde_json::json!(off);
        }
        let updates: Vec<TelegramUpdate> = self.call("getUpdates", &body).await?;
        let next_offset = updates.iter().map(|u| u.update_id).max().map(|id| id + 1);
        Ok((updates, next_offset))
    }

    /// Identity of the bot (its username is how commands address it).
    pub async fn get_me(&self) -> Result<BotUser, TelegramError> {
        self.call("getMe", &serde_json::json!({})).await
    }

    /// Publish the command menu shown by Telegram clients.
    pub async fn set_my_commands(&self, commands: &[BotCommandInfo]) -> Result<(), TelegramError> {
        let _: bool = self
            .call("setMyCommands", &serde_json::json!({ "commands": commands }))
            .await?;
        Ok(())
    }

    /// Set webhook URL (and optional secret). When set, Telegram POSTs updates to the URL instead of getUpdates.
    pub async fn set_webhook(&self, url: &str, secret: Option<&str>) -> Result<(), TelegramError> {
        let mut body = serde_json::json!({
            "url": url,
            "allowed_updates": ALLOWED_UPDATES,
        });
        if let Some(s) = secret {
            body["secret_token"] = serde_json::Value::String(s.to_string());
        }
        let _: bool = self.call("setWebhook", &body).await?;
        Ok(())
    }

    /// Remove webhook so the bot can use getUpdates again.
    pub async fn delete_webhook(&self) -> Result<(), TelegramError> {
        let _: bool = self.call("deleteWebhook", &serde_json::json!({})).await?;
        Ok(())
    }

    /// Send a reply via sendMessage, threaded to the original message.
    pub async fn send_message(&self, target: &ReplyTarget, reply: &Reply) -> Result<(), TelegramError> {
        let mut body = serde_json::json!({
            "chat_id": target.chat_id,
            "text": reply.text,
            "reply_parameters": {
                "message_id": target.message_id,
                "allow_sending_without_reply": true,
            },
        });
        if let Some(thread_id) = target.thread_id {
            body["message_thread_id"] = serde_json::json!(thread_id);
        }
        if reply.format == ReplyFormat::MarkdownV2 {
            body["parse_mode"] = serde_json::json!("MarkdownV2");
        }
        let _: serde_json::Value = self.call("sendMessage", &body).await?;
        Ok(())
    }
}

async fn run_get_updates_loop(channel: Arc<TelegramChannel>, inbound_tx: mpsc::Sender<InboundMessage>) {
    let mut offset: Option<i64> = None;
    while !channel.stop.is_cancelled() {
        let result = tokio::select! {
            r = channel.get_updates(offset) => r,
            _ = channel.stop.cancelled() => break,
        };
        match result {
            Ok((updates, next)) => {
                if next.is_some() {
                    offset = next;
                }
                for inbound in updates.into_iter().filter_map(TelegramUpdate::into_inbound) {
                    if inbound_tx.send(inbound).await.is_err() {
                        log::debug!("telegram: inbound channel closed, stopping loop");
                        return;
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => {}
                    _ = channel.stop.cancelled() => break,
                }
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl ChannelHandle for TelegramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    async fn send_reply(&self, target: &ReplyTarget, reply: &Reply) -> Result<(), String> {
        self.send_message(target, reply).await.map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_with_text_becomes_inbound() {
        let json = r#"{
            "update_id": 10,
            "message": {
                "message_id": 77,
                "message_thread_id": 3,
                "from": {"id": 42, "is_bot": false, "first_name": "Ada", "username": "ada"},
                "chat": {"id": -100, "type": "supergroup"},
                "text": "/list"
            }
        }"#;
        let update: TelegramUpdate = serde_json::from_str(json).unwrap();
        let inbound = update.into_inbound().expect("inbound");
        assert_eq!(inbound.sender_id, 42);
        assert_eq!(inbound.sender_username.as_deref(), Some("ada"));
        assert_eq!(inbound.text, "/list");
        assert_eq!(
            inbound.target,
            ReplyTarget {
                chat_id: -100,
                thread_id: Some(3),
                message_id: 77
            }
        );
    }

    #[test]
    fn update_without_text_or_sender_is_dropped() {
        let no_text = r#"{"update_id": 1, "message": {"message_id": 1, "from": {"id": 1, "first_name": "a"}, "chat": {"id": 1}}}"#;
        let no_from = r#"{"update_id": 2, "message": {"message_id": 1, "chat": {"id": 1}, "text": "/start"}}"#;
        let no_message = r#"{"update_id": 3}"#;
        for json in [no_text, no_from, no_message] {
            let update: TelegramUpdate = serde_json::from_str(json).unwrap();
            assert!(update.into_inbound().is_none(), "{}", json);
        }
    }

    #[test]
    fn api_base_override_is_trimmed() {
        let ch = TelegramChannel::new("T".to_string(), Some("http://localhost:8081/ "));
        assert_eq!(ch.method_url("getMe"), "http://localhost:8081/botT/getMe");
        let ch = TelegramChannel::new("T".to_string(), Some(""));
        assert_eq!(ch.method_url("getMe"), "https://api.telegram.org/botT/getMe");
    }

    #[test]
    fn client_errors_are_fatal() {
        let err = |code: u16| TelegramError::Api {
            method: "getMe",
            status: reqwest::StatusCode::from_u16(code).unwrap(),
            description: String::new(),
        };
        assert!(err(401).is_fatal());
        assert!(err(409).is_fatal());
        assert!(!err(429).is_fatal());
        assert!(!err(502).is_fatal());
    }
}
