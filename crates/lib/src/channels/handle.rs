//! Outbound side of a channel: replies and the handle trait the gateway sends through.

use async_trait::async_trait;

use crate::channels::inbound::ReplyTarget;

/// How the reply text is to be interpreted by the chat client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyFormat {
    Plain,
    /// Telegram MarkdownV2; the text must already be escaped.
    MarkdownV2,
}

/// One reply message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    pub format: ReplyFormat,
}

impl Reply {
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: ReplyFormat::Plain,
        }
    }

    pub fn markdown(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            format: ReplyFormat::MarkdownV2,
        }
    }
}

/// Handle to a running channel (stop, send reply).
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel id (e.g. "telegram").
    fn id(&self) -> &str;
    /// Stop the channel connector.
    fn stop(&self);
    /// Send a reply to the message identified by `target`.
    async fn send_reply(&self, target: &ReplyTarget, reply: &Reply) -> Result<(), String>;
}
