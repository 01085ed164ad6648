//! Inbound message from a channel: delivered to the dispatcher for authorization and handling.

/// Where a reply goes: the originating chat, topic thread, and the message being answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyTarget {
    pub chat_id: i64,
    pub thread_id: Option<i64>,
    pub message_id: i64,
}

/// A text message from a chat user.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Telegram user id of the sender; the authorization key.
    pub sender_id: i64,
    /// Sender username, for logs only.
    pub sender_username: Option<String>,
    pub text: String,
    pub target: ReplyTarget,
}
