//! Communication channels (Telegram).
//!
//! Inbound messages flow to the dispatcher; replies go back through a [`ChannelHandle`].

mod handle;
mod inbound;
mod telegram;

pub use handle::{ChannelHandle, Reply, ReplyFormat};
pub use inbound::{InboundMessage, ReplyTarget};
pub use telegram::{BotCommandInfo, BotUser, TelegramChannel, TelegramError, TelegramUpdate};
