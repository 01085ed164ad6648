//! rcebot core library: lets authorized Telegram users run allow-listed commands on the host.
//!
//! Command parsing, the authorization table, MarkdownV2 replies, the execution coordinator,
//! the dispatcher, the Telegram channel and the gateway that ties them together.

pub mod auth;
pub mod channels;
pub mod command;
pub mod config;
pub mod dispatch;
pub mod escape;
pub mod exec;
pub mod gateway;
pub mod init;
