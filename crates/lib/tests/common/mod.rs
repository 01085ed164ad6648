//! Helpers shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use rcebot::auth::{AuthorizationTable, TableHandle};
use rcebot::channels::{ChannelHandle, InboundMessage, Reply, ReplyTarget};
use rcebot::config::Config;
use std::sync::Mutex;
use std::time::Duration;

/// Channel that records every reply instead of sending it.
#[derive(Default)]
pub struct RecordingChannel {
    pub replies: Mutex<Vec<(ReplyTarget, Reply)>>,
}

impl RecordingChannel {
    pub fn replies(&self) -> Vec<(ReplyTarget, Reply)> {
        self.replies.lock().unwrap().clone()
    }

    /// Wait until at least `n` replies have been recorded.
    pub async fn wait_for(&self, n: usize) -> Vec<(ReplyTarget, Reply)> {
        for _ in 0..200 {
            let replies = self.replies();
            if replies.len() >= n {
                return replies;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("expected {} replies, got {:?}", n, self.replies());
    }
}

#[async_trait]
impl ChannelHandle for RecordingChannel {
    fn id(&self) -> &str {
        "recording"
    }

    fn stop(&self) {}

    async fn send_reply(&self, target: &ReplyTarget, reply: &Reply) -> Result<(), String> {
        self.replies.lock().unwrap().push((*target, reply.clone()));
        Ok(())
    }
}

pub fn authorization_table(json: &str) -> AuthorizationTable {
    let config: Config = serde_json::from_str(json).expect("parse config");
    AuthorizationTable::from_config(&config).expect("valid config")
}

pub fn table(json: &str) -> TableHandle {
    TableHandle::new(authorization_table(json))
}

pub fn message(sender_id: i64, text: &str) -> InboundMessage {
    InboundMessage {
        sender_id,
        sender_username: Some(format!("user{}", sender_id)),
        text: text.to_string(),
        target: ReplyTarget {
            chat_id: sender_id,
            thread_id: None,
            message_id: 100,
        },
    }
}

/// Poll until `check` holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
