//! User-visible messages sent to the debugger front end.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Front-end channel a message is delivered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Console,
    OutputWindow,
    Notification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Log,
    Info,
    Warning,
    Error,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UserMessage {
    Text { level: Level, text: String },
    Notification { r#type: NotificationKind, message: String },
}

impl UserMessage {
    pub fn text(level: Level, text: impl Into<String>) -> Self {
        Self::Text {
            level,
            text: text.into(),
        }
    }

    pub fn error_notification(message: impl Into<String>) -> Self {
        Self::Notification {
            r#type: NotificationKind::Error,
            message: message.into(),
        }
    }
}

/// Delivers user-visible text to the front end.
pub trait ClientCallback: Send + Sync {
    fn send_user_message(&self, channel: Channel, message: UserMessage);
}

/// [`ClientCallback`] that forwards every message into an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelCallback {
    tx: mpsc::UnboundedSender<(Channel, UserMessage)>,
}

impl ChannelCallback {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(Channel, UserMessage)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ClientCallback for ChannelCallback {
    fn send_user_message(&self, channel: Channel, message: UserMessage) {
        if self.tx.send((channel, message)).is_err() {
            debug!(?channel, "No receiver for user message");
        }
    }
}
