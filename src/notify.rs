//! # Notifications
//!
//! Fire-and-forget user-visible messages. Display is someone else's job; the
//! engine only enqueues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    Success,
    Error,
    Info,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub kind: NotificationKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtext: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Notification {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            subtext: None,
            network: None,
            created_at: Utc::now(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Error, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Info, message)
    }

    pub fn with_subtext(mut self, subtext: impl Into<String>) -> Self {
        self.subtext = Some(subtext.into());
        self
    }

    pub fn with_network(mut self, network: &str) -> Self {
        self.network = Some(network.to_string());
        self
    }
}

/// `0x1234ab...cdef` form used in notification subtexts.
pub fn short_wallet_address(address: &str) -> String {
    let chars: Vec<char> = address.chars().collect();
    if chars.len() < 13 {
        return address.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}...{}", head, tail)
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log. Used when no UI is attached.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        let subtext = notification.subtext.as_deref().unwrap_or("");
        match notification.kind {
            NotificationKind::Error => {
                log::warn!("Notification: {} {}", notification.message, subtext)
            }
            _ => log::info!("Notification: {} {}", notification.message, subtext),
        }
    }
}

/// Forwards notifications to a receiver owned by the presentation layer.
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (ChannelNotifier { sender }, receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if self.sender.send(notification).is_err() {
            log::debug!("Notification: receiver dropped, message discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier() {
        let (notifier, mut rx) = ChannelNotifier::new();
        notifier.notify(Notification::success("Shield complete").with_network("Ethereum"));
        let received = rx.try_recv().unwrap();
        assert_eq!(received.kind, NotificationKind::Success);
        assert_eq!(received.network.as_deref(), Some("Ethereum"));

        // Dropped receiver does not panic
        drop(rx);
        notifier.notify(Notification::error("ignored"));
    }

    #[test]
    fn test_short_wallet_address() {
        assert_eq!(
            short_wallet_address("0x1234567890abcdef1234"),
            "0x123456...1234"
        );
        assert_eq!(short_wallet_address("0xabc"), "0xabc");
    }

    #[test]
    fn test_notification_ids_are_unique() {
        let a = Notification::info("a");
        let b = Notification::info("a");
        assert_ne!(a.id, b.id);
    }
}
