//! Push notifications to recognised people over the Telegram Bot API.
//!
//! Registration happens out of band (a bot writes the registry file); this
//! side only reads it, on every send, so new registrations apply immediately.

use rollcall_core::{Delivery, Notification, Notifier, NotifyError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const API_BASE: &str = "https://api.telegram.org";
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recipient {
    pub chat_id: i64,
}

/// `{ "<identity>": { "chat_id": 123, ... } }`
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(transparent)]
pub struct RecipientRegistry {
    recipients: HashMap<String, Recipient>,
}

impl RecipientRegistry {
    /// Read the registry. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self, NotifyError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(NotifyError::Registry(format!("{}: {e}", path.display()))),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(&text).map_err(|e| NotifyError::Registry(format!("{}: {e}", path.display())))
    }

    pub fn get(&self, identity: &str) -> Option<&Recipient> {
        self.recipients.get(identity)
    }

    pub fn len(&self) -> usize {
        self.recipients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.is_empty()
    }
}

pub fn format_message(notification: &Notification) -> String {
    format!(
        "🔔 {} was recognised at {} (camera {})",
        notification.identity,
        notification.occurred_at.format("%Y-%m-%d %H:%M:%S UTC"),
        notification.camera_id,
    )
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: i64,
    text: &'a str,
}

pub struct TelegramNotifier {
    client: reqwest::blocking::Client,
    endpoint: String,
    registry_path: PathBuf,
}

impl TelegramNotifier {
    /// Must be built and dropped outside any async runtime.
    pub fn new(token: &str, registry_path: impl Into<PathBuf>) -> Result<Self, NotifyError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(SEND_TIMEOUT)
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{API_BASE}/bot{token}/sendMessage"),
            registry_path: registry_path.into(),
        })
    }
}

impl Notifier for TelegramNotifier {
    fn notify(&self, notification: &Notification) -> Result<Delivery, NotifyError> {
        let registry = RecipientRegistry::load(&self.registry_path)?;
        let Some(recipient) = registry.get(&notification.identity) else {
            tracing::debug!(identity = %notification.identity, "no registered recipient");
            return Ok(Delivery::NoRecipient);
        };

        let text = format_message(notification);
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SendMessage { chat_id: recipient.chat_id, text: &text })
            .send()
            // The URL embeds the bot token; keep it out of logs.
            .map_err(|e| NotifyError::Transport(e.without_url().to_string()))?;

        if !response.status().is_success() {
            return Err(NotifyError::Transport(format!("sendMessage: HTTP {}", response.status())));
        }
        tracing::info!(identity = %notification.identity, chat_id = recipient.chat_id, "notification sent");
        Ok(Delivery::Sent)
    }
}

/// Used when no bot token is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) -> Result<Delivery, NotifyError> {
        tracing::info!(
            identity = %notification.identity,
            camera = %notification.camera_id,
            at = %notification.occurred_at,
            "attendance notification"
        );
        Ok(Delivery::Sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn notification(identity: &str) -> Notification {
        Notification {
            identity: identity.into(),
            camera_id: "cam01".into(),
            occurred_at: Utc.with_ymd_and_hms(2024, 3, 1, 8, 30, 5).unwrap(),
        }
    }

    #[test]
    fn test_registry_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipients.json");
        std::fs::write(&path, r#"{"EMP001": {"chat_id": 4242, "username": "al"}, "EMP002": {"chat_id": -7}}"#).unwrap();

        let registry = RecipientRegistry::load(&path).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("EMP001"), Some(&Recipient { chat_id: 4242 }));
        assert_eq!(registry.get("EMP002").map(|r| r.chat_id), Some(-7));
        assert!(registry.get("EMP003").is_none());
    }

    #[test]
    fn test_registry_missing_or_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RecipientRegistry::load(&dir.path().join("absent.json")).unwrap().is_empty());

        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, "  \n").unwrap();
        assert!(RecipientRegistry::load(&empty).unwrap().is_empty());
    }

    #[test]
    fn test_registry_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipients.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(RecipientRegistry::load(&path), Err(NotifyError::Registry(_))));
    }

    #[test]
    fn test_message_format() {
        let text = format_message(&notification("EMP001"));
        assert!(text.contains("EMP001"));
        assert!(text.contains("2024-03-01 08:30:05 UTC"));
        assert!(text.contains("cam01"));
    }

    #[test]
    fn test_unregistered_identity_skips_send() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recipients.json");
        std::fs::write(&path, r#"{"EMP001": {"chat_id": 1}}"#).unwrap();

        let notifier = TelegramNotifier::new("test-token", &path).unwrap();
        assert_eq!(notifier.notify(&notification("stranger")).unwrap(), Delivery::NoRecipient);
    }

    #[test]
    fn test_log_notifier() {
        assert_eq!(LogNotifier.notify(&notification("EMP001")).unwrap(), Delivery::Sent);
    }
}
