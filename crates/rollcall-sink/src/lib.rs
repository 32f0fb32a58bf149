//! rollcall-sink: Where attendance events go once the pipeline emits them.
//!
//! [`SqliteEventStore`] is the durable log. Notifications are best-effort:
//! [`TelegramNotifier`] when a bot token is configured, [`LogNotifier`] otherwise.

pub mod sqlite;
pub mod telegram;

pub use sqlite::SqliteEventStore;
pub use telegram::{LogNotifier, Recipient, RecipientRegistry, TelegramNotifier};
