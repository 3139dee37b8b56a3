//! Notification messages delivered by the publish cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::DataValue;

use super::CloseReason;

/// One queued value change, tagged with the client's handle for the item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoredItemNotification {
    /// Handle the client supplied when creating the item.
    pub client_handle: u32,
    /// The sampled value.
    pub value: DataValue,
    /// Set on the first notification after one or more values were discarded.
    #[serde(default)]
    pub overflow: bool,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum NotificationBody {
    /// Batched value changes, oldest-first within each item and in item order across items.
    DataChange(Vec<MonitoredItemNotification>),
    KeepAlive,
    StatusChange(CloseReason),
}

/// A message answering one publish request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    /// For keep-alives this is the number the next data message will carry.
    pub sequence_number: u32,
    /// When the message was produced.
    pub publish_time: DateTime<Utc>,
    /// What the message carries.
    pub body: NotificationBody,
}

impl NotificationMessage {
    /// True for keep-alive messages.
    #[must_use]
    pub const fn is_keep_alive(&self) -> bool {
        matches!(self.body, NotificationBody::KeepAlive)
    }

    /// The data changes carried by this message; empty for keep-alive and status messages.
    #[must_use]
    pub fn data_changes(&self) -> &[MonitoredItemNotification] {
        match &self.body {
            NotificationBody::DataChange(items) => items,
            _ => &[],
        }
    }

    /// The close reason, for status-change messages.
    #[must_use]
    pub const fn status_change(&self) -> Option<CloseReason> {
        match self.body {
            NotificationBody::StatusChange(reason) => Some(reason),
            _ => None,
        }
    }
}
