//! Subscriptions and monitored items.
//!
//! A [`MonitoredItem`] samples one variable into a bounded queue. A [`Subscription`]
//! owns a set of items and runs the publish cycle that batches their queues into
//! [`NotificationMessage`]s and answers client publish requests. Neither type owns a
//! timer: the server's scheduler calls [`MonitoredItem::sample`] and
//! [`Subscription::tick`] when they are due.

pub mod monitored_item;
pub mod notification;
pub mod publish;
#[allow(clippy::module_inception)]
pub mod subscription;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use monitored_item::{
    CreatedMonitoredItem, DataChangeTrigger, DiscardPolicy, MonitoredItem, MonitoringMode, MonitoringParameters,
    SampleOutcome,
};
pub use notification::{MonitoredItemNotification, NotificationBody, NotificationMessage};
pub use publish::{PublishHandle, PublishResponse};
pub use subscription::{CreatedSubscription, Subscription, SubscriptionParameters, TickOutcome};

/// Server-assigned subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(u32);

impl SubscriptionId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw id.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned monitored item identifier, unique within the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitoredItemId(u32);

impl MonitoredItemId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// The raw id.
    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MonitoredItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a subscription stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Deleted by its owner.
    Deleted,
    /// The lifecycle counter reached zero.
    Expired,
    /// The session's channel was lost.
    Disconnected,
    /// The owning session was closed.
    SessionClosed,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deleted => "deleted",
            Self::Expired => "expired",
            Self::Disconnected => "disconnected",
            Self::SessionClosed => "session closed",
        };
        f.write_str(s)
    }
}

/// Publish-cycle state.
///
/// `Late` means the last tick produced a message while no publish request was
/// outstanding; the message is held until the next request arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    /// Created, first publish cycle not yet run.
    Creating,
    /// Publishing normally.
    Normal,
    /// Output is being held until a publish request arrives.
    Late,
    /// Terminated; no further output.
    Closed(CloseReason),
}

impl SubscriptionState {
    /// True for `Closed(_)`.
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed(_))
    }
}
