//! Client side of the engine.
//!
//! A [`ClientSession`] talks to the server through a [`SessionChannel`]. The in-process
//! [`Session`] is one such channel; anything that can forward these calls to a server
//! can stand in for it.

pub mod stream;
pub mod subscription;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::address_space::ChildReference;
use crate::error::UaResult;
use crate::node_id::NodeId;
use crate::server::Session;
use crate::subscription::{
    CreatedMonitoredItem, CreatedSubscription, MonitoredItemId, MonitoringParameters, PublishHandle, SubscriptionId,
    SubscriptionParameters,
};
use crate::value::{DataValue, Variant};

pub use stream::{ItemChange, ItemChangeStream};
pub use subscription::{ClientMonitoredItem, ClientSubscription, SubscriptionEvent};

/// How long the publisher thread blocks on one publish request before re-checking
/// whether it has been stopped.
pub const DEFAULT_PUBLISH_POLL: Duration = Duration::from_millis(100);

/// The service calls a client needs from its server.
pub trait SessionChannel: Send + Sync + Debug {
    /// Reads the current value of a variable.
    fn read(&self, node_id: &NodeId) -> UaResult<DataValue>;

    /// Writes a variable.
    fn write(&self, node_id: &NodeId, value: Variant) -> UaResult<()>;

    /// Resolves a browse path from `root`.
    fn translate_browse_path(&self, root: &NodeId, path: &str) -> UaResult<NodeId>;

    /// Lists the children of a node.
    fn browse(&self, node_id: &NodeId) -> UaResult<Vec<ChildReference>>;

    /// Creates a subscription with the given requested parameters.
    fn create_subscription(&self, params: &SubscriptionParameters) -> UaResult<CreatedSubscription>;

    /// Deletes a subscription.
    fn delete_subscription(&self, id: SubscriptionId) -> UaResult<()>;

    /// Adds a monitored item to a subscription.
    fn create_monitored_item(
        &self,
        subscription_id: SubscriptionId,
        node_id: &NodeId,
        params: &MonitoringParameters,
    ) -> UaResult<CreatedMonitoredItem>;

    /// Removes a monitored item from a subscription.
    fn delete_monitored_item(&self, subscription_id: SubscriptionId, item_id: MonitoredItemId) -> UaResult<()>;

    /// Issues one publish request; the handle resolves with the server's answer.
    fn publish(&self, subscription_id: SubscriptionId) -> UaResult<PublishHandle>;
}

impl SessionChannel for Session {
    fn read(&self, node_id: &NodeId) -> UaResult<DataValue> {
        Self::read(self, node_id)
    }

    fn write(&self, node_id: &NodeId, value: Variant) -> UaResult<()> {
        Self::write(self, node_id, value)
    }

    fn translate_browse_path(&self, root: &NodeId, path: &str) -> UaResult<NodeId> {
        Self::translate_browse_path(self, root, path)
    }

    fn browse(&self, node_id: &NodeId) -> UaResult<Vec<ChildReference>> {
        Self::browse(self, node_id)
    }

    fn create_subscription(&self, params: &SubscriptionParameters) -> UaResult<CreatedSubscription> {
        Self::create_subscription(self, params)
    }

    fn delete_subscription(&self, id: SubscriptionId) -> UaResult<()> {
        Self::delete_subscription(self, id)
    }

    fn create_monitored_item(
        &self,
        subscription_id: SubscriptionId,
        node_id: &NodeId,
        params: &MonitoringParameters,
    ) -> UaResult<CreatedMonitoredItem> {
        Self::create_monitored_item(self, subscription_id, node_id, params)
    }

    fn delete_monitored_item(&self, subscription_id: SubscriptionId, item_id: MonitoredItemId) -> UaResult<()> {
        Self::delete_monitored_item(self, subscription_id, item_id)
    }

    fn publish(&self, subscription_id: SubscriptionId) -> UaResult<PublishHandle> {
        Self::publish(self, subscription_id)
    }
}

/// Client handle on a session.
#[derive(Debug, Clone)]
pub struct ClientSession {
    channel: Arc<dyn SessionChannel>,
    publish_poll: Duration,
}

impl ClientSession {
    /// Wraps a session channel with the default publish poll.
    #[must_use]
    pub fn new(channel: Arc<dyn SessionChannel>) -> Self {
        Self {
            channel,
            publish_poll: DEFAULT_PUBLISH_POLL,
        }
    }

    /// Overrides how often publisher threads re-check for termination.
    #[must_use]
    pub const fn with_publish_poll(mut self, poll: Duration) -> Self {
        self.publish_poll = poll;
        self
    }

    /// # Errors
    ///
    /// `NodeNotFound`/`NotAVariable`, or a transport error.
    pub fn read(&self, node_id: &NodeId) -> UaResult<DataValue> {
        self.channel.read(node_id)
    }

    /// # Errors
    ///
    /// `ReadOnly`, `TypeMismatch`, `WriteRejected`, a not-found error, or a transport error.
    pub fn write(&self, node_id: &NodeId, value: impl Into<Variant>) -> UaResult<()> {
        self.channel.write(node_id, value.into())
    }

    /// Resolves a relative browse path such as `Server/ServerStatus/BuildInfo/ProductName`.
    ///
    /// # Errors
    ///
    /// `InvalidBrowsePath` for a malformed path, `NoMatch` if it does not resolve.
    pub fn translate_browse_path(&self, root: &NodeId, path: &str) -> UaResult<NodeId> {
        self.channel.translate_browse_path(root, path)
    }

    /// # Errors
    ///
    /// `NodeNotFound`, or a transport error.
    pub fn browse(&self, node_id: &NodeId) -> UaResult<Vec<ChildReference>> {
        self.channel.browse(node_id)
    }

    /// Creates a subscription and starts its publisher thread.
    ///
    /// # Errors
    ///
    /// A configuration error for bad parameters or when the session is full, or a
    /// transport error.
    pub fn subscribe(&self, params: &SubscriptionParameters) -> UaResult<ClientSubscription> {
        ClientSubscription::start(Arc::clone(&self.channel), params, self.publish_poll)
    }
}

impl From<Arc<Session>> for ClientSession {
    fn from(session: Arc<Session>) -> Self {
        Self::new(session)
    }
}
