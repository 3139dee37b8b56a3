//! Sessions: the per-client entry point for reads, writes and subscription management.
//!
//! Every resource a session creates is registered in its own [`SubscriptionManager`],
//! so ids belonging to another session are simply not found. Closing or disconnecting
//! a session closes all of its subscriptions.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::bounded;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::address_space::ChildReference;
use crate::error::{TransportError, UaError, UaResult};
use crate::node_id::NodeId;
use crate::subscription::{
    CloseReason, CreatedMonitoredItem, CreatedSubscription, MonitoredItem, MonitoredItemId, MonitoringMode,
    MonitoringParameters, NotificationBody, NotificationMessage, PublishHandle, PublishResponse, Subscription,
    SubscriptionId, SubscriptionParameters, SubscriptionState, TickOutcome,
};
use crate::time::duration_ms;
use crate::value::{DataValue, Variant};

use super::manager::{SubscriptionManager, Tombstone};
use super::scheduler::TimerKey;
use super::ServerContext;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Create a new random session id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Credentials presented when a session is created.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserIdentity {
    /// No credentials.
    Anonymous,
    /// User name and password, checked against the configured users.
    UserName {
        /// Login name.
        username: String,
        /// Plain-text password; never printed by `Debug`.
        password: String,
    },
}

impl UserIdentity {
    /// User name / password identity.
    #[must_use]
    pub fn user_name(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::UserName {
            username: username.into(),
            password: password.into(),
        }
    }

    /// The name used in logs and errors.
    #[must_use]
    pub fn display_name(&self) -> &str {
        match self {
            Self::Anonymous => "anonymous",
            Self::UserName { username, .. } => username,
        }
    }
}

impl fmt::Debug for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::UserName { username, .. } => f
                .debug_struct("UserName")
                .field("username", username)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closed,
    Disconnected(String),
}

impl Lifecycle {
    fn error(&self) -> Option<UaError> {
        match self {
            Self::Open => None,
            Self::Closed => Some(TransportError::SessionClosed.into()),
            Self::Disconnected(reason) => Some(
                TransportError::Disconnected {
                    reason: reason.clone(),
                }
                .into(),
            ),
        }
    }
}

#[derive(Debug)]
struct SessionState {
    lifecycle: Lifecycle,
    subscriptions: SubscriptionManager,
}

enum PublishTarget {
    Live(Arc<Subscription>),
    Buried(Tombstone),
}

/// An authenticated client session.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    user: String,
    ctx: Arc<ServerContext>,
    state: Mutex<SessionState>,
}

impl Session {
    pub(crate) fn new(ctx: Arc<ServerContext>, identity: &UserIdentity) -> Self {
        Self {
            id: SessionId::new(),
            user: identity.display_name().to_string(),
            ctx,
            state: Mutex::new(SessionState {
                lifecycle: Lifecycle::Open,
                subscriptions: SubscriptionManager::default(),
            }),
        }
    }

    /// Server-assigned session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Display name of the authenticated user.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    fn lock(&self) -> UaResult<MutexGuard<'_, SessionState>> {
        self.state.lock().map_err(|_| UaError::poisoned("session"))
    }

    /// Locks the state, failing if the session is no longer open.
    fn open(&self) -> UaResult<MutexGuard<'_, SessionState>> {
        let state = self.lock()?;
        if let Some(err) = state.lifecycle.error() {
            return Err(err);
        }
        Ok(state)
    }

    /// True until the session is closed or disconnected.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open().is_ok()
    }

    /// Looks up one of this session's subscriptions.
    ///
    /// # Errors
    ///
    /// `SubscriptionNotFound`, or a transport error if the session is not open.
    pub fn subscription(&self, id: SubscriptionId) -> UaResult<Arc<Subscription>> {
        Ok(self.open()?.subscriptions.get(id)?)
    }

    /// Ids of this session's live subscriptions.
    ///
    /// # Errors
    ///
    /// A transport error if the session is not open.
    pub fn subscription_ids(&self) -> UaResult<Vec<SubscriptionId>> {
        Ok(self.open()?.subscriptions.ids())
    }

    /// Looks up a monitored item.
    ///
    /// # Errors
    ///
    /// `SubscriptionNotFound`, `MonitoredItemNotFound`, or a transport error.
    pub fn monitored_item(&self, subscription: SubscriptionId, item: MonitoredItemId) -> UaResult<Arc<MonitoredItem>> {
        self.subscription(subscription)?.item(item)
    }

    // ---------------------------------------------------------------------
    // Attribute services
    // ---------------------------------------------------------------------

    /// Reads the current value of a variable. No side effects.
    ///
    /// # Errors
    ///
    /// `NodeNotFound`, `NotAVariable`, or a transport error.
    pub fn read(&self, node_id: &NodeId) -> UaResult<DataValue> {
        drop(self.open()?);
        let variable = self.ctx.address_space.resolve(node_id)?;
        Ok(variable.read_value(self.ctx.clock.wall_time()))
    }

    /// Writes a variable through its write accessor.
    ///
    /// # Errors
    ///
    /// `NodeNotFound`, `ReadOnly`, `TypeMismatch`, `WriteRejected`, or a transport error.
    pub fn write(&self, node_id: &NodeId, value: Variant) -> UaResult<()> {
        drop(self.open()?);
        let variable = self.ctx.address_space.resolve(node_id)?;
        variable.write(value)?;
        debug!(session_id = %self.id, node_id = %node_id, "variable written");
        Ok(())
    }

    /// Resolves a browse path such as `/Objects/Server.ServerStatus.BuildInfo.ProductName`.
    ///
    /// # Errors
    ///
    /// `NoMatch`, `InvalidBrowsePath`, or a transport error.
    pub fn translate_browse_path(&self, root: &NodeId, path: &str) -> UaResult<NodeId> {
        drop(self.open()?);
        self.ctx.address_space.translate_browse_path(root, path)
    }

    /// Lists the children of a node.
    ///
    /// # Errors
    ///
    /// `NodeNotFound`, or a transport error.
    pub fn browse(&self, node_id: &NodeId) -> UaResult<Vec<ChildReference>> {
        drop(self.open()?);
        self.ctx.address_space.children(node_id)
    }

    // ---------------------------------------------------------------------
    // Subscription services
    // ---------------------------------------------------------------------

    /// Creates a subscription and arms its publish timer.
    ///
    /// # Errors
    ///
    /// A configuration error for malformed parameters or when the session is at its
    /// subscription limit; a transport error if the session is not open.
    pub fn create_subscription(&self, params: &SubscriptionParameters) -> UaResult<CreatedSubscription> {
        let limits = &self.ctx.config.limits;
        let revised = params.revise(limits)?;
        let id = self.ctx.allocate_subscription_id();
        let subscription = Arc::new(Subscription::new(id, self.id, revised.clone()));

        self.open()?
            .subscriptions
            .insert(subscription, limits.max_subscriptions_per_session)?;

        let interval = revised.publishing_interval;
        self.ctx.with_scheduler(|s, now| {
            s.schedule_repeating(
                TimerKey::Publish {
                    session: self.id,
                    subscription: id,
                },
                now + interval,
                interval,
            );
        })?;

        info!(
            session_id = %self.id,
            subscription_id = %id,
            publishing_interval_ms = duration_ms(interval),
            lifetime_count = revised.lifetime_count,
            max_keep_alive_count = revised.max_keep_alive_count,
            "subscription created"
        );
        Ok(CreatedSubscription { id, revised })
    }

    /// Changes a subscription's timing parameters; both counters restart.
    ///
    /// # Errors
    ///
    /// A configuration error for malformed parameters, `SubscriptionNotFound`, or a
    /// transport error.
    pub fn modify_subscription(&self, id: SubscriptionId, params: &SubscriptionParameters) -> UaResult<SubscriptionParameters> {
        let revised = params.revise(&self.ctx.config.limits)?;
        let subscription = self.subscription(id)?;
        subscription.modify(&revised)?;

        let interval = revised.publishing_interval;
        self.ctx.with_scheduler(|s, now| {
            s.schedule_repeating(
                TimerKey::Publish {
                    session: self.id,
                    subscription: id,
                },
                now + interval,
                interval,
            );
        })?;
        debug!(session_id = %self.id, subscription_id = %id, "subscription modified");
        subscription.parameters()
    }

    /// Enables or disables publishing for a subscription.
    ///
    /// # Errors
    ///
    /// `SubscriptionNotFound`, or a transport error.
    pub fn set_publishing_mode(&self, id: SubscriptionId, enabled: bool) -> UaResult<()> {
        self.subscription(id)?.set_publishing_enabled(enabled)
    }

    /// Deletes a subscription. Outstanding publish requests receive a `Deleted` status
    /// change.
    ///
    /// # Errors
    ///
    /// `SubscriptionNotFound`, or a transport error.
    pub fn delete_subscription(&self, id: SubscriptionId) -> UaResult<()> {
        let subscription = self.open()?.subscriptions.remove(id)?;
        subscription.terminate(CloseReason::Deleted, self.ctx.clock.wall_time())?;
        self.ctx.with_scheduler(|s, _| s.cancel_subscription(self.id, id))?;
        info!(session_id = %self.id, subscription_id = %id, "subscription deleted");
        Ok(())
    }

    /// Creates a monitored item. Its first sample is due immediately.
    ///
    /// # Errors
    ///
    /// `NodeNotFound`/`NotAVariable` for the target, a configuration error for bad
    /// parameters or when the subscription is full, `SubscriptionNotFound`, or a
    /// transport error.
    pub fn create_monitored_item(
        &self,
        subscription_id: SubscriptionId,
        node_id: &NodeId,
        params: &MonitoringParameters,
    ) -> UaResult<CreatedMonitoredItem> {
        let limits = &self.ctx.config.limits;
        let subscription = self.subscription(subscription_id)?;
        let variable = self.ctx.address_space.resolve(node_id)?;
        let revised = params.revise(limits)?;

        let id = self.ctx.allocate_item_id();
        let item = Arc::new(MonitoredItem::new(id, variable, revised.clone()));
        subscription.add_item(item, limits.max_monitored_items_per_subscription)?;

        let interval = revised.sampling_interval;
        self.ctx.with_scheduler(|s, now| {
            s.schedule_repeating(
                TimerKey::Sample {
                    session: self.id,
                    subscription: subscription_id,
                    item: id,
                },
                now,
                interval,
            );
        })?;

        debug!(
            subscription_id = %subscription_id,
            item_id = %id,
            node_id = %node_id,
            sampling_interval_ms = duration_ms(interval),
            queue_size = revised.queue_size,
            "monitored item created"
        );
        Ok(CreatedMonitoredItem {
            id,
            revised_sampling_interval: interval,
            revised_queue_size: revised.queue_size,
        })
    }

    /// Changes a monitored item's parameters. Queued notifications are kept; a new
    /// sampling interval takes effect from now.
    ///
    /// # Errors
    ///
    /// A configuration error (including `QueueShrinkWouldDiscard`), a not-found error,
    /// or a transport error.
    pub fn modify_monitored_item(
        &self,
        subscription_id: SubscriptionId,
        item_id: MonitoredItemId,
        params: &MonitoringParameters,
    ) -> UaResult<CreatedMonitoredItem> {
        let revised = params.revise(&self.ctx.config.limits)?;
        let item = self.monitored_item(subscription_id, item_id)?;
        let previous = item.sampling_interval()?;
        item.modify(&revised)?;

        let interval = revised.sampling_interval;
        if interval != previous {
            self.ctx.with_scheduler(|s, now| {
                s.schedule_repeating(
                    TimerKey::Sample {
                        session: self.id,
                        subscription: subscription_id,
                        item: item_id,
                    },
                    now + interval,
                    interval,
                );
            })?;
        }
        Ok(CreatedMonitoredItem {
            id: item_id,
            revised_sampling_interval: interval,
            revised_queue_size: revised.queue_size,
        })
    }

    /// Switches a monitored item between Disabled, Sampling and Reporting.
    ///
    /// # Errors
    ///
    /// A not-found error, or a transport error.
    pub fn set_monitoring_mode(&self, subscription_id: SubscriptionId, item_id: MonitoredItemId, mode: MonitoringMode) -> UaResult<()> {
        self.monitored_item(subscription_id, item_id)?.set_monitoring_mode(mode)
    }

    /// Deletes a monitored item and its sampling timer.
    ///
    /// # Errors
    ///
    /// A not-found error, or a transport error.
    pub fn delete_monitored_item(&self, subscription_id: SubscriptionId, item_id: MonitoredItemId) -> UaResult<()> {
        self.subscription(subscription_id)?.remove_item(item_id)?;
        self.ctx.with_scheduler(|s, _| {
            s.cancel(&TimerKey::Sample {
                session: self.id,
                subscription: subscription_id,
                item: item_id,
            });
        })?;
        debug!(subscription_id = %subscription_id, item_id = %item_id, "monitored item deleted");
        Ok(())
    }

    /// Issues a publish request against a subscription.
    ///
    /// The returned handle resolves with the next message the subscription produces, a
    /// held message if the subscription is late, a keep-alive once the publish timeout
    /// elapses, or a status change if the subscription closes first.
    ///
    /// # Errors
    ///
    /// `SubscriptionNotFound`, or a transport error.
    pub fn publish(&self, subscription_id: SubscriptionId) -> UaResult<PublishHandle> {
        let target = {
            let mut state = self.open()?;
            match state.subscriptions.take_tombstone(subscription_id) {
                Some(tombstone) => PublishTarget::Buried(tombstone),
                None => PublishTarget::Live(state.subscriptions.get(subscription_id)?),
            }
        };

        let request_id = self.ctx.allocate_request_id();
        let (tx, rx) = bounded(1);
        let handle = PublishHandle::new(subscription_id, request_id, rx);

        match target {
            PublishTarget::Buried(tombstone) => {
                let _ = tx.try_send(PublishResponse {
                    subscription_id,
                    message: NotificationMessage {
                        sequence_number: tombstone.sequence_number,
                        publish_time: self.ctx.clock.wall_time(),
                        body: NotificationBody::StatusChange(tombstone.reason),
                    },
                    more_notifications: false,
                });
            }
            PublishTarget::Live(subscription) => {
                if !subscription.enqueue_publish(request_id, tx)? {
                    let timeout = self.ctx.config.publish_timeout();
                    self.ctx.with_scheduler(|s, now| {
                        s.schedule_once(
                            TimerKey::PublishTimeout {
                                session: self.id,
                                subscription: subscription_id,
                                request: request_id,
                            },
                            now + timeout,
                        );
                    })?;
                }
            }
        }
        Ok(handle)
    }

    /// Number of publish requests waiting on a subscription.
    ///
    /// # Errors
    ///
    /// `SubscriptionNotFound`, or a transport error.
    pub fn outstanding_publish_requests(&self, subscription_id: SubscriptionId) -> UaResult<usize> {
        self.subscription(subscription_id)?.outstanding_requests()
    }

    /// Publish-cycle state of a subscription.
    ///
    /// # Errors
    ///
    /// `SubscriptionNotFound`, or a transport error.
    pub fn subscription_state(&self, subscription_id: SubscriptionId) -> UaResult<SubscriptionState> {
        self.subscription(subscription_id)?.state()
    }

    // ---------------------------------------------------------------------
    // Teardown
    // ---------------------------------------------------------------------

    /// Closes the session and every subscription it owns. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a lock is poisoned.
    pub fn close(&self) -> UaResult<()> {
        if self.shut_down(Lifecycle::Closed, CloseReason::SessionClosed)? {
            info!(session_id = %self.id, user = %self.user, "session closed");
        }
        Ok(())
    }

    /// Reports loss of the session's channel. Every subscription becomes
    /// `Closed(Disconnected)` and further calls fail with a transport error.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a lock is poisoned.
    pub fn disconnect(&self, reason: impl Into<String>) -> UaResult<()> {
        let reason = reason.into();
        if self.shut_down(Lifecycle::Disconnected(reason.clone()), CloseReason::Disconnected)? {
            info!(session_id = %self.id, reason = %reason, "session disconnected");
        }
        Ok(())
    }

    fn shut_down(&self, lifecycle: Lifecycle, reason: CloseReason) -> UaResult<bool> {
        let subscriptions = {
            let mut state = self.lock()?;
            if state.lifecycle != Lifecycle::Open {
                return Ok(false);
            }
            state.lifecycle = lifecycle;
            state.subscriptions.drain()
        };

        let at = self.ctx.clock.wall_time();
        for subscription in &subscriptions {
            subscription.terminate(reason, at)?;
        }
        self.ctx.with_scheduler(|s, _| s.cancel_session(self.id))?;
        Ok(true)
    }

    // ---------------------------------------------------------------------
    // Timer dispatch. Each returns false when the target no longer exists so the
    // caller can drop the timer.
    // ---------------------------------------------------------------------

    fn live_subscription(&self, id: SubscriptionId) -> UaResult<Option<Arc<Subscription>>> {
        let state = self.lock()?;
        if state.lifecycle != Lifecycle::Open {
            return Ok(None);
        }
        Ok(state.subscriptions.get(id).ok())
    }

    pub(crate) fn sample_item(&self, subscription_id: SubscriptionId, item_id: MonitoredItemId) -> UaResult<bool> {
        let Some(subscription) = self.live_subscription(subscription_id)? else {
            return Ok(false);
        };
        let Ok(item) = subscription.item(item_id) else {
            return Ok(false);
        };
        item.sample(self.ctx.clock.wall_time())?;
        Ok(true)
    }

    pub(crate) fn publish_tick(&self, subscription_id: SubscriptionId) -> UaResult<bool> {
        let Some(subscription) = self.live_subscription(subscription_id)? else {
            return Ok(false);
        };

        match subscription.tick(self.ctx.clock.wall_time())? {
            TickOutcome::Expired { delivered } => {
                let sequence_number = subscription.next_sequence_number()?;
                {
                    let mut state = self.lock()?;
                    // The session may have closed in the meantime; the subscription is
                    // already closed either way.
                    let _ = state.subscriptions.remove(subscription_id);
                    if !delivered && state.lifecycle == Lifecycle::Open {
                        state.subscriptions.bury(
                            subscription_id,
                            Tombstone {
                                reason: CloseReason::Expired,
                                sequence_number,
                            },
                        );
                    }
                }
                self.ctx.with_scheduler(|s, _| s.cancel_subscription(self.id, subscription_id))?;
                info!(session_id = %self.id, subscription_id = %subscription_id, "subscription expired");
                Ok(false)
            }
            TickOutcome::Closed => Ok(false),
            _ => Ok(true),
        }
    }

    pub(crate) fn expire_publish_request(&self, subscription_id: SubscriptionId, request_id: u64) -> UaResult<()> {
        if let Some(subscription) = self.live_subscription(subscription_id)? {
            subscription.expire_publish_request(request_id, self.ctx.clock.wall_time())?;
        }
        Ok(())
    }
}
