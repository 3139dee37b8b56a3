//! The publish cycle.
//!
//! Each tick either drains the items into a data message, counts down toward a
//! keep-alive, or counts down toward expiry. Messages are handed to the oldest
//! outstanding publish request; with none outstanding the subscription goes `Late` and
//! holds the message until a request arrives.
//!
//! Lock order: the subscription's core lock, then an item's queue lock. Sampling only
//! ever takes the item lock, so the two paths cannot deadlock.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SubscriptionLimits;
use crate::error::{ConfigurationError, ServiceError, UaError, UaResult};
use crate::server::SessionId;

use super::monitored_item::MonitoredItem;
use super::notification::{NotificationBody, NotificationMessage};
use super::publish::PublishResponse;
use super::{CloseReason, MonitoredItemId, SubscriptionId, SubscriptionState};

/// Requested subscription parameters.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionParameters {
    pub publishing_interval: Duration,
    /// Consecutive cycles without a data message before the subscription expires.
    pub lifetime_count: u32,
    /// Consecutive empty cycles before a keep-alive is sent.
    pub max_keep_alive_count: u32,
    /// Cap on notifications per message across all items. 0 means no cap.
    pub max_notifications_per_publish: u32,
    pub publishing_enabled: bool,
    pub priority: u8,
}

impl Default for SubscriptionParameters {
    fn default() -> Self {
        Self {
            publishing_interval: Duration::from_millis(1000),
            lifetime_count: 100,
            max_keep_alive_count: 10,
            max_notifications_per_publish: 100,
            publishing_enabled: true,
            priority: 10,
        }
    }
}

impl SubscriptionParameters {
    /// Validates the request against `limits`, returning the parameters the server will
    /// run. A publishing interval below the minimum is revised upward and the batch cap
    /// is bounded by the server's own cap.
    ///
    /// # Errors
    ///
    /// - `PublishingIntervalZero`
    /// - `KeepAliveCountZero`
    /// - `LifetimeNotAboveKeepAlive` if `lifetime_count <= max_keep_alive_count`
    pub fn revise(&self, limits: &SubscriptionLimits) -> Result<Self, ConfigurationError> {
        if self.publishing_interval.is_zero() {
            return Err(ConfigurationError::PublishingIntervalZero);
        }
        if self.max_keep_alive_count == 0 {
            return Err(ConfigurationError::KeepAliveCountZero);
        }
        if self.lifetime_count <= self.max_keep_alive_count {
            return Err(ConfigurationError::LifetimeNotAboveKeepAlive {
                lifetime_count: self.lifetime_count,
                max_keep_alive_count: self.max_keep_alive_count,
            });
        }

        let mut revised = self.clone();
        revised.publishing_interval = self.publishing_interval.max(limits.min_publishing_interval());
        let server_cap = limits.max_notifications_per_publish;
        if server_cap > 0 && (revised.max_notifications_per_publish == 0 || revised.max_notifications_per_publish > server_cap) {
            revised.max_notifications_per_publish = server_cap;
        }
        Ok(revised)
    }
}

/// Result of creating or modifying a subscription.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedSubscription {
    pub id: SubscriptionId,
    pub revised: SubscriptionParameters,
}

/// What one publish-cycle tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Publishing is disabled; nothing changed.
    Disabled,
    /// Nothing to send and no keep-alive due.
    Idle,
    /// A data message was produced. `delivered` is false if it is being held (Late).
    DataChange {
        /// Notifications in the message.
        notifications: usize,
        /// Handed to a waiting request.
        delivered: bool,
    },
    /// A keep-alive was produced.
    KeepAlive {
        /// Handed to a waiting request.
        delivered: bool,
    },
    /// Still waiting for a publish request to take the held message.
    Late,
    /// The lifecycle counter reached zero. `delivered` is true if an outstanding request
    /// received the status change.
    Expired {
        /// A waiting request received the status change.
        delivered: bool,
    },
    /// Already closed.
    Closed,
}

#[derive(Debug)]
struct PendingRequest {
    request_id: u64,
    reply: Sender<PublishResponse>,
}

#[derive(Debug)]
struct Core {
    state: SubscriptionState,
    params: SubscriptionParameters,
    lifecycle_counter: u32,
    keep_alive_counter: u32,
    next_sequence_number: u32,
    items: BTreeMap<MonitoredItemId, Arc<MonitoredItem>>,
    pending: VecDeque<PendingRequest>,
    held: Option<PublishResponse>,
}

impl Core {
    fn take_sequence_number(&mut self) -> u32 {
        let n = self.next_sequence_number;
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1).max(1);
        n
    }

    fn reset_counters(&mut self) {
        self.lifecycle_counter = self.params.lifetime_count;
        self.keep_alive_counter = self.params.max_keep_alive_count;
    }

    /// Hands `response` to the oldest live request. Returns it back if nobody took it.
    fn deliver(&mut self, mut response: PublishResponse) -> Option<PublishResponse> {
        while let Some(req) = self.pending.pop_front() {
            match req.reply.try_send(response) {
                Ok(()) => return None,
                Err(err) => response = err.into_inner(),
            }
        }
        Some(response)
    }

    fn deliver_or_hold(&mut self, response: PublishResponse) -> bool {
        match self.deliver(response) {
            None => true,
            Some(undelivered) => {
                self.held = Some(undelivered);
                self.state = SubscriptionState::Late;
                false
            }
        }
    }

    fn close(&mut self, id: SubscriptionId, reason: CloseReason, at: DateTime<Utc>) -> bool {
        self.state = SubscriptionState::Closed(reason);
        self.held = None;
        self.items.clear();

        if self.pending.is_empty() {
            return false;
        }
        let sequence_number = self.take_sequence_number();
        let mut delivered = false;
        for req in self.pending.drain(..) {
            let response = PublishResponse {
                subscription_id: id,
                message: NotificationMessage {
                    sequence_number,
                    publish_time: at,
                    body: NotificationBody::StatusChange(reason),
                },
                more_notifications: false,
            };
            delivered |= req.reply.try_send(response).is_ok();
        }
        delivered
    }

    fn keep_alive(&self, id: SubscriptionId, at: DateTime<Utc>) -> PublishResponse {
        PublishResponse {
            subscription_id: id,
            message: NotificationMessage {
                sequence_number: self.next_sequence_number,
                publish_time: at,
                body: NotificationBody::KeepAlive,
            },
            more_notifications: false,
        }
    }
}

/// A subscription: a set of monitored items plus the publish-cycle state machine.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    session_id: SessionId,
    core: Mutex<Core>,
}

impl Subscription {
    /// Creates a subscription with already revised parameters.
    #[must_use]
    pub fn new(id: SubscriptionId, session_id: SessionId, params: SubscriptionParameters) -> Self {
        Self {
            id,
            session_id,
            core: Mutex::new(Core {
                state: SubscriptionState::Creating,
                lifecycle_counter: params.lifetime_count,
                keep_alive_counter: params.max_keep_alive_count,
                params,
                next_sequence_number: 1,
                items: BTreeMap::new(),
                pending: VecDeque::new(),
                held: None,
            }),
        }
    }

    /// Server-assigned subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Owning session.
    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    fn lock(&self) -> UaResult<MutexGuard<'_, Core>> {
        self.core.lock().map_err(|_| UaError::poisoned("subscription"))
    }

    fn open(&self) -> UaResult<MutexGuard<'_, Core>> {
        let core = self.lock()?;
        if let SubscriptionState::Closed(reason) = core.state {
            return Err(ServiceError::SubscriptionClosed { id: self.id, reason }.into());
        }
        Ok(core)
    }

    /// Current publish-cycle state.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn state(&self) -> UaResult<SubscriptionState> {
        Ok(self.lock()?.state)
    }

    /// The revised parameters in effect.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn parameters(&self) -> UaResult<SubscriptionParameters> {
        Ok(self.lock()?.params.clone())
    }

    /// Current `(lifecycle, keep_alive)` counters.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn counters(&self) -> UaResult<(u32, u32)> {
        let core = self.lock()?;
        Ok((core.lifecycle_counter, core.keep_alive_counter))
    }

    /// The sequence number the next data or status message will carry.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn next_sequence_number(&self) -> UaResult<u32> {
        Ok(self.lock()?.next_sequence_number)
    }

    /// Number of publish requests waiting for output.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn outstanding_requests(&self) -> UaResult<usize> {
        Ok(self.lock()?.pending.len())
    }

    /// Adds an item, enforcing `max_items`.
    ///
    /// # Errors
    ///
    /// - `TooManyMonitoredItems` when full
    /// - `SubscriptionClosed` when closed
    pub fn add_item(&self, item: Arc<MonitoredItem>, max_items: usize) -> UaResult<()> {
        let mut core = self.open()?;
        if core.items.len() >= max_items {
            return Err(ConfigurationError::TooManyMonitoredItems { max: max_items }.into());
        }
        core.items.insert(item.id(), item);
        Ok(())
    }

    /// Removes and returns an item.
    ///
    /// # Errors
    ///
    /// `MonitoredItemNotFound` or `SubscriptionClosed`.
    pub fn remove_item(&self, item_id: MonitoredItemId) -> UaResult<Arc<MonitoredItem>> {
        let mut core = self.open()?;
        core.items.remove(&item_id).ok_or_else(|| {
            ServiceError::MonitoredItemNotFound {
                subscription: self.id,
                item: item_id,
            }
            .into()
        })
    }

    /// Looks up an item.
    ///
    /// # Errors
    ///
    /// `MonitoredItemNotFound` or `SubscriptionClosed`.
    pub fn item(&self, item_id: MonitoredItemId) -> UaResult<Arc<MonitoredItem>> {
        let core = self.open()?;
        core.items.get(&item_id).cloned().ok_or_else(|| {
            ServiceError::MonitoredItemNotFound {
                subscription: self.id,
                item: item_id,
            }
            .into()
        })
    }

    /// Ids of the owned items, in publish order.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn item_ids(&self) -> UaResult<Vec<MonitoredItemId>> {
        Ok(self.lock()?.items.keys().copied().collect())
    }

    /// Enables or disables publishing. Counters are left untouched.
    ///
    /// # Errors
    ///
    /// `SubscriptionClosed` when closed.
    pub fn set_publishing_enabled(&self, enabled: bool) -> UaResult<()> {
        self.open()?.params.publishing_enabled = enabled;
        Ok(())
    }

    /// Applies revised parameters and restarts both counters. The publishing-enabled
    /// flag is only changed through [`set_publishing_enabled`](Self::set_publishing_enabled).
    ///
    /// # Errors
    ///
    /// `SubscriptionClosed` when closed.
    pub fn modify(&self, revised: &SubscriptionParameters) -> UaResult<()> {
        let mut core = self.open()?;
        let enabled = core.params.publishing_enabled;
        core.params = SubscriptionParameters {
            publishing_enabled: enabled,
            ..revised.clone()
        };
        core.reset_counters();
        Ok(())
    }

    /// Runs one publish cycle.
    ///
    /// # Errors
    ///
    /// Returns an internal error if a lock is poisoned.
    pub fn tick(&self, at: DateTime<Utc>) -> UaResult<TickOutcome> {
        let mut core = self.lock()?;

        let state = core.state;
        if state.is_closed() {
            return Ok(TickOutcome::Closed);
        }
        // Disabled cycles leave both counters untouched, Late or not.
        if !core.params.publishing_enabled {
            return Ok(TickOutcome::Disabled);
        }
        if state == SubscriptionState::Late {
            core.lifecycle_counter = core.lifecycle_counter.saturating_sub(1);
            if core.lifecycle_counter == 0 {
                return Ok(self.expire(&mut core, at));
            }
            return Ok(TickOutcome::Late);
        }
        core.state = SubscriptionState::Normal;

        let cap = match core.params.max_notifications_per_publish {
            0 => usize::MAX,
            n => n as usize,
        };
        let mut batch = Vec::new();
        for item in core.items.values() {
            let room = cap - batch.len();
            if room == 0 {
                break;
            }
            batch.extend(item.drain(room)?);
        }

        if !batch.is_empty() {
            let mut more = false;
            for item in core.items.values() {
                if item.has_reportable()? {
                    more = true;
                    break;
                }
            }
            core.reset_counters();

            let notifications = batch.len();
            let response = PublishResponse {
                subscription_id: self.id,
                message: NotificationMessage {
                    sequence_number: core.take_sequence_number(),
                    publish_time: at,
                    body: NotificationBody::DataChange(batch),
                },
                more_notifications: more,
            };
            let delivered = core.deliver_or_hold(response);
            if !delivered {
                debug!(subscription_id = %self.id, "late: data message held");
            }
            return Ok(TickOutcome::DataChange { notifications, delivered });
        }

        let mut outcome = TickOutcome::Idle;
        core.keep_alive_counter = core.keep_alive_counter.saturating_sub(1);
        if core.keep_alive_counter == 0 {
            core.keep_alive_counter = core.params.max_keep_alive_count;
            let response = core.keep_alive(self.id, at);
            let delivered = core.deliver_or_hold(response);
            debug!(subscription_id = %self.id, delivered, "keep-alive");
            outcome = TickOutcome::KeepAlive { delivered };
        }

        core.lifecycle_counter = core.lifecycle_counter.saturating_sub(1);
        if core.lifecycle_counter == 0 {
            return Ok(self.expire(&mut core, at));
        }
        Ok(outcome)
    }

    fn expire(&self, core: &mut Core, at: DateTime<Utc>) -> TickOutcome {
        let delivered = core.close(self.id, CloseReason::Expired, at);
        TickOutcome::Expired { delivered }
    }

    /// Queues a publish request. If a message is being held it is sent immediately and
    /// the subscription returns to `Normal`.
    ///
    /// Returns true if the request was answered immediately.
    ///
    /// # Errors
    ///
    /// `SubscriptionClosed` when closed.
    pub fn enqueue_publish(&self, request_id: u64, reply: Sender<PublishResponse>) -> UaResult<bool> {
        let mut core = self.open()?;
        if let Some(held) = core.held.take() {
            core.state = SubscriptionState::Normal;
            // A send failure means the caller already dropped its handle.
            let _ = reply.try_send(held);
            debug!(subscription_id = %self.id, request_id, "late message released");
            return Ok(true);
        }
        core.pending.push_back(PendingRequest { request_id, reply });
        Ok(false)
    }

    /// Answers a still-outstanding request with a keep-alive. Counters are untouched.
    ///
    /// Returns false if the request was already answered.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn expire_publish_request(&self, request_id: u64, at: DateTime<Utc>) -> UaResult<bool> {
        let mut core = self.lock()?;
        let Some(pos) = core.pending.iter().position(|r| r.request_id == request_id) else {
            return Ok(false);
        };
        let Some(req) = core.pending.remove(pos) else {
            return Ok(false);
        };
        let response = core.keep_alive(self.id, at);
        let _ = req.reply.try_send(response);
        debug!(subscription_id = %self.id, request_id, "publish request timed out");
        Ok(true)
    }

    /// Closes the subscription, releasing its items and answering every outstanding
    /// request with a status change. Idempotent: returns false if already closed.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the lock is poisoned.
    pub fn terminate(&self, reason: CloseReason, at: DateTime<Utc>) -> UaResult<bool> {
        let mut core = self.lock()?;
        if core.state.is_closed() {
            return Ok(false);
        }
        core.close(self.id, reason, at);
        Ok(true)
    }
}
