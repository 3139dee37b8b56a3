//! Monitored items: per-variable sampling into a bounded queue.
//!
//! `sample` and `drain` both take the item's queue lock, so the two never interleave
//! on one item. The variable accessor itself is invoked before the lock is taken.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::address_space::Variable;
use crate::config::SubscriptionLimits;
use crate::error::{ConfigurationError, UaError, UaResult};
use crate::node_id::NodeId;
use crate::value::{DataValue, TimestampsToReturn};

use super::notification::MonitoredItemNotification;
use super::MonitoredItemId;

/// Which notification is dropped when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardPolicy {
    /// Evict the oldest queued notification to make room for the new one.
    #[default]
    DiscardOldest,
    /// Keep the queue as is and drop the new notification.
    DiscardNewest,
}

/// Whether the item samples and whether its queue is published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringMode {
    /// No sampling; the queue is cleared.
    Disabled,
    /// Samples are queued but not published.
    Sampling,
    /// Samples are queued and published.
    #[default]
    Reporting,
}

/// Which differences between two samples count as a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataChangeTrigger {
    /// Only status changes are reported.
    Status,
    /// Status or value changes are reported.
    #[default]
    StatusValue,
    /// Status, value or source timestamp changes are reported.
    StatusValueTimestamp,
}

impl DataChangeTrigger {
    fn is_change(self, last: &DataValue, next: &DataValue) -> bool {
        match self {
            Self::Status => last.status != next.status,
            Self::StatusValue => last.status != next.status || last.value != next.value,
            Self::StatusValueTimestamp => {
                last.status != next.status
                    || last.value != next.value
                    || last.source_timestamp != next.source_timestamp
            }
        }
    }
}

/// Requested monitoring parameters.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use uasub::subscription::{DiscardPolicy, MonitoringParameters};
///
/// let params = MonitoringParameters::new(1)
///     .with_sampling_interval(Duration::from_millis(100))
///     .with_queue_size(10)
///     .with_discard_policy(DiscardPolicy::DiscardOldest);
/// assert_eq!(params.queue_size, 10);
/// ```
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringParameters {
    /// Echoed in every notification so the client can route it.
    pub client_handle: u32,
    pub sampling_interval: Duration,
    pub queue_size: usize,
    pub discard_policy: DiscardPolicy,
    pub monitoring_mode: MonitoringMode,
    pub trigger: DataChangeTrigger,
    pub timestamps_to_return: TimestampsToReturn,
}

impl MonitoringParameters {
    /// Default parameters with the given client handle.
    #[must_use]
    pub fn new(client_handle: u32) -> Self {
        Self {
            client_handle,
            ..Self::default()
        }
    }

    /// Sets the requested sampling interval.
    #[must_use]
    pub const fn with_sampling_interval(mut self, interval: Duration) -> Self {
        self.sampling_interval = interval;
        self
    }

    /// Sets the requested queue size.
    #[must_use]
    pub const fn with_queue_size(mut self, size: usize) -> Self {
        self.queue_size = size;
        self
    }

    /// Sets the overflow policy.
    #[must_use]
    pub const fn with_discard_policy(mut self, policy: DiscardPolicy) -> Self {
        self.discard_policy = policy;
        self
    }

    /// Sets the initial monitoring mode.
    #[must_use]
    pub const fn with_monitoring_mode(mut self, mode: MonitoringMode) -> Self {
        self.monitoring_mode = mode;
        self
    }

    /// Sets the change trigger.
    #[must_use]
    pub const fn with_trigger(mut self, trigger: DataChangeTrigger) -> Self {
        self.trigger = trigger;
        self
    }

    /// Sets which timestamps are reported.
    #[must_use]
    pub const fn with_timestamps(mut self, timestamps: TimestampsToReturn) -> Self {
        self.timestamps_to_return = timestamps;
        self
    }

    /// Validates the request against `limits`, returning the parameters the server will
    /// actually run. A sampling interval below the minimum is revised upward.
    ///
    /// # Errors
    ///
    /// `QueueSizeZero` or `QueueSizeTooLarge`.
    pub fn revise(&self, limits: &SubscriptionLimits) -> Result<Self, ConfigurationError> {
        if self.queue_size == 0 {
            return Err(ConfigurationError::QueueSizeZero);
        }
        if self.queue_size > limits.max_queue_size {
            return Err(ConfigurationError::QueueSizeTooLarge {
                requested: self.queue_size,
                max: limits.max_queue_size,
            });
        }
        let mut revised = self.clone();
        revised.sampling_interval = self.sampling_interval.max(limits.min_sampling_interval());
        Ok(revised)
    }
}

impl Default for MonitoringParameters {
    fn default() -> Self {
        Self {
            client_handle: 0,
            sampling_interval: Duration::from_millis(100),
            queue_size: 10,
            discard_policy: DiscardPolicy::DiscardOldest,
            monitoring_mode: MonitoringMode::Reporting,
            trigger: DataChangeTrigger::StatusValue,
            timestamps_to_return: TimestampsToReturn::Both,
        }
    }
}

/// Result of creating or modifying a monitored item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedMonitoredItem {
    /// Server-assigned item id.
    pub id: MonitoredItemId,
    /// Sampling interval after revision.
    pub revised_sampling_interval: Duration,
    /// Queue size after revision.
    pub revised_queue_size: usize,
}

/// What one call to [`MonitoredItem::sample`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOutcome {
    /// The item is disabled.
    Skipped,
    /// The value did not change according to the item's trigger.
    Unchanged,
    /// A notification was queued.
    Queued,
    /// The queue was full; one notification was discarded per the policy.
    Overflowed,
}

#[derive(Debug)]
struct Queued {
    value: DataValue,
    overflow: bool,
}

#[derive(Debug)]
struct ItemState {
    params: MonitoringParameters,
    queue: VecDeque<Queued>,
    last: Option<DataValue>,
    /// The next queued notification follows a gap left by discard-newest.
    gap_pending: bool,
    enqueue_attempts: u64,
    overflow_count: u64,
    sample_count: u64,
}

/// Binds one variable to a sampling interval and a bounded notification queue.
#[derive(Debug)]
pub struct MonitoredItem {
    id: MonitoredItemId,
    node_id: NodeId,
    variable: Arc<Variable>,
    state: Mutex<ItemState>,
}

impl MonitoredItem {
    /// Creates an item with already revised parameters.
    #[must_use]
    pub fn new(id: MonitoredItemId, variable: Arc<Variable>, params: MonitoringParameters) -> Self {
        let capacity = params.queue_size.min(1024);
        Self {
            id,
            node_id: variable.node_id().clone(),
            variable,
            state: Mutex::new(ItemState {
                params,
                queue: VecDeque::with_capacity(capacity),
                last: None,
                gap_pending: false,
                enqueue_attempts: 0,
                overflow_count: 0,
                sample_count: 0,
            }),
        }
    }

    /// Server-assigned item id.
    #[must_use]
    pub const fn id(&self) -> MonitoredItemId {
        self.id
    }

    /// The sampled node.
    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    fn lock(&self) -> UaResult<MutexGuard<'_, ItemState>> {
        self.state.lock().map_err(|_| UaError::poisoned("monitored item"))
    }

    /// Reads the variable and queues a notification if the value changed.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn sample(&self, at: DateTime<Utc>) -> UaResult<SampleOutcome> {
        if self.lock()?.params.monitoring_mode == MonitoringMode::Disabled {
            return Ok(SampleOutcome::Skipped);
        }

        let value = self.variable.read_value(at);

        let mut st = self.lock()?;
        if st.params.monitoring_mode == MonitoringMode::Disabled {
            return Ok(SampleOutcome::Skipped);
        }
        st.sample_count += 1;

        let changed = st
            .last
            .as_ref()
            .map_or(true, |last| st.params.trigger.is_change(last, &value));
        if !changed {
            return Ok(SampleOutcome::Unchanged);
        }

        st.last = Some(value.clone());
        st.enqueue_attempts += 1;
        trace!(item_id = %self.id, node_id = %self.node_id, value = %value, "sampled change");

        if st.queue.len() < st.params.queue_size {
            let overflow = std::mem::take(&mut st.gap_pending);
            st.queue.push_back(Queued { value, overflow });
            return Ok(SampleOutcome::Queued);
        }

        st.overflow_count += 1;
        let policy = st.params.discard_policy;
        match policy {
            DiscardPolicy::DiscardOldest => {
                st.queue.pop_front();
                st.queue.push_back(Queued { value, overflow: false });
                if let Some(front) = st.queue.front_mut() {
                    front.overflow = true;
                }
            }
            DiscardPolicy::DiscardNewest => {
                st.gap_pending = true;
            }
        }
        debug!(
            item_id = %self.id,
            policy = ?policy,
            overflow_count = st.overflow_count,
            "queue overflow"
        );
        Ok(SampleOutcome::Overflowed)
    }

    /// Removes up to `max` notifications, oldest first.
    ///
    /// Items not in `Reporting` mode publish nothing.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn drain(&self, max: usize) -> UaResult<Vec<MonitoredItemNotification>> {
        let mut st = self.lock()?;
        if st.params.monitoring_mode != MonitoringMode::Reporting || max == 0 {
            return Ok(Vec::new());
        }

        let n = max.min(st.queue.len());
        let client_handle = st.params.client_handle;
        let timestamps = st.params.timestamps_to_return;
        Ok(st
            .queue
            .drain(..n)
            .map(|q| MonitoredItemNotification {
                client_handle,
                value: q.value.filter_timestamps(timestamps),
                overflow: q.overflow,
            })
            .collect())
    }

    /// True if the item would publish something on the next drain.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn has_reportable(&self) -> UaResult<bool> {
        let st = self.lock()?;
        Ok(st.params.monitoring_mode == MonitoringMode::Reporting && !st.queue.is_empty())
    }

    /// Changes the sampling interval. Queued notifications are kept.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn set_sampling_interval(&self, interval: Duration) -> UaResult<()> {
        self.lock()?.params.sampling_interval = interval;
        Ok(())
    }

    /// Changes the queue capacity.
    ///
    /// # Errors
    ///
    /// - `QueueSizeZero` if `size` is zero
    /// - `QueueShrinkWouldDiscard` if fewer than the currently queued notifications would fit
    pub fn set_queue_size(&self, size: usize) -> UaResult<()> {
        if size == 0 {
            return Err(ConfigurationError::QueueSizeZero.into());
        }
        let mut st = self.lock()?;
        if size < st.queue.len() {
            return Err(ConfigurationError::QueueShrinkWouldDiscard {
                requested: size,
                queued: st.queue.len(),
            }
            .into());
        }
        st.params.queue_size = size;
        Ok(())
    }

    /// Switches the monitoring mode. Disabling clears the queue and the last value.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn set_monitoring_mode(&self, mode: MonitoringMode) -> UaResult<()> {
        let mut st = self.lock()?;
        st.params.monitoring_mode = mode;
        if mode == MonitoringMode::Disabled {
            st.queue.clear();
            st.last = None;
            st.gap_pending = false;
        }
        Ok(())
    }

    /// Applies revised parameters from a modify request.
    ///
    /// The queue size is applied first; if it fails nothing changes.
    ///
    /// # Errors
    ///
    /// See [`set_queue_size`](Self::set_queue_size).
    pub fn modify(&self, revised: &MonitoringParameters) -> UaResult<()> {
        self.set_queue_size(revised.queue_size)?;
        let mut st = self.lock()?;
        st.params.client_handle = revised.client_handle;
        st.params.sampling_interval = revised.sampling_interval;
        st.params.discard_policy = revised.discard_policy;
        st.params.trigger = revised.trigger;
        st.params.timestamps_to_return = revised.timestamps_to_return;
        drop(st);
        self.set_monitoring_mode(revised.monitoring_mode)
    }

    /// Current parameters.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn parameters(&self) -> UaResult<MonitoringParameters> {
        Ok(self.lock()?.params.clone())
    }

    /// Current sampling interval.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn sampling_interval(&self) -> UaResult<Duration> {
        Ok(self.lock()?.params.sampling_interval)
    }

    /// Number of notifications currently queued.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn queue_len(&self) -> UaResult<usize> {
        Ok(self.lock()?.queue.len())
    }

    /// Number of samples that produced a change and tried to enter the queue.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn enqueue_attempts(&self) -> UaResult<u64> {
        Ok(self.lock()?.enqueue_attempts)
    }

    /// Number of notifications lost to overflow.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn overflow_count(&self) -> UaResult<u64> {
        Ok(self.lock()?.overflow_count)
    }

    /// Number of times the variable was read.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the item's lock is poisoned.
    pub fn sample_count(&self) -> UaResult<u64> {
        Ok(self.lock()?.sample_count)
    }
}
