//! Client-side subscription handle.
//!
//! A background publisher thread keeps exactly one publish request outstanding for the
//! life of the subscription and fans the answers out: data changes go to the stream of
//! the monitored item whose client handle they carry, lifecycle events go to the
//! subscription's event channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ServiceError, TransportError, UaError, UaResult};
use crate::node_id::NodeId;
use crate::subscription::{
    CloseReason, MonitoredItemId, MonitoringParameters, NotificationBody, NotificationMessage, SubscriptionId,
    SubscriptionParameters,
};
use crate::time::duration_ms;

use super::stream::{ItemChange, ItemChangeStream};
use super::SessionChannel;

/// Lifecycle events raised by a [`ClientSubscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscriptionEvent {
    /// Creation completed; raised once, before any other event.
    Started {
        /// Server-assigned id.
        subscription_id: SubscriptionId,
    },
    /// The server sent a keep-alive.
    KeepAlive {
        /// Sequence number the next data message will carry.
        sequence_number: u32,
    },
    /// The subscription is gone. Raised exactly once.
    Terminated {
        /// Why it stopped.
        reason: CloseReason,
    },
}

#[derive(Debug)]
struct Shared {
    id: SubscriptionId,
    stopped: AtomicBool,
    terminated: AtomicBool,
    events: Sender<SubscriptionEvent>,
    routes: Mutex<HashMap<u32, Sender<ItemChange>>>,
    next_handle: AtomicU32,
}

impl Shared {
    fn terminate_with(&self, reason: CloseReason) {
        self.stopped.store(true, Ordering::Release);
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.events.send(SubscriptionEvent::Terminated { reason });
        // Dropping the senders lets item streams disconnect once drained.
        if let Ok(mut routes) = self.routes.lock() {
            routes.clear();
        }
        info!(subscription_id = %self.id, reason = %reason, "subscription terminated");
    }

    fn handle_message(&self, message: &NotificationMessage) {
        match &message.body {
            NotificationBody::DataChange(notifications) => {
                let Ok(routes) = self.routes.lock() else {
                    warn!(subscription_id = %self.id, "route table poisoned; dropping notifications");
                    return;
                };
                for n in notifications {
                    match routes.get(&n.client_handle) {
                        Some(tx) => {
                            let _ = tx.send(ItemChange {
                                value: n.value.clone(),
                                overflow: n.overflow,
                            });
                        }
                        None => debug!(client_handle = n.client_handle, "notification for unknown handle"),
                    }
                }
            }
            NotificationBody::KeepAlive => {
                let _ = self.events.send(SubscriptionEvent::KeepAlive {
                    sequence_number: message.sequence_number,
                });
            }
            NotificationBody::StatusChange(reason) => self.terminate_with(*reason),
        }
    }

    fn unroute(&self, client_handle: u32) {
        if let Ok(mut routes) = self.routes.lock() {
            routes.remove(&client_handle);
        }
    }
}

fn close_reason(err: &UaError) -> CloseReason {
    match err {
        UaError::Transport(TransportError::SessionClosed) => CloseReason::SessionClosed,
        UaError::Service(ServiceError::SubscriptionClosed { reason, .. }) => *reason,
        UaError::Service(ServiceError::SubscriptionNotFound { .. }) => CloseReason::Deleted,
        _ => CloseReason::Disconnected,
    }
}

fn publish_loop(channel: Arc<dyn SessionChannel>, shared: Arc<Shared>, poll: Duration) {
    while !shared.stopped.load(Ordering::Acquire) {
        let handle = match channel.publish(shared.id) {
            Ok(handle) => handle,
            Err(e) => {
                debug!(subscription_id = %shared.id, error = %e, "publish request failed");
                shared.terminate_with(close_reason(&e));
                break;
            }
        };

        let response = loop {
            match handle.wait_timeout(poll) {
                Ok(response) => break Some(response),
                Err(UaError::Service(ServiceError::Timeout { .. })) => {
                    if shared.stopped.load(Ordering::Acquire) {
                        break None;
                    }
                }
                Err(e) => {
                    shared.terminate_with(close_reason(&e));
                    break None;
                }
            }
        };
        let Some(response) = response else {
            break;
        };
        shared.handle_message(&response.message);
    }
}

/// A live subscription seen from the client.
///
/// Dropping the handle terminates the subscription.
#[derive(Debug)]
pub struct ClientSubscription {
    shared: Arc<Shared>,
    channel: Arc<dyn SessionChannel>,
    revised: SubscriptionParameters,
    events: Receiver<SubscriptionEvent>,
    publisher: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSubscription {
    pub(crate) fn start(channel: Arc<dyn SessionChannel>, params: &SubscriptionParameters, poll: Duration) -> UaResult<Self> {
        let created = channel.create_subscription(params)?;
        let id = created.id;

        let (event_tx, event_rx) = unbounded();
        let shared = Arc::new(Shared {
            id,
            stopped: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            events: event_tx,
            routes: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        });
        let _ = shared.events.send(SubscriptionEvent::Started { subscription_id: id });

        let thread_channel = Arc::clone(&channel);
        let thread_shared = Arc::clone(&shared);
        let publisher = thread::Builder::new()
            .name(format!("uasub-publish-{id}"))
            .spawn(move || publish_loop(thread_channel, thread_shared, poll));
        let publisher = match publisher {
            Ok(join) => join,
            Err(e) => {
                let _ = channel.delete_subscription(id);
                return Err(UaError::internal(format!("failed to spawn publisher thread: {e}")));
            }
        };

        info!(subscription_id = %id, "subscription started");
        Ok(Self {
            shared,
            channel,
            revised: created.revised,
            events: event_rx,
            publisher: Mutex::new(Some(publisher)),
        })
    }

    /// Server-assigned subscription id.
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.shared.id
    }

    /// Parameters as revised by the server.
    #[must_use]
    pub const fn revised(&self) -> &SubscriptionParameters {
        &self.revised
    }

    /// Lifecycle event receiver.
    #[must_use]
    pub const fn events(&self) -> &Receiver<SubscriptionEvent> {
        &self.events
    }

    /// Waits for the next lifecycle event.
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing arrived in time.
    pub fn next_event_timeout(&self, timeout: Duration) -> UaResult<SubscriptionEvent> {
        self.events.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ServiceError::Timeout {
                duration_ms: duration_ms(timeout),
            }
            .into(),
            RecvTimeoutError::Disconnected => TransportError::Disconnected {
                reason: "subscription events".to_string(),
            }
            .into(),
        })
    }

    /// True once `Terminated` has been emitted.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    /// Starts monitoring a variable. The client handle in `params` is replaced by one
    /// assigned here, which routes the item's notifications to the returned stream.
    ///
    /// # Errors
    ///
    /// Whatever the server returns for the create request.
    pub fn monitor(&self, node_id: &NodeId, params: MonitoringParameters) -> UaResult<ClientMonitoredItem> {
        let client_handle = self.shared.next_handle.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.shared
            .routes
            .lock()
            .map_err(|_| UaError::poisoned("client routes"))?
            .insert(client_handle, tx);

        let params = MonitoringParameters {
            client_handle,
            ..params
        };
        match self.channel.create_monitored_item(self.shared.id, node_id, &params) {
            Ok(created) => Ok(ClientMonitoredItem {
                id: created.id,
                subscription_id: self.shared.id,
                node_id: node_id.clone(),
                revised_sampling_interval: created.revised_sampling_interval,
                revised_queue_size: created.revised_queue_size,
                stream: ItemChangeStream::new(client_handle, rx),
                channel: Arc::clone(&self.channel),
                shared: Arc::clone(&self.shared),
            }),
            Err(e) => {
                self.shared.unroute(client_handle);
                Err(e)
            }
        }
    }

    /// Stops publishing and deletes the subscription on the server. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an internal error if the publisher thread cannot be joined cleanly.
    pub fn terminate(&self) -> UaResult<()> {
        self.shared.stopped.store(true, Ordering::Release);
        if !self.is_terminated() {
            if let Err(e) = self.channel.delete_subscription(self.shared.id) {
                if !(e.is_not_found() || e.is_transport()) {
                    warn!(subscription_id = %self.shared.id, error = %e, "delete subscription failed");
                }
            }
        }
        self.shared.terminate_with(CloseReason::Deleted);
        self.join_publisher()
    }

    fn join_publisher(&self) -> UaResult<()> {
        let join = self
            .publisher
            .lock()
            .map_err(|_| UaError::poisoned("publisher handle"))?
            .take();
        if let Some(join) = join {
            join.join()
                .map_err(|_| UaError::internal("publisher thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for ClientSubscription {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

/// A monitored item seen from the client.
#[derive(Debug)]
pub struct ClientMonitoredItem {
    id: MonitoredItemId,
    subscription_id: SubscriptionId,
    node_id: NodeId,
    revised_sampling_interval: Duration,
    revised_queue_size: usize,
    stream: ItemChangeStream,
    channel: Arc<dyn SessionChannel>,
    shared: Arc<Shared>,
}

impl ClientMonitoredItem {
    /// Server-assigned item id.
    #[must_use]
    pub const fn id(&self) -> MonitoredItemId {
        self.id
    }

    /// The monitored node.
    #[must_use]
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Handle this item's changes are routed by.
    #[must_use]
    pub const fn client_handle(&self) -> u32 {
        self.stream.client_handle()
    }

    /// Sampling interval the server will actually use.
    #[must_use]
    pub const fn revised_sampling_interval(&self) -> Duration {
        self.revised_sampling_interval
    }

    /// Queue size the server will actually use.
    #[must_use]
    pub const fn revised_queue_size(&self) -> usize {
        self.revised_queue_size
    }

    /// The item's change stream.
    #[must_use]
    pub const fn changes(&self) -> &ItemChangeStream {
        &self.stream
    }

    /// Stops monitoring. Changes already buffered stay readable from the stream.
    ///
    /// # Errors
    ///
    /// Whatever the server returns for the delete request.
    pub fn delete(&self) -> UaResult<()> {
        self.channel.delete_monitored_item(self.subscription_id, self.id)?;
        self.shared.unroute(self.stream.client_handle());
        Ok(())
    }
}
