//! Publish responses and the handle a caller waits on.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use serde::{Deserialize, Serialize};

use crate::error::{ServiceError, TransportError, UaError, UaResult};
use crate::time::duration_ms;

use super::notification::NotificationMessage;
use super::SubscriptionId;

/// The answer to one publish request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Subscription the response belongs to.
    pub subscription_id: SubscriptionId,
    /// The delivered message.
    pub message: NotificationMessage,
    /// Notifications were left queued because the batch cap was reached.
    pub more_notifications: bool,
}

/// An outstanding publish request.
///
/// The server resolves it when the subscription produces output, when the publish
/// timeout elapses (with a keep-alive), or when the subscription closes (with a status
/// change). Dropping the handle abandons the request; the server skips it.
#[derive(Debug)]
pub struct PublishHandle {
    subscription_id: SubscriptionId,
    request_id: u64,
    rx: Receiver<PublishResponse>,
}

impl PublishHandle {
    pub(crate) const fn new(subscription_id: SubscriptionId, request_id: u64, rx: Receiver<PublishResponse>) -> Self {
        Self {
            subscription_id,
            request_id,
            rx,
        }
    }

    /// Subscription the request was queued on.
    #[must_use]
    pub const fn subscription_id(&self) -> SubscriptionId {
        self.subscription_id
    }

    /// Server-assigned request id.
    #[must_use]
    pub const fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Blocks until the request is resolved.
    ///
    /// # Errors
    ///
    /// Returns a transport error if the server dropped the request unanswered.
    pub fn wait(&self) -> UaResult<PublishResponse> {
        self.rx.recv().map_err(|_| dropped())
    }

    /// Blocks until the request is resolved or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// - `ServiceError::Timeout` if nothing arrived in time (the request stays outstanding)
    /// - a transport error if the server dropped the request unanswered
    pub fn wait_timeout(&self, timeout: Duration) -> UaResult<PublishResponse> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ServiceError::Timeout {
                duration_ms: duration_ms(timeout),
            }
            .into(),
            RecvTimeoutError::Disconnected => dropped(),
        })
    }

    /// Returns the response if it has already arrived.
    #[must_use]
    pub fn try_take(&self) -> Option<PublishResponse> {
        match self.rx.try_recv() {
            Ok(resp) => Some(resp),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }
}

fn dropped() -> UaError {
    TransportError::Disconnected {
        reason: "publish request dropped without a response".to_string(),
    }
    .into()
}
