//! Per-item change streams on the client side.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};

use crate::error::{ServiceError, TransportError, UaError, UaResult};
use crate::time::duration_ms;
use crate::value::DataValue;

/// One value change delivered to a monitored item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemChange {
    /// The reported value.
    pub value: DataValue,
    /// Values were discarded by the server immediately before this one.
    pub overflow: bool,
}

/// Ordered stream of changes for one monitored item.
///
/// Changes arrive oldest-first. The stream disconnects once the owning subscription
/// stops and every buffered change has been received.
#[derive(Debug)]
pub struct ItemChangeStream {
    client_handle: u32,
    rx: Receiver<ItemChange>,
}

impl ItemChangeStream {
    pub(crate) const fn new(client_handle: u32, rx: Receiver<ItemChange>) -> Self {
        Self { client_handle, rx }
    }

    /// The client handle routing notifications to this stream.
    #[must_use]
    pub const fn client_handle(&self) -> u32 {
        self.client_handle
    }

    /// Receive the next change (blocking).
    ///
    /// # Errors
    ///
    /// Returns a transport error once the subscription has stopped and the stream is drained.
    pub fn recv(&self) -> UaResult<ItemChange> {
        self.rx.recv().map_err(|_| stopped())
    }

    /// Receive the next change with a timeout.
    ///
    /// # Errors
    ///
    /// `Timeout` if nothing arrived in time; a transport error once the stream is closed.
    pub fn recv_timeout(&self, timeout: Duration) -> UaResult<ItemChange> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => ServiceError::Timeout {
                duration_ms: duration_ms(timeout),
            }
            .into(),
            RecvTimeoutError::Disconnected => stopped(),
        })
    }

    /// The next change if one is already buffered.
    #[must_use]
    pub fn try_recv(&self) -> Option<ItemChange> {
        match self.rx.try_recv() {
            Ok(change) => Some(change),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Every change buffered right now, oldest first.
    #[must_use]
    pub fn drain(&self) -> Vec<ItemChange> {
        self.rx.try_iter().collect()
    }
}

fn stopped() -> UaError {
    TransportError::Disconnected {
        reason: "item change stream".to_string(),
    }
    .into()
}
