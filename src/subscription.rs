use crate::error::{Result, WmpError};
use crate::types::{ConnectionStatus, DeviceInfo, FunctionId, SessionPhase, Value};
use std::time::Duration;
use tokio::sync::broadcast;

/// Event published by a gateway session
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// A function changed value, through a push update or a poll reply
    StateChanged {
        function: FunctionId,
        /// `None` the first time the function is seen
        old: Option<Value>,
        new: Value,
    },

    /// TCP connection status changed
    StatusChanged(ConnectionStatus),

    /// Session protocol phase changed
    PhaseChanged(SessionPhase),

    /// Gateway identity was (re)read
    DeviceInfo(DeviceInfo),

    /// The connection was lost and a reconnect is pending
    ReconnectScheduled { attempt: u32, delay: Duration },

    /// A session ended with an error after the client had been connected
    Fault(String),
}

/// Receiver for device events
pub struct EventReceiver {
    rx: broadcast::Receiver<DeviceEvent>,
}

impl EventReceiver {
    pub(crate) fn new(rx: broadcast::Receiver<DeviceEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event
    ///
    /// Fails with `ConnectionClosed` once the client has been dropped.
    pub async fn recv(&mut self) -> Result<DeviceEvent> {
        self.rx.recv().await.map_err(|e| match e {
            broadcast::error::RecvError::Closed => WmpError::ConnectionClosed,
            broadcast::error::RecvError::Lagged(n) => WmpError::Lagged(n),
        })
    }

    /// Try to receive an event without blocking
    ///
    /// Returns `None` if no event is available.
    pub fn try_recv(&mut self) -> Result<Option<DeviceEvent>> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Closed) => Err(WmpError::ConnectionClosed),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(WmpError::Lagged(n)),
        }
    }
}
