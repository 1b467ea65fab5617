use crate::config::ClientConfig;
use crate::error::{Result, WmpError};
use crate::protocol::Command;
use crate::session::{self, Reply, Shared};
use crate::state::DeviceState;
use crate::subscription::EventReceiver;
use crate::types::{
    ConnectionStatus, DeviceInfo, FunctionDescriptor, FunctionId, SessionPhase, Value,
};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Running session engine
struct Engine {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Client for one IntesisBox gateway
///
/// Each client owns its own connection, session and state; run several side
/// by side to control several gateways. Dropping the client stops its
/// session.
pub struct IntesisBox {
    shared: Arc<Shared>,
    engine: Mutex<Option<Engine>>,
}

impl IntesisBox {
    /// Create a client without connecting
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared::new(config)),
            engine: Mutex::new(None),
        })
    }

    /// Create a client and wait until its first session is ready
    ///
    /// # Example
    ///
    /// ```no_run
    /// use intesisbox_wmp::{ClientConfig, IntesisBox, Mode};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let ac = IntesisBox::open(ClientConfig::new("192.168.1.50")).await?;
    ///     ac.set_mode(Mode::Cool).await?;
    ///     ac.set_temperature(22.5).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn open(config: ClientConfig) -> Result<Self> {
        let client = Self::new(config)?;
        client.connect().await?;
        Ok(client)
    }

    /// Start the session engine and wait for the first session
    ///
    /// Returns once the gateway has answered the handshake and its functions
    /// are discovered. If that first session fails the error is returned and
    /// nothing keeps running. Once connected, dropped connections are
    /// re-established in the background until [`disconnect`](Self::disconnect).
    ///
    /// Calling this while a session is already running waits for that
    /// session instead of starting another. It returns `Ok` once the session
    /// is `Ready` and `NotConnected` if the session is down.
    pub async fn connect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let running = {
            let mut engine = self.engine.lock().unwrap_or_else(|e| e.into_inner());
            if engine.as_ref().is_some_and(|e| !e.task.is_finished()) {
                true
            } else {
                self.shared.reset_phase();
                let cancel = CancellationToken::new();
                let task = tokio::spawn(session::run(self.shared.clone(), cancel.clone(), tx));
                *engine = Some(Engine { cancel, task });
                false
            }
        };

        if running {
            tracing::debug!("connect() called but session already running");
            return match self.shared.settled_phase().await {
                SessionPhase::Ready => Ok(()),
                _ => Err(WmpError::NotConnected),
            };
        }
        rx.await.unwrap_or(Err(WmpError::ConnectionClosed))
    }

    /// Stop the session, cancelling any pending reconnect
    ///
    /// Safe to call in any state. Requests still waiting for a reply fail
    /// with `ConnectionClosed`.
    pub async fn disconnect(&self) {
        let engine = self
            .engine
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(engine) = engine {
            engine.cancel.cancel();
            if let Err(e) = engine.task.await {
                tracing::error!("Session task failed: {}", e);
            }
        }
    }

    /// Configuration this client was created with
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Current TCP connection status
    pub fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    /// Current session phase
    pub fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }

    /// Whether the session is `Ready` to accept commands
    pub fn is_connected(&self) -> bool {
        self.shared.phase() == SessionPhase::Ready
    }

    /// Copy of the last known device state
    pub fn state(&self) -> DeviceState {
        self.shared.store.snapshot()
    }

    /// Functions discovered in the last session
    pub fn descriptors(&self) -> Vec<FunctionDescriptor> {
        self.shared.store.descriptors()
    }

    /// Gateway identity from the last successful login
    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.shared.device_info()
    }

    /// Subscribe to state changes and session events
    ///
    /// # Example
    ///
    /// ```no_run
    /// use intesisbox_wmp::{ClientConfig, DeviceEvent, IntesisBox};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let ac = IntesisBox::new(ClientConfig::new("192.168.1.50"))?;
    ///     let mut events = ac.subscribe();
    ///     ac.connect().await?;
    ///
    ///     while let Ok(event) = events.recv().await {
    ///         if let DeviceEvent::StateChanged { function, new, .. } = event {
    ///             println!("{} = {}", function, new);
    ///         }
    ///     }
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe(&self) -> EventReceiver {
        self.shared.store.subscribe()
    }

    /// Write a function on the configured unit
    ///
    /// Completes when the gateway answers `ACK`. An `ERR` answer is returned
    /// as `ValueRejected` and is not retried.
    pub async fn set_value(&self, function: &str, value: impl Into<String>) -> Result<()> {
        let value = value.into();
        let descriptor = self.descriptor(function)?;
        descriptor
            .validate(&value)
            .map_err(|detail| {
                if descriptor.writable {
                    WmpError::InvalidValue {
                        function: descriptor.id.to_string(),
                        value: value.clone(),
                        detail,
                    }
                } else {
                    WmpError::ReadOnly(descriptor.id.to_string())
                }
            })?;

        let command = Command::Set {
            unit: descriptor.id.unit,
            function: descriptor.id.name.clone(),
            value,
        };
        let wire = command.encode();
        match self.shared.request(&descriptor.id, command, false).await? {
            Reply::Ack | Reply::Value(_) => Ok(()),
            Reply::Unparsable(e) => Err(e.into()),
            Reply::Rejected => Err(WmpError::ValueRejected { command: wire }),
        }
    }

    /// Read a function from the device rather than from the cached state
    ///
    /// A reply the function's descriptor cannot interpret fails with `Parse`.
    pub async fn get_value(&self, function: &str) -> Result<Value> {
        let descriptor = self.descriptor(function)?;
        let command = Command::Get {
            unit: descriptor.id.unit,
            function: descriptor.id.name.clone(),
        };
        let wire = command.encode();
        match self.shared.request(&descriptor.id, command, true).await? {
            Reply::Value(value) => Ok(value),
            Reply::Unparsable(e) => Err(e.into()),
            Reply::Ack => Err(WmpError::InvalidValue {
                function: descriptor.id.to_string(),
                value: String::new(),
                detail: "gateway acknowledged a read without a value".to_string(),
            }),
            Reply::Rejected => Err(WmpError::ValueRejected { command: wire }),
        }
    }

    /// Cached value of a function on the configured unit
    pub fn value(&self, function: &str) -> Option<Value> {
        self.shared.store.get(&self.function_id(function))
    }

    pub(crate) fn function_id(&self, function: &str) -> FunctionId {
        FunctionId::new(self.shared.config.unit, function)
    }

    pub(crate) fn descriptor_of(&self, function: &str) -> Option<FunctionDescriptor> {
        self.shared.store.descriptor(&self.function_id(function))
    }

    fn descriptor(&self, function: &str) -> Result<FunctionDescriptor> {
        self.descriptor_of(function)
            .ok_or_else(|| WmpError::UnknownFunction(self.function_id(function).to_string()))
    }
}

impl Drop for IntesisBox {
    fn drop(&mut self) {
        if let Some(engine) = self
            .engine
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            engine.cancel.cancel();
        }
    }
}
