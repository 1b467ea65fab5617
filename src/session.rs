//! Session protocol engine
//!
//! One engine task runs per client. It dials the gateway, runs the `ID`
//! handshake and the `LIMITS` discovery, then serves the `Ready` phase:
//! routing inbound lines to pending requests or the state store and
//! driving the keepalive and poll timers. When the socket drops it
//! reconnects with exponential backoff until cancelled.

use crate::config::ClientConfig;
use crate::connection::{Connection, Inbound, InboundReceiver};
use crate::error::{ParseError, Result, WmpError};
use crate::protocol::{Command, Message};
use crate::state::StateStore;
use crate::subscription::DeviceEvent;
use crate::types::{
    ConnectionStatus, DataType, DeviceInfo, FunctionDescriptor, FunctionId, SessionPhase, Value,
    FUNCTION_AMBTEMP, FUNCTION_ERRCODE, FUNCTION_ERRSTATUS, FUNCTION_ONOFF, LIMIT_FUNCTIONS,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch, Mutex, OwnedMutexGuard};
use tokio::time::{interval_at, sleep, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What a pending request is waiting for
#[derive(Debug, Clone, PartialEq, Eq)]
enum ResponsePattern {
    /// `ACK` (or `ERR`)
    Ack,
    /// `CHN` for this function (or `ERR`)
    Value(FunctionId),
    /// First `CHN` from this unit after `GET,<unit>:*` (or `ERR`)
    AnyChange(u8),
    /// `PONG` (or `ERR`)
    Pong,
}

/// Outcome delivered to the caller of a request
#[derive(Debug)]
pub(crate) enum Reply {
    Ack,
    Value(Value),
    /// The matching `CHN` carried a value the function cannot hold
    Unparsable(ParseError),
    Rejected,
}

/// A command on the wire awaiting its reply
struct PendingRequest {
    id: Uuid,
    /// Session the command was sent on; later sessions never resolve it
    generation: u64,
    pattern: ResponsePattern,
    deadline: Instant,
    /// `None` for background polls nobody awaits
    tx: Option<oneshot::Sender<Reply>>,
    /// Held while pending so only one request per function is in flight
    _slot: Option<OwnedMutexGuard<()>>,
}

/// Pending requests and the link they are written to
///
/// Registering a request and queueing its line happen under one lock, so the
/// order of this queue is the order of lines on the wire. `ACK`/`ERR` carry
/// no key and are matched to the oldest eligible entry.
struct RequestState {
    pending: VecDeque<PendingRequest>,
    link: Option<Arc<Connection>>,
    generation: u64,
}

/// How a session ended
enum SessionEnd {
    /// Socket-level failure; retried with backoff
    Lost(WmpError),
    /// Protocol-level failure; not retried
    Fatal(WmpError),
}

/// State shared between the client handle and the engine task
pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    pub(crate) store: StateStore,
    events: broadcast::Sender<DeviceEvent>,
    status: watch::Sender<ConnectionStatus>,
    phase: watch::Sender<SessionPhase>,
    info: std::sync::Mutex<Option<DeviceInfo>>,
    requests: Mutex<RequestState>,
    slots: std::sync::Mutex<HashMap<FunctionId, Arc<Mutex<()>>>>,
}

impl Shared {
    pub fn new(config: ClientConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let (phase, _) = watch::channel(SessionPhase::Idle);
        Self {
            store: StateStore::new(events.clone()),
            config,
            events,
            status,
            phase,
            info: std::sync::Mutex::new(None),
            requests: Mutex::new(RequestState {
                pending: VecDeque::new(),
                link: None,
                generation: 0,
            }),
            slots: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    /// Wait until the running session is `Ready` or has gone down
    pub async fn settled_phase(&self) -> SessionPhase {
        let mut phase = self.phase.subscribe();
        let settled = match phase
            .wait_for(|p| matches!(p, SessionPhase::Ready | SessionPhase::Disconnected))
            .await
        {
            Ok(settled) => *settled,
            Err(_) => SessionPhase::Disconnected,
        };
        settled
    }

    /// Mark a new engine as starting, before its task is spawned
    pub fn reset_phase(&self) {
        self.set_phase(SessionPhase::Idle);
    }

    pub fn device_info(&self) -> Option<DeviceInfo> {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_status(&self, next: ConnectionStatus) {
        let current = self.status();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::error!("Unexpected connection status change {} -> {}", current, next);
        }
        self.status.send_replace(next);
        let _ = self.events.send(DeviceEvent::StatusChanged(next));
    }

    fn set_phase(&self, next: SessionPhase) {
        if self.phase() == next {
            return;
        }
        tracing::debug!("Session phase: {:?}", next);
        self.phase.send_replace(next);
        let _ = self.events.send(DeviceEvent::PhaseChanged(next));
    }

    fn set_device_info(&self, info: DeviceInfo) {
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = Some(info.clone());
        let _ = self.events.send(DeviceEvent::DeviceInfo(info));
    }

    fn update_rssi(&self, rssi: i32) {
        let mut info = self.info.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = info.as_mut() {
            info.rssi = Some(rssi);
        }
    }

    fn slot(&self, function: &FunctionId) -> Arc<Mutex<()>> {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(function.clone())
            .or_default()
            .clone()
    }

    /// Send a command and wait for its reply
    ///
    /// Waits for any earlier request on the same function first. The whole
    /// call, including that wait, is bounded by the request timeout.
    pub async fn request(
        &self,
        function: &FunctionId,
        command: Command,
        expect_value: bool,
    ) -> Result<Reply> {
        let deadline = Instant::now() + self.config.request_timeout;
        let slot = timeout_at(deadline, self.slot(function).lock_owned())
            .await
            .map_err(|_| WmpError::Timeout)?;

        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        let pattern = if expect_value {
            ResponsePattern::Value(function.clone())
        } else {
            ResponsePattern::Ack
        };

        // Register the pending request and queue its line together
        {
            let mut state = self.requests.lock().await;
            let link = state.link.clone().ok_or(WmpError::NotConnected)?;
            let generation = state.generation;
            state.pending.push_back(PendingRequest {
                id,
                generation,
                pattern,
                deadline,
                tx: Some(tx),
                _slot: Some(slot),
            });
            if let Err(e) = link.send(command) {
                state.pending.retain(|p| p.id != id);
                return Err(e);
            }
        }

        match timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(WmpError::ConnectionClosed),
            Err(_) => {
                let mut state = self.requests.lock().await;
                state.pending.retain(|p| p.id != id);
                tracing::debug!("Request on {} timed out", function);
                Err(WmpError::Timeout)
            }
        }
    }

    /// Read a function in the background unless a request for it is pending
    async fn poll_function(&self, name: &str) -> Result<()> {
        let function = FunctionId::new(self.config.unit, name);
        if self.store.descriptor(&function).is_none() {
            return Ok(());
        }
        let Ok(slot) = self.slot(&function).try_lock_owned() else {
            tracing::debug!("Skipping poll of {}, request pending", function);
            return Ok(());
        };
        let command = Command::Get {
            unit: function.unit,
            function: function.name.clone(),
        };
        self.send_background(command, ResponsePattern::Value(function), Some(slot))
            .await
    }

    /// Read every function of the configured unit
    async fn poll_all(&self) -> Result<()> {
        let unit = self.config.unit;
        self.send_background(
            Command::GetAll { unit },
            ResponsePattern::AnyChange(unit),
            None,
        )
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.send_background(Command::Ping, ResponsePattern::Pong, None)
            .await
    }

    /// Send a command nobody awaits, tracked so its `ERR` cannot be taken
    /// for the reply to a caller's request
    async fn send_background(
        &self,
        command: Command,
        pattern: ResponsePattern,
        slot: Option<OwnedMutexGuard<()>>,
    ) -> Result<()> {
        let mut state = self.requests.lock().await;
        let Some(link) = state.link.clone() else {
            return Ok(());
        };
        let id = Uuid::new_v4();
        let generation = state.generation;
        state.pending.push_back(PendingRequest {
            id,
            generation,
            pattern,
            deadline: Instant::now() + self.config.request_timeout,
            tx: None,
            _slot: slot,
        });
        if let Err(e) = link.send(command) {
            state.pending.retain(|p| p.id != id);
            return Err(e);
        }
        Ok(())
    }

    /// Drop background polls past their deadline and requests whose caller left
    async fn purge_expired(&self) {
        let now = Instant::now();
        let mut state = self.requests.lock().await;
        let before = state.pending.len();
        state.pending.retain(|p| match &p.tx {
            Some(tx) => !tx.is_closed(),
            None => p.deadline > now,
        });
        let purged = before - state.pending.len();
        if purged > 0 {
            tracing::debug!("Purged {} expired pending request(s)", purged);
        }
    }

    /// Complete the oldest pending request of the current session matching `pred`
    async fn resolve<F>(&self, pred: F, reply: Reply) -> bool
    where
        F: Fn(&ResponsePattern) -> bool,
    {
        let mut state = self.requests.lock().await;
        let generation = state.generation;
        let Some(index) = state
            .pending
            .iter()
            .position(|p| p.generation == generation && pred(&p.pattern))
        else {
            return false;
        };
        let Some(pending) = state.pending.remove(index) else {
            return false;
        };
        if let Some(tx) = pending.tx {
            let _ = tx.send(reply);
        }
        true
    }

    /// Route one message received while `Ready`
    async fn handle_message(&self, message: Message) {
        match message {
            Message::Ack => {
                if !self.resolve(|p| *p == ResponsePattern::Ack, Reply::Ack).await {
                    tracing::debug!("Unsolicited ACK");
                }
            }
            Message::Err => {
                if !self.resolve(|_| true, Reply::Rejected).await {
                    tracing::warn!("Unsolicited ERR");
                }
            }
            Message::Change { function, value } => {
                let unit = function.unit;
                let reply = match self.store.apply(&function, &value) {
                    Some(parsed) => Reply::Value(parsed),
                    None => Reply::Unparsable(ParseError::new(
                        format!("CHN,{},{}", function, value),
                        "value does not fit the function",
                    )),
                };
                let pattern = ResponsePattern::Value(function);
                self.resolve(|p| *p == pattern, reply).await;
                self.resolve(|p| *p == ResponsePattern::AnyChange(unit), Reply::Ack)
                    .await;
            }
            Message::Pong(rssi) => {
                tracing::debug!("Keepalive answered, RSSI {}", rssi);
                self.update_rssi(rssi);
                self.resolve(|p| *p == ResponsePattern::Pong, Reply::Ack).await;
            }
            Message::Id(info) => self.set_device_info(info),
            Message::Info { key, value } => {
                tracing::debug!("Gateway info {} = {}", key, value);
            }
            Message::Limits { function, .. } => {
                tracing::debug!("Ignoring LIMITS for {} outside discovery", function);
            }
        }
    }

    /// Make `connection` the link for new requests
    async fn go_live(&self, connection: Arc<Connection>) {
        let mut state = self.requests.lock().await;
        state.generation += 1;
        state.link = Some(connection);
        state.pending.retain(|p| p.tx.is_some());
    }

    /// Stop accepting requests; pending ones run into their deadline
    async fn drop_link(&self) {
        let mut state = self.requests.lock().await;
        if let Some(link) = state.link.take() {
            link.close();
        }
    }

    /// Final cleanup when the engine stops; waiting callers see `ConnectionClosed`
    async fn teardown(&self) {
        {
            let mut state = self.requests.lock().await;
            if let Some(link) = state.link.take() {
                link.close();
            }
            state.pending.clear();
        }
        self.set_phase(SessionPhase::Disconnected);
        self.set_status(ConnectionStatus::Disconnected);
    }
}

/// Engine task body
///
/// `first` receives the outcome of the first session. If that session fails
/// the engine stops instead of retrying.
pub(crate) async fn run(
    shared: Arc<Shared>,
    cancel: CancellationToken,
    first: oneshot::Sender<Result<()>>,
) {
    let mut first = Some(first);
    let mut attempt: u32 = 0;

    loop {
        let end = tokio::select! {
            _ = cancel.cancelled() => None,
            end = run_session(&shared, &mut first, &mut attempt) => Some(end),
        };
        let Some(end) = end else {
            tracing::info!("Session stopped");
            if let Some(tx) = first.take() {
                let _ = tx.send(Err(WmpError::ConnectionClosed));
            }
            break;
        };

        shared.drop_link().await;
        shared.set_phase(SessionPhase::Disconnected);
        shared.set_status(ConnectionStatus::Disconnected);

        let error = match end {
            SessionEnd::Lost(e) => e,
            SessionEnd::Fatal(e) => {
                tracing::error!("Session failed: {}", e);
                match first.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(e));
                    }
                    None => {
                        let _ = shared.events.send(DeviceEvent::Fault(e.to_string()));
                    }
                }
                break;
            }
        };

        if let Some(tx) = first.take() {
            tracing::error!("Initial connection failed: {}", error);
            let _ = tx.send(Err(error));
            break;
        }

        tracing::warn!("Connection lost: {}", error);
        let _ = shared.events.send(DeviceEvent::Fault(error.to_string()));

        attempt = attempt.saturating_add(1);
        let delay = shared.config.backoff_for(attempt);
        tracing::info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        let _ = shared
            .events
            .send(DeviceEvent::ReconnectScheduled { attempt, delay });

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Reconnect cancelled");
                break;
            }
            _ = sleep(delay) => {}
        }
    }

    shared.teardown().await;
}

async fn run_session(
    shared: &Arc<Shared>,
    first: &mut Option<oneshot::Sender<Result<()>>>,
    attempt: &mut u32,
) -> SessionEnd {
    let config = &shared.config;
    shared.set_phase(SessionPhase::Idle);
    shared.set_status(ConnectionStatus::Connecting);

    let (connection, mut inbound) =
        match Connection::connect(&config.host, config.port, config.connect_timeout).await {
            Ok(connected) => connected,
            Err(e) => return SessionEnd::Lost(e),
        };
    let connection = Arc::new(connection);
    shared.set_status(ConnectionStatus::Connected);
    tracing::info!("Connected to {}", connection.addr());

    let mut handshake = Handshake {
        shared,
        connection: &connection,
        inbound: &mut inbound,
    };

    shared.set_phase(SessionPhase::LoggingIn);
    let info = match handshake.login().await {
        Ok(info) => info,
        Err(e) => return classify(e),
    };
    tracing::info!(
        "Gateway {} (MAC {}, firmware {})",
        info.model,
        info.mac,
        info.firmware_version
    );
    shared.set_device_info(info);
    shared.set_status(ConnectionStatus::Authenticated);

    shared.set_phase(SessionPhase::DiscoveringFunctions);
    let descriptors = match handshake.discover().await {
        Ok(descriptors) => descriptors,
        Err(e) => return classify(e),
    };
    tracing::info!("Discovered {} function(s)", descriptors.len());
    shared.store.install_descriptors(descriptors);

    shared.go_live(connection.clone()).await;
    if let Err(e) = shared.poll_all().await {
        return SessionEnd::Lost(e);
    }

    shared.set_phase(SessionPhase::Ready);
    *attempt = 0;
    if let Some(tx) = first.take() {
        let _ = tx.send(Ok(()));
    }
    tracing::info!("Session ready");

    ready_loop(shared, &mut inbound).await
}

async fn ready_loop(shared: &Shared, inbound: &mut InboundReceiver) -> SessionEnd {
    let config = &shared.config;
    let start = Instant::now();
    let mut keepalive = interval_at(start + config.keepalive_interval, config.keepalive_interval);
    let mut ambient = interval_at(
        start + config.ambient_poll_interval,
        config.ambient_poll_interval,
    );
    let mut status_poll = interval_at(
        start + config.status_poll_interval,
        config.status_poll_interval,
    );
    let mut sweep = interval_at(start + config.request_timeout, config.request_timeout);
    for timer in [&mut keepalive, &mut ambient, &mut status_poll, &mut sweep] {
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    }

    loop {
        let sent = tokio::select! {
            frame = inbound.recv() => {
                match frame {
                    Some(Inbound::Message(message)) => shared.handle_message(message).await,
                    Some(Inbound::Malformed(e)) => tracing::warn!("Dropping {}", e),
                    Some(Inbound::Closed) | None => {
                        return SessionEnd::Lost(WmpError::ConnectionClosed);
                    }
                }
                Ok(())
            }
            _ = keepalive.tick() => shared.ping().await,
            _ = ambient.tick() => shared.poll_function(FUNCTION_AMBTEMP).await,
            _ = status_poll.tick() => shared.poll_all().await,
            _ = sweep.tick() => {
                shared.purge_expired().await;
                Ok(())
            }
        };

        if let Err(e) = sent {
            return SessionEnd::Lost(e);
        }
    }
}

fn classify(error: WmpError) -> SessionEnd {
    match error {
        WmpError::Auth(_) | WmpError::Discovery(_) => SessionEnd::Fatal(error),
        other => SessionEnd::Lost(other),
    }
}

/// Sequential request/reply exchange used before the session is `Ready`
struct Handshake<'a> {
    shared: &'a Shared,
    connection: &'a Connection,
    inbound: &'a mut InboundReceiver,
}

impl Handshake<'_> {
    /// Next message that is not a push update, within the handshake timeout
    async fn next_reply(&mut self) -> Result<Message> {
        let deadline = Instant::now() + self.shared.config.handshake_timeout;
        loop {
            match timeout_at(deadline, self.inbound.recv()).await {
                Err(_) => return Err(WmpError::Timeout),
                Ok(None) | Ok(Some(Inbound::Closed)) => return Err(WmpError::ConnectionClosed),
                Ok(Some(Inbound::Malformed(e))) => tracing::warn!("Dropping {}", e),
                Ok(Some(Inbound::Message(Message::Change { function, value }))) => {
                    self.shared.store.apply(&function, &value);
                }
                Ok(Some(Inbound::Message(Message::Pong(rssi)))) => self.shared.update_rssi(rssi),
                Ok(Some(Inbound::Message(message))) => return Ok(message),
            }
        }
    }

    /// Send `ID` and wait for the gateway to identify itself
    async fn login(&mut self) -> Result<DeviceInfo> {
        self.connection.send(Command::Id)?;
        loop {
            match self.next_reply().await? {
                Message::Id(info) => return Ok(info),
                Message::Err => {
                    return Err(WmpError::Auth("gateway answered ERR to ID".to_string()));
                }
                other => tracing::debug!("Ignoring {:?} while logging in", other),
            }
        }
    }

    /// Query `LIMITS` for each controllable function, one at a time
    async fn discover(&mut self) -> Result<Vec<FunctionDescriptor>> {
        let unit = self.shared.config.unit;
        let mut descriptors = Vec::new();

        for name in LIMIT_FUNCTIONS {
            self.connection.send(Command::Limits(name.to_string()))?;
            loop {
                let reply = match self.next_reply().await {
                    Ok(reply) => reply,
                    Err(WmpError::Timeout) => {
                        tracing::warn!("No LIMITS reply for {}, treating as unsupported", name);
                        break;
                    }
                    Err(e) => return Err(e),
                };
                match reply {
                    Message::Limits { function, values } if function == name => {
                        match FunctionDescriptor::from_limits(unit, name, &values) {
                            Some(descriptor) => descriptors.push(descriptor),
                            None => tracing::warn!("Unusable LIMITS for {}: {:?}", name, values),
                        }
                        break;
                    }
                    Message::Err => {
                        tracing::debug!("{} not supported", name);
                        break;
                    }
                    other => tracing::debug!("Ignoring {:?} while discovering {}", other, name),
                }
            }
        }

        if descriptors.is_empty() {
            return Err(WmpError::Discovery(
                "gateway reported no function limits".to_string(),
            ));
        }

        if !descriptors.iter().any(|d| d.id.name == FUNCTION_ONOFF) {
            descriptors.push(FunctionDescriptor::power(unit));
        }
        descriptors.push(FunctionDescriptor::read_only(
            unit,
            FUNCTION_AMBTEMP,
            DataType::Integer,
        ));
        descriptors.push(FunctionDescriptor::read_only(
            unit,
            FUNCTION_ERRSTATUS,
            DataType::Text,
        ));
        descriptors.push(FunctionDescriptor::read_only(
            unit,
            FUNCTION_ERRCODE,
            DataType::Text,
        ));

        Ok(descriptors)
    }
}
