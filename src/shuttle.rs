use crate::config::{Endpoint, ShuttleConfig};
use crate::error::{ConnectionError, ErrorReason, SendError};
use crate::reachability::{ConnectCondition, Reachability, ReachabilityMonitor};
use crate::socket::{CloseCode, CloseEvent, CloseFrame, Message};
use crate::transport::{FailureKind, Transport, TransportEvent, TransportEvents};
use crate::Error;
use async_trait::async_trait;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

/// Lifecycle state of a [`Shuttle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    /// No network, set from reachability changes.
    Offline,
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for SocketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SocketState::Offline => "offline",
            SocketState::Connecting => "connecting",
            SocketState::Connected => "connected",
            SocketState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Observer of a [`Shuttle`]. Only `on_message` is required.
#[async_trait]
#[allow(unused_variables)]
pub trait ShuttleExt: Send + Sync + 'static {
    /// Handler for messages from the server. Returning an error closes the connection.
    async fn on_message(&self, message: Message) -> Result<(), Error>;
    /// Called once the connection is open.
    async fn on_open(&self) -> Result<(), Error> {
        Ok(())
    }
    /// Called once for every connect failure, timeout or loss of connection.
    ///
    /// Losing the network reports [`ErrorReason::Offline`] only while a connection is wanted:
    /// a session that was never asked to connect, or was stopped with
    /// [`Shuttle::disconnect`], goes `Offline` silently.
    async fn on_failure(&self, error: &ConnectionError) -> Result<(), Error> {
        Ok(())
    }
    /// Called when the server closed an open connection.
    async fn on_close(&self, event: &CloseEvent) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Debug)]
enum Command {
    Send(Message),
    EnsureConnected,
    Disconnect,
    Detach,
}

/// Handle to a reachability-aware WebSocket session.
///
/// All operations return immediately; outcomes are reported to the [`ShuttleExt`] observer.
/// The session task stops once every handle has been dropped.
#[derive(Clone)]
pub struct Shuttle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SocketState>,
    timeout: Arc<watch::Sender<Duration>>,
    endpoint: Arc<watch::Sender<Endpoint>>,
    connect_condition: ConnectCondition,
}

impl fmt::Debug for Shuttle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shuttle")
            .field("url", &self.url())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Shuttle {
    /// Starts a session over `transport`.
    ///
    /// The session keeps only a weak reference to `observer`: once the owner drops it, events
    /// are no longer dispatched.
    pub fn create<E, T, R>(
        config: ShuttleConfig,
        transport: T,
        reachability: &R,
        observer: &Arc<E>,
    ) -> (Self, JoinHandle<()>)
    where
        E: ShuttleExt,
        T: Transport,
        R: ReachabilityMonitor + ?Sized,
    {
        let ShuttleConfig {
            endpoint,
            connect_condition,
            timeout,
            connect_on_start,
        } = config;

        let (status, reachability) = reachability.subscribe();
        let initial = if status.is_reachable() {
            SocketState::Disconnected
        } else {
            SocketState::Offline
        };
        let (command_sender, command_receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let (state_sender, state_receiver) = watch::channel(initial);
        let (timeout_sender, timeout_receiver) = watch::channel(timeout);
        let (endpoint_sender, endpoint_receiver) = watch::channel(endpoint);

        let handle = Self {
            commands: command_sender,
            state: state_receiver,
            timeout: Arc::new(timeout_sender),
            endpoint: Arc::new(endpoint_sender),
            connect_condition,
        };
        let actor = ShuttleActor {
            observer: Arc::downgrade(observer),
            transport,
            commands: command_receiver,
            events: event_receiver,
            event_sender,
            reachability,
            reachability_live: true,
            status,
            state: state_sender,
            timeout: timeout_receiver,
            endpoint: endpoint_receiver,
            connect_condition,
            attempt: 0,
            deadline: None,
            wants_connection: connect_on_start,
            awaiting_permission: false,
        };
        let future = tokio::spawn(actor.run());

        (handle, future)
    }

    /// Checks if the session task is still running.
    pub fn alive(&self) -> bool {
        !self.commands.is_closed()
    }

    pub fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    /// Feed of state changes.
    pub fn state_receiver(&self) -> watch::Receiver<SocketState> {
        self.state.clone()
    }

    /// Sends a message over the open connection.
    ///
    /// Fails with [`SendError::NotConnected`] unless the session is `Connected`; nothing is
    /// queued for later.
    pub fn send(&self, message: impl Into<Message>) -> Result<(), SendError> {
        if self.state() != SocketState::Connected {
            return Err(SendError::NotConnected);
        }
        self.commands
            .send(Command::Send(message.into()))
            .map_err(|_| SendError::Closed)
    }

    /// Sends a Text message to the server
    pub fn text(&self, text: impl Into<String>) -> Result<(), SendError> {
        self.send(Message::Text(text.into()))
    }

    /// Sends a Binary message to the server
    pub fn binary(&self, bytes: impl Into<Vec<u8>>) -> Result<(), SendError> {
        self.send(Message::Binary(bytes.into()))
    }

    /// Connects unless already connecting or connected. Explicit calls ignore the connect
    /// condition and the current reachability snapshot.
    pub fn ensure_connected(&self) {
        self.command(Command::EnsureConnected, "Shuttle::ensure_connected");
    }

    /// Closes the connection and stays `Disconnected` until [`Shuttle::ensure_connected`].
    pub fn disconnect(&self) {
        self.command(Command::Disconnect, "Shuttle::disconnect");
    }

    /// Stops dispatching events to the observer.
    pub fn detach(&self) {
        self.command(Command::Detach, "Shuttle::detach");
    }

    pub fn timeout(&self) -> Duration {
        *self.timeout.borrow()
    }

    /// Changes the connect timeout. Applies from the next connect attempt on.
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout.send_replace(timeout);
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.borrow().clone()
    }

    pub fn url(&self) -> String {
        self.endpoint.borrow().url()
    }

    /// Changes where the session connects to. Applies from the next connect attempt on.
    pub fn set_endpoint(&self, endpoint: impl Into<Endpoint>) {
        self.endpoint.send_replace(endpoint.into());
    }

    pub fn connect_condition(&self) -> ConnectCondition {
        self.connect_condition
    }

    fn command(&self, command: Command, caller: &str) {
        self.commands
            .send(command)
            .unwrap_or_else(|_| tracing::warn!("{caller} {MESSAGE_SESSION_STOPPED}"));
    }
}

struct ShuttleActor<E: ShuttleExt, T: Transport> {
    observer: Weak<E>,
    transport: T,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    event_sender: mpsc::UnboundedSender<(u64, TransportEvent)>,
    reachability: mpsc::UnboundedReceiver<Reachability>,
    reachability_live: bool,
    status: Reachability,
    state: watch::Sender<SocketState>,
    timeout: watch::Receiver<Duration>,
    endpoint: watch::Receiver<Endpoint>,
    connect_condition: ConnectCondition,
    /// Number of the current connect attempt. Events of other attempts are stale.
    attempt: u64,
    /// The connect timer. One slot, so at most one timer per session.
    deadline: Option<Instant>,
    /// Cleared by `disconnect`, set by `ensure_connected`.
    wants_connection: bool,
    /// A spontaneous connect was held back by the connect condition.
    awaiting_permission: bool,
}

impl<E: ShuttleExt, T: Transport> ShuttleActor<E, T> {
    async fn run(mut self) {
        self.start();
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some((attempt, event)) = self.events.recv() => {
                    if attempt == self.attempt {
                        self.handle_event(event).await;
                    } else {
                        tracing::trace!(
                            attempt,
                            current = self.attempt,
                            "ignoring event of stale attempt"
                        );
                    }
                }
                status = self.reachability.recv(), if self.reachability_live => match status {
                    Some(status) => self.handle_reachability(status).await,
                    None => {
                        tracing::warn!("reachability monitor stopped, keeping last known status");
                        self.reachability_live = false;
                    }
                },
                () = sleep_until(self.deadline.unwrap_or_else(Instant::now)),
                    if self.deadline.is_some() =>
                {
                    self.handle_timeout().await;
                }
            }
        }
        if self.is_active() {
            self.abort(Some(CloseFrame {
                code: CloseCode::Away,
                reason: String::from("session dropped"),
            }));
        }
        tracing::debug!(url = %self.endpoint.borrow().url(), "session stopped");
    }

    fn start(&mut self) {
        if !self.wants_connection || !self.status.is_reachable() {
            return;
        }
        if self.connect_condition.permits(self.status) {
            self.connect();
        } else {
            tracing::debug!(condition = ?self.connect_condition, "waiting for a permitted network");
            self.awaiting_permission = true;
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Send(message) => {
                if self.state() == SocketState::Connected {
                    self.transport.send(message);
                } else {
                    tracing::warn!(
                        state = %self.state(),
                        "dropping message, socket is not connected"
                    );
                }
            }
            Command::EnsureConnected => {
                self.wants_connection = true;
                match self.state() {
                    SocketState::Connecting | SocketState::Connected => {}
                    SocketState::Offline | SocketState::Disconnected => self.connect(),
                }
            }
            Command::Disconnect => {
                self.wants_connection = false;
                self.awaiting_permission = false;
                if self.is_active() {
                    self.abort(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: String::new(),
                    }));
                }
                self.set_state(SocketState::Disconnected);
            }
            Command::Detach => {
                tracing::debug!("observer detached");
                self.observer = Weak::new();
            }
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match (self.state(), event) {
            (SocketState::Connecting, TransportEvent::Open) => {
                self.deadline = None;
                let url = self.endpoint.borrow().url();
                tracing::info!(%url, attempt = self.attempt, "connected");
                self.set_state(SocketState::Connected);
                if let Some(observer) = self.observer() {
                    if let Err(err) = observer.on_open().await {
                        tracing::error!("error in on_open: {err:?}");
                    }
                }
            }
            (SocketState::Connected, TransportEvent::Message(message)) => {
                let Some(observer) = self.observer() else {
                    return;
                };
                if let Err(err) = observer.on_message(message).await {
                    tracing::error!("error while handling message: {err}");
                    self.abort(Some(CloseFrame {
                        code: CloseCode::Error,
                        reason: format!("{err}"),
                    }));
                    self.set_state(SocketState::Disconnected);
                    self.notify_failure(ConnectionError::with_detail(ErrorReason::Generic, err))
                        .await;
                }
            }
            (
                state @ (SocketState::Connecting | SocketState::Connected),
                TransportEvent::Failure { kind, error },
            ) => {
                self.finish_attempt();
                let established = state == SocketState::Connected;
                let reason = ErrorReason::classify(kind, self.status.is_reachable(), established);
                tracing::warn!(%reason, ?kind, %state, "connection failed: {error}");
                self.set_state(SocketState::Disconnected);
                self.notify_failure(ConnectionError::with_detail(reason, error))
                    .await;
            }
            (SocketState::Connected, TransportEvent::Close(event)) => {
                self.finish_attempt();
                tracing::info!(
                    code = %event.code,
                    reason = %event.reason,
                    was_clean = event.was_clean,
                    "connection closed"
                );
                self.set_state(SocketState::Disconnected);
                if let Some(observer) = self.observer() {
                    if let Err(err) = observer.on_close(&event).await {
                        tracing::error!("error in on_close: {err:?}");
                    }
                }
            }
            (SocketState::Connecting, TransportEvent::Close(event)) => {
                // closed during the handshake
                self.finish_attempt();
                let reason = ErrorReason::classify(
                    FailureKind::Refused,
                    self.status.is_reachable(),
                    false,
                );
                tracing::warn!(%reason, code = %event.code, "connection closed during handshake");
                let detail = eyre::eyre!(
                    "closed during handshake with code {}: {}",
                    event.code,
                    event.reason
                );
                self.set_state(SocketState::Disconnected);
                self.notify_failure(ConnectionError::with_detail(reason, detail))
                    .await;
            }
            (state, event) => {
                tracing::trace!(%state, ?event, "ignoring transport event");
            }
        }
    }

    async fn handle_reachability(&mut self, status: Reachability) {
        self.status = status;
        if !status.is_reachable() {
            if self.state() == SocketState::Offline {
                return;
            }
            if self.is_active() {
                self.abort(Some(CloseFrame {
                    code: CloseCode::Away,
                    reason: String::from("network lost"),
                }));
            }
            tracing::info!("network lost");
            self.set_state(SocketState::Offline);
            if self.wants_connection {
                self.notify_failure(ConnectionError::new(ErrorReason::Offline))
                    .await;
            }
            return;
        }

        match self.state() {
            SocketState::Offline => {
                if !self.wants_connection {
                    self.set_state(SocketState::Disconnected);
                } else if self.connect_condition.permits(status) {
                    self.connect();
                } else {
                    tracing::debug!(
                        interface = ?status.interface,
                        "network regained, waiting for WLAN"
                    );
                    self.awaiting_permission = true;
                    self.set_state(SocketState::Disconnected);
                }
            }
            SocketState::Disconnected
                if self.wants_connection
                    && self.awaiting_permission
                    && self.connect_condition.permits(status) =>
            {
                self.connect();
            }
            _ => {}
        }
    }

    async fn handle_timeout(&mut self) {
        self.deadline = None;
        if self.state() != SocketState::Connecting {
            return;
        }
        let timeout = *self.timeout.borrow();
        tracing::warn!(attempt = self.attempt, ?timeout, "connect attempt timed out");
        self.abort(None);
        self.set_state(SocketState::Disconnected);
        self.notify_failure(ConnectionError::with_detail(
            ErrorReason::Timeout,
            eyre::eyre!("no connection after {timeout:?}"),
        ))
        .await;
    }

    /// Opens a new attempt and (re)starts the connect timer.
    fn connect(&mut self) {
        self.awaiting_permission = false;
        self.attempt += 1;
        let timeout = *self.timeout.borrow();
        self.deadline = Some(Instant::now() + timeout);
        let endpoint = self.endpoint.borrow().clone();
        tracing::info!(url = %endpoint.url(), attempt = self.attempt, ?timeout, "connecting");
        self.set_state(SocketState::Connecting);
        let events = TransportEvents::new(self.attempt, self.event_sender.clone());
        self.transport.open(endpoint, events);
    }

    /// Closes the transport and makes everything it still reports stale.
    fn abort(&mut self, frame: Option<CloseFrame>) {
        self.finish_attempt();
        self.transport.close(frame);
    }

    fn finish_attempt(&mut self) {
        self.deadline = None;
        self.attempt += 1;
    }

    fn is_active(&self) -> bool {
        matches!(
            self.state(),
            SocketState::Connecting | SocketState::Connected
        )
    }

    fn state(&self) -> SocketState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SocketState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "state changed");
        }
    }

    fn observer(&self) -> Option<Arc<E>> {
        let observer = self.observer.upgrade();
        if observer.is_none() {
            tracing::trace!("observer is gone, dropping notification");
        }
        observer
    }

    async fn notify_failure(&mut self, error: ConnectionError) {
        if let Some(observer) = self.observer() {
            if let Err(err) = observer.on_failure(&error).await {
                tracing::error!("error in on_failure: {err:?}");
            }
        }
    }
}

const MESSAGE_SESSION_STOPPED: &str =
    "called after the session task stopped. Check Shuttle::alive before calling";
