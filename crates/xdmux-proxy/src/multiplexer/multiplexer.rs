//! Connection multiplexer: makes the xdebug connections of one debugged
//! process look like a single connection to the debugger UI.
//!
//! Initialization:
//! - construct, then subscribe with [`ConnectionMultiplexer::on_status`]
//! - initial breakpoints may be added through the breakpoint store
//! - [`ConnectionMultiplexer::listen`] starts accepting peers
//!
//! Once listening the multiplexer is running (all connections running, or
//! none at all), break-disabled (some connection broke, none enabled yet; it
//! immediately enables one), or break-enabled (exactly one connection is
//! shown in the UI and receives every command).
//!
//! Connector events and per-connection status notifications are consumed by
//! a single dispatcher task, so state transitions never interleave. Peer
//! requests run outside the state lock and handlers re-read state afterwards.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use super::state::{Effect, MuxState};
use super::types::{MultiplexerConfig, MultiplexerError, MultiplexerStatus};
use crate::breakpoint::{BreakpointId, BreakpointStore};
use crate::callback::{Channel, ClientCallback, Level, UserMessage};
use crate::connection::{
    Connection, ConnectionId, ConnectionStatus, ContinuationCommand, EvaluationResult,
    PropertyDescriptor, Scope, StackTrace, StatusEvent,
};
use crate::connector::{Connector, ConnectorEvent, ConnectorKind, Handshake};
use crate::process::{ProcessHandle, ProcessLauncher};
use crate::transport::Transport;

const PRELOAD_WAIT_MESSAGE: &str = "Pre-loading, please wait...";
const PRELOAD_DONE_MESSAGE: &str = "Pre-loading is done! You can use console window now.";
const STDOUT_FAILED_MESSAGE: &str =
    "HHVM failed to redirect stdout, so no output will be sent to the output window.";

/// Protocol features set on every new connection.
const FEATURES: [(&str, &str); 2] = [
    // Depth the engine respects when returning hierarchical data.
    ("max_depth", "5"),
    // Allows reading private class members.
    ("show_hidden", "1"),
];

/// Frame used for frame-independent evaluation on the dummy connection.
const GLOBAL_FRAME: u32 = 0;

enum MuxEvent {
    Admitted {
        connection: Arc<dyn Connection>,
        events: mpsc::UnboundedReceiver<StatusEvent>,
    },
    DummyReady {
        connection: Arc<dyn Connection>,
        events: mpsc::UnboundedReceiver<StatusEvent>,
    },
    Status {
        id: ConnectionId,
        event: StatusEvent,
    },
    ScriptLaunched,
}

struct PeerHandle {
    connection: Arc<dyn Connection>,
    subscription: AbortHandle,
}

impl PeerHandle {
    fn release(self) {
        self.subscription.abort();
        self.connection.dispose();
    }
}

struct Shared {
    state: MuxState,
    peers: HashMap<ConnectionId, PeerHandle>,
    dummy: Option<PeerHandle>,
    attach_connector: Option<Box<dyn Connector>>,
    launch_connector: Option<Box<dyn Connector>>,
    dummy_request: Option<Box<dyn ProcessHandle>>,
    launched_script: Option<Box<dyn ProcessHandle>>,
    listening: bool,
}

impl Shared {
    fn new(end_when_idle: bool) -> Self {
        Self {
            state: MuxState::new(end_when_idle),
            peers: HashMap::new(),
            dummy: None,
            attach_connector: None,
            launch_connector: None,
            dummy_request: None,
            launched_script: None,
            listening: false,
        }
    }
}

struct Inner<T: Transport> {
    config: MultiplexerConfig,
    transport: T,
    launcher: Arc<dyn ProcessLauncher>,
    callback: Arc<dyn ClientCallback>,
    breakpoints: BreakpointStore,
    shared: RwLock<Shared>,
    status_tx: broadcast::Sender<MultiplexerStatus>,
    events_tx: mpsc::UnboundedSender<MuxEvent>,
    connector_tx: mpsc::UnboundedSender<ConnectorEvent<T::Socket>>,
    next_id: AtomicU64,
}

/// Multiplexes request connections (plus one dummy evaluation connection)
/// into a single debugger connection.
pub struct ConnectionMultiplexer<T: Transport> {
    inner: Arc<Inner<T>>,
    dispatcher: JoinHandle<()>,
}

impl<T: Transport> ConnectionMultiplexer<T> {
    /// Create a multiplexer. Must be called within a Tokio runtime.
    pub fn new(
        config: MultiplexerConfig,
        transport: T,
        launcher: Arc<dyn ProcessLauncher>,
        callback: Arc<dyn ClientCallback>,
    ) -> Self {
        let (status_tx, _) = broadcast::channel(config.status_capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (connector_tx, connector_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            shared: RwLock::new(Shared::new(config.end_debug_when_no_requests)),
            config,
            transport,
            launcher,
            callback,
            breakpoints: BreakpointStore::new(),
            status_tx,
            events_tx,
            connector_tx,
            next_id: AtomicU64::new(1),
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&inner), events_rx, connector_rx));

        Self { inner, dispatcher }
    }

    /// Subscribe to multiplexer status transitions.
    ///
    /// The channel retains the last `status_capacity` transitions. A
    /// receiver that falls further behind gets `RecvError::Lagged` and
    /// resumes at the oldest retained status; [`Self::status`] always
    /// reports the current one.
    pub fn on_status(&self) -> broadcast::Receiver<MultiplexerStatus> {
        self.inner.status_tx.subscribe()
    }

    pub async fn status(&self) -> MultiplexerStatus {
        self.inner.shared.read().await.state.status()
    }

    /// Start both connectors, then kick off pre-loading and, in script mode,
    /// the script itself.
    pub async fn listen(&self) -> Result<(), MultiplexerError> {
        let inner = &self.inner;
        let config = &inner.config;
        {
            let mut shared = inner.shared.write().await;
            if shared.listening {
                return Err(MultiplexerError::AlreadyListening);
            }
            shared.listening = true;
        }

        // Nothing is bound after a failure, so a later call may retry.
        let (attach, launch) = match inner.start_connectors().await {
            Ok(connectors) => connectors,
            Err(e) => {
                inner.shared.write().await.listening = false;
                return Err(e);
            }
        };

        {
            let mut shared = inner.shared.write().await;
            let attach_open = attach.is_some();
            shared.attach_connector = attach;
            shared.launch_connector = Some(launch);
            let effects = shared.state.start(attach_open);
            inner.apply(&mut shared, effects);
        }
        info!(
            attach_port = config.attach_port,
            launching_port = config.launching_port,
            script = ?config.launch_script,
            "Multiplexer listening"
        );

        let wait = UserMessage::text(Level::Warning, PRELOAD_WAIT_MESSAGE);
        inner.callback.send_user_message(Channel::Console, wait.clone());
        inner.callback.send_user_message(Channel::OutputWindow, wait);

        match inner.launcher.send_dummy_request(config.launching_port) {
            Ok(process) => inner.shared.write().await.dummy_request = Some(process),
            Err(e) => {
                warn!(error = %e, "Failed to send dummy request");
                inner.callback.send_user_message(
                    Channel::OutputWindow,
                    UserMessage::text(Level::Error, format!("Pre-loading failed: {e}")),
                );
            }
        }

        if let Some(script) = &config.launch_script {
            inner.launch_script(script).await?;
        }
        Ok(())
    }

    /// Evaluate an expression in global scope on the dummy connection.
    pub async fn runtime_evaluate(
        &self,
        expression: &str,
    ) -> Result<EvaluationResult, MultiplexerError> {
        debug!(expression, "runtime_evaluate on dummy connection");
        let dummy = self.dummy().await.ok_or(MultiplexerError::NoConnection)?;
        let result = dummy.runtime_evaluate(GLOBAL_FRAME, expression).await?;
        self.report_evaluation_failure(expression, &result);
        Ok(result)
    }

    pub async fn evaluate_on_call_frame(
        &self,
        frame_index: u32,
        expression: &str,
    ) -> Result<EvaluationResult, MultiplexerError> {
        let enabled = self.enabled().await.ok_or(MultiplexerError::NoConnection)?;
        let result = enabled.evaluate_on_call_frame(frame_index, expression).await?;
        self.report_evaluation_failure(expression, &result);
        Ok(result)
    }

    /// Stack of the enabled connection; empty while none is enabled (e.g.
    /// still at the loader breakpoint).
    pub async fn stack_frames(&self) -> Result<StackTrace, MultiplexerError> {
        match self.enabled().await {
            Some(enabled) => Ok(enabled.stack_frames().await?),
            None => Ok(StackTrace::default()),
        }
    }

    pub async fn scopes_for_frame(&self, frame_index: u32) -> Result<Vec<Scope>, MultiplexerError> {
        let enabled = self.enabled().await.ok_or(MultiplexerError::NoConnection)?;
        Ok(enabled.scopes_for_frame(frame_index).await?)
    }

    /// Properties of a remote object: from the enabled connection while in
    /// break, otherwise from the dummy connection.
    pub async fn properties(
        &self,
        object_id: &str,
    ) -> Result<Vec<PropertyDescriptor>, MultiplexerError> {
        let target = {
            let shared = self.inner.shared.read().await;
            let enabled = if shared.state.status() == MultiplexerStatus::Break {
                shared.state.enabled().and_then(|id| shared.peers.get(&id))
            } else {
                None
            };
            enabled
                .or(shared.dummy.as_ref())
                .map(|peer| Arc::clone(&peer.connection))
        };
        let target = target.ok_or(MultiplexerError::NoConnection)?;
        Ok(target.properties(object_id).await?)
    }

    pub async fn send_continuation_command(
        &self,
        command: ContinuationCommand,
    ) -> Result<(), MultiplexerError> {
        let enabled = self.enabled().await.ok_or(MultiplexerError::NoConnection)?;
        debug!(connection_id = %enabled.id(), %command, "Forwarding continuation command");
        Ok(enabled.send_continuation_command(command).await?)
    }

    /// Ask the enabled connection to break. `false` when nothing is enabled.
    pub async fn send_break_command(&self) -> Result<bool, MultiplexerError> {
        match self.enabled().await {
            Some(enabled) => Ok(enabled.send_break_command().await?),
            None => Ok(false),
        }
    }

    /// Set when the enabled connection differs from the previously enabled one.
    pub async fn request_switch_message(&self) -> Option<String> {
        self.inner
            .shared
            .read()
            .await
            .state
            .request_switch_message()
            .map(str::to_string)
    }

    pub async fn reset_request_switch_message(&self) {
        self.inner
            .shared
            .write()
            .await
            .state
            .reset_request_switch_message();
    }

    pub fn breakpoint_store(&self) -> &BreakpointStore {
        &self.inner.breakpoints
    }

    pub async fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), MultiplexerError> {
        Ok(self.inner.breakpoints.remove_breakpoint(id).await?)
    }

    pub async fn enabled_connection_id(&self) -> Option<ConnectionId> {
        self.inner.shared.read().await.state.enabled()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.shared.read().await.state.connection_count()
    }

    pub async fn has_dummy_connection(&self) -> bool {
        self.inner.shared.read().await.dummy.is_some()
    }

    /// Tear everything down: processes, connections, connectors.
    pub async fn dispose(&self) {
        let inner = &self.inner;
        let disposed = {
            let mut shared = inner.shared.write().await;
            if let Some(mut script) = shared.launched_script.take() {
                script.kill();
            }
            let effects = shared.state.dispose();
            let disposed = inner.apply(&mut shared, effects);
            if let Some(mut process) = shared.dummy_request.take() {
                process.kill();
            }
            if let Some(dummy) = shared.dummy.take() {
                dummy.release();
            }
            if let Some(mut connector) = shared.launch_connector.take() {
                connector.dispose();
            }
            if let Some(mut connector) = shared.attach_connector.take() {
                connector.dispose();
            }
            disposed
        };
        inner.forget(disposed).await;
        // The dispatcher keeps draining so connections still in setup reach
        // the end-of-session guard and get released.
        info!("Multiplexer disposed");
    }

    async fn enabled(&self) -> Option<Arc<dyn Connection>> {
        let shared = self.inner.shared.read().await;
        shared
            .state
            .enabled()
            .and_then(|id| shared.peers.get(&id))
            .map(|peer| Arc::clone(&peer.connection))
    }

    async fn dummy(&self) -> Option<Arc<dyn Connection>> {
        let shared = self.inner.shared.read().await;
        shared.dummy.as_ref().map(|peer| Arc::clone(&peer.connection))
    }

    fn report_evaluation_failure(&self, expression: &str, result: &EvaluationResult) {
        if !result.was_thrown {
            return;
        }
        let (code, message) = result
            .error
            .as_ref()
            .map_or((0, ""), |e| (e.code, e.message.as_str()));
        let failure = UserMessage::text(
            Level::Error,
            format!("Failed to evaluate \"{expression}\": ({code}) {message}"),
        );
        self.inner
            .callback
            .send_user_message(Channel::Console, failure.clone());
        self.inner
            .callback
            .send_user_message(Channel::OutputWindow, failure);
    }
}

impl<T: Transport> Drop for ConnectionMultiplexer<T> {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch<T: Transport>(
    inner: Arc<Inner<T>>,
    mut events: mpsc::UnboundedReceiver<MuxEvent>,
    mut connector_events: mpsc::UnboundedReceiver<ConnectorEvent<T::Socket>>,
) {
    loop {
        tokio::select! {
            Some(event) = connector_events.recv() => inner.handle_connector_event(event).await,
            Some(event) = events.recv() => inner.handle_event(event).await,
            else => break,
        }
    }
    debug!("Multiplexer dispatcher finished");
}

impl<T: Transport> Inner<T> {
    async fn start_connectors(
        &self,
    ) -> Result<(Option<Box<dyn Connector>>, Box<dyn Connector>), MultiplexerError> {
        let config = &self.config;
        let attach = if config.launch_script.is_none() {
            // Attach mode needs a separate port for the dummy connection.
            if config.attach_port == config.launching_port {
                return Err(MultiplexerError::InvalidConfig(format!(
                    "attach and launching ports are both {} in attach mode",
                    config.attach_port
                )));
            }
            Some(
                self.start_connector(ConnectorKind::Attach, config.attach_port)
                    .await?,
            )
        } else {
            None
        };

        // In script mode the dummy port also receives the script's connection.
        match self
            .start_connector(ConnectorKind::Launch, config.launching_port)
            .await
        {
            Ok(launch) => Ok((attach, launch)),
            Err(e) => {
                if let Some(mut attach) = attach {
                    attach.dispose();
                }
                Err(e)
            }
        }
    }

    async fn start_connector(
        &self,
        kind: ConnectorKind,
        port: u16,
    ) -> Result<Box<dyn Connector>, MultiplexerError> {
        let mut connector = self.transport.bind(kind, port, self.connector_tx.clone())?;
        connector.listen().await?;
        Ok(connector)
    }

    async fn launch_script(&self, script: &str) -> Result<(), MultiplexerError> {
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        self.shared.write().await.state.mark_script_pending();

        match self
            .launcher
            .launch_script(script, self.config.launching_port, output_tx)
        {
            Ok(process) => {
                self.shared.write().await.launched_script = Some(process);
                spawn_script_output(output_rx, Arc::clone(&self.callback), self.events_tx.clone());
                Ok(())
            }
            Err(e) => {
                error!(script, error = %e, "Failed to launch script");
                let _ = self.events_tx.send(MuxEvent::ScriptLaunched);
                Err(e.into())
            }
        }
    }

    async fn handle_connector_event(self: &Arc<Self>, event: ConnectorEvent<T::Socket>) {
        match event {
            ConnectorEvent::Attach {
                kind,
                socket,
                handshake,
            } => self.on_attach(kind, socket, &handshake).await,
            ConnectorEvent::Close { kind } => self.on_connector_closed(kind).await,
            ConnectorEvent::Error { kind, message } => {
                warn!(%kind, %message, "Connector error");
                self.callback.send_user_message(
                    Channel::Notification,
                    UserMessage::error_notification(message),
                );
            }
        }
    }

    async fn on_attach(self: &Arc<Self>, kind: ConnectorKind, socket: T::Socket, handshake: &Handshake) {
        if !handshake.is_correct(self.config.idekey.as_deref()) {
            self.spawn_reject(socket, format!("Discarding connection {}", handshake.raw));
            return;
        }
        if self.shared.read().await.state.status() == MultiplexerStatus::End {
            self.spawn_reject(socket, "Debugging session has ended".to_string());
            return;
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let connection = self.transport.open(id, socket);
        let inner = Arc::clone(self);
        if handshake.is_dummy(&self.config.dummy_request_file) {
            info!(connection_id = %id, %kind, "Got dummy connection");
            tokio::spawn(inner.setup_dummy(connection));
        } else {
            info!(connection_id = %id, %kind, appid = ?handshake.appid(), "Got request connection");
            tokio::spawn(inner.setup_request(connection));
        }
    }

    fn spawn_reject(self: &Arc<Self>, socket: T::Socket, reason: String) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.transport.reject(socket, &reason).await;
        });
    }

    async fn setup_request(self: Arc<Self>, connection: Arc<dyn Connection>) {
        let id = connection.id();
        self.breakpoints.add_connection(Arc::clone(&connection)).await;
        setup_connection(connection.as_ref(), self.callback.as_ref()).await;

        let events = connection.subscribe();
        let admitted = MuxEvent::Admitted {
            connection: Arc::clone(&connection),
            events,
        };
        if self.events_tx.send(admitted).is_err() {
            debug!(connection_id = %id, "Multiplexer gone during setup, dropping connection");
            connection.dispose();
            self.breakpoints.remove_connection(id).await;
            return;
        }

        let status = match connection.status().await {
            Ok(status) => status,
            Err(e) => {
                error!(connection_id = %id, error = %e, "Error getting initial connection status");
                ConnectionStatus::Error
            }
        };
        let _ = self.events_tx.send(MuxEvent::Status {
            id,
            event: StatusEvent::new(status),
        });
    }

    async fn setup_dummy(self: Arc<Self>, connection: Arc<dyn Connection>) {
        setup_connection(connection.as_ref(), self.callback.as_ref()).await;

        // Run past the loader breakpoint so the runtime loads the codebase
        // and stops somewhere evaluable.
        if let Err(e) = connection
            .send_continuation_command(ContinuationCommand::Run)
            .await
        {
            warn!(connection_id = %connection.id(), error = %e, "Dummy connection failed to continue");
        }

        let events = connection.subscribe();
        if let Err(mpsc::error::SendError(event)) = self
            .events_tx
            .send(MuxEvent::DummyReady { connection, events })
            && let MuxEvent::DummyReady { connection, .. } = event
        {
            connection.dispose();
        }
    }

    async fn handle_event(self: &Arc<Self>, event: MuxEvent) {
        match event {
            MuxEvent::Admitted { connection, events } => self.on_admitted(connection, events).await,
            MuxEvent::DummyReady { connection, events } => {
                self.on_dummy_ready(connection, events).await;
            }
            MuxEvent::Status { id, event } => {
                debug!(connection_id = %id, status = %event.status, "Mux got status");
                let disposed = {
                    let mut shared = self.shared.write().await;
                    let effects = shared.state.on_status(id, &event);
                    self.apply(&mut shared, effects)
                };
                self.forget(disposed).await;
            }
            MuxEvent::ScriptLaunched => {
                let mut shared = self.shared.write().await;
                let effects = shared.state.script_launched();
                self.apply(&mut shared, effects);
            }
        }
    }

    async fn on_admitted(
        &self,
        connection: Arc<dyn Connection>,
        events: mpsc::UnboundedReceiver<StatusEvent>,
    ) {
        let id = connection.id();
        let mut shared = self.shared.write().await;
        if shared.state.status() == MultiplexerStatus::End {
            drop(shared);
            debug!(connection_id = %id, "Session ended during setup, dropping connection");
            connection.dispose();
            self.breakpoints.remove_connection(id).await;
            return;
        }

        let subscription = forward_status(id, events, self.events_tx.clone());
        shared.state.admit(id);
        shared.peers.insert(
            id,
            PeerHandle {
                connection,
                subscription,
            },
        );
    }

    async fn on_dummy_ready(
        &self,
        connection: Arc<dyn Connection>,
        mut events: mpsc::UnboundedReceiver<StatusEvent>,
    ) {
        let mut shared = self.shared.write().await;
        if shared.state.status() == MultiplexerStatus::End {
            drop(shared);
            debug!(connection_id = %connection.id(), "Session ended during setup, dropping dummy connection");
            connection.dispose();
            return;
        }

        let callback = Arc::clone(&self.callback);
        let output = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let level = match event.status {
                    ConnectionStatus::Stdout => Level::Log,
                    ConnectionStatus::Stderr => Level::Info,
                    _ => continue,
                };
                callback.send_user_message(
                    Channel::OutputWindow,
                    UserMessage::text(level, event.message.unwrap_or_default()),
                );
            }
        })
        .abort_handle();

        let previous = shared.dummy.replace(PeerHandle {
            connection,
            subscription: output,
        });
        drop(shared);
        if let Some(previous) = previous {
            warn!(connection_id = %previous.connection.id(), "Replacing dummy connection");
            previous.release();
        }

        self.callback.send_user_message(
            Channel::Console,
            UserMessage::text(Level::Warning, PRELOAD_DONE_MESSAGE),
        );
        self.callback.send_user_message(
            Channel::OutputWindow,
            UserMessage::text(Level::Success, PRELOAD_DONE_MESSAGE),
        );
    }

    async fn on_connector_closed(&self, kind: ConnectorKind) {
        info!(%kind, "Connector closed");
        let disposed = {
            let mut shared = self.shared.write().await;
            let slot = match kind {
                ConnectorKind::Attach => &mut shared.attach_connector,
                ConnectorKind::Launch => &mut shared.launch_connector,
            };
            // Clear the slot first; disposing may report another close.
            if let Some(mut connector) = slot.take() {
                connector.dispose();
            }
            let effects = shared.state.connector_closed(kind);
            self.apply(&mut shared, effects)
        };
        self.forget(disposed).await;
    }

    /// Carry out state-machine effects; returns the connections released.
    fn apply(&self, shared: &mut Shared, effects: Vec<Effect>) -> Vec<ConnectionId> {
        let mut disposed = Vec::new();
        for effect in effects {
            match effect {
                Effect::Continue(id) => {
                    if let Some(peer) = shared.peers.get(&id) {
                        let connection = Arc::clone(&peer.connection);
                        tokio::spawn(async move {
                            if let Err(e) = connection
                                .send_continuation_command(ContinuationCommand::Run)
                                .await
                            {
                                warn!(connection_id = %connection.id(), error = %e, "Failed to continue connection");
                            }
                        });
                    }
                }
                Effect::Emit(status) => {
                    info!(%status, "Multiplexer status");
                    let _ = self.status_tx.send(status);
                }
                Effect::Output { level, text } => {
                    self.callback
                        .send_user_message(Channel::OutputWindow, UserMessage::text(level, text));
                }
                Effect::Notify(message) => {
                    self.callback.send_user_message(
                        Channel::Notification,
                        UserMessage::error_notification(message),
                    );
                }
                Effect::Dispose(id) => {
                    if let Some(peer) = shared.peers.remove(&id) {
                        debug!(connection_id = %id, "Removing connection");
                        peer.release();
                        disposed.push(id);
                    }
                }
            }
        }
        disposed
    }

    async fn forget(&self, disposed: Vec<ConnectionId>) {
        for id in disposed {
            self.breakpoints.remove_connection(id).await;
        }
    }
}

/// Bring a fresh connection into a known feature configuration. Peer
/// failures only degrade the session.
async fn setup_connection(connection: &dyn Connection, callback: &dyn ClientCallback) {
    let id = connection.id();
    let stdout_redirected = connection.send_stdout_request().await.unwrap_or_else(|e| {
        warn!(connection_id = %id, error = %e, "stdout request failed");
        false
    });
    if !stdout_redirected {
        error!(connection_id = %id, "Peer returned failure for a stdout request");
        callback.send_user_message(
            Channel::OutputWindow,
            UserMessage::text(Level::Error, STDOUT_FAILED_MESSAGE),
        );
    }

    // The runtime does not implement stderr redirection; the result is ignored.
    if let Err(e) = connection.send_stderr_request().await {
        debug!(connection_id = %id, error = %e, "stderr request failed");
    }

    for (name, value) in FEATURES {
        match connection.set_feature(name, value).await {
            Ok(true) => {}
            Ok(false) => {
                error!(connection_id = %id, feature = name, "Peer returned failure for setting feature");
            }
            Err(e) => {
                warn!(connection_id = %id, feature = name, error = %e, "Failed to set feature");
            }
        }
    }
}

fn forward_status(
    id: ConnectionId,
    mut events: mpsc::UnboundedReceiver<StatusEvent>,
    tx: mpsc::UnboundedSender<MuxEvent>,
) -> AbortHandle {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if tx.send(MuxEvent::Status { id, event }).is_err() {
                break;
            }
        }
    })
    .abort_handle()
}

/// Forward launched-script output; the first line (or EOF) marks the script
/// as started.
fn spawn_script_output(
    mut output: mpsc::UnboundedReceiver<String>,
    callback: Arc<dyn ClientCallback>,
    events_tx: mpsc::UnboundedSender<MuxEvent>,
) {
    tokio::spawn(async move {
        let mut launched = false;
        while let Some(line) = output.recv().await {
            callback.send_user_message(Channel::OutputWindow, UserMessage::text(Level::Info, line));
            if !launched {
                launched = true;
                let _ = events_tx.send(MuxEvent::ScriptLaunched);
            }
        }
        if !launched {
            let _ = events_tx.send(MuxEvent::ScriptLaunched);
        }
    });
}
