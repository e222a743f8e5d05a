//! In-memory fakes for driving the multiplexer without sockets or processes.

#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, broadcast, mpsc};

use xdmux_proxy::breakpoint::Breakpoint;
use xdmux_proxy::connection::{
    Connection, ConnectionError, ConnectionId, ConnectionStatus, ContinuationCommand,
    EvaluationResult, PropertyDescriptor, Scope, StackFrame, StackTrace, StatusEvent,
};
use xdmux_proxy::connector::{
    Connector, ConnectorError, ConnectorEvent, ConnectorKind, Handshake,
};
use xdmux_proxy::process::{LaunchError, ProcessHandle, ProcessLauncher};
use xdmux_proxy::transport::Transport;
use xdmux_proxy::MultiplexerStatus;

pub const DUMMY_FILE: &str = "php_only_xdebug_request.php";

/// Poll an async condition until it holds, failing after a few seconds.
macro_rules! wait_until {
    ($cond:expr) => {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if $cond {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect(concat!("timed out waiting for ", stringify!($cond)))
    };
}

/// Next status published by the multiplexer.
pub async fn next_status(rx: &mut broadcast::Receiver<MultiplexerStatus>) -> MultiplexerStatus {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for multiplexer status")
        .unwrap()
}

/// Give the dispatcher a moment to drain, for asserting that nothing happened.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// How a simulated peer answers during setup.
#[derive(Clone)]
pub struct PeerBehavior {
    pub initial_status: ConnectionStatus,
    pub stdout_redirected: bool,
    pub features_accepted: bool,
    /// The initial status query fails.
    pub status_fails: bool,
    /// Hold the stdout request until the gate is notified.
    pub gate: Option<Arc<Notify>>,
}

impl Default for PeerBehavior {
    fn default() -> Self {
        Self {
            initial_status: ConnectionStatus::Starting,
            stdout_redirected: true,
            features_accepted: true,
            status_fails: false,
            gate: None,
        }
    }
}

struct ConnectionState {
    subscribers: Vec<mpsc::UnboundedSender<StatusEvent>>,
    commands: Vec<String>,
    evaluation: EvaluationResult,
    frames: StackTrace,
    disposed: bool,
}

pub struct FakeConnection {
    id: ConnectionId,
    behavior: PeerBehavior,
    state: Mutex<ConnectionState>,
}

impl FakeConnection {
    fn new(id: ConnectionId, behavior: PeerBehavior) -> Self {
        Self {
            id,
            behavior,
            state: Mutex::new(ConnectionState {
                subscribers: Vec::new(),
                commands: Vec::new(),
                evaluation: EvaluationResult::value(serde_json::json!(42)),
                frames: StackTrace {
                    frames: vec![StackFrame {
                        index: 0,
                        function: "main".to_string(),
                        file: "/var/www/index.php".to_string(),
                        line: 3,
                    }],
                },
                disposed: false,
            }),
        }
    }

    /// Report a status to every subscriber.
    pub fn emit(&self, status: ConnectionStatus) {
        self.emit_event(StatusEvent::new(status));
    }

    pub fn emit_event(&self, event: StatusEvent) {
        let state = self.state.lock().unwrap();
        for tx in &state.subscribers {
            let _ = tx.send(event.clone());
        }
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands().iter().filter(|c| *c == command).count()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().unwrap().disposed
    }

    pub fn set_evaluation(&self, evaluation: EvaluationResult) {
        self.state.lock().unwrap().evaluation = evaluation;
    }

    fn record(&self, command: impl Into<String>) -> Result<(), ConnectionError> {
        let mut state = self.state.lock().unwrap();
        if state.disposed {
            return Err(ConnectionError::Closed);
        }
        state.commands.push(command.into());
        Ok(())
    }
}

#[async_trait]
impl Connection for FakeConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().subscribers.push(tx);
        rx
    }

    async fn status(&self) -> Result<ConnectionStatus, ConnectionError> {
        if self.behavior.status_fails {
            return Err(ConnectionError::Protocol("status query failed".to_string()));
        }
        Ok(self.behavior.initial_status)
    }

    async fn send_continuation_command(
        &self,
        command: ContinuationCommand,
    ) -> Result<(), ConnectionError> {
        self.record(command.as_str())
    }

    async fn send_break_command(&self) -> Result<bool, ConnectionError> {
        self.record("break")?;
        Ok(true)
    }

    async fn send_stdout_request(&self) -> Result<bool, ConnectionError> {
        if let Some(gate) = &self.behavior.gate {
            gate.notified().await;
        }
        self.record("stdout")?;
        Ok(self.behavior.stdout_redirected)
    }

    async fn send_stderr_request(&self) -> Result<bool, ConnectionError> {
        self.record("stderr")?;
        Ok(false)
    }

    async fn set_feature(&self, name: &str, value: &str) -> Result<bool, ConnectionError> {
        self.record(format!("feature_set {name} {value}"))?;
        Ok(self.behavior.features_accepted)
    }

    async fn runtime_evaluate(
        &self,
        frame_index: u32,
        expression: &str,
    ) -> Result<EvaluationResult, ConnectionError> {
        self.record(format!("eval {frame_index} {expression}"))?;
        Ok(self.state.lock().unwrap().evaluation.clone())
    }

    async fn evaluate_on_call_frame(
        &self,
        frame_index: u32,
        expression: &str,
    ) -> Result<EvaluationResult, ConnectionError> {
        self.record(format!("eval {frame_index} {expression}"))?;
        Ok(self.state.lock().unwrap().evaluation.clone())
    }

    async fn stack_frames(&self) -> Result<StackTrace, ConnectionError> {
        self.record("stack_get")?;
        Ok(self.state.lock().unwrap().frames.clone())
    }

    async fn scopes_for_frame(&self, frame_index: u32) -> Result<Vec<Scope>, ConnectionError> {
        self.record(format!("context_names {frame_index}"))?;
        Ok(vec![Scope {
            name: "Locals".to_string(),
            object_id: format!("{frame_index}.0"),
        }])
    }

    async fn properties(
        &self,
        object_id: &str,
    ) -> Result<Vec<PropertyDescriptor>, ConnectionError> {
        self.record(format!("property_get {object_id}"))?;
        Ok(Vec::new())
    }

    async fn set_breakpoint(&self, breakpoint: &Breakpoint) -> Result<String, ConnectionError> {
        self.record(format!("breakpoint_set {}:{}", breakpoint.file, breakpoint.line))?;
        Ok(format!("peer-{}", breakpoint.line))
    }

    async fn remove_breakpoint(&self, peer_breakpoint_id: &str) -> Result<(), ConnectionError> {
        self.record(format!("breakpoint_remove {peer_breakpoint_id}"))
    }

    fn dispose(&self) {
        let mut state = self.state.lock().unwrap();
        state.disposed = true;
        state.subscribers.clear();
    }
}

// ---------------------------------------------------------------------------
// Transport and connectors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct FakeSocket {
    pub name: String,
}

#[derive(Default)]
struct TransportState {
    senders: HashMap<ConnectorKind, mpsc::UnboundedSender<ConnectorEvent<FakeSocket>>>,
    listening: Vec<(ConnectorKind, u16)>,
    disposed_connectors: Vec<ConnectorKind>,
    connections: HashMap<String, Arc<FakeConnection>>,
    behaviors: HashMap<String, PeerBehavior>,
    rejected: Vec<(String, String)>,
    failing_listen: Option<ConnectorKind>,
}

#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial status the named peer reports when queried.
    pub fn set_initial_status(&self, name: &str, status: ConnectionStatus) {
        self.set_behavior(
            name,
            PeerBehavior {
                initial_status: status,
                ..PeerBehavior::default()
            },
        );
    }

    /// Behavior of the named peer once it connects.
    pub fn set_behavior(&self, name: &str, behavior: PeerBehavior) {
        self.state
            .lock()
            .unwrap()
            .behaviors
            .insert(name.to_string(), behavior);
    }

    /// The next `listen` of a `kind` connector fails to bind.
    pub fn fail_next_listen(&self, kind: ConnectorKind) {
        self.state.lock().unwrap().failing_listen = Some(kind);
    }

    /// A request peer running `/var/www/{name}.php` connects.
    pub fn connect_request(&self, kind: ConnectorKind, name: &str) {
        let raw = format!(r#"<init idekey="nuclide" fileuri="file:///var/www/{name}.php"/>"#);
        self.connect(kind, name, &raw);
    }

    pub fn connect_dummy(&self) {
        let raw = format!(r#"<init idekey="nuclide" fileuri="file:///opt/xdmux/{DUMMY_FILE}"/>"#);
        self.connect(ConnectorKind::Launch, "dummy", &raw);
    }

    pub fn connect(&self, kind: ConnectorKind, name: &str, raw: &str) {
        let handshake = Handshake::parse(raw).unwrap();
        let sender = self.state.lock().unwrap().senders.get(&kind).cloned();
        sender
            .expect("connector is not listening")
            .send(ConnectorEvent::Attach {
                kind,
                socket: FakeSocket {
                    name: name.to_string(),
                },
                handshake,
            })
            .unwrap();
    }

    pub fn close(&self, kind: ConnectorKind) {
        let sender = self.state.lock().unwrap().senders.get(&kind).cloned();
        sender.unwrap().send(ConnectorEvent::Close { kind }).unwrap();
    }

    pub fn error(&self, kind: ConnectorKind, message: &str) {
        let sender = self.state.lock().unwrap().senders.get(&kind).cloned();
        sender
            .unwrap()
            .send(ConnectorEvent::Error {
                kind,
                message: message.to_string(),
            })
            .unwrap();
    }

    pub fn connection(&self, name: &str) -> Option<Arc<FakeConnection>> {
        self.state.lock().unwrap().connections.get(name).cloned()
    }

    pub fn listening(&self) -> Vec<(ConnectorKind, u16)> {
        self.state.lock().unwrap().listening.clone()
    }

    pub fn disposed_connectors(&self) -> Vec<ConnectorKind> {
        self.state.lock().unwrap().disposed_connectors.clone()
    }

    pub fn rejected(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().rejected.clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    type Socket = FakeSocket;

    fn bind(
        &self,
        kind: ConnectorKind,
        port: u16,
        events: mpsc::UnboundedSender<ConnectorEvent<FakeSocket>>,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        Ok(Box::new(FakeConnector {
            kind,
            port,
            events,
            transport: self.clone(),
            disposed: false,
        }))
    }

    fn open(&self, id: ConnectionId, socket: FakeSocket) -> Arc<dyn Connection> {
        let mut state = self.state.lock().unwrap();
        let behavior = state
            .behaviors
            .get(&socket.name)
            .cloned()
            .unwrap_or_default();
        let connection = Arc::new(FakeConnection::new(id, behavior));
        state.connections.insert(socket.name, Arc::clone(&connection));
        connection
    }

    async fn reject(&self, socket: FakeSocket, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .rejected
            .push((socket.name, reason.to_string()));
    }
}

struct FakeConnector {
    kind: ConnectorKind,
    port: u16,
    events: mpsc::UnboundedSender<ConnectorEvent<FakeSocket>>,
    transport: FakeTransport,
    disposed: bool,
}

#[async_trait]
impl Connector for FakeConnector {
    fn kind(&self) -> ConnectorKind {
        self.kind
    }

    fn port(&self) -> u16 {
        self.port
    }

    async fn listen(&mut self) -> Result<(), ConnectorError> {
        let mut state = self.transport.state.lock().unwrap();
        if state.failing_listen == Some(self.kind) {
            state.failing_listen = None;
            return Err(ConnectorError::Bind {
                port: self.port,
                reason: "address in use".to_string(),
            });
        }
        state.senders.insert(self.kind, self.events.clone());
        state.listening.push((self.kind, self.port));
        Ok(())
    }

    fn dispose(&mut self) {
        if !self.disposed {
            self.disposed = true;
            self.transport
                .state
                .lock()
                .unwrap()
                .disposed_connectors
                .push(self.kind);
        }
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

pub struct FakeProcess {
    killed: Arc<AtomicBool>,
}

impl ProcessHandle for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    fn kill(&mut self) {
        self.killed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct LauncherState {
    dummy_requests: Vec<u16>,
    scripts: Vec<(String, u16)>,
    output: Option<mpsc::UnboundedSender<String>>,
}

#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<LauncherState>>,
    script_killed: Arc<AtomicBool>,
    dummy_killed: Arc<AtomicBool>,
    fail_script: bool,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_script() -> Self {
        Self {
            fail_script: true,
            ..Self::default()
        }
    }

    pub fn dummy_requests(&self) -> Vec<u16> {
        self.state.lock().unwrap().dummy_requests.clone()
    }

    pub fn scripts(&self) -> Vec<(String, u16)> {
        self.state.lock().unwrap().scripts.clone()
    }

    /// Print a line on the launched script's stdout.
    pub fn script_prints(&self, line: &str) {
        let state = self.state.lock().unwrap();
        state
            .output
            .as_ref()
            .expect("no script launched")
            .send(line.to_string())
            .unwrap();
    }

    pub fn script_killed(&self) -> bool {
        self.script_killed.load(Ordering::SeqCst)
    }

    pub fn dummy_killed(&self) -> bool {
        self.dummy_killed.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for FakeLauncher {
    fn send_dummy_request(&self, port: u16) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        self.state.lock().unwrap().dummy_requests.push(port);
        Ok(Box::new(FakeProcess {
            killed: Arc::clone(&self.dummy_killed),
        }))
    }

    fn launch_script(
        &self,
        script: &str,
        port: u16,
        output: mpsc::UnboundedSender<String>,
    ) -> Result<Box<dyn ProcessHandle>, LaunchError> {
        if self.fail_script {
            return Err(LaunchError::SpawnFailed {
                reason: "no such runtime".to_string(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.scripts.push((script.to_string(), port));
        state.output = Some(output);
        Ok(Box::new(FakeProcess {
            killed: Arc::clone(&self.script_killed),
        }))
    }
}
