//! Multiplexer state machine.
//!
//! Pure bookkeeping: every input returns the [`Effect`]s the async shell must
//! carry out, in order. Only one connection is ever enabled, and the
//! multiplexer is in `Break` exactly while that connection's recorded status
//! is `Break`.

use std::collections::BTreeMap;

use tracing::{debug, info};

use super::types::MultiplexerStatus;
use crate::callback::Level;
use crate::connection::{ConnectionId, ConnectionStatus, StatusEvent};
use crate::connector::ConnectorKind;

pub const REQUEST_SWITCH_MESSAGE: &str = "Active request switched";

const CONNECTION_ERROR_MESSAGE: &str =
    "The debugger encountered a problem and the connection had to be shut down.";

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Send `run` to the connection.
    Continue(ConnectionId),
    /// Publish a multiplexer status transition.
    Emit(MultiplexerStatus),
    /// Forward peer output to the output window.
    Output { level: Level, text: String },
    /// Show an error notification.
    Notify(String),
    /// Drop the subscription and release the connection.
    Dispose(ConnectionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Last status the peer reported.
    pub status: ConnectionStatus,
}

#[derive(Debug)]
pub struct MuxState {
    status: MultiplexerStatus,
    /// Ordered by id, so arbitration prefers the earliest-accepted peer.
    records: BTreeMap<ConnectionId, ConnectionRecord>,
    enabled: Option<ConnectionId>,
    previous: Option<ConnectionId>,
    request_switch: Option<String>,
    attach_open: bool,
    launch_open: bool,
    end_when_idle: bool,
    script_pending: bool,
    end_deferred: bool,
}

impl MuxState {
    pub const fn new(end_when_idle: bool) -> Self {
        Self {
            status: MultiplexerStatus::Starting,
            records: BTreeMap::new(),
            enabled: None,
            previous: None,
            request_switch: None,
            attach_open: false,
            launch_open: false,
            end_when_idle,
            script_pending: false,
            end_deferred: false,
        }
    }

    pub const fn status(&self) -> MultiplexerStatus {
        self.status
    }

    pub const fn enabled(&self) -> Option<ConnectionId> {
        self.enabled
    }

    pub fn request_switch_message(&self) -> Option<&str> {
        self.request_switch.as_deref()
    }

    pub fn reset_request_switch_message(&mut self) {
        self.request_switch = None;
    }

    pub fn connection_count(&self) -> usize {
        self.records.len()
    }

    pub fn recorded_status(&self, id: ConnectionId) -> Option<ConnectionStatus> {
        self.records.get(&id).map(|r| r.status)
    }

    /// Connectors are listening: `Starting` -> `Running`.
    pub fn start(&mut self, attach_open: bool) -> Vec<Effect> {
        self.attach_open = attach_open;
        self.launch_open = true;
        let mut effects = Vec::new();
        self.set_status(MultiplexerStatus::Running, &mut effects);
        effects
    }

    /// A launched script must print its first line before the session may end.
    pub const fn mark_script_pending(&mut self) {
        self.script_pending = true;
    }

    pub fn script_launched(&mut self) -> Vec<Effect> {
        self.script_pending = false;
        let mut effects = Vec::new();
        if std::mem::take(&mut self.end_deferred) {
            self.check_end(&mut effects);
        }
        effects
    }

    /// Record a newly accepted connection. Ids are never reused.
    pub fn admit(&mut self, id: ConnectionId) {
        self.records.entry(id).or_insert(ConnectionRecord {
            status: ConnectionStatus::Starting,
        });
    }

    /// Handle one status notification from a request connection.
    pub fn on_status(&mut self, id: ConnectionId, event: &StatusEvent) -> Vec<Effect> {
        let mut effects = Vec::new();
        let is_enabled = self.enabled == Some(id);
        let Some(record) = self.records.get_mut(&id) else {
            debug!(connection_id = %id, status = %event.status, "Status for unknown connection");
            return effects;
        };

        match event.status {
            ConnectionStatus::Starting | ConnectionStatus::Stopping => {
                // Step past the loader breakpoint; no post-mortem support.
                record.status = event.status;
                effects.push(Effect::Continue(id));
                if !is_enabled {
                    return effects;
                }
                self.disable(&mut effects);
            }
            ConnectionStatus::Running => {
                record.status = event.status;
                if is_enabled {
                    self.disable(&mut effects);
                }
            }
            ConnectionStatus::Break => {
                record.status = event.status;
                if is_enabled {
                    // Happens after a step.
                    debug!(connection_id = %id, "Break on enabled connection");
                    effects.push(Effect::Emit(MultiplexerStatus::Break));
                    return effects;
                }
            }
            ConnectionStatus::Error => {
                record.status = event.status;
                let message = match &event.message {
                    Some(detail) => format!("{CONNECTION_ERROR_MESSAGE}  Error message: {detail}"),
                    None => CONNECTION_ERROR_MESSAGE.to_string(),
                };
                effects.push(Effect::Notify(message));
                self.remove_into(id, &mut effects);
            }
            ConnectionStatus::Stopped | ConnectionStatus::End => {
                record.status = event.status;
                self.remove_into(id, &mut effects);
            }
            ConnectionStatus::Stdout => effects.push(Effect::Output {
                level: Level::Log,
                text: event.message.clone().unwrap_or_default(),
            }),
            ConnectionStatus::Stderr => effects.push(Effect::Output {
                level: Level::Info,
                text: event.message.clone().unwrap_or_default(),
            }),
        }

        self.arbitrate(&mut effects);
        effects
    }

    /// A connector stopped listening.
    pub fn connector_closed(&mut self, kind: ConnectorKind) -> Vec<Effect> {
        match kind {
            ConnectorKind::Attach => self.attach_open = false,
            ConnectorKind::Launch => self.launch_open = false,
        }
        let mut effects = Vec::new();
        self.check_end(&mut effects);
        effects
    }

    /// Remove every connection and close both connectors.
    pub fn dispose(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.script_pending = false;
        self.end_deferred = false;

        let ids: Vec<_> = self.records.keys().copied().collect();
        for id in ids {
            self.remove_into(id, &mut effects);
        }
        effects.extend(self.connector_closed(ConnectorKind::Launch));
        effects.extend(self.connector_closed(ConnectorKind::Attach));
        effects
    }

    fn remove_into(&mut self, id: ConnectionId, effects: &mut Vec<Effect>) {
        if self.records.remove(&id).is_none() {
            return;
        }
        effects.push(Effect::Dispose(id));
        if self.enabled == Some(id) {
            self.disable(effects);
        }
        self.check_end(effects);
    }

    fn arbitrate(&mut self, effects: &mut Vec<Effect>) {
        match self.status {
            MultiplexerStatus::End => return,
            MultiplexerStatus::Break => {
                debug!("Already in break status");
                return;
            }
            _ => {}
        }

        let candidate = self
            .records
            .iter()
            .find(|(_, record)| record.status == ConnectionStatus::Break)
            .map(|(id, _)| *id);
        if let Some(id) = candidate {
            self.enable(id, effects);
        }
    }

    fn enable(&mut self, id: ConnectionId, effects: &mut Vec<Effect>) {
        info!(connection_id = %id, "Enabling connection");
        self.enabled = Some(id);
        if self.previous.is_some_and(|previous| previous != id) {
            self.request_switch = Some(REQUEST_SWITCH_MESSAGE.to_string());
        }
        self.previous = Some(id);
        self.set_status(MultiplexerStatus::Break, effects);
    }

    fn disable(&mut self, effects: &mut Vec<Effect>) {
        info!(connection_id = ?self.enabled, "Disabling connection");
        self.enabled = None;
        if self.status == MultiplexerStatus::Break {
            self.set_status(MultiplexerStatus::Running, effects);
        }
    }

    fn check_end(&mut self, effects: &mut Vec<Effect>) {
        if self.status == MultiplexerStatus::End || !self.records.is_empty() {
            return;
        }
        if self.attach_open && self.launch_open && !self.end_when_idle {
            return;
        }
        if self.script_pending {
            debug!("Deferring end until the launched script starts");
            self.end_deferred = true;
            return;
        }
        self.set_status(MultiplexerStatus::End, effects);
    }

    fn set_status(&mut self, status: MultiplexerStatus, effects: &mut Vec<Effect>) {
        if self.status == status || self.status == MultiplexerStatus::End {
            return;
        }
        self.status = status;
        effects.push(Effect::Emit(status));
    }
}
