//! Breakpoint bookkeeping shared by every request connection.
//!
//! New connections are registered here so they receive the current
//! breakpoint set; breakpoint changes fan out to all registered peers.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionId};

/// Store-assigned breakpoint identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BreakpointId(pub u64);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bp-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub file: String,
    pub line: u32,
    pub condition: Option<String>,
}

impl Breakpoint {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            condition: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BreakpointError {
    #[error("Breakpoint not found: {0}")]
    NotFound(BreakpointId),
}

struct RegisteredConnection {
    connection: Arc<dyn Connection>,
    /// Store id -> peer id for breakpoints this peer accepted.
    applied: HashMap<BreakpointId, String>,
}

#[derive(Default)]
struct StoreInner {
    next_id: u64,
    breakpoints: BTreeMap<BreakpointId, Breakpoint>,
    connections: BTreeMap<ConnectionId, RegisteredConnection>,
}

/// Holds the configured breakpoints and the connections they apply to.
#[derive(Default)]
pub struct BreakpointStore {
    inner: RwLock<StoreInner>,
}

impl BreakpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a breakpoint and install it on every registered connection.
    pub async fn set_breakpoint(&self, breakpoint: Breakpoint) -> BreakpointId {
        let (id, targets) = {
            let mut inner = self.inner.write().await;
            inner.next_id += 1;
            let id = BreakpointId(inner.next_id);
            inner.breakpoints.insert(id, breakpoint.clone());
            let targets: Vec<_> = inner
                .connections
                .values()
                .map(|c| Arc::clone(&c.connection))
                .collect();
            (id, targets)
        };

        info!(%id, file = %breakpoint.file, line = breakpoint.line, "Breakpoint added");
        for connection in targets {
            self.apply(&connection, id, &breakpoint).await;
        }
        id
    }

    /// Register a connection and install every current breakpoint on it.
    pub async fn add_connection(&self, connection: Arc<dyn Connection>) {
        let connection_id = connection.id();
        let current: Vec<_> = {
            let mut inner = self.inner.write().await;
            inner.connections.insert(
                connection_id,
                RegisteredConnection {
                    connection: Arc::clone(&connection),
                    applied: HashMap::new(),
                },
            );
            inner
                .breakpoints
                .iter()
                .map(|(id, bp)| (*id, bp.clone()))
                .collect()
        };

        debug!(%connection_id, count = current.len(), "Applying breakpoints to new connection");
        for (id, breakpoint) in current {
            self.apply(&connection, id, &breakpoint).await;
        }
    }

    /// Forget a connection. Its peer-side breakpoints die with the socket.
    pub async fn remove_connection(&self, connection_id: ConnectionId) {
        self.inner.write().await.connections.remove(&connection_id);
    }

    /// Remove a breakpoint from the store and from every peer holding it.
    pub async fn remove_breakpoint(&self, id: BreakpointId) -> Result<(), BreakpointError> {
        let installed: Vec<_> = {
            let mut inner = self.inner.write().await;
            if inner.breakpoints.remove(&id).is_none() {
                return Err(BreakpointError::NotFound(id));
            }
            inner
                .connections
                .values_mut()
                .filter_map(|c| {
                    c.applied
                        .remove(&id)
                        .map(|peer_id| (Arc::clone(&c.connection), peer_id))
                })
                .collect()
        };

        info!(%id, peers = installed.len(), "Breakpoint removed");
        for (connection, peer_id) in installed {
            if let Err(e) = connection.remove_breakpoint(&peer_id).await {
                warn!(%id, connection_id = %connection.id(), error = %e, "Failed to remove breakpoint from peer");
            }
        }
        Ok(())
    }

    /// Snapshot of the configured breakpoints.
    pub async fn breakpoints(&self) -> Vec<(BreakpointId, Breakpoint)> {
        self.inner
            .read()
            .await
            .breakpoints
            .iter()
            .map(|(id, bp)| (*id, bp.clone()))
            .collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    async fn apply(&self, connection: &Arc<dyn Connection>, id: BreakpointId, breakpoint: &Breakpoint) {
        let connection_id = connection.id();
        let peer_id = match connection.set_breakpoint(breakpoint).await {
            Ok(peer_id) => peer_id,
            Err(e) => {
                warn!(%id, %connection_id, error = %e, "Peer rejected breakpoint");
                return;
            }
        };

        let mut inner = self.inner.write().await;
        let still_wanted = inner.breakpoints.contains_key(&id);
        let rollback = match inner.connections.get_mut(&connection_id) {
            Some(registered) if still_wanted => {
                registered.applied.insert(id, peer_id);
                None
            }
            // Removed while the peer was installing it.
            Some(_) => Some(peer_id),
            None => None,
        };
        drop(inner);

        if let Some(peer_id) = rollback
            && let Err(e) = connection.remove_breakpoint(&peer_id).await
        {
            debug!(%id, %connection_id, error = %e, "Failed to roll back breakpoint");
        }
    }
}
