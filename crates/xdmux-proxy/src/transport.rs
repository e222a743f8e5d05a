//! Socket-level collaborators the multiplexer is generic over.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::connection::{Connection, ConnectionId};
use crate::connector::{
    Connector, ConnectorError, ConnectorEvent, ConnectorKind, TcpConnector, fail_connection,
};

/// Creates connectors and turns accepted sockets into connections.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Socket: Send + 'static;

    /// Create (but do not start) a connector reporting into `events`.
    fn bind(
        &self,
        kind: ConnectorKind,
        port: u16,
        events: mpsc::UnboundedSender<ConnectorEvent<Self::Socket>>,
    ) -> Result<Box<dyn Connector>, ConnectorError>;

    /// Wrap an accepted socket in a protocol connection.
    fn open(&self, id: ConnectionId, socket: Self::Socket) -> Arc<dyn Connection>;

    /// Send a rejection and close the socket.
    async fn reject(&self, socket: Self::Socket, reason: &str);
}

/// TCP transport; the DBGp command layer is supplied by `factory`.
pub struct TcpTransport<F> {
    host: IpAddr,
    factory: F,
}

impl<F> TcpTransport<F>
where
    F: Fn(ConnectionId, TcpStream) -> Arc<dyn Connection> + Send + Sync + 'static,
{
    pub const fn new(host: IpAddr, factory: F) -> Self {
        Self { host, factory }
    }
}

#[async_trait]
impl<F> Transport for TcpTransport<F>
where
    F: Fn(ConnectionId, TcpStream) -> Arc<dyn Connection> + Send + Sync + 'static,
{
    type Socket = TcpStream;

    fn bind(
        &self,
        kind: ConnectorKind,
        port: u16,
        events: mpsc::UnboundedSender<ConnectorEvent<TcpStream>>,
    ) -> Result<Box<dyn Connector>, ConnectorError> {
        Ok(Box::new(TcpConnector::new(kind, self.host, port, events)))
    }

    fn open(&self, id: ConnectionId, socket: TcpStream) -> Arc<dyn Connection> {
        (self.factory)(id, socket)
    }

    async fn reject(&self, socket: TcpStream, reason: &str) {
        fail_connection(socket, reason).await;
    }
}
