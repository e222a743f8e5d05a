//! TCP connector for DBGp peers.
//!
//! DBGp engines connect to the IDE and immediately send an `init` packet
//! framed as `<decimal length>\0<xml>\0`.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Connector, ConnectorError, ConnectorEvent, ConnectorKind, Handshake};

/// Largest `init` packet accepted from a peer.
const MAX_PACKET_BYTES: usize = 1024 * 1024;

/// Longest `<length>\0` header, NUL included.
const MAX_HEADER_BYTES: u64 = 20;

/// How long a fresh socket may take to send its `init` packet.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Accepts DBGp peers on one TCP port.
pub struct TcpConnector {
    kind: ConnectorKind,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<ConnectorEvent<TcpStream>>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpConnector {
    pub fn new(
        kind: ConnectorKind,
        host: IpAddr,
        port: u16,
        events: mpsc::UnboundedSender<ConnectorEvent<TcpStream>>,
    ) -> Self {
        Self {
            kind,
            addr: SocketAddr::new(host, port),
            events,
            accept_task: None,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    fn kind(&self) -> ConnectorKind {
        self.kind
    }

    fn port(&self) -> u16 {
        self.addr.port()
    }

    async fn listen(&mut self) -> Result<(), ConnectorError> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ConnectorError::Bind {
                port: self.addr.port(),
                reason: e.to_string(),
            })?;
        info!(kind = %self.kind, addr = %self.addr, "Connector listening");

        let kind = self.kind;
        let events = self.events.clone();
        self.accept_task = Some(tokio::spawn(accept_loop(kind, listener, events)));
        Ok(())
    }

    fn dispose(&mut self) {
        if let Some(task) = self.accept_task.take() {
            debug!(kind = %self.kind, "Disposing connector");
            task.abort();
        }
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        self.dispose();
    }
}

async fn accept_loop(
    kind: ConnectorKind,
    listener: TcpListener,
    events: mpsc::UnboundedSender<ConnectorEvent<TcpStream>>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%kind, %peer, "Accepted peer socket");
                let events = events.clone();
                tokio::spawn(async move {
                    if let Some(event) = read_handshake(kind, stream).await {
                        let _ = events.send(event);
                    }
                });
            }
            Err(e) => {
                warn!(%kind, error = %e, "Connector accept failed");
                let _ = events.send(ConnectorEvent::Error {
                    kind,
                    message: format!("Debugger connector ({kind}) failed: {e}"),
                });
                let _ = events.send(ConnectorEvent::Close { kind });
                return;
            }
        }
    }
}

async fn read_handshake(
    kind: ConnectorKind,
    stream: TcpStream,
) -> Option<ConnectorEvent<TcpStream>> {
    let mut reader = BufReader::new(stream);
    let packet = match tokio::time::timeout(HANDSHAKE_TIMEOUT, read_packet(&mut reader)).await {
        Ok(Ok(packet)) => packet,
        Ok(Err(e)) => {
            warn!(%kind, error = %e, "Rejecting peer with unreadable handshake");
            fail_connection(reader.into_inner(), "unreadable handshake").await;
            return None;
        }
        Err(_) => {
            warn!(%kind, "Rejecting peer that sent no handshake");
            fail_connection(reader.into_inner(), "handshake timed out").await;
            return None;
        }
    };

    match Handshake::parse(&packet) {
        Ok(handshake) => Some(ConnectorEvent::Attach {
            kind,
            socket: reader.into_inner(),
            handshake,
        }),
        Err(e) => {
            warn!(%kind, error = %e, "Rejecting peer with malformed handshake");
            fail_connection(reader.into_inner(), "malformed handshake").await;
            None
        }
    }
}

/// Read one `<length>\0<payload>\0` DBGp packet.
pub async fn read_packet<R>(reader: &mut R) -> std::io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut header = Vec::new();
    (&mut *reader)
        .take(MAX_HEADER_BYTES)
        .read_until(0, &mut header)
        .await?;
    if header.last() != Some(&0) {
        let exhausted = u64::try_from(header.len()).is_ok_and(|n| n >= MAX_HEADER_BYTES);
        if exhausted {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "packet length header too long",
            ));
        }
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    header.pop();

    let length: usize = std::str::from_utf8(&header)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid packet length")
        })?;
    if length > MAX_PACKET_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("packet too large: {length} bytes"),
        ));
    }

    let mut payload = vec![0; length + 1];
    reader.read_exact(&mut payload).await?;
    if payload.pop() != Some(0) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "packet not NUL-terminated",
        ));
    }

    String::from_utf8(payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Reject a peer: ask it to detach, then close the socket.
pub async fn fail_connection(mut stream: TcpStream, reason: &str) {
    warn!(reason, "Failing debugger connection");
    if let Err(e) = stream.write_all(b"detach -i 1\0").await {
        debug!(error = %e, "Failed to send detach to rejected peer");
    }
    let _ = stream.shutdown().await;
}
