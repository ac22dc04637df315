//! TLS connection lifecycle (spec.md §4.2): certificate loading, the per-connection
//! state machine, and the idle-read/heartbeat contract that keeps a quiet connection
//! alive without becoming an leak.

use crate::codec::{self, Block, FLAG_HEARTBEAT};
use crate::error::{BrokerError, Result};
use rustls_pemfile::{certs, pkcs8_private_keys};
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::TlsStream;
use tracing::{debug, warn};

/// Load a certificate chain + PKCS#8 private key and build a server-side TLS config
/// (spec.md §4.2: the broker terminates TLS at the inbound and outbound acceptors).
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<Arc<ServerConfig>> {
    let cert_file = std::fs::File::open(cert_path)
        .map_err(|e| BrokerError::internal(format!("opening {}: {e}", cert_path.display())))?;
    let chain: Vec<CertificateDer<'static>> = certs(&mut BufReader::new(cert_file))
        .collect::<std::io::Result<_>>()
        .map_err(|e| BrokerError::internal(format!("parsing certificate chain: {e}")))?;

    let key_file = std::fs::File::open(key_path)
        .map_err(|e| BrokerError::internal(format!("opening {}: {e}", key_path.display())))?;
    let mut keys: Vec<PrivateKeyDer<'static>> = pkcs8_private_keys(&mut BufReader::new(key_file))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| BrokerError::internal(format!("parsing private key: {e}")))?
        .into_iter()
        .map(PrivateKeyDer::Pkcs8)
        .collect();
    let key = keys
        .pop()
        .ok_or_else(|| BrokerError::internal("no private key found"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| BrokerError::internal(format!("building server TLS config: {e}")))?;
    Ok(Arc::new(config))
}

/// Build a client-side TLS config for chaining to peer brokers (spec.md §4.8). When
/// `root_ca` is given it replaces the platform trust roots; otherwise the broker's own
/// certificate is trusted as its own root, matching the single-hop chaining topology.
pub fn load_client_config(root_ca: Option<&Path>, own_cert: &Path) -> Result<Arc<ClientConfig>> {
    let mut roots = RootCertStore::empty();
    let source = root_ca.unwrap_or(own_cert);
    let file = std::fs::File::open(source)
        .map_err(|e| BrokerError::internal(format!("opening {}: {e}", source.display())))?;
    for cert in certs(&mut BufReader::new(file)) {
        let cert = cert.map_err(|e| BrokerError::internal(format!("parsing root CA: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| BrokerError::internal(format!("adding root CA: {e}")))?;
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Why a connection was closed (spec.md §4.2, §4.10). Carried through to the registry's
/// disconnect observer and into the close log line; never exposed to the peer.
#[derive(Debug, Clone)]
pub enum CloseReason {
    IdleTimeout,
    ProtocolError(String),
    PeerClosed,
    Replaced,
    Shutdown,
    Error(String),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::IdleTimeout => write!(f, "idle timeout"),
            CloseReason::ProtocolError(d) => write!(f, "protocol error: {d}"),
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Replaced => write!(f, "replaced by newer connection"),
            CloseReason::Shutdown => write!(f, "broker shutdown"),
            CloseReason::Error(d) => write!(f, "error: {d}"),
        }
    }
}

/// Connection lifecycle state (spec.md §4.2): `Connecting` until the TLS handshake
/// finishes, `Handshaking` is folded into the accept/connect call itself so the state a
/// caller observes starts at `Registered` once the peer registry has a slot for it,
/// `Draining` once shutdown has begun refusing new enqueues, `Closed` once disposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registered,
    Draining,
    Closed,
}

/// One live TLS connection, inbound or outbound. Owns the split stream halves and the
/// idle/heartbeat bookkeeping described in spec.md §4.2 and §5.
pub struct Connection {
    pub peer_addr: SocketAddr,
    pub inbound: bool,
    reader: ReadHalf<TlsStream<TcpStream>>,
    writer: WriteHalf<TlsStream<TcpStream>>,
    state: ConnectionState,
    missed_heartbeats: u32,
    idle_timeout: Duration,
    missed_heartbeats_limit: u32,
    write_watermark: Duration,
    max_payload_len: u64,
}

impl Connection {
    pub fn new(
        stream: TlsStream<TcpStream>,
        peer_addr: SocketAddr,
        inbound: bool,
        idle_timeout: Duration,
        missed_heartbeats_limit: u32,
        write_watermark: Duration,
        max_payload_len: u64,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            peer_addr,
            inbound,
            reader,
            writer,
            state: ConnectionState::Connecting,
            missed_heartbeats: 0,
            idle_timeout,
            missed_heartbeats_limit,
            write_watermark,
            max_payload_len,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mark_registered(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Registered;
        }
    }

    pub fn mark_draining(&mut self) {
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Draining;
        }
    }

    /// Read the next block. If nothing arrives within the idle timeout, a heartbeat is
    /// sent upstream and the idle window is retried; after `missed_heartbeats_limit`
    /// unanswered windows the connection is reported as idle-timed-out (spec.md §5).
    pub async fn read_one(&mut self) -> Result<Block> {
        loop {
            if self.state == ConnectionState::Closed {
                return Err(BrokerError::Transport("connection already closed".into()));
            }
            match timeout(
                self.idle_timeout,
                codec::read_one(&mut self.reader, self.max_payload_len),
            )
            .await
            {
                Ok(result) => {
                    let block = result?;
                    self.missed_heartbeats = 0;
                    return Ok(block);
                }
                Err(_elapsed) => {
                    self.missed_heartbeats += 1;
                    debug!(
                        peer = %self.peer_addr,
                        missed = self.missed_heartbeats,
                        "idle window elapsed, sending heartbeat"
                    );
                    if self.missed_heartbeats > self.missed_heartbeats_limit {
                        warn!(peer = %self.peer_addr, "idle timeout after missed heartbeats");
                        self.state = ConnectionState::Closed;
                        return Err(BrokerError::Timeout);
                    }
                    self.write_one(FLAG_HEARTBEAT, [0u8; 8], b"{}", &[]).await?;
                }
            }
        }
    }

    /// Write one block as a single batched write, bounded by the write watermark
    /// (spec.md §5) so a stalled peer cannot hang the writer indefinitely.
    pub async fn write_one(
        &mut self,
        flags: u16,
        message_id_hash: [u8; 8],
        envelope: &[u8],
        payload: &[u8],
    ) -> Result<()> {
        if self.state == ConnectionState::Closed {
            return Err(BrokerError::Transport("connection already closed".into()));
        }
        timeout(
            self.write_watermark,
            codec::write_one(&mut self.writer, flags, message_id_hash, envelope, payload),
        )
        .await
        .map_err(|_| BrokerError::Timeout)??;
        Ok(())
    }

    /// Close the connection. Idempotent — a second call is a no-op (spec.md §4.2).
    pub async fn close(&mut self, reason: CloseReason) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!(peer = %self.peer_addr, %reason, "closing connection");
        self.state = ConnectionState::Closed;
        let _ = self.writer.shutdown().await;
    }
}
