//! Top-level broker wiring (spec.md §4, §4.10): owns every long-lived component, runs
//! the inbound and outbound TLS acceptors, dials configured chain peers, and carries out
//! the shutdown sequence on signal.

use crate::auth::{AuthenticationCallback, AuthorizationCache};
use crate::chain::ChainRoutingTable;
use crate::config::BrokerConfig;
use crate::dispatcher::{self, ConnectionBinding, DispatcherContext};
use crate::envelope::{AuthenticationToken, Envelope, MessageType, PrincipalIdentityInfo};
use crate::error::{BrokerError, Result};
use crate::lifecycle::{self, Lifecycle};
use crate::queue::PeerQueue;
use crate::registry::{PeerRegistry, RegistryEvent};
use crate::scheduler::{ExecutionQueue, Scheduler};
use crate::storage::ChunkStorageAdapter;
use crate::tls::{self, CloseReason, Connection};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything the broker needs to run, assembled once at startup.
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<PeerRegistry>,
    auth: Arc<AuthorizationCache>,
    storage: Arc<ChunkStorageAdapter>,
    routing: Arc<ChainRoutingTable>,
    scheduler: Arc<Scheduler>,
    general_eq: Arc<ExecutionQueue>,
    lifecycle: Arc<Lifecycle>,
    tls_server_config: Arc<tokio_rustls::rustls::ServerConfig>,
    tls_client_config: Option<Arc<tokio_rustls::rustls::ClientConfig>>,
    /// Per-connection cancellation, keyed by `conn_id`, so a registry reconnect event can
    /// tear down the specific physical connection it superseded (spec.md §4.4) instead of
    /// leaving it running until its own idle timeout fires.
    conn_tokens: DashMap<Uuid, CancellationToken>,
    /// Taken once by `run` so the registry-event consumer can be spawned with access to
    /// `Arc<Self>` rather than at construction time, when no such handle exists yet.
    registry_events: AsyncMutex<Option<mpsc::UnboundedReceiver<RegistryEvent>>>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        auth_callback: Arc<dyn AuthenticationCallback>,
        storage_backend: Arc<dyn crate::storage::ChunkStorage>,
    ) -> Result<Self> {
        let tls_server_config = tls::load_server_config(&config.private_key_file, &config.certificate_file)?;
        let tls_client_config = if config.proxy_endpoints.is_empty() {
            None
        } else {
            Some(tls::load_client_config(
                config.verify_root_ca.as_deref(),
                &config.certificate_file,
            )?)
        };

        let (registry, registry_events) = PeerRegistry::new(
            config.queue_max_entries,
            config.queue_max_bytes,
            config.queue_pre_register_threshold,
        );

        let auth = Arc::new(AuthorizationCache::new(
            auth_callback,
            config.auth_cache_ttl,
            config.auth_negative_cache,
            config.auth_cache_capacity,
        ));
        let storage = Arc::new(ChunkStorageAdapter::new(
            storage_backend,
            config.storage_worker_pool_size,
            config.storage_max_concurrent_per_session,
        ));
        let proxy_endpoints: Vec<SocketAddr> = config
            .proxy_endpoints
            .iter()
            .filter_map(|s| match s.parse() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    warn!(endpoint = %s, error = %e, "ignoring unparsable proxy endpoint");
                    None
                }
            })
            .collect();
        let routing = Arc::new(ChainRoutingTable::new(proxy_endpoints));
        let scheduler = Arc::new(Scheduler::new(config.processing_threads_count));
        let (general_eq, _eq_events) = ExecutionQueue::new(config.processing_threads_count.max(1) * 4);
        let lifecycle = Lifecycle::new();

        Ok(Self {
            config,
            registry,
            auth,
            storage,
            routing,
            scheduler,
            general_eq: Arc::new(general_eq),
            lifecycle,
            tls_server_config,
            tls_client_config,
            conn_tokens: DashMap::new(),
            registry_events: AsyncMutex::new(Some(registry_events)),
        })
    }

    fn dispatcher_context(&self) -> DispatcherContext {
        DispatcherContext {
            registry: self.registry.clone(),
            auth: self.auth.clone(),
            storage: self.storage.clone(),
            routing: self.routing.clone(),
            authorization_not_required: self.config.authorization_not_required,
            scheduler: self.scheduler.clone(),
            general_eq: self.general_eq.clone(),
        }
    }

    /// Register a fresh cancellation token for `conn_id`, returning it so the connection's
    /// own read/write loop can select on it (spec.md §4.4).
    fn register_conn_token(&self, conn_id: Uuid) -> CancellationToken {
        let token = CancellationToken::new();
        self.conn_tokens.insert(conn_id, token.clone());
        token
    }

    fn remove_conn_token(&self, conn_id: Uuid) {
        self.conn_tokens.remove(&conn_id);
    }

    /// Run the broker until a shutdown signal arrives, then drain and return the exit
    /// code the binary should use (spec.md §4.10, §6).
    pub async fn run(self: Arc<Self>) -> i32 {
        let inbound_addr: SocketAddr = format!("0.0.0.0:{}", self.config.inbound_port).parse().unwrap();
        let outbound_addr: SocketAddr = format!("0.0.0.0:{}", self.config.outbound_port).parse().unwrap();

        let inbound_listener = match TcpListener::bind(inbound_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(%inbound_addr, error = %e, "failed to bind inbound port");
                return 2;
            }
        };
        let outbound_listener = match TcpListener::bind(outbound_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(%outbound_addr, error = %e, "failed to bind outbound port");
                return 2;
            }
        };
        info!(%inbound_addr, %outbound_addr, "broker listening");

        // Spawned here, rather than in `new`, so the consumer has an `Arc<Self>` to cancel
        // a superseded connection's token through (spec.md §4.4: reconnect replaces the
        // old connection, and the old one must actually be torn down, not just forgotten).
        if let Some(mut rx) = self.registry_events.lock().await.take() {
            let broker = self.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    info!(?event, "registry event");
                    if let RegistryEvent::PeerReconnected { replaced_conn_id, .. } = event {
                        if let Some(entry) = broker.conn_tokens.get(&replaced_conn_id) {
                            entry.cancel();
                        }
                    }
                }
            });
        }

        let inbound_task = tokio::spawn(self.clone().run_inbound_acceptor(inbound_listener));
        let outbound_task = tokio::spawn(self.clone().run_outbound_acceptor(outbound_listener));
        let chain_task = tokio::spawn(self.clone().run_chain_connector());

        self.lifecycle.wait_for_shutdown_signal().await;
        info!("draining");

        inbound_task.abort();
        outbound_task.abort();
        chain_task.abort();

        let queues = self.registry.all_queues().await;
        let outcome = lifecycle::drain_queues(queues, self.config.shutdown_drain).await;
        self.lifecycle.begin_writer_shutdown();
        outcome.exit_code()
    }

    async fn run_inbound_acceptor(self: Arc<Self>, listener: TcpListener) {
        let acceptor = TlsAcceptor::from(self.tls_server_config.clone());
        let shutdown = self.lifecycle.accept_shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((stream, peer_addr)) = accepted else { continue };
                    let broker = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = broker.handle_inbound_connection(stream, peer_addr, acceptor).await {
                            warn!(%peer_addr, error = %e, "inbound connection ended with error");
                        }
                    });
                }
            }
        }
    }

    async fn handle_inbound_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        acceptor: TlsAcceptor,
    ) -> Result<()> {
        let tls_stream = acceptor.accept(stream).await.map_err(|e| BrokerError::Transport(e.to_string()))?;
        let mut conn = Connection::new(
            tokio_rustls::TlsStream::Server(tls_stream),
            peer_addr,
            true,
            self.config.idle_timeout,
            self.config.missed_heartbeats_limit,
            self.config.write_watermark,
            self.config.max_payload_len,
        );
        let conn_id = Uuid::new_v4();
        let replaced = self.register_conn_token(conn_id);
        let ctx = self.dispatcher_context();
        let mut binding = ConnectionBinding::default();
        let shutdown = self.lifecycle.accept_shutdown_token();

        let close_reason = loop {
            let block = tokio::select! {
                _ = shutdown.cancelled() => break CloseReason::Shutdown,
                _ = replaced.cancelled() => break CloseReason::Replaced,
                result = conn.read_one() => result,
            };
            let block = match block {
                Ok(b) => b,
                Err(BrokerError::Timeout) => break CloseReason::IdleTimeout,
                Err(e) => break CloseReason::Error(e.to_string()),
            };

            let outcome = dispatcher::dispatch(&ctx, &mut binding, conn_id, block).await;
            let mut write_failed = None;
            for response in outcome.responses {
                if let Err(e) = conn
                    .write_one(response.flags, response.message_id_hash, &response.envelope, &response.payload)
                    .await
                {
                    write_failed = Some(e);
                    break;
                }
            }
            if let Some(e) = write_failed {
                break CloseReason::Error(e.to_string());
            }
            if let Some(reason) = outcome.close {
                break reason;
            }
        };

        if let Some(peer_id) = binding.peer_id {
            self.registry.unregister(peer_id, conn_id, true).await;
        }
        self.remove_conn_token(conn_id);
        conn.close(close_reason).await;
        Ok(())
    }

    async fn run_outbound_acceptor(self: Arc<Self>, listener: TcpListener) {
        let acceptor = TlsAcceptor::from(self.tls_server_config.clone());
        let shutdown = self.lifecycle.accept_shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = listener.accept() => {
                    let Ok((stream, peer_addr)) = accepted else { continue };
                    let broker = self.clone();
                    let acceptor = acceptor.clone();
                    tokio::spawn(async move {
                        if let Err(e) = broker.handle_outbound_connection(stream, peer_addr, acceptor).await {
                            warn!(%peer_addr, error = %e, "outbound connection ended with error");
                        }
                    });
                }
            }
        }
    }

    /// An outbound connection's only inbound data is the identifying handshake block the
    /// peer sends immediately after connecting (its `sourcePeerId` names which peer this
    /// connection delivers to); after that the connection is pure write-drain, with reads
    /// continuing only to keep the idle-heartbeat contract alive and detect peer closure.
    async fn handle_outbound_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
        acceptor: TlsAcceptor,
    ) -> Result<()> {
        let tls_stream = acceptor.accept(stream).await.map_err(|e| BrokerError::Transport(e.to_string()))?;
        let mut conn = Connection::new(
            tokio_rustls::TlsStream::Server(tls_stream),
            peer_addr,
            false,
            self.config.idle_timeout,
            self.config.missed_heartbeats_limit,
            self.config.write_watermark,
            self.config.max_payload_len,
        );
        let conn_id = Uuid::new_v4();
        let replaced = self.register_conn_token(conn_id);

        let handshake = conn.read_one().await?;
        let envelope = Envelope::from_bytes(&handshake.envelope)
            .map_err(|e| BrokerError::Protocol(format!("outbound handshake: {e}")))?;
        let peer_id = envelope.source_peer_id;
        let queue = self.registry.register_outbound(peer_id, conn_id).await;
        conn.mark_registered();

        self.run_outbound_drain_loop(&mut conn, &queue, &replaced).await;

        self.registry.unregister(peer_id, conn_id, false).await;
        self.remove_conn_token(conn_id);
        conn.close(CloseReason::PeerClosed).await;
        Ok(())
    }

    async fn run_outbound_drain_loop(&self, conn: &mut Connection, queue: &Arc<PeerQueue>, replaced: &CancellationToken) {
        let shutdown = self.lifecycle.writer_shutdown_token();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = replaced.cancelled() => return,
                item = queue.pop_front_or_wait() => {
                    let result = conn
                        .write_one(item.flags, item.message_id_hash, &item.envelope, &item.payload)
                        .await;
                    item.completion.complete(item.message_id, result.as_ref().map(|_| ()).map_err(clone_result_err));
                    if result.is_err() {
                        return;
                    }
                }
                read_result = conn.read_one() => {
                    match read_result {
                        Ok(_heartbeat_or_ack) => continue,
                        Err(_) => return,
                    }
                }
            }
        }
    }

    /// Dial every configured chain peer (spec.md §4.8) and register its outbound
    /// connection under a synthetic peer id so `ChainRoutingTable::link_for` can resolve
    /// forwarded traffic to it. Reconnects on failure with a fixed backoff.
    async fn run_chain_connector(self: Arc<Self>) {
        let Some(client_config) = self.tls_client_config.clone() else {
            return;
        };
        let shutdown = self.lifecycle.accept_shutdown_token();
        let endpoints: Vec<SocketAddr> = self.routing.proxy_endpoints().to_vec();
        let mut handles = Vec::new();
        for addr in endpoints {
            let broker = self.clone();
            let client_config = client_config.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if shutdown.is_cancelled() {
                        return;
                    }
                    if let Err(e) = broker.clone().maintain_chain_link(addr, client_config.clone()).await {
                        warn!(%addr, error = %e, "chain connection failed, retrying");
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
                    }
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }
    }

    async fn maintain_chain_link(
        self: Arc<Self>,
        addr: SocketAddr,
        client_config: Arc<tokio_rustls::rustls::ClientConfig>,
    ) -> Result<()> {
        let stream = TcpStream::connect(addr).await.map_err(BrokerError::from)?;
        let connector = TlsConnector::from(client_config);
        let server_name = tokio_rustls::rustls::pki_types::ServerName::IpAddress(addr.ip().into());
        let tls_stream = connector
            .connect(server_name, stream)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let link_id = Uuid::new_v4();
        let mut conn = Connection::new(
            tokio_rustls::TlsStream::Client(tls_stream),
            addr,
            false,
            self.config.idle_timeout,
            self.config.missed_heartbeats_limit,
            self.config.write_watermark,
            self.config.max_payload_len,
        );

        let handshake = Envelope {
            message_type: MessageType::Heartbeat,
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            source_peer_id: link_id,
            target_peer_id: link_id,
            principal_identity_info: PrincipalIdentityInfo {
                authentication_token: AuthenticationToken {
                    token_type: "chain".into(),
                    data: String::new(),
                },
            },
            payload_size: None,
            result: None,
        };
        let handshake_bytes = handshake
            .to_bytes()
            .map_err(|e| BrokerError::internal(format!("encoding chain handshake: {e}")))?;
        conn.write_one(0, handshake.message_id_hash(), &handshake_bytes, &[]).await?;

        let conn_id = Uuid::new_v4();
        let replaced = self.register_conn_token(conn_id);
        let queue = self.registry.register_outbound(link_id, conn_id).await;
        self.routing.register_link(addr, link_id);
        conn.mark_registered();

        self.run_outbound_drain_loop(&mut conn, &queue, &replaced).await;

        self.routing.unregister_link(addr);
        self.registry.unregister(link_id, conn_id, false).await;
        self.remove_conn_token(conn_id);
        conn.close(CloseReason::PeerClosed).await;
        Ok(())
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn routing(&self) -> &Arc<ChainRoutingTable> {
        &self.routing
    }
}

fn clone_result_err(err: &BrokerError) -> BrokerError {
    match err {
        BrokerError::Protocol(s) => BrokerError::Protocol(s.clone()),
        BrokerError::Auth(s) => BrokerError::Auth(s.clone()),
        BrokerError::TargetPeerNotFound => BrokerError::TargetPeerNotFound,
        BrokerError::TargetPeerQueueFull => BrokerError::TargetPeerQueueFull,
        BrokerError::Transport(s) => BrokerError::Transport(s.clone()),
        BrokerError::Timeout => BrokerError::Timeout,
        BrokerError::Canceled => BrokerError::Canceled,
        BrokerError::Storage(s) => BrokerError::Storage(s.clone()),
        BrokerError::Internal { correlation_id, detail } => BrokerError::Internal {
            correlation_id: *correlation_id,
            detail: detail.clone(),
        },
    }
}
