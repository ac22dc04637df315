//! Protocol Dispatcher (spec.md §4.6): the only component that parses envelope JSON.
//! Turns one decoded [`Block`] into zero or more response frames, side effects on the
//! peer registry / queues / storage adapter, and (on protocol violations) a reason to
//! close the originating connection.

use crate::auth::AuthorizationCache;
use crate::chain::{self, ChainRoutingTable, ForwardDecision};
use crate::codec::{Block, FLAG_ADMIN, FLAG_HEARTBEAT};
use crate::envelope::{Envelope, MessageType, RpcResult};
use crate::error::{BrokerError, Result};
use crate::queue::{CompletionSink, NoopSink, QueueItem};
use crate::registry::PeerRegistry;
use crate::scheduler::{self, ExecutionQueue, Pool, Scheduler};
use crate::storage::ChunkStorageAdapter;
use crate::tls::CloseReason;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Per-connection binding state (spec.md §4.6: `Unbound → Bound → Bound (looping) →
/// Closed`). Only `Unbound`/`Bound` are tracked here; looping/closed are the caller's
/// read-loop concern.
#[derive(Default)]
pub struct ConnectionBinding {
    pub peer_id: Option<Uuid>,
}

/// One outbound frame the dispatcher wants written back on the originating connection.
pub struct ResponseFrame {
    pub flags: u16,
    pub message_id_hash: [u8; 8],
    pub envelope: Vec<u8>,
    pub payload: Vec<u8>,
}

impl ResponseFrame {
    fn from_envelope(envelope: &Envelope) -> Result<Self> {
        Ok(ResponseFrame {
            flags: 0,
            message_id_hash: envelope.message_id_hash(),
            envelope: envelope.to_bytes().map_err(|e| BrokerError::internal(e))?,
            payload: Vec::new(),
        })
    }
}

/// The result of dispatching one block: frames to write back locally, and an optional
/// reason the connection must close (spec.md §7: protocol/internal errors close it).
pub struct DispatchOutcome {
    pub responses: Vec<ResponseFrame>,
    pub close: Option<CloseReason>,
}

impl DispatchOutcome {
    fn reply(frame: ResponseFrame) -> Self {
        Self {
            responses: vec![frame],
            close: None,
        }
    }

    fn reply_and_close(frame: ResponseFrame, reason: CloseReason) -> Self {
        Self {
            responses: vec![frame],
            close: Some(reason),
        }
    }

    fn none() -> Self {
        Self {
            responses: Vec::new(),
            close: None,
        }
    }
}

pub struct DispatcherContext {
    pub registry: Arc<PeerRegistry>,
    pub auth: Arc<AuthorizationCache>,
    pub storage: Arc<ChunkStorageAdapter>,
    pub routing: Arc<ChainRoutingTable>,
    pub authorization_not_required: bool,
    pub scheduler: Arc<Scheduler>,
    pub general_eq: Arc<ExecutionQueue>,
}

/// Dispatch one inbound block received on connection `conn_id`.
pub async fn dispatch(
    ctx: &DispatcherContext,
    binding: &mut ConnectionBinding,
    conn_id: Uuid,
    block: Block,
) -> DispatchOutcome {
    // Transport-level heartbeat: a bare `FLAG_HEARTBEAT` block carries no envelope JSON
    // at all (spec.md §4.2), so it must be answered before any attempt to parse one —
    // answering it here also means a heartbeat never touches registry/auth state.
    if block.header.is_heartbeat() {
        return DispatchOutcome::reply(ResponseFrame {
            flags: FLAG_HEARTBEAT,
            message_id_hash: block.header.message_id_hash,
            envelope: block.envelope.clone(),
            payload: Vec::new(),
        });
    }

    let envelope = match Envelope::from_bytes(&block.envelope) {
        Ok(e) => e,
        Err(e) => {
            warn!(%conn_id, error = %e, "envelope parse failed");
            return protocol_error_outcome(None, "malformed envelope");
        }
    };

    // Step 2: bind or verify the source peer id (spec.md §4.6 step 2).
    match binding.peer_id {
        None => {
            binding.peer_id = Some(envelope.source_peer_id);
            ctx.registry.register_inbound(envelope.source_peer_id, conn_id).await;
        }
        Some(bound) if bound != envelope.source_peer_id => {
            warn!(%conn_id, %bound, claimed = %envelope.source_peer_id, "source peer id mismatch");
            return protocol_error_outcome(Some(&envelope), "source peer id changed mid-connection");
        }
        Some(_) => {}
    }

    // Step 3: authorization (spec.md §4.6 step 3) — applies to every message type,
    // application-level heartbeats included, so it runs before classification.
    if !ctx.authorization_not_required {
        let token = envelope.principal_identity_info.authentication_token.clone();
        let fp = token.fingerprint();
        let auth = ctx.auth.clone();
        let auth_result =
            match scheduler::run_on(&ctx.scheduler, &ctx.general_eq, Pool::GeneralPurpose, async move {
                auth.authorize(fp, &token.token_type, &token.data_bytes()).await
            })
            .await
            {
                Ok(inner) => inner,
                Err(e) => Err(e),
            };
        if let Err(e) = auth_result {
            return auth_error_outcome(&envelope, &e);
        }
    }

    // Step 4: classify by message type.
    match envelope.message_type {
        MessageType::Heartbeat => DispatchOutcome::reply(ResponseFrame {
            flags: FLAG_HEARTBEAT,
            message_id_hash: envelope.message_id_hash(),
            envelope: block.envelope.clone(),
            payload: Vec::new(),
        }),
        MessageType::AdminFlush => handle_admin_flush(ctx, &envelope).await,
        MessageType::Notification | MessageType::AsyncRpcRequest | MessageType::AsyncRpcResponse => {
            if block.header.is_admin() {
                handle_chunk_operation(ctx, &envelope, &block.payload).await
            } else {
                relay(ctx, &envelope, block.header.flags, &block).await
            }
        }
    }
}

async fn relay(ctx: &DispatcherContext, envelope: &Envelope, flags: u16, block: &Block) -> DispatchOutcome {
    let target = envelope.target_peer_id;
    if ctx.registry.is_registered(target) {
        let queue = match ctx.registry.lookup_queue(target).await {
            Ok(q) => q,
            Err(e) => return routing_error_outcome(envelope, &e),
        };
        // Relaying needs an actual outbound connection to deliver through, not merely a
        // known peer id (spec.md §4.3, §4.6) — an inbound-only peer racing its own
        // outbound registration is allowed to receive up to `pre_register_threshold`
        // queued entries before that connection exists, but no further.
        if !ctx.registry.outbound_registered(target).await && !queue.below_pre_register_threshold().await {
            return routing_error_outcome(envelope, &BrokerError::TargetPeerQueueFull);
        }
        let item = QueueItem {
            message_id: envelope.message_id,
            flags,
            message_id_hash: block.header.message_id_hash,
            envelope: block.envelope.clone(),
            payload: block.payload.clone(),
            completion: empty_sink(),
        };
        return match queue.try_enqueue(item).await {
            Ok(()) => DispatchOutcome::none(),
            Err(e) => routing_error_outcome(envelope, &e),
        };
    }

    match chain::forward_decision(flags, envelope, &ctx.routing) {
        ForwardDecision::Forward(link_id) => {
            // `link_id` is the synthetic peer id the chain-connection pool (broker.rs)
            // registered in the registry for its outbound connection to the remote
            // broker that advertised owning this target. Enqueuing onto that queue
            // hands the block to the same write loop a local peer's queue would use;
            // the remote broker sees `Forwarded` set and will not forward it again.
            let queue = match ctx.registry.lookup_queue(link_id).await {
                Ok(q) => q,
                Err(_) => return routing_error_outcome(envelope, &BrokerError::TargetPeerNotFound),
            };
            let forwarded_flags = chain::mark_forwarded(flags);
            let item = QueueItem {
                message_id: envelope.message_id,
                flags: forwarded_flags,
                message_id_hash: block.header.message_id_hash,
                envelope: block.envelope.clone(),
                payload: block.payload.clone(),
                completion: empty_sink(),
            };
            match queue.try_enqueue(item).await {
                Ok(()) => DispatchOutcome::none(),
                Err(e) => routing_error_outcome(envelope, &e),
            }
        }
        ForwardDecision::Local => routing_error_outcome(envelope, &BrokerError::TargetPeerNotFound),
    }
}

async fn handle_admin_flush(ctx: &DispatcherContext, envelope: &Envelope) -> DispatchOutcome {
    let storage = ctx.storage.clone();
    let source_peer_id = envelope.source_peer_id;
    let result = match scheduler::run_on(&ctx.scheduler, &ctx.general_eq, Pool::GeneralPurpose, async move {
        storage.flush_peer_sessions(source_peer_id).await
    })
    .await
    {
        Ok(inner) => inner,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => match ResponseFrame::from_envelope(&envelope.respond(RpcResult::ok())) {
            Ok(frame) => DispatchOutcome::reply(ResponseFrame { flags: FLAG_ADMIN, ..frame }),
            Err(_) => DispatchOutcome::none(),
        },
        Err(e) => storage_error_outcome(envelope, &e),
    }
}

/// Decode and run a chunk load/save/remove request carried as the block payload
/// (spec.md §4.6 step 4 "Chunk put/get/remove"). The wire sub-format mirrors the block
/// header's own length-prefixed style: `[opcode:1][session_id:16][chunk_id_len:4][chunk_id][data...]`.
async fn handle_chunk_operation(ctx: &DispatcherContext, envelope: &Envelope, payload: &[u8]) -> DispatchOutcome {
    let request = match ChunkRequest::decode(payload) {
        Ok(r) => r,
        Err(_) => return protocol_error_outcome(Some(envelope), "malformed chunk request"),
    };

    let storage = ctx.storage.clone();
    let scheduled = match request.op {
        ChunkOp::Load => {
            let (session_id, chunk_id) = (request.session_id, request.chunk_id.clone());
            scheduler::run_on(&ctx.scheduler, &ctx.general_eq, Pool::GeneralPurpose, async move {
                storage.load(session_id, chunk_id).await.map(ChunkResult::Data)
            })
            .await
        }
        ChunkOp::Save => {
            let (session_id, chunk_id, data) = (request.session_id, request.chunk_id.clone(), request.data);
            scheduler::run_on(&ctx.scheduler, &ctx.general_eq, Pool::GeneralPurpose, async move {
                storage.save(session_id, chunk_id, data).await.map(|()| ChunkResult::Ack)
            })
            .await
        }
        ChunkOp::Remove => {
            let (session_id, chunk_id) = (request.session_id, request.chunk_id.clone());
            scheduler::run_on(&ctx.scheduler, &ctx.general_eq, Pool::GeneralPurpose, async move {
                storage.remove(session_id, chunk_id).await.map(|()| ChunkResult::Ack)
            })
            .await
        }
    };
    let outcome = match scheduled {
        Ok(inner) => inner,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(ChunkResult::Ack) => match ResponseFrame::from_envelope(&envelope.respond(RpcResult::ok())) {
            Ok(frame) => DispatchOutcome::reply(frame),
            Err(_) => DispatchOutcome::none(),
        },
        Ok(ChunkResult::Data(bytes)) => match ResponseFrame::from_envelope(&envelope.respond(RpcResult::ok())) {
            Ok(frame) => DispatchOutcome::reply(ResponseFrame { payload: bytes, ..frame }),
            Err(_) => DispatchOutcome::none(),
        },
        Err(e) => storage_error_outcome(envelope, &e),
    }
}

enum ChunkResult {
    Ack,
    Data(Vec<u8>),
}

pub enum ChunkOp {
    Load,
    Save,
    Remove,
}

pub struct ChunkRequest {
    pub op: ChunkOp,
    pub session_id: Uuid,
    pub chunk_id: String,
    pub data: Vec<u8>,
}

impl ChunkRequest {
    pub fn encode(&self) -> Vec<u8> {
        let opcode = match self.op {
            ChunkOp::Load => 0u8,
            ChunkOp::Save => 1u8,
            ChunkOp::Remove => 2u8,
        };
        let chunk_id_bytes = self.chunk_id.as_bytes();
        let mut out = Vec::with_capacity(1 + 16 + 4 + chunk_id_bytes.len() + self.data.len());
        out.push(opcode);
        out.extend_from_slice(self.session_id.as_bytes());
        out.extend_from_slice(&(chunk_id_bytes.len() as u32).to_be_bytes());
        out.extend_from_slice(chunk_id_bytes);
        out.extend_from_slice(&self.data);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 1 + 16 + 4 {
            return Err(BrokerError::Protocol("chunk request too short".into()));
        }
        let op = match buf[0] {
            0 => ChunkOp::Load,
            1 => ChunkOp::Save,
            2 => ChunkOp::Remove,
            other => return Err(BrokerError::Protocol(format!("unknown chunk opcode {other}"))),
        };
        let session_id = Uuid::from_slice(&buf[1..17]).map_err(|e| BrokerError::Protocol(e.to_string()))?;
        let chunk_id_len = u32::from_be_bytes(buf[17..21].try_into().unwrap()) as usize;
        if buf.len() < 21 + chunk_id_len {
            return Err(BrokerError::Protocol("chunk id truncated".into()));
        }
        let chunk_id = String::from_utf8(buf[21..21 + chunk_id_len].to_vec())
            .map_err(|e| BrokerError::Protocol(e.to_string()))?;
        let data = buf[21 + chunk_id_len..].to_vec();
        Ok(ChunkRequest {
            op,
            session_id,
            chunk_id,
            data,
        })
    }
}

fn empty_sink() -> Arc<dyn CompletionSink> {
    Arc::new(NoopSink)
}

fn protocol_error_outcome(envelope: Option<&Envelope>, detail: &str) -> DispatchOutcome {
    let Some(envelope) = envelope else {
        return DispatchOutcome {
            responses: Vec::new(),
            close: Some(CloseReason::ProtocolError(detail.to_string())),
        };
    };
    let response = envelope.respond(RpcResult::error(crate::error::ERR_PROTOCOL_VALIDATION_FAILED, detail));
    match ResponseFrame::from_envelope(&response) {
        Ok(frame) => DispatchOutcome::reply_and_close(frame, CloseReason::ProtocolError(detail.to_string())),
        Err(_) => DispatchOutcome {
            responses: Vec::new(),
            close: Some(CloseReason::ProtocolError(detail.to_string())),
        },
    }
}

fn auth_error_outcome(envelope: &Envelope, err: &BrokerError) -> DispatchOutcome {
    let response = envelope.respond(RpcResult::error(crate::error::ERR_AUTHORIZATION_FAILED, err.to_string()));
    match ResponseFrame::from_envelope(&response) {
        Ok(frame) => DispatchOutcome::reply(frame),
        Err(_) => DispatchOutcome::none(),
    }
}

fn routing_error_outcome(envelope: &Envelope, err: &BrokerError) -> DispatchOutcome {
    let response = envelope.respond(RpcResult::error(err.code(), err.to_string()));
    match ResponseFrame::from_envelope(&response) {
        Ok(frame) => DispatchOutcome::reply(frame),
        Err(_) => DispatchOutcome::none(),
    }
}

fn storage_error_outcome(envelope: &Envelope, err: &BrokerError) -> DispatchOutcome {
    let response = envelope.respond(RpcResult::error(err.code(), err.to_string()));
    match ResponseFrame::from_envelope(&response) {
        Ok(frame) => DispatchOutcome::reply(frame),
        Err(_) => DispatchOutcome::none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthenticationCallback;
    use crate::codec;
    use crate::envelope::{AuthenticationToken, PrincipalIdentityInfo};
    use crate::storage::InMemoryChunkStorage;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::time::Duration;

    struct AllowAll;
    #[async_trait]
    impl AuthenticationCallback for AllowAll {
        async fn authenticate(&self, _t: &str, _d: &[u8]) -> Result<()> {
            Ok(())
        }
    }

    struct DenyAll;
    #[async_trait]
    impl AuthenticationCallback for DenyAll {
        async fn authenticate(&self, _t: &str, _d: &[u8]) -> Result<()> {
            Err(BrokerError::Auth("no".into()))
        }
    }

    fn make_ctx(allow: bool) -> DispatcherContext {
        let (registry, _rx) = PeerRegistry::new(1024, 1024 * 1024, 64);
        let callback: Arc<dyn AuthenticationCallback> = if allow { Arc::new(AllowAll) } else { Arc::new(DenyAll) };
        let auth = Arc::new(AuthorizationCache::new(callback, Duration::from_secs(60), Duration::from_secs(5), 100));
        let storage = Arc::new(ChunkStorageAdapter::new(Arc::new(InMemoryChunkStorage::default()), 4, 2));
        let routing = Arc::new(ChainRoutingTable::new(Vec::<SocketAddr>::new()));
        let (general_eq, _eq_events) = ExecutionQueue::new(64);
        DispatcherContext {
            registry,
            auth,
            storage,
            routing,
            authorization_not_required: false,
            scheduler: Arc::new(Scheduler::new(4)),
            general_eq: Arc::new(general_eq),
        }
    }

    fn sample_block(source: Uuid, target: Uuid, message_type: MessageType) -> Block {
        let envelope = Envelope {
            message_type,
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            source_peer_id: source,
            target_peer_id: target,
            principal_identity_info: PrincipalIdentityInfo {
                authentication_token: AuthenticationToken {
                    token_type: "bearer".into(),
                    data: hex::encode(b"tok"),
                },
            },
            payload_size: None,
            result: None,
        };
        let bytes = envelope.to_bytes().unwrap();
        let frame = codec::encode(0, envelope.message_id_hash(), &bytes, b"hello").unwrap();
        codec::decode(&frame, codec::DEFAULT_MAX_PAYLOAD_LEN).unwrap()
    }

    #[tokio::test]
    async fn notification_to_registered_peer_enqueues() {
        let ctx = make_ctx(true);
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        ctx.registry.register_outbound(p2, Uuid::new_v4()).await;

        let mut binding = ConnectionBinding::default();
        let block = sample_block(p1, p2, MessageType::Notification);
        let outcome = dispatch(&ctx, &mut binding, Uuid::new_v4(), block).await;

        assert!(outcome.responses.is_empty());
        assert!(outcome.close.is_none());
        let queue = ctx.registry.lookup_queue(p2).await.unwrap();
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn notification_to_unknown_peer_returns_code_99() {
        let ctx = make_ctx(true);
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let mut binding = ConnectionBinding::default();
        let block = sample_block(p1, p2, MessageType::Notification);
        let outcome = dispatch(&ctx, &mut binding, Uuid::new_v4(), block).await;

        assert_eq!(outcome.responses.len(), 1);
        let env = Envelope::from_bytes(&outcome.responses[0].envelope).unwrap();
        assert_eq!(env.result.unwrap().error_code, Some(crate::error::ERR_TARGET_PEER_NOT_FOUND));
    }

    #[tokio::test]
    async fn denied_auth_returns_code_13_and_keeps_connection_open() {
        let ctx = make_ctx(false);
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let mut binding = ConnectionBinding::default();
        let block = sample_block(p1, p2, MessageType::Notification);
        let outcome = dispatch(&ctx, &mut binding, Uuid::new_v4(), block).await;

        assert!(outcome.close.is_none());
        let env = Envelope::from_bytes(&outcome.responses[0].envelope).unwrap();
        assert_eq!(env.result.unwrap().error_code, Some(crate::error::ERR_AUTHORIZATION_FAILED));
    }

    #[tokio::test]
    async fn malformed_envelope_closes_connection() {
        let ctx = make_ctx(true);
        let mut binding = ConnectionBinding::default();
        let frame = codec::encode(0, [0; 8], b"not json", b"").unwrap();
        let block = codec::decode(&frame, codec::DEFAULT_MAX_PAYLOAD_LEN).unwrap();
        let outcome = dispatch(&ctx, &mut binding, Uuid::new_v4(), block).await;
        assert!(matches!(outcome.close, Some(CloseReason::ProtocolError(_))));
    }

    #[tokio::test]
    async fn notification_forwards_to_chained_broker_when_target_has_a_live_link() {
        let ctx = make_ctx(true);
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let chain_link_id = Uuid::new_v4();
        let addr: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        ctx.routing.advertise(p2, addr);
        ctx.routing.register_link(addr, chain_link_id);
        ctx.registry.register_outbound(chain_link_id, Uuid::new_v4()).await;

        let mut binding = ConnectionBinding::default();
        let block = sample_block(p1, p2, MessageType::Notification);
        let outcome = dispatch(&ctx, &mut binding, Uuid::new_v4(), block).await;

        assert!(outcome.responses.is_empty());
        assert!(outcome.close.is_none());
        let queue = ctx.registry.lookup_queue(chain_link_id).await.unwrap();
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn already_forwarded_notification_with_no_local_registration_returns_code_99() {
        let ctx = make_ctx(true);
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        let chain_link_id = Uuid::new_v4();
        let addr: SocketAddr = "127.0.0.1:9101".parse().unwrap();
        ctx.routing.advertise(p2, addr);
        ctx.routing.register_link(addr, chain_link_id);
        ctx.registry.register_outbound(chain_link_id, Uuid::new_v4()).await;

        let mut binding = ConnectionBinding::default();
        let envelope = Envelope {
            message_type: MessageType::Notification,
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            source_peer_id: p1,
            target_peer_id: p2,
            principal_identity_info: PrincipalIdentityInfo {
                authentication_token: AuthenticationToken {
                    token_type: "bearer".into(),
                    data: hex::encode(b"tok"),
                },
            },
            payload_size: None,
            result: None,
        };
        let bytes = envelope.to_bytes().unwrap();
        let frame = codec::encode(codec::FLAG_FORWARDED, envelope.message_id_hash(), &bytes, b"hello").unwrap();
        let block = codec::decode(&frame, codec::DEFAULT_MAX_PAYLOAD_LEN).unwrap();

        let outcome = dispatch(&ctx, &mut binding, Uuid::new_v4(), block).await;

        assert_eq!(outcome.responses.len(), 1);
        let env = Envelope::from_bytes(&outcome.responses[0].envelope).unwrap();
        assert_eq!(env.result.unwrap().error_code, Some(crate::error::ERR_TARGET_PEER_NOT_FOUND));
        // the forwarded flag must have blocked a second hop rather than re-forwarding
        assert_eq!(ctx.registry.lookup_queue(chain_link_id).await.unwrap().len().await, 0);
    }

    #[tokio::test]
    async fn chunk_request_round_trips() {
        let request = ChunkRequest {
            op: ChunkOp::Save,
            session_id: Uuid::new_v4(),
            chunk_id: "chunk-1".into(),
            data: b"payload-bytes".to_vec(),
        };
        let encoded = request.encode();
        let decoded = ChunkRequest::decode(&encoded).unwrap();
        assert_eq!(decoded.session_id, request.session_id);
        assert_eq!(decoded.chunk_id, request.chunk_id);
        assert_eq!(decoded.data, request.data);
    }
}
