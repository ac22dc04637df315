//! Broker configuration (spec.md §6 CLI, §5 timeouts/bounds).
//!
//! Every tunable spec.md calls out as "configurable" is a field here with the documented
//! default, rather than a buried constant — per the §9 Open Question, idle-timeout and
//! heartbeat cadence in particular must be adjustable without a recompile.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "broker", version, about = "Montana messaging broker core")]
pub struct CliArgs {
    /// Path to the authorization/token-validation configuration file.
    #[arg(long)]
    pub authorization_config_file: PathBuf,

    /// Path to the PEM-encoded TLS private key.
    #[arg(long)]
    pub private_key_file: PathBuf,

    /// Path to the PEM-encoded TLS certificate chain.
    #[arg(long)]
    pub certificate_file: PathBuf,

    /// Inbound (client→broker) TCP port.
    #[arg(long, default_value_t = 29300)]
    pub inbound_port: u16,

    /// Outbound (broker→client) TCP port. Defaults to inbound_port + 1.
    #[arg(long)]
    pub outbound_port: Option<u16>,

    /// Size of the general-purpose thread pool (spec.md §4.9).
    #[arg(long, default_value_t = 32)]
    pub processing_threads_count: usize,

    /// Maximum outstanding operations across the scheduler's execution queues.
    #[arg(long, default_value_t = 4096)]
    pub max_outstanding_operations: usize,

    /// Peer-broker endpoints to chain to (repeatable), e.g. `--proxy-endpoints 10.0.0.2:29300`.
    #[arg(long)]
    pub proxy_endpoints: Vec<String>,

    /// Path to a root CA bundle used to verify chained peer brokers' certificates.
    #[arg(long)]
    pub verify_root_ca: Option<PathBuf>,

    /// Idle-read timeout before a heartbeat is required (spec.md §4.2, §5).
    #[arg(long, default_value_t = 90)]
    pub idle_timeout_secs: u64,

    /// Missed heartbeats tolerated before the connection is force-closed.
    #[arg(long, default_value_t = 2)]
    pub missed_heartbeats_limit: u32,

    /// Per-frame write watermark (spec.md §5).
    #[arg(long, default_value_t = 30)]
    pub write_watermark_secs: u64,

    /// Chunk-storage operation timeout (spec.md §5).
    #[arg(long, default_value_t = 60)]
    pub chunk_storage_timeout_secs: u64,

    /// Shutdown drain deadline (spec.md §4.10, §5).
    #[arg(long, default_value_t = 5)]
    pub shutdown_drain_secs: u64,

    /// Maximum payload bytes per block (spec.md §3).
    #[arg(long, default_value_t = 16 * 1024 * 1024)]
    pub max_payload_len: u64,

    /// Per-peer outbound queue bound, in entries (spec.md §3).
    #[arg(long, default_value_t = 1024)]
    pub queue_max_entries: usize,

    /// Per-peer outbound queue bound, in total bytes (spec.md §3).
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    pub queue_max_bytes: usize,

    /// Entries a queue accepts before its Connection reaches `Registered` (spec.md §4.3).
    #[arg(long, default_value_t = 64)]
    pub queue_pre_register_threshold: usize,

    /// Authorization cache TTL ceiling, in seconds (spec.md §4.5).
    #[arg(long, default_value_t = 900)]
    pub auth_cache_ttl_secs: u64,

    /// Authorization cache LRU capacity (spec.md §4.5).
    #[arg(long, default_value_t = 10_000)]
    pub auth_cache_capacity: usize,

    /// Negative-cache window for failed authorizations, in seconds (spec.md §4.5).
    #[arg(long, default_value_t = 5)]
    pub auth_negative_cache_secs: u64,

    /// Chunk-storage worker pool size (spec.md §4.7).
    #[arg(long, default_value_t = 32)]
    pub storage_worker_pool_size: usize,

    /// Chunk-storage per-session concurrency ceiling (spec.md §4.7).
    #[arg(long, default_value_t = 4)]
    pub storage_max_concurrent_per_session: usize,

    /// Run without requiring authorization on inbound messages. Off by default
    /// (spec.md §4.6 step 3).
    #[arg(long, default_value_t = false)]
    pub authorization_not_required: bool,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub authorization_config_file: PathBuf,
    pub private_key_file: PathBuf,
    pub certificate_file: PathBuf,
    pub inbound_port: u16,
    pub outbound_port: u16,
    pub processing_threads_count: usize,
    pub max_outstanding_operations: usize,
    pub proxy_endpoints: Vec<String>,
    pub verify_root_ca: Option<PathBuf>,
    pub idle_timeout: Duration,
    pub missed_heartbeats_limit: u32,
    pub write_watermark: Duration,
    pub chunk_storage_timeout: Duration,
    pub shutdown_drain: Duration,
    pub max_payload_len: u64,
    pub queue_max_entries: usize,
    pub queue_max_bytes: usize,
    pub queue_pre_register_threshold: usize,
    pub auth_cache_ttl: Duration,
    pub auth_cache_capacity: usize,
    pub auth_negative_cache: Duration,
    pub storage_worker_pool_size: usize,
    pub storage_max_concurrent_per_session: usize,
    pub authorization_not_required: bool,
}

impl From<CliArgs> for BrokerConfig {
    fn from(args: CliArgs) -> Self {
        let outbound_port = args.outbound_port.unwrap_or(args.inbound_port + 1);
        BrokerConfig {
            authorization_config_file: args.authorization_config_file,
            private_key_file: args.private_key_file,
            certificate_file: args.certificate_file,
            inbound_port: args.inbound_port,
            outbound_port,
            processing_threads_count: args.processing_threads_count,
            max_outstanding_operations: args.max_outstanding_operations,
            proxy_endpoints: args.proxy_endpoints,
            verify_root_ca: args.verify_root_ca,
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            missed_heartbeats_limit: args.missed_heartbeats_limit,
            write_watermark: Duration::from_secs(args.write_watermark_secs),
            chunk_storage_timeout: Duration::from_secs(args.chunk_storage_timeout_secs),
            shutdown_drain: Duration::from_secs(args.shutdown_drain_secs),
            max_payload_len: args.max_payload_len,
            queue_max_entries: args.queue_max_entries,
            queue_max_bytes: args.queue_max_bytes,
            queue_pre_register_threshold: args.queue_pre_register_threshold,
            auth_cache_ttl: Duration::from_secs(args.auth_cache_ttl_secs),
            auth_cache_capacity: args.auth_cache_capacity,
            auth_negative_cache: Duration::from_secs(args.auth_negative_cache_secs),
            storage_worker_pool_size: args.storage_worker_pool_size,
            storage_max_concurrent_per_session: args.storage_max_concurrent_per_session,
            authorization_not_required: args.authorization_not_required,
        }
    }
}
