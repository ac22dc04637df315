pub mod auth;
pub mod broker;
pub mod chain;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod storage;
pub mod tls;

pub use auth::{AuthenticationCallback, AuthorizationCache};
pub use broker::Broker;
pub use chain::ChainRoutingTable;
pub use codec::{Block, Header};
pub use config::{BrokerConfig, CliArgs};
pub use dispatcher::{DispatchOutcome, DispatcherContext};
pub use envelope::{Envelope, MessageType};
pub use error::{BrokerError, Result};
pub use lifecycle::{DrainOutcome, Lifecycle};
pub use queue::{CompletionSink, PeerQueue};
pub use registry::{PeerRegistry, RegistryEvent};
pub use scheduler::{Pool, Scheduler, Task};
pub use storage::{ChunkStorage, ChunkStorageAdapter, InMemoryChunkStorage};
