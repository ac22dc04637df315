//! CLI entry point (spec.md §6): parses the broker's command-line flags, loads its
//! authorization allowlist and chunk-storage backend, and runs until shutdown.

use async_trait::async_trait;
use clap::Parser;
use montana_broker::config::CliArgs;
use montana_broker::error::{BrokerError, Result};
use montana_broker::storage::InMemoryChunkStorage;
use montana_broker::{AuthenticationCallback, Broker, BrokerConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// The authorization configuration file's shape: a flat allowlist of
/// `(tokenType, tokenData)` pairs accepted as valid. Production deployments are
/// expected to swap this for a callback that checks a real token-issuing authority;
/// this is the broker's built-in fallback when run standalone.
#[derive(Debug, Deserialize)]
struct AuthorizationConfigFile {
    #[serde(default)]
    allowed_tokens: Vec<AllowedToken>,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Hash, Clone)]
struct AllowedToken {
    #[serde(rename = "type")]
    token_type: String,
    data: String,
}

struct AllowlistCallback {
    allowed: HashSet<AllowedToken>,
}

#[async_trait]
impl AuthenticationCallback for AllowlistCallback {
    async fn authenticate(&self, token_type: &str, token_data: &[u8]) -> Result<()> {
        let candidate = AllowedToken {
            token_type: token_type.to_string(),
            data: hex::encode(token_data),
        };
        if self.allowed.contains(&candidate) {
            Ok(())
        } else {
            Err(BrokerError::Auth("token not in authorization allowlist".into()))
        }
    }
}

fn load_authorization_callback(config: &BrokerConfig) -> Result<Arc<dyn AuthenticationCallback>> {
    let raw = std::fs::read_to_string(&config.authorization_config_file).map_err(|e| {
        BrokerError::internal(format!(
            "reading authorization config {}: {e}",
            config.authorization_config_file.display()
        ))
    })?;
    let parsed: AuthorizationConfigFile = serde_json::from_str(&raw)
        .map_err(|e| BrokerError::internal(format!("parsing authorization config: {e}")))?;
    Ok(Arc::new(AllowlistCallback {
        allowed: parsed.allowed_tokens.into_iter().collect(),
    }))
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = CliArgs::parse();
    let config = BrokerConfig::from(args);

    let auth_callback = if config.authorization_not_required {
        Arc::new(AllowlistCallback { allowed: HashSet::new() }) as Arc<dyn AuthenticationCallback>
    } else {
        match load_authorization_callback(&config) {
            Ok(cb) => cb,
            Err(e) => {
                tracing::error!(error = %e, "configuration error");
                std::process::exit(1);
            }
        }
    };

    let storage_backend = Arc::new(InMemoryChunkStorage::default());

    let broker = match Broker::new(config, auth_callback, storage_backend) {
        Ok(b) => Arc::new(b),
        Err(e) => {
            tracing::error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    let exit_code = broker.run().await;
    std::process::exit(exit_code);
}
