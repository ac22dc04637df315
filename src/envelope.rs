//! The protocol envelope (spec.md §3, §6): the structured, authenticated metadata
//! document carried inside a [`crate::codec::Block`]. The dispatcher is the only
//! component that parses this layer — the codec never looks past the header (§9).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    AsyncRpcRequest,
    AsyncRpcResponse,
    Notification,
    Heartbeat,
    AdminFlush,
}

/// An opaque authentication token as carried on the wire. `data` is hex-encoded so the
/// envelope round-trips cleanly through JSON without embedding raw binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationToken {
    #[serde(rename = "type")]
    pub token_type: String,
    pub data: String,
}

impl AuthenticationToken {
    pub fn data_bytes(&self) -> Vec<u8> {
        hex::decode(&self.data).unwrap_or_default()
    }

    /// Fingerprint = SHA-256 of (token-type ∥ token-data), per spec.md §3. Never
    /// logged alongside the raw token — only this digest is safe to correlate on.
    pub fn fingerprint(&self) -> TokenFingerprint {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(self.token_type.as_bytes());
        hasher.update(self.data_bytes());
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        TokenFingerprint(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenFingerprint([u8; 32]);

impl TokenFingerprint {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for TokenFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalIdentityInfo {
    pub authentication_token: AuthenticationToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResult {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub message: Option<String>,
}

impl RpcResult {
    pub fn error(code: u32, message: impl Into<String>) -> Self {
        Self {
            error_code: Some(code),
            message: Some(message.into()),
        }
    }

    pub fn ok() -> Self {
        Self {
            error_code: None,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_type: MessageType,
    pub message_id: Uuid,
    pub conversation_id: Uuid,
    pub source_peer_id: Uuid,
    pub target_peer_id: Uuid,
    pub principal_identity_info: PrincipalIdentityInfo,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<RpcResult>,
}

impl Envelope {
    /// First 8 bytes of the message id, as carried in the frame header.
    pub fn message_id_hash(&self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.message_id.as_bytes()[0..8]);
        out
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Build a response envelope addressed back to `self`'s source, carrying `result`.
    pub fn respond(&self, result: RpcResult) -> Envelope {
        Envelope {
            message_type: MessageType::AsyncRpcResponse,
            message_id: Uuid::new_v4(),
            conversation_id: self.conversation_id,
            source_peer_id: self.target_peer_id,
            target_peer_id: self.source_peer_id,
            principal_identity_info: self.principal_identity_info.clone(),
            payload_size: None,
            result: Some(result),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Envelope {
        Envelope {
            message_type: MessageType::Notification,
            message_id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            source_peer_id: Uuid::new_v4(),
            target_peer_id: Uuid::new_v4(),
            principal_identity_info: PrincipalIdentityInfo {
                authentication_token: AuthenticationToken {
                    token_type: "bearer".into(),
                    data: hex::encode(b"secret-token-bytes"),
                },
            },
            payload_size: Some(11),
            result: None,
        }
    }

    #[test]
    fn json_round_trip() {
        let env = sample();
        let bytes = env.to_bytes().unwrap();
        let parsed = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(env.message_id, parsed.message_id);
        assert_eq!(env.target_peer_id, parsed.target_peer_id);
    }

    #[test]
    fn missing_required_field_fails_parse() {
        let bad = br#"{"messageType":"Notification"}"#;
        assert!(Envelope::from_bytes(bad).is_err());
    }

    #[test]
    fn fingerprint_is_stable_and_type_scoped() {
        let tok_a = AuthenticationToken {
            token_type: "bearer".into(),
            data: hex::encode(b"same-bytes"),
        };
        let tok_b = AuthenticationToken {
            token_type: "oauth".into(),
            data: hex::encode(b"same-bytes"),
        };
        assert_eq!(tok_a.fingerprint(), tok_a.fingerprint());
        assert_ne!(tok_a.fingerprint(), tok_b.fingerprint());
    }
}
