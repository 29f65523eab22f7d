//! Wire types shared by the relay client, dead-drop server, and mirror
//! protocol (spec §4.H/§4.I/§4.J, §6 "Relay wire protocol").
//!
//! Keeping these in `crystal-core` means the client (`crystal-relay`), the
//! server (`crystal-deaddrop`), and the mirror pusher/puller
//! (`crystal-mirror`) all serialize the exact same shapes without any one
//! of them depending on another's crate.

use serde::{Deserialize, Serialize};

/// Maximum accepted blob size on the dead drop (spec §4.I, §6).
pub const MAX_BLOB_BYTES: u64 = 100 * 1024 * 1024;

/// Blob retention ceiling before the TTL sweep reclaims it (spec §4.I).
pub const BLOB_TTL_SECS: i64 = 24 * 60 * 60;

/// The two one-way relay channels (spec §4.H). `conversations` carries
/// devices-to-home capture traffic; `mirror` carries home-to-devices
/// snapshot pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Device → home conversation drops.
    Conversations,
    /// Home → device mirror snapshot drops.
    Mirror,
}

impl Channel {
    /// The path segment used in relay URLs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Conversations => "conversations",
            Channel::Mirror => "mirror",
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conversations" => Ok(Channel::Conversations),
            "mirror" => Ok(Channel::Mirror),
            other => Err(format!("unknown relay channel '{other}'")),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response body of `POST /drop/:channel` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropResponse {
    /// Always `true`; present for shape-compatibility with the other
    /// envelope responses.
    pub ok: bool,
    /// The UUID assigned to the stored blob.
    pub id: String,
    /// Channel the blob was dropped under.
    pub channel: String,
    /// Size of the stored body, in bytes.
    pub size: u64,
    /// ISO-8601 UTC drop timestamp.
    pub dropped_at: String,
}

/// One entry of `GET /pickup/:channel`'s `blobs` array (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobSummary {
    /// Blob UUID.
    pub id: String,
    /// Size in bytes.
    pub size: u64,
    /// ISO-8601 UTC drop timestamp.
    pub dropped_at: String,
    /// Agent id the bearer token resolved to at drop time.
    pub agent_id: String,
}

/// Response body of `GET /pickup/:channel` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickupListResponse {
    /// Channel listed.
    pub channel: String,
    /// Number of entries in `blobs`.
    pub count: usize,
    /// Blobs currently held under the channel, oldest first.
    pub blobs: Vec<BlobSummary>,
}

/// Response body of `DELETE /confirm/:channel/:id` (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmResponse {
    /// Always `true` on success; absent responses are represented as a
    /// non-2xx status instead.
    pub ok: bool,
    /// Whether a blob was actually removed (`false` would only occur if
    /// this shape were reused for an idempotent re-confirm; the dead drop
    /// currently 404s on an absent id instead).
    pub deleted: bool,
}

/// Response body of `GET /health` (spec §6), unauthenticated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `true` while the process is serving requests.
    pub ok: bool,
    /// Fixed service identifier.
    pub service: String,
    /// Deployment mode label (`"dead-drop"`).
    pub mode: String,
}

/// One message within a [`ConversationPayload`] (spec §4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Raw message text.
    pub text: String,
    /// Speaker role, as a string (`"user"`, `"assistant"`, `"system"`).
    pub role: String,
    /// Originating timestamp, ISO-8601 UTC.
    pub timestamp: String,
    /// Capture session identifier.
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

/// The plaintext body sealed and dropped on the `conversations` channel
/// (spec §4.H).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPayload {
    /// Capturing agent id.
    pub agent_id: String,
    /// ISO-8601 UTC timestamp the payload was assembled.
    pub dropped_at: String,
    /// Messages carried in this drop.
    pub messages: Vec<ConversationMessage>,
}

/// The plaintext metadata payload sealed alongside the store bytes on a
/// mirror push (spec §4.J).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorMetaPayload {
    /// SHA-256 of the raw (unsealed) store bytes.
    pub hash: String,
    /// Size of the raw store bytes.
    pub size: u64,
    /// ISO-8601 UTC timestamp the snapshot was sealed.
    pub pushed_at: String,
}

/// Body of `POST /drop/mirror`: two independently sealed envelopes (spec
/// §4.J, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorDropBody {
    /// Sealed [`MirrorMetaPayload`].
    pub meta: crystal_crypto_payload::Payload,
    /// Sealed raw store bytes.
    pub db: crystal_crypto_payload::Payload,
}

/// Re-exported here under a private alias so [`MirrorDropBody`] can name
/// `crystal_crypto::Payload` without `crystal-core` depending on
/// `crystal-crypto` for anything beyond this one field type.
mod crystal_crypto_payload {
    pub use crystal_crypto::Payload;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_round_trips_through_str() {
        assert_eq!("conversations".parse::<Channel>().unwrap(), Channel::Conversations);
        assert_eq!("mirror".parse::<Channel>().unwrap(), Channel::Mirror);
        assert!("bogus".parse::<Channel>().is_err());
        assert_eq!(Channel::Conversations.as_str(), "conversations");
        assert_eq!(Channel::Mirror.to_string(), "mirror");
    }

    #[test]
    fn conversation_payload_round_trips_through_json() {
        let payload = ConversationPayload {
            agent_id: "agent-1".to_string(),
            dropped_at: "2026-07-28T00:00:00Z".to_string(),
            messages: vec![ConversationMessage {
                text: "hello".to_string(),
                role: "user".to_string(),
                timestamp: "2026-07-28T00:00:00Z".to_string(),
                session_id: "s1".to_string(),
            }],
        };
        let raw = serde_json::to_string(&payload).unwrap();
        assert!(raw.contains("sessionId"));
        let back: ConversationPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.messages[0].session_id, "s1");
    }
}
