//! Relay protocol client: drop/pickup/confirm over HTTPS, and the
//! home-node poller that decrypts, rehydrates, and ingests conversation
//! drops (spec §4.H).

#![deny(unsafe_code)]

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use thiserror::Error;

use crystal_core::relay::{
    Channel, ConfirmResponse, ConversationMessage, ConversationPayload, DropResponse,
    PickupListResponse,
};
use crystal_core::{ChunkInput, Role};
use crystal_crypto::{CryptoError, Key, Payload};
use crystal_ingest::{IngestError, MAX_CAPTURE_BATCH_SIZE};

/// Messages longer than roughly this many estimated tokens are re-chunked
/// with the standard chunker rather than ingested as a single chunk (spec
/// §4.H "unless text exceeds ≈2 000 tokens").
const REHYDRATE_TOKEN_THRESHOLD: i64 = 2000;

/// Errors from relay client operations.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The HTTP transport failed after exhausting retries.
    #[error("relay transport failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The relay responded with a non-2xx status after exhausting retries.
    #[error("relay returned status {0}")]
    Status(reqwest::StatusCode),
    /// The response body did not parse as the expected JSON shape.
    #[error("relay response decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    /// Sealed-envelope verification/decryption failed.
    #[error("envelope crypto failed: {0}")]
    Crypto(#[from] CryptoError),
    /// The ingestion pipeline failed while rehydrating a drop.
    #[error("ingest failed: {0}")]
    Ingest(#[from] IngestError),
}

/// A thin HTTPS client for one relay deployment, scoped to a single
/// bearer token (spec §4.H).
pub struct RelayClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl RelayClient {
    /// Build a client against `base_url` (no trailing slash expected)
    /// authenticating with `token`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self { base_url: base_url.into(), token: token.into(), client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// `POST /drop/<channel>` with `body` as `application/octet-stream`.
    /// Retries up to 4 times with exponential backoff capped at 30s on
    /// transport failure or a non-2xx status; surfaces the final failure
    /// (spec §4.H "Drop").
    pub async fn drop_blob(&self, channel: Channel, body: Vec<u8>) -> Result<DropResponse, RelayError> {
        let backoff = ExponentialBuilder::default().with_max_times(4).with_max_delay(Duration::from_secs(30));
        let url = self.url(&format!("/drop/{channel}"));
        (|| async {
            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.token)
                .header("content-type", "application/octet-stream")
                .body(body.clone())
                .send()
                .await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(RelayError::Status(status));
            }
            let parsed: DropResponse = resp.json().await?;
            Ok(parsed)
        })
        .retry(backoff)
        .notify(|err: &RelayError, delay: Duration| {
            tracing::warn!(?delay, channel = %channel, error = %err, "drop_blob: retrying");
        })
        .await
    }

    /// `GET /pickup/<channel>` (spec §4.H "List"). Not retried; transient
    /// failures surface to the poller, which simply tries again next
    /// cycle.
    pub async fn list_blobs(&self, channel: Channel) -> Result<PickupListResponse, RelayError> {
        let resp = self
            .client
            .get(self.url(&format!("/pickup/{channel}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Status(status));
        }
        Ok(resp.json().await?)
    }

    /// `GET /pickup/<channel>/<id>` (spec §4.H "Fetch"), returning the raw
    /// sealed bytes.
    pub async fn fetch_blob(&self, channel: Channel, id: &str) -> Result<Vec<u8>, RelayError> {
        let resp = self
            .client
            .get(self.url(&format!("/pickup/{channel}/{id}")))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Status(status));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    /// `DELETE /confirm/<channel>/<id>` (spec §4.H "Confirm"); best-effort,
    /// failures are logged and swallowed rather than propagated.
    pub async fn confirm_blob(&self, channel: Channel, id: &str) {
        let url = self.url(&format!("/confirm/{channel}/{id}"));
        let result = self.client.delete(&url).bearer_auth(&self.token).send().await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                let _: Result<ConfirmResponse, _> = resp.json().await;
            }
            Ok(resp) => {
                tracing::warn!(channel = %channel, id, status = %resp.status(), "confirm_blob: non-2xx, ignoring");
            }
            Err(err) => {
                tracing::warn!(channel = %channel, id, error = %err, "confirm_blob: transport error, ignoring");
            }
        }
    }

    /// Seal `payload` under `key` and drop it on `channel` as a JSON
    /// sealed envelope (spec §4.H, §6).
    pub async fn drop_sealed(
        &self,
        channel: Channel,
        key: &Key,
        plaintext: &[u8],
    ) -> Result<DropResponse, RelayError> {
        let payload = crystal_crypto::seal(plaintext, key);
        let body = serde_json::to_vec(&payload)?;
        self.drop_blob(channel, body).await
    }
}

fn message_to_chunk(agent_id: &str, session_id: &str, msg: &ConversationMessage) -> Vec<ChunkInput> {
    let role: Role = msg.role.parse().unwrap_or(Role::User);
    let estimate = ((msg.text.chars().count() as f64) / 4.0).ceil() as i64;
    let texts = if estimate > REHYDRATE_TOKEN_THRESHOLD {
        crystal_chunker::chunk(&msg.text)
    } else {
        vec![msg.text.clone()]
    };
    texts
        .into_iter()
        .map(|text| ChunkInput {
            text,
            role,
            source_type: "conversation".to_string(),
            source_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
        })
        .collect()
}

/// Run one poll cycle against the `conversations` channel: list pending
/// drops, attempt HMAC-gated decrypt of each, ingest the rehydrated
/// chunks, then delete the blob. A drop that fails to decrypt is deleted
/// and skipped rather than left to block the channel (spec §4.H, §7
/// "Integrity" row). Returns the number of drops successfully ingested.
///
/// Reconstructing a per-agent file tree (transcript copy, session
/// summary, daily breadcrumb) is an external-collaborator concern (spec
/// §4.H, §1 "Out of scope") and is not performed here.
pub async fn poll_conversations(
    relay: &RelayClient,
    store: &crystal_store::Store,
    embedder: &crystal_embed::Provider,
    key: &Key,
) -> Result<usize, RelayError> {
    let listing = relay.list_blobs(Channel::Conversations).await?;
    let mut ingested = 0usize;

    for blob in listing.blobs {
        let sealed = match relay.fetch_blob(Channel::Conversations, &blob.id).await {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(id = %blob.id, error = %err, "poll_conversations: fetch failed, leaving for next cycle");
                continue;
            }
        };

        let decrypted = decode_and_open(&sealed, key).and_then(|plaintext| {
            serde_json::from_slice::<ConversationPayload>(&plaintext).map_err(RelayError::from)
        });

        let payload = match decrypted {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(id = %blob.id, error = %err, "poll_conversations: corrupt drop, deleting");
                relay.confirm_blob(Channel::Conversations, &blob.id).await;
                continue;
            }
        };

        let mut chunks = Vec::new();
        for msg in &payload.messages {
            chunks.extend(message_to_chunk(&payload.agent_id, &msg.session_id, msg));
        }

        let mut ok = true;
        for batch in chunks.chunks(MAX_CAPTURE_BATCH_SIZE) {
            if let Err(err) = crystal_ingest::ingest_with_retry(store, embedder, batch).await {
                tracing::error!(id = %blob.id, error = %err, "poll_conversations: ingest failed, leaving drop for retry");
                ok = false;
                break;
            }
        }

        if ok {
            relay.confirm_blob(Channel::Conversations, &blob.id).await;
            ingested += 1;
        }
    }

    Ok(ingested)
}

fn decode_and_open(sealed: &[u8], key: &Key) -> Result<Vec<u8>, RelayError> {
    let payload: Payload = serde_json::from_slice(sealed)?;
    Ok(crystal_crypto::open(&payload, key)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_key() -> Key {
        [7u8; 32]
    }

    #[test]
    fn short_message_yields_a_single_chunk() {
        let msg = ConversationMessage {
            text: "hello there".to_string(),
            role: "user".to_string(),
            timestamp: "2026-07-28T00:00:00Z".to_string(),
            session_id: "s1".to_string(),
        };
        let chunks = message_to_chunk("agent-1", "s1", &msg);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "hello there");
        assert_eq!(chunks[0].source_type, "conversation");
        assert_eq!(chunks[0].agent_id, "agent-1");
    }

    #[test]
    fn long_message_is_rechunked() {
        let long_text = "word ".repeat(3000); // far over the 2000-token threshold
        let msg = ConversationMessage {
            text: long_text,
            role: "assistant".to_string(),
            timestamp: "2026-07-28T00:00:00Z".to_string(),
            session_id: "s2".to_string(),
        };
        let chunks = message_to_chunk("agent-1", "s2", &msg);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.role == Role::Assistant));
    }

    #[test]
    fn unknown_role_falls_back_to_user() {
        let msg = ConversationMessage {
            text: "x".to_string(),
            role: "narrator".to_string(),
            timestamp: "2026-07-28T00:00:00Z".to_string(),
            session_id: "s3".to_string(),
        };
        let chunks = message_to_chunk("agent-1", "s3", &msg);
        assert_eq!(chunks[0].role, Role::User);
    }

    #[test]
    fn decode_and_open_round_trips() {
        let key = fixed_key();
        let payload = crystal_crypto::seal(b"plaintext body", &key);
        let sealed = serde_json::to_vec(&payload).unwrap();
        let opened = decode_and_open(&sealed, &key).unwrap();
        assert_eq!(opened, b"plaintext body");
    }

    #[test]
    fn decode_and_open_rejects_tampered_envelope() {
        let key = fixed_key();
        let mut payload = crystal_crypto::seal(b"plaintext body", &key);
        payload.hmac = "0".repeat(payload.hmac.len());
        let sealed = serde_json::to_vec(&payload).unwrap();
        assert!(decode_and_open(&sealed, &key).is_err());
    }
}
