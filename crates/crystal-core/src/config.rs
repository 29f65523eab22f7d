//! Typed configuration resolution (spec §4.M).
//!
//! Resolution order for any value: explicit override, process environment,
//! a `.env` file inside `dataDir`, then an external secret-manager lookup.
//! The secret manager is an external collaborator (spec §1); it is modeled
//! here as a trait with a no-op default so the resolver can be exercised
//! without a concrete secret backend.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors produced while resolving configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// `embeddingProvider` did not match a recognised provider.
    #[error("unknown embedding provider '{0}'; expected one of openai, ollama, google")]
    UnknownProvider(String),
    /// A required value had no source at all.
    #[error("missing required configuration value '{0}'")]
    Missing(&'static str),
    /// The resolved data directory could not be determined.
    #[error("could not determine a data directory: {0}")]
    NoDataDir(String),
}

/// Recognised embedding provider modes (spec §4.D).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmbeddingProvider {
    /// Remote batched OpenAI-style API, 1536-dim default.
    OpenAi,
    /// Local HTTP Ollama server, 768-dim default.
    Ollama,
    /// Remote batched Google API, 768-dim default.
    Google,
}

impl std::str::FromStr for EmbeddingProvider {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(EmbeddingProvider::OpenAi),
            "ollama" => Ok(EmbeddingProvider::Ollama),
            "google" => Ok(EmbeddingProvider::Google),
            other => Err(ConfigError::UnknownProvider(other.to_string())),
        }
    }
}

/// Lookup interface for an external secret manager. Resolution falls back
/// to this after overrides, env vars, and `.env`; the default no-op
/// implementation means "no secret manager configured".
pub trait SecretLookup: Send + Sync {
    /// Look up a named secret; `Ok(None)` means "not found", not an error.
    fn lookup(&self, key: &str) -> Result<Option<String>, String>;
}

/// A [`SecretLookup`] that never finds anything, used when no external
/// secret manager is wired in.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSecretLookup;

impl SecretLookup for NoSecretLookup {
    fn lookup(&self, _key: &str) -> Result<Option<String>, String> {
        Ok(None)
    }
}

/// Resolved, typed configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem path holding `crystal.db` and ambient state files.
    pub data_dir: PathBuf,
    /// Selected embedding provider.
    pub embedding_provider: EmbeddingProvider,
    /// Provider-specific API key, if any.
    pub embedding_api_key: Option<String>,
    /// Provider-specific model name override.
    pub embedding_model: Option<String>,
    /// Local-HTTP host override (Ollama).
    pub embedding_local_host: Option<String>,
    /// Relay base URL.
    pub relay_url: Option<String>,
    /// Relay bearer token.
    pub relay_token: Option<String>,
    /// Path to the relay sealing key file.
    pub relay_key_path: Option<PathBuf>,
    /// This node/agent's identifier.
    pub agent_id: String,
}

/// Explicit overrides accepted by [`resolve`]; any field left `None` falls
/// through to the next resolution source.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Override for `data_dir`.
    pub data_dir: Option<PathBuf>,
    /// Override for `embedding_provider`.
    pub embedding_provider: Option<String>,
    /// Override for `embedding_api_key`.
    pub embedding_api_key: Option<String>,
    /// Override for `embedding_model`.
    pub embedding_model: Option<String>,
    /// Override for `embedding_local_host`.
    pub embedding_local_host: Option<String>,
    /// Override for `relay_url`.
    pub relay_url: Option<String>,
    /// Override for `relay_token`.
    pub relay_token: Option<String>,
    /// Override for `relay_key_path`.
    pub relay_key_path: Option<PathBuf>,
    /// Override for `agent_id`.
    pub agent_id: Option<String>,
}

fn resolve_string(
    explicit: Option<String>,
    env_key: &str,
    secrets: &dyn SecretLookup,
) -> Option<String> {
    explicit
        .or_else(|| std::env::var(env_key).ok())
        .or_else(|| secrets.lookup(env_key).ok().flatten())
}

/// Default data directory: `<home>/.ldm/memory` when it already contains a
/// store, otherwise a legacy fallback path `<home>/.memory-crystal`.
fn default_data_dir() -> Result<PathBuf, ConfigError> {
    let home = dirs_home().ok_or_else(|| ConfigError::NoDataDir("no home directory".into()))?;
    let preferred = home.join(".ldm").join("memory");
    if preferred.join("crystal.db").exists() {
        return Ok(preferred);
    }
    Ok(home.join(".memory-crystal"))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Resolve a [`Config`], applying `.env` loading from `data_dir` before
/// reading environment variables, per the documented precedence.
pub fn resolve(overrides: Overrides, secrets: &dyn SecretLookup) -> Result<Config, ConfigError> {
    let data_dir = match overrides.data_dir.clone() {
        Some(p) => p,
        None => default_data_dir()?,
    };

    // Load `.env` from the data directory, if present, before consulting
    // process environment variables (spec §4.M resolution order).
    let dotenv_path: PathBuf = data_dir.join(".env");
    if dotenv_path.exists() {
        let _ = dotenvy::from_path(&dotenv_path);
    }

    let provider_str = resolve_string(overrides.embedding_provider, "CRYSTAL_EMBEDDING_PROVIDER", secrets)
        .unwrap_or_else(|| "openai".to_string());
    let embedding_provider: EmbeddingProvider = provider_str.parse()?;

    let embedding_api_key =
        resolve_string(overrides.embedding_api_key, "CRYSTAL_EMBEDDING_API_KEY", secrets);
    let embedding_model =
        resolve_string(overrides.embedding_model, "CRYSTAL_EMBEDDING_MODEL", secrets);
    let embedding_local_host =
        resolve_string(overrides.embedding_local_host, "CRYSTAL_EMBEDDING_HOST", secrets);
    let relay_url = resolve_string(overrides.relay_url, "CRYSTAL_RELAY_URL", secrets);
    let relay_token = resolve_string(overrides.relay_token, "CRYSTAL_RELAY_TOKEN", secrets);
    let relay_key_path = overrides
        .relay_key_path
        .or_else(|| std::env::var("CRYSTAL_RELAY_KEY_PATH").ok().map(PathBuf::from));
    let agent_id = resolve_string(overrides.agent_id, "CRYSTAL_AGENT_ID", secrets)
        .unwrap_or_else(|| "default".to_string());

    Ok(Config {
        data_dir,
        embedding_provider,
        embedding_api_key,
        embedding_model,
        embedding_local_host,
        relay_url,
        relay_token,
        relay_key_path,
        agent_id,
    })
}

/// Convenience: resolve with no overrides and no secret manager.
pub fn resolve_default() -> Result<Config, ConfigError> {
    resolve(Overrides::default(), &NoSecretLookup)
}

/// Path to the store file under a resolved data directory.
pub fn store_path(data_dir: &Path) -> PathBuf {
    data_dir.join("crystal.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provider_errors() {
        let err = "azure".parse::<EmbeddingProvider>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownProvider(_)));
    }

    #[test]
    fn explicit_override_wins() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = Overrides {
            data_dir: Some(dir.path().to_path_buf()),
            embedding_provider: Some("ollama".into()),
            agent_id: Some("agent-x".into()),
            ..Default::default()
        };
        let cfg = resolve(overrides, &NoSecretLookup).unwrap();
        assert_eq!(cfg.embedding_provider, EmbeddingProvider::Ollama);
        assert_eq!(cfg.agent_id, "agent-x");
    }
}
