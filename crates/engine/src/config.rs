//! Engine configuration.

use chunkstash_store::{Committer, DEFAULT_REF, RetryPolicy};
use chunkstash_transfer::{DEFAULT_CHUNK_SIZE, ENCODED_PAYLOAD_LIMIT, encoded_len};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Files up to this size are written as a single object.
pub const DEFAULT_DIRECT_WRITE_LIMIT: u64 = 20 * 1024 * 1024;

/// Absolute per-file ceiling.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Tunables shared by every coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Raw bytes per chunk.
    pub chunk_size: u64,
    /// Largest file written as one object instead of chunks.
    pub direct_write_limit: u64,
    /// Files above this are rejected.
    pub max_file_size: u64,
    /// Ref published to and read from.
    pub ref_name: String,
    /// How many times a publish is rebuilt after losing a ref race.
    pub publish_attempts: u32,
    /// Public URL prefix for objects on the ref, e.g. a CDN in front of
    /// the repository. Unchunked records get `<base>/<path>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_base_url: Option<String>,
    pub committer: Committer,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            direct_write_limit: DEFAULT_DIRECT_WRITE_LIMIT,
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            ref_name: DEFAULT_REF.into(),
            publish_attempts: 3,
            public_base_url: None,
            committer: Committer::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Checks that the settings are usable.
    pub fn validate(&self) -> Result<(), EngineError> {
        validate_chunk_size(self.chunk_size)?;
        if self.direct_write_limit > self.max_file_size {
            return Err(EngineError::InvalidInput(format!(
                "direct_write_limit ({}) exceeds max_file_size ({})",
                self.direct_write_limit, self.max_file_size
            )));
        }
        if self.ref_name.trim().is_empty() {
            return Err(EngineError::InvalidInput("ref_name is empty".into()));
        }
        if self.publish_attempts == 0 {
            return Err(EngineError::InvalidInput(
                "publish_attempts must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::InvalidInput(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Public URL of `path`, when a base is configured.
    pub fn public_url(&self, path: &str) -> Option<String> {
        self.public_base_url
            .as_deref()
            .map(str::trim)
            .filter(|base| !base.is_empty())
            .map(|base| format!("{}/{path}", base.trim_end_matches('/')))
    }
}

/// Rejects chunk sizes that are zero or too large to send once encoded.
pub fn validate_chunk_size(chunk_size: u64) -> Result<(), EngineError> {
    if chunk_size == 0 {
        return Err(EngineError::InvalidInput("chunk size must be positive".into()));
    }
    if encoded_len(chunk_size) > ENCODED_PAYLOAD_LIMIT {
        return Err(EngineError::InvalidInput(format!(
            "chunk size {chunk_size} encodes to {} bytes, over the {ENCODED_PAYLOAD_LIMIT}-byte limit",
            encoded_len(chunk_size)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunk_size, 15 * 1024 * 1024);
        assert_eq!(config.ref_name, "heads/main");
        assert_eq!(config.committer.name, "Chunkstash Bot");
    }

    #[test]
    fn rejects_zero_chunk_size() {
        let config = EngineConfig {
            chunk_size: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn rejects_chunks_over_payload_ceiling() {
        // 15 MiB encodes to exactly 20 MiB; one more byte does not fit.
        validate_chunk_size(DEFAULT_CHUNK_SIZE).unwrap();
        assert!(validate_chunk_size(DEFAULT_CHUNK_SIZE + 1).is_err());
    }

    #[test]
    fn rejects_direct_limit_above_max() {
        let config = EngineConfig {
            direct_write_limit: 10,
            max_file_size: 5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_attempts() {
        let mut config = EngineConfig::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let config: EngineConfig = toml::from_str(
            r#"
            chunk_size = 1048576
            ref_name = "heads/uploads"

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.ref_name, "heads/uploads");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 500);
        assert_eq!(config.max_file_size, DEFAULT_MAX_FILE_SIZE);
        assert_eq!(config.public_base_url, None);
    }

    #[test]
    fn public_url_joins_base_and_path() {
        let mut config = EngineConfig::default();
        assert_eq!(config.public_url("images/a.png"), None);

        config.public_base_url = Some("https://cdn.example.com/gh/acme/vault@main/".into());
        assert_eq!(
            config.public_url("images/a.png").as_deref(),
            Some("https://cdn.example.com/gh/acme/vault@main/images/a.png")
        );

        config.public_base_url = Some("  ".into());
        assert_eq!(config.public_url("images/a.png"), None);
    }
}
