//! CLI configuration.
//!
//! Stored as TOML, by default at:
//! - Linux: `~/.config/chunkstash/config.toml`
//! - Windows: `%APPDATA%/chunkstash/config.toml`
//!
//! The GitHub token may instead come from `CHUNKSTASH_GITHUB_TOKEN`.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chunkstash_engine::{EngineConfig, FlatConfig};
use chunkstash_store::GithubConfig;
use serde::{Deserialize, Serialize};

/// Environment variable that overrides `github.token`.
pub const TOKEN_ENV: &str = "CHUNKSTASH_GITHUB_TOKEN";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    #[serde(default)]
    pub github: GithubConfig,

    /// Flat backend; flat uploads are unavailable when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flat: Option<FlatConfig>,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl CliConfig {
    /// Loads from `path` (or the default location), writing defaults there
    /// first if the file does not exist.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => config_path()?,
        };

        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
        } else {
            let config = CliConfig::default();
            config.save(&path)?;
            config
        };

        if let Ok(token) = std::env::var(TOKEN_ENV)
            && !token.is_empty()
        {
            config.github.token = token;
        }

        config
            .engine
            .validate()
            .with_context(|| format!("invalid [engine] section in {}", path.display()))?;
        Ok(config)
    }

    /// Writes the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        // May contain tokens.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

/// Returns the platform-specific configuration file path.
fn config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        Ok(PathBuf::from(appdata).join("chunkstash").join("config.toml"))
    }

    #[cfg(not(target_os = "windows"))]
    {
        let home = std::env::var("HOME").context("HOME is not set")?;
        Ok(PathBuf::from(home)
            .join(".config")
            .join("chunkstash")
            .join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_writes_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let config = CliConfig::load(Some(&path)).unwrap();
        assert_eq!(config.engine, EngineConfig::default());
        assert!(path.exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml_str = r#"
            [github]
            owner = "octo"
            repo = "files"

            [engine]
            chunk_size = 1048576
        "#;
        let config: CliConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.github.owner, "octo");
        assert_eq!(config.github.api_url, GithubConfig::default().api_url);
        assert_eq!(config.engine.chunk_size, 1_048_576);
        assert_eq!(config.engine.ref_name, EngineConfig::default().ref_name);
        assert!(config.flat.is_none());
    }

    #[test]
    fn flat_section_roundtrip() {
        let config = CliConfig {
            flat: Some(FlatConfig {
                endpoint: "https://bucket.example.com".into(),
                public_base_url: "https://cdn.example.com".into(),
                token: "t".into(),
            }),
            ..CliConfig::default()
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: CliConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn invalid_engine_section_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[engine]\nchunk_size = 0\n").unwrap();
        assert!(CliConfig::load(Some(&path)).is_err());
    }
}
