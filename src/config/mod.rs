use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_INDEX_URL: &str = "https://index.docker.io";

/// Resolved configuration for a single CLI invocation.
///
/// Layered lowest to highest precedence: built-in defaults, `SHOEBOX_*`
/// environment variables, then CLI flags. Each layer overrides only the
/// fields it actually sets — `Config::default()` then `apply_env` then
/// `apply_cli` is a straight left fold.
///
/// There is no project-local layer: this system has a single global root
/// directory, not a per-project manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub shoebox_dir: PathBuf,
    pub index_url: String,
    pub bridge: BridgeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            shoebox_dir: default_shoebox_dir(),
            index_url: DEFAULT_INDEX_URL.to_string(),
            bridge: BridgeConfig::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeConfig {
    /// Detect the bridge from `/etc/lxc/lxc-usernet`.
    Auto,
    /// No private networking.
    None,
    /// Use a named bridge device.
    Named(String),
}

fn default_shoebox_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".shoebox"))
        .unwrap_or_else(|| PathBuf::from(".shoebox"))
}

impl Config {
    /// Layer 1: built-in defaults, optionally overridden by a config file at
    /// `{shoebox_dir}/config.toml` if one exists.
    pub fn defaults() -> Result<Self> {
        let mut config = Config::default();
        let candidate = config.shoebox_dir.join("config.toml");
        if candidate.exists() {
            let text = std::fs::read_to_string(&candidate)
                .with_context(|| format!("failed to read {}", candidate.display()))?;
            config = toml::from_str(&text)
                .with_context(|| format!("failed to parse {}", candidate.display()))?;
        }
        Ok(config)
    }

    /// Layer 2: `SHOEBOX_DIR` / `SHOEBOX_INDEX_URL` environment variables.
    pub fn apply_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("SHOEBOX_DIR") {
            self.shoebox_dir = shellexpand::tilde(&dir).to_string().into();
        }
        if let Ok(url) = std::env::var("SHOEBOX_INDEX_URL") {
            self.index_url = url;
        }
        self
    }

    /// Layer 3: CLI flags, each `Option` applied only when the flag was given.
    pub fn apply_cli(
        mut self,
        shoebox_dir: Option<PathBuf>,
        index_url: Option<String>,
        bridge: Option<BridgeConfig>,
    ) -> Self {
        if let Some(dir) = shoebox_dir {
            self.shoebox_dir = dir;
        }
        if let Some(url) = index_url {
            self.index_url = url;
        }
        if let Some(bridge) = bridge {
            self.bridge = bridge;
        }
        self
    }

    pub fn images_dir(&self) -> PathBuf {
        self.shoebox_dir.join("images")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.shoebox_dir.join("containers")
    }

    pub fn container_dir(&self, container_id: &str) -> PathBuf {
        self.containers_dir().join(container_id)
    }

    /// Ensure the directories the runtime always needs exist. Per-container
    /// directories are created on demand by the container store (§4.9).
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.shoebox_dir, &self.images_dir(), &self.containers_dir()] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory: {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_home_shoebox_dir() {
        let config = Config::default();
        assert!(config.shoebox_dir.ends_with(".shoebox"));
        assert_eq!(config.index_url, DEFAULT_INDEX_URL);
        assert_eq!(config.bridge, BridgeConfig::Auto);
    }

    #[test]
    fn cli_overrides_env_overrides_defaults() {
        let config = Config::default()
            .apply_env()
            .apply_cli(Some(PathBuf::from("/tmp/sb")), None, None);
        assert_eq!(config.shoebox_dir, PathBuf::from("/tmp/sb"));
        assert_eq!(config.index_url, DEFAULT_INDEX_URL);
    }

    #[test]
    fn env_only_value_is_still_honored_without_cli_override() {
        std::env::set_var("SHOEBOX_INDEX_URL", "https://example.test");
        let config = Config::default().apply_env().apply_cli(None, None, None);
        assert_eq!(config.index_url, "https://example.test");
        std::env::remove_var("SHOEBOX_INDEX_URL");
    }
}
