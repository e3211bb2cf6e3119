//! CLI configuration at `~/.stalltun/config.toml`.
//!
//! The file holds a `[tunnel]` table. CLI flags always override file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use stalltun_core::TunnelConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tunnel: TunnelSection,
}

/// `[tunnel]` section. Every field is optional so flags can fill the gaps.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelSection {
    pub listen_addr: Option<SocketAddr>,
    pub remote_addr: Option<String>,
    pub buffer_size: Option<usize>,
    pub connect_timeout_ms: Option<u64>,
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub listen_addr: Option<SocketAddr>,
    pub remote_addr: Option<String>,
    pub buffer_size: Option<usize>,
    pub connect_timeout_ms: Option<u64>,
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Merge CLI overrides over the file and produce a validated
    /// [`TunnelConfig`].
    pub fn resolve(self, cli: Overrides) -> Result<TunnelConfig> {
        let file = self.tunnel;
        let remote = cli
            .remote_addr
            .or(file.remote_addr)
            .context("no remote address: pass --remote or set tunnel.remote_addr")?;

        let mut config = TunnelConfig::new(remote);
        if let Some(addr) = cli.listen_addr.or(file.listen_addr) {
            config.listen_addr = addr;
        }
        if let Some(size) = cli.buffer_size.or(file.buffer_size) {
            config.buffer_size = size;
        }
        config.connect_timeout_ms = cli.connect_timeout_ms.or(file.connect_timeout_ms);

        config.validate()?;
        Ok(config)
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
