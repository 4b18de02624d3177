// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use vcpin_utils::Placement;
use vcpin_utils::SYSFS_CPU_ROOT;

pub const DEFAULT_URI: &str = "qemu:///system";
pub const DEFAULT_INTERVAL_S: u64 = 300;

// Maximum size for config file (1 MB)
const MAX_CONFIG_SIZE: u64 = 1024 * 1024;

const CONFIG_PATHS: [&str; 2] = ["/etc/vcpin/config.toml", "/etc/vcpin.toml"];

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// libvirt connection URI
    pub uri: String,

    /// Delay between two pinning cycles in daemon mode
    pub interval_s: u64,

    /// How much of a core each vCPU may use
    pub placement: Placement,

    /// Path to the virsh binary
    pub virsh: String,

    /// Directory holding one cpuN entry per logical CPU
    pub sysfs_cpu_root: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            interval_s: DEFAULT_INTERVAL_S,
            placement: Placement::default(),
            virsh: "virsh".to_string(),
            sysfs_cpu_root: PathBuf::from(SYSFS_CPU_ROOT),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.uri.trim().is_empty() {
            bail!("Connection URI must not be empty");
        }
        if self.interval_s == 0 {
            bail!("interval_s must be greater than 0");
        }
        if self.virsh.trim().is_empty() {
            bail!("virsh path must not be empty");
        }
        Ok(())
    }
}

/// Load the config from `path`, or from the first default location that
/// exists, falling back to the built-in defaults. The result is not
/// validated yet, command line overrides still apply on top of it.
pub fn init_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => parse_config_file(path),
        None => match get_config_path() {
            Some(path) => parse_config_file(&path),
            None => Ok(Config::default()),
        },
    }
}

fn get_config_path() -> Option<PathBuf> {
    CONFIG_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

pub fn parse_config_file(path: &Path) -> Result<Config> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Failed to read metadata for {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        bail!(
            "Config file {} is too large: {} bytes exceeds maximum of {}",
            path.display(),
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    info!(path = %path.display(), "Using config file");
    parse_config_content(&content)
}

fn parse_config_content(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse TOML configuration")
}
