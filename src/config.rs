use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::LabError;
use crate::paths::Layout;

pub const DEFAULT_BASE_DIR: &str = "/opt/lab";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/lab/lab.toml";

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default = "/opt/lab")]
    pub base_dir: String,
    #[facet(default = "qemu:///system")]
    pub libvirt_uri: String,
    #[facet(default)]
    pub defaults: VmDefaults,
    #[facet(default)]
    pub discovery: DiscoveryConfig,
    #[facet(default)]
    pub provision: ProvisionConfig,
    #[facet(default)]
    pub ssh: SshConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_dir: DEFAULT_BASE_DIR.into(),
            libvirt_uri: "qemu:///system".into(),
            defaults: VmDefaults::default(),
            discovery: DiscoveryConfig::default(),
            provision: ProvisionConfig::default(),
            ssh: SshConfig::default(),
        }
    }
}

/// Resources used when a VM's `details.yaml` omits `cpus` / `mem`.
#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct VmDefaults {
    #[facet(default = 4)]
    pub cpus: u32,
    #[facet(default = 8192)]
    pub memory_mb: u64,
    #[facet(default = "40G")]
    pub disk_size: String,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            cpus: 4,
            memory_mb: 8192,
            disk_size: "40G".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DiscoveryConfig {
    #[facet(default = 300)]
    pub timeout_s: u64,
    #[facet(default = 1000)]
    pub interval_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            timeout_s: 300,
            interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ProvisionConfig {
    #[facet(default = "/tmp")]
    pub staging_dir: String,
    #[facet(default = 4)]
    pub max_parallel: usize,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            staging_dir: "/tmp".into(),
            max_parallel: 4,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SshConfig {
    /// OpenSSH-format known_hosts file consulted before anything else.
    pub known_hosts: Option<String>,
    #[facet(default)]
    pub accept_unknown_hosts: bool,
    #[facet(default = 120)]
    pub connect_timeout_s: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            known_hosts: None,
            accept_unknown_hosts: false,
            connect_timeout_s: 120,
        }
    }
}

impl Config {
    pub fn layout(&self) -> Layout {
        Layout::new(&self.base_dir)
    }

    pub fn discovery_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.discovery.timeout_s)
    }

    pub fn discovery_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.discovery.interval_ms)
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &Config) -> Result<(), LabError> {
    if config.base_dir.is_empty() {
        return Err(LabError::Validation {
            message: "base_dir must not be empty".into(),
        });
    }
    if config.defaults.cpus < 1 {
        return Err(LabError::Validation {
            message: "defaults.cpus must be at least 1".into(),
        });
    }
    if config.defaults.memory_mb < 256 {
        return Err(LabError::Validation {
            message: "defaults.memory_mb must be at least 256".into(),
        });
    }
    if config.discovery.interval_ms == 0 {
        return Err(LabError::Validation {
            message: "discovery.interval_ms must be greater than 0".into(),
        });
    }
    if config.provision.max_parallel == 0 {
        return Err(LabError::Validation {
            message: "provision.max_parallel must be at least 1".into(),
        });
    }
    if !config.provision.staging_dir.starts_with('/') {
        return Err(LabError::Validation {
            message: format!(
                "provision.staging_dir must be absolute (got '{}')",
                config.provision.staging_dir
            ),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Where to look for `lab.toml` when `--config` is not given.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("lab").join("lab.toml"));
    }
    paths.push(PathBuf::from(SYSTEM_CONFIG_PATH));
    paths
}

pub fn parse_config(contents: &str, origin: &Path) -> Result<Config, LabError> {
    let config: Config = facet_toml::from_str(contents).map_err(|e| LabError::ConfigParse {
        path: origin.display().to_string(),
        message: e.to_string(),
    })?;
    validate_config(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config, LabError> {
    let contents = std::fs::read_to_string(path).map_err(|source| LabError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;
    parse_config(&contents, path)
}

/// Resolve the effective configuration.
///
/// An explicit path must exist. Otherwise the first existing default path is
/// used, and built-in defaults apply when none exists.
pub fn resolve_config(explicit: Option<&Path>, base_dir: Option<&Path>) -> Result<Config, LabError> {
    let mut config = match explicit {
        Some(path) => load_config(path)?,
        None => match default_config_paths().into_iter().find(|p| p.exists()) {
            Some(path) => {
                tracing::debug!(path = %path.display(), "using config file");
                load_config(&path)?
            }
            None => Config::default(),
        },
    };

    if let Some(dir) = base_dir {
        config.base_dir = dir.display().to_string();
    }
    validate_config(&config)?;
    Ok(config)
}
