use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub domain: DomainConfig,
    #[serde(default)]
    pub host: HostConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DomainConfig {
    #[serde(default = "default_domain_name")]
    pub name: String,
    /// Module manifest, relative to the current working directory.
    /// Supports ${ENV_VAR} substitution
    #[serde(default = "default_module_path")]
    pub module_path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HostConfig {
    /// Grant window and clipboard access to the domain
    #[serde(default = "default_ui_access")]
    pub ui_access: bool,
    /// Fault a background unit in host context after teardown (fatal)
    #[serde(default)]
    pub simulate_host_fault: bool,
}

fn default_domain_name() -> String {
    "Sandbox".to_string()
}

fn default_module_path() -> PathBuf {
    PathBuf::from("plugins/buggy-plugin.toml")
}

fn default_ui_access() -> bool {
    true
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            name: default_domain_name(),
            module_path: default_module_path(),
        }
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            ui_access: default_ui_access(),
            simulate_host_fault: false,
        }
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${PLUGIN_DIR}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
