use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::Deserialize;

use crate::escalation::{EscalationChannel, Task};

/// Runtime context passed to a module's entry point.
///
/// Gives the module the name of the domain it runs in and a way to
/// start background work on that domain's escalation channel.
pub struct ModuleContext {
    domain: String,
    channel: Arc<EscalationChannel>,
}

impl ModuleContext {
    pub(crate) fn new(domain: &str, channel: Arc<EscalationChannel>) -> Self {
        Self {
            domain: domain.to_string(),
            channel,
        }
    }

    pub fn domain_name(&self) -> &str {
        &self.domain
    }

    /// Starts a background unit inside the domain.
    pub fn spawn<F>(&self, name: &str, work: F) -> Task
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.channel.spawn(name, work)
    }
}

/// An untrusted module with a single parameterless entry point.
///
/// The entry point either returns, fails synchronously (error or panic),
/// or leaves background units behind that may fault on their own.
pub trait Module: Send + Sync {
    /// Catalog key, referenced by `entry` in a module manifest.
    fn name(&self) -> &str;

    fn main(&self, context: &ModuleContext) -> anyhow::Result<()>;
}

/// On-disk description of a module (TOML).
///
/// ```toml
/// entry = "buggy-plugin"
/// description = "Faults in the background"
/// ```
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ModuleManifest {
    pub entry: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl ModuleManifest {
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }
}

/// Entry points a domain is able to load, keyed by name.
#[derive(Default)]
pub struct ModuleCatalog {
    modules: HashMap<String, Arc<dyn Module>>,
}

impl ModuleCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a module. A module with the same name is replaced.
    pub fn register(&mut self, module: Arc<dyn Module>) {
        self.modules.insert(module.name().to_string(), module);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.modules.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
