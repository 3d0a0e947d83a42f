//! Isolation domains.
//!
//! A domain owns a capability set, at most one loaded module, and its own
//! escalation channel. The channel is handed over at construction and
//! can only be subscribed to from the domain's initializer, which runs
//! before any module code.
//!
//! Lifecycle: `Created → Initialized → Running → Unloading → Unloaded`.

pub mod module;

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::escalation::{AsyncFailureMonitor, EscalationChannel, Failure};
use crate::policy::{CapabilitySet, IdentityToken};

pub use module::{Module, ModuleCatalog, ModuleContext, ModuleManifest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Created,
    Initialized,
    Running,
    Unloading,
    Unloaded,
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DomainState::Created => "created",
            DomainState::Initialized => "initialized",
            DomainState::Running => "running",
            DomainState::Unloading => "unloading",
            DomainState::Unloaded => "unloaded",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DomainCreationError {
    #[error("domain name must not be empty")]
    EmptyName,
    #[error("a live domain named '{0}' already exists")]
    NameInUse(String),
    #[error("cannot resolve application base {path}: {reason}")]
    UnresolvedBase { path: PathBuf, reason: String },
    #[error("escalation channel '{0}' is already shared with another owner")]
    SharedChannel(String),
    #[error("domain initializer failed: {0}")]
    Initializer(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("module failed: {0}")]
    ModuleFailed(Failure),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("cannot load module {path}: {reason}")]
    ModuleLoad { path: PathBuf, reason: String },
    #[error("no module named '{0}' in the catalog")]
    UnknownEntry(String),
    #[error("domain already holds module {0}")]
    ModuleAlreadyLoaded(PathBuf),
    #[error("domain is {0}")]
    DomainUnavailable(DomainState),
}

impl ExecutionError {
    /// The failure to report for this error. For a module failure this is
    /// the module's own message.
    pub fn failure(&self) -> Failure {
        match self {
            ExecutionError::ModuleFailed(failure) => failure.clone(),
            other => Failure::new(other.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UnloadError {
    #[error("domain '{0}' is already unloaded")]
    AlreadyUnloaded(String),
    #[error("domain '{0}' was never initialized")]
    NotInitialized(String),
}

/// Names of the live domains sharing one host.
#[derive(Default)]
pub struct DomainRegistry {
    live: Mutex<HashSet<String>>,
}

impl DomainRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn claim(&self, name: &str) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string())
    }

    fn release(&self, name: &str) {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }

    #[cfg(test)]
    pub fn is_live(&self, name: &str) -> bool {
        self.live
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(name)
    }
}

/// Runs once, inside the new domain, before any module code.
pub type Initializer = Box<dyn FnOnce(&DomainContext<'_>) -> anyhow::Result<()> + Send>;

/// What the initializer sees of the domain being created.
pub struct DomainContext<'a> {
    name: &'a str,
    capabilities: &'a CapabilitySet,
    channel: &'a EscalationChannel,
}

impl DomainContext<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        self.capabilities
    }

    pub fn escalation(&self) -> &EscalationChannel {
        self.channel
    }

    /// Installs the domain's failure monitor. Only one is allowed.
    ///
    /// The monitor is host code, so the domain must trust the host identity.
    pub fn install_monitor(&self, monitor: AsyncFailureMonitor) -> anyhow::Result<()> {
        if !self.capabilities.trusts(&IdentityToken::host()) {
            anyhow::bail!(
                "domain '{}' does not trust the host identity; cannot install a failure monitor",
                self.name
            );
        }
        if self.channel.monitor_count() > 0 {
            anyhow::bail!("domain '{}' already has a failure monitor", self.name);
        }
        monitor.install(self.channel);
        debug!("Failure monitor installed in domain '{}'", self.name);
        Ok(())
    }
}

/// Everything needed to create a domain except its capabilities.
pub struct DomainSetup {
    pub name: String,
    pub application_base: PathBuf,
    pub channel: Arc<EscalationChannel>,
    pub catalog: Arc<ModuleCatalog>,
    pub initializer: Option<Initializer>,
}

impl DomainSetup {
    pub fn new(
        name: &str,
        application_base: impl Into<PathBuf>,
        channel: Arc<EscalationChannel>,
        catalog: Arc<ModuleCatalog>,
    ) -> Self {
        Self {
            name: name.to_string(),
            application_base: application_base.into(),
            channel,
            catalog,
            initializer: None,
        }
    }

    pub fn initializer<F>(mut self, initializer: F) -> Self
    where
        F: FnOnce(&DomainContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.initializer = Some(Box::new(initializer));
        self
    }
}

struct LoadedModule {
    path: PathBuf,
    module: Arc<dyn Module>,
}

pub struct IsolationDomain {
    id: Uuid,
    name: String,
    base: PathBuf,
    capabilities: Arc<CapabilitySet>,
    state: DomainState,
    module: Option<LoadedModule>,
    channel: Arc<EscalationChannel>,
    catalog: Arc<ModuleCatalog>,
    registry: Arc<DomainRegistry>,
}

impl IsolationDomain {
    /// Creates a domain and runs its initializer.
    ///
    /// The channel must be exclusively owned by the setup: a channel that
    /// is still shared (with the host or another domain) is rejected.
    pub fn create(
        registry: &Arc<DomainRegistry>,
        setup: DomainSetup,
        capabilities: Arc<CapabilitySet>,
    ) -> Result<Self, DomainCreationError> {
        let DomainSetup {
            name,
            application_base,
            channel,
            catalog,
            initializer,
        } = setup;

        if name.is_empty() {
            return Err(DomainCreationError::EmptyName);
        }
        let base = application_base.canonicalize().map_err(|e| {
            DomainCreationError::UnresolvedBase {
                path: application_base.clone(),
                reason: e.to_string(),
            }
        })?;
        if Arc::strong_count(&channel) != 1 {
            return Err(DomainCreationError::SharedChannel(channel.name().to_string()));
        }
        if !registry.claim(&name) {
            return Err(DomainCreationError::NameInUse(name));
        }

        let mut domain = Self {
            id: Uuid::new_v4(),
            name,
            base,
            capabilities,
            state: DomainState::Created,
            module: None,
            channel,
            catalog,
            registry: Arc::clone(registry),
        };

        if let Some(initializer) = initializer {
            let context = DomainContext {
                name: &domain.name,
                capabilities: &domain.capabilities,
                channel: &domain.channel,
            };
            // On failure `domain` is dropped, which releases the name.
            initializer(&context)
                .map_err(|e| DomainCreationError::Initializer(format!("{e:#}")))?;
        }
        domain.state = DomainState::Initialized;

        info!(
            "Domain '{}' ({}) created at {} with {} grant(s)",
            domain.name,
            domain.id,
            domain.base.display(),
            domain.capabilities.len()
        );
        Ok(domain)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DomainState {
        self.state
    }

    pub fn capabilities(&self) -> &Arc<CapabilitySet> {
        &self.capabilities
    }

    pub fn application_base(&self) -> &Path {
        &self.base
    }

    pub fn loaded_module(&self) -> Option<&Path> {
        self.module.as_ref().map(|m| m.path.as_path())
    }

    /// Background units of this domain not yet reclaimed.
    pub fn pending_units(&self) -> usize {
        self.channel.pending()
    }

    /// Loads (on first call) and runs the module's entry point.
    ///
    /// Synchronous failures, returned or panicked, come back as
    /// `ExecutionError::ModuleFailed`. Failures of background units the
    /// module started are never reported here.
    pub async fn execute(&mut self, module_path: impl AsRef<Path>) -> Result<(), ExecutionError> {
        if !matches!(self.state, DomainState::Initialized | DomainState::Running) {
            return Err(ExecutionError::DomainUnavailable(self.state));
        }

        let requested = self.base.join(module_path.as_ref());
        let path = requested
            .canonicalize()
            .map_err(|e| ExecutionError::ModuleLoad {
                path: requested.clone(),
                reason: e.to_string(),
            })?;

        let module = match &self.module {
            Some(loaded) if loaded.path == path => Arc::clone(&loaded.module),
            Some(loaded) => return Err(ExecutionError::ModuleAlreadyLoaded(loaded.path.clone())),
            None => {
                let module = self.load(&path).await?;
                self.module = Some(LoadedModule {
                    path: path.clone(),
                    module: Arc::clone(&module),
                });
                module
            }
        };
        self.state = DomainState::Running;

        info!("Domain '{}': executing {}", self.name, module.name());
        let context = ModuleContext::new(&self.name, Arc::clone(&self.channel));
        let outcome = tokio::task::spawn_blocking(move || module.main(&context)).await;

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ExecutionError::ModuleFailed(Failure::from_error(&e))),
            Err(join_err) if join_err.is_panic() => Err(ExecutionError::ModuleFailed(
                Failure::from_panic(join_err.into_panic()),
            )),
            Err(join_err) => Err(ExecutionError::ModuleFailed(Failure::new(
                join_err.to_string(),
            ))),
        }
    }

    /// Checks the declared capabilities, then resolves the manifest entry.
    async fn load(&self, path: &Path) -> Result<Arc<dyn Module>, ExecutionError> {
        if !self.capabilities.permits_execute() {
            return Err(ExecutionError::PermissionDenied("execute".to_string()));
        }
        let dir = path.parent().unwrap_or(path);
        if !self.capabilities.permits_discovery(dir) {
            return Err(ExecutionError::PermissionDenied(format!(
                "discover {}",
                dir.display()
            )));
        }
        if !self.capabilities.permits_read(path) {
            return Err(ExecutionError::PermissionDenied(format!(
                "read {}",
                path.display()
            )));
        }

        let manifest = ModuleManifest::load(path)
            .await
            .map_err(|e| ExecutionError::ModuleLoad {
                path: path.to_path_buf(),
                reason: format!("{e:#}"),
            })?;
        let module = self
            .catalog
            .get(&manifest.entry)
            .ok_or_else(|| ExecutionError::UnknownEntry(manifest.entry.clone()))?;

        debug!(
            "Domain '{}': loaded {} (entry '{}')",
            self.name,
            path.display(),
            manifest.entry
        );
        Ok(module)
    }

    /// Releases the module and the domain name.
    pub fn unload(&mut self) -> Result<(), UnloadError> {
        match self.state {
            DomainState::Unloading | DomainState::Unloaded => {
                return Err(UnloadError::AlreadyUnloaded(self.name.clone()));
            }
            DomainState::Created => return Err(UnloadError::NotInitialized(self.name.clone())),
            DomainState::Initialized | DomainState::Running => {}
        }

        self.state = DomainState::Unloading;
        self.module = None;
        self.registry.release(&self.name);
        self.state = DomainState::Unloaded;

        let pending = self.channel.pending();
        if pending > 0 {
            warn!(
                "Domain '{}' unloaded with {pending} background unit(s) not reclaimed",
                self.name
            );
        }
        info!("Domain '{}' unloaded", self.name);
        Ok(())
    }
}

impl Drop for IsolationDomain {
    fn drop(&mut self) {
        if self.state != DomainState::Unloaded {
            self.registry.release(&self.name);
        }
    }
}
