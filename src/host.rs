//! Host orchestration.
//!
//! Builds the capability set, creates the sandbox domain with a monitor
//! installed from its initializer, runs the module, forces a
//! finalization pass, and unloads the domain.
//!
//! The host's own escalation channel has no monitor: a background failure
//! left unobserved in host context is fatal by design.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::domain::{
    DomainCreationError, DomainRegistry, DomainSetup, IsolationDomain, ModuleCatalog, UnloadError,
};
use crate::escalation::{
    AsyncFailureMonitor, EscalationChannel, FailureLog, Finalizer, ReapReport,
    UnobservedAsyncFailure,
};
use crate::policy::{CapabilityPolicy, CapabilitySet, ConfigurationError, Grant, IdentityToken};

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("cannot determine working directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid capability grants: {0}")]
    Configuration(#[from] ConfigurationError),
    #[error("cannot create domain: {0}")]
    DomainCreation(#[from] DomainCreationError),
    #[error("cannot unload domain: {0}")]
    Unload(#[from] UnloadError),
    #[error("{0}")]
    Fatal(#[from] UnobservedAsyncFailure),
}

/// Outcome of a successful host run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// The module's entry point failed synchronously (recovered)
    pub execution_failed: bool,
    /// Totals over every finalization pass of the run
    pub finalization: ReapReport,
}

pub struct Host {
    finalizer: Finalizer,
    registry: Arc<DomainRegistry>,
    host_channel: Arc<EscalationChannel>,
    log: Arc<FailureLog>,
    identity: IdentityToken,
}

impl Host {
    pub fn new(log: Arc<FailureLog>) -> Self {
        let finalizer = Finalizer::new();
        let host_channel = finalizer.channel("host");
        Self {
            finalizer,
            registry: DomainRegistry::new(),
            host_channel,
            log,
            identity: IdentityToken::host(),
        }
    }

    /// Grants needed to run `module_path` from `base`.
    pub fn capabilities_for(
        &self,
        base: &Path,
        module_path: &Path,
        ui_access: bool,
    ) -> Result<CapabilitySet, ConfigurationError> {
        let mut policy = CapabilityPolicy::new()
            .grant(Grant::Execute)
            .grant(Grant::ReadFile(base.join(module_path)))
            .grant(Grant::DiscoverPath(base.to_path_buf()));
        if ui_access {
            policy = policy
                .grant(Grant::WindowAccess)
                .grant(Grant::ClipboardAccess);
        }
        policy
            .grant(Grant::TrustedIdentity(self.identity.clone()))
            .build()
    }

    /// Runs the configured module from the current working directory.
    pub async fn run(
        &self,
        config: &Config,
        catalog: Arc<ModuleCatalog>,
    ) -> Result<RunReport, HostError> {
        let cwd = std::env::current_dir()?;
        self.run_in(&cwd, config, catalog).await
    }

    pub async fn run_in(
        &self,
        base: &Path,
        config: &Config,
        catalog: Arc<ModuleCatalog>,
    ) -> Result<RunReport, HostError> {
        let module_path = &config.domain.module_path;
        let capabilities = Arc::new(self.capabilities_for(
            base,
            module_path,
            config.host.ui_access,
        )?);

        let log = Arc::clone(&self.log);
        let setup = DomainSetup::new(
            &config.domain.name,
            base,
            self.finalizer.channel(&config.domain.name),
            catalog,
        )
        .initializer(move |ctx| {
            debug!(
                "Initializing domain '{}' (channel '{}', {} grant(s))",
                ctx.name(),
                ctx.escalation().name(),
                ctx.capabilities().len()
            );
            ctx.install_monitor(AsyncFailureMonitor::new(log))
        });
        let mut domain = IsolationDomain::create(&self.registry, setup, capabilities)?;
        info!(
            "Sandbox '{}' ({}) at {}: {}",
            domain.name(),
            domain.id(),
            domain.application_base().display(),
            domain.capabilities().summary()
        );

        let mut report = RunReport::default();
        if let Err(e) = domain.execute(module_path).await {
            warn!("Module execution failed: {e}");
            self.log.log(&e.failure());
            report.execution_failed = true;
        }
        if let Some(loaded) = domain.loaded_module() {
            debug!(
                "Domain '{}' is {} with {} ({} background unit(s) pending)",
                domain.name(),
                domain.state(),
                loaded.display(),
                domain.pending_units()
            );
        }

        // Reveal anything the module left unobserved while the monitor is still around
        report.finalization += self.collect()?;
        domain.unload()?;

        if config.host.simulate_host_fault {
            self.simulate_error();
        }
        report.finalization += self.collect()?;

        info!(
            "Run finished: {} unit(s) reclaimed, {} escalation(s), {} observed",
            report.finalization.reclaimed,
            report.finalization.escalated,
            report.finalization.observed
        );
        Ok(report)
    }

    /// Explicit finalization pass over the host and every live domain.
    pub fn collect(&self) -> Result<ReapReport, UnobservedAsyncFailure> {
        debug!(
            "Finalization pass over {} channel(s)",
            self.finalizer.live_channels()
        );
        self.finalizer.collect().inspect_err(|unobserved| {
            error!("Finalization revealed an unobserved failure: {unobserved}");
        })
    }

    /// Faults a background unit in host context and waits on its raw
    /// completion handle, leaving the failure unobserved.
    pub fn simulate_error(&self) {
        let task = self
            .host_channel
            .spawn("host-worker", || anyhow::bail!("serious error."));
        task.completion().wait();
    }
}
