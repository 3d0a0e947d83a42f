//! Modules bundled with the host.
//!
//! `buggy-plugin` is the default; the others exercise the remaining
//! failure paths (a properly joined unit, and a synchronous failure).

mod buggy_plugin;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::domain::{Module, ModuleCatalog, ModuleContext};

pub use buggy_plugin::BuggyPlugin;

/// Joins its background unit, so any failure is observed on the spot.
pub struct WellBehavedPlugin;

impl Module for WellBehavedPlugin {
    fn name(&self) -> &str {
        "well-behaved"
    }

    fn main(&self, context: &ModuleContext) -> Result<()> {
        let task = context.spawn("checked-worker", || anyhow::bail!("handled in place"));
        if let Err(failure) = task.join() {
            info!(
                "Domain '{}': background failure handled by the module: {failure}",
                context.domain_name()
            );
        }
        Ok(())
    }
}

/// Fails synchronously from its entry point.
pub struct SyncCrashPlugin;

impl Module for SyncCrashPlugin {
    fn name(&self) -> &str {
        "sync-crash"
    }

    fn main(&self, _context: &ModuleContext) -> Result<()> {
        anyhow::bail!("plugin failed before starting any work")
    }
}

/// Catalog with every bundled module registered.
pub fn catalog() -> ModuleCatalog {
    let mut catalog = ModuleCatalog::new();
    catalog.register(Arc::new(BuggyPlugin));
    catalog.register(Arc::new(WellBehavedPlugin));
    catalog.register(Arc::new(SyncCrashPlugin));
    catalog
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::EscalationChannel;

    #[test]
    fn test_catalog_contents() {
        let catalog = catalog();
        assert_eq!(catalog.names(), vec!["buggy-plugin", "sync-crash", "well-behaved"]);
    }

    #[test]
    fn test_well_behaved_leaves_nothing_to_escalate() {
        let channel = EscalationChannel::new("Sandbox");
        let context = ModuleContext::new("Sandbox", Arc::clone(&channel));
        WellBehavedPlugin.main(&context).unwrap();

        let report = channel.reap().unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.escalated, 0);
    }

    #[test]
    fn test_sync_crash_fails_synchronously() {
        let channel = EscalationChannel::new("Sandbox");
        let context = ModuleContext::new("Sandbox", Arc::clone(&channel));
        assert!(SyncCrashPlugin.main(&context).is_err());
        assert_eq!(channel.pending(), 0);
    }
}
