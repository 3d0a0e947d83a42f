use anyhow::Result;

use crate::domain::{Module, ModuleContext};

/// Starts a background unit that fails, then waits on the unit's raw
/// completion handle. The wait never inspects the outcome, so the
/// failure is left unobserved for the domain's monitor to pick up.
pub struct BuggyPlugin;

impl Module for BuggyPlugin {
    fn name(&self) -> &str {
        "buggy-plugin"
    }

    fn main(&self, context: &ModuleContext) -> Result<()> {
        let task = context.spawn("buggy-worker", || anyhow::bail!("oops"));

        // Wait for the unit without observing its failure
        task.completion().wait();
        Ok(())
    }
}
