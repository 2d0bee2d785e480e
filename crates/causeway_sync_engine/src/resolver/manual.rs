//! Manual intervention.

use super::{ConflictStrategy, MergedOperation, NeedsManualResolution};
use causeway_sync_protocol::Operation;

/// Never resolves automatically; every conflict is parked for an operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualIntervention;

impl ConflictStrategy for ManualIntervention {
    fn name(&self) -> &'static str {
        "manual"
    }

    fn resolve(
        &self,
        _local: &Operation,
        remote: &Operation,
    ) -> Result<MergedOperation, NeedsManualResolution> {
        Err(NeedsManualResolution {
            strategy: self.name(),
            reason: format!("{} requires operator review", remote.entity_type),
        })
    }
}
