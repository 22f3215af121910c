//! Splitting a vessel's population into a new vessel.

use serde::{Deserialize, Serialize};

use crate::VesselId;
use crate::error::{SimError, SimResult};
use crate::vessel::Vessel;

/// How a passage will move cells, decided before anything is mutated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferPlan {
    pub split_ratio: f64,
    pub cells_transferred: f64,
    pub retire_source: bool,
}

/// Result of a completed passage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub source_id: VesselId,
    pub target_id: VesselId,
    pub cells_transferred: f64,
    pub source_retired: bool,
}

/// Reject split ratios that would transfer more cells than exist.
pub fn validate_split_ratio(source_id: &VesselId, split_ratio: f64) -> SimResult<()> {
    if !split_ratio.is_finite() {
        return Err(SimError::InvalidTransfer {
            source_id: source_id.clone(),
            split_ratio,
            reason: "split ratio must be finite",
        });
    }
    if split_ratio < 1.0 {
        return Err(SimError::InvalidTransfer {
            source_id: source_id.clone(),
            split_ratio,
            reason: "split ratio below 1.0 would transfer more cells than exist",
        });
    }
    Ok(())
}

/// `cells_transferred = count / split_ratio`, scaled by pipetting error and capped at the source count.
///
/// A ratio of exactly 1.0 moves everything and retires the source; the
/// volume factor does not apply then.
pub fn plan_transfer(source: &Vessel, split_ratio: f64, volume_factor: f64) -> SimResult<TransferPlan> {
    validate_split_ratio(source.id(), split_ratio)?;
    let count = source.cell_count();
    if split_ratio == 1.0 {
        return Ok(TransferPlan {
            split_ratio,
            cells_transferred: count,
            retire_source: true,
        });
    }
    let nominal = count / split_ratio;
    let cells_transferred = (nominal * volume_factor.max(0.0)).min(count);
    Ok(TransferPlan {
        split_ratio,
        cells_transferred,
        retire_source: false,
    })
}
