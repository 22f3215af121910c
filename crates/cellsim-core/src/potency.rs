//! Dose to per-subpopulation potency conversion.

use serde::{Deserialize, Serialize};

use crate::config::CompoundProfile;

/// Potency reference of a compound: half-maximal concentration plus slope.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PotencyReference {
    pub ec50_um: f64,
    pub hill_slope: f64,
}

impl From<&CompoundProfile> for PotencyReference {
    fn from(profile: &CompoundProfile) -> Self {
        Self {
            ec50_um: profile.ec50_um,
            hill_slope: profile.hill_slope,
        }
    }
}

/// Dose ratios at or above this value are lethal-range.
pub const LETHAL_DOSE_RATIO: f64 = 1.0;

/// Reference concentration after applying a subpopulation's sensitivity shift.
#[must_use]
pub fn effective_reference(reference: &PotencyReference, sensitivity_shift: f64) -> f64 {
    reference.ec50_um * sensitivity_shift
}

/// Nominal dose expressed in multiples of the shifted reference.
#[must_use]
pub fn dose_ratio(nominal_dose_um: f64, reference: &PotencyReference, sensitivity_shift: f64) -> f64 {
    nominal_dose_um / effective_reference(reference, sensitivity_shift)
}

#[must_use]
pub fn is_lethal(ratio: f64) -> bool {
    ratio >= LETHAL_DOSE_RATIO
}

/// Hill occupancy `r^h / (1 + r^h)` for a dose ratio.
#[must_use]
pub fn hill_occupancy(ratio: f64, hill_slope: f64) -> f64 {
    if ratio <= 0.0 {
        return 0.0;
    }
    let powered = ratio.powf(hill_slope);
    if powered.is_infinite() {
        return 1.0;
    }
    powered / (1.0 + powered)
}

/// Steady-state attrition hazard (1/h); zero in the sub-lethal range.
#[must_use]
pub fn steady_state_hazard(ratio: f64, hill_slope: f64, max_rate: f64) -> f64 {
    if !is_lethal(ratio) {
        return 0.0;
    }
    max_rate * hill_occupancy(ratio, hill_slope)
}
