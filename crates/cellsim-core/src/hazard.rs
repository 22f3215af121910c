//! Per-step mortality hazard sources.
//!
//! Hazards are pure functions of the vessel state at a point in time and the
//! exposure history. Compound-driven sources (attrition and the organelle
//! stress drives) only switch on once a subpopulation's sampled commitment
//! delay for that exposure has elapsed.

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::{HazardConfig, LatencyConfig, SimulationConfig, StressAxis, StressConfig};
use crate::error::SimError;
use crate::latency::mean_delay_hours;
use crate::potency::{hill_occupancy, is_lethal, steady_state_hazard};
use crate::vessel::{CompoundExposure, DeathCause, StressState, Subpopulation, Vessel};
use crate::{ExposureId, VesselId};

/// Origin of a hazard contribution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum HazardSource {
    Basal,
    CompoundAttrition(ExposureId),
    ErStress,
    MitochondrialDysfunction,
    NutrientDepletion,
    Confluence,
}

impl HazardSource {
    /// Ledger cause credited with deaths from this source.
    #[must_use]
    pub const fn cause(self) -> DeathCause {
        match self {
            HazardSource::Basal => DeathCause::Basal,
            HazardSource::CompoundAttrition(_) => DeathCause::CompoundAttrition,
            HazardSource::ErStress => DeathCause::ErStress,
            HazardSource::MitochondrialDysfunction => DeathCause::MitochondrialDysfunction,
            HazardSource::NutrientDepletion => DeathCause::NutrientDepletion,
            HazardSource::Confluence => DeathCause::Confluence,
        }
    }
}

/// One mortality rate (1/h) from one source.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HazardContribution {
    pub source: HazardSource,
    pub rate_per_hour: f64,
}

impl HazardContribution {
    #[must_use]
    pub const fn new(source: HazardSource, rate_per_hour: f64) -> Self {
        Self {
            source,
            rate_per_hour,
        }
    }
}

/// Where a (subpopulation, exposure) pair stands at some moment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitmentStatus {
    /// Sub-lethal, or washed out before the delay elapsed.
    Inert,
    /// Lethal-range, delay not yet elapsed.
    Pending,
    Committed,
}

/// Compound attrition for one exposure plus bookkeeping about how it was derived.
#[derive(Debug, Clone, PartialEq)]
pub struct AttritionEvaluation {
    pub contributions: Vec<HazardContribution>,
    pub status: CommitmentStatus,
    /// Set when no delay had been sampled and a fallback was used.
    pub stale: Option<SimError>,
}

/// Resolve the commitment delay for a pair, falling back to the mean when unsampled.
fn resolve_delay(
    vessel_id: &VesselId,
    subpopulation: &Subpopulation,
    exposure: &CompoundExposure,
    ratio: f64,
    latency: &LatencyConfig,
) -> (f64, Option<SimError>) {
    let key = subpopulation.latency_key(exposure);
    if let Some(delay) = subpopulation.commitments().delay(&key) {
        return (delay, None);
    }
    let fallback = mean_delay_hours(ratio, latency).unwrap_or(latency.max_delay_hours);
    let stale = SimError::StaleExposureReference {
        vessel_id: vessel_id.clone(),
        subpopulation: subpopulation.name().to_string(),
        exposure: exposure.id,
    };
    error!(
        vessel = %vessel_id,
        subpopulation = subpopulation.name(),
        exposure = %exposure.id,
        fallback_delay_hours = fallback,
        "commitment delay missing at hazard evaluation; using mean delay"
    );
    (fallback, Some(stale))
}

/// Commitment status of a pair `elapsed_hours` after the exposure started.
#[must_use]
pub fn commitment_status(
    subpopulation: &Subpopulation,
    exposure: &CompoundExposure,
    elapsed_hours: f64,
) -> CommitmentStatus {
    let ratio = exposure.dose_ratio_for(subpopulation);
    if !is_lethal(ratio) {
        return CommitmentStatus::Inert;
    }
    let key = subpopulation.latency_key(exposure);
    let Some(delay) = subpopulation.commitments().delay(&key) else {
        return if subpopulation.commitments().is_pending(&key) {
            CommitmentStatus::Pending
        } else {
            CommitmentStatus::Inert
        };
    };
    if delay > exposure.window_hours() {
        CommitmentStatus::Inert
    } else if elapsed_hours >= delay {
        CommitmentStatus::Committed
    } else {
        CommitmentStatus::Pending
    }
}

/// Compound attrition hazard for one subpopulation and one exposure.
///
/// Zero below the lethal dose ratio and before the sampled delay. After the
/// delay the steady-state rate ramps in over `attrition_ramp_hours`. A pair
/// washed out before its delay elapsed never commits; a committed pair keeps
/// accruing after washout.
#[must_use]
pub fn compute_hazards(
    vessel_id: &VesselId,
    subpopulation: &Subpopulation,
    elapsed_hours: f64,
    exposure: &CompoundExposure,
    config: &SimulationConfig,
) -> AttritionEvaluation {
    let ratio = exposure.dose_ratio_for(subpopulation);
    if !is_lethal(ratio) || elapsed_hours < 0.0 {
        return AttritionEvaluation {
            contributions: Vec::new(),
            status: CommitmentStatus::Inert,
            stale: None,
        };
    }
    if exposure.end_hours.is_some()
        && subpopulation
            .commitments()
            .delay(&subpopulation.latency_key(exposure))
            .is_none()
    {
        // Washed out before the delay was ever sampled.
        return AttritionEvaluation {
            contributions: Vec::new(),
            status: CommitmentStatus::Inert,
            stale: None,
        };
    }
    let (delay, stale) = resolve_delay(vessel_id, subpopulation, exposure, ratio, &config.latency);
    if delay > exposure.window_hours() {
        return AttritionEvaluation {
            contributions: Vec::new(),
            status: CommitmentStatus::Inert,
            stale,
        };
    }
    if elapsed_hours < delay {
        return AttritionEvaluation {
            contributions: Vec::new(),
            status: CommitmentStatus::Pending,
            stale,
        };
    }
    let steady = steady_state_hazard(
        ratio,
        exposure.potency.hill_slope,
        exposure.max_attrition_rate,
    );
    let ramp = onset_ramp(elapsed_hours - delay, config.hazard.attrition_ramp_hours);
    let rate = steady * ramp;
    let contributions = if rate > 0.0 {
        vec![HazardContribution::new(
            HazardSource::CompoundAttrition(exposure.id),
            rate,
        )]
    } else {
        Vec::new()
    };
    AttritionEvaluation {
        contributions,
        status: CommitmentStatus::Committed,
        stale,
    }
}

fn onset_ramp(since_commit_hours: f64, ramp_hours: f64) -> f64 {
    if ramp_hours <= 0.0 {
        return 1.0;
    }
    1.0 - (-since_commit_hours / ramp_hours).exp()
}

/// Environmental conditions shared by every subpopulation in a vessel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Environment {
    pub confluence: f64,
    pub glucose_mm: f64,
}

impl Environment {
    #[must_use]
    pub fn of(vessel: &Vessel) -> Self {
        Self {
            confluence: vessel.confluence(),
            glucose_mm: vessel.media().glucose_mm,
        }
    }
}

/// Basal, crowding, starvation and organelle-stress hazards for one subpopulation.
#[must_use]
pub fn environment_hazards(
    stress: &StressState,
    environment: &Environment,
    config: &HazardConfig,
) -> Vec<HazardContribution> {
    let mut out = Vec::with_capacity(5);
    if config.basal_rate > 0.0 {
        out.push(HazardContribution::new(HazardSource::Basal, config.basal_rate));
    }
    if environment.confluence > config.crowding_onset {
        let excess = (environment.confluence - config.crowding_onset) / (1.0 - config.crowding_onset);
        out.push(HazardContribution::new(
            HazardSource::Confluence,
            config.crowding_rate * excess.min(1.0),
        ));
    }
    if environment.glucose_mm < config.starvation_threshold_mm {
        let deficit = 1.0 - environment.glucose_mm.max(0.0) / config.starvation_threshold_mm;
        out.push(HazardContribution::new(
            HazardSource::NutrientDepletion,
            config.starvation_rate * deficit,
        ));
    }
    let er = stress_hazard(stress.er, &config.stress);
    if er > 0.0 {
        out.push(HazardContribution::new(HazardSource::ErStress, er));
    }
    let mito = stress_hazard(stress.mito, &config.stress);
    if mito > 0.0 {
        out.push(HazardContribution::new(
            HazardSource::MitochondrialDysfunction,
            mito,
        ));
    }
    out.retain(|c| c.rate_per_hour > 0.0);
    out
}

fn stress_hazard(level: f64, config: &StressConfig) -> f64 {
    if level <= config.threshold {
        return 0.0;
    }
    config.max_rate * (level - config.threshold) / (1.0 - config.threshold)
}

/// Drive on a stress axis: summed occupancy of committed, present exposures, capped at 1.
#[must_use]
pub fn stress_drive(
    subpopulation: &Subpopulation,
    exposures: &[CompoundExposure],
    axis: StressAxis,
    time_hours: f64,
) -> f64 {
    exposures
        .iter()
        .filter(|exposure| exposure.stress_axis == Some(axis) && exposure.is_present_at(time_hours))
        .filter(|exposure| {
            commitment_status(subpopulation, exposure, time_hours - exposure.start_hours)
                == CommitmentStatus::Committed
        })
        .map(|exposure| {
            hill_occupancy(
                exposure.dose_ratio_for(subpopulation),
                exposure.potency.hill_slope,
            )
        })
        .sum::<f64>()
        .min(1.0)
}

/// Advance an accumulator `ds/dt = k_on * d * (1 - s) - k_off * s` exactly over `dt`.
#[must_use]
pub fn integrate_stress(level: f64, drive: f64, dt_hours: f64, config: &StressConfig) -> f64 {
    let on = config.onset_rate * drive;
    let rate = on + config.recovery_rate;
    if rate <= 0.0 {
        return level;
    }
    let target = on / rate;
    (target + (level - target) * (-rate * dt_hours).exp()).clamp(0.0, 1.0)
}

/// All hazard contributions for subpopulation `index` at `time_hours`.
pub(crate) fn subpopulation_hazards(
    vessel: &Vessel,
    index: usize,
    time_hours: f64,
    environment: &Environment,
    config: &SimulationConfig,
) -> (Vec<HazardContribution>, Vec<SimError>) {
    let sub = &vessel.subpopulations()[index];
    let mut contributions = environment_hazards(&sub.stress(), environment, &config.hazard);
    let mut stale = Vec::new();
    for exposure in vessel.exposures() {
        let evaluation = compute_hazards(
            vessel.id(),
            sub,
            time_hours - exposure.start_hours,
            exposure,
            config,
        );
        contributions.extend(evaluation.contributions);
        stale.extend(evaluation.stale);
    }
    (contributions, stale)
}
