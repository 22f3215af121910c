//! Static configuration for a simulation run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{SimError, SimResult};

/// Tolerance used when checking that subpopulation fractions sum to one.
pub const FRACTION_SUM_TOLERANCE: f64 = 1e-9;

/// Top-level configuration for a population simulation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimulationConfig {
    /// Master seed; `None` draws one from entropy.
    pub master_seed: Option<u64>,
    /// Nominal integration step in hours.
    pub step_hours: f64,
    /// Smallest step adaptive refinement may use.
    pub min_step_hours: f64,
    /// Largest integrated hazard (`rate * dt`) allowed in one step before halving.
    pub max_step_hazard: f64,
    /// Slack allowed between credited death and `1 - viability`.
    pub conservation_epsilon: f64,
    /// Viability below which a subpopulation counts as effectively dead.
    pub dead_viability_threshold: f64,
    /// Number of step records retained in memory.
    pub history_capacity: usize,
    /// Coefficient of variation of the pipetted volume on passage; 0 disables the draw.
    pub passage_volume_cv: f64,
    pub latency: LatencyConfig,
    pub growth: GrowthConfig,
    pub hazard: HazardConfig,
    pub media: MediaConfig,
    pub cell_lines: BTreeMap<String, CellLineProfile>,
    pub compounds: BTreeMap<String, CompoundProfile>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            master_seed: None,
            step_hours: 0.1,
            min_step_hours: 0.005,
            max_step_hazard: 0.05,
            conservation_epsilon: 1e-9,
            dead_viability_threshold: 1e-6,
            history_capacity: 4_096,
            passage_volume_cv: 0.0,
            latency: LatencyConfig::default(),
            growth: GrowthConfig::default(),
            hazard: HazardConfig::default(),
            media: MediaConfig::default(),
            cell_lines: default_cell_lines(),
            compounds: default_compounds(),
        }
    }
}

/// Dose-to-delay mapping for commitment latency.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LatencyConfig {
    pub base_delay_hours: f64,
    pub min_delay_hours: f64,
    pub max_delay_hours: f64,
    /// Coefficient of variation of the log-normal sample.
    pub cv: f64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            base_delay_hours: 12.0,
            min_delay_hours: 1.5,
            max_delay_hours: 48.0,
            cv: 0.25,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GrowthConfig {
    /// Time constant of the post-seeding lag phase.
    pub lag_hours: f64,
    /// Growth penalty applied to edge wells.
    pub edge_penalty: f64,
    /// Confluence at which logistic growth stops.
    pub max_confluence: f64,
    /// Coefficient of variation of the per-vessel growth-rate multiplier; 0 disables the draw.
    pub rate_cv: f64,
    /// Monod half-saturation for glucose (mM).
    pub glucose_half_saturation_mm: f64,
    /// Monod half-saturation for glutamine (mM).
    pub glutamine_half_saturation_mm: f64,
}

impl Default for GrowthConfig {
    fn default() -> Self {
        Self {
            lag_hours: 6.0,
            edge_penalty: 0.15,
            max_confluence: 0.95,
            rate_cv: 0.05,
            glucose_half_saturation_mm: 1.0,
            glutamine_half_saturation_mm: 0.2,
        }
    }
}

/// Rates and thresholds for the non-compound hazard sources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HazardConfig {
    /// Background death rate (1/h).
    pub basal_rate: f64,
    /// Time constant over which attrition ramps in after commitment.
    pub attrition_ramp_hours: f64,
    /// Confluence above which crowding hazard begins.
    pub crowding_onset: f64,
    /// Crowding hazard at full confluence (1/h).
    pub crowding_rate: f64,
    /// Glucose level below which starvation hazard begins (mM).
    pub starvation_threshold_mm: f64,
    /// Starvation hazard with no glucose left (1/h).
    pub starvation_rate: f64,
    pub stress: StressConfig,
}

impl Default for HazardConfig {
    fn default() -> Self {
        Self {
            basal_rate: 0.001,
            attrition_ramp_hours: 1.0,
            crowding_onset: 0.85,
            crowding_rate: 0.05,
            starvation_threshold_mm: 2.0,
            starvation_rate: 0.1,
            stress: StressConfig::default(),
        }
    }
}

/// Dynamics of the organelle stress accumulators.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StressConfig {
    pub onset_rate: f64,
    pub recovery_rate: f64,
    /// Accumulator level below which stress carries no hazard.
    pub threshold: f64,
    /// Hazard at a saturated accumulator (1/h).
    pub max_rate: f64,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            onset_rate: 0.15,
            recovery_rate: 0.05,
            threshold: 0.3,
            max_rate: 0.2,
        }
    }
}

/// Nutrient supply and uptake.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    pub glucose_mm: f64,
    pub glutamine_mm: f64,
    /// Glucose consumed per million viable cells per hour (mM).
    pub glucose_uptake_mm: f64,
    /// Glutamine consumed per million viable cells per hour (mM).
    pub glutamine_uptake_mm: f64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            glucose_mm: 25.0,
            glutamine_mm: 4.0,
            glucose_uptake_mm: 0.05,
            glutamine_uptake_mm: 0.008,
        }
    }
}

/// One heterogeneity bucket of a cell line.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubpopulationProfile {
    pub name: String,
    pub fraction: f64,
    /// Multiplier on the potency reference; below 1 means more sensitive.
    pub sensitivity_shift: f64,
}

impl SubpopulationProfile {
    #[must_use]
    pub fn new(name: impl Into<String>, fraction: f64, sensitivity_shift: f64) -> Self {
        Self {
            name: name.into(),
            fraction,
            sensitivity_shift,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CellLineProfile {
    pub doubling_time_hours: f64,
    /// Cell count corresponding to 100% confluence.
    pub capacity_cells: f64,
    pub subpopulations: Vec<SubpopulationProfile>,
}

/// Stress pathway a compound drives in addition to direct attrition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StressAxis {
    EndoplasmicReticulum,
    Mitochondrial,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CompoundProfile {
    /// Concentration producing half-maximal effect (µM).
    pub ec50_um: f64,
    pub hill_slope: f64,
    /// Steady-state attrition hazard at saturating dose (1/h).
    pub max_attrition_rate: f64,
    #[serde(default)]
    pub stress_axis: Option<StressAxis>,
}

fn default_subpopulations() -> Vec<SubpopulationProfile> {
    vec![
        SubpopulationProfile::new("sensitive", 0.25, 0.7),
        SubpopulationProfile::new("typical", 0.5, 1.0),
        SubpopulationProfile::new("resistant", 0.25, 1.4),
    ]
}

fn default_cell_lines() -> BTreeMap<String, CellLineProfile> {
    let mut lines = BTreeMap::new();
    lines.insert(
        "A549".to_string(),
        CellLineProfile {
            doubling_time_hours: 22.0,
            capacity_cells: 2.5e6,
            subpopulations: default_subpopulations(),
        },
    );
    lines.insert(
        "HepG2".to_string(),
        CellLineProfile {
            doubling_time_hours: 48.0,
            capacity_cells: 3.0e6,
            subpopulations: default_subpopulations(),
        },
    );
    lines
}

fn default_compounds() -> BTreeMap<String, CompoundProfile> {
    let mut compounds = BTreeMap::new();
    compounds.insert(
        "staurosporine".to_string(),
        CompoundProfile {
            ec50_um: 0.05,
            hill_slope: 1.2,
            max_attrition_rate: 0.3,
            stress_axis: None,
        },
    );
    compounds.insert(
        "tunicamycin".to_string(),
        CompoundProfile {
            ec50_um: 1.0,
            hill_slope: 1.0,
            max_attrition_rate: 0.08,
            stress_axis: Some(StressAxis::EndoplasmicReticulum),
        },
    );
    compounds.insert(
        "cccp".to_string(),
        CompoundProfile {
            ec50_um: 5.0,
            hill_slope: 1.5,
            max_attrition_rate: 0.1,
            stress_axis: Some(StressAxis::Mitochondrial),
        },
    );
    compounds.insert(
        "paclitaxel".to_string(),
        CompoundProfile {
            ec50_um: 0.01,
            hill_slope: 1.0,
            max_attrition_rate: 0.15,
            stress_axis: None,
        },
    );
    compounds
}

impl SimulationConfig {
    /// Checks every parameter the engine relies on.
    pub fn validate(&self) -> SimResult<()> {
        if !(self.step_hours > 0.0) || !(self.min_step_hours > 0.0) {
            return Err(SimError::InvalidConfig("step sizes must be positive"));
        }
        if self.min_step_hours > self.step_hours {
            return Err(SimError::InvalidConfig(
                "min_step_hours cannot exceed step_hours",
            ));
        }
        if !(self.max_step_hazard > 0.0) {
            return Err(SimError::InvalidConfig("max_step_hazard must be positive"));
        }
        if !(self.conservation_epsilon >= 0.0) || !(self.dead_viability_threshold >= 0.0) {
            return Err(SimError::InvalidConfig(
                "conservation_epsilon and dead_viability_threshold must be non-negative",
            ));
        }
        if self.history_capacity == 0 {
            return Err(SimError::InvalidConfig("history_capacity must be non-zero"));
        }
        if !(self.passage_volume_cv >= 0.0) {
            return Err(SimError::InvalidConfig(
                "passage_volume_cv must be non-negative",
            ));
        }

        let latency = &self.latency;
        if !(latency.min_delay_hours > 0.0)
            || !(latency.max_delay_hours >= latency.min_delay_hours)
            || !(latency.base_delay_hours > 0.0)
        {
            return Err(SimError::InvalidConfig(
                "latency bounds must be positive and ordered",
            ));
        }
        if !(latency.cv >= 0.0) {
            return Err(SimError::InvalidConfig("latency cv must be non-negative"));
        }

        let growth = &self.growth;
        if !(growth.lag_hours >= 0.0)
            || !(0.0..1.0).contains(&growth.edge_penalty)
            || !(growth.max_confluence > 0.0)
            || !(growth.rate_cv >= 0.0)
            || !(growth.glucose_half_saturation_mm >= 0.0)
            || !(growth.glutamine_half_saturation_mm >= 0.0)
        {
            return Err(SimError::InvalidConfig(
                "growth parameters must be non-negative, edge penalty in [0, 1)",
            ));
        }

        let hazard = &self.hazard;
        if !(hazard.basal_rate >= 0.0)
            || !(hazard.attrition_ramp_hours >= 0.0)
            || !(hazard.crowding_rate >= 0.0)
            || !(0.0..1.0).contains(&hazard.crowding_onset)
            || !(hazard.starvation_threshold_mm >= 0.0)
            || !(hazard.starvation_rate >= 0.0)
        {
            return Err(SimError::InvalidConfig(
                "hazard rates must be non-negative, crowding onset in [0, 1)",
            ));
        }
        let stress = &hazard.stress;
        if !(stress.onset_rate >= 0.0)
            || !(stress.recovery_rate >= 0.0)
            || !(0.0..1.0).contains(&stress.threshold)
            || !(stress.max_rate >= 0.0)
        {
            return Err(SimError::InvalidConfig(
                "stress rates must be non-negative, threshold in [0, 1)",
            ));
        }

        let media = &self.media;
        if !(media.glucose_mm >= 0.0)
            || !(media.glutamine_mm >= 0.0)
            || !(media.glucose_uptake_mm >= 0.0)
            || !(media.glutamine_uptake_mm >= 0.0)
        {
            return Err(SimError::InvalidConfig("media values must be non-negative"));
        }

        for line in self.cell_lines.values() {
            line.validate()?;
        }
        for compound in self.compounds.values() {
            if !(compound.ec50_um > 0.0)
                || !(compound.hill_slope > 0.0)
                || !(compound.max_attrition_rate >= 0.0)
            {
                return Err(SimError::InvalidConfig(
                    "compound ec50 and hill slope must be positive, attrition non-negative",
                ));
            }
        }
        Ok(())
    }

    /// Returns the configured master seed, generating one from entropy if absent.
    #[must_use]
    pub fn resolved_seed(&self) -> u64 {
        match self.master_seed {
            Some(seed) => seed,
            None => rand::random(),
        }
    }
}

impl CellLineProfile {
    fn validate(&self) -> SimResult<()> {
        if !(self.doubling_time_hours > 0.0) || !(self.capacity_cells > 0.0) {
            return Err(SimError::InvalidConfig(
                "cell line doubling time and capacity must be positive",
            ));
        }
        if self.subpopulations.is_empty() {
            return Err(SimError::InvalidConfig(
                "cell line needs at least one subpopulation",
            ));
        }
        let mut total = 0.0;
        for (idx, sub) in self.subpopulations.iter().enumerate() {
            if !(sub.fraction > 0.0) || !(sub.sensitivity_shift > 0.0) {
                return Err(SimError::InvalidConfig(
                    "subpopulation fraction and sensitivity shift must be positive",
                ));
            }
            if self.subpopulations[..idx]
                .iter()
                .any(|other| other.name == sub.name)
            {
                return Err(SimError::InvalidConfig(
                    "subpopulation names must be unique",
                ));
            }
            total += sub.fraction;
        }
        if (total - 1.0).abs() > FRACTION_SUM_TOLERANCE {
            return Err(SimError::InvalidConfig(
                "subpopulation fractions must sum to 1",
            ));
        }
        Ok(())
    }
}
