//! Core population dynamics and death accounting for simulated cell cultures.
//!
//! A [`Simulation`] owns a set of vessels. Each vessel holds fixed-fraction
//! subpopulations whose viabilities evolve independently under compound
//! exposure, nutrient state and crowding. Every step commits death before
//! growth, credits each death to a cause, and checks that credited death never
//! exceeds what viability allows.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod engine;
pub mod error;
pub mod growth;
pub mod hazard;
pub mod latency;
pub mod observe;
pub mod passage;
pub mod potency;
pub mod streams;
pub mod vessel;

pub use config::{
    CellLineProfile, CompoundProfile, GrowthConfig, HazardConfig, LatencyConfig, MediaConfig,
    SimulationConfig, StressAxis, StressConfig, SubpopulationProfile,
};
pub use engine::{
    AdvanceSummary, Command, CommandOutcome, NullSink, Simulation, StepRecord, TrajectorySink,
};
pub use error::{SimError, SimResult};
pub use hazard::{HazardContribution, HazardSource};
pub use latency::LatencyKey;
pub use observe::{AssayContext, SubpopulationFractions, VesselReadout};
pub use passage::TransferOutcome;
pub use potency::PotencyReference;
pub use streams::{DrawSite, RngStreams, StreamKind};
pub use vessel::{
    CompoundExposure, DeathCause, DeathLedger, KillCause, MediaState, Subpopulation,
    SubpopulationPhase, Vessel,
};

/// Caller-assigned vessel identifier (typically a plate well such as `P1_B03`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VesselId(String);

impl VesselId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VesselId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VesselId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for VesselId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Monotonic identifier assigned to each dosing event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ExposureId(pub u64);

impl ExposureId {
    /// Returns the following identifier.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ExposureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exp-{}", self.0)
    }
}
