//! Read surface handed to the measurement layer.
//!
//! Only aggregates leave the engine through here. Subpopulation fractions are
//! available for single-cell modalities; subpopulation viabilities and
//! hazards are ground truth and never appear in a projection.

use rand_distr::Normal;
use serde::{Deserialize, Serialize};

use crate::VesselId;
use crate::error::{SimError, SimResult};
use crate::streams::{DrawSite, RngStreams, StreamKind};
use crate::vessel::Vessel;

/// Aggregate state of a vessel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VesselReadout {
    pub vessel_id: VesselId,
    pub time_hours: f64,
    pub viability: f64,
    pub cell_count: f64,
    pub viable_cells: f64,
    pub confluence: f64,
}

impl VesselReadout {
    #[must_use]
    pub fn of(vessel: &Vessel) -> Self {
        Self {
            vessel_id: vessel.id().clone(),
            time_hours: vessel.time_hours(),
            viability: vessel.viability(),
            cell_count: vessel.cell_count(),
            viable_cells: vessel.viable_cells(),
            confluence: vessel.confluence(),
        }
    }
}

/// Subpopulation composition, as seen by single-cell profiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubpopulationFractions {
    pub vessel_id: VesselId,
    pub fractions: Vec<(String, f64)>,
}

impl SubpopulationFractions {
    #[must_use]
    pub fn of(vessel: &Vessel) -> Self {
        Self {
            vessel_id: vessel.id().clone(),
            fractions: vessel
                .subpopulations()
                .iter()
                .map(|sub| (sub.name().to_string(), sub.fraction()))
                .collect(),
        }
    }
}

/// Read-only handle given to assay code for the duration of one measurement.
pub struct AssayContext<'a> {
    vessel: &'a Vessel,
    streams: &'a mut RngStreams,
}

impl<'a> AssayContext<'a> {
    pub(crate) fn new(vessel: &'a Vessel, streams: &'a mut RngStreams) -> Self {
        Self { vessel, streams }
    }

    #[must_use]
    pub fn readout(&self) -> VesselReadout {
        VesselReadout::of(self.vessel)
    }

    #[must_use]
    pub fn subpopulation_fractions(&self) -> SubpopulationFractions {
        SubpopulationFractions::of(self.vessel)
    }

    /// Zero-mean Gaussian noise from the assay stream.
    pub fn noise(&mut self, std_dev: f64) -> SimResult<f64> {
        let dist = Normal::new(0.0, std_dev)
            .map_err(|_| SimError::InvalidCommand(format!("invalid noise std dev {std_dev}")))?;
        self.streams
            .sample(StreamKind::Assay, DrawSite::AssayNoise, &dist)
    }

    /// Draws taken from the assay stream so far.
    #[must_use]
    pub fn assay_draws(&self) -> u64 {
        self.streams.draw_count(StreamKind::Assay)
    }
}

/// State captured before a read-only operation, compared after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PurityWitness {
    fingerprint: u64,
    biology_draws: [u64; 3],
}

impl PurityWitness {
    pub(crate) fn capture(vessel: &Vessel, streams: &RngStreams) -> Self {
        Self {
            fingerprint: vessel.fingerprint(),
            biology_draws: streams.biology_draw_counts(),
        }
    }

    /// Fail with `PrematureMutation` if anything but assay draws moved.
    pub(crate) fn verify(
        self,
        vessel: &Vessel,
        streams: &RngStreams,
        operation: &str,
    ) -> SimResult<()> {
        if Self::capture(vessel, streams) != self {
            return Err(SimError::PrematureMutation {
                operation: format!("{operation} on vessel {}", vessel.id()),
            });
        }
        Ok(())
    }
}
