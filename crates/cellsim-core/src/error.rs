//! Error taxonomy for the population engine.

use thiserror::Error;

use crate::streams::{DrawSite, StreamKind};
use crate::{ExposureId, VesselId};

/// Errors raised while configuring or driving the simulation.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimError {
    /// Credited death exceeded `1 - viability` for a subpopulation.
    #[error(
        "conservation violated in vessel {vessel_id}, subpopulation {subpopulation}: \
         credited death {credited:.12} exceeds 1 - viability ({viability:.12}) by {residual:e}"
    )]
    ConservationViolation {
        vessel_id: VesselId,
        subpopulation: String,
        viability: f64,
        credited: f64,
        residual: f64,
    },
    /// A passage request that would transfer more cells than exist.
    #[error("invalid transfer from {source_id} (split ratio {split_ratio}): {reason}")]
    InvalidTransfer {
        source_id: VesselId,
        split_ratio: f64,
        reason: &'static str,
    },
    /// A write attempted from a path restricted to reads.
    #[error("premature mutation: {operation} is not permitted in a read-only context")]
    PrematureMutation { operation: String },
    /// Hazard evaluation found an exposure whose commitment delay was never sampled.
    #[error(
        "stale exposure reference: vessel {vessel_id}, subpopulation {subpopulation}, exposure {exposure}"
    )]
    StaleExposureReference {
        vessel_id: VesselId,
        subpopulation: String,
        exposure: ExposureId,
    },
    /// A draw site asked for a stream outside its allow-list.
    #[error("draw site {site:?} is not authorized to draw from the {stream:?} stream")]
    UnauthorizedDraw { site: DrawSite, stream: StreamKind },
    /// Instant kill requested while a step has committed death but not growth.
    #[error("vessel {vessel_id} is mid-step; acute events must wait for the step to close")]
    StepInProgress { vessel_id: VesselId },
    #[error("unknown vessel: {0}")]
    UnknownVessel(VesselId),
    #[error("vessel already exists: {0}")]
    VesselExists(VesselId),
    #[error("vessel has been retired by passage: {0}")]
    VesselRetired(VesselId),
    #[error("unknown cell line: {0}")]
    UnknownCellLine(String),
    #[error("unknown compound: {0}")]
    UnknownCompound(String),
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The engine stopped after a fatal error and refuses further work.
    #[error("simulation halted after fatal error: {0}")]
    Halted(Box<SimError>),
}

impl SimError {
    /// Whether the error signals a bug that must stop the run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConservationViolation { .. } | Self::UnauthorizedDraw { .. } | Self::Halted(_)
        )
    }
}

/// Convenience alias used throughout the crate.
pub type SimResult<T> = Result<T, SimError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conservation_message_names_vessel_subpopulation_and_residual() {
        let err = SimError::ConservationViolation {
            vessel_id: VesselId::from("plate1_A01"),
            subpopulation: "sensitive".into(),
            viability: 0.4,
            credited: 0.7,
            residual: 0.1,
        };
        let text = err.to_string();
        assert!(text.contains("plate1_A01"));
        assert!(text.contains("sensitive"));
        assert!(text.contains("1e-1"));
        assert!(err.is_fatal());
    }

    #[test]
    fn validation_errors_are_not_fatal() {
        let err = SimError::InvalidTransfer {
            source_id: VesselId::from("A01"),
            split_ratio: 0.5,
            reason: "split ratio below 1.0 would mint cells",
        };
        assert!(!err.is_fatal());
        assert!(!SimError::UnknownVessel(VesselId::from("B02")).is_fatal());
    }
}
