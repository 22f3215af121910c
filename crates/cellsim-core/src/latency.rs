//! Commitment latency: per (exposure, subpopulation) delay before attrition starts.

use std::collections::BTreeMap;

use rand_distr::LogNormal;
use serde::{Deserialize, Serialize};

use crate::ExposureId;
use crate::config::LatencyConfig;
use crate::error::{SimError, SimResult};
use crate::potency::is_lethal;
use crate::streams::{DrawSite, RngStreams, StreamKind};

/// Cache key for a sampled delay. Never a timestamp and never the compound alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LatencyKey {
    pub compound: String,
    pub exposure: ExposureId,
    pub subpopulation: String,
}

impl LatencyKey {
    #[must_use]
    pub fn new(
        compound: impl Into<String>,
        exposure: ExposureId,
        subpopulation: impl Into<String>,
    ) -> Self {
        Self {
            compound: compound.into(),
            exposure,
            subpopulation: subpopulation.into(),
        }
    }
}

/// Mean commitment delay for a dose ratio, or `None` in the sub-lethal range.
///
/// `base / sqrt(1 + r)` clamped to the configured bounds. The bounds are an
/// engineering guardrail; the curve is non-increasing in `r` and flattens onto
/// the lower bound.
#[must_use]
pub fn mean_delay_hours(dose_ratio: f64, config: &LatencyConfig) -> Option<f64> {
    if !is_lethal(dose_ratio) {
        return None;
    }
    let raw = config.base_delay_hours / (1.0 + dose_ratio).sqrt();
    Some(raw.clamp(config.min_delay_hours, config.max_delay_hours))
}

/// Log-normal with the requested arithmetic mean and coefficient of variation.
pub fn lognormal_with_mean(mean: f64, cv: f64) -> SimResult<LogNormal<f64>> {
    let sigma_sq = (1.0 + cv * cv).ln();
    let mu = mean.ln() - 0.5 * sigma_sq;
    LogNormal::new(mu, sigma_sq.sqrt())
        .map_err(|_| SimError::InvalidConfig("latency distribution parameters are not finite"))
}

/// Sample one clamped commitment delay from the treatment stream.
///
/// Sub-lethal ratios return `Ok(None)` without touching any stream.
pub fn sample_delay_hours(
    dose_ratio: f64,
    config: &LatencyConfig,
    streams: &mut RngStreams,
) -> SimResult<Option<f64>> {
    let Some(mean) = mean_delay_hours(dose_ratio, config) else {
        return Ok(None);
    };
    let dist = lognormal_with_mean(mean, config.cv)?;
    let drawn = streams.sample(StreamKind::Treatment, DrawSite::CommitmentDelay, &dist)?;
    Ok(Some(
        drawn.clamp(config.min_delay_hours, config.max_delay_hours),
    ))
}

/// Scheduled and sampled commitment delays for one subpopulation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitmentSchedule {
    pending: BTreeMap<LatencyKey, f64>,
    sampled: BTreeMap<LatencyKey, f64>,
}

impl CommitmentSchedule {
    /// Register a lethal-range pair for sampling; sub-lethal ratios are ignored.
    pub fn schedule(&mut self, key: LatencyKey, dose_ratio: f64) -> bool {
        if !is_lethal(dose_ratio) || self.sampled.contains_key(&key) {
            return false;
        }
        self.pending.insert(key, dose_ratio);
        true
    }

    /// Sample every pending pair in key order; returns how many were drawn.
    pub fn sample_pending(
        &mut self,
        config: &LatencyConfig,
        streams: &mut RngStreams,
    ) -> SimResult<usize> {
        let pending = std::mem::take(&mut self.pending);
        let mut drawn = 0;
        for (key, ratio) in pending {
            if let Some(delay) = sample_delay_hours(ratio, config, streams)? {
                self.sampled.insert(key, delay);
                drawn += 1;
            }
        }
        Ok(drawn)
    }

    #[must_use]
    pub fn delay(&self, key: &LatencyKey) -> Option<f64> {
        self.sampled.get(key).copied()
    }

    #[must_use]
    pub fn is_pending(&self, key: &LatencyKey) -> bool {
        self.pending.contains_key(key)
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drop pending pairs for an exposure that ended before sampling.
    pub fn cancel_exposure(&mut self, exposure: ExposureId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|key, _| key.exposure != exposure);
        before - self.pending.len()
    }

    pub fn sampled(&self) -> impl Iterator<Item = (&LatencyKey, f64)> + '_ {
        self.sampled.iter().map(|(key, delay)| (key, *delay))
    }

    #[must_use]
    pub fn sampled_len(&self) -> usize {
        self.sampled.len()
    }
}
