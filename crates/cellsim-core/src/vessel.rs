//! Vessel and subpopulation state, death commit and conservation checks.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::config::{CellLineProfile, LatencyConfig, MediaConfig, StressAxis};
use crate::error::{SimError, SimResult};
use crate::growth::MIN_PROLIFERATING_CELLS;
use crate::hazard::HazardContribution;
use crate::latency::{CommitmentSchedule, LatencyKey};
use crate::potency::{PotencyReference, dose_ratio};
use crate::streams::RngStreams;
use crate::{ExposureId, VesselId};

/// Lifecycle of a subpopulation. Transitions only move forward.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
pub enum SubpopulationPhase {
    #[default]
    Alive,
    CommittedPending,
    HazardActive,
    EffectivelyDead,
}

/// Cause a unit of death is credited to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeathCause {
    Basal,
    CompoundAttrition,
    ErStress,
    MitochondrialDysfunction,
    NutrientDepletion,
    Confluence,
    AcuteCompound,
    Handling,
    Contamination,
}

/// Cause attached to an instant kill.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum KillCause {
    /// Acute compound shock; sensitive subpopulations lose more.
    AcuteCompound,
    /// Mechanical loss; uniform across subpopulations.
    Handling,
    Contamination,
}

impl KillCause {
    /// Kill fraction applied to a subpopulation with the given sensitivity shift.
    #[must_use]
    pub fn fraction_for(self, kill_fraction: f64, sensitivity_shift: f64) -> f64 {
        match self {
            KillCause::AcuteCompound => 1.0 - (1.0 - kill_fraction).powf(1.0 / sensitivity_shift),
            KillCause::Handling | KillCause::Contamination => kill_fraction,
        }
    }
}

impl From<KillCause> for DeathCause {
    fn from(cause: KillCause) -> Self {
        match cause {
            KillCause::AcuteCompound => DeathCause::AcuteCompound,
            KillCause::Handling => DeathCause::Handling,
            KillCause::Contamination => DeathCause::Contamination,
        }
    }
}

/// Fraction of a subpopulation's cells credited to each death cause.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeathLedger(BTreeMap<DeathCause, f64>);

impl DeathLedger {
    fn credit(&mut self, cause: DeathCause, fraction: f64) {
        if fraction != 0.0 {
            *self.0.entry(cause).or_insert(0.0) += fraction;
        }
    }

    fn scale(&mut self, factor: f64) {
        for value in self.0.values_mut() {
            *value *= factor;
        }
    }

    #[must_use]
    pub fn get(&self, cause: DeathCause) -> f64 {
        self.0.get(&cause).copied().unwrap_or(0.0)
    }

    #[must_use]
    pub fn total(&self) -> f64 {
        self.0.values().sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DeathCause, f64)> + '_ {
        self.0.iter().map(|(cause, value)| (*cause, *value))
    }
}

/// Organelle stress accumulators, each in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StressState {
    pub er: f64,
    pub mito: f64,
}

impl StressState {
    #[must_use]
    pub fn level(&self, axis: StressAxis) -> f64 {
        match axis {
            StressAxis::EndoplasmicReticulum => self.er,
            StressAxis::Mitochondrial => self.mito,
        }
    }

    pub(crate) fn level_mut(&mut self, axis: StressAxis) -> &mut f64 {
        match axis {
            StressAxis::EndoplasmicReticulum => &mut self.er,
            StressAxis::Mitochondrial => &mut self.mito,
        }
    }
}

/// Fixed-fraction heterogeneity bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Subpopulation {
    name: String,
    fraction: f64,
    sensitivity_shift: f64,
    viability: f64,
    stress: StressState,
    commitments: CommitmentSchedule,
    ledger: DeathLedger,
    phase: SubpopulationPhase,
}

impl Subpopulation {
    fn new(name: String, fraction: f64, sensitivity_shift: f64) -> Self {
        Self {
            name,
            fraction,
            sensitivity_shift,
            viability: 1.0,
            stress: StressState::default(),
            commitments: CommitmentSchedule::default(),
            ledger: DeathLedger::default(),
            phase: SubpopulationPhase::Alive,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn fraction(&self) -> f64 {
        self.fraction
    }

    #[must_use]
    pub const fn sensitivity_shift(&self) -> f64 {
        self.sensitivity_shift
    }

    #[must_use]
    pub const fn viability(&self) -> f64 {
        self.viability
    }

    #[must_use]
    pub const fn stress(&self) -> StressState {
        self.stress
    }

    pub(crate) fn stress_mut(&mut self) -> &mut StressState {
        &mut self.stress
    }

    #[must_use]
    pub fn commitments(&self) -> &CommitmentSchedule {
        &self.commitments
    }

    #[must_use]
    pub fn ledger(&self) -> &DeathLedger {
        &self.ledger
    }

    #[must_use]
    pub const fn phase(&self) -> SubpopulationPhase {
        self.phase
    }

    /// Cache key for this subpopulation's delay on `exposure`.
    #[must_use]
    pub fn latency_key(&self, exposure: &CompoundExposure) -> LatencyKey {
        LatencyKey::new(exposure.compound.clone(), exposure.id, self.name.clone())
    }

    /// Move to `next` if it lies ahead of the current phase.
    pub(crate) fn advance_phase(&mut self, next: SubpopulationPhase) {
        if next > self.phase {
            self.phase = next;
        }
    }

    fn check_conservation(&self, vessel_id: &VesselId, epsilon: f64) -> SimResult<()> {
        let credited = self.ledger.total();
        let residual = credited - (1.0 - self.viability);
        let in_range = (0.0..=1.0).contains(&self.viability);
        if !in_range || !(residual <= epsilon) {
            return Err(SimError::ConservationViolation {
                vessel_id: vessel_id.clone(),
                subpopulation: self.name.clone(),
                viability: self.viability,
                credited,
                residual,
            });
        }
        Ok(())
    }
}

/// One discrete dosing event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompoundExposure {
    pub id: ExposureId,
    pub compound: String,
    pub dose_um: f64,
    pub potency: PotencyReference,
    pub max_attrition_rate: f64,
    pub stress_axis: Option<StressAxis>,
    pub start_hours: f64,
    /// Set when the compound is washed out.
    pub end_hours: Option<f64>,
}

impl CompoundExposure {
    /// Dose ratio seen by a subpopulation.
    #[must_use]
    pub fn dose_ratio_for(&self, subpopulation: &Subpopulation) -> f64 {
        dose_ratio(self.dose_um, &self.potency, subpopulation.sensitivity_shift)
    }

    /// Hours the compound was (or still is) present.
    #[must_use]
    pub fn window_hours(&self) -> f64 {
        self.end_hours
            .map_or(f64::INFINITY, |end| end - self.start_hours)
    }

    #[must_use]
    pub fn is_present_at(&self, time_hours: f64) -> bool {
        time_hours >= self.start_hours && self.end_hours.is_none_or(|end| time_hours < end)
    }
}

/// Nutrient levels of the vessel medium.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MediaState {
    pub glucose_mm: f64,
    pub glutamine_mm: f64,
}

impl MediaState {
    #[must_use]
    pub fn fresh(config: &MediaConfig) -> Self {
        Self {
            glucose_mm: config.glucose_mm,
            glutamine_mm: config.glutamine_mm,
        }
    }
}

/// Whether a step is open between death commit and growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StepPhase {
    #[default]
    Idle,
    DeathCommitted,
}

/// Outcome of committing one step of death.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeathCommit {
    pub viable_before: f64,
    pub viable_after: f64,
    /// Largest per-subpopulation total hazard seen in the step (1/h).
    pub peak_hazard: f64,
}

/// A well holding one cell population.
#[derive(Debug, Clone, PartialEq)]
pub struct Vessel {
    id: VesselId,
    cell_line: String,
    doubling_time_hours: f64,
    capacity_cells: f64,
    total_cells: f64,
    subpopulations: Vec<Subpopulation>,
    exposures: Vec<CompoundExposure>,
    media: MediaState,
    edge_well: bool,
    growth_multiplier: f64,
    time_hours: f64,
    lag_anchor_hours: f64,
    step_phase: StepPhase,
    steps_taken: u64,
    stale_fallbacks: u64,
}

impl Vessel {
    pub(crate) fn seeded(
        id: VesselId,
        cell_line: &str,
        profile: &CellLineProfile,
        initial_count: f64,
        edge_well: bool,
        media: &MediaConfig,
        growth_multiplier: f64,
    ) -> Self {
        let subpopulations = profile
            .subpopulations
            .iter()
            .map(|sub| Subpopulation::new(sub.name.clone(), sub.fraction, sub.sensitivity_shift))
            .collect();
        Self {
            id,
            cell_line: cell_line.to_string(),
            doubling_time_hours: profile.doubling_time_hours,
            capacity_cells: profile.capacity_cells,
            total_cells: initial_count,
            subpopulations,
            exposures: Vec::new(),
            media: MediaState::fresh(media),
            edge_well,
            growth_multiplier,
            time_hours: 0.0,
            lag_anchor_hours: 0.0,
            step_phase: StepPhase::Idle,
            steps_taken: 0,
            stale_fallbacks: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> &VesselId {
        &self.id
    }

    #[must_use]
    pub fn cell_line(&self) -> &str {
        &self.cell_line
    }

    #[must_use]
    pub const fn time_hours(&self) -> f64 {
        self.time_hours
    }

    #[must_use]
    pub const fn doubling_time_hours(&self) -> f64 {
        self.doubling_time_hours
    }

    #[must_use]
    pub const fn capacity_cells(&self) -> f64 {
        self.capacity_cells
    }

    /// Cells per subpopulation, viable or not, in subpopulation order.
    pub fn subpopulation_counts(&self) -> impl Iterator<Item = f64> + '_ {
        self.subpopulations
            .iter()
            .map(|sub| self.total_cells * sub.fraction)
    }

    /// Total cells, summed over subpopulations.
    #[must_use]
    pub fn cell_count(&self) -> f64 {
        self.subpopulation_counts().sum()
    }

    #[must_use]
    pub fn viable_cells(&self) -> f64 {
        self.total_cells * self.viability()
    }

    /// Viable cells in subpopulations that can still divide.
    #[must_use]
    pub fn proliferating_cells(&self) -> f64 {
        self.subpopulations
            .iter()
            .filter(|sub| sub.phase != SubpopulationPhase::EffectivelyDead)
            .map(|sub| self.total_cells * sub.fraction * sub.viability)
            .sum()
    }

    /// Viable cells relative to the vessel capacity.
    #[must_use]
    pub fn confluence(&self) -> f64 {
        self.viable_cells() / self.capacity_cells
    }

    /// Fraction-weighted mean of subpopulation viabilities. There is no setter.
    #[must_use]
    pub fn viability(&self) -> f64 {
        self.subpopulations
            .iter()
            .map(|sub| sub.fraction * sub.viability)
            .sum()
    }

    #[must_use]
    pub fn subpopulations(&self) -> &[Subpopulation] {
        &self.subpopulations
    }

    #[must_use]
    pub fn subpopulation(&self, name: &str) -> Option<&Subpopulation> {
        self.subpopulations.iter().find(|sub| sub.name == name)
    }

    pub(crate) fn subpopulations_mut(&mut self) -> &mut [Subpopulation] {
        &mut self.subpopulations
    }

    #[must_use]
    pub fn exposures(&self) -> &[CompoundExposure] {
        &self.exposures
    }

    #[must_use]
    pub const fn media(&self) -> MediaState {
        self.media
    }

    pub(crate) fn media_mut(&mut self) -> &mut MediaState {
        &mut self.media
    }

    #[must_use]
    pub const fn is_edge_well(&self) -> bool {
        self.edge_well
    }

    #[must_use]
    pub const fn growth_multiplier(&self) -> f64 {
        self.growth_multiplier
    }

    #[must_use]
    pub const fn lag_anchor_hours(&self) -> f64 {
        self.lag_anchor_hours
    }

    #[must_use]
    pub const fn step_phase(&self) -> StepPhase {
        self.step_phase
    }

    #[must_use]
    pub const fn steps_taken(&self) -> u64 {
        self.steps_taken
    }

    /// Times hazard evaluation fell back to a default commitment delay.
    #[must_use]
    pub const fn stale_fallbacks(&self) -> u64 {
        self.stale_fallbacks
    }

    pub(crate) fn note_stale_fallback(&mut self) {
        self.stale_fallbacks += 1;
    }

    /// Record a dosing event and schedule latency sampling for lethal-range pairs.
    pub(crate) fn add_exposure(&mut self, exposure: CompoundExposure) -> usize {
        let mut scheduled = 0;
        for sub in &mut self.subpopulations {
            let ratio = exposure.dose_ratio_for(sub);
            let key = sub.latency_key(&exposure);
            if sub.commitments.schedule(key, ratio) {
                scheduled += 1;
            }
        }
        self.exposures.push(exposure);
        scheduled
    }

    /// Sample every scheduled delay, in subpopulation then key order.
    ///
    /// A subpopulation becomes `CommittedPending` once one of its delays is drawn.
    pub(crate) fn sample_pending_commitments(
        &mut self,
        config: &LatencyConfig,
        streams: &mut RngStreams,
    ) -> SimResult<usize> {
        let mut drawn = 0;
        for sub in &mut self.subpopulations {
            let sampled = sub.commitments.sample_pending(config, streams)?;
            if sampled > 0 {
                sub.advance_phase(SubpopulationPhase::CommittedPending);
            }
            drawn += sampled;
        }
        Ok(drawn)
    }

    /// End every exposure still present; returns how many ended.
    pub(crate) fn wash_out(&mut self) -> usize {
        let now = self.time_hours;
        let mut ended = 0;
        for exposure in &mut self.exposures {
            if exposure.end_hours.is_none() {
                exposure.end_hours = Some(now);
                ended += 1;
                for sub in &mut self.subpopulations {
                    sub.commitments.cancel_exposure(exposure.id);
                }
            }
        }
        ended
    }

    pub(crate) fn refresh_media(&mut self, config: &MediaConfig) {
        self.media = MediaState::fresh(config);
    }

    /// Integrate one step of hazard into every subpopulation's viability.
    ///
    /// `hazards[i]` lists the contributions for subpopulation `i`. Dead
    /// fractions are credited to causes in proportion to their rates. The step
    /// stays open until [`Vessel::apply_growth`] closes it.
    pub(crate) fn commit_step_death(
        &mut self,
        dt_hours: f64,
        hazards: &[Vec<HazardContribution>],
        epsilon: f64,
    ) -> SimResult<DeathCommit> {
        if self.step_phase != StepPhase::Idle {
            return Err(SimError::StepInProgress {
                vessel_id: self.id.clone(),
            });
        }
        let viable_before = self.viable_cells();
        let mut peak_hazard: f64 = 0.0;
        for (sub, contributions) in self.subpopulations.iter_mut().zip(hazards) {
            let total: f64 = contributions.iter().map(|c| c.rate_per_hour).sum();
            peak_hazard = peak_hazard.max(total);
            if total <= 0.0 {
                continue;
            }
            let survival = (-total * dt_hours).exp();
            let dead = sub.viability * (1.0 - survival);
            sub.viability *= survival;
            for contribution in contributions {
                sub.ledger
                    .credit(contribution.source.cause(), dead * contribution.rate_per_hour / total);
            }
        }
        self.step_phase = StepPhase::DeathCommitted;
        self.verify_conservation(epsilon)?;
        Ok(DeathCommit {
            viable_before,
            viable_after: self.viable_cells(),
            peak_hazard,
        })
    }

    /// Add newborn viable cells and close the open step.
    ///
    /// Newborns are split by fixed fraction, so each living subpopulation's
    /// dead fraction and ledger dilute by the same factor. An effectively dead
    /// subpopulation takes its share at its existing composition and never
    /// regains viability. Nothing is added below [`MIN_PROLIFERATING_CELLS`].
    pub(crate) fn apply_growth(&mut self, added_cells: f64, dt_hours: f64) {
        if added_cells > 0.0 && self.proliferating_cells() >= MIN_PROLIFERATING_CELLS {
            let grown = self.total_cells + added_cells;
            let keep = self.total_cells / grown;
            for sub in &mut self.subpopulations {
                if sub.phase == SubpopulationPhase::EffectivelyDead {
                    continue;
                }
                sub.viability = (sub.viability * self.total_cells + added_cells) / grown;
                sub.ledger.scale(keep);
            }
            self.total_cells = grown;
        }
        self.time_hours += dt_hours;
        self.steps_taken += 1;
        self.step_phase = StepPhase::Idle;
    }

    /// Snap the clock onto `time_hours` after the final step of an advance.
    pub(crate) fn settle_clock(&mut self, time_hours: f64) {
        self.time_hours = time_hours;
    }

    /// Apply an acute kill independently to every subpopulation.
    pub(crate) fn instant_kill(
        &mut self,
        kill_fraction: f64,
        cause: KillCause,
        epsilon: f64,
    ) -> SimResult<()> {
        if self.step_phase != StepPhase::Idle {
            return Err(SimError::StepInProgress {
                vessel_id: self.id.clone(),
            });
        }
        if !(0.0..=1.0).contains(&kill_fraction) {
            return Err(SimError::InvalidCommand(format!(
                "kill fraction {kill_fraction} outside [0, 1]"
            )));
        }
        for sub in &mut self.subpopulations {
            let local = cause.fraction_for(kill_fraction, sub.sensitivity_shift);
            let dead = sub.viability * local;
            sub.viability *= 1.0 - local;
            sub.ledger.credit(cause.into(), dead);
        }
        self.verify_conservation(epsilon)
    }

    /// Fail if any subpopulation has more credited death than viability allows.
    pub fn verify_conservation(&self, epsilon: f64) -> SimResult<()> {
        for sub in &self.subpopulations {
            sub.check_conservation(&self.id, epsilon)?;
        }
        Ok(())
    }

    /// Split `cells` off into a new vessel, leaving the rest here.
    pub(crate) fn split_off(
        &mut self,
        target_id: VesselId,
        cells: f64,
        retire_source: bool,
        media: &MediaConfig,
        growth_multiplier: f64,
    ) -> Vessel {
        let target = Vessel {
            id: target_id,
            cell_line: self.cell_line.clone(),
            doubling_time_hours: self.doubling_time_hours,
            capacity_cells: self.capacity_cells,
            total_cells: cells,
            subpopulations: self.subpopulations.clone(),
            exposures: self.exposures.clone(),
            media: MediaState::fresh(media),
            edge_well: false,
            growth_multiplier,
            time_hours: self.time_hours,
            lag_anchor_hours: self.time_hours,
            step_phase: StepPhase::Idle,
            steps_taken: 0,
            stale_fallbacks: 0,
        };
        self.total_cells = if retire_source {
            0.0
        } else {
            self.total_cells - cells
        };
        target
    }

    /// Hash of every state bit, used to prove read-only paths left the vessel untouched.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.id.hash(&mut hasher);
        self.cell_line.hash(&mut hasher);
        for value in [
            self.doubling_time_hours,
            self.capacity_cells,
            self.total_cells,
            self.media.glucose_mm,
            self.media.glutamine_mm,
            self.growth_multiplier,
            self.time_hours,
            self.lag_anchor_hours,
        ] {
            value.to_bits().hash(&mut hasher);
        }
        self.edge_well.hash(&mut hasher);
        self.step_phase.hash(&mut hasher);
        self.steps_taken.hash(&mut hasher);
        self.stale_fallbacks.hash(&mut hasher);
        for sub in &self.subpopulations {
            sub.name.hash(&mut hasher);
            for value in [
                sub.fraction,
                sub.sensitivity_shift,
                sub.viability,
                sub.stress.er,
                sub.stress.mito,
            ] {
                value.to_bits().hash(&mut hasher);
            }
            sub.phase.hash(&mut hasher);
            for (cause, value) in sub.ledger.iter() {
                cause.hash(&mut hasher);
                value.to_bits().hash(&mut hasher);
            }
            for (key, delay) in sub.commitments.sampled() {
                key.hash(&mut hasher);
                delay.to_bits().hash(&mut hasher);
            }
            sub.commitments.has_pending().hash(&mut hasher);
        }
        for exposure in &self.exposures {
            exposure.id.hash(&mut hasher);
            exposure.compound.hash(&mut hasher);
            exposure.dose_um.to_bits().hash(&mut hasher);
            exposure.start_hours.to_bits().hash(&mut hasher);
            exposure.end_hours.map(f64::to_bits).hash(&mut hasher);
        }
        hasher.finish()
    }
}
