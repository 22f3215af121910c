//! Command dispatch and the staged step pipeline.
//!
//! Each step of a vessel runs the same stages in order: hazards are evaluated
//! at the step midpoint, death is committed, organelle stress and media are
//! updated, growth adds newborn cells, phases move forward, and a
//! [`StepRecord`] is emitted. Fatal errors halt the engine; every command after
//! that is refused with [`SimError::Halted`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

use rand_distr::Normal;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{SimulationConfig, StressAxis};
use crate::error::{SimError, SimResult};
use crate::growth::step_growth;
use crate::hazard::{
    CommitmentStatus, Environment, HazardContribution, commitment_status, integrate_stress,
    stress_drive, subpopulation_hazards,
};
use crate::latency::lognormal_with_mean;
use crate::observe::{AssayContext, PurityWitness, SubpopulationFractions, VesselReadout};
use crate::passage::{TransferOutcome, plan_transfer, validate_split_ratio};
use crate::potency::PotencyReference;
use crate::streams::{DrawSite, RngStreams, StreamKind};
use crate::vessel::{CompoundExposure, KillCause, SubpopulationPhase, Vessel};
use crate::{ExposureId, VesselId};

/// Clock slack below which a vessel counts as having reached its target time.
const TIME_EPSILON: f64 = 1e-9;

const STRESS_AXES: [StressAxis; 2] = [StressAxis::EndoplasmicReticulum, StressAxis::Mitochondrial];

/// Instruction accepted by [`Simulation::apply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    Seed {
        vessel_id: VesselId,
        cell_line: String,
        initial_count: f64,
        #[serde(default)]
        edge_well: bool,
    },
    Treat {
        vessel_id: VesselId,
        compound: String,
        dose_um: f64,
    },
    AdvanceTime {
        vessel_id: VesselId,
        target_time_hours: f64,
    },
    /// Advance every live vessel to the same time.
    AdvanceAll { target_time_hours: f64 },
    InstantKill {
        vessel_id: VesselId,
        fraction: f64,
        cause: KillCause,
    },
    Passage {
        source_id: VesselId,
        target_id: VesselId,
        split_ratio: f64,
    },
    /// Replace the medium with fresh medium.
    Feed { vessel_id: VesselId },
    /// Remove every compound still present.
    Washout { vessel_id: VesselId },
    Observe { vessel_id: VesselId },
}

impl Command {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Command::Seed { .. } => "seed",
            Command::Treat { .. } => "treat",
            Command::AdvanceTime { .. } => "advance_time",
            Command::AdvanceAll { .. } => "advance_all",
            Command::InstantKill { .. } => "instant_kill",
            Command::Passage { .. } => "passage",
            Command::Feed { .. } => "feed",
            Command::Washout { .. } => "washout",
            Command::Observe { .. } => "observe",
        }
    }

    /// Whether applying the command may change engine state.
    #[must_use]
    pub const fn is_mutating(&self) -> bool {
        !matches!(self, Command::Observe { .. })
    }
}

/// Result of one `advance_time` on one vessel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceSummary {
    pub vessel_id: VesselId,
    pub steps: u64,
    pub time_hours: f64,
    pub commitments_sampled: usize,
}

/// What a successfully applied command produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandOutcome {
    Seeded { vessel_id: VesselId },
    Treated { exposure: ExposureId },
    Advanced(AdvanceSummary),
    AdvancedAll(Vec<AdvanceSummary>),
    Killed { vessel_id: VesselId },
    Passaged(TransferOutcome),
    Fed { vessel_id: VesselId },
    WashedOut { vessel_id: VesselId, ended: usize },
    Observed(VesselReadout),
}

/// Ground-truth state after one integration step, for orchestration and replay checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub vessel_id: VesselId,
    pub step: u64,
    pub time_hours: f64,
    pub dt_hours: f64,
    pub viability: f64,
    pub cell_count: f64,
    pub viable_cells: f64,
    pub confluence: f64,
    /// `-ln(viable_after / viable_before) / dt` over the death commit.
    pub effective_hazard: f64,
    pub subpopulation_viabilities: Vec<f64>,
    pub glucose_mm: f64,
}

/// Receiver for step records.
pub trait TrajectorySink: Send {
    fn on_step(&mut self, record: &StepRecord);
}

/// Sink that drops every record.
#[derive(Debug, Default)]
pub struct NullSink;

impl TrajectorySink for NullSink {
    fn on_step(&mut self, _record: &StepRecord) {}
}

#[derive(Debug, Clone)]
struct VesselEntry {
    vessel: Vessel,
    streams: RngStreams,
}

/// Population engine driving a set of vessels.
pub struct Simulation {
    config: SimulationConfig,
    master_seed: u64,
    vessels: BTreeMap<VesselId, VesselEntry>,
    retired: BTreeSet<VesselId>,
    last_exposure: ExposureId,
    history: VecDeque<StepRecord>,
    sink: Box<dyn TrajectorySink>,
    halted: Option<SimError>,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("master_seed", &self.master_seed)
            .field("vessels", &self.vessels.len())
            .field("retired", &self.retired.len())
            .field("last_exposure", &self.last_exposure)
            .field("halted", &self.halted)
            .finish()
    }
}

impl Simulation {
    /// Create an engine with no vessels.
    pub fn new(config: SimulationConfig) -> SimResult<Self> {
        Self::with_sink(config, Box::new(NullSink))
    }

    /// Create an engine that forwards step records to `sink`.
    pub fn with_sink(config: SimulationConfig, sink: Box<dyn TrajectorySink>) -> SimResult<Self> {
        config.validate()?;
        let master_seed = config.resolved_seed();
        let history_capacity = config.history_capacity;
        info!(master_seed, "simulation created");
        Ok(Self {
            config,
            master_seed,
            vessels: BTreeMap::new(),
            retired: BTreeSet::new(),
            last_exposure: ExposureId::default(),
            history: VecDeque::with_capacity(history_capacity.min(1_024)),
            sink,
            halted: None,
        })
    }

    /// Apply one command. Fatal errors halt the engine.
    pub fn apply(&mut self, command: Command) -> SimResult<CommandOutcome> {
        self.ensure_running()?;
        let result = match command {
            Command::Seed {
                vessel_id,
                cell_line,
                initial_count,
                edge_well,
            } => self
                .seed(vessel_id.clone(), &cell_line, initial_count, edge_well)
                .map(|()| CommandOutcome::Seeded { vessel_id }),
            Command::Treat {
                vessel_id,
                compound,
                dose_um,
            } => self
                .treat(&vessel_id, &compound, dose_um)
                .map(|exposure| CommandOutcome::Treated { exposure }),
            Command::AdvanceTime {
                vessel_id,
                target_time_hours,
            } => self
                .advance_time(&vessel_id, target_time_hours)
                .map(CommandOutcome::Advanced),
            Command::AdvanceAll { target_time_hours } => self
                .advance_all(target_time_hours)
                .map(CommandOutcome::AdvancedAll),
            Command::InstantKill {
                vessel_id,
                fraction,
                cause,
            } => self
                .instant_kill(&vessel_id, fraction, cause)
                .map(|()| CommandOutcome::Killed { vessel_id }),
            Command::Passage {
                source_id,
                target_id,
                split_ratio,
            } => self
                .passage(&source_id, target_id, split_ratio)
                .map(CommandOutcome::Passaged),
            Command::Feed { vessel_id } => self
                .feed(&vessel_id)
                .map(|()| CommandOutcome::Fed { vessel_id }),
            Command::Washout { vessel_id } => self
                .washout(&vessel_id)
                .map(|ended| CommandOutcome::WashedOut { vessel_id, ended }),
            Command::Observe { vessel_id } => self.readout(&vessel_id).map(CommandOutcome::Observed),
        };
        self.guard(result)
    }

    /// Apply a batch that must not change state; any mutating command rejects the whole batch.
    pub fn apply_read_only(&mut self, commands: Vec<Command>) -> SimResult<Vec<CommandOutcome>> {
        self.ensure_running()?;
        if let Some(command) = commands.iter().find(|command| command.is_mutating()) {
            return Err(SimError::PrematureMutation {
                operation: command.name().to_string(),
            });
        }
        commands
            .into_iter()
            .map(|command| self.apply(command))
            .collect()
    }

    /// Create a vessel with every subpopulation fully viable.
    pub fn seed(
        &mut self,
        vessel_id: VesselId,
        cell_line: &str,
        initial_count: f64,
        edge_well: bool,
    ) -> SimResult<()> {
        self.ensure_running()?;
        self.ensure_id_free(&vessel_id)?;
        let profile = self
            .config
            .cell_lines
            .get(cell_line)
            .cloned()
            .ok_or_else(|| SimError::UnknownCellLine(cell_line.to_string()))?;
        if !initial_count.is_finite() || initial_count <= 0.0 {
            return Err(SimError::InvalidCommand(format!(
                "initial count {initial_count} must be positive"
            )));
        }
        let mut streams = RngStreams::for_vessel(self.master_seed, &vessel_id);
        let growth_multiplier = sample_growth_multiplier(&mut streams, self.config.growth.rate_cv);
        let growth_multiplier = self.guard(growth_multiplier)?;
        let vessel = Vessel::seeded(
            vessel_id.clone(),
            cell_line,
            &profile,
            initial_count,
            edge_well,
            &self.config.media,
            growth_multiplier,
        );
        info!(
            vessel = %vessel_id,
            cell_line,
            initial_count,
            edge_well,
            growth_multiplier,
            "vessel seeded"
        );
        self.vessels
            .insert(vessel_id, VesselEntry { vessel, streams });
        Ok(())
    }

    /// Dose a vessel; lethal-range pairs get a commitment delay sampled on the next advance.
    pub fn treat(&mut self, vessel_id: &VesselId, compound: &str, dose_um: f64) -> SimResult<ExposureId> {
        self.ensure_running()?;
        let profile = self
            .config
            .compounds
            .get(compound)
            .copied()
            .ok_or_else(|| SimError::UnknownCompound(compound.to_string()))?;
        if !dose_um.is_finite() || dose_um < 0.0 {
            return Err(SimError::InvalidCommand(format!(
                "dose {dose_um} uM must be finite and non-negative"
            )));
        }
        let id = self.last_exposure.next();
        let entry = self.entry_mut(vessel_id)?;
        let exposure = CompoundExposure {
            id,
            compound: compound.to_string(),
            dose_um,
            potency: PotencyReference::from(&profile),
            max_attrition_rate: profile.max_attrition_rate,
            stress_axis: profile.stress_axis,
            start_hours: entry.vessel.time_hours(),
            end_hours: None,
        };
        let scheduled = entry.vessel.add_exposure(exposure);
        self.last_exposure = id;
        debug!(vessel = %vessel_id, compound, dose_um, exposure = %id, scheduled, "compound added");
        Ok(id)
    }

    /// Step one vessel forward to `target_time_hours`.
    pub fn advance_time(&mut self, vessel_id: &VesselId, target_time_hours: f64) -> SimResult<AdvanceSummary> {
        self.ensure_running()?;
        let config = &self.config;
        if !self.vessels.contains_key(vessel_id) {
            return Err(self.missing(vessel_id));
        }
        let Some(entry) = self.vessels.get_mut(vessel_id) else {
            return Err(SimError::UnknownVessel(vessel_id.clone()));
        };
        check_target(&entry.vessel, target_time_hours)?;
        let mut records = Vec::new();
        let result = advance_vessel(entry, target_time_hours, config, &mut records);
        self.emit(records);
        self.guard(result)
    }

    /// Step every live vessel to `target_time_hours`, in parallel.
    ///
    /// Records reach the sink afterwards, grouped by vessel in id order.
    pub fn advance_all(&mut self, target_time_hours: f64) -> SimResult<Vec<AdvanceSummary>> {
        self.ensure_running()?;
        for entry in self.vessels.values() {
            check_target(&entry.vessel, target_time_hours)?;
        }
        let config = &self.config;
        let mut outcomes: Vec<(VesselId, Vec<StepRecord>, SimResult<AdvanceSummary>)> = self
            .vessels
            .par_iter_mut()
            .map(|(id, entry)| {
                let mut records = Vec::new();
                let result = advance_vessel(entry, target_time_hours, config, &mut records);
                (id.clone(), records, result)
            })
            .collect();
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));

        let mut summaries = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for (_, records, result) in outcomes {
            self.emit(records);
            match result {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        match first_error {
            Some(err) => self.guard(Err(err)),
            None => Ok(summaries),
        }
    }

    /// Kill a fraction of every subpopulation at once.
    pub fn instant_kill(&mut self, vessel_id: &VesselId, fraction: f64, cause: KillCause) -> SimResult<()> {
        self.ensure_running()?;
        let epsilon = self.config.conservation_epsilon;
        let threshold = self.config.dead_viability_threshold;
        let entry = self.entry_mut(vessel_id)?;
        let result = entry.vessel.instant_kill(fraction, cause, epsilon);
        if result.is_ok() {
            refresh_phases(&mut entry.vessel, threshold);
            debug!(vessel = %vessel_id, fraction, ?cause, viability = entry.vessel.viability(), "instant kill");
        }
        self.guard(result)
    }

    /// Move `source.count / split_ratio` cells into a new vessel.
    pub fn passage(
        &mut self,
        source_id: &VesselId,
        target_id: VesselId,
        split_ratio: f64,
    ) -> SimResult<TransferOutcome> {
        self.ensure_running()?;
        validate_split_ratio(source_id, split_ratio)?;
        self.ensure_id_free(&target_id)?;
        let volume_cv = self.config.passage_volume_cv;
        let growth_cv = self.config.growth.rate_cv;
        let master_seed = self.master_seed;

        let mut target_streams = RngStreams::for_vessel(master_seed, &target_id);
        let growth_multiplier = sample_growth_multiplier(&mut target_streams, growth_cv);
        let growth_multiplier = self.guard(growth_multiplier)?;

        let entry = self.entry_mut(source_id)?;
        let volume_factor = if volume_cv > 0.0 && split_ratio > 1.0 {
            let dist = Normal::new(1.0, volume_cv)
                .map_err(|_| SimError::InvalidConfig("passage_volume_cv is not a valid std dev"))?;
            entry
                .streams
                .sample(StreamKind::Operational, DrawSite::PassageVolume, &dist)
        } else {
            Ok(1.0)
        };
        let volume_factor = self.guard(volume_factor)?;

        let media = self.config.media;
        let entry = self.entry_mut(source_id)?;
        let plan = plan_transfer(&entry.vessel, split_ratio, volume_factor)?;
        let target = entry.vessel.split_off(
            target_id.clone(),
            plan.cells_transferred,
            plan.retire_source,
            &media,
            growth_multiplier,
        );
        let outcome = TransferOutcome {
            source_id: source_id.clone(),
            target_id: target_id.clone(),
            cells_transferred: plan.cells_transferred,
            source_retired: plan.retire_source,
        };
        self.vessels.insert(
            target_id.clone(),
            VesselEntry {
                vessel: target,
                streams: target_streams,
            },
        );
        if plan.retire_source {
            self.vessels.remove(source_id);
            self.retired.insert(source_id.clone());
        }
        info!(
            source = %source_id,
            target = %target_id,
            split_ratio,
            cells = plan.cells_transferred,
            retired = plan.retire_source,
            "passage"
        );
        Ok(outcome)
    }

    pub fn feed(&mut self, vessel_id: &VesselId) -> SimResult<()> {
        self.ensure_running()?;
        let media = self.config.media;
        let entry = self.entry_mut(vessel_id)?;
        entry.vessel.refresh_media(&media);
        debug!(vessel = %vessel_id, "media refreshed");
        Ok(())
    }

    /// End every exposure still present in the vessel.
    pub fn washout(&mut self, vessel_id: &VesselId) -> SimResult<usize> {
        self.ensure_running()?;
        let entry = self.entry_mut(vessel_id)?;
        let ended = entry.vessel.wash_out();
        debug!(vessel = %vessel_id, ended, "washout");
        Ok(ended)
    }

    /// Aggregate readout; never exposes subpopulation viabilities.
    pub fn readout(&self, vessel_id: &VesselId) -> SimResult<VesselReadout> {
        self.ensure_running()?;
        Ok(VesselReadout::of(&self.entry(vessel_id)?.vessel))
    }

    pub fn subpopulation_fractions(&self, vessel_id: &VesselId) -> SimResult<SubpopulationFractions> {
        self.ensure_running()?;
        Ok(SubpopulationFractions::of(&self.entry(vessel_id)?.vessel))
    }

    /// Run an assay against a vessel.
    ///
    /// The closure may draw from the assay stream only. Any change to the
    /// vessel or to the biology streams fails with `PrematureMutation`.
    pub fn measure<T>(
        &mut self,
        vessel_id: &VesselId,
        assay: impl FnOnce(&mut AssayContext<'_>) -> SimResult<T>,
    ) -> SimResult<T> {
        self.ensure_running()?;
        let entry = self.entry_mut(vessel_id)?;
        let witness = PurityWitness::capture(&entry.vessel, &entry.streams);
        let value = {
            let mut ctx = AssayContext::new(&entry.vessel, &mut entry.streams);
            assay(&mut ctx)
        };
        let verdict = witness.verify(&entry.vessel, &entry.streams, "measure");
        let value = self.guard(value)?;
        verdict.map(|()| value)
    }

    /// Ground-truth vessel state, subpopulations and ledgers included.
    ///
    /// For inspection and tests only. Experiment code reads vessels through
    /// [`Simulation::readout`], [`Simulation::subpopulation_fractions`] and
    /// [`Simulation::measure`].
    #[doc(hidden)]
    #[must_use]
    pub fn vessel(&self, vessel_id: &VesselId) -> Option<&Vessel> {
        self.vessels.get(vessel_id).map(|entry| &entry.vessel)
    }

    /// Ground-truth stream state and draw counters; inspection only.
    #[doc(hidden)]
    #[must_use]
    pub fn streams(&self, vessel_id: &VesselId) -> Option<&RngStreams> {
        self.vessels.get(vessel_id).map(|entry| &entry.streams)
    }

    /// Live vessel ids in order.
    pub fn vessel_ids(&self) -> impl Iterator<Item = &VesselId> {
        self.vessels.keys()
    }

    #[must_use]
    pub fn is_retired(&self, vessel_id: &VesselId) -> bool {
        self.retired.contains(vessel_id)
    }

    /// Iterate over retained step records, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &StepRecord> {
        self.history.iter()
    }

    /// Replace the trajectory sink.
    pub fn set_sink(&mut self, sink: Box<dyn TrajectorySink>) {
        self.sink = sink;
    }

    #[must_use]
    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    #[must_use]
    pub const fn master_seed(&self) -> u64 {
        self.master_seed
    }

    #[must_use]
    pub const fn is_halted(&self) -> bool {
        self.halted.is_some()
    }

    /// The error that halted the engine, if any.
    #[must_use]
    pub fn halt_reason(&self) -> Option<&SimError> {
        self.halted.as_ref()
    }

    fn ensure_running(&self) -> SimResult<()> {
        match &self.halted {
            Some(err) => Err(SimError::Halted(Box::new(err.clone()))),
            None => Ok(()),
        }
    }

    fn guard<T>(&mut self, result: SimResult<T>) -> SimResult<T> {
        if let Err(err) = &result
            && err.is_fatal()
            && self.halted.is_none()
        {
            error!(error = %err, "fatal error; halting simulation");
            self.halted = Some(err.clone());
        }
        result
    }

    fn ensure_id_free(&self, vessel_id: &VesselId) -> SimResult<()> {
        if self.vessels.contains_key(vessel_id) || self.retired.contains(vessel_id) {
            return Err(SimError::VesselExists(vessel_id.clone()));
        }
        Ok(())
    }

    fn missing(&self, vessel_id: &VesselId) -> SimError {
        if self.retired.contains(vessel_id) {
            SimError::VesselRetired(vessel_id.clone())
        } else {
            SimError::UnknownVessel(vessel_id.clone())
        }
    }

    fn entry(&self, vessel_id: &VesselId) -> SimResult<&VesselEntry> {
        self.vessels
            .get(vessel_id)
            .ok_or_else(|| self.missing(vessel_id))
    }

    fn entry_mut(&mut self, vessel_id: &VesselId) -> SimResult<&mut VesselEntry> {
        if !self.vessels.contains_key(vessel_id) {
            return Err(self.missing(vessel_id));
        }
        self.vessels
            .get_mut(vessel_id)
            .ok_or_else(|| SimError::UnknownVessel(vessel_id.clone()))
    }

    fn emit(&mut self, records: Vec<StepRecord>) {
        for record in records {
            self.sink.on_step(&record);
            if self.history.len() >= self.config.history_capacity {
                self.history.pop_front();
            }
            self.history.push_back(record);
        }
    }
}

fn check_target(vessel: &Vessel, target_time_hours: f64) -> SimResult<()> {
    if !target_time_hours.is_finite() || target_time_hours < vessel.time_hours() - TIME_EPSILON {
        return Err(SimError::InvalidCommand(format!(
            "target time {target_time_hours} h is before vessel {} time {} h",
            vessel.id(),
            vessel.time_hours()
        )));
    }
    Ok(())
}

/// Per-vessel growth multiplier; `cv == 0` skips the draw.
fn sample_growth_multiplier(streams: &mut RngStreams, cv: f64) -> SimResult<f64> {
    if cv <= 0.0 {
        return Ok(1.0);
    }
    let dist = lognormal_with_mean(1.0, cv)?;
    streams.sample(StreamKind::Growth, DrawSite::GrowthRateJitter, &dist)
}

fn total_rate(contributions: &[HazardContribution]) -> f64 {
    contributions.iter().map(|c| c.rate_per_hour).sum()
}

fn advance_vessel(
    entry: &mut VesselEntry,
    target_time_hours: f64,
    config: &SimulationConfig,
    records: &mut Vec<StepRecord>,
) -> SimResult<AdvanceSummary> {
    let VesselEntry { vessel, streams } = entry;
    let commitments_sampled = vessel.sample_pending_commitments(&config.latency, streams)?;
    let start_steps = vessel.steps_taken();
    let mut floor_warned = false;

    while target_time_hours - vessel.time_hours() > TIME_EPSILON {
        let start = vessel.time_hours();
        let remaining = target_time_hours - start;
        let environment = Environment::of(vessel);
        let mut dt = config.step_hours.min(remaining);
        let (hazards, stale) = loop {
            let midpoint = start + dt * 0.5;
            let mut hazards = Vec::with_capacity(vessel.subpopulations().len());
            let mut stale = 0;
            for index in 0..vessel.subpopulations().len() {
                let (contributions, errors) =
                    subpopulation_hazards(vessel, index, midpoint, &environment, config);
                stale += errors.len();
                hazards.push(contributions);
            }
            let peak = hazards
                .iter()
                .map(|c| total_rate(c))
                .fold(0.0_f64, f64::max);
            if peak * dt <= config.max_step_hazard {
                break (hazards, stale);
            }
            if dt * 0.5 < config.min_step_hours {
                if !floor_warned {
                    warn!(
                        vessel = %vessel.id(),
                        time_hours = start,
                        dt_hours = dt,
                        integrated_hazard = peak * dt,
                        "step refinement reached minimum step size"
                    );
                    floor_warned = true;
                }
                break (hazards, stale);
            }
            dt *= 0.5;
        };
        let reaches_target = remaining - dt <= TIME_EPSILON;
        for _ in 0..stale {
            vessel.note_stale_fallback();
        }

        let commit = vessel.commit_step_death(dt, &hazards, config.conservation_epsilon)?;
        refresh_phases(vessel, config.dead_viability_threshold);
        let effective_hazard = if commit.viable_before > 0.0 && commit.viable_after > 0.0 {
            -(commit.viable_after / commit.viable_before).ln() / dt
        } else {
            0.0
        };

        let midpoint = start + dt * 0.5;
        let drives: Vec<[f64; 2]> = vessel
            .subpopulations()
            .iter()
            .map(|sub| STRESS_AXES.map(|axis| stress_drive(sub, vessel.exposures(), axis, midpoint)))
            .collect();
        for (sub, drive) in vessel.subpopulations_mut().iter_mut().zip(drives) {
            for (axis, drive) in STRESS_AXES.into_iter().zip(drive) {
                let level = sub.stress_mut().level_mut(axis);
                *level = integrate_stress(*level, drive, dt, &config.hazard.stress);
            }
        }

        let added = step_growth(vessel, dt, &config.growth, &config.media);
        let viable_millions = vessel.viable_cells() / 1.0e6;
        let media = vessel.media_mut();
        media.glucose_mm =
            (media.glucose_mm - config.media.glucose_uptake_mm * viable_millions * dt).max(0.0);
        media.glutamine_mm =
            (media.glutamine_mm - config.media.glutamine_uptake_mm * viable_millions * dt).max(0.0);

        vessel.apply_growth(added, dt);
        if reaches_target {
            vessel.settle_clock(target_time_hours);
        }
        vessel.verify_conservation(config.conservation_epsilon)?;
        refresh_phases(vessel, config.dead_viability_threshold);

        records.push(StepRecord {
            vessel_id: vessel.id().clone(),
            step: vessel.steps_taken(),
            time_hours: vessel.time_hours(),
            dt_hours: dt,
            viability: vessel.viability(),
            cell_count: vessel.cell_count(),
            viable_cells: vessel.viable_cells(),
            confluence: vessel.confluence(),
            effective_hazard,
            subpopulation_viabilities: vessel
                .subpopulations()
                .iter()
                .map(|sub| sub.viability())
                .collect(),
            glucose_mm: vessel.media().glucose_mm,
        });
    }

    let steps = vessel.steps_taken() - start_steps;
    debug!(
        vessel = %vessel.id(),
        steps,
        time_hours = vessel.time_hours(),
        viability = vessel.viability(),
        commitments_sampled,
        "advanced"
    );
    Ok(AdvanceSummary {
        vessel_id: vessel.id().clone(),
        steps,
        time_hours: vessel.time_hours(),
        commitments_sampled,
    })
}

/// Move subpopulation phases forward from the current state.
fn refresh_phases(vessel: &mut Vessel, dead_threshold: f64) {
    let time = vessel.time_hours();
    let next: Vec<Option<SubpopulationPhase>> = vessel
        .subpopulations()
        .iter()
        .map(|sub| {
            if sub.viability() < dead_threshold {
                Some(SubpopulationPhase::EffectivelyDead)
            } else if vessel.exposures().iter().any(|exposure| {
                commitment_status(sub, exposure, time - exposure.start_hours)
                    == CommitmentStatus::Committed
            }) {
                Some(SubpopulationPhase::HazardActive)
            } else {
                None
            }
        })
        .collect();
    for (sub, phase) in vessel.subpopulations_mut().iter_mut().zip(next) {
        if let Some(phase) = phase {
            sub.advance_phase(phase);
        }
    }
}
