//! Experiment-script runner for the `cellsim` command-line tool.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};

use anyhow::{Context, Result};
use cellsim_core::{
    Command, CommandOutcome, KillCause, Simulation, SimulationConfig, StepRecord, TrajectorySink,
    VesselId, VesselReadout,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A configuration override plus an ordered list of commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentScript {
    /// Replaces the base configuration when present.
    pub config: Option<SimulationConfig>,
    /// Keep going after a non-fatal command error.
    pub continue_on_error: bool,
    pub commands: Vec<Command>,
}

/// Result of one scripted command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandReport {
    pub index: usize,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<CommandOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything written out after a script run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptReport {
    pub master_seed: u64,
    pub commands: Vec<CommandReport>,
    pub final_readouts: Vec<VesselReadout>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halted: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trajectory: Vec<StepRecord>,
}

impl ScriptReport {
    /// True when every command ran and the engine never halted.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.halted.is_none() && self.commands.iter().all(|report| report.error.is_none())
    }
}

/// Forwards step records over a channel so the runner can collect them after the run.
struct ChannelSink {
    tx: Sender<StepRecord>,
}

impl TrajectorySink for ChannelSink {
    fn on_step(&mut self, record: &StepRecord) {
        // The receiver lives for the whole run.
        let _ = self.tx.send(record.clone());
    }
}

/// Load a configuration file, or the defaults when no path is given.
pub fn load_config(path: Option<&Path>) -> Result<SimulationConfig> {
    let Some(path) = path else {
        return Ok(SimulationConfig::default());
    };
    let file = File::open(path)
        .with_context(|| format!("failed to open config file {}", path.display()))?;
    let config: SimulationConfig = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

pub fn load_script(path: &Path) -> Result<ExperimentScript> {
    let file = File::open(path)
        .with_context(|| format!("failed to open script {}", path.display()))?;
    serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("failed to parse script {}", path.display()))
}

/// Run `script` against `base` (or the script's own configuration).
pub fn run_script(
    script: ExperimentScript,
    base: SimulationConfig,
    seed_override: Option<u64>,
    record_trajectory: bool,
) -> Result<ScriptReport> {
    let mut config = script.config.unwrap_or(base);
    if seed_override.is_some() {
        config.master_seed = seed_override;
    }
    let (mut sim, trajectory_rx): (Simulation, Option<Receiver<StepRecord>>) = if record_trajectory {
        let (tx, rx) = mpsc::channel();
        let sim = Simulation::with_sink(config, Box::new(ChannelSink { tx }))
            .context("failed to create simulation")?;
        (sim, Some(rx))
    } else {
        (
            Simulation::new(config).context("failed to create simulation")?,
            None,
        )
    };
    info!(
        master_seed = sim.master_seed(),
        commands = script.commands.len(),
        "running experiment script"
    );

    let mut commands = Vec::with_capacity(script.commands.len());
    for (index, command) in script.commands.into_iter().enumerate() {
        let name = command.name().to_string();
        match sim.apply(command) {
            Ok(outcome) => commands.push(CommandReport {
                index,
                command: name,
                outcome: Some(outcome),
                error: None,
            }),
            Err(err) => {
                warn!(index, command = %name, error = %err, "command failed");
                commands.push(CommandReport {
                    index,
                    command: name,
                    outcome: None,
                    error: Some(err.to_string()),
                });
                if sim.is_halted() || !script.continue_on_error {
                    break;
                }
            }
        }
    }

    let halted = sim.halt_reason().map(ToString::to_string);
    let final_readouts: Vec<VesselReadout> = if halted.is_some() {
        Vec::new()
    } else {
        let ids: Vec<VesselId> = sim.vessel_ids().cloned().collect();
        ids.iter()
            .map(|id| sim.readout(id))
            .collect::<Result<_, _>>()
            .context("failed to read final vessel state")?
    };
    let master_seed = sim.master_seed();
    drop(sim);
    let trajectory = trajectory_rx
        .map(|rx| rx.into_iter().collect())
        .unwrap_or_default();
    Ok(ScriptReport {
        master_seed,
        commands,
        final_readouts,
        halted,
        trajectory,
    })
}

/// Write the report as pretty JSON to `path`, or to stdout.
pub fn write_report(report: &ScriptReport, path: Option<&Path>) -> Result<()> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create report {}", path.display()))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, report)
                .context("failed to serialize report")?;
            writer.flush().context("failed to flush report")?;
        }
        None => {
            let stdout = io::stdout();
            let mut handle = stdout.lock();
            serde_json::to_writer_pretty(&mut handle, report)
                .context("failed to serialize report")?;
            writeln!(handle).context("failed to write report")?;
        }
    }
    Ok(())
}

/// A small dose-response plate exercising every command.
#[must_use]
pub fn demo_script() -> ExperimentScript {
    let well = |name: &str| VesselId::from(name);
    let mut commands = Vec::new();
    for (idx, dose_um) in [0.0, 0.02, 0.1, 0.5, 2.0].into_iter().enumerate() {
        let vessel_id = well(&format!("P1_B{:02}", idx + 2));
        commands.push(Command::Seed {
            vessel_id: vessel_id.clone(),
            cell_line: "A549".into(),
            initial_count: 5.0e5,
            edge_well: false,
        });
        if dose_um > 0.0 {
            commands.push(Command::Treat {
                vessel_id,
                compound: "staurosporine".into(),
                dose_um,
            });
        }
    }
    commands.push(Command::Seed {
        vessel_id: well("P1_A01"),
        cell_line: "HepG2".into(),
        initial_count: 1.0e6,
        edge_well: true,
    });
    commands.push(Command::AdvanceAll {
        target_time_hours: 24.0,
    });
    commands.push(Command::InstantKill {
        vessel_id: well("P1_A01"),
        fraction: 0.3,
        cause: KillCause::AcuteCompound,
    });
    commands.push(Command::Washout {
        vessel_id: well("P1_B05"),
    });
    commands.push(Command::Passage {
        source_id: well("P1_A01"),
        target_id: well("P2_A01"),
        split_ratio: 4.0,
    });
    commands.push(Command::Feed {
        vessel_id: well("P1_B02"),
    });
    commands.push(Command::AdvanceAll {
        target_time_hours: 48.0,
    });
    commands.push(Command::AdvanceTime {
        vessel_id: well("P2_A01"),
        target_time_hours: 54.0,
    });
    commands.push(Command::Observe {
        vessel_id: well("P2_A01"),
    });
    ExperimentScript {
        config: None,
        continue_on_error: false,
        commands,
    }
}
