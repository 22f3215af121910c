use std::fs;

use cellsim_app::{ScriptReport, load_config, load_script, run_script, write_report};
use cellsim_core::CommandOutcome;
use serde_json::Value;

const SCRIPT: &str = r#"{
  "commands": [
    {"command": "seed", "vessel_id": "P1_C03", "cell_line": "A549", "initial_count": 400000},
    {"command": "seed", "vessel_id": "P1_C04", "cell_line": "A549", "initial_count": 400000, "edge_well": true},
    {"command": "treat", "vessel_id": "P1_C03", "compound": "staurosporine", "dose_um": 0.5},
    {"command": "advance_all", "target_time_hours": 12.0},
    {"command": "instant_kill", "vessel_id": "P1_C04", "fraction": 0.25, "cause": "handling"},
    {"command": "passage", "source_id": "P1_C04", "target_id": "P2_C04", "split_ratio": 1.0},
    {"command": "observe", "vessel_id": "P2_C04"}
  ]
}"#;

#[test]
fn script_file_round_trips_to_report_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("plate.json");
    let config_path = dir.path().join("config.json");
    let report_path = dir.path().join("report.json");
    fs::write(&script_path, SCRIPT).expect("write script");
    fs::write(&config_path, r#"{"master_seed": 2024, "step_hours": 0.15}"#).expect("write config");

    let config = load_config(Some(&config_path)).expect("config");
    assert_eq!(config.master_seed, Some(2024));
    assert_eq!(config.step_hours, 0.15);
    let script = load_script(&script_path).expect("script");
    assert_eq!(script.commands.len(), 7);

    let report = run_script(script, config, None, true).expect("run");
    assert!(report.succeeded(), "{:?}", report.commands);
    write_report(&report, Some(&report_path)).expect("write report");

    let raw = fs::read_to_string(&report_path).expect("read report");
    let json: Value = serde_json::from_str(&raw).expect("json");
    assert_eq!(json["master_seed"], 2024);
    assert_eq!(json["commands"].as_array().map(Vec::len), Some(7));
    let readouts = json["final_readouts"].as_array().expect("readouts");
    let ids: Vec<_> = readouts
        .iter()
        .filter_map(|r| r["vessel_id"].as_str())
        .collect();
    assert_eq!(ids, ["P1_C03", "P2_C04"]);

    let parsed: ScriptReport = serde_json::from_str(&raw).expect("typed report");
    // 12 h at 0.15 h steps for each of the two vessels.
    assert_eq!(parsed.trajectory.len(), 160);
    match parsed.commands[5].outcome.as_ref() {
        Some(CommandOutcome::Passaged(outcome)) => assert!(outcome.source_retired),
        other => panic!("unexpected passage outcome {other:?}"),
    }
}

#[test]
fn same_seed_gives_identical_reports() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script_path = dir.path().join("plate.json");
    fs::write(&script_path, SCRIPT).expect("write script");

    let run = || {
        let script = load_script(&script_path).expect("script");
        let report = run_script(script, load_config(None).expect("defaults"), Some(99), true)
            .expect("run");
        serde_json::to_string(&report).expect("serialize")
    };
    assert_eq!(run(), run());
}

#[test]
fn invalid_config_is_reported_with_context() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("bad.json");
    fs::write(&config_path, r#"{"step_hours": -1.0}"#).expect("write config");
    let err = load_config(Some(&config_path)).expect_err("invalid");
    let message = format!("{err:#}");
    assert!(message.contains("invalid configuration"), "{message}");
    assert!(message.contains("step sizes must be positive"), "{message}");
}
