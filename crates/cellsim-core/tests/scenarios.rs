use cellsim_core::{
    Command, CommandOutcome, DeathCause, KillCause, LatencyKey, SimError, Simulation,
    SimulationConfig, StepRecord, StreamKind, SubpopulationPhase, VesselId,
};

fn seeded_config(seed: u64) -> SimulationConfig {
    SimulationConfig {
        master_seed: Some(seed),
        ..SimulationConfig::default()
    }
}

fn vessel_records<'a>(sim: &'a Simulation, id: &'a VesselId) -> Vec<&'a StepRecord> {
    sim.history()
        .filter(|record| &record.vessel_id == id)
        .collect()
}

#[test]
fn lethal_dose_onset_has_no_hazard_cliff() {
    let mut sim = Simulation::new(seeded_config(101)).expect("sim");
    let id = VesselId::from("A01");
    sim.seed(id.clone(), "A549", 1.0e6, false).expect("seed");
    // 10x the staurosporine reference potency.
    sim.treat(&id, "staurosporine", 0.5).expect("treat");
    sim.advance_time(&id, 24.0).expect("advance");

    let records = vessel_records(&sim, &id);
    assert_eq!(records.len(), 240);
    assert!(records.iter().all(|record| record.effective_hazard > 0.0));
    let worst = records
        .windows(2)
        .map(|pair| {
            let (a, b) = (pair[0].effective_hazard, pair[1].effective_hazard);
            a.max(b) / a.min(b)
        })
        .fold(0.0_f64, f64::max);
    assert!(worst <= 100.0, "adjacent hazard ratio {worst}");

    let vessel = sim.vessel(&id).expect("vessel");
    assert!(vessel.viability() < 0.9);
    assert!(
        vessel
            .subpopulations()
            .iter()
            .all(|sub| sub.phase() >= SubpopulationPhase::HazardActive)
    );
}

#[test]
fn sub_lethal_dose_never_draws_or_kills() {
    let mut sim = Simulation::new(seeded_config(202)).expect("sim");
    let id = VesselId::from("B01");
    sim.seed(id.clone(), "A549", 2.0e5, false).expect("seed");
    sim.treat(&id, "staurosporine", 0.02).expect("treat");
    sim.advance_time(&id, 48.0).expect("advance");

    let vessel = sim.vessel(&id).expect("vessel");
    for sub in vessel.subpopulations() {
        assert_eq!(sub.ledger().get(DeathCause::CompoundAttrition), 0.0);
        assert_eq!(sub.phase(), SubpopulationPhase::Alive);
        assert_eq!(sub.commitments().sampled_len(), 0);
    }
    let streams = sim.streams(&id).expect("streams");
    assert_eq!(streams.draw_count(StreamKind::Treatment), 0);
}

#[test]
fn acute_kill_separates_subpopulations_by_sensitivity() {
    let mut sim = Simulation::new(seeded_config(303)).expect("sim");
    let id = VesselId::from("C01");
    sim.seed(id.clone(), "HepG2", 5.0e5, false).expect("seed");
    sim.advance_time(&id, 2.0).expect("advance");
    sim.instant_kill(&id, 0.5, KillCause::AcuteCompound)
        .expect("kill");

    let vessel = sim.vessel(&id).expect("vessel");
    let viability = |name: &str| vessel.subpopulation(name).expect(name).viability();
    let (sensitive, typical, resistant) = (
        viability("sensitive"),
        viability("typical"),
        viability("resistant"),
    );
    assert!(sensitive < typical && typical < resistant);
    for sub in vessel.subpopulations() {
        assert!(sub.ledger().get(DeathCause::AcuteCompound) > 0.0);
    }
    let weighted: f64 = vessel
        .subpopulations()
        .iter()
        .map(|sub| sub.fraction() * sub.viability())
        .sum();
    assert!((vessel.viability() - weighted).abs() < 1e-9);
}

#[test]
fn re_dosing_gets_fresh_exposure_ids_and_delays() {
    let mut sim = Simulation::new(seeded_config(404)).expect("sim");
    let id = VesselId::from("D01");
    sim.seed(id.clone(), "A549", 3.0e5, false).expect("seed");
    let first = sim.treat(&id, "staurosporine", 0.5).expect("treat");
    let second = sim.treat(&id, "staurosporine", 0.5).expect("treat");
    assert_ne!(first, second);
    let summary = sim.advance_time(&id, 0.1).expect("advance");
    assert_eq!(summary.commitments_sampled, 6);

    let vessel = sim.vessel(&id).expect("vessel");
    let sub = vessel.subpopulation("typical").expect("typical");
    let delay_of = |exposure| {
        sub.commitments()
            .delay(&LatencyKey::new("staurosporine", exposure, "typical"))
            .expect("sampled")
    };
    assert_ne!(delay_of(first), delay_of(second));
}

#[test]
fn same_seed_replays_bit_identically_regardless_of_seeding_order() {
    let run = |order: [&str; 2]| {
        let mut sim = Simulation::new(seeded_config(505)).expect("sim");
        for name in order {
            sim.seed(VesselId::from(name), "A549", 4.0e5, false)
                .expect("seed");
        }
        sim.treat(&VesselId::from("R1"), "tunicamycin", 4.0)
            .expect("treat");
        sim.treat(&VesselId::from("R2"), "cccp", 20.0).expect("treat");
        sim.advance_all(18.0).expect("advance");
        sim.instant_kill(&VesselId::from("R1"), 0.2, KillCause::Handling)
            .expect("kill");
        sim.advance_all(30.0).expect("advance");
        sim
    };
    let a = run(["R1", "R2"]);
    let b = run(["R1", "R2"]);
    let c = run(["R2", "R1"]);

    let history_a: Vec<_> = a.history().cloned().collect();
    let history_b: Vec<_> = b.history().cloned().collect();
    assert_eq!(history_a, history_b);
    for name in ["R1", "R2"] {
        let id = VesselId::from(name);
        let fingerprint = a.vessel(&id).expect("a").fingerprint();
        assert_eq!(fingerprint, b.vessel(&id).expect("b").fingerprint());
        assert_eq!(fingerprint, c.vessel(&id).expect("c").fingerprint());
    }

    let mut other = Simulation::new(seeded_config(506)).expect("sim");
    other
        .seed(VesselId::from("R1"), "A549", 4.0e5, false)
        .expect("seed");
    assert_ne!(
        other.vessel(&VesselId::from("R1")).expect("r1").growth_multiplier(),
        a.vessel(&VesselId::from("R1")).expect("r1").growth_multiplier()
    );
}

#[test]
fn passage_below_unit_split_is_rejected_without_mutation() {
    let mut sim = Simulation::new(seeded_config(606)).expect("sim");
    let id = VesselId::from("T75_1");
    sim.seed(id.clone(), "HepG2", 4.0e6, false).expect("seed");
    let before = sim.vessel(&id).expect("vessel").fingerprint();
    let count = sim.vessel(&id).expect("vessel").cell_count();

    let err = sim
        .apply(Command::Passage {
            source_id: id.clone(),
            target_id: VesselId::from("T75_2"),
            split_ratio: 0.5,
        })
        .expect_err("invalid split");
    assert!(matches!(err, SimError::InvalidTransfer { .. }));
    assert_eq!(sim.vessel(&id).expect("vessel").fingerprint(), before);
    assert_eq!(sim.vessel(&id).expect("vessel").cell_count(), count);
    assert!(sim.vessel(&VesselId::from("T75_2")).is_none());
}

#[test]
fn passage_target_inherits_population_and_restarts_lag() {
    let mut sim = Simulation::new(SimulationConfig {
        passage_volume_cv: 0.05,
        ..seeded_config(707)
    })
    .expect("sim");
    let source = VesselId::from("P1_A01");
    let target = VesselId::from("P2_A01");
    sim.seed(source.clone(), "A549", 1.0e6, true).expect("seed");
    sim.treat(&source, "staurosporine", 0.5).expect("treat");
    sim.advance_time(&source, 12.0).expect("advance");
    let total_before = sim.vessel(&source).expect("source").cell_count();

    let outcome = match sim
        .apply(Command::Passage {
            source_id: source.clone(),
            target_id: target.clone(),
            split_ratio: 4.0,
        })
        .expect("passage")
    {
        CommandOutcome::Passaged(outcome) => outcome,
        other => panic!("unexpected outcome {other:?}"),
    };
    assert!(!outcome.source_retired);
    assert_eq!(
        sim.streams(&source)
            .expect("streams")
            .draw_count(StreamKind::Operational),
        1
    );

    let src = sim.vessel(&source).expect("source");
    let dst = sim.vessel(&target).expect("target");
    assert!((src.cell_count() + dst.cell_count() - total_before).abs() < 1e-6);
    assert!((dst.viability() - src.viability()).abs() < 1e-12);
    assert_eq!(dst.exposures().len(), 1);
    assert_eq!(dst.lag_anchor_hours(), 12.0);
    assert!(!dst.is_edge_well());
    assert_eq!(
        dst.media().glucose_mm,
        sim.config().media.glucose_mm
    );
    for (a, b) in src.subpopulations().iter().zip(dst.subpopulations()) {
        assert_eq!(a.ledger(), b.ledger());
        assert_eq!(a.phase(), b.phase());
    }

    sim.advance_time(&target, 13.0).expect("advance target");
    assert_eq!(sim.vessel(&target).expect("target").time_hours(), 13.0);
}

#[test]
fn washout_before_commitment_spares_cells_but_not_after() {
    let mut sim = Simulation::new(seeded_config(808)).expect("sim");
    let early = VesselId::from("W01");
    let late = VesselId::from("W02");
    for id in [&early, &late] {
        sim.seed(id.clone(), "A549", 3.0e5, false).expect("seed");
        sim.treat(id, "staurosporine", 5.0).expect("treat");
    }
    sim.washout(&early).expect("washout");
    sim.advance_time(&early, 24.0).expect("advance");
    for sub in sim.vessel(&early).expect("early").subpopulations() {
        assert_eq!(sub.ledger().get(DeathCause::CompoundAttrition), 0.0);
    }

    sim.advance_time(&late, 10.0).expect("advance");
    assert_eq!(sim.washout(&late).expect("washout"), 1);
    sim.advance_time(&late, 14.0).expect("advance");
    let last = vessel_records(&sim, &late)
        .last()
        .map(|record| record.effective_hazard)
        .expect("records");
    assert!(last > 0.1, "committed attrition stopped after washout: {last}");
}

#[test]
fn measurement_is_pure_and_read_only_batches_reject_writes() {
    let mut sim = Simulation::new(seeded_config(909)).expect("sim");
    let id = VesselId::from("M01");
    sim.seed(id.clone(), "A549", 2.0e5, false).expect("seed");
    sim.treat(&id, "staurosporine", 0.5).expect("treat");
    sim.advance_time(&id, 6.0).expect("advance");
    let before = sim.vessel(&id).expect("vessel").fingerprint();
    let draws = sim.streams(&id).expect("streams").biology_draw_counts();

    let signal = sim
        .measure(&id, |ctx| {
            let readout = ctx.readout();
            let noise = ctx.noise(0.02)?;
            Ok(readout.viability + noise)
        })
        .expect("measure");
    assert!(signal.is_finite());
    assert_eq!(sim.vessel(&id).expect("vessel").fingerprint(), before);
    assert_eq!(sim.streams(&id).expect("streams").biology_draw_counts(), draws);
    assert_eq!(
        sim.streams(&id)
            .expect("streams")
            .draw_count(StreamKind::Assay),
        1
    );

    let err = sim
        .apply_read_only(vec![Command::AdvanceTime {
            vessel_id: id.clone(),
            target_time_hours: 7.0,
        }])
        .expect_err("mutating");
    assert!(matches!(err, SimError::PrematureMutation { .. }));
    assert_eq!(sim.vessel(&id).expect("vessel").time_hours(), 6.0);
}

#[test]
fn starvation_and_feeding() {
    let mut sim = Simulation::new(SimulationConfig {
        media: cellsim_core::MediaConfig {
            glucose_mm: 3.0,
            ..cellsim_core::MediaConfig::default()
        },
        ..seeded_config(1_001)
    })
    .expect("sim");
    let id = VesselId::from("N01");
    sim.seed(id.clone(), "HepG2", 2.5e6, false).expect("seed");
    sim.advance_time(&id, 30.0).expect("advance");
    let starved = sim.vessel(&id).expect("vessel");
    assert!(starved.media().glucose_mm < 2.0);
    assert!(
        starved
            .subpopulations()
            .iter()
            .all(|sub| sub.ledger().get(DeathCause::NutrientDepletion) > 0.0)
    );
    sim.feed(&id).expect("feed");
    assert_eq!(sim.vessel(&id).expect("vessel").media().glucose_mm, 3.0);
}

#[test]
fn wiped_out_vessel_stays_dead_and_never_regrows() {
    let mut sim = Simulation::new(seeded_config(1_101)).expect("sim");
    let id = VesselId::from("Z01");
    sim.seed(id.clone(), "A549", 1.0e6, false).expect("seed");
    sim.advance_time(&id, 1.0).expect("advance");
    sim.instant_kill(&id, 0.999_999_9, KillCause::Handling)
        .expect("kill");

    let threshold = SimulationConfig::default().dead_viability_threshold;
    let after_kill = sim.vessel(&id).expect("vessel").cell_count();
    assert!(
        sim.vessel(&id)
            .expect("vessel")
            .subpopulations()
            .iter()
            .all(|sub| sub.phase() == SubpopulationPhase::EffectivelyDead)
    );

    sim.advance_time(&id, 600.0).expect("advance");
    let vessel = sim.vessel(&id).expect("vessel");
    assert_eq!(vessel.cell_count(), after_kill);
    assert!(vessel.viability() < threshold, "viability {}", vessel.viability());
    for sub in vessel.subpopulations() {
        assert_eq!(sub.phase(), SubpopulationPhase::EffectivelyDead);
        assert!(sub.viability() < threshold, "{} at {}", sub.name(), sub.viability());
    }
    let records = vessel_records(&sim, &id);
    assert!(
        records
            .windows(2)
            .all(|pair| pair[1].viability <= pair[0].viability)
    );
}

#[test]
fn pending_phase_starts_when_delay_is_drawn() {
    let mut sim = Simulation::new(seeded_config(1_202)).expect("sim");
    let id = VesselId::from("Z02");
    sim.seed(id.clone(), "A549", 1.0e6, false).expect("seed");
    sim.treat(&id, "staurosporine", 0.5).expect("treat");
    assert!(
        sim.vessel(&id)
            .expect("vessel")
            .subpopulations()
            .iter()
            .all(|sub| sub.phase() == SubpopulationPhase::Alive)
    );

    sim.advance_time(&id, 0.1).expect("advance");
    for sub in sim.vessel(&id).expect("vessel").subpopulations() {
        assert_eq!(sub.commitments().sampled_len(), 1);
        assert!(sub.phase() >= SubpopulationPhase::CommittedPending, "{}", sub.name());
    }
}
