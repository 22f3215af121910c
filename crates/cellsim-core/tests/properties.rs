use cellsim_core::latency::sample_delay_hours;
use cellsim_core::{
    KillCause, LatencyConfig, RngStreams, Simulation, SimulationConfig, VesselId,
};
use proptest::prelude::*;

fn compound_strategy() -> impl Strategy<Value = &'static str> {
    prop_oneof![
        Just("staurosporine"),
        Just("tunicamycin"),
        Just("cccp"),
        Just("paclitaxel"),
    ]
}

fn kill_strategy() -> impl Strategy<Value = KillCause> {
    prop_oneof![
        Just(KillCause::AcuteCompound),
        Just(KillCause::Handling),
        Just(KillCause::Contamination),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn viability_stays_bounded_and_matches_weighted_mean(
        seed in 1_u64..50_000,
        compound in compound_strategy(),
        dose_um in 0.0_f64..20.0,
        kill in 0.0_f64..=1.0,
        cause in kill_strategy(),
        hours in 1.0_f64..30.0,
    ) {
        let mut sim = Simulation::new(SimulationConfig {
            master_seed: Some(seed),
            ..SimulationConfig::default()
        })
        .expect("sim");
        let id = VesselId::from("PROP");
        sim.seed(id.clone(), "A549", 1.0e6, false).expect("seed");
        sim.treat(&id, compound, dose_um).expect("treat");
        sim.advance_time(&id, hours * 0.5).expect("advance");
        sim.instant_kill(&id, kill, cause).expect("kill");
        sim.advance_time(&id, hours).expect("advance");

        let vessel = sim.vessel(&id).expect("vessel");
        let viability = vessel.viability();
        prop_assert!((0.0..=1.0).contains(&viability));
        let mut weighted = 0.0;
        for sub in vessel.subpopulations() {
            prop_assert!((0.0..=1.0).contains(&sub.viability()));
            weighted += sub.fraction() * sub.viability();
        }
        prop_assert!((viability - weighted).abs() <= 1e-9);
        vessel.verify_conservation(1e-9).expect("conserved");
        for record in sim.history() {
            prop_assert!((0.0..=1.0).contains(&record.viability));
        }
    }

    #[test]
    fn sampled_delay_never_grows_with_dose(
        seed in any::<u64>(),
        low in 1.0_f64..50.0,
        bump in 0.0_f64..50.0,
    ) {
        let config = LatencyConfig::default();
        let mut low_streams = RngStreams::from_seed(seed);
        let mut high_streams = RngStreams::from_seed(seed);
        let at_low = sample_delay_hours(low, &config, &mut low_streams)
            .expect("draw")
            .expect("lethal");
        let at_high = sample_delay_hours(low + bump, &config, &mut high_streams)
            .expect("draw")
            .expect("lethal");
        prop_assert!(at_high <= at_low);
        prop_assert!(at_low >= config.min_delay_hours && at_low <= config.max_delay_hours);
    }

    #[test]
    fn failed_passage_leaves_source_untouched(
        seed in 1_u64..10_000,
        split in -5.0_f64..0.999,
    ) {
        let mut sim = Simulation::new(SimulationConfig {
            master_seed: Some(seed),
            passage_volume_cv: 0.1,
            ..SimulationConfig::default()
        })
        .expect("sim");
        let id = VesselId::from("SRC");
        sim.seed(id.clone(), "HepG2", 2.0e6, false).expect("seed");
        let before = sim.vessel(&id).expect("vessel").fingerprint();
        let draws = sim.streams(&id).expect("streams").biology_draw_counts();
        prop_assert!(sim.passage(&id, VesselId::from("DST"), split).is_err());
        prop_assert_eq!(sim.vessel(&id).expect("vessel").fingerprint(), before);
        prop_assert_eq!(sim.streams(&id).expect("streams").biology_draw_counts(), draws);
    }
}
