//! Deterministic population growth.

use std::f64::consts::LN_2;

use crate::config::{GrowthConfig, MediaConfig};
use crate::vessel::{MediaState, Vessel};

/// Below this many dividing cells a vessel does not grow.
pub const MIN_PROLIFERATING_CELLS: f64 = 1.0;

/// Intrinsic exponential rate (1/h) for a doubling time.
#[must_use]
pub fn base_rate(doubling_time_hours: f64) -> f64 {
    LN_2 / doubling_time_hours
}

/// Post-seeding lag: 0 right after seeding, approaching 1.
#[must_use]
pub fn lag_factor(hours_since_anchor: f64, lag_hours: f64) -> f64 {
    if lag_hours <= 0.0 {
        return 1.0;
    }
    (1.0 - (-hours_since_anchor.max(0.0) / lag_hours).exp()).clamp(0.0, 1.0)
}

fn monod(level: f64, half_saturation: f64) -> f64 {
    if half_saturation <= 0.0 {
        return if level > 0.0 { 1.0 } else { 0.0 };
    }
    let level = level.max(0.0);
    level / (level + half_saturation)
}

/// Nutrient limitation relative to fresh medium, in [0, 1].
#[must_use]
pub fn environment_modifier(media: &MediaState, fresh: &MediaConfig, config: &GrowthConfig) -> f64 {
    let glucose = monod(media.glucose_mm, config.glucose_half_saturation_mm);
    let glutamine = monod(media.glutamine_mm, config.glutamine_half_saturation_mm);
    let glucose_fresh = monod(fresh.glucose_mm, config.glucose_half_saturation_mm);
    let glutamine_fresh = monod(fresh.glutamine_mm, config.glutamine_half_saturation_mm);
    if glucose_fresh <= 0.0 || glutamine_fresh <= 0.0 {
        return 0.0;
    }
    ((glucose / glucose_fresh) * (glutamine / glutamine_fresh)).clamp(0.0, 1.0)
}

/// `base_rate * lag * (1 - edge_penalty) * environment_modifier`.
#[must_use]
pub fn effective_rate(base_rate: f64, lag: f64, edge_penalty: f64, environment: f64) -> f64 {
    base_rate * lag * (1.0 - edge_penalty) * environment
}

/// Newborn cells over `dt` from `dN/dt = r N (1 - (c / c_max)^2)`.
///
/// The crowding term is held at its start-of-step value and the step is
/// integrated exactly. Past `c_max` growth stops; crowding death is a hazard
/// source, never negative growth.
#[must_use]
pub fn growth_increment(
    viable_cells: f64,
    confluence: f64,
    max_confluence: f64,
    rate: f64,
    dt_hours: f64,
) -> f64 {
    if viable_cells <= 0.0 || rate <= 0.0 {
        return 0.0;
    }
    let crowding = 1.0 - (confluence / max_confluence).powi(2);
    if crowding <= 0.0 {
        return 0.0;
    }
    viable_cells * (rate * crowding * dt_hours).exp_m1()
}

/// Newborn cells for `vessel` over one step whose death has already been committed.
///
/// Works from the post-death viable count of subpopulations that are not
/// effectively dead; survival is never reapplied here.
#[must_use]
pub fn step_growth(
    vessel: &Vessel,
    dt_hours: f64,
    growth: &GrowthConfig,
    media: &MediaConfig,
) -> f64 {
    let proliferating = vessel.proliferating_cells();
    if proliferating < MIN_PROLIFERATING_CELLS {
        return 0.0;
    }
    let rate = effective_rate(
        base_rate(vessel.doubling_time_hours()) * vessel.growth_multiplier(),
        lag_factor(
            vessel.time_hours() - vessel.lag_anchor_hours(),
            growth.lag_hours,
        ),
        if vessel.is_edge_well() {
            growth.edge_penalty
        } else {
            0.0
        },
        environment_modifier(&vessel.media(), media, growth),
    );
    growth_increment(
        proliferating,
        vessel.confluence(),
        growth.max_confluence,
        rate,
        dt_hours,
    )
}
