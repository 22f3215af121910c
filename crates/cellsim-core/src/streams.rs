//! Named random streams with call-site allow-listing.
//!
//! Every vessel owns one [`RngStreams`] bundle derived from the master seed and
//! its own identifier, so vessels never share generator state. Each draw names
//! the site requesting it; sites are bound to exactly one stream and a request
//! against any other stream is refused without consuming randomness. This keeps
//! measurement-side sampling from perturbing biology and vice versa.

use rand::SeedableRng;
use rand::distr::Distribution;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::VesselId;
use crate::error::{SimError, SimResult};

/// Independent random sources available to a vessel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StreamKind {
    Growth,
    Treatment,
    Operational,
    /// Reserved for the external measurement layer.
    Assay,
}

impl StreamKind {
    pub const ALL: [StreamKind; 4] = [
        StreamKind::Growth,
        StreamKind::Treatment,
        StreamKind::Operational,
        StreamKind::Assay,
    ];

    const fn chacha_stream(self) -> u64 {
        match self {
            StreamKind::Growth => 1,
            StreamKind::Treatment => 2,
            StreamKind::Operational => 3,
            StreamKind::Assay => 4,
        }
    }

    const fn slot(self) -> usize {
        match self {
            StreamKind::Growth => 0,
            StreamKind::Treatment => 1,
            StreamKind::Operational => 2,
            StreamKind::Assay => 3,
        }
    }
}

/// Code locations permitted to draw randomness.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DrawSite {
    /// Per-vessel growth-rate multiplier sampled at creation.
    GrowthRateJitter,
    /// Commitment delay per (exposure, subpopulation).
    CommitmentDelay,
    /// Pipetting error when passaging.
    PassageVolume,
    /// Noise added by assay readouts.
    AssayNoise,
}

const ALLOW_LIST: &[(DrawSite, &[StreamKind])] = &[
    (DrawSite::GrowthRateJitter, &[StreamKind::Growth]),
    (DrawSite::CommitmentDelay, &[StreamKind::Treatment]),
    (DrawSite::PassageVolume, &[StreamKind::Operational]),
    (DrawSite::AssayNoise, &[StreamKind::Assay]),
];

impl DrawSite {
    /// Streams this site is allowed to consume.
    #[must_use]
    pub fn allowed_streams(self) -> &'static [StreamKind] {
        ALLOW_LIST
            .iter()
            .find(|(site, _)| *site == self)
            .map_or(&[], |(_, streams)| *streams)
    }

    #[must_use]
    pub fn may_draw_from(self, stream: StreamKind) -> bool {
        self.allowed_streams().contains(&stream)
    }
}

#[derive(Debug, Clone)]
struct GovernedStream {
    rng: ChaCha8Rng,
    draws: u64,
}

/// Bundle of governed streams owned by one vessel.
#[derive(Debug, Clone)]
pub struct RngStreams {
    seed: u64,
    streams: [GovernedStream; 4],
}

impl RngStreams {
    /// Derive the stream bundle for `vessel_id` from the master seed.
    #[must_use]
    pub fn for_vessel(master_seed: u64, vessel_id: &VesselId) -> Self {
        Self::from_seed(derive_seed(master_seed, vessel_id.as_str()))
    }

    /// Build streams directly from a derived seed.
    #[must_use]
    pub fn from_seed(seed: u64) -> Self {
        let make = |kind: StreamKind| {
            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            rng.set_stream(kind.chacha_stream());
            GovernedStream { rng, draws: 0 }
        };
        Self {
            seed,
            streams: StreamKind::ALL.map(make),
        }
    }

    /// Seed shared by all streams in the bundle.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Draw one sample from `dist` on `stream` on behalf of `site`.
    pub fn sample<D: Distribution<f64>>(
        &mut self,
        stream: StreamKind,
        site: DrawSite,
        dist: &D,
    ) -> SimResult<f64> {
        if !site.may_draw_from(stream) {
            return Err(SimError::UnauthorizedDraw { site, stream });
        }
        let governed = &mut self.streams[stream.slot()];
        governed.draws += 1;
        Ok(dist.sample(&mut governed.rng))
    }

    /// Number of samples drawn from `stream` so far.
    #[must_use]
    pub fn draw_count(&self, stream: StreamKind) -> u64 {
        self.streams[stream.slot()].draws
    }

    /// Draw counts for the streams the biology depends on.
    #[must_use]
    pub fn biology_draw_counts(&self) -> [u64; 3] {
        [
            self.draw_count(StreamKind::Growth),
            self.draw_count(StreamKind::Treatment),
            self.draw_count(StreamKind::Operational),
        ]
    }
}

fn derive_seed(master_seed: u64, label: &str) -> u64 {
    // FNV-1a over the label, then a splitmix64 finalizer over the mix.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in label.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    splitmix64(master_seed ^ hash)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}
