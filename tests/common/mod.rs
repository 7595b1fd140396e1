use framing::{CallOutcome, Handedness, PitchRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;

/// Known entity effects and the pitches simulated from them.
pub struct Season {
    pub records: Vec<PitchRecord>,
    pub catcher_effects: HashMap<String, f64>,
}

/// Log-odds of a called strike for an average catcher, umpire and pitcher.
///
/// A soft elliptical zone: about +3 at the centre, crossing zero at the edges.
pub fn zone_logit(horizontal: f64, vertical: f64) -> f64 {
    let h = horizontal / 0.9;
    let v = (vertical - 2.5) / 1.0;
    3.0 * (1.0 - h * h - v * v)
}

fn sigmoid(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta).exp())
}

/// Simulates `n` taken pitches over a box around the zone.
///
/// Catcher `c{k}` and umpire `u{k}` carry the listed effects; pitchers get small
/// random effects.
pub fn simulate_season(n: usize, seed: u64, catcher_effects: &[f64], umpire_effects: &[f64]) -> Season {
    let mut rng = StdRng::seed_from_u64(seed);
    let pitcher_noise = Normal::new(0.0, 0.1).unwrap();
    let pitcher_effects: Vec<f64> = (0..8).map(|_| pitcher_noise.sample(&mut rng)).collect();

    let records = (0..n)
        .map(|i| {
            let horizontal: f64 = rng.gen_range(-1.8..1.8);
            let vertical: f64 = rng.gen_range(0.8..4.2);
            let catcher = rng.gen_range(0..catcher_effects.len());
            let umpire = rng.gen_range(0..umpire_effects.len());
            let pitcher = rng.gen_range(0..pitcher_effects.len());
            let eta = zone_logit(horizontal, vertical)
                + catcher_effects[catcher]
                + umpire_effects[umpire]
                + pitcher_effects[pitcher];
            let strike = rng.r#gen::<f64>() < sigmoid(eta);
            PitchRecord {
                game_id: format!("g{}", i / 140),
                horizontal_location: horizontal,
                vertical_location: vertical,
                pitcher_throws: if pitcher % 3 == 0 { Handedness::Left } else { Handedness::Right },
                batter_stands: if rng.r#gen::<bool>() { Handedness::Left } else { Handedness::Right },
                catcher_id: format!("c{}", catcher),
                umpire_id: format!("u{}", umpire),
                pitcher_id: format!("p{}", pitcher),
                outcome: if strike { CallOutcome::Strike } else { CallOutcome::Ball },
            }
        })
        .collect();

    Season {
        records,
        catcher_effects: catcher_effects
            .iter()
            .enumerate()
            .map(|(k, &e)| (format!("c{}", k), e))
            .collect(),
    }
}
