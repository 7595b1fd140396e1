use ndarray::Array1;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How many starting points the outer optimizer screens before BFGS.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SeedStrategy {
    /// Start from `ρ = 0` only.
    Single,
    /// Uniform `ρ` vectors every 4 log-units plus one-axis extremes.
    Light,
    /// Uniform `ρ` vectors every 2 log-units, one-axis extremes and pairwise contrasts.
    Exhaustive,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SeedConfig {
    pub strategy: SeedStrategy,
    pub bounds: (f64, f64),
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            strategy: SeedStrategy::Light,
            bounds: (-8.0, 8.0),
        }
    }
}

fn ordered(bounds: (f64, f64)) -> (f64, f64) {
    if bounds.0 <= bounds.1 {
        bounds
    } else {
        (bounds.1, bounds.0)
    }
}

fn uniform_levels(strategy: SeedStrategy, bounds: (f64, f64)) -> Vec<f64> {
    let step = match strategy {
        SeedStrategy::Single => return vec![0.0],
        SeedStrategy::Light => 4.0,
        SeedStrategy::Exhaustive => 2.0,
    };
    let (lo, hi) = ordered(bounds);
    let mut levels = Vec::new();
    let mut v = 0.0_f64.clamp(lo, hi);
    // Walk outwards from zero so the neutral start is always screened first.
    levels.push(v);
    while v + step <= hi + 1e-9 {
        v += step;
        levels.push(v);
    }
    v = levels[0];
    while v - step >= lo - 1e-9 {
        v -= step;
        levels.push(v);
    }
    levels
}

fn axis_extremes(strategy: SeedStrategy, bounds: (f64, f64)) -> Vec<f64> {
    let (lo, hi) = ordered(bounds);
    match strategy {
        SeedStrategy::Single => Vec::new(),
        SeedStrategy::Light => vec![hi, lo],
        SeedStrategy::Exhaustive => vec![hi, hi / 2.0, lo / 2.0, lo],
    }
}

/// Candidate starting points for the log smoothing parameters.
///
/// `heuristic_lambdas` holds one `λ` per penalty; when given, its log is screened
/// first. Duplicates are removed while keeping the first occurrence, so the order
/// is stable for a given input.
pub fn generate_rho_candidates(
    num_penalties: usize,
    heuristic_lambdas: Option<&[f64]>,
    config: &SeedConfig,
) -> Vec<Array1<f64>> {
    let (lo, hi) = ordered(config.bounds);
    let mut seeds = Vec::new();

    if let Some(lambdas) = heuristic_lambdas.filter(|l| l.len() == num_penalties) {
        seeds.push(
            lambdas
                .iter()
                .map(|&lambda| lambda.max(1e-12).ln().clamp(lo, hi))
                .collect::<Array1<f64>>(),
        );
    }

    for level in uniform_levels(config.strategy, config.bounds) {
        seeds.push(Array1::from_elem(num_penalties, level));
    }

    if num_penalties > 1 {
        let extremes = axis_extremes(config.strategy, config.bounds);
        for idx in 0..num_penalties {
            for &value in &extremes {
                let mut seed = Array1::zeros(num_penalties);
                seed[idx] = value;
                seeds.push(seed);
            }
        }
    }

    if num_penalties > 1 && config.strategy == SeedStrategy::Exhaustive {
        for i in 0..num_penalties {
            for j in (i + 1)..num_penalties {
                for (a, b) in [(hi, lo / 2.0), (lo / 2.0, hi)] {
                    let mut seed = Array1::zeros(num_penalties);
                    seed[i] = a;
                    seed[j] = b;
                    seeds.push(seed);
                }
            }
        }
    }

    let mut seen: HashSet<Vec<u64>> = HashSet::new();
    seeds
        .into_iter()
        .filter(|s| seen.insert(s.iter().map(|v| v.to_bits()).collect()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_is_clamped_and_ignored_when_its_length_is_wrong() {
        let config = SeedConfig::default();
        let clamped = generate_rho_candidates(2, Some(&[1e12, 0.0]), &config);
        assert_eq!(clamped[0].to_vec(), vec![8.0, -8.0]);

        let mismatched = generate_rho_candidates(2, Some(&[1.0]), &config);
        assert_eq!(mismatched, generate_rho_candidates(2, None, &config));
    }

    #[test]
    fn single_strategy_yields_only_the_neutral_start() {
        let config = SeedConfig {
            strategy: SeedStrategy::Single,
            bounds: (-8.0, 8.0),
        };
        let seeds = generate_rho_candidates(3, None, &config);
        assert_eq!(seeds.len(), 1);
        assert!(seeds[0].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn light_strategy_stays_in_bounds_and_is_unique() {
        let config = SeedConfig::default();
        let seeds = generate_rho_candidates(2, Some(&[1e3, 1e-5]), &config);
        assert!(
            seeds
                .iter()
                .all(|s| s.iter().all(|&v| (-8.0..=8.0).contains(&v)))
        );
        for (i, a) in seeds.iter().enumerate() {
            for b in seeds.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        // The heuristic seed comes first, one component per penalty.
        assert!((seeds[0][0] - 1e3_f64.ln()).abs() < 1e-12);
        assert!((seeds[0][1] - 1e-5_f64.ln()).abs() < 1e-12);
        // Zero, +4, +8, -4, -8 uniform plus two extremes per axis.
        assert_eq!(seeds.len(), 1 + 5 + 4);
    }
}
