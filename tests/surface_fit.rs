mod common;

use common::simulate_season;
use framing::error::{Error, InputError, Stage};
use framing::gam::estimate::FitError;
use framing::surface::{SurfaceConfig, evaluation_grid, fit_surface};
use framing::{CallOutcome, EntityKind, Handedness, PitchRecord, SurfacePoint};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn point(horizontal: f64, vertical: f64) -> SurfacePoint {
    SurfacePoint {
        horizontal,
        vertical,
        pitcher_throws: Handedness::Right,
        batter_stands: Handedness::Left,
    }
}

#[test]
fn centre_of_zone_is_a_strike_and_edges_are_balls() {
    let season = simulate_season(3000, 11, &[0.0, 0.0], &[0.0, 0.0]);
    let surface = fit_surface(&season.records, 3000, 1, &SurfaceConfig::default()).unwrap();

    let predictions = surface
        .predict(&[point(0.0, 2.5), point(1.7, 2.5), point(0.0, 0.9), point(-1.7, 4.1)])
        .unwrap();
    assert!(predictions[0].probability > 0.85, "centre {:?}", predictions[0]);
    for edge in &predictions[1..] {
        assert!(edge.probability < 0.2, "edge {:?}", edge);
    }
    for p in &predictions {
        assert!(p.standard_error > 0.0 && p.standard_error < 0.25);
    }
    assert!(surface.edf > 3.0);
    assert_eq!(surface.lambdas.len(), 2);
}

/// Strikes inside the rectangle `|h| < 0.85`, `1.5 <= v < 3.5` and balls outside it.
/// Within `edge_band` feet of the border calls are a coin flip; everywhere else
/// they are deterministic.
fn rectangle_zone_records(n: usize, seed: u64, edge_band: f64) -> Vec<PitchRecord> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|i| {
            let horizontal: f64 = rng.gen_range(-2.0..2.0);
            let vertical: f64 = rng.gen_range(0.0..5.0);
            let inside = horizontal.abs() < 0.85 && (1.5..3.5).contains(&vertical);
            let distance_to_border = (horizontal.abs() - 0.85)
                .abs()
                .min((vertical - 1.5).abs())
                .min((vertical - 3.5).abs());
            let strike = if distance_to_border < edge_band {
                rng.r#gen::<f64>() < 0.5
            } else {
                inside
            };
            PitchRecord {
                game_id: format!("g{}", i / 150),
                horizontal_location: horizontal,
                vertical_location: vertical,
                pitcher_throws: if i % 3 == 0 { Handedness::Left } else { Handedness::Right },
                batter_stands: if i % 2 == 0 { Handedness::Left } else { Handedness::Right },
                catcher_id: format!("c{}", i % 6),
                umpire_id: format!("u{}", i % 4),
                pitcher_id: format!("p{}", i % 9),
                outcome: if strike { CallOutcome::Strike } else { CallOutcome::Ball },
            }
        })
        .collect()
}

fn assert_centre_and_far_outside_contrast(records: &[PitchRecord]) {
    let surface = fit_surface(records, records.len(), 0, &SurfaceConfig::default()).unwrap();
    // Every far point is more than one foot outside the rectangle.
    let predictions = surface
        .predict(&[point(0.0, 2.5), point(1.9, 2.5), point(-1.9, 2.5), point(0.0, 0.2), point(0.0, 4.8)])
        .unwrap();
    assert!(predictions[0].probability > 0.95, "centre {:?}", predictions[0]);
    for far in &predictions[1..] {
        assert!(far.probability < 0.05, "far outside {:?}", far);
    }
}

#[test]
fn noise_free_rectangle_zone_fits_and_separates_centre_from_far_outside() {
    let records = rectangle_zone_records(4000, 12, 0.0);
    assert_centre_and_far_outside_contrast(&records);
}

#[test]
fn rectangle_zone_with_ambiguous_border_separates_centre_from_far_outside() {
    let records = rectangle_zone_records(4000, 13, 0.15);
    assert_centre_and_far_outside_contrast(&records);
}

#[test]
fn equal_seed_gives_identical_surface() {
    let season = simulate_season(2500, 5, &[0.0, 0.0], &[0.0, 0.0]);
    let config = SurfaceConfig::default();
    let a = fit_surface(&season.records, 1500, 77, &config).unwrap();
    let b = fit_surface(&season.records, 1500, 77, &config).unwrap();

    assert_eq!(a.coefficients.smooth, b.coefficients.smooth);
    assert_eq!(a.coefficients.intercept, b.coefficients.intercept);
    assert_eq!(a.lambdas, b.lambdas);

    let grid = evaluation_grid(a.horizontal_range, a.vertical_range, 6, Handedness::Left, Handedness::Right);
    assert_eq!(a.predict(&grid).unwrap(), b.predict(&grid).unwrap());
}

#[test]
fn mean_standard_error_shrinks_with_sample_size_over_repeated_draws() {
    let season = simulate_season(4000, 21, &[0.0, 0.0], &[0.0, 0.0]);
    let config = SurfaceConfig::default();
    let grid = evaluation_grid((-0.8, 0.8), (1.8, 3.2), 5, Handedness::Right, Handedness::Right);
    let mean_se = |sample_size: usize, seed: u64| {
        let surface = fit_surface(&season.records, sample_size, seed, &config).unwrap();
        let probability_se = surface
            .predict(&grid)
            .unwrap()
            .iter()
            .map(|p| p.standard_error)
            .sum::<f64>();
        let link_se = surface
            .predict_link(&grid)
            .unwrap()
            .iter()
            .map(|&(_, se)| se)
            .sum::<f64>();
        let points = grid.len() as f64;
        (probability_se / points, link_se / points)
    };

    let seeds = [3, 4, 5];
    let average = |sample_size: usize| {
        let (probability, link) = seeds
            .iter()
            .map(|&seed| mean_se(sample_size, seed))
            .fold((0.0, 0.0), |acc, (p, l)| (acc.0 + p, acc.1 + l));
        (probability / 3.0, link / 3.0)
    };
    let (small, small_link) = average(600);
    let (large, large_link) = average(2400);
    assert!(large < small, "probability scale: large {} vs small {}", large, small);
    assert!(large_link < small_link, "link scale: large {} vs small {}", large_link, small_link);
}

#[test]
fn annotation_covers_every_record_with_valid_probabilities() {
    let season = simulate_season(1800, 2, &[0.0, 0.0], &[0.0, 0.0]);
    let surface = fit_surface(&season.records, 1000, 4, &SurfaceConfig::default()).unwrap();
    let annotated = surface.annotate(&season.records).unwrap();
    assert_eq!(annotated.len(), season.records.len());
    for (row, record) in annotated.iter().zip(&season.records) {
        assert_eq!(&row.record, record);
        assert!((0.0..=1.0).contains(&row.fitted_probability));
        assert!(row.fitted_se.is_finite() && row.fitted_se >= 0.0);
    }
}

#[test]
fn all_balls_is_a_surface_fit_error() {
    let mut season = simulate_season(300, 9, &[0.0, 0.0], &[0.0, 0.0]);
    for record in &mut season.records {
        record.outcome = CallOutcome::Ball;
    }
    match fit_surface(&season.records, 300, 0, &SurfaceConfig::default()) {
        Err(Error::Fit {
            stage: Stage::Surface,
            source: FitError::SingleOutcomeClass { n },
        }) => assert_eq!(n, 300),
        other => panic!("expected SingleOutcomeClass, got {:?}", other),
    }
}

#[test]
fn invalid_inputs_are_rejected_before_fitting() {
    let mut season = simulate_season(200, 3, &[0.0, 0.0], &[0.0, 0.0]);
    assert!(matches!(
        fit_surface(&season.records, 201, 0, &SurfaceConfig::default()),
        Err(Error::Input {
            source: InputError::SampleSizeTooLarge {
                requested: 201,
                available: 200
            },
            ..
        })
    ));
    match fit_surface(&season.records, 0, 0, &SurfaceConfig::default()) {
        Err(Error::Input {
            stage: Stage::Surface,
            source: InputError::ZeroSampleSize { available },
        }) => assert_eq!(available, 200),
        other => panic!("expected ZeroSampleSize, got {:?}", other),
    }
    assert!(matches!(
        fit_surface(&[], 10, 0, &SurfaceConfig::default()),
        Err(Error::Fit {
            source: FitError::EmptyInput,
            ..
        })
    ));

    season.records[17].catcher_id = String::new();
    assert!(matches!(
        fit_surface(&season.records, 100, 0, &SurfaceConfig::default()),
        Err(Error::Input {
            stage: Stage::Surface,
            source: InputError::MissingEntityId {
                row: 17,
                kind: EntityKind::Catcher
            },
        })
    ));

    season.records[17].catcher_id = "c0".to_string();
    season.records[40].vertical_location = f64::NAN;
    assert!(matches!(
        fit_surface(&season.records, 100, 0, &SurfaceConfig::default()),
        Err(Error::Input {
            source: InputError::NonFiniteLocation { row: 40, .. },
            ..
        })
    ));
}
