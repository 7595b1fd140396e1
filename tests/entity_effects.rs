mod common;

use common::simulate_season;
use framing::effects::{EffectsConfig, fit_entity_effects};
use framing::rank::{Direction, rank};
use framing::surface::{SurfaceConfig, fit_surface};
use framing::{EntityKind, PredictionRow};

const CATCHER_EFFECTS: [f64; 5] = [-0.8, -0.4, 0.0, 0.4, 0.8];
const UMPIRE_EFFECTS: [f64; 4] = [-0.3, -0.1, 0.1, 0.3];

fn annotated_season(n: usize, seed: u64) -> (common::Season, Vec<PredictionRow>) {
    let season = simulate_season(n, seed, &CATCHER_EFFECTS, &UMPIRE_EFFECTS);
    let surface = fit_surface(&season.records, 2500.min(n), seed, &SurfaceConfig::default()).unwrap();
    let annotated = surface.annotate(&season.records).unwrap();
    (season, annotated)
}

#[test]
fn catcher_effects_recover_the_simulated_order() {
    let (season, annotated) = annotated_season(6000, 31);
    let table = fit_entity_effects(&annotated, &EffectsConfig::default()).unwrap();

    let ranked = rank(&table, EntityKind::Catcher, Direction::Highest, 5);
    let ids: Vec<&str> = ranked.iter().map(|r| r.entity_id.as_str()).collect();
    assert_eq!(ids, vec!["c4", "c3", "c2", "c1", "c0"]);

    let lowest = rank(&table, EntityKind::Catcher, Direction::Lowest, 1);
    assert_eq!(lowest[0].entity_id, "c0");

    let best = ranked[0].effect;
    let worst = ranked[4].effect;
    let truth = season.catcher_effects["c4"] - season.catcher_effects["c0"];
    assert!(best - worst > 0.4 * truth, "spread {} vs true {}", best - worst, truth);
    assert!(best - worst < 1.6 * truth, "spread {} vs true {}", best - worst, truth);
}

#[test]
fn effect_table_is_complete_and_centred() {
    let (season, annotated) = annotated_season(4000, 8);
    let table = fit_entity_effects(&annotated, &EffectsConfig::default()).unwrap();

    assert_eq!(table.num_rows, season.records.len());
    assert_eq!(table.effects_of(EntityKind::Catcher).count(), CATCHER_EFFECTS.len());
    assert_eq!(table.effects_of(EntityKind::Umpire).count(), UMPIRE_EFFECTS.len());
    assert_eq!(table.effects_of(EntityKind::Pitcher).count(), 8);

    let catcher_ids: Vec<&str> = table
        .effects_of(EntityKind::Catcher)
        .map(|e| e.entity_id.as_str())
        .collect();
    let mut sorted = catcher_ids.clone();
    sorted.sort();
    assert_eq!(catcher_ids, sorted);

    for kind in EntityKind::ALL {
        let pitches: usize = table.effects_of(kind).map(|e| e.num_pitches).sum();
        assert_eq!(pitches, season.records.len());
        let variance = table.variance_of(kind).unwrap();
        assert!(variance.is_finite() && variance > 0.0);
        for effect in table.effects_of(kind) {
            assert!(effect.effect.is_finite());
            assert!(effect.conditional_sd > 0.0 && effect.conditional_sd.is_finite());
        }
        // Ridge-penalized intercepts with a free global intercept sum near zero.
        let total: f64 = table.effects_of(kind).map(|e| e.effect).sum();
        assert!(total.abs() < 0.1, "{} effects sum to {}", kind, total);
    }

    assert!(table.fixed.fitted_probability > 0.0);
    assert!(table.variance_of(EntityKind::Catcher).unwrap() > table.variance_of(EntityKind::Pitcher).unwrap());
}

#[test]
fn conditional_sd_falls_with_pitch_count() {
    let (_, mut annotated) = annotated_season(3000, 13);
    // c0 keeps only a handful of pitches.
    let mut kept = 0;
    annotated.retain(|row| {
        if row.record.catcher_id != "c0" {
            return true;
        }
        kept += 1;
        kept <= 40
    });
    let table = fit_entity_effects(&annotated, &EffectsConfig::default()).unwrap();
    let sparse = table
        .effects_of(EntityKind::Catcher)
        .find(|e| e.entity_id == "c0")
        .unwrap();
    let dense = table
        .effects_of(EntityKind::Catcher)
        .find(|e| e.entity_id == "c2")
        .unwrap();
    assert_eq!(sparse.num_pitches, 40);
    assert!(sparse.conditional_sd > dense.conditional_sd);
}
