mod common;

use common::simulate_season;
use framing::data::{load_pitch_records, write_effect_table, write_prediction_rows};
use framing::pipeline::{PipelineConfig, run};
use framing::rank::Direction;
use framing::records::CallOutcome;
use framing::EntityKind;
use std::io::Write;
use tempfile::{Builder, tempdir};

#[test]
fn loaded_table_runs_through_both_models() {
    let season = simulate_season(3000, 17, &[-0.6, 0.0, 0.6], &[-0.2, 0.2, 0.0]);

    let mut file = Builder::new().suffix(".csv").tempfile().unwrap();
    writeln!(
        file,
        "game_id,plate_x,plate_z,p_throws,stand,catcher_id,umpire_id,pitcher_id,outcome"
    )
    .unwrap();
    for r in &season.records {
        writeln!(
            file,
            "{},{},{},{},{},{},{},{},{}",
            r.game_id,
            r.horizontal_location,
            r.vertical_location,
            r.pitcher_throws,
            r.batter_stands,
            r.catcher_id,
            r.umpire_id,
            r.pitcher_id,
            if r.outcome == CallOutcome::Strike { "S" } else { "B" }
        )
        .unwrap();
    }
    file.flush().unwrap();

    let records = load_pitch_records(file.path()).unwrap();
    assert_eq!(records.len(), season.records.len());
    for (loaded, original) in records.iter().zip(&season.records) {
        assert_eq!(loaded.catcher_id, original.catcher_id);
        assert_eq!(loaded.pitcher_throws, original.pitcher_throws);
        assert_eq!(loaded.outcome, original.outcome);
        assert!((loaded.horizontal_location - original.horizontal_location).abs() < 1e-12);
        assert!((loaded.vertical_location - original.vertical_location).abs() < 1e-12);
    }

    let config = PipelineConfig {
        sample_size: Some(2000),
        seed: 5,
        top_n: 2,
        ..PipelineConfig::default()
    };
    let output = run(&records, &config).unwrap();

    assert_eq!(output.surface.num_rows, 2000);
    assert_eq!(output.annotated.len(), records.len());
    assert_eq!(output.effects.num_rows, records.len());
    assert_eq!(output.rankings.len(), 6);
    for table in &output.rankings {
        assert_eq!(table.entries.len(), 2);
    }

    let top = output.ranking(EntityKind::Catcher, Direction::Highest).unwrap();
    let bottom = output.ranking(EntityKind::Catcher, Direction::Lowest).unwrap();
    assert_eq!(top.entries[0].entity_id, "c2");
    assert_eq!(bottom.entries[0].entity_id, "c0");
    assert!(top.entries[0].effect >= top.entries[1].effect);
    assert!(bottom.entries[0].effect <= bottom.entries[1].effect);

    let dir = tempdir().unwrap();
    let predictions_path = dir.path().join("predictions.tsv");
    let effects_path = dir.path().join("effects.tsv");
    write_prediction_rows(&predictions_path, &output.annotated).unwrap();
    write_effect_table(&effects_path, &output.effects).unwrap();

    let predictions = std::fs::read_to_string(&predictions_path).unwrap();
    assert_eq!(predictions.lines().count(), records.len() + 1);
    assert!(predictions.lines().next().unwrap().ends_with("fitted_probability\tfitted_se"));
    let effects = std::fs::read_to_string(&effects_path).unwrap();
    assert_eq!(effects.lines().count(), output.effects.effects.len() + 1);
}

#[test]
fn repeated_runs_with_equal_seed_agree() {
    let season = simulate_season(1500, 23, &[-0.5, 0.5], &[0.0, 0.0]);
    let config = PipelineConfig {
        sample_size: Some(1000),
        seed: 99,
        ..PipelineConfig::default()
    };
    let a = run(&season.records, &config).unwrap();
    let b = run(&season.records, &config).unwrap();
    assert_eq!(a.effects.effects, b.effects.effects);
    for (x, y) in a.rankings.iter().zip(&b.rankings) {
        assert_eq!(x.entries, y.entries);
    }
}
