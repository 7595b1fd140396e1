//! # Data loading and output tables
//!
//! Reads an already-filtered table of taken pitches, one row per pitch, with a
//! fixed schema:
//!
//! `game_id, plate_x, plate_z, p_throws, stand, catcher_id, umpire_id, pitcher_id, outcome`
//!
//! Files ending in `.csv` are comma-separated; anything else is read as TSV.
//! Handedness is coded `L`/`R` and outcomes `1`/`0` or `S`/`B`. Empty entity
//! ids are passed through as empty strings so the fitting stages can report
//! them with the offending row.
//!
//! Outputs are tab-separated tables written with the `csv` crate.

use crate::effects::EffectTable;
use crate::rank::RankedEntity;
use crate::records::{CallOutcome, Handedness, PitchRecord, PredictionRow, SurfacePoint};
use crate::surface::StrikePrediction;

use polars::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Columns every input table must contain.
pub const REQUIRED_COLUMNS: [&str; 9] = [
    "game_id",
    "plate_x",
    "plate_z",
    "p_throws",
    "stand",
    "catcher_id",
    "umpire_id",
    "pitcher_id",
    "outcome",
];

/// A comprehensive error type for all data loading and writing failures.
#[derive(Error, Debug)]
pub enum DataError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to write table: {0}")]
    CsvError(#[from] csv::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the required column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Row {row}: '{value}' is not a valid code for column '{column_name}' (expected {expected}).")]
    InvalidCode {
        column_name: String,
        row: usize,
        value: String,
        expected: &'static str,
    },
    #[error("The input file contains no data rows.")]
    NoRows,
}

/// Loads and validates a table of taken pitches.
pub fn load_pitch_records(path: &Path) -> Result<Vec<PitchRecord>, DataError> {
    let separator = match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => b',',
        _ => b'\t',
    };
    log::info!("Loading pitch records from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    if df.height() == 0 {
        return Err(DataError::NoRows);
    }

    let columns: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for name in REQUIRED_COLUMNS {
        if !columns.contains(name) {
            return Err(DataError::ColumnNotFound(name.to_string()));
        }
    }
    let df = df.select(REQUIRED_COLUMNS)?;

    let game_id = internal::extract_text_column(&df, "game_id", false)?;
    let plate_x = internal::extract_numeric_column(&df, "plate_x")?;
    let plate_z = internal::extract_numeric_column(&df, "plate_z")?;
    let p_throws = internal::extract_coded_column(&df, "p_throws", Handedness::from_code, "L or R")?;
    let stand = internal::extract_coded_column(&df, "stand", Handedness::from_code, "L or R")?;
    let catcher_id = internal::extract_text_column(&df, "catcher_id", true)?;
    let umpire_id = internal::extract_text_column(&df, "umpire_id", true)?;
    let pitcher_id = internal::extract_text_column(&df, "pitcher_id", true)?;
    let outcome =
        internal::extract_coded_column(&df, "outcome", CallOutcome::from_code, "1/0 or S/B")?;

    let records: Vec<PitchRecord> = (0..df.height())
        .map(|i| PitchRecord {
            game_id: game_id[i].clone(),
            horizontal_location: plate_x[i],
            vertical_location: plate_z[i],
            pitcher_throws: p_throws[i],
            batter_stands: stand[i],
            catcher_id: catcher_id[i].clone(),
            umpire_id: umpire_id[i].clone(),
            pitcher_id: pitcher_id[i].clone(),
            outcome: outcome[i],
        })
        .collect();

    log::info!("Loaded {} pitch records.", records.len());
    Ok(records)
}

mod internal {
    use super::*;

    pub(super) fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, DataError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let wrong_type = || DataError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        };
        let casted = series.cast(&DataType::Float64).map_err(|_| wrong_type())?;
        if casted.null_count() > 0 {
            return Err(wrong_type());
        }
        let values: Vec<f64> = casted.f64()?.rechunk().into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(DataError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    /// Reads a column as text. With `allow_missing`, nulls become empty strings.
    pub(super) fn extract_text_column(
        df: &DataFrame,
        column_name: &str,
        allow_missing: bool,
    ) -> Result<Vec<String>, DataError> {
        let series = df.column(column_name)?;
        if !allow_missing && series.null_count() > 0 {
            return Err(DataError::MissingValuesFound(column_name.to_string()));
        }
        let casted = series.cast(&DataType::String)?;
        Ok(casted
            .str()?
            .into_iter()
            .map(|v| v.map(|s| s.trim().to_string()).unwrap_or_default())
            .collect())
    }

    pub(super) fn extract_coded_column<T>(
        df: &DataFrame,
        column_name: &str,
        parse: fn(&str) -> Option<T>,
        expected: &'static str,
    ) -> Result<Vec<T>, DataError> {
        let text = extract_text_column(df, column_name, false)?;
        text.iter()
            .enumerate()
            .map(|(row, value)| {
                parse(value).ok_or_else(|| DataError::InvalidCode {
                    column_name: column_name.to_string(),
                    row,
                    value: value.clone(),
                    expected,
                })
            })
            .collect()
    }
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<File>, DataError> {
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?)
}

fn outcome_code(outcome: CallOutcome) -> u8 {
    match outcome {
        CallOutcome::Strike => 1,
        CallOutcome::Ball => 0,
    }
}

#[derive(Serialize)]
struct AnnotatedRow<'a> {
    game_id: &'a str,
    plate_x: f64,
    plate_z: f64,
    p_throws: &'static str,
    stand: &'static str,
    catcher_id: &'a str,
    umpire_id: &'a str,
    pitcher_id: &'a str,
    outcome: u8,
    fitted_probability: f64,
    fitted_se: f64,
}

/// Writes every pitch with its fitted strike probability and standard error.
pub fn write_prediction_rows(path: &Path, rows: &[PredictionRow]) -> Result<(), DataError> {
    let mut writer = tsv_writer(path)?;
    for row in rows {
        let r = &row.record;
        writer.serialize(AnnotatedRow {
            game_id: &r.game_id,
            plate_x: r.horizontal_location,
            plate_z: r.vertical_location,
            p_throws: r.pitcher_throws.code(),
            stand: r.batter_stands.code(),
            catcher_id: &r.catcher_id,
            umpire_id: &r.umpire_id,
            pitcher_id: &r.pitcher_id,
            outcome: outcome_code(r.outcome),
            fitted_probability: row.fitted_probability,
            fitted_se: row.fitted_se,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct GridRow {
    plate_x: f64,
    plate_z: f64,
    p_throws: &'static str,
    stand: &'static str,
    probability: f64,
    standard_error: f64,
}

pub fn write_grid_predictions(
    path: &Path,
    points: &[SurfacePoint],
    predictions: &[StrikePrediction],
) -> Result<(), DataError> {
    let mut writer = tsv_writer(path)?;
    for (point, prediction) in points.iter().zip(predictions) {
        writer.serialize(GridRow {
            plate_x: point.horizontal,
            plate_z: point.vertical,
            p_throws: point.pitcher_throws.code(),
            stand: point.batter_stands.code(),
            probability: prediction.probability,
            standard_error: prediction.standard_error,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct EffectRow<'a> {
    kind: &'static str,
    entity_id: &'a str,
    effect: f64,
    conditional_sd: f64,
    num_pitches: usize,
}

pub fn write_effect_table(path: &Path, table: &EffectTable) -> Result<(), DataError> {
    let mut writer = tsv_writer(path)?;
    for effect in &table.effects {
        writer.serialize(EffectRow {
            kind: effect.kind.name(),
            entity_id: &effect.entity_id,
            effect: effect.effect,
            conditional_sd: effect.conditional_sd,
            num_pitches: effect.num_pitches,
        })?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct RankRow<'a> {
    rank: usize,
    entity_id: &'a str,
    effect: f64,
}

pub fn write_ranking(path: &Path, entries: &[RankedEntity]) -> Result<(), DataError> {
    let mut writer = tsv_writer(path)?;
    for (i, entry) in entries.iter().enumerate() {
        writer.serialize(RankRow {
            rank: i + 1,
            entity_id: &entry.entity_id,
            effect: entry.effect,
        })?;
    }
    writer.flush()?;
    Ok(())
}
