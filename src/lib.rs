#[path = "../gam/mod.rs"]
pub mod gam;

pub mod data;
pub mod effects;
pub mod error;
pub mod pipeline;
pub mod rank;
pub mod records;
pub mod surface;

pub use effects::{EffectTable, EntityEffect, fit_entity_effects};
pub use error::{Error, InputError, PredictionError};
pub use pipeline::{PipelineConfig, PipelineOutput, run};
pub use rank::{Direction, RankedEntity, rank};
pub use records::{CallOutcome, EntityKind, Handedness, PitchRecord, PredictionRow, SurfacePoint};
pub use surface::{FittedSurface, StrikePrediction, SurfaceConfig, evaluation_grid, fit_surface};
