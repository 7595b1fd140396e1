//! Pitch-level records and the row types passed between the two model stages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Side a pitcher throws from or a batter stands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Handedness {
    Left,
    Right,
}

impl Handedness {
    /// Single-letter code used in tabular files.
    pub fn code(self) -> &'static str {
        match self {
            Handedness::Left => "L",
            Handedness::Right => "R",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "L" | "l" => Some(Handedness::Left),
            "R" | "r" => Some(Handedness::Right),
            _ => None,
        }
    }
}

impl fmt::Display for Handedness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Umpire's call on a taken pitch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOutcome {
    Ball,
    Strike,
}

impl CallOutcome {
    /// The binary response: 1 for a called strike, 0 for a called ball.
    pub fn as_response(self) -> f64 {
        match self {
            CallOutcome::Ball => 0.0,
            CallOutcome::Strike => 1.0,
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code.trim() {
            "1" | "S" | "s" => Some(CallOutcome::Strike),
            "0" | "B" | "b" => Some(CallOutcome::Ball),
            _ => None,
        }
    }
}

/// One taken pitch. Swings are removed upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PitchRecord {
    pub game_id: String,
    /// Feet from the centre of the plate, catcher's view.
    pub horizontal_location: f64,
    /// Feet above the ground.
    pub vertical_location: f64,
    pub pitcher_throws: Handedness,
    pub batter_stands: Handedness,
    pub catcher_id: String,
    pub umpire_id: String,
    pub pitcher_id: String,
    pub outcome: CallOutcome,
}

impl PitchRecord {
    pub fn entity_id(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Catcher => &self.catcher_id,
            EntityKind::Umpire => &self.umpire_id,
            EntityKind::Pitcher => &self.pitcher_id,
        }
    }

    pub fn location(&self) -> SurfacePoint {
        SurfacePoint {
            horizontal: self.horizontal_location,
            vertical: self.vertical_location,
            pitcher_throws: self.pitcher_throws,
            batter_stands: self.batter_stands,
        }
    }
}

/// A location and handedness pair at which the strike surface can be evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SurfacePoint {
    pub horizontal: f64,
    pub vertical: f64,
    pub pitcher_throws: Handedness,
    pub batter_stands: Handedness,
}

/// A pitch annotated with the strike surface's prediction for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRow {
    pub record: PitchRecord,
    pub fitted_probability: f64,
    pub fitted_se: f64,
}

/// The three crossed groupings whose random intercepts the effect model estimates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Catcher,
    Umpire,
    Pitcher,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Catcher, EntityKind::Umpire, EntityKind::Pitcher];

    pub fn name(self) -> &'static str {
        match self {
            EntityKind::Catcher => "catcher",
            EntityKind::Umpire => "umpire",
            EntityKind::Pitcher => "pitcher",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_parse_case_insensitively_and_reject_others() {
        assert_eq!(Handedness::from_code(" r"), Some(Handedness::Right));
        assert_eq!(Handedness::from_code("L"), Some(Handedness::Left));
        assert_eq!(Handedness::from_code("S"), None);
        assert_eq!(CallOutcome::from_code("S"), Some(CallOutcome::Strike));
        assert_eq!(CallOutcome::from_code("0"), Some(CallOutcome::Ball));
        assert_eq!(CallOutcome::from_code("X"), None);
        assert_eq!(CallOutcome::Strike.as_response(), 1.0);
    }
}
