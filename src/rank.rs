use crate::effects::EffectTable;
use crate::records::EntityKind;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Number of entities reported per ranking unless asked otherwise.
pub const DEFAULT_RANK_SIZE: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Largest effects first: the entities who add the most called strikes.
    Highest,
    /// Smallest effects first.
    Lowest,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Highest, Direction::Lowest];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Highest => "highest",
            Direction::Lowest => "lowest",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntity {
    pub entity_id: String,
    pub effect: f64,
}

/// The first `n` entities of `kind` ordered by effect.
///
/// Equal effects are ordered by entity id ascending in both directions. Fewer
/// than `n` entries come back when the kind has fewer entities.
pub fn rank(table: &EffectTable, kind: EntityKind, direction: Direction, n: usize) -> Vec<RankedEntity> {
    let mut entries: Vec<RankedEntity> = table
        .effects_of(kind)
        .map(|e| RankedEntity {
            entity_id: e.entity_id.clone(),
            effect: e.effect,
        })
        .collect();
    entries.sort_by(|a, b| {
        let by_effect = match direction {
            Direction::Highest => b.effect.total_cmp(&a.effect),
            Direction::Lowest => a.effect.total_cmp(&b.effect),
        };
        match by_effect {
            Ordering::Equal => a.entity_id.cmp(&b.entity_id),
            unequal => unequal,
        }
    });
    entries.truncate(n);
    entries
}
