use serde::{Deserialize, Serialize};
use std::fmt;

/// One phase of the migration, scoped to one category of source entities.
///
/// Serialized as its step number (1-based) in the checkpoint file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Stage {
    DomainObjects,
    Observables,
    CoreRelationships,
    RelationshipToRelationship,
    Containers,
}

/// Transition table. Order here is the migration order.
const SEQUENCE: [Stage; 5] = [
    Stage::DomainObjects,
    Stage::Observables,
    Stage::CoreRelationships,
    Stage::RelationshipToRelationship,
    Stage::Containers,
];

impl Stage {
    pub const FIRST: Stage = SEQUENCE[0];

    pub fn all() -> &'static [Stage] {
        &SEQUENCE
    }

    fn position(self) -> usize {
        SEQUENCE
            .iter()
            .position(|s| *s == self)
            .unwrap_or(SEQUENCE.len() - 1)
    }

    /// The following stage, or `None` once the last stage is reached.
    pub fn next(self) -> Option<Stage> {
        SEQUENCE.get(self.position() + 1).copied()
    }

    pub fn step(self) -> u8 {
        self.position() as u8 + 1
    }

    pub fn from_step(step: u8) -> Option<Stage> {
        (step as usize)
            .checked_sub(1)
            .and_then(|i| SEQUENCE.get(i).copied())
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::DomainObjects => "domain objects",
            Stage::Observables => "observables",
            Stage::CoreRelationships => "core relationships",
            Stage::RelationshipToRelationship => "relationships to relationships",
            Stage::Containers => "containers",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.step(), SEQUENCE.len(), self.label())
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> u8 {
        stage.step()
    }
}

impl TryFrom<u8> for Stage {
    type Error = String;

    fn try_from(step: u8) -> Result<Self, Self::Error> {
        Stage::from_step(step).ok_or_else(|| format!("unknown migration step {step}"))
    }
}
