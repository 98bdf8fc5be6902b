use cascade_dist::DistConfig;
use cascade_wire::{ConstId, UNBOUND};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::shuffle::check_fits;

// Validation constants
const MAX_ROUNDS_LIMIT: usize = 1 << 24;

/// Reserved constant ids the evaluator gives meaning to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    /// Contradiction predicate. Any atom with it marks the run inconsistent.
    pub error: ConstId,
    /// Builtin `list_contains(List, term)`.
    pub list_contains: ConstId,
    /// Predicate of the triples behind `o # c`.
    pub rdf_type: ConstId,
    /// Predicate of the triples behind `a ## b`.
    pub subclass_of: ConstId,
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self {
            error: 1,
            list_contains: 2,
            rdf_type: 3,
            subclass_of: 4,
        }
    }
}

/// How joins between relations on different ranks are answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStrategy {
    /// Co-locate both sides by a hash of the join key before joining.
    #[default]
    Redistribute,
    /// Join only what is stored locally. Correct when replication has made
    /// every rule body locally complete.
    Local,
}

/// When a fixpoint round applies the deltas it computes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// After every rule has been evaluated.
    #[default]
    Round,
    /// After each rule.
    Rule,
}

/// Engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub join_strategy: JoinStrategy,
    pub granularity: Granularity,
    /// Stop after this many rounds even if the store is still changing.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_rounds: Option<usize>,
    pub vocabulary: Vocabulary,
    pub dist: DistConfig,
}

impl EngineConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.dist.validate()?;
        // Uniq, replication and retraction sharing all move whole triples.
        if check_fits(3, self.dist.packet_size).is_err() {
            return Err(EngineError::InvalidConfig(format!(
                "a {}-byte packet cannot carry a triple",
                self.dist.packet_size
            )));
        }

        if let Some(max_rounds) = self.max_rounds
            && (max_rounds == 0 || max_rounds > MAX_ROUNDS_LIMIT)
        {
            return Err(EngineError::InvalidConfig(format!(
                "max_rounds must be between 1 and {MAX_ROUNDS_LIMIT} (got {max_rounds})"
            )));
        }

        let v = &self.vocabulary;
        let ids = [v.error, v.list_contains, v.rdf_type, v.subclass_of];
        if ids.contains(&UNBOUND) {
            return Err(EngineError::InvalidConfig(
                "vocabulary ids must be nonzero".to_string(),
            ));
        }
        for (i, a) in ids.iter().enumerate() {
            if ids[i + 1..].contains(a) {
                return Err(EngineError::InvalidConfig(format!(
                    "vocabulary id {a} is used twice"
                )));
            }
        }

        Ok(())
    }
}
