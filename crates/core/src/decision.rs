//! Decision engine: generation comparison to an apply operation.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    /// Delete followed by create.
    Recreate,
    Skip,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Recreate => "recreate",
            Operation::Skip => "skip",
        }
    }

    /// Whether executing this operation touches the backend.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Operation::Skip)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyDecision {
    pub operation: Operation,
    pub reason: String,
    pub new_generation: i64,
    pub existing_generation: i64,
}

/// Pure comparison of the candidate generation against the existing one.
///
/// Never yields `Recreate`; see [`ApplyDecision::with_recreate_policy`].
pub fn compare_generations(new_gen: i64, existing_gen: i64, exists: bool) -> ApplyDecision {
    if !exists {
        return ApplyDecision {
            operation: Operation::Create,
            reason: "resource not found".to_string(),
            new_generation: new_gen,
            existing_generation: 0,
        };
    }
    if existing_gen == new_gen {
        ApplyDecision {
            operation: Operation::Skip,
            reason: format!("generation {} unchanged", new_gen),
            new_generation: new_gen,
            existing_generation: existing_gen,
        }
    } else {
        ApplyDecision {
            operation: Operation::Update,
            reason: format!("generation changed {}->{}", existing_gen, new_gen),
            new_generation: new_gen,
            existing_generation: existing_gen,
        }
    }
}

impl ApplyDecision {
    /// Post-processing applied by backend adapters after the comparison:
    /// with `recreate_on_change` an `Update` becomes a `Recreate`. Other
    /// operations pass through untouched.
    pub fn with_recreate_policy(self, recreate_on_change: bool) -> Self {
        if recreate_on_change && self.operation == Operation::Update {
            Self { operation: Operation::Recreate, reason: format!("{} (recreate on change)", self.reason), ..self }
        } else {
            self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_resource_always_creates() {
        for new_gen in [1, 3, 42] {
            for existing in [-5, 0, 3, 99] {
                let d = compare_generations(new_gen, existing, false);
                assert_eq!(d.operation, Operation::Create);
                assert_eq!(d.existing_generation, 0);
                assert_eq!(d.new_generation, new_gen);
                assert_eq!(d.reason, "resource not found");
            }
        }
    }

    #[test]
    fn equal_generations_skip() {
        let d = compare_generations(7, 7, true);
        assert_eq!(d.operation, Operation::Skip);
        assert_eq!(d.reason, "generation 7 unchanged");
    }

    #[test]
    fn any_inequality_updates() {
        let up = compare_generations(7, 5, true);
        assert_eq!(up.operation, Operation::Update);
        assert_eq!(up.reason, "generation changed 5->7");

        let down = compare_generations(5, 7, true);
        assert_eq!(down.operation, Operation::Update);
        assert_eq!(down.existing_generation, 7);
    }

    #[test]
    fn recreate_policy_only_upgrades_updates() {
        let d = compare_generations(5, 4, true).with_recreate_policy(true);
        assert_eq!(d.operation, Operation::Recreate);
        assert!(d.reason.starts_with("generation changed 4->5"));

        assert_eq!(compare_generations(5, 4, true).with_recreate_policy(false).operation, Operation::Update);
        assert_eq!(compare_generations(5, 5, true).with_recreate_policy(true).operation, Operation::Skip);
        assert_eq!(compare_generations(5, 0, false).with_recreate_policy(true).operation, Operation::Create);
    }

    #[test]
    fn operation_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Operation::Recreate).unwrap(), "\"recreate\"");
        assert!(!Operation::Skip.is_mutation());
        assert!(Operation::Create.is_mutation());
    }
}
