//! Turns the archive of satisfying candidates into ranked, explainable results.

use crate::domain::FeatureSpace;
use crate::instance::{Instance, Output};
use crate::search::{Candidate, CandidateId, rank_order};
use crate::search::state::instance_key;
use crate::value::TypedValue;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// How a proposed feature value differs from the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Difference {
    /// `proposed - original` for numeric and integer features.
    Numeric(f64),
    /// Any other change, rendered as `original -> proposed`.
    Transition { from: String, to: String },
    Unchanged,
}

impl Difference {
    pub fn between(original: &TypedValue, proposed: &TypedValue) -> Self {
        if original == proposed {
            return Difference::Unchanged;
        }
        match (original, proposed) {
            (TypedValue::Numeric(_) | TypedValue::Integer(_), TypedValue::Numeric(_) | TypedValue::Integer(_)) => {
                match (original.as_f64(), proposed.as_f64()) {
                    (Some(a), Some(b)) => Difference::Numeric(b - a),
                    _ => Difference::Unchanged,
                }
            }
            _ => Difference::Transition {
                from: original.to_string(),
                to: proposed.to_string(),
            },
        }
    }
}

impl fmt::Display for Difference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Difference::Numeric(d) => write!(f, "{d}"),
            Difference::Transition { from, to } => write!(f, "{from} -> {to}"),
            Difference::Unchanged => f.write_str("0"),
        }
    }
}

/// One changed feature of a counterfactual.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureChange {
    pub name: String,
    pub original: TypedValue,
    pub proposed: TypedValue,
    /// Normalized distance contribution of this feature.
    pub distance: f64,
}

impl FeatureChange {
    pub fn difference(&self) -> Difference {
        Difference::between(&self.original, &self.proposed)
    }
}

/// A row of the tabular rendering of a result, one per feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub feature: String,
    pub proposed: TypedValue,
    pub original: TypedValue,
    /// The feature was held fixed during the search.
    pub constrained: bool,
    pub difference: Difference,
}

/// A ranked counterfactual.
#[derive(Debug, Clone, Serialize)]
pub struct CounterfactualResult {
    pub id: CandidateId,
    pub parents: Vec<CandidateId>,
    pub instance: Instance,
    pub output: Output,
    pub deficit: f64,
    pub distance: f64,
    pub fitness: f64,
    /// Changed features only, in feature order.
    pub changes: Vec<FeatureChange>,
    /// Every feature, in feature order.
    pub rows: Vec<ResultRow>,
}

impl CounterfactualResult {
    fn from_candidate(candidate: Candidate, space: &FeatureSpace) -> Self {
        let mut changes = Vec::new();
        let mut rows = Vec::with_capacity(space.len());
        for (i, (original, proposed)) in space
            .original()
            .features()
            .iter()
            .zip(candidate.instance().features())
            .enumerate()
        {
            let difference = Difference::between(original.value(), proposed.value());
            if difference != Difference::Unchanged {
                changes.push(FeatureChange {
                    name: original.name().to_string(),
                    original: original.value().clone(),
                    proposed: proposed.value().clone(),
                    distance: candidate.feature_distances().get(i).copied().unwrap_or(0.0),
                });
            }
            rows.push(ResultRow {
                feature: original.name().to_string(),
                proposed: proposed.value().clone(),
                original: original.value().clone(),
                constrained: !space.is_mutable(i),
                difference,
            });
        }

        Self {
            id: candidate.id(),
            parents: candidate.parents().to_vec(),
            deficit: candidate.deficit(),
            distance: candidate.distance(),
            fitness: candidate.fitness(),
            output: candidate.output().cloned().unwrap_or_default(),
            instance: candidate.instance().clone(),
            changes,
            rows,
        }
    }

    pub fn changed_features(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().map(|c| c.name.as_str())
    }
}

/// Keep valid satisfying candidates, drop duplicate instances (best copy
/// wins), order by fitness and its tie-breaks, and keep the top `count`.
pub fn rank_results(archive: Vec<Candidate>, space: &FeatureSpace, count: usize) -> Vec<CounterfactualResult> {
    let mut candidates: Vec<Candidate> = archive
        .into_iter()
        .filter(Candidate::is_counterfactual)
        .collect();
    candidates.sort_by(rank_order);

    let mut seen = HashSet::new();
    candidates
        .into_iter()
        .filter(|c| seen.insert(instance_key(c.instance())))
        .take(count)
        .map(|c| CounterfactualResult::from_candidate(c, space))
        .collect()
}
