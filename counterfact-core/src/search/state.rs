//! Candidates and the per-invocation search state.

use crate::config::SearchConfig;
use crate::domain::FeatureSpace;
use crate::error::OracleError;
use crate::goal::{GoalCriterion, GoalScore, score_output};
use crate::instance::{Instance, Output};
use crate::oracle::Prediction;
use crate::search::fitness::{composite_fitness, rank_order};
use crate::value::TypedValue;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;

/// Position of a candidate in the generation arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateId {
    pub generation: u32,
    pub slot: u32,
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}#{}", self.generation, self.slot)
    }
}

/// Oracle and goal outcome of a candidate.
#[derive(Debug, Clone)]
pub enum Evaluation {
    Pending,
    Scored { output: Output, goal: GoalScore },
    Failed { error: OracleError },
}

/// Key identifying an instance by its feature values, in feature order.
pub type InstanceKey = Vec<TypedValue>;

pub(crate) fn instance_key(instance: &Instance) -> InstanceKey {
    instance.values().cloned().collect()
}

/// One point of the search.
///
/// Candidates are created pending and become scored exactly once through
/// [`Candidate::into_scored`]; parents are referenced by id only.
#[derive(Debug, Clone)]
pub struct Candidate {
    id: CandidateId,
    parents: Vec<CandidateId>,
    instance: Instance,
    evaluation: Evaluation,
    feature_distances: Vec<f64>,
    distance: f64,
    changed: usize,
    valid: bool,
    fitness: f64,
}

impl Candidate {
    pub(crate) fn pending(id: CandidateId, parents: Vec<CandidateId>, instance: Instance) -> Self {
        Self {
            id,
            parents,
            instance,
            evaluation: Evaluation::Pending,
            feature_distances: Vec::new(),
            distance: 0.0,
            changed: 0,
            valid: false,
            fitness: f64::INFINITY,
        }
    }

    /// Attach the oracle result, goal score, distance, validity and fitness.
    pub(crate) fn into_scored(
        self,
        prediction: Prediction,
        space: &FeatureSpace,
        goal: &dyn GoalCriterion,
        config: &SearchConfig,
    ) -> Self {
        let evaluation = match prediction {
            Ok(output) => {
                let goal = score_output(goal, &output);
                Evaluation::Scored { output, goal }
            }
            Err(error) => Evaluation::Failed { error },
        };

        let changed = self
            .instance
            .values()
            .zip(space.original().values())
            .filter(|(a, b)| a != b)
            .count();
        let (feature_distances, distance, comparable) = match space.feature_distances(&self.instance)
        {
            Ok(d) => {
                let total = d.iter().sum();
                (d, total, true)
            }
            Err(_) => (Vec::new(), f64::INFINITY, false),
        };
        let valid = comparable && space.is_valid(&self.instance);

        let deficit = match &evaluation {
            Evaluation::Scored { goal, .. } => goal.deficit(),
            _ => f64::INFINITY,
        };
        let fitness = composite_fitness(deficit, distance, changed, valid, config);

        Self {
            evaluation,
            feature_distances,
            distance,
            changed,
            valid,
            fitness,
            ..self
        }
    }

    pub fn id(&self) -> CandidateId {
        self.id
    }

    pub fn generation(&self) -> u32 {
        self.id.generation
    }

    pub fn parents(&self) -> &[CandidateId] {
        &self.parents
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn evaluation(&self) -> &Evaluation {
        &self.evaluation
    }

    pub fn output(&self) -> Option<&Output> {
        match &self.evaluation {
            Evaluation::Scored { output, .. } => Some(output),
            _ => None,
        }
    }

    /// Goal deficit; `+inf` while pending or after an oracle failure.
    pub fn deficit(&self) -> f64 {
        match &self.evaluation {
            Evaluation::Scored { goal, .. } => goal.deficit(),
            _ => f64::INFINITY,
        }
    }

    pub fn is_satisfied(&self) -> bool {
        matches!(&self.evaluation, Evaluation::Scored { goal, .. } if goal.is_satisfied())
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.evaluation, Evaluation::Failed { .. })
    }

    /// Sum of per-feature distances from the original instance.
    pub fn distance(&self) -> f64 {
        self.distance
    }

    pub fn feature_distances(&self) -> &[f64] {
        &self.feature_distances
    }

    /// Number of features that differ from the original.
    pub fn changed(&self) -> usize {
        self.changed
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn fitness(&self) -> f64 {
        self.fitness
    }

    /// Valid and goal-satisfying: eligible for the archive.
    pub fn is_counterfactual(&self) -> bool {
        self.valid && self.is_satisfied()
    }
}

/// Terminal state of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    /// A counterfactual exists and the best distance stopped improving.
    Converged,
    /// A budget ran out while counterfactuals were found.
    BudgetExhausted,
    /// The caller cancelled; the archive so far is reported.
    Cancelled,
    /// The budget ran out without any counterfactual.
    NoResultFound,
}

impl fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchStatus::Converged => "converged",
            SearchStatus::BudgetExhausted => "budget exhausted",
            SearchStatus::Cancelled => "cancelled",
            SearchStatus::NoResultFound => "no counterfactual found",
        };
        f.write_str(s)
    }
}

/// Mutable state of one search invocation. Never shared between searches.
#[derive(Debug, Default)]
pub struct SearchState {
    pub generation: u32,
    pub population: Vec<Candidate>,
    archive: HashMap<InstanceKey, Candidate>,
    pub evaluations: usize,
    pub best_deficit: Option<f64>,
    pub best_deficit_generation: u32,
    pub best_distance: Option<f64>,
    pub best_distance_generation: u32,
}

impl SearchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold the current population into the archive and the improvement
    /// trackers used for plateau detection.
    pub fn absorb_population(&mut self) {
        let generation = self.generation;
        for candidate in &self.population {
            let deficit = candidate.deficit();
            if self.best_deficit.is_none_or(|best| deficit < best) {
                self.best_deficit = Some(deficit);
                self.best_deficit_generation = generation;
            }

            if !candidate.is_counterfactual() {
                continue;
            }
            match self.archive.entry(instance_key(candidate.instance())) {
                Entry::Occupied(mut slot) => {
                    if rank_order(candidate, slot.get()) == Ordering::Less {
                        slot.insert(candidate.clone());
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(candidate.clone());
                }
            }
            let distance = candidate.distance();
            if self.best_distance.is_none_or(|best| distance < best) {
                self.best_distance = Some(distance);
                self.best_distance_generation = generation;
            }
        }
    }

    pub fn archive_len(&self) -> usize {
        self.archive.len()
    }

    pub fn archive(&self) -> impl Iterator<Item = &Candidate> {
        self.archive.values()
    }

    /// Generations since the best archived distance last improved.
    pub fn generations_since_improvement(&self) -> u32 {
        self.generation.saturating_sub(self.best_distance_generation)
    }

    pub fn into_archive(self) -> Vec<Candidate> {
        self.archive.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataDistribution, Domain};
    use crate::goal::{TargetOutput, TargetOutputs};
    use crate::instance::Feature;
    use std::collections::BTreeMap;

    fn space() -> FeatureSpace {
        let original = Instance::new(vec![
            Feature::numeric("age", 20.0).unwrap(),
            Feature::boolean("member", false),
        ])
        .unwrap();
        let mut domains = BTreeMap::new();
        domains.insert("age".to_string(), Domain::bounded(18.0, 90.0).unwrap());
        FeatureSpace::new(original, &domains, DataDistribution::new()).unwrap()
    }

    fn goal() -> TargetOutputs {
        TargetOutputs::new(vec![TargetOutput::new("ok", TypedValue::Boolean(true))])
    }

    fn scored(space: &FeatureSpace, slot: u32, age: f64, ok: bool) -> Candidate {
        let instance = space
            .original()
            .with_values(vec![TypedValue::Numeric(age), TypedValue::Boolean(false)]);
        Candidate::pending(CandidateId { generation: 0, slot }, vec![], instance).into_scored(
            Ok(Output::single("ok", TypedValue::Boolean(ok))),
            space,
            &goal(),
            &SearchConfig::default(),
        )
    }

    #[test]
    fn test_scoring_fills_distance_and_validity() {
        let space = space();
        let c = scored(&space, 0, 27.2, true);
        assert!(c.is_counterfactual());
        assert_eq!(c.changed(), 1);
        assert!((c.distance() - 0.1).abs() < 1e-9);
        assert!(c.fitness() > 0.0);

        let out_of_range = scored(&space, 1, 95.0, true);
        assert!(!out_of_range.is_valid());
        assert!(!out_of_range.is_counterfactual());
        assert!(out_of_range.fitness() >= 1_000.0);
    }

    #[test]
    fn test_failed_prediction_is_maximally_unfit() {
        let space = space();
        let c = Candidate::pending(
            CandidateId {
                generation: 0,
                slot: 0,
            },
            vec![],
            space.original().clone(),
        )
        .into_scored(
            Err(OracleError::Timeout { timeout_ms: 10 }),
            &space,
            &goal(),
            &SearchConfig::default(),
        );
        assert!(c.is_failed());
        assert_eq!(c.deficit(), f64::INFINITY);
        assert_eq!(c.fitness(), f64::INFINITY);
    }

    #[test]
    fn test_archive_dedupes_and_tracks_best_distance() {
        let space = space();
        let mut state = SearchState::new();
        state.population = vec![
            scored(&space, 0, 30.0, true),
            scored(&space, 1, 30.0, true),
            scored(&space, 2, 25.0, false),
        ];
        state.absorb_population();
        assert_eq!(state.archive_len(), 1);
        assert_eq!(state.archive().next().unwrap().id().slot, 0);
        assert_eq!(state.best_distance, Some(10.0 / 72.0));
        assert_eq!(state.best_deficit, Some(0.0));
    }

    #[test]
    fn test_best_deficit_generation_follows_last_improvement() {
        let space = space();
        let mut state = SearchState::new();
        state.population = vec![scored(&space, 0, 21.0, false)];
        state.absorb_population();
        assert_eq!(state.best_deficit_generation, 0);
        assert!(state.best_deficit.unwrap() > 0.0);

        state.generation = 3;
        state.population = vec![scored(&space, 0, 26.0, true)];
        state.absorb_population();
        assert_eq!(state.best_deficit_generation, 3);

        state.generation = 5;
        state.population = vec![scored(&space, 0, 22.0, false)];
        state.absorb_population();
        assert_eq!(state.best_deficit_generation, 3);
        assert_eq!(state.best_deficit, Some(0.0));
    }
}
