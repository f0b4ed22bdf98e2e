//! Perturbation search engine.
//!
//! A seeded population is evaluated through the oracle adapter, the best
//! `survivor_count` candidates are kept and the rest of each generation is
//! bred from them by crossover and mutation. Valid goal-satisfying
//! candidates accumulate in an archive that the ranker turns into results.

pub mod fitness;
pub mod operators;
pub mod state;

use crate::config::SearchConfig;
use crate::domain::{DataDistribution, Domain, FeatureSpace};
use crate::error::ConfigError;
use crate::goal::GoalCriterion;
use crate::instance::{Instance, Output};
use crate::oracle::{OracleAdapter, Prediction, Predictor};
use crate::ranker::{CounterfactualResult, rank_results};
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

pub use fitness::{composite_fitness, rank_order};
pub use state::{Candidate, CandidateId, Evaluation, SearchState, SearchStatus};

use state::{InstanceKey, instance_key};

/// Result of one search invocation.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub search_id: Uuid,
    pub status: SearchStatus,
    /// Best counterfactuals, best first.
    pub results: Vec<CounterfactualResult>,
    /// Generations evaluated, the seed population included.
    pub generations_run: u32,
    /// Instances sent to the predictor.
    pub evaluations: usize,
    pub elapsed: Duration,
    /// Smallest goal deficit seen; `None` if nothing was evaluated.
    pub best_deficit: Option<f64>,
}

impl SearchOutcome {
    pub fn best(&self) -> Option<&CounterfactualResult> {
        self.results.first()
    }

    pub fn found(&self) -> bool {
        !self.results.is_empty()
    }
}

/// Runs searches against one predictor with one configuration.
///
/// The engine is stateless between calls; every search owns its
/// [`SearchState`], so concurrent searches on a shared engine are independent.
#[derive(Clone)]
pub struct SearchEngine {
    oracle: OracleAdapter,
    config: SearchConfig,
}

impl SearchEngine {
    pub fn new(predictor: Arc<dyn Predictor>, config: SearchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let oracle = OracleAdapter::new(predictor, config.oracle.clone());
        Ok(Self { oracle, config })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// A copy of this engine with a different wall-clock budget, sharing
    /// the same oracle adapter.
    pub fn with_wall_clock(&self, limit: Duration) -> Self {
        let mut engine = self.clone();
        engine.config.max_wall_clock_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX);
        engine
    }

    /// Total predictor calls made through this engine.
    pub fn oracle_calls(&self) -> usize {
        self.oracle.calls()
    }

    /// Search for counterfactuals of `original` satisfying `goal`.
    ///
    /// Malformed input (empty instance, unknown or ill-typed domains) is
    /// rejected before any oracle call. Everything that goes wrong during
    /// the search itself is absorbed and reflected in the outcome.
    pub async fn search(
        &self,
        original: Instance,
        domains: &BTreeMap<String, Domain>,
        distribution: DataDistribution,
        goal: &dyn GoalCriterion,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome, ConfigError> {
        if original.is_empty() {
            return Err(ConfigError::EmptyInstance);
        }
        let space = FeatureSpace::new(original, domains, distribution)?;
        Ok(self.run(&space, goal, cancel, Uuid::new_v4()).await)
    }

    /// Run the generational loop over a prepared feature space.
    pub async fn run(
        &self,
        space: &FeatureSpace,
        goal: &dyn GoalCriterion,
        cancel: &CancellationToken,
        search_id: Uuid,
    ) -> SearchOutcome {
        let config = &self.config;
        let started = Instant::now();
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let mut state = SearchState::new();
        let mut memo: HashMap<InstanceKey, Output> = HashMap::new();

        info!(
            %search_id,
            features = space.len(),
            mutable = space.mutable_indices().len(),
            goal = %goal.describe(),
            population = config.population_size,
            "Starting counterfactual search"
        );

        if cancel.is_cancelled() {
            return self.finish(search_id, SearchStatus::Cancelled, state, space, started, 0);
        }

        let seeds = operators::seed_population(space, config, &mut rng);
        let seeds = self.within_evaluation_budget(seeds, &state);
        let pending = seeds
            .into_iter()
            .enumerate()
            .map(|(slot, instance)| {
                let id = CandidateId {
                    generation: 0,
                    slot: u32::try_from(slot).unwrap_or(u32::MAX),
                };
                Candidate::pending(id, Vec::new(), instance)
            })
            .collect();
        state.population = self
            .evaluate(pending, space, goal, &mut state, &mut memo)
            .await;
        state.absorb_population();
        let mut generations_run = 1;
        self.log_generation(&state);

        let status = loop {
            if let Some(status) = self.check_termination(&state, started) {
                break status;
            }
            if cancel.is_cancelled() {
                break SearchStatus::Cancelled;
            }

            state.generation += 1;
            let mut ranked: Vec<&Candidate> = state.population.iter().collect();
            ranked.sort_by(|a, b| rank_order(a, b));
            ranked.truncate(config.survivor_count);

            let room = config.population_size.saturating_sub(ranked.len());
            let room = match config.max_evaluations {
                Some(max) => room.min(max.saturating_sub(state.evaluations)),
                None => room,
            };
            let children = operators::breed(
                &ranked,
                room,
                state.generation,
                ranked.len(),
                space,
                config,
                &mut rng,
            );
            let survivors: Vec<Candidate> = ranked.into_iter().cloned().collect();

            let children = self
                .evaluate(children, space, goal, &mut state, &mut memo)
                .await;
            state.population = survivors;
            state.population.extend(children);
            state.absorb_population();
            generations_run += 1;
            self.log_generation(&state);
        };

        self.finish(search_id, status, state, space, started, generations_run)
    }

    fn within_evaluation_budget(&self, mut seeds: Vec<Instance>, state: &SearchState) -> Vec<Instance> {
        if let Some(max) = self.config.max_evaluations {
            // The original is always evaluated.
            let room = max.saturating_sub(state.evaluations).max(1);
            seeds.truncate(room);
        }
        seeds
    }

    /// Score pending candidates. Instances already predicted during this
    /// search reuse the earlier output; the rest go to the oracle once each.
    async fn evaluate(
        &self,
        pending: Vec<Candidate>,
        space: &FeatureSpace,
        goal: &dyn GoalCriterion,
        state: &mut SearchState,
        memo: &mut HashMap<InstanceKey, Output>,
    ) -> Vec<Candidate> {
        let keys: Vec<InstanceKey> = pending.iter().map(|c| instance_key(c.instance())).collect();

        let mut unique: Vec<Instance> = Vec::new();
        let mut position: HashMap<&InstanceKey, usize> = HashMap::new();
        for (candidate, key) in pending.iter().zip(&keys) {
            if memo.contains_key(key) || position.contains_key(key) {
                continue;
            }
            position.insert(key, unique.len());
            unique.push(candidate.instance().clone());
        }

        let predictions = if unique.is_empty() {
            Vec::new()
        } else {
            self.oracle.predict_batch(&unique).await
        };
        state.evaluations += unique.len();

        let mut resolved: Vec<Prediction> = Vec::with_capacity(pending.len());
        for key in &keys {
            let prediction = match memo.get(key) {
                Some(output) => Ok(output.clone()),
                None => match position.get(key).and_then(|&i| predictions.get(i)) {
                    Some(prediction) => prediction.clone(),
                    None => Err(crate::error::OracleError::call_failed(
                        "prediction missing for candidate",
                    )),
                },
            };
            resolved.push(prediction);
        }
        drop(position);
        for (key, prediction) in keys.into_iter().zip(&resolved) {
            if let Ok(output) = prediction {
                memo.entry(key).or_insert_with(|| output.clone());
            }
        }

        pending
            .into_iter()
            .zip(resolved)
            .map(|(candidate, prediction)| candidate.into_scored(prediction, space, goal, &self.config))
            .collect()
    }

    /// Convergence first, then the budgets.
    fn check_termination(&self, state: &SearchState, started: Instant) -> Option<SearchStatus> {
        let config = &self.config;
        if let Some(best) = state.best_distance {
            let plateau = u32::try_from(config.plateau_generations).unwrap_or(u32::MAX);
            if best <= 0.0 || state.generations_since_improvement() >= plateau {
                return Some(SearchStatus::Converged);
            }
        }
        let generations_done = u64::from(state.generation) >= config.max_generations as u64;
        let out_of_time = started.elapsed() >= config.max_wall_clock();
        let out_of_evaluations = config
            .max_evaluations
            .is_some_and(|max| state.evaluations >= max);
        if generations_done || out_of_time || out_of_evaluations {
            return Some(SearchStatus::BudgetExhausted);
        }
        None
    }

    fn log_generation(&self, state: &SearchState) {
        debug!(
            generation = state.generation,
            evaluations = state.evaluations,
            archive = state.archive_len(),
            best_deficit = state.best_deficit.unwrap_or(f64::INFINITY),
            best_deficit_generation = state.best_deficit_generation,
            best_distance = state.best_distance.unwrap_or(f64::INFINITY),
            "Generation evaluated"
        );
    }

    fn finish(
        &self,
        search_id: Uuid,
        status: SearchStatus,
        state: SearchState,
        space: &FeatureSpace,
        started: Instant,
        generations_run: u32,
    ) -> SearchOutcome {
        let status = match status {
            SearchStatus::BudgetExhausted if state.archive_len() == 0 => SearchStatus::NoResultFound,
            other => other,
        };
        let evaluations = state.evaluations;
        let best_deficit = state.best_deficit;
        let results = rank_results(state.into_archive(), space, self.config.result_count);
        let elapsed = started.elapsed();

        info!(
            %search_id,
            %status,
            generations = generations_run,
            evaluations,
            results = results.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Counterfactual search finished"
        );

        SearchOutcome {
            search_id,
            status,
            results,
            generations_run,
            evaluations,
            elapsed,
            best_deficit,
        }
    }
}

/// One-shot search with a fresh engine and no cancellation.
pub async fn search(
    predictor: Arc<dyn Predictor>,
    original: Instance,
    domains: &BTreeMap<String, Domain>,
    goal: &dyn GoalCriterion,
    config: SearchConfig,
) -> Result<SearchOutcome, ConfigError> {
    SearchEngine::new(predictor, config)?
        .search(
            original,
            domains,
            DataDistribution::new(),
            goal,
            &CancellationToken::new(),
        )
        .await
}
