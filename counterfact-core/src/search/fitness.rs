//! Composite fitness and the total order used for selection and ranking.

use crate::config::SearchConfig;
use crate::search::state::Candidate;
use std::cmp::Ordering;

/// `deficit + distance_weight * distance + sparsity_weight * changed`, plus
/// `invalid_penalty` for domain violations. Lower is better; an unscored or
/// failed candidate (infinite deficit) is `+inf`.
pub fn composite_fitness(
    deficit: f64,
    distance: f64,
    changed: usize,
    valid: bool,
    config: &SearchConfig,
) -> f64 {
    if !deficit.is_finite() {
        return f64::INFINITY;
    }
    let mut fitness = deficit + config.distance_weight * distance
        + config.sparsity_weight * changed as f64;
    if !valid {
        fitness += config.invalid_penalty;
    }
    if fitness.is_nan() { f64::INFINITY } else { fitness }
}

/// Fitness, then fewer changed features, then older generation, then slot.
///
/// Candidate ids are unique within a search, so this order is total and
/// independent of the order candidates were produced in.
pub fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    a.fitness()
        .total_cmp(&b.fitness())
        .then_with(|| a.changed().cmp(&b.changed()))
        .then_with(|| a.id().cmp(&b.id()))
}
