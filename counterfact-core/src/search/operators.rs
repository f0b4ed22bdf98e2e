//! Seeding, crossover and mutation.
//!
//! All randomness flows through the caller's RNG so a seeded search is
//! reproducible. Every produced value is snapped with [`nearest_valid`].

use crate::config::SearchConfig;
use crate::domain::{Domain, FeatureSpace, nearest_valid};
use crate::instance::Instance;
use crate::search::state::{Candidate, CandidateId};
use crate::value::TypedValue;
use rand::Rng;
use rand::seq::SliceRandom;
use std::f64::consts::PI;

/// Maximum number of features perturbed in one seed candidate.
const MAX_SEED_CHANGES: usize = 3;

/// Standard normal sample (Box-Muller).
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

/// A new legal value for the feature at `index`, near `value`.
///
/// Numeric features move by a Gaussian step of `strength` times the feature
/// scale, never less than the grid step; integers move by at least one.
/// Set domains redraw uniformly among the other allowed values, other
/// categorical and text features redraw from the feature's value pool.
/// Booleans flip. A feature with no alternative keeps its value.
pub fn perturb<R: Rng + ?Sized>(
    value: &TypedValue,
    index: usize,
    space: &FeatureSpace,
    strength: f64,
    rng: &mut R,
) -> TypedValue {
    let domain = space.domain(index);
    let scale = space.scale(index);
    let proposed = match (value, domain) {
        (_, Domain::CategoricalSet { allowed } | Domain::FixedSet { allowed }) => {
            redraw(value, allowed, rng)
        }
        (TypedValue::Numeric(v), Domain::BoundedNumeric { step, .. }) => {
            let sigma = (strength * scale).max(step.unwrap_or(0.0));
            TypedValue::Numeric(v + standard_normal(rng) * sigma)
        }
        (TypedValue::Numeric(v), _) => TypedValue::Numeric(v + standard_normal(rng) * strength * scale),
        (TypedValue::Integer(v), Domain::BoundedNumeric { step, .. }) => {
            let sigma = (strength * scale).max(step.unwrap_or(0.0));
            TypedValue::Integer(step_integer(*v, sigma, rng))
        }
        (TypedValue::Integer(v), _) => TypedValue::Integer(step_integer(*v, strength * scale, rng)),
        (TypedValue::Boolean(b), _) => TypedValue::Boolean(!b),
        (TypedValue::Categorical(_) | TypedValue::Text(_), _) => {
            redraw(value, space.pool(index), rng)
        }
        (TypedValue::Composite(items), _) => {
            TypedValue::Composite(perturb_composite(items, strength * scale, rng))
        }
    };
    match nearest_valid(&proposed, domain) {
        Ok(snapped) => snapped,
        Err(_) => proposed,
    }
}

fn step_integer<R: Rng + ?Sized>(value: i64, sigma: f64, rng: &mut R) -> i64 {
    let mut delta = (standard_normal(rng) * sigma.max(1.0)).round();
    if delta == 0.0 {
        delta = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
    }
    value.saturating_add(delta as i64)
}

fn redraw<R: Rng + ?Sized>(current: &TypedValue, pool: &[TypedValue], rng: &mut R) -> TypedValue {
    let choices: Vec<&TypedValue> = pool
        .iter()
        .filter(|v| *v != current && v.kind() == current.kind())
        .collect();
    if choices.is_empty() {
        return current.clone();
    }
    choices[rng.gen_range(0..choices.len())].clone()
}

fn perturb_composite<R: Rng + ?Sized>(items: &[TypedValue], sigma: f64, rng: &mut R) -> Vec<TypedValue> {
    let mut items = items.to_vec();
    if items.is_empty() {
        return items;
    }
    let at = rng.gen_range(0..items.len());
    items[at] = match &items[at] {
        TypedValue::Numeric(v) => TypedValue::Numeric(v + standard_normal(rng) * sigma),
        TypedValue::Integer(v) => TypedValue::Integer(step_integer(*v, sigma, rng)),
        TypedValue::Boolean(b) => TypedValue::Boolean(!b),
        TypedValue::Composite(inner) => TypedValue::Composite(perturb_composite(inner, sigma, rng)),
        other => other.clone(),
    };
    items
}

/// Initial population: the unmodified original first, then copies of it
/// with a random subset of mutable features perturbed.
///
/// With no mutable features the original is the only seed.
pub fn seed_population<R: Rng + ?Sized>(
    space: &FeatureSpace,
    config: &SearchConfig,
    rng: &mut R,
) -> Vec<Instance> {
    let original = space.original();
    let mut seeds = vec![original.clone()];
    let mutable = space.mutable_indices();
    if mutable.is_empty() {
        return seeds;
    }

    while seeds.len() < config.population_size {
        let mut values: Vec<TypedValue> = original.values().cloned().collect();
        let count = rng.gen_range(1..=mutable.len().min(MAX_SEED_CHANGES));
        for &i in mutable.choose_multiple(rng, count) {
            values[i] = perturb(&values[i], i, space, config.mutation_scale, rng);
        }
        seeds.push(original.with_values(values));
    }
    seeds
}

/// Uniform crossover: each mutable feature comes from either parent.
pub fn crossover<R: Rng + ?Sized>(
    first: &Instance,
    second: &Instance,
    space: &FeatureSpace,
    rng: &mut R,
) -> Vec<TypedValue> {
    first
        .values()
        .zip(second.values())
        .enumerate()
        .map(|(i, (a, b))| {
            if space.is_mutable(i) && rng.gen_bool(0.5) {
                b.clone()
            } else {
                a.clone()
            }
        })
        .collect()
}

/// Perturb each mutable feature with `mutation_probability`; at least one
/// feature is always perturbed so a child never silently equals its parent.
pub fn mutate<R: Rng + ?Sized>(
    values: &mut [TypedValue],
    space: &FeatureSpace,
    config: &SearchConfig,
    rng: &mut R,
) {
    let mutable = space.mutable_indices();
    let mut touched = false;
    for &i in &mutable {
        if rng.gen_bool(config.mutation_probability) {
            values[i] = perturb(&values[i], i, space, config.mutation_scale, rng);
            touched = true;
        }
    }
    if !touched && let Some(&i) = mutable.choose(rng) {
        values[i] = perturb(&values[i], i, space, config.mutation_scale, rng);
    }
}

/// Produce `count` pending children of generation `generation` from the
/// selected `parents`, slotted from `first_slot` on.
pub fn breed<R: Rng + ?Sized>(
    parents: &[&Candidate],
    count: usize,
    generation: u32,
    first_slot: usize,
    space: &FeatureSpace,
    config: &SearchConfig,
    rng: &mut R,
) -> Vec<Candidate> {
    let mut children = Vec::with_capacity(count);
    if parents.is_empty() {
        return children;
    }
    for n in 0..count {
        let i = rng.gen_range(0..parents.len());
        let first = parents[i];
        let mut lineage = vec![first.id()];

        let mut values = if parents.len() > 1 && rng.gen_bool(config.crossover_rate) {
            let mut j = rng.gen_range(0..parents.len() - 1);
            if j >= i {
                j += 1;
            }
            let second = parents[j];
            lineage.push(second.id());
            crossover(first.instance(), second.instance(), space, rng)
        } else {
            first.instance().values().cloned().collect()
        };
        mutate(&mut values, space, config, rng);

        let id = CandidateId {
            generation,
            slot: u32::try_from(first_slot + n).unwrap_or(u32::MAX),
        };
        children.push(Candidate::pending(
            id,
            lineage,
            space.original().with_values(values),
        ));
    }
    children
}
