//! Feature domains, validity checking and the read-only feature space of a search.
//!
//! Every value the search produces for a feature is passed through
//! [`nearest_valid`] before scoring, so candidates are snapped into their
//! legal domain instead of being rejected and retried.

use crate::error::ValueError;
use crate::instance::{Feature, Instance};
use crate::value::{TypedValue, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Relative tolerance used for bound and step-alignment checks.
const ALIGN_TOLERANCE: f64 = 1e-9;

/// Grid steps searched on each side when looking for a whole-numbered grid
/// point for an integer feature.
const INTEGER_GRID_REACH: u32 = 4_096;

/// The set or range of legal values of a feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Domain {
    /// Inclusive numeric range; with `step`, values must be `min + k * step`.
    BoundedNumeric {
        min: f64,
        max: f64,
        #[serde(default)]
        step: Option<f64>,
    },
    /// Finite set of allowed values.
    CategoricalSet { allowed: Vec<TypedValue> },
    /// Finite set of allowed values; the feature is immutable during search.
    FixedSet { allowed: Vec<TypedValue> },
    Unconstrained,
}

impl Domain {
    pub fn bounded(min: f64, max: f64) -> Result<Self, ValueError> {
        let domain = Domain::BoundedNumeric {
            min,
            max,
            step: None,
        };
        domain.check()?;
        Ok(domain)
    }

    pub fn stepped(min: f64, max: f64, step: f64) -> Result<Self, ValueError> {
        let domain = Domain::BoundedNumeric {
            min,
            max,
            step: Some(step),
        };
        domain.check()?;
        Ok(domain)
    }

    pub fn categorical(allowed: Vec<TypedValue>) -> Result<Self, ValueError> {
        let domain = Domain::CategoricalSet { allowed };
        domain.check()?;
        Ok(domain)
    }

    pub fn fixed(allowed: Vec<TypedValue>) -> Result<Self, ValueError> {
        let domain = Domain::FixedSet { allowed };
        domain.check()?;
        Ok(domain)
    }

    /// Verify the domain is well formed.
    pub fn check(&self) -> Result<(), ValueError> {
        match self {
            Domain::BoundedNumeric { min, max, step } => {
                if !min.is_finite() || !max.is_finite() || min > max {
                    return Err(ValueError::invalid(
                        "domain",
                        format!("bounds [{min}, {max}] are not a finite range"),
                    ));
                }
                if let Some(step) = step
                    && !(step.is_finite() && *step > 0.0)
                {
                    return Err(ValueError::invalid(
                        "domain",
                        format!("step {step} must be positive"),
                    ));
                }
                Ok(())
            }
            Domain::CategoricalSet { allowed } | Domain::FixedSet { allowed } => {
                let Some(first) = allowed.first() else {
                    return Err(ValueError::invalid("domain", "allowed set is empty"));
                };
                for value in allowed {
                    first.check_same_kind(value)?;
                }
                Ok(())
            }
            Domain::Unconstrained => Ok(()),
        }
    }

    /// `false` for `FixedSet`: the search never changes such a feature.
    pub fn is_mutable(&self) -> bool {
        !matches!(self, Domain::FixedSet { .. })
    }

    /// Width of a bounded range.
    pub fn range(&self) -> Option<f64> {
        match self {
            Domain::BoundedNumeric { min, max, .. } => Some(max - min),
            _ => None,
        }
    }

    pub fn allowed(&self) -> Option<&[TypedValue]> {
        match self {
            Domain::CategoricalSet { allowed } | Domain::FixedSet { allowed } => Some(allowed),
            _ => None,
        }
    }
}

/// Whether `value` is a legal value of `domain`.
pub fn within_domain(value: &TypedValue, domain: &Domain) -> bool {
    match domain {
        Domain::BoundedNumeric { min, max, step } => {
            let Some(v) = value.as_f64() else {
                return false;
            };
            let tol = ALIGN_TOLERANCE * max.abs().max(min.abs()).max(1.0);
            if !v.is_finite() || v < min - tol || v > max + tol {
                return false;
            }
            step.is_none_or(|step| on_grid(v, *min, step))
        }
        Domain::CategoricalSet { allowed } | Domain::FixedSet { allowed } => {
            allowed.contains(value)
        }
        Domain::Unconstrained => value.as_f64().is_none_or(f64::is_finite),
    }
}

/// Legalize `value` into `domain`.
///
/// Numeric values are clamped to the bounds and snapped to the step grid.
/// Integers go to the nearest grid point that is a whole number, and fail
/// when the grid has none within the bounds. Set domains keep a member value
/// and otherwise pick the closest allowed value (first one on ties).
pub fn clamp_to_domain(value: &TypedValue, domain: &Domain) -> Result<TypedValue, ValueError> {
    match domain {
        Domain::BoundedNumeric { min, max, step } => match value {
            TypedValue::Numeric(v) => Ok(TypedValue::Numeric(snap(*v, *min, *max, *step))),
            TypedValue::Integer(v) => snap_integer(*v, *min, *max, *step).map(TypedValue::Integer),
            other => Err(ValueError::mismatch(other.kind(), "bounded numeric domain")),
        },
        Domain::CategoricalSet { allowed } | Domain::FixedSet { allowed } => {
            if allowed.contains(value) {
                return Ok(value.clone());
            }
            let mut best: Option<(f64, &TypedValue)> = None;
            for candidate in allowed {
                let d = value.distance(candidate, 1.0)?;
                if best.is_none_or(|(bd, _)| d < bd) {
                    best = Some((d, candidate));
                }
            }
            best.map(|(_, v)| v.clone())
                .ok_or_else(|| ValueError::invalid("domain", "allowed set is empty"))
        }
        Domain::Unconstrained => Ok(value.clone()),
    }
}

/// The legal value closest to `value`; used by the mutation operator.
pub fn nearest_valid(value: &TypedValue, domain: &Domain) -> Result<TypedValue, ValueError> {
    clamp_to_domain(value, domain)
}

fn snap(v: f64, min: f64, max: f64, step: Option<f64>) -> f64 {
    let v = if v.is_finite() { v.clamp(min, max) } else { min };
    match step {
        Some(step) if step > 0.0 => {
            let max_k = ((max - min) / step + ALIGN_TOLERANCE).floor().max(0.0);
            let k = ((v - min) / step).round().clamp(0.0, max_k);
            (min + k * step).min(max)
        }
        _ => v,
    }
}

fn on_grid(v: f64, min: f64, step: f64) -> bool {
    let k = (v - min) / step;
    (k - k.round()).abs() <= ALIGN_TOLERANCE * k.abs().max(1.0)
}

fn snap_integer(v: i64, min: f64, max: f64, step: Option<f64>) -> Result<i64, ValueError> {
    let lo = min.ceil();
    let hi = max.floor();
    if lo > hi {
        return Err(ValueError::invalid(
            "integer",
            format!("no integer inside [{min}, {max}]"),
        ));
    }
    let target = (v as f64).clamp(lo, hi);
    let Some(step) = step.filter(|s| *s > 0.0) else {
        return Ok(target as i64);
    };

    // Grid points are visited nearest first, so the first ring holding a
    // whole number holds the closest one.
    let max_k = ((max - min) / step + ALIGN_TOLERANCE).floor().max(0.0);
    let k0 = ((target - min) / step).round().clamp(0.0, max_k);
    for d in 0..=INTEGER_GRID_REACH {
        let d = f64::from(d);
        let mut best: Option<(f64, f64)> = None;
        for k in [k0 - d, k0 + d] {
            if k < 0.0 || k > max_k {
                continue;
            }
            let whole = (min + k * step).round();
            if whole < lo || whole > hi || !on_grid(whole, min, step) {
                continue;
            }
            let gap = (whole - target).abs();
            if best.is_none_or(|(g, _)| gap < g) {
                best = Some((gap, whole));
            }
        }
        if let Some((_, whole)) = best {
            return Ok(whole as i64);
        }
        if k0 - d < 0.0 && k0 + d > max_k {
            break;
        }
    }
    Err(ValueError::invalid(
        "integer",
        format!("no whole number on the grid {min} + k * {step} inside [{min}, {max}]"),
    ))
}

/// Names of the features of `instance` whose value violates its domain.
///
/// The domain of a feature is taken from `domains` first and then from the
/// feature itself; features with neither are unconstrained.
pub fn validate(instance: &Instance, domains: &BTreeMap<String, Domain>) -> BTreeSet<String> {
    instance
        .features()
        .iter()
        .filter(|f| {
            let domain = domains.get(f.name()).or(f.domain());
            domain.is_some_and(|d| !within_domain(f.value(), d))
        })
        .map(|f| f.name().to_string())
        .collect()
}

/// Observed values per feature, from a reference dataset.
///
/// Supplies the numeric spread used to normalize distances when no bounded
/// domain exists, and the value pool for mutating unconstrained features.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataDistribution {
    observed: BTreeMap<String, Vec<TypedValue>>,
}

impl DataDistribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect observed values from a set of rows.
    pub fn from_rows<'a>(rows: impl IntoIterator<Item = &'a Instance>) -> Self {
        let mut distribution = Self::new();
        for row in rows {
            for feature in row.features() {
                distribution.observe(feature.name(), feature.value().clone());
            }
        }
        distribution
    }

    pub fn observe(&mut self, name: impl Into<String>, value: TypedValue) {
        let values = self.observed.entry(name.into()).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Builder-style variant of [`observe`](Self::observe) for many values.
    pub fn with_values(mut self, name: &str, values: impl IntoIterator<Item = TypedValue>) -> Self {
        for value in values {
            self.observe(name, value);
        }
        self
    }

    pub fn values(&self, name: &str) -> &[TypedValue] {
        self.observed.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// `max - min` over the observed numeric values, if positive.
    pub fn spread(&self, name: &str) -> Option<f64> {
        let mut numbers = self.values(name).iter().filter_map(TypedValue::as_f64);
        let first = numbers.next()?;
        let (lo, hi) = numbers.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let spread = hi - lo;
        (spread > 0.0).then_some(spread)
    }

    pub fn is_empty(&self) -> bool {
        self.observed.is_empty()
    }
}

/// Read-only description of the space a search explores: the original
/// instance, the effective domain and distance scale of every feature, and
/// the observed data distribution.
#[derive(Debug, Clone)]
pub struct FeatureSpace {
    original: Instance,
    domains: Vec<Domain>,
    scales: Vec<f64>,
    pools: Vec<Vec<TypedValue>>,
    distribution: DataDistribution,
}

impl FeatureSpace {
    /// Resolve effective domains for `original`.
    ///
    /// A domain in `overrides` replaces the feature's own domain (a warning
    /// is logged when both exist). Overrides naming unknown features,
    /// malformed domains, integer features whose step grid holds no whole
    /// number, and unconstrained categorical or text features with nothing
    /// to switch to are rejected.
    pub fn new(
        original: Instance,
        overrides: &BTreeMap<String, Domain>,
        distribution: DataDistribution,
    ) -> Result<Self, ValueError> {
        if let Some(unknown) = overrides.keys().find(|name| original.get(name).is_none()) {
            return Err(ValueError::UnknownFeature {
                name: unknown.clone(),
            });
        }

        let mut domains = Vec::with_capacity(original.len());
        let mut scales = Vec::with_capacity(original.len());
        let mut pools = Vec::with_capacity(original.len());
        for feature in original.features() {
            let domain = match (overrides.get(feature.name()), feature.domain()) {
                (Some(given), Some(own)) => {
                    if given != own {
                        warn!(
                            feature = feature.name(),
                            "Overwriting the domain already attached to this feature"
                        );
                    }
                    given.clone()
                }
                (Some(given), None) => given.clone(),
                (None, Some(own)) => own.clone(),
                (None, None) => Domain::Unconstrained,
            };
            domain.check()?;
            check_domain_kind(feature.value(), &domain)?;
            if feature.kind() == ValueKind::Integer {
                clamp_to_domain(feature.value(), &domain)?;
            }
            let pool = value_pool(feature, &distribution)?;
            let switchable = matches!(feature.kind(), ValueKind::Categorical | ValueKind::Text);
            if domain == Domain::Unconstrained
                && switchable
                && pool.iter().all(|v| v == feature.value())
            {
                return Err(ValueError::NoAlternatives {
                    name: feature.name().to_string(),
                });
            }
            if !within_domain(feature.value(), &domain) {
                warn!(
                    feature = feature.name(),
                    value = %feature.value(),
                    "Original value lies outside its domain"
                );
            }

            let scale = domain
                .range()
                .filter(|r| *r > 0.0)
                .or_else(|| distribution.spread(feature.name()))
                .unwrap_or_else(|| feature.value().as_f64().map_or(1.0, |v| v.abs().max(1.0)));
            domains.push(domain);
            scales.push(scale);
            pools.push(pool);
        }

        Ok(Self {
            original,
            domains,
            scales,
            pools,
            distribution,
        })
    }

    pub fn original(&self) -> &Instance {
        &self.original
    }

    pub fn len(&self) -> usize {
        self.original.len()
    }

    pub fn is_empty(&self) -> bool {
        self.original.is_empty()
    }

    /// Effective domain of the feature at `index`.
    pub fn domain(&self, index: usize) -> &Domain {
        &self.domains[index]
    }

    /// Distance normalization scale of the feature at `index`.
    pub fn scale(&self, index: usize) -> f64 {
        self.scales[index]
    }

    pub fn distribution(&self) -> &DataDistribution {
        &self.distribution
    }

    /// Values the feature at `index` may switch to when its domain lists
    /// none: its declared labels, then the observed values of its kind.
    pub fn pool(&self, index: usize) -> &[TypedValue] {
        &self.pools[index]
    }

    pub fn is_mutable(&self, index: usize) -> bool {
        self.domains[index].is_mutable()
    }

    /// Indices of features the search is allowed to change.
    pub fn mutable_indices(&self) -> Vec<usize> {
        (0..self.domains.len())
            .filter(|&i| self.is_mutable(i))
            .collect()
    }

    /// Names of violated features: values outside their domain, immutable
    /// features that differ from the original, and any mismatch in the
    /// feature name set.
    pub fn validate(&self, instance: &Instance) -> BTreeSet<String> {
        let mut violated = BTreeSet::new();
        for name in instance.names() {
            if self.original.get(name).is_none() {
                violated.insert(name.to_string());
            }
        }
        for (i, feature) in self.original.features().iter().enumerate() {
            let Some(value) = instance.value(feature.name()) else {
                violated.insert(feature.name().to_string());
                continue;
            };
            let domain = &self.domains[i];
            let fixed_changed = !domain.is_mutable() && value != feature.value();
            if fixed_changed || !within_domain(value, domain) {
                violated.insert(feature.name().to_string());
            }
        }
        violated
    }

    pub fn is_valid(&self, instance: &Instance) -> bool {
        self.validate(instance).is_empty()
    }

    /// Per-feature distance between the original and `instance`, positionally.
    pub fn feature_distances(&self, instance: &Instance) -> Result<Vec<f64>, ValueError> {
        self.original
            .values()
            .zip(instance.values())
            .enumerate()
            .map(|(i, (a, b))| a.distance(b, self.scales[i]))
            .collect()
    }
}

fn value_pool(
    feature: &Feature,
    distribution: &DataDistribution,
) -> Result<Vec<TypedValue>, ValueError> {
    let mut pool: Vec<TypedValue> = Vec::new();
    for label in feature.labels() {
        feature.value().check_same_kind(label)?;
        if !pool.contains(label) {
            pool.push(label.clone());
        }
    }
    for value in distribution.values(feature.name()) {
        if value.kind() == feature.kind() && !pool.contains(value) {
            pool.push(value.clone());
        }
    }
    Ok(pool)
}

fn check_domain_kind(value: &TypedValue, domain: &Domain) -> Result<(), ValueError> {
    match domain {
        Domain::BoundedNumeric { .. } => match value.kind() {
            ValueKind::Numeric | ValueKind::Integer => Ok(()),
            other => Err(ValueError::mismatch(other, "bounded numeric domain")),
        },
        Domain::CategoricalSet { allowed } | Domain::FixedSet { allowed } => match allowed.first() {
            Some(first) => value.check_same_kind(first),
            None => Ok(()),
        },
        Domain::Unconstrained => Ok(()),
    }
}
