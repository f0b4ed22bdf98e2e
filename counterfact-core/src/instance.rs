//! Features, instances and model outputs.
//!
//! Features are immutable snapshots: perturbing a feature produces a new
//! [`Feature`] and a new [`Instance`], never an in-place edit.

use crate::domain::Domain;
use crate::error::ValueError;
use crate::value::{Category, TypedValue, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A named, typed input value with an optional domain.
///
/// Categorical and text features may declare the labels their type ranges
/// over. Labels are not a constraint: they are the values the search may
/// switch to when the feature's domain does not list any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    name: String,
    value: TypedValue,
    #[serde(default)]
    domain: Option<Domain>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    labels: Vec<TypedValue>,
}

impl Feature {
    pub fn new(name: impl Into<String>, value: TypedValue) -> Self {
        Self {
            name: name.into(),
            value,
            domain: None,
            labels: Vec::new(),
        }
    }

    pub fn numeric(name: impl Into<String>, value: f64) -> Result<Self, ValueError> {
        Ok(Self::new(name, TypedValue::numeric(value)?))
    }

    pub fn integer(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, TypedValue::Integer(value))
    }

    pub fn categorical(name: impl Into<String>, value: impl Into<Category>) -> Self {
        Self::new(name, TypedValue::categorical(value))
    }

    pub fn boolean(name: impl Into<String>, value: bool) -> Self {
        Self::new(name, TypedValue::Boolean(value))
    }

    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, TypedValue::text(value))
    }

    /// Build a feature from a JSON value and a declared tag.
    pub fn from_json(
        name: impl Into<String>,
        kind: ValueKind,
        value: &serde_json::Value,
    ) -> Result<Self, ValueError> {
        Ok(Self::new(name, TypedValue::from_json(kind, value)?))
    }

    /// Attach a domain, consuming the feature.
    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain = Some(domain);
        self
    }

    /// Declare the labels of a categorical or text feature, consuming it.
    pub fn with_labels(mut self, labels: impl IntoIterator<Item = TypedValue>) -> Self {
        for label in labels {
            if !self.labels.contains(&label) {
                self.labels.push(label);
            }
        }
        self
    }

    /// A new feature with the same name, domain and labels but a different value.
    pub fn with_value(&self, value: TypedValue) -> Self {
        Self {
            name: self.name.clone(),
            value,
            domain: self.domain.clone(),
            labels: self.labels.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &TypedValue {
        &self.value
    }

    pub fn domain(&self) -> Option<&Domain> {
        self.domain.as_ref()
    }

    pub fn labels(&self) -> &[TypedValue] {
        &self.labels
    }

    pub fn kind(&self) -> ValueKind {
        self.value.kind()
    }
}

/// One row of model input: features with unique names, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Feature>", into = "Vec<Feature>")]
pub struct Instance {
    features: Vec<Feature>,
}

impl Instance {
    pub fn new(features: Vec<Feature>) -> Result<Self, ValueError> {
        let mut seen = HashSet::with_capacity(features.len());
        for feature in &features {
            if !seen.insert(feature.name.as_str()) {
                return Err(ValueError::DuplicateFeature {
                    name: feature.name.clone(),
                });
            }
        }
        Ok(Self { features })
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    pub fn value(&self, name: &str) -> Option<&TypedValue> {
        self.get(name).map(Feature::value)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.iter().map(|f| f.name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &TypedValue> {
        self.features.iter().map(|f| &f.value)
    }

    /// Build a sibling instance with the same names and domains but new values.
    ///
    /// `values` must be positionally aligned with this instance's features.
    pub(crate) fn with_values(&self, values: Vec<TypedValue>) -> Self {
        debug_assert_eq!(values.len(), self.features.len());
        let features = self
            .features
            .iter()
            .zip(values)
            .map(|(f, v)| f.with_value(v))
            .collect();
        Self { features }
    }
}

impl TryFrom<Vec<Feature>> for Instance {
    type Error = ValueError;

    fn try_from(features: Vec<Feature>) -> Result<Self, Self::Error> {
        Instance::new(features)
    }
}

impl From<Instance> for Vec<Feature> {
    fn from(instance: Instance) -> Self {
        instance.features
    }
}

/// A single named output of the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub name: String,
    pub value: TypedValue,
    /// Confidence reported by the model for this output, if any.
    #[serde(default = "default_score")]
    pub score: f64,
}

fn default_score() -> f64 {
    1.0
}

impl OutputValue {
    pub fn new(name: impl Into<String>, value: TypedValue) -> Self {
        Self {
            name: name.into(),
            value,
            score: default_score(),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }
}

/// The typed output vector produced by the oracle for one instance.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Output {
    values: Vec<OutputValue>,
}

impl Output {
    pub fn new(values: Vec<OutputValue>) -> Self {
        Self { values }
    }

    pub fn single(name: impl Into<String>, value: TypedValue) -> Self {
        Self::new(vec![OutputValue::new(name, value)])
    }

    pub fn values(&self) -> &[OutputValue] {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&OutputValue> {
        self.values.iter().find(|v| v.name == name)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
