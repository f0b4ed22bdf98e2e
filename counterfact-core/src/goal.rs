//! Goal criteria: pluggable predicates over model outputs.
//!
//! The engine only ever calls [`GoalCriterion::evaluate`]. Concrete goals
//! (target outputs, thresholds, logical composites, closures) are variants
//! behind that single capability.

use crate::error::GoalError;
use crate::instance::Output;
use crate::value::TypedValue;
use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::warn;

/// Smallest deficit reported for an unsatisfied goal, so that
/// `deficit == 0` holds exactly when the goal is satisfied.
pub const MIN_DEFICIT: f64 = 1e-12;

/// Result of evaluating a goal against one output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GoalScore {
    satisfied: bool,
    deficit: f64,
}

impl GoalScore {
    pub fn satisfied() -> Self {
        Self {
            satisfied: true,
            deficit: 0.0,
        }
    }

    /// An unsatisfied score. NaN becomes `+inf`; zero or negative deficits
    /// are raised to [`MIN_DEFICIT`].
    pub fn unsatisfied(deficit: f64) -> Self {
        let deficit = if deficit.is_nan() {
            f64::INFINITY
        } else {
            deficit.abs().max(MIN_DEFICIT)
        };
        Self {
            satisfied: false,
            deficit,
        }
    }

    /// Satisfied iff `deficit` is exactly zero.
    pub fn from_deficit(deficit: f64) -> Self {
        if deficit == 0.0 {
            Self::satisfied()
        } else {
            Self::unsatisfied(deficit)
        }
    }

    /// The score of a candidate that could not be evaluated.
    pub fn failed() -> Self {
        Self::unsatisfied(f64::INFINITY)
    }

    pub fn is_satisfied(&self) -> bool {
        self.satisfied
    }

    pub fn deficit(&self) -> f64 {
        self.deficit
    }
}

/// A caller-defined goal over model outputs.
///
/// Implementations must be deterministic for a fixed output.
pub trait GoalCriterion: Send + Sync {
    fn evaluate(&self, output: &Output) -> Result<GoalScore, GoalError>;

    /// Short description used in logs.
    fn describe(&self) -> String {
        "custom goal".to_string()
    }
}

/// Evaluate `criterion`, turning errors and panics into a failed score.
pub fn score_output(criterion: &dyn GoalCriterion, output: &Output) -> GoalScore {
    let result = catch_unwind(AssertUnwindSafe(|| criterion.evaluate(output)))
        .unwrap_or_else(|payload| {
            Err(GoalError::Panicked {
                message: panic_message(payload.as_ref()),
            })
        });
    match result {
        Ok(score) => score,
        Err(e) => {
            warn!(goal = %criterion.describe(), error = %e, "Goal criterion failed, treating candidate as unfit");
            GoalScore::failed()
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// One desired output value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOutput {
    pub name: String,
    pub value: TypedValue,
    /// Absolute tolerance for numeric outputs.
    #[serde(default)]
    pub tolerance: f64,
}

impl TargetOutput {
    pub fn new(name: impl Into<String>, value: TypedValue) -> Self {
        Self {
            name: name.into(),
            value,
            tolerance: 0.0,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance.abs();
        self
    }
}

/// Every listed output must take its desired value.
///
/// Numeric outputs match within their tolerance; other outputs match by
/// equality. The deficit is the sum of per-output shortfalls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOutputs {
    pub targets: Vec<TargetOutput>,
}

impl TargetOutputs {
    pub fn new(targets: Vec<TargetOutput>) -> Self {
        Self { targets }
    }
}

impl GoalCriterion for TargetOutputs {
    fn evaluate(&self, output: &Output) -> Result<GoalScore, GoalError> {
        let mut deficit = 0.0;
        for target in &self.targets {
            let actual = output
                .get(&target.name)
                .ok_or_else(|| GoalError::MissingOutput {
                    name: target.name.clone(),
                })?;
            deficit += match (actual.value.as_f64(), target.value.as_f64()) {
                (Some(a), Some(t)) => ((a - t).abs() - target.tolerance).max(0.0),
                _ => actual
                    .value
                    .distance(&target.value, 1.0)
                    .map_err(|e| GoalError::evaluation(e.to_string()))?,
            };
        }
        Ok(GoalScore::from_deficit(deficit))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self
            .targets
            .iter()
            .map(|t| format!("{} == {}", t.name, t.value))
            .collect();
        parts.join(" && ")
    }
}

/// Comparison used by [`Threshold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    AtLeast,
    AtMost,
    Above,
    Below,
}

/// A numeric output must cross a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub output: String,
    pub comparison: Comparison,
    pub value: f64,
}

impl Threshold {
    pub fn new(output: impl Into<String>, comparison: Comparison, value: f64) -> Self {
        Self {
            output: output.into(),
            comparison,
            value,
        }
    }
}

impl GoalCriterion for Threshold {
    fn evaluate(&self, output: &Output) -> Result<GoalScore, GoalError> {
        let actual = output
            .get(&self.output)
            .ok_or_else(|| GoalError::MissingOutput {
                name: self.output.clone(),
            })?
            .value
            .as_f64()
            .ok_or_else(|| GoalError::evaluation(format!("output '{}' is not numeric", self.output)))?;

        let (satisfied, gap) = match self.comparison {
            Comparison::AtLeast => (actual >= self.value, self.value - actual),
            Comparison::AtMost => (actual <= self.value, actual - self.value),
            Comparison::Above => (actual > self.value, self.value - actual),
            Comparison::Below => (actual < self.value, actual - self.value),
        };
        Ok(if satisfied {
            GoalScore::satisfied()
        } else {
            GoalScore::unsatisfied(gap)
        })
    }

    fn describe(&self) -> String {
        format!("{} {:?} {}", self.output, self.comparison, self.value)
    }
}

/// Satisfied when every member is; deficit is the sum of member deficits.
pub struct AllOf(pub Vec<Arc<dyn GoalCriterion>>);

impl GoalCriterion for AllOf {
    fn evaluate(&self, output: &Output) -> Result<GoalScore, GoalError> {
        let mut deficit = 0.0;
        for member in &self.0 {
            deficit += member.evaluate(output)?.deficit();
        }
        Ok(GoalScore::from_deficit(deficit))
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|g| format!("({})", g.describe())).collect();
        parts.join(" AND ")
    }
}

/// Satisfied when any member is; deficit is the smallest member deficit.
///
/// Failing members are skipped unless every member fails.
pub struct AnyOf(pub Vec<Arc<dyn GoalCriterion>>);

impl GoalCriterion for AnyOf {
    fn evaluate(&self, output: &Output) -> Result<GoalScore, GoalError> {
        let mut best: Option<GoalScore> = None;
        let mut last_err = None;
        for member in &self.0 {
            match member.evaluate(output) {
                Ok(score) if score.is_satisfied() => return Ok(score),
                Ok(score) => {
                    if best.is_none_or(|b| score.deficit() < b.deficit()) {
                        best = Some(score);
                    }
                }
                Err(e) => last_err = Some(e),
            }
        }
        match (best, last_err) {
            (Some(score), _) => Ok(score),
            (None, Some(e)) => Err(e),
            (None, None) => Err(GoalError::evaluation("AnyOf has no members")),
        }
    }

    fn describe(&self) -> String {
        let parts: Vec<String> = self.0.iter().map(|g| format!("({})", g.describe())).collect();
        parts.join(" OR ")
    }
}

/// A goal backed by a closure.
pub struct FnCriterion<F> {
    func: F,
    description: String,
}

impl<F> FnCriterion<F>
where
    F: Fn(&Output) -> Result<GoalScore, GoalError> + Send + Sync,
{
    pub fn new(description: impl Into<String>, func: F) -> Self {
        Self {
            func,
            description: description.into(),
        }
    }
}

impl<F> GoalCriterion for FnCriterion<F>
where
    F: Fn(&Output) -> Result<GoalScore, GoalError> + Send + Sync,
{
    fn evaluate(&self, output: &Output) -> Result<GoalScore, GoalError> {
        (self.func)(output)
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::OutputValue;

    fn approval(approved: bool, score: f64) -> Output {
        Output::new(vec![
            OutputValue::new("approved", TypedValue::Boolean(approved)),
            OutputValue::new("score", TypedValue::Numeric(score)),
        ])
    }

    #[test]
    fn test_goal_score_invariant() {
        assert!(GoalScore::from_deficit(0.0).is_satisfied());
        let s = GoalScore::unsatisfied(0.0);
        assert!(!s.is_satisfied());
        assert!(s.deficit() > 0.0);
        assert_eq!(GoalScore::unsatisfied(f64::NAN).deficit(), f64::INFINITY);
    }

    #[test]
    fn test_target_outputs_boolean_and_numeric() {
        let goal = TargetOutputs::new(vec![
            TargetOutput::new("approved", TypedValue::Boolean(true)),
            TargetOutput::new("score", TypedValue::Numeric(0.8)).with_tolerance(0.1),
        ]);
        assert!(goal.evaluate(&approval(true, 0.75)).unwrap().is_satisfied());

        let miss = goal.evaluate(&approval(false, 0.5)).unwrap();
        assert!(!miss.is_satisfied());
        assert!((miss.deficit() - 1.2).abs() < 1e-9);
    }

    #[test]
    fn test_target_outputs_missing_output_is_error() {
        let goal = TargetOutputs::new(vec![TargetOutput::new("nope", TypedValue::Boolean(true))]);
        assert!(matches!(
            goal.evaluate(&approval(true, 0.0)),
            Err(GoalError::MissingOutput { .. })
        ));
    }

    #[test]
    fn test_threshold_strict_comparison() {
        let goal = Threshold::new("score", Comparison::Above, 0.5);
        let at = goal.evaluate(&approval(true, 0.5)).unwrap();
        assert!(!at.is_satisfied());
        assert!(at.deficit() > 0.0);
        assert!(goal.evaluate(&approval(true, 0.6)).unwrap().is_satisfied());

        let goal = Threshold::new("score", Comparison::AtMost, 0.5);
        assert_eq!(goal.evaluate(&approval(true, 0.7)).unwrap().deficit(), 0.7 - 0.5);
    }

    #[test]
    fn test_composites() {
        let approved: Arc<dyn GoalCriterion> = Arc::new(TargetOutputs::new(vec![
            TargetOutput::new("approved", TypedValue::Boolean(true)),
        ]));
        let high: Arc<dyn GoalCriterion> = Arc::new(Threshold::new("score", Comparison::AtLeast, 0.9));

        let all = AllOf(vec![approved.clone(), high.clone()]);
        let s = all.evaluate(&approval(true, 0.5)).unwrap();
        assert!(!s.is_satisfied());
        assert!((s.deficit() - 0.4).abs() < 1e-9);

        let any = AnyOf(vec![approved, high]);
        assert!(any.evaluate(&approval(true, 0.5)).unwrap().is_satisfied());
        let s = any.evaluate(&approval(false, 0.5)).unwrap();
        assert!((s.deficit() - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_score_output_absorbs_errors_and_panics() {
        let failing = FnCriterion::new("always fails", |_: &Output| {
            Err(GoalError::evaluation("boom"))
        });
        assert_eq!(score_output(&failing, &approval(true, 0.0)), GoalScore::failed());

        let panicking = FnCriterion::new("panics", |_: &Output| -> Result<GoalScore, GoalError> {
            panic!("criterion exploded")
        });
        let score = score_output(&panicking, &approval(true, 0.0));
        assert!(!score.is_satisfied());
        assert_eq!(score.deficit(), f64::INFINITY);
    }
}
