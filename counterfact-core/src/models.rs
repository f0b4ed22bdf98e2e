//! Small in-process predictors: closure adapters and reference models used
//! in tests, benchmarks and examples.

use crate::error::OracleError;
use crate::instance::{Instance, Output, OutputValue};
use crate::oracle::{Prediction, Predictor};
use crate::value::TypedValue;
use async_trait::async_trait;

/// Wraps a row-wise closure as a [`Predictor`]. A row whose closure fails
/// fails alone.
pub struct FnPredictor<F> {
    name: String,
    func: F,
}

impl<F> FnPredictor<F>
where
    F: Fn(&Instance) -> Result<Output, OracleError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> Predictor for FnPredictor<F>
where
    F: Fn(&Instance) -> Result<Output, OracleError> + Send + Sync,
{
    async fn predict(&self, inputs: &[Instance]) -> Result<Vec<Output>, OracleError> {
        inputs.iter().map(|row| (self.func)(row)).collect()
    }

    async fn predict_partial(&self, inputs: &[Instance]) -> Result<Vec<Prediction>, OracleError> {
        Ok(inputs.iter().map(|row| (self.func)(row)).collect())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn numeric_values(instance: &Instance) -> Result<Vec<f64>, OracleError> {
    instance
        .features()
        .iter()
        .map(|f| {
            f.value().as_f64().ok_or_else(|| {
                OracleError::call_failed(format!("feature '{}' is not numeric", f.name()))
            })
        })
        .collect()
}

/// Sums every numeric feature except the one at `skip`; the output is named
/// `sum-but{skip}`.
#[derive(Debug, Clone)]
pub struct SumSkipModel {
    skip: usize,
    output: String,
}

impl SumSkipModel {
    pub fn new(skip: usize) -> Self {
        Self {
            skip,
            output: format!("sum-but{skip}"),
        }
    }

    pub fn output_name(&self) -> &str {
        &self.output
    }
}

#[async_trait]
impl Predictor for SumSkipModel {
    async fn predict(&self, inputs: &[Instance]) -> Result<Vec<Output>, OracleError> {
        inputs
            .iter()
            .map(|row| {
                let sum: f64 = numeric_values(row)?
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| *i != self.skip)
                    .map(|(_, v)| v)
                    .sum();
                Ok(Output::single(&self.output, TypedValue::Numeric(sum)))
            })
            .collect()
    }

    fn name(&self) -> &str {
        "sum-skip"
    }
}

/// Outputs `inside = true` when the sum of numeric features lies within
/// `epsilon` of `center`. The score is the distance to the band edge,
/// normalized by `center`.
#[derive(Debug, Clone)]
pub struct SumThresholdModel {
    center: f64,
    epsilon: f64,
}

impl SumThresholdModel {
    pub const OUTPUT: &'static str = "inside";

    pub fn new(center: f64, epsilon: f64) -> Self {
        Self {
            center,
            epsilon: epsilon.abs(),
        }
    }
}

#[async_trait]
impl Predictor for SumThresholdModel {
    async fn predict(&self, inputs: &[Instance]) -> Result<Vec<Output>, OracleError> {
        inputs
            .iter()
            .map(|row| {
                let sum: f64 = numeric_values(row)?.into_iter().sum();
                let gap = (sum - self.center).abs();
                let inside = gap <= self.epsilon;
                let score = (gap - self.epsilon).abs() / self.center.abs().max(1.0);
                Ok(Output::new(vec![
                    OutputValue::new(Self::OUTPUT, TypedValue::Boolean(inside)).with_score(score),
                ]))
            })
            .collect()
    }

    fn name(&self) -> &str {
        "sum-threshold"
    }
}
