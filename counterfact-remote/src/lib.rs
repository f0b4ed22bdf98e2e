//! # Counterfact Remote
//!
//! Predictors that call models served over the network, for use with the
//! counterfactual search engine in `counterfact-core`.

pub mod http;

pub use http::{HttpPredictor, HttpPredictorConfig, OutputSpec};
