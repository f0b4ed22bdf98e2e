//! # Counterfact Core
//!
//! Counterfactual explanations for black-box models.
//! Provides the typed feature model, domains and validity checking, goal
//! criteria, the prediction oracle adapter, the perturbation search engine
//! and result ranking.

pub mod config;
pub mod domain;
pub mod error;
pub mod explainer;
pub mod goal;
pub mod instance;
pub mod models;
pub mod oracle;
pub mod ranker;
pub mod search;
pub mod value;

// Re-export commonly used types at the crate root.
pub use config::{OracleConfig, SearchConfig, load_config, save_config};
pub use domain::{
    DataDistribution, Domain, FeatureSpace, clamp_to_domain, nearest_valid, validate,
    within_domain,
};
pub use error::{ConfigError, CounterfactError, GoalError, OracleError, Result, ValueError};
pub use explainer::{CounterfactualExplainer, ExplainRequest};
pub use goal::{
    AllOf, AnyOf, Comparison, FnCriterion, GoalCriterion, GoalScore, TargetOutput, TargetOutputs,
    Threshold, score_output,
};
pub use instance::{Feature, Instance, Output, OutputValue};
pub use oracle::{OracleAdapter, Prediction, Predictor};
pub use ranker::{CounterfactualResult, Difference, FeatureChange, ResultRow};
pub use search::{SearchEngine, SearchOutcome, SearchStatus, search};
pub use value::{Category, TypedValue, ValueKind};

/// Re-exported so callers can cancel searches without depending on
/// `tokio-util` directly.
pub use tokio_util::sync::CancellationToken;
