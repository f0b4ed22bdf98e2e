//! High-level entry point: explain one instance against one predictor.

use crate::config::SearchConfig;
use crate::domain::{DataDistribution, Domain, FeatureSpace};
use crate::error::ConfigError;
use crate::goal::{GoalCriterion, TargetOutput, TargetOutputs};
use crate::instance::Instance;
use crate::oracle::Predictor;
use crate::search::{SearchEngine, SearchOutcome};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

/// What to explain and what the explanation should achieve.
#[derive(Clone)]
pub struct ExplainRequest {
    pub instance: Instance,
    /// Desired outputs. Ignored when `criterion` is set.
    pub goal: Vec<TargetOutput>,
    pub criterion: Option<Arc<dyn GoalCriterion>>,
    /// Per-feature domains; these replace domains attached to the features.
    pub domains: BTreeMap<String, Domain>,
    pub distribution: DataDistribution,
    /// Wall-clock limit for this request, replacing the configured one.
    pub timeout: Option<Duration>,
    /// Identifier reported as the search id; generated when absent.
    pub execution_id: Option<Uuid>,
}

impl ExplainRequest {
    pub fn new(instance: Instance) -> Self {
        Self {
            instance,
            goal: Vec::new(),
            criterion: None,
            domains: BTreeMap::new(),
            distribution: DataDistribution::new(),
            timeout: None,
            execution_id: None,
        }
    }

    pub fn with_goal(mut self, goal: Vec<TargetOutput>) -> Self {
        self.goal = goal;
        self
    }

    pub fn with_criterion(mut self, criterion: Arc<dyn GoalCriterion>) -> Self {
        self.criterion = Some(criterion);
        self
    }

    pub fn with_domain(mut self, feature: impl Into<String>, domain: Domain) -> Self {
        self.domains.insert(feature.into(), domain);
        self
    }

    pub fn with_domains(mut self, domains: BTreeMap<String, Domain>) -> Self {
        self.domains.extend(domains);
        self
    }

    pub fn with_distribution(mut self, distribution: DataDistribution) -> Self {
        self.distribution = distribution;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_execution_id(mut self, id: Uuid) -> Self {
        self.execution_id = Some(id);
        self
    }

    fn criterion(&self) -> Result<Arc<dyn GoalCriterion>, ConfigError> {
        match (&self.criterion, self.goal.is_empty()) {
            (Some(criterion), goal_empty) => {
                if !goal_empty {
                    warn!("Both a goal and criteria were provided; using the criteria");
                }
                Ok(Arc::clone(criterion))
            }
            (None, false) => Ok(Arc::new(TargetOutputs::new(self.goal.clone()))),
            (None, true) => Err(ConfigError::MissingGoal),
        }
    }
}

/// Counterfactual explainer bound to one predictor and configuration.
#[derive(Clone)]
pub struct CounterfactualExplainer {
    engine: SearchEngine,
}

impl CounterfactualExplainer {
    pub fn new(predictor: Arc<dyn Predictor>, config: SearchConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            engine: SearchEngine::new(predictor, config)?,
        })
    }

    pub fn config(&self) -> &SearchConfig {
        self.engine.config()
    }

    pub async fn explain(&self, request: ExplainRequest) -> Result<SearchOutcome, ConfigError> {
        self.explain_with_cancel(request, &CancellationToken::new())
            .await
    }

    /// Like [`explain`](Self::explain), stopping early once `cancel` fires.
    pub async fn explain_with_cancel(
        &self,
        request: ExplainRequest,
        cancel: &CancellationToken,
    ) -> Result<SearchOutcome, ConfigError> {
        let criterion = request.criterion()?;
        if request.instance.is_empty() {
            return Err(ConfigError::EmptyInstance);
        }
        let space = FeatureSpace::new(request.instance, &request.domains, request.distribution)?;

        let engine = match request.timeout {
            Some(timeout) => self.engine.with_wall_clock(timeout),
            None => self.engine.clone(),
        };
        let search_id = request.execution_id.unwrap_or_else(Uuid::new_v4);
        Ok(engine.run(&space, criterion.as_ref(), cancel, search_id).await)
    }
}
