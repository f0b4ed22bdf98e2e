//! End-to-end search scenarios against in-process predictors.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use counterfact_core::config::OracleConfig;
use counterfact_core::models::{FnPredictor, SumSkipModel};
use counterfact_core::{
    CancellationToken, ConfigError, CounterfactualExplainer, DataDistribution, Domain,
    ExplainRequest, Feature, FnCriterion, GoalScore, Instance, OracleError, Output, Prediction,
    Predictor, SearchConfig, SearchEngine, SearchOutcome, SearchStatus, TargetOutput,
    TargetOutputs, TypedValue, ValueError, search, within_domain,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// --- Loan approval fixture ---

fn approval(row: &Instance) -> Result<Output, OracleError> {
    let age = row.value("age").and_then(TypedValue::as_f64).unwrap_or(0.0);
    let employed = row.value("employment") == Some(&TypedValue::categorical("employed"));
    Ok(Output::single(
        "predicted_approval",
        TypedValue::Boolean(age >= 25.0 && employed),
    ))
}

fn employment_values() -> Vec<TypedValue> {
    vec![
        TypedValue::categorical("employed"),
        TypedValue::categorical("unemployed"),
    ]
}

fn applicant(age: f64, employment: &str) -> Instance {
    Instance::new(vec![
        Feature::numeric("age", age).unwrap(),
        Feature::categorical("employment", employment).with_labels(employment_values()),
    ])
    .unwrap()
}

fn approval_goal() -> Vec<TargetOutput> {
    vec![TargetOutput::new(
        "predicted_approval",
        TypedValue::Boolean(true),
    )]
}

fn approval_domains(employment: Domain) -> BTreeMap<String, Domain> {
    let mut domains = BTreeMap::new();
    domains.insert("age".to_string(), Domain::bounded(18.0, 90.0).unwrap());
    domains.insert("employment".to_string(), employment);
    domains
}

fn approval_request(instance: Instance, employment: Domain) -> ExplainRequest {
    ExplainRequest::new(instance)
        .with_goal(approval_goal())
        .with_domains(approval_domains(employment))
}

fn explainer(config: SearchConfig) -> CounterfactualExplainer {
    init_tracing();
    CounterfactualExplainer::new(Arc::new(FnPredictor::new("approval", approval)), config).unwrap()
}

fn assert_results_valid(outcome: &SearchOutcome, domains: &BTreeMap<String, Domain>, original: &Instance) {
    for result in &outcome.results {
        for feature in result.instance.features() {
            let domain = &domains[feature.name()];
            assert!(within_domain(feature.value(), domain), "{} out of domain", feature.name());
            if let Domain::FixedSet { .. } = domain {
                assert_eq!(Some(feature.value()), original.value(feature.name()));
            }
        }
    }
}

#[tokio::test]
async fn fixed_employment_is_infeasible_regardless_of_budget() {
    for max_generations in [3, 25] {
        let config = SearchConfig {
            max_generations,
            seed: Some(17),
            ..SearchConfig::default()
        };
        let request = approval_request(
            applicant(20.0, "unemployed"),
            Domain::fixed(employment_values()).unwrap(),
        );
        let outcome = explainer(config).explain(request).await.unwrap();
        assert_eq!(outcome.status, SearchStatus::NoResultFound);
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.generations_run as usize, max_generations + 1);
    }
}

#[tokio::test]
async fn unconstrained_employment_converges_near_minimal_change() {
    init_tracing();
    let config = SearchConfig {
        max_generations: 300,
        seed: Some(2024),
        ..SearchConfig::default()
    };
    let original = applicant(20.0, "unemployed");
    let domains = approval_domains(Domain::Unconstrained);
    let outcome = search(
        Arc::new(FnPredictor::new("approval", approval)),
        original.clone(),
        &domains,
        &TargetOutputs::new(approval_goal()),
        config,
    )
    .await
    .unwrap();

    assert_eq!(outcome.status, SearchStatus::Converged);
    let best = outcome.best().expect("a counterfactual");
    let age = best.instance.value("age").and_then(TypedValue::as_f64).unwrap();
    assert!((25.0..27.0).contains(&age), "age {age}");
    assert_eq!(
        best.instance.value("employment"),
        Some(&TypedValue::categorical("employed"))
    );
    assert_eq!(
        best.changed_features().collect::<Vec<_>>(),
        vec!["age", "employment"]
    );
    assert_eq!(best.rows[1].difference.to_string(), "unemployed -> employed");
    assert_results_valid(&outcome, &domains, &original);
}

#[tokio::test]
async fn observed_values_let_unlabelled_employment_change() {
    let original = Instance::new(vec![
        Feature::numeric("age", 20.0).unwrap(),
        Feature::categorical("employment", "unemployed"),
    ])
    .unwrap();
    let config = SearchConfig {
        max_generations: 300,
        seed: Some(2024),
        ..SearchConfig::default()
    };

    let request = approval_request(original.clone(), Domain::Unconstrained);
    let err = explainer(config.clone()).explain(request).await.unwrap_err();
    assert_eq!(
        err,
        ConfigError::InvalidInstance(ValueError::NoAlternatives {
            name: "employment".to_string()
        })
    );

    let request = approval_request(original, Domain::Unconstrained)
        .with_distribution(DataDistribution::new().with_values("employment", employment_values()));
    let outcome = explainer(config).explain(request).await.unwrap();
    assert!(outcome.found());
    assert_eq!(
        outcome.best().unwrap().instance.value("employment"),
        Some(&TypedValue::categorical("employed"))
    );
}

#[tokio::test]
async fn fixed_employment_is_kept_when_age_alone_suffices() {
    let config = SearchConfig {
        max_generations: 100,
        result_count: 5,
        seed: Some(31),
        ..SearchConfig::default()
    };
    let original = applicant(20.0, "employed");
    let request = approval_request(
        original.clone(),
        Domain::fixed(employment_values()).unwrap(),
    );
    let domains = request.domains.clone();
    let outcome = explainer(config).explain(request).await.unwrap();

    assert!(outcome.found());
    for result in &outcome.results {
        assert_eq!(result.changed_features().collect::<Vec<_>>(), vec!["age"]);
    }
    assert_results_valid(&outcome, &domains, &original);
}

#[tokio::test]
async fn satisfied_original_converges_immediately() {
    let original = applicant(30.0, "employed");
    let request = approval_request(original.clone(), Domain::Unconstrained);
    let outcome = explainer(SearchConfig::seeded(5)).explain(request).await.unwrap();

    assert_eq!(outcome.status, SearchStatus::Converged);
    assert_eq!(outcome.generations_run, 1);
    let best = outcome.best().unwrap();
    assert_eq!(best.distance, 0.0);
    assert_eq!(best.instance, original);
    assert!(best.changes.is_empty());
}

#[tokio::test]
async fn zero_generations_evaluates_the_seed_population_once() {
    let config = SearchConfig {
        max_generations: 0,
        seed: Some(9),
        ..SearchConfig::default()
    };
    let engine = SearchEngine::new(Arc::new(FnPredictor::new("approval", approval)), config).unwrap();
    let request = approval_request(applicant(20.0, "unemployed"), Domain::Unconstrained);
    let goal = TargetOutputs::new(request.goal.clone());
    let outcome = engine
        .search(
            request.instance.clone(),
            &request.domains,
            request.distribution.clone(),
            &goal,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome.generations_run, 1);
    assert!(outcome.evaluations > 0);
    assert!(matches!(
        outcome.status,
        SearchStatus::BudgetExhausted | SearchStatus::NoResultFound
    ));
    assert_eq!(outcome.status == SearchStatus::NoResultFound, outcome.results.is_empty());

    let satisfied = approval_request(applicant(40.0, "employed"), Domain::Unconstrained);
    let outcome = engine
        .search(
            satisfied.instance.clone(),
            &satisfied.domains,
            satisfied.distribution.clone(),
            &goal,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.status, SearchStatus::Converged);
    assert_eq!(outcome.best().unwrap().distance, 0.0);
}

#[tokio::test]
async fn same_seed_gives_identical_results() {
    let run = || async {
        let config = SearchConfig {
            max_generations: 20,
            result_count: 5,
            seed: Some(77),
            ..SearchConfig::default()
        };
        let request = approval_request(applicant(20.0, "unemployed"), Domain::Unconstrained);
        explainer(config).explain(request).await.unwrap()
    };
    let first = run().await;
    let second = run().await;

    let instances = |o: &SearchOutcome| o.results.iter().map(|r| r.instance.clone()).collect::<Vec<_>>();
    assert!(!first.results.is_empty());
    assert_eq!(instances(&first), instances(&second));
    assert_eq!(first.status, second.status);
    assert_eq!(first.generations_run, second.generations_run);
}

#[tokio::test]
async fn cancellation_returns_partial_archive() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let predictor = FnPredictor::new("cancelling", move |row: &Instance| {
        if seen.fetch_add(1, Ordering::SeqCst) >= 100 {
            trigger.cancel();
        }
        approval(row)
    });
    let config = SearchConfig {
        max_generations: 10_000,
        plateau_generations: 10_000,
        seed: Some(3),
        ..SearchConfig::default()
    };
    let explainer = CounterfactualExplainer::new(Arc::new(predictor), config).unwrap();
    let request = approval_request(applicant(20.0, "unemployed"), Domain::Unconstrained);
    let outcome = explainer.explain_with_cancel(request, &cancel).await.unwrap();

    assert_eq!(outcome.status, SearchStatus::Cancelled);
    assert!(outcome.generations_run < 10);
    assert!(calls.load(Ordering::SeqCst) >= 100);
}

// --- Oracle failures ---

/// Reports a timeout for every row whose age rounds to an even number on
/// its first attempt and answers everything else, in batches.
#[derive(Default)]
struct HalfTimeout {
    attempts: Mutex<HashMap<String, usize>>,
    calls: AtomicUsize,
}

#[async_trait]
impl Predictor for HalfTimeout {
    async fn predict(&self, inputs: &[Instance]) -> Result<Vec<Output>, OracleError> {
        inputs.iter().map(approval).collect()
    }

    async fn predict_partial(&self, inputs: &[Instance]) -> Result<Vec<Prediction>, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut attempts = self.attempts.lock().unwrap();
        Ok(inputs
            .iter()
            .map(|row| {
                let seen = attempts.entry(format!("{row:?}")).or_insert(0);
                *seen += 1;
                let age = row.value("age").and_then(TypedValue::as_f64).unwrap_or(0.0);
                if *seen == 1 && (age.round() as i64) % 2 == 0 {
                    Err(OracleError::Timeout { timeout_ms: 40 })
                } else {
                    approval(row)
                }
            })
            .collect())
    }
}

fn half_timeout_config(retries: u32) -> SearchConfig {
    SearchConfig {
        population_size: 16,
        survivor_count: 4,
        max_generations: 8,
        seed: Some(11),
        oracle: OracleConfig {
            batch_size: 8,
            parallelism: 2,
            retries,
            initial_backoff_ms: 1,
            ..OracleConfig::default()
        },
        ..SearchConfig::default()
    }
}

#[tokio::test]
async fn half_batch_timeouts_are_retried_and_survivors_ranked() {
    init_tracing();
    let predictor = Arc::new(HalfTimeout::default());
    let explainer =
        CounterfactualExplainer::new(predictor.clone(), half_timeout_config(1)).unwrap();
    let original = applicant(20.0, "unemployed");
    let request = approval_request(original.clone(), Domain::Unconstrained);
    let domains = request.domains.clone();
    let outcome = explainer.explain(request).await.unwrap();

    assert!(outcome.found());
    assert!(matches!(
        outcome.status,
        SearchStatus::Converged | SearchStatus::BudgetExhausted
    ));
    assert_results_valid(&outcome, &domains, &original);

    let attempts = predictor.attempts.lock().unwrap();
    // Timed-out rows are sent exactly once more; answered rows never again.
    assert!(attempts.values().any(|&n| n == 2));
    assert!(attempts.values().all(|&n| n <= 2));
    assert!(predictor.calls.load(Ordering::SeqCst) < attempts.len());
}

#[tokio::test]
async fn half_batch_timeouts_without_retries_still_rank_the_rest() {
    let predictor = Arc::new(HalfTimeout::default());
    let explainer =
        CounterfactualExplainer::new(predictor.clone(), half_timeout_config(0)).unwrap();
    let original = applicant(20.0, "unemployed");
    let request = approval_request(original.clone(), Domain::Unconstrained);
    let domains = request.domains.clone();
    let outcome = explainer.explain(request).await.unwrap();

    assert!(outcome.found());
    assert_results_valid(&outcome, &domains, &original);
    let attempts = predictor.attempts.lock().unwrap();
    assert!(predictor.calls.load(Ordering::SeqCst) < attempts.len());
}

#[tokio::test]
async fn failing_goal_criterion_is_contained() {
    let criterion = FnCriterion::new("panics on approval", |output: &Output| {
        match output.get("predicted_approval").map(|v| &v.value) {
            Some(TypedValue::Boolean(true)) => panic!("criterion bug"),
            _ => Ok(GoalScore::unsatisfied(1.0)),
        }
    });
    let config = SearchConfig {
        max_generations: 5,
        seed: Some(1),
        ..SearchConfig::default()
    };
    let request = approval_request(applicant(20.0, "unemployed"), Domain::Unconstrained)
        .with_criterion(Arc::new(criterion));
    let outcome = explainer(config).explain(request).await.unwrap();
    assert_eq!(outcome.status, SearchStatus::NoResultFound);
}

#[tokio::test]
async fn numeric_goal_on_sum_model_is_reached() {
    let features = (1..=5)
        .map(|i| Feature::numeric(format!("f-num{i}"), 10.0).unwrap())
        .collect();
    let mut request = ExplainRequest::new(Instance::new(features).unwrap()).with_goal(vec![
        TargetOutput::new("sum-but5", TypedValue::Numeric(1000.0)).with_tolerance(1.0),
    ]);
    for i in 1..=5 {
        request = request.with_domain(format!("f-num{i}"), Domain::bounded(0.0, 1000.0).unwrap());
    }
    let config = SearchConfig {
        max_generations: 500,
        mutation_scale: 0.05,
        seed: Some(8),
        ..SearchConfig::default()
    };
    let explainer = CounterfactualExplainer::new(Arc::new(SumSkipModel::new(5)), config).unwrap();
    let outcome = explainer.explain(request).await.unwrap();

    let best = outcome.best().expect("a counterfactual");
    let total: f64 = best.instance.values().filter_map(TypedValue::as_f64).sum();
    assert!((999.0..=1001.0).contains(&total), "sum {total}");
    assert_eq!(best.output.get("sum-but5").map(|o| o.value.clone()), Some(TypedValue::Numeric(total)));
}
