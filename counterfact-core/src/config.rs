//! Configuration for counterfactual searches.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! explicit config file -> environment -> explicit overrides. Every search
//! receives its own [`SearchConfig`]; there are no process-wide defaults.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Options of one counterfactual search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Number of candidates per generation (`P`).
    #[serde(default = "default_population_size")]
    pub population_size: usize,
    /// Candidates kept after selection (`K < P`).
    #[serde(default = "default_survivor_count")]
    pub survivor_count: usize,
    /// Generations to run after the seed population.
    #[serde(default = "default_max_generations")]
    pub max_generations: usize,
    /// Wall-clock budget in milliseconds.
    #[serde(default = "default_max_wall_clock_ms")]
    pub max_wall_clock_ms: u64,
    /// Optional limit on the number of oracle evaluations.
    #[serde(default)]
    pub max_evaluations: Option<usize>,
    /// Generations without improvement before declaring convergence.
    #[serde(default = "default_plateau_generations")]
    pub plateau_generations: usize,
    /// Per-feature probability of mutating a child.
    #[serde(default = "default_mutation_probability")]
    pub mutation_probability: f64,
    /// Gaussian mutation width as a fraction of the feature scale.
    #[serde(default = "default_mutation_scale")]
    pub mutation_scale: f64,
    /// Probability that a child is produced by crossover rather than cloning.
    #[serde(default = "default_crossover_rate")]
    pub crossover_rate: f64,
    /// Weight of the distance from the original in fitness (lambda).
    #[serde(default = "default_distance_weight")]
    pub distance_weight: f64,
    /// Weight of the number of changed features in fitness (mu).
    #[serde(default = "default_sparsity_weight")]
    pub sparsity_weight: f64,
    /// Fitness penalty added to domain-violating candidates.
    #[serde(default = "default_invalid_penalty")]
    pub invalid_penalty: f64,
    /// Number of counterfactuals to report.
    #[serde(default = "default_result_count")]
    pub result_count: usize,
    /// Random seed; `None` draws one from the OS.
    #[serde(default)]
    pub seed: Option<u64>,
    /// Prediction oracle settings.
    #[serde(default)]
    pub oracle: OracleConfig,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            population_size: default_population_size(),
            survivor_count: default_survivor_count(),
            max_generations: default_max_generations(),
            max_wall_clock_ms: default_max_wall_clock_ms(),
            max_evaluations: None,
            plateau_generations: default_plateau_generations(),
            mutation_probability: default_mutation_probability(),
            mutation_scale: default_mutation_scale(),
            crossover_rate: default_crossover_rate(),
            distance_weight: default_distance_weight(),
            sparsity_weight: default_sparsity_weight(),
            invalid_penalty: default_invalid_penalty(),
            result_count: default_result_count(),
            seed: None,
            oracle: OracleConfig::default(),
        }
    }
}

fn default_population_size() -> usize {
    40
}

fn default_survivor_count() -> usize {
    10
}

fn default_max_generations() -> usize {
    100
}

fn default_max_wall_clock_ms() -> u64 {
    60_000
}

fn default_plateau_generations() -> usize {
    10
}

fn default_mutation_probability() -> f64 {
    0.3
}

fn default_mutation_scale() -> f64 {
    0.1
}

fn default_crossover_rate() -> f64 {
    0.7
}

fn default_distance_weight() -> f64 {
    0.1
}

fn default_sparsity_weight() -> f64 {
    0.01
}

fn default_invalid_penalty() -> f64 {
    1_000.0
}

fn default_result_count() -> usize {
    1
}

impl SearchConfig {
    /// A config with a fixed seed.
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }

    pub fn max_wall_clock(&self) -> Duration {
        Duration::from_millis(self.max_wall_clock_ms)
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.population_size == 0 {
            return Err(ConfigError::invalid("population_size must be at least 1"));
        }
        if self.survivor_count == 0 {
            return Err(ConfigError::invalid("survivor_count must be at least 1"));
        }
        if self.survivor_count >= self.population_size {
            return Err(ConfigError::invalid(format!(
                "survivor_count ({}) must be smaller than population_size ({})",
                self.survivor_count, self.population_size
            )));
        }
        if self.result_count == 0 {
            return Err(ConfigError::invalid("result_count must be at least 1"));
        }
        for (name, value) in [
            ("mutation_probability", self.mutation_probability),
            ("crossover_rate", self.crossover_rate),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::invalid(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        for (name, value) in [
            ("distance_weight", self.distance_weight),
            ("sparsity_weight", self.sparsity_weight),
            ("invalid_penalty", self.invalid_penalty),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::invalid(format!(
                    "{name} must be a non-negative number, got {value}"
                )));
            }
        }
        if !self.mutation_scale.is_finite() || self.mutation_scale <= 0.0 {
            return Err(ConfigError::invalid(format!(
                "mutation_scale must be positive, got {}",
                self.mutation_scale
            )));
        }
        self.oracle.validate()
    }
}

/// Batching, timeout and retry settings of the prediction oracle adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleConfig {
    /// Maximum instances per predictor call.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum predictor calls in flight.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Per-call timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retries for failed instances before they are finally marked failed.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Initial backoff between retries.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Backoff multiplier per retry.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Upper bound on the backoff.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            parallelism: default_parallelism(),
            timeout_ms: default_timeout_ms(),
            retries: default_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_batch_size() -> usize {
    32
}

fn default_parallelism() -> usize {
    4
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_retries() -> u32 {
    1
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    5_000
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::invalid("oracle.batch_size must be at least 1"));
        }
        if self.parallelism == 0 {
            return Err(ConfigError::invalid("oracle.parallelism must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("oracle.timeout_ms must be positive"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(format!(
                "oracle.backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        Ok(())
    }
}

/// Load configuration from layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `COUNTERFACT_`, `__` for nesting)
/// 3. Explicit config file
/// 4. User config (`~/.config/counterfact/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    path: Option<&Path>,
    overrides: Option<&SearchConfig>,
) -> Result<SearchConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(SearchConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::ParseError {
                message: format!("config file not found: {}", path.display()),
            });
        }
        figment = figment.merge(Toml::file(path));
    }

    // COUNTERFACT_POPULATION_SIZE, COUNTERFACT_ORACLE__BATCH_SIZE, ...
    figment = figment.merge(Env::prefixed("COUNTERFACT_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    let config: SearchConfig = figment.extract().map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    config.validate()?;
    Ok(config)
}

/// Write `config` as TOML to `path`, creating parent directories.
pub fn save_config(path: &Path, config: &SearchConfig) -> crate::error::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config).map_err(|e| ConfigError::ParseError {
        message: e.to_string(),
    })?;
    std::fs::write(path, content)?;
    Ok(())
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "counterfact", "counterfact")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
