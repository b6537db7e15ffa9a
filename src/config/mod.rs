//! Configuration for matching runs.
//!
//! A study configuration is a JSON document shared with the upstream cohort
//! extraction steps; keys this crate does not know about are ignored.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PsmError, Result};

/// Default multiplier applied to the pooled SD of the logit propensity
pub const DEFAULT_CALIPER_MULTIPLIER: f64 = 0.2;

/// Default cap on logistic regression iterations
pub const DEFAULT_MAX_ITER: usize = 1000;

/// Default SMD above which a covariate counts as imbalanced
pub const DEFAULT_IMBALANCE_THRESHOLD: f64 = 0.1;

/// Order in which treated subjects are offered to the matcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreatedOrder {
    /// Table order as read
    #[default]
    Input,
    /// Ascending `person_id`, independent of upstream row order
    PersonId,
}

/// Algorithm parameters for the matching pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    /// Caliper = multiplier * SD of pooled logit propensity
    pub caliper_multiplier: f64,

    /// Maximum Newton iterations for the propensity model
    pub max_iter: usize,

    /// Stop once the max-norm of the per-row gradient falls below this
    pub tolerance: f64,

    /// Inverse L2 penalty strength on the slope coefficients
    pub inverse_regularization: f64,

    /// Order in which treated subjects claim controls
    pub treated_order: TreatedOrder,

    /// SMD above which a covariate is reported as imbalanced
    pub imbalance_threshold: f64,

    /// Draw a progress bar during the matching pass
    pub show_progress: bool,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            caliper_multiplier: DEFAULT_CALIPER_MULTIPLIER,
            max_iter: DEFAULT_MAX_ITER,
            tolerance: 1e-4,
            inverse_regularization: 1.0,
            treated_order: TreatedOrder::Input,
            imbalance_threshold: DEFAULT_IMBALANCE_THRESHOLD,
            show_progress: true,
        }
    }
}

impl MatchingConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new builder for constructing matching configuration
    #[must_use]
    pub fn builder() -> MatchingConfigBuilder {
        MatchingConfigBuilder::new()
    }

    /// Check that every parameter is usable
    pub fn validate(&self) -> Result<()> {
        if !self.caliper_multiplier.is_finite() || self.caliper_multiplier < 0.0 {
            return Err(PsmError::ConfigurationError(format!(
                "caliper_multiplier must be a non-negative number, got {}",
                self.caliper_multiplier
            )));
        }
        if self.max_iter == 0 {
            return Err(PsmError::ConfigurationError(
                "max_iter must be at least 1".to_string(),
            ));
        }
        if !(self.tolerance > 0.0) {
            return Err(PsmError::ConfigurationError(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if !(self.inverse_regularization > 0.0) || !self.inverse_regularization.is_finite() {
            return Err(PsmError::ConfigurationError(format!(
                "inverse_regularization must be a positive number, got {}",
                self.inverse_regularization
            )));
        }
        if !(self.imbalance_threshold >= 0.0) {
            return Err(PsmError::ConfigurationError(format!(
                "imbalance_threshold must be non-negative, got {}",
                self.imbalance_threshold
            )));
        }
        Ok(())
    }
}

/// Builder for constructing matching configuration
#[derive(Debug, Clone)]
pub struct MatchingConfigBuilder {
    config: MatchingConfig,
}

impl Default for MatchingConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MatchingConfigBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: MatchingConfig::default(),
        }
    }

    /// Set the caliper multiplier
    #[must_use]
    pub const fn caliper_multiplier(mut self, multiplier: f64) -> Self {
        self.config.caliper_multiplier = multiplier;
        self
    }

    /// Set the iteration cap of the propensity model
    #[must_use]
    pub const fn max_iter(mut self, max_iter: usize) -> Self {
        self.config.max_iter = max_iter;
        self
    }

    /// Set the convergence tolerance of the propensity model
    #[must_use]
    pub const fn tolerance(mut self, tolerance: f64) -> Self {
        self.config.tolerance = tolerance;
        self
    }

    /// Set the inverse regularization strength
    #[must_use]
    pub const fn inverse_regularization(mut self, c: f64) -> Self {
        self.config.inverse_regularization = c;
        self
    }

    /// Set the order in which treated subjects are matched
    #[must_use]
    pub const fn treated_order(mut self, order: TreatedOrder) -> Self {
        self.config.treated_order = order;
        self
    }

    /// Set the imbalance threshold
    #[must_use]
    pub const fn imbalance_threshold(mut self, threshold: f64) -> Self {
        self.config.imbalance_threshold = threshold;
        self
    }

    /// Set whether a progress bar is drawn
    #[must_use]
    pub const fn show_progress(mut self, show: bool) -> Self {
        self.config.show_progress = show;
        self
    }

    /// Build the matching configuration
    #[must_use]
    pub fn build(self) -> MatchingConfig {
        self.config
    }
}

/// Configuration of one study cohort run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StudyConfig {
    /// Name used to namespace input and output files
    pub cohort_name: String,

    /// Root directory for cohort inputs and matching outputs
    pub output_dir: PathBuf,

    /// Ordered covariate names to match on
    pub matching_features: Vec<String>,

    /// Treated (user) table; defaults to the upstream covariate hand-off file
    #[serde(default)]
    pub users_path: Option<PathBuf>,

    /// Control (non-user) table; defaults to the upstream covariate hand-off file
    #[serde(default)]
    pub nonusers_path: Option<PathBuf>,

    /// Matching algorithm parameters
    #[serde(default)]
    pub matching: MatchingConfig,
}

impl StudyConfig {
    /// Load and validate a study configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| PsmError::io(path, e))?;
        Self::from_json_str(&content)
    }

    /// Parse and validate a study configuration from JSON text
    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(content)
            .map_err(|e| PsmError::ConfigurationError(format!("Invalid study config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check required keys and matching parameters
    pub fn validate(&self) -> Result<()> {
        if self.cohort_name.trim().is_empty() {
            return Err(PsmError::ConfigurationError(
                "cohort_name must not be empty".to_string(),
            ));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(PsmError::ConfigurationError(
                "output_dir must not be empty".to_string(),
            ));
        }
        self.matching.validate()
    }

    /// Path of the treated input table
    #[must_use]
    pub fn users_path(&self) -> PathBuf {
        self.users_path.clone().unwrap_or_else(|| {
            self.cohorts_dir()
                .join(format!("{}_users_with_covariates.csv", self.cohort_name))
        })
    }

    /// Path of the control input table
    #[must_use]
    pub fn nonusers_path(&self) -> PathBuf {
        self.nonusers_path.clone().unwrap_or_else(|| {
            self.cohorts_dir()
                .join(format!("{}_nonusers_with_covariates.csv", self.cohort_name))
        })
    }

    /// Directory the matching artifacts are written to
    #[must_use]
    pub fn matched_pairs_dir(&self) -> PathBuf {
        self.output_dir.join("matched_pairs")
    }

    fn cohorts_dir(&self) -> PathBuf {
        self.output_dir.join("cohorts")
    }
}
