//! Propensity score estimation
//!
//! Covariates of both arms are stacked into one design matrix, standardized
//! with statistics of the combined population, and fed to an L2-penalised
//! logistic regression. Every subject is then scored in-sample: the goal is
//! covariate balance, not out-of-sample prediction.

use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array};
use arrow::datatypes::DataType;
use arrow::record_batch::RecordBatch;
use arrow_schema::Field;
use faer::linalg::solvers::{Ldlt, Llt, Solve};
use faer::{Mat, Side};
use log::{debug, info, warn};
use ndarray::{Array1, Array2, ArrayView1, Axis, s};
use serde::Serialize;

use crate::algorithm::matching::preparation::PreparedCohorts;
use crate::algorithm::matching::types::{
    Arm, CovariateSchema, Diagnostic, LOGIT_PROPENSITY, PROPENSITY, ScoredSubject,
};
use crate::config::MatchingConfig;
use crate::error::{PsmError, Result};
use crate::utils::arrow::{float_values, person_ids, with_column};

/// Propensities are clipped into this range before the logit transform
pub const PROPENSITY_CLIP: (f64, f64) = (0.001, 0.999);

/// Shortest Newton step tried by the line search before giving up
const MIN_STEP: f64 = 1e-10;

/// Sufficient decrease constant of the Armijo condition
const ARMIJO: f64 = 1e-4;

/// Logit of `p` after clipping it into [`PROPENSITY_CLIP`]
#[must_use]
pub fn logit_clipped(p: f64) -> f64 {
    let p = p.clamp(PROPENSITY_CLIP.0, PROPENSITY_CLIP.1);
    (p / (1.0 - p)).ln()
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// log(1 + exp(z)) without overflow
fn softplus(z: f64) -> f64 {
    if z > 0.0 {
        z + (-z).exp().ln_1p()
    } else {
        z.exp().ln_1p()
    }
}

/// Column means and scales of the combined covariate matrix
///
/// Scales are population standard deviations; a constant column gets a
/// scale of 1 so it standardizes to all zeros.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Standardization {
    means: Vec<f64>,
    scales: Vec<f64>,
}

impl Standardization {
    /// Fit column statistics
    #[must_use]
    pub fn fit(x: &Array2<f64>) -> Self {
        let means = x
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(x.ncols()));
        let scales = if x.nrows() == 0 {
            Array1::ones(x.ncols())
        } else {
            x.std_axis(Axis(0), 0.0)
                .mapv(|std| if std > 0.0 { std } else { 1.0 })
        };

        Self {
            means: means.to_vec(),
            scales: scales.to_vec(),
        }
    }

    /// Standardize a matrix with the fitted statistics
    #[must_use]
    pub fn transform(&self, x: &Array2<f64>) -> Array2<f64> {
        let means = ArrayView1::from(self.means.as_slice());
        let scales = ArrayView1::from(self.scales.as_slice());
        (x - &means) / &scales
    }

    /// Column means
    #[must_use]
    pub fn means(&self) -> &[f64] {
        &self.means
    }

    /// Column scales
    #[must_use]
    pub fn scales(&self) -> &[f64] {
        &self.scales
    }
}

/// Fitted logistic regression coefficients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogisticFit {
    /// Unpenalised intercept
    pub intercept: f64,
    /// Slope per standardized covariate
    pub coefficients: Vec<f64>,
    /// Newton iterations performed
    pub iterations: usize,
    /// Whether the fit reached the stopping rule before the iteration cap
    pub converged: bool,
    /// Max-norm of the mean-scale gradient at the returned estimate
    pub gradient_norm: f64,
}

impl LogisticFit {
    /// Linear predictor for every row
    #[must_use]
    pub fn decision_function(&self, x: &Array2<f64>) -> Array1<f64> {
        let coefficients = Array1::from(self.coefficients.clone());
        x.dot(&coefficients) + self.intercept
    }

    /// Probability of the positive class for every row
    #[must_use]
    pub fn predict_proba(&self, x: &Array2<f64>) -> Array1<f64> {
        self.decision_function(x).mapv(sigmoid)
    }
}

/// Binary logistic regression with an L2 penalty on the slopes
///
/// Minimises `C * sum(logloss) + 0.5 * |w|^2` by damped Newton steps. The
/// objective is carried divided by `C * n` (mean log-loss plus
/// `|w|^2 / (2Cn)`), which has the same minimiser and keeps the gradient
/// tolerance meaningful at any cohort size.
///
/// The fit stops when the max-norm of that gradient is within the
/// tolerance, or when no step along the Newton direction lowers the
/// objective any more: the estimate is then optimal to machine precision.
/// Hitting `max_iter` first returns the current estimate with
/// `converged == false`.
#[derive(Debug, Clone, Copy)]
pub struct LogisticRegression {
    max_iter: usize,
    tolerance: f64,
    inverse_regularization: f64,
}

impl LogisticRegression {
    /// Create a solver
    #[must_use]
    pub const fn new(max_iter: usize, tolerance: f64, inverse_regularization: f64) -> Self {
        Self {
            max_iter,
            tolerance,
            inverse_regularization,
        }
    }

    /// Create a solver from matching configuration
    #[must_use]
    pub const fn from_config(config: &MatchingConfig) -> Self {
        Self::new(
            config.max_iter,
            config.tolerance,
            config.inverse_regularization,
        )
    }

    /// Fit `y ~ x`; `y` holds 0/1 labels
    #[must_use]
    pub fn fit(&self, x: &Array2<f64>, y: &Array1<f64>) -> LogisticFit {
        let (n, p) = x.dim();
        let rows = n.max(1) as f64;

        let mut design = Array2::<f64>::ones((n, p + 1));
        design.slice_mut(s![.., 1..]).assign(x);

        // Ridge weight per coefficient on the mean scale; the intercept is free
        let mut penalty =
            Array1::<f64>::from_elem(p + 1, 1.0 / (self.inverse_regularization * rows));
        penalty[0] = 0.0;

        let mut beta = Array1::<f64>::zeros(p + 1);
        let mut objective = penalised_loss(&design, y, &beta, &penalty);
        let mut iterations = 0;
        let mut converged = false;

        let gradient_norm = loop {
            let mu = design.dot(&beta).mapv(sigmoid);
            let gradient = design.t().dot(&(&mu - y)) / rows + &penalty * &beta;
            let norm = gradient.iter().fold(0.0_f64, |acc, g| acc.max(g.abs()));

            if norm <= self.tolerance {
                converged = true;
                break norm;
            }
            if iterations >= self.max_iter {
                break norm;
            }

            let weights = mu.mapv(|m| m * (1.0 - m) / rows);
            let weighted = &design * &weights.view().insert_axis(Axis(1));
            let mut hessian = design.t().dot(&weighted);
            hessian.diag_mut().zip_mut_with(&penalty, |h, w| *h += w);

            let direction = newton_direction(&hessian, &gradient).unwrap_or_else(|| {
                debug!("Hessian is not factorable; taking a gradient step");
                gradient.clone()
            });
            let slope = gradient.dot(&direction);

            let mut step = 1.0;
            let mut accepted = false;
            while step > MIN_STEP {
                let candidate = &beta - &(&direction * step);
                let value = penalised_loss(&design, y, &candidate, &penalty);
                if value < objective && value <= objective - ARMIJO * step * slope {
                    beta = candidate;
                    objective = value;
                    accepted = true;
                    break;
                }
                step *= 0.5;
            }

            iterations += 1;
            if !accepted {
                debug!(
                    "Objective stalled at {objective:.12e} after {iterations} iterations \
                     (gradient max-norm {norm:.3e})"
                );
                converged = true;
                break norm;
            }
        };

        LogisticFit {
            intercept: beta[0],
            coefficients: beta.slice(s![1..]).to_vec(),
            iterations,
            converged,
            gradient_norm,
        }
    }
}

/// Mean log-loss plus the scaled ridge term
fn penalised_loss(
    design: &Array2<f64>,
    y: &Array1<f64>,
    beta: &Array1<f64>,
    penalty: &Array1<f64>,
) -> f64 {
    let eta = design.dot(beta);
    let loss: f64 = eta
        .iter()
        .zip(y.iter())
        .map(|(&z, &label)| softplus(z) - label * z)
        .sum();
    let ridge: f64 = beta
        .iter()
        .zip(penalty.iter())
        .map(|(&b, &w)| w * b * b)
        .sum();
    loss / y.len().max(1) as f64 + 0.5 * ridge
}

/// Solve `hessian * d = gradient` for the Newton direction
///
/// Cholesky first; a Hessian that is only semi-definite in floating point
/// falls back to LDLT. `None` if neither factorization succeeds.
fn newton_direction(hessian: &Array2<f64>, gradient: &Array1<f64>) -> Option<Array1<f64>> {
    let k = hessian.nrows();
    let h = Mat::from_fn(k, k, |i, j| hessian[[i, j]]);
    let rhs = Mat::from_fn(k, 1, |i, _| gradient[i]);

    let solution = if let Ok(llt) = Llt::new(h.as_ref(), Side::Lower) {
        llt.solve(rhs.as_ref())
    } else {
        Ldlt::new(h.as_ref(), Side::Lower).ok()?.solve(rhs.as_ref())
    };

    let direction = Array1::from_shape_fn(k, |i| solution[(i, 0)]);
    direction.iter().all(|d| d.is_finite()).then_some(direction)
}

/// The fitted pieces of a propensity model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropensityModel {
    /// Standardization applied before fitting
    pub standardization: Standardization,
    /// Logistic regression on the standardized covariates
    pub fit: LogisticFit,
}

/// Treated and control tables augmented with propensity columns
#[derive(Debug, Clone)]
pub struct PropensityScores {
    /// Treated rows with `propensity` and `logit_propensity`
    pub treated: RecordBatch,
    /// Control rows with `propensity` and `logit_propensity`
    pub control: RecordBatch,
    /// `None` when the control pool was empty and no model could be fit
    pub model: Option<PropensityModel>,
    /// Convergence findings
    pub diagnostics: Vec<Diagnostic>,
}

impl PropensityScores {
    /// The scored table of one arm
    #[must_use]
    pub const fn arm(&self, arm: Arm) -> &RecordBatch {
        match arm {
            Arm::Treated => &self.treated,
            Arm::Control => &self.control,
        }
    }

    /// `person_id` and logit propensity of every row of one arm, in table order
    pub fn subjects(&self, arm: Arm) -> Result<Vec<ScoredSubject>> {
        let batch = self.arm(arm);
        let ids = person_ids(batch, arm.label())?;
        let logits = self.column(arm, LOGIT_PROPENSITY)?;
        Ok(ids
            .into_iter()
            .zip(logits)
            .map(|(id, logit)| ScoredSubject::new(id, logit))
            .collect())
    }

    /// Values of a propensity column of one arm
    pub fn column(&self, arm: Arm, name: &str) -> Result<Vec<f64>> {
        let batch = self.arm(arm);
        let column = batch.column_by_name(name).ok_or_else(|| {
            PsmError::InvalidInput(format!("{} table has no {name} column", arm.label()))
        })?;
        Ok(float_values(column)?
            .into_iter()
            .map(|v| v.unwrap_or(f64::NAN))
            .collect())
    }
}

/// Estimate propensity scores for both arms of prepared cohorts
///
/// # Errors
/// Returns `EmptyInputError` if the treated arm is empty. An empty control
/// arm is not an error: a one-class model puts every treated subject at
/// propensity 1.
pub fn estimate_propensity(
    prepared: &PreparedCohorts,
    config: &MatchingConfig,
) -> Result<PropensityScores> {
    let n_treated = prepared.treated.num_rows();
    let n_control = prepared.control.num_rows();

    if n_treated == 0 {
        return Err(PsmError::EmptyInputError(
            "Cannot fit a propensity model without treated subjects".to_string(),
        ));
    }

    if n_control == 0 {
        warn!("Control pool is empty; scoring treated subjects with a one-class model");
        let treated = attach_scores(&prepared.treated, &vec![1.0; n_treated])?;
        let control = attach_scores(&prepared.control, &[])?;
        return Ok(PropensityScores {
            treated,
            control,
            model: None,
            diagnostics: Vec::new(),
        });
    }

    let x = covariate_matrix(prepared)?;
    let y = Array1::from_iter(
        std::iter::repeat_n(1.0, n_treated).chain(std::iter::repeat_n(0.0, n_control)),
    );

    let standardization = Standardization::fit(&x);
    let x_scaled = standardization.transform(&x);
    let fit = LogisticRegression::from_config(config).fit(&x_scaled, &y);

    let mut diagnostics = Vec::new();
    if fit.converged {
        info!("Propensity model converged after {} iterations", fit.iterations);
    } else {
        let diagnostic = Diagnostic::ConvergenceWarning {
            iterations: fit.iterations,
            gradient_norm: fit.gradient_norm,
        };
        warn!("{diagnostic}");
        diagnostics.push(diagnostic);
    }

    let propensity = fit.predict_proba(&x_scaled).to_vec();
    let (treated_ps, control_ps) = propensity.split_at(n_treated);
    log_range(Arm::Treated, treated_ps);
    log_range(Arm::Control, control_ps);

    Ok(PropensityScores {
        treated: attach_scores(&prepared.treated, treated_ps)?,
        control: attach_scores(&prepared.control, control_ps)?,
        model: Some(PropensityModel {
            standardization,
            fit,
        }),
        diagnostics,
    })
}

/// Stack the covariates of both arms, treated rows first
fn covariate_matrix(prepared: &PreparedCohorts) -> Result<Array2<f64>> {
    let rows = prepared.treated.num_rows() + prepared.control.num_rows();
    let mut x = Array2::<f64>::zeros((rows, prepared.schema.len()));

    let mut offset = 0;
    for arm in [Arm::Treated, Arm::Control] {
        let batch = prepared.arm(arm);
        fill_rows(&mut x, offset, batch, &prepared.schema, arm)?;
        offset += batch.num_rows();
    }

    Ok(x)
}

fn fill_rows(
    x: &mut Array2<f64>,
    offset: usize,
    batch: &RecordBatch,
    schema: &CovariateSchema,
    arm: Arm,
) -> Result<()> {
    for (j, feature) in schema.iter().enumerate() {
        let column = batch.column_by_name(feature).ok_or_else(|| {
            PsmError::InvalidInput(format!(
                "Prepared {} table lacks covariate {feature}",
                arm.label()
            ))
        })?;
        for (i, value) in float_values(column)?.into_iter().enumerate() {
            x[[offset + i, j]] = value.ok_or_else(|| {
                PsmError::InvalidInput(format!(
                    "Prepared {} table has a missing value in {feature}",
                    arm.label()
                ))
            })?;
        }
    }
    Ok(())
}

fn attach_scores(batch: &RecordBatch, propensity: &[f64]) -> Result<RecordBatch> {
    let logits: Vec<f64> = propensity.iter().map(|&p| logit_clipped(p)).collect();

    let with_ps = with_column(
        batch,
        Field::new(PROPENSITY, DataType::Float64, false),
        Arc::new(Float64Array::from(propensity.to_vec())) as ArrayRef,
    )?;
    with_column(
        &with_ps,
        Field::new(LOGIT_PROPENSITY, DataType::Float64, false),
        Arc::new(Float64Array::from(logits)) as ArrayRef,
    )
}

fn log_range(arm: Arm, propensity: &[f64]) {
    if propensity.is_empty() {
        return;
    }
    let min = propensity.iter().copied().fold(f64::INFINITY, f64::min);
    let max = propensity.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    info!(
        "Propensity score range ({}): {min:.3} to {max:.3}",
        arm.label()
    );
}
