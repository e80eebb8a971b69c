//! Regression with ARIMA(p, d, q) errors, d ∈ {0, 1}, fitted by exact Gaussian
//! maximum likelihood.
//!
//! The model is `y_t = x_t β + u_t` where `u_t` follows ARIMA(p, d, q). With
//! d = 1 both sides are differenced, so the coefficient on a unit-step time
//! index plays the role of the drift and no constant column is fitted; with
//! d = 0 a constant is added. The ARMA part is cast in state-space form and
//! run through a Kalman filter. β and σ² are profiled out by GLS on the
//! filtered innovations, leaving only the AR and MA terms to the simplex
//! search. Standard errors come from the numerical Hessian of the full
//! likelihood at the optimum.

use faer::Mat;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::ArimaOrder;
use crate::error::{AnalysisError, Result};
use crate::linalg;
use crate::models::{Coefficient, FitStatus, Forecast};
use crate::optimize::{nelder_mead, numerical_hessian};
use crate::stats::{self, LjungBox};

const LN_2PI: f64 = 1.8378770664093453;

#[derive(Debug, Clone)]
pub struct ArimaOptions {
    pub order: ArimaOrder,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub ljung_box_lags: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArimaFit {
    pub order: ArimaOrder,
    pub exog_names: Vec<String>,
    pub coefficients: Vec<Coefficient>,
    pub beta: Vec<f64>,
    pub ar: Vec<f64>,
    pub ma: Vec<f64>,
    pub sigma2: f64,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    pub nobs: usize,
    /// Mean of `y − Xβ`; the level the differenced model leaves unidentified.
    pub level_offset: f64,
    /// One-step-ahead innovations, one per differenced observation.
    pub residuals: Vec<f64>,
    /// One-step-ahead predictions in levels, aligned with the input series.
    pub fitted: Vec<f64>,
    pub fitted_se: Vec<f64>,
    pub ljung_box: Option<LjungBox>,
    pub status: FitStatus,
}

/// ARMA(p, q) in Harvey's state-space form with unit innovation variance.
struct ArmaStateSpace {
    dim: usize,
    transition: Mat<f64>,
    selection: Vec<f64>,
    initial_cov: Mat<f64>,
}

struct Filtered {
    innovations: Vec<Vec<f64>>,
    variances: Vec<f64>,
    final_states: Vec<Vec<f64>>,
}

impl ArmaStateSpace {
    fn new(ar: &[f64], ma: &[f64]) -> Option<Self> {
        let dim = ar.len().max(ma.len() + 1);
        let transition = Mat::from_fn(dim, dim, |i, j| {
            if j == 0 {
                ar.get(i).copied().unwrap_or(0.0)
            } else if j == i + 1 {
                1.0
            } else {
                0.0
            }
        });
        let selection: Vec<f64> = (0..dim)
            .map(|i| {
                if i == 0 {
                    1.0
                } else {
                    ma.get(i - 1).copied().unwrap_or(0.0)
                }
            })
            .collect();

        // Stationary covariance: P = T P Tᵀ + R Rᵀ, solved through vec(P).
        let n = dim * dim;
        let system = Mat::from_fn(n, n, |row, col| {
            let (i, j) = (row / dim, row % dim);
            let (k, l) = (col / dim, col % dim);
            let identity = if row == col { 1.0 } else { 0.0 };
            identity - transition[(i, k)] * transition[(j, l)]
        });
        let rhs: Vec<f64> = (0..n)
            .map(|idx| selection[idx / dim] * selection[idx % dim])
            .collect();
        let vec_p = linalg::mat_vec(&linalg::inverse(&system)?, &rhs);
        let initial_cov = Mat::from_fn(dim, dim, |i, j| {
            0.5 * (vec_p[i * dim + j] + vec_p[j * dim + i])
        });
        if !(initial_cov[(0, 0)] > 0.0) {
            return None;
        }

        Some(Self {
            dim,
            transition,
            selection,
            initial_cov,
        })
    }

    /// Runs the filter once for several series that share the same dynamics.
    fn filter(&self, columns: &[&[f64]]) -> Option<Filtered> {
        let m = columns.first().map_or(0, |c| c.len());
        let dim = self.dim;
        let mut states = vec![vec![0.0; dim]; columns.len()];
        let mut innovations = vec![Vec::with_capacity(m); columns.len()];
        let mut variances = Vec::with_capacity(m);
        let mut cov = self.initial_cov.clone();

        for t in 0..m {
            let f = cov[(0, 0)];
            if !(f > 0.0) || !f.is_finite() {
                return None;
            }
            let cov_col: Vec<f64> = (0..dim).map(|i| cov[(i, 0)]).collect();
            let gain: Vec<f64> = linalg::mat_vec(&self.transition, &cov_col)
                .into_iter()
                .map(|v| v / f)
                .collect();

            for (c, column) in columns.iter().enumerate() {
                let v = column[t] - states[c][0];
                innovations[c].push(v);
                let mut next = linalg::mat_vec(&self.transition, &states[c]);
                for (s, k) in next.iter_mut().zip(&gain) {
                    *s += k * v;
                }
                states[c] = next;
            }
            variances.push(f);

            let propagated = &self.transition * &cov * self.transition.transpose();
            cov = Mat::from_fn(dim, dim, |i, j| {
                propagated[(i, j)] + self.selection[i] * self.selection[j]
                    - gain[i] * f * gain[j]
            });
        }

        Some(Filtered {
            innovations,
            variances,
            final_states: states,
        })
    }

    /// Point forecasts of the ARMA component `h = 1..=horizon` steps past the filter end.
    fn forecast(&self, state: &[f64], horizon: usize) -> Vec<f64> {
        let mut current = state.to_vec();
        let mut out = Vec::with_capacity(horizon);
        for _ in 0..horizon {
            out.push(current[0]);
            current = linalg::mat_vec(&self.transition, &current);
        }
        out
    }
}

/// MA(∞) weights ψ₀..ψ_{n-1} of the ARMA part.
fn psi_weights(ar: &[f64], ma: &[f64], n: usize) -> Vec<f64> {
    let mut psi = vec![0.0; n];
    for j in 0..n {
        let mut value = if j == 0 {
            1.0
        } else {
            ma.get(j - 1).copied().unwrap_or(0.0)
        };
        for (i, phi) in ar.iter().enumerate() {
            if j > i {
                value += phi * psi[j - i - 1];
            }
        }
        psi[j] = value;
    }
    psi
}

/// Maps unconstrained reals to coefficients of a stationary AR polynomial
/// through partial autocorrelations (Monahan 1984).
pub fn constrain_stationary(unconstrained: &[f64]) -> Vec<f64> {
    let n = unconstrained.len();
    let partials: Vec<f64> = unconstrained
        .iter()
        .map(|u| u / (1.0 + u * u).sqrt())
        .collect();
    let mut coefs: Vec<f64> = Vec::with_capacity(n);
    for (k, &r) in partials.iter().enumerate() {
        let previous = coefs.clone();
        for i in 0..k {
            coefs[i] = previous[i] - r * previous[k - 1 - i];
        }
        coefs.push(r);
    }
    coefs
}

fn split_params(params: &[f64], order: ArimaOrder) -> (Vec<f64>, Vec<f64>) {
    let ar = constrain_stationary(&params[..order.p]);
    // An invertible MA polynomial is a stationary AR polynomial with flipped signs.
    let ma = constrain_stationary(&params[order.p..order.p + order.q])
        .into_iter()
        .map(|c| -c)
        .collect();
    (ar, ma)
}

/// Differenced (or untouched, for d = 0) response and design, with a constant when d = 0.
fn prepare(y: &[f64], exog: &Mat<f64>, d: usize) -> (Vec<f64>, Mat<f64>) {
    let n = y.len();
    if d == 0 {
        let design = Mat::from_fn(n, exog.ncols() + 1, |i, j| {
            if j == 0 {
                1.0
            } else {
                exog[(i, j - 1)]
            }
        });
        return (y.to_vec(), design);
    }
    let dy = (1..n).map(|t| y[t] - y[t - 1]).collect();
    let dx = Mat::from_fn(n - 1, exog.ncols(), |i, j| exog[(i + 1, j)] - exog[(i, j)]);
    (dy, dx)
}

fn columns_of(design: &Mat<f64>) -> Vec<Vec<f64>> {
    (0..design.ncols())
        .map(|j| (0..design.nrows()).map(|i| design[(i, j)]).collect())
        .collect()
}

struct Profile {
    beta: Vec<f64>,
    sigma2: f64,
    neg_loglik: f64,
}

/// GLS profile of β and σ² for fixed ARMA coefficients.
fn profile(z: &[f64], design_cols: &[Vec<f64>], ar: &[f64], ma: &[f64]) -> Option<Profile> {
    let space = ArmaStateSpace::new(ar, ma)?;
    let mut columns: Vec<&[f64]> = Vec::with_capacity(design_cols.len() + 1);
    columns.push(z);
    columns.extend(design_cols.iter().map(Vec::as_slice));
    let filtered = space.filter(&columns)?;

    let m = z.len();
    let k = design_cols.len();
    let scale: Vec<f64> = filtered.variances.iter().map(|f| f.sqrt()).collect();
    let ty: Vec<f64> = filtered.innovations[0]
        .iter()
        .zip(&scale)
        .map(|(v, s)| v / s)
        .collect();
    let tx = Mat::from_fn(m, k, |i, j| filtered.innovations[j + 1][i] / scale[i]);

    let beta = if k == 0 {
        Vec::new()
    } else {
        let xtx = linalg::weighted_gram(&tx, None);
        let xty: Vec<f64> = (0..k)
            .map(|j| (0..m).map(|i| tx[(i, j)] * ty[i]).sum())
            .collect();
        linalg::solve_spd(&xtx, &xty)?
    };

    let rss: f64 = (0..m)
        .map(|i| {
            let fit: f64 = (0..k).map(|j| tx[(i, j)] * beta[j]).sum();
            (ty[i] - fit).powi(2)
        })
        .sum();
    let sigma2 = rss / m as f64;
    if !(sigma2 > 0.0) {
        return None;
    }
    let log_det: f64 = filtered.variances.iter().map(|f| f.ln()).sum();
    let neg_loglik = 0.5 * (m as f64 * (LN_2PI + sigma2.ln() + 1.0) + log_det);
    Some(Profile {
        beta,
        sigma2,
        neg_loglik,
    })
}

/// Full negative log-likelihood in the natural parameterisation
/// `[β…, φ…, θ…, σ²]`, used for the Hessian.
fn full_neg_loglik(
    z: &[f64],
    design: &Mat<f64>,
    order: ArimaOrder,
    params: &[f64],
) -> f64 {
    let k = design.ncols();
    let beta = &params[..k];
    let ar = &params[k..k + order.p];
    let ma = &params[k + order.p..k + order.p + order.q];
    let sigma2 = params[k + order.p + order.q];
    if !(sigma2 > 0.0) {
        return f64::INFINITY;
    }
    let Some(space) = ArmaStateSpace::new(ar, ma) else {
        return f64::INFINITY;
    };
    let resid: Vec<f64> = (0..z.len())
        .map(|i| z[i] - (0..k).map(|j| design[(i, j)] * beta[j]).sum::<f64>())
        .collect();
    let Some(filtered) = space.filter(&[&resid]) else {
        return f64::INFINITY;
    };
    filtered.innovations[0]
        .iter()
        .zip(&filtered.variances)
        .map(|(v, f)| 0.5 * (LN_2PI + sigma2.ln() + f.ln() + v * v / (sigma2 * f)))
        .sum()
}

pub fn fit_arima(
    y: &[f64],
    exog: &Mat<f64>,
    exog_names: &[String],
    options: &ArimaOptions,
) -> Result<ArimaFit> {
    let order = options.order;
    let label = format!("ARIMA{order}");
    let n = y.len();
    if exog.nrows() != n || exog.ncols() != exog_names.len() {
        return Err(AnalysisError::Config(format!(
            "{label}: design has {}x{} entries for {n} observations and {} names",
            exog.nrows(),
            exog.ncols(),
            exog_names.len()
        )));
    }

    let mut names: Vec<String> = Vec::with_capacity(exog_names.len() + 1);
    if order.d == 0 {
        names.push("const".to_string());
    }
    names.extend(exog_names.iter().cloned());

    let k = names.len();
    let required = k + order.p + order.q + order.d + 3;
    if n < required {
        return Err(AnalysisError::InsufficientData {
            model: label,
            required,
            available: n,
        });
    }

    let (z, design) = prepare(y, exog, order.d);
    let design_cols = columns_of(&design);
    let m = z.len();

    let arma_terms = order.p + order.q;
    let objective = |params: &[f64]| {
        let (ar, ma) = split_params(params, order);
        profile(&z, &design_cols, &ar, &ma).map_or(f64::INFINITY, |p| p.neg_loglik)
    };
    let search = nelder_mead(
        objective,
        &vec![0.0; arma_terms],
        0.5,
        options.max_iterations,
        options.tolerance,
    );

    let (ar, ma) = split_params(&search.x, order);
    let best = profile(&z, &design_cols, &ar, &ma)
        .ok_or_else(|| AnalysisError::SingularMatrix(label.clone()))?;

    let mut status = FitStatus {
        converged: search.converged,
        iterations: search.iterations,
        warnings: Vec::new(),
    };
    if !search.converged {
        status.warnings.push(format!(
            "likelihood search stopped after {} iterations without converging",
            search.iterations
        ));
    }
    if ar.iter().chain(&ma).any(|c| c.abs() > 0.98) {
        status
            .warnings
            .push("AR or MA coefficient close to the unit circle".to_string());
    }

    // Hessian of the full likelihood in [β, φ, θ, σ²].
    let mut theta_hat: Vec<f64> = best.beta.clone();
    theta_hat.extend(&ar);
    theta_hat.extend(&ma);
    theta_hat.push(best.sigma2);
    let hessian = numerical_hessian(|params| full_neg_loglik(&z, &design, order, params), &theta_hat);
    let covariance = linalg::inverse(&linalg::from_rows(&hessian));
    if covariance.is_none() {
        status
            .warnings
            .push("Hessian is singular; standard errors unavailable".to_string());
    }

    let mut param_names = names.clone();
    param_names.extend((1..=order.p).map(|i| format!("ar.L{i}")));
    param_names.extend((1..=order.q).map(|i| format!("ma.L{i}")));
    param_names.push("sigma2".to_string());

    let mut negative_variance = false;
    let coefficients: Vec<Coefficient> = param_names
        .iter()
        .zip(&theta_hat)
        .enumerate()
        .map(|(i, (name, &estimate))| {
            let var = covariance.as_ref().map_or(f64::NAN, |c| c[(i, i)]);
            if var.is_finite() && var <= 0.0 {
                negative_variance = true;
            }
            let std_error = if var > 0.0 { var.sqrt() } else { f64::NAN };
            let statistic = estimate / std_error;
            Coefficient {
                name: name.clone(),
                estimate,
                std_error,
                statistic,
                p_value: stats::normal_two_sided_p(statistic),
            }
        })
        .collect();
    if negative_variance {
        status
            .warnings
            .push("Hessian is not positive definite at the optimum".to_string());
    }

    // Innovations and one-step predictions at the optimum.
    let resid_z: Vec<f64> = (0..m)
        .map(|i| z[i] - (0..k).map(|j| design[(i, j)] * best.beta[j]).sum::<f64>())
        .collect();
    let space = ArmaStateSpace::new(&ar, &ma)
        .ok_or_else(|| AnalysisError::SingularMatrix(label.clone()))?;
    let filtered = space
        .filter(&[&resid_z])
        .ok_or_else(|| AnalysisError::SingularMatrix(label.clone()))?;
    let residuals = filtered.innovations[0].clone();

    let mut fitted = Vec::with_capacity(n);
    let mut fitted_se = Vec::with_capacity(n);
    if order.d == 1 {
        fitted.push(y[0]);
        fitted_se.push(f64::NAN);
    }
    for t in 0..m {
        // Prediction of z_t is its value minus the innovation.
        let z_hat = z[t] - residuals[t];
        let level = if order.d == 1 { y[t] + z_hat } else { z_hat };
        fitted.push(level);
        fitted_se.push((best.sigma2 * filtered.variances[t]).sqrt());
    }

    let level_offset = {
        let exog_part = |i: usize| -> f64 {
            let offset = usize::from(order.d == 0);
            (0..exog.ncols())
                .map(|j| exog[(i, j)] * best.beta[j + offset])
                .sum()
        };
        (0..n).map(|i| y[i] - exog_part(i)).sum::<f64>() / n as f64
    };

    let standardized: Vec<f64> = residuals
        .iter()
        .zip(&filtered.variances)
        .map(|(v, f)| v / f.sqrt())
        .collect();
    let ljung_box = stats::ljung_box(&standardized, options.ljung_box_lags, arma_terms);
    if let Some(lb) = &ljung_box {
        if lb.p_value < 0.05 {
            status.warnings.push(format!(
                "residual autocorrelation remains (Ljung-Box Q({}) = {:.2}, p = {:.3})",
                lb.lags, lb.statistic, lb.p_value
            ));
        }
    }

    let log_likelihood = -best.neg_loglik;
    let n_params = (k + arma_terms + 1) as f64;
    for message in &status.warnings {
        warn!(model = %label, "{message}");
    }
    debug!(model = %label, log_likelihood, iterations = status.iterations, "fitted");

    Ok(ArimaFit {
        order,
        exog_names: names,
        coefficients,
        beta: best.beta,
        ar,
        ma,
        sigma2: best.sigma2,
        log_likelihood,
        aic: -2.0 * log_likelihood + 2.0 * n_params,
        bic: -2.0 * log_likelihood + n_params * (m as f64).ln(),
        nobs: m,
        level_offset,
        residuals,
        fitted,
        fitted_se,
        ljung_box,
        status,
    })
}

/// Projects the series forward from `boundary` (the last month before the
/// breakpoint) using the counterfactual design `exog_cf`, typically the actual
/// design with the intervention columns zeroed.
///
/// Months up to and including `boundary` reproduce the in-sample fitted values
/// and their one-step intervals; later months are multi-step forecasts anchored
/// at the observed boundary level.
pub fn counterfactual(
    fit: &ArimaFit,
    y: &[f64],
    exog_cf: &Mat<f64>,
    boundary: usize,
    confidence: f64,
) -> Result<Vec<Forecast>> {
    let n = y.len();
    let order = fit.order;
    let label = format!("ARIMA{order} counterfactual");
    if boundary >= n || exog_cf.nrows() != n || boundary < order.d {
        return Err(AnalysisError::InsufficientData {
            model: label,
            required: order.d + 1,
            available: boundary,
        });
    }
    let critical = stats::normal_critical(confidence);

    let mut out: Vec<Forecast> = (0..=boundary)
        .map(|t| {
            let se = fit.fitted_se[t];
            Forecast {
                mean: fit.fitted[t],
                lower: fit.fitted[t] - critical * se,
                upper: fit.fitted[t] + critical * se,
            }
        })
        .collect();

    let horizon = n - 1 - boundary;
    if horizon == 0 {
        return Ok(out);
    }

    let (z, design) = prepare(y, exog_cf, order.d);
    let k = design.ncols();
    let regression = |i: usize| (0..k).map(|j| design[(i, j)] * fit.beta[j]).sum::<f64>();
    // Differenced row i corresponds to level t = i + d.
    let history = boundary + 1 - order.d;
    let resid: Vec<f64> = (0..history).map(|i| z[i] - regression(i)).collect();

    let space = ArmaStateSpace::new(&fit.ar, &fit.ma)
        .ok_or_else(|| AnalysisError::SingularMatrix(label.clone()))?;
    let filtered = space
        .filter(&[&resid])
        .ok_or_else(|| AnalysisError::SingularMatrix(label.clone()))?;
    let arma_path = space.forecast(&filtered.final_states[0], horizon);

    let psi = psi_weights(&fit.ar, &fit.ma, horizon);
    let mut cumulative = 0.0;
    let mut variance = 0.0;
    let mut level = y[boundary];

    for h in 0..horizon {
        let i = history + h;
        let step = regression(i) + arma_path[h];
        let weight = if order.d == 1 {
            cumulative += psi[h];
            cumulative
        } else {
            psi[h]
        };
        variance += weight * weight;
        let mean = if order.d == 1 {
            level += step;
            level
        } else {
            step
        };
        let se = (fit.sigma2 * variance).sqrt();
        out.push(Forecast {
            mean,
            lower: mean - critical * se,
            upper: mean + critical * se,
        });
    }
    Ok(out)
}
