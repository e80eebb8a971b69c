//! Logistic generalized estimating equations for monthly proportions.
//!
//! Each observation is a month: the share of records with the outcome, weighted
//! by the month's record count through the binomial variance μ(1−μ)/n. Months
//! in the same cluster are tied together by a working correlation matrix whose
//! parameter is re-estimated from Pearson residuals at every Fisher-scoring step.

use std::collections::BTreeMap;

use faer::Mat;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{CorrelationStructure, CovarianceType};
use crate::error::{AnalysisError, Result};
use crate::linalg;
use crate::models::{Coefficient, FitStatus, Forecast};
use crate::stats;

const ALPHA_LIMIT: f64 = 0.99;
const MU_FLOOR: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct GeeOptions {
    pub correlation: CorrelationStructure,
    pub covariance: CovarianceType,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub confidence: f64,
}

/// Response, weights, design and panel layout for one fit.
#[derive(Debug, Clone)]
pub struct GeeData<'a> {
    /// Observed proportions in [0, 1].
    pub response: &'a [f64],
    /// Binomial denominators (records per month).
    pub weights: &'a [f64],
    pub design: &'a Mat<f64>,
    pub names: &'a [String],
    /// Position on the calendar; AR(1) correlation decays with its distance.
    pub time: &'a [f64],
    /// Cluster label per observation.
    pub groups: &'a [i64],
}

#[derive(Debug, Clone, Serialize)]
pub struct OddsRatio {
    pub name: String,
    pub odds_ratio: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeeFit {
    pub names: Vec<String>,
    pub coefficients: Vec<Coefficient>,
    pub odds_ratios: Vec<OddsRatio>,
    pub beta: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    pub correlation: CorrelationStructure,
    pub covariance_type: CovarianceType,
    /// Working-correlation parameter (0 under independence).
    pub alpha: f64,
    /// Pearson dispersion estimate.
    pub scale: f64,
    pub nobs: usize,
    pub clusters: usize,
    pub status: FitStatus,
}

struct Cluster {
    members: Vec<usize>,
}

struct Moments {
    mu: Vec<f64>,
    /// Binomial variance without the dispersion factor.
    variance: Vec<f64>,
}

fn moments(design: &Mat<f64>, beta: &[f64], weights: &[f64]) -> Moments {
    let mu: Vec<f64> = (0..design.nrows())
        .map(|i| {
            stats::logistic(linalg::dot(&linalg::row(design, i), beta)).clamp(MU_FLOOR, 1.0 - MU_FLOOR)
        })
        .collect();
    let variance = mu
        .iter()
        .zip(weights)
        .map(|(m, n)| m * (1.0 - m) / n)
        .collect();
    Moments { mu, variance }
}

fn clusters_of(groups: &[i64], time: &[f64]) -> Vec<Cluster> {
    let mut by_label: BTreeMap<i64, Vec<usize>> = BTreeMap::new();
    for (i, label) in groups.iter().enumerate() {
        by_label.entry(*label).or_default().push(i);
    }
    by_label
        .into_values()
        .map(|mut members| {
            members.sort_by(|&a, &b| time[a].total_cmp(&time[b]));
            Cluster { members }
        })
        .collect()
}

fn working_correlation(
    structure: CorrelationStructure,
    alpha: f64,
    cluster: &Cluster,
    time: &[f64],
) -> Mat<f64> {
    let size = cluster.members.len();
    Mat::from_fn(size, size, |a, b| {
        if a == b {
            return 1.0;
        }
        match structure {
            CorrelationStructure::Independence => 0.0,
            CorrelationStructure::Exchangeable => alpha,
            CorrelationStructure::Ar1 => {
                let lag = (time[cluster.members[a]] - time[cluster.members[b]]).abs();
                alpha.powi(lag.round() as i32)
            }
        }
    })
}

/// Moment estimates of the correlation parameter and dispersion from Pearson residuals.
fn estimate_nuisance(
    structure: CorrelationStructure,
    clusters: &[Cluster],
    pearson: &[f64],
    time: &[f64],
    n_params: usize,
) -> (f64, f64) {
    let n = pearson.len();
    let scale = pearson.iter().map(|r| r * r).sum::<f64>() / (n - n_params) as f64;
    if scale <= 0.0 {
        return (0.0, scale);
    }

    let (mut cross, mut pairs) = (0.0, 0usize);
    for cluster in clusters {
        let members = &cluster.members;
        match structure {
            CorrelationStructure::Independence => {}
            CorrelationStructure::Exchangeable => {
                for (a, &i) in members.iter().enumerate() {
                    for &j in &members[a + 1..] {
                        cross += pearson[i] * pearson[j];
                        pairs += 1;
                    }
                }
            }
            CorrelationStructure::Ar1 => {
                for pair in members.windows(2) {
                    if (time[pair[1]] - time[pair[0]] - 1.0).abs() < 1e-9 {
                        cross += pearson[pair[0]] * pearson[pair[1]];
                        pairs += 1;
                    }
                }
            }
        }
    }
    if pairs == 0 {
        return (0.0, scale);
    }
    // An exchangeable matrix of size m stays positive definite only above -1/(m-1).
    let floor = match structure {
        CorrelationStructure::Exchangeable => {
            let largest = clusters.iter().map(|c| c.members.len()).max().unwrap_or(2);
            -ALPHA_LIMIT / (largest.max(2) - 1) as f64
        }
        _ => -ALPHA_LIMIT,
    };
    let alpha = (cross / (pairs as f64 * scale)).clamp(floor, ALPHA_LIMIT);
    (alpha, scale)
}

/// Per-cluster pieces of the estimating equations: `DᵀV⁻¹` and the residuals.
struct ClusterTerms {
    dv: Mat<f64>,
    d: Mat<f64>,
    residual: Vec<f64>,
}

fn cluster_terms(
    data: &GeeData<'_>,
    structure: CorrelationStructure,
    alpha: f64,
    cluster: &Cluster,
    moments: &Moments,
) -> Option<ClusterTerms> {
    let p = data.design.ncols();
    let members = &cluster.members;
    let sd: Vec<f64> = members.iter().map(|&i| moments.variance[i].sqrt()).collect();
    let corr = working_correlation(structure, alpha, cluster, data.time);
    let v = Mat::from_fn(members.len(), members.len(), |a, b| sd[a] * corr[(a, b)] * sd[b]);
    let v_inv = linalg::inverse(&v)?;

    let d = Mat::from_fn(members.len(), p, |a, j| {
        let i = members[a];
        moments.mu[i] * (1.0 - moments.mu[i]) * data.design[(i, j)]
    });
    let dv = d.transpose() * &v_inv;
    let residual = members
        .iter()
        .map(|&i| data.response[i] - moments.mu[i])
        .collect();
    Some(ClusterTerms { dv, d, residual })
}

pub fn fit_gee(data: &GeeData<'_>, options: &GeeOptions) -> Result<GeeFit> {
    let n = data.response.len();
    let p = data.design.ncols();
    let label = "GEE".to_string();
    if data.design.nrows() != n
        || data.weights.len() != n
        || data.time.len() != n
        || data.groups.len() != n
        || data.names.len() != p
    {
        return Err(AnalysisError::Config(format!(
            "{label}: response, weights, design, time and groups disagree in length"
        )));
    }
    if n <= p + 1 {
        return Err(AnalysisError::InsufficientData {
            model: label,
            required: p + 2,
            available: n,
        });
    }
    if data.weights.iter().any(|w| !(*w > 0.0)) {
        return Err(AnalysisError::Config(format!(
            "{label}: every observation needs a positive weight"
        )));
    }

    let clusters = clusters_of(data.groups, data.time);
    let structure = options.correlation;

    let mut beta = vec![0.0; p];
    let mut alpha = 0.0;
    let mut scale = 1.0;
    let mut status = FitStatus::default();

    for iteration in 1..=options.max_iterations {
        status.iterations = iteration;
        let m = moments(data.design, &beta, data.weights);
        let pearson: Vec<f64> = (0..n)
            .map(|i| (data.response[i] - m.mu[i]) / m.variance[i].sqrt())
            .collect();
        if iteration > 1 {
            (alpha, scale) = estimate_nuisance(structure, &clusters, &pearson, data.time, p);
        }

        let mut information = Mat::<f64>::zeros(p, p);
        let mut score = vec![0.0; p];
        for cluster in &clusters {
            let terms = cluster_terms(data, structure, alpha, cluster, &m)
                .ok_or_else(|| AnalysisError::SingularMatrix(format!("{label} working covariance")))?;
            let block = &terms.dv * &terms.d;
            let contribution = linalg::mat_vec(&terms.dv, &terms.residual);
            for i in 0..p {
                score[i] += contribution[i];
                for j in 0..p {
                    information[(i, j)] += block[(i, j)];
                }
            }
        }

        let step = linalg::solve_spd(&information, &score)
            .ok_or_else(|| AnalysisError::SingularMatrix(label.clone()))?;
        let largest = step.iter().fold(0.0_f64, |acc, s| acc.max(s.abs()));
        for (b, s) in beta.iter_mut().zip(&step) {
            *b += s;
        }
        if !largest.is_finite() {
            return Err(AnalysisError::SingularMatrix(label));
        }
        if largest < options.tolerance {
            status.converged = true;
            break;
        }
    }

    // Final nuisance estimates and covariance at the solution.
    let m = moments(data.design, &beta, data.weights);
    let pearson: Vec<f64> = (0..n)
        .map(|i| (data.response[i] - m.mu[i]) / m.variance[i].sqrt())
        .collect();
    (alpha, scale) = estimate_nuisance(structure, &clusters, &pearson, data.time, p);

    let mut information = Mat::<f64>::zeros(p, p);
    let mut meat = Mat::<f64>::zeros(p, p);
    for cluster in &clusters {
        let terms = cluster_terms(data, structure, alpha, cluster, &m)
            .ok_or_else(|| AnalysisError::SingularMatrix(format!("{label} working covariance")))?;
        let block = &terms.dv * &terms.d;
        let u = linalg::mat_vec(&terms.dv, &terms.residual);
        for i in 0..p {
            for j in 0..p {
                information[(i, j)] += block[(i, j)];
                meat[(i, j)] += u[i] * u[j];
            }
        }
    }
    let bread = linalg::inverse(&information)
        .ok_or_else(|| AnalysisError::SingularMatrix(label.clone()))?;
    let covariance = match options.covariance {
        CovarianceType::Naive => Mat::from_fn(p, p, |i, j| scale * bread[(i, j)]),
        CovarianceType::Robust => &bread * &meat * &bread,
    };

    if !status.converged {
        status.warnings.push(format!(
            "Fisher scoring did not converge within {} iterations",
            options.max_iterations
        ));
    }
    if alpha.abs() >= ALPHA_LIMIT {
        status
            .warnings
            .push(format!("working correlation parameter hit the bound (alpha = {alpha:.2})"));
    }
    if options.covariance == CovarianceType::Robust && clusters.len() < 5 {
        status.warnings.push(format!(
            "robust covariance from only {} cluster(s) is unreliable",
            clusters.len()
        ));
    }
    for message in &status.warnings {
        warn!(model = %label, "{message}");
    }
    debug!(model = %label, alpha, scale, iterations = status.iterations, "fitted");

    let critical = stats::normal_critical(options.confidence);
    let mut coefficients = Vec::with_capacity(p);
    let mut odds_ratios = Vec::with_capacity(p);
    for (j, name) in data.names.iter().enumerate() {
        let estimate = beta[j];
        let var = covariance[(j, j)];
        let std_error = if var > 0.0 { var.sqrt() } else { f64::NAN };
        let statistic = estimate / std_error;
        coefficients.push(Coefficient {
            name: name.clone(),
            estimate,
            std_error,
            statistic,
            p_value: stats::normal_two_sided_p(statistic),
        });
        odds_ratios.push(OddsRatio {
            name: name.clone(),
            odds_ratio: estimate.exp(),
            lower: (estimate - critical * std_error).exp(),
            upper: (estimate + critical * std_error).exp(),
        });
    }

    Ok(GeeFit {
        names: data.names.to_vec(),
        coefficients,
        odds_ratios,
        beta,
        covariance: linalg::to_rows(&covariance),
        correlation: structure,
        covariance_type: options.covariance,
        alpha,
        scale,
        nobs: n,
        clusters: clusters.len(),
        status,
    })
}

/// Predicted proportions for `design`, with delta-method intervals formed on
/// the logit scale and mapped back.
pub fn predict(fit: &GeeFit, design: &Mat<f64>, confidence: f64) -> Vec<Forecast> {
    let covariance = linalg::from_rows(&fit.covariance);
    let critical = stats::normal_critical(confidence);
    (0..design.nrows())
        .map(|i| {
            let x = linalg::row(design, i);
            let eta = linalg::dot(&x, &fit.beta);
            let se = linalg::quad_form(&covariance, &x).max(0.0).sqrt();
            Forecast {
                mean: stats::logistic(eta),
                lower: stats::logistic(eta - critical * se),
                upper: stats::logistic(eta + critical * se),
            }
        })
        .collect()
}
