//! Segmented ordinary least squares and the naive pre/post comparison.

use faer::Mat;
use serde::Serialize;

use crate::error::{AnalysisError, Result};
use crate::linalg;
use crate::models::{Coefficient, Forecast};
use crate::stats::{self, WelchTest};

/// Printed next to every naive comparison.
pub const NAIVE_CAVEAT: &str = "A two-sample comparison of monthly means ignores the underlying time \
trend and autocorrelation, so it is not a valid estimate of the intervention effect.";

#[derive(Debug, Clone, Serialize)]
pub struct OlsFit {
    pub coefficients: Vec<Coefficient>,
    pub beta: Vec<f64>,
    pub covariance: Vec<Vec<f64>>,
    pub r_squared: f64,
    pub adj_r_squared: f64,
    pub residual_se: f64,
    pub df_residual: usize,
    pub durbin_watson: f64,
    pub nobs: usize,
    pub fitted: Vec<f64>,
    pub residuals: Vec<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NaiveComparison {
    pub test: WelchTest,
    pub caveat: &'static str,
}

/// Ordinary least squares; `design` must carry its own intercept column.
pub fn fit_ols(y: &[f64], design: &Mat<f64>, names: &[String]) -> Result<OlsFit> {
    let n = y.len();
    let p = design.ncols();
    let label = "OLS".to_string();
    if design.nrows() != n || names.len() != p {
        return Err(AnalysisError::Config(format!(
            "{label}: design has {}x{p} entries for {n} observations",
            design.nrows()
        )));
    }
    if n <= p {
        return Err(AnalysisError::InsufficientData {
            model: label,
            required: p + 1,
            available: n,
        });
    }

    let gram = linalg::weighted_gram(design, None);
    let xty: Vec<f64> = (0..p)
        .map(|j| (0..n).map(|i| design[(i, j)] * y[i]).sum())
        .collect();
    let beta = linalg::solve_spd(&gram, &xty)
        .ok_or_else(|| AnalysisError::SingularMatrix(label.clone()))?;
    let gram_inv = linalg::inverse(&gram).ok_or_else(|| AnalysisError::SingularMatrix(label))?;

    let fitted: Vec<f64> = (0..n)
        .map(|i| linalg::dot(&linalg::row(design, i), &beta))
        .collect();
    let residuals: Vec<f64> = y.iter().zip(&fitted).map(|(obs, fit)| obs - fit).collect();
    let rss: f64 = residuals.iter().map(|e| e * e).sum();
    let y_mean = stats::mean(y);
    let tss: f64 = y.iter().map(|v| (v - y_mean).powi(2)).sum();

    let df_residual = n - p;
    let sigma2 = rss / df_residual as f64;
    let r_squared = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };
    let adj_r_squared = 1.0 - (1.0 - r_squared) * (n - 1) as f64 / df_residual as f64;
    let durbin_watson = if rss > 0.0 {
        residuals
            .windows(2)
            .map(|pair| (pair[1] - pair[0]).powi(2))
            .sum::<f64>()
            / rss
    } else {
        f64::NAN
    };

    let covariance = Mat::from_fn(p, p, |i, j| sigma2 * gram_inv[(i, j)]);
    let coefficients = names
        .iter()
        .enumerate()
        .map(|(j, name)| {
            let std_error = covariance[(j, j)].max(0.0).sqrt();
            let statistic = beta[j] / std_error;
            Coefficient {
                name: name.clone(),
                estimate: beta[j],
                std_error,
                statistic,
                p_value: stats::student_t_two_sided_p(statistic, df_residual as f64),
            }
        })
        .collect();

    Ok(OlsFit {
        coefficients,
        beta,
        covariance: linalg::to_rows(&covariance),
        r_squared,
        adj_r_squared,
        residual_se: sigma2.sqrt(),
        df_residual,
        durbin_watson,
        nobs: n,
        fitted,
        residuals,
    })
}

/// Mean predictions for `design` with confidence intervals on the mean.
pub fn predict(fit: &OlsFit, design: &Mat<f64>, confidence: f64) -> Vec<Forecast> {
    let covariance = linalg::from_rows(&fit.covariance);
    let critical = stats::student_t_critical(confidence, fit.df_residual as f64);
    (0..design.nrows())
        .map(|i| {
            let x = linalg::row(design, i);
            let mean = linalg::dot(&x, &fit.beta);
            let se = linalg::quad_form(&covariance, &x).max(0.0).sqrt();
            Forecast {
                mean,
                lower: mean - critical * se,
                upper: mean + critical * se,
            }
        })
        .collect()
}

pub fn naive_comparison(pre: &[f64], post: &[f64], confidence: f64) -> Option<NaiveComparison> {
    stats::welch_t_test(pre, post, confidence).map(|test| NaiveComparison {
        test,
        caveat: NAIVE_CAVEAT,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        ["const", "month_index", "post_intervention", "months_since_intervention"]
            .iter()
            .take(n)
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn exact_line_has_perfect_fit() {
        let design = Mat::from_fn(6, 2, |i, j| if j == 0 { 1.0 } else { i as f64 });
        let y: Vec<f64> = (0..6).map(|i| 3.0 + 2.0 * i as f64).collect();
        let fit = fit_ols(&y, &design, &names(2)).unwrap();
        assert!((fit.beta[0] - 3.0).abs() < 1e-10);
        assert!((fit.beta[1] - 2.0).abs() < 1e-10);
        assert!((fit.r_squared - 1.0).abs() < 1e-12);
    }

    #[test]
    fn textbook_regression_statistics() {
        // y = 1, 3, 2, 5, 4 on x = 1..5: slope 0.8, intercept 0.6, R² = 0.64.
        let design = Mat::from_fn(5, 2, |i, j| if j == 0 { 1.0 } else { (i + 1) as f64 });
        let y = [1.0, 3.0, 2.0, 5.0, 4.0];
        let fit = fit_ols(&y, &design, &names(2)).unwrap();
        assert!((fit.beta[0] - 0.6).abs() < 1e-10);
        assert!((fit.beta[1] - 0.8).abs() < 1e-10);
        assert!((fit.r_squared - 0.64).abs() < 1e-10);
        assert!((fit.adj_r_squared - 0.52).abs() < 1e-10);
        assert_eq!(fit.df_residual, 3);
        // RSS = 3.6, so s² = 1.2 and SE(slope) = sqrt(1.2 / 10).
        assert!((fit.coefficients[1].std_error - 0.12_f64.sqrt()).abs() < 1e-10);
        // Residuals -0.4, 0.8, -1.0, 1.2, -0.6.
        let dw = (1.2f64.powi(2) + 1.8f64.powi(2) + 2.2f64.powi(2) + 1.8f64.powi(2)) / 3.6;
        assert!((fit.durbin_watson - dw).abs() < 1e-10);
    }

    #[test]
    fn segmented_counterfactual_removes_step() {
        let n = 30;
        let design = Mat::from_fn(n, 4, |t, j| match j {
            0 => 1.0,
            1 => t as f64,
            2 => f64::from(u8::from(t >= 15)),
            _ => t.saturating_sub(15) as f64,
        });
        let y: Vec<f64> = (0..n)
            .map(|t| 40.0 + 0.2 * t as f64 - 12.0 * design[(t, 2)] + if t % 2 == 0 { 0.5 } else { -0.5 })
            .collect();
        let fit = fit_ols(&y, &design, &names(4)).unwrap();
        assert!((fit.beta[2] + 12.0).abs() < 1.0);
        assert!(fit.coefficients[2].p_value < 1e-6);

        let cf_design = Mat::from_fn(n, 4, |t, j| if j >= 2 { 0.0 } else { design[(t, j)] });
        let cf = predict(&fit, &cf_design, 0.95);
        assert!((cf[14].mean - fit.fitted[14]).abs() < 1e-9);
        assert!(cf[20].mean - fit.fitted[20] > 10.0);
        assert!(cf.iter().all(|f| f.lower < f.mean && f.mean < f.upper));
    }

    #[test]
    fn underdetermined_fit_is_rejected() {
        let design = Mat::from_fn(3, 4, |_, _| 1.0);
        let err = fit_ols(&[1.0, 2.0, 3.0], &design, &names(4)).unwrap_err();
        assert!(matches!(err, AnalysisError::InsufficientData { .. }));
    }

    #[test]
    fn naive_comparison_carries_caveat() {
        let pre = [10.0, 11.0, 12.0, 11.5];
        let post = [8.0, 7.5, 9.0, 8.5];
        let naive = naive_comparison(&pre, &post, 0.95).unwrap();
        assert!(naive.test.difference < 0.0);
        assert!(naive.caveat.contains("not a valid estimate"));
        assert!(naive_comparison(&pre, &[1.0], 0.95).is_none());
    }
}
