//! Tail probabilities and the small tests the report relies on.

use serde::Serialize;
use statrs::distribution::{ChiSquared, ContinuousCDF, Normal, StudentsT};

pub fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample variance with `n - 1` denominator.
pub fn variance(values: &[f64]) -> f64 {
    let m = mean(values);
    values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() as f64 - 1.0)
}

pub fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// `P(|Z| > |z|)` for a standard normal.
pub fn normal_two_sided_p(z: f64) -> f64 {
    if z.is_nan() {
        return f64::NAN;
    }
    Normal::new(0.0, 1.0).map_or(f64::NAN, |normal| (2.0 * normal.sf(z.abs())).min(1.0))
}

/// Two-sided critical value for a confidence level such as 0.95.
pub fn normal_critical(confidence: f64) -> f64 {
    Normal::new(0.0, 1.0).map_or(f64::NAN, |normal| normal.inverse_cdf(0.5 + confidence / 2.0))
}

pub fn chi_square_sf(x: f64, df: f64) -> f64 {
    ChiSquared::new(df).map_or(f64::NAN, |dist| dist.sf(x.max(0.0)))
}

/// `P(|T| > |t|)` for Student's t with `df` degrees of freedom.
pub fn student_t_two_sided_p(t: f64, df: f64) -> f64 {
    if t.is_nan() {
        return f64::NAN;
    }
    StudentsT::new(0.0, 1.0, df).map_or(f64::NAN, |dist| (2.0 * dist.sf(t.abs())).min(1.0))
}

/// Two-sided Student t critical value.
pub fn student_t_critical(confidence: f64, df: f64) -> f64 {
    StudentsT::new(0.0, 1.0, df)
        .map_or(f64::NAN, |dist| dist.inverse_cdf(0.5 + confidence / 2.0))
}

/// Sample autocorrelations at lags `1..=max_lag`.
pub fn acf(values: &[f64], max_lag: usize) -> Vec<f64> {
    let n = values.len();
    let m = mean(values);
    let denom: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    (1..=max_lag)
        .map(|lag| {
            if lag >= n || denom == 0.0 {
                return 0.0;
            }
            let num: f64 = (lag..n)
                .map(|t| (values[t] - m) * (values[t - lag] - m))
                .sum();
            num / denom
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LjungBox {
    pub lags: usize,
    pub statistic: f64,
    pub df: usize,
    pub p_value: f64,
}

/// Ljung–Box portmanteau test; `fitted_params` (AR + MA terms) are taken off the degrees of freedom.
pub fn ljung_box(residuals: &[f64], lags: usize, fitted_params: usize) -> Option<LjungBox> {
    let n = residuals.len();
    let lags = lags.min(n.saturating_sub(1));
    if lags == 0 || lags <= fitted_params {
        return None;
    }
    let rho = acf(residuals, lags);
    let nf = n as f64;
    let statistic = nf
        * (nf + 2.0)
        * rho
            .iter()
            .enumerate()
            .map(|(k, r)| r * r / (nf - (k + 1) as f64))
            .sum::<f64>();
    let df = lags - fitted_params;
    Some(LjungBox {
        lags,
        statistic,
        df,
        p_value: chi_square_sf(statistic, df as f64),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WelchTest {
    pub mean_pre: f64,
    pub mean_post: f64,
    pub difference: f64,
    pub statistic: f64,
    pub df: f64,
    pub p_value: f64,
    pub lower: f64,
    pub upper: f64,
}

/// Welch's unequal-variance two-sample t-test of `post - pre`.
pub fn welch_t_test(pre: &[f64], post: &[f64], confidence: f64) -> Option<WelchTest> {
    if pre.len() < 2 || post.len() < 2 {
        return None;
    }
    let (m1, m2) = (mean(pre), mean(post));
    let (v1, v2) = (variance(pre) / pre.len() as f64, variance(post) / post.len() as f64);
    let se = (v1 + v2).sqrt();
    if se == 0.0 {
        return None;
    }
    let df = (v1 + v2).powi(2)
        / (v1 * v1 / (pre.len() as f64 - 1.0) + v2 * v2 / (post.len() as f64 - 1.0));
    let difference = m2 - m1;
    let statistic = difference / se;
    let critical = student_t_critical(confidence, df);
    Some(WelchTest {
        mean_pre: m1,
        mean_post: m2,
        difference,
        statistic,
        df,
        p_value: student_t_two_sided_p(statistic, df),
        lower: difference - critical * se,
        upper: difference + critical * se,
    })
}
