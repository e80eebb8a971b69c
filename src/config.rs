use std::path::Path;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};

/// Every tunable of the analysis. Loaded from TOML, then overridden from the CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub breakpoint: Breakpoint,
    pub gap_policy: GapPolicy,
    pub adjust_for_covariates: bool,
    pub confidence_level: f64,
    pub study: StudyWindow,
    pub thresholds: Thresholds,
    pub input: InputConfig,
    pub arima: ArimaConfig,
    pub gee: GeeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudyWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub intervention: NaiveDate,
    pub lag: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// A scan strictly below this gestational age counts as early (24 weeks).
    pub early_scan_max_days: u32,
    /// A booking strictly below this gestational age counts as early (20 weeks).
    pub early_booking_max_days: u32,
    pub min_visits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    pub missing_tokens: Vec<String>,
    pub placeholder_date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArimaOrder {
    pub p: usize,
    pub d: usize,
    pub q: usize,
}

impl std::fmt::Display for ArimaOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.p, self.d, self.q)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArimaConfig {
    pub max_iterations: usize,
    pub tolerance: f64,
    pub ljung_box_lags: usize,
    pub scan_order: ArimaOrder,
    pub booking_order: ArimaOrder,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeeConfig {
    pub correlation: CorrelationStructure,
    pub grouping: PanelGrouping,
    pub covariance: CovarianceType,
    pub max_iterations: usize,
    pub tolerance: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CorrelationStructure {
    Independence,
    Exchangeable,
    Ar1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PanelGrouping {
    SinglePanel,
    CalendarYear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CovarianceType {
    Naive,
    Robust,
}

/// Which cutoff drives the step and slope regressors of every model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Breakpoint {
    Intervention,
    Lag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GapPolicy {
    Error,
    Mark,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            breakpoint: Breakpoint::Intervention,
            gap_policy: GapPolicy::Error,
            adjust_for_covariates: false,
            confidence_level: 0.95,
            study: StudyWindow::default(),
            thresholds: Thresholds::default(),
            input: InputConfig::default(),
            arima: ArimaConfig::default(),
            gee: GeeConfig::default(),
        }
    }
}

impl Default for StudyWindow {
    fn default() -> Self {
        Self {
            start: ymd(2017, 1, 1),
            end: ymd(2020, 7, 31),
            intervention: ymd(2018, 11, 30),
            lag: ymd(2019, 4, 30),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            early_scan_max_days: 24 * 7,
            early_booking_max_days: 20 * 7,
            min_visits: 4,
        }
    }
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            missing_tokens: ["", "NA", "na", "N/A", "Unknown", "No Ultrasound"]
                .into_iter()
                .map(String::from)
                .collect(),
            placeholder_date: "01/01/1900".to_string(),
        }
    }
}

impl Default for ArimaConfig {
    fn default() -> Self {
        Self {
            max_iterations: 2000,
            tolerance: 1e-8,
            ljung_box_lags: 10,
            scan_order: ArimaOrder { p: 0, d: 1, q: 1 },
            booking_order: ArimaOrder { p: 2, d: 1, q: 0 },
        }
    }
}

impl Default for GeeConfig {
    fn default() -> Self {
        Self {
            correlation: CorrelationStructure::Ar1,
            grouping: PanelGrouping::SinglePanel,
            covariance: CovarianceType::Naive,
            max_iterations: 100,
            tolerance: 1e-8,
        }
    }
}

impl AnalysisConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| AnalysisError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AnalysisError::Config(e.to_string()))
    }

    /// Command-line dates win over whatever the file said.
    pub fn apply_overrides(
        &mut self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        intervention: Option<NaiveDate>,
        lag: Option<NaiveDate>,
    ) {
        if let Some(start) = start {
            self.study.start = start;
        }
        if let Some(end) = end {
            self.study.end = end;
        }
        if let Some(intervention) = intervention {
            self.study.intervention = intervention;
        }
        if let Some(lag) = lag {
            self.study.lag = lag;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let study = &self.study;
        if study.start >= study.end {
            return Err(AnalysisError::Config(format!(
                "study start {} must precede study end {}",
                study.start, study.end
            )));
        }
        if study.intervention < study.start || study.intervention >= study.end {
            return Err(AnalysisError::Config(format!(
                "intervention date {} lies outside the study window",
                study.intervention
            )));
        }
        if study.lag < study.intervention || study.lag >= study.end {
            return Err(AnalysisError::Config(format!(
                "lag date {} must fall between the intervention date and the study end",
                study.lag
            )));
        }
        if !(self.confidence_level > 0.0 && self.confidence_level < 1.0) {
            return Err(AnalysisError::Config(format!(
                "confidence level {} must lie strictly between 0 and 1",
                self.confidence_level
            )));
        }
        for (name, order) in [
            ("scan_order", self.arima.scan_order),
            ("booking_order", self.arima.booking_order),
        ] {
            if order.d > 1 {
                return Err(AnalysisError::Config(format!(
                    "arima.{name}: only d = 0 or d = 1 is supported, got {order}"
                )));
            }
            if order.p > 4 || order.q > 4 {
                return Err(AnalysisError::Config(format!(
                    "arima.{name}: p and q are capped at 4, got {order}"
                )));
            }
        }
        if self.thresholds.early_scan_max_days == 0 || self.thresholds.early_booking_max_days == 0 {
            return Err(AnalysisError::Config(
                "early scan and booking thresholds must be positive".to_string(),
            ));
        }
        if self.arima.max_iterations == 0 || self.gee.max_iterations == 0 {
            return Err(AnalysisError::Config(
                "iteration limits must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}
