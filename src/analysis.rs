//! Builds the interrupted-time-series designs from the monthly table and runs
//! every model on them.

use std::path::Path;

use chrono::{Datelike, NaiveDate};
use faer::Mat;
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregate::{self, PeriodSummary};
use crate::arima::{self, ArimaFit, ArimaOptions};
use crate::config::{AnalysisConfig, ArimaOrder, Breakpoint, PanelGrouping, StudyWindow};
use crate::error::Result;
use crate::features;
use crate::gee::{self, GeeData, GeeFit, GeeOptions};
use crate::ingest::{self, LoadSummary};
use crate::models::{
    BinaryOutcome, ContinuousOutcome, CounterfactualPoint, Covariate, Forecast, MonthlyAggregate,
    MonthlySeries, PregnancyRecord,
};
use crate::regression::{self, NaiveComparison, OlsFit};

/// The monthly table plus the bookkeeping of how it was produced.
#[derive(Debug, Clone, Serialize)]
pub struct PreparedSeries {
    pub records: RecordCounts,
    pub series: MonthlySeries,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordCounts {
    pub rows_read: usize,
    pub missing_delivery_date: usize,
    pub outside_window: usize,
    pub scans_after_delivery: usize,
    pub analysed: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArimaOutcome {
    pub outcome: ContinuousOutcome,
    pub fit: ArimaFit,
    pub counterfactual: Vec<CounterfactualPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeeOutcome {
    pub outcome: BinaryOutcome,
    pub fit: GeeFit,
    pub counterfactual: Vec<CounterfactualPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentedOutcome {
    pub outcome: ContinuousOutcome,
    pub fit: OlsFit,
    pub counterfactual: Vec<CounterfactualPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NaiveOutcome {
    pub outcome: ContinuousOutcome,
    pub comparison: NaiveComparison,
}

#[derive(Debug, Clone, Serialize)]
pub struct SkippedModel {
    pub model: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResults {
    pub study: StudyWindow,
    pub breakpoint: Breakpoint,
    pub breakpoint_date: NaiveDate,
    pub confidence_level: f64,
    pub records: RecordCounts,
    pub gaps: Vec<NaiveDate>,
    pub periods: Vec<PeriodSummary>,
    pub series: MonthlySeries,
    pub arima: Vec<ArimaOutcome>,
    pub gee: Vec<GeeOutcome>,
    pub segmented: Option<SegmentedOutcome>,
    pub naive: Vec<NaiveOutcome>,
    pub skipped: Vec<SkippedModel>,
    pub notes: Vec<String>,
}

/// Load, derive and aggregate.
pub fn prepare(path: &Path, config: &AnalysisConfig) -> Result<PreparedSeries> {
    let (raw, load) = ingest::load_records(path, &config.input)?;
    prepare_records(&raw, &load, config)
}

pub fn prepare_records(
    raw: &[PregnancyRecord],
    load: &LoadSummary,
    config: &AnalysisConfig,
) -> Result<PreparedSeries> {
    let derived = features::derive_records(raw, config);
    let series = aggregate::aggregate_monthly(&derived.records, &config.study, config.gap_policy)?;
    Ok(PreparedSeries {
        records: RecordCounts {
            rows_read: load.rows_read,
            missing_delivery_date: load.missing_delivery_date,
            outside_window: derived.outside_window,
            scans_after_delivery: derived.scans_after_delivery,
            analysed: derived.records.len(),
        },
        series,
    })
}

fn breakpoint_date(config: &AnalysisConfig) -> NaiveDate {
    match config.breakpoint {
        Breakpoint::Intervention => config.study.intervention,
        Breakpoint::Lag => config.study.lag,
    }
}

fn step_name(breakpoint: Breakpoint) -> &'static str {
    match breakpoint {
        Breakpoint::Intervention => "post_intervention",
        Breakpoint::Lag => "post_lag",
    }
}

fn slope_name(breakpoint: Breakpoint) -> &'static str {
    match breakpoint {
        Breakpoint::Intervention => "months_since_intervention",
        Breakpoint::Lag => "months_since_lag",
    }
}

/// Columns of an ITS regression, with the matching counterfactual design that
/// zeroes the step and slope terms.
struct Design {
    names: Vec<String>,
    actual: Mat<f64>,
    counterfactual: Mat<f64>,
}

#[derive(Clone, Copy)]
struct DesignLayout<'a> {
    intercept: bool,
    time: bool,
    breakpoint: Breakpoint,
    covariates: &'a [Covariate],
}

impl Design {
    fn build(months: &[&MonthlyAggregate], layout: DesignLayout<'_>) -> Self {
        let mut names: Vec<String> = Vec::new();
        let mut columns: Vec<Box<dyn Fn(&MonthlyAggregate) -> f64>> = Vec::new();
        let mut intervention_cols: Vec<usize> = Vec::new();

        if layout.intercept {
            names.push("const".to_string());
            columns.push(Box::new(|_: &MonthlyAggregate| 1.0));
        }
        if layout.time {
            names.push("month_index".to_string());
            columns.push(Box::new(|agg: &MonthlyAggregate| f64::from(agg.month_index)));
        }
        let breakpoint = layout.breakpoint;
        intervention_cols.push(names.len());
        names.push(step_name(breakpoint).to_string());
        columns.push(Box::new(move |agg: &MonthlyAggregate| agg.step(breakpoint)));
        intervention_cols.push(names.len());
        names.push(slope_name(breakpoint).to_string());
        columns.push(Box::new(move |agg: &MonthlyAggregate| agg.slope(breakpoint)));
        for &covariate in layout.covariates {
            names.push(covariate.name().to_string());
            columns.push(Box::new(move |agg: &MonthlyAggregate| {
                covariate.value(agg).unwrap_or(f64::NAN)
            }));
        }

        let actual = Mat::from_fn(months.len(), columns.len(), |i, j| columns[j](months[i]));
        let counterfactual = Mat::from_fn(months.len(), columns.len(), |i, j| {
            if intervention_cols.contains(&j) {
                0.0
            } else {
                actual[(i, j)]
            }
        });
        Self {
            names,
            actual,
            counterfactual,
        }
    }
}

/// Keeps covariates that are present and vary across `months`.
fn usable_covariates(
    months: &[&MonthlyAggregate],
    candidates: &[Covariate],
    model: &str,
    notes: &mut Vec<String>,
) -> Vec<Covariate> {
    candidates
        .iter()
        .copied()
        .filter(|covariate| {
            let values: Option<Vec<f64>> = months.iter().map(|agg| covariate.value(agg)).collect();
            let Some(values) = values else {
                notes.push(format!(
                    "{model}: {} dropped, missing in at least one month",
                    covariate.name()
                ));
                return false;
            };
            let (lo, hi) = values
                .iter()
                .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
            if hi - lo < 1e-12 {
                notes.push(format!("{model}: {} dropped, constant across months", covariate.name()));
                return false;
            }
            true
        })
        .collect()
}

fn points(
    months: &[&MonthlyAggregate],
    observed: &[f64],
    fitted: &[f64],
    counterfactual: &[Forecast],
) -> Vec<CounterfactualPoint> {
    months
        .iter()
        .zip(observed)
        .zip(fitted)
        .zip(counterfactual)
        .map(|(((agg, &observed), &fitted), cf)| CounterfactualPoint {
            month: agg.month,
            observed,
            fitted,
            counterfactual: cf.mean,
            lower: cf.lower,
            upper: cf.upper,
        })
        .collect()
}

fn has_both_periods(months: &[&MonthlyAggregate], breakpoint: Breakpoint) -> bool {
    months.iter().any(|agg| agg.step(breakpoint) == 0.0)
        && months.iter().any(|agg| agg.step(breakpoint) > 0.0)
}

fn run_arima(
    series: &MonthlySeries,
    outcome: ContinuousOutcome,
    order: ArimaOrder,
    config: &AnalysisConfig,
    notes: &mut Vec<String>,
) -> std::result::Result<ArimaOutcome, String> {
    let breakpoint = config.breakpoint;
    if !series.is_contiguous() || !series.gaps().is_empty() {
        return Err(
            "ARIMA needs an unbroken monthly series and the study window has empty months"
                .to_string(),
        );
    }
    let months: Vec<&MonthlyAggregate> = series.observed().collect();
    let missing = months.iter().filter(|agg| outcome.value(agg).is_none()).count();
    if missing > 0 {
        return Err(format!("{missing} month(s) have no value for this outcome"));
    }
    if !has_both_periods(&months, breakpoint) {
        return Err("the breakpoint leaves no months on one side".to_string());
    }

    let y: Vec<f64> = months.iter().filter_map(|agg| outcome.value(agg)).collect();
    let model = format!("ARIMA{order} {}", outcome.label());
    let covariates = if config.adjust_for_covariates {
        usable_covariates(
            &months,
            &[
                Covariate::MaternalAge,
                Covariate::Primigravida,
                Covariate::Hiv,
                Covariate::HighRisk,
            ],
            &model,
            notes,
        )
    } else {
        Vec::new()
    };
    let design = Design::build(
        &months,
        DesignLayout {
            intercept: false,
            time: true,
            breakpoint,
            covariates: &covariates,
        },
    );

    let options = ArimaOptions {
        order,
        max_iterations: config.arima.max_iterations,
        tolerance: config.arima.tolerance,
        ljung_box_lags: config.arima.ljung_box_lags,
    };
    let fit = arima::fit_arima(&y, &design.actual, &design.names, &options).map_err(|e| e.to_string())?;
    let boundary = months
        .iter()
        .rposition(|agg| agg.step(breakpoint) == 0.0)
        .unwrap_or(0);
    let forecast = arima::counterfactual(
        &fit,
        &y,
        &design.counterfactual,
        boundary,
        config.confidence_level,
    )
    .map_err(|e| e.to_string())?;
    let counterfactual = points(&months, &y, &fit.fitted, &forecast);
    Ok(ArimaOutcome {
        outcome,
        fit,
        counterfactual,
    })
}

fn run_gee(
    series: &MonthlySeries,
    outcome: BinaryOutcome,
    config: &AnalysisConfig,
    notes: &mut Vec<String>,
) -> std::result::Result<GeeOutcome, String> {
    let breakpoint = config.breakpoint;
    let months: Vec<&MonthlyAggregate> = series.observed().collect();
    if !has_both_periods(&months, breakpoint) {
        return Err("the breakpoint leaves no months on one side".to_string());
    }
    let covariates = if config.adjust_for_covariates {
        usable_covariates(
            &months,
            &[Covariate::Primigravida, Covariate::Hiv, Covariate::HighRisk],
            &format!("GEE {}", outcome.label()),
            notes,
        )
    } else {
        Vec::new()
    };
    let design = Design::build(
        &months,
        DesignLayout {
            intercept: true,
            time: false,
            breakpoint,
            covariates: &covariates,
        },
    );

    let response: Vec<f64> = months.iter().map(|agg| outcome.rate(agg)).collect();
    let weights: Vec<f64> = months.iter().map(|agg| agg.records as f64).collect();
    let time: Vec<f64> = months.iter().map(|agg| f64::from(agg.month_index)).collect();
    let groups: Vec<i64> = months
        .iter()
        .map(|agg| match config.gee.grouping {
            PanelGrouping::SinglePanel => 0,
            PanelGrouping::CalendarYear => i64::from(agg.month.year()),
        })
        .collect();

    let data = GeeData {
        response: &response,
        weights: &weights,
        design: &design.actual,
        names: &design.names,
        time: &time,
        groups: &groups,
    };
    let options = GeeOptions {
        correlation: config.gee.correlation,
        covariance: config.gee.covariance,
        max_iterations: config.gee.max_iterations,
        tolerance: config.gee.tolerance,
        confidence: config.confidence_level,
    };
    let fit = gee::fit_gee(&data, &options).map_err(|e| e.to_string())?;
    let fitted: Vec<f64> = gee::predict(&fit, &design.actual, config.confidence_level)
        .iter()
        .map(|f| f.mean)
        .collect();
    let forecast = gee::predict(&fit, &design.counterfactual, config.confidence_level);
    let counterfactual = points(&months, &response, &fitted, &forecast);
    Ok(GeeOutcome {
        outcome,
        fit,
        counterfactual,
    })
}

fn run_segmented(
    series: &MonthlySeries,
    outcome: ContinuousOutcome,
    config: &AnalysisConfig,
    notes: &mut Vec<String>,
) -> std::result::Result<SegmentedOutcome, String> {
    let breakpoint = config.breakpoint;
    let months: Vec<&MonthlyAggregate> = series
        .observed()
        .filter(|agg| outcome.value(agg).is_some())
        .collect();
    let dropped = series.observed().count() - months.len();
    if dropped > 0 {
        notes.push(format!(
            "OLS {}: {dropped} month(s) without a value left out",
            outcome.label()
        ));
    }
    if !has_both_periods(&months, breakpoint) {
        return Err("the breakpoint leaves no months on one side".to_string());
    }

    let y: Vec<f64> = months.iter().filter_map(|agg| outcome.value(agg)).collect();
    let design = Design::build(
        &months,
        DesignLayout {
            intercept: true,
            time: true,
            breakpoint,
            covariates: &[],
        },
    );
    let fit = regression::fit_ols(&y, &design.actual, &design.names).map_err(|e| e.to_string())?;
    let forecast = regression::predict(&fit, &design.counterfactual, config.confidence_level);
    let counterfactual = points(&months, &y, &fit.fitted, &forecast);
    Ok(SegmentedOutcome {
        outcome,
        fit,
        counterfactual,
    })
}

fn naive_comparisons(series: &MonthlySeries, config: &AnalysisConfig) -> Vec<NaiveOutcome> {
    let breakpoint = config.breakpoint;
    [
        ContinuousOutcome::GaAtScan,
        ContinuousOutcome::GaAtBooking,
        ContinuousOutcome::BookingToScan,
    ]
    .into_iter()
    .filter_map(|outcome| {
        let (mut pre, mut post) = (Vec::new(), Vec::new());
        for agg in series.observed() {
            if let Some(value) = outcome.value(agg) {
                if agg.step(breakpoint) > 0.0 {
                    post.push(value);
                } else {
                    pre.push(value);
                }
            }
        }
        regression::naive_comparison(&pre, &post, config.confidence_level)
            .map(|comparison| NaiveOutcome { outcome, comparison })
    })
    .collect()
}

pub fn run_analysis(prepared: &PreparedSeries, config: &AnalysisConfig) -> AnalysisResults {
    let series = &prepared.series;
    let mut notes = Vec::new();
    let mut skipped = Vec::new();
    let mut skip = |model: String, reason: String| {
        warn!(%model, %reason, "model skipped");
        skipped.push(SkippedModel { model, reason });
    };

    let gaps = series.gaps();
    if !gaps.is_empty() {
        notes.push(format!(
            "{} month(s) of the study window have no records and are shown as gaps",
            gaps.len()
        ));
    }

    let mut arima_outcomes = Vec::new();
    for (outcome, order) in [
        (ContinuousOutcome::GaAtScan, config.arima.scan_order),
        (ContinuousOutcome::GaAtBooking, config.arima.booking_order),
    ] {
        match run_arima(series, outcome, order, config, &mut notes) {
            Ok(result) => arima_outcomes.push(result),
            Err(reason) => skip(format!("ARIMA{order} {}", outcome.label()), reason),
        }
    }

    let mut gee_outcomes = Vec::new();
    for outcome in BinaryOutcome::ALL {
        match run_gee(series, outcome, config, &mut notes) {
            Ok(result) => gee_outcomes.push(result),
            Err(reason) => skip(format!("GEE {}", outcome.label()), reason),
        }
    }

    let segmented = match run_segmented(series, ContinuousOutcome::BookingToScan, config, &mut notes) {
        Ok(result) => Some(result),
        Err(reason) => {
            skip(format!("OLS {}", ContinuousOutcome::BookingToScan.label()), reason);
            None
        }
    };

    let naive = naive_comparisons(series, config);

    info!(
        arima = arima_outcomes.len(),
        gee = gee_outcomes.len(),
        segmented = segmented.is_some(),
        skipped = skipped.len(),
        "analysis complete"
    );

    AnalysisResults {
        study: config.study.clone(),
        breakpoint: config.breakpoint,
        breakpoint_date: breakpoint_date(config),
        confidence_level: config.confidence_level,
        records: prepared.records.clone(),
        gaps,
        periods: aggregate::summarize_periods(series, config.breakpoint),
        series: series.clone(),
        arima: arima_outcomes,
        gee: gee_outcomes,
        segmented,
        naive,
        skipped,
        notes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GapPolicy;
    use crate::models::MonthRow;

    fn noise(state: &mut u64) -> f64 {
        *state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        ((*state >> 11) as f64 / (1u64 << 53) as f64 - 0.5) * 3.46
    }

    /// A 43-month window with a scan-timing drop and an uptake rise after the intervention.
    fn synthetic_series(config: &AnalysisConfig) -> MonthlySeries {
        let study = &config.study;
        let mut state = 99;
        let mut month = features::month_start(study.start);
        let mut rows = Vec::new();
        let mut index = 0;
        while month <= study.end {
            let post = features::post_flag(month, study.intervention);
            let since = features::months_since(month, study.intervention);
            let t = f64::from(index);
            let step = f64::from(post);
            let early_scan_rate =
                (0.30 + 0.15 * step + 0.002 * f64::from(since) + 0.02 * noise(&mut state)).clamp(0.0, 1.0);
            rows.push(MonthRow::Observed(MonthlyAggregate {
                month,
                month_index: index,
                records: 200,
                any_scans: 180,
                early_scans: (early_scan_rate * 200.0).round() as usize,
                early_bookings: 80,
                four_plus_visits: 120,
                mean_ga_scan: Some(180.0 - 0.1 * t - 12.0 * step + noise(&mut state)),
                mean_ga_booking: Some(150.0 - 0.05 * t - 4.0 * step + noise(&mut state)),
                mean_booking_to_scan: Some(40.0 - 8.0 * step + 0.5 * noise(&mut state)),
                mean_maternal_age: Some(27.0 + 0.2 * noise(&mut state)),
                any_scan_rate: (0.85 + 0.05 * step + 0.01 * noise(&mut state)).clamp(0.0, 1.0),
                early_scan_rate,
                early_booking_rate: (0.40 + 0.01 * noise(&mut state)).clamp(0.0, 1.0),
                four_plus_visits_rate: (0.60 + 0.01 * noise(&mut state)).clamp(0.0, 1.0),
                primigravida_rate: Some(0.35 + 0.01 * noise(&mut state)),
                hiv_rate: Some(0.0),
                high_risk_rate: Some(0.20 + 0.01 * noise(&mut state)),
                post_intervention: post,
                months_since_intervention: since,
                post_lag: features::post_flag(month, study.lag),
                months_since_lag: features::months_since(month, study.lag),
            }));
            month = features::next_month(month);
            index += 1;
        }
        MonthlySeries { rows }
    }

    fn prepared(series: MonthlySeries) -> PreparedSeries {
        PreparedSeries {
            records: RecordCounts {
                analysed: series.total_records(),
                ..RecordCounts::default()
            },
            series,
        }
    }

    #[test]
    fn full_run_fits_every_model() {
        let config = AnalysisConfig::default();
        let results = run_analysis(&prepared(synthetic_series(&config)), &config);

        assert!(results.skipped.is_empty(), "skipped: {:?}", results.skipped);
        assert_eq!(results.arima.len(), 2);
        assert_eq!(results.gee.len(), 4);
        assert!(results.segmented.is_some());
        assert_eq!(results.naive.len(), 3);
        assert_eq!(results.periods.len(), 2);
        assert_eq!(results.series.rows.len(), 43);

        let scan = &results.arima[0];
        assert_eq!(scan.outcome, ContinuousOutcome::GaAtScan);
        assert_eq!(scan.counterfactual.len(), 43);
        let step = scan
            .fit
            .coefficients
            .iter()
            .find(|c| c.name == "post_intervention")
            .unwrap();
        assert!(step.estimate < -6.0, "step = {}", step.estimate);

        // December 2018 is the first post month; November is the boundary.
        let boundary = scan
            .counterfactual
            .iter()
            .position(|p| p.month == NaiveDate::from_ymd_opt(2018, 11, 1).unwrap())
            .unwrap();
        let point = &scan.counterfactual[boundary];
        assert!((point.counterfactual - point.fitted).abs() < 1e-9);

        let early = &results.gee[0];
        assert_eq!(early.outcome, BinaryOutcome::EarlyScan);
        assert!(early.fit.odds_ratios[1].odds_ratio > 1.0);
    }

    #[test]
    fn lag_breakpoint_renames_regressors() {
        let mut config = AnalysisConfig::default();
        config.breakpoint = Breakpoint::Lag;
        let results = run_analysis(&prepared(synthetic_series(&config)), &config);
        assert_eq!(results.breakpoint_date, config.study.lag);
        let names = &results.gee[0].fit.names;
        assert_eq!(names, &["const", "post_lag", "months_since_lag"]);
    }

    #[test]
    fn gaps_skip_arima_but_keep_other_models() {
        let mut config = AnalysisConfig::default();
        config.gap_policy = GapPolicy::Mark;
        let mut series = synthetic_series(&config);
        if let MonthRow::Observed(agg) = &series.rows[5] {
            series.rows[5] = MonthRow::Gap {
                month: agg.month,
                month_index: agg.month_index,
            };
        }
        let results = run_analysis(&prepared(series), &config);

        assert!(results.arima.is_empty());
        assert_eq!(results.skipped.len(), 2);
        assert!(results.skipped[0].reason.contains("unbroken"));
        assert_eq!(results.gee.len(), 4);
        assert_eq!(results.gee[0].counterfactual.len(), 42);
        assert_eq!(results.gaps.len(), 1);
        assert!(results.notes.iter().any(|n| n.contains("gaps")));
    }

    #[test]
    fn constant_covariates_are_dropped_with_a_note() {
        let mut config = AnalysisConfig::default();
        config.adjust_for_covariates = true;
        let results = run_analysis(&prepared(synthetic_series(&config)), &config);
        assert!(results.notes.iter().any(|n| n.contains("hiv_rate dropped")));
        let names = &results.gee[0].fit.names;
        assert!(names.contains(&"primigravida_rate".to_string()));
        assert!(!names.contains(&"hiv_rate".to_string()));
    }

    #[test]
    fn breakpoint_outside_data_skips_models() {
        let config = AnalysisConfig::default();
        let mut series = synthetic_series(&config);
        series.rows.truncate(20);
        let results = run_analysis(&prepared(series), &config);
        assert!(results.arima.is_empty() && results.gee.is_empty());
        assert!(results.segmented.is_none());
        assert_eq!(results.skipped.len(), 7);
    }
}
