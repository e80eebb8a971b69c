use std::path::Path;

use chrono::NaiveDate;
use serde::Serialize;

use crate::analysis::AnalysisResults;
use crate::error::Result;
use crate::models::{MonthRow, MonthlySeries};

/// Flat CSV shape of one month; gap months keep their date and leave the rest empty.
#[derive(Debug, Serialize)]
struct MonthCsvRow {
    month: NaiveDate,
    month_index: u32,
    records: usize,
    mean_ga_scan: Option<f64>,
    mean_ga_booking: Option<f64>,
    mean_booking_to_scan: Option<f64>,
    mean_maternal_age: Option<f64>,
    any_scan_rate: Option<f64>,
    early_scan_rate: Option<f64>,
    early_booking_rate: Option<f64>,
    four_plus_visits_rate: Option<f64>,
    primigravida_rate: Option<f64>,
    hiv_rate: Option<f64>,
    high_risk_rate: Option<f64>,
    post_intervention: Option<u8>,
    months_since_intervention: Option<u32>,
    post_lag: Option<u8>,
    months_since_lag: Option<u32>,
}

impl From<&MonthRow> for MonthCsvRow {
    fn from(row: &MonthRow) -> Self {
        match row {
            MonthRow::Observed(agg) => Self {
                month: agg.month,
                month_index: agg.month_index,
                records: agg.records,
                mean_ga_scan: agg.mean_ga_scan,
                mean_ga_booking: agg.mean_ga_booking,
                mean_booking_to_scan: agg.mean_booking_to_scan,
                mean_maternal_age: agg.mean_maternal_age,
                any_scan_rate: Some(agg.any_scan_rate),
                early_scan_rate: Some(agg.early_scan_rate),
                early_booking_rate: Some(agg.early_booking_rate),
                four_plus_visits_rate: Some(agg.four_plus_visits_rate),
                primigravida_rate: agg.primigravida_rate,
                hiv_rate: agg.hiv_rate,
                high_risk_rate: agg.high_risk_rate,
                post_intervention: Some(agg.post_intervention),
                months_since_intervention: Some(agg.months_since_intervention),
                post_lag: Some(agg.post_lag),
                months_since_lag: Some(agg.months_since_lag),
            },
            MonthRow::Gap { month, month_index } => Self {
                month: *month,
                month_index: *month_index,
                records: 0,
                mean_ga_scan: None,
                mean_ga_booking: None,
                mean_booking_to_scan: None,
                mean_maternal_age: None,
                any_scan_rate: None,
                early_scan_rate: None,
                early_booking_rate: None,
                four_plus_visits_rate: None,
                primigravida_rate: None,
                hiv_rate: None,
                high_risk_rate: None,
                post_intervention: None,
                months_since_intervention: None,
                post_lag: None,
                months_since_lag: None,
            },
        }
    }
}

pub fn write_monthly_csv(series: &MonthlySeries, path: &Path) -> Result<usize> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in &series.rows {
        writer.serialize(MonthCsvRow::from(row))?;
    }
    writer.flush()?;
    Ok(series.rows.len())
}

pub fn results_json(results: &AnalysisResults) -> Result<String> {
    Ok(serde_json::to_string_pretty(results)?)
}

pub fn write_json(results: &AnalysisResults, path: &Path) -> Result<()> {
    std::fs::write(path, results_json(results)?)?;
    Ok(())
}
