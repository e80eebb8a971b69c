use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::config::Breakpoint;

/// One pregnancy episode as it arrived in the input file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PregnancyRecord {
    pub delivery_date: NaiveDate,
    pub ultrasound_date: Option<NaiveDate>,
    pub booking_date: Option<NaiveDate>,
    pub ga_scan_days: Option<u32>,
    pub ga_booking_days: Option<u32>,
    pub parity: Option<u32>,
    pub hiv_positive: Option<bool>,
    pub high_risk: Option<bool>,
    pub anc_visits: Option<u32>,
    pub maternal_age: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanTiming {
    Early,
    Late,
    /// Scanned, but the gestational age at the scan was not recorded.
    Undated,
    NoScan,
}

impl ScanTiming {
    pub fn scanned(self) -> bool {
        !matches!(self, ScanTiming::NoScan)
    }
}

/// A record placed on the study calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedRecord {
    pub record: PregnancyRecord,
    pub delivery_month: NaiveDate,
    pub scan_month: Option<NaiveDate>,
    pub month_index: u32,
    pub post_intervention: u8,
    pub post_lag: u8,
    pub months_since_intervention: u32,
    pub months_since_lag: u32,
    pub primigravida: Option<bool>,
    pub scan_timing: ScanTiming,
    pub early_booking: Option<bool>,
    pub four_plus_visits: Option<bool>,
    pub booking_to_scan_days: Option<i64>,
}

/// Summary of one calendar month with at least one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyAggregate {
    pub month: NaiveDate,
    pub month_index: u32,
    pub records: usize,
    pub any_scans: usize,
    pub early_scans: usize,
    pub early_bookings: usize,
    pub four_plus_visits: usize,
    pub mean_ga_scan: Option<f64>,
    pub mean_ga_booking: Option<f64>,
    pub mean_booking_to_scan: Option<f64>,
    pub mean_maternal_age: Option<f64>,
    pub any_scan_rate: f64,
    pub early_scan_rate: f64,
    pub early_booking_rate: f64,
    pub four_plus_visits_rate: f64,
    pub primigravida_rate: Option<f64>,
    pub hiv_rate: Option<f64>,
    pub high_risk_rate: Option<f64>,
    pub post_intervention: u8,
    pub months_since_intervention: u32,
    pub post_lag: u8,
    pub months_since_lag: u32,
}

impl MonthlyAggregate {
    pub fn step(&self, breakpoint: Breakpoint) -> f64 {
        match breakpoint {
            Breakpoint::Intervention => f64::from(self.post_intervention),
            Breakpoint::Lag => f64::from(self.post_lag),
        }
    }

    pub fn slope(&self, breakpoint: Breakpoint) -> f64 {
        match breakpoint {
            Breakpoint::Intervention => f64::from(self.months_since_intervention),
            Breakpoint::Lag => f64::from(self.months_since_lag),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MonthRow {
    Observed(MonthlyAggregate),
    Gap { month: NaiveDate, month_index: u32 },
}

/// Every calendar month of the study window, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlySeries {
    pub rows: Vec<MonthRow>,
}

impl MonthlySeries {
    pub fn observed(&self) -> impl Iterator<Item = &MonthlyAggregate> {
        self.rows.iter().filter_map(|row| match row {
            MonthRow::Observed(agg) => Some(agg),
            MonthRow::Gap { .. } => None,
        })
    }

    pub fn gaps(&self) -> Vec<NaiveDate> {
        self.rows
            .iter()
            .filter_map(|row| match row {
                MonthRow::Gap { month, .. } => Some(*month),
                MonthRow::Observed(_) => None,
            })
            .collect()
    }

    pub fn total_records(&self) -> usize {
        self.observed().map(|agg| agg.records).sum()
    }

    /// True when the observed months form one unbroken run.
    pub fn is_contiguous(&self) -> bool {
        let indices: Vec<u32> = self.observed().map(|agg| agg.month_index).collect();
        indices.windows(2).all(|pair| pair[1] == pair[0] + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContinuousOutcome {
    GaAtScan,
    GaAtBooking,
    BookingToScan,
}

impl ContinuousOutcome {
    pub fn label(self) -> &'static str {
        match self {
            ContinuousOutcome::GaAtScan => "Mean gestational age at first scan (days)",
            ContinuousOutcome::GaAtBooking => "Mean gestational age at booking (days)",
            ContinuousOutcome::BookingToScan => "Mean booking-to-ultrasound interval (days)",
        }
    }

    pub fn value(self, agg: &MonthlyAggregate) -> Option<f64> {
        match self {
            ContinuousOutcome::GaAtScan => agg.mean_ga_scan,
            ContinuousOutcome::GaAtBooking => agg.mean_ga_booking,
            ContinuousOutcome::BookingToScan => agg.mean_booking_to_scan,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOutcome {
    EarlyScan,
    AnyScan,
    EarlyBooking,
    FourPlusVisits,
}

impl BinaryOutcome {
    pub const ALL: [BinaryOutcome; 4] = [
        BinaryOutcome::EarlyScan,
        BinaryOutcome::AnyScan,
        BinaryOutcome::EarlyBooking,
        BinaryOutcome::FourPlusVisits,
    ];

    pub fn label(self) -> &'static str {
        match self {
            BinaryOutcome::EarlyScan => "Early ultrasound rate",
            BinaryOutcome::AnyScan => "Any ultrasound rate",
            BinaryOutcome::EarlyBooking => "Early booking rate",
            BinaryOutcome::FourPlusVisits => "Four or more antenatal visits rate",
        }
    }

    pub fn rate(self, agg: &MonthlyAggregate) -> f64 {
        match self {
            BinaryOutcome::EarlyScan => agg.early_scan_rate,
            BinaryOutcome::AnyScan => agg.any_scan_rate,
            BinaryOutcome::EarlyBooking => agg.early_booking_rate,
            BinaryOutcome::FourPlusVisits => agg.four_plus_visits_rate,
        }
    }
}

/// Monthly covariates available for adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Covariate {
    MaternalAge,
    Primigravida,
    Hiv,
    HighRisk,
}

impl Covariate {
    pub fn name(self) -> &'static str {
        match self {
            Covariate::MaternalAge => "mean_maternal_age",
            Covariate::Primigravida => "primigravida_rate",
            Covariate::Hiv => "hiv_rate",
            Covariate::HighRisk => "high_risk_rate",
        }
    }

    pub fn value(self, agg: &MonthlyAggregate) -> Option<f64> {
        match self {
            Covariate::MaternalAge => agg.mean_maternal_age,
            Covariate::Primigravida => agg.primigravida_rate,
            Covariate::Hiv => agg.hiv_rate,
            Covariate::HighRisk => agg.high_risk_rate,
        }
    }
}

/// One row of a regression table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub estimate: f64,
    pub std_error: f64,
    pub statistic: f64,
    pub p_value: f64,
}

/// Observed value next to the model's with- and without-intervention predictions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterfactualPoint {
    pub month: NaiveDate,
    pub observed: f64,
    pub fitted: f64,
    pub counterfactual: f64,
    pub lower: f64,
    pub upper: f64,
}

/// A point prediction with its two-sided interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FitStatus {
    pub converged: bool,
    pub iterations: usize,
    pub warnings: Vec<String>,
}
