use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{Breakpoint, GapPolicy, StudyWindow};
use crate::error::{AnalysisError, Result};
use crate::features::{month_start, months_between, next_month};
use crate::models::{
    BinaryOutcome, ContinuousOutcome, DerivedRecord, MonthRow, MonthlyAggregate, MonthlySeries,
    ScanTiming,
};

#[derive(Default)]
struct Mean {
    sum: f64,
    n: usize,
}

impl Mean {
    fn push(&mut self, value: Option<f64>) {
        if let Some(value) = value {
            self.sum += value;
            self.n += 1;
        }
    }

    fn value(&self) -> Option<f64> {
        (self.n > 0).then(|| self.sum / self.n as f64)
    }
}

fn indicator(flag: bool) -> f64 {
    f64::from(u8::from(flag))
}

/// Counts feed the outcome rates; covariates are means over the records that report them.
#[derive(Default)]
struct MonthAccumulator {
    records: usize,
    any_scans: usize,
    early_scans: usize,
    early_bookings: usize,
    four_plus_visits: usize,
    primigravida: Mean,
    hiv: Mean,
    high_risk: Mean,
    ga_scan: Mean,
    ga_booking: Mean,
    booking_to_scan: Mean,
    maternal_age: Mean,
    post_intervention: u8,
    months_since_intervention: u32,
    post_lag: u8,
    months_since_lag: u32,
}

impl MonthAccumulator {
    fn push(&mut self, derived: &DerivedRecord) {
        let record = &derived.record;
        self.records += 1;
        self.any_scans += usize::from(derived.scan_timing.scanned());
        self.early_scans += usize::from(derived.scan_timing == ScanTiming::Early);
        self.early_bookings += usize::from(derived.early_booking == Some(true));
        self.four_plus_visits += usize::from(derived.four_plus_visits == Some(true));
        self.primigravida.push(derived.primigravida.map(indicator));
        self.hiv.push(record.hiv_positive.map(indicator));
        self.high_risk.push(record.high_risk.map(indicator));
        self.ga_scan.push(record.ga_scan_days.map(f64::from));
        self.ga_booking.push(record.ga_booking_days.map(f64::from));
        self.booking_to_scan
            .push(derived.booking_to_scan_days.map(|days| days as f64));
        self.maternal_age.push(record.maternal_age);
        self.post_intervention = self.post_intervention.max(derived.post_intervention);
        self.months_since_intervention = self
            .months_since_intervention
            .max(derived.months_since_intervention);
        self.post_lag = self.post_lag.max(derived.post_lag);
        self.months_since_lag = self.months_since_lag.max(derived.months_since_lag);
    }

    fn finish(self, month: NaiveDate, month_index: u32) -> MonthlyAggregate {
        let n = self.records as f64;
        let rate = |successes: usize| successes as f64 / n;
        MonthlyAggregate {
            month,
            month_index,
            records: self.records,
            any_scans: self.any_scans,
            early_scans: self.early_scans,
            early_bookings: self.early_bookings,
            four_plus_visits: self.four_plus_visits,
            mean_ga_scan: self.ga_scan.value(),
            mean_ga_booking: self.ga_booking.value(),
            mean_booking_to_scan: self.booking_to_scan.value(),
            mean_maternal_age: self.maternal_age.value(),
            any_scan_rate: rate(self.any_scans),
            early_scan_rate: rate(self.early_scans),
            early_booking_rate: rate(self.early_bookings),
            four_plus_visits_rate: rate(self.four_plus_visits),
            primigravida_rate: self.primigravida.value(),
            hiv_rate: self.hiv.value(),
            high_risk_rate: self.high_risk.value(),
            post_intervention: self.post_intervention,
            months_since_intervention: self.months_since_intervention,
            post_lag: self.post_lag,
            months_since_lag: self.months_since_lag,
        }
    }
}

/// Builds one row per calendar month of the study window.
///
/// Months without records become [`MonthRow::Gap`]; under [`GapPolicy::Error`]
/// any gap aborts aggregation instead.
pub fn aggregate_monthly(
    records: &[DerivedRecord],
    study: &StudyWindow,
    gap_policy: GapPolicy,
) -> Result<MonthlySeries> {
    if records.is_empty() {
        return Err(AnalysisError::EmptyWindow {
            start: study.start,
            end: study.end,
        });
    }

    let mut by_month: BTreeMap<u32, MonthAccumulator> = BTreeMap::new();
    for derived in records {
        by_month.entry(derived.month_index).or_default().push(derived);
    }

    let first_month = month_start(study.start);
    let span = months_between(first_month, month_start(study.end)).max(0) as u32;
    let mut rows = Vec::with_capacity(span as usize + 1);
    let mut month = first_month;

    for month_index in 0..=span {
        let row = match by_month.remove(&month_index) {
            Some(acc) => MonthRow::Observed(acc.finish(month, month_index)),
            None => MonthRow::Gap { month, month_index },
        };
        rows.push(row);
        month = next_month(month);
    }

    let series = MonthlySeries { rows };
    let gaps = series.gaps();
    if !gaps.is_empty() {
        match gap_policy {
            GapPolicy::Error => return Err(AnalysisError::MonthGap(gaps)),
            GapPolicy::Mark => warn!(months = gaps.len(), "empty months marked as gaps"),
        }
    }

    info!(
        months = series.rows.len(),
        records = series.total_records(),
        "aggregated monthly series"
    );
    Ok(series)
}

/// Pre- or post-breakpoint descriptive summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeriodSummary {
    pub period: &'static str,
    pub months: usize,
    pub records: usize,
    pub continuous: Vec<(ContinuousOutcome, Option<f64>)>,
    pub rates: Vec<(BinaryOutcome, f64)>,
}

pub fn summarize_periods(series: &MonthlySeries, breakpoint: Breakpoint) -> Vec<PeriodSummary> {
    let (pre, post): (Vec<&MonthlyAggregate>, Vec<&MonthlyAggregate>) =
        series.observed().partition(|agg| agg.step(breakpoint) == 0.0);

    [("pre", pre), ("post", post)]
        .into_iter()
        .filter(|(_, months)| !months.is_empty())
        .map(|(period, months)| {
            let records: usize = months.iter().map(|agg| agg.records).sum();
            let continuous = [
                ContinuousOutcome::GaAtScan,
                ContinuousOutcome::GaAtBooking,
                ContinuousOutcome::BookingToScan,
            ]
            .into_iter()
            .map(|outcome| {
                let mut mean = Mean::default();
                for agg in &months {
                    mean.push(outcome.value(agg));
                }
                (outcome, mean.value())
            })
            .collect();
            let rates = BinaryOutcome::ALL
                .into_iter()
                .map(|outcome| {
                    let successes: f64 = months
                        .iter()
                        .map(|agg| outcome.rate(agg) * agg.records as f64)
                        .sum();
                    (outcome, successes / records as f64)
                })
                .collect();
            PeriodSummary {
                period,
                months: months.len(),
                records,
                continuous,
                rates,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalysisConfig;
    use crate::features::derive_record;
    use crate::models::PregnancyRecord;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn short_window() -> AnalysisConfig {
        let mut config = AnalysisConfig::default();
        config.study = StudyWindow {
            start: date(2018, 10, 1),
            end: date(2019, 1, 31),
            intervention: date(2018, 11, 30),
            lag: date(2018, 12, 31),
        };
        config
    }

    fn record(delivery: NaiveDate, ga_scan: Option<u32>) -> PregnancyRecord {
        PregnancyRecord {
            delivery_date: delivery,
            ultrasound_date: None,
            booking_date: None,
            ga_scan_days: ga_scan,
            ga_booking_days: None,
            parity: Some(1),
            hiv_positive: Some(false),
            high_risk: None,
            anc_visits: Some(4),
            maternal_age: None,
        }
    }

    fn derive_all(config: &AnalysisConfig, raws: &[PregnancyRecord]) -> Vec<DerivedRecord> {
        raws.iter()
            .filter_map(|raw| derive_record(raw, config))
            .collect()
    }

    fn observed(series: &MonthlySeries) -> Vec<&MonthlyAggregate> {
        series.observed().collect()
    }

    #[test]
    fn six_of_ten_early_scans_give_rate_point_six() {
        let config = short_window();
        let mut raws = Vec::new();
        for day in 1..=10 {
            let ga = if day <= 6 { 100 } else { 200 };
            raws.push(record(date(2018, 10, day), Some(ga)));
        }
        for month in [11, 12] {
            raws.push(record(date(2018, month, 5), Some(120)));
        }
        raws.push(record(date(2019, 1, 5), None));

        let series =
            aggregate_monthly(&derive_all(&config, &raws), &config.study, GapPolicy::Error).unwrap();
        let october = observed(&series)[0];
        assert_eq!(october.records, 10);
        assert!((october.early_scan_rate - 0.6).abs() < 1e-12);
        assert!((october.any_scan_rate - 1.0).abs() < 1e-12);
        assert_eq!(october.mean_ga_scan, Some(140.0));
        assert_eq!(october.post_intervention, 0);

        let january = observed(&series)[3];
        assert_eq!(january.mean_ga_scan, None);
        assert_eq!(january.any_scan_rate, 0.0);
        assert_eq!(january.post_intervention, 1);
        assert_eq!(january.months_since_intervention, 1);
        assert_eq!(january.post_lag, 1);
        assert_eq!(january.months_since_lag, 0);
    }

    #[test]
    fn empty_month_is_an_error_by_default() {
        let config = short_window();
        let raws = vec![
            record(date(2018, 10, 2), Some(100)),
            record(date(2018, 12, 2), Some(100)),
            record(date(2019, 1, 2), Some(100)),
        ];
        let derived = derive_all(&config, &raws);
        let err = aggregate_monthly(&derived, &config.study, GapPolicy::Error).unwrap_err();
        assert!(matches!(err, AnalysisError::MonthGap(ref months) if months == &vec![date(2018, 11, 1)]));

        let series = aggregate_monthly(&derived, &config.study, GapPolicy::Mark).unwrap();
        assert_eq!(series.rows.len(), 4);
        assert_eq!(series.gaps(), vec![date(2018, 11, 1)]);
        assert!(!series.is_contiguous());
    }

    #[test]
    fn no_records_is_an_empty_window() {
        let config = short_window();
        let err = aggregate_monthly(&[], &config.study, GapPolicy::Mark).unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyWindow { .. }));
    }

    #[test]
    fn period_summary_splits_on_breakpoint() {
        let config = short_window();
        let raws = vec![
            record(date(2018, 10, 2), Some(100)),
            record(date(2018, 11, 2), Some(200)),
            record(date(2018, 12, 2), Some(100)),
            record(date(2019, 1, 2), Some(100)),
            record(date(2019, 1, 3), Some(100)),
        ];
        let series =
            aggregate_monthly(&derive_all(&config, &raws), &config.study, GapPolicy::Error).unwrap();
        let periods = summarize_periods(&series, Breakpoint::Intervention);
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].period, "pre");
        assert_eq!(periods[0].records, 2);
        assert_eq!(periods[1].records, 3);
        let (_, early_rate) = periods[0].rates[0];
        assert!((early_rate - 0.5).abs() < 1e-12);
        assert_eq!(periods[1].continuous[0].1, Some(100.0));
    }

    #[test]
    fn covariate_means_skip_missing_values() {
        let config = short_window();
        let mut known = record(date(2018, 10, 3), Some(100));
        known.hiv_positive = Some(true);
        known.parity = Some(0);
        let mut unknown = record(date(2018, 10, 4), Some(100));
        unknown.hiv_positive = None;
        unknown.parity = None;
        let mut raws = vec![known, unknown];
        for month in [11, 12] {
            raws.push(record(date(2018, month, 5), Some(120)));
        }
        raws.push(record(date(2019, 1, 5), Some(120)));

        let series =
            aggregate_monthly(&derive_all(&config, &raws), &config.study, GapPolicy::Error).unwrap();
        let october = observed(&series)[0];
        assert_eq!(october.records, 2);
        assert_eq!(october.hiv_rate, Some(1.0));
        assert_eq!(october.primigravida_rate, Some(1.0));
        assert_eq!(october.high_risk_rate, None);

        let november = observed(&series)[1];
        assert_eq!(november.hiv_rate, Some(0.0));
        assert_eq!(november.primigravida_rate, Some(0.0));
    }

    fn within_observed(mean: Option<f64>, values: &[f64]) -> bool {
        match mean {
            None => values.is_empty(),
            Some(mean) => {
                let lo = values.iter().cloned().fold(f64::INFINITY, f64::min);
                let hi = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
                mean >= lo - 1e-9 && mean <= hi + 1e-9
            }
        }
    }

    proptest! {
        #[test]
        fn counts_sum_and_means_stay_within_observed_values(
            rows in proptest::collection::vec(
                (0i64..122, proptest::option::of(0u32..300), proptest::option::of(0u32..6),
                 proptest::option::of(15.0f64..45.0), proptest::option::of(any::<bool>()),
                 proptest::option::of(any::<bool>())),
                4..200,
            )
        ) {
            let config = short_window();
            let mut raws: Vec<PregnancyRecord> = rows
                .iter()
                .map(|(offset, ga, parity, age, hiv, high_risk)| {
                    let mut raw = record(config.study.start + chrono::Duration::days(*offset), *ga);
                    raw.parity = *parity;
                    raw.maternal_age = *age;
                    raw.hiv_positive = *hiv;
                    raw.high_risk = *high_risk;
                    raw
                })
                .collect();
            // Guarantee every month is populated.
            for month in [10, 11, 12] {
                raws.push(record(date(2018, month, 15), None));
            }
            raws.push(record(date(2019, 1, 15), None));

            let derived = derive_all(&config, &raws);
            let series = aggregate_monthly(&derived, &config.study, GapPolicy::Error).unwrap();
            prop_assert_eq!(series.total_records(), derived.len());

            let flag = |value: Option<bool>| value.map(indicator);
            for agg in series.observed() {
                for rate in [agg.any_scan_rate, agg.early_scan_rate, agg.early_booking_rate,
                             agg.four_plus_visits_rate] {
                    prop_assert!((0.0..=1.0).contains(&rate));
                }
                let month: Vec<&DerivedRecord> = derived
                    .iter()
                    .filter(|d| d.month_index == agg.month_index)
                    .collect();
                let ages: Vec<f64> = month.iter().filter_map(|d| d.record.maternal_age).collect();
                let primigravida: Vec<f64> = month.iter().filter_map(|d| flag(d.primigravida)).collect();
                let hiv: Vec<f64> = month.iter().filter_map(|d| flag(d.record.hiv_positive)).collect();
                let high_risk: Vec<f64> = month.iter().filter_map(|d| flag(d.record.high_risk)).collect();
                prop_assert!(within_observed(agg.mean_maternal_age, &ages));
                prop_assert!(within_observed(agg.primigravida_rate, &primigravida));
                prop_assert!(within_observed(agg.hiv_rate, &hiv));
                prop_assert!(within_observed(agg.high_risk_rate, &high_risk));
            }
        }
    }
}
