use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{AnalysisConfig, StudyWindow, Thresholds};
use crate::models::{DerivedRecord, PregnancyRecord, ScanTiming};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DerivedSet {
    pub records: Vec<DerivedRecord>,
    pub outside_window: usize,
    pub scans_after_delivery: usize,
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Whole calendar months from `from` to `to`; negative when `to` is earlier.
pub fn months_between(from: NaiveDate, to: NaiveDate) -> i32 {
    (to.year() - from.year()) * 12 + to.month() as i32 - from.month() as i32
}

/// First day of the month after `month`.
pub fn next_month(month: NaiveDate) -> NaiveDate {
    let month = month_start(month);
    if month.month() == 12 {
        NaiveDate::from_ymd_opt(month.year() + 1, 1, 1).unwrap_or(month)
    } else {
        NaiveDate::from_ymd_opt(month.year(), month.month() + 1, 1).unwrap_or(month)
    }
}

pub fn in_window(date: NaiveDate, study: &StudyWindow) -> bool {
    date >= study.start && date <= study.end
}

/// 1 when `date` falls strictly after `cutoff`.
pub fn post_flag(date: NaiveDate, cutoff: NaiveDate) -> u8 {
    u8::from(date > cutoff)
}

/// Months elapsed since the first calendar month that starts after `cutoff`.
/// Zero on or before the cutoff.
pub fn months_since(date: NaiveDate, cutoff: NaiveDate) -> u32 {
    if date <= cutoff {
        return 0;
    }
    let first_post_month = month_start(cutoff.succ_opt().unwrap_or(cutoff));
    months_between(first_post_month, month_start(date)).max(0) as u32
}

pub fn scan_timing(record: &PregnancyRecord, thresholds: &Thresholds) -> ScanTiming {
    match (record.ultrasound_date, record.ga_scan_days) {
        (_, Some(days)) if days < thresholds.early_scan_max_days => ScanTiming::Early,
        (_, Some(_)) => ScanTiming::Late,
        (Some(_), None) => ScanTiming::Undated,
        (None, None) => ScanTiming::NoScan,
    }
}

/// Places one record on the study calendar, or `None` when it falls outside the window.
pub fn derive_record(record: &PregnancyRecord, config: &AnalysisConfig) -> Option<DerivedRecord> {
    let study = &config.study;
    let thresholds = &config.thresholds;
    if !in_window(record.delivery_date, study) {
        return None;
    }

    let delivery_month = month_start(record.delivery_date);
    let month_index = months_between(month_start(study.start), delivery_month).max(0) as u32;
    let booking_to_scan_days = match (record.booking_date, record.ultrasound_date) {
        (Some(booked), Some(scanned)) => Some((scanned - booked).num_days()),
        _ => None,
    };

    Some(DerivedRecord {
        record: record.clone(),
        delivery_month,
        scan_month: record.ultrasound_date.map(month_start),
        month_index,
        post_intervention: post_flag(record.delivery_date, study.intervention),
        post_lag: post_flag(record.delivery_date, study.lag),
        months_since_intervention: months_since(record.delivery_date, study.intervention),
        months_since_lag: months_since(record.delivery_date, study.lag),
        primigravida: record.parity.map(|parity| parity == 0),
        scan_timing: scan_timing(record, thresholds),
        early_booking: record
            .ga_booking_days
            .map(|days| days < thresholds.early_booking_max_days),
        four_plus_visits: record.anc_visits.map(|visits| visits >= thresholds.min_visits),
        booking_to_scan_days,
    })
}

pub fn derive_records(records: &[PregnancyRecord], config: &AnalysisConfig) -> DerivedSet {
    let mut set = DerivedSet::default();

    for record in records {
        let Some(derived) = derive_record(record, config) else {
            set.outside_window += 1;
            continue;
        };
        if matches!(record.ultrasound_date, Some(scanned) if scanned > record.delivery_date) {
            set.scans_after_delivery += 1;
        }
        set.records.push(derived);
    }

    if set.scans_after_delivery > 0 {
        warn!(
            records = set.scans_after_delivery,
            "ultrasound dated after delivery; kept as recorded"
        );
    }
    info!(
        kept = set.records.len(),
        outside_window = set.outside_window,
        "derived calendar features"
    );
    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(delivery: NaiveDate) -> PregnancyRecord {
        PregnancyRecord {
            delivery_date: delivery,
            ultrasound_date: None,
            booking_date: None,
            ga_scan_days: None,
            ga_booking_days: None,
            parity: None,
            hiv_positive: None,
            high_risk: None,
            anc_visits: None,
            maternal_age: None,
        }
    }

    #[test]
    fn intervention_day_itself_is_pre() {
        let cutoff = date(2018, 11, 30);
        assert_eq!(post_flag(cutoff, cutoff), 0);
        assert_eq!(post_flag(date(2018, 12, 1), cutoff), 1);
        assert_eq!(months_since(cutoff, cutoff), 0);
    }

    #[test]
    fn months_since_counts_from_first_post_month() {
        let cutoff = date(2018, 11, 30);
        assert_eq!(post_flag(date(2018, 12, 15), cutoff), 1);
        assert_eq!(months_since(date(2018, 12, 15), cutoff), 0);
        assert_eq!(months_since(date(2019, 1, 3), cutoff), 1);
        assert_eq!(months_since(date(2019, 12, 31), cutoff), 12);
        assert_eq!(months_since(date(2017, 5, 1), cutoff), 0);
    }

    #[test]
    fn mid_month_cutoff_keeps_same_month_at_zero() {
        let cutoff = date(2018, 11, 15);
        assert_eq!(months_since(date(2018, 11, 20), cutoff), 0);
        assert_eq!(months_since(date(2018, 12, 1), cutoff), 1);
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let config = AnalysisConfig::default();
        assert!(derive_record(&record(date(2017, 1, 1)), &config).is_some());
        assert!(derive_record(&record(date(2020, 7, 31)), &config).is_some());
        assert!(derive_record(&record(date(2020, 8, 1)), &config).is_none());
        assert!(derive_record(&record(date(2016, 12, 31)), &config).is_none());
    }

    #[test]
    fn derives_month_index_and_indicators() {
        let config = AnalysisConfig::default();
        let mut raw = record(date(2019, 1, 20));
        raw.parity = Some(0);
        raw.ga_scan_days = Some(150);
        raw.ga_booking_days = Some(150);
        raw.anc_visits = Some(4);
        raw.booking_date = Some(date(2018, 7, 1));
        raw.ultrasound_date = Some(date(2018, 7, 11));

        let derived = derive_record(&raw, &config).unwrap();
        assert_eq!(derived.month_index, 24);
        assert_eq!(derived.delivery_month, date(2019, 1, 1));
        assert_eq!(derived.scan_month, Some(date(2018, 7, 1)));
        assert_eq!(derived.post_intervention, 1);
        assert_eq!(derived.months_since_intervention, 1);
        assert_eq!(derived.post_lag, 0);
        assert_eq!(derived.months_since_lag, 0);
        assert_eq!(derived.primigravida, Some(true));
        assert_eq!(derived.scan_timing, ScanTiming::Early);
        assert_eq!(derived.early_booking, Some(false));
        assert_eq!(derived.four_plus_visits, Some(true));
        assert_eq!(derived.booking_to_scan_days, Some(10));
    }

    #[test]
    fn scan_timing_distinguishes_undated_scans() {
        let thresholds = Thresholds::default();
        let mut raw = record(date(2019, 1, 20));
        assert_eq!(scan_timing(&raw, &thresholds), ScanTiming::NoScan);
        raw.ultrasound_date = Some(date(2018, 9, 1));
        assert_eq!(scan_timing(&raw, &thresholds), ScanTiming::Undated);
        raw.ga_scan_days = Some(168);
        assert_eq!(scan_timing(&raw, &thresholds), ScanTiming::Late);
        raw.ga_scan_days = Some(167);
        assert_eq!(scan_timing(&raw, &thresholds), ScanTiming::Early);
    }

    #[test]
    fn derive_records_counts_exclusions() {
        let config = AnalysisConfig::default();
        let mut late_scan = record(date(2018, 3, 3));
        late_scan.ultrasound_date = Some(date(2018, 3, 10));
        let set = derive_records(
            &[record(date(2016, 1, 1)), late_scan, record(date(2019, 5, 5))],
            &config,
        );
        assert_eq!(set.records.len(), 2);
        assert_eq!(set.outside_window, 1);
        assert_eq!(set.scans_after_delivery, 1);
    }

    #[test]
    fn next_month_rolls_over_year() {
        assert_eq!(next_month(date(2018, 12, 15)), date(2019, 1, 1));
        assert_eq!(next_month(date(2018, 2, 1)), date(2018, 3, 1));
    }

    proptest! {
        #[test]
        fn post_flag_matches_strict_comparison(offset in -2000i64..2000) {
            let cutoff = date(2018, 11, 30);
            let day = cutoff + chrono::Duration::days(offset);
            prop_assert_eq!(post_flag(day, cutoff) == 1, offset > 0);
            if offset <= 0 {
                prop_assert_eq!(months_since(day, cutoff), 0);
            }
        }

        #[test]
        fn months_since_never_decreases(a in 0i64..1500, b in 0i64..1500) {
            let cutoff = date(2018, 11, 30);
            let (early, late) = if a <= b { (a, b) } else { (b, a) };
            let first = months_since(cutoff + chrono::Duration::days(early), cutoff);
            let second = months_since(cutoff + chrono::Duration::days(late), cutoff);
            prop_assert!(first <= second);
        }
    }
}
