use std::io::Read;
use std::path::Path;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::InputConfig;
use crate::error::{AnalysisError, Result};
use crate::models::PregnancyRecord;

pub const REQUIRED_COLUMNS: [&str; 9] = [
    "delivery_date",
    "ultrasound_date",
    "booking_date",
    "ga_scan_days",
    "ga_booking_days",
    "parity",
    "hiv_status",
    "high_risk",
    "anc_visits",
];

const DAY_FIRST_FORMATS: [&str; 4] = ["%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%Y-%m-%d"];

/// Earliest year accepted. `%Y` also matches a two-digit year, which lands far below this.
const MIN_YEAR: i32 = 1900;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub rows_read: usize,
    pub missing_delivery_date: usize,
}

#[derive(serde::Deserialize)]
struct CsvRow {
    delivery_date: String,
    ultrasound_date: String,
    booking_date: String,
    ga_scan_days: String,
    ga_booking_days: String,
    parity: String,
    hiv_status: String,
    high_risk: String,
    anc_visits: String,
    #[serde(default)]
    maternal_age: String,
}

/// Recognises the tokens the source system writes for "no value".
struct Sentinels<'a> {
    tokens: &'a [String],
    placeholder_date: Option<NaiveDate>,
}

impl<'a> Sentinels<'a> {
    fn new(input: &'a InputConfig) -> Self {
        let placeholder_date = parse_date_formats(input.placeholder_date.trim());
        Self {
            tokens: &input.missing_tokens,
            placeholder_date,
        }
    }

    fn present<'v>(&self, raw: &'v str) -> Option<&'v str> {
        let value = raw.trim();
        if value.is_empty() || self.tokens.iter().any(|token| token.trim() == value) {
            None
        } else {
            Some(value)
        }
    }
}

pub fn load_records(
    path: &Path,
    input: &InputConfig,
) -> Result<(Vec<PregnancyRecord>, LoadSummary)> {
    let file = std::fs::File::open(path)?;
    let loaded = read_records(file, input)?;
    info!(
        path = %path.display(),
        rows = loaded.1.rows_read,
        kept = loaded.0.len(),
        "loaded pregnancy records"
    );
    Ok(loaded)
}

pub fn read_records<R: Read>(
    source: R,
    input: &InputConfig,
) -> Result<(Vec<PregnancyRecord>, LoadSummary)> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(source);
    let headers = reader.headers()?.clone();

    for column in REQUIRED_COLUMNS {
        if !headers.iter().any(|header| header == column) {
            return Err(AnalysisError::MissingColumn(column.to_string()));
        }
    }

    let sentinels = Sentinels::new(input);
    let mut summary = LoadSummary::default();
    let mut records = Vec::new();

    for result in reader.records() {
        let raw = result?;
        let line = raw.position().map_or(0, |pos| pos.line());
        let row: CsvRow = raw.deserialize(Some(&headers))?;
        summary.rows_read += 1;

        match parse_row(&row, line, &sentinels)? {
            Some(record) => records.push(record),
            None => {
                summary.missing_delivery_date += 1;
                debug!(line, "row has no delivery date, skipped");
            }
        }
    }

    if summary.missing_delivery_date > 0 {
        warn!(
            rows = summary.missing_delivery_date,
            "rows without a delivery date were skipped"
        );
    }

    Ok((records, summary))
}

fn parse_row(
    row: &CsvRow,
    line: u64,
    sentinels: &Sentinels<'_>,
) -> Result<Option<PregnancyRecord>> {
    let Some(delivery_date) = parse_date(&row.delivery_date, "delivery_date", line, sentinels)?
    else {
        return Ok(None);
    };

    Ok(Some(PregnancyRecord {
        delivery_date,
        ultrasound_date: parse_date(&row.ultrasound_date, "ultrasound_date", line, sentinels)?,
        booking_date: parse_date(&row.booking_date, "booking_date", line, sentinels)?,
        ga_scan_days: parse_count(&row.ga_scan_days, "ga_scan_days", line, sentinels)?,
        ga_booking_days: parse_count(&row.ga_booking_days, "ga_booking_days", line, sentinels)?,
        parity: parse_count(&row.parity, "parity", line, sentinels)?,
        hiv_positive: parse_flag(&row.hiv_status, "hiv_status", line, sentinels)?,
        high_risk: parse_flag(&row.high_risk, "high_risk", line, sentinels)?,
        anc_visits: parse_count(&row.anc_visits, "anc_visits", line, sentinels)?,
        maternal_age: parse_real(&row.maternal_age, "maternal_age", line, sentinels)?,
    }))
}

fn invalid(line: u64, column: &'static str, value: &str) -> AnalysisError {
    AnalysisError::InvalidValue {
        line,
        column,
        value: value.to_string(),
    }
}

fn parse_date_formats(value: &str) -> Option<NaiveDate> {
    DAY_FIRST_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
        .filter(|date| date.year() >= MIN_YEAR)
}

fn parse_date(
    raw: &str,
    column: &'static str,
    line: u64,
    sentinels: &Sentinels<'_>,
) -> Result<Option<NaiveDate>> {
    let Some(value) = sentinels.present(raw) else {
        return Ok(None);
    };
    let date = parse_date_formats(value).ok_or_else(|| invalid(line, column, value))?;
    if sentinels.placeholder_date == Some(date) {
        return Ok(None);
    }
    Ok(Some(date))
}

fn parse_count(
    raw: &str,
    column: &'static str,
    line: u64,
    sentinels: &Sentinels<'_>,
) -> Result<Option<u32>> {
    let Some(value) = sentinels.present(raw) else {
        return Ok(None);
    };
    if let Ok(count) = value.parse::<u32>() {
        return Ok(Some(count));
    }
    // Spreadsheet exports write whole numbers as "12.0".
    match value.parse::<f64>() {
        Ok(real) if real >= 0.0 && real.fract() == 0.0 && real <= f64::from(u32::MAX) => {
            Ok(Some(real as u32))
        }
        _ => Err(invalid(line, column, value)),
    }
}

fn parse_real(
    raw: &str,
    column: &'static str,
    line: u64,
    sentinels: &Sentinels<'_>,
) -> Result<Option<f64>> {
    let Some(value) = sentinels.present(raw) else {
        return Ok(None);
    };
    match value.parse::<f64>() {
        Ok(real) if real.is_finite() => Ok(Some(real)),
        _ => Err(invalid(line, column, value)),
    }
}

fn parse_flag(
    raw: &str,
    column: &'static str,
    line: u64,
    sentinels: &Sentinels<'_>,
) -> Result<Option<bool>> {
    let Some(value) = sentinels.present(raw) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "positive" | "pos" | "reactive" | "yes" | "y" | "true" | "1" => Ok(Some(true)),
        "negative" | "neg" | "non-reactive" | "no" | "n" | "false" | "0" => Ok(Some(false)),
        _ => Err(invalid(line, column, value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "delivery_date,ultrasound_date,booking_date,ga_scan_days,ga_booking_days,parity,hiv_status,high_risk,anc_visits";

    fn read(body: &str) -> Result<(Vec<PregnancyRecord>, LoadSummary)> {
        let text = format!("{HEADER}\n{body}");
        read_records(text.as_bytes(), &InputConfig::default())
    }

    #[test]
    fn parses_day_first_dates_and_values() {
        let (records, summary) =
            read("15/12/2018,02/07/2018,20/06/2018,140,120,0,Negative,No,5\n").unwrap();
        assert_eq!(summary.rows_read, 1);
        let record = &records[0];
        assert_eq!(record.delivery_date, NaiveDate::from_ymd_opt(2018, 12, 15).unwrap());
        assert_eq!(record.ultrasound_date, NaiveDate::from_ymd_opt(2018, 7, 2));
        assert_eq!(record.ga_scan_days, Some(140));
        assert_eq!(record.parity, Some(0));
        assert_eq!(record.hiv_positive, Some(false));
        assert_eq!(record.high_risk, Some(false));
        assert_eq!(record.anc_visits, Some(5));
        assert_eq!(record.maternal_age, None);
    }

    #[test]
    fn sentinels_become_absent() {
        let (records, _) = read(
            "03/03/2019,No Ultrasound,01/01/1900,NA,na,Unknown,Unknown,,N/A\n",
        )
        .unwrap();
        let record = &records[0];
        assert_eq!(record.ultrasound_date, None);
        assert_eq!(record.booking_date, None);
        assert_eq!(record.ga_scan_days, None);
        assert_eq!(record.ga_booking_days, None);
        assert_eq!(record.parity, None);
        assert_eq!(record.hiv_positive, None);
        assert_eq!(record.high_risk, None);
        assert_eq!(record.anc_visits, None);
    }

    #[test]
    fn rows_without_delivery_date_are_counted_and_skipped() {
        let (records, summary) = read(
            "NA,02/07/2018,20/06/2018,140,120,0,Negative,No,5\n\
             15/12/2018,02/07/2018,20/06/2018,140,120,1,Positive,Yes,3\n",
        )
        .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(summary.rows_read, 2);
        assert_eq!(summary.missing_delivery_date, 1);
        assert_eq!(records[0].hiv_positive, Some(true));
    }

    #[test]
    fn missing_required_column_fails_loudly() {
        let text = "delivery_date,ultrasound_date\n15/12/2018,02/07/2018\n";
        let err = read_records(text.as_bytes(), &InputConfig::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::MissingColumn(column) if column == "booking_date"));
    }

    #[test]
    fn garbage_value_reports_line_and_column() {
        let err = read(
            "15/12/2018,02/07/2018,20/06/2018,140,120,0,Negative,No,5\n\
             16/12/2018,02/07/2018,20/06/2018,soon,120,0,Negative,No,5\n",
        )
        .unwrap_err();
        match err {
            AnalysisError::InvalidValue { line, column, value } => {
                assert_eq!(line, 3);
                assert_eq!(column, "ga_scan_days");
                assert_eq!(value, "soon");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn two_digit_year_is_rejected() {
        let err = read("15/12/18,02/07/2018,20/06/2018,140,120,0,Negative,No,5\n").unwrap_err();
        match err {
            AnalysisError::InvalidValue { line, column, value } => {
                assert_eq!(line, 2);
                assert_eq!(column, "delivery_date");
                assert_eq!(value, "15/12/18");
            }
            other => panic!("unexpected error {other:?}"),
        }

        let err = read("15/12/2018,02/07/18,20/06/2018,140,120,0,Negative,No,5\n").unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidValue { column: "ultrasound_date", .. }));
    }

    #[test]
    fn whole_number_floats_are_accepted_as_counts() {
        let (records, _) = read("15/12/2018,,,140.0,,2.0,,,4.0\n").unwrap();
        assert_eq!(records[0].ga_scan_days, Some(140));
        assert_eq!(records[0].parity, Some(2));
        assert_eq!(records[0].anc_visits, Some(4));
    }

    #[test]
    fn optional_age_column_is_read_when_present() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{HEADER},maternal_age").unwrap();
        writeln!(file, "15/12/2018,02/07/2018,20/06/2018,140,120,0,Negative,No,5,27.5").unwrap();
        let (records, _) = load_records(file.path(), &InputConfig::default()).unwrap();
        assert_eq!(records[0].maternal_age, Some(27.5));
    }
}
