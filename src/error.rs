use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("input is missing required column `{0}`")]
    MissingColumn(String),

    #[error("line {line}: column `{column}` has unparseable value `{value}`")]
    InvalidValue {
        line: u64,
        column: &'static str,
        value: String,
    },

    #[error("no records fall inside the study window {start} to {end}")]
    EmptyWindow { start: NaiveDate, end: NaiveDate },

    #[error("months with zero records inside the study window: {}", format_months(.0))]
    MonthGap(Vec<NaiveDate>),

    #[error("{model}: need at least {required} observations, have {available}")]
    InsufficientData {
        model: String,
        required: usize,
        available: usize,
    },

    #[error("{0}: design matrix is singular or not positive definite")]
    SingularMatrix(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

fn format_months(months: &[NaiveDate]) -> String {
    months
        .iter()
        .map(|m| m.format("%Y-%m").to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
