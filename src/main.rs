use std::path::PathBuf;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod aggregate;
mod analysis;
mod arima;
mod config;
mod error;
mod export;
mod features;
mod gee;
mod ingest;
mod linalg;
mod models;
mod optimize;
mod regression;
mod report;
mod stats;

use config::AnalysisConfig;

#[derive(Parser)]
#[command(name = "anc-its")]
#[command(about = "Interrupted time series analysis of decentralised antenatal ultrasound", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StudyArgs {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long)]
    config: Option<PathBuf>,
    /// First delivery date in the study window (YYYY-MM-DD)
    #[arg(long)]
    start: Option<NaiveDate>,
    /// Last delivery date in the study window (YYYY-MM-DD)
    #[arg(long)]
    end: Option<NaiveDate>,
    #[arg(long)]
    intervention: Option<NaiveDate>,
    #[arg(long)]
    lag: Option<NaiveDate>,
}

impl StudyArgs {
    fn load(&self) -> anyhow::Result<AnalysisConfig> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::from_path(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => AnalysisConfig::default(),
        };
        config.apply_overrides(self.start, self.end, self.intervention, self.lag);
        config.validate().context("invalid study settings")?;
        Ok(config)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration as TOML
    InitConfig {
        #[arg(long, default_value = "analysis.toml")]
        out: PathBuf,
    },
    /// Load records and print the monthly summary table
    Summarize {
        #[arg(long)]
        csv: PathBuf,
        /// Also write the monthly table as CSV
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        study: StudyArgs,
    },
    /// Run the full interrupted time series analysis
    Analyze {
        #[arg(long)]
        csv: PathBuf,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
        /// Also write every model artifact as JSON
        #[arg(long)]
        json: Option<PathBuf>,
        #[command(flatten)]
        study: StudyArgs,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::InitConfig { out } => {
            let text = AnalysisConfig::default().to_toml()?;
            std::fs::write(&out, text)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Default configuration written to {}.", out.display());
        }
        Commands::Summarize { csv, out, study } => {
            let config = study.load()?;
            let prepared = analysis::prepare(&csv, &config)
                .with_context(|| format!("failed to prepare {}", csv.display()))?;

            print!("{}", report::monthly_table(&prepared.series));
            println!(
                "{} records across {} months ({} outside the window, {} without a delivery date).",
                prepared.records.analysed,
                prepared.series.rows.len(),
                prepared.records.outside_window,
                prepared.records.missing_delivery_date
            );
            if let Some(out) = out {
                let rows = export::write_monthly_csv(&prepared.series, &out)
                    .with_context(|| format!("failed to write {}", out.display()))?;
                println!("Wrote {rows} months to {}.", out.display());
            }
        }
        Commands::Analyze {
            csv,
            out,
            json,
            study,
        } => {
            let config = study.load()?;
            let prepared = analysis::prepare(&csv, &config)
                .with_context(|| format!("failed to prepare {}", csv.display()))?;
            let results = analysis::run_analysis(&prepared, &config);

            let report = report::build_report(&results);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());

            if let Some(json) = json {
                export::write_json(&results, &json)
                    .with_context(|| format!("failed to write {}", json.display()))?;
                println!("Model artifacts written to {}.", json.display());
            }
            if !results.skipped.is_empty() {
                println!("{} model(s) skipped; see the report notes.", results.skipped.len());
            }
        }
    }

    Ok(())
}
