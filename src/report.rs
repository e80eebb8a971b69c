use std::fmt::Write;

use crate::analysis::AnalysisResults;
use crate::config::Breakpoint;
use crate::models::{Coefficient, CounterfactualPoint, FitStatus, MonthRow, MonthlySeries};

fn fmt_value(value: f64, decimals: usize) -> String {
    if value.is_finite() {
        format!("{value:.decimals$}")
    } else {
        "n/a".to_string()
    }
}

fn fmt_p(p: f64) -> String {
    if !p.is_finite() {
        "n/a".to_string()
    } else if p < 0.001 {
        "<0.001".to_string()
    } else {
        format!("{p:.3}")
    }
}

fn fmt_option(value: Option<f64>, decimals: usize) -> String {
    value.map_or_else(|| "-".to_string(), |v| fmt_value(v, decimals))
}

fn percent(rate: f64) -> String {
    format!("{:.1}%", rate * 100.0)
}

fn write_coefficients(output: &mut String, statistic: &str, coefficients: &[Coefficient]) {
    let _ = writeln!(output, "| Term | Coefficient | SE | {statistic} | p-value |");
    let _ = writeln!(output, "|---|---:|---:|---:|---:|");
    for c in coefficients {
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} |",
            c.name,
            fmt_value(c.estimate, 4),
            fmt_value(c.std_error, 4),
            fmt_value(c.statistic, 2),
            fmt_p(c.p_value)
        );
    }
    let _ = writeln!(output);
}

fn write_counterfactual(
    output: &mut String,
    points: &[CounterfactualPoint],
    decimals: usize,
    confidence: f64,
) {
    let level = (confidence * 100.0).round();
    let _ = writeln!(
        output,
        "| Month | Observed | Fitted | Counterfactual | Lower {level}% | Upper {level}% |"
    );
    let _ = writeln!(output, "|---|---:|---:|---:|---:|---:|");
    for point in points {
        let _ = writeln!(
            output,
            "| {} | {} | {} | {} | {} | {} |",
            point.month.format("%Y-%m"),
            fmt_value(point.observed, decimals),
            fmt_value(point.fitted, decimals),
            fmt_value(point.counterfactual, decimals),
            fmt_value(point.lower, decimals),
            fmt_value(point.upper, decimals)
        );
    }
    let _ = writeln!(output);
}

fn write_status(output: &mut String, status: &FitStatus) {
    let _ = writeln!(
        output,
        "Converged: {} after {} iterations.",
        if status.converged { "yes" } else { "no" },
        status.iterations
    );
    for warning in &status.warnings {
        let _ = writeln!(output, "- Warning: {warning}");
    }
    let _ = writeln!(output);
}

/// Plain-text monthly table for the terminal.
pub fn monthly_table(series: &MonthlySeries) -> String {
    let mut output = String::new();
    let _ = writeln!(
        output,
        "{:<8} {:>7} {:>9} {:>9} {:>9} {:>7} {:>7} {:>7} {:>7} {:>4}",
        "month", "records", "ga_scan", "ga_book", "book_scan", "any", "early", "e_book", "4+anc", "post"
    );
    for row in &series.rows {
        match row {
            MonthRow::Observed(agg) => {
                let _ = writeln!(
                    output,
                    "{:<8} {:>7} {:>9} {:>9} {:>9} {:>7} {:>7} {:>7} {:>7} {:>4}",
                    agg.month.format("%Y-%m"),
                    agg.records,
                    fmt_option(agg.mean_ga_scan, 1),
                    fmt_option(agg.mean_ga_booking, 1),
                    fmt_option(agg.mean_booking_to_scan, 1),
                    percent(agg.any_scan_rate),
                    percent(agg.early_scan_rate),
                    percent(agg.early_booking_rate),
                    percent(agg.four_plus_visits_rate),
                    agg.post_intervention
                );
            }
            MonthRow::Gap { month, .. } => {
                let _ = writeln!(output, "{:<8} {:>7}   (no records)", month.format("%Y-%m"), 0);
            }
        }
    }
    output
}

pub fn build_report(results: &AnalysisResults) -> String {
    let mut output = String::new();
    let confidence = results.confidence_level;
    let breakpoint_label = match results.breakpoint {
        Breakpoint::Intervention => "intervention",
        Breakpoint::Lag => "lagged intervention",
    };

    let _ = writeln!(output, "# Decentralised Antenatal Ultrasound: Interrupted Time Series");
    let _ = writeln!(
        output,
        "Study window {} to {}; {} date {} (step and slope terms switch on after it).",
        results.study.start, results.study.end, breakpoint_label, results.breakpoint_date
    );
    let _ = writeln!(output);

    let _ = writeln!(output, "## Data");
    let records = &results.records;
    let _ = writeln!(output, "- Rows read: {}", records.rows_read);
    let _ = writeln!(
        output,
        "- Dropped for missing delivery date: {}",
        records.missing_delivery_date
    );
    let _ = writeln!(output, "- Outside the study window: {}", records.outside_window);
    let _ = writeln!(output, "- Analysed: {}", records.analysed);
    if records.scans_after_delivery > 0 {
        let _ = writeln!(
            output,
            "- Ultrasound dated after delivery (kept): {}",
            records.scans_after_delivery
        );
    }
    if results.gaps.is_empty() {
        let _ = writeln!(output, "- Months with no records: none");
    } else {
        let months: Vec<String> = results
            .gaps
            .iter()
            .map(|m| m.format("%Y-%m").to_string())
            .collect();
        let _ = writeln!(output, "- Months with no records: {}", months.join(", "));
    }
    let _ = writeln!(output);

    let _ = writeln!(output, "## Pre vs Post Summary");
    if results.periods.is_empty() {
        let _ = writeln!(output, "No months to summarise.");
    } else {
        let header: Vec<&str> = results.periods.iter().map(|p| p.period).collect();
        let _ = writeln!(output, "| Measure | {} |", header.join(" | "));
        let _ = writeln!(output, "|---|{}", "---:|".repeat(header.len()));
        let months: Vec<String> = results.periods.iter().map(|p| p.months.to_string()).collect();
        let _ = writeln!(output, "| Months | {} |", months.join(" | "));
        let counts: Vec<String> = results.periods.iter().map(|p| p.records.to_string()).collect();
        let _ = writeln!(output, "| Records | {} |", counts.join(" | "));
        if let Some(first) = results.periods.first() {
            for (i, (outcome, _)) in first.continuous.iter().enumerate() {
                let values: Vec<String> = results
                    .periods
                    .iter()
                    .map(|p| fmt_option(p.continuous[i].1, 1))
                    .collect();
                let _ = writeln!(output, "| {} | {} |", outcome.label(), values.join(" | "));
            }
            for (i, (outcome, _)) in first.rates.iter().enumerate() {
                let values: Vec<String> =
                    results.periods.iter().map(|p| percent(p.rates[i].1)).collect();
                let _ = writeln!(output, "| {} | {} |", outcome.label(), values.join(" | "));
            }
        }
    }
    let _ = writeln!(output);

    let _ = writeln!(output, "## ARIMA Models");
    if results.arima.is_empty() {
        let _ = writeln!(output, "No ARIMA model was fitted.");
        let _ = writeln!(output);
    }
    for run in &results.arima {
        let fit = &run.fit;
        let _ = writeln!(output, "### {} ARIMA{}", run.outcome.label(), fit.order);
        let _ = writeln!(
            output,
            "n = {}, log-likelihood {:.2}, AIC {:.2}, BIC {:.2}, sigma2 {:.3}, level offset {:.2}.",
            fit.nobs, fit.log_likelihood, fit.aic, fit.bic, fit.sigma2, fit.level_offset
        );
        if let Some(lb) = &fit.ljung_box {
            let _ = writeln!(
                output,
                "Ljung-Box Q({}) = {:.2} on {} df, p = {}.",
                lb.lags,
                lb.statistic,
                lb.df,
                fmt_p(lb.p_value)
            );
        }
        let _ = writeln!(output);
        write_coefficients(&mut output, "z", &fit.coefficients);
        write_status(&mut output, &fit.status);
        let _ = writeln!(output, "#### Observed vs counterfactual");
        write_counterfactual(&mut output, &run.counterfactual, 1, confidence);
    }

    let _ = writeln!(output, "## GEE Models (logistic, monthly proportions)");
    if results.gee.is_empty() {
        let _ = writeln!(output, "No GEE model was fitted.");
        let _ = writeln!(output);
    }
    for run in &results.gee {
        let fit = &run.fit;
        let _ = writeln!(output, "### {}", run.outcome.label());
        let _ = writeln!(
            output,
            "{} months in {} cluster(s); {:?} working correlation (alpha {:.3}), {:?} covariance, scale {:.3}.",
            fit.nobs, fit.clusters, fit.correlation, fit.alpha, fit.covariance_type, fit.scale
        );
        let _ = writeln!(output);
        write_coefficients(&mut output, "z", &fit.coefficients);
        let level = (confidence * 100.0).round();
        let _ = writeln!(output, "| Term | Odds ratio | Lower {level}% | Upper {level}% |");
        let _ = writeln!(output, "|---|---:|---:|---:|");
        for or in &fit.odds_ratios {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                or.name,
                fmt_value(or.odds_ratio, 3),
                fmt_value(or.lower, 3),
                fmt_value(or.upper, 3)
            );
        }
        let _ = writeln!(output);
        write_status(&mut output, &fit.status);
        let _ = writeln!(output, "#### Observed vs counterfactual");
        write_counterfactual(&mut output, &run.counterfactual, 3, confidence);
    }

    let _ = writeln!(output, "## Segmented Regression");
    match &results.segmented {
        Some(run) => {
            let fit = &run.fit;
            let _ = writeln!(output, "### {} (OLS)", run.outcome.label());
            let _ = writeln!(
                output,
                "n = {}, R² {:.3}, adjusted R² {:.3}, residual SE {:.3}, Durbin-Watson {}.",
                fit.nobs,
                fit.r_squared,
                fit.adj_r_squared,
                fit.residual_se,
                fmt_value(fit.durbin_watson, 2)
            );
            let _ = writeln!(output);
            write_coefficients(&mut output, "t", &fit.coefficients);
            let _ = writeln!(output, "#### Observed vs counterfactual");
            write_counterfactual(&mut output, &run.counterfactual, 1, confidence);
        }
        None => {
            let _ = writeln!(output, "No segmented regression was fitted.");
            let _ = writeln!(output);
        }
    }

    let _ = writeln!(output, "## Naive Pre/Post Comparison");
    if results.naive.is_empty() {
        let _ = writeln!(output, "Not enough months on both sides for a comparison.");
    } else {
        let _ = writeln!(output, "> {}", results.naive[0].comparison.caveat);
        let _ = writeln!(output);
        let _ = writeln!(output, "| Outcome | Pre mean | Post mean | Difference | t | df | p-value |");
        let _ = writeln!(output, "|---|---:|---:|---:|---:|---:|---:|");
        for run in &results.naive {
            let test = &run.comparison.test;
            let _ = writeln!(
                output,
                "| {} | {:.1} | {:.1} | {:.1} ({:.1} to {:.1}) | {:.2} | {:.1} | {} |",
                run.outcome.label(),
                test.mean_pre,
                test.mean_post,
                test.difference,
                test.lower,
                test.upper,
                test.statistic,
                test.df,
                fmt_p(test.p_value)
            );
        }
    }
    let _ = writeln!(output);

    if !results.skipped.is_empty() || !results.notes.is_empty() {
        let _ = writeln!(output, "## Notes");
        for skipped in &results.skipped {
            let _ = writeln!(output, "- {} skipped: {}", skipped.model, skipped.reason);
        }
        for note in &results.notes {
            let _ = writeln!(output, "- {note}");
        }
    }

    output
}
