//! Схема результата прогноза и запись результатов в JSON и CSV.

use std::io::Write;
use std::path::Path;

use chrono::{Days, NaiveDate};
use serde::Serialize;

use crate::constants::{DATE_FORMAT, TREND_THRESHOLD};
use crate::error::PipelineError;
use crate::series::{mean, min_max};

const PREDICTIONS_CSV_HEADER: [&str; 2] = ["period", "prediction"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Meningkat,
    Menurun,
    Stabil,
}

impl Trend {
    /// Сравнивает последний прогноз с первым с порогом 0.05.
    pub fn classify(predictions: &[f64]) -> Self {
        match (predictions.first(), predictions.last()) {
            (Some(first), Some(last)) if predictions.len() > 1 => {
                let diff = last - first;
                if diff > TREND_THRESHOLD {
                    Self::Meningkat
                } else if diff < -TREND_THRESHOLD {
                    Self::Menurun
                } else {
                    Self::Stabil
                }
            }
            _ => Self::Stabil,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Medium,
    Low,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Statistics {
    pub avg_prediction: f64,
    pub min_prediction: f64,
    pub max_prediction: f64,
    pub trend: Trend,
    pub confidence: Confidence,
}

impl Statistics {
    pub fn summarize(predictions: &[f64], confidence: Confidence) -> Self {
        let (min_prediction, max_prediction) = min_max(predictions).unwrap_or((0.0, 1.0));
        let avg_prediction = if predictions.is_empty() {
            0.5
        } else {
            mean(predictions)
        };
        Self {
            avg_prediction,
            min_prediction,
            max_prediction,
            trend: Trend::classify(predictions),
            confidence,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HistoricalContext {
    pub dates: Vec<String>,
    pub values: Vec<f64>,
}

impl HistoricalContext {
    pub fn new(dates: &[NaiveDate], values: Vec<f64>) -> Self {
        Self {
            dates: format_dates(dates),
            values,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForecastResult {
    pub district_name: String,
    pub predictions: Vec<f64>,
    pub dates: Vec<String>,
    pub prediction_days: usize,
    pub statistics: Statistics,
    pub historical_context: HistoricalContext,
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ForecastResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ForecastResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ForecastResponse {
    pub const fn ok(result: ForecastResult) -> Self {
        Self {
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub const fn failed(error: String) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(error),
        }
    }
}

/// `count` последовательных дат начиная со дня после `last`.
pub fn dates_after(last: NaiveDate, count: usize) -> Vec<NaiveDate> {
    (1..=count as u64)
        .filter_map(|offset| last.checked_add_days(Days::new(offset)))
        .collect()
}

/// `count` последовательных дат, заканчивающихся на `last` включительно.
pub fn dates_until(last: NaiveDate, count: usize) -> Vec<NaiveDate> {
    (0..count as u64)
        .rev()
        .filter_map(|offset| last.checked_sub_days(Days::new(offset)))
        .collect()
}

pub fn format_dates(dates: &[NaiveDate]) -> Vec<String> {
    dates
        .iter()
        .map(|date| date.format(DATE_FORMAT).to_string())
        .collect()
}

/// Пишет JSON в файл или, если путь не задан, в stdout.
pub fn write_json<T: Serialize>(value: &T, output: Option<&Path>) -> Result<(), PipelineError> {
    let rendered = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, rendered)?;
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{rendered}")?;
        }
    }
    Ok(())
}

pub fn write_predictions_csv(
    dates: &[NaiveDate],
    predictions: &[f64],
    file_path: &Path,
) -> Result<(), PipelineError> {
    if let Some(parent) = file_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(file_path)?;
    writer.write_record(PREDICTIONS_CSV_HEADER)?;
    for (date, value) in dates.iter().zip(predictions) {
        writer.write_record([date.format(DATE_FORMAT).to_string(), format!("{value:.6}")])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn trend_uses_first_and_last_prediction() {
        assert_eq!(Trend::classify(&[0.40, 0.30, 0.46]), Trend::Meningkat);
        assert_eq!(Trend::classify(&[0.50, 0.60, 0.44]), Trend::Menurun);
        assert_eq!(Trend::classify(&[0.50, 0.90, 0.54]), Trend::Stabil);
        assert_eq!(Trend::classify(&[0.9]), Trend::Stabil);
        assert_eq!(Trend::classify(&[]), Trend::Stabil);
    }

    #[test]
    fn statistics_summarize_predictions() {
        let stats = Statistics::summarize(&[0.2, 0.4, 0.6], Confidence::Medium);
        assert_relative_eq!(stats.avg_prediction, 0.4, epsilon = 1e-12);
        assert_relative_eq!(stats.min_prediction, 0.2, epsilon = 1e-12);
        assert_relative_eq!(stats.max_prediction, 0.6, epsilon = 1e-12);
        assert_eq!(stats.trend, Trend::Meningkat);
    }

    #[test]
    fn forecast_dates_start_after_history() {
        let dates = format_dates(&dates_after(date(2025, 5, 28), 4));
        assert_eq!(dates, ["2025-05-29", "2025-05-30", "2025-05-31", "2025-06-01"]);
        let context = format_dates(&dates_until(date(2025, 5, 28), 3));
        assert_eq!(context, ["2025-05-26", "2025-05-27", "2025-05-28"]);
    }

    #[test]
    fn result_serializes_with_wire_names() {
        let result = ForecastResult {
            district_name: "Tembalang".into(),
            predictions: vec![0.5],
            dates: vec!["2025-05-29".into()],
            prediction_days: 1,
            statistics: Statistics::summarize(&[0.5], Confidence::Low),
            historical_context: HistoricalContext::default(),
            fallback: false,
            error_message: None,
        };
        let value = serde_json::to_value(ForecastResponse::ok(result)).unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["result"]["statistics"]["trend"], "stabil");
        assert_eq!(value["result"]["statistics"]["confidence"], "low");
        assert!(value["result"].get("error_message").is_none());
        assert!(value.get("error").is_none());

        let failed = serde_json::to_value(ForecastResponse::failed("bad".into())).unwrap();
        assert_eq!(failed["success"], false);
        assert_eq!(failed["error"], "bad");
        assert!(failed.get("result").is_none());
    }

    #[test]
    fn predictions_csv_has_period_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/predictions.csv");
        write_predictions_csv(&dates_after(date(2024, 1, 31), 2), &[0.4, 0.45], &path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "period,prediction\n2024-02-01,0.400000\n2024-02-02,0.450000\n"
        );
    }
}
