//! Построение непрерывного дневного ряда NDVI из прореженных спутниковых интервалов.

use std::path::Path;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use serde::Deserialize;
use tqdm::pbar;
use tracing::{debug, info, warn};

use crate::constants::{DATE_FORMAT, NDVI_MAX, NDVI_MIN};
use crate::error::PipelineError;
use crate::imagery::{ImagerySource, IntervalStat};
use crate::region::Geometry;

const TIME_FORMAT_NAIVE: &str = "%Y-%m-%d %H:%M:%S";
const SERIES_CSV_HEADER: [&str; 2] = ["date", "ndvi"];

const ERROR_EMPTY_PERIOD: &str = "empty period";
const ERROR_UNRECOGNIZED_PERIOD: &str = "unrecognized period format";

#[derive(Clone, Copy, Debug)]
enum PeriodFormatHint {
    Date,
    Naive,
    Rfc3339,
}

impl PeriodFormatHint {
    fn parse(self, raw: &str) -> Option<NaiveDate> {
        match self {
            Self::Date => NaiveDate::parse_from_str(raw, DATE_FORMAT).ok(),
            Self::Naive => NaiveDateTime::parse_from_str(raw, TIME_FORMAT_NAIVE)
                .ok()
                .map(|naive| naive.date()),
            Self::Rfc3339 => DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.date_naive()),
        }
    }
}

/// Интервал съёмки, обе границы включительно.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interval {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Interval {
    pub fn days(&self) -> usize {
        usize::try_from((self.end - self.start).num_days() + 1).unwrap_or(0)
    }
}

/// Параметры ресэмплинга исторического периода.
#[derive(Clone, Debug)]
pub struct ResampleOptions {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub interval_days: u32,
    pub max_days: usize,
    pub default_value: f64,
    pub timeout: StdDuration,
}

/// Непрерывный дневной ряд: одно значение на каждый календарный день начиная со `start`.
#[derive(Clone, Debug, PartialEq)]
pub struct DailySeries {
    pub start: NaiveDate,
    pub values: Vec<f64>,
}

impl DailySeries {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        (0..self.values.len()).map(|offset| self.start + Duration::days(offset as i64))
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.values
            .len()
            .checked_sub(1)
            .map(|offset| self.start + Duration::days(offset as i64))
    }

    /// Последние `n` точек ряда вместе с датами.
    pub fn tail(&self, n: usize) -> (Vec<NaiveDate>, Vec<f64>) {
        let skip = self.values.len().saturating_sub(n);
        let dates = self.dates().skip(skip).collect();
        let values = self.values[skip..].to_vec();
        (dates, values)
    }

    /// Оставляет только последние `max_days` дней, сдвигая начало ряда.
    fn keep_recent(&mut self, max_days: usize) {
        if self.values.len() > max_days {
            let drop = self.values.len() - max_days;
            self.values.drain(..drop);
            self.start += Duration::days(drop as i64);
        }
    }
}

/// Делит `[start, end]` на последовательные интервалы по `interval_days`, последний обрезается.
pub fn partition_intervals(start: NaiveDate, end: NaiveDate, interval_days: u32) -> Vec<Interval> {
    let step = Duration::days(i64::from(interval_days.max(1)));
    let mut intervals = Vec::new();
    let mut current = start;
    while current <= end {
        let period_end = (current + step - Duration::days(1)).min(end);
        intervals.push(Interval {
            start: current,
            end: period_end,
        });
        current = period_end + Duration::days(1);
    }
    intervals
}

/// Запрос одного интервала под таймаутом.
pub(crate) async fn query_interval<S: ImagerySource>(
    source: &S,
    region: &Geometry,
    interval: Interval,
    timeout: StdDuration,
) -> Result<IntervalStat, PipelineError> {
    tokio::time::timeout(timeout, source.query_interval(region, interval))
        .await
        .map_err(|_| PipelineError::ImageryTimeout {
            start: interval.start,
            end: interval.end,
        })?
}

pub(crate) fn accepted_value(stat: &IntervalStat) -> Option<f64> {
    if stat.sample_count == 0 {
        return None;
    }
    stat.mean_index.filter(|value| value.is_finite() && *value > 0.0)
}

/// Строит дневной ряд: каждое значение интервала повторяется на все его дни,
/// пустые интервалы получают предыдущее значение или значение по умолчанию.
pub async fn resample<S: ImagerySource>(
    source: &S,
    region: &Geometry,
    options: &ResampleOptions,
    show_progress: bool,
) -> Result<DailySeries, PipelineError> {
    let intervals = partition_intervals(options.start, options.end, options.interval_days);
    let total_days: usize = intervals.iter().map(Interval::days).sum();
    let mut values = Vec::with_capacity(total_days);
    let mut last_value: Option<f64> = None;
    let mut progress = show_progress.then(|| pbar(Some(intervals.len())));

    for interval in &intervals {
        let stat = query_interval(source, region, *interval, options.timeout).await?;

        let value = if let Some(value) = accepted_value(&stat) {
            debug!(
                interval_start = %interval.start,
                value,
                days = interval.days(),
                "Accepted interval NDVI"
            );
            value
        } else {
            let substitute = last_value.unwrap_or(options.default_value);
            debug!(
                interval_start = %interval.start,
                sample_count = stat.sample_count,
                substitute,
                "No valid NDVI for interval, using fallback value"
            );
            substitute
        };
        values.extend(std::iter::repeat_n(value, interval.days()));
        last_value = Some(value);

        if let Some(bar) = progress.as_mut()
            && let Err(err) = bar.update(1)
        {
            warn!(error = %err, "Failed to update progress bar");
        }
    }

    let mut series = DailySeries {
        start: options.start,
        values,
    };
    series.keep_recent(options.max_days);
    for value in &mut series.values {
        *value = value.clamp(NDVI_MIN, NDVI_MAX);
    }

    if let Some((min, max)) = min_max(&series.values) {
        info!(
            days = series.len(),
            intervals = intervals.len(),
            min,
            max,
            mean = mean(&series.values),
            "Resampled daily NDVI series"
        );
    }
    Ok(series)
}

pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub(crate) fn min_max(values: &[f64]) -> Option<(f64, f64)> {
    values.iter().copied().fold(None, |acc, value| match acc {
        None => Some((value, value)),
        Some((min, max)) => Some((min.min(value), max.max(value))),
    })
}

/// Записывает дневной ряд в CSV, создавая директорию при необходимости.
pub fn write_series_csv(series: &DailySeries, file_path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = file_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(file_path)?;
    writer.write_record(SERIES_CSV_HEADER)?;
    for (date, value) in series.dates().zip(series.values.iter()) {
        writer.write_record([date.format(DATE_FORMAT).to_string(), format!("{value:.6}")])?;
    }
    writer.flush()?;
    Ok(())
}

/// Строка загружаемого CSV с периодами и средним NDVI.
#[derive(Debug, Deserialize)]
struct PeriodRow {
    period: String,
    ndvi_mean: f64,
}

/// Читает CSV `period,ndvi_mean` в порядке файла.
pub fn read_period_csv(csv_path: &Path) -> Result<(Vec<NaiveDate>, Vec<f64>), PipelineError> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut hint = None;
    let mut dates = Vec::new();
    let mut values = Vec::new();
    for row in reader.deserialize::<PeriodRow>() {
        let row = row?;
        let date = parse_period_with_hint(&row.period, &mut hint).map_err(|err| {
            PipelineError::InvalidInput(format!("failed to parse period '{}': {err}", row.period))
        })?;
        dates.push(date);
        values.push(row.ndvi_mean);
    }
    if values.is_empty() {
        return Err(PipelineError::EmptySeries);
    }
    Ok((dates, values))
}

fn parse_period_with_hint(
    raw: &str,
    hint: &mut Option<PeriodFormatHint>,
) -> Result<NaiveDate, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ERROR_EMPTY_PERIOD.into());
    }

    if let Some(hint) = *hint
        && let Some(parsed) = hint.parse(trimmed)
    {
        return Ok(parsed);
    }

    for candidate in [
        PeriodFormatHint::Date,
        PeriodFormatHint::Naive,
        PeriodFormatHint::Rfc3339,
    ] {
        if let Some(parsed) = candidate.parse(trimmed) {
            *hint = Some(candidate);
            return Ok(parsed);
        }
    }

    Err(ERROR_UNRECOGNIZED_PERIOD.into())
}
