//! Синтетические ряды на случай, когда снимки или модель недоступны.
//!
//! Ряды параметрические: уровень по категории района, синусоидальная сезонность,
//! небольшой линейный дрейф и гауссов шум. Генератор заводится заново на каждый
//! вызов от seed района, поэтому один и тот же район всегда получает один и тот же ряд.

use std::f64::consts::TAU;

use chrono::{Days, NaiveDate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal, Uniform};
use tracing::info;

use crate::constants::{NDVI_MAX, NDVI_MIN};
use crate::district::{DistrictCategory, DistrictProfile};
use crate::report::{
    Confidence, ForecastResult, HistoricalContext, Statistics, dates_after, dates_until,
    format_dates,
};
use crate::series::DailySeries;

pub const SYNTHETIC_HISTORY_DAYS: usize = 365;
const HISTORY_PERIOD_DAYS: f64 = 365.0;
const HISTORY_NOISE_STD: f64 = 0.02;
const HISTORY_CLIP: (f64, f64) = (0.1, 0.9);
const FORECAST_PERIOD_DAYS: f64 = 30.0;
const FORECAST_NOISE_STD: f64 = 0.01;

struct HistoryShape {
    base_range: (f64, f64),
    amplitude: f64,
    drift: f64,
}

impl HistoryShape {
    const fn for_category(category: DistrictCategory) -> Self {
        match category {
            DistrictCategory::Urban => Self {
                base_range: (0.25, 0.35),
                amplitude: 0.05,
                drift: 0.0001,
            },
            DistrictCategory::Suburban => Self {
                base_range: (0.45, 0.65),
                amplitude: 0.10,
                drift: 0.00005,
            },
            DistrictCategory::Other => Self {
                base_range: (0.35, 0.55),
                amplitude: 0.08,
                drift: 0.00005,
            },
        }
    }
}

struct ForecastShape {
    base: f64,
    amplitude: f64,
    drift: f64,
}

impl ForecastShape {
    const fn for_category(category: DistrictCategory) -> Self {
        match category {
            DistrictCategory::Urban => Self {
                base: 0.38,
                amplitude: 0.05,
                drift: 0.0003,
            },
            DistrictCategory::Suburban => Self {
                base: 0.50,
                amplitude: 0.08,
                drift: 0.0005,
            },
            DistrictCategory::Other => Self {
                base: 0.45,
                amplitude: 0.06,
                drift: 0.0004,
            },
        }
    }

    fn value(&self, offset: f64, noise: f64) -> f64 {
        let seasonal = self.amplitude * (TAU * offset / FORECAST_PERIOD_DAYS).sin();
        self.drift
            .mul_add(offset, self.base + seasonal + noise)
            .clamp(NDVI_MIN, NDVI_MAX)
    }
}

/// Год синтетической истории, заканчивающийся на `end` включительно.
pub fn synthetic_history(profile: &DistrictProfile, end: NaiveDate) -> DailySeries {
    let shape = HistoryShape::for_category(profile.category);
    let mut rng = StdRng::seed_from_u64(profile.seed());
    let base = Uniform::new_inclusive(shape.base_range.0, shape.base_range.1).sample(&mut rng);

    let values: Vec<f64> = (0..SYNTHETIC_HISTORY_DAYS)
        .map(|day| {
            let day = day as f64;
            let seasonal = shape.amplitude * (TAU * day / HISTORY_PERIOD_DAYS).sin();
            let noise = gaussian(&mut rng, HISTORY_NOISE_STD);
            (shape.drift.mul_add(day, base + seasonal) + noise).clamp(HISTORY_CLIP.0, HISTORY_CLIP.1)
        })
        .collect();

    let start = end
        .checked_sub_days(Days::new(SYNTHETIC_HISTORY_DAYS as u64 - 1))
        .unwrap_or(end);
    info!(
        district = %profile.name,
        days = values.len(),
        "Generated synthetic NDVI history"
    );
    DailySeries { start, values }
}

/// Синтетический прогноз на `horizon` дней и `context_days` значений контекста перед ним.
///
/// Контекст продолжает тот же поток генератора после прогноза, со смещениями `i - context_days`.
pub fn synthetic_forecast(
    profile: &DistrictProfile,
    horizon: usize,
    context_days: usize,
) -> (Vec<f64>, Vec<f64>) {
    let shape = ForecastShape::for_category(profile.category);
    let mut rng = StdRng::seed_from_u64(profile.seed());

    let predictions = (0..horizon)
        .map(|i| shape.value(i as f64, gaussian(&mut rng, FORECAST_NOISE_STD)))
        .collect();
    let context = (0..context_days)
        .map(|i| {
            let offset = i as f64 - context_days as f64;
            shape.value(offset, gaussian(&mut rng, FORECAST_NOISE_STD))
        })
        .collect();
    (predictions, context)
}

/// Полный результат прогноза без снимков и модели, с флагом `fallback` и текстом ошибки.
pub fn fallback_result(
    profile: &DistrictProfile,
    horizon: usize,
    context_days: usize,
    history_end: NaiveDate,
    error: String,
) -> ForecastResult {
    let (predictions, context) = synthetic_forecast(profile, horizon, context_days);
    let dates = format_dates(&dates_after(history_end, horizon));
    let context_dates = dates_until(history_end, context_days);
    ForecastResult {
        district_name: profile.name.clone(),
        statistics: Statistics::summarize(&predictions, Confidence::Low),
        prediction_days: predictions.len(),
        predictions,
        dates,
        historical_context: HistoricalContext::new(&context_dates, context),
        fallback: true,
        error_message: Some(error),
    }
}

fn gaussian(rng: &mut StdRng, std_dev: f64) -> f64 {
    let z: f64 = StandardNormal.sample(rng);
    std_dev * z
}

#[cfg(test)]
mod tests {
    use super::*;

    fn end() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, 28).unwrap()
    }

    #[test]
    fn history_is_a_clipped_year_ending_on_end_date() {
        let profile = DistrictProfile::lookup("Semarang Utara");
        let series = synthetic_history(&profile, end());
        assert_eq!(series.len(), SYNTHETIC_HISTORY_DAYS);
        assert_eq!(series.last_date(), Some(end()));
        assert!(series.values.iter().all(|v| (0.1..=0.9).contains(v)));
    }

    #[test]
    fn history_is_stable_per_district() {
        let profile = DistrictProfile::lookup("Banyumanik");
        assert_eq!(
            synthetic_history(&profile, end()),
            synthetic_history(&profile, end())
        );
        let other = DistrictProfile::lookup("Tembalang");
        assert_ne!(
            synthetic_history(&profile, end()).values,
            synthetic_history(&other, end()).values
        );
    }

    #[test]
    fn suburban_history_sits_above_urban() {
        let urban = synthetic_history(&DistrictProfile::lookup("Candisari"), end());
        let suburban = synthetic_history(&DistrictProfile::lookup("Mijen"), end());
        let avg = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
        assert!(avg(&suburban.values) > avg(&urban.values));
    }

    #[test]
    fn forecast_and_context_have_requested_lengths() {
        let profile = DistrictProfile::lookup("Genuk");
        let (predictions, context) = synthetic_forecast(&profile, 45, 30);
        assert_eq!(predictions.len(), 45);
        assert_eq!(context.len(), 30);
        assert!(predictions.iter().chain(&context).all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn fallback_result_matches_nominal_shape() {
        let profile = DistrictProfile::lookup("Tugu");
        let result = fallback_result(&profile, 30, 30, end(), "imagery offline".into());
        assert_eq!(result.predictions.len(), 30);
        assert_eq!(result.dates.len(), 30);
        assert_eq!(result.prediction_days, 30);
        assert_eq!(result.dates[0], "2025-05-29");
        assert_eq!(result.historical_context.dates.len(), 30);
        assert_eq!(result.historical_context.dates[29], "2025-05-28");
        assert!(result.fallback);
        assert_eq!(result.statistics.confidence, Confidence::Low);
        assert_eq!(result.error_message.as_deref(), Some("imagery offline"));
    }
}
