//! Сборка конвейера: история → сглаживание → скейлер → окно → модель → поправка района.
//!
//! Любая ошибка стадии остаётся `Result` до верхней границы `Pipeline::forecast`, где
//! заменяется синтетическим прогнозом с флагом `fallback`.

use std::path::Path;

use chrono::NaiveDate;
use futures::{StreamExt, stream};
use tracing::{info, warn};

use crate::adjust::{adjust_forecast, clamp_forecast};
use crate::config::Config;
use crate::constants::MAX_PREDICTION_DAYS;
use crate::critical::{
    CriticalReport, CriticalSettings, CriticalThresholds, DistrictAssessment, assess_district,
    build_report, simulated_assessment,
};
use crate::district::DistrictProfile;
use crate::error::PipelineError;
use crate::fallback::{fallback_result, synthetic_history};
use crate::imagery::ImagerySource;
use crate::model::ModelState;
use crate::region::{RegionProvider, resolve_geometry};
use crate::report::{
    Confidence, ForecastResponse, ForecastResult, HistoricalContext, Statistics, dates_after,
    format_dates,
};
use crate::series::{DailySeries, read_period_csv, resample};
use crate::smooth::{trailing_mean, trailing_mean_strict};
use crate::window::build_window;

/// Запрос прогноза для одного района.
#[derive(Clone, Debug)]
pub struct ForecastRequest {
    pub district_name: String,
    pub prediction_days: Option<usize>,
}

impl ForecastRequest {
    pub fn new(district_name: impl Into<String>, prediction_days: Option<usize>) -> Self {
        Self {
            district_name: district_name.into(),
            prediction_days,
        }
    }

    fn horizon(&self, default_horizon: usize) -> Result<usize, String> {
        if self.district_name.trim().is_empty() {
            return Err("district_name must not be empty".to_string());
        }
        let days = self.prediction_days.unwrap_or(default_horizon);
        if days == 0 || days > MAX_PREDICTION_DAYS {
            return Err(format!(
                "prediction_days must be within 1..={MAX_PREDICTION_DAYS}, got {days}"
            ));
        }
        Ok(days)
    }
}

/// История района; при сбое ресэмплинга синтетическая, с текстом ошибки.
#[derive(Clone, Debug)]
pub struct HistoricalSeries {
    pub series: DailySeries,
    pub synthetic: bool,
    pub error: Option<String>,
}

/// Прогноз по загруженному CSV: даты и значения в исходных единицах.
#[derive(Clone, Debug)]
pub struct CsvForecast {
    pub dates: Vec<NaiveDate>,
    pub predictions: Vec<f64>,
}

pub struct Pipeline<S, R> {
    config: Config,
    imagery: S,
    regions: R,
    model: ModelState,
    show_progress: bool,
}

impl<S, R> Pipeline<S, R>
where
    S: ImagerySource + Sync,
    R: RegionProvider + Sync,
{
    pub fn new(config: Config, imagery: S, regions: R, model: ModelState) -> Self {
        Self {
            config,
            imagery,
            regions,
            model,
            show_progress: false,
        }
    }

    #[must_use]
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Дневной ряд района без подстановки: ошибка источника возвращается как есть.
    pub async fn resample_district(&self, name: &str) -> Result<DailySeries, PipelineError> {
        let region = resolve_geometry(&self.regions, name, self.config.regions.buffer_m)?;
        resample(
            &self.imagery,
            &region,
            &self.config.resample_options(),
            self.show_progress,
        )
        .await
    }

    pub async fn historical_series(&self, profile: &DistrictProfile) -> HistoricalSeries {
        match self.resample_district(&profile.name).await {
            Ok(series) => HistoricalSeries {
                series,
                synthetic: false,
                error: None,
            },
            Err(err) => {
                warn!(
                    district = %profile.name,
                    error = %err,
                    "Failed to build NDVI history, using synthetic series"
                );
                HistoricalSeries {
                    series: synthetic_history(profile, self.config.history.end_date),
                    synthetic: true,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Прогноз, требующий модель: без неё сразу `ModelUnavailable`.
    pub async fn predict_strict(
        &self,
        profile: &DistrictProfile,
        horizon: usize,
    ) -> Result<ForecastResult, PipelineError> {
        let bundle = self.model.bundle()?;
        let history = self.historical_series(profile).await;
        if history.series.is_empty() {
            return Err(PipelineError::EmptySeries);
        }

        let smoothed = trailing_mean(&history.series.values, self.config.smoothing_window);
        let scaled = bundle.scaler().forward_series(&smoothed);
        let window = build_window(&scaled, self.config.look_back)?;
        if history.series.len() < self.config.look_back {
            info!(
                district = %profile.name,
                available = history.series.len(),
                look_back = self.config.look_back,
                "History shorter than look_back, window left-padded"
            );
        }

        let raw = bundle.forecast(&window, horizon)?;
        let predictions = if self.config.adjustment.enabled {
            adjust_forecast(profile, &raw, self.config.adjustment.noise_std)?
        } else {
            clamp_forecast(&raw)
        };

        let dates = format_dates(&dates_after(self.config.history.end_date, horizon));
        let (context_dates, context_values) =
            history.series.tail(self.config.history.context_days);
        let confidence = if history.synthetic {
            Confidence::Low
        } else {
            Confidence::Medium
        };
        let statistics = Statistics::summarize(&predictions, confidence);
        info!(
            district = %profile.name,
            model = bundle.name(),
            horizon,
            avg = statistics.avg_prediction,
            min = statistics.min_prediction,
            max = statistics.max_prediction,
            trend = ?statistics.trend,
            "Forecast ready"
        );

        Ok(ForecastResult {
            district_name: profile.name.clone(),
            prediction_days: predictions.len(),
            predictions,
            dates,
            statistics,
            historical_context: HistoricalContext::new(&context_dates, context_values),
            fallback: history.synthetic,
            error_message: history.error,
        })
    }

    /// Верхняя граница: корректный запрос всегда получает результат, при сбое синтетический.
    pub async fn forecast(&self, request: &ForecastRequest) -> ForecastResponse {
        let horizon = match request.horizon(self.config.horizon) {
            Ok(horizon) => horizon,
            Err(err) => {
                warn!(error = %err, "Rejected forecast request");
                return ForecastResponse::failed(err);
            }
        };
        let profile = DistrictProfile::lookup(request.district_name.trim());
        match self.predict_strict(&profile, horizon).await {
            Ok(result) => ForecastResponse::ok(result),
            Err(err) => {
                if err.is_model_unavailable() {
                    warn!(
                        district = %profile.name,
                        error = %err,
                        "Model unavailable, returning synthetic forecast"
                    );
                } else {
                    warn!(
                        district = %profile.name,
                        error = %err,
                        "Forecast failed, returning synthetic forecast"
                    );
                }
                ForecastResponse::ok(fallback_result(
                    &profile,
                    horizon,
                    self.config.history.context_days,
                    self.config.history.end_date,
                    err.to_string(),
                ))
            }
        }
    }

    /// Прогнозы по списку районов с ограниченной параллельностью; порядок как во входе.
    pub async fn forecast_city(
        &self,
        names: &[String],
        prediction_days: Option<usize>,
        concurrency: usize,
    ) -> Vec<ForecastResponse> {
        let mut indexed: Vec<(usize, ForecastResponse)> =
            stream::iter(names.iter().enumerate())
                .map(|(idx, name)| async move {
                    let request = ForecastRequest::new(name.as_str(), prediction_days);
                    (idx, self.forecast(&request).await)
                })
                .buffer_unordered(concurrency.max(1))
                .collect()
                .await;
        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, response)| response).collect()
    }

    /// Оценка одного района для поиска критических зон; при сбое снимков симуляция.
    pub async fn assess_critical(
        &self,
        profile: &DistrictProfile,
        thresholds: CriticalThresholds,
    ) -> DistrictAssessment {
        let end = self.config.history.end_date;
        let settings = CriticalSettings {
            thresholds,
            ..self.config.critical
        };
        let region = resolve_geometry(&self.regions, &profile.name, self.config.regions.buffer_m);
        let assessed = match region {
            Ok(region) => {
                assess_district(
                    &self.imagery,
                    &region,
                    profile,
                    &settings,
                    end,
                    self.config.imagery.timeout,
                )
                .await
            }
            Err(err) => Err(err),
        };
        assessed.unwrap_or_else(|err| {
            warn!(
                district = %profile.name,
                error = %err,
                "Critical-area analysis failed, using simulated assessment"
            );
            simulated_assessment(profile, thresholds, end)
        })
    }

    /// Критические районы из списка: оценка с ограниченной параллельностью, затем риск и рекомендации.
    pub async fn detect_critical_areas(
        &self,
        names: &[String],
        thresholds: CriticalThresholds,
        concurrency: usize,
    ) -> CriticalReport {
        let mut indexed: Vec<_> = stream::iter(names.iter().enumerate())
            .map(|(idx, name)| async move {
                let profile = DistrictProfile::lookup(name.trim());
                let assessment = self.assess_critical(&profile, thresholds).await;
                (idx, (assessment, profile.category))
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;
        indexed.sort_by_key(|(idx, _)| *idx);
        let report = build_report(
            indexed.into_iter().map(|(_, pair)| pair).collect(),
            thresholds,
        );
        info!(
            analyzed = report.statistics.total_districts_analyzed,
            critical = report.statistics.critical_areas_found,
            most_critical = ?report.statistics.most_critical_district,
            "Critical-area detection finished"
        );
        report
    }

    /// Прогноз по CSV `period,ndvi_mean`: строгое скользящее среднее, без поправки района.
    pub fn forecast_from_csv(
        &self,
        csv_path: &Path,
        window_size: usize,
        look_back: usize,
        horizon: usize,
    ) -> Result<CsvForecast, PipelineError> {
        if window_size == 0 {
            return Err(PipelineError::InvalidInput("window_size must be >= 1".into()));
        }
        if horizon == 0 {
            return Err(PipelineError::InvalidInput("horizon must be >= 1".into()));
        }
        let bundle = self.model.bundle()?;
        let (periods, values) = read_period_csv(csv_path)?;
        let last_period = *periods.last().ok_or(PipelineError::EmptySeries)?;

        let smoothed: Vec<f64> = trailing_mean_strict(&values, window_size)
            .into_iter()
            .flatten()
            .collect();
        if smoothed.is_empty() {
            return Err(PipelineError::InvalidInput(format!(
                "need at least {window_size} rows for window_size={window_size}, got {}",
                values.len()
            )));
        }
        let scaled = bundle.scaler().forward_series(&smoothed);
        let window = build_window(&scaled, look_back)?;
        let predictions = bundle.forecast(&window, horizon)?;
        info!(
            path = %csv_path.display(),
            rows = values.len(),
            smoothed = smoothed.len(),
            horizon,
            "Forecast from uploaded CSV ready"
        );
        Ok(CsvForecast {
            dates: dates_after(last_period, predictions.len()),
            predictions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imagery::{IntervalStat, NoImagery};
    use crate::model::{DenseSequenceModel, ModelBundle};
    use crate::region::{Geometry, NoRegions};
    use crate::scaler::MinMaxScaler;
    use crate::report::Trend;
    use crate::series::Interval;
    use std::future::Future;

    struct ConstantSource(f64);

    impl ImagerySource for ConstantSource {
        fn query_interval(
            &self,
            _region: &Geometry,
            _interval: Interval,
        ) -> impl Future<Output = Result<IntervalStat, PipelineError>> + Send {
            let value = self.0;
            async move {
                Ok(IntervalStat {
                    mean_index: Some(value),
                    sample_count: 3,
                })
            }
        }
    }

    struct EmptySource;

    impl ImagerySource for EmptySource {
        fn query_interval(
            &self,
            _region: &Geometry,
            _interval: Interval,
        ) -> impl Future<Output = Result<IntervalStat, PipelineError>> + Send {
            async {
                Ok(IntervalStat {
                    mean_index: None,
                    sample_count: 0,
                })
            }
        }
    }

    fn mean_model(look_back: usize, horizon: usize) -> ModelState {
        let model = DenseSequenceModel {
            look_back,
            horizon,
            output_rank: 3,
            weights: vec![vec![1.0 / look_back as f64; look_back]; horizon],
            bias: vec![0.0; horizon],
        };
        ModelState::Ready(ModelBundle::new(Box::new(model), MinMaxScaler::default()))
    }

    fn config() -> Config {
        Config::defaults().unwrap()
    }

    #[tokio::test]
    async fn constant_history_yields_thirty_dated_predictions() {
        let pipeline = Pipeline::new(config(), ConstantSource(0.5), NoRegions, mean_model(60, 30));
        let response = pipeline
            .forecast(&ForecastRequest::new("Pedurungan", Some(30)))
            .await;
        assert!(response.success);
        let result = response.result.unwrap();
        assert!(!result.fallback);
        assert_eq!(result.predictions.len(), 30);
        assert!(result.predictions.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(result.dates.first().map(String::as_str), Some("2025-05-29"));
        assert_eq!(result.dates.last().map(String::as_str), Some("2025-06-27"));
        assert_eq!(result.statistics.confidence, Confidence::Medium);
        assert_eq!(result.historical_context.values, vec![0.5; 30]);
        assert_eq!(
            result.historical_context.dates.last().map(String::as_str),
            Some("2025-05-28")
        );
    }

    #[tokio::test]
    async fn empty_imagery_uses_default_fill_value() {
        let pipeline = Pipeline::new(config(), EmptySource, NoRegions, mean_model(60, 30));
        let profile = DistrictProfile::lookup("Genuk");
        let history = pipeline.historical_series(&profile).await;
        assert!(!history.synthetic);
        assert!(history.series.values.iter().all(|v| *v == 0.4));
    }

    #[tokio::test]
    async fn disabled_adjustment_keeps_model_output() {
        let mut cfg = config();
        cfg.adjustment.enabled = false;
        let pipeline = Pipeline::new(cfg, ConstantSource(0.5), NoRegions, mean_model(60, 30));
        let result = pipeline
            .predict_strict(&DistrictProfile::lookup("Tembalang"), 30)
            .await
            .unwrap();
        assert!(result.predictions.iter().all(|v| (v - 0.5).abs() < 1e-9));
        assert_eq!(result.statistics.trend, Trend::Stabil);
    }

    #[tokio::test]
    async fn adjustment_differs_between_districts() {
        let pipeline = Pipeline::new(config(), ConstantSource(0.5), NoRegions, mean_model(60, 30));
        let a = pipeline
            .predict_strict(&DistrictProfile::lookup("Tembalang"), 30)
            .await
            .unwrap();
        let b = pipeline
            .predict_strict(&DistrictProfile::lookup("Mijen"), 30)
            .await
            .unwrap();
        assert_ne!(a.predictions, b.predictions);
        let again = pipeline
            .predict_strict(&DistrictProfile::lookup("Tembalang"), 30)
            .await
            .unwrap();
        assert_eq!(a.predictions, again.predictions);
    }

    #[tokio::test]
    async fn unavailable_model_fails_strict_but_endpoint_falls_back() {
        let pipeline = Pipeline::new(
            config(),
            ConstantSource(0.5),
            NoRegions,
            ModelState::Unavailable("model file missing".into()),
        );
        let profile = DistrictProfile::lookup("Candisari");
        let err = pipeline.predict_strict(&profile, 30).await.unwrap_err();
        assert!(err.is_model_unavailable());

        let response = pipeline
            .forecast(&ForecastRequest::new("Candisari", None))
            .await;
        assert!(response.success);
        let result = response.result.unwrap();
        assert!(result.fallback);
        assert_eq!(result.predictions.len(), 30);
        assert_eq!(result.dates.len(), 30);
        assert_eq!(result.statistics.confidence, Confidence::Low);
        assert!(result.error_message.unwrap().contains("model file missing"));
    }

    #[tokio::test]
    async fn failed_imagery_marks_result_as_fallback() {
        let pipeline = Pipeline::new(config(), NoImagery, NoRegions, mean_model(60, 30));
        let response = pipeline
            .forecast(&ForecastRequest::new("Tembalang", Some(10)))
            .await;
        let result = response.result.unwrap();
        assert!(result.fallback);
        assert_eq!(result.predictions.len(), 10);
        assert_eq!(result.statistics.confidence, Confidence::Low);
        assert!(result.error_message.is_some());
    }

    #[tokio::test]
    async fn unknown_district_without_geometry_falls_back() {
        let pipeline = Pipeline::new(config(), ConstantSource(0.5), NoRegions, mean_model(60, 30));
        let result = pipeline
            .forecast(&ForecastRequest::new("Atlantis", None))
            .await
            .result
            .unwrap();
        assert!(result.fallback);
        assert_eq!(result.district_name, "Atlantis");
    }

    #[tokio::test]
    async fn invalid_request_is_rejected() {
        let pipeline = Pipeline::new(config(), ConstantSource(0.5), NoRegions, mean_model(60, 30));
        let response = pipeline.forecast(&ForecastRequest::new("Mijen", Some(0))).await;
        assert!(!response.success);
        assert!(response.result.is_none());
        let response = pipeline.forecast(&ForecastRequest::new("  ", None)).await;
        assert!(!response.success);
    }

    #[tokio::test]
    async fn city_fan_out_keeps_input_order() {
        let pipeline = Pipeline::new(config(), ConstantSource(0.5), NoRegions, mean_model(60, 30));
        let names: Vec<String> = ["Tugu", "Genuk", "Mijen", "Candisari"]
            .into_iter()
            .map(String::from)
            .collect();
        let responses = pipeline.forecast_city(&names, Some(5), 3).await;
        let order: Vec<String> = responses
            .into_iter()
            .map(|response| response.result.unwrap().district_name)
            .collect();
        assert_eq!(order, names);
    }

    #[test]
    fn csv_upload_drops_partial_windows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.csv");
        let mut body = String::from("period,ndvi_mean\n");
        for day in 1..=12 {
            body.push_str(&format!("2024-01-{day:02},0.{}\n", 30 + day));
        }
        std::fs::write(&path, body).unwrap();

        let pipeline = Pipeline::new(config(), NoImagery, NoRegions, mean_model(8, 3));
        let forecast = pipeline.forecast_from_csv(&path, 5, 8, 3).unwrap();
        assert_eq!(forecast.predictions.len(), 3);
        assert_eq!(
            forecast.dates,
            dates_after(NaiveDate::from_ymd_opt(2024, 1, 12).unwrap(), 3)
        );
        // 12 строк, окно 5: остаётся 8 сглаженных значений, от 0.33 до 0.40.
        let expected = (0.33 + 0.40) / 2.0;
        assert!(forecast.predictions.iter().all(|v| (v - expected).abs() < 1e-9));
    }

    #[test]
    fn csv_upload_requires_a_model() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.csv");
        std::fs::write(&path, "period,ndvi_mean\n2024-01-01,0.4\n").unwrap();
        let pipeline = Pipeline::new(
            config(),
            NoImagery,
            NoRegions,
            ModelState::Unavailable("missing".into()),
        );
        let err = pipeline.forecast_from_csv(&path, 1, 10, 5).unwrap_err();
        assert!(err.is_model_unavailable());
    }

    #[test]
    fn csv_upload_needs_a_full_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.csv");
        std::fs::write(&path, "period,ndvi_mean\n2024-01-01,0.4\n2024-01-02,0.5\n").unwrap();
        let pipeline = Pipeline::new(config(), NoImagery, NoRegions, mean_model(10, 5));
        assert!(matches!(
            pipeline.forecast_from_csv(&path, 5, 10, 5),
            Err(PipelineError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn low_constant_imagery_marks_every_district_critical() {
        let pipeline = Pipeline::new(config(), ConstantSource(0.25), NoRegions, mean_model(60, 30));
        let names: Vec<String> = ["Gayamsari", "Tembalang", "Semarang Tengah"]
            .into_iter()
            .map(String::from)
            .collect();
        let thresholds = CriticalThresholds::new(0.2, 0.3).unwrap();
        let report = pipeline.detect_critical_areas(&names, thresholds, 2).await;
        assert_eq!(report.statistics.total_districts_analyzed, 3);
        assert_eq!(report.statistics.critical_areas_found, 3);
        assert!(report.critical_areas.iter().all(|area| {
            area.data_source == crate::critical::DataSource::Imagery
                && (area.critical_percentage - 100.0).abs() < 1e-9
        }));
        // одинаковые данные: выше всех городской район
        assert_eq!(
            report.statistics.most_critical_district.as_deref(),
            Some("Semarang Tengah")
        );
    }

    #[tokio::test]
    async fn critical_analysis_without_imagery_is_simulated() {
        let pipeline = Pipeline::new(config(), NoImagery, NoRegions, mean_model(60, 30));
        let thresholds = CriticalThresholds::new(0.2, 0.3).unwrap();
        let profile = DistrictProfile::lookup("Candisari");
        let area = pipeline.assess_critical(&profile, thresholds).await;
        assert_eq!(area.data_source, crate::critical::DataSource::Simulated);
        assert_eq!(area, simulated_assessment(&profile, thresholds, config().history.end_date));

        let unknown = pipeline
            .assess_critical(&DistrictProfile::lookup("Atlantis"), thresholds)
            .await;
        assert_eq!(unknown.data_source, crate::critical::DataSource::Simulated);
        assert!(unknown.coordinates.is_none());
    }
}
