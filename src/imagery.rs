//! Источники спутниковой статистики NDVI по интервалам съёмки.

use std::future::Future;
use std::path::Path;

use bytes::Bytes;
use chrono::NaiveDate;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::constants::DATE_FORMAT;
use crate::error::PipelineError;
use crate::fetch::{self, RetryPolicy};
use crate::region::Geometry;
use crate::series::Interval;

const INTERVAL_ENDPOINT: &str = "ndvi/interval";

/// Агрегат NDVI по интервалу: среднее по региону и число снимков, прошедших фильтр облачности.
#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct IntervalStat {
    pub mean_index: Option<f64>,
    pub sample_count: u32,
}

pub trait ImagerySource {
    fn query_interval(
        &self,
        region: &Geometry,
        interval: Interval,
    ) -> impl Future<Output = Result<IntervalStat, PipelineError>> + Send;
}

/// Фильтр качества, с которым запрашиваются снимки.
#[derive(Clone, Copy, Debug)]
pub struct QualityFilter {
    pub max_cloud_pct: f64,
    pub scale_m: f64,
}

#[derive(Serialize)]
struct IntervalRequest<'a> {
    geometry: &'a Geometry,
    start: String,
    end: String,
    max_cloud_pct: f64,
    scale_m: f64,
}

/// HTTP-шлюз к удалённому вычислителю статистики снимков.
pub struct HttpImagery {
    client: Client,
    url: String,
    filter: QualityFilter,
    retry: RetryPolicy,
}

impl HttpImagery {
    pub fn new(client: Client, base_url: &str, filter: QualityFilter, retry: RetryPolicy) -> Self {
        let url = format!("{}/{INTERVAL_ENDPOINT}", base_url.trim_end_matches('/'));
        Self {
            client,
            url,
            filter,
            retry,
        }
    }
}

impl ImagerySource for HttpImagery {
    async fn query_interval(
        &self,
        region: &Geometry,
        interval: Interval,
    ) -> Result<IntervalStat, PipelineError> {
        let request = IntervalRequest {
            geometry: region,
            start: interval.start.format(DATE_FORMAT).to_string(),
            end: interval.end.format(DATE_FORMAT).to_string(),
            max_cloud_pct: self.filter.max_cloud_pct,
            scale_m: self.filter.scale_m,
        };
        let body = Bytes::from(serde_json::to_vec(&request)?);
        let content = fetch::post_json(&self.client, &self.url, body, self.retry).await?;
        let stat: IntervalStat = serde_json::from_slice(&content)?;
        debug!(
            interval_start = %interval.start,
            sample_count = stat.sample_count,
            "Received interval statistic"
        );
        Ok(stat)
    }
}

/// Наблюдение за интервал в офлайн-выгрузке.
#[derive(Clone, Debug, Deserialize)]
pub struct RawObservation {
    pub period_start: NaiveDate,
    pub period_end: NaiveDate,
    #[serde(rename = "ndvi_mean")]
    pub aggregate_index_value: Option<f64>,
    /// Без колонки `sample_count` строка считается одним наблюдением.
    #[serde(default = "single_sample")]
    pub sample_count: u32,
}

const fn single_sample() -> u32 {
    1
}

/// Офлайн-источник: CSV `period_start,period_end,ndvi_mean,sample_count`.
/// Интервал получает среднее по всем пересекающимся с ним наблюдениям.
pub struct CsvImagery {
    observations: Vec<RawObservation>,
}

impl CsvImagery {
    pub fn from_path(path: &Path) -> Result<Self, PipelineError> {
        let mut reader = csv::Reader::from_path(path)?;
        let observations = reader
            .deserialize::<RawObservation>()
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            path = %path.display(),
            observations = observations.len(),
            "Loaded offline NDVI observations"
        );
        Ok(Self { observations })
    }

    fn aggregate(&self, interval: Interval) -> IntervalStat {
        let (sum, count, samples) = self
            .observations
            .iter()
            .filter(|obs| obs.period_start <= interval.end && obs.period_end >= interval.start)
            .filter(|obs| obs.sample_count > 0)
            .filter_map(|obs| obs.aggregate_index_value.map(|value| (value, obs.sample_count)))
            .fold((0.0, 0_u32, 0_u32), |(sum, count, samples), (value, n)| {
                (sum + value, count + 1, samples.saturating_add(n))
            });
        IntervalStat {
            mean_index: (count > 0).then(|| sum / f64::from(count)),
            sample_count: samples,
        }
    }
}

impl ImagerySource for CsvImagery {
    fn query_interval(
        &self,
        _region: &Geometry,
        interval: Interval,
    ) -> impl Future<Output = Result<IntervalStat, PipelineError>> + Send {
        let stat = self.aggregate(interval);
        async move { Ok(stat) }
    }
}

/// Источник не настроен: любой запрос завершается ошибкой, и ряд строится генератором подстановки.
pub struct NoImagery;

impl ImagerySource for NoImagery {
    fn query_interval(
        &self,
        _region: &Geometry,
        _interval: Interval,
    ) -> impl Future<Output = Result<IntervalStat, PipelineError>> + Send {
        async { Err(PipelineError::ImageryUnconfigured) }
    }
}

/// Источник, выбранный конфигурацией при старте.
pub enum ConfiguredImagery {
    Http(HttpImagery),
    Csv(CsvImagery),
    None(NoImagery),
}

impl ImagerySource for ConfiguredImagery {
    async fn query_interval(
        &self,
        region: &Geometry,
        interval: Interval,
    ) -> Result<IntervalStat, PipelineError> {
        match self {
            Self::Http(source) => source.query_interval(region, interval).await,
            Self::Csv(source) => source.query_interval(region, interval).await,
            Self::None(source) => source.query_interval(region, interval).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn region() -> Geometry {
        Geometry::Buffer {
            lat: -7.0,
            lon: 110.4,
            radius_m: 1000.0,
        }
    }

    #[tokio::test]
    async fn csv_source_averages_overlapping_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observations.csv");
        std::fs::write(
            &path,
            "period_start,period_end,ndvi_mean,sample_count\n\
             2024-03-06,2024-03-10,0.40,2\n\
             2024-03-11,2024-03-15,0.50,1\n\
             2024-03-16,2024-03-25,,0\n\
             2024-03-26,2024-04-04,0.70,0\n",
        )
        .unwrap();
        let source = CsvImagery::from_path(&path).unwrap();

        let first = source
            .query_interval(
                &region(),
                Interval {
                    start: date(2024, 3, 6),
                    end: date(2024, 3, 15),
                },
            )
            .await
            .unwrap();
        assert_eq!(first.sample_count, 3);
        assert!((first.mean_index.unwrap() - 0.45).abs() < 1e-12);

        let empty = source
            .query_interval(
                &region(),
                Interval {
                    start: date(2024, 3, 16),
                    end: date(2024, 4, 4),
                },
            )
            .await
            .unwrap();
        assert_eq!(
            empty,
            IntervalStat {
                mean_index: None,
                sample_count: 0
            }
        );
    }

    #[tokio::test]
    async fn unconfigured_source_always_fails() {
        let source = ConfiguredImagery::None(NoImagery);
        let err = source
            .query_interval(
                &region(),
                Interval {
                    start: date(2024, 3, 6),
                    end: date(2024, 3, 15),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ImageryUnconfigured));
    }

    #[test]
    fn interval_response_tolerates_missing_count() {
        let stat: IntervalStat = serde_json::from_str(r#"{"mean_index": null}"#).unwrap();
        assert_eq!(stat.mean_index, None);
        assert_eq!(stat.sample_count, 0);
    }

    #[test]
    fn http_url_joins_base_without_double_slash() {
        let source = HttpImagery::new(
            Client::new(),
            "https://imagery.example/api/",
            QualityFilter {
                max_cloud_pct: 20.0,
                scale_m: 30.0,
            },
            RetryPolicy {
                max_retries: 1,
                delay: std::time::Duration::from_millis(1),
            },
        );
        assert_eq!(source.url, "https://imagery.example/api/ndvi/interval");
    }

    #[tokio::test]
    async fn rows_without_sample_count_are_single_observations() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("observations.csv");
        std::fs::write(
            &path,
            "period_start,period_end,ndvi_mean\n\
             2024-03-06,2024-03-10,0.30\n\
             2024-03-11,2024-03-15,0.50\n",
        )
        .unwrap();
        let source = CsvImagery::from_path(&path).unwrap();
        let stat = source
            .query_interval(
                &region(),
                Interval {
                    start: date(2024, 3, 6),
                    end: date(2024, 3, 15),
                },
            )
            .await
            .unwrap();
        assert_eq!(stat.sample_count, 2);
        assert!((stat.mean_index.unwrap() - 0.40).abs() < 1e-12);
    }
}
