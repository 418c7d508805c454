//! Поиск критических районов: доля интервалов с NDVI в заданном диапазоне, оценка риска
//! и текстовые рекомендации.
//!
//! Статистика района строится по интервальным средним за последние месяцы истории. Если
//! снимки недоступны, район получает детерминированную симуляцию по seed имени.

use chrono::{Months, NaiveDate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};
use serde::Serialize;
use tracing::debug;

use crate::constants::{DATE_FORMAT, NDVI_MAX, NDVI_MIN};
use crate::district::{DistrictCategory, DistrictProfile, default_centroid};
use crate::error::PipelineError;
use crate::imagery::ImagerySource;
use crate::region::Geometry;
use crate::series::{accepted_value, mean, min_max, partition_intervals, query_interval};

const MAX_SPECIFIC_RECOMMENDATIONS: usize = 5;
const URBAN_LOCATION_RISK: f64 = 10.0;
const MAX_RISK_SCORE: f64 = 100.0;
const METHODOLOGY: &str = "Rekomendasi dibuat berdasarkan NDVI rata-rata, persentase area kritis, \
                           variabilitas, dan faktor lokasi.";

/// Диапазон NDVI, который считается критическим (границы включительно).
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct CriticalThresholds {
    pub min: f64,
    pub max: f64,
}

impl CriticalThresholds {
    pub fn new(min: f64, max: f64) -> Result<Self, String> {
        if !min.is_finite() || !max.is_finite() {
            return Err(format!("thresholds must be finite, got {min}..{max}"));
        }
        if !(NDVI_MIN..=NDVI_MAX).contains(&min) || !(NDVI_MIN..=NDVI_MAX).contains(&max) {
            return Err(format!("thresholds must lie within 0..=1, got {min}..{max}"));
        }
        if min > max {
            return Err(format!("threshold min {min} is above max {max}"));
        }
        Ok(Self { min, max })
    }

    pub fn contains(self, value: f64) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CriticalSettings {
    pub thresholds: CriticalThresholds,
    /// Длина окна анализа в месяцах до `history.end_date`.
    pub window_months: u32,
    pub interval_days: u32,
}

impl CriticalSettings {
    pub fn period_start(&self, end: NaiveDate) -> NaiveDate {
        end.checked_sub_months(Months::new(self.window_months))
            .unwrap_or(end)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum Severity {
    #[serde(rename = "SANGAT KRITIS")]
    SangatKritis,
    #[serde(rename = "KRITIS")]
    Kritis,
    #[serde(rename = "BERPOTENSI KRITIS")]
    BerpotensiKritis,
    #[serde(rename = "NORMAL")]
    Normal,
}

impl Severity {
    pub fn classify(avg_ndvi: f64, critical_percentage: f64) -> Self {
        if avg_ndvi <= 0.2 && critical_percentage >= 70.0 {
            Self::SangatKritis
        } else if avg_ndvi <= 0.25 && critical_percentage >= 50.0 {
            Self::Kritis
        } else if avg_ndvi <= 0.3 && critical_percentage >= 30.0 {
            Self::BerpotensiKritis
        } else {
            Self::Normal
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Imagery,
    Simulated,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct RiskFactors {
    pub ndvi_impact: f64,
    pub coverage_impact: f64,
    pub variability_impact: f64,
    pub location_impact: f64,
}

impl RiskFactors {
    fn score(self) -> f64 {
        (self.ndvi_impact + self.coverage_impact + self.variability_impact + self.location_impact)
            .min(MAX_RISK_SCORE)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DistrictAssessment {
    pub district_name: String,
    pub avg_ndvi: f64,
    pub min_ndvi: f64,
    pub max_ndvi: f64,
    pub std_ndvi: f64,
    pub is_critical: bool,
    pub critical_percentage: f64,
    /// Центроид `[широта, долгота]`, если район есть в таблице.
    pub coordinates: Option<[f64; 2]>,
    pub analysis_date: String,
    pub severity: Severity,
    pub data_source: DataSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_factors: Option<RiskFactors>,
}

struct DistrictStats {
    avg: f64,
    min: f64,
    max: f64,
    std: f64,
    critical_percentage: f64,
}

impl DistrictAssessment {
    fn from_stats(
        profile: &DistrictProfile,
        stats: &DistrictStats,
        thresholds: CriticalThresholds,
        analysis_date: NaiveDate,
        data_source: DataSource,
    ) -> Self {
        Self {
            district_name: profile.name.clone(),
            avg_ndvi: stats.avg,
            min_ndvi: stats.min,
            max_ndvi: stats.max,
            std_ndvi: stats.std,
            is_critical: thresholds.contains(stats.avg),
            critical_percentage: stats.critical_percentage,
            coordinates: default_centroid(&profile.name).map(|(lat, lon)| [lat, lon]),
            analysis_date: analysis_date.format(DATE_FORMAT).to_string(),
            severity: Severity::classify(stats.avg, stats.critical_percentage),
            data_source,
            risk_score: None,
            risk_factors: None,
        }
    }

    /// Заполняет `risk_score` и его составляющие; городские районы получают надбавку.
    pub fn assess_risk(&mut self, category: DistrictCategory) {
        let factors = RiskFactors {
            ndvi_impact: (0.3 - self.avg_ndvi) / 0.1 * 30.0,
            coverage_impact: self.critical_percentage / 100.0 * 40.0,
            variability_impact: self.std_ndvi * 20.0,
            location_impact: if category == DistrictCategory::Urban {
                URBAN_LOCATION_RISK
            } else {
                0.0
            },
        };
        self.risk_score = Some(factors.score());
        self.risk_factors = Some(factors);
    }
}

/// Оценка района по интервальным средним окна анализа.
///
/// Ошибка источника или таймаут возвращаются как есть; окно без единого годного интервала
/// даёт `EmptySeries`.
pub async fn assess_district<S: ImagerySource>(
    source: &S,
    region: &Geometry,
    profile: &DistrictProfile,
    settings: &CriticalSettings,
    end: NaiveDate,
    timeout: std::time::Duration,
) -> Result<DistrictAssessment, PipelineError> {
    let intervals = partition_intervals(settings.period_start(end), end, settings.interval_days);
    let mut means = Vec::with_capacity(intervals.len());
    for interval in intervals {
        let stat = query_interval(source, region, interval, timeout).await?;
        if let Some(value) = accepted_value(&stat) {
            means.push(value.clamp(NDVI_MIN, NDVI_MAX));
        }
    }
    let (min, max) = min_max(&means).ok_or(PipelineError::EmptySeries)?;
    let avg = mean(&means);
    let std = (means.iter().map(|value| (value - avg).powi(2)).sum::<f64>()
        / means.len() as f64)
        .sqrt();
    let inside = means
        .iter()
        .filter(|value| settings.thresholds.contains(**value))
        .count();
    let stats = DistrictStats {
        avg,
        min,
        max,
        std,
        critical_percentage: inside as f64 / means.len() as f64 * 100.0,
    };
    debug!(
        district = %profile.name,
        intervals = means.len(),
        avg,
        critical_percentage = stats.critical_percentage,
        "Assessed district from imagery"
    );
    Ok(DistrictAssessment::from_stats(
        profile,
        &stats,
        settings.thresholds,
        end,
        DataSource::Imagery,
    ))
}

/// Симуляция по seed района: городские районы темнее и с большей долей критической площади.
pub fn simulated_assessment(
    profile: &DistrictProfile,
    thresholds: CriticalThresholds,
    analysis_date: NaiveDate,
) -> DistrictAssessment {
    let mut rng = StdRng::seed_from_u64(profile.seed());
    let (avg_range, coverage_range) = if profile.category == DistrictCategory::Urban {
        ((0.15, 0.35), (60.0, 90.0))
    } else {
        ((0.25, 0.6), (20.0, 60.0))
    };
    let avg = Uniform::new(avg_range.0, avg_range.1).sample(&mut rng);
    let critical_percentage = Uniform::new(coverage_range.0, coverage_range.1).sample(&mut rng);
    let std = Uniform::new(0.05, 0.15).sample(&mut rng);
    let stats = DistrictStats {
        avg,
        min: (avg - 0.1).max(0.1),
        max: (avg + 0.2).min(NDVI_MAX),
        std,
        critical_percentage,
    };
    DistrictAssessment::from_stats(
        profile,
        &stats,
        thresholds,
        analysis_date,
        DataSource::Simulated,
    )
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Recommendations {
    pub general: Vec<String>,
    pub specific: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methodology: Option<String>,
}

/// Рекомендации по критическим районам, уже отсортированным по убыванию риска.
pub fn recommendations(areas: &[DistrictAssessment], thresholds: CriticalThresholds) -> Recommendations {
    if areas.is_empty() {
        return Recommendations {
            general: vec![
                "Tidak ada area kritis yang terdeteksi dalam rentang NDVI yang ditentukan.".into(),
                "Lanjutkan monitoring rutin untuk mempertahankan kondisi vegetasi yang baik.".into(),
                "Pertimbangkan program peningkatan vegetasi di area dengan NDVI rendah.".into(),
            ],
            specific: Vec::new(),
            methodology: None,
        };
    }
    let general = vec![
        format!(
            "Terdeteksi {} area kritis dengan NDVI {}-{}.",
            areas.len(),
            thresholds.min,
            thresholds.max
        ),
        "Prioritaskan intervensi pada area dengan risk score tertinggi.".into(),
        "Implementasikan program penghijauan urban untuk meningkatkan NDVI.".into(),
        "Monitor secara berkala menggunakan data satelit untuk tracking progress.".into(),
    ];
    let specific = areas
        .iter()
        .take(MAX_SPECIFIC_RECOMMENDATIONS)
        .map(|area| {
            let action = match area.risk_score.unwrap_or(0.0) {
                score if score >= 80.0 => {
                    "URGENT - Implementasi segera program penghijauan intensif, tambah ruang \
                     terbuka hijau, dan urban farming."
                }
                score if score >= 60.0 => {
                    "PRIORITAS TINGGI - Perbanyak penanaman pohon, taman kota, dan green roof \
                     di bangunan."
                }
                score if score >= 40.0 => {
                    "MONITORING - Tingkatkan maintenance area hijau existing dan tambah \
                     vegetasi di space kosong."
                }
                _ => {
                    "PREVENTIF - Jaga kondisi vegetasi current dan pertimbangkan small-scale \
                     improvements."
                }
            };
            format!("{}: {action}", area.district_name)
        })
        .collect();
    Recommendations {
        general,
        specific,
        methodology: Some(METHODOLOGY.to_string()),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CriticalSummary {
    pub total_districts_analyzed: usize,
    pub critical_areas_found: usize,
    pub percentage_critical: f64,
    pub avg_ndvi_critical: f64,
    pub most_critical_district: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CriticalReport {
    pub success: bool,
    pub critical_areas: Vec<DistrictAssessment>,
    pub recommendations: Recommendations,
    pub statistics: CriticalSummary,
    pub threshold_range: CriticalThresholds,
}

/// Собирает отчёт: оставляет критические районы, сортирует по риску, считает сводку.
pub fn build_report(
    assessments: Vec<(DistrictAssessment, DistrictCategory)>,
    thresholds: CriticalThresholds,
) -> CriticalReport {
    let total = assessments.len();
    let mut critical: Vec<DistrictAssessment> = assessments
        .into_iter()
        .filter(|(area, _)| area.is_critical)
        .map(|(mut area, category)| {
            area.assess_risk(category);
            area
        })
        .collect();
    critical.sort_by(|a, b| {
        b.risk_score
            .unwrap_or(0.0)
            .total_cmp(&a.risk_score.unwrap_or(0.0))
    });

    let averages: Vec<f64> = critical.iter().map(|area| area.avg_ndvi).collect();
    let statistics = CriticalSummary {
        total_districts_analyzed: total,
        critical_areas_found: critical.len(),
        percentage_critical: if total > 0 {
            critical.len() as f64 / total as f64 * 100.0
        } else {
            0.0
        },
        avg_ndvi_critical: mean(&averages),
        most_critical_district: critical.first().map(|area| area.district_name.clone()),
    };
    CriticalReport {
        success: true,
        recommendations: recommendations(&critical, thresholds),
        critical_areas: critical,
        statistics,
        threshold_range: thresholds,
    }
}
