//! TOML-конфигурация конвейера: все ключи необязательны и накладываются на значения по умолчанию.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::constants::DATE_FORMAT;
use crate::critical::{CriticalSettings, CriticalThresholds};
use crate::fetch::{self, RetryPolicy};
use crate::imagery::{ConfiguredImagery, CsvImagery, HttpImagery, NoImagery, QualityFilter};
use crate::model::{ModelKind, ModelSettings, TrendFilterConfig};
use crate::region::{ConfiguredRegions, GeoJsonRegions, NoRegions};
use crate::series::ResampleOptions;

pub const DEFAULT_CONFIG_PATH: &str = "config/hijau.toml";

const DEFAULT_START_DATE: &str = "2024-03-06";
const DEFAULT_END_DATE: &str = "2025-05-28";
const DEFAULT_INTERVAL_DAYS: u32 = 10;
const DEFAULT_MAX_DAYS: usize = 730;
const DEFAULT_FILL_VALUE: f64 = 0.4;
const DEFAULT_MAX_CLOUD_PCT: f64 = 20.0;
const DEFAULT_SCALE_M: f64 = 30.0;
const DEFAULT_CONTEXT_DAYS: usize = 30;
const DEFAULT_SMOOTHING_WINDOW: usize = 3;
const DEFAULT_LOOK_BACK: usize = 60;
const DEFAULT_HORIZON: usize = 30;
const DEFAULT_MODEL_PATH: &str = "models/ndvi_dense_60.json";
const DEFAULT_SCALER_PATH: &str = "models/ndvi_scaler.json";
const DEFAULT_NOISE_STD: f64 = 0.005;
const DEFAULT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY_SECS: u64 = 2;
const DEFAULT_CITY: &str = "Kota Semarang";
const DEFAULT_BUFFER_M: f64 = 1000.0;
const DEFAULT_CRITICAL_MIN: f64 = 0.2;
const DEFAULT_CRITICAL_MAX: f64 = 0.3;
const DEFAULT_CRITICAL_MONTHS: u32 = 6;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    history: Option<HistoryFile>,
    smoothing: Option<SmoothingFile>,
    forecast: Option<ForecastFile>,
    model: Option<ModelFile>,
    adjustment: Option<AdjustmentFile>,
    imagery: Option<ImageryFile>,
    regions: Option<RegionsFile>,
    critical: Option<CriticalFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HistoryFile {
    start_date: Option<String>,
    end_date: Option<String>,
    interval_days: Option<u32>,
    max_days: Option<usize>,
    default_value: Option<f64>,
    max_cloud_pct: Option<f64>,
    scale_m: Option<f64>,
    context_days: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SmoothingFile {
    window: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ForecastFile {
    look_back: Option<usize>,
    horizon: Option<usize>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ModelFile {
    kind: Option<ModelKind>,
    path: Option<PathBuf>,
    scaler_path: Option<PathBuf>,
    trend_filter: Option<TrendFilterFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TrendFilterFile {
    lambda: Option<f64>,
    epsilon: Option<f64>,
    #[serde(alias = "huber")]
    huber_delta: Option<f64>,
    damping: Option<f64>,
    steps: Option<usize>,
    max_iters: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AdjustmentFile {
    enabled: Option<bool>,
    noise_std: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageryFile {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
    retry_delay_secs: Option<u64>,
    observations_csv: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RegionsFile {
    geojson: Option<PathBuf>,
    city: Option<String>,
    buffer_m: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CriticalFile {
    threshold_min: Option<f64>,
    threshold_max: Option<f64>,
    window_months: Option<u32>,
}

#[derive(Clone, Debug)]
pub struct HistoryConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub interval_days: u32,
    pub max_days: usize,
    pub default_value: f64,
    pub max_cloud_pct: f64,
    pub scale_m: f64,
    pub context_days: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct AdjustmentConfig {
    pub enabled: bool,
    pub noise_std: f64,
}

#[derive(Clone, Debug)]
pub struct ImageryConfig {
    pub base_url: Option<String>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub observations_csv: Option<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct RegionsConfig {
    pub geojson: Option<PathBuf>,
    pub city: String,
    pub buffer_m: f64,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub history: HistoryConfig,
    pub smoothing_window: usize,
    pub look_back: usize,
    pub horizon: usize,
    pub model: ModelSettings,
    pub adjustment: AdjustmentConfig,
    pub imagery: ImageryConfig,
    pub regions: RegionsConfig,
    pub critical: CriticalSettings,
}

impl Config {
    pub fn defaults() -> Result<Self, String> {
        resolve(ConfigFile::default())
    }

    pub fn from_toml(raw: &str) -> Result<Self, String> {
        let file: ConfigFile = toml::from_str(raw).map_err(|err| err.to_string())?;
        resolve(file)
    }

    pub fn resample_options(&self) -> ResampleOptions {
        ResampleOptions {
            start: self.history.start_date,
            end: self.history.end_date,
            interval_days: self.history.interval_days,
            max_days: self.history.max_days,
            default_value: self.history.default_value,
            timeout: self.imagery.timeout,
        }
    }
}

/// Загружает конфигурацию; отсутствие файла по умолчанию не ошибка, а явно указанного является ошибкой.
pub fn load_config(path: &Path) -> Result<Config, String> {
    if !path.exists() {
        if path == Path::new(DEFAULT_CONFIG_PATH) {
            tracing::info!(
                "Config {} not found, using built-in defaults",
                path.display()
            );
            return Config::defaults();
        }
        return Err(format!("Config {} does not exist", path.display()));
    }
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {err}", path.display()))?;
    Config::from_toml(&raw).map_err(|err| format!("Invalid config {}: {err}", path.display()))
}

fn parse_date(key: &str, raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|err| format!("{key} must be a YYYY-MM-DD date, got '{raw}': {err}"))
}

fn resolve(file: ConfigFile) -> Result<Config, String> {
    let history = resolve_history(file.history)?;
    validate_history(&history)?;

    let smoothing_window = file
        .smoothing
        .and_then(|smoothing| smoothing.window)
        .unwrap_or(DEFAULT_SMOOTHING_WINDOW);
    if smoothing_window == 0 {
        return Err("smoothing.window must be >= 1".to_string());
    }

    let (look_back, horizon) = file.forecast.map_or((None, None), |forecast| {
        (forecast.look_back, forecast.horizon)
    });
    let look_back = look_back.unwrap_or(DEFAULT_LOOK_BACK);
    let horizon = horizon.unwrap_or(DEFAULT_HORIZON);
    if look_back == 0 {
        return Err("forecast.look_back must be >= 1".to_string());
    }
    if horizon == 0 {
        return Err("forecast.horizon must be >= 1".to_string());
    }

    let model = resolve_model(file.model, look_back);
    validate_trend_filter_config(&model.trend_filter)?;

    let adjustment = resolve_adjustment(file.adjustment);
    if !adjustment.noise_std.is_finite() || adjustment.noise_std < 0.0 {
        return Err("adjustment.noise_std must be >= 0".to_string());
    }

    let imagery = resolve_imagery(file.imagery)?;
    let regions = resolve_regions(file.regions);
    if !regions.buffer_m.is_finite() || regions.buffer_m <= 0.0 {
        return Err("regions.buffer_m must be > 0".to_string());
    }

    let critical = resolve_critical(file.critical, history.interval_days)?;

    Ok(Config {
        history,
        smoothing_window,
        look_back,
        horizon,
        model,
        adjustment,
        imagery,
        regions,
        critical,
    })
}

fn resolve_critical(
    overrides: Option<CriticalFile>,
    interval_days: u32,
) -> Result<CriticalSettings, String> {
    let (min, max, months) = overrides.map_or((None, None, None), |file| {
        (file.threshold_min, file.threshold_max, file.window_months)
    });
    let thresholds = CriticalThresholds::new(
        min.unwrap_or(DEFAULT_CRITICAL_MIN),
        max.unwrap_or(DEFAULT_CRITICAL_MAX),
    )
    .map_err(|err| format!("critical.threshold_min/threshold_max: {err}"))?;
    let window_months = months.unwrap_or(DEFAULT_CRITICAL_MONTHS);
    if window_months == 0 {
        return Err("critical.window_months must be >= 1".to_string());
    }
    Ok(CriticalSettings {
        thresholds,
        window_months,
        interval_days,
    })
}

fn resolve_history(overrides: Option<HistoryFile>) -> Result<HistoryConfig, String> {
    let mut cfg = HistoryConfig {
        start_date: parse_date("history.start_date", DEFAULT_START_DATE)?,
        end_date: parse_date("history.end_date", DEFAULT_END_DATE)?,
        interval_days: DEFAULT_INTERVAL_DAYS,
        max_days: DEFAULT_MAX_DAYS,
        default_value: DEFAULT_FILL_VALUE,
        max_cloud_pct: DEFAULT_MAX_CLOUD_PCT,
        scale_m: DEFAULT_SCALE_M,
        context_days: DEFAULT_CONTEXT_DAYS,
    };
    if let Some(overrides) = overrides {
        if let Some(raw) = overrides.start_date {
            cfg.start_date = parse_date("history.start_date", &raw)?;
        }
        if let Some(raw) = overrides.end_date {
            cfg.end_date = parse_date("history.end_date", &raw)?;
        }
        if let Some(interval_days) = overrides.interval_days {
            cfg.interval_days = interval_days;
        }
        if let Some(max_days) = overrides.max_days {
            cfg.max_days = max_days;
        }
        if let Some(default_value) = overrides.default_value {
            cfg.default_value = default_value;
        }
        if let Some(max_cloud_pct) = overrides.max_cloud_pct {
            cfg.max_cloud_pct = max_cloud_pct;
        }
        if let Some(scale_m) = overrides.scale_m {
            cfg.scale_m = scale_m;
        }
        if let Some(context_days) = overrides.context_days {
            cfg.context_days = context_days;
        }
    }
    Ok(cfg)
}

fn validate_history(cfg: &HistoryConfig) -> Result<(), String> {
    if cfg.start_date > cfg.end_date {
        return Err("history.start_date must not be after history.end_date".to_string());
    }
    if cfg.interval_days == 0 {
        return Err("history.interval_days must be >= 1".to_string());
    }
    if cfg.max_days == 0 {
        return Err("history.max_days must be >= 1".to_string());
    }
    if !cfg.default_value.is_finite() || !(0.0..=1.0).contains(&cfg.default_value) {
        return Err("history.default_value must be within 0..=1".to_string());
    }
    if !cfg.max_cloud_pct.is_finite() || !(0.0..=100.0).contains(&cfg.max_cloud_pct) {
        return Err("history.max_cloud_pct must be within 0..=100".to_string());
    }
    if !cfg.scale_m.is_finite() || cfg.scale_m <= 0.0 {
        return Err("history.scale_m must be > 0".to_string());
    }
    Ok(())
}

fn resolve_model(overrides: Option<ModelFile>, look_back: usize) -> ModelSettings {
    let mut settings = ModelSettings {
        kind: ModelKind::Dense,
        path: PathBuf::from(DEFAULT_MODEL_PATH),
        scaler_path: PathBuf::from(DEFAULT_SCALER_PATH),
        look_back,
        trend_filter: TrendFilterConfig::default(),
    };
    if let Some(overrides) = overrides {
        if let Some(kind) = overrides.kind {
            settings.kind = kind;
        }
        if let Some(path) = overrides.path {
            settings.path = path;
        }
        if let Some(scaler_path) = overrides.scaler_path {
            settings.scaler_path = scaler_path;
        }
        settings.trend_filter = resolve_trend_filter_config(overrides.trend_filter);
    }
    settings
}

fn resolve_trend_filter_config(overrides: Option<TrendFilterFile>) -> TrendFilterConfig {
    let mut cfg = TrendFilterConfig::default();
    if let Some(overrides) = overrides {
        if let Some(lambda) = overrides.lambda {
            cfg.lambda = lambda;
        }
        if let Some(epsilon) = overrides.epsilon {
            cfg.epsilon = epsilon;
        }
        if let Some(huber_delta) = overrides.huber_delta {
            cfg.huber_delta = huber_delta;
        }
        if let Some(damping) = overrides.damping {
            cfg.damping = damping;
        }
        if let Some(steps) = overrides.steps {
            cfg.steps = steps;
        }
        if let Some(max_iters) = overrides.max_iters {
            cfg.max_iters = max_iters;
        }
    }
    cfg
}

fn validate_trend_filter_config(cfg: &TrendFilterConfig) -> Result<(), String> {
    if !cfg.lambda.is_finite() || cfg.lambda < 0.0 {
        return Err("model.trend_filter.lambda must be >= 0".to_string());
    }
    if !cfg.epsilon.is_finite() || cfg.epsilon <= 0.0 {
        return Err("model.trend_filter.epsilon must be > 0".to_string());
    }
    if !cfg.huber_delta.is_finite() || cfg.huber_delta < 0.0 {
        return Err("model.trend_filter.huber_delta must be >= 0".to_string());
    }
    if !cfg.damping.is_finite() || !(0.0..=1.0).contains(&cfg.damping) {
        return Err("model.trend_filter.damping must be within 0..=1".to_string());
    }
    if cfg.steps == 0 {
        return Err("model.trend_filter.steps must be >= 1".to_string());
    }
    Ok(())
}

fn resolve_adjustment(overrides: Option<AdjustmentFile>) -> AdjustmentConfig {
    let mut cfg = AdjustmentConfig {
        enabled: true,
        noise_std: DEFAULT_NOISE_STD,
    };
    if let Some(overrides) = overrides {
        if let Some(enabled) = overrides.enabled {
            cfg.enabled = enabled;
        }
        if let Some(noise_std) = overrides.noise_std {
            cfg.noise_std = noise_std;
        }
    }
    cfg
}

fn resolve_imagery(overrides: Option<ImageryFile>) -> Result<ImageryConfig, String> {
    let mut timeout_secs = DEFAULT_TIMEOUT_SECS;
    let mut retry_delay_secs = DEFAULT_RETRY_DELAY_SECS;
    let mut cfg = ImageryConfig {
        base_url: None,
        timeout: Duration::from_secs(timeout_secs),
        max_retries: DEFAULT_MAX_RETRIES,
        retry_delay: Duration::from_secs(retry_delay_secs),
        observations_csv: None,
    };
    if let Some(overrides) = overrides {
        cfg.base_url = overrides.base_url.filter(|url| !url.trim().is_empty());
        cfg.observations_csv = overrides.observations_csv;
        if let Some(secs) = overrides.timeout_secs {
            timeout_secs = secs;
        }
        if let Some(secs) = overrides.retry_delay_secs {
            retry_delay_secs = secs;
        }
        if let Some(max_retries) = overrides.max_retries {
            cfg.max_retries = max_retries;
        }
    }
    if timeout_secs == 0 {
        return Err("imagery.timeout_secs must be >= 1".to_string());
    }
    if cfg.max_retries == 0 {
        return Err("imagery.max_retries must be >= 1".to_string());
    }
    cfg.timeout = Duration::from_secs(timeout_secs);
    cfg.retry_delay = Duration::from_secs(retry_delay_secs);
    Ok(cfg)
}

fn resolve_regions(overrides: Option<RegionsFile>) -> RegionsConfig {
    let mut cfg = RegionsConfig {
        geojson: None,
        city: DEFAULT_CITY.to_string(),
        buffer_m: DEFAULT_BUFFER_M,
    };
    if let Some(overrides) = overrides {
        cfg.geojson = overrides.geojson;
        if let Some(city) = overrides.city {
            cfg.city = city;
        }
        if let Some(buffer_m) = overrides.buffer_m {
            cfg.buffer_m = buffer_m;
        }
    }
    cfg
}

/// Источник снимков по конфигурации: HTTP, затем офлайн CSV, иначе подстановка.
pub fn build_imagery(config: &Config) -> Result<ConfiguredImagery, String> {
    if let Some(base_url) = &config.imagery.base_url {
        let client = fetch::build_client()
            .map_err(|err| format!("Failed to build HTTP client: {err}"))?;
        let filter = QualityFilter {
            max_cloud_pct: config.history.max_cloud_pct,
            scale_m: config.history.scale_m,
        };
        tracing::info!(base_url = %base_url, "Using remote imagery source");
        return Ok(ConfiguredImagery::Http(HttpImagery::new(
            client,
            base_url,
            filter,
            RetryPolicy {
                max_retries: config.imagery.max_retries,
                delay: config.imagery.retry_delay,
            },
        )));
    }
    if let Some(path) = &config.imagery.observations_csv {
        let source = CsvImagery::from_path(path).map_err(|err| {
            format!("Failed to load observations {}: {err}", path.display())
        })?;
        return Ok(ConfiguredImagery::Csv(source));
    }
    tracing::warn!("No imagery source configured, histories will be synthetic");
    Ok(ConfiguredImagery::None(NoImagery))
}

pub fn build_regions(config: &Config) -> Result<ConfiguredRegions, String> {
    match &config.regions.geojson {
        Some(path) => GeoJsonRegions::from_path(path, &config.regions.city)
            .map(ConfiguredRegions::GeoJson)
            .map_err(|err| format!("Failed to load district geometries: {err}")),
        None => Ok(ConfiguredRegions::None(NoRegions)),
    }
}
