//! Общие константы форматирования и диапазонов, чтобы не дублировать их по модулям.

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const NDVI_MIN: f64 = 0.0;
pub const NDVI_MAX: f64 = 1.0;
/// Разница последнего и первого прогноза, начиная с которой тренд не считается стабильным.
pub const TREND_THRESHOLD: f64 = 0.05;
pub const MAX_PREDICTION_DAYS: usize = 365;
