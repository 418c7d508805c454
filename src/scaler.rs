//! Min-max преобразование NDVI в диапазон модели и обратно.
//!
//! Скейлер подгоняется один раз по фиксированной области значений индекса, а не по данным
//! запроса, поэтому одинаково кодирует вход модели и декодирует её выход.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::constants::{NDVI_MAX, NDVI_MIN};
use crate::error::PipelineError;

const RANGE_TOLERANCE: f64 = 1e-6;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MinMaxScaler {
    pub data_min: f64,
    pub data_max: f64,
    pub feature_min: f64,
    pub feature_max: f64,
}

impl Default for MinMaxScaler {
    fn default() -> Self {
        Self::fit_domain(NDVI_MIN, NDVI_MAX)
    }
}

impl MinMaxScaler {
    /// Скейлер для области `[min, max]` с выходом в `[0, 1]`.
    pub const fn fit_domain(min: f64, max: f64) -> Self {
        Self {
            data_min: min,
            data_max: max,
            feature_min: 0.0,
            feature_max: 1.0,
        }
    }

    fn validate(&self) -> Result<(), String> {
        let finite = [
            self.data_min,
            self.data_max,
            self.feature_min,
            self.feature_max,
        ]
        .iter()
        .all(|value| value.is_finite());
        if !finite {
            return Err("scaler bounds must be finite".into());
        }
        if self.data_max <= self.data_min {
            return Err("scaler data_max must be greater than data_min".into());
        }
        if self.feature_max <= self.feature_min {
            return Err("scaler feature_max must be greater than feature_min".into());
        }
        Ok(())
    }

    fn ratio(&self) -> f64 {
        (self.feature_max - self.feature_min) / (self.data_max - self.data_min)
    }

    pub fn forward(&self, value: f64) -> f64 {
        (value - self.data_min).mul_add(self.ratio(), self.feature_min)
    }

    pub fn inverse(&self, scaled: f64) -> f64 {
        (scaled - self.feature_min) / self.ratio() + self.data_min
    }

    pub fn forward_series(&self, values: &[f64]) -> Vec<f64> {
        values.iter().map(|value| self.forward(*value)).collect()
    }

    pub fn inverse_series(&self, scaled: &[f64]) -> Vec<f64> {
        scaled.iter().map(|value| self.inverse(*value)).collect()
    }

    /// Проверяет, что масштабированные значения лежат в диапазоне модели.
    pub fn check_range(&self, scaled: &[f64]) -> Result<(), PipelineError> {
        let lo = self.feature_min - RANGE_TOLERANCE;
        let hi = self.feature_max + RANGE_TOLERANCE;
        match scaled
            .iter()
            .find(|value| !value.is_finite() || **value < lo || **value > hi)
        {
            Some(value) => Err(PipelineError::TransformMismatch {
                value: *value,
                min: self.feature_min,
                max: self.feature_max,
            }),
            None => Ok(()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read(path).map_err(|err| {
            PipelineError::Io(format!("Failed to read scaler {}: {err}", path.display()))
        })?;
        let scaler: Self = serde_json::from_slice(&raw).map_err(|err| {
            PipelineError::Io(format!("Failed to parse scaler {}: {err}", path.display()))
        })?;
        scaler
            .validate()
            .map_err(|err| PipelineError::Io(format!("Invalid scaler {}: {err}", path.display())))?;
        Ok(scaler)
    }

    /// Загружает скейлер; если файла нет, подгоняет новый по области NDVI и сохраняет его.
    pub fn load_or_fit(path: &Path) -> Result<Self, PipelineError> {
        if path.exists() {
            let scaler = Self::load(path)?;
            info!(path = %path.display(), "Loaded scaler");
            return Ok(scaler);
        }
        let scaler = Self::default();
        match scaler.save(path) {
            Ok(()) => info!(path = %path.display(), "Scaler not found, fitted and saved a new one"),
            Err(err) => warn!(path = %path.display(), error = %err, "Failed to save fitted scaler"),
        }
        Ok(scaler)
    }
}
