//! Ошибки стадий прогнозного конвейера.

use std::fmt;

use chrono::NaiveDate;

use crate::constants::DATE_FORMAT;
use crate::fetch::FetchError;

#[derive(Debug)]
pub enum PipelineError {
    /// Модель или скейлер не загрузились при старте.
    ModelUnavailable(String),
    Imagery(FetchError),
    ImageryUnconfigured,
    ImageryTimeout {
        start: NaiveDate,
        end: NaiveDate,
    },
    RegionNotFound(String),
    EmptySeries,
    /// Масштабированное значение вышло за диапазон, на котором обучалась модель.
    TransformMismatch {
        value: f64,
        min: f64,
        max: f64,
    },
    ModelOutput(String),
    InvalidInput(String),
    Io(String),
}

impl PipelineError {
    pub const fn is_model_unavailable(&self) -> bool {
        matches!(self, Self::ModelUnavailable(_))
    }
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelUnavailable(reason) => write!(f, "forecast model unavailable: {reason}"),
            Self::Imagery(err) => write!(f, "imagery request failed: {err}"),
            Self::ImageryUnconfigured => f.write_str("no imagery source configured"),
            Self::ImageryTimeout { start, end } => write!(
                f,
                "imagery request for {}..{} timed out",
                start.format(DATE_FORMAT),
                end.format(DATE_FORMAT)
            ),
            Self::RegionNotFound(name) => write!(f, "no geometry or default centroid for '{name}'"),
            Self::EmptySeries => f.write_str("series is empty"),
            Self::TransformMismatch { value, min, max } => write!(
                f,
                "scaled value {value:.6} outside model range [{min}, {max}]"
            ),
            Self::ModelOutput(reason) => write!(f, "malformed model output: {reason}"),
            Self::InvalidInput(reason) => write!(f, "invalid input: {reason}"),
            Self::Io(reason) => f.write_str(reason),
        }
    }
}

impl std::error::Error for PipelineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Imagery(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FetchError> for PipelineError {
    fn from(err: FetchError) -> Self {
        Self::Imagery(err)
    }
}

impl From<csv::Error> for PipelineError {
    fn from(err: csv::Error) -> Self {
        Self::Io(format!("CSV error: {err}"))
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Io(format!("JSON error: {err}"))
    }
}
