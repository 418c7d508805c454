//! Обёртка над обученной последовательной моделью и её скейлером.

use std::fs;
use std::path::{Path, PathBuf};

use argmin::core::{CostFunction, Error as ArgminError, Executor, Gradient, State};
use argmin::solver::linesearch::MoreThuenteLineSearch;
use argmin::solver::quasinewton::LBFGS;
use itertools::Itertools;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::scaler::MinMaxScaler;
use crate::window::Window;

const DEFAULT_MAX_ITERS: u64 = 400;
const DEFAULT_HISTORY: usize = 10;
const DEFAULT_TOL_GRAD: f64 = 1e-8;
const DEFAULT_TOL_COST: f64 = 1e-10;
const DEFAULT_TF_LAMBDA: f64 = 5.0;
const DEFAULT_TF_EPS: f64 = 1e-3;
const DEFAULT_TF_HUBER_DELTA: f64 = 0.0;
const DEFAULT_TF_DAMPING: f64 = 0.9;
const DEFAULT_TF_STEPS: usize = 30;
const LARGE_COST: f64 = 1e30;
/// Нижняя граница порога Huber в масштабе [0, 1]: шаг шума облачных композитов.
const MIN_HUBER_DELTA: f64 = 0.005;
const MAD_TO_SIGMA: f64 = 1.4826;
const SCALED_BOUNDS: (f64, f64) = (0.0, 1.0);
const BOUND_PENALTY: f64 = 100.0;

/// Выход модели: матрица `[batch][horizon]` или тензор `[batch][horizon][1]`.
#[derive(Clone, Debug, PartialEq)]
pub enum ModelOutput {
    Matrix(Vec<Vec<f64>>),
    Tensor(Vec<Vec<Vec<f64>>>),
}

impl ModelOutput {
    pub fn flatten(self) -> Vec<f64> {
        match self {
            Self::Matrix(rows) => rows.into_iter().flatten().collect(),
            Self::Tensor(batches) => batches.into_iter().flatten().flatten().collect(),
        }
    }
}

pub trait Forecaster: Send + Sync {
    fn name(&self) -> &str;
    fn predict(&self, window: &Window) -> Result<ModelOutput, PipelineError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelKind {
    Dense,
    #[serde(alias = "trend_filter")]
    TrendFilter,
}

#[derive(Clone, Debug)]
pub struct ModelSettings {
    pub kind: ModelKind,
    pub path: PathBuf,
    pub scaler_path: PathBuf,
    pub look_back: usize,
    pub trend_filter: TrendFilterConfig,
}

/// Линейная многогоризонтная голова: `out[h] = bias[h] + Σ weights[h][i] · x[i]`.
#[derive(Clone, Debug, Deserialize)]
pub struct DenseSequenceModel {
    pub look_back: usize,
    pub horizon: usize,
    #[serde(default = "default_output_rank")]
    pub output_rank: u8,
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

const fn default_output_rank() -> u8 {
    2
}

impl DenseSequenceModel {
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read(path).map_err(|err| {
            PipelineError::Io(format!("Failed to read model {}: {err}", path.display()))
        })?;
        let model: Self = serde_json::from_slice(&raw).map_err(|err| {
            PipelineError::Io(format!("Failed to parse model {}: {err}", path.display()))
        })?;
        model
            .validate()
            .map_err(|err| PipelineError::Io(format!("Invalid model {}: {err}", path.display())))?;
        Ok(model)
    }

    fn validate(&self) -> Result<(), String> {
        if self.look_back == 0 || self.horizon == 0 {
            return Err("look_back and horizon must be >= 1".into());
        }
        if !matches!(self.output_rank, 2 | 3) {
            return Err(format!("output_rank must be 2 or 3, got {}", self.output_rank));
        }
        if self.weights.len() != self.horizon || self.bias.len() != self.horizon {
            return Err("weights and bias must have one row per horizon step".into());
        }
        if self.weights.iter().any(|row| row.len() != self.look_back) {
            return Err("every weight row must have look_back entries".into());
        }
        if self
            .weights
            .iter()
            .flatten()
            .chain(self.bias.iter())
            .any(|value| !value.is_finite())
        {
            return Err("weights and bias must be finite".into());
        }
        Ok(())
    }
}

impl Forecaster for DenseSequenceModel {
    fn name(&self) -> &str {
        "dense"
    }

    fn predict(&self, window: &Window) -> Result<ModelOutput, PipelineError> {
        let (_, steps, _) = window.shape();
        if steps != self.look_back {
            return Err(PipelineError::InvalidInput(format!(
                "model expects look_back={}, window has {steps}",
                self.look_back
            )));
        }
        let input: Vec<f64> = window
            .to_tensor()
            .into_iter()
            .flatten()
            .flatten()
            .collect();
        let out: Vec<f64> = self
            .weights
            .iter()
            .zip(&self.bias)
            .map(|(row, bias)| {
                row.iter()
                    .zip(&input)
                    .fold(*bias, |acc, (w, x)| w.mul_add(*x, acc))
            })
            .collect();
        Ok(if self.output_rank == 3 {
            ModelOutput::Tensor(vec![out.into_iter().map(|value| vec![value]).collect()])
        } else {
            ModelOutput::Matrix(vec![out])
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TrendFilterConfig {
    pub lambda: f64,
    pub epsilon: f64,
    pub huber_delta: f64,
    pub damping: f64,
    pub max_iters: u64,
    pub history: usize,
    pub steps: usize,
}

impl Default for TrendFilterConfig {
    fn default() -> Self {
        Self {
            lambda: DEFAULT_TF_LAMBDA,
            epsilon: DEFAULT_TF_EPS,
            huber_delta: DEFAULT_TF_HUBER_DELTA,
            damping: DEFAULT_TF_DAMPING,
            max_iters: DEFAULT_MAX_ITERS,
            history: DEFAULT_HISTORY,
            steps: DEFAULT_TF_STEPS,
        }
    }
}

/// Робастный трендовый фильтр по окну: Huber по остаткам плюс сглаженная L1 по вторым разностям,
/// продолжение: затухающий наклон последнего участка тренда.
#[derive(Clone, Debug)]
pub struct TrendFilterForecaster {
    config: TrendFilterConfig,
}

impl TrendFilterForecaster {
    pub const fn new(config: TrendFilterConfig) -> Self {
        Self { config }
    }

    /// Порог Huber: из конфигурации или по MAD шагов окна, не ниже шума композитов.
    fn huber_delta(&self, observed: &[f64]) -> f64 {
        if self.config.huber_delta > 0.0 {
            return self.config.huber_delta;
        }
        let steps: Vec<f64> = observed.iter().tuple_windows().map(|(a, b)| b - a).collect();
        (MAD_TO_SIGMA * median_abs_deviation(&steps)).max(MIN_HUBER_DELTA)
    }

    fn fit(&self, observed: &[f64]) -> Result<Vec<f64>, ArgminError> {
        if observed.len() < 3 {
            return Ok(observed.to_vec());
        }
        let cost = WindowTrendCost {
            observed: observed.to_vec(),
            huber: Huber {
                delta: self.huber_delta(observed),
            },
            smoothness: self.config.lambda.max(0.0),
            epsilon: self.config.epsilon.max(1e-9),
        };
        let linesearch = MoreThuenteLineSearch::new().with_c(1e-4, 0.9)?;
        let solver = LBFGS::new(linesearch, self.config.history)
            .with_tolerance_grad(DEFAULT_TOL_GRAD)?
            .with_tolerance_cost(DEFAULT_TOL_COST)?;

        let result = Executor::new(cost, solver)
            .configure(|state| state.param(observed.to_vec()).max_iters(self.config.max_iters))
            .run()?;

        Ok(result
            .state
            .get_param()
            .cloned()
            .unwrap_or_else(|| observed.to_vec()))
    }
}

impl Forecaster for TrendFilterForecaster {
    fn name(&self) -> &str {
        "trend-filter"
    }

    fn predict(&self, window: &Window) -> Result<ModelOutput, PipelineError> {
        let trend = self
            .fit(window.values())
            .map_err(|err| PipelineError::ModelOutput(format!("trend filter failed: {err}")))?;
        let last = trend.last().copied().ok_or(PipelineError::EmptySeries)?;
        let slope = if trend.len() > 1 {
            last - trend[trend.len() - 2]
        } else {
            0.0
        };
        let phi = self.config.damping.clamp(0.0, 1.0);

        let out = (1..=self.config.steps.max(1))
            .map(|step| {
                let step_f = step as f64;
                let sum_phi = if (phi - 1.0).abs() < 1e-12 {
                    step_f
                } else {
                    (1.0 - phi.powf(step_f)) / (1.0 - phi)
                };
                slope.mul_add(sum_phi, last)
            })
            .collect();
        Ok(ModelOutput::Matrix(vec![out]))
    }
}

/// Стоимость тренда окна в масштабе модели: Huber по остаткам, сглаженная L1 по кривизне
/// и квадратичный штраф за выход из диапазона скейлера.
#[derive(Clone)]
struct WindowTrendCost {
    observed: Vec<f64>,
    huber: Huber,
    smoothness: f64,
    epsilon: f64,
}

impl WindowTrendCost {
    /// Вторые разности с индексом последней точки тройки.
    fn curvature(trend: &[f64]) -> impl Iterator<Item = (usize, f64)> + '_ {
        trend
            .windows(3)
            .enumerate()
            .map(|(idx, w)| (idx + 2, 2.0f64.mul_add(-w[1], w[0] + w[2])))
    }

    fn smooth_abs(&self, d2: f64) -> f64 {
        d2.mul_add(d2, self.epsilon * self.epsilon).sqrt()
    }
}

/// Знаковое превышение над `SCALED_BOUNDS`, ноль внутри диапазона.
fn overshoot(value: f64) -> f64 {
    (value - SCALED_BOUNDS.1).max(0.0) + (value - SCALED_BOUNDS.0).min(0.0)
}

impl CostFunction for WindowTrendCost {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, trend: &Self::Param) -> Result<Self::Output, ArgminError> {
        if trend.len() != self.observed.len() {
            return Ok(LARGE_COST);
        }
        let fit: f64 = trend
            .iter()
            .zip(&self.observed)
            .map(|(&t, &y)| BOUND_PENALTY.mul_add(overshoot(t).powi(2), self.huber.loss(t - y)))
            .sum();
        let roughness: f64 = Self::curvature(trend)
            .map(|(_, d2)| self.smooth_abs(d2))
            .sum();
        Ok(self.smoothness.mul_add(roughness, fit))
    }
}

impl Gradient for WindowTrendCost {
    type Param = Vec<f64>;
    type Gradient = Vec<f64>;

    fn gradient(&self, trend: &Self::Param) -> Result<Self::Gradient, ArgminError> {
        if trend.len() != self.observed.len() {
            return Ok(vec![0.0; trend.len()]);
        }
        let mut grad: Vec<f64> = trend
            .iter()
            .zip(&self.observed)
            .map(|(&t, &y)| (2.0 * BOUND_PENALTY).mul_add(overshoot(t), self.huber.grad(t - y)))
            .collect();
        if self.smoothness > 0.0 {
            for (idx, d2) in Self::curvature(trend) {
                let g = self.smoothness * d2 / self.smooth_abs(d2);
                grad[idx] += g;
                grad[idx - 1] -= 2.0 * g;
                grad[idx - 2] += g;
            }
        }
        Ok(grad)
    }
}

#[derive(Clone, Copy, Debug)]
struct Huber {
    delta: f64,
}

impl Huber {
    fn loss(self, residual: f64) -> f64 {
        let abs = residual.abs();
        if abs <= self.delta {
            0.5 * residual * residual
        } else {
            self.delta * 0.5f64.mul_add(-self.delta, abs)
        }
    }

    fn grad(self, residual: f64) -> f64 {
        residual.clamp(-self.delta, self.delta)
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

fn median_abs_deviation(values: &[f64]) -> f64 {
    let center = median(values.to_vec());
    median(values.iter().map(|value| (value - center).abs()).collect())
}

/// Модель и её скейлер; загружаются один раз при старте и дальше только читаются.
pub struct ModelBundle {
    forecaster: Box<dyn Forecaster>,
    scaler: MinMaxScaler,
}

impl ModelBundle {
    pub fn new(forecaster: Box<dyn Forecaster>, scaler: MinMaxScaler) -> Self {
        Self { forecaster, scaler }
    }

    pub fn load(settings: &ModelSettings) -> Result<Self, PipelineError> {
        let forecaster: Box<dyn Forecaster> = match settings.kind {
            ModelKind::Dense => {
                let model = DenseSequenceModel::load(&settings.path)?;
                if model.look_back != settings.look_back {
                    return Err(PipelineError::InvalidInput(format!(
                        "model {} expects look_back={}, configured look_back={}",
                        settings.path.display(),
                        model.look_back,
                        settings.look_back
                    )));
                }
                Box::new(model)
            }
            ModelKind::TrendFilter => Box::new(TrendFilterForecaster::new(settings.trend_filter)),
        };
        let scaler = MinMaxScaler::load_or_fit(&settings.scaler_path)?;
        Ok(Self::new(forecaster, scaler))
    }

    pub const fn scaler(&self) -> &MinMaxScaler {
        &self.scaler
    }

    pub fn name(&self) -> &str {
        self.forecaster.name()
    }

    /// Прогноз на `horizon` шагов в исходных единицах NDVI.
    ///
    /// Если модель выдаёт меньше `horizon` значений, окно сдвигается на полученные
    /// предсказания и модель вызывается снова.
    pub fn forecast(&self, window: &Window, horizon: usize) -> Result<Vec<f64>, PipelineError> {
        if horizon == 0 {
            return Err(PipelineError::InvalidInput("horizon must be >= 1".into()));
        }
        self.scaler.check_range(window.values())?;

        let mut scaled = Vec::with_capacity(horizon);
        let mut current = window.clone();
        let mut calls = 0_usize;
        while scaled.len() < horizon {
            let step = self.forecaster.predict(&current)?.flatten();
            calls += 1;
            if step.is_empty() {
                return Err(PipelineError::ModelOutput("model returned no values".into()));
            }
            if let Some(bad) = step.iter().find(|value| !value.is_finite()) {
                return Err(PipelineError::ModelOutput(format!(
                    "model returned non-finite value {bad}"
                )));
            }
            current = current.advance(&step);
            scaled.extend(step);
        }
        if calls > 1 {
            info!(
                model = self.name(),
                look_back = window.look_back(),
                calls,
                horizon,
                "Rolled model forward to cover horizon"
            );
        }
        scaled.truncate(horizon);
        Ok(self.scaler.inverse_series(&scaled))
    }
}

/// Состояние модели на процесс: загружена или недоступна с причиной.
pub enum ModelState {
    Ready(ModelBundle),
    Unavailable(String),
}

impl ModelState {
    pub fn load(settings: &ModelSettings) -> Self {
        match ModelBundle::load(settings) {
            Ok(bundle) => {
                info!(
                    model = bundle.name(),
                    path = %settings.path.display(),
                    scaler = %settings.scaler_path.display(),
                    "Forecast model loaded"
                );
                Self::Ready(bundle)
            }
            Err(err) => {
                warn!(error = %err, "Forecast model unavailable, forecasting disabled");
                Self::Unavailable(err.to_string())
            }
        }
    }

    pub fn bundle(&self) -> Result<&ModelBundle, PipelineError> {
        match self {
            Self::Ready(bundle) => Ok(bundle),
            Self::Unavailable(reason) => Err(PipelineError::ModelUnavailable(reason.clone())),
        }
    }
}
