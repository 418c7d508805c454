mod adjust;
mod config;
mod constants;
mod critical;
mod district;
mod error;
mod fallback;
mod fetch;
mod imagery;
mod model;
mod pipeline;
mod region;
mod report;
mod scaler;
mod series;
mod smooth;
mod window;

use clap::{CommandFactory, Parser, Subcommand};
use std::fs::{self, File};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use crate::config::{Config, DEFAULT_CONFIG_PATH, build_imagery, build_regions, load_config};
use crate::critical::CriticalThresholds;
use crate::district::{DistrictProfile, known_districts};
use crate::imagery::ConfiguredImagery;
use crate::model::ModelState;
use crate::pipeline::{ForecastRequest, Pipeline};
use crate::region::ConfiguredRegions;
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

const APP_ABOUT: &str = "HIJAU - NDVI history and forecasts for city districts";
const DEFAULT_PREDICTIONS_CSV: &str = "predictions.csv";
const DEFAULT_UPLOAD_WINDOW: usize = 5;
const DEFAULT_CITY_CONCURRENCY: usize = 4;

type ConfiguredPipeline = Pipeline<ConfiguredImagery, ConfiguredRegions>;

#[derive(Parser, Debug)]
#[command(name = "hijau", about = APP_ABOUT)]
struct Args {
    /// TOML-файл конфигурации.
    #[arg(
        long = "config",
        value_name = "PATH",
        global = true,
        default_value = DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Прогноз NDVI для одного района (JSON).
    Forecast {
        /// Название района.
        #[arg(short = 'd', long = "district", value_name = "NAME")]
        district: String,
        /// Горизонт прогноза (в днях); по умолчанию `forecast.horizon`.
        #[arg(long = "days", value_name = "DAYS")]
        days: Option<usize>,
        /// Куда сохранить JSON (если не указано, то в stdout).
        #[arg(short = 'o', long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Прогнозы для всех известных районов города (JSON-массив).
    City {
        #[arg(long = "days", value_name = "DAYS")]
        days: Option<usize>,
        #[arg(short = 'o', long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
        /// Сколько районов обрабатывать одновременно.
        #[arg(
            long = "concurrency",
            value_name = "N",
            default_value_t = DEFAULT_CITY_CONCURRENCY
        )]
        concurrency: usize,
    },
    /// Сохранить дневной ряд NDVI района в CSV.
    History {
        #[arg(short = 'd', long = "district", value_name = "NAME")]
        district: String,
        #[arg(short = 'o', long = "output-csv", value_name = "PATH")]
        output_csv: PathBuf,
    },
    /// Прогноз по CSV `period,ndvi_mean` со строгим скользящим средним.
    Upload {
        #[arg(short = 'c', long = "csv", value_name = "PATH")]
        csv: PathBuf,
        /// Окно скользящего среднего.
        #[arg(
            long = "window-size",
            value_name = "N",
            default_value_t = DEFAULT_UPLOAD_WINDOW
        )]
        window_size: usize,
        /// Длина окна модели; по умолчанию `forecast.look_back`.
        #[arg(long = "look-back", value_name = "N")]
        look_back: Option<usize>,
        /// Горизонт прогноза; по умолчанию `forecast.horizon`.
        #[arg(long = "horizon", value_name = "DAYS")]
        horizon: Option<usize>,
        #[arg(
            short = 'o',
            long = "output-csv",
            value_name = "PATH",
            default_value = DEFAULT_PREDICTIONS_CSV
        )]
        output_csv: PathBuf,
    },
    /// Поиск районов с критически низким NDVI (JSON-отчёт).
    Critical {
        /// Нижняя граница критического NDVI; по умолчанию `critical.threshold_min`.
        #[arg(long = "threshold-min", value_name = "NDVI")]
        threshold_min: Option<f64>,
        /// Верхняя граница критического NDVI; по умолчанию `critical.threshold_max`.
        #[arg(long = "threshold-max", value_name = "NDVI")]
        threshold_max: Option<f64>,
        #[arg(
            long = "concurrency",
            value_name = "N",
            default_value_t = DEFAULT_CITY_CONCURRENCY
        )]
        concurrency: usize,
        #[arg(short = 'o', long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Список известных районов и их категорий.
    Districts,
    /// Сгенерировать файлы автодополнения для shell.
    Completions {
        /// Целевой shell.
        #[arg(value_enum)]
        shell: Shell,
        /// Куда сохранить файл (если не указано, то в stdout).
        #[arg(short = 'o', long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn generate_completions(shell: Shell, output: Option<PathBuf>) -> Result<(), String> {
    let mut cmd = Args::command();
    let bin_name = cmd.get_name().to_string();
    if let Some(path) = output {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;
        }
        let mut file = File::create(&path)
            .map_err(|err| format!("Failed to create {}: {err}", path.display()))?;
        generate(shell, &mut cmd, bin_name, &mut file);
    } else {
        let mut stdout = std::io::stdout();
        generate(shell, &mut cmd, bin_name, &mut stdout);
    }
    Ok(())
}

fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hijau=info"));
    let ansi = std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn headline(message: &str) {
    tracing::info!(status = "start", "{message}");
}

fn info(message: &str) {
    tracing::info!(status = "info", "{message}");
}

fn success(message: &str) {
    tracing::info!(status = "ok", "{message}");
}

fn error(message: &str) {
    tracing::error!(status = "err", "{message}");
}

fn build_pipeline(config: Config, show_progress: bool) -> Result<ConfiguredPipeline, String> {
    let imagery = build_imagery(&config)?;
    let regions = build_regions(&config)?;
    let model = ModelState::load(&config.model);
    Ok(Pipeline::new(config, imagery, regions, model).with_progress(show_progress))
}

fn describe_output(output: Option<&Path>) -> String {
    output.map_or_else(|| "stdout".to_string(), |path| path.display().to_string())
}

async fn run_forecast(
    pipeline: &ConfiguredPipeline,
    district: String,
    days: Option<usize>,
    output: Option<&Path>,
) -> Result<(), String> {
    let request = ForecastRequest::new(district, days);
    let response = pipeline.forecast(&request).await;
    report::write_json(&response, output)
        .map_err(|err| format!("Failed to write forecast JSON: {err}"))?;
    match (&response.result, &response.error) {
        (Some(result), _) if result.fallback => info(&format!(
            "Forecast for {} is synthetic: {}",
            result.district_name,
            result.error_message.as_deref().unwrap_or("unknown error")
        )),
        (Some(result), _) => success(&format!(
            "Forecast for {} written to {}",
            result.district_name,
            describe_output(output)
        )),
        (None, Some(err)) => return Err(format!("Forecast request rejected: {err}")),
        (None, None) => return Err("Forecast request rejected".to_string()),
    }
    Ok(())
}

async fn run_city(
    pipeline: &ConfiguredPipeline,
    days: Option<usize>,
    output: Option<&Path>,
    concurrency: usize,
) -> Result<(), String> {
    let names: Vec<String> = known_districts().map(str::to_string).collect();
    let responses = pipeline.forecast_city(&names, days, concurrency).await;
    report::write_json(&responses, output)
        .map_err(|err| format!("Failed to write city JSON: {err}"))?;
    let fallback = responses
        .iter()
        .filter(|response| response.result.as_ref().is_some_and(|result| result.fallback))
        .count();
    tracing::info!(
        districts = responses.len(),
        fallback,
        output = %describe_output(output),
        "City forecast summary"
    );
    success(&format!(
        "Forecasts for {} districts written to {}",
        responses.len(),
        describe_output(output)
    ));
    Ok(())
}

async fn run_history(
    pipeline: &ConfiguredPipeline,
    district: &str,
    output_csv: &Path,
) -> Result<(), String> {
    let profile = DistrictProfile::lookup(district);
    let history = pipeline.historical_series(&profile).await;
    if let Some(err) = &history.error {
        info(&format!("History for {district} is synthetic: {err}"));
    }
    series::write_series_csv(&history.series, output_csv)
        .map_err(|err| format!("Failed to write history CSV {}: {err}", output_csv.display()))?;
    let last = history
        .series
        .last_date()
        .map_or_else(|| "-".to_string(), |date| date.to_string());
    success(&format!(
        "Saved {} days of NDVI history (last day {last}) to {}",
        history.series.len(),
        output_csv.display()
    ));
    Ok(())
}

fn run_upload(
    pipeline: &ConfiguredPipeline,
    csv: &Path,
    window_size: usize,
    look_back: Option<usize>,
    horizon: Option<usize>,
    output_csv: &Path,
) -> Result<(), String> {
    let look_back = look_back.unwrap_or(pipeline.config().look_back);
    let horizon = horizon.unwrap_or(pipeline.config().horizon);
    let forecast = pipeline
        .forecast_from_csv(csv, window_size, look_back, horizon)
        .map_err(|err| format!("Failed to forecast from {}: {err}", csv.display()))?;
    report::write_predictions_csv(&forecast.dates, &forecast.predictions, output_csv).map_err(
        |err| {
            format!(
                "Failed to write predictions CSV {}: {err}",
                output_csv.display()
            )
        },
    )?;
    success(&format!(
        "Saved {} predictions to {}",
        forecast.predictions.len(),
        output_csv.display()
    ));
    Ok(())
}

async fn run_critical(
    pipeline: &ConfiguredPipeline,
    threshold_min: Option<f64>,
    threshold_max: Option<f64>,
    concurrency: usize,
    output: Option<&Path>,
) -> Result<(), String> {
    let defaults = pipeline.config().critical.thresholds;
    let thresholds = CriticalThresholds::new(
        threshold_min.unwrap_or(defaults.min),
        threshold_max.unwrap_or(defaults.max),
    )
    .map_err(|err| format!("Invalid critical thresholds: {err}"))?;
    let names: Vec<String> = known_districts().map(str::to_string).collect();
    let report = pipeline
        .detect_critical_areas(&names, thresholds, concurrency)
        .await;
    report::write_json(&report, output)
        .map_err(|err| format!("Failed to write critical-area JSON: {err}"))?;
    success(&format!(
        "{} of {} districts are critical, report written to {}",
        report.statistics.critical_areas_found,
        report.statistics.total_districts_analyzed,
        describe_output(output)
    ));
    Ok(())
}

fn list_districts() {
    for name in known_districts() {
        let profile = DistrictProfile::lookup(name);
        println!("{name}\t{:?}", profile.category);
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    match &args.command {
        Command::Completions { shell, output } => {
            if let Err(err) = generate_completions(*shell, output.clone()) {
                eprintln!("{err}");
            }
            return;
        }
        Command::Districts => {
            list_districts();
            return;
        }
        _ => {}
    }

    init_logging();
    headline(APP_ABOUT);
    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error(&err);
            return;
        }
    };
    let show_progress = matches!(args.command, Command::History { .. });
    let pipeline = match build_pipeline(config, show_progress) {
        Ok(pipeline) => pipeline,
        Err(err) => {
            error(&err);
            return;
        }
    };

    let outcome = match args.command {
        Command::Forecast {
            district,
            days,
            output,
        } => {
            tracing::info!(
                mode = "forecast",
                district = %district,
                days = ?days,
                config_path = %args.config.display(),
                "Forecasting district"
            );
            run_forecast(&pipeline, district, days, output.as_deref()).await
        }
        Command::City {
            days,
            output,
            concurrency,
        } => {
            tracing::info!(
                mode = "city",
                days = ?days,
                concurrency,
                config_path = %args.config.display(),
                "Forecasting all districts"
            );
            run_city(&pipeline, days, output.as_deref(), concurrency).await
        }
        Command::History {
            district,
            output_csv,
        } => {
            tracing::info!(
                mode = "history",
                district = %district,
                output_csv = %output_csv.display(),
                "Building NDVI history"
            );
            run_history(&pipeline, &district, &output_csv).await
        }
        Command::Upload {
            csv,
            window_size,
            look_back,
            horizon,
            output_csv,
        } => {
            tracing::info!(
                mode = "upload",
                input_csv = %csv.display(),
                window_size,
                output_csv = %output_csv.display(),
                "Forecasting from uploaded CSV"
            );
            run_upload(
                &pipeline,
                &csv,
                window_size,
                look_back,
                horizon,
                &output_csv,
            )
        }
        Command::Critical {
            threshold_min,
            threshold_max,
            concurrency,
            output,
        } => {
            tracing::info!(
                mode = "critical",
                threshold_min = ?threshold_min,
                threshold_max = ?threshold_max,
                concurrency,
                config_path = %args.config.display(),
                "Detecting critical areas"
            );
            run_critical(
                &pipeline,
                threshold_min,
                threshold_max,
                concurrency,
                output.as_deref(),
            )
            .await
        }
        Command::Districts | Command::Completions { .. } => Ok(()),
    };
    if let Err(err) = outcome {
        error(&err);
    }
}
