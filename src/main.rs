mod config;
mod constants;
mod error;
mod forecast;
mod model;
mod predict;
mod regressor;
mod report;
mod series;
mod server;

use clap::{ArgAction, Args as ClapArgs, CommandFactory, Parser, Subcommand};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use crate::config::{DEFAULT_CONFIG_PATH, DashboardConfig, load_config};
use crate::forecast::{Datasets, ForecastService, Scenario, run_forecast};
use crate::predict::{FanState, FeatureVector, PredictionServer};
use crate::regressor::GbdtModel;
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

const APP_ABOUT: &str = "BEM - Building energy consumption forecasting and prediction dashboard";
const DEFAULT_FORECAST_CSV: &str = "dist/forecast.csv";
const CSV_ARCHIVE_EXTENSION: &str = "gz";

#[derive(Parser, Debug)]
#[command(name = "bem", about = APP_ABOUT)]
struct Args {
    /// TOML-файл конфигурации.
    #[arg(
        long = "config",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        global = true
    )]
    config: PathBuf,
    /// Архивировать CSV с прогнозом в .csv.gz (исходный CSV удаляется).
    #[arg(long = "archive-csv", global = true)]
    archive_csv: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Запустить интерактивный дашборд.
    Serve {
        /// Адрес для прослушивания (перекрывает server.bind).
        #[arg(long = "bind", value_name = "ADDR")]
        bind: Option<SocketAddr>,
        /// JSON-дамп модели точечного прогноза (перекрывает model.path).
        #[arg(long = "model", value_name = "PATH")]
        model: Option<PathBuf>,
        /// Не обучать оба сценария заранее при старте.
        #[arg(long = "no-warmup", default_value_t = true, action = ArgAction::SetFalse)]
        warmup: bool,
    },
    /// Обучить модель для сценария и сохранить прогноз в CSV.
    Forecast {
        /// Сценарий: "Univariate Forecast", "Multivariate Forecast" или короткий ключ.
        #[arg(
            short = 's',
            long = "scenario",
            value_name = "NAME",
            default_value = "univariate"
        )]
        scenario: String,
        /// Куда сохранить CSV с прогнозом.
        #[arg(
            long = "output-csv",
            value_name = "PATH",
            default_value = DEFAULT_FORECAST_CSV
        )]
        output_csv: PathBuf,
        /// Куда сохранить статический HTML с графиками (если не указано, HTML не пишется).
        #[arg(short = 'o', long = "output-html", value_name = "PATH")]
        output_html: Option<PathBuf>,
        /// Не минифицировать HTML (по умолчанию минифицируется).
        #[arg(
            long = "no-minify-html",
            default_value_t = true,
            action = ArgAction::SetFalse
        )]
        minify_html: bool,
    },
    /// Посчитать почасовое потребление по значениям признаков.
    Predict {
        /// JSON-дамп модели точечного прогноза (перекрывает model.path).
        #[arg(long = "model", value_name = "PATH")]
        model: Option<PathBuf>,
        #[command(flatten)]
        features: FeatureArgs,
    },
    /// Сгенерировать файлы автодополнения для shell.
    Completions {
        /// Целевой shell.
        #[arg(value_enum)]
        shell: Shell,
        /// Куда сохранить файл (если не указано — stdout).
        #[arg(short = 'o', long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

/// Значения признаков; пропущенные берутся из значений ползунков по умолчанию.
#[derive(ClapArgs, Debug)]
struct FeatureArgs {
    /// Set Point.
    #[arg(long = "point-34", allow_negative_numbers = true)]
    point_34: Option<f64>,
    /// Total Flow.
    #[arg(long = "point-17", allow_negative_numbers = true)]
    point_17: Option<f64>,
    /// Supply Air Temp.
    #[arg(long = "point-37", allow_negative_numbers = true)]
    point_37: Option<f64>,
    /// Mixed Air Temp.
    #[arg(long = "point-21", allow_negative_numbers = true)]
    point_21: Option<f64>,
    /// Make Up Air Unit 1 Supply Temp.
    #[arg(long = "point-194", allow_negative_numbers = true)]
    point_194: Option<f64>,
    /// Max Room Temp.
    #[arg(long = "point-26", allow_negative_numbers = true)]
    point_26: Option<f64>,
    /// Min Room Error.
    #[arg(long = "point-22", allow_negative_numbers = true)]
    point_22: Option<f64>,
    /// Return Carbon Dioxide.
    #[arg(long = "point-9", allow_negative_numbers = true)]
    point_9: Option<f64>,
    /// Duct Pressure Point.
    #[arg(long = "point-13", allow_negative_numbers = true)]
    point_13: Option<f64>,
    /// Min Room Temp.
    #[arg(long = "point-23", allow_negative_numbers = true)]
    point_23: Option<f64>,
    /// Average Outside Air Temp.
    #[arg(long = "point-90", allow_negative_numbers = true)]
    point_90: Option<f64>,
    /// Make Up Air Unit 2 Supply Temp.
    #[arg(long = "point-198", allow_negative_numbers = true)]
    point_198: Option<f64>,
    /// Air Handling Unit Supply Fan (ON/OFF).
    #[arg(long = "point-10", value_name = "STATE")]
    point_10: Option<FanState>,
}

impl FeatureArgs {
    fn into_features(self) -> FeatureVector {
        let defaults = FeatureVector::defaults();
        FeatureVector {
            point_34: self.point_34.unwrap_or(defaults.point_34),
            point_17: self.point_17.unwrap_or(defaults.point_17),
            point_37: self.point_37.unwrap_or(defaults.point_37),
            point_21: self.point_21.unwrap_or(defaults.point_21),
            point_194: self.point_194.unwrap_or(defaults.point_194),
            point_26: self.point_26.unwrap_or(defaults.point_26),
            point_22: self.point_22.unwrap_or(defaults.point_22),
            point_9: self.point_9.unwrap_or(defaults.point_9),
            point_13: self.point_13.unwrap_or(defaults.point_13),
            point_23: self.point_23.unwrap_or(defaults.point_23),
            point_90: self.point_90.unwrap_or(defaults.point_90),
            point_198: self.point_198.unwrap_or(defaults.point_198),
            point_10: self.point_10.unwrap_or(defaults.point_10),
        }
    }
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
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("bem=info,tower_http=info"));
    let ansi = std::io::stdout().is_terminal();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(ansi)
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

fn archive_path_for(csv_path: &Path) -> Result<PathBuf, String> {
    let file_name = csv_path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| format!("Path {} has no file name", csv_path.display()))?;
    let mut archive_path = csv_path.to_path_buf();
    archive_path.set_file_name(format!("{file_name}.{CSV_ARCHIVE_EXTENSION}"));
    Ok(archive_path)
}

/// Сжимает CSV в gzip рядом с исходным файлом и удаляет исходник.
fn archive_csv_file(csv_path: &Path) -> Result<PathBuf, String> {
    let archive_path = archive_path_for(csv_path)?;
    let mut input = File::open(csv_path)
        .map_err(|err| format!("Failed to open CSV {}: {err}", csv_path.display()))?;
    let output = File::create(&archive_path)
        .map_err(|err| format!("Failed to create archive {}: {err}", archive_path.display()))?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    std::io::copy(&mut input, &mut encoder)
        .map_err(|err| format!("Failed to write archive {}: {err}", archive_path.display()))?;
    encoder.finish().map_err(|err| {
        format!(
            "Failed to finalize archive {}: {err}",
            archive_path.display()
        )
    })?;
    fs::remove_file(csv_path)
        .map_err(|err| format!("Failed to remove CSV {}: {err}", csv_path.display()))?;
    Ok(archive_path)
}

fn load_prediction_server(
    config: &DashboardConfig,
    model: Option<PathBuf>,
) -> Result<PredictionServer, String> {
    let path = model.unwrap_or_else(|| config.model_path.clone());
    let model = GbdtModel::load(&path).map_err(|err| err.to_string())?;
    Ok(PredictionServer::new(Arc::new(model)))
}

async fn run_serve(
    config: DashboardConfig,
    bind: Option<SocketAddr>,
    model: Option<PathBuf>,
    warmup: bool,
) -> Result<(), String> {
    let bind = bind.unwrap_or(config.bind);
    let predictor = load_prediction_server(&config, model)?;
    let datasets = Datasets::load(&config.data).map_err(|err| err.to_string())?;
    let forecasts = Arc::new(ForecastService::new(datasets, config.forecast));

    if warmup {
        let forecasts = Arc::clone(&forecasts);
        tokio::spawn(async move {
            for scenario in Scenario::ALL {
                if let Err(err) = forecasts.get(scenario).await {
                    error(&format!("Warm-up of {scenario} failed: {err}"));
                }
            }
        });
    }

    let state = server::AppState {
        forecasts,
        predictor: Arc::new(predictor),
    };
    info(&format!("Serving dashboard on http://{bind}"));
    server::serve(state, bind)
        .await
        .map_err(|err| format!("Server failed: {err}"))
}

fn run_forecast_command(
    config: &DashboardConfig,
    scenario: &str,
    output_csv: &Path,
    output_html: Option<&Path>,
    minify_html: bool,
    archive_csv: bool,
) -> Result<(), String> {
    let scenario = scenario
        .parse::<Scenario>()
        .map_err(|err| err.to_string())?;
    let datasets = Datasets::load(&config.data).map_err(|err| err.to_string())?;
    let result =
        run_forecast(&datasets, scenario, &config.forecast).map_err(|err| err.to_string())?;

    model::write_forecast_csv(&result.forecast, output_csv)
        .map_err(|err| format!("Failed to write forecast CSV: {err}"))?;
    if archive_csv {
        let path = archive_csv_file(output_csv)?;
        success(&format!("Saved archive to {}", path.display()));
    } else {
        success(&format!("Saved forecast to {}", output_csv.display()));
    }

    if let Some(output_html) = output_html {
        report::write_static_report(&result, output_html, minify_html)
            .map_err(|err| format!("Failed to render forecast report: {err}"))?;
        success(&format!("Saved HTML to {}", output_html.display()));
    }
    Ok(())
}

fn run_predict(
    config: &DashboardConfig,
    model: Option<PathBuf>,
    features: FeatureVector,
) -> Result<(), String> {
    let server = load_prediction_server(config, model)?;
    let consumption = server
        .predict(&features)
        .map_err(|err| format!("{err} (stage: {})", err.stage()))?;
    println!("{consumption}");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let archive_csv = args.archive_csv;

    if let Command::Completions { shell, output } = &args.command {
        if let Err(err) = generate_completions(*shell, output.clone()) {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
        return ExitCode::SUCCESS;
    }

    init_logging();
    headline(APP_ABOUT);
    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error(&err);
            return ExitCode::FAILURE;
        }
    };

    let outcome = match args.command {
        Command::Serve {
            bind,
            model,
            warmup,
        } => {
            tracing::info!(
                mode = "serve",
                config = %args.config.display(),
                warmup,
                "Starting dashboard"
            );
            run_serve(config, bind, model, warmup).await
        }
        Command::Forecast {
            scenario,
            output_csv,
            output_html,
            minify_html,
        } => {
            tracing::info!(
                mode = "forecast",
                scenario = %scenario,
                archive_csv,
                output_csv = %output_csv.display(),
                minify_html,
                "Training forecast model"
            );
            run_forecast_command(
                &config,
                &scenario,
                &output_csv,
                output_html.as_deref(),
                minify_html,
                archive_csv,
            )
        }
        Command::Predict { model, features } => {
            tracing::info!(mode = "predict", "Running point prediction");
            run_predict(&config, model, features.into_features())
        }
        Command::Completions { .. } => Ok(()),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error(&err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::GzDecoder;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn predict_flags_fall_back_to_slider_defaults() {
        let args =
            Args::try_parse_from(["bem", "predict", "--point-90", "-1.5", "--point-10", "OFF"])
                .expect("args");
        let Command::Predict { features, .. } = args.command else {
            panic!("expected predict");
        };
        let features = features.into_features();
        assert_eq!(features.point_90, -1.5);
        assert_eq!(features.point_10, FanState::Off);
        assert_eq!(features.point_17, FeatureVector::defaults().point_17);
    }

    #[test]
    fn archive_replaces_csv_with_gzip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let csv_path = dir.path().join("forecast.csv");
        fs::write(&csv_path, "ds,yhat\n2021-05-25 00:00:00,1.0\n").expect("write");
        let archive = archive_csv_file(&csv_path).expect("archive");
        assert_eq!(archive, dir.path().join("forecast.csv.gz"));
        assert!(!csv_path.exists());

        let mut decoded = String::new();
        GzDecoder::new(File::open(&archive).expect("open"))
            .read_to_string(&mut decoded)
            .expect("decode");
        assert!(decoded.starts_with("ds,yhat"));
    }
}
