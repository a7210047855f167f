//! TOML-конфигурация дашборда. Все ключи необязательны: отсутствующие
//! берутся из встроенных значений по умолчанию.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Deserialize;

use crate::model::ModelConfig;
use crate::series::parse_timestamp;

pub const DEFAULT_CONFIG_PATH: &str = "config/dashboard.toml";
const DEFAULT_UNIVARIATE_CSV: &str = "raw_data/univariate_forecast.csv";
const DEFAULT_MULTIVARIATE_CSV: &str = "raw_data/multivariate_forecast.csv";
const DEFAULT_SPLIT_AT: &str = "2021-05-25 00:00:00";
const DEFAULT_HISTORY_HOURS: usize = 336;
const DEFAULT_MODEL_PATH: &str = "models/lgb_model_v2.json";
const DEFAULT_BIND: &str = "127.0.0.1:8501";

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    data: Option<DataFile>,
    forecast: Option<ForecastFile>,
    model: Option<ModelFile>,
    server: Option<ServerFile>,
}

#[derive(Debug, Deserialize)]
struct DataFile {
    univariate_csv: Option<PathBuf>,
    multivariate_csv: Option<PathBuf>,
    split_at: Option<String>,
    history_hours: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct ForecastFile {
    interval_width: Option<f64>,
    n_changepoints: Option<u32>,
    changepoint_range: Option<f64>,
    changepoint_prior_scale: Option<f64>,
    seasonality_prior_scale: Option<f64>,
    regressor_prior_scale: Option<f64>,
    weekly_order: Option<u32>,
    daily_order: Option<u32>,
    max_iters: Option<u32>,
    uncertainty_samples: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ModelFile {
    path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct ServerFile {
    bind: Option<String>,
}

/// Откуда читать наборы данных и где проходит граница отложенной недели.
#[derive(Clone, Debug, PartialEq)]
pub struct DataConfig {
    pub univariate_csv: PathBuf,
    pub multivariate_csv: PathBuf,
    pub split_at: NaiveDateTime,
    pub history_hours: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DashboardConfig {
    pub data: DataConfig,
    pub forecast: ModelConfig,
    pub model_path: PathBuf,
    pub bind: SocketAddr,
}

fn resolve_data_config(overrides: Option<DataFile>) -> Result<DataConfig, String> {
    let mut univariate_csv = PathBuf::from(DEFAULT_UNIVARIATE_CSV);
    let mut multivariate_csv = PathBuf::from(DEFAULT_MULTIVARIATE_CSV);
    let mut split_at = DEFAULT_SPLIT_AT.to_string();
    let mut history_hours = DEFAULT_HISTORY_HOURS;
    if let Some(overrides) = overrides {
        if let Some(path) = overrides.univariate_csv {
            univariate_csv = path;
        }
        if let Some(path) = overrides.multivariate_csv {
            multivariate_csv = path;
        }
        if let Some(raw) = overrides.split_at {
            split_at = raw;
        }
        if let Some(hours) = overrides.history_hours {
            history_hours = hours;
        }
    }
    let split_at = parse_timestamp(&split_at)
        .map_err(|err| format!("data.split_at '{split_at}' is not a timestamp: {err}"))?;
    Ok(DataConfig {
        univariate_csv,
        multivariate_csv,
        split_at,
        history_hours,
    })
}

fn resolve_forecast_config(overrides: Option<ForecastFile>) -> ModelConfig {
    let mut cfg = ModelConfig::default();
    if let Some(overrides) = overrides {
        if let Some(width) = overrides.interval_width {
            cfg.interval_width = width;
        }
        if let Some(n) = overrides.n_changepoints {
            cfg.n_changepoints = n;
        }
        if let Some(range) = overrides.changepoint_range {
            cfg.changepoint_range = range;
        }
        if let Some(scale) = overrides.changepoint_prior_scale {
            cfg.changepoint_prior_scale = scale;
        }
        if let Some(scale) = overrides.seasonality_prior_scale {
            cfg.seasonality_prior_scale = scale;
        }
        if let Some(scale) = overrides.regressor_prior_scale {
            cfg.regressor_prior_scale = scale;
        }
        if let Some(order) = overrides.weekly_order {
            cfg.weekly_order = order;
        }
        if let Some(order) = overrides.daily_order {
            cfg.daily_order = order;
        }
        if let Some(iters) = overrides.max_iters {
            cfg.max_iters = iters;
        }
        if let Some(samples) = overrides.uncertainty_samples {
            cfg.uncertainty_samples = samples;
        }
    }
    cfg
}

fn validate_forecast_config(cfg: &ModelConfig) -> Result<(), String> {
    if !cfg.interval_width.is_finite() || cfg.interval_width <= 0.0 || cfg.interval_width >= 1.0 {
        return Err("forecast.interval_width must be within (0, 1)".to_string());
    }
    if !cfg.changepoint_range.is_finite()
        || cfg.changepoint_range <= 0.0
        || cfg.changepoint_range > 1.0
    {
        return Err("forecast.changepoint_range must be within (0, 1]".to_string());
    }
    for (key, scale) in [
        ("changepoint_prior_scale", cfg.changepoint_prior_scale),
        ("seasonality_prior_scale", cfg.seasonality_prior_scale),
        ("regressor_prior_scale", cfg.regressor_prior_scale),
    ] {
        if !scale.is_finite() || scale <= 0.0 {
            return Err(format!("forecast.{key} must be > 0"));
        }
    }
    if cfg.weekly_order == 0 {
        return Err("forecast.weekly_order must be >= 1".to_string());
    }
    if cfg.daily_order == 0 {
        return Err("forecast.daily_order must be >= 1".to_string());
    }
    if cfg.max_iters == 0 {
        return Err("forecast.max_iters must be >= 1".to_string());
    }
    if cfg.uncertainty_samples == 0 {
        return Err("forecast.uncertainty_samples must be >= 1".to_string());
    }
    Ok(())
}

fn resolve_config(config: ConfigFile) -> Result<DashboardConfig, String> {
    let data = resolve_data_config(config.data)?;
    let forecast = resolve_forecast_config(config.forecast);
    validate_forecast_config(&forecast)?;
    let model_path = config
        .model
        .and_then(|model| model.path)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH));
    let bind_raw = config
        .server
        .and_then(|server| server.bind)
        .unwrap_or_else(|| DEFAULT_BIND.to_string());
    let bind = bind_raw
        .parse::<SocketAddr>()
        .map_err(|err| format!("server.bind '{bind_raw}' is not a socket address: {err}"))?;
    Ok(DashboardConfig {
        data,
        forecast,
        model_path,
        bind,
    })
}

pub fn default_config() -> Result<DashboardConfig, String> {
    resolve_config(ConfigFile::default())
}

pub fn parse_config(raw: &str) -> Result<DashboardConfig, String> {
    let config: ConfigFile = toml::from_str(raw).map_err(|err| err.to_string())?;
    resolve_config(config)
}

pub fn load_config(path: &Path) -> Result<DashboardConfig, String> {
    if !path.exists() {
        if path == Path::new(DEFAULT_CONFIG_PATH) {
            tracing::info!(
                "Config {} not found, using built-in defaults",
                path.display()
            );
            return default_config();
        }
        return Err(format!("Config {} does not exist", path.display()));
    }

    let raw = fs::read_to_string(path)
        .map_err(|err| format!("Failed to read config {}: {err}", path.display()))?;
    parse_config(&raw).map_err(|err| format!("Invalid config {}: {err}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_reproduce_dashboard_constants() {
        let cfg = default_config().expect("defaults");
        assert_eq!(
            cfg.data.univariate_csv,
            PathBuf::from(DEFAULT_UNIVARIATE_CSV)
        );
        assert_eq!(
            cfg.data.split_at,
            parse_timestamp("2021-05-25 00:00:00").expect("ts")
        );
        assert_eq!(cfg.forecast.interval_width, 0.9);
        assert_eq!(cfg.bind.port(), 8501);
        assert_eq!(cfg.model_path, PathBuf::from(DEFAULT_MODEL_PATH));
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let shipped = parse_config(include_str!("../config/dashboard.toml")).expect("shipped");
        assert_eq!(shipped, default_config().expect("defaults"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = parse_config(
            r#"
            [forecast]
            interval_width = 0.8
            max_iters = 50

            [server]
            bind = "0.0.0.0:9000"
            "#,
        )
        .expect("config");
        assert_eq!(cfg.forecast.interval_width, 0.8);
        assert_eq!(cfg.forecast.max_iters, 50);
        assert_eq!(cfg.forecast.weekly_order, 3);
        assert_eq!(cfg.bind.port(), 9000);
        assert_eq!(cfg.data.history_hours, DEFAULT_HISTORY_HOURS);
    }

    #[test]
    fn invalid_values_name_the_key() {
        let cases = [
            ("[forecast]\ninterval_width = 1.0", "interval_width"),
            (
                "[forecast]\nchangepoint_prior_scale = 0.0",
                "changepoint_prior_scale",
            ),
            ("[forecast]\ndaily_order = 0", "daily_order"),
            ("[forecast]\nuncertainty_samples = 0", "uncertainty_samples"),
            ("[data]\nsplit_at = \"tomorrow\"", "split_at"),
            ("[server]\nbind = \"localhost\"", "server.bind"),
        ];
        for (raw, key) in cases {
            let err = parse_config(raw).expect_err(raw);
            assert!(err.contains(key), "{err} should mention {key}");
        }
    }

    #[test]
    fn loads_file_and_rejects_missing_explicit_path() {
        let mut file = tempfile::NamedTempFile::new().expect("temp");
        writeln!(file, "[model]\npath = \"models/other.json\"").expect("write");
        let cfg = load_config(file.path()).expect("load");
        assert_eq!(cfg.model_path, PathBuf::from("models/other.json"));

        let err = load_config(Path::new("/nonexistent/dashboard.toml")).expect_err("missing");
        assert!(err.contains("does not exist"));
    }
}
