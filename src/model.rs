//! Почасовая модель потребления на Prophet из `augurs`: настройка, регистрация
//! внешних регрессоров, обучение, будущий индекс и прогноз с разложением.

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::fs;
use std::num::NonZeroU32;
use std::path::Path;
use std::time::Instant;

use augurs::prophet::optimizer::OptimizeOpts;
use augurs::prophet::wasmstan::WasmstanOptimizer;
use augurs::prophet::{
    FeatureMode, GrowthType, IntervalWidth, PositiveFloat, PredictionData, Prophet, ProphetOptions,
    Regressor, SeasonalityOption, TrainingData,
};
use chrono::NaiveDateTime;

use crate::constants::TIMESTAMP_FORMAT;
use crate::series::{HourlyFrame, future_index};

pub type FitResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

const DEFAULT_INTERVAL_WIDTH: f64 = 0.9;
const DEFAULT_N_CHANGEPOINTS: u32 = 25;
const DEFAULT_CHANGEPOINT_RANGE: f64 = 0.8;
const DEFAULT_CHANGEPOINT_PRIOR_SCALE: f64 = 0.05;
const DEFAULT_SEASONALITY_PRIOR_SCALE: f64 = 10.0;
const DEFAULT_REGRESSOR_PRIOR_SCALE: f64 = 10.0;
const DEFAULT_WEEKLY_ORDER: u32 = 3;
const DEFAULT_DAILY_ORDER: u32 = 4;
const DEFAULT_MAX_ITERS: u32 = 10_000;
const DEFAULT_UNCERTAINTY_SAMPLES: u32 = 1000;
const FIT_SEED: u32 = 42;
const MIN_OBSERVATIONS: usize = 3;
const SEASONALITY_WEEKLY: &str = "weekly";
const SEASONALITY_DAILY: &str = "daily";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ModelConfig {
    pub interval_width: f64,
    pub n_changepoints: u32,
    pub changepoint_range: f64,
    pub changepoint_prior_scale: f64,
    pub seasonality_prior_scale: f64,
    pub regressor_prior_scale: f64,
    pub weekly_order: u32,
    pub daily_order: u32,
    pub max_iters: u32,
    pub uncertainty_samples: u32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            interval_width: DEFAULT_INTERVAL_WIDTH,
            n_changepoints: DEFAULT_N_CHANGEPOINTS,
            changepoint_range: DEFAULT_CHANGEPOINT_RANGE,
            changepoint_prior_scale: DEFAULT_CHANGEPOINT_PRIOR_SCALE,
            seasonality_prior_scale: DEFAULT_SEASONALITY_PRIOR_SCALE,
            regressor_prior_scale: DEFAULT_REGRESSOR_PRIOR_SCALE,
            weekly_order: DEFAULT_WEEKLY_ORDER,
            daily_order: DEFAULT_DAILY_ORDER,
            max_iters: DEFAULT_MAX_ITERS,
            uncertainty_samples: DEFAULT_UNCERTAINTY_SAMPLES,
        }
    }
}

fn positive(key: &str, value: f64) -> FitResult<PositiveFloat> {
    PositiveFloat::try_from(value).map_err(|_| format!("{key} must be > 0, got {value}").into())
}

fn fourier_order(key: &str, order: u32) -> FitResult<NonZeroU32> {
    NonZeroU32::new(order).ok_or_else(|| format!("{key} must be >= 1, got {order}").into())
}

impl ModelConfig {
    /// Настройки Prophet: линейный тренд, аддитивная недельная и суточная
    /// сезонность рядами Фурье заданного порядка, без годовой.
    fn prophet_options(&self) -> FitResult<ProphetOptions> {
        let interval_width = IntervalWidth::try_from(self.interval_width).map_err(|_| {
            format!(
                "interval_width must be within (0, 1), got {}",
                self.interval_width
            )
        })?;
        Ok(ProphetOptions {
            growth: GrowthType::Linear,
            n_changepoints: self.n_changepoints,
            changepoint_range: positive("changepoint_range", self.changepoint_range)?,
            changepoint_prior_scale: positive(
                "changepoint_prior_scale",
                self.changepoint_prior_scale,
            )?,
            seasonality_prior_scale: positive(
                "seasonality_prior_scale",
                self.seasonality_prior_scale,
            )?,
            seasonality_mode: FeatureMode::Additive,
            yearly_seasonality: SeasonalityOption::Manual(false),
            weekly_seasonality: SeasonalityOption::Fourier(fourier_order(
                "weekly_order",
                self.weekly_order,
            )?),
            daily_seasonality: SeasonalityOption::Fourier(fourier_order(
                "daily_order",
                self.daily_order,
            )?),
            interval_width,
            uncertainty_samples: self.uncertainty_samples,
            ..ProphetOptions::default()
        })
    }
}

/// Прогноз на будущих метках и его разложение на компоненты.
#[derive(Clone, Debug, PartialEq)]
pub struct Forecast {
    pub ds: Vec<NaiveDateTime>,
    pub mean: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub trend: Vec<f64>,
    pub weekly: Vec<f64>,
    pub daily: Vec<f64>,
    pub extra_regressors: Option<Vec<f64>>,
}

impl Forecast {
    pub const fn len(&self) -> usize {
        self.ds.len()
    }

    pub const fn is_empty(&self) -> bool {
        self.ds.is_empty()
    }
}

/// Ненастроенная модель: конфигурация и зарегистрированные регрессоры.
#[derive(Clone, Debug)]
pub struct ForecastModel {
    config: ModelConfig,
    regressors: Vec<String>,
}

/// Обученная модель. Регрессоры после обучения добавить нельзя.
pub struct FittedModel {
    prophet: Prophet<WasmstanOptimizer>,
    regressors: Vec<String>,
    last_ds: NaiveDateTime,
}

impl ForecastModel {
    pub const fn new(config: ModelConfig) -> Self {
        Self {
            config,
            regressors: Vec::new(),
        }
    }

    /// Регистрирует внешний регрессор: колонка с этим именем обязательна при обучении и прогнозе.
    #[must_use]
    pub fn with_regressor(mut self, name: &str) -> Self {
        if !self.regressors.iter().any(|known| known == name) {
            self.regressors.push(name.to_string());
        }
        self
    }

    pub fn fit(&self, frame: &HourlyFrame) -> FitResult<FittedModel> {
        if frame.len() < MIN_OBSERVATIONS {
            return Err(format!("need at least {MIN_OBSERVATIONS} observations").into());
        }
        let last_ds = frame.ds[frame.len() - 1];

        let mut columns = HashMap::with_capacity(self.regressors.len());
        for name in &self.regressors {
            let values = frame
                .regressor(name)
                .ok_or_else(|| format!("training data lacks registered regressor '{name}'"))?;
            columns.insert(name.clone(), values.to_vec());
        }
        let mut data = TrainingData::new(timestamps(&frame.ds), frame.y.clone())?;
        if !columns.is_empty() {
            data = data.with_regressors(columns)?;
        }

        let mut prophet = Prophet::new(self.config.prophet_options()?, WasmstanOptimizer::new());
        for name in &self.regressors {
            let prior_scale = positive("regressor_prior_scale", self.config.regressor_prior_scale)?;
            prophet.add_regressor(
                name.clone(),
                Regressor::additive().with_prior_scale(prior_scale),
            );
        }

        let started = Instant::now();
        let opts = OptimizeOpts {
            iter: Some(self.config.max_iters),
            seed: Some(FIT_SEED),
            ..OptimizeOpts::default()
        };
        prophet.fit(data, opts)?;
        tracing::debug!(
            rows = frame.len(),
            regressors = self.regressors.len(),
            elapsed_ms = started.elapsed().as_millis(),
            "Prophet fitted"
        );

        Ok(FittedModel {
            prophet,
            regressors: self.regressors.clone(),
            last_ds,
        })
    }
}

impl FittedModel {
    /// Будущие почасовые метки сразу после окна обучения.
    pub fn make_future_index(&self, periods: usize) -> Vec<NaiveDateTime> {
        future_index(self.last_ds, periods)
    }

    pub fn predict(
        &self,
        ds: &[NaiveDateTime],
        regressors: &BTreeMap<String, Vec<f64>>,
    ) -> FitResult<Forecast> {
        let mut columns = HashMap::with_capacity(self.regressors.len());
        for name in &self.regressors {
            let values = regressors
                .get(name)
                .ok_or_else(|| format!("future frame lacks regressor '{name}'"))?;
            if values.len() != ds.len() {
                return Err(format!(
                    "regressor '{name}' has {} values for {} timestamps",
                    values.len(),
                    ds.len()
                )
                .into());
            }
            if let Some(pos) = values.iter().position(|v| !v.is_finite()) {
                return Err(format!(
                    "regressor '{name}' is undefined at {}",
                    ds[pos].format(TIMESTAMP_FORMAT)
                )
                .into());
            }
            columns.insert(name.clone(), values.clone());
        }

        let mut data = PredictionData::new(timestamps(ds));
        if !columns.is_empty() {
            data = data.with_regressors(columns)?;
        }
        let predictions = self.prophet.predict(Some(data))?;

        let lower = predictions
            .yhat
            .lower
            .ok_or("prediction has no lower interval bound")?;
        let upper = predictions
            .yhat
            .upper
            .ok_or("prediction has no upper interval bound")?;
        let mean = predictions.yhat.point;
        let trend = predictions.trend.point;
        let component = |name: &str| {
            predictions
                .seasonalities
                .get(name)
                .map_or_else(|| vec![0.0; ds.len()], |feature| feature.point.clone())
        };
        let weekly = component(SEASONALITY_WEEKLY);
        let daily = component(SEASONALITY_DAILY);

        // Аддитивный режим без праздников: остаток после тренда и сезонностей дают регрессоры.
        let extra_regressors = (!self.regressors.is_empty()).then(|| {
            (0..ds.len())
                .map(|idx| mean[idx] - trend[idx] - weekly[idx] - daily[idx])
                .collect()
        });

        Ok(Forecast {
            ds: ds.to_vec(),
            mean,
            lower,
            upper,
            trend,
            weekly,
            daily,
            extra_regressors,
        })
    }
}

fn timestamps(ds: &[NaiveDateTime]) -> Vec<i64> {
    ds.iter().map(|ts| ts.and_utc().timestamp()).collect()
}

pub fn write_forecast_csv(
    forecast: &Forecast,
    output_path: &Path,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    if forecast.is_empty() {
        return Err("forecast has no rows".into());
    }

    let mut writer = csv::Writer::from_path(output_path)?;
    let mut header = vec![
        "ds",
        "yhat",
        "yhat_lower",
        "yhat_upper",
        "trend",
        "weekly",
        "daily",
    ];
    if forecast.extra_regressors.is_some() {
        header.push("extra_regressors");
    }
    writer.write_record(&header)?;

    for idx in 0..forecast.len() {
        let mut record = vec![
            forecast.ds[idx].format(TIMESTAMP_FORMAT).to_string(),
            format!("{:.6}", forecast.mean[idx]),
            format!("{:.6}", forecast.lower[idx]),
            format!("{:.6}", forecast.upper[idx]),
            format!("{:.6}", forecast.trend[idx]),
            format!("{:.6}", forecast.weekly[idx]),
            format!("{:.6}", forecast.daily[idx]),
        ];
        if let Some(extra) = &forecast.extra_regressors {
            record.push(format!("{:.6}", extra[idx]));
        }
        writer.write_record(&record)?;
    }

    writer.flush()?;
    Ok(())
}
