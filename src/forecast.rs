//! Прогноз по сценариям: выбор обучающего среза, обучение аддитивной модели,
//! будущий индекс на горизонт отложенной недели и кэш результатов по сценарию.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use chrono::NaiveDateTime;
use tokio::sync::OnceCell;

use crate::config::DataConfig;
use crate::constants::{AXIS_LABEL_ENERGY, TIMESTAMP_FORMAT};
use crate::error::DashboardError;
use crate::model::{Forecast, ForecastModel, ModelConfig};
use crate::series::{HourlyFrame, load_frame};

/// Внешние регрессоры многомерного сценария.
pub const REGRESSORS: [&str; 2] = ["demand", "temp thresh"];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scenario {
    Univariate,
    Multivariate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScenarioSpec {
    pub title: &'static str,
    pub axis_label: &'static str,
    pub uses_regressors: bool,
}

impl Scenario {
    pub const ALL: [Self; 2] = [Self::Univariate, Self::Multivariate];

    /// Подпись в выпадающем списке.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Univariate => "Univariate Forecast",
            Self::Multivariate => "Multivariate Forecast",
        }
    }

    pub const fn key(self) -> &'static str {
        match self {
            Self::Univariate => "univariate",
            Self::Multivariate => "multivariate",
        }
    }

    pub const fn spec(self) -> ScenarioSpec {
        match self {
            Self::Univariate => ScenarioSpec {
                title: "Univariate Consumption Forecast",
                axis_label: AXIS_LABEL_ENERGY,
                uses_regressors: false,
            },
            Self::Multivariate => ScenarioSpec {
                title: "Multivariate Consumption Forecast including Outside Air Temperature & Demand",
                axis_label: AXIS_LABEL_ENERGY,
                uses_regressors: true,
            },
        }
    }

    const fn slot(self) -> usize {
        match self {
            Self::Univariate => 0,
            Self::Multivariate => 1,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Scenario {
    type Err = DashboardError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        Self::ALL
            .into_iter()
            .find(|scenario| {
                trimmed == scenario.label() || trimmed.eq_ignore_ascii_case(scenario.key())
            })
            .ok_or_else(|| DashboardError::InvalidScenario(raw.to_string()))
    }
}

/// Оба набора данных, разделённые по границе отложенной выборки.
#[derive(Clone, Debug)]
pub struct Datasets {
    pub univariate_train: HourlyFrame,
    pub univariate_test: HourlyFrame,
    pub multivariate: HourlyFrame,
    pub multivariate_train: HourlyFrame,
    pub multivariate_test: HourlyFrame,
    pub split_at: NaiveDateTime,
    pub history_hours: usize,
}

impl Datasets {
    pub fn load(config: &DataConfig) -> Result<Self, DashboardError> {
        let univariate = load_frame(&config.univariate_csv, &[]).map_err(|err| {
            DashboardError::data_load(
                format!("univariate dataset {}", config.univariate_csv.display()),
                err,
            )
        })?;
        let multivariate = load_frame(&config.multivariate_csv, &REGRESSORS).map_err(|err| {
            DashboardError::data_load(
                format!("multivariate dataset {}", config.multivariate_csv.display()),
                err,
            )
        })?;
        let datasets = Self::from_frames(
            univariate,
            multivariate,
            config.split_at,
            config.history_hours,
        );
        tracing::info!(
            split_at = %config.split_at.format(TIMESTAMP_FORMAT),
            univariate_train = datasets.univariate_train.len(),
            univariate_test = datasets.univariate_test.len(),
            multivariate_train = datasets.multivariate_train.len(),
            multivariate_test = datasets.multivariate_test.len(),
            "Datasets loaded"
        );
        Ok(datasets)
    }

    pub fn from_frames(
        univariate: HourlyFrame,
        multivariate: HourlyFrame,
        split_at: NaiveDateTime,
        history_hours: usize,
    ) -> Self {
        let (univariate_train, univariate_test) = univariate.split_at(split_at);
        let (multivariate_train, multivariate_test) = multivariate.split_at(split_at);
        Self {
            univariate_train,
            univariate_test,
            multivariate,
            multivariate_train,
            multivariate_test,
            split_at,
            history_hours,
        }
    }

    /// Горизонт берётся из одномерной отложенной выборки для обоих сценариев.
    pub const fn horizon(&self) -> usize {
        self.univariate_test.len()
    }

    const fn slices(&self, scenario: Scenario) -> (&HourlyFrame, &HourlyFrame) {
        match scenario {
            Scenario::Univariate => (&self.univariate_train, &self.univariate_test),
            Scenario::Multivariate => (&self.multivariate_train, &self.multivariate_test),
        }
    }
}

/// Результат одного сценария: прогноз и фактические значения для графика.
#[derive(Clone, Debug)]
pub struct ScenarioForecast {
    pub scenario: Scenario,
    pub forecast: Forecast,
    /// Хвост обучающей выборки, показываемый перед прогнозом.
    pub history: HourlyFrame,
    /// Отложенные фактические значения.
    pub actual: HourlyFrame,
    pub interval_width: f64,
}

pub fn run_forecast(
    datasets: &Datasets,
    scenario: Scenario,
    config: &ModelConfig,
) -> Result<ScenarioForecast, DashboardError> {
    let spec = scenario.spec();
    let (train, test) = datasets.slices(scenario);

    let mut model = ForecastModel::new(*config);
    if spec.uses_regressors {
        for name in REGRESSORS {
            model = model.with_regressor(name);
        }
    }

    let started = Instant::now();
    let fitted = model.fit(train).map_err(DashboardError::Fit)?;

    let horizon = datasets.horizon();
    if horizon == 0 {
        return Err(DashboardError::fit("held-out horizon is empty"));
    }
    let future = fitted.make_future_index(horizon);

    let mut regressors = BTreeMap::new();
    if spec.uses_regressors {
        for name in REGRESSORS {
            let values = datasets
                .multivariate
                .align(name, &future)
                .map_err(DashboardError::Fit)?;
            regressors.insert(name.to_string(), values);
        }
    }
    let forecast = fitted
        .predict(&future, &regressors)
        .map_err(DashboardError::Fit)?;

    tracing::info!(
        scenario = scenario.key(),
        train_rows = train.len(),
        horizon,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Forecast fitted"
    );

    Ok(ScenarioForecast {
        scenario,
        forecast,
        history: train.tail(datasets.history_hours),
        actual: test.clone(),
        interval_width: config.interval_width,
    })
}

/// Кэш прогнозов по сценарию: одно обучение на ключ, конкурентные запросы
/// ждут уже идущее. Неудачное обучение не кэшируется.
#[derive(Debug)]
pub struct ForecastService {
    datasets: Arc<Datasets>,
    config: ModelConfig,
    cells: [OnceCell<Arc<ScenarioForecast>>; 2],
    fits: AtomicUsize,
}

impl ForecastService {
    pub fn new(datasets: Datasets, config: ModelConfig) -> Self {
        Self {
            datasets: Arc::new(datasets),
            config,
            cells: [OnceCell::new(), OnceCell::new()],
            fits: AtomicUsize::new(0),
        }
    }

    /// Сколько раз запускалось обучение (включая неудачные попытки).
    pub fn fit_count(&self) -> usize {
        self.fits.load(Ordering::SeqCst)
    }

    pub async fn get(&self, scenario: Scenario) -> Result<Arc<ScenarioForecast>, DashboardError> {
        let cell = &self.cells[scenario.slot()];
        if let Some(cached) = cell.get() {
            tracing::debug!(scenario = scenario.key(), "Forecast cache hit");
            return Ok(Arc::clone(cached));
        }
        cell.get_or_try_init(|| async {
            self.fits.fetch_add(1, Ordering::SeqCst);
            let datasets = Arc::clone(&self.datasets);
            let config = self.config;
            tokio::task::spawn_blocking(move || run_forecast(&datasets, scenario, &config))
                .await
                .map_err(DashboardError::fit)?
                .map(Arc::new)
        })
        .await
        .cloned()
    }
}
