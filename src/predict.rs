//! Сервер точечного прогноза: тринадцать именованных признаков → одно значение в кВт·ч.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use polars::df;
use polars::prelude::DataFrame;

use crate::constants::UNIT_KWH;
use crate::error::{DashboardError, FeatureError};
use crate::regressor::Regressor;

/// Состояние приточного вентилятора (`Point_10`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FanState {
    #[default]
    On,
    Off,
}

impl FanState {
    pub const ALL: [Self; 2] = [Self::On, Self::Off];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }
}

impl FromStr for FanState {
    type Err = FeatureError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "ON" | "on" | "On" => Ok(Self::On),
            "OFF" | "off" | "Off" => Ok(Self::Off),
            other => Err(FeatureError::Invalid {
                name: FAN_FEATURE,
                value: other.to_string(),
            }),
        }
    }
}

/// Описание числового ползунка: имя колонки, подпись и допустимый диапазон.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureSpec {
    pub name: &'static str,
    pub label: &'static str,
    pub min: f64,
    pub max: f64,
    pub default: f64,
    pub step: f64,
}

const fn spec(
    name: &'static str,
    label: &'static str,
    min: f64,
    max: f64,
    default: f64,
    step: f64,
) -> FeatureSpec {
    FeatureSpec {
        name,
        label,
        min,
        max,
        default,
        step,
    }
}

/// Числовые признаки в порядке отображения на странице.
pub const FEATURES: [FeatureSpec; 12] = [
    spec(
        "Point_90",
        "Average Outside Air Temp",
        -2.0,
        33.0,
        10.0,
        0.5,
    ),
    spec("Point_21", "Mixed Air Temp", 10.0, 40.0, 20.0, 0.5),
    spec("Point_22", "Min Room Error", -10.0, 10.0, 0.0, 0.5),
    spec("Point_37", "Supply Air Temp", 9.0, 33.0, 18.0, 0.5),
    spec("Point_26", "Max Room Temp", 19.0, 35.0, 25.0, 0.5),
    spec("Point_17", "Total Flow", 0.0, 7475.0, 3000.0, 25.0),
    spec(
        "Point_194",
        "Make Up Air Unit 1 Supply Temp",
        12.0,
        34.0,
        22.0,
        0.5,
    ),
    spec(
        "Point_198",
        "Make Up Air Unit 2 Supply Temp",
        12.0,
        34.0,
        22.0,
        0.5,
    ),
    spec("Point_13", "Duct Pressure Point", 0.0, 480.0, 200.0, 10.0),
    spec("Point_23", "Min Room Temp", 14.0, 27.0, 21.0, 0.5),
    spec("Point_34", "Set Point", 10.0, 33.0, 20.0, 0.5),
    spec(
        "Point_9",
        "Return Carbon Dioxide",
        390.0,
        730.0,
        450.0,
        10.0,
    ),
];

pub const FAN_FEATURE: &str = "Point_10";
pub const FAN_LABEL: &str = "Air Handling Unit Supply Fan";

/// Порядок колонок, с которым обучалась модель.
pub const MODEL_COLUMNS: [&str; 13] = [
    "Point_34",
    "Point_17",
    "Point_37",
    "Point_21",
    "Point_194",
    "Point_26",
    "Point_22",
    "Point_9",
    "Point_13",
    "Point_23",
    "Point_90",
    "Point_198",
    FAN_FEATURE,
];

/// Один набор входов модели. Поля именованные, поэтому перестановка
/// не может незаметно испортить прогноз.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FeatureVector {
    pub point_34: f64,
    pub point_17: f64,
    pub point_37: f64,
    pub point_21: f64,
    pub point_194: f64,
    pub point_26: f64,
    pub point_22: f64,
    pub point_9: f64,
    pub point_13: f64,
    pub point_23: f64,
    pub point_90: f64,
    pub point_198: f64,
    pub point_10: FanState,
}

impl Default for FeatureVector {
    fn default() -> Self {
        Self::defaults()
    }
}

impl FeatureVector {
    /// Значения ползунков по умолчанию, вентилятор включён.
    pub fn defaults() -> Self {
        let mut out = Self {
            point_34: 0.0,
            point_17: 0.0,
            point_37: 0.0,
            point_21: 0.0,
            point_194: 0.0,
            point_26: 0.0,
            point_22: 0.0,
            point_9: 0.0,
            point_13: 0.0,
            point_23: 0.0,
            point_90: 0.0,
            point_198: 0.0,
            point_10: FanState::On,
        };
        for spec in &FEATURES {
            if let Some(slot) = out.slot_mut(spec.name) {
                *slot = spec.default;
            }
        }
        out
    }

    /// Собирает вектор из полей формы. Нужны все тринадцать имён.
    pub fn from_form(form: &HashMap<String, String>) -> Result<Self, FeatureError> {
        let mut out = Self::defaults();
        for spec in &FEATURES {
            let raw = form
                .get(spec.name)
                .ok_or(FeatureError::Missing(spec.name))?;
            let value = raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .ok_or_else(|| FeatureError::Invalid {
                    name: spec.name,
                    value: raw.clone(),
                })?;
            if let Some(slot) = out.slot_mut(spec.name) {
                *slot = value;
            }
        }
        let fan = form
            .get(FAN_FEATURE)
            .ok_or(FeatureError::Missing(FAN_FEATURE))?;
        out.point_10 = fan.parse()?;
        out.validate()?;
        Ok(out)
    }

    pub fn value(&self, name: &str) -> Option<f64> {
        let value = match name {
            "Point_34" => self.point_34,
            "Point_17" => self.point_17,
            "Point_37" => self.point_37,
            "Point_21" => self.point_21,
            "Point_194" => self.point_194,
            "Point_26" => self.point_26,
            "Point_22" => self.point_22,
            "Point_9" => self.point_9,
            "Point_13" => self.point_13,
            "Point_23" => self.point_23,
            "Point_90" => self.point_90,
            "Point_198" => self.point_198,
            _ => return None,
        };
        Some(value)
    }

    fn slot_mut(&mut self, name: &str) -> Option<&mut f64> {
        let slot = match name {
            "Point_34" => &mut self.point_34,
            "Point_17" => &mut self.point_17,
            "Point_37" => &mut self.point_37,
            "Point_21" => &mut self.point_21,
            "Point_194" => &mut self.point_194,
            "Point_26" => &mut self.point_26,
            "Point_22" => &mut self.point_22,
            "Point_9" => &mut self.point_9,
            "Point_13" => &mut self.point_13,
            "Point_23" => &mut self.point_23,
            "Point_90" => &mut self.point_90,
            "Point_198" => &mut self.point_198,
            _ => return None,
        };
        Some(slot)
    }

    /// Проверяет, что каждое значение конечно и лежит в диапазоне ползунка.
    pub fn validate(&self) -> Result<(), FeatureError> {
        for spec in &FEATURES {
            let value = self
                .value(spec.name)
                .ok_or(FeatureError::Missing(spec.name))?;
            if !value.is_finite() {
                return Err(FeatureError::Invalid {
                    name: spec.name,
                    value: value.to_string(),
                });
            }
            if value < spec.min || value > spec.max {
                return Err(FeatureError::OutOfRange {
                    name: spec.name,
                    value,
                    min: spec.min,
                    max: spec.max,
                });
            }
        }
        Ok(())
    }

    /// Однострочная таблица с колонками в порядке обучения модели.
    pub fn to_frame(&self) -> Result<DataFrame, DashboardError> {
        df!(
            "Point_34" => [self.point_34],
            "Point_17" => [self.point_17],
            "Point_37" => [self.point_37],
            "Point_21" => [self.point_21],
            "Point_194" => [self.point_194],
            "Point_26" => [self.point_26],
            "Point_22" => [self.point_22],
            "Point_9" => [self.point_9],
            "Point_13" => [self.point_13],
            "Point_23" => [self.point_23],
            "Point_90" => [self.point_90],
            "Point_198" => [self.point_198],
            "Point_10" => [self.point_10.as_str()]
        )
        .map_err(DashboardError::prediction)
    }
}

/// Результат прогноза, округлённый до одного знака.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Consumption {
    pub kwh: f64,
}

impl Consumption {
    pub fn from_raw(raw: f64) -> Self {
        Self {
            kwh: (raw * 10.0).round() / 10.0,
        }
    }
}

impl fmt::Display for Consumption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} {UNIT_KWH}", self.kwh)
    }
}

/// Держит загруженную один раз модель; сам по себе не хранит состояния.
#[derive(Clone)]
pub struct PredictionServer {
    model: Arc<dyn Regressor>,
}

impl PredictionServer {
    pub fn new(model: Arc<dyn Regressor>) -> Self {
        let unknown = model
            .feature_names()
            .iter()
            .filter(|name| !MODEL_COLUMNS.contains(&name.as_str()))
            .collect::<Vec<_>>();
        if !unknown.is_empty() {
            tracing::warn!(
                ?unknown,
                "Model expects features the dashboard does not provide"
            );
        }
        Self { model }
    }

    pub fn predict(&self, features: &FeatureVector) -> Result<Consumption, DashboardError> {
        features.validate().map_err(DashboardError::prediction)?;
        let frame = features.to_frame()?;
        let output = self
            .model
            .predict(&frame)
            .map_err(DashboardError::Prediction)?;
        let raw = match output.as_slice() {
            [value] => *value,
            other => {
                return Err(DashboardError::prediction(format!(
                    "model returned {} values for one row",
                    other.len()
                )));
            }
        };
        if !raw.is_finite() {
            return Err(DashboardError::prediction(format!(
                "model returned non-finite value {raw}"
            )));
        }
        if raw < 0.0 {
            return Err(DashboardError::prediction(format!(
                "model returned negative consumption {raw:.3}"
            )));
        }
        let consumption = Consumption::from_raw(raw);
        tracing::info!(
            kwh = consumption.kwh,
            fan = features.point_10.as_str(),
            "Prediction computed"
        );
        Ok(consumption)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::error::BoxError;
    use crate::regressor::GbdtModel;
    use crate::regressor::tests::TWO_TREE_MODEL;

    /// Запоминает порядок колонок и возвращает заранее заданный ответ.
    struct Recording {
        columns: Mutex<Vec<String>>,
        answer: Vec<f64>,
    }

    impl Regressor for Recording {
        fn feature_names(&self) -> &[String] {
            &[]
        }

        fn predict(&self, frame: &DataFrame) -> Result<Vec<f64>, BoxError> {
            if let Ok(mut columns) = self.columns.lock() {
                *columns = frame
                    .get_column_names()
                    .iter()
                    .map(|name| name.to_string())
                    .collect();
            }
            Ok(self.answer.clone())
        }
    }

    fn recording(answer: Vec<f64>) -> Arc<Recording> {
        Arc::new(Recording {
            columns: Mutex::new(Vec::new()),
            answer,
        })
    }

    fn default_form() -> HashMap<String, String> {
        let mut form: HashMap<String, String> = FEATURES
            .iter()
            .map(|spec| (spec.name.to_string(), spec.default.to_string()))
            .collect();
        form.insert(FAN_FEATURE.to_string(), "ON".to_string());
        form
    }

    #[test]
    fn defaults_match_slider_table() {
        let features = FeatureVector::defaults();
        assert_eq!(features.point_90, 10.0);
        assert_eq!(features.point_17, 3000.0);
        assert_eq!(features.point_9, 450.0);
        assert_eq!(features.point_10, FanState::On);
        assert!(features.validate().is_ok());
    }

    #[test]
    fn frame_uses_model_column_order() {
        let model = recording(vec![12.34]);
        let server = PredictionServer::new(model.clone());
        server
            .predict(&FeatureVector::defaults())
            .expect("prediction");
        let columns = model.columns.lock().expect("lock").clone();
        assert_eq!(columns, MODEL_COLUMNS.to_vec());
    }

    #[test]
    fn output_is_rounded_to_one_decimal_with_unit() {
        let server = PredictionServer::new(recording(vec![12.34]));
        let out = server
            .predict(&FeatureVector::defaults())
            .expect("prediction");
        assert_eq!(out.kwh, 12.3);
        assert_eq!(out.to_string(), "12.3 kWh");
        assert_eq!(Consumption::from_raw(7.0).to_string(), "7.0 kWh");
    }

    #[test]
    fn prediction_is_pure_for_both_fan_states() {
        let model = GbdtModel::from_json(
            &TWO_TREE_MODEL.replace(r#"["temp", "fan"]"#, r#"["Point_90", "Point_10"]"#),
        )
        .expect("model");
        let server = PredictionServer::new(Arc::new(model));
        for fan in FanState::ALL {
            let features = FeatureVector {
                point_10: fan,
                ..FeatureVector::defaults()
            };
            let first = server.predict(&features).expect("first");
            let second = server.predict(&features).expect("second");
            assert_eq!(first, second);
            assert!(first.kwh.is_finite() && first.kwh >= 0.0);
        }
        let on = server.predict(&FeatureVector::defaults()).expect("on");
        assert_eq!(on.kwh, 15.0);
    }

    #[test]
    fn malformed_model_output_is_reported() {
        for answer in [vec![], vec![1.0, 2.0], vec![f64::NAN], vec![-0.5]] {
            let server = PredictionServer::new(recording(answer));
            let err = server
                .predict(&FeatureVector::defaults())
                .expect_err("malformed output");
            assert_eq!(err.stage(), "prediction");
            assert!(!err.is_user_input());
        }
    }

    #[test]
    fn form_requires_every_feature() {
        let mut form = default_form();
        assert_eq!(
            FeatureVector::from_form(&form).expect("valid form"),
            FeatureVector::defaults()
        );
        form.remove("Point_23");
        assert_eq!(
            FeatureVector::from_form(&form),
            Err(FeatureError::Missing("Point_23"))
        );
    }

    #[test]
    fn form_rejects_bad_values() {
        let mut form = default_form();
        form.insert("Point_17".into(), "8000".into());
        assert!(matches!(
            FeatureVector::from_form(&form),
            Err(FeatureError::OutOfRange {
                name: "Point_17",
                ..
            })
        ));

        let mut form = default_form();
        form.insert("Point_21".into(), "warm".into());
        assert!(matches!(
            FeatureVector::from_form(&form),
            Err(FeatureError::Invalid {
                name: "Point_21",
                ..
            })
        ));

        let mut form = default_form();
        form.insert(FAN_FEATURE.into(), "AUTO".into());
        assert!(matches!(
            FeatureVector::from_form(&form),
            Err(FeatureError::Invalid {
                name: FAN_FEATURE,
                ..
            })
        ));
    }

    #[test]
    fn out_of_range_vector_never_reaches_model() {
        let server = PredictionServer::new(recording(vec![1.0]));
        let features = FeatureVector {
            point_22: 11.0,
            ..FeatureVector::defaults()
        };
        let err = server.predict(&features).expect_err("out of range");
        assert!(err.is_user_input());
    }
}
