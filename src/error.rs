//! Таксономия ошибок дашборда: каждая ошибка прерывает текущую перерисовку
//! и показывается пользователю с указанием стадии.

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("Unknown forecast scenario '{0}'")]
    InvalidScenario(String),
    #[error("Failed to load {what}: {source}")]
    DataLoad {
        what: String,
        #[source]
        source: BoxError,
    },
    #[error("Forecast fit failed: {0}")]
    Fit(#[source] BoxError),
    #[error("Prediction failed: {0}")]
    Prediction(#[source] BoxError),
}

impl DashboardError {
    pub fn data_load(what: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::DataLoad {
            what: what.into(),
            source: source.into(),
        }
    }

    pub fn fit(source: impl Into<BoxError>) -> Self {
        Self::Fit(source.into())
    }

    pub fn prediction(source: impl Into<BoxError>) -> Self {
        Self::Prediction(source.into())
    }

    /// Короткая метка стадии для баннера ошибки.
    pub const fn stage(&self) -> &'static str {
        match self {
            Self::InvalidScenario(_) => "scenario",
            Self::DataLoad { .. } => "data",
            Self::Fit(_) => "forecast",
            Self::Prediction(_) => "prediction",
        }
    }

    /// Ошибка вызвана вводом пользователя, а не состоянием данных или модели.
    pub fn is_user_input(&self) -> bool {
        match self {
            Self::InvalidScenario(_) => true,
            Self::Prediction(source) => source.is::<FeatureError>(),
            _ => false,
        }
    }
}

/// Ошибки проверки значений признаков до вызова модели.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum FeatureError {
    #[error("missing feature {0}")]
    Missing(&'static str),
    #[error("feature {name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
    #[error("feature {name} = {value} is outside {min}..={max}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_labels_identify_failed_step() {
        assert_eq!(
            DashboardError::InvalidScenario("x".into()).stage(),
            "scenario"
        );
        assert_eq!(DashboardError::data_load("model", "boom").stage(), "data");
        assert_eq!(DashboardError::fit("diverged").stage(), "forecast");
        assert_eq!(DashboardError::prediction("nan").stage(), "prediction");
    }

    #[test]
    fn prediction_keeps_underlying_cause() {
        let err = DashboardError::prediction(FeatureError::Missing("Point_10"));
        let source = std::error::Error::source(&err).expect("source attached");
        assert_eq!(source.to_string(), "missing feature Point_10");
        assert!(err.is_user_input());
        assert!(!DashboardError::prediction("model exploded").is_user_input());
    }
}
