//! Интерактивный дашборд по HTTP: каждый запрос заново рисует страницу,
//! прогнозы берутся из кэша по сценарию, точечный прогноз считается по кнопке.

use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::get;
use chrono::Utc;
use tower_http::trace::TraceLayer;

use crate::error::DashboardError;
use crate::forecast::{ForecastService, Scenario};
use crate::predict::{FeatureVector, PredictionServer};
use crate::report::{DashboardView, ErrorBanner, render_dashboard_page};

const SCENARIO_PARAM: &str = "scenario";
const PREDICT_PARAM: &str = "predict";

#[derive(Clone)]
pub struct AppState {
    pub forecasts: Arc<ForecastService>,
    pub predictor: Arc<PredictionServer>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState, bind: SocketAddr) -> Result<(), Box<dyn Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "Dashboard listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

fn status_for(err: &DashboardError) -> StatusCode {
    match err {
        DashboardError::InvalidScenario(_) => StatusCode::BAD_REQUEST,
        _ if err.is_user_input() => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn report_error(err: &DashboardError, status: &mut StatusCode) -> ErrorBanner {
    if err.is_user_input() {
        tracing::warn!(stage = err.stage(), "{err}");
    } else {
        tracing::error!(status = "err", stage = err.stage(), "{err}");
    }
    let candidate = status_for(err);
    // Серверная ошибка важнее ошибки ввода.
    if candidate.as_u16() > status.as_u16() {
        *status = candidate;
    }
    ErrorBanner::from(err)
}

async fn dashboard(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, Html<String>) {
    let mut status = StatusCode::OK;

    let (scenario, forecast) = match params.get(SCENARIO_PARAM) {
        None => (
            Scenario::Univariate,
            state.forecasts.get(Scenario::Univariate).await,
        ),
        Some(raw) => match raw.parse::<Scenario>() {
            Ok(scenario) => (scenario, state.forecasts.get(scenario).await),
            Err(err) => (Scenario::Univariate, Err(err)),
        },
    };
    let forecast = match &forecast {
        Ok(result) => Ok(Arc::as_ref(result)),
        Err(err) => Err(report_error(err, &mut status)),
    };

    let submitted = params.contains_key(PREDICT_PARAM);
    let parsed = FeatureVector::from_form(&params);
    let features = parsed.clone().unwrap_or_default();
    let prediction = if submitted {
        let outcome = parsed
            .map_err(DashboardError::prediction)
            .and_then(|features| state.predictor.predict(&features));
        Some(outcome.map_err(|err| report_error(&err, &mut status)))
    } else {
        None
    };

    let view = DashboardView {
        scenario,
        forecast,
        features,
        prediction,
        interactive: true,
        generated_at: Utc::now(),
    };
    (status, Html(render_dashboard_page(&view)))
}

#[cfg(test)]
mod tests {
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::forecast::tests::synthetic_datasets;
    use crate::model::ModelConfig;
    use crate::predict::{FAN_FEATURE, FEATURES};
    use crate::regressor::GbdtModel;
    use crate::regressor::tests::TWO_TREE_MODEL;

    fn app() -> (Router, Arc<ForecastService>) {
        let config = ModelConfig {
            max_iters: 200,
            uncertainty_samples: 50,
            ..ModelConfig::default()
        };
        let forecasts = Arc::new(ForecastService::new(synthetic_datasets(300, 48), config));
        let model = GbdtModel::from_json(
            &TWO_TREE_MODEL.replace(r#"["temp", "fan"]"#, r#"["Point_90", "Point_10"]"#),
        )
        .expect("model");
        let state = AppState {
            forecasts: Arc::clone(&forecasts),
            predictor: Arc::new(PredictionServer::new(Arc::new(model))),
        };
        (router(state), forecasts)
    }

    fn prediction_query(fan: &str, point_90: &str) -> String {
        let mut pairs = FEATURES
            .iter()
            .filter(|spec| spec.name != "Point_90")
            .map(|spec| format!("{}={}", spec.name, spec.default))
            .collect::<Vec<_>>();
        pairs.push(format!("Point_90={point_90}"));
        pairs.push(format!("{FAN_FEATURE}={fan}"));
        pairs.push("predict=1".to_string());
        pairs.join("&")
    }

    async fn fetch(app: &Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn healthz_answers_ok() {
        let (app, _) = app();
        let (status, body) = fetch(&app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn dashboard_reuses_cached_forecast() {
        let (app, forecasts) = app();
        let (status, body) = fetch(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("Univariate Consumption Forecast"));
        let (status, _) = fetch(&app, "/?scenario=Univariate+Forecast").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(forecasts.fit_count(), 1);

        let (status, body) = fetch(&app, "/?scenario=multivariate").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("including Outside Air Temperature"));
        assert_eq!(forecasts.fit_count(), 2);
    }

    #[tokio::test]
    async fn unknown_scenario_is_a_bad_request() {
        let (app, forecasts) = app();
        let (status, body) = fetch(&app, "/?scenario=Bivariate").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("Unknown forecast scenario"));
        assert_eq!(forecasts.fit_count(), 0);
    }

    #[tokio::test]
    async fn submitted_form_renders_prediction() {
        let (app, _) = app();
        let uri = format!("/?scenario=univariate&{}", prediction_query("ON", "10"));
        let (status, body) = fetch(&app, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("15.0 kWh"));

        let uri = format!("/?scenario=univariate&{}", prediction_query("OFF", "20"));
        let (_, body) = fetch(&app, &uri).await;
        assert!(body.contains("19.0 kWh"));
    }

    #[tokio::test]
    async fn out_of_range_feature_is_unprocessable() {
        let (app, _) = app();
        let uri = format!("/?{}", prediction_query("ON", "40"));
        let (status, body) = fetch(&app, &uri).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body.contains("Point_90 = 40 is outside"));
        assert!(!body.contains(" kWh</p>"));
    }
}
