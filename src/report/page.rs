//! HTML-страница дашборда: выбор сценария, графики прогноза и форма точечного прогноза.

use chrono::{DateTime, Utc};
use maud::{DOCTYPE, Markup, PreEscaped, html};

use super::chart::{components_chart, forecast_chart};
use crate::error::DashboardError;
use crate::forecast::{Scenario, ScenarioForecast};
use crate::predict::{Consumption, FAN_FEATURE, FAN_LABEL, FEATURES, FanState, FeatureVector};

const PAGE_TITLE: &str = "Building Energy Modeling";
const PAGE_SUBTITLE: &str = "Consumption Forecasting & System Analysis";
const PAGE_DESCRIPTION: &str =
    "Hourly building energy consumption forecast and on-demand consumption prediction.";
const FORECAST_HEADER: &str = "Energy Consumption Forecast";
const FORECAST_INTRO: &str = "This tool is capable of forecasting hourly building energy consumption. It has been trained on data from June 1, 2020 to May 25, 2021. The forecasting window provides data for the final week of May.";
const FORECAST_NOTE: &str = "Notice there is significant improvement in how the forecast fits the actual data in the multivariate case.";
const COMPONENTS_INTRO: &str = "The graphs below break down the components of the forecasting curve. They highlight the overall trend, weekly seasonality, and daily seasonality of energy consumption.";
const PREDICTION_HEADER: &str = "Energy Consumption Prediction";
const PREDICTION_INTRO: &str = "Now you can try out the model by setting values for each feature.";
const PREDICT_BUTTON: &str = "Make Hourly Energy Consumption Prediction";
const SCENARIO_LABEL: &str = "Select Forecast Type:";
const GENERATED_AT_FORMAT: &str = "%Y-%m-%d %H:%M UTC";
const PLOTLY_CDN: &str = "https://cdn.plot.ly/plotly-2.35.2.min.js";
const FORECAST_PLOT_ID: &str = "forecast-plot";
const COMPONENTS_PLOT_ID: &str = "components-plot";
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Ошибка, показываемая вместо результата стадии.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorBanner {
    pub stage: &'static str,
    pub message: String,
}

impl From<&DashboardError> for ErrorBanner {
    fn from(err: &DashboardError) -> Self {
        Self {
            stage: err.stage(),
            message: err.to_string(),
        }
    }
}

/// Всё, что нужно для одной перерисовки страницы.
#[derive(Clone, Debug)]
pub struct DashboardView<'a> {
    pub scenario: Scenario,
    pub forecast: Result<&'a ScenarioForecast, ErrorBanner>,
    pub features: FeatureVector,
    pub prediction: Option<Result<Consumption, ErrorBanner>>,
    /// Статическая страница без форм (для отчёта в файл).
    pub interactive: bool,
    pub generated_at: DateTime<Utc>,
}

fn error_banner(banner: &ErrorBanner) -> Markup {
    html! {
        div class="error" role="alert" {
            span class="error-stage" { (banner.stage) }
            (banner.message)
        }
    }
}

fn scenario_form(selected: Scenario) -> Markup {
    html! {
        form class="controls" method="get" action="/" {
            label for="scenario" { (SCENARIO_LABEL) }
            select id="scenario" name="scenario" onchange="this.form.submit()" {
                @for scenario in Scenario::ALL {
                    option value=(scenario.label()) selected[scenario == selected] {
                        (scenario.label())
                    }
                }
            }
            noscript { button type="submit" { "Show" } }
        }
    }
}

fn prediction_form(view: &DashboardView<'_>) -> Markup {
    html! {
        form class="prediction" method="get" action="/" {
            input type="hidden" name="scenario" value=(view.scenario.label());
            div class="slider-grid" {
                @for spec in &FEATURES {
                    @let value = view.features.value(spec.name).unwrap_or(spec.default);
                    @let output_id = format!("{}-value", spec.name);
                    div class="slider" {
                        label for=(spec.name) {
                            (spec.label)
                            output id=(output_id) { (value) }
                        }
                        input
                            type="range"
                            id=(spec.name)
                            name=(spec.name)
                            min=(spec.min)
                            max=(spec.max)
                            step=(spec.step)
                            value=(value)
                            oninput=(format!("document.getElementById('{output_id}').textContent=this.value"));
                    }
                }
                div class="slider" {
                    label for=(FAN_FEATURE) { (FAN_LABEL) }
                    select id=(FAN_FEATURE) name=(FAN_FEATURE) {
                        @for state in FanState::ALL {
                            option value=(state.as_str()) selected[state == view.features.point_10] {
                                (state.as_str())
                            }
                        }
                    }
                }
            }
            button type="submit" name="predict" value="1" { (PREDICT_BUTTON) }
        }
    }
}

#[allow(clippy::too_many_lines)]
pub fn render_dashboard_page(view: &DashboardView<'_>) -> String {
    let generated_label = view.generated_at.format(GENERATED_AT_FORMAT).to_string();
    let plots = view.forecast.as_ref().ok().map(|result| {
        (
            forecast_chart(result).to_inline_html(Some(FORECAST_PLOT_ID)),
            components_chart(result).to_inline_html(Some(COMPONENTS_PLOT_ID)),
        )
    });
    let page = html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                meta name="viewport" content="width=device-width, initial-scale=1";
                meta name="description" content=(PAGE_DESCRIPTION);
                title { (PAGE_TITLE) " · " (view.scenario.label()) }
                script src=(PLOTLY_CDN) {}
                style {
                    "
                    :root {
                        color-scheme: light;
                        --bg: #f7f6f2;
                        --card: #ffffff;
                        --ink: #1f2430;
                        --muted: #56606f;
                        --accent: #0072b2;
                        --danger: #b3261e;
                        --border: rgba(31, 36, 48, 0.08);
                    }
                    * { box-sizing: border-box; }
                    body {
                        margin: 0;
                        background: var(--bg);
                        color: var(--ink);
                        font-family: \"IBM Plex Sans\", Arial, sans-serif;
                    }
                    .page {
                        max-width: 1240px;
                        margin: 40px auto 60px;
                        padding: 0 24px;
                    }
                    .title { font-size: 28px; font-weight: 600; margin: 0; }
                    .subtitle { margin: 6px 0 0; color: var(--muted); font-size: 16px; }
                    h2 { margin: 28px 0 8px; font-size: 20px; }
                    p.note { color: var(--muted); font-size: 14px; }
                    .card {
                        background: var(--card);
                        border-radius: 18px;
                        padding: 16px;
                        border: 1px solid var(--border);
                        margin-top: 14px;
                        overflow-x: auto;
                    }
                    .controls { display: flex; gap: 10px; align-items: center; font-size: 14px; }
                    select, button {
                        font: inherit;
                        padding: 6px 10px;
                        border-radius: 8px;
                        border: 1px solid var(--border);
                        background: #fff;
                        color: var(--ink);
                    }
                    button { background: var(--accent); color: #fff; cursor: pointer; margin-top: 14px; }
                    .slider-grid {
                        display: grid;
                        grid-template-columns: repeat(auto-fit, minmax(260px, 1fr));
                        gap: 14px;
                    }
                    .slider label { display: flex; justify-content: space-between; font-size: 13px; }
                    .slider output { font-weight: 600; color: var(--accent); }
                    .slider input[type=range] { width: 100%; }
                    .result { font-size: 22px; font-weight: 600; margin-top: 14px; }
                    .error {
                        margin-top: 14px;
                        padding: 12px 14px;
                        border-radius: 12px;
                        border: 1px solid rgba(179, 38, 30, 0.35);
                        background: rgba(179, 38, 30, 0.06);
                        color: var(--danger);
                        font-size: 14px;
                    }
                    .error-stage {
                        text-transform: uppercase;
                        font-size: 11px;
                        letter-spacing: 0.08em;
                        font-weight: 600;
                        margin-right: 10px;
                    }
                    #forecast-plot { width: 100%; min-height: 520px; }
                    footer { margin-top: 16px; font-size: 12px; color: var(--muted); text-align: right; }
                    "
                }
            }
            body {
                div class="page" {
                    header {
                        h1 class="title" { (PAGE_TITLE) }
                        p class="subtitle" { (PAGE_SUBTITLE) }
                    }
                    section {
                        h2 { (FORECAST_HEADER) }
                        p class="note" { (FORECAST_INTRO) }
                        ul class="note" {
                            li { "Use the time period selection buttons at the top left of the graph to change the field of view" }
                            li { "Hover your cursor over the graph to read specific observation values" }
                            li { "Black points are actual values, the blue line is the forecast and the shaded area is the confidence interval" }
                        }
                        p class="note" { (FORECAST_NOTE) }
                        @if view.interactive {
                            (scenario_form(view.scenario))
                        }
                        @match &view.forecast {
                            Ok(_) => {
                                @if let Some((forecast_html, components_html)) = &plots {
                                    div class="card" { (PreEscaped(forecast_html)) }
                                    p class="note" { (COMPONENTS_INTRO) }
                                    div class="card" { (PreEscaped(components_html)) }
                                }
                            }
                            Err(banner) => { (error_banner(banner)) }
                        }
                    }
                    @if view.interactive {
                        section {
                            h2 { (PREDICTION_HEADER) }
                            p class="note" { (PREDICTION_INTRO) }
                            div class="card" {
                                (prediction_form(view))
                                @match &view.prediction {
                                    Some(Ok(consumption)) => {
                                        p class="result" { (consumption.to_string()) }
                                    }
                                    Some(Err(banner)) => { (error_banner(banner)) }
                                    None => {}
                                }
                            }
                        }
                    }
                    footer {
                        "Version: " (APP_VERSION) " · Generated: " (generated_label)
                    }
                }
            }
        }
    };
    page.into_string()
}
