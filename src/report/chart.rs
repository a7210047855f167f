//! Plotly-графики прогноза: факт, прогноз с интервалом и разложение на компоненты.

use chrono::NaiveDateTime;
use itertools::Itertools;
use plotly::color::{Rgb, Rgba};
use plotly::common::{Anchor, Fill, Font, Line, Marker, Mode, Orientation, Title};
use plotly::layout::{
    Annotation, Axis, GridPattern, ItemClick, Layout, LayoutGrid, Legend, Margin, RangeSelector,
    RowOrder, SelectorButton, SelectorStep, StepMode, TicksDirection,
};
use plotly::{Configuration, Plot, Scatter};

use crate::constants::{AXIS_LABEL_DATE, TIMESTAMP_FORMAT, UNIT_KWH};
use crate::forecast::ScenarioForecast;

const MAX_PLOT_POINTS: usize = 2000;
const AXIS_REF_X: &str = "x";
const AXIS_REF_Y: &str = "y";
const AXIS_REF_PIXEL: &str = "pixel";
const LABEL_ACTUAL: &str = "Actual";
const LABEL_FORECAST: &str = "Forecast";
const LABEL_LOWER: &str = "Lower bound";
const FONT_FAMILY: &str = "IBM Plex Sans, Arial, sans-serif";
const FONT_SIZE_BASE: usize = 12;
const FONT_SIZE_TITLE: usize = 16;
const FONT_SIZE_AXIS_TITLE: usize = 13;
const FONT_SIZE_AXIS_TICK: usize = 11;
const FONT_SIZE_ANNOTATION: usize = 11;
const MARKER_SIZE: usize = 4;
const LINE_WIDTH_FORECAST: f64 = 2.2;
const LINE_WIDTH_COMPONENT: f64 = 1.8;
const LINE_WIDTH_MARKER: f64 = 1.0;
const ANNOTATION_OFFSET_X: f64 = -20.0;
const ANNOTATION_OFFSET_Y: f64 = -34.0;
const LEGEND_X: f64 = 0.5;
const LEGEND_Y: f64 = 1.02;
const MARGIN_LEFT: usize = 80;
const MARGIN_RIGHT: usize = 40;
const MARGIN_TOP: usize = 80;
const MARGIN_BOTTOM: usize = 60;
const MARGIN_PAD: usize = 8;
const TICK_LENGTH: usize = 6;
const AXIS_GRID_WIDTH: usize = 1;
const COMPONENT_PANEL_HEIGHT: usize = 220;
const COLOR_ACTUAL: (u8, u8, u8) = (0, 0, 0);
const COLOR_FORECAST: (u8, u8, u8) = (0, 114, 178);
const COLOR_TRANSPARENT: (u8, u8, u8, f64) = (0, 114, 178, 0.0);
const COLOR_BAND: (u8, u8, u8, f64) = (0, 114, 178, 0.2);
const COLOR_TEXT_BASE: (u8, u8, u8) = (40, 40, 40);
const COLOR_PANEL_BG: (u8, u8, u8, f64) = (255, 255, 255, 0.85);
const COLOR_PANEL_BORDER: (u8, u8, u8, f64) = (200, 200, 200, 0.75);
const COLOR_AXIS_TICK: (u8, u8, u8, f64) = (0, 0, 0, 0.45);
const COLOR_AXIS_LINE: (u8, u8, u8, f64) = (0, 0, 0, 0.35);
const COLOR_AXIS_GRID: (u8, u8, u8, f64) = (0, 0, 0, 0.07);
const COLOR_ARROW: (u8, u8, u8, f64) = (80, 80, 80, 0.6);

fn rgb(color: (u8, u8, u8)) -> Rgb {
    Rgb::new(color.0, color.1, color.2)
}

fn rgba(color: (u8, u8, u8, f64)) -> Rgba {
    Rgba::new(color.0, color.1, color.2, color.3)
}

fn format_dates(dates: &[NaiveDateTime]) -> Vec<String> {
    dates
        .iter()
        .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
        .collect_vec()
}

fn base_axis() -> Axis {
    Axis::new()
        .tick_font(Font::new().size(FONT_SIZE_AXIS_TICK))
        .ticks(TicksDirection::Outside)
        .tick_length(TICK_LENGTH)
        .tick_color(rgba(COLOR_AXIS_TICK))
        .show_line(true)
        .line_color(rgba(COLOR_AXIS_LINE))
        .grid_color(rgba(COLOR_AXIS_GRID))
        .grid_width(AXIS_GRID_WIDTH)
        .auto_margin(true)
}

fn axis_title(text: &str) -> Title {
    Title::with_text(text).font(Font::new().size(FONT_SIZE_AXIS_TITLE))
}

fn base_layout() -> Layout {
    Layout::new()
        .font(
            Font::new()
                .family(FONT_FAMILY)
                .size(FONT_SIZE_BASE)
                .color(rgb(COLOR_TEXT_BASE)),
        )
        .auto_size(true)
        .margin(
            Margin::new()
                .left(MARGIN_LEFT)
                .right(MARGIN_RIGHT)
                .top(MARGIN_TOP)
                .bottom(MARGIN_BOTTOM)
                .pad(MARGIN_PAD),
        )
}

/// Кнопки выбора периода в левом верхнем углу графика.
fn range_selector() -> RangeSelector {
    let button = |count: usize, label: &str, step: SelectorStep| {
        SelectorButton::new()
            .count(count)
            .label(label)
            .step(step)
            .step_mode(StepMode::Backward)
    };
    RangeSelector::new().buttons(vec![
        button(1, "1d", SelectorStep::Day),
        button(7, "1w", SelectorStep::Day),
        button(14, "2w", SelectorStep::Day),
        SelectorButton::new().step(SelectorStep::All).label("all"),
    ])
}

/// Факт (точки), прогноз (линия) и закрашенный интервал между границами.
pub fn forecast_chart(result: &ScenarioForecast) -> Plot {
    let spec = result.scenario.spec();
    let forecast = &result.forecast;

    let actual_ds = result
        .history
        .ds
        .iter()
        .chain(&result.actual.ds)
        .copied()
        .collect_vec();
    let actual_y = result
        .history
        .y
        .iter()
        .chain(&result.actual.y)
        .copied()
        .collect_vec();
    let (actual_x, actual_y) =
        downsample_min_max(&format_dates(&actual_ds), &actual_y, MAX_PLOT_POINTS);
    let forecast_x = format_dates(&forecast.ds);

    let mut plot = Plot::new();
    plot.add_trace(
        Scatter::new(actual_x, actual_y)
            .mode(Mode::Markers)
            .marker(Marker::new().color(rgb(COLOR_ACTUAL)).size(MARKER_SIZE))
            .name(LABEL_ACTUAL),
    );
    plot.add_trace(
        Scatter::new(forecast_x.clone(), forecast.lower.clone())
            .mode(Mode::Lines)
            .line(Line::new().color(rgba(COLOR_TRANSPARENT)))
            .show_legend(false)
            .name(LABEL_LOWER),
    );
    plot.add_trace(
        Scatter::new(forecast_x.clone(), forecast.upper.clone())
            .mode(Mode::Lines)
            .fill(Fill::ToNextY)
            .fill_color(rgba(COLOR_BAND))
            .line(Line::new().color(rgba(COLOR_TRANSPARENT)))
            .name(&interval_label(result)),
    );
    plot.add_trace(
        Scatter::new(forecast_x.clone(), forecast.mean.clone())
            .mode(Mode::Lines)
            .line(
                Line::new()
                    .color(rgb(COLOR_FORECAST))
                    .width(LINE_WIDTH_FORECAST),
            )
            .name(LABEL_FORECAST),
    );

    let mut annotations = Vec::new();
    if let (Some(last_date), Some(last_mean)) = (forecast_x.last(), forecast.mean.last()) {
        annotations.push(
            Annotation::new()
                .text(format!("{last_mean:.1} {UNIT_KWH}"))
                .x(last_date.clone())
                .y(*last_mean)
                .x_ref(AXIS_REF_X)
                .y_ref(AXIS_REF_Y)
                .x_anchor(Anchor::Right)
                .y_anchor(Anchor::Bottom)
                .ax(ANNOTATION_OFFSET_X)
                .ay(ANNOTATION_OFFSET_Y)
                .ax_ref(AXIS_REF_PIXEL)
                .ay_ref(AXIS_REF_PIXEL)
                .show_arrow(true)
                .arrow_color(rgba(COLOR_ARROW))
                .font(Font::new().size(FONT_SIZE_ANNOTATION))
                .background_color(rgba(COLOR_PANEL_BG))
                .border_color(rgba(COLOR_PANEL_BORDER))
                .border_width(LINE_WIDTH_MARKER),
        );
    }

    let layout = base_layout()
        .title(Title::with_text(spec.title).font(Font::new().size(FONT_SIZE_TITLE)))
        .show_legend(true)
        .legend(
            Legend::new()
                .orientation(Orientation::Horizontal)
                .item_click(ItemClick::False)
                .item_double_click(ItemClick::False)
                .x(LEGEND_X)
                .x_anchor(Anchor::Center)
                .y(LEGEND_Y)
                .y_anchor(Anchor::Bottom),
        )
        .annotations(annotations)
        .x_axis(
            base_axis()
                .title(axis_title(AXIS_LABEL_DATE))
                .range_selector(range_selector()),
        )
        .y_axis(
            base_axis()
                .title(axis_title(spec.axis_label))
                .separate_thousands(true),
        );

    plot.set_layout(layout);
    plot.set_configuration(Configuration::new().responsive(true));
    plot
}

fn interval_label(result: &ScenarioForecast) -> String {
    format!("{:.0}% interval", result.interval_width * 100.0)
}

/// Панели компонент: тренд, недельная и суточная сезонность и, если есть, регрессоры.
pub fn components_chart(result: &ScenarioForecast) -> Plot {
    let forecast = &result.forecast;
    let x = format_dates(&forecast.ds);
    let mut panels: Vec<(&str, &[f64])> = vec![
        ("trend", &forecast.trend),
        ("weekly", &forecast.weekly),
        ("daily", &forecast.daily),
    ];
    if let Some(extra) = &forecast.extra_regressors {
        panels.push(("extra_regressors", extra));
    }

    let mut plot = Plot::new();
    for (idx, (name, values)) in panels.iter().enumerate() {
        let suffix = if idx == 0 {
            String::new()
        } else {
            (idx + 1).to_string()
        };
        plot.add_trace(
            Scatter::new(x.clone(), values.to_vec())
                .mode(Mode::Lines)
                .line(
                    Line::new()
                        .color(rgb(COLOR_FORECAST))
                        .width(LINE_WIDTH_COMPONENT),
                )
                .name(*name)
                .x_axis(&format!("x{suffix}"))
                .y_axis(&format!("y{suffix}")),
        );
    }

    let mut layout = base_layout()
        .height(COMPONENT_PANEL_HEIGHT * panels.len())
        .show_legend(false)
        .grid(
            LayoutGrid::new()
                .rows(panels.len())
                .columns(1)
                .pattern(GridPattern::Independent)
                .row_order(RowOrder::TopToBottom),
        );
    for (idx, (name, _)) in panels.iter().enumerate() {
        let y_axis = base_axis().title(axis_title(name));
        let x_axis = if idx + 1 == panels.len() {
            base_axis().title(axis_title(AXIS_LABEL_DATE))
        } else {
            base_axis().matches("x")
        };
        layout = match idx {
            0 => layout.x_axis(x_axis).y_axis(y_axis),
            1 => layout.x_axis2(x_axis).y_axis2(y_axis),
            2 => layout.x_axis3(x_axis).y_axis3(y_axis),
            _ => layout.x_axis4(x_axis).y_axis4(y_axis),
        };
    }

    plot.set_layout(layout);
    plot.set_configuration(Configuration::new().responsive(true));
    plot
}

/// Даунсемплит ряд, сохраняя минимум и максимум в каждом бакете.
fn downsample_min_max<X: Clone>(x: &[X], y: &[f64], max_points: usize) -> (Vec<X>, Vec<f64>) {
    if x.len() <= max_points || x.len() != y.len() || max_points < 3 {
        return (x.to_vec(), y.to_vec());
    }

    let len = y.len();
    let bucket_count = (max_points.saturating_sub(2) / 2).max(1);
    let bucket_size = (len.saturating_sub(2)).div_ceil(bucket_count).max(1);

    let mut indices = vec![0, len - 1];
    for start in (1..len - 1).step_by(bucket_size) {
        let end = (start + bucket_size).min(len - 1);
        let window = &y[start..end];
        if let Some((min_idx, _)) = window.iter().enumerate().min_by(|a, b| a.1.total_cmp(b.1)) {
            indices.push(start + min_idx);
        }
        if let Some((max_idx, _)) = window.iter().enumerate().max_by(|a, b| a.1.total_cmp(b.1)) {
            indices.push(start + max_idx);
        }
    }
    indices.sort_unstable();
    indices.dedup();

    indices
        .into_iter()
        .map(|idx| (x[idx].clone(), y[idx]))
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::tests::synthetic_datasets;
    use crate::forecast::{Scenario, run_forecast};
    use crate::model::ModelConfig;

    fn scenario_result(scenario: Scenario) -> ScenarioForecast {
        let config = ModelConfig {
            max_iters: 200,
            uncertainty_samples: 50,
            ..ModelConfig::default()
        };
        run_forecast(&synthetic_datasets(300, 48), scenario, &config).expect("forecast")
    }

    #[test]
    fn forecast_chart_carries_titles_and_band() {
        let result = scenario_result(Scenario::Multivariate);
        let json = forecast_chart(&result).to_json();
        assert!(json.contains(Scenario::Multivariate.spec().title));
        assert!(json.contains("Energy Use (kWh)"));
        assert!(json.contains("\"Date\""));
        assert!(json.contains("tonexty"));
        assert!(json.contains(LABEL_ACTUAL));
        assert!(json.contains("90% interval"));
    }

    #[test]
    fn components_chart_adds_regressor_panel_only_when_present() {
        let uni = components_chart(&scenario_result(Scenario::Univariate)).to_json();
        assert!(uni.contains("yaxis3"));
        assert!(!uni.contains("yaxis4"));
        assert!(!uni.contains("extra_regressors"));

        let multi = components_chart(&scenario_result(Scenario::Multivariate)).to_json();
        assert!(multi.contains("yaxis4"));
        assert!(multi.contains("extra_regressors"));
    }

    #[test]
    fn downsampling_keeps_extremes_and_endpoints() {
        let x = (0..1000).collect_vec();
        let mut y = vec![0.0; 1000];
        y[500] = 9.0;
        y[700] = -9.0;
        let (dx, dy) = downsample_min_max(&x, &y, 50);
        assert!(dx.len() <= 60);
        assert_eq!(dx.first(), Some(&0));
        assert_eq!(dx.last(), Some(&999));
        assert!(dy.contains(&9.0));
        assert!(dy.contains(&-9.0));

        let (same_x, _) = downsample_min_max(&x[..10], &y[..10], 50);
        assert_eq!(same_x.len(), 10);
    }
}
