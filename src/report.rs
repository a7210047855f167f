//! Графики и HTML-страница дашборда.

mod chart;
mod page;

use std::error::Error;
use std::fs;
use std::path::Path;

use chrono::Utc;
use minify_html::{Cfg, minify};

use crate::forecast::ScenarioForecast;
use crate::predict::FeatureVector;

pub use page::{DashboardView, ErrorBanner, render_dashboard_page};

/// Сжимает HTML вместе со встроенными CSS и JS.
pub fn minify_page(page: &str) -> Result<String, Box<dyn Error + Send + Sync>> {
    let mut cfg = Cfg::new();
    cfg.minify_css = true;
    cfg.minify_js = true;
    let bytes = minify(page.as_bytes(), &cfg);
    Ok(String::from_utf8(bytes)?)
}

/// Сохраняет статическую страницу с обоими графиками сценария (без форм).
pub fn write_static_report(
    result: &ScenarioForecast,
    output_html: &Path,
    minify_html: bool,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    // Создаём директорию для HTML, если её ещё нет.
    if let Some(parent) = output_html.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }

    let view = DashboardView {
        scenario: result.scenario,
        forecast: Ok(result),
        features: FeatureVector::defaults(),
        prediction: None,
        interactive: false,
        generated_at: Utc::now(),
    };
    let mut page = render_dashboard_page(&view);
    if minify_html {
        page = minify_page(&page)?;
    }
    fs::write(output_html, page)?;
    Ok(())
}
