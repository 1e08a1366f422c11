//! Units of scraper work
//!
//! A `ScrapeTask` is one `(domain, locale, url)` target plus its recognized
//! configuration options; a `Batch` is the set of tasks one browser session
//! works through sequentially.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which pipeline a task runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScraperKind {
    Catalog,
    Vdp,
    CatalogStatic,
}

impl ScraperKind {
    /// Settings-group prefix for this kind (`catalog_scraper_settings`, …).
    pub fn as_str(&self) -> &'static str {
        match self {
            ScraperKind::Catalog => "catalog",
            ScraperKind::Vdp => "vdp",
            ScraperKind::CatalogStatic => "catalog_static",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "catalog" => Some(ScraperKind::Catalog),
            "vdp" => Some(ScraperKind::Vdp),
            "catalog_static" => Some(ScraperKind::CatalogStatic),
            _ => None,
        }
    }
}

impl fmt::Display for ScraperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed map of recognized per-locale options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    /// Selectors clicked before scraping to dismiss overlays.
    pub interaction_buttons: Vec<String>,
    /// Cleaner stages disabled for this target.
    pub ignored_cleaning_steps: Vec<String>,
    /// Pin one pagination strategy instead of discovering one.
    pub preferred_pagination_handler: Option<String>,
    pub ignore_min_record_count: bool,
    /// Defaults to true for detail pages, false for catalog pages.
    pub translate_page: Option<bool>,
    pub use_proxy: bool,
    // Detail-only fields.
    pub record_id: Option<i64>,
    pub record_alias: Option<String>,
}

impl TaskConfig {
    pub fn translate_page(&self, kind: ScraperKind) -> bool {
        self.translate_page.unwrap_or(kind == ScraperKind::Vdp)
    }
}

/// Proxy endpoint; absence means a direct connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proxy {
    pub username: String,
    pub password: String,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credentials stay out of logs.
        write!(f, "http://{}:{}", self.host, self.port)
    }
}

/// One unit of scraper work.
#[derive(Debug, Clone)]
pub struct ScrapeTask {
    pub kind: ScraperKind,
    pub domain: String,
    pub locale: String,
    pub url: String,
    pub config: TaskConfig,
    pub run_id: i64,
    pub proxy: Option<Proxy>,
}

impl ScrapeTask {
    pub fn new(
        kind: ScraperKind,
        domain: impl Into<String>,
        locale: impl Into<String>,
        url: impl Into<String>,
        config: TaskConfig,
        run_id: i64,
    ) -> Self {
        Self {
            kind,
            domain: domain.into(),
            locale: locale.into(),
            url: url.into(),
            config,
            run_id,
            proxy: None,
        }
    }

    /// Short form for log lines.
    pub fn describe(&self) -> String {
        format!("{}({}) {}", self.domain, self.locale, self.url)
    }
}

/// Tasks sharing one browser session, optionally behind one proxy.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub proxy: Option<Proxy>,
    pub tasks: Vec<ScrapeTask>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translate_defaults_by_kind() {
        let config = TaskConfig::default();
        assert!(config.translate_page(ScraperKind::Vdp));
        assert!(!config.translate_page(ScraperKind::Catalog));

        let forced = TaskConfig {
            translate_page: Some(true),
            ..Default::default()
        };
        assert!(forced.translate_page(ScraperKind::Catalog));
    }

    #[test]
    fn config_deserializes_from_task_json() {
        let json = r##"{
            "interaction_buttons": ["#consent > button"],
            "ignored_cleaning_steps": ["remove_excluded_tags"],
            "preferred_pagination_handler": "paginator",
            "use_proxy": true
        }"##;
        let config: TaskConfig = serde_json::from_str(json).expect("config parses");
        assert_eq!(config.interaction_buttons.len(), 1);
        assert!(config.use_proxy);
        assert_eq!(config.preferred_pagination_handler.as_deref(), Some("paginator"));
    }

    #[test]
    fn proxy_display_hides_credentials() {
        let proxy = Proxy {
            username: "user".into(),
            password: "secret".into(),
            host: "10.0.0.1".into(),
            port: 8080,
        };
        let shown = proxy.to_string();
        assert!(!shown.contains("secret"));
        assert!(shown.contains("10.0.0.1:8080"));
    }
}
