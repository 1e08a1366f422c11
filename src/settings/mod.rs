//! Settings service
//!
//! Every tunable lives in the `settings` table, keyed by scheduler id and
//! grouped into JSON documents (`catalog_scraper_settings`,
//! `vdp_attribute_rules`, `target_domains`, …). The store validates the
//! required groups at startup: a scheduler with no rules is
//! misconfigured, not degraded: and refreshes itself every ten minutes so
//! rule edits reach long-running daemons without a restart.

pub mod rules;
pub mod table_cache;
pub mod task;

pub use rules::AttributeRule;
pub use table_cache::{TableCache, TableLookup};
pub use task::{Batch, Proxy, ScrapeTask, ScraperKind, TaskConfig};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{error, info, warn};

use crate::dom::clean::CleanerSettings;
use crate::browser::BrowserSettings;
use crate::pagination::PaginationSettings;
use crate::store::Store;

/// Deployment environment; selects log verbosity, screenshot upload, and
/// destructive cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Env {
    #[default]
    Dev,
    Stage,
    Prod,
}

impl Env {
    /// Read `ENVIRONMENT`; anything unrecognized is DEV.
    pub fn from_process_env() -> Self {
        match std::env::var("ENVIRONMENT").unwrap_or_default().to_uppercase().as_str() {
            "PROD" => Env::Prod,
            "STAGE" => Env::Stage,
            _ => Env::Dev,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Env::Dev => "DEV",
            Env::Stage => "STAGE",
            Env::Prod => "PROD",
        }
    }
}

impl fmt::Display for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog scraping thresholds, from the `catalog_scraper_settings` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogSettings {
    pub min_record_count: usize,
    pub record_count_warning: usize,
    /// Seconds to wait before re-reading a page that produced too few
    /// blocks.
    pub retry_timeout: f64,
    /// Fraction by which a found count may deviate from the weekly
    /// average before the scrape is flagged.
    pub retry_difference: f64,
    pub upload_record_images: bool,
    pub hash_record_images: bool,
    pub max_label_distance: usize,
    pub max_tag_distance: usize,
}

impl Default for CatalogSettings {
    fn default() -> Self {
        Self {
            min_record_count: 3,
            record_count_warning: 10,
            retry_timeout: 10.0,
            retry_difference: 0.5,
            upload_record_images: false,
            hash_record_images: true,
            max_label_distance: 3,
            max_tag_distance: 5,
        }
    }
}

/// Detail scraping thresholds, from the `vdp_scraper_settings` group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VdpSettings {
    /// At or above this many empty fields, the fuzzy whole-body pass runs.
    pub empty_field_threshold: usize,
    /// Fields that let an otherwise-sparse record pass anyway.
    pub high_priority_fields: Vec<String>,
    pub max_label_distance: usize,
    pub max_tag_distance: usize,
}

impl Default for VdpSettings {
    fn default() -> Self {
        Self {
            empty_field_threshold: 5,
            high_priority_fields: vec![
                "vin_number".into(),
                "registration_number".into(),
                "sdk".into(),
            ],
            max_label_distance: 3,
            max_tag_distance: 5,
        }
    }
}

/// Pool, timeout, schedule, and retry tuning from `scheduler_settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub catalog_batch_size: usize,
    pub catalog_pool_capacity: usize,
    pub vdp_batch_size: usize,
    pub vdp_pool_capacity: usize,

    pub catalog_run_timeout_minutes: u64,
    pub vdp_run_timeout_minutes: u64,
    pub catalog_batch_timeout_minutes: u64,
    pub vdp_batch_timeout_minutes: u64,
    pub catalog_process_timeout_minutes: u64,
    pub vdp_process_timeout_minutes: u64,
    pub catalog_startup_stagger_delay: f64,
    pub vdp_startup_stagger_delay: f64,

    pub retry_startup_time_minutes: u64,
    pub retry_wait_time_minutes: u64,
    pub retry_process_timeout_minutes: u64,
    pub retry_attempts: u32,
    pub max_retry_hours: u64,

    /// Environment-keyed "HH:MM" schedule times.
    pub scheduled_catalog_time: HashMap<String, String>,
    pub scheduled_vdp_time: HashMap<String, String>,
    pub scheduled_cleanup_time: HashMap<String, String>,

    pub scrape_catalog_on_startup: bool,
    pub scrape_vdp_on_startup: bool,
    pub cleanup_on_startup: bool,

    pub platform_domains: Vec<String>,
    pub vdp_backlog_interval_days: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            catalog_batch_size: 1,
            catalog_pool_capacity: 8,
            vdp_batch_size: 100,
            vdp_pool_capacity: 12,
            catalog_run_timeout_minutes: 300,
            vdp_run_timeout_minutes: 300,
            catalog_batch_timeout_minutes: 60,
            vdp_batch_timeout_minutes: 240,
            catalog_process_timeout_minutes: 30,
            vdp_process_timeout_minutes: 5,
            catalog_startup_stagger_delay: 1.0,
            vdp_startup_stagger_delay: 1.0,
            retry_startup_time_minutes: 10,
            retry_wait_time_minutes: 2,
            retry_process_timeout_minutes: 60,
            retry_attempts: 2,
            max_retry_hours: 12,
            scheduled_catalog_time: HashMap::new(),
            scheduled_vdp_time: HashMap::new(),
            scheduled_cleanup_time: HashMap::new(),
            scrape_catalog_on_startup: false,
            scrape_vdp_on_startup: false,
            cleanup_on_startup: false,
            platform_domains: Vec::new(),
            vdp_backlog_interval_days: 2,
        }
    }
}

impl SchedulerSettings {
    pub fn pool_capacity(&self, kind: ScraperKind) -> usize {
        match kind {
            ScraperKind::Vdp => self.vdp_pool_capacity,
            _ => self.catalog_pool_capacity,
        }
    }

    pub fn batch_size(&self, kind: ScraperKind) -> usize {
        match kind {
            ScraperKind::Vdp => self.vdp_batch_size,
            _ => self.catalog_batch_size,
        }
    }

    pub fn run_timeout(&self, kind: ScraperKind) -> Duration {
        let minutes = match kind {
            ScraperKind::Vdp => self.vdp_run_timeout_minutes,
            _ => self.catalog_run_timeout_minutes,
        };
        Duration::from_secs(minutes * 60)
    }

    pub fn batch_timeout(&self, kind: ScraperKind) -> Duration {
        let minutes = match kind {
            ScraperKind::Vdp => self.vdp_batch_timeout_minutes,
            _ => self.catalog_batch_timeout_minutes,
        };
        Duration::from_secs(minutes * 60)
    }

    pub fn process_timeout(&self, kind: ScraperKind) -> Duration {
        let minutes = match kind {
            ScraperKind::Vdp => self.vdp_process_timeout_minutes,
            _ => self.catalog_process_timeout_minutes,
        };
        Duration::from_secs(minutes * 60)
    }

    pub fn startup_stagger(&self, kind: ScraperKind) -> Duration {
        let seconds = match kind {
            ScraperKind::Vdp => self.vdp_startup_stagger_delay,
            _ => self.catalog_startup_stagger_delay,
        };
        Duration::from_secs_f64(seconds)
    }

    pub fn scheduled_time(&self, kind: ScraperKind, env: Env) -> Option<&String> {
        let times = match kind {
            ScraperKind::Vdp => &self.scheduled_vdp_time,
            _ => &self.scheduled_catalog_time,
        };
        times.get(env.as_str())
    }
}

/// One configured catalog target within a domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocaleEntry {
    pub locale: String,
    pub url: String,
    #[serde(default)]
    pub configuration: Option<TaskConfig>,
}

const REQUIRED_GROUPS: [&str; 7] = [
    "catalog_scraper_settings",
    "vdp_scraper_settings",
    "catalog_attribute_rules",
    "vdp_attribute_rules",
    "target_domains",
    "webscraper_settings",
    "scheduler_settings",
];

/// Snapshot of the settings table for one scheduler id.
pub struct SettingsStore {
    pub scheduler_id: String,
    pub env: Env,
    values: RwLock<HashMap<String, serde_json::Value>>,
}

impl SettingsStore {
    /// Load and validate settings for a scheduler id. Missing required
    /// groups are a startup failure, not something to limp along with.
    pub async fn load(store: &Store, scheduler_id: &str, env: Env) -> Result<Self> {
        let scheduler_id = scheduler_id.to_uppercase();
        let values = store
            .get_settings(&scheduler_id)
            .await
            .context("loading settings")?;

        if values.is_empty() {
            bail!("no settings found for scheduler_id {scheduler_id}");
        }
        for group in REQUIRED_GROUPS {
            if !values.contains_key(group) {
                bail!("settings missing required field: {group}");
            }
        }

        info!("settings loaded for {scheduler_id}");
        Ok(Self {
            scheduler_id,
            env,
            values: RwLock::new(values),
        })
    }

    /// Fixed settings for tests and debug runs; skips validation.
    pub fn from_values(scheduler_id: &str, env: Env, values: HashMap<String, serde_json::Value>) -> Self {
        Self {
            scheduler_id: scheduler_id.to_uppercase(),
            env,
            values: RwLock::new(values),
        }
    }

    /// Re-pull the settings table; a failed refresh keeps the previous
    /// snapshot.
    pub async fn refresh(&self, store: &Store) {
        info!("updating settings...");
        match store.get_settings(&self.scheduler_id).await {
            Ok(values) if !values.is_empty() => {
                *self.values.write() = values;
                info!("settings updated");
            }
            Ok(_) => warn!("settings refresh returned nothing for {}", self.scheduler_id),
            Err(e) => error!("failed to update settings: {e}"),
        }
    }

    /// Refresh on an interval until the daemon exits.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        store: Arc<Store>,
        interval: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let settings = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                settings.refresh(&store).await;
            }
        })
    }

    fn group(&self, name: &str) -> serde_json::Value {
        self.values
            .read()
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }

    /// Deserialize a whole settings group into a typed struct; absent
    /// fields fall back to the struct's defaults.
    pub fn group_as<T: DeserializeOwned + Default>(&self, name: &str) -> T {
        let value = self.group(name);
        if value.is_null() {
            warn!("missing settings group {name}, using defaults");
            return T::default();
        }
        serde_json::from_value(value).unwrap_or_else(|e| {
            error!("settings group {name} failed to parse: {e}, using defaults");
            T::default()
        })
    }

    /// One value out of a settings group.
    pub fn get<T: DeserializeOwned>(&self, group: &str, name: &str) -> Option<T> {
        let value = self.group(group).get(name).cloned()?;
        serde_json::from_value(value).ok()
    }

    fn scraper_group(kind: ScraperKind) -> String {
        format!("{}_scraper_settings", kind.as_str())
    }

    pub fn catalog_settings(&self) -> CatalogSettings {
        self.group_as("catalog_scraper_settings")
    }

    pub fn vdp_settings(&self) -> VdpSettings {
        self.group_as("vdp_scraper_settings")
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        self.group_as("scheduler_settings")
    }

    pub fn browser_settings(&self) -> BrowserSettings {
        self.group_as("webscraper_settings")
    }

    pub fn cleaner_settings(&self, kind: ScraperKind) -> CleanerSettings {
        self.group_as(&Self::scraper_group(kind))
    }

    pub fn pagination_settings(&self) -> PaginationSettings {
        self.group_as("catalog_scraper_settings")
    }

    pub fn attribute_rules(&self, kind: ScraperKind) -> Vec<AttributeRule> {
        let group = format!("{}_attribute_rules", kind.as_str());
        let value = self.group(&group);
        serde_json::from_value(value).unwrap_or_else(|e| {
            error!("attribute rules {group} failed to parse: {e}");
            Vec::new()
        })
    }

    /// Scrape-distance tunables for a scraper type.
    pub fn distances(&self, kind: ScraperKind) -> (usize, usize) {
        match kind {
            ScraperKind::Vdp => {
                let s = self.vdp_settings();
                (s.max_label_distance, s.max_tag_distance)
            }
            _ => {
                let s = self.catalog_settings();
                (s.max_label_distance, s.max_tag_distance)
            }
        }
    }

    /// Configured catalog targets: domain → locale entries.
    pub fn target_domains(&self) -> HashMap<String, Vec<LocaleEntry>> {
        let value = self.group("target_domains");
        serde_json::from_value(value).unwrap_or_else(|e| {
            error!("target_domains failed to parse: {e}");
            HashMap::new()
        })
    }

    /// Every lookup table any attribute rule references.
    pub fn referenced_tables(&self) -> Vec<String> {
        let mut tables = Vec::new();
        for kind in [ScraperKind::Catalog, ScraperKind::Vdp] {
            for rule in self.attribute_rules(kind) {
                if let Some(table) = rule.table_source
                    && !tables.contains(&table)
                {
                    tables.push(table);
                }
            }
        }
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(group: &str, json: serde_json::Value) -> SettingsStore {
        let mut values = HashMap::new();
        values.insert(group.to_string(), json);
        SettingsStore::from_values("test", Env::Dev, values)
    }

    #[test]
    fn typed_groups_fill_defaults() {
        let store = store_with(
            "catalog_scraper_settings",
            serde_json::json!({"min_record_count": 50}),
        );
        let catalog = store.catalog_settings();
        assert_eq!(catalog.min_record_count, 50);
        assert_eq!(catalog.record_count_warning, CatalogSettings::default().record_count_warning);
    }

    #[test]
    fn attribute_rules_parse_from_group() {
        let store = store_with(
            "catalog_attribute_rules",
            serde_json::json!([
                {"name": "alias", "type": "text", "required": true, "regex": "x", "text": true},
                {"name": "price", "type": "float", "examples": ["€"], "text": true}
            ]),
        );
        let rules = store.attribute_rules(ScraperKind::Catalog);
        assert_eq!(rules.len(), 2);
        assert!(rules[0].required);
    }

    #[test]
    fn target_domains_parse() {
        let store = store_with(
            "target_domains",
            serde_json::json!({
                "autos": [{"locale": "lv", "url": "https://autos.example/cars",
                           "configuration": {"use_proxy": true}}]
            }),
        );
        let domains = store.target_domains();
        let entries = domains.get("autos").expect("domain present");
        assert_eq!(entries[0].locale, "lv");
        assert!(entries[0].configuration.as_ref().map(|c| c.use_proxy).unwrap_or(false));
    }

    #[test]
    fn scheduled_times_are_env_keyed() {
        let store = store_with(
            "scheduler_settings",
            serde_json::json!({"scheduled_catalog_time": {"DEV": "03:30", "PROD": "01:00"}}),
        );
        let scheduler = store.scheduler_settings();
        assert_eq!(
            scheduler.scheduled_time(ScraperKind::Catalog, Env::Dev),
            Some(&"03:30".to_string())
        );
        assert_eq!(scheduler.scheduled_time(ScraperKind::Vdp, Env::Dev), None);
    }
}
