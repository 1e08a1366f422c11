//! Persistence contract
//!
//! The repository the core writes through: runs, scrape sessions, records
//! (upserted by `<domain>_<alias>`), price history, sold/reappearing
//! transitions, detail rows, and the read side the scheduler plans from
//! (proxies, settings, lookup tables, detail work lists). The SQL lives in
//! `queries.rs`; this module holds the row types and the pure formatting
//! helpers. `schema.sql` documents the expected tables.

mod queries;

use std::collections::HashMap;

use sqlx::postgres::{PgPool, PgPoolOptions};
use url::Url;

use crate::blocks::{AttrValue, Block};
use crate::images::RecordImage;

/// The output row for one catalog listing.
#[derive(Debug, Clone, Default)]
pub struct Record {
    pub alias: Option<String>,
    pub title: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub variant: Option<String>,
    pub year: Option<String>,
    pub mileage: Option<i64>,
    pub link: Option<String>,
    pub price: Option<f64>,
    pub fuel_type: Option<String>,
    pub transmission: Option<String>,
    pub image_link: Option<String>,
    pub image_hash: Option<String>,
    /// Downloaded image, pending blob upload.
    pub image: Option<RecordImage>,
}

impl Record {
    /// Project a parsed block onto the record row, dropping the block's
    /// helper fields (tag, index, grouping).
    pub fn from_block(block: &Block) -> Self {
        let text = |name: &str| {
            block
                .values
                .get(name)
                .and_then(AttrValue::as_text)
                .map(str::to_string)
        };
        let int = |name: &str| match block.values.get(name) {
            Some(AttrValue::Int(v)) => Some(*v),
            Some(AttrValue::Float(v)) => Some(v.trunc() as i64),
            _ => None,
        };
        let float = |name: &str| match block.values.get(name) {
            Some(AttrValue::Float(v)) => Some(*v),
            Some(AttrValue::Int(v)) => Some(*v as f64),
            _ => None,
        };
        let image = match block.values.get("record_image") {
            Some(AttrValue::Image(image)) => Some(image.clone()),
            _ => None,
        };

        Self {
            alias: text("alias"),
            title: text("title"),
            make: text("make"),
            model: text("model"),
            variant: text("variant"),
            year: text("year"),
            mileage: int("mileage"),
            link: text("link"),
            price: float("price"),
            fuel_type: text("fuel_type"),
            transmission: text("transmission"),
            image_link: image.as_ref().map(|i| i.link.clone()),
            image_hash: image.as_ref().and_then(|i| i.hash.clone()),
            image,
        }
    }
}

/// The output row for one detail (VDP) scrape.
#[derive(Debug, Clone, Default)]
pub struct DetailRecord {
    pub record_id: i64,
    pub seller_id: Option<i64>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub variant: Option<String>,
    pub year: Option<String>,
    pub title: Option<String>,
    pub mileage: Option<i64>,
    pub registration_number: Option<String>,
    pub vin_number: Option<String>,
    pub sdk: Option<String>,
    pub technical_inspection: Option<String>,
    pub engine_size: Option<String>,
    pub fuel_type: Option<String>,
    pub engine_power_kw: Option<i64>,
    pub exterior_color: Option<String>,
    pub current_location: Option<String>,
    pub body_type: Option<String>,
    pub transmission: Option<String>,
    pub drive_type: Option<String>,
    /// Count of populated fields, recorded on the scrape session.
    pub found_count: usize,
}

impl DetailRecord {
    pub fn from_values(record_id: i64, values: &HashMap<String, AttrValue>) -> Self {
        let text = |name: &str| {
            values
                .get(name)
                .and_then(AttrValue::as_text)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
        };
        let int = |name: &str| match values.get(name) {
            Some(AttrValue::Int(v)) => Some(*v),
            Some(AttrValue::Float(v)) => Some(v.trunc() as i64),
            _ => None,
        };

        let found_count = values.values().filter(|v| !v.is_empty()).count();

        Self {
            record_id,
            seller_id: int("seller_id"),
            make: text("make"),
            model: text("model"),
            variant: text("variant"),
            year: text("year"),
            title: text("title"),
            mileage: int("mileage"),
            registration_number: text("registration_number"),
            vin_number: text("vin_number"),
            sdk: text("sdk"),
            technical_inspection: text("technical_inspection"),
            engine_size: text("engine_size"),
            fuel_type: text("fuel_type"),
            engine_power_kw: int("power"),
            exterior_color: text("color"),
            current_location: text("location"),
            body_type: text("body_type"),
            transmission: text("transmission"),
            drive_type: text("drive_type"),
            found_count,
        }
    }
}

/// Stored alias: `<domain>_<alias>`, the cross-run join key.
pub fn prefix_alias(domain: &str, alias: &str) -> String {
    format!("{domain}_{alias}")
}

/// Resolve a record link against the catalog URL. Relative links join
/// onto the URL itself (not just its origin), so a path-bearing catalog
/// URL still produces correct absolute links.
pub fn resolve_link(catalog_url: &str, link: Option<&str>) -> Option<String> {
    let link = link?;
    if link.starts_with("http") || link.starts_with("www") {
        return Some(link.to_string());
    }
    Url::parse(catalog_url)
        .ok()
        .and_then(|base| base.join(link).ok())
        .map(|resolved| resolved.to_string())
}

/// Postgres-backed repository.
pub struct Store {
    pub(crate) pool: PgPool,
}

impl Store {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aliases_are_domain_prefixed() {
        assert_eq!(prefix_alias("autos", "12345.html"), "autos_12345.html");
    }

    #[test]
    fn relative_links_resolve_against_the_catalog_url() {
        assert_eq!(
            resolve_link("https://site.example/cars/", Some("detail/1")),
            Some("https://site.example/cars/detail/1".to_string())
        );
        assert_eq!(
            resolve_link("https://site.example/cars/", Some("/detail/1")),
            Some("https://site.example/detail/1".to_string())
        );
        // A path-bearing catalog URL must not mangle absolute links.
        assert_eq!(
            resolve_link("https://site.example/cars?page=1", Some("https://other.example/x")),
            Some("https://other.example/x".to_string())
        );
        assert_eq!(resolve_link("https://site.example/", None), None);
    }

    #[test]
    fn record_projects_typed_block_values() {
        let mut values = HashMap::new();
        values.insert("alias".to_string(), AttrValue::Text("12345".into()));
        values.insert("price".to_string(), AttrValue::Float(3950.0));
        values.insert("mileage".to_string(), AttrValue::Int(137000));
        values.insert("year".to_string(), AttrValue::Date("2021-05-17".into()));
        let block = Block {
            node: crate::dom::TagTree::parse("<html><body></body></html>").root_id(),
            index: 0,
            values,
            group_id: Some(0),
            parent: Some(0),
        };

        let record = Record::from_block(&block);
        assert_eq!(record.alias.as_deref(), Some("12345"));
        assert_eq!(record.price, Some(3950.0));
        assert_eq!(record.mileage, Some(137000));
        assert_eq!(record.year.as_deref(), Some("2021-05-17"));
        assert!(record.image.is_none());
    }

    #[test]
    fn detail_record_counts_populated_fields() {
        let mut values = HashMap::new();
        values.insert("vin_number".to_string(), AttrValue::Text("WVWZZZ".into()));
        values.insert("make".to_string(), AttrValue::Null);
        let detail = DetailRecord::from_values(7, &values);
        assert_eq!(detail.record_id, 7);
        assert_eq!(detail.vin_number.as_deref(), Some("WVWZZZ"));
        assert_eq!(detail.found_count, 1);
    }
}
