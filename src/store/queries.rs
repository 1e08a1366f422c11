//! Repository SQL
//!
//! Runtime queries only: the schema is described in `schema.sql`. Write
//! operations are idempotent: records upsert on their prefixed alias,
//! detail rows upsert on record id, and sold/reappearing transitions are
//! single statements keyed on the scraped URL.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::{info, warn};

use super::{DetailRecord, Record, Store, prefix_alias, resolve_link};
use crate::settings::task::{Proxy, ScrapeTask, ScraperKind, TaskConfig};

impl Store {
    /// Open a run row; the id threads through every scrape of the run.
    pub async fn save_run(&self, scheduler_id: &str, kind: ScraperKind) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO runs (start_time, end_time, scheduler_id, scraper_type)
             VALUES (now(), NULL, $1, $2) RETURNING id",
        )
        .bind(scheduler_id)
        .bind(kind.as_str().to_uppercase())
        .fetch_one(&self.pool)
        .await
        .context("saving run")?;
        let run_id: i64 = row.try_get("id")?;
        info!("run id: {run_id}");
        Ok(run_id)
    }

    pub async fn end_run(&self, run_id: i64) -> Result<()> {
        let row = sqlx::query("SELECT start_time FROM runs WHERE id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .context("reading run start time")?;
        let start_time: DateTime<Utc> = row.try_get("start_time")?;
        let end_time = Utc::now();

        sqlx::query("UPDATE runs SET end_time = $1, duration = $2 WHERE id = $3")
            .bind(end_time)
            .bind((end_time - start_time).num_seconds())
            .bind(run_id)
            .execute(&self.pool)
            .await
            .context("ending run")?;
        info!("run {run_id} ended, duration: {}", end_time - start_time);
        Ok(())
    }

    /// Record a scrape session row; returns its id for later updates.
    pub async fn save_scrape(
        &self,
        task: &ScrapeTask,
        found_count: Option<usize>,
        message: &str,
        elapsed_secs: f64,
    ) -> Result<i64> {
        let row = sqlx::query(
            "INSERT INTO scraping_sessions (domain, locale, url, found_count, result, scraping_time, run_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING id",
        )
        .bind(&task.domain)
        .bind(&task.locale)
        .bind(&task.url)
        .bind(found_count.unwrap_or(0) as i64)
        .bind(message)
        .bind(elapsed_secs)
        .bind(task.run_id)
        .fetch_one(&self.pool)
        .await
        .context("saving scrape session")?;
        Ok(row.try_get("id")?)
    }

    pub async fn update_scrape(
        &self,
        session_id: i64,
        found_count: Option<usize>,
        message: &str,
        elapsed_secs: f64,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE scraping_sessions SET found_count = $1, result = $2, scraping_time = $3
             WHERE id = $4",
        )
        .bind(found_count.unwrap_or(0) as i64)
        .bind(message)
        .bind(elapsed_secs)
        .bind(session_id)
        .execute(&self.pool)
        .await
        .context("updating scrape session")?;
        Ok(())
    }

    /// Persist a page of records: upsert by prefixed alias, one price row
    /// per record, sold/reappearing bookkeeping against this URL.
    pub async fn save_records(
        &self,
        records: &[Record],
        task: &ScrapeTask,
        session_id: i64,
    ) -> Result<()> {
        let mut aliases = Vec::new();

        for record in records {
            let Some(alias) = record.alias.as_deref().filter(|a| !a.is_empty()) else {
                continue;
            };
            let alias = prefix_alias(&task.domain, alias);
            if aliases.contains(&alias) {
                continue;
            }

            let link = resolve_link(&task.url, record.link.as_deref());
            sqlx::query(
                "INSERT INTO records (alias, title, make, model, variant, year, mileage, link,
                                      scraping_session_id, image_link, image_hash, fuel_type, transmission)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                 ON CONFLICT (alias) DO UPDATE SET
                     image_link = COALESCE(records.image_link, EXCLUDED.image_link),
                     image_hash = COALESCE(records.image_hash, EXCLUDED.image_hash)",
            )
            .bind(&alias)
            .bind(&record.title)
            .bind(&record.make)
            .bind(&record.model)
            .bind(&record.variant)
            .bind(&record.year)
            .bind(record.mileage)
            .bind(link)
            .bind(session_id)
            .bind(&record.image_link)
            .bind(&record.image_hash)
            .bind(&record.fuel_type)
            .bind(&record.transmission)
            .execute(&self.pool)
            .await
            .with_context(|| format!("saving record {alias}"))?;

            sqlx::query(
                "INSERT INTO prices (record_id, price, scraping_session_id)
                 SELECT id, $2, $3 FROM records WHERE alias = $1",
            )
            .bind(&alias)
            .bind(record.price)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("saving price for {alias}"))?;

            aliases.push(alias);
        }

        info!("saved {} records", aliases.len());
        if aliases.is_empty() {
            return Ok(());
        }

        // Listings gone from this URL are sold as of yesterday; listings
        // that came back are un-sold.
        let sold = sqlx::query(
            "UPDATE records SET date_sold = now() - interval '1 day'
             WHERE id IN (
                 SELECT records.id FROM records
                 JOIN scraping_sessions ON scraping_sessions.id = records.scraping_session_id
                 WHERE scraping_sessions.url = $1
                   AND date_sold IS NULL
                   AND NOT (records.alias = ANY($2)))",
        )
        .bind(&task.url)
        .bind(&aliases)
        .execute(&self.pool)
        .await
        .context("marking sold records")?;
        info!("updated {} sold records", sold.rows_affected());

        let reappearing = sqlx::query(
            "UPDATE records SET date_sold = NULL
             WHERE date_sold IS NOT NULL AND alias = ANY($1)",
        )
        .bind(&aliases)
        .execute(&self.pool)
        .await
        .context("unmarking reappearing records")?;
        info!("updated {} reappearing records", reappearing.rows_affected());

        Ok(())
    }

    /// Upsert a detail row by record id.
    pub async fn save_or_update_detail(&self, detail: &DetailRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO record_details (record_id, seller_id, make, model, variant, year, title,
                 mileage, registration_number, vin_number, sdk, technical_inspection, engine_size,
                 fuel_type, engine_power_kw, exterior_color, current_location, body_type,
                 transmission, drive_type)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                     $18, $19, $20)
             ON CONFLICT (record_id) DO UPDATE SET
                 make = EXCLUDED.make,
                 model = EXCLUDED.model,
                 variant = EXCLUDED.variant,
                 year = EXCLUDED.year,
                 title = EXCLUDED.title,
                 mileage = EXCLUDED.mileage,
                 registration_number = EXCLUDED.registration_number,
                 vin_number = EXCLUDED.vin_number,
                 sdk = EXCLUDED.sdk,
                 technical_inspection = EXCLUDED.technical_inspection,
                 engine_size = EXCLUDED.engine_size,
                 fuel_type = EXCLUDED.fuel_type,
                 engine_power_kw = EXCLUDED.engine_power_kw,
                 exterior_color = EXCLUDED.exterior_color,
                 current_location = EXCLUDED.current_location,
                 body_type = EXCLUDED.body_type,
                 transmission = EXCLUDED.transmission,
                 drive_type = EXCLUDED.drive_type",
        )
        .bind(detail.record_id)
        .bind(detail.seller_id)
        .bind(&detail.make)
        .bind(&detail.model)
        .bind(&detail.variant)
        .bind(&detail.year)
        .bind(&detail.title)
        .bind(detail.mileage)
        .bind(&detail.registration_number)
        .bind(&detail.vin_number)
        .bind(&detail.sdk)
        .bind(&detail.technical_inspection)
        .bind(&detail.engine_size)
        .bind(&detail.fuel_type)
        .bind(detail.engine_power_kw)
        .bind(&detail.exterior_color)
        .bind(&detail.current_location)
        .bind(&detail.body_type)
        .bind(&detail.transmission)
        .bind(&detail.drive_type)
        .execute(&self.pool)
        .await
        .context("saving detail record")?;
        Ok(())
    }

    /// Mean found count for a URL over the prior week, excluding
    /// unfinished runs, under-warning counts, and today's runs.
    pub async fn get_average_count(&self, url: &str, record_count_warning: usize) -> Result<Option<i64>> {
        let row = sqlx::query(
            "SELECT avg(found_count)::float8 AS average FROM scraping_sessions
             WHERE url = $1
               AND found_count > $2
               AND run_id IN (
                   SELECT id FROM runs
                   WHERE end_time IS NOT NULL
                     AND end_time > current_date - interval '7 days'
                     AND end_time < current_date - interval '1 day')",
        )
        .bind(url)
        .bind(record_count_warning as i64)
        .fetch_one(&self.pool)
        .await
        .context("averaging record counts")?;
        let average: Option<f64> = row.try_get("average")?;
        if average.is_none() {
            warn!("no average found for {url}");
        }
        Ok(average.map(|a| a as i64))
    }

    /// Aliases in this task's domain/locale that already carry an image.
    pub async fn get_records_with_images(
        &self,
        task: &ScrapeTask,
        upload_record_images: bool,
        hash_record_images: bool,
    ) -> Result<Vec<String>> {
        let mut sql = String::from(
            "SELECT records.alias FROM records
             JOIN scraping_sessions ON scraping_sessions.id = records.scraping_session_id
             WHERE scraping_sessions.domain = $1 AND scraping_sessions.locale = $2",
        );
        if upload_record_images {
            sql.push_str(" AND records.image_link IS NOT NULL");
        }
        if hash_record_images {
            sql.push_str(" AND records.image_hash IS NOT NULL");
        }

        let rows = sqlx::query(&sql)
            .bind(&task.domain)
            .bind(&task.locale)
            .fetch_all(&self.pool)
            .await
            .context("loading records with images")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("alias").map_err(Into::into))
            .collect()
    }

    /// Hashes of known site-placeholder images.
    pub async fn get_default_image_hashes(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT hash FROM default_images")
            .fetch_all(&self.pool)
            .await
            .context("loading default image hashes")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("hash").map_err(Into::into))
            .collect()
    }

    pub async fn get_proxies(&self) -> Result<Vec<Proxy>> {
        let rows = sqlx::query("SELECT username, pass, host, port FROM proxies")
            .fetch_all(&self.pool)
            .await
            .context("loading proxies")?;
        rows.iter()
            .map(|row| {
                Ok(Proxy {
                    username: row.try_get("username")?,
                    password: row.try_get("pass")?,
                    host: row.try_get("host")?,
                    port: row.try_get::<i32, _>("port")? as u16,
                })
            })
            .collect()
    }

    /// The settings bundle for a scheduler id; values are stored as JSON
    /// text.
    pub async fn get_settings(&self, scheduler_id: &str) -> Result<HashMap<String, serde_json::Value>> {
        let rows = sqlx::query("SELECT name, value FROM settings WHERE scheduler_id = $1")
            .bind(scheduler_id)
            .fetch_all(&self.pool)
            .await
            .context("loading settings")?;

        let mut settings = HashMap::new();
        for row in rows {
            let name: String = row.try_get("name")?;
            let raw: String = row.try_get("value")?;
            let value = serde_json::from_str(&raw).unwrap_or(serde_json::Value::String(raw));
            settings.insert(name, value);
        }
        Ok(settings)
    }

    /// Values of a small lookup table (first non-id column).
    pub async fn get_table_values(&self, table: &str) -> Result<Vec<String>> {
        if !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            bail!("invalid table name {table:?}");
        }
        let rows = sqlx::query(&format!("SELECT * FROM {table} ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("loading lookup table {table}"))?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(1).map_err(Into::into))
            .collect()
    }

    // Detail work lists, in priority order. Each query returns the same
    // shape: (domain, locale, link, record id, alias), grouped by domain.

    /// Recently added records with no detail row yet.
    pub async fn detail_priority_targets(
        &self,
        scheduler_id: &str,
        run_id: i64,
        backlog_interval_days: u32,
    ) -> Result<HashMap<String, Vec<ScrapeTask>>> {
        let sql = format!(
            "{DETAIL_SELECT}
             WHERE record_details.id IS NULL
               AND date_sold IS NULL
               AND runs.scheduler_id = $1
               AND records.date_created > current_date - interval '{backlog_interval_days} days'
             ORDER BY domain, records.date_created"
        );
        self.detail_targets(&sql, scheduler_id, run_id).await
    }

    /// Older detail-less records off the platform domains.
    pub async fn detail_competitor_backlog_targets(
        &self,
        scheduler_id: &str,
        run_id: i64,
        backlog_interval_days: u32,
        platform_domains: &[String],
    ) -> Result<HashMap<String, Vec<ScrapeTask>>> {
        let sql = backlog_sql(backlog_interval_days, platform_domains, false);
        self.detail_targets(&sql, scheduler_id, run_id).await
    }

    /// Records with a detail row but no identity field at all.
    pub async fn detail_inconclusive_targets(
        &self,
        scheduler_id: &str,
        run_id: i64,
    ) -> Result<HashMap<String, Vec<ScrapeTask>>> {
        let sql = format!(
            "{DETAIL_SELECT}
             WHERE record_details.id IS NOT NULL
               AND date_sold IS NULL
               AND runs.scheduler_id = $1
               AND record_details.vin_number IS NULL
               AND record_details.registration_number IS NULL
               AND record_details.sdk IS NULL
             ORDER BY domain, record_details.date_updated"
        );
        self.detail_targets(&sql, scheduler_id, run_id).await
    }

    /// Older detail-less records on the platform domains.
    pub async fn detail_platform_backlog_targets(
        &self,
        scheduler_id: &str,
        run_id: i64,
        backlog_interval_days: u32,
        platform_domains: &[String],
    ) -> Result<HashMap<String, Vec<ScrapeTask>>> {
        let sql = backlog_sql(backlog_interval_days, platform_domains, true);
        self.detail_targets(&sql, scheduler_id, run_id).await
    }

    async fn detail_targets(
        &self,
        sql: &str,
        scheduler_id: &str,
        run_id: i64,
    ) -> Result<HashMap<String, Vec<ScrapeTask>>> {
        let rows = sqlx::query(sql)
            .bind(scheduler_id)
            .fetch_all(&self.pool)
            .await
            .context("loading detail targets")?;

        let mut targets: HashMap<String, Vec<ScrapeTask>> = HashMap::new();
        for row in rows {
            let domain: String = row.try_get("domain")?;
            let locale: String = row.try_get("locale")?;
            let link: Option<String> = row.try_get("link")?;
            let record_id: i64 = row.try_get("id")?;
            let alias: String = row.try_get("alias")?;

            let Some(link) = link else { continue };
            let config = TaskConfig {
                record_id: Some(record_id),
                record_alias: Some(alias),
                ..Default::default()
            };
            let task = ScrapeTask::new(ScraperKind::Vdp, domain.clone(), locale, link, config, run_id);
            targets.entry(domain).or_default().push(task);
        }
        Ok(targets)
    }
}

const DETAIL_SELECT: &str = "SELECT domain, locale, link, records.id, records.alias FROM runs
     JOIN scraping_sessions ON runs.id = run_id
     JOIN records ON scraping_sessions.id = scraping_session_id
     LEFT JOIN record_details ON records.id = record_id";

fn backlog_sql(backlog_interval_days: u32, platform_domains: &[String], platforms: bool) -> String {
    let platform_filter = if platform_domains.is_empty() {
        String::new()
    } else {
        let formatted = platform_domains
            .iter()
            .map(|d| format!("'{}'", d.replace('\'', "''")))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "AND domain {} IN ({formatted})",
            if platforms { "" } else { "NOT" }
        )
    };

    format!(
        "{DETAIL_SELECT}
         WHERE record_details.id IS NULL
           AND date_sold IS NULL
           AND runs.scheduler_id = $1
           AND records.date_created <= current_date - interval '{backlog_interval_days} days'
           {platform_filter}
         ORDER BY domain, records.date_created"
    )
}
