//! Detail (VDP) scraper
//!
//! One page, no pagination. The extraction runs in prioritize-first mode
//! to isolate the single record block the page is about; when that block
//! comes back too sparse, the whole body is parsed as one fuzzy block and
//! its values fill the gaps. A record that stays sparse passes only when
//! one of the high-priority identity fields is populated.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{info, warn};

use super::ScrapeDeps;
use super::context::{ScrapeContext, ScrapeError, TerminalKind};
use crate::blocks::{FindOptions, find_blocks, parse_root_block};
use crate::dom::clean_html;
use crate::settings::task::ScrapeTask;
use crate::store::DetailRecord;
use crate::tagger::tag_values;

/// Scrape the detail page of a single record.
pub async fn scrape(
    driver: &crate::browser::Driver,
    task: &ScrapeTask,
    ctx: &ScrapeContext,
    deps: &ScrapeDeps<'_>,
) -> Result<DetailRecord, ScrapeError> {
    let start = Instant::now();
    info!(
        "scraping detail page of {} with proxy: {}",
        task.describe(),
        task.proxy.as_ref().map(|p| p.to_string()).unwrap_or_else(|| "none".into())
    );

    let record_id = task.config.record_id.ok_or_else(|| {
        ScrapeError::terminal(TerminalKind::MissingConfiguration, "detail task without record_id")
    })?;

    let page = driver
        .open_page(&task.url, deps.browser)
        .await
        .map_err(|e| ScrapeError::terminal(TerminalKind::Navigation, e.to_string()))?;

    page.absolutize_links(true).await;
    if task.config.translate_page(task.kind) {
        page.translate_page(&task.locale, deps.browser).await;
    }
    let html = page.html().await;
    page.close().await;
    let html = html.map_err(|e| ScrapeError::Transient(format!("failed to read page source: {e}")))?;

    let cleaned = clean_html(
        &html,
        &task.url,
        deps.cleaner,
        &task.config.ignored_cleaning_steps,
    );
    deps.dump_tree("cleaned.html", &cleaned);

    let mut tagged = cleaned;
    let annotations = tag_values(&mut tagged, deps.rules, deps.tables, deps.max_label_distance);
    deps.dump_tree("tagged.html", &tagged);

    ctx.checkpoint()?;

    // The page may expose several record blocks (related listings); only
    // the one this detail page is about matters.
    let options = FindOptions {
        rules: deps.rules,
        max_tag_distance: deps.max_tag_distance,
        prioritize_first: true,
        record_alias: task.config.record_alias.as_deref(),
        images: deps.images,
    };
    let blocks = find_blocks(&mut tagged, &annotations, &options).await;
    let Some(mut block) = blocks.into_iter().next() else {
        return Err(ScrapeError::Transient("no record blocks found".into()));
    };

    let threshold = deps.vdp.empty_field_threshold;
    if count_empty_fields(&block.values) >= threshold {
        ctx.checkpoint()?;
        warn!("record block has too few filled fields, reading information from the body instead");

        let fuzzy_options = FindOptions {
            prioritize_first: false,
            ..options
        };
        if let Some(fuzzy) = parse_root_block(&tagged, &annotations, &fuzzy_options).await {
            for (name, value) in fuzzy.values {
                let missing = block.values.get(&name).map(|v| v.is_empty()).unwrap_or(true);
                if missing && !value.is_empty() {
                    block.values.insert(name, value);
                }
            }
        }
    }

    let empty = count_empty_fields(&block.values);
    if empty >= threshold {
        let rescued = deps
            .vdp
            .high_priority_fields
            .iter()
            .any(|field| block.values.get(field).map(|v| !v.is_empty()).unwrap_or(false));
        if !rescued {
            return Err(ScrapeError::terminal(
                TerminalKind::LowFieldCount,
                format!(
                    "record block has too few filled fields: {}",
                    block.values.len().saturating_sub(empty)
                ),
            ));
        }
    }

    info!("detail scrape finished in {:.3}s", start.elapsed().as_secs_f64());
    Ok(DetailRecord::from_values(record_id, &block.values))
}

/// Empty fields of a parsed record; the `unavailable` marker does not
/// count against it.
fn count_empty_fields(values: &HashMap<String, crate::blocks::AttrValue>) -> usize {
    values
        .iter()
        .filter(|(name, value)| *name != "unavailable" && value.is_empty())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::AttrValue;

    #[test]
    fn unavailable_marker_does_not_count_as_empty() {
        let mut values = HashMap::new();
        values.insert("unavailable".to_string(), AttrValue::Null);
        values.insert("make".to_string(), AttrValue::Text("Audi".into()));
        values.insert("model".to_string(), AttrValue::Null);
        assert_eq!(count_empty_fields(&values), 1);
    }
}
