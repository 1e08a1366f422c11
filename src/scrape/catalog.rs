//! Catalog scraper
//!
//! Walks a listing URL page by page: snapshot the rendered DOM, clean it,
//! tag it, find the blocks that are new against the accumulated record
//! map, then ask the pagination handler to advance. Termination: the
//! handler finds no way forward past page one, or the page budget runs
//! out. Too few records at the end is a terminal failure unless the task
//! opts out.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{info, warn};

use super::context::{ScrapeContext, ScrapeError, TerminalKind};
use super::ScrapeDeps;
use crate::blocks::{Block, FindOptions, find_new_blocks};
use crate::browser::{Driver, PageHandle};
use crate::dom::clean_html;
use crate::pagination::{HandlerKind, next_page};
use crate::settings::task::ScrapeTask;
use crate::store::Record;
use crate::tagger::tag_values;

/// Outcome of a catalog scrape: the records plus the screenshot the
/// scheduler may want to upload when the run looks thin.
pub struct CatalogOutcome {
    pub records: Vec<Record>,
    pub pages: usize,
    pub screenshot: Option<Vec<u8>>,
}

/// Scrape one catalog URL to completion.
pub async fn scrape(
    driver: &Driver,
    task: &ScrapeTask,
    ctx: &ScrapeContext,
    deps: &ScrapeDeps<'_>,
) -> Result<CatalogOutcome, ScrapeError> {
    let start = Instant::now();
    info!(
        "scraping {} with proxy: {}",
        task.describe(),
        task.proxy.as_ref().map(|p| p.to_string()).unwrap_or_else(|| "none".into())
    );

    let page = driver
        .open_page(&task.url, deps.browser)
        .await
        .map_err(|e| ScrapeError::terminal(TerminalKind::Navigation, e.to_string()))?;

    let result = scrape_pages(&page, task, ctx, deps).await;

    let (records_map, pages) = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            page.close().await;
            return Err(e);
        }
    };

    info!(
        "final size: {} records, found {} pages in {:.3}s",
        records_map.len(),
        pages,
        start.elapsed().as_secs_f64()
    );

    // A thin result is worth a picture even when it is not yet a failure.
    let mut screenshot = None;
    if records_map.len() < deps.catalog.record_count_warning {
        warn!("saving screenshot for {}", task.describe());
        screenshot = page.screenshot_png().await.ok();
    }

    page.close().await;

    if records_map.len() < deps.catalog.min_record_count && !task.config.ignore_min_record_count {
        return Err(ScrapeError::terminal(
            TerminalKind::InsufficientRecords,
            format!("too few records ({})", records_map.len()),
        ));
    }

    let records = records_map.values().map(Record::from_block).collect();
    Ok(CatalogOutcome {
        records,
        pages,
        screenshot,
    })
}

async fn scrape_pages(
    page: &PageHandle,
    task: &ScrapeTask,
    ctx: &ScrapeContext,
    deps: &ScrapeDeps<'_>,
) -> Result<(HashMap<String, Block>, usize), ScrapeError> {
    let mut records: HashMap<String, Block> = HashMap::new();
    let mut last_blocks: Vec<Block> = Vec::new();
    let mut failed_handlers: Vec<HandlerKind> = Vec::new();
    let mut handler = task
        .config
        .preferred_pagination_handler
        .as_deref()
        .and_then(HandlerKind::parse);
    let mut current_page = 1usize;
    let mut last_page = 1usize;
    let mut has_retried = false;

    while current_page <= deps.pagination.max_page_count {
        let cleaned = snapshot_and_clean(page, task, deps).await?;
        deps.dump_tree("cleaned.html", &cleaned);

        let mut tagged = cleaned.clone();
        let annotations = tag_values(&mut tagged, deps.rules, deps.tables, deps.max_label_distance);
        deps.dump_tree("tagged.html", &tagged);

        ctx.checkpoint()?;

        let options = FindOptions {
            rules: deps.rules,
            max_tag_distance: deps.max_tag_distance,
            prioritize_first: false,
            record_alias: None,
            images: deps.images,
        };
        let new_blocks = find_new_blocks(&mut tagged, &annotations, &options, &records).await;

        if new_blocks.len() < deps.catalog.min_record_count && !has_retried {
            // The page may still be loading, or an overlay is in the way.
            info!(
                "found too few ({}) new blocks on page {current_page}",
                new_blocks.len()
            );
            has_retried = true;
            let pressed = page
                .try_interaction_buttons(&task.config.interaction_buttons)
                .await;
            if !pressed {
                info!("retrying in {} seconds...", deps.catalog.retry_timeout);
                tokio::time::sleep(std::time::Duration::from_secs_f64(deps.catalog.retry_timeout))
                    .await;
            }
            continue;
        }
        if new_blocks.len() >= deps.catalog.min_record_count {
            has_retried = false;
        }

        if last_page == 1 && new_blocks.is_empty() && handler.is_some() {
            // A preferred handler that yields nothing on page one was the
            // wrong guess; blacklist it and rediscover from the start.
            info!("no new blocks found, trying different pagination handler...");
            if let Some(failed) = handler.take() {
                failed_handlers.push(failed);
            }
            current_page = 1;
        }

        if !new_blocks.is_empty() {
            info!("found {} new blocks on page {current_page}", new_blocks.len());
            last_blocks = new_blocks.clone();
            for block in new_blocks {
                if let Some(alias) = block.alias().map(str::to_string) {
                    records.insert(alias, block);
                }
            }
        }

        ctx.checkpoint()?;

        handler = next_page(
            page,
            &cleaned,
            &last_blocks,
            current_page,
            handler,
            &task.config.interaction_buttons,
            &failed_handlers,
            deps.pagination,
        )
        .await;

        if handler.is_none() && current_page > 1 {
            break;
        }

        last_page = current_page;
        current_page += 1;

        ctx.checkpoint()?;
    }

    Ok((records, current_page))
}

/// Snapshot the rendered page and run the cleaning pipeline over it.
async fn snapshot_and_clean(
    page: &PageHandle,
    task: &ScrapeTask,
    deps: &ScrapeDeps<'_>,
) -> Result<crate::dom::TagTree, ScrapeError> {
    let include_images = deps.catalog.hash_record_images || deps.catalog.upload_record_images;
    page.absolutize_links(include_images).await;

    if task.config.translate_page(task.kind) {
        page.translate_page(&task.locale, deps.browser).await;
    }

    let html = page
        .html()
        .await
        .map_err(|e| ScrapeError::Transient(format!("failed to read page source: {e}")))?;

    let start = Instant::now();
    let cleaned = clean_html(
        &html,
        &task.url,
        deps.cleaner,
        &task.config.ignored_cleaning_steps,
    );
    info!("html cleaner: {:.3}s", start.elapsed().as_secs_f64());
    Ok(cleaned)
}
