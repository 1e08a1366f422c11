//! Scraper pipelines
//!
//! The catalog scraper drives the per-URL loop (render → clean → tag →
//! find → paginate until termination); the detail scraper runs the same
//! extraction once against a single record page with a fuzzy fallback.
//! Both are pure consumers: everything they need (rules, thresholds,
//! lookup tables, image context) arrives through [`ScrapeDeps`], assembled
//! by the scheduler worker, so neither ever touches the database.

pub mod catalog;
pub mod context;
pub mod detail;

pub use context::{ScrapeContext, ScrapeError, StopFlag, StopReason, TerminalKind};

use std::path::PathBuf;

use tracing::debug;

use crate::browser::BrowserSettings;
use crate::dom::TagTree;
use crate::dom::clean::CleanerSettings;
use crate::images::ImageContext;
use crate::pagination::PaginationSettings;
use crate::settings::rules::AttributeRule;
use crate::settings::table_cache::TableLookup;
use crate::settings::{CatalogSettings, VdpSettings};

/// Everything a scraper needs for one task, resolved up front.
pub struct ScrapeDeps<'a> {
    pub rules: &'a [AttributeRule],
    pub tables: &'a dyn TableLookup,
    pub cleaner: &'a CleanerSettings,
    pub pagination: &'a PaginationSettings,
    pub browser: &'a BrowserSettings,
    pub catalog: &'a CatalogSettings,
    pub vdp: &'a VdpSettings,
    pub images: &'a ImageContext,
    pub max_label_distance: usize,
    pub max_tag_distance: usize,
    /// Dump intermediate trees for inspection (debug runs).
    pub tree_dump_dir: Option<PathBuf>,
}

impl ScrapeDeps<'_> {
    /// Write an intermediate tree to the dump directory, when enabled.
    pub(crate) fn dump_tree(&self, name: &str, tree: &TagTree) {
        let Some(dir) = &self.tree_dump_dir else { return };
        let path = dir.join(name);
        if let Err(e) = std::fs::create_dir_all(dir).and_then(|()| std::fs::write(&path, tree.to_html()))
        {
            debug!("could not save tree {}: {e}", path.display());
        }
    }
}
