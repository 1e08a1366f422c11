//! Stylesheet resolution for the cleaning pipeline
//!
//! Invisibility pruning needs per-tag `style` attributes, so stylesheet
//! declarations are folded into the markup before the tree is built. The
//! primary pass resolves remote stylesheets against the page base URL; when
//! it fails (malformed CSS, unreachable sheets) a permissive local-only
//! pass is attempted, and when that fails too the source is returned
//! unchanged with a warning: a page without inlined styles is still
//! scrapeable, just blinder.

use css_inline::{CSSInliner, InlineOptions};
use tracing::{debug, warn};

/// Inline stylesheet declarations into per-tag `style` attributes.
pub fn inline_css(source: &str, base_url: &str) -> String {
    let base = url::Url::parse(base_url).ok();

    let primary = InlineOptions {
        base_url: base.clone(),
        load_remote_stylesheets: true,
        keep_style_tags: false,
        preallocate_node_capacity: 1500,
        ..Default::default()
    };

    match CSSInliner::new(primary).inline(source) {
        Ok(inlined) => return inlined,
        Err(e) => {
            debug!("primary CSS inlining failed for {base_url}: {e}, retrying permissively");
        }
    }

    let permissive = InlineOptions {
        base_url: None,
        load_remote_stylesheets: false,
        keep_style_tags: false,
        ..Default::default()
    };

    match CSSInliner::new(permissive).inline(source) {
        Ok(inlined) => inlined,
        Err(e) => {
            warn!("CSS inlining failed for {base_url}, keeping page as-is: {e}");
            source.to_string()
        }
    }
}
