//! Pagination strategies
//!
//! Three ways to reach the next page of a catalog: infinite scroll,
//! numbered paginators, and "view more" buttons. Discovery is
//! self-selecting: strategies are tried in order, the first success is
//! pinned for subsequent pages, and a strategy that fails once is
//! blacklisted for the rest of the task. Button candidates are scored on
//! the cleaned tree with the record blocks blanked out, so a paginator is
//! never confused with page numbers inside a listing.

use std::collections::HashMap;
use std::time::Duration;

use ego_tree::NodeId;
use regex::RegexBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blocks::Block;
use crate::browser::PageHandle;
use crate::dom::TagTree;

/// One pagination strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerKind {
    InfiniteScroll,
    Paginator,
    ViewMore,
}

impl HandlerKind {
    /// Accepts both the snake_case and camelCase spellings used in task
    /// configurations.
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().replace('_', "").as_str() {
            "infinitescroll" => Some(HandlerKind::InfiniteScroll),
            "paginator" => Some(HandlerKind::Paginator),
            "viewmore" => Some(HandlerKind::ViewMore),
            _ => None,
        }
    }
}

/// Pagination tuning, loaded from the catalog settings group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationSettings {
    pub max_page_count: usize,
    pub paginator_delay: f64,
    pub paginator_attempts: usize,
    pub max_pagination_distance: usize,
    pub paginator_classes: Vec<String>,
    pub paginator_levels: usize,
    pub scroll_delay: usize,
    pub scroll_offset: i64,
    pub view_more_aliases: Vec<String>,
    pub view_more_attempts: usize,
    pub view_more_load_delay: f64,
    pub pagination_tags: Vec<String>,
    pub restricted_class_symbols: Vec<String>,
}

impl Default for PaginationSettings {
    fn default() -> Self {
        Self {
            max_page_count: 100,
            paginator_delay: 3.0,
            paginator_attempts: 3,
            max_pagination_distance: 3,
            paginator_classes: vec![
                "pagination".into(),
                "paginator".into(),
                "pager".into(),
                "pages".into(),
            ],
            paginator_levels: 3,
            scroll_delay: 5,
            scroll_offset: 600,
            view_more_aliases: vec![
                "view more".into(),
                "show more".into(),
                "load more".into(),
                "next".into(),
            ],
            view_more_attempts: 3,
            view_more_load_delay: 3.0,
            pagination_tags: vec!["a".into(), "button".into(), "li".into(), "span".into(), "div".into()],
            restricted_class_symbols: vec![
                ":".into(),
                "/".into(),
                "[".into(),
                "]".into(),
                "(".into(),
                ")".into(),
            ],
        }
    }
}

/// Try to reach the next page. Returns the strategy that succeeded, or
/// `None` when no strategy could advance: with `current_page > 1` that
/// ends pagination.
#[allow(clippy::too_many_arguments)]
pub async fn next_page(
    page: &PageHandle,
    tree: &TagTree,
    blocks: &[Block],
    current_page: usize,
    handler: Option<HandlerKind>,
    interaction_buttons: &[String],
    failed_handlers: &[HandlerKind],
    settings: &PaginationSettings,
) -> Option<HandlerKind> {
    if current_page >= settings.max_page_count {
        info!("reached max page count ({})", settings.max_page_count);
        return None;
    }
    info!("attempting to navigate to page {}...", current_page + 1);

    let block_parent = blocks
        .first()
        .and_then(|b| b.parent)
        .and_then(|index| tree.find_by_index(index));

    // Paginator and view-more candidates must live outside the listing, so
    // the blocks are blanked out of a working copy first.
    let mut blanked = tree.clone();
    for block in blocks {
        if let Some(id) = blanked.find_by_index(block.index) {
            blanked.clear_children(id);
        }
    }
    let last_block_index = blocks.iter().map(|b| b.index).max();

    let can_handle = |kind: HandlerKind| {
        (handler.is_none() || handler == Some(kind)) && !failed_handlers.contains(&kind)
    };

    if can_handle(HandlerKind::InfiniteScroll)
        && try_infinite_scroll(page, current_page, settings).await
    {
        return Some(HandlerKind::InfiniteScroll);
    }

    if can_handle(HandlerKind::Paginator)
        && try_click_paginator(
            page,
            &blanked,
            current_page,
            last_block_index,
            block_parent,
            interaction_buttons,
            settings,
        )
        .await
    {
        return Some(HandlerKind::Paginator);
    }

    if can_handle(HandlerKind::ViewMore)
        && try_click_view_more(
            page,
            &blanked,
            last_block_index,
            block_parent,
            interaction_buttons,
            settings,
        )
        .await
    {
        return Some(HandlerKind::ViewMore);
    }

    info!("no more pages to navigate to, current page: {current_page}");
    None
}

/// Scroll to the bottom (then back by a small offset) and watch the tag
/// count; repeated growth means the page loads content on scroll. Succeeds
/// only after more than two growth rounds, so a single lazy-loaded footer
/// does not masquerade as pagination.
async fn try_infinite_scroll(
    page: &PageHandle,
    current_page: usize,
    settings: &PaginationSettings,
) -> bool {
    let mut old_count = 0;
    let mut new_count = page.count_tags().await.unwrap_or(0);
    let mut height_changes = 0usize;

    while old_count != new_count && current_page + height_changes <= settings.max_page_count {
        height_changes += 1;
        old_count = new_count;

        if page.scroll_to_bottom(settings.scroll_offset).await.is_err() {
            break;
        }

        for _ in 0..(settings.scroll_delay * 2) {
            new_count = page.count_tags().await.unwrap_or(new_count);
            if new_count != old_count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    if height_changes <= 2 {
        return false;
    }
    info!("[handler=infinite_scroll] reached bottom of page {current_page}");
    true
}

async fn try_click_paginator(
    page: &PageHandle,
    tree: &TagTree,
    current_page: usize,
    last_block_index: Option<usize>,
    block_parent: Option<NodeId>,
    interaction_buttons: &[String],
    settings: &PaginationSettings,
) -> bool {
    let potential = find_potential_buttons(tree, current_page, last_block_index, settings);
    if potential.values().map(Vec::len).sum::<usize>() == 0 {
        return false;
    }

    let Some(button) = choose_paginator_button(tree, &potential, current_page, block_parent, settings)
    else {
        return false;
    };

    let selector = tree.css_selector(button, &settings.restricted_class_symbols);
    if !page
        .click_selector(&selector, interaction_buttons, settings.paginator_attempts)
        .await
    {
        return false;
    }

    info!("[handler=paginator] clicked paginator on page {current_page}");
    tokio::time::sleep(Duration::from_secs_f64(settings.paginator_delay)).await;
    true
}

async fn try_click_view_more(
    page: &PageHandle,
    tree: &TagTree,
    last_block_index: Option<usize>,
    block_parent: Option<NodeId>,
    interaction_buttons: &[String],
    settings: &PaginationSettings,
) -> bool {
    let current_url = page.current_url().await.unwrap_or_default();
    let buttons = find_view_more_buttons(tree, last_block_index, &current_url, settings);

    let Some(button) = find_closest(tree, &buttons, block_parent) else {
        return false;
    };

    let selector = tree.css_selector(button, &settings.restricted_class_symbols);
    if !page
        .click_selector(&selector, interaction_buttons, settings.view_more_attempts)
        .await
    {
        return false;
    }

    info!("[handler=view_more] clicked view more");
    tokio::time::sleep(Duration::from_secs_f64(settings.view_more_load_delay)).await;
    true
}

/// Candidate paginator buttons for pages `current±2`, keyed by the page
/// number they display. A text node qualifies when its stripped content is
/// the bare number, or its word form: some translation layers rewrite
/// digits into words.
pub fn find_potential_buttons(
    tree: &TagTree,
    current_page: usize,
    last_block_index: Option<usize>,
    settings: &PaginationSettings,
) -> HashMap<usize, Vec<NodeId>> {
    let mut numbers = Vec::new();
    if current_page > 2 {
        numbers.push(current_page - 2);
    }
    if current_page > 1 {
        numbers.push(current_page - 1);
    }
    numbers.push(current_page);
    if current_page < settings.max_page_count {
        numbers.push(current_page + 1);
    }
    if current_page + 1 < settings.max_page_count {
        numbers.push(current_page + 2);
    }

    let mut potential: HashMap<usize, Vec<NodeId>> = HashMap::new();
    for number in &numbers {
        potential.insert(*number, Vec::new());
    }

    for number in numbers {
        let word_pattern = RegexBuilder::new(&format!(
            "^{}$",
            regex::escape(&number_words(number)).replace(r"\-", r"[\-\s]?")
        ))
        .case_insensitive(true)
        .build()
        .ok();

        for text_id in tree.text_ids() {
            let Some(text) = tree.node_text(text_id) else { continue };
            let stripped = text.trim();
            let matches_digit = stripped == number.to_string();
            let matches_word = word_pattern
                .as_ref()
                .map(|p| p.is_match(stripped))
                .unwrap_or(false);
            if !matches_digit && !matches_word {
                continue;
            }

            let Some(holder) = tree.parent(text_id) else { continue };
            let button = find_parent_button(tree, holder, &settings.pagination_tags);
            if is_after_blocks(tree, button, last_block_index)
                && let Some(list) = potential.get_mut(&number)
                && !list.contains(&button)
            {
                list.push(button);
            }
        }
    }

    potential
}

/// Pick the paginator button to click: buttons aligned (by DOM distance)
/// with a current-page button whose group contains a `current+1` sibling,
/// preferring buttons whose selector tail carries a known paginator class,
/// closest to the blocks' common parent.
pub fn choose_paginator_button(
    tree: &TagTree,
    potential: &HashMap<usize, Vec<NodeId>>,
    current_page: usize,
    block_parent: Option<NodeId>,
    settings: &PaginationSettings,
) -> Option<NodeId> {
    let current_buttons = potential.get(&current_page)?;

    let mut candidates: Vec<NodeId> = Vec::new();
    for &current in current_buttons {
        let mut aligned: HashMap<usize, Vec<NodeId>> = HashMap::new();
        for (&page_number, buttons) in potential {
            for &button in buttons {
                if tree.distance(current, button) <= settings.max_pagination_distance {
                    aligned.entry(page_number).or_default().push(button);
                }
            }
        }
        if let Some(next_buttons) = aligned.get(&(current_page + 1)) {
            for &button in next_buttons {
                if !candidates.contains(&button) {
                    candidates.push(button);
                }
            }
        }
    }

    let labeled = with_paginator_class(tree, &candidates, settings);
    if !labeled.is_empty() {
        return find_closest(tree, &labeled, block_parent);
    }
    find_closest(tree, &candidates, block_parent)
}

/// Buttons whose CSS selector's last `paginator_levels` segments mention a
/// configured paginator class.
fn with_paginator_class(
    tree: &TagTree,
    buttons: &[NodeId],
    settings: &PaginationSettings,
) -> Vec<NodeId> {
    let Ok(tail_pattern) =
        regex::Regex::new(&format!(r"([^>]+>?){{0,{}}}$", settings.paginator_levels))
    else {
        return Vec::new();
    };

    let mut found = Vec::new();
    for class in &settings.paginator_classes {
        let Ok(class_pattern) = RegexBuilder::new(&format!(r"\b{}\b", regex::escape(class)))
            .case_insensitive(true)
            .build()
        else {
            continue;
        };
        for &button in buttons {
            let selector = tree.css_selector(button, &settings.restricted_class_symbols);
            let tail = tail_pattern
                .find(&selector)
                .map(|m| m.as_str())
                .unwrap_or(&selector);
            if class_pattern.is_match(tail) && !found.contains(&button) {
                found.push(button);
            }
        }
    }
    found
}

/// View-more candidates: text matching a configured alias, hoisted to the
/// nearest pagination tag, after the blocks, with an href that stays
/// on-site and does not point back at the current URL.
pub fn find_view_more_buttons(
    tree: &TagTree,
    last_block_index: Option<usize>,
    current_url: &str,
    settings: &PaginationSettings,
) -> Vec<NodeId> {
    let mut buttons = Vec::new();

    for alias in &settings.view_more_aliases {
        let Ok(pattern) = RegexBuilder::new(&format!(r"\b{}\b", regex::escape(alias)))
            .case_insensitive(true)
            .build()
        else {
            continue;
        };

        for text_id in tree.text_ids() {
            let Some(text) = tree.node_text(text_id) else { continue };
            if !pattern.is_match(text) {
                continue;
            }
            let Some(holder) = tree.parent(text_id) else { continue };
            let button = find_parent_button(tree, holder, &settings.pagination_tags);
            if is_after_blocks(tree, button, last_block_index)
                && is_valid_link(tree, button, current_url)
                && !buttons.contains(&button)
            {
                buttons.push(button);
            }
        }
    }

    buttons
}

/// Walk up to the nearest pagination-capable ancestor, at most five
/// levels; falls back to the starting tag.
pub fn find_parent_button(tree: &TagTree, tag: NodeId, pagination_tags: &[String]) -> NodeId {
    let name_matches = |id: NodeId| {
        tree.element_name(id)
            .map(|name| pagination_tags.iter().any(|t| t == name))
            .unwrap_or(false)
    };

    if name_matches(tag) {
        return tag;
    }
    let mut current = tag;
    for _ in 0..5 {
        let Some(parent) = tree.parent(current) else { break };
        if name_matches(parent) {
            return parent;
        }
        current = parent;
    }
    tag
}

fn is_after_blocks(tree: &TagTree, button: NodeId, last_block_index: Option<usize>) -> bool {
    let Some(last) = last_block_index else {
        return true;
    };
    tree.scraper_index(button).map(|i| i > last).unwrap_or(false)
}

/// Anchor buttons must not navigate off-site or straight back to the page
/// being scraped.
fn is_valid_link(tree: &TagTree, button: NodeId, current_url: &str) -> bool {
    if tree.element_name(button) != Some("a") {
        return true;
    }
    let Some(href) = tree.element(button).and_then(|el| el.attr("href")) else {
        return true;
    };

    if current_url.ends_with(href) {
        return false;
    }
    if let Ok(href_url) = url::Url::parse(href)
        && let Some(href_host) = href_url.host_str()
    {
        let current_host = url::Url::parse(current_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        if current_host.as_deref() != Some(href_host) {
            return false;
        }
    }
    true
}

/// Closest button (by DOM distance) to the blocks' common parent.
pub fn find_closest(tree: &TagTree, buttons: &[NodeId], block_parent: Option<NodeId>) -> Option<NodeId> {
    let Some(parent) = block_parent else {
        return buttons.first().copied();
    };

    let mut closest = None;
    let mut closest_distance = usize::MAX;
    for &button in buttons {
        let distance = tree.distance(button, parent);
        if distance < closest_distance {
            closest = Some(button);
            closest_distance = distance;
        }
    }
    debug!("closest button at distance {closest_distance}");
    closest
}

/// English word form of a page number, hyphenated the way translation
/// widgets render them ("twenty-one").
pub fn number_words(n: usize) -> String {
    const ONES: [&str; 20] = [
        "zero", "one", "two", "three", "four", "five", "six", "seven", "eight", "nine", "ten",
        "eleven", "twelve", "thirteen", "fourteen", "fifteen", "sixteen", "seventeen", "eighteen",
        "nineteen",
    ];
    const TENS: [&str; 10] = [
        "", "", "twenty", "thirty", "forty", "fifty", "sixty", "seventy", "eighty", "ninety",
    ];

    match n {
        0..=19 => ONES[n].to_string(),
        20..=99 => {
            let tens = TENS[n / 10];
            if n % 10 == 0 {
                tens.to_string()
            } else {
                format!("{tens}-{}", ONES[n % 10])
            }
        }
        100..=999 => {
            let hundreds = format!("{} hundred", ONES[n / 100]);
            if n % 100 == 0 {
                hundreds
            } else {
                format!("{hundreds} {}", number_words(n % 100))
            }
        }
        _ => n.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paginated_page() -> TagTree {
        let mut tree = TagTree::parse(concat!(
            "<html><body>",
            "<main class=\"listing\">",
            "<div class=\"card\">car-1</div>",
            "<div class=\"card\">car-2</div>",
            "</main>",
            "<ul class=\"pagination\">",
            "<li><a href=\"/page/1\">1</a></li>",
            "<li><a href=\"/page/2\">2</a></li>",
            "<li><a href=\"/page/3\">3</a></li>",
            "</ul>",
            "</body></html>",
        ));
        tree.assign_indexes();
        tree
    }

    #[test]
    fn number_words_match_translated_paginators() {
        assert_eq!(number_words(1), "one");
        assert_eq!(number_words(15), "fifteen");
        assert_eq!(number_words(20), "twenty");
        assert_eq!(number_words(21), "twenty-one");
        assert_eq!(number_words(100), "one hundred");
    }

    #[test]
    fn potential_buttons_are_keyed_by_page_number() {
        let tree = paginated_page();
        let settings = PaginationSettings::default();
        let potential = find_potential_buttons(&tree, 1, None, &settings);

        assert_eq!(potential.get(&1).map(Vec::len), Some(1));
        assert_eq!(potential.get(&2).map(Vec::len), Some(1));
        assert_eq!(potential.get(&3).map(Vec::len), Some(1));
        assert!(!potential.contains_key(&4));
    }

    #[test]
    fn word_form_page_numbers_are_found() {
        let mut tree = TagTree::parse(concat!(
            "<html><body>",
            "<ul><li><a>one</a></li><li><a>Two</a></li></ul>",
            "</body></html>",
        ));
        tree.assign_indexes();
        let settings = PaginationSettings::default();
        let potential = find_potential_buttons(&tree, 1, None, &settings);
        assert_eq!(potential.get(&2).map(Vec::len), Some(1), "word form matched");
    }

    #[test]
    fn paginator_button_is_the_next_page_neighbor() {
        let tree = paginated_page();
        let settings = PaginationSettings::default();
        let potential = find_potential_buttons(&tree, 1, None, &settings);
        let button = choose_paginator_button(&tree, &potential, 1, None, &settings)
            .expect("a next-page button is found");

        let href = tree.element(button).and_then(|el| el.attr("href")).unwrap_or_default();
        let text = tree.text_content(button);
        assert_eq!(text.trim(), "2", "chose the current+1 button, got {href:?}");
    }

    #[test]
    fn buttons_before_the_blocks_are_rejected() {
        let tree = paginated_page();
        let settings = PaginationSettings::default();
        // Pretend the blocks end after the whole paginator.
        let last = tree.element_ids().len();
        let potential = find_potential_buttons(&tree, 1, Some(last), &settings);
        assert_eq!(potential.values().map(Vec::len).sum::<usize>(), 0);
    }

    #[test]
    fn view_more_candidates_respect_link_validity() {
        let mut tree = TagTree::parse(concat!(
            "<html><body>",
            "<a href=\"https://elsewhere.example/promo\">View more</a>",
            "<a href=\"/cars?page=2\">View more</a>",
            "</body></html>",
        ));
        tree.assign_indexes();
        let settings = PaginationSettings::default();
        let buttons =
            find_view_more_buttons(&tree, None, "https://site.example/cars", &settings);
        assert_eq!(buttons.len(), 1, "off-site link rejected");
        assert_eq!(
            tree.element(buttons[0]).and_then(|el| el.attr("href")),
            Some("/cars?page=2")
        );
    }

    #[test]
    fn parent_button_walks_to_pagination_tag() {
        let mut tree = TagTree::parse(
            "<html><body><ul><li><em><span>next</span></em></li></ul></body></html>",
        );
        tree.assign_indexes();
        let em = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("em"))
            .expect("em present");
        let button = find_parent_button(&tree, em, &["li".to_string()]);
        assert_eq!(tree.element_name(button), Some("li"));
    }
}
