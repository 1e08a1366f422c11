//! DOM cleaning pipeline
//!
//! Normalizes a rendered page into a compact, comparable tag tree: styles
//! inlined, invisible and excluded markup dropped, attributes reduced to a
//! whitelist, inline text flattened, whitespace and punctuation normalized,
//! empty tags removed. Every stage can be disabled by name through the
//! task's `ignored_cleaning_steps`, and the surviving elements receive
//! their document-order `scraper_index` before the tree is returned.
//!
//! Stage order matters: CSS inlining must run before invisibility checks
//! (visibility lives in `style`), image inlining before attribute
//! filtering, and empty-tag removal last so earlier stages cannot strand
//! emptied ancestors.

use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::inline_css::inline_css;
use super::{TagNode, TagTree};

/// Cleaner configuration, loaded per scraper type from the settings store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanerSettings {
    pub invisible_tag_regex: Vec<String>,
    pub excluded_tags: Vec<String>,
    pub whitelisted_attributes: Vec<String>,
    pub flattened_tags: Vec<String>,
    pub flattened_special_strings: Vec<String>,
    pub punctuation_marks: Vec<String>,
    pub redundant_punctuation_marks: Vec<String>,
    pub empty_tags: Vec<String>,
}

impl Default for CleanerSettings {
    fn default() -> Self {
        Self {
            invisible_tag_regex: vec![
                r"display:\s?none".into(),
                r"visibility:\s?hidden".into(),
            ],
            excluded_tags: vec!["script".into(), "style".into(), "svg".into(), "noscript".into()],
            whitelisted_attributes: vec![
                "href".into(),
                "src".into(),
                "style".into(),
                "class".into(),
                "id".into(),
                "hidden".into(),
                "alt".into(),
                "title".into(),
            ],
            flattened_tags: vec![
                "b".into(),
                "i".into(),
                "em".into(),
                "strong".into(),
                "u".into(),
                "small".into(),
                "sup".into(),
                "sub".into(),
            ],
            flattened_special_strings: Vec::new(),
            punctuation_marks: vec![
                "!".into(),
                "?".into(),
                ".".into(),
                ",".into(),
                ":".into(),
                ";".into(),
            ],
            redundant_punctuation_marks: vec!["|".into(), "•".into()],
            empty_tags: vec!["img".into(), "br".into(), "hr".into()],
        }
    }
}

/// Clean a rendered page into an indexed tag tree.
///
/// `ignored_steps` holds stage names to skip, straight from the task
/// configuration.
pub fn clean_html(
    source: &str,
    base_url: &str,
    settings: &CleanerSettings,
    ignored_steps: &[String],
) -> TagTree {
    let enabled = |step: &str| !ignored_steps.iter().any(|s| s == step);

    let inlined;
    let source = if enabled("inline_css") {
        let start = Instant::now();
        inlined = inline_css(source, base_url);
        debug!("cleaner > inline css {:.3}s", start.elapsed().as_secs_f64());
        inlined.as_str()
    } else {
        source
    };

    let mut tree = TagTree::parse(source);

    run_stage(enabled("inline_images"), "inline images", || inline_images(&mut tree));
    run_stage(enabled("remove_comments"), "remove comments", || {
        remove_comments(&mut tree)
    });
    run_stage(enabled("remove_invisible_tags"), "remove invisible tags", || {
        remove_invisible_tags(&mut tree, &settings.invisible_tag_regex)
    });
    run_stage(enabled("remove_excluded_tags"), "remove excluded tags", || {
        remove_excluded_tags(&mut tree, &settings.excluded_tags)
    });
    run_stage(
        enabled("remove_non_whitelisted_attributes"),
        "filter attributes",
        || filter_attributes(&mut tree, &settings.whitelisted_attributes),
    );
    run_stage(enabled("flatten_text"), "flatten text", || {
        flatten_text(&mut tree, &settings.flattened_tags)
    });
    run_stage(enabled("flatten_special_strings"), "flatten special strings", || {
        flatten_special_strings(&mut tree, &settings.flattened_special_strings)
    });
    run_stage(
        enabled("remove_redundant_punctuation"),
        "remove redundant punctuation",
        || remove_redundant_punctuation(&mut tree, &settings.redundant_punctuation_marks),
    );
    run_stage(
        enabled("remove_punctuation_whitespace"),
        "remove punctuation whitespace",
        || remove_punctuation_whitespace(&mut tree, &settings.punctuation_marks),
    );
    run_stage(
        enabled("remove_duplicate_whitespace"),
        "remove duplicate whitespace",
        || remove_duplicate_whitespace(&mut tree),
    );
    run_stage(enabled("remove_empty_tags"), "remove empty tags", || {
        remove_empty_tags(&mut tree, &settings.empty_tags)
    });

    tree.assign_indexes();
    tree
}

fn run_stage(enabled: bool, name: &str, stage: impl FnOnce()) {
    if !enabled {
        return;
    }
    let start = Instant::now();
    stage();
    debug!("cleaner > {name} {:.3}s", start.elapsed().as_secs_f64());
}

/// Insert an `<img>` child for every tag styled with a background image so
/// downstream logic sees one uniform image shape.
fn inline_images(tree: &mut TagTree) {
    let Ok(url_regex) = Regex::new(r#"url\(\s*["']?([^"')]+)["']?\s*\)"#) else {
        return;
    };
    let Ok(background_regex) = Regex::new("background(-image)?") else {
        return;
    };

    for id in tree.element_ids() {
        let Some(style) = tree.element(id).and_then(|el| el.attr("style")) else {
            continue;
        };
        if !background_regex.is_match(style) {
            continue;
        }
        let Some(image_url) = url_regex.captures(style).and_then(|c| c.get(1)) else {
            continue;
        };

        let mut img = super::Element::new("img");
        img.attrs.insert("src".into(), image_url.as_str().to_string());
        tree.append_node(id, TagNode::Element(img));
    }
}

fn remove_comments(tree: &mut TagTree) {
    let comments: Vec<_> = tree
        .subtree_ids(tree.root_id())
        .into_iter()
        .filter(|&id| {
            tree.get(id)
                .map(|n| matches!(n.value(), TagNode::Comment(_)))
                .unwrap_or(false)
        })
        .collect();
    for id in comments {
        tree.detach(id);
    }
}

fn remove_invisible_tags(tree: &mut TagTree, invisible_tag_regex: &[String]) {
    let patterns: Vec<Regex> = invisible_tag_regex
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();

    for id in tree.element_ids() {
        if !tree.is_attached(id) {
            continue;
        }
        let Some(el) = tree.element(id) else { continue };

        let hidden = el.attrs.contains_key("hidden");
        let invisible_style = el
            .attr("style")
            .map(|style| patterns.iter().any(|p| p.is_match(style)))
            .unwrap_or(false);

        if hidden || invisible_style {
            tree.detach(id);
        }
    }
}

/// Excluded tags are replaced with a single whitespace so surrounding text
/// runs do not fuse together.
fn remove_excluded_tags(tree: &mut TagTree, excluded_tags: &[String]) {
    for id in tree.element_ids() {
        if !tree.is_attached(id) {
            continue;
        }
        let Some(name) = tree.element_name(id) else { continue };
        if !excluded_tags.iter().any(|t| t == name) {
            continue;
        }
        if let Some(mut node) = tree.get_mut(id) {
            node.insert_before(TagNode::Text(" ".into()));
            node.detach();
        }
    }
}

fn filter_attributes(tree: &mut TagTree, whitelisted_attributes: &[String]) {
    for id in tree.element_ids() {
        if let Some(mut node) = tree.get_mut(id)
            && let TagNode::Element(el) = node.value()
        {
            el.attrs
                .retain(|name, _| whitelisted_attributes.iter().any(|w| w == name));
        }
    }
}

/// Inline text tags (bold, emphasis, …) whose element descendants are all
/// themselves flattenable collapse into their text content.
fn flatten_text(tree: &mut TagTree, flattened_tags: &[String]) {
    for id in tree.element_ids() {
        if !tree.is_attached(id) {
            continue;
        }
        let Some(name) = tree.element_name(id) else { continue };
        if !flattened_tags.iter().any(|t| t == name) {
            continue;
        }

        let all_flattenable = tree.subtree_ids(id).into_iter().skip(1).all(|d| {
            match tree.element_name(d) {
                Some(child_name) => flattened_tags.iter().any(|t| t == child_name),
                None => true,
            }
        });

        if all_flattenable {
            tree.flatten_to_text(id);
        }
    }
}

/// For each configured marker string, collapse all siblings of the tag
/// holding it into one text run.
fn flatten_special_strings(tree: &mut TagTree, special_strings: &[String]) {
    for special in special_strings {
        let matches: Vec<_> = tree
            .text_ids()
            .into_iter()
            .filter(|&id| tree.node_text(id).map(|t| t == special).unwrap_or(false))
            .collect();

        for text_id in matches {
            if !tree.is_attached(text_id) {
                continue;
            }
            let Some(holder) = tree.parent(text_id) else { continue };
            let Some(grandparent) = tree.parent(holder) else { continue };
            let children: Vec<_> = tree
                .get(grandparent)
                .map(|n| n.children().map(|c| c.id()).collect())
                .unwrap_or_default();
            for child in children {
                if tree.is_attached(child) {
                    tree.flatten_to_text(child);
                }
            }
        }
    }
}

fn remove_redundant_punctuation(tree: &mut TagTree, marks: &[String]) {
    for mark in marks {
        let Ok(pattern) = Regex::new(&format!(r"\s*{}\s*", regex::escape(mark))) else {
            continue;
        };
        rewrite_matching_text(tree, &pattern, " ");
    }
}

fn remove_punctuation_whitespace(tree: &mut TagTree, marks: &[String]) {
    for mark in marks {
        let Ok(pattern) = Regex::new(&format!(r"\s+{}", regex::escape(mark))) else {
            continue;
        };
        rewrite_matching_text(tree, &pattern, mark);
    }
}

fn remove_duplicate_whitespace(tree: &mut TagTree) {
    let Ok(pattern) = Regex::new(r"[\s\x00]+") else {
        return;
    };
    rewrite_matching_text(tree, &pattern, " ");
}

fn rewrite_matching_text(tree: &mut TagTree, pattern: &Regex, replacement: &str) {
    for id in tree.text_ids() {
        let Some(text) = tree.node_text(id) else { continue };
        if pattern.is_match(text) {
            let rewritten = pattern.replace_all(text, replacement).into_owned();
            tree.set_node_text(id, rewritten);
        }
    }
}

/// Empty-tag removal is transitive: detaching a child can empty its parent,
/// so parents of removed tags are re-examined.
fn remove_empty_tags(tree: &mut TagTree, empty_tags: &[String]) {
    let mut queue: Vec<_> = tree.element_ids();
    let mut cursor = 0;

    while cursor < queue.len() {
        let id = queue[cursor];
        cursor += 1;

        if id == tree.root_id() || !tree.is_attached(id) {
            continue;
        }
        let Some(name) = tree.element_name(id).map(str::to_string) else {
            continue;
        };
        if empty_tags.iter().any(|t| t == &name) {
            continue;
        }

        if content_count(tree, id) == 0 {
            if let Some(parent) = tree.parent(id) {
                queue.push(parent);
            }
            tree.flatten_to_text(id);
        }
    }
}

fn content_count(tree: &TagTree, id: ego_tree::NodeId) -> usize {
    let Some(node) = tree.get(id) else { return 0 };
    node.children()
        .filter(|c| match c.value() {
            TagNode::Text(t) => !t.trim().is_empty(),
            TagNode::Element(_) => true,
            TagNode::Comment(_) => false,
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(source: &str) -> TagTree {
        clean_html(source, "https://example.com/", &CleanerSettings::default(), &[])
    }

    #[test]
    fn removes_every_comment() {
        let tree = clean("<html><body><div>keep<!-- drop me --><p>text<!-- and me --></p></div></body></html>");
        assert!(!tree.to_html().contains("drop me"));
        assert!(!tree.to_html().contains("and me"));
        assert!(tree.to_html().contains("keep"));
    }

    #[test]
    fn inlines_class_declarations_into_style() {
        let tree = clean(concat!(
            "<html><head><style>.price { color: red }</style></head>",
            "<body><div class=\"price\">100</div></body></html>",
        ));
        let div = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("div"))
            .expect("div survives");
        let style = tree.element(div).and_then(|el| el.attr("style")).unwrap_or("");
        assert!(style.contains("color"), "style attribute carries the declaration: {style:?}");
    }

    #[test]
    fn removes_hidden_and_styled_invisible_tags() {
        let tree = clean(concat!(
            "<html><body><div hidden>gone</div>",
            "<div style=\"display: none\">also gone</div>",
            "<div style=\"visibility:hidden\">gone too</div>",
            "<div>visible</div></body></html>",
        ));
        let html = tree.to_html();
        assert!(!html.contains("gone"));
        assert!(html.contains("visible"));
    }

    #[test]
    fn retains_only_whitelisted_attributes() {
        let tree = clean(
            "<html><body><a href=\"/x\" data-tracking=\"abc\" onclick=\"evil()\">link</a></body></html>",
        );
        let a = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("a"))
            .expect("anchor survives");
        let el = tree.element(a).expect("element");
        assert_eq!(el.attr("href"), Some("/x"));
        assert!(el.attr("data-tracking").is_none());
        assert!(el.attr("onclick").is_none());
    }

    #[test]
    fn scraper_index_survives_cleaning() {
        let tree = clean("<html><body><div><p>a</p></div><div><p>b</p></div></body></html>");
        let ids = tree.element_ids();
        for (expected, id) in ids.iter().enumerate() {
            assert_eq!(tree.scraper_index(*id), Some(expected));
        }
    }

    #[test]
    fn normalizes_punctuation_whitespace() {
        let tree = clean("<html><body><p>SPACE HERE !</p></body></html>");
        let p = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("p"))
            .expect("paragraph survives");
        assert_eq!(tree.text_content(p), "SPACE HERE!");
    }

    #[test]
    fn collapses_duplicate_whitespace() {
        let tree = clean("<html><body><p>a  \t\n   b</p></body></html>");
        let p = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("p"))
            .expect("paragraph survives");
        assert_eq!(tree.text_content(p), "a b");
    }

    #[test]
    fn removes_empty_tags_transitively() {
        let tree = clean("<html><body><div><span></span></div><p>kept</p></body></html>");
        let html = tree.to_html();
        assert!(!html.contains("<span"));
        assert!(!html.contains("<div"));
        assert!(html.contains("kept"));
    }

    #[test]
    fn keeps_empty_allowed_tags() {
        let tree = clean("<html><body><p><img src=\"x.png\"></p></body></html>");
        assert!(tree.to_html().contains("<img"));
    }

    #[test]
    fn excluded_tags_become_whitespace() {
        let tree = clean("<html><body><p>a<script>var x = 1;</script>b</p></body></html>");
        let p = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("p"))
            .expect("paragraph survives");
        assert!(!tree.to_html().contains("var x"));
        assert_eq!(tree.text_content(p), "a b");
    }

    #[test]
    fn inlines_background_images() {
        let tree = clean_html(
            "<html><body><div style=\"background-image: url('https://cdn.example.com/car.jpg')\">x</div></body></html>",
            "https://example.com/",
            &CleanerSettings::default(),
            &["remove_non_whitelisted_attributes".into()],
        );
        let img = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("img"));
        let img = img.expect("img child inserted");
        assert_eq!(
            tree.element(img).and_then(|el| el.attr("src")),
            Some("https://cdn.example.com/car.jpg")
        );
    }

    #[test]
    fn ignored_steps_are_skipped() {
        let tree = clean_html(
            "<html><body><p>keep<!-- comment --></p></body></html>",
            "https://example.com/",
            &CleanerSettings::default(),
            &["remove_comments".into()],
        );
        assert!(tree.to_html().contains("comment"));
    }
}
