//! Block finding
//!
//! Groups the tagger's annotations into record blocks: prune untagged
//! subtrees, descend breadth-first to the smallest subtrees that still
//! carry every required attribute, widen each to its true record boundary,
//! drop anything touching an anti-attribute, parse one typed record per
//! block, and keep the largest spatially-coherent group.

pub mod parser;

pub use parser::AttrValue;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use ego_tree::NodeId;
use tracing::{debug, warn};

use crate::dom::TagTree;
use crate::images::ImageContext;
use crate::settings::rules::{AttributeRule, ValueKind};
use crate::tagger::Annotations;

/// A subtree selected as one record candidate, with its parsed values.
#[derive(Debug, Clone)]
pub struct Block {
    pub node: NodeId,
    /// Owning tag's scraper index.
    pub index: usize,
    pub values: HashMap<String, AttrValue>,
    pub group_id: Option<usize>,
    /// Scraper index of the group's common ancestor.
    pub parent: Option<usize>,
}

impl Block {
    pub fn alias(&self) -> Option<&str> {
        self.values.get("alias").and_then(AttrValue::as_text)
    }

    pub fn empty_field_count(&self) -> usize {
        self.values
            .iter()
            .filter(|(name, value)| *name != "unavailable" && value.is_empty())
            .count()
    }
}

/// Options steering one block-finding pass.
pub struct FindOptions<'a> {
    pub rules: &'a [AttributeRule],
    pub max_tag_distance: usize,
    /// Keep only the first block and fold its non-block siblings into it
    /// (detail pages).
    pub prioritize_first: bool,
    /// Alias of the record a detail page is about.
    pub record_alias: Option<&'a str>,
    pub images: &'a ImageContext,
}

/// Find the record blocks on a page that are not already known, keyed by
/// alias. The fallback annotation set is promoted and the search repeated
/// when the primary set yields nothing.
pub async fn find_new_blocks(
    tree: &mut TagTree,
    annotations: &Annotations,
    options: &FindOptions<'_>,
    records: &HashMap<String, Block>,
) -> Vec<Block> {
    let mut found = find_blocks(tree, annotations, options).await;

    if found.is_empty() {
        let mut promoted = annotations.clone();
        promoted.promote_fallback();
        found = find_blocks(tree, &promoted, options).await;
    }

    let unique = merge_duplicates(found);
    let largest = largest_group(tree, unique, options.max_tag_distance);

    largest
        .into_iter()
        .filter(|block| match block.alias() {
            Some(alias) => !records.contains_key(alias),
            None => true,
        })
        .collect()
}

/// One full block-finding pass over the annotated tree.
pub async fn find_blocks(
    tree: &mut TagTree,
    annotations: &Annotations,
    options: &FindOptions<'_>,
) -> Vec<Block> {
    let required = required_attributes(options.rules);
    let anti = anti_attributes(options.rules);

    let mut annotations = annotations.clone();

    prune_untagged(tree, &annotations);
    let blocks = soup_to_blocks(tree, &annotations, &required);
    let mut moved: Vec<NodeId> = blocks
        .into_iter()
        .map(|block| move_up_block(tree, &annotations, block, &required))
        .collect();

    if options.prioritize_first && !moved.is_empty() {
        let first = moved[0];
        absorb_non_block_siblings(tree, &mut annotations, first, &moved);
        moved.truncate(1);
    }

    let culled: Vec<NodeId> = moved
        .into_iter()
        .filter(|&block| !has_anti_attributes(tree, &annotations, block, &anti))
        .collect();

    parse_blocks(tree, &annotations, &culled, options).await
}

fn required_attributes(rules: &[AttributeRule]) -> Vec<String> {
    rules
        .iter()
        .filter(|r| r.required)
        .map(|r| r.name.clone())
        .collect()
}

fn anti_attributes(rules: &[AttributeRule]) -> Vec<String> {
    rules
        .iter()
        .filter(|r| r.anti_attribute)
        .map(|r| r.name.clone())
        .collect()
}

/// Detach every element that never received an annotation; what remains is
/// exactly the ancestors of annotated tags.
fn prune_untagged(tree: &mut TagTree, annotations: &Annotations) {
    let start = Instant::now();
    for id in tree.element_ids() {
        if id == tree.root_id() || !tree.is_attached(id) {
            continue;
        }
        let tagged = tree
            .scraper_index(id)
            .map(|index| annotations.is_tagged(index))
            .unwrap_or(false);
        if !tagged {
            tree.detach(id);
        }
    }
    debug!("block finder > prune untagged {:.3}s", start.elapsed().as_secs_f64());
}

/// A tag whose subtree carries every required attribute, in either the
/// primary or fallback counts.
fn has_required_attributes(
    tree: &TagTree,
    annotations: &Annotations,
    id: NodeId,
    required: &[String],
) -> bool {
    let Some(index) = tree.scraper_index(id) else {
        return false;
    };
    required.iter().all(|name| annotations.has_count(index, name))
}

fn has_anti_attributes(
    tree: &TagTree,
    annotations: &Annotations,
    id: NodeId,
    anti: &[String],
) -> bool {
    let Some(index) = tree.scraper_index(id) else {
        return false;
    };
    anti.iter().any(|name| annotations.has_primary_count(index, name))
}

/// Breadth-first descent: a tag is a block when none of its children still
/// satisfies the required set on its own. Leaves first.
fn soup_to_blocks(tree: &TagTree, annotations: &Annotations, required: &[String]) -> Vec<NodeId> {
    let start = Instant::now();
    let mut blocks = Vec::new();
    let mut queue = vec![tree.root_id()];
    let mut cursor = 0;

    while cursor < queue.len() {
        let id = queue[cursor];
        cursor += 1;

        let mut is_block = true;
        for child in tree.element_children(id) {
            if has_required_attributes(tree, annotations, child, required) {
                queue.push(child);
                is_block = false;
            }
        }
        if is_block {
            blocks.push(id);
        }
    }

    debug!("block finder > soup to blocks {:.3}s", start.elapsed().as_secs_f64());
    blocks
}

/// Widen a block to its record boundary: ascend while the parent is
/// single-child or no sibling is a competing record (required-complete
/// with a different alias).
fn move_up_block(
    tree: &TagTree,
    annotations: &Annotations,
    mut block: NodeId,
    required: &[String],
) -> NodeId {
    loop {
        let Some(parent) = tree.parent(block) else {
            return block;
        };
        if tree.element_name(block) == Some("body") {
            return block;
        }

        let siblings = tree.element_children(parent);
        if siblings.len() > 1 {
            let block_alias = subtree_alias(tree, annotations, block);
            for sibling in &siblings {
                if *sibling == block {
                    continue;
                }
                if !has_required_attributes(tree, annotations, *sibling, required) {
                    continue;
                }
                let sibling_alias = subtree_alias(tree, annotations, *sibling);
                if sibling_alias.is_some() && sibling_alias != block_alias {
                    return block;
                }
            }
        }

        block = parent;
    }
}

fn subtree_alias(tree: &TagTree, annotations: &Annotations, id: NodeId) -> Option<String> {
    collect_values(tree, annotations, id, "alias").into_iter().next()
}

/// Collect a rule's annotated values across a subtree: the primary set
/// first, falling back to the fallback set only when the primary one is
/// empty.
fn collect_values(tree: &TagTree, annotations: &Annotations, id: NodeId, name: &str) -> Vec<String> {
    let ids = tree.subtree_ids(id);

    let primary: Vec<String> = ids
        .iter()
        .filter_map(|&node| tree.scraper_index(node))
        .filter_map(|index| annotations.primary_values(index, name))
        .flatten()
        .cloned()
        .collect();
    if !primary.is_empty() {
        return primary;
    }

    ids.iter()
        .filter_map(|&node| tree.scraper_index(node))
        .filter_map(|index| annotations.fallback_values(index, name))
        .flatten()
        .cloned()
        .collect()
}

/// Fold the non-block siblings of a detail page's first block into it,
/// merging their counts, so loose spec rows around the block contribute
/// their values.
fn absorb_non_block_siblings(
    tree: &mut TagTree,
    annotations: &mut Annotations,
    block: NodeId,
    blocks: &[NodeId],
) {
    let Some(parent) = tree.parent(block) else {
        return;
    };
    let block_index = tree.scraper_index(block);

    let siblings: Vec<NodeId> = tree
        .element_children(parent)
        .into_iter()
        .filter(|id| !blocks.contains(id))
        .collect();

    for sibling in siblings {
        let sibling_index = tree.scraper_index(sibling);
        tree.append_existing(block, sibling);
        if let (Some(from), Some(into)) = (sibling_index, block_index) {
            annotations.merge_counts_into(from, into);
        }
    }
}

/// Parse the entire tree as one block: the detail scraper's fuzzy
/// whole-body fallback.
pub async fn parse_root_block(
    tree: &TagTree,
    annotations: &Annotations,
    options: &FindOptions<'_>,
) -> Option<Block> {
    parse_block(tree, annotations, tree.root_id(), options).await
}

async fn parse_blocks(
    tree: &TagTree,
    annotations: &Annotations,
    blocks: &[NodeId],
    options: &FindOptions<'_>,
) -> Vec<Block> {
    let start = Instant::now();
    let mut parsed = Vec::new();

    for &block in blocks {
        if let Some(parsed_block) = parse_block(tree, annotations, block, options).await {
            parsed.push(parsed_block);
        }
    }

    debug!("block finder > parse blocks {:.3}s", start.elapsed().as_secs_f64());
    parsed
}

async fn parse_block(
    tree: &TagTree,
    annotations: &Annotations,
    block: NodeId,
    options: &FindOptions<'_>,
) -> Option<Block> {
    let index = tree.scraper_index(block)?;
    let mut values = HashMap::new();

    for rule in options.rules {
        let raw = collect_values(tree, annotations, block, &rule.name);

        if raw.is_empty() {
            let value = match &rule.default {
                Some(default) => AttrValue::Text(default.clone()),
                None => AttrValue::Null,
            };
            values.insert(rule.name.clone(), value);
            continue;
        }

        if rule.kind == ValueKind::ImageLink {
            // Records that already have an image skip the download entirely.
            let alias = options
                .record_alias
                .map(str::to_string)
                .or_else(|| values.get("alias").and_then(AttrValue::as_text).map(str::to_string));
            let already_imaged = alias
                .map(|a| options.images.records_with_images.contains(&a))
                .unwrap_or(false);
            if options.images.enabled && !already_imaged {
                values.insert(rule.name.clone(), parser::parse_image(options.images, &raw).await);
            }
            continue;
        }

        values.insert(rule.name.clone(), parser::parse_attribute(rule, &raw));
    }

    Some(Block {
        node: block,
        index,
        values,
        group_id: None,
        parent: None,
    })
}

/// First block with a given alias wins; later duplicates are dropped.
fn merge_duplicates(blocks: Vec<Block>) -> Vec<Block> {
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for block in blocks {
        let alias = block.alias().unwrap_or_default().to_string();
        if seen.insert(alias) {
            unique.push(block);
        }
    }
    unique
}

/// Group blocks by pairwise DOM distance and keep the biggest group; its
/// members learn their common ancestor's scraper index as `parent`.
pub fn largest_group(tree: &TagTree, mut blocks: Vec<Block>, max_tag_distance: usize) -> Vec<Block> {
    if blocks.is_empty() {
        return blocks;
    }
    let start = Instant::now();

    let mut group_count = 0;
    for i in 0..blocks.len() {
        if blocks[i].group_id.is_some() {
            continue;
        }
        let anchor = blocks[i].node;
        for j in 0..blocks.len() {
            if blocks[j].group_id.is_none()
                && tree.distance(anchor, blocks[j].node) <= max_tag_distance
            {
                blocks[j].group_id = Some(group_count);
            }
        }
        group_count += 1;
    }

    let mut best_group = 0;
    let mut best_size = 0;
    for group in 0..group_count {
        let size = blocks.iter().filter(|b| b.group_id == Some(group)).count();
        if size > best_size {
            best_size = size;
            best_group = group;
        }
    }

    let mut winners: Vec<Block> = blocks
        .into_iter()
        .filter(|b| b.group_id == Some(best_group))
        .collect();

    let nodes: Vec<NodeId> = winners.iter().map(|b| b.node).collect();
    let parent_index = match tree.common_ancestor(&nodes) {
        Some(ancestor) => tree.scraper_index(ancestor),
        None => {
            warn!("could not find a common parent for the block group");
            None
        }
    };
    for block in &mut winners {
        block.parent = parent_index;
    }

    debug!("block finder > largest group {:.3}s", start.elapsed().as_secs_f64());
    winners
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::clean_html;
    use crate::dom::clean::CleanerSettings;
    use crate::settings::table_cache::StaticTables;
    use crate::tagger::tag_values;

    fn rule(name: &str, examples: &[&str], required: bool) -> AttributeRule {
        AttributeRule {
            name: name.into(),
            examples: Some(examples.iter().map(|s| s.to_string()).collect()),
            text: true,
            required,
            ..Default::default()
        }
    }

    fn listing_page() -> String {
        let mut rows = String::new();
        for i in 1..=4 {
            rows.push_str(&format!(
                "<div class=\"card\"><span>car-{i}</span><span>1{i}00 €</span></div>"
            ));
        }
        format!("<html><body><header>menu</header><main>{rows}</main><footer>legal</footer></body></html>")
    }

    async fn run_find(source: &str, rules: &[AttributeRule]) -> Vec<Block> {
        let mut tree = clean_html(source, "https://example.com/", &CleanerSettings::default(), &[]);
        let annotations = tag_values(&mut tree, rules, &StaticTables::default(), 3);
        let images = ImageContext::disabled();
        let options = FindOptions {
            rules,
            max_tag_distance: 5,
            prioritize_first: false,
            record_alias: None,
            images: &images,
        };
        find_new_blocks(&mut tree, &annotations, &options, &HashMap::new()).await
    }

    #[tokio::test]
    async fn finds_one_block_per_listing_card() {
        let rules = vec![
            rule("alias", &["car-1", "car-2", "car-3", "car-4"], true),
            AttributeRule {
                name: "price".into(),
                regex: Some(r"\d{4} €".into()),
                text: true,
                required: true,
                kind: ValueKind::Float,
                ..Default::default()
            },
        ];
        let blocks = run_find(&listing_page(), &rules).await;
        assert_eq!(blocks.len(), 4);

        let aliases: Vec<_> = blocks.iter().filter_map(Block::alias).collect();
        assert_eq!(aliases, vec!["car-1", "car-2", "car-3", "car-4"]);
        assert_eq!(
            blocks[0].values.get("price"),
            Some(&AttrValue::Float(1100.0))
        );
        let parent = blocks[0].parent.expect("group parent assigned");
        assert!(blocks.iter().all(|b| b.parent == Some(parent)));
    }

    #[tokio::test]
    async fn known_aliases_are_filtered_out() {
        let rules = vec![rule("alias", &["car-1", "car-2", "car-3", "car-4"], true)];
        let mut tree = clean_html(&listing_page(), "https://example.com/", &CleanerSettings::default(), &[]);
        let annotations = tag_values(&mut tree, &rules, &StaticTables::default(), 3);
        let images = ImageContext::disabled();
        let options = FindOptions {
            rules: &rules,
            max_tag_distance: 5,
            prioritize_first: false,
            record_alias: None,
            images: &images,
        };

        let first = find_new_blocks(&mut tree.clone(), &annotations, &options, &HashMap::new()).await;
        let known: HashMap<String, Block> = first
            .into_iter()
            .filter_map(|b| b.alias().map(|a| (a.to_string(), b.clone())))
            .collect();

        let second = find_new_blocks(&mut tree, &annotations, &options, &known).await;
        assert!(second.is_empty(), "already-known aliases are not re-reported");
    }

    #[tokio::test]
    async fn anti_attributes_cull_blocks() {
        let mut rules = vec![rule("alias", &["car-1", "car-2", "car-3", "car-4"], true)];
        rules.push(AttributeRule {
            name: "sold_banner".into(),
            examples: Some(vec!["car-2".into()]),
            text: false,
            anti_attribute: true,
            ..Default::default()
        });
        // The banner rule matches inside card 2's class attribute.
        let source = listing_page().replace(
            "<div class=\"card\"><span>car-2</span>",
            "<div class=\"card\" title=\"car-2\"><span>car-2</span>",
        );
        rules[1].attribute_regex = Some("title".into());
        let blocks = run_find(&source, &rules).await;
        let aliases: Vec<_> = blocks.iter().filter_map(Block::alias).collect();
        assert!(!aliases.contains(&"car-2"), "anti-attribute block culled: {aliases:?}");
    }

    #[tokio::test]
    async fn fallback_annotations_drive_block_finding() {
        let rules = vec![AttributeRule {
            name: "alias".into(),
            examples: Some(vec!["car-1".into(), "car-2".into(), "car-3".into(), "car-4".into()]),
            text: true,
            required: true,
            fallback: true,
            ..Default::default()
        }];
        let blocks = run_find(&listing_page(), &rules).await;
        assert_eq!(blocks.len(), 4, "fallback annotations drive block finding when promoted");
    }

    #[tokio::test]
    async fn duplicate_aliases_coalesce_first_wins() {
        let source = concat!(
            "<html><body><main>",
            "<div class=\"card\"><span>car-1</span><i>first</i></div>",
            "<div class=\"card\"><span>car-1</span><i>second</i></div>",
            "</main></body></html>",
        );
        let rules = vec![rule("alias", &["car-1"], true)];
        let blocks = run_find(source, &rules).await;
        assert_eq!(blocks.len(), 1);
    }
}
