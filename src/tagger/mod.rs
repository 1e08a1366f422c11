//! Value tagging
//!
//! Applies the declared attribute rules to a cleaned tree: every position a
//! rule matches is recorded as an annotation and the matched literal is
//! replaced with the rule's `$NAME$` sentinel so later rules cannot claim
//! the same token. Annotations never touch the DOM: they live in a side
//! table keyed by `scraper_index`, with per-rule counts accumulated up the
//! ancestor chain so the block finder can test subtrees cheaply.

use std::collections::HashMap;

use ego_tree::NodeId;
use regex::Regex;
use tracing::debug;

use crate::dom::{TagNode, TagTree};
use crate::settings::rules::{AttributeRule, format_sentinel};
use crate::settings::table_cache::TableLookup;

/// Per-rule annotation values and subtree counts, keyed by scraper index.
#[derive(Debug, Clone, Default)]
pub struct Annotations {
    data: HashMap<usize, HashMap<String, Vec<String>>>,
    fallback: HashMap<usize, HashMap<String, Vec<String>>>,
    counts: HashMap<usize, HashMap<String, u32>>,
    fallback_counts: HashMap<usize, HashMap<String, u32>>,
}

impl Annotations {
    /// Record a matched value for `rule` at the element owning `node`
    /// (text nodes annotate their parent element). Counts are bumped at
    /// the element and every element ancestor.
    pub fn add(&mut self, tree: &TagTree, node: NodeId, rule: &AttributeRule, name: &str, value: String) {
        let Some(element) = owning_element(tree, node) else {
            return;
        };
        let Some(index) = tree.scraper_index(element) else {
            return;
        };

        let mut value = value;
        if rule.aggregate {
            value = self.substitute_placeholders(index, value);
        }
        if let Some(prefix) = &rule.prefix {
            value = format!("{prefix}{value}");
        }

        let store = if rule.fallback { &mut self.fallback } else { &mut self.data };
        store
            .entry(index)
            .or_default()
            .entry(name.to_string())
            .or_default()
            .push(value);

        let counts = if rule.fallback {
            &mut self.fallback_counts
        } else {
            &mut self.counts
        };
        let mut current = Some(element);
        while let Some(id) = current {
            if let Some(ancestor_index) = tree.scraper_index(id) {
                *counts
                    .entry(ancestor_index)
                    .or_default()
                    .entry(name.to_string())
                    .or_insert(0) += 1;
            }
            current = tree.parent(id);
        }
    }

    /// Replace `$NAME$` placeholders in an aggregate value with the first
    /// non-empty value already annotated for that name on the same tag.
    fn substitute_placeholders(&self, index: usize, mut value: String) -> String {
        let Ok(token_regex) = Regex::new(r"\$[A-Z_]+\$") else {
            return value;
        };
        let tokens: Vec<String> = token_regex
            .find_iter(&value)
            .map(|m| m.as_str().to_string())
            .collect();
        for token in tokens {
            let key = token[1..token.len() - 1].to_lowercase();
            if let Some(replacement) = self
                .data
                .get(&index)
                .and_then(|m| m.get(&key))
                .and_then(|values| values.iter().find(|v| !v.is_empty()))
            {
                value = value.replace(&token, replacement);
            }
        }
        value
    }

    pub fn primary_values(&self, index: usize, name: &str) -> Option<&[String]> {
        self.data.get(&index).and_then(|m| m.get(name)).map(Vec::as_slice)
    }

    pub fn fallback_values(&self, index: usize, name: &str) -> Option<&[String]> {
        self.fallback.get(&index).and_then(|m| m.get(name)).map(Vec::as_slice)
    }

    /// True when the tag carries any annotation counts at all.
    pub fn is_tagged(&self, index: usize) -> bool {
        self.counts.contains_key(&index) || self.fallback_counts.contains_key(&index)
    }

    /// Names present in the union of primary and fallback counts at a tag.
    pub fn has_count(&self, index: usize, name: &str) -> bool {
        self.counts
            .get(&index)
            .map(|m| m.contains_key(name))
            .unwrap_or(false)
            || self
                .fallback_counts
                .get(&index)
                .map(|m| m.contains_key(name))
                .unwrap_or(false)
    }

    /// Names present in the primary counts only (anti-attribute culling).
    pub fn has_primary_count(&self, index: usize, name: &str) -> bool {
        self.counts
            .get(&index)
            .map(|m| m.contains_key(name))
            .unwrap_or(false)
    }

    /// Fold one tag's counts into another (detail-page sibling merging).
    pub fn merge_counts_into(&mut self, from: usize, into: usize) {
        for (source, target) in [
            (self.counts.get(&from).cloned(), &mut self.counts),
            (self.fallback_counts.get(&from).cloned(), &mut self.fallback_counts),
        ] {
            if let Some(source) = source {
                let entry = target.entry(into).or_default();
                for (name, count) in source {
                    *entry.entry(name).or_insert(0) += count;
                }
            }
        }
    }

    /// Promote the fallback set to primary: merge `fallback → data` and
    /// `fallbackCounts → counts`. Used when the primary set yields no
    /// blocks at all.
    pub fn promote_fallback(&mut self) {
        let fallback = std::mem::take(&mut self.fallback);
        for (index, values) in fallback {
            let entry = self.data.entry(index).or_default();
            for (name, mut list) in values {
                entry.entry(name).or_default().append(&mut list);
            }
        }
        let fallback_counts = std::mem::take(&mut self.fallback_counts);
        for (index, counts) in fallback_counts {
            let entry = self.counts.entry(index).or_default();
            for (name, count) in counts {
                *entry.entry(name).or_insert(0) += count;
            }
        }
    }
}

/// Tag every rule's matches into the tree, returning the annotation table.
///
/// Rules run in declaration order; the sentinel replacement is what makes
/// that order compose: earlier rules claim tokens before later ones, and
/// aggregate rules must follow the rules they reference.
pub fn tag_values(
    tree: &mut TagTree,
    rules: &[AttributeRule],
    tables: &dyn TableLookup,
    max_label_distance: usize,
) -> Annotations {
    let mut annotations = Annotations::default();

    for rule in rules {
        if rule.labeled {
            let label_rule = label_helper_rule(rule);
            apply_example_rule(tree, &mut annotations, &label_rule, tables, max_label_distance);
        }

        if rule.is_example_driven() {
            apply_example_rule(tree, &mut annotations, rule, tables, max_label_distance);
        }
        if rule.is_regex_driven() {
            apply_regex_rule(tree, &mut annotations, rule, tables, max_label_distance);
        }
    }

    annotations
}

/// Synthetic `<name>_label` rule so label positions are themselves tagged
/// and retrievable during the labeled-distance check.
fn label_helper_rule(rule: &AttributeRule) -> AttributeRule {
    AttributeRule {
        name: format!("{}_label", rule.name),
        examples: Some(rule.labels.clone()),
        regex: None,
        table_source: None,
        text: rule.text,
        attribute_regex: rule.attribute_regex.clone(),
        ignore_case: rule.ignore_case,
        reorder_examples: rule.reorder_examples,
        labeled: false,
        labels: Vec::new(),
        required: false,
        anti_attribute: false,
        fallback: false,
        exclusive: false,
        filter_regex: None,
        prefix: None,
        replace_similar: false,
        aggregate: false,
        translations: None,
        conversions: Vec::new(),
        constraints: None,
        default: None,
        kind: rule.kind,
    }
}

fn apply_example_rule(
    tree: &mut TagTree,
    annotations: &mut Annotations,
    rule: &AttributeRule,
    tables: &dyn TableLookup,
    max_label_distance: usize,
) {
    let mut examples = match (&rule.table_source, &rule.examples) {
        (Some(table), _) => tables.table_values(table),
        (None, Some(examples)) => examples.clone(),
        (None, None) => return,
    };

    if rule.reorder_examples {
        examples.sort_by_key(|e| std::cmp::Reverse(e.len()));
    }

    let filter = compile_filter(rule);

    for example in &examples {
        if example.is_empty() {
            continue;
        }
        let Some(pattern) = compile_rule_regex(rule, &format!(r"\b{}\b", regex::escape(example))) else {
            continue;
        };

        if rule.text {
            replace_in_text(tree, annotations, rule, &pattern, filter.as_ref(), max_label_distance);
        }
        if rule.attribute_regex.is_some() {
            replace_in_attributes(tree, annotations, rule, &pattern, filter.as_ref(), max_label_distance);
        }
    }
}

fn apply_regex_rule(
    tree: &mut TagTree,
    annotations: &mut Annotations,
    rule: &AttributeRule,
    tables: &dyn TableLookup,
    max_label_distance: usize,
) {
    let Some(source) = &rule.regex else { return };
    let Some(pattern) = compile_rule_regex(rule, source) else {
        debug!("rule {} carries an uncompilable regex, skipping", rule.name);
        return;
    };
    let filter = compile_filter(rule);

    let mut similar = Vec::new();
    if rule.text {
        let found = replace_in_text(tree, annotations, rule, &pattern, filter.as_ref(), max_label_distance);
        similar.extend(found);
    }
    if rule.attribute_regex.is_some() {
        let found =
            replace_in_attributes(tree, annotations, rule, &pattern, filter.as_ref(), max_label_distance);
        similar.extend(found);
    }

    // A value found once by regex becomes an exact-match example everywhere:
    // the same VIN in a title and a data attribute both end up tagged.
    if rule.replace_similar && !similar.is_empty() {
        let similar_rule = AttributeRule {
            regex: None,
            table_source: None,
            examples: Some(similar),
            labeled: false,
            labels: Vec::new(),
            replace_similar: false,
            filter_regex: None,
            ..rule.clone()
        };
        apply_example_rule(tree, annotations, &similar_rule, tables, max_label_distance);
    }
}

/// Tag matches inside text nodes; returns the matched literals.
fn replace_in_text(
    tree: &mut TagTree,
    annotations: &mut Annotations,
    rule: &AttributeRule,
    pattern: &fancy_regex::Regex,
    filter: Option<&fancy_regex::Regex>,
    max_label_distance: usize,
) -> Vec<String> {
    let mut matched = Vec::new();

    for text_id in tree.text_ids() {
        let Some(text) = tree.node_text(text_id).map(str::to_string) else {
            continue;
        };
        let Ok(Some(found)) = pattern.find(&text) else { continue };

        if rule.labeled && !has_label(tree, rule, text_id, pattern, max_label_distance) {
            continue;
        }
        if rule.exclusive && name_appears_nearby(rule, &text) {
            continue;
        }

        let mut found_text = found.as_str().to_string();
        if let Some(filter) = filter {
            found_text = filter_result(&found_text, filter);
        }
        if found_text.is_empty() {
            continue;
        }

        annotations.add(tree, text_id, rule, &rule.name, found_text.clone());

        let sentinel = format_sentinel(&rule.name);
        let rewritten = format!(
            "{}{}{}",
            &text[..found.start()],
            sentinel,
            &text[found.start() + found_text.len()..]
        );
        tree.set_node_text(text_id, rewritten);
        matched.push(found_text);
    }

    matched
}

/// Tag matches inside attributes whose name matches the rule's
/// `attribute_regex`; returns the matched literals.
fn replace_in_attributes(
    tree: &mut TagTree,
    annotations: &mut Annotations,
    rule: &AttributeRule,
    pattern: &fancy_regex::Regex,
    filter: Option<&fancy_regex::Regex>,
    max_label_distance: usize,
) -> Vec<String> {
    let Some(attr_source) = &rule.attribute_regex else {
        return Vec::new();
    };
    let Ok(attr_pattern) = Regex::new(attr_source) else {
        return Vec::new();
    };

    let mut matched = Vec::new();

    for id in tree.element_ids() {
        let Some(el) = tree.element(id) else { continue };
        let attrs: Vec<(String, String)> = el
            .attrs
            .iter()
            .filter(|(name, _)| attr_pattern.is_match(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        for (attr_name, attr_value) in attrs {
            let Ok(Some(found)) = pattern.find(&attr_value) else { continue };

            if rule.labeled && !has_label(tree, rule, id, pattern, max_label_distance) {
                continue;
            }

            let mut found_text = found.as_str().to_string();
            if let Some(filter) = filter {
                found_text = filter_result(&found_text, filter);
            }
            if found_text.is_empty() {
                continue;
            }

            annotations.add(tree, id, rule, &rule.name, found_text.clone());

            let sentinel = format_sentinel(&rule.name);
            let rewritten = attr_value.replace(&found_text, &sentinel).trim().to_string();
            if let Some(mut node) = tree.get_mut(id)
                && let TagNode::Element(el) = node.value()
            {
                el.attrs.insert(attr_name, rewritten);
            }
            matched.push(found_text);
        }
    }

    matched
}

/// A labeled match counts only when a tagged label sits within
/// `max_label_distance` ancestors and precedes the value in document order
/// (textually, when both share one text node).
fn has_label(
    tree: &TagTree,
    rule: &AttributeRule,
    value_node: NodeId,
    value_pattern: &fancy_regex::Regex,
    max_label_distance: usize,
) -> bool {
    let label_sentinel = format_sentinel(&format!("{}_label", rule.name));
    let Some(mut target) = owning_element(tree, value_node) else {
        return false;
    };

    for _ in 0..=max_label_distance {
        for candidate in tree.subtree_ids(target) {
            let Some(text) = tree.node_text(candidate) else { continue };
            let Some(label_pos) = text.find(&label_sentinel) else { continue };

            if candidate == value_node {
                if let Ok(Some(value_match)) = value_pattern.find(text)
                    && label_pos < value_match.start()
                {
                    return true;
                }
            } else if tree.precedes(target, candidate, value_node) {
                return true;
            }
        }

        match tree.parent(target) {
            Some(parent) => target = parent,
            None => return false,
        }
    }

    false
}

/// Exclusive rules skip text that spells out the attribute's own name -
/// "price" next to a number usually marks a different field's label.
fn name_appears_nearby(rule: &AttributeRule, text: &str) -> bool {
    compile_rule_regex(rule, &format!(r"\b{}\b", regex::escape(&rule.name)))
        .map(|p| matches!(p.find(text), Ok(Some(_))))
        .unwrap_or(false)
}

/// Truncate a match at the first occurrence of the filter pattern.
fn filter_result(result: &str, filter: &fancy_regex::Regex) -> String {
    match filter.find(result) {
        Ok(Some(found)) => result[..found.start()].trim().to_string(),
        _ => result.to_string(),
    }
}

fn compile_filter(rule: &AttributeRule) -> Option<fancy_regex::Regex> {
    rule.filter_regex
        .as_ref()
        .and_then(|f| compile_rule_regex(rule, f))
}

fn compile_rule_regex(rule: &AttributeRule, source: &str) -> Option<fancy_regex::Regex> {
    fancy_regex::RegexBuilder::new(source)
        .case_insensitive(rule.ignore_case)
        .build()
        .ok()
}

fn owning_element(tree: &TagTree, node: NodeId) -> Option<NodeId> {
    match tree.get(node)?.value() {
        TagNode::Element(_) => Some(node),
        _ => tree.parent(node),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::table_cache::StaticTables;

    fn text_rule(name: &str, examples: &[&str]) -> AttributeRule {
        AttributeRule {
            name: name.into(),
            examples: Some(examples.iter().map(|s| s.to_string()).collect()),
            text: true,
            ..Default::default()
        }
    }

    fn paragraph_text(tree: &TagTree) -> String {
        let p = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("p"))
            .expect("paragraph present");
        tree.text_content(p)
    }

    fn tagged_tree(source: &str, rules: &[AttributeRule]) -> (TagTree, Annotations) {
        let mut tree = TagTree::parse(source);
        tree.assign_indexes();
        let annotations = tag_values(&mut tree, rules, &StaticTables::default(), 3);
        (tree, annotations)
    }

    #[test]
    fn example_match_replaces_with_sentinel_and_annotates() {
        let (tree, annotations) = tagged_tree(
            "<html><body><p>Label REPLACE ME goes here</p></body></html>",
            &[text_rule("test", &["REPLACE ME"])],
        );

        assert_eq!(paragraph_text(&tree), "Label $TEST$ goes here");

        let p_index = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("p"))
            .and_then(|id| tree.scraper_index(id))
            .expect("paragraph indexed");
        assert_eq!(
            annotations.primary_values(p_index, "test"),
            Some(&["REPLACE ME".to_string()][..])
        );
    }

    #[test]
    fn ignore_case_matches_lowercase() {
        let mut rule = text_rule("test", &["REPLACE ME"]);
        rule.ignore_case = true;
        let (tree, _) = tagged_tree("<html><body><p>please replace me now</p></body></html>", &[rule]);
        assert_eq!(paragraph_text(&tree), "please $TEST$ now");
    }

    #[test]
    fn sentinel_replacement_is_idempotent() {
        let rule = text_rule("test", &["REPLACE ME"]);
        let mut tree = TagTree::parse("<html><body><p>Label REPLACE ME goes here</p></body></html>");
        tree.assign_indexes();
        let tables = StaticTables::default();

        let first = tag_values(&mut tree, std::slice::from_ref(&rule), &tables, 3);
        let second = tag_values(&mut tree, std::slice::from_ref(&rule), &tables, 3);

        let p_index = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("p"))
            .and_then(|id| tree.scraper_index(id))
            .expect("paragraph indexed");

        assert_eq!(
            first.primary_values(p_index, "test").map(<[String]>::len),
            Some(1)
        );
        assert!(
            second.primary_values(p_index, "test").is_none(),
            "the literal is gone, so a second pass adds nothing"
        );
    }

    #[test]
    fn counts_accumulate_to_ancestors() {
        let (tree, annotations) = tagged_tree(
            "<html><body><div><p>REPLACE ME</p></div></body></html>",
            &[text_rule("test", &["REPLACE ME"])],
        );
        let body_index = tree.scraper_index(tree.root_id()).expect("root indexed");
        assert!(annotations.has_count(body_index, "test"), "count propagates to the root");
    }

    #[test]
    fn regex_rule_with_replace_similar_tags_repeats() {
        let rule = AttributeRule {
            name: "vin".into(),
            regex: Some(r"WVWZZZ\w{11}".into()),
            text: true,
            replace_similar: true,
            ..Default::default()
        };
        let (tree, _) = tagged_tree(
            concat!(
                "<html><body>",
                "<p>VIN WVWZZZ1JZXW000001</p>",
                "<span>confirm WVWZZZ1JZXW000001 here</span>",
                "</body></html>",
            ),
            &[rule],
        );
        let html = tree.to_html();
        assert_eq!(html.matches("$VIN$").count(), 2, "repeat occurrence tagged via similar pass");
    }

    #[test]
    fn labeled_rule_requires_preceding_label() {
        let rule = AttributeRule {
            name: "mileage".into(),
            regex: Some(r"\d{3,6}".into()),
            text: true,
            labeled: true,
            labels: vec!["Mileage".into()],
            ..Default::default()
        };

        let (with_label, _) = tagged_tree(
            "<html><body><p>Mileage: 123456</p></body></html>",
            std::slice::from_ref(&rule),
        );
        assert!(with_label.to_html().contains("$MILEAGE$"), "labeled value accepted");

        let (without_label, _) = tagged_tree(
            "<html><body><p>year 123456</p></body></html>",
            std::slice::from_ref(&rule),
        );
        assert!(
            !without_label.to_html().contains("$MILEAGE$"),
            "unlabeled value rejected"
        );
    }

    #[test]
    fn aggregate_substitutes_prior_annotations() {
        let year = text_rule("year", &["2021"]);
        let title = AttributeRule {
            name: "title".into(),
            regex: Some(r"Audi \$YEAR\$".into()),
            text: true,
            aggregate: true,
            ..Default::default()
        };
        let (_, annotations) = tagged_tree(
            "<html><body><p>Audi 2021</p></body></html>",
            &[year, title],
        );
        let found: Vec<&str> = (0..10)
            .filter_map(|i| annotations.primary_values(i, "title"))
            .flatten()
            .map(String::as_str)
            .collect();
        assert_eq!(found, vec!["Audi 2021"]);
    }

    #[test]
    fn fallback_rules_annotate_the_fallback_set() {
        let mut rule = text_rule("price", &["1000"]);
        rule.fallback = true;
        let (tree, annotations) = tagged_tree("<html><body><p>1000</p></body></html>", &[rule]);
        let p_index = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("p"))
            .and_then(|id| tree.scraper_index(id))
            .expect("paragraph indexed");
        assert!(annotations.primary_values(p_index, "price").is_none());
        assert_eq!(
            annotations.fallback_values(p_index, "price"),
            Some(&["1000".to_string()][..])
        );
    }
}
