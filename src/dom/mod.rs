//! Working representation of a rendered page
//!
//! The browser hands us serialized HTML; everything downstream (cleaning,
//! tagging, block finding, pagination) operates on a mutable tag tree that
//! is cheap to walk, compare, and rewrite. The tree is deep-copied out of
//! the html5ever parse so that cleaning stages can detach and splice nodes
//! without fighting the parser's internal structure.

pub mod clean;
pub mod inline_css;

pub use clean::{CleanerSettings, clean_html};

use std::collections::BTreeMap;

use ego_tree::{NodeId, Tree};

/// One step of a tag's path from the tree root: element name plus its
/// position among same-named siblings (1-based, like `nth-of-type`).
pub type XpathSegment = (String, usize);

/// A node in the working tree.
#[derive(Debug, Clone, PartialEq)]
pub enum TagNode {
    Element(Element),
    Text(String),
    Comment(String),
}

/// An element with its retained attributes.
///
/// `scraper_index` is assigned in document order once cleaning finishes and
/// is the only stable identifier later stages use to refer back to a tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
    pub scraper_index: Option<usize>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: BTreeMap::new(),
            scraper_index: None,
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Class attribute split into individual class names.
    pub fn classes(&self) -> Vec<&str> {
        self.attr("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default()
    }
}

/// Mutable tag tree rooted at the page `<body>`.
#[derive(Debug, Clone)]
pub struct TagTree {
    tree: Tree<TagNode>,
}

impl TagTree {
    /// Parse an HTML document and copy its `<body>` subtree into a working
    /// tree. Falls back to the document element when no body is present.
    pub fn parse(source: &str) -> Self {
        let html = scraper::Html::parse_document(source);
        let body = html
            .tree
            .root()
            .descendants()
            .find(|n| match n.value() {
                scraper::Node::Element(el) => el.name() == "body",
                _ => false,
            })
            .unwrap_or_else(|| html.tree.root());

        let root_value = convert_node(body.value()).unwrap_or_else(|| TagNode::Element(Element::new("body")));
        let mut tree = Tree::new(root_value);
        let root_id = tree.root().id();
        copy_children(&body, &mut tree, root_id);

        Self { tree }
    }

    /// Build a tree from an existing root value (used by tests and the
    /// pagination handler when synthesizing small trees).
    pub fn from_root(root: TagNode) -> Self {
        Self { tree: Tree::new(root) }
    }

    pub fn root_id(&self) -> NodeId {
        self.tree.root().id()
    }

    pub fn get(&self, id: NodeId) -> Option<ego_tree::NodeRef<'_, TagNode>> {
        self.tree.get(id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<ego_tree::NodeMut<'_, TagNode>> {
        self.tree.get_mut(id)
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match self.tree.get(id)?.value() {
            TagNode::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn element_name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|el| el.name.as_str())
    }

    pub fn scraper_index(&self, id: NodeId) -> Option<usize> {
        self.element(id).and_then(|el| el.scraper_index)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.tree.get(id)?.parent().map(|p| p.id())
    }

    /// Ids of all element nodes in document order.
    pub fn element_ids(&self) -> Vec<NodeId> {
        self.tree
            .root()
            .descendants()
            .filter(|n| matches!(n.value(), TagNode::Element(_)))
            .map(|n| n.id())
            .collect()
    }

    /// Ids of all text nodes in document order.
    pub fn text_ids(&self) -> Vec<NodeId> {
        self.tree
            .root()
            .descendants()
            .filter(|n| matches!(n.value(), TagNode::Text(_)))
            .map(|n| n.id())
            .collect()
    }

    /// Ids of the element children of `id`, in order.
    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.tree
            .get(id)
            .map(|n| {
                n.children()
                    .filter(|c| matches!(c.value(), TagNode::Element(_)))
                    .map(|c| c.id())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ids of all descendants of `id` (including `id`) in document order.
    pub fn subtree_ids(&self, id: NodeId) -> Vec<NodeId> {
        self.tree
            .get(id)
            .map(|n| n.descendants().map(|d| d.id()).collect())
            .unwrap_or_default()
    }

    pub fn text_content(&self, id: NodeId) -> String {
        let Some(node) = self.tree.get(id) else {
            return String::new();
        };
        let mut out = String::new();
        for n in node.descendants() {
            if let TagNode::Text(t) = n.value() {
                out.push_str(t);
            }
        }
        out
    }

    pub fn node_text(&self, id: NodeId) -> Option<&str> {
        match self.tree.get(id)?.value() {
            TagNode::Text(t) => Some(t.as_str()),
            _ => None,
        }
    }

    pub fn set_node_text(&mut self, id: NodeId, text: String) {
        if let Some(mut node) = self.tree.get_mut(id)
            && let TagNode::Text(t) = node.value()
        {
            *t = text;
        }
    }

    /// True while the node is still reachable from the tree root.
    pub fn is_attached(&self, id: NodeId) -> bool {
        let root = self.root_id();
        let Some(node) = self.tree.get(id) else {
            return false;
        };
        node.id() == root || node.ancestors().any(|a| a.id() == root)
    }

    pub fn detach(&mut self, id: NodeId) {
        if id == self.root_id() {
            return;
        }
        if let Some(mut node) = self.tree.get_mut(id) {
            node.detach();
        }
    }

    /// Detach every child of `id`, leaving the element itself in place.
    pub fn clear_children(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self
            .tree
            .get(id)
            .map(|n| n.children().map(|c| c.id()).collect())
            .unwrap_or_default();
        for child in children {
            self.detach(child);
        }
    }

    /// Move an existing node (and its subtree) to be the last child of `id`.
    pub fn append_existing(&mut self, id: NodeId, child: NodeId) {
        if let Some(mut node) = self.tree.get_mut(id) {
            node.append_id(child);
        }
    }

    /// Append a fresh node under `id` and return its id.
    pub fn append_node(&mut self, id: NodeId, value: TagNode) -> Option<NodeId> {
        self.tree.get_mut(id).map(|mut n| n.append(value).id())
    }

    /// Replace a node with its own text, joining it into adjacent text runs
    /// with single spaces. Empty results remove the node entirely.
    pub fn flatten_to_text(&mut self, id: NodeId) {
        let Some(node) = self.tree.get(id) else {
            return;
        };
        if node.parent().is_none() {
            return;
        }

        let mut text = self.text_content(id).trim().to_string();

        let next = self.tree.get(id).and_then(|n| n.next_sibling()).map(|n| n.id());
        if let Some(next_id) = next
            && let Some(next_text) = self.node_text(next_id).map(str::to_string)
        {
            text = join_if_present(&text, &next_text);
            self.detach(next_id);
        }

        let prev = self.tree.get(id).and_then(|n| n.prev_sibling()).map(|n| n.id());
        if let Some(prev_id) = prev
            && let Some(prev_text) = self.node_text(prev_id).map(str::to_string)
        {
            text = join_if_present(&prev_text, &text);
            self.detach(prev_id);
        }

        if text.is_empty() {
            self.detach(id);
        } else if let Some(mut node) = self.tree.get_mut(id) {
            node.insert_before(TagNode::Text(text));
            node.detach();
        }
    }

    /// Assign `scraper_index` to every element in document order, starting
    /// from zero. This is the identifier later stages key on.
    pub fn assign_indexes(&mut self) {
        let ids = self.element_ids();
        for (index, id) in ids.into_iter().enumerate() {
            if let Some(mut node) = self.tree.get_mut(id)
                && let TagNode::Element(el) = node.value()
            {
                el.scraper_index = Some(index);
            }
        }
    }

    /// Find the element carrying the given scraper index.
    pub fn find_by_index(&self, index: usize) -> Option<NodeId> {
        self.tree
            .root()
            .descendants()
            .find(|n| match n.value() {
                TagNode::Element(el) => el.scraper_index == Some(index),
                _ => false,
            })
            .map(|n| n.id())
    }

    /// Count of element nodes currently attached.
    pub fn element_count(&self) -> usize {
        self.element_ids().len()
    }

    /// Xpath of a tag: its ancestor chain of (name, nth-of-same-name),
    /// root first, the tag itself last. Unique per tag within one tree.
    pub fn xpath(&self, id: NodeId) -> Vec<XpathSegment> {
        let mut segments = Vec::new();
        let mut current = id;
        loop {
            let Some(node) = self.tree.get(current) else {
                break;
            };
            let TagNode::Element(el) = node.value() else {
                // Text nodes inherit their parent's path.
                match node.parent() {
                    Some(parent) => {
                        current = parent.id();
                        continue;
                    }
                    None => break,
                }
            };

            let nth = match node.parent() {
                Some(parent) => {
                    let mut position = 1;
                    for sibling in parent.children() {
                        if let TagNode::Element(sib) = sibling.value() {
                            if sibling.id() == current {
                                break;
                            }
                            if sib.name == el.name {
                                position += 1;
                            }
                        }
                    }
                    position
                }
                None => 1,
            };

            segments.push((el.name.clone(), nth));
            match node.parent() {
                Some(parent) => current = parent.id(),
                None => break,
            }
        }
        segments.reverse();
        segments
    }

    /// DOM distance between two tags: hops from each tag up to just below
    /// their common ancestor, plus one for the crossing. Zero for the same
    /// tag, one for siblings.
    pub fn distance(&self, a: NodeId, b: NodeId) -> usize {
        let pa = self.xpath(a);
        let pb = self.xpath(b);
        if pa == pb {
            return 0;
        }
        let min = pa.len().min(pb.len());
        if min == 0 {
            return pa.len().max(pb.len());
        }

        let mut idx = 0;
        for i in 0..min {
            idx = i;
            if pa[i] != pb[i] {
                break;
            }
        }

        let da = pa.len() - idx - 1;
        let db = pb.len() - idx - 1;
        let mut d = da + db + 1;
        if d == 1 && pa.get(idx) == pb.get(idx) {
            d = 0;
        }
        d
    }

    /// Nearest ancestor containing every given node. Falls back to the first
    /// node itself when the set is empty or disjoint.
    pub fn common_ancestor(&self, ids: &[NodeId]) -> Option<NodeId> {
        let first = *ids.first()?;
        let mut candidate = self.parent(first)?;
        loop {
            let all_inside = ids.iter().all(|&id| {
                id == candidate
                    || self
                        .tree
                        .get(id)
                        .map(|n| n.ancestors().any(|a| a.id() == candidate))
                        .unwrap_or(false)
            });
            if all_inside {
                return Some(candidate);
            }
            match self.parent(candidate) {
                Some(parent) => candidate = parent,
                None => return Some(first),
            }
        }
    }

    /// True when `ancestor` is a proper ancestor of `id`.
    pub fn is_ancestor(&self, ancestor: NodeId, id: NodeId) -> bool {
        self.tree
            .get(id)
            .map(|n| n.ancestors().any(|a| a.id() == ancestor))
            .unwrap_or(false)
    }

    /// Whether `a` precedes `b` in document order within `scope`'s subtree.
    pub fn precedes(&self, scope: NodeId, a: NodeId, b: NodeId) -> bool {
        let Some(node) = self.tree.get(scope) else {
            return false;
        };
        for n in node.descendants() {
            if n.id() == a {
                return true;
            }
            if n.id() == b {
                return false;
            }
        }
        false
    }

    /// Build a CSS selector the driver can resolve for this tag.
    ///
    /// Shortcuts to `#id` when an id attribute is available anywhere on the
    /// ancestor chain; otherwise emits a `>`-joined chain of
    /// `tag.class1.class2:nth-of-type(k)` segments. `nth-of-type` is added
    /// only when the parent holds more than one sibling with the same name
    /// and class list.
    pub fn css_selector(&self, id: NodeId, restricted_class_symbols: &[String]) -> String {
        let mut selector = String::new();
        let mut current = id;

        loop {
            let Some(node) = self.tree.get(current) else {
                break;
            };
            let TagNode::Element(el) = node.value() else {
                break;
            };

            if let Some(found_id) = el.attr("id") {
                return format!("#{found_id}{selector}");
            }

            let class_list = format_class_list(el, restricted_class_symbols);

            let (position, similar) = match node.parent() {
                Some(parent) => {
                    let mut position = 1;
                    let mut similar = 0;
                    let classes = el.classes();
                    for sibling in parent.children() {
                        if let TagNode::Element(sib) = sibling.value()
                            && sib.name == el.name
                            && sib.classes() == classes
                        {
                            similar += 1;
                            if sibling.id() == current {
                                position = similar;
                            }
                        }
                    }
                    (position, similar)
                }
                None => (1, 1),
            };

            let nth = if similar > 1 {
                format!(":nth-of-type({position})")
            } else {
                String::new()
            };

            selector = format!(">{}{class_list}{nth}{selector}", el.name);

            match node.parent() {
                Some(parent) => current = parent.id(),
                None => break,
            }
        }

        selector.strip_prefix('>').map(str::to_string).unwrap_or(selector)
    }

    /// Serialize the subtree for debug dumps.
    pub fn to_html(&self) -> String {
        let mut out = String::new();
        serialize(self.tree.root(), &mut out);
        out
    }
}

fn serialize(node: ego_tree::NodeRef<'_, TagNode>, out: &mut String) {
    match node.value() {
        TagNode::Text(t) => out.push_str(t),
        TagNode::Comment(c) => {
            out.push_str("<!--");
            out.push_str(c);
            out.push_str("-->");
        }
        TagNode::Element(el) => {
            out.push('<');
            out.push_str(&el.name);
            if let Some(index) = el.scraper_index {
                out.push_str(&format!(" scraper-index=\"{index}\""));
            }
            for (name, value) in &el.attrs {
                out.push_str(&format!(" {name}=\"{value}\""));
            }
            out.push('>');
            for child in node.children() {
                serialize(child, out);
            }
            out.push_str(&format!("</{}>", el.name));
        }
    }
}

fn format_class_list(el: &Element, restricted_class_symbols: &[String]) -> String {
    let mut formatted = String::new();
    for class_name in el.classes() {
        let mut name = class_name.replace(' ', "");
        for symbol in restricted_class_symbols {
            name = name.replace(symbol.as_str(), &format!("\\{symbol}"));
        }
        if name.starts_with(|c: char| c.is_ascii_digit()) {
            name.remove(0);
        }
        if !name.is_empty() {
            formatted.push('.');
            formatted.push_str(&name);
        }
    }
    formatted
}

fn join_if_present(a: &str, b: &str) -> String {
    let a = a.trim();
    let b = b.trim();
    match (a.is_empty(), b.is_empty()) {
        (false, false) => format!("{a} {b}"),
        (false, true) => a.to_string(),
        (true, false) => b.to_string(),
        (true, true) => String::new(),
    }
}

fn convert_node(node: &scraper::Node) -> Option<TagNode> {
    match node {
        scraper::Node::Element(el) => {
            let mut element = Element::new(el.name());
            for (name, value) in el.attrs() {
                element.attrs.insert(name.to_string(), value.to_string());
            }
            Some(TagNode::Element(element))
        }
        scraper::Node::Text(text) => Some(TagNode::Text(text.to_string())),
        scraper::Node::Comment(comment) => Some(TagNode::Comment(comment.to_string())),
        _ => None,
    }
}

fn copy_children(
    src: &ego_tree::NodeRef<'_, scraper::Node>,
    dst: &mut Tree<TagNode>,
    dst_id: NodeId,
) {
    for child in src.children() {
        if let Some(value) = convert_node(child.value()) {
            let child_id = match dst.get_mut(dst_id) {
                Some(mut n) => n.append(value).id(),
                None => continue,
            };
            copy_children(&child, dst, child_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK_HTML: &str = r#"
        <html><body>
            <div class="block" id="block1"><h1>Block 1</h1><p>Block 1 content</p></div>
            <div class="block" id="block2"><h1>Block 2</h1><p>Block 2 content</p></div>
            <div class="container">
                <div class="wrapper">
                    <div class="block" id="block3"><h1>Block 3</h1><p>Block 3 content</p></div>
                </div>
                <div class="block" id="block4"><h1>Block 4</h1><p>Block 4 content</p></div>
                <div class="block" id="block5"><h1>Block 5</h1><p>Block 5 content</p></div>
            </div>
        </body></html>"#;

    fn blocks_of(tree: &TagTree) -> Vec<NodeId> {
        tree.element_ids()
            .into_iter()
            .filter(|&id| {
                tree.element(id)
                    .map(|el| el.classes().contains(&"block"))
                    .unwrap_or(false)
            })
            .collect()
    }

    #[test]
    fn distance_between_blocks() {
        let tree = TagTree::parse(BLOCK_HTML);
        let blocks = blocks_of(&tree);
        assert_eq!(blocks.len(), 5);

        assert_eq!(tree.distance(blocks[0], blocks[0]), 0, "tag to itself");
        assert_eq!(tree.distance(blocks[0], blocks[1]), 1, "sibling blocks");
        assert_eq!(tree.distance(blocks[0], blocks[2]), 3, "wrapped block");
        assert_eq!(tree.distance(blocks[2], blocks[0]), 3, "order must not matter");
    }

    #[test]
    fn xpath_is_unique_per_tag() {
        let tree = TagTree::parse(BLOCK_HTML);
        let ids = tree.element_ids();
        let paths: Vec<_> = ids.iter().map(|&id| tree.xpath(id)).collect();
        for (i, a) in paths.iter().enumerate() {
            for (j, b) in paths.iter().enumerate() {
                if i != j {
                    assert_ne!(a, b, "two tags share an xpath");
                }
            }
        }
    }

    #[test]
    fn indexes_follow_document_order() {
        let mut tree = TagTree::parse(BLOCK_HTML);
        tree.assign_indexes();
        let ids = tree.element_ids();
        for (expected, id) in ids.iter().enumerate() {
            assert_eq!(tree.scraper_index(*id), Some(expected));
        }
        assert_eq!(tree.find_by_index(2), Some(ids[2]));
    }

    #[test]
    fn css_selector_shortcuts_to_id() {
        let tree = TagTree::parse(BLOCK_HTML);
        let blocks = blocks_of(&tree);
        assert_eq!(tree.css_selector(blocks[0], &[]), "#block1");
    }

    #[test]
    fn css_selector_builds_chain_without_id() {
        let tree = TagTree::parse(
            r#"<html><body><div class="row"><span class="x">a</span><span class="x">b</span></div></body></html>"#,
        );
        let spans: Vec<_> = tree
            .element_ids()
            .into_iter()
            .filter(|&id| tree.element_name(id) == Some("span"))
            .collect();
        let selector = tree.css_selector(spans[1], &[]);
        assert_eq!(selector, "body>div.row>span.x:nth-of-type(2)");
    }

    #[test]
    fn flatten_joins_neighboring_text() {
        let mut tree = TagTree::parse("<html><body><p>before <b>middle</b> after</p></body></html>");
        let bold = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("b"))
            .expect("bold tag present");
        tree.flatten_to_text(bold);
        let p = tree
            .element_ids()
            .into_iter()
            .find(|&id| tree.element_name(id) == Some("p"))
            .expect("paragraph present");
        assert_eq!(tree.text_content(p), "before middle after");
    }
}
