//! Declarative attribute rules
//!
//! A rule describes one output field: where its raw values come from
//! (examples, a regex, or a lookup table), which parts of the page they may
//! match (text, attributes, or both), and how matches are filtered and
//! coerced. Rules are authored as JSON in the settings store and applied in
//! declaration order: ordering is load-bearing, because each match is
//! replaced with an opaque sentinel that later rules cannot re-match.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// How a rule's raw values are coerced into a typed record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    #[default]
    Text,
    Float,
    Int,
    Link,
    Date,
    ImageLink,
}

/// A unit conversion applied when the raw value matches `regex`
/// (e.g. `thd` → ×1000).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversion {
    pub regex: String,
    pub multiplier: f64,
}

/// Numeric candidate constraints, applied after conversion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// Absolute bound, or `"N%"` relative to the largest candidate.
    pub discard_smaller_than: Option<String>,
    /// Pick the n-th biggest surviving candidate when available.
    pub prioritize_nth_biggest: Option<usize>,
}

/// One declarative extraction rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AttributeRule {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ValueKind,

    /// Candidate blocks must carry this rule's annotation.
    pub required: bool,
    /// Tags annotated with this rule are excluded from block selection.
    pub anti_attribute: bool,
    /// Annotations go to the fallback set instead of the primary one.
    pub fallback: bool,

    // Source of matches; exactly one of these is expected.
    pub examples: Option<Vec<String>>,
    pub regex: Option<String>,
    /// Examples drawn from a cached lookup table.
    pub table_source: Option<String>,

    /// Match inside text nodes.
    pub text: bool,
    /// Match inside attributes whose name matches this pattern.
    pub attribute_regex: Option<String>,

    pub ignore_case: bool,
    /// Skip matches when the rule's own name appears alongside the value.
    pub exclusive: bool,
    /// Keep a match only when one of `labels` occurs nearby.
    pub labeled: bool,
    pub labels: Vec<String>,
    /// Truncate the match at the first occurrence of this pattern.
    pub filter_regex: Option<String>,
    pub prefix: Option<String>,
    /// Try longer examples first.
    pub reorder_examples: bool,
    /// Re-run regex matches as exact examples to catch repeats elsewhere.
    pub replace_similar: bool,
    /// Substitute `$NAME$` placeholders with values already annotated on
    /// the same tag.
    pub aggregate: bool,
    pub translations: Option<HashMap<String, String>>,
    pub conversions: Vec<Conversion>,
    pub constraints: Option<Constraints>,
    /// Value recorded when no annotation is found.
    pub default: Option<String>,
}

impl AttributeRule {
    /// The sentinel written into matched text: `$NAME$`.
    pub fn sentinel(&self) -> String {
        format_sentinel(&self.name)
    }

    pub fn is_example_driven(&self) -> bool {
        self.examples.is_some() || self.table_source.is_some()
    }

    pub fn is_regex_driven(&self) -> bool {
        self.regex.is_some()
    }
}

/// `$NAME$` form of a rule name.
pub fn format_sentinel(name: &str) -> String {
    format!("${}$", name.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinel_is_uppercased() {
        let rule = AttributeRule {
            name: "record_image".into(),
            ..Default::default()
        };
        assert_eq!(rule.sentinel(), "$RECORD_IMAGE$");
    }

    #[test]
    fn rules_deserialize_from_settings_json() {
        let json = r#"{
            "name": "price",
            "type": "float",
            "required": true,
            "regex": "\\d+[\\s,.]?\\d*\\s?€",
            "text": true,
            "conversions": [{"regex": "thd", "multiplier": 1000}],
            "constraints": {"discard_smaller_than": "30%", "prioritize_nth_biggest": 2}
        }"#;
        let rule: AttributeRule = serde_json::from_str(json).expect("rule parses");
        assert_eq!(rule.kind, ValueKind::Float);
        assert!(rule.required);
        assert!(rule.is_regex_driven());
        assert_eq!(rule.conversions[0].multiplier, 1000.0);
        assert_eq!(
            rule.constraints.as_ref().and_then(|c| c.prioritize_nth_biggest),
            Some(2)
        );
    }
}
