//! Typed value coercion
//!
//! Turns the raw strings collected for a rule into one typed value. Numeric
//! parsing tolerates the separators real listing sites use (`3,950 €`,
//! `12 700 €`, `€1,250,950.00`, `100,7 km`), applies declared unit
//! conversions, and resolves competing candidates through the rule's
//! constraints. Dates are year-anchored and padded toward the start of the
//! period. Record images are downloaded and content-hashed.

use std::sync::LazyLock;

use fancy_regex::Regex;

use crate::images::{ImageContext, RecordImage};
use crate::settings::rules::{AttributeRule, Constraints, Conversion, ValueKind};

/// A parsed attribute value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AttrValue {
    #[default]
    Null,
    Text(String),
    Float(f64),
    Int(i64),
    Link(String),
    Date(String),
    Image(RecordImage),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(t) | AttrValue::Link(t) | AttrValue::Date(t) => Some(t),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AttrValue::Null => true,
            AttrValue::Text(t) | AttrValue::Link(t) | AttrValue::Date(t) => t.is_empty(),
            _ => false,
        }
    }
}

/// Parse the best value for a rule from its collected raw strings.
///
/// Image rules are resolved separately because they perform I/O; callers
/// route `ValueKind::ImageLink` through [`parse_image`].
pub fn parse_attribute(rule: &AttributeRule, values: &[String]) -> AttrValue {
    if values.is_empty() {
        return AttrValue::Null;
    }

    match rule.kind {
        ValueKind::Text => AttrValue::Text(translate(rule, &values[0])),
        ValueKind::Link => AttrValue::Link(values[0].clone()),
        ValueKind::Date => match parse_date(&values[0]) {
            Some(date) => AttrValue::Date(date),
            None => AttrValue::Null,
        },
        ValueKind::Float => match numeric_value(rule, values) {
            Some(v) => AttrValue::Float(v),
            None => AttrValue::Null,
        },
        ValueKind::Int => match numeric_value(rule, values) {
            Some(v) => AttrValue::Int(v.trunc() as i64),
            None => AttrValue::Null,
        },
        ValueKind::ImageLink => AttrValue::Null,
    }
}

/// Download the first usable record image for an image rule.
pub async fn parse_image(images: &ImageContext, values: &[String]) -> AttrValue {
    match images.fetch_first(values).await {
        Some(image) => AttrValue::Image(image),
        None => AttrValue::Null,
    }
}

fn translate(rule: &AttributeRule, value: &str) -> String {
    let Some(translations) = &rule.translations else {
        return value.to_string();
    };

    if rule.ignore_case {
        let lowered = value.to_lowercase();
        for (key, mapped) in translations {
            if key.to_lowercase() == lowered {
                return mapped.clone();
            }
        }
        lowered
    } else {
        translations.get(value).cloned().unwrap_or_else(|| value.to_string())
    }
}

/// Convert every candidate and pick one according to the constraints.
pub fn numeric_value(rule: &AttributeRule, values: &[String]) -> Option<f64> {
    let converted: Vec<f64> = values
        .iter()
        .filter_map(|v| convert_value(&rule.conversions, v, !rule.ignore_case))
        .collect();
    if converted.is_empty() {
        return None;
    }
    Some(apply_constraints(&converted, rule.constraints.as_ref()))
}

/// Numeric value of one candidate: parse, then multiply by the first
/// matching conversion.
pub fn convert_value(conversions: &[Conversion], value: &str, case_sensitive: bool) -> Option<f64> {
    let mut multiplier = 1.0;

    for conversion in conversions {
        let matched = fancy_regex::RegexBuilder::new(&conversion.regex)
            .case_insensitive(!case_sensitive)
            .build()
            .ok()
            .and_then(|p| p.find(value).ok().flatten().map(|_| ()));
        if matched.is_some() {
            multiplier = conversion.multiplier;
            break;
        }
    }

    parse_float(value).map(|v| v * multiplier)
}

static TRAILING_COMMA: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r",(?=\d{1,2}\b)").ok());
static THOUSANDS: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[,.](?=\d{3})").ok());

/// Normalize a raw numeric string:
/// a trailing `,\d{1,2}` is a decimal comma, `[,.]` before three digits is
/// a thousands separator, everything else non-numeric is noise.
pub fn parse_float(raw: &str) -> Option<f64> {
    let decimal = match TRAILING_COMMA.as_ref() {
        Some(p) => p.replace_all(raw, ".").into_owned(),
        None => raw.to_string(),
    };
    let unseparated = match THOUSANDS.as_ref() {
        Some(p) => p.replace_all(&decimal, "").into_owned(),
        None => decimal,
    };
    let digits: String = unseparated
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    digits.parse().ok()
}

fn apply_constraints(values: &[f64], constraints: Option<&Constraints>) -> f64 {
    let mut final_value = values[0];
    let Some(constraints) = constraints else {
        return final_value;
    };

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(bound) = &constraints.discard_smaller_than {
        let threshold = if let Some(percent) = bound.strip_suffix('%') {
            percent
                .parse::<f64>()
                .map(|p| sorted[0] * (p / 100.0))
                .unwrap_or(f64::MIN)
        } else {
            bound.parse::<f64>().unwrap_or(f64::MIN)
        };
        sorted.retain(|v| *v >= threshold);
        if let Some(largest) = sorted.first() {
            final_value = *largest;
        }
    }

    if let Some(nth) = constraints.prioritize_nth_biggest
        && nth >= 1
        && sorted.len() >= nth
    {
        final_value = sorted[nth - 1];
    }

    final_value
}

static DATE_SEPARATORS: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"[\s,/\\]").ok());
static YEAR: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"^\d{4}|\d{4}$").ok());

/// Parse a date anchored on a 4-digit year, with optional month and day
/// read from the segments adjacent to it. Missing parts pad to `01`, so
/// the result is always `YYYY-MM-DD`-shaped down to what was present:
/// `"2021.05.17"` → `"2021-05-17"`, `"05/2021"` → `"2021-05-01"`,
/// `"2021"` → `"2021-01-01"`. No year, no date.
pub fn parse_date(raw: &str) -> Option<String> {
    let normalized = DATE_SEPARATORS
        .as_ref()
        .map(|p| p.replace_all(raw, ".").into_owned())
        .unwrap_or_else(|| raw.to_string());

    let year_match = YEAR.as_ref()?.find(&normalized)?;
    let year = year_match.as_str();
    let year_at_start = year_match.start() == 0;

    let remainder = format!(
        "{}{}",
        &normalized[..year_match.start()],
        &normalized[year_match.end()..]
    );
    let segments: Vec<&str> = remainder
        .split('.')
        .filter(|s| !s.is_empty() && s.len() <= 2 && s.chars().all(|c| c.is_ascii_digit()))
        .collect();

    // Month sits adjacent to the year; the day is the next segment out.
    let (month, day) = if year_at_start {
        (segments.first().copied(), segments.get(1).copied())
    } else {
        let n = segments.len();
        (
            n.checked_sub(1).and_then(|i| segments.get(i)).copied(),
            n.checked_sub(2).and_then(|i| segments.get(i)).copied(),
        )
    };

    let month = month.unwrap_or("01");
    let day = day.unwrap_or("01");
    Some(format!("{year}-{month:0>2}-{day:0>2}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const INPUTS: [&str; 12] = [
        "3,950 €",
        "2,470€",
        "12 700 €",
        "€26,950.00",
        "€1,250,950.00",
        "€23 500",
        "137 km",
        "100,7 km",
        "2132km",
        "12thd",
        "120 thd",
        "15.6thd",
    ];

    fn thd_conversions() -> Vec<Conversion> {
        vec![Conversion {
            regex: "thd".into(),
            multiplier: 1000.0,
        }]
    }

    #[test]
    fn parses_floats_across_separator_styles() {
        let expected = [
            3950.0, 2470.0, 12700.0, 26950.0, 1250950.0, 23500.0, 137.0, 100.7, 2132.0, 12.0,
            120.0, 15.6,
        ];
        for (input, expected) in INPUTS.iter().zip(expected) {
            assert_eq!(parse_float(input), Some(expected), "input {input:?}");
        }
    }

    #[test]
    fn conversions_multiply_matching_values() {
        let expected = [
            3950.0, 2470.0, 12700.0, 26950.0, 1250950.0, 23500.0, 137.0, 100.7, 2132.0, 12000.0,
            120000.0, 15600.0,
        ];
        let conversions = thd_conversions();
        for (input, expected) in INPUTS.iter().zip(expected) {
            assert_eq!(
                convert_value(&conversions, input, true),
                Some(expected),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn constraints_discard_then_prioritize() {
        let rule = AttributeRule {
            kind: ValueKind::Float,
            conversions: thd_conversions(),
            constraints: Some(Constraints {
                discard_smaller_than: Some("30%".into()),
                prioritize_nth_biggest: Some(2),
            }),
            ..Default::default()
        };
        let values: Vec<String> = ["3,950 €", "2,470€", "12 700 €"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(numeric_value(&rule, &values), Some(3950.0));
    }

    #[test]
    fn constraint_groups_match_expected_picks() {
        let rule = AttributeRule {
            kind: ValueKind::Float,
            conversions: thd_conversions(),
            constraints: Some(Constraints {
                discard_smaller_than: Some("30%".into()),
                prioritize_nth_biggest: Some(2),
            }),
            ..Default::default()
        };
        let groups: [(&[&str], f64); 4] = [
            (&["3,950 €", "2,470€", "12 700 €"], 3950.0),
            (&["€26,950.00", "€1,250,950.00", "€23 500"], 1250950.0),
            (&["137 km", "100,7 km", "2132km"], 2132.0),
            (&["12 thd", "120 thd", "15.6thd"], 120000.0),
        ];
        for (inputs, expected) in groups {
            let values: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
            assert_eq!(numeric_value(&rule, &values), Some(expected), "group {inputs:?}");
        }
    }

    #[test]
    fn int_truncates_float_value() {
        let rule = AttributeRule {
            kind: ValueKind::Int,
            conversions: thd_conversions(),
            ..Default::default()
        };
        assert_eq!(
            parse_attribute(&rule, &["15.6thd".to_string()]),
            AttrValue::Int(15600)
        );
        let plain = AttributeRule {
            kind: ValueKind::Int,
            ..Default::default()
        };
        assert_eq!(
            parse_attribute(&plain, &["100,7 km".to_string()]),
            AttrValue::Int(100)
        );
    }

    #[test]
    fn dates_anchor_on_the_year() {
        assert_eq!(parse_date("2021.05.17").as_deref(), Some("2021-05-17"));
        assert_eq!(parse_date("17.05.2021").as_deref(), Some("2021-05-17"));
        assert_eq!(parse_date("05/2021").as_deref(), Some("2021-05-01"));
        assert_eq!(parse_date("2021").as_deref(), Some("2021-01-01"));
        assert_eq!(parse_date("May sometime"), None);
        assert_eq!(parse_date("17.05"), None);
    }

    #[test]
    fn text_values_apply_translations() {
        let mut translations = HashMap::new();
        translations.insert("Benzinas".to_string(), "petrol".to_string());
        let rule = AttributeRule {
            kind: ValueKind::Text,
            ignore_case: true,
            translations: Some(translations),
            ..Default::default()
        };
        assert_eq!(
            parse_attribute(&rule, &["BENZINAS".to_string()]),
            AttrValue::Text("petrol".into())
        );
    }

    #[test]
    fn empty_values_parse_to_null() {
        let rule = AttributeRule::default();
        assert_eq!(parse_attribute(&rule, &[]), AttrValue::Null);
    }
}
