//! End-to-end extraction tests over static HTML fixtures
//!
//! These drive the clean → tag → find pipeline exactly as the catalog and
//! detail scrapers do, without a browser: the fixtures stand in for
//! rendered page snapshots.

use std::collections::HashMap;

use lotcrawl::blocks::{AttrValue, Block, FindOptions, find_blocks, find_new_blocks};
use lotcrawl::dom::clean::CleanerSettings;
use lotcrawl::dom::clean_html;
use lotcrawl::images::ImageContext;
use lotcrawl::settings::AttributeRule;
use lotcrawl::settings::rules::ValueKind;
use lotcrawl::settings::table_cache::StaticTables;
use lotcrawl::store::Record;
use lotcrawl::tagger::tag_values;

fn catalog_rules() -> Vec<AttributeRule> {
    vec![
        AttributeRule {
            name: "alias".into(),
            regex: Some(r"car-\d+\.html".into()),
            attribute_regex: Some("^id$".into()),
            required: true,
            kind: ValueKind::Text,
            ..Default::default()
        },
        AttributeRule {
            name: "link".into(),
            regex: Some(r"/listing/car-\d+\.html".into()),
            attribute_regex: Some("^href$".into()),
            kind: ValueKind::Link,
            ..Default::default()
        },
        AttributeRule {
            name: "price".into(),
            regex: Some(r"\d+[\s.,]?\d+\s?€".into()),
            text: true,
            required: true,
            kind: ValueKind::Float,
            ..Default::default()
        },
        AttributeRule {
            name: "year".into(),
            regex: Some(r"\b(19|20)\d{2}\b".into()),
            text: true,
            kind: ValueKind::Date,
            ..Default::default()
        },
        AttributeRule {
            name: "title".into(),
            examples: Some(vec!["Audi A4".into(), "BMW 320".into()]),
            text: true,
            kind: ValueKind::Text,
            ..Default::default()
        },
    ]
}

fn catalog_page(cards: usize) -> String {
    let mut rows = String::new();
    for i in 1..=cards {
        let make = if i % 2 == 0 { "Audi A4" } else { "BMW 320" };
        rows.push_str(&format!(
            r#"<article class="result" id="car-{i}.html">
                 <a href="/listing/car-{i}.html">{make}</a>
                 <span class="meta">2018 · {i}2 700 €</span>
               </article>"#,
        ));
    }
    format!(
        r#"<html><head><title>cars</title></head><body>
             <nav><a href="/about">About</a></nav>
             <section class="results">{rows}</section>
             <footer>© dealer</footer>
           </body></html>"#
    )
}

async fn extract(source: &str, rules: &[AttributeRule]) -> Vec<Block> {
    let mut tree = clean_html(
        source,
        "https://site.example/cars",
        &CleanerSettings::default(),
        &[],
    );
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
async fn catalog_page_yields_one_record_per_listing() {
    let rules = catalog_rules();
    let blocks = extract(&catalog_page(12), &rules).await;
    assert_eq!(blocks.len(), 12, "every listing card becomes a block");

    let aliases: Vec<&str> = blocks.iter().filter_map(Block::alias).collect();
    assert_eq!(aliases.len(), 12);
    assert!(aliases.contains(&"car-1.html"));
    assert!(aliases.contains(&"car-12.html"));

    let records: Vec<Record> = blocks.iter().map(Record::from_block).collect();
    let first = records
        .iter()
        .find(|r| r.alias.as_deref() == Some("car-1.html"))
        .expect("first listing extracted");
    assert_eq!(first.price, Some(12700.0));
    assert_eq!(first.year.as_deref(), Some("2018-01-01"));
    assert_eq!(first.title.as_deref(), Some("BMW 320"));
    assert_eq!(first.link.as_deref(), Some("/listing/car-1.html"));
}

#[tokio::test]
async fn accumulated_records_suppress_known_aliases() {
    let rules = catalog_rules();
    let first_pass = extract(&catalog_page(4), &rules).await;
    let known: HashMap<String, Block> = first_pass
        .into_iter()
        .filter_map(|b| b.alias().map(|a| (a.to_string(), b.clone())))
        .collect();
    assert_eq!(known.len(), 4);

    // The same page again: everything is already known.
    let mut tree = clean_html(
        &catalog_page(4),
        "https://site.example/cars",
        &CleanerSettings::default(),
        &[],
    );
    let annotations = tag_values(&mut tree, &rules, &StaticTables::default(), 3);
    let images = ImageContext::disabled();
    let options = FindOptions {
        rules: &rules,
        max_tag_distance: 5,
        prioritize_first: false,
        record_alias: None,
        images: &images,
    };
    let second_pass = find_new_blocks(&mut tree, &annotations, &options, &known).await;
    assert!(second_pass.is_empty());
}

#[tokio::test]
async fn chrome_noise_outside_the_listing_is_ignored() {
    let rules = catalog_rules();
    // The nav link and footer never satisfy the required set, so the
    // largest coherent group is exactly the listing section.
    let blocks = extract(&catalog_page(6), &rules).await;
    for block in &blocks {
        let alias = block.alias().unwrap_or_default();
        assert!(alias.starts_with("car-"), "unexpected block {alias:?}");
    }
}

#[tokio::test]
async fn detail_page_merges_sibling_spec_rows_in_prioritize_first_mode() {
    let rules = vec![
        AttributeRule {
            name: "alias".into(),
            regex: Some(r"car-\d+\.html".into()),
            attribute_regex: Some("^href$".into()),
            required: true,
            ..Default::default()
        },
        AttributeRule {
            name: "title".into(),
            examples: Some(vec!["Audi A4".into()]),
            text: true,
            required: true,
            ..Default::default()
        },
        AttributeRule {
            name: "mileage".into(),
            regex: Some(r"\d+ km".into()),
            text: true,
            kind: ValueKind::Int,
            ..Default::default()
        },
    ];

    let source = r#"<html><body>
        <main>
          <div class="record">
            <a href="/listing/car-9.html">Audi A4</a>
          </div>
          <div class="specs"><span>150000 km</span></div>
        </main>
    </body></html>"#;

    let mut tree = clean_html(
        source,
        "https://site.example/listing/car-9.html",
        &CleanerSettings::default(),
        &[],
    );
    let annotations = tag_values(&mut tree, &rules, &StaticTables::default(), 3);
    let images = ImageContext::disabled();
    let options = FindOptions {
        rules: &rules,
        max_tag_distance: 5,
        prioritize_first: true,
        record_alias: Some("car-9.html"),
        images: &images,
    };

    let blocks = find_blocks(&mut tree, &annotations, &options).await;
    assert_eq!(blocks.len(), 1, "prioritize-first keeps a single block");
    assert_eq!(
        blocks[0].values.get("mileage"),
        Some(&AttrValue::Int(150000)),
        "sibling spec row folded into the record block"
    );
}

#[tokio::test]
async fn ignored_cleaning_steps_reach_the_pipeline() {
    let source = r#"<html><body>
        <div hidden id="car-1.html"><a href="/listing/car-1.html">Audi A4</a><span>12 700 €</span></div>
    </body></html>"#;

    let rules = catalog_rules();

    // With invisibility pruning active, the hidden listing disappears.
    let blocks = extract(source, &rules).await;
    assert!(blocks.is_empty());

    // Disabling the stage keeps it.
    let mut tree = clean_html(
        source,
        "https://site.example/cars",
        &CleanerSettings::default(),
        &["remove_invisible_tags".into(), "remove_non_whitelisted_attributes".into()],
    );
    let annotations = tag_values(&mut tree, &rules, &StaticTables::default(), 3);
    let images = ImageContext::disabled();
    let options = FindOptions {
        rules: &rules,
        max_tag_distance: 5,
        prioritize_first: false,
        record_alias: None,
        images: &images,
    };
    let blocks = find_new_blocks(&mut tree, &annotations, &options, &HashMap::new()).await;
    assert_eq!(blocks.len(), 1);
}
