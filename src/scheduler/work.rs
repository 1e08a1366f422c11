//! Work assembly
//!
//! Builds the run's task list: proxies rotated by run id so the same
//! target sees different exits on successive runs, domains interleaved so
//! no site is hit serially, and tasks packed into batches that map onto
//! the worker pool's windows.

use std::collections::HashMap;

use tracing::info;

use crate::settings::task::{Batch, Proxy, ScrapeTask, ScraperKind};
use crate::settings::{LocaleEntry, TaskConfig};

/// Build catalog tasks per domain from the configured targets, assigning
/// proxies round-robin offset by the run id.
pub fn build_catalog_tasks(
    target_domains: HashMap<String, Vec<LocaleEntry>>,
    proxies: &[Proxy],
    run_id: i64,
) -> HashMap<String, Vec<ScrapeTask>> {
    let mut tasks: HashMap<String, Vec<ScrapeTask>> = HashMap::new();

    for (domain, entries) in target_domains {
        let mut proxy_index: usize = 0;
        let mut domain_tasks = Vec::new();
        for entry in entries {
            let config = entry.configuration.unwrap_or_else(TaskConfig::default);
            let mut task = ScrapeTask::new(
                ScraperKind::Catalog,
                domain.clone(),
                entry.locale,
                entry.url,
                config,
                run_id,
            );
            if task.config.use_proxy && !proxies.is_empty() {
                task.proxy =
                    Some(proxies[(proxy_index + run_id as usize) % proxies.len()].clone());
                proxy_index += 1;
            }
            domain_tasks.push(task);
        }
        tasks.insert(domain, domain_tasks);
    }

    tasks
}

/// Interleave tasks across domains: the largest domain forms the spine,
/// the rest (recursively interleaved themselves) are spliced in evenly, so
/// consecutive tasks share a domain only when the counts force it.
pub fn interleave_tasks(groups: HashMap<String, Vec<ScrapeTask>>) -> Vec<ScrapeTask> {
    let mut sorted: Vec<(String, Vec<ScrapeTask>)> = groups.into_iter().collect();
    sorted.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(&b.0)));
    interleave_sorted(sorted)
}

fn interleave_sorted(mut sorted: Vec<(String, Vec<ScrapeTask>)>) -> Vec<ScrapeTask> {
    if sorted.is_empty() {
        return Vec::new();
    }
    let mut reordered = sorted.remove(0).1;
    if sorted.is_empty() {
        return reordered;
    }

    let others = interleave_sorted(sorted);
    let spine_len = reordered.len();
    let n = others.len();

    // Split the rest into spine_len - 1 gaps; the first `remainder` gaps
    // take one extra item (the ceiling split), the rest the floor size.
    let gaps = spine_len.saturating_sub(1).max(1);
    let base = (n / gaps).max(1);
    let remainder = n as i64 - (base * gaps) as i64;
    let mut split_value = if remainder > 0 { base + 1 } else { base };

    let mut split_count: i64 = 1;
    let mut next_index: usize = 1;
    let mut records_added: usize = 0;

    for task in others {
        if records_added >= split_value {
            if remainder > 0 && split_count == remainder {
                split_value -= 1;
            }
            next_index += 1;
            split_count += 1;
            records_added = 0;
        }
        let at = next_index.min(reordered.len());
        reordered.insert(at, task);
        records_added += 1;
        next_index += 1;
    }

    reordered
}

/// Partition tasks into batches across the pool's windows: task `i` of the
/// `p`-th pool window lands in batch `i mod capacity + p·capacity`. The
/// first proxied task in a batch pins the batch's proxy round-robin.
pub fn batch_tasks(
    tasks: Vec<ScrapeTask>,
    batch_size: usize,
    pool_capacity: usize,
    proxies: &[Proxy],
) -> Vec<Batch> {
    if tasks.is_empty() {
        return Vec::new();
    }
    let batch_size = batch_size.max(1);
    let pool_capacity = pool_capacity.max(1);

    let batch_count = tasks.len().div_ceil(batch_size);
    let mut batches = vec![Batch::default(); batch_count];
    let window = batch_size * pool_capacity;
    let mut proxy_id = 0usize;

    let total = tasks.len();
    for (index, task) in tasks.into_iter().enumerate() {
        let p = index / window;
        let i = index % window;
        let batch_id = (i % pool_capacity + p * pool_capacity).min(batch_count - 1);

        if task.proxy.is_some() && batches[batch_id].proxy.is_none() && !proxies.is_empty() {
            batches[batch_id].proxy = Some(proxies[proxy_id % proxies.len()].clone());
            proxy_id += 1;
        }
        batches[batch_id].tasks.push(task);
    }

    info!(
        "prepared {total} tasks in {batch_count} batches with pool capacity {pool_capacity} and batch size {batch_size}"
    );
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(domain: &str, n: usize) -> ScrapeTask {
        ScrapeTask::new(
            ScraperKind::Catalog,
            domain,
            format!("l{n}"),
            format!("https://{domain}.example/{n}"),
            TaskConfig::default(),
            0,
        )
    }

    fn groups(shape: &[(&str, usize)]) -> HashMap<String, Vec<ScrapeTask>> {
        shape
            .iter()
            .map(|(domain, count)| {
                (
                    domain.to_string(),
                    (1..=*count).map(|n| task(domain, n)).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn interleave_pins_the_representative_permutation() {
        let result = interleave_tasks(groups(&[("a", 5), ("b", 2), ("c", 1)]));
        let order: Vec<String> = result
            .iter()
            .map(|t| format!("{}{}", t.domain, t.locale.trim_start_matches('l')))
            .collect();
        assert_eq!(order, vec!["a1", "b1", "a2", "c1", "a3", "b2", "a4", "a5"]);
    }

    #[test]
    fn interleave_avoids_consecutive_domains_where_possible() {
        let result = interleave_tasks(groups(&[("a", 4), ("b", 3), ("c", 2)]));
        assert_eq!(result.len(), 9);
        let mut consecutive = 0;
        for pair in result.windows(2) {
            if pair[0].domain == pair[1].domain {
                consecutive += 1;
            }
        }
        assert!(consecutive <= 1, "domains bunched up: {:?}", result.iter().map(|t| t.domain.clone()).collect::<Vec<_>>());
    }

    #[test]
    fn interleave_handles_single_domain() {
        let result = interleave_tasks(groups(&[("a", 3)]));
        assert_eq!(result.len(), 3);
        assert!(result.iter().all(|t| t.domain == "a"));
    }

    #[test]
    fn interleave_handles_empty_input() {
        assert!(interleave_tasks(HashMap::new()).is_empty());
    }

    #[test]
    fn batches_fill_pool_windows_in_order() {
        let tasks: Vec<ScrapeTask> = (0..10).map(|n| task("a", n)).collect();
        let batches = batch_tasks(tasks, 2, 2, &[]);

        // 10 tasks, batch size 2 → 5 batches; window of 4 spreads tasks
        // round-robin over two batches per pool window.
        assert_eq!(batches.len(), 5);
        assert_eq!(batches[0].tasks.len(), 2);
        assert_eq!(batches[0].tasks[0].locale, "l0");
        assert_eq!(batches[0].tasks[1].locale, "l2");
        assert_eq!(batches[1].tasks[0].locale, "l1");
        assert_eq!(batches[1].tasks[1].locale, "l3");
        assert_eq!(batches[4].tasks.len(), 2);
        let total: usize = batches.iter().map(|b| b.tasks.len()).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn first_proxied_task_pins_the_batch_proxy() {
        let proxy_pool = vec![Proxy {
            username: "u".into(),
            password: "p".into(),
            host: "10.0.0.1".into(),
            port: 8080,
        }];
        let mut tasks: Vec<ScrapeTask> = (0..4).map(|n| task("a", n)).collect();
        tasks[1].proxy = Some(proxy_pool[0].clone());

        let batches = batch_tasks(tasks, 4, 1, &proxy_pool);
        assert_eq!(batches.len(), 1);
        assert!(batches[0].proxy.is_some());
    }

    #[test]
    fn run_id_rotates_proxy_assignment() {
        let proxies = vec![
            Proxy { username: "u".into(), password: "p".into(), host: "h1".into(), port: 1 },
            Proxy { username: "u".into(), password: "p".into(), host: "h2".into(), port: 2 },
        ];
        let mut domains = HashMap::new();
        domains.insert(
            "a".to_string(),
            vec![LocaleEntry {
                locale: "lv".into(),
                url: "https://a.example/".into(),
                configuration: Some(TaskConfig {
                    use_proxy: true,
                    ..Default::default()
                }),
            }],
        );

        let run1 = build_catalog_tasks(domains.clone(), &proxies, 0);
        let run2 = build_catalog_tasks(domains, &proxies, 1);
        let host = |tasks: &HashMap<String, Vec<ScrapeTask>>| {
            tasks["a"][0].proxy.as_ref().map(|p| p.host.clone())
        };
        assert_ne!(host(&run1), host(&run2), "successive runs rotate proxies");
    }
}
