//! Read-mostly lookup tables
//!
//! Table-sourced attribute rules (makes, models, fuel types) draw their
//! examples from small database tables that rarely change. The cache keeps
//! a snapshot per table and is refreshed in the background every fifteen
//! minutes; lookups never touch the database on the hot path.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{info, warn};

use crate::store::Store;

/// Synchronous lookup interface used by the value tagger.
pub trait TableLookup: Send + Sync {
    fn table_values(&self, table: &str) -> Vec<String>;
}

/// Database-backed table cache with periodic refresh.
pub struct TableCache {
    store: Arc<Store>,
    cache: DashMap<String, Vec<String>>,
}

impl TableCache {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: DashMap::new(),
        }
    }

    /// Load a table into the cache; missing tables cache as empty so they
    /// are not re-queried every page.
    pub async fn load(&self, table: &str) -> Vec<String> {
        match self.store.get_table_values(table).await {
            Ok(values) => {
                self.cache.insert(table.to_string(), values.clone());
                values
            }
            Err(e) => {
                warn!("failed to load lookup table {table}: {e}");
                self.cache.entry(table.to_string()).or_default().clone()
            }
        }
    }

    /// Warm the cache for every table the given rules reference.
    pub async fn warm(&self, tables: impl IntoIterator<Item = String>) {
        for table in tables {
            self.load(&table).await;
        }
    }

    /// Re-pull every cached table on an interval. Runs until dropped.
    pub fn spawn_refresh(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let tables: Vec<String> = cache.cache.iter().map(|e| e.key().clone()).collect();
                info!("refreshing {} lookup tables", tables.len());
                for table in tables {
                    cache.load(&table).await;
                }
            }
        })
    }
}

impl TableLookup for TableCache {
    fn table_values(&self, table: &str) -> Vec<String> {
        self.cache.get(table).map(|v| v.clone()).unwrap_or_default()
    }
}

/// Fixed in-memory tables, for tests and debug runs.
#[derive(Debug, Clone, Default)]
pub struct StaticTables(pub std::collections::HashMap<String, Vec<String>>);

impl TableLookup for StaticTables {
    fn table_values(&self, table: &str) -> Vec<String> {
        self.0.get(table).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_tables_resolve_known_names() {
        let mut map = std::collections::HashMap::new();
        map.insert("makes".to_string(), vec!["Audi".to_string(), "BMW".to_string()]);
        let tables = StaticTables(map);
        assert_eq!(tables.table_values("makes").len(), 2);
        assert!(tables.table_values("unknown").is_empty());
    }
}
