use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::core::config::{Config, TableConfig};
use crate::core::error::{Error, ErrorKind, Result};
use crate::index::inverted::Index;
use crate::storage::document_store::DocumentStore;

/// Everything owned by one mirrored table.
///
/// The `latch` makes a (store, index) mutation pair atomic with respect to
/// query execution: the apply path holds it exclusively across both calls,
/// the query path holds it shared across index lookup + attribute fetch.
/// Lifecycle operations empty `index` and `store` in place — the context
/// instance itself is never replaced while borrowers exist.
pub struct TableContext {
    pub name: String,
    pub config: TableConfig,
    pub index: Index,
    pub store: DocumentStore,
    pub latch: RwLock<()>,
}

impl std::fmt::Debug for TableContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TableContext {
    pub fn new(config: TableConfig, roaring_threshold: f64) -> Self {
        TableContext {
            name: config.name.clone(),
            index: Index::new(config.ngram_size, config.kanji_ngram_size, roaring_threshold),
            store: DocumentStore::new(),
            config,
            latch: RwLock::new(()),
        }
    }

    /// Empty both structures, preserving instance identity.
    pub fn clear_in_place(&self) {
        let _guard = self.latch.write();
        self.index.clear_in_place();
        self.store.clear_in_place();
    }
}

/// Named table registry built from configuration.
pub struct TableCatalog {
    tables: HashMap<String, Arc<TableContext>>,
}

impl TableCatalog {
    pub fn from_config(config: &Config) -> Self {
        let tables = config
            .tables
            .iter()
            .map(|table| {
                (
                    table.name.clone(),
                    Arc::new(TableContext::new(
                        table.clone(),
                        config.memory.roaring_threshold,
                    )),
                )
            })
            .collect();
        TableCatalog { tables }
    }

    pub fn get(&self, name: &str) -> Result<Arc<TableContext>> {
        self.tables.get(name).cloned().ok_or_else(|| {
            Error::new(ErrorKind::TableNotFound, format!("table not found: {}", name))
        })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Arc<TableContext>)> {
        self.tables.iter()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}
