use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::core::catalog::{TableCatalog, TableContext};
use crate::core::config::TableConfig;
use crate::core::error::Result;
use crate::core::stats::ServerStats;
use crate::core::types::Attributes;
use crate::query::invalidation::InvalidationQueue;
use crate::replication::event::{BinlogEvent, RowImage};

/// Applies parsed binlog events to the (DocumentStore, Index) pair of the
/// target table.
///
/// Each data event runs under the table's write latch so the pair mutates
/// as a unit: a query holding the read latch either sees both effects or
/// neither. Within the latch, INSERT/UPDATE write the store before the
/// index and DELETE removes from the index before the store. After every
/// successful apply the cursor advances and the invalidation queue learns
/// about the touched texts.
pub struct BinlogApplyEngine {
    catalog: Arc<TableCatalog>,
    invalidation: Arc<InvalidationQueue>,
    cursor: RwLock<String>,
    stats: Arc<ServerStats>,
}

/// Does the row satisfy every configured required-filter predicate?
fn passes_required_filters(config: &TableConfig, attrs: &Attributes) -> bool {
    config.required_filters.iter().all(|required| {
        attrs
            .get(&required.column)
            .map(|value| value.display_string() == required.value)
            .unwrap_or(false)
    })
}

impl BinlogApplyEngine {
    pub fn new(
        catalog: Arc<TableCatalog>,
        invalidation: Arc<InvalidationQueue>,
        stats: Arc<ServerStats>,
        start_cursor: String,
    ) -> Self {
        BinlogApplyEngine {
            catalog,
            invalidation,
            cursor: RwLock::new(start_cursor),
            stats,
        }
    }

    pub fn cursor(&self) -> String {
        self.cursor.read().clone()
    }

    pub fn set_cursor(&self, cursor: String) {
        *self.cursor.write() = cursor;
    }

    pub fn process_event(&self, event: &BinlogEvent) -> Result<()> {
        match event {
            BinlogEvent::Gtid(gtid) => {
                *self.cursor.write() = gtid.clone();
                Ok(())
            }
            BinlogEvent::TableMap { .. } => Ok(()),
            BinlogEvent::Insert { table, row } => self.apply_insert(table, row),
            BinlogEvent::Update { table, old, new } => self.apply_update(table, old, new),
            BinlogEvent::Delete { table, old } => self.apply_delete(table, old),
        }
    }

    fn context(&self, table: &str) -> Option<Arc<TableContext>> {
        match self.catalog.get(table) {
            Ok(context) => Some(context),
            Err(_) => {
                // Not a mirrored table: the reader filters most of these,
                // but a late config change can let one through
                tracing::debug!(table, "event for unmirrored table ignored");
                None
            }
        }
    }

    fn note_skipped(&self, table: &str, reason: &str) {
        self.stats.replication_rows_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::error!(table, reason, "row skipped; absent until next SYNC");
    }

    fn apply_insert(&self, table: &str, row: &RowImage) -> Result<()> {
        let Some(context) = self.context(table) else {
            return Ok(());
        };
        if row.primary_key.is_empty() {
            self.note_skipped(table, "insert row has no primary key");
            return Ok(());
        }
        if !passes_required_filters(&context.config, &row.attrs) {
            self.stats.replication_rows_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        {
            let _latch = context.latch.write();
            let doc_id = context.store.add_document(&row.primary_key, row.attrs.clone())?;
            context.index.add_document(doc_id, &row.text);
        }

        self.stats.replication_events_applied.fetch_add(1, Ordering::Relaxed);
        self.invalidation.enqueue(table, "", &row.text);
        Ok(())
    }

    fn apply_update(&self, table: &str, old: &RowImage, new: &RowImage) -> Result<()> {
        let Some(context) = self.context(table) else {
            return Ok(());
        };
        if new.primary_key.is_empty() {
            self.note_skipped(table, "update row has no primary key");
            return Ok(());
        }

        let was_indexed = context.store.get_doc_id(&old.primary_key).is_some();
        let now_matches = passes_required_filters(&context.config, &new.attrs);

        match (was_indexed, now_matches) {
            (false, true) => return self.apply_insert(table, new),
            (true, false) => return self.apply_delete(table, old),
            (false, false) => return Ok(()),
            (true, true) => {}
        }

        {
            let _latch = context.latch.write();
            // Re-read inside the latch: the row may have raced a DELETE
            let Some(doc_id) = context.store.get_doc_id(&old.primary_key) else {
                return self.apply_insert(table, new);
            };
            context.store.update_document(doc_id, new.attrs.clone())?;
            context.index.update_document(doc_id, &old.text, &new.text);
        }

        self.stats.replication_events_applied.fetch_add(1, Ordering::Relaxed);
        self.invalidation.enqueue(table, &old.text, &new.text);
        Ok(())
    }

    fn apply_delete(&self, table: &str, old: &RowImage) -> Result<()> {
        let Some(context) = self.context(table) else {
            return Ok(());
        };

        let removed = {
            let _latch = context.latch.write();
            match context.store.get_doc_id(&old.primary_key) {
                Some(doc_id) => {
                    // Index first, then store: a reader that still finds the
                    // terms also still finds the document
                    context.index.remove_document(doc_id, &old.text);
                    context.store.remove_document(doc_id)
                }
                // Deleting an absent row is not an error
                None => false,
            }
        };

        if removed {
            self.stats.replication_events_applied.fetch_add(1, Ordering::Relaxed);
            self.invalidation.enqueue(table, &old.text, "");
        }
        Ok(())
    }
}
