use crate::core::types::Attributes;

/// One row as seen by the binlog reader: the primary key, the extracted and
/// normalized indexable text, and the mirrored filter attributes.
#[derive(Debug, Clone)]
pub struct RowImage {
    pub primary_key: String,
    pub text: String,
    pub attrs: Attributes,
}

impl RowImage {
    pub fn new(primary_key: impl Into<String>, text: impl Into<String>) -> Self {
        RowImage {
            primary_key: primary_key.into(),
            text: text.into(),
            attrs: Attributes::new(),
        }
    }

    pub fn with_attrs(mut self, attrs: Attributes) -> Self {
        self.attrs = attrs;
        self
    }
}

/// A parsed change event delivered by the external binlog reader.
///
/// TableMap events carry source-side schema bookkeeping and require no
/// apply step; Gtid events advance the replication cursor.
#[derive(Debug, Clone)]
pub enum BinlogEvent {
    Insert {
        table: String,
        row: RowImage,
    },
    Update {
        table: String,
        old: RowImage,
        new: RowImage,
    },
    Delete {
        table: String,
        old: RowImage,
    },
    TableMap {
        table_id: u64,
        table: String,
    },
    Gtid(String),
}

impl BinlogEvent {
    pub fn table(&self) -> Option<&str> {
        match self {
            BinlogEvent::Insert { table, .. }
            | BinlogEvent::Update { table, .. }
            | BinlogEvent::Delete { table, .. }
            | BinlogEvent::TableMap { table, .. } => Some(table),
            BinlogEvent::Gtid(_) => None,
        }
    }
}
