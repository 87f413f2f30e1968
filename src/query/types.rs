use serde::Serialize;

/// Query command type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryOp {
    Search,
    Count,
    Get,
}

/// Filter comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl FilterOp {
    pub fn parse(op: &str) -> Option<FilterOp> {
        match op.to_ascii_uppercase().as_str() {
            "=" | "EQ" => Some(FilterOp::Eq),
            "!=" | "NE" => Some(FilterOp::Ne),
            "<" | "LT" => Some(FilterOp::Lt),
            "<=" | "LTE" => Some(FilterOp::Lte),
            ">" | "GT" => Some(FilterOp::Gt),
            ">=" | "GTE" => Some(FilterOp::Gte),
            _ => None,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Lte => "<=",
            FilterOp::Gt => ">",
            FilterOp::Gte => ">=",
        }
    }

    /// Equality tests are cheaper than range tests; the planner runs them
    /// first.
    pub fn is_equality(&self) -> bool {
        matches!(self, FilterOp::Eq | FilterOp::Ne)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterCondition {
    pub column: String,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

/// ORDER BY clause. An empty column means the primary key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub column: String,
    pub order: SortOrder,
}

impl OrderBy {
    pub fn primary_key_desc() -> Self {
        OrderBy {
            column: String::new(),
            order: SortOrder::Desc,
        }
    }

    pub fn is_primary_key(&self) -> bool {
        self.column.is_empty()
    }
}

/// A parsed query as consumed by the executor.
#[derive(Debug, Clone)]
pub struct Query {
    pub op: QueryOp,
    pub table: String,
    pub search_text: String,
    pub and_terms: Vec<String>,
    pub not_terms: Vec<String>,
    pub filters: Vec<FilterCondition>,
    pub order_by: Option<OrderBy>,
    pub limit: u32,
    pub limit_explicit: bool,
    pub offset: u32,
    pub primary_key: String, // GET only
    pub debug: bool,
}

impl Query {
    pub fn new(op: QueryOp, table: impl Into<String>) -> Self {
        Query {
            op,
            table: table.into(),
            search_text: String::new(),
            and_terms: Vec::new(),
            not_terms: Vec::new(),
            filters: Vec::new(),
            order_by: None,
            limit: 100,
            limit_explicit: false,
            offset: 0,
            primary_key: String::new(),
            debug: false,
        }
    }
}

/// Per-stage breakdown attached to replies when DEBUG is on.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DebugInfo {
    pub ngrams: Vec<String>,
    pub candidates_after_and: usize,
    pub candidates_after_not: usize,
    pub candidates_after_filter: usize,
    pub cache_hit: bool,
    pub elapsed_ms: f64,
}

impl DebugInfo {
    pub fn render(&self) -> String {
        format!(
            "DEBUG ngrams={} and={} not={} filter={} cache_hit={} elapsed_ms={:.3}",
            self.ngrams.len(),
            self.candidates_after_and,
            self.candidates_after_not,
            self.candidates_after_filter,
            self.cache_hit,
            self.elapsed_ms
        )
    }
}

/// Result page produced by the executor.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub total: usize,
    pub page: Vec<crate::core::types::Document>,
    pub debug: Option<DebugInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_op_parse() {
        assert_eq!(FilterOp::parse("="), Some(FilterOp::Eq));
        assert_eq!(FilterOp::parse("gte"), Some(FilterOp::Gte));
        assert_eq!(FilterOp::parse("<>"), None);
    }

    #[test]
    fn test_order_by_primary_key() {
        assert!(OrderBy::primary_key_desc().is_primary_key());
        let named = OrderBy {
            column: "score".into(),
            order: SortOrder::Asc,
        };
        assert!(!named.is_primary_key());
    }
}
