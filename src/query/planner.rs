use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use crate::analysis::normalize::normalize;
use crate::core::catalog::{TableCatalog, TableContext};
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::types::{AttributeValue, DocId, Document};
use crate::query::cache::{CacheManager, CacheMetadata};
use crate::query::fingerprint::fingerprint;
use crate::query::sorter::ResultSorter;
use crate::query::types::{
    DebugInfo, FilterCondition, FilterOp, Query, QueryOp, SearchOutcome, SortOrder,
};

/// Executes parsed queries against the catalog: cache lookup, n-gram AND
/// search, NOT subtraction, attribute filters, sort + paginate, document
/// materialization, cache fill.
pub struct QueryExecutor {
    catalog: Arc<TableCatalog>,
    cache: Arc<CacheManager>,
}

impl QueryExecutor {
    pub fn new(catalog: Arc<TableCatalog>, cache: Arc<CacheManager>) -> Self {
        QueryExecutor { catalog, cache }
    }

    pub fn execute(&self, query: &Query) -> Result<SearchOutcome> {
        match query.op {
            QueryOp::Search | QueryOp::Count => self.execute_search(query),
            QueryOp::Get => {
                let doc = self.get_document(&query.table, &query.primary_key)?;
                Ok(SearchOutcome {
                    total: 1,
                    page: vec![doc],
                    debug: None,
                })
            }
        }
    }

    pub fn get_document(&self, table: &str, primary_key: &str) -> Result<Document> {
        let context = self.catalog.get(table)?;
        let _latch = context.latch.read();
        let doc_id = context.store.get_doc_id(primary_key).ok_or_else(|| {
            Error::new(
                ErrorKind::DocumentNotFound,
                format!("Document not found: {}", primary_key),
            )
        })?;
        context.store.get_document(doc_id).ok_or_else(|| {
            Error::new(
                ErrorKind::DocumentNotFound,
                format!("Document not found: {}", primary_key),
            )
        })
    }

    fn execute_search(&self, query: &Query) -> Result<SearchOutcome> {
        let started = Instant::now();
        let context = self.catalog.get(&query.table)?;
        let generator = context.index.generator();

        // Positive terms: the union of the search text's and the AND terms'
        // n-grams — every one of them must match
        let mut positive: HashSet<String> = generator.generate(&normalize(&query.search_text));
        for term in &query.and_terms {
            positive.extend(generator.generate(&normalize(term)));
        }
        let mut negative: HashSet<String> = HashSet::new();
        for term in &query.not_terms {
            negative.extend(generator.generate(&normalize(term)));
        }

        let mut debug = query.debug.then(|| DebugInfo {
            ngrams: positive.iter().cloned().collect(),
            ..DebugInfo::default()
        });

        // Touched ngrams for invalidation cover everything consulted
        let mut touched = positive.clone();
        touched.extend(negative.iter().cloned());

        let key = fingerprint(query);
        if let Some((docs, total)) = self.cache.lookup(&key) {
            let page = self.materialize(&context, &docs);
            if let Some(d) = debug.as_mut() {
                d.cache_hit = true;
                d.elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
            }
            return Ok(SearchOutcome {
                total,
                page,
                debug,
            });
        }

        let positive_terms: Vec<String> = positive.into_iter().collect();
        if positive_terms.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidQuery,
                "search text produced no indexable terms",
            ));
        }

        // Limit pushdown is only sound when nothing downstream can drop or
        // reorder candidates beyond DocId order
        let order_by = query.order_by.clone();
        let pk_order = order_by
            .as_ref()
            .map(|o| o.is_primary_key() || o.column == context.config.primary_key)
            .unwrap_or(true);
        let descending = order_by
            .as_ref()
            .map(|o| o.order == SortOrder::Desc)
            .unwrap_or(true);
        let pushdown_ok = query.op == QueryOp::Search
            && query.not_terms.is_empty()
            && query.filters.is_empty()
            && pk_order;
        let (push_limit, reverse) = if pushdown_ok {
            (
                (query.offset as usize).saturating_add(query.limit as usize),
                descending,
            )
        } else {
            (0, false)
        };

        let _latch = context.latch.read();

        let mut candidates = context.index.search_and(&positive_terms, push_limit, reverse);
        if let Some(d) = debug.as_mut() {
            d.candidates_after_and = candidates.len();
        }

        if !query.not_terms.is_empty() {
            let negative_terms: Vec<String> = negative.iter().cloned().collect();
            candidates = context.index.search_not(&candidates, &negative_terms);
        }
        if let Some(d) = debug.as_mut() {
            d.candidates_after_not = candidates.len();
        }

        if !query.filters.is_empty() {
            candidates = self.apply_filters(&context, candidates, &query.filters);
        }
        if let Some(d) = debug.as_mut() {
            d.candidates_after_filter = candidates.len();
        }

        let total = candidates.len();

        let page_ids = if query.op == QueryOp::Search {
            ResultSorter::sort_and_paginate(
                candidates,
                &context.store,
                order_by.as_ref(),
                query.limit,
                query.offset,
                &context.config.primary_key,
            )?
        } else {
            Vec::new()
        };

        let page = self.materialize(&context, &page_ids);
        drop(_latch);

        let cost_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.cache.insert(
            key,
            page_ids,
            total,
            CacheMetadata {
                table: query.table.to_lowercase(),
                ngrams: touched,
            },
            cost_ms,
        );

        if let Some(d) = debug.as_mut() {
            d.elapsed_ms = cost_ms;
        }
        Ok(SearchOutcome {
            total,
            page,
            debug,
        })
    }

    /// Run filter conditions over the candidates. Equality conditions are
    /// cheaper than range conditions and run first.
    fn apply_filters(
        &self,
        context: &TableContext,
        candidates: Vec<DocId>,
        filters: &[FilterCondition],
    ) -> Vec<DocId> {
        let mut ordered: Vec<&FilterCondition> = filters.iter().collect();
        ordered.sort_by_key(|f| if f.op.is_equality() { 0 } else { 1 });

        candidates
            .into_iter()
            .filter(|&doc_id| {
                ordered.iter().all(|condition| {
                    let value = context.store.get_filter_value(doc_id, &condition.column);
                    match_condition(value.as_ref(), condition.op, &condition.value)
                })
            })
            .collect()
    }

    fn materialize(&self, context: &TableContext, doc_ids: &[DocId]) -> Vec<Document> {
        doc_ids
            .iter()
            .filter_map(|&d| context.store.get_document(d))
            .collect()
    }
}

/// Compare an attribute against the filter's string operand. Numeric
/// attributes compare numerically when the operand parses; everything else
/// falls back to string comparison of the rendered value. A missing
/// attribute satisfies only `!=`.
fn match_condition(value: Option<&AttributeValue>, op: FilterOp, operand: &str) -> bool {
    let Some(value) = value else {
        return op == FilterOp::Ne;
    };

    let ordering = match value {
        AttributeValue::Null => return op == FilterOp::Ne,
        AttributeValue::Bool(v) => {
            let lhs = *v as i64;
            match operand.parse::<i64>() {
                Ok(rhs) => lhs.partial_cmp(&rhs),
                Err(_) => return op == FilterOp::Ne,
            }
        }
        AttributeValue::I8(v) => numeric_cmp(*v as i64, operand),
        AttributeValue::I16(v) => numeric_cmp(*v as i64, operand),
        AttributeValue::I32(v) => numeric_cmp(*v as i64, operand),
        AttributeValue::I64(v) => numeric_cmp(*v, operand),
        AttributeValue::U8(v) => unsigned_cmp(*v as u64, operand),
        AttributeValue::U16(v) => unsigned_cmp(*v as u64, operand),
        AttributeValue::U32(v) => unsigned_cmp(*v as u64, operand),
        AttributeValue::F64(v) => match operand.parse::<f64>() {
            Ok(rhs) => v.partial_cmp(&rhs),
            Err(_) => return op == FilterOp::Ne,
        },
        AttributeValue::Str(s) => Some(s.as_str().cmp(operand)),
    };

    let Some(ordering) = ordering else {
        // Unordered (NaN comparisons)
        return op == FilterOp::Ne;
    };

    match op {
        FilterOp::Eq => ordering == std::cmp::Ordering::Equal,
        FilterOp::Ne => ordering != std::cmp::Ordering::Equal,
        FilterOp::Lt => ordering == std::cmp::Ordering::Less,
        FilterOp::Lte => ordering != std::cmp::Ordering::Greater,
        FilterOp::Gt => ordering == std::cmp::Ordering::Greater,
        FilterOp::Gte => ordering != std::cmp::Ordering::Less,
    }
}

fn numeric_cmp(lhs: i64, operand: &str) -> Option<std::cmp::Ordering> {
    operand.parse::<i64>().ok().map(|rhs| lhs.cmp(&rhs))
}

fn unsigned_cmp(lhs: u64, operand: &str) -> Option<std::cmp::Ordering> {
    operand.parse::<u64>().ok().map(|rhs| lhs.cmp(&rhs))
}
