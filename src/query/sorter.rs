use std::cmp::Ordering;

use crate::core::error::Result;
use crate::core::types::{AttributeValue, DocId};
use crate::query::types::{OrderBy, SortOrder};
use crate::storage::document_store::DocumentStore;

/// Below this many candidates, pre-computing sort keys costs more than the
/// repeated lookups it saves.
const SCHWARTZIAN_THRESHOLD: usize = 100;

/// Use partial sort when the needed prefix is under this share of the
/// candidate set.
const PARTIAL_SORT_THRESHOLD: f64 = 0.5;

/// Sample size for ORDER BY column validation.
const SORT_SAMPLE_SIZE: usize = 100;

/// Zero-pad widths and the signed offset that keep lexicographic order of
/// rendered numeric keys aligned with numeric order. The offset maps
/// i64 values into a positive domain (valid for |v| < 2^60); f64 keys hold
/// numeric order for non-negative values of magnitude below 10^13.
const NUMERIC_WIDTH: usize = 20;
const DOC_ID_WIDTH: usize = 10;
const SIGNED_OFFSET: i128 = 1 << 60;

/// Sorts candidate DocIds by primary key or a filter column and applies
/// LIMIT/OFFSET. Sorting happens in place before pagination; when the page
/// is a small prefix a partial sort keeps the cost at O(N log K).
pub struct ResultSorter;

/// Pairwise primary-key comparison: when both keys are non-empty pure-digit
/// ASCII strings they compare as unsigned integers (falling back to byte
/// order on overflow); otherwise byte order.
fn cmp_pk(a: &str, b: &str) -> Ordering {
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if digits(a) && digits(b) {
        if let (Ok(na), Ok(nb)) = (a.parse::<u64>(), b.parse::<u64>()) {
            return na.cmp(&nb);
        }
    }
    a.cmp(b)
}

fn render_attr_key(value: &AttributeValue) -> String {
    match value {
        AttributeValue::Null => String::new(),
        AttributeValue::Bool(v) => if *v { "1" } else { "0" }.to_string(),
        AttributeValue::I8(v) => render_signed(*v as i128),
        AttributeValue::I16(v) => render_signed(*v as i128),
        AttributeValue::I32(v) => render_signed(*v as i128),
        AttributeValue::I64(v) => render_signed(*v as i128),
        AttributeValue::U8(v) => format!("{:0width$}", v, width = NUMERIC_WIDTH),
        AttributeValue::U16(v) => format!("{:0width$}", v, width = NUMERIC_WIDTH),
        AttributeValue::U32(v) => format!("{:0width$}", v, width = NUMERIC_WIDTH),
        AttributeValue::Str(s) => s.clone(),
        AttributeValue::F64(v) => format!("{:0width$.6}", v, width = NUMERIC_WIDTH),
    }
}

fn render_signed(v: i128) -> String {
    format!("{:0width$}", v + SIGNED_OFFSET, width = NUMERIC_WIDTH)
}

impl ResultSorter {
    /// Sort `results` per the ORDER BY clause (default: primary key DESC)
    /// and return the `[offset, offset+limit)` page.
    pub fn sort_and_paginate(
        mut results: Vec<DocId>,
        store: &DocumentStore,
        order_by: Option<&OrderBy>,
        limit: u32,
        offset: u32,
        primary_key_column: &str,
    ) -> Result<Vec<DocId>> {
        if results.is_empty() {
            return Ok(Vec::new());
        }

        let default_order = OrderBy::primary_key_desc();
        let order_by = order_by.unwrap_or(&default_order);
        let pk_order = order_by.is_primary_key() || order_by.column == primary_key_column;
        let ascending = order_by.order == SortOrder::Asc;

        // Sample-based column validation. The primary key is always valid;
        // a named filter column is checked against the first few documents
        // and a warning is emitted when none of them carry it. Documents
        // missing the column sort as NULL (smallest) either way.
        if !pk_order {
            let sample = results.len().min(SORT_SAMPLE_SIZE);
            let found = results[..sample]
                .iter()
                .any(|&d| store.get_filter_value(d, &order_by.column).is_some());
            if !found {
                tracing::warn!(
                    column = %order_by.column,
                    sampled = sample,
                    "ORDER BY column not found in sampled documents; \
                     documents without it sort as NULL"
                );
            }
        }

        // offset + limit in u64 space, clamped to the candidate count
        let total_needed_64 = offset as u64 + limit as u64;
        let total_needed = (total_needed_64.min(results.len() as u64)) as usize;
        if total_needed == 0 {
            return Ok(Vec::new());
        }
        let partial =
            total_needed < results.len()
                && (total_needed as f64) < results.len() as f64 * PARTIAL_SORT_THRESHOLD;

        if pk_order {
            if results.len() >= SCHWARTZIAN_THRESHOLD {
                // Schwartzian transform: one store lookup per document, then
                // comparisons run on the materialized keys without touching
                // the store lock again.
                let mut keyed: Vec<(String, DocId)> = results
                    .iter()
                    .map(|&d| (Self::pk_key(d, store), d))
                    .collect();
                let cmp = |a: &(String, DocId), b: &(String, DocId)| {
                    let ord = cmp_pk(&a.0, &b.0);
                    if ascending { ord } else { ord.reverse() }
                };
                if partial {
                    keyed.select_nth_unstable_by(total_needed - 1, cmp);
                    keyed[..total_needed].sort_unstable_by(cmp);
                    keyed.truncate(total_needed);
                } else {
                    keyed.sort_unstable_by(cmp);
                }
                results = keyed.into_iter().map(|(_, d)| d).collect();
            } else {
                let cmp = |&a: &DocId, &b: &DocId| {
                    let ka = Self::pk_key(a, store);
                    let kb = Self::pk_key(b, store);
                    let ord = cmp_pk(&ka, &kb);
                    if ascending { ord } else { ord.reverse() }
                };
                if partial {
                    results.select_nth_unstable_by(total_needed - 1, cmp);
                    results[..total_needed].sort_unstable_by(cmp);
                } else {
                    results.sort_unstable_by(cmp);
                }
            }
        } else {
            let column = order_by.column.as_str();
            let cmp = |&a: &DocId, &b: &DocId| {
                let ka = Self::attr_key(a, store, column);
                let kb = Self::attr_key(b, store, column);
                let ord = ka.cmp(&kb);
                if ascending { ord } else { ord.reverse() }
            };
            if partial {
                results.select_nth_unstable_by(total_needed - 1, cmp);
                results[..total_needed].sort_unstable_by(cmp);
            } else {
                results.sort_unstable_by(cmp);
            }
        }

        let start = (offset as usize).min(results.len());
        let end = total_needed.max(start).min(results.len());
        Ok(results[start..end].to_vec())
    }

    fn pk_key(doc_id: DocId, store: &DocumentStore) -> String {
        match store.get_primary_key(doc_id) {
            Some(pk) => pk,
            // Missing mapping: fall back to the DocId itself, zero-padded so
            // it compares numerically against other fallbacks
            None => format!("{:0width$}", doc_id.0, width = DOC_ID_WIDTH),
        }
    }

    fn attr_key(doc_id: DocId, store: &DocumentStore, column: &str) -> String {
        match store.get_filter_value(doc_id, column) {
            Some(value) => render_attr_key(&value),
            // NULL sorts first
            None => String::new(),
        }
    }
}
