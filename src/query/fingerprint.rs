use crate::analysis::normalize::collapse_whitespace;
use crate::query::types::{Query, QueryOp, SortOrder};

/// Canonical cache key for a query.
///
/// Two queries that must return identical results produce the same
/// fingerprint: the table name is lowercased, whitespace in the search text
/// (ASCII space, tab, U+3000) collapses to single spaces, AND/NOT terms and
/// filters are sorted, and the ORDER BY clause is preserved as-is. The
/// numeric limit always participates — two defaulted limits with different
/// values must not collide, while an explicit and a defaulted limit of the
/// same value do.
pub fn fingerprint(query: &Query) -> String {
    let mut and_terms = query.and_terms.clone();
    and_terms.sort();
    let mut not_terms = query.not_terms.clone();
    not_terms.sort();

    let mut filters: Vec<String> = query
        .filters
        .iter()
        .map(|f| format!("{}{}{}", f.column, f.op.symbol(), f.value))
        .collect();
    filters.sort();

    let order = match &query.order_by {
        Some(order_by) => format!(
            "{}:{}",
            order_by.column,
            match order_by.order {
                SortOrder::Asc => "asc",
                SortOrder::Desc => "desc",
            }
        ),
        None => String::new(),
    };

    // SEARCH and COUNT over the same parameters cache different payloads
    // and must not collide
    let op = match query.op {
        QueryOp::Search => "search",
        QueryOp::Count => "count",
        QueryOp::Get => "get",
    };

    format!(
        "c={}|t={}|q={}|and={}|not={}|f={}|o={}|l={}|s={}",
        op,
        query.table.to_lowercase(),
        collapse_whitespace(&query.search_text),
        and_terms.join(","),
        not_terms.join(","),
        filters.join(","),
        order,
        query.limit,
        query.offset
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::types::{FilterCondition, FilterOp, QueryOp};

    fn base() -> Query {
        let mut q = Query::new(QueryOp::Search, "Posts");
        q.search_text = "hello world".to_string();
        q.limit = 100;
        q
    }

    #[test]
    fn test_whitespace_collapses() {
        let mut a = base();
        a.search_text = "hello   world".into();
        let mut b = base();
        b.search_text = "hello\t\u{3000}world".into();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_table_case_insensitive() {
        let a = base();
        let mut b = base();
        b.table = "posts".into();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_filter_order_canonical() {
        let mut a = base();
        a.filters = vec![
            FilterCondition { column: "user_id".into(), op: FilterOp::Eq, value: "123".into() },
            FilterCondition { column: "status".into(), op: FilterOp::Eq, value: "active".into() },
        ];
        let mut b = base();
        b.filters = a.filters.iter().rev().cloned().collect();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_term_order_canonical() {
        let mut a = base();
        a.and_terms = vec!["x".into(), "y".into()];
        a.not_terms = vec!["p".into(), "q".into()];
        let mut b = base();
        b.and_terms = vec!["y".into(), "x".into()];
        b.not_terms = vec!["q".into(), "p".into()];
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_default_limits_with_different_values_differ() {
        let mut a = base();
        a.limit = 100;
        a.limit_explicit = false;
        let mut b = base();
        b.limit = 50;
        b.limit_explicit = false;
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_search_and_count_do_not_collide() {
        let a = base();
        let mut b = base();
        b.op = QueryOp::Count;
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn test_explicit_flag_alone_does_not_differ() {
        let mut a = base();
        a.limit = 50;
        a.limit_explicit = false;
        let mut b = base();
        b.limit = 50;
        b.limit_explicit = true;
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }
}
