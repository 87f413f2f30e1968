use crate::core::error::{Error, ErrorKind, Result};
use crate::query::types::{FilterCondition, FilterOp, OrderBy, Query, QueryOp, SortOrder};

/// Maximum LIMIT accepted by the protocol.
pub const MAX_LIMIT: u32 = 1000;

/// A parsed protocol line.
#[derive(Debug, Clone)]
pub enum Command {
    Query(Query),
    Info,
    Config,
    DumpSave(Option<String>),
    DumpLoad { name: Option<String>, force: bool },
    ReplicationStart,
    ReplicationStop,
    ReplicationStatus,
    Sync(String),
    SyncStatus,
    DebugOn,
    DebugOff,
    Optimize(String),
}

/// Text-protocol command parser.
///
/// One request per line:
///   SEARCH <table> <text> [NOT t]... [AND t]... [FILTER col op val]...
///          [SORT col ASC|DESC] [LIMIT n] [OFFSET n]
///   COUNT <table> <text> [NOT t]... [AND t]... [FILTER col op val]...
///   GET <table> <primary_key>
/// plus the administrative commands (INFO, CONFIG, DUMP, REPLICATION,
/// SYNC, DEBUG, OPTIMIZE). Keywords are case-insensitive.
pub struct QueryParser {
    default_limit: u32,
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::new(ErrorKind::InvalidQuery, msg)
}

impl QueryParser {
    pub fn new(default_limit: u32) -> Self {
        QueryParser {
            default_limit: default_limit.min(MAX_LIMIT),
        }
    }

    pub fn parse(&self, line: &str) -> Result<Command> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Err(invalid("Empty query"));
        }

        match tokens[0].to_ascii_uppercase().as_str() {
            "SEARCH" => self.parse_search(&tokens).map(Command::Query),
            "COUNT" => self.parse_count(&tokens).map(Command::Query),
            "GET" => self.parse_get(&tokens).map(Command::Query),
            "INFO" => Ok(Command::Info),
            "CONFIG" => Ok(Command::Config),
            "DUMP" => self.parse_dump(&tokens),
            "REPLICATION" => self.parse_replication(&tokens),
            "SYNC" => self.parse_sync(&tokens),
            "DEBUG" => self.parse_debug(&tokens),
            "OPTIMIZE" => {
                if tokens.len() != 2 {
                    return Err(invalid("OPTIMIZE requires a table name"));
                }
                Ok(Command::Optimize(tokens[1].to_string()))
            }
            other => Err(invalid(format!("Unknown command: {}", other))),
        }
    }

    fn parse_search(&self, tokens: &[&str]) -> Result<Query> {
        if tokens.len() < 3 {
            return Err(invalid("SEARCH requires at least table and search text"));
        }
        let mut query = Query::new(QueryOp::Search, tokens[1]);
        query.search_text = tokens[2].to_string();
        query.limit = self.default_limit;
        self.parse_clauses(tokens, 3, &mut query, true)?;
        Ok(query)
    }

    fn parse_count(&self, tokens: &[&str]) -> Result<Query> {
        if tokens.len() < 3 {
            return Err(invalid("COUNT requires at least table and search text"));
        }
        let mut query = Query::new(QueryOp::Count, tokens[1]);
        query.search_text = tokens[2].to_string();
        self.parse_clauses(tokens, 3, &mut query, false)?;
        Ok(query)
    }

    fn parse_get(&self, tokens: &[&str]) -> Result<Query> {
        if tokens.len() != 3 {
            return Err(invalid("GET requires table and primary_key"));
        }
        let mut query = Query::new(QueryOp::Get, tokens[1]);
        query.primary_key = tokens[2].to_string();
        Ok(query)
    }

    fn parse_clauses(
        &self,
        tokens: &[&str],
        mut pos: usize,
        query: &mut Query,
        allow_paging: bool,
    ) -> Result<()> {
        while pos < tokens.len() {
            match tokens[pos].to_ascii_uppercase().as_str() {
                "NOT" => {
                    pos += 1;
                    let term = tokens
                        .get(pos)
                        .ok_or_else(|| invalid("NOT requires a term"))?;
                    query.not_terms.push(term.to_string());
                    pos += 1;
                }
                "AND" => {
                    pos += 1;
                    let term = tokens
                        .get(pos)
                        .ok_or_else(|| invalid("AND requires a term"))?;
                    query.and_terms.push(term.to_string());
                    pos += 1;
                }
                "FILTER" => {
                    let column = tokens
                        .get(pos + 1)
                        .ok_or_else(|| invalid("FILTER requires column, operator, and value"))?;
                    let op_token = tokens
                        .get(pos + 2)
                        .ok_or_else(|| invalid("FILTER requires column, operator, and value"))?;
                    let value = tokens
                        .get(pos + 3)
                        .ok_or_else(|| invalid("FILTER requires column, operator, and value"))?;
                    let op = FilterOp::parse(op_token)
                        .ok_or_else(|| invalid(format!("Invalid filter operator: {}", op_token)))?;
                    query.filters.push(FilterCondition {
                        column: column.to_string(),
                        op,
                        value: value.to_string(),
                    });
                    pos += 4;
                }
                "SORT" if allow_paging => {
                    let column = tokens
                        .get(pos + 1)
                        .ok_or_else(|| invalid("SORT requires column and direction"))?;
                    let direction = tokens
                        .get(pos + 2)
                        .ok_or_else(|| invalid("SORT requires column and direction"))?;
                    let order = match direction.to_ascii_uppercase().as_str() {
                        "ASC" => SortOrder::Asc,
                        "DESC" => SortOrder::Desc,
                        other => return Err(invalid(format!("Invalid sort direction: {}", other))),
                    };
                    query.order_by = Some(OrderBy {
                        column: column.to_string(),
                        order,
                    });
                    pos += 3;
                }
                "LIMIT" if allow_paging => {
                    let raw = tokens
                        .get(pos + 1)
                        .ok_or_else(|| invalid("LIMIT requires a number"))?;
                    let limit: u32 = raw
                        .parse()
                        .map_err(|_| invalid(format!("Invalid LIMIT value: {}", raw)))?;
                    if limit == 0 {
                        return Err(invalid("LIMIT must be positive"));
                    }
                    if limit > MAX_LIMIT {
                        return Err(invalid(format!("LIMIT exceeds maximum of {}", MAX_LIMIT)));
                    }
                    query.limit = limit;
                    query.limit_explicit = true;
                    pos += 2;
                }
                "OFFSET" if allow_paging => {
                    let raw = tokens
                        .get(pos + 1)
                        .ok_or_else(|| invalid("OFFSET requires a number"))?;
                    let offset: u32 = raw
                        .parse()
                        .map_err(|_| invalid(format!("Invalid OFFSET value: {}", raw)))?;
                    query.offset = offset;
                    pos += 2;
                }
                other => {
                    return Err(invalid(format!("Unknown keyword: {}", other)));
                }
            }
        }
        Ok(())
    }

    fn parse_dump(&self, tokens: &[&str]) -> Result<Command> {
        let sub = tokens
            .get(1)
            .ok_or_else(|| invalid("DUMP requires a subcommand (SAVE, LOAD)"))?;
        match sub.to_ascii_uppercase().as_str() {
            "SAVE" => Ok(Command::DumpSave(tokens.get(2).map(|s| s.to_string()))),
            "LOAD" => {
                let mut name = None;
                let mut force = false;
                for token in &tokens[2..] {
                    if token.eq_ignore_ascii_case("FORCE") {
                        force = true;
                    } else if name.is_none() {
                        name = Some(token.to_string());
                    } else {
                        return Err(invalid("DUMP LOAD takes at most one name"));
                    }
                }
                Ok(Command::DumpLoad { name, force })
            }
            other => Err(invalid(format!("Unknown DUMP subcommand: {}", other))),
        }
    }

    fn parse_replication(&self, tokens: &[&str]) -> Result<Command> {
        let sub = tokens
            .get(1)
            .ok_or_else(|| invalid("REPLICATION requires a subcommand (START, STOP, STATUS)"))?;
        match sub.to_ascii_uppercase().as_str() {
            "START" => Ok(Command::ReplicationStart),
            "STOP" => Ok(Command::ReplicationStop),
            "STATUS" => Ok(Command::ReplicationStatus),
            other => Err(invalid(format!("Unknown REPLICATION subcommand: {}", other))),
        }
    }

    fn parse_sync(&self, tokens: &[&str]) -> Result<Command> {
        let arg = tokens
            .get(1)
            .ok_or_else(|| invalid("SYNC requires a table name or STATUS"))?;
        if arg.eq_ignore_ascii_case("STATUS") {
            Ok(Command::SyncStatus)
        } else {
            Ok(Command::Sync(arg.to_string()))
        }
    }

    fn parse_debug(&self, tokens: &[&str]) -> Result<Command> {
        let arg = tokens
            .get(1)
            .ok_or_else(|| invalid("DEBUG requires ON or OFF"))?;
        match arg.to_ascii_uppercase().as_str() {
            "ON" => Ok(Command::DebugOn),
            "OFF" => Ok(Command::DebugOff),
            other => Err(invalid(format!("DEBUG requires ON or OFF, got {}", other))),
        }
    }
}
