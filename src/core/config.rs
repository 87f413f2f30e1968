use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::core::error::Result;

/// Text source for a table: a single column, or several concatenated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextSource {
    Column { column: String },
    Concat { concat: Vec<String>, delimiter: String },
}

impl Default for TextSource {
    fn default() -> Self {
        TextSource::Column {
            column: "text".to_string(),
        }
    }
}

/// A predicate a row must satisfy to be mirrored at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequiredFilter {
    pub column: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TableConfig {
    pub name: String,
    pub primary_key: String,
    pub ngram_size: usize,
    pub kanji_ngram_size: usize,
    pub text_source: TextSource,
    pub filters: Vec<String>,
    pub required_filters: Vec<RequiredFilter>,
}

impl Default for TableConfig {
    fn default() -> Self {
        TableConfig {
            name: String::new(),
            primary_key: "id".to_string(),
            ngram_size: 2,
            kanji_ngram_size: 2,
            text_source: TextSource::default(),
            filters: Vec::new(),
            required_filters: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    pub mode: String,
    pub batch_size: usize,
    pub parallelism: usize,
    pub throttle_ms: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            mode: "auto".to_string(),
            batch_size: 1000,
            parallelism: 0, // 0 = CPU count
            throttle_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub enable: bool,
    pub auto_initial_snapshot: bool,
    pub server_id: u32,
    pub start_from: String,
    pub queue_size: usize,
    pub reconnect_backoff_min_ms: u64,
    pub reconnect_backoff_max_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            enable: false,
            auto_initial_snapshot: true,
            server_id: 11016,
            start_from: String::new(),
            queue_size: 10000,
            reconnect_backoff_min_ms: 500,
            reconnect_backoff_max_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    pub nfkc: bool,
    pub width: bool,
    pub lower: bool,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        NormalizeConfig {
            nfkc: true,
            width: true,
            lower: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub hard_limit_mb: usize,
    pub soft_target_mb: usize,
    pub roaring_threshold: f64,
    pub normalize: NormalizeConfig,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        MemoryConfig {
            hard_limit_mb: 0, // 0 = unlimited
            soft_target_mb: 0,
            roaring_threshold: 0.18,
            normalize: NormalizeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DumpConfig {
    pub dir: String,
    pub default_filename: String,
    pub interval_sec: u64, // 0 disables auto-dump
    pub retain: usize,
}

impl Default for DumpConfig {
    fn default() -> Self {
        DumpConfig {
            dir: "./dumps".to_string(),
            default_filename: "ngramdb.dmp".to_string(),
            interval_sec: 0,
            retain: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            bind: "0.0.0.0".to_string(),
            port: 11016,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enable: bool,
    pub bind: String,
    pub port: u16,
    pub enable_cors: bool,
    pub cors_allow_origin: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            enable: false,
            bind: "0.0.0.0".to_string(),
            port: 8080,
            enable_cors: false,
            cors_allow_origin: "*".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub tcp: TcpConfig,
    pub http: HttpConfig,
    pub default_limit: u32,
    pub max_query_length: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            tcp: TcpConfig::default(),
            http: HttpConfig::default(),
            default_limit: 100,
            max_query_length: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkConfig {
    pub allow_cidrs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    pub batch_size: usize,
    pub max_delay_ms: u64,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        InvalidationConfig {
            batch_size: 100,
            max_delay_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_memory_mb: usize,
    pub min_query_cost_ms: f64,
    pub ttl_seconds: u64, // 0 = no expiry
    pub invalidation_strategy: String,
    pub compression_enabled: bool,
    pub eviction_batch_size: usize,
    pub invalidation: InvalidationConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            max_memory_mb: 64,
            min_query_cost_ms: 10.0,
            ttl_seconds: 0,
            invalidation_strategy: "ngram".to_string(),
            compression_enabled: false,
            eviction_batch_size: 10,
            invalidation: InvalidationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Materialized application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub tables: Vec<TableConfig>,
    pub build: BuildConfig,
    pub replication: ReplicationConfig,
    pub memory: MemoryConfig,
    pub dump: DumpConfig,
    pub api: ApiConfig,
    pub network: NetworkConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    /// Render the configuration as key: value lines with sensitive fields
    /// masked. Used by the CONFIG command and /config endpoint.
    pub fn sanitized_lines(&self) -> Vec<String> {
        let value = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        let mut lines = Vec::new();
        flatten_masked("", &value, &mut lines);
        lines.sort();
        lines
    }
}

/// Any key whose name contains one of these (case-insensitive) is masked.
const SENSITIVE_MARKERS: [&str; 4] = ["password", "secret", "key", "token"];

fn is_sensitive(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_MARKERS.iter().any(|m| lower.contains(m))
}

fn flatten_masked(prefix: &str, value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                let path = if prefix.is_empty() {
                    k.clone()
                } else {
                    format!("{}.{}", prefix, k)
                };
                if is_sensitive(k) && !v.is_object() && !v.is_array() {
                    out.push(format!("{}: ***", path));
                } else {
                    flatten_masked(&path, v, out);
                }
            }
        }
        serde_json::Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                flatten_masked(&format!("{}[{}]", prefix, i), v, out);
            }
        }
        other => out.push(format!("{}: {}", prefix, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.default_limit, 100);
        assert_eq!(config.memory.roaring_threshold, 0.18);
        assert_eq!(config.cache.invalidation.batch_size, 100);
        assert_eq!(config.dump.retain, 5);
    }

    #[test]
    fn test_parse_table_config() {
        let raw = r#"{
            "tables": [{
                "name": "posts",
                "primary_key": "id",
                "ngram_size": 3,
                "kanji_ngram_size": 2,
                "text_source": {"concat": ["title", "body"], "delimiter": " "},
                "filters": ["user_id", "status"],
                "required_filters": [{"column": "visible", "value": "1"}]
            }]
        }"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(config.tables.len(), 1);
        let table = &config.tables[0];
        assert_eq!(table.ngram_size, 3);
        assert!(matches!(table.text_source, TextSource::Concat { .. }));
        assert_eq!(table.required_filters[0].column, "visible");
    }

    #[test]
    fn test_sensitive_masking() {
        let raw = r#"{"replication": {"start_from": "uuid:1-5"}}"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        let lines = config.sanitized_lines();
        // primary_key is a structural name, not a secret, but any *password*
        // or *secret* style key must come out masked
        assert!(lines.iter().any(|l| l.contains("replication.start_from")));
        assert!(!lines.iter().any(|l| l.to_lowercase().contains("password") && !l.ends_with("***")));
    }
}
