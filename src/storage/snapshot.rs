use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::core::catalog::TableCatalog;
use crate::core::config::DumpConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::lifecycle::coordinator::LifecycleCoordinator;

/// Writes and restores full-process dumps: one document-store stream plus
/// one index companion stream per table, produced together under the
/// coordinator's read-only latch so a reloaded pair is self-consistent.
///
/// Automatic snapshots are named `auto_YYYYMMDD_HHMMSS`; retention keeps
/// the newest K `auto_`-prefixed dump files and never touches anything
/// else. Manual names are validated to stay inside the dump directory.
pub struct DumpManager {
    dir: PathBuf,
    default_name: String,
    retain: usize,
}

impl DumpManager {
    pub fn new(config: &DumpConfig) -> Result<Self> {
        let dir = PathBuf::from(&config.dir);
        std::fs::create_dir_all(&dir)?;
        let default_name = config
            .default_filename
            .trim_end_matches(".dmp")
            .to_string();
        Ok(DumpManager {
            dir,
            default_name,
            retain: config.retain,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Validate a user-supplied dump name: plain file names only, no
    /// traversal out of the dump directory.
    fn validate_name(&self, name: &str) -> Result<String> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name.contains("..")
            || Path::new(name).is_absolute()
        {
            return Err(Error::new(
                ErrorKind::InvalidQuery,
                format!("invalid dump name: {}", name),
            ));
        }
        Ok(name.trim_end_matches(".dmp").to_string())
    }

    fn store_path(&self, base: &str, table: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.dmp", base, table))
    }

    fn index_path(&self, base: &str, table: &str) -> PathBuf {
        self.dir.join(format!("{}_{}.idx", base, table))
    }

    fn auto_base() -> String {
        chrono::Local::now().format("auto_%Y%m%d_%H%M%S").to_string()
    }

    /// Save every table under the given name (default when None). Returns
    /// the base path of the written dump set.
    pub fn save(
        &self,
        catalog: &TableCatalog,
        coordinator: &Arc<LifecycleCoordinator>,
        cursor: &str,
        name: Option<&str>,
    ) -> Result<PathBuf> {
        let base = match name {
            Some(name) => self.validate_name(name)?,
            None => self.default_name.clone(),
        };
        self.save_base(catalog, coordinator, cursor, &base)
    }

    /// Save with an automatic timestamped name, then apply retention.
    pub fn save_auto(
        &self,
        catalog: &TableCatalog,
        coordinator: &Arc<LifecycleCoordinator>,
        cursor: &str,
    ) -> Result<PathBuf> {
        let base = Self::auto_base();
        let path = self.save_base(catalog, coordinator, cursor, &base)?;
        self.apply_retention()?;
        Ok(path)
    }

    fn save_base(
        &self,
        catalog: &TableCatalog,
        coordinator: &Arc<LifecycleCoordinator>,
        cursor: &str,
        base: &str,
    ) -> Result<PathBuf> {
        // Pauses replication and blocks writes for the duration; the guard
        // restores both flags on every exit path
        let _guard = coordinator.begin_dump_save()?;

        for (table, context) in catalog.iter() {
            let store_path = self.store_path(base, table);
            let mut store_writer = BufWriter::new(File::create(&store_path)?);
            context.store.save_to(&mut store_writer, cursor)?;

            let index_path = self.index_path(base, table);
            let mut index_writer = BufWriter::new(File::create(&index_path)?);
            context.index.save_to(&mut index_writer)?;
        }

        tracing::info!(base, "dump saved");
        Ok(self.dir.join(base))
    }

    /// Restore every table from the named dump set. The embedded cursor is
    /// returned; unless `force` is set, a cursor that disagrees with the
    /// currently-known one is rejected to prevent a silent rewind.
    pub fn load(
        &self,
        catalog: &TableCatalog,
        coordinator: &Arc<LifecycleCoordinator>,
        current_cursor: &str,
        name: Option<&str>,
        force: bool,
    ) -> Result<(PathBuf, String)> {
        let base = match name {
            Some(name) => self.validate_name(name)?,
            None => self.default_name.clone(),
        };

        let _guard = coordinator.begin_dump_load()?;

        let mut restored_cursor = String::new();
        let mut first = true;
        for (table, context) in catalog.iter() {
            let store_path = self.store_path(&base, table);
            let mut store_reader = BufReader::new(File::open(&store_path).map_err(|_| {
                Error::new(
                    ErrorKind::Codec,
                    format!("dump file not found: {}", store_path.display()),
                )
            })?);

            let embedded = {
                let _latch = context.latch.write();
                context.store.load_from(&mut store_reader)?
            };

            if first {
                first = false;
                if !force && !current_cursor.is_empty() && embedded != current_cursor {
                    // Undo the partial restore before bailing
                    context.clear_in_place();
                    return Err(Error::new(
                        ErrorKind::PreconditionFailed,
                        format!(
                            "dump cursor '{}' disagrees with current cursor '{}'; \
                             use FORCE to load anyway",
                            embedded, current_cursor
                        ),
                    ));
                }
                restored_cursor = embedded;
            }

            let index_path = self.index_path(&base, table);
            let mut index_reader = BufReader::new(File::open(&index_path).map_err(|_| {
                Error::new(
                    ErrorKind::Codec,
                    format!("index dump not found: {}", index_path.display()),
                )
            })?);
            let _latch = context.latch.write();
            context.index.load_from(&mut index_reader)?;
        }

        tracing::info!(base, cursor = %restored_cursor, "dump loaded");
        Ok((self.dir.join(base), restored_cursor))
    }

    /// Delete the oldest `auto_` dump files beyond the retention count,
    /// along with their index companions. Files without the prefix are
    /// never touched.
    fn apply_retention(&self) -> Result<()> {
        if self.retain == 0 {
            return Ok(());
        }
        let mut auto_dumps: Vec<(std::time::SystemTime, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.starts_with("auto_") && file_name.ends_with(".dmp") {
                let modified = entry
                    .metadata()?
                    .modified()
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                auto_dumps.push((modified, entry.path()));
            }
        }
        if auto_dumps.len() <= self.retain {
            return Ok(());
        }
        auto_dumps.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, stale) in auto_dumps.split_off(self.retain) {
            tracing::info!(path = %stale.display(), "retention removed auto dump");
            let _ = std::fs::remove_file(&stale);
            let companion = stale.with_extension("idx");
            let _ = std::fs::remove_file(companion);
        }
        Ok(())
    }

    /// Background timer performing periodic auto-dumps. A zero interval
    /// disables it entirely.
    pub fn spawn_auto_dump_timer(
        self: Arc<Self>,
        catalog: Arc<TableCatalog>,
        coordinator: Arc<LifecycleCoordinator>,
        cursor_fn: Arc<dyn Fn() -> String + Send + Sync>,
        interval_sec: u64,
    ) {
        if interval_sec == 0 {
            return;
        }
        let registrar = Arc::clone(&coordinator);
        let handle = std::thread::Builder::new()
            .name("auto-dump".to_string())
            .spawn(move || {
                let interval = Duration::from_secs(interval_sec);
                let mut last = Instant::now();
                while !coordinator.is_shutdown_requested() {
                    std::thread::sleep(Duration::from_millis(200));
                    if last.elapsed() < interval {
                        continue;
                    }
                    last = Instant::now();
                    let cursor = cursor_fn();
                    if let Err(err) = self.save_auto(&catalog, &coordinator, &cursor) {
                        tracing::error!(error = %err, "auto dump failed");
                    }
                }
            })
            .expect("failed to spawn auto-dump timer");
        registrar.register_worker(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;
    use crate::core::types::{AttributeValue, Attributes};

    fn setup(dir: &Path) -> (Arc<TableCatalog>, Arc<LifecycleCoordinator>, DumpManager) {
        let raw = r#"{"tables": [{"name": "posts", "ngram_size": 2, "kanji_ngram_size": 2}]}"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        let catalog = Arc::new(TableCatalog::from_config(&config));
        let coordinator = Arc::new(LifecycleCoordinator::new());
        let dump_config = DumpConfig {
            dir: dir.to_string_lossy().to_string(),
            default_filename: "ngramdb.dmp".to_string(),
            interval_sec: 0,
            retain: 2,
        };
        let manager = DumpManager::new(&dump_config).unwrap();
        (catalog, coordinator, manager)
    }

    fn populate(catalog: &TableCatalog) {
        let context = catalog.get("posts").unwrap();
        let mut attrs = Attributes::new();
        attrs.insert("score".to_string(), AttributeValue::I32(7));
        let id = context.store.add_document("pk-1", attrs).unwrap();
        context.index.add_document(id, "hello dump world");
    }

    #[test]
    fn test_save_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let (catalog, coordinator, manager) = setup(tmp.path());
        populate(&catalog);

        manager
            .save(&catalog, &coordinator, "uuid:1-10", Some("snap"))
            .unwrap();

        // Wipe and restore
        catalog.get("posts").unwrap().clear_in_place();
        let (_, cursor) = manager
            .load(&catalog, &coordinator, "", Some("snap"), false)
            .unwrap();
        assert_eq!(cursor, "uuid:1-10");

        let context = catalog.get("posts").unwrap();
        assert_eq!(context.store.len(), 1);
        let doc_id = context.store.get_doc_id("pk-1").unwrap();
        assert_eq!(
            context.store.get_filter_value(doc_id, "score"),
            Some(AttributeValue::I32(7))
        );
        // Index restored from its companion: searchable again
        assert_eq!(
            context.index.search_and(&["he".to_string()], 0, false),
            vec![doc_id]
        );
        // Lifecycle flags restored
        assert!(!coordinator.is_read_only());
        assert!(!coordinator.is_loading());
    }

    #[test]
    fn test_load_rejects_cursor_rewind_without_force() {
        let tmp = tempfile::tempdir().unwrap();
        let (catalog, coordinator, manager) = setup(tmp.path());
        populate(&catalog);
        manager
            .save(&catalog, &coordinator, "uuid:1-10", Some("old"))
            .unwrap();

        let err = manager
            .load(&catalog, &coordinator, "uuid:1-50", Some("old"), false)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::PreconditionFailed);

        // FORCE overrides
        let (_, cursor) = manager
            .load(&catalog, &coordinator, "uuid:1-50", Some("old"), true)
            .unwrap();
        assert_eq!(cursor, "uuid:1-10");
    }

    #[test]
    fn test_traversal_names_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (catalog, coordinator, manager) = setup(tmp.path());
        for bad in ["../escape", "/etc/passwd", "a/b", "..", ""] {
            let err = manager
                .save(&catalog, &coordinator, "", Some(bad))
                .unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidQuery, "name: {}", bad);
        }
    }

    #[test]
    fn test_retention_keeps_newest_auto_dumps_only() {
        let tmp = tempfile::tempdir().unwrap();
        let (catalog, coordinator, manager) = setup(tmp.path());
        populate(&catalog);

        // A manual dump must survive retention
        manager
            .save(&catalog, &coordinator, "", Some("keepme"))
            .unwrap();

        // Simulate older auto dumps; write order gives distinct mtimes
        for name in ["auto_20200101_000001", "auto_20200101_000002", "auto_20200101_000003"] {
            let path = tmp.path().join(format!("{}_posts.dmp", name));
            std::fs::write(&path, b"MGDS").unwrap();
            std::fs::write(tmp.path().join(format!("{}_posts.idx", name)), b"MGIX").unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }

        manager.save_auto(&catalog, &coordinator, "uuid:1-1").unwrap();

        let remaining: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        let auto_dmp = remaining
            .iter()
            .filter(|n| n.starts_with("auto_") && n.ends_with(".dmp"))
            .count();
        assert_eq!(auto_dmp, 2, "retain=2 keeps two auto dumps: {:?}", remaining);
        assert!(remaining.iter().any(|n| n.starts_with("keepme_")));
    }

    #[test]
    fn test_load_missing_dump_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let (catalog, coordinator, manager) = setup(tmp.path());
        let err = manager
            .load(&catalog, &coordinator, "", Some("absent"), false)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Codec);
    }
}
