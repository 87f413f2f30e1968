use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, bounded};
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::ReplicationConfig;
use crate::core::error::{Error, ErrorKind, Result};
use crate::lifecycle::coordinator::LifecycleCoordinator;
use crate::replication::apply::BinlogApplyEngine;
use crate::replication::event::BinlogEvent;

/// Stream of parsed binlog events. The production implementation wraps the
/// source database connection; tests feed channels or vectors.
pub trait EventSource: Send {
    /// Block for the next event. `Ok(None)` is a quiet tick (no event
    /// within the poll interval); `SourceTransient` errors trigger bounded
    /// exponential backoff; anything else halts the runner.
    fn next_event(&mut self) -> Result<Option<BinlogEvent>>;
}

/// EventSource backed by a bounded crossbeam channel. The external binlog
/// reader owns the `Sender`; the runner drains the `Receiver`.
pub struct ChannelSource {
    receiver: Receiver<BinlogEvent>,
    poll_interval: Duration,
}

impl ChannelSource {
    pub fn bounded(queue_size: usize) -> (Sender<BinlogEvent>, ChannelSource) {
        let (sender, receiver) = bounded(queue_size.max(1));
        (
            sender,
            ChannelSource {
                receiver,
                poll_interval: Duration::from_millis(100),
            },
        )
    }
}

impl EventSource for ChannelSource {
    fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
        match self.receiver.recv_timeout(self.poll_interval) {
            Ok(event) => Ok(Some(event)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::new(
                ErrorKind::SourceTransient,
                "binlog reader disconnected",
            )),
        }
    }
}

/// Drives the apply engine from an event source on a dedicated thread.
///
/// Transient source errors retry with exponential backoff bounded by the
/// configured min/max; while backing off the coordinator's reconnecting
/// flag is set so REPLICATION STATUS can report it. The loop exits when
/// shutdown is requested, when replication is stopped through the
/// coordinator, or on a fatal internal error.
pub struct ReplicationRunner {
    engine: Arc<BinlogApplyEngine>,
    coordinator: Arc<LifecycleCoordinator>,
    config: ReplicationConfig,
}

impl ReplicationRunner {
    pub fn new(
        engine: Arc<BinlogApplyEngine>,
        coordinator: Arc<LifecycleCoordinator>,
        config: ReplicationConfig,
    ) -> Self {
        ReplicationRunner {
            engine,
            coordinator,
            config,
        }
    }

    pub fn run(&self, source: &mut dyn EventSource) {
        let min_backoff = Duration::from_millis(self.config.reconnect_backoff_min_ms.max(1));
        let max_backoff = Duration::from_millis(
            self.config
                .reconnect_backoff_max_ms
                .max(self.config.reconnect_backoff_min_ms.max(1)),
        );
        let mut backoff = min_backoff;

        while self.coordinator.is_replication_running()
            && !self.coordinator.is_shutdown_requested()
        {
            if self.coordinator.is_replication_paused_for_dump() {
                std::thread::sleep(Duration::from_millis(20));
                continue;
            }

            match source.next_event() {
                Ok(Some(event)) => {
                    backoff = min_backoff;
                    self.coordinator.set_source_reconnecting(false);
                    match self.engine.process_event(&event) {
                        Ok(()) => {}
                        Err(err) if err.kind == ErrorKind::SourceFatal => {
                            // Row-level decode problem: logged and skipped,
                            // the stream continues
                            tracing::error!(error = %err, "fatal row error; row skipped");
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "apply engine halted");
                            let _ = self.coordinator.stop_replication();
                            return;
                        }
                    }
                }
                Ok(None) => {
                    self.coordinator.set_source_reconnecting(false);
                }
                Err(err) if err.is_transient() => {
                    self.coordinator.set_source_reconnecting(true);
                    tracing::warn!(
                        error = %err,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient source error; backing off"
                    );
                    std::thread::sleep(backoff);
                    backoff = (backoff * 2).min(max_backoff);
                }
                Err(err) => {
                    tracing::error!(error = %err, "replication source failed");
                    let _ = self.coordinator.stop_replication();
                    self.coordinator.set_source_reconnecting(false);
                    return;
                }
            }
        }
        self.coordinator.set_source_reconnecting(false);
    }

    /// Spawn the runner on its own thread, registered with the coordinator
    /// for shutdown joining.
    pub fn spawn(self, mut source: Box<dyn EventSource>) {
        let coordinator = Arc::clone(&self.coordinator);
        let handle = std::thread::Builder::new()
            .name("binlog-apply".to_string())
            .spawn(move || self.run(source.as_mut()))
            .expect("failed to spawn replication runner");
        coordinator.register_worker(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::TableCatalog;
    use crate::core::config::Config;
    use crate::core::stats::ServerStats;
    use crate::query::cache::{CacheManager, QueryCache};
    use crate::query::invalidation::InvalidationQueue;
    use crate::replication::event::RowImage;

    fn setup() -> (Arc<TableCatalog>, Arc<BinlogApplyEngine>, Arc<LifecycleCoordinator>) {
        let raw = r#"{"tables": [{"name": "posts", "ngram_size": 2, "kanji_ngram_size": 2}]}"#;
        let config: Config = serde_json::from_str(raw).unwrap();
        let catalog = Arc::new(TableCatalog::from_config(&config));
        let manager = Arc::new(CacheManager::new(QueryCache::new(
            1 << 20,
            0.0,
            0,
            false,
            10,
            true,
        )));
        let queue = InvalidationQueue::new(manager, Arc::clone(&catalog), 100, 50);
        let stats = Arc::new(ServerStats::new());
        let engine = Arc::new(BinlogApplyEngine::new(
            Arc::clone(&catalog),
            queue,
            stats,
            "uuid:1-1".to_string(),
        ));
        let coordinator = Arc::new(LifecycleCoordinator::new());
        (catalog, engine, coordinator)
    }

    fn replication_config() -> ReplicationConfig {
        ReplicationConfig {
            reconnect_backoff_min_ms: 1,
            reconnect_backoff_max_ms: 5,
            ..ReplicationConfig::default()
        }
    }

    #[test]
    fn test_events_flow_through_channel() {
        let (catalog, engine, coordinator) = setup();
        coordinator.start_replication("uuid:1-1").unwrap();

        let (sender, source) = ChannelSource::bounded(100);
        let runner = ReplicationRunner::new(
            Arc::clone(&engine),
            Arc::clone(&coordinator),
            replication_config(),
        );
        runner.spawn(Box::new(source));

        sender
            .send(BinlogEvent::Insert {
                table: "posts".into(),
                row: RowImage::new("1", "streamed row"),
            })
            .unwrap();
        sender
            .send(BinlogEvent::Gtid("uuid:1-2".into()))
            .unwrap();

        // Wait for the apply thread to drain
        for _ in 0..100 {
            if engine.cursor() == "uuid:1-2" {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(engine.cursor(), "uuid:1-2");
        let context = catalog.get("posts").unwrap();
        assert_eq!(context.store.len(), 1);

        coordinator.stop_replication().unwrap();
        coordinator.shutdown();
    }

    #[test]
    fn test_transient_errors_back_off_then_recover() {
        struct FlakySource {
            failures_left: usize,
            sent: bool,
        }
        impl EventSource for FlakySource {
            fn next_event(&mut self) -> Result<Option<BinlogEvent>> {
                if self.failures_left > 0 {
                    self.failures_left -= 1;
                    return Err(Error::new(ErrorKind::SourceTransient, "flaky"));
                }
                if !self.sent {
                    self.sent = true;
                    return Ok(Some(BinlogEvent::Gtid("uuid:1-7".into())));
                }
                Ok(None)
            }
        }

        let (_, engine, coordinator) = setup();
        coordinator.start_replication("uuid:1-1").unwrap();
        let runner = ReplicationRunner::new(
            Arc::clone(&engine),
            Arc::clone(&coordinator),
            replication_config(),
        );
        let mut source = FlakySource {
            failures_left: 3,
            sent: false,
        };

        let handle = std::thread::spawn(move || runner.run(&mut source));
        for _ in 0..100 {
            if engine.cursor() == "uuid:1-7" {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(engine.cursor(), "uuid:1-7");
        coordinator.stop_replication().unwrap();
        handle.join().unwrap();
        assert!(!coordinator.is_source_reconnecting());
    }

    #[test]
    fn test_runner_stops_on_coordinator_stop() {
        let (_, engine, coordinator) = setup();
        coordinator.start_replication("uuid:1-1").unwrap();
        let (_sender, source) = ChannelSource::bounded(10);
        let runner = ReplicationRunner::new(
            Arc::clone(&engine),
            Arc::clone(&coordinator),
            replication_config(),
        );
        runner.spawn(Box::new(source));

        coordinator.stop_replication().unwrap();
        // Shutdown joins the runner; the loop observes the cleared flag
        coordinator.shutdown();
        assert!(!coordinator.is_replication_running());
    }
}
