pub mod api;
pub mod classify;
pub mod collector;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod notify;
pub mod record;
pub mod rules;
pub mod snapshot;
pub mod store;

use anyhow::Result;
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::api::{ApiServer, ApiServerHandle};
use crate::collector::SyntheticSource;
use crate::engine::Engine;
use crate::notify::{StubNotifier, WebhookNotifier};
use crate::snapshot::SnapshotWriter;

pub use crate::engine::{EngineState, EngineStatus};
pub use crate::error::{EngineError, EngineResult};
pub use crate::record::{AttrValue, Record, Severity, ThreatEvent, ThreatReason};
pub use crate::rules::{Comparator, Rule};

/// Статистика работы демона.
///
/// Собирает счётчики цикла наблюдения: количество итераций, записанных
/// снапшотов и ошибок записи. Логируется периодически (каждые 10 итераций).
///
/// # Примеры использования
///
/// ```no_run
/// use netsentry_core::DaemonStats;
///
/// let mut stats = DaemonStats::new();
/// stats.record_iteration();
/// stats.record_snapshot_write();
/// stats.log_stats();
/// ```
#[derive(Debug, Clone, serde::Serialize)]
pub struct DaemonStats {
    /// Общее количество итераций цикла наблюдения.
    total_iterations: u64,
    /// Количество успешно записанных снапшотов.
    snapshot_writes: u64,
    /// Количество ошибок записи снапшота.
    snapshot_errors: u64,
}

impl DaemonStats {
    /// Создаёт новую статистику с нулевыми значениями.
    pub fn new() -> Self {
        Self {
            total_iterations: 0,
            snapshot_writes: 0,
            snapshot_errors: 0,
        }
    }

    /// Увеличивает счётчик итераций цикла наблюдения.
    pub fn record_iteration(&mut self) {
        self.total_iterations += 1;
    }

    /// Увеличивает счётчик успешно записанных снапшотов.
    pub fn record_snapshot_write(&mut self) {
        self.snapshot_writes += 1;
    }

    /// Увеличивает счётчик ошибок записи снапшота.
    pub fn record_snapshot_error(&mut self) {
        self.snapshot_errors += 1;
    }

    pub fn total_iterations(&self) -> u64 {
        self.total_iterations
    }

    /// Логирует статистику работы демона.
    pub fn log_stats(&self) {
        info!(
            "Daemon stats: {} iterations, {} snapshots written, {} snapshot errors",
            self.total_iterations, self.snapshot_writes, self.snapshot_errors
        );
    }
}

impl Default for DaemonStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Главный цикл демона: движок, API сервер, периодические снапшоты.
///
/// Демон работает до получения сигнала завершения через `shutdown_rx`.
/// Для корректного завершения отправьте сигнал через соответствующий
/// `watch::Sender`.
///
/// # Примеры использования
///
/// ```no_run
/// use netsentry_core::{config::Config, run_daemon};
/// use tokio::sync::watch;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config = Config::load("configs/netsentry.yml")?;
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
///
/// let daemon_handle = tokio::spawn(async move {
///     run_daemon(config, shutdown_rx).await
/// });
///
/// // Позже отправляем сигнал завершения
/// shutdown_tx.send(true)?;
/// daemon_handle.await??;
/// # Ok(())
/// # }
/// ```
///
/// # Ошибки
///
/// Возвращает ошибку, если не удалось запустить движок. Ошибки записи
/// снапшота и недоступность API сервера не останавливают демон: они
/// логируются, демон продолжает работу с урезанной функциональностью.
pub async fn run_daemon(config: Config, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
    info!("Initializing NetSentry daemon");
    config.validate()?;

    let engine = Engine::new(config.clone());

    // Подписчики на события угроз: всегда лог, вебхук при наличии URL
    engine.register_callback(Arc::new(StubNotifier)).await;
    if let Some(ref url) = config.notifications.webhook_url {
        info!("Registering webhook notifier for {}", url);
        let notifier = WebhookNotifier::new(url.clone())
            .with_timeout(config.notifications.webhook_timeout_secs);
        engine.register_callback(Arc::new(notifier)).await;
    }

    // Запуск API сервера (если указан адрес)
    let mut api_server_handle: Option<ApiServerHandle> = None;
    if let Some(ref api_addr_str) = config.paths.api_listen_addr {
        match api_addr_str.parse::<std::net::SocketAddr>() {
            Ok(addr) => {
                let api_server = ApiServer::new(addr, engine.clone());
                match api_server.start().await {
                    Ok(handle) => {
                        api_server_handle = Some(handle);
                        info!("API server started successfully on {}", addr);
                    }
                    Err(e) => {
                        warn!("Failed to start API server: {}. Continuing without API.", e);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "Invalid API listen address '{}': {}. API server will not start.",
                    api_addr_str, e
                );
            }
        }
    } else {
        debug!("API server disabled (api_listen_addr not configured)");
    }

    let snapshot_writer = config.paths.snapshot_path.as_ref().map(|path| {
        info!("Writing state snapshots to {}", path);
        SnapshotWriter::new(path, config.paths.snapshot_recent_threats)
    });
    let snapshot_interval = Duration::from_secs(config.paths.snapshot_interval_secs);

    let source = Box::new(SyntheticSource::from_settings(&config.collector));
    engine
        .start(source)
        .await
        .map_err(|e| anyhow::anyhow!("failed to start engine: {e}"))?;

    info!("NetSentry daemon started, entering supervision loop");

    let mut stats = DaemonStats::new();
    const STATS_LOG_INTERVAL: u64 = 10;
    loop {
        if *shutdown_rx.borrow_and_update() {
            info!("Shutdown signal received, exiting supervision loop");
            break;
        }

        stats.record_iteration();

        if let Some(ref writer) = snapshot_writer {
            match writer.write(&engine).await {
                Ok(()) => stats.record_snapshot_write(),
                Err(e) => {
                    warn!("Failed to write snapshot: {:#}", e);
                    stats.record_snapshot_error();
                }
            }
        }

        if stats.total_iterations() % STATS_LOG_INTERVAL == 0 {
            stats.log_stats();
            let status = engine.get_status().await;
            info!(
                "Engine status: {} records stored, {} threats stored, {} blocked sources, {} threats raised total",
                status.records_stored,
                status.threats_stored,
                status.blocked_sources,
                status.stats.threats_raised
            );
        }

        tokio::select! {
            _ = tokio::time::sleep(snapshot_interval) => {}
            _ = shutdown_rx.changed() => {}
        }
    }

    if let Err(e) = engine.stop().await {
        warn!("Engine stop reported an error: {}", e);
    }

    // Снапшот после stop() показал бы уже очищенные хранилища,
    // поэтому финальной записи нет
    stats.log_stats();

    if let Some(handle) = api_server_handle {
        info!("Stopping API server");
        if let Err(e) = handle.shutdown().await {
            warn!("Failed to stop API server gracefully: {}", e);
        }
    }

    info!(
        "NetSentry daemon stopped after {} iterations",
        stats.total_iterations()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daemon_stats_counts_iterations_and_writes() {
        let mut stats = DaemonStats::new();
        assert_eq!(stats.total_iterations(), 0);

        stats.record_iteration();
        stats.record_iteration();
        stats.record_snapshot_write();
        stats.record_snapshot_error();

        assert_eq!(stats.total_iterations(), 2);
        assert_eq!(stats.snapshot_writes, 1);
        assert_eq!(stats.snapshot_errors, 1);
    }

    #[tokio::test]
    async fn daemon_exits_on_shutdown_signal() {
        let config = Config::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { run_daemon(config, shutdown_rx).await });

        // Даём демону время войти в цикл наблюдения
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("daemon did not stop in time")
            .expect("daemon task panicked");
        assert!(result.is_ok());
    }
}
