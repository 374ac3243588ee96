//! Движок NetSentry: явный контекст конвейера и планировщик фоновых задач.
//!
//! Движок связывает хранилища, набор правил, блок-листы, классификатор и
//! диспетчер под одним `RwLock` и передаётся коллабораторам явно — никакого
//! глобального изменяемого состояния. Планировщик имеет ровно два состояния
//! (STOPPED и RUNNING): отдельного PAUSED нет, остановка — это остановка.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::classify::{Blocklists, Classifier};
use crate::collector::RecordSource;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::error::{EngineError, EngineResult};
use crate::notify::Notifier;
use crate::record::{AttrValue, Record, ThreatEvent};
use crate::rules::{Rule, RuleSet};
use crate::store::{RecordStore, ThreatStore};

/// Состояние планировщика.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineState {
    Stopped,
    Running,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Stopped => write!(f, "stopped"),
            EngineState::Running => write!(f, "running"),
        }
    }
}

/// Счётчики конвейера.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    /// Всего принятых записей.
    pub records_ingested: u64,
    /// Отклонённых (малформированных) записей.
    pub records_rejected: u64,
    /// Порождённых событий угроз.
    pub threats_raised: u64,
    /// Автоматических блокировок источников.
    pub auto_blocks: u64,
    /// Время последней принятой записи.
    pub last_record_at: Option<DateTime<Utc>>,
}

/// Срез состояния движка для API, снапшотов и логов.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub records_stored: usize,
    pub threats_stored: usize,
    pub rules_total: usize,
    pub rules_enabled: usize,
    pub blocked_sources: usize,
    pub blocked_ports: usize,
    pub stats: IngestStats,
}

struct EngineInner {
    records: RecordStore,
    threats: ThreatStore,
    rules: RuleSet,
    blocklists: Blocklists,
    stats: IngestStats,
}

/// Движок конвейера: приём записей, классификация, диспетчеризация,
/// административные операции и планировщик.
///
/// Дёшево клонируется: все поля за `Arc`.
#[derive(Clone)]
pub struct Engine {
    config: Arc<Config>,
    classifier: Classifier,
    inner: Arc<RwLock<EngineInner>>,
    dispatcher: Arc<RwLock<Dispatcher>>,
    state: Arc<RwLock<EngineState>>,
    shutdown_tx: Arc<Mutex<Option<watch::Sender<bool>>>>,
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Engine {
    pub fn new(config: Config) -> Self {
        let classifier = Classifier::new(config.classifier.clone());
        let record_retention = ChronoDuration::seconds(config.retention.record_retention_secs as i64);
        let threat_retention = ChronoDuration::seconds(config.retention.threat_retention_secs as i64);
        let inner = EngineInner {
            records: RecordStore::new(config.retention.max_records, record_retention),
            threats: ThreatStore::new(config.retention.max_threats, threat_retention),
            rules: RuleSet::new(),
            blocklists: Blocklists::default(),
            stats: IngestStats::default(),
        };
        let dispatcher = Dispatcher::new(config.notifications.min_severity);

        Self {
            config: Arc::new(config),
            classifier,
            inner: Arc::new(RwLock::new(inner)),
            dispatcher: Arc::new(RwLock::new(dispatcher)),
            state: Arc::new(RwLock::new(EngineState::Stopped)),
            shutdown_tx: Arc::new(Mutex::new(None)),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Публичная точка входа конвейера: принять наблюдение и вернуть
    /// порождённую угрозу, если она есть.
    pub async fn submit_record(
        &self,
        source_key: impl Into<String>,
        attributes: HashMap<String, AttrValue>,
    ) -> EngineResult<Option<ThreatEvent>> {
        let mut record = Record::new(source_key);
        record.attributes = attributes;
        self.ingest(record).await
    }

    /// Принимает полностью сформированную запись (цикл сбора, реплей трафика).
    ///
    /// Порядок обработки: вставка в хранилище, затем классификатор
    /// (первое совпадение побеждает), затем пороговые правила — только
    /// если классификатор ничего не нашёл.
    pub async fn ingest(&self, record: Record) -> EngineResult<Option<ThreatEvent>> {
        if record.source_key.trim().is_empty() {
            warn!("Rejected record with empty source key");
            self.inner.write().await.stats.records_rejected += 1;
            return Err(EngineError::MalformedRecord(
                "source_key must not be empty".to_string(),
            ));
        }

        let now = record.timestamp;
        let mut inner = self.inner.write().await;
        inner.records.insert(record.clone());
        inner.stats.records_ingested += 1;
        inner.stats.last_record_at = Some(now);

        let EngineInner {
            records,
            threats,
            rules,
            blocklists,
            stats,
        } = &mut *inner;

        let classified = self.classifier.classify(&record, blocklists, records, now);
        let events = match classified {
            Some(threat) => vec![threat],
            None => rules.evaluate(&record, now),
        };

        if events.is_empty() {
            return Ok(None);
        }

        // Архивация и авто-блокировка атомарны с записью события
        let dispatcher = self.dispatcher.read().await;
        for threat in &events {
            stats.threats_raised += 1;
            if dispatcher.archive(threat, threats, blocklists) {
                stats.auto_blocks += 1;
            }
        }

        // Рассылка подписчикам может упереться в сетевой таймаут,
        // поэтому лок хранилищ отпускается до неё
        drop(inner);
        for threat in &events {
            dispatcher.notify_subscribers(threat).await;
        }

        Ok(events.into_iter().next())
    }

    // --- Административные операции ---

    pub async fn add_rule(&self, rule: Rule) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        inner.rules.add(rule)
    }

    pub async fn update_rule(&self, rule: Rule) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        inner.rules.update(rule)
    }

    pub async fn remove_rule(&self, id: &str) -> EngineResult<Rule> {
        let mut inner = self.inner.write().await;
        inner.rules.remove(id)
    }

    pub async fn export_rules(&self) -> EngineResult<String> {
        let inner = self.inner.read().await;
        inner.rules.export_json()
    }

    pub async fn import_rules(&self, json: &str) -> EngineResult<usize> {
        let mut inner = self.inner.write().await;
        inner.rules.import_json(json)
    }

    pub async fn rules(&self) -> Vec<Rule> {
        let inner = self.inner.read().await;
        inner.rules.iter().cloned().collect()
    }

    /// Блокирует источник; повторная блокировка идемпотентна.
    pub async fn block_source(&self, source_key: impl Into<String>) -> bool {
        let mut inner = self.inner.write().await;
        inner.blocklists.block_source(source_key)
    }

    pub async fn unblock_source(&self, source_key: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.blocklists.unblock_source(source_key)
    }

    pub async fn block_port(&self, port: u16) -> bool {
        let mut inner = self.inner.write().await;
        inner.blocklists.block_port(port)
    }

    pub async fn unblock_port(&self, port: u16) -> bool {
        let mut inner = self.inner.write().await;
        inner.blocklists.unblock_port(port)
    }

    pub async fn blocklists(&self) -> Blocklists {
        let inner = self.inner.read().await;
        inner.blocklists.clone()
    }

    /// Регистрирует подписчика на события угроз.
    pub async fn register_callback(&self, notifier: Arc<dyn Notifier>) {
        let mut dispatcher = self.dispatcher.write().await;
        dispatcher.register(notifier);
    }

    pub async fn recent_threats(&self, n: usize) -> Vec<ThreatEvent> {
        let inner = self.inner.read().await;
        inner.threats.recent(n)
    }

    pub async fn get_status(&self) -> EngineStatus {
        let state = *self.state.read().await;
        let inner = self.inner.read().await;
        EngineStatus {
            state,
            records_stored: inner.records.len(),
            threats_stored: inner.threats.len(),
            rules_total: inner.rules.len(),
            rules_enabled: inner.rules.enabled_count(),
            blocked_sources: inner.blocklists.sources.len(),
            blocked_ports: inner.blocklists.ports.len(),
            stats: inner.stats.clone(),
        }
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Вытесняет из хранилищ всё, что старше окон удержания.
    pub async fn evict_expired(&self) -> (usize, usize) {
        let now = Utc::now();
        let mut inner = self.inner.write().await;
        let record_cutoff = now - inner.records.retention();
        let threat_cutoff = now - inner.threats.retention();
        let records_evicted = inner.records.evict_older_than(record_cutoff);
        let threats_evicted = inner.threats.evict_older_than(threat_cutoff);
        if records_evicted > 0 || threats_evicted > 0 {
            debug!(
                "Cleanup evicted {} records and {} threats",
                records_evicted, threats_evicted
            );
        }
        (records_evicted, threats_evicted)
    }

    // --- Планировщик ---

    /// Запускает цикл сбора и цикл очистки как независимые периодические
    /// задачи.
    pub async fn start(&self, mut source: Box<dyn RecordSource>) -> EngineResult<()> {
        {
            let mut state = self.state.write().await;
            if *state == EngineState::Running {
                return Err(EngineError::AlreadyRunning);
            }
            *state = EngineState::Running;
        }

        let (tx, rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(tx);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let cleanup_interval = Duration::from_millis(self.config.cleanup_interval_ms);

        info!(
            "Starting monitoring loops (poll every {:?}, cleanup every {:?})",
            poll_interval, cleanup_interval
        );

        let engine = self.clone();
        let mut collect_rx = rx.clone();
        let collect_task = tokio::spawn(async move {
            loop {
                if *collect_rx.borrow_and_update() {
                    break;
                }
                match source.poll().await {
                    Ok(batch) => {
                        for record in batch {
                            if let Err(e) = engine.ingest(record).await {
                                warn!(
                                    "Skipping record from source `{}`: {}",
                                    source.source_name(),
                                    e
                                );
                            }
                        }
                    }
                    // Ошибка одного цикла не валит планировщик
                    Err(e) => {
                        error!("Record source `{}` poll failed: {}", source.source_name(), e)
                    }
                }
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = collect_rx.changed() => {}
                }
            }
            debug!("Collection loop exited");
        });

        let engine = self.clone();
        let mut cleanup_rx = rx;
        let cleanup_task = tokio::spawn(async move {
            loop {
                if *cleanup_rx.borrow_and_update() {
                    break;
                }
                engine.evict_expired().await;
                tokio::select! {
                    _ = tokio::time::sleep(cleanup_interval) => {}
                    _ = cleanup_rx.changed() => {}
                }
            }
            debug!("Cleanup loop exited");
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(collect_task);
        tasks.push(cleanup_task);
        Ok(())
    }

    /// Останавливает фоновые задачи и очищает хранилища данных.
    ///
    /// Записи и события, не обработанные к моменту остановки, теряются —
    /// это осознанный выбор. Правила и блок-листы
    /// переживают остановку: они меняются только явными вызовами.
    pub async fn stop(&self) -> EngineResult<()> {
        {
            let state = self.state.read().await;
            if *state != EngineState::Running {
                return Err(EngineError::NotRunning);
            }
        }

        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(true);
        }

        let stop_timeout = Duration::from_millis(self.config.stop_timeout_ms);
        let mut tasks = self.tasks.lock().await;
        for mut handle in tasks.drain(..) {
            match tokio::time::timeout(stop_timeout, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Background task ended with error: {}", e),
                Err(_) => {
                    warn!("Background task did not stop within {:?}, aborting", stop_timeout);
                    handle.abort();
                }
            }
        }
        drop(tasks);

        {
            let mut inner = self.inner.write().await;
            inner.records.clear();
            inner.threats.clear();
        }

        *self.state.write().await = EngineState::Stopped;
        info!("Engine stopped, in-memory stores cleared");
        Ok(())
    }
}
