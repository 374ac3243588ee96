//! Классификатор угроз: упорядоченная цепочка проверок записи.
//!
//! Проверки выполняются в фиксированном порядке, побеждает первое
//! совпадение: заблокированный источник, заблокированный порт,
//! неразрешённый протокол, превышение транспортной единицы, частотный
//! флуд. Все численные пороги собраны в [`ClassifierConfig`] и задаются
//! при конструировании — это настройки, а не константы в коде.

use anyhow::{ensure, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::record::{Record, Severity, ThreatEvent, ThreatReason};
use crate::store::RecordStore;

/// Блок-листы: множества источников и портов, запрещённых политикой.
///
/// Меняются только явными вызовами block/unblock; повторная блокировка
/// идемпотентна. TTL у записей нет.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Blocklists {
    pub sources: HashSet<String>,
    pub ports: HashSet<u16>,
}

impl Blocklists {
    /// Блокирует источник; возвращает true, если источник не был заблокирован ранее.
    pub fn block_source(&mut self, source_key: impl Into<String>) -> bool {
        self.sources.insert(source_key.into())
    }

    pub fn unblock_source(&mut self, source_key: &str) -> bool {
        self.sources.remove(source_key)
    }

    pub fn block_port(&mut self, port: u16) -> bool {
        self.ports.insert(port)
    }

    pub fn unblock_port(&mut self, port: u16) -> bool {
        self.ports.remove(&port)
    }

    pub fn is_source_blocked(&self, source_key: &str) -> bool {
        self.sources.contains(source_key)
    }

    pub fn is_port_blocked(&self, port: u16) -> bool {
        self.ports.contains(&port)
    }
}

/// Пороги классификатора.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Порог частотной проверки: больше стольких записей от одного
    /// источника за окно — событие CRITICAL.
    #[serde(default = "default_ddos_threshold")]
    pub ddos_threshold: usize,

    /// Ширина окна частотной проверки (в миллисекундах).
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,

    /// Максимальная транспортная единица (в байтах); запись большего
    /// размера считается аномальной.
    #[serde(default = "default_max_transport_unit")]
    pub max_transport_unit_bytes: u64,

    /// Разрешённые протоколы. Запись без атрибута протокола эту проверку
    /// пропускает.
    #[serde(default = "default_allowed_protocols")]
    pub allowed_protocols: Vec<String>,
}

fn default_ddos_threshold() -> usize {
    1000
}

fn default_rate_window_ms() -> u64 {
    1000
}

fn default_max_transport_unit() -> u64 {
    9000
}

fn default_allowed_protocols() -> Vec<String> {
    vec!["tcp".to_string(), "udp".to_string(), "icmp".to_string()]
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ddos_threshold: default_ddos_threshold(),
            rate_window_ms: default_rate_window_ms(),
            max_transport_unit_bytes: default_max_transport_unit(),
            allowed_protocols: default_allowed_protocols(),
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.ddos_threshold > 0,
            "classifier.ddos_threshold must be positive (got {})",
            self.ddos_threshold
        );
        ensure!(
            self.rate_window_ms > 0,
            "classifier.rate_window_ms must be positive (got {})",
            self.rate_window_ms
        );
        ensure!(
            self.max_transport_unit_bytes > 0,
            "classifier.max_transport_unit_bytes must be positive (got {})",
            self.max_transport_unit_bytes
        );
        ensure!(
            !self.allowed_protocols.is_empty(),
            "classifier.allowed_protocols must not be empty"
        );
        Ok(())
    }

    pub fn rate_window(&self) -> Duration {
        Duration::milliseconds(self.rate_window_ms as i64)
    }
}

/// Классификатор без собственного изменяемого состояния.
#[derive(Debug, Clone)]
pub struct Classifier {
    config: ClassifierConfig,
}

impl Classifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Классифицирует запись; частотная проверка считает записи в
    /// хранилище, включая саму запись (вызывающий вставляет её до
    /// классификации).
    pub fn classify(
        &self,
        record: &Record,
        blocklists: &Blocklists,
        store: &RecordStore,
        now: DateTime<Utc>,
    ) -> Option<ThreatEvent> {
        if blocklists.is_source_blocked(&record.source_key) {
            return Some(ThreatEvent::new(
                Severity::High,
                record.source_key.clone(),
                ThreatReason::BlockedSource,
                format!("traffic from blocked source {}", record.source_key),
            ));
        }

        if let Some(port) = record.port() {
            if blocklists.is_port_blocked(port) {
                return Some(ThreatEvent::new(
                    Severity::Medium,
                    record.source_key.clone(),
                    ThreatReason::BlockedPort { port },
                    format!("traffic to blocked port {port}"),
                ));
            }
        }

        if let Some(protocol) = record.protocol() {
            if !self
                .config
                .allowed_protocols
                .iter()
                .any(|p| p.eq_ignore_ascii_case(protocol))
            {
                return Some(ThreatEvent::new(
                    Severity::Medium,
                    record.source_key.clone(),
                    ThreatReason::DisallowedProtocol {
                        protocol: protocol.to_string(),
                    },
                    format!("disallowed protocol `{protocol}`"),
                ));
            }
        }

        if let Some(size_bytes) = record.size_bytes() {
            if size_bytes > self.config.max_transport_unit_bytes {
                return Some(ThreatEvent::new(
                    Severity::High,
                    record.source_key.clone(),
                    ThreatReason::OversizedRecord { size_bytes },
                    format!(
                        "record of {size_bytes} bytes exceeds max transport unit of {} bytes",
                        self.config.max_transport_unit_bytes
                    ),
                ));
            }
        }

        let rate = store.count_since(&record.source_key, self.config.rate_window(), now);
        if rate > self.config.ddos_threshold {
            return Some(ThreatEvent::new(
                Severity::Critical,
                record.source_key.clone(),
                ThreatReason::RateFlood {
                    records_per_window: rate,
                },
                format!(
                    "{rate} records from {} within {} ms exceeds flood threshold of {}",
                    record.source_key, self.config.rate_window_ms, self.config.ddos_threshold
                ),
            ));
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::attr;

    fn classifier() -> Classifier {
        Classifier::new(ClassifierConfig::default())
    }

    fn empty_store() -> RecordStore {
        RecordStore::new(100_000, Duration::seconds(300))
    }

    #[test]
    fn blocked_source_wins_over_everything() {
        let mut blocklists = Blocklists::default();
        blocklists.block_source("1.2.3.4");
        blocklists.block_port(23);

        // Запись нарушает сразу всё: источник, порт, протокол и размер
        let record = Record::new("1.2.3.4")
            .with_attr(attr::PORT, 23u16)
            .with_attr(attr::PROTOCOL, "gre")
            .with_attr(attr::SIZE_BYTES, 100_000u64);

        let threat = classifier()
            .classify(&record, &blocklists, &empty_store(), Utc::now())
            .unwrap();
        assert_eq!(threat.severity, Severity::High);
        assert_eq!(threat.reason, ThreatReason::BlockedSource);
    }

    #[test]
    fn blocked_port_is_medium() {
        let mut blocklists = Blocklists::default();
        blocklists.block_port(23);
        let record = Record::new("10.0.0.1").with_attr(attr::PORT, 23u16);

        let threat = classifier()
            .classify(&record, &blocklists, &empty_store(), Utc::now())
            .unwrap();
        assert_eq!(threat.severity, Severity::Medium);
        assert_eq!(threat.reason, ThreatReason::BlockedPort { port: 23 });
    }

    #[test]
    fn disallowed_protocol_is_medium() {
        let record = Record::new("10.0.0.1").with_attr(attr::PROTOCOL, "gre");
        let threat = classifier()
            .classify(&record, &Blocklists::default(), &empty_store(), Utc::now())
            .unwrap();
        assert_eq!(threat.severity, Severity::Medium);
    }

    #[test]
    fn protocol_check_is_case_insensitive() {
        let record = Record::new("10.0.0.1").with_attr(attr::PROTOCOL, "TCP");
        assert!(classifier()
            .classify(&record, &Blocklists::default(), &empty_store(), Utc::now())
            .is_none());
    }

    #[test]
    fn missing_protocol_skips_the_check() {
        let record = Record::new("10.0.0.1").with_attr(attr::SIZE_BYTES, 100u64);
        assert!(classifier()
            .classify(&record, &Blocklists::default(), &empty_store(), Utc::now())
            .is_none());
    }

    #[test]
    fn oversized_record_is_high() {
        let record = Record::new("10.0.0.1")
            .with_attr(attr::PROTOCOL, "udp")
            .with_attr(attr::SIZE_BYTES, 9001u64);
        let threat = classifier()
            .classify(&record, &Blocklists::default(), &empty_store(), Utc::now())
            .unwrap();
        assert_eq!(threat.severity, Severity::High);
        assert_eq!(
            threat.reason,
            ThreatReason::OversizedRecord { size_bytes: 9001 }
        );
    }

    #[test]
    fn rate_flood_is_critical() {
        let config = ClassifierConfig {
            ddos_threshold: 10,
            ..ClassifierConfig::default()
        };
        let classifier = Classifier::new(config);
        let mut store = empty_store();
        let now = Utc::now();

        let record = Record::new("1.2.3.4").with_timestamp(now);
        for _ in 0..11 {
            store.insert(record.clone());
        }

        let threat = classifier
            .classify(&record, &Blocklists::default(), &store, now)
            .unwrap();
        assert_eq!(threat.severity, Severity::Critical);
        assert!(matches!(threat.reason, ThreatReason::RateFlood { .. }));
    }

    #[test]
    fn rate_at_threshold_does_not_fire() {
        let config = ClassifierConfig {
            ddos_threshold: 10,
            ..ClassifierConfig::default()
        };
        let classifier = Classifier::new(config);
        let mut store = empty_store();
        let now = Utc::now();

        let record = Record::new("1.2.3.4").with_timestamp(now);
        for _ in 0..10 {
            store.insert(record.clone());
        }
        assert!(classifier
            .classify(&record, &Blocklists::default(), &store, now)
            .is_none());
    }

    #[test]
    fn blocklists_are_idempotent() {
        let mut blocklists = Blocklists::default();
        assert!(blocklists.block_source("1.2.3.4"));
        assert!(!blocklists.block_source("1.2.3.4"));
        assert_eq!(blocklists.sources.len(), 1);

        assert!(blocklists.unblock_source("1.2.3.4"));
        assert!(!blocklists.unblock_source("1.2.3.4"));
    }
}
