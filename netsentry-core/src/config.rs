use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

use crate::classify::ClassifierConfig;
use crate::record::Severity;

/// Конфигурация демона NetSentry.
///
/// Загружается из YAML-файла и валидируется один раз при старте.
/// Все пороги классификатора собраны в [`ClassifierConfig`] и передаются
/// движку при конструировании, а не разбросаны по коду.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Интервал опроса источника записей (в миллисекундах).
    pub poll_interval_ms: u64,

    /// Интервал фоновой очистки хранилищ (в миллисекундах).
    /// Независим от основного интервала опроса.
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Таймаут ожидания фоновых задач при остановке (в миллисекундах).
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Параметры удержания данных в памяти.
    #[serde(default)]
    pub retention: Retention,

    /// Пороги классификатора угроз.
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Параметры синтетического источника трафика.
    #[serde(default)]
    pub collector: CollectorSettings,

    /// Настройки уведомлений об угрозах.
    #[serde(default)]
    pub notifications: NotificationSettings,

    /// Пути и адреса.
    #[serde(default)]
    pub paths: Paths,
}

fn default_cleanup_interval_ms() -> u64 {
    5000
}

fn default_stop_timeout_ms() -> u64 {
    5000
}

/// Границы хранилищ: ограничение и по количеству, и по возрасту.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Retention {
    /// Время жизни записи телеметрии (в секундах).
    pub record_retention_secs: u64,
    /// Время жизни события угрозы (в секундах).
    pub threat_retention_secs: u64,
    /// Максимальное количество записей телеметрии в памяти.
    pub max_records: usize,
    /// Максимальное количество событий угроз в памяти.
    pub max_threats: usize,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            record_retention_secs: 300,
            threat_retention_secs: 3600,
            max_records: 100_000,
            max_threats: 10_000,
        }
    }
}

/// Параметры встроенного синтетического источника.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorSettings {
    /// Сколько записей генерировать за один цикл опроса.
    pub batch_size: usize,
    /// Пул адресов, от имени которых генерируется трафик.
    pub simulated_sources: Vec<String>,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            batch_size: 16,
            simulated_sources: vec![
                "10.0.0.1".to_string(),
                "10.0.0.2".to_string(),
                "192.168.1.10".to_string(),
                "172.16.0.5".to_string(),
            ],
        }
    }
}

/// Настройки уведомлений.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationSettings {
    /// Минимальная серьёзность угрозы, при которой отправляется уведомление.
    pub min_severity: Severity,
    /// URL вебхука для отправки уведомлений (опционально).
    pub webhook_url: Option<String>,
    /// Таймаут HTTP-запросов вебхука (в секундах).
    pub webhook_timeout_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            min_severity: Severity::High,
            webhook_url: None,
            webhook_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paths {
    /// Путь для периодического JSON-снапшота состояния (опционально).
    pub snapshot_path: Option<String>,
    /// Интервал записи снапшота (в секундах).
    pub snapshot_interval_secs: u64,
    /// Сколько последних угроз включать в снапшот.
    pub snapshot_recent_threats: usize,
    /// Адрес для Control API (опционально, например "127.0.0.1:8080").
    pub api_listen_addr: Option<String>,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            snapshot_path: None,
            snapshot_interval_secs: 30,
            snapshot_recent_threats: 100,
            api_listen_addr: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            cleanup_interval_ms: default_cleanup_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            retention: Retention::default(),
            classifier: ClassifierConfig::default(),
            collector: CollectorSettings::default(),
            notifications: NotificationSettings::default(),
            paths: Paths::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {path}"))?;
        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("failed to parse YAML config at {path}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.poll_interval_ms > 0,
            "poll_interval_ms must be positive (got {})",
            self.poll_interval_ms
        );
        ensure!(
            self.poll_interval_ms <= 60_000,
            "poll_interval_ms must be <= 60000 ms (1 minute) to keep monitoring responsive (got {})",
            self.poll_interval_ms
        );
        ensure!(
            self.cleanup_interval_ms > 0,
            "cleanup_interval_ms must be positive (got {})",
            self.cleanup_interval_ms
        );
        ensure!(
            self.stop_timeout_ms > 0,
            "stop_timeout_ms must be positive (got {})",
            self.stop_timeout_ms
        );

        self.retention.validate()?;
        self.classifier.validate()?;

        ensure!(
            self.collector.batch_size > 0,
            "collector.batch_size must be positive (got {})",
            self.collector.batch_size
        );
        ensure!(
            self.collector.batch_size <= 10_000,
            "collector.batch_size must be <= 10000 to prevent excessive memory usage (got {})",
            self.collector.batch_size
        );
        ensure!(
            !self.collector.simulated_sources.is_empty(),
            "collector.simulated_sources must not be empty"
        );

        ensure!(
            self.paths.snapshot_interval_secs > 0,
            "paths.snapshot_interval_secs must be positive (got {})",
            self.paths.snapshot_interval_secs
        );

        Ok(())
    }
}

impl Retention {
    fn validate(&self) -> Result<()> {
        ensure!(
            self.record_retention_secs > 0,
            "retention.record_retention_secs must be positive (got {})",
            self.record_retention_secs
        );
        ensure!(
            self.threat_retention_secs > 0,
            "retention.threat_retention_secs must be positive (got {})",
            self.threat_retention_secs
        );
        ensure!(
            self.max_records > 0,
            "retention.max_records must be positive (got {})",
            self.max_records
        );
        ensure!(
            self.max_threats > 0,
            "retention.max_threats must be positive (got {})",
            self.max_threats
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let cfg = Config {
            poll_interval_ms: 0,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_source_pool_is_rejected() {
        let mut cfg = Config::default();
        cfg.collector.simulated_sources.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_retention_is_rejected() {
        let mut cfg = Config::default();
        cfg.retention.max_records = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_parses_from_yaml() {
        let yaml = r#"
poll_interval_ms: 500
retention:
  record_retention_secs: 60
  threat_retention_secs: 600
  max_records: 1000
  max_threats: 100
classifier:
  ddos_threshold: 50
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.poll_interval_ms, 500);
        assert_eq!(cfg.retention.max_records, 1000);
        assert_eq!(cfg.classifier.ddos_threshold, 50);
        // Пропущенные секции получают значения по умолчанию
        assert_eq!(cfg.cleanup_interval_ms, 5000);
        assert!(cfg.validate().is_ok());
    }
}
