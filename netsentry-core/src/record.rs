//! Базовые типы конвейера: запись телеметрии и событие угрозы.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Общепринятые ключи атрибутов, которые читает классификатор.
pub mod attr {
    /// Порт назначения (число).
    pub const PORT: &str = "port";
    /// Протокол транспортного уровня (строка: "tcp", "udp", ...).
    pub const PROTOCOL: &str = "protocol";
    /// Размер записи в байтах (число).
    pub const SIZE_BYTES: &str = "size_bytes";
}

/// Скалярное значение атрибута записи.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// Числовое значение (порты, размеры, метрики).
    Number(f64),
    /// Строковое значение (протоколы, метки).
    Text(String),
}

impl AttrValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttrValue::Number(n) => Some(*n),
            AttrValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            AttrValue::Number(_) => None,
        }
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Number(value)
    }
}

impl From<u64> for AttrValue {
    fn from(value: u64) -> Self {
        AttrValue::Number(value as f64)
    }
}

impl From<u16> for AttrValue {
    fn from(value: u16) -> Self {
        AttrValue::Number(value as f64)
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Text(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Text(value)
    }
}

/// Одна временная запись телеметрии (аналог сетевого пакета или сэмпла метрики).
///
/// Запись неизменяема после создания: коллектор вставляет её в хранилище,
/// планировщик вытесняет по возрасту. Идентификатор присваивает хранилище.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Монотонный идентификатор, присвоенный хранилищем.
    pub id: u64,
    /// Время наблюдения.
    pub timestamp: DateTime<Utc>,
    /// Ключ источника (IP-адрес, hostname или иной идентификатор).
    pub source_key: String,
    /// Произвольные скалярные атрибуты.
    pub attributes: HashMap<String, AttrValue>,
}

impl Record {
    /// Создаёт запись с текущей временной меткой и пустыми атрибутами.
    pub fn new(source_key: impl Into<String>) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            source_key: source_key.into(),
            attributes: HashMap::new(),
        }
    }

    /// Добавляет атрибут (builder-стиль).
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Переопределяет временную метку (для тестов и воспроизведения трафика).
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn attr_number(&self, key: &str) -> Option<f64> {
        self.attributes.get(key).and_then(AttrValue::as_number)
    }

    pub fn attr_text(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttrValue::as_text)
    }

    /// Порт назначения, если задан и попадает в диапазон u16.
    pub fn port(&self) -> Option<u16> {
        self.attr_number(attr::PORT)
            .filter(|p| *p >= 0.0 && *p <= f64::from(u16::MAX))
            .map(|p| p as u16)
    }

    pub fn protocol(&self) -> Option<&str> {
        self.attr_text(attr::PROTOCOL)
    }

    pub fn size_bytes(&self) -> Option<u64> {
        self.attr_number(attr::SIZE_BYTES)
            .filter(|s| *s >= 0.0)
            .map(|s| s as u64)
    }
}

/// Серьёзность события угрозы.
///
/// Порядок вариантов задаёт отношение "не ниже чем" для фильтрации уведомлений.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Происхождение события угрозы: либо проверка классификатора, либо правило.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThreatReason {
    /// Источник находится в блок-листе.
    BlockedSource,
    /// Порт назначения находится в блок-листе.
    BlockedPort { port: u16 },
    /// Протокол не входит в разрешённый набор.
    DisallowedProtocol { protocol: String },
    /// Запись превышает максимальную транспортную единицу.
    OversizedRecord { size_bytes: u64 },
    /// Частота записей от источника превысила порог.
    RateFlood { records_per_window: usize },
    /// Сработало пороговое правило.
    Rule { rule_id: String },
}

impl fmt::Display for ThreatReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreatReason::BlockedSource => write!(f, "blocked_source"),
            ThreatReason::BlockedPort { port } => write!(f, "blocked_port:{port}"),
            ThreatReason::DisallowedProtocol { protocol } => {
                write!(f, "disallowed_protocol:{protocol}")
            }
            ThreatReason::OversizedRecord { size_bytes } => {
                write!(f, "oversized_record:{size_bytes}")
            }
            ThreatReason::RateFlood { records_per_window } => {
                write!(f, "rate_flood:{records_per_window}")
            }
            ThreatReason::Rule { rule_id } => write!(f, "rule:{rule_id}"),
        }
    }
}

/// Выходная единица конвейера: угроза с серьёзностью и происхождением.
///
/// Событие владеет всеми данными, которые ему нужны, поэтому вытеснение
/// исходной записи из хранилища никогда не оставляет висячих ссылок.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    /// Уникальный идентификатор события.
    pub id: Uuid,
    /// Время обнаружения.
    pub timestamp: DateTime<Utc>,
    /// Серьёзность.
    pub severity: Severity,
    /// Источник, породивший событие.
    pub source_key: String,
    /// Происхождение (проверка классификатора или правило).
    pub reason: ThreatReason,
    /// Человекочитаемое описание.
    pub description: String,
}

impl ThreatEvent {
    pub fn new(
        severity: Severity,
        source_key: impl Into<String>,
        reason: ThreatReason,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity,
            source_key: source_key.into(),
            reason,
            description: description.into(),
        }
    }
}
