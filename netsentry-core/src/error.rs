//! Типизированные ошибки операций движка.
//!
//! Широкое проглатывание исключений в мониторинговом коде заменено узким
//! перечислением: каждая операция движка возвращает `Result<T, EngineError>`,
//! а по-настоящему фатальные состояния остаются паникой.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Входная запись не прошла минимальную проверку формы.
    #[error("malformed record: {0}")]
    MalformedRecord(String),

    /// Правило с таким идентификатором уже зарегистрировано.
    #[error("rule `{0}` already exists")]
    DuplicateRule(String),

    /// Правило с таким идентификатором не найдено.
    #[error("rule `{0}` not found")]
    RuleNotFound(String),

    /// Планировщик уже запущен.
    #[error("engine is already running")]
    AlreadyRunning,

    /// Планировщик не запущен.
    #[error("engine is not running")]
    NotRunning,

    /// Набор правил не удалось сериализовать или разобрать.
    #[error("invalid rule set JSON: {0}")]
    InvalidRuleJson(#[from] serde_json::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;
