//! Пороговые правила и их вычисление.
//!
//! Правило — это чистый предикат над одним атрибутом записи плюс кулдаун.
//! Состояние срабатываний (`last fired`) хранится отдельно от самих правил,
//! поэтому экспорт/импорт набора правил через JSON сохраняет компаратор,
//! порог и кулдаун в точности, не таща за собой рантайм-состояние.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{EngineError, EngineResult};
use crate::record::{Record, Severity, ThreatEvent, ThreatReason};

/// Шесть поддерживаемых компараторов.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    /// Чистое вычисление предиката `value <op> threshold`.
    pub fn evaluate(self, value: f64, threshold: f64) -> bool {
        match self {
            Comparator::Gt => value > threshold,
            Comparator::Lt => value < threshold,
            Comparator::Ge => value >= threshold,
            Comparator::Le => value <= threshold,
            Comparator::Eq => value == threshold,
            Comparator::Ne => value != threshold,
        }
    }

    /// Разбор текстового компаратора; неизвестный оператор не распознаётся.
    pub fn parse(op: &str) -> Option<Comparator> {
        match op {
            ">" => Some(Comparator::Gt),
            "<" => Some(Comparator::Lt),
            ">=" => Some(Comparator::Ge),
            "<=" => Some(Comparator::Le),
            "==" => Some(Comparator::Eq),
            "!=" => Some(Comparator::Ne),
            _ => None,
        }
    }

    /// Вычисление по текстовому оператору: неизвестный компаратор
    /// закрывается в `false`, а не в ошибку.
    pub fn evaluate_raw(op: &str, value: f64, threshold: f64) -> bool {
        match Comparator::parse(op) {
            Some(cmp) => cmp.evaluate(value, threshold),
            None => false,
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Comparator::Gt => ">",
            Comparator::Lt => "<",
            Comparator::Ge => ">=",
            Comparator::Le => "<=",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        };
        write!(f, "{s}")
    }
}

/// Пороговое правило над одним атрибутом записи.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Идентификатор правила, уникальный внутри набора.
    pub id: String,
    /// Имя атрибута записи, к которому применяется предикат.
    pub target_attribute: String,
    /// Компаратор.
    pub comparator: Comparator,
    /// Порог.
    pub threshold: f64,
    /// Серьёзность порождаемого события.
    pub severity: Severity,
    /// Минимальный интервал между срабатываниями (в секундах).
    pub cooldown_seconds: u64,
    /// Выключенное правило не участвует в вычислении.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Описание для операторов (опционально).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Проверяет, удовлетворяет ли запись предикату правила.
    ///
    /// Отсутствующий или нечисловой атрибут означает "не сработало".
    pub fn matches(&self, record: &Record) -> bool {
        if !self.enabled {
            return false;
        }
        match record.attr_number(&self.target_attribute) {
            Some(value) => self.comparator.evaluate(value, self.threshold),
            None => false,
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::seconds(self.cooldown_seconds as i64)
    }
}

/// Набор правил с CRUD-операциями и состоянием кулдаунов.
///
/// Кулдаун отслеживается на пару (правило, источник): шумный хост не
/// маскирует срабатывания по другим хостам.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Rule>,
    fired: HashMap<(String, String), DateTime<Utc>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rule: Rule) -> EngineResult<()> {
        if self.rules.iter().any(|r| r.id == rule.id) {
            return Err(EngineError::DuplicateRule(rule.id));
        }
        self.rules.push(rule);
        Ok(())
    }

    pub fn update(&mut self, rule: Rule) -> EngineResult<()> {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                *existing = rule;
                Ok(())
            }
            None => Err(EngineError::RuleNotFound(rule.id)),
        }
    }

    pub fn remove(&mut self, id: &str) -> EngineResult<Rule> {
        match self.rules.iter().position(|r| r.id == id) {
            Some(pos) => {
                self.fired.retain(|(rule_id, _), _| rule_id != id);
                Ok(self.rules.remove(pos))
            }
            None => Err(EngineError::RuleNotFound(id.to_string())),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.iter().filter(|r| r.enabled).count()
    }

    /// Может ли правило сработать для источника в момент `now`.
    ///
    /// Истинно, если правило ещё не срабатывало для этого источника или
    /// с последнего срабатывания прошло не меньше кулдауна.
    pub fn should_fire(&self, rule: &Rule, source_key: &str, now: DateTime<Utc>) -> bool {
        match self
            .fired
            .get(&(rule.id.clone(), source_key.to_string()))
        {
            Some(last) => now - *last >= rule.cooldown(),
            None => true,
        }
    }

    /// Фиксирует срабатывание правила для источника.
    pub fn mark_fired(&mut self, rule_id: &str, source_key: &str, now: DateTime<Utc>) {
        self.fired
            .insert((rule_id.to_string(), source_key.to_string()), now);
    }

    /// Вычисляет все правила для записи; проверка кулдауна и фиксация
    /// срабатывания выполняются атомарно относительно вызывающего
    /// (движок держит набор под write-локом).
    pub fn evaluate(&mut self, record: &Record, now: DateTime<Utc>) -> Vec<ThreatEvent> {
        let mut events = Vec::new();
        let matched: Vec<Rule> = self
            .rules
            .iter()
            .filter(|rule| rule.matches(record))
            .cloned()
            .collect();

        for rule in matched {
            if !self.should_fire(&rule, &record.source_key, now) {
                continue;
            }
            self.mark_fired(&rule.id, &record.source_key, now);
            let value = record
                .attr_number(&rule.target_attribute)
                .unwrap_or(f64::NAN);
            events.push(ThreatEvent::new(
                rule.severity,
                record.source_key.clone(),
                ThreatReason::Rule {
                    rule_id: rule.id.clone(),
                },
                format!(
                    "rule `{}` fired: {} = {} (threshold {} {})",
                    rule.id, rule.target_attribute, value, rule.comparator, rule.threshold
                ),
            ));
        }
        events
    }

    /// Сериализует набор правил в JSON (без состояния кулдаунов).
    pub fn export_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string_pretty(&self.rules)?)
    }

    /// Заменяет набор правил содержимым JSON и сбрасывает кулдауны.
    pub fn import_json(&mut self, json: &str) -> EngineResult<usize> {
        let rules: Vec<Rule> = serde_json::from_str(json)?;
        self.rules = rules;
        self.fired.clear();
        Ok(self.rules.len())
    }

    pub fn clear(&mut self) {
        self.rules.clear();
        self.fired.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cpu_rule(cooldown: u64) -> Rule {
        Rule {
            id: "cpu-high".to_string(),
            target_attribute: "cpu_percent".to_string(),
            comparator: Comparator::Gt,
            threshold: 80.0,
            severity: Severity::High,
            cooldown_seconds: cooldown,
            enabled: true,
            description: None,
        }
    }

    #[test]
    fn comparators_have_exact_value_semantics() {
        assert!(Comparator::Eq.evaluate(5.0, 5.0));
        assert!(!Comparator::Eq.evaluate(5.0, 5.1));
        assert!(Comparator::Ne.evaluate(5.0, 5.1));
        assert!(!Comparator::Ne.evaluate(5.0, 5.0));
        assert!(Comparator::Ge.evaluate(5.0, 5.0));
        assert!(Comparator::Le.evaluate(5.0, 5.0));
        assert!(!Comparator::Gt.evaluate(5.0, 5.0));
        assert!(!Comparator::Lt.evaluate(5.0, 5.0));
    }

    #[test]
    fn unknown_comparator_fails_closed() {
        assert!(Comparator::parse("~=").is_none());
        assert!(!Comparator::evaluate_raw("~=", 100.0, 0.0));
        assert!(!Comparator::evaluate_raw("", 100.0, 0.0));
    }

    #[test]
    fn missing_attribute_never_matches() {
        let rule = cpu_rule(0);
        let record = Record::new("host-1").with_attr("mem_percent", 99.0);
        assert!(!rule.matches(&record));
    }

    #[test]
    fn disabled_rule_never_matches() {
        let mut rule = cpu_rule(0);
        rule.enabled = false;
        let record = Record::new("host-1").with_attr("cpu_percent", 99.0);
        assert!(!rule.matches(&record));
    }

    #[test]
    fn cooldown_allows_at_most_one_firing_per_window() {
        let mut set = RuleSet::new();
        set.add(cpu_rule(300)).unwrap();
        let record = Record::new("host-1").with_attr("cpu_percent", 85.0);

        let now = Utc::now();
        let first = set.evaluate(&record, now);
        assert_eq!(first.len(), 1);

        // Вторая проверка через 10 секунд — внутри кулдауна
        let second = set.evaluate(
            &Record::new("host-1").with_attr("cpu_percent", 90.0),
            now + Duration::seconds(10),
        );
        assert!(second.is_empty());

        // После истечения кулдауна правило срабатывает снова
        let third = set.evaluate(
            &Record::new("host-1").with_attr("cpu_percent", 90.0),
            now + Duration::seconds(301),
        );
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn cooldown_is_tracked_per_source() {
        let mut set = RuleSet::new();
        set.add(cpu_rule(300)).unwrap();
        let now = Utc::now();

        assert_eq!(
            set.evaluate(&Record::new("host-1").with_attr("cpu_percent", 85.0), now)
                .len(),
            1
        );
        // Другой источник не попадает под кулдаун первого
        assert_eq!(
            set.evaluate(&Record::new("host-2").with_attr("cpu_percent", 85.0), now)
                .len(),
            1
        );
    }

    #[test]
    fn duplicate_rule_id_is_rejected() {
        let mut set = RuleSet::new();
        set.add(cpu_rule(0)).unwrap();
        let err = set.add(cpu_rule(0)).unwrap_err();
        assert!(matches!(err, EngineError::DuplicateRule(_)));
    }

    #[test]
    fn remove_missing_rule_is_an_error() {
        let mut set = RuleSet::new();
        assert!(matches!(
            set.remove("nope"),
            Err(EngineError::RuleNotFound(_))
        ));
    }

    #[test]
    fn export_import_round_trip_preserves_rules() {
        let mut set = RuleSet::new();
        set.add(cpu_rule(300)).unwrap();
        set.add(Rule {
            id: "conn-exact".to_string(),
            target_attribute: "connections".to_string(),
            comparator: Comparator::Eq,
            threshold: 0.0,
            severity: Severity::Low,
            cooldown_seconds: 60,
            enabled: false,
            description: Some("idle host".to_string()),
        })
        .unwrap();

        let json = set.export_json().unwrap();
        let mut imported = RuleSet::new();
        assert_eq!(imported.import_json(&json).unwrap(), 2);

        for original in set.iter() {
            let restored = imported.get(&original.id).unwrap();
            assert_eq!(restored.comparator, original.comparator);
            assert_eq!(restored.threshold, original.threshold);
            assert_eq!(restored.cooldown_seconds, original.cooldown_seconds);
            assert_eq!(restored.enabled, original.enabled);
        }
    }

    #[test]
    fn import_rejects_unknown_comparator() {
        let mut set = RuleSet::new();
        let json = r#"[{
            "id": "bad",
            "target_attribute": "cpu_percent",
            "comparator": "~=",
            "threshold": 1.0,
            "severity": "low",
            "cooldown_seconds": 0
        }]"#;
        assert!(matches!(
            set.import_json(json),
            Err(EngineError::InvalidRuleJson(_))
        ));
    }
}
