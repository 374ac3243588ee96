//! Ограниченные упорядоченные по времени хранилища записей и угроз.
//!
//! Оба хранилища ограничены и по количеству элементов, и по возрасту:
//! вставка в конец — O(1) амортизированно, вытеснение по возрасту — O(k),
//! где k — число просроченных элементов в начале очереди. Сериализация
//! записи обеспечивается владельцем (движок держит хранилища под одним
//! `RwLock`), здесь конкуренция не моделируется.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;

use crate::record::{Record, Severity, ThreatEvent};

/// Хранилище записей телеметрии.
#[derive(Debug)]
pub struct RecordStore {
    records: VecDeque<Record>,
    max_records: usize,
    retention: Duration,
    next_id: u64,
}

impl RecordStore {
    pub fn new(max_records: usize, retention: Duration) -> Self {
        Self {
            records: VecDeque::new(),
            max_records,
            retention,
            next_id: 1,
        }
    }

    /// Вставляет запись, присваивая ей монотонный идентификатор.
    ///
    /// При переполнении по количеству самая старая запись выталкивается.
    pub fn insert(&mut self, mut record: Record) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        record.id = id;

        self.records.push_back(record);
        while self.records.len() > self.max_records {
            self.records.pop_front();
        }
        id
    }

    /// Удаляет из начала очереди все записи старше `cutoff`.
    ///
    /// Возвращает количество вытесненных записей. События угроз владеют
    /// своими данными, поэтому вытеснение записи не инвалидирует алерты.
    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.records.front() {
            if front.timestamp < cutoff {
                self.records.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }

    /// Последняя запись от источника, если есть.
    pub fn latest(&self, source_key: &str) -> Option<&Record> {
        self.records
            .iter()
            .rev()
            .find(|r| r.source_key == source_key)
    }

    /// Записи от источника за последний интервал `duration` относительно `now`.
    pub fn window(
        &self,
        source_key: &str,
        duration: Duration,
        now: DateTime<Utc>,
    ) -> Vec<&Record> {
        let cutoff = now - duration;
        let mut result: Vec<&Record> = self
            .records
            .iter()
            .rev()
            .take_while(|r| r.timestamp >= cutoff)
            .filter(|r| r.source_key == source_key)
            .collect();
        result.reverse();
        result
    }

    /// Количество записей от источника за последний интервал.
    ///
    /// Отдельный метод, чтобы частотная проверка классификатора не
    /// аллоцировала вектор на каждый пакет.
    pub fn count_since(&self, source_key: &str, duration: Duration, now: DateTime<Utc>) -> usize {
        let cutoff = now - duration;
        self.records
            .iter()
            .rev()
            .take_while(|r| r.timestamp >= cutoff)
            .filter(|r| r.source_key == source_key)
            .count()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

/// Append-only история событий угроз с теми же границами по возрасту и количеству.
#[derive(Debug)]
pub struct ThreatStore {
    events: VecDeque<ThreatEvent>,
    max_events: usize,
    retention: Duration,
}

impl ThreatStore {
    pub fn new(max_events: usize, retention: Duration) -> Self {
        Self {
            events: VecDeque::new(),
            max_events,
            retention,
        }
    }

    pub fn push(&mut self, event: ThreatEvent) {
        self.events.push_back(event);
        while self.events.len() > self.max_events {
            self.events.pop_front();
        }
    }

    pub fn evict_older_than(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while let Some(front) = self.events.front() {
            if front.timestamp < cutoff {
                self.events.pop_front();
                evicted += 1;
            } else {
                break;
            }
        }
        evicted
    }

    /// Последние `n` событий в хронологическом порядке.
    pub fn recent(&self, n: usize) -> Vec<ThreatEvent> {
        let skip = self.events.len().saturating_sub(n);
        self.events.iter().skip(skip).cloned().collect()
    }

    pub fn count_with_severity(&self, severity: Severity) -> usize {
        self.events.iter().filter(|e| e.severity == severity).count()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ThreatReason;

    fn record_at(source: &str, seconds_ago: i64) -> Record {
        Record::new(source).with_timestamp(Utc::now() - Duration::seconds(seconds_ago))
    }

    #[test]
    fn insert_assigns_monotonic_ids() {
        let mut store = RecordStore::new(100, Duration::seconds(60));
        let a = store.insert(Record::new("a"));
        let b = store.insert(Record::new("b"));
        assert!(b > a);
    }

    #[test]
    fn count_cap_drops_oldest() {
        let mut store = RecordStore::new(3, Duration::seconds(60));
        for i in 0..5 {
            store.insert(record_at("a", 10 - i));
        }
        assert_eq!(store.len(), 3);
        // Самая старая выжившая запись — третья по счёту
        assert!(store.latest("a").is_some());
    }

    #[test]
    fn evict_older_than_respects_retention() {
        let mut store = RecordStore::new(100, Duration::seconds(30));
        store.insert(record_at("a", 120));
        store.insert(record_at("a", 60));
        store.insert(record_at("a", 5));

        let now = Utc::now();
        let evicted = store.evict_older_than(now - store.retention());
        assert_eq!(evicted, 2);
        assert_eq!(store.len(), 1);

        // После вытеснения не остаётся записей старше окна удержания
        for r in store.window("a", Duration::seconds(3600), now) {
            assert!(now - r.timestamp <= store.retention());
        }
    }

    #[test]
    fn window_and_count_agree() {
        let mut store = RecordStore::new(100, Duration::seconds(300));
        store.insert(record_at("a", 50));
        store.insert(record_at("b", 20));
        store.insert(record_at("a", 10));
        store.insert(record_at("a", 1));

        let now = Utc::now();
        let window = store.window("a", Duration::seconds(30), now);
        assert_eq!(window.len(), 2);
        assert_eq!(store.count_since("a", Duration::seconds(30), now), 2);
        // Окно возвращается в хронологическом порядке
        assert!(window[0].timestamp <= window[1].timestamp);
    }

    #[test]
    fn latest_returns_newest_for_source() {
        let mut store = RecordStore::new(100, Duration::seconds(300));
        store.insert(record_at("a", 50));
        let newest_id = store.insert(record_at("a", 1));
        store.insert(record_at("b", 0));

        assert_eq!(store.latest("a").unwrap().id, newest_id);
        assert!(store.latest("missing").is_none());
    }

    #[test]
    fn threat_store_recent_keeps_order_and_cap() {
        let mut store = ThreatStore::new(2, Duration::seconds(3600));
        for i in 0..3 {
            store.push(ThreatEvent::new(
                Severity::High,
                format!("src-{i}"),
                ThreatReason::BlockedSource,
                "test",
            ));
        }
        assert_eq!(store.len(), 2);
        let recent = store.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].source_key, "src-1");
        assert_eq!(recent[1].source_key, "src-2");
    }
}
