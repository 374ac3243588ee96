//! Диспетчер событий угроз.
//!
//! Обработка события разбита на две фазы. Архивация (история плюс
//! авто-блокировка при CRITICAL) синхронна и выполняется под локом
//! хранилищ, чтобы блокировка была атомарна с записью события.
//! Рассылка подписчикам асинхронна и выполняется уже после отпускания
//! лока: медленный вебхук не останавливает приём записей. Ошибка
//! одного подписчика изолируется и не прерывает ни доставку остальным,
//! ни сам конвейер.

use std::sync::Arc;

use crate::classify::Blocklists;
use crate::notify::Notifier;
use crate::record::{Severity, ThreatEvent};
use crate::store::ThreatStore;

pub struct Dispatcher {
    /// Минимальная серьёзность, начиная с которой угроза уходит подписчикам.
    min_notify_severity: Severity,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl Dispatcher {
    pub fn new(min_notify_severity: Severity) -> Self {
        Self {
            min_notify_severity,
            notifiers: Vec::new(),
        }
    }

    /// Регистрирует подписчика. Порядок доставки — порядок регистрации.
    pub fn register(&mut self, notifier: Arc<dyn Notifier>) {
        tracing::info!("Registered threat notifier: {}", notifier.backend_name());
        self.notifiers.push(notifier);
    }

    pub fn notifier_count(&self) -> usize {
        self.notifiers.len()
    }

    /// Архивирует событие и при CRITICAL блокирует источник.
    ///
    /// Возвращает true, если источник был автоматически заблокирован
    /// этим вызовом. Вызывающий держит лок хранилищ: запись в историю
    /// и блокировка атомарны.
    pub fn archive(
        &self,
        threat: &ThreatEvent,
        threats: &mut ThreatStore,
        blocklists: &mut Blocklists,
    ) -> bool {
        threats.push(threat.clone());

        if threat.severity == Severity::Critical {
            let newly_blocked = blocklists.block_source(threat.source_key.clone());
            if newly_blocked {
                tracing::warn!(
                    "Auto-blocked source {} after critical threat: {}",
                    threat.source_key,
                    threat.description
                );
            }
            newly_blocked
        } else {
            false
        }
    }

    /// Рассылает событие подписчикам, если серьёзность не ниже порога.
    ///
    /// Доставка может быть долгой (сетевой вебхук), поэтому вызывается
    /// без лока хранилищ.
    pub async fn notify_subscribers(&self, threat: &ThreatEvent) {
        if threat.severity < self.min_notify_severity {
            return;
        }
        for notifier in &self.notifiers {
            if let Err(e) = notifier.notify(threat).await {
                tracing::error!(
                    "Notifier `{}` failed for threat {}: {}",
                    notifier.backend_name(),
                    threat.id,
                    e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ThreatReason;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Duration;
    use tokio::sync::Mutex;

    struct RecordingNotifier {
        seen: Mutex<Vec<ThreatEvent>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, threat: &ThreatEvent) -> Result<()> {
            self.seen.lock().await.push(threat.clone());
            Ok(())
        }

        fn backend_name(&self) -> &str {
            "recording"
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _threat: &ThreatEvent) -> Result<()> {
            Err(anyhow::anyhow!("subscriber is down"))
        }

        fn backend_name(&self) -> &str {
            "failing"
        }
    }

    fn stores() -> (ThreatStore, Blocklists) {
        (
            ThreatStore::new(100, Duration::seconds(3600)),
            Blocklists::default(),
        )
    }

    #[test]
    fn critical_threat_auto_blocks_source() {
        let dispatcher = Dispatcher::new(Severity::High);
        let (mut threats, mut blocklists) = stores();

        let threat = ThreatEvent::new(
            Severity::Critical,
            "1.2.3.4",
            ThreatReason::RateFlood {
                records_per_window: 5000,
            },
            "flood",
        );
        let blocked = dispatcher.archive(&threat, &mut threats, &mut blocklists);

        assert!(blocked);
        assert!(blocklists.is_source_blocked("1.2.3.4"));
        assert_eq!(threats.len(), 1);
    }

    #[test]
    fn non_critical_threat_does_not_block() {
        let dispatcher = Dispatcher::new(Severity::Low);
        let (mut threats, mut blocklists) = stores();

        let threat = ThreatEvent::new(
            Severity::High,
            "1.2.3.4",
            ThreatReason::BlockedSource,
            "blocked",
        );
        let blocked = dispatcher.archive(&threat, &mut threats, &mut blocklists);

        assert!(!blocked);
        assert!(!blocklists.is_source_blocked("1.2.3.4"));
    }

    #[tokio::test]
    async fn failing_notifier_does_not_stop_delivery() {
        let mut dispatcher = Dispatcher::new(Severity::Low);
        let recording = Arc::new(RecordingNotifier {
            seen: Mutex::new(Vec::new()),
        });
        // Падающий подписчик стоит первым в очереди доставки
        dispatcher.register(Arc::new(FailingNotifier));
        dispatcher.register(recording.clone());

        let threat = ThreatEvent::new(
            Severity::High,
            "1.2.3.4",
            ThreatReason::BlockedSource,
            "blocked",
        );
        dispatcher.notify_subscribers(&threat).await;

        assert_eq!(recording.seen.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn severity_below_threshold_is_not_notified() {
        let mut dispatcher = Dispatcher::new(Severity::High);
        let recording = Arc::new(RecordingNotifier {
            seen: Mutex::new(Vec::new()),
        });
        dispatcher.register(recording.clone());

        let threat = ThreatEvent::new(
            Severity::Medium,
            "1.2.3.4",
            ThreatReason::BlockedPort { port: 23 },
            "port",
        );
        dispatcher.notify_subscribers(&threat).await;

        assert!(recording.seen.lock().await.is_empty());
    }
}
