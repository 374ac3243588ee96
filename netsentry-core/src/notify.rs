//! Уведомления об угрозах.
//!
//! Диспетчер не знает, куда уходят уведомления: он работает с трейтом
//! [`Notifier`]. Из коробки есть заглушка (пишет в tracing) и вебхук
//! (POST JSON через reqwest).

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::record::{Severity, ThreatEvent};

/// Трейт подписчика на события угроз.
///
/// Ошибка реализации логируется диспетчером и не прерывает доставку
/// остальным подписчикам.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Доставляет событие угрозы.
    async fn notify(&self, threat: &ThreatEvent) -> Result<()>;

    /// Имя бэкенда (для логирования и отладки).
    fn backend_name(&self) -> &str;
}

/// Заглушка: просто логирует угрозу через tracing.
#[derive(Debug, Default)]
pub struct StubNotifier;

#[async_trait]
impl Notifier for StubNotifier {
    async fn notify(&self, threat: &ThreatEvent) -> Result<()> {
        match threat.severity {
            Severity::Critical => tracing::error!(
                "[THREAT] {} from {}: {}",
                threat.severity,
                threat.source_key,
                threat.description
            ),
            Severity::High => tracing::warn!(
                "[THREAT] {} from {}: {}",
                threat.severity,
                threat.source_key,
                threat.description
            ),
            _ => tracing::info!(
                "[THREAT] {} from {}: {}",
                threat.severity,
                threat.source_key,
                threat.description
            ),
        }
        Ok(())
    }

    fn backend_name(&self) -> &str {
        "stub"
    }
}

/// Notifier на основе вебхуков: отправляет угрозу POST-запросом в JSON.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    /// URL вебхука.
    webhook_url: String,
    /// Дополнительные заголовки HTTP-запросов.
    headers: HashMap<String, String>,
    /// Таймаут HTTP-запросов в секундах.
    timeout_seconds: u64,
    /// HTTP клиент; создаётся один раз и переиспользует пул соединений.
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(webhook_url: impl Into<String>) -> Self {
        let timeout_seconds = 10;
        Self {
            webhook_url: webhook_url.into(),
            headers: HashMap::new(),
            timeout_seconds,
            client: Self::build_client(timeout_seconds),
        }
    }

    /// Устанавливает дополнительные заголовки для HTTP запросов.
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Устанавливает таймаут для HTTP запросов и пересоздаёт клиент.
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self.client = Self::build_client(timeout_seconds);
        self
    }

    pub fn webhook_url(&self) -> &str {
        &self.webhook_url
    }

    pub fn timeout_seconds(&self) -> u64 {
        self.timeout_seconds
    }

    fn build_client(timeout_seconds: u64) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, threat: &ThreatEvent) -> Result<()> {
        let payload = serde_json::json!({
            "id": threat.id,
            "severity": threat.severity,
            "source_key": threat.source_key,
            "reason": threat.reason,
            "description": threat.description,
            "timestamp": threat.timestamp.to_rfc3339(),
        });

        tracing::debug!(
            "Sending webhook notification to {}: {} from {}",
            self.webhook_url,
            threat.severity,
            threat.source_key
        );

        let mut request_builder = self.client.post(&self.webhook_url);
        for (key, value) in &self.headers {
            request_builder = request_builder.header(key, value);
        }

        let response = request_builder.json(&payload).send().await;

        match response {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => {
                let status = resp.status();
                let body = resp
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                tracing::error!(
                    "Failed to send webhook notification to {}: HTTP {} - {}",
                    self.webhook_url,
                    status,
                    body
                );
                Err(anyhow::anyhow!(
                    "webhook notification failed: HTTP {status} - {body}"
                ))
            }
            Err(e) => {
                tracing::error!(
                    "Failed to send webhook notification to {}: {}",
                    self.webhook_url,
                    e
                );
                Err(anyhow::anyhow!("webhook notification failed: {e}"))
            }
        }
    }

    fn backend_name(&self) -> &str {
        "webhook"
    }
}
