//! Периодический JSON-снапшот состояния движка.
//!
//! Запись best-effort: ошибка записи логируется и не останавливает демон.
//! Формат — плоский JSON-объект без версионирования схемы; файл
//! записывается во временный путь и переименовывается, чтобы читатель
//! никогда не увидел недописанный снапшот.

use anyhow::{Context, Result};
use chrono::Utc;
use std::path::{Path, PathBuf};

use crate::classify::Blocklists;
use crate::engine::{Engine, EngineStatus};
use crate::record::ThreatEvent;

pub struct SnapshotWriter {
    path: PathBuf,
    /// Сколько последних угроз включать в снапшот.
    recent_threats: usize,
}

impl SnapshotWriter {
    pub fn new(path: impl Into<PathBuf>, recent_threats: usize) -> Self {
        Self {
            path: path.into(),
            recent_threats,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Снимает текущее состояние движка и пишет его на диск.
    pub async fn write(&self, engine: &Engine) -> Result<()> {
        let status = engine.get_status().await;
        let threats = engine.recent_threats(self.recent_threats).await;
        let blocklists = engine.blocklists().await;
        self.write_parts(&status, &threats, &blocklists).await
    }

    async fn write_parts(
        &self,
        status: &EngineStatus,
        threats: &[ThreatEvent],
        blocklists: &Blocklists,
    ) -> Result<()> {
        let mut blocked_sources: Vec<&String> = blocklists.sources.iter().collect();
        blocked_sources.sort();
        let mut blocked_ports: Vec<u16> = blocklists.ports.iter().copied().collect();
        blocked_ports.sort_unstable();

        let snapshot = serde_json::json!({
            "generated_at": Utc::now().to_rfc3339(),
            "status": status,
            "recent_threats": threats,
            "blocked_sources": blocked_sources,
            "blocked_ports": blocked_ports,
        });
        let data = serde_json::to_vec_pretty(&snapshot).context("failed to serialize snapshot")?;

        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, &data)
            .await
            .with_context(|| format!("failed to write snapshot to {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| {
                format!("failed to move snapshot into place at {}", self.path.display())
            })?;

        tracing::debug!(
            "Wrote snapshot with {} threats to {}",
            threats.len(),
            self.path.display()
        );
        Ok(())
    }
}
