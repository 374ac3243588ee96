//! Источники записей телеметрии.
//!
//! Цикл сбора не привязан к конкретному захвату трафика: он опрашивает
//! трейт [`RecordSource`]. Встроенный [`SyntheticSource`] генерирует
//! правдоподобный пакетный трафик — реального захвата в этой системе
//! нет, как и в исходной.

use anyhow::Result;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::CollectorSettings;
use crate::record::{attr, Record};

/// Источник записей, опрашиваемый циклом сбора.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Возвращает очередную порцию записей. Пустой вектор — не ошибка.
    async fn poll(&mut self) -> Result<Vec<Record>>;

    /// Имя источника (для логирования).
    fn source_name(&self) -> &str;
}

/// Синтетический генератор пакетного трафика.
pub struct SyntheticSource {
    batch_size: usize,
    sources: Vec<String>,
}

impl SyntheticSource {
    pub fn new(batch_size: usize, sources: Vec<String>) -> Self {
        Self {
            batch_size,
            sources,
        }
    }

    pub fn from_settings(settings: &CollectorSettings) -> Self {
        Self::new(settings.batch_size, settings.simulated_sources.clone())
    }

    fn generate_record(&self, rng: &mut impl Rng) -> Record {
        let source = self
            .sources
            .choose(rng)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        // Изредка проскакивает туннельный протокол и jumbo-кадр,
        // чтобы классификатору было что ловить
        let protocol = match rng.gen_range(0..100) {
            0..=59 => "tcp",
            60..=89 => "udp",
            90..=97 => "icmp",
            _ => "gre",
        };
        let size_bytes: u64 = if rng.gen_range(0..1000) == 0 {
            rng.gen_range(9001..65_536)
        } else {
            rng.gen_range(40..1500)
        };
        let port: u16 = *[22u16, 53, 80, 123, 443, 8080]
            .choose(rng)
            .expect("port pool is non-empty");

        Record::new(source)
            .with_attr(attr::PORT, port)
            .with_attr(attr::PROTOCOL, protocol)
            .with_attr(attr::SIZE_BYTES, size_bytes)
    }
}

#[async_trait]
impl RecordSource for SyntheticSource {
    async fn poll(&mut self) -> Result<Vec<Record>> {
        let mut rng = rand::thread_rng();
        let records = (0..self.batch_size)
            .map(|_| self.generate_record(&mut rng))
            .collect();
        Ok(records)
    }

    fn source_name(&self) -> &str {
        "synthetic"
    }
}
