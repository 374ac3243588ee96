//! Control API NetSentry.
//!
//! REST-интерфейс для наблюдения за движком и администрирования:
//! статус, история угроз, правила, блок-листы.

pub mod server;

pub use server::{ApiServer, ApiServerHandle, ApiState};
