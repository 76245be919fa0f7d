pub mod postgres;
pub mod tx;

pub use postgres::{AuditWriter, PgStore};
