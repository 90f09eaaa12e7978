//! Warehouse capability interface.
//!
//! Every stage talks to the store through [`Warehouse`]; the relational
//! (Postgres) and columnar (in-memory emulation) backends are adapters
//! behind it.

pub mod memory;
pub mod postgres;

use crate::error::WarehouseError;
use crate::schema::{Column, TableSchema};
use crate::value::{Row, Value};
use async_trait::async_trait;

pub use memory::MemoryWarehouse;
pub use postgres::PostgresWarehouse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Monotonic integers (`BIGSERIAL`).
    Serial,
    /// Random UUIDs (`GENERATE_UUID()`).
    Uuid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub key_strategy: KeyStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    IfNotExists,
    /// Drop and recreate.
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
    Fail,
    /// Rows whose unique key already exists are skipped.
    Skip,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadCounts {
    pub inserted: u64,
    pub updated: u64,
    pub skipped: u64,
}

impl LoadCounts {
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

impl std::ops::AddAssign for LoadCounts {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpsertOptions {
    /// Conflict target; must be the table's unique key.
    pub key: Vec<String>,
    /// Column stamped with the given value when an existing row is updated.
    pub stamp: Option<(String, Value)>,
    /// Columns left untouched on update (e.g. `created_date`).
    pub preserve: Vec<String>,
}

impl UpsertOptions {
    pub fn on(key: &[String]) -> Self {
        Self {
            key: key.to_vec(),
            stamp: None,
            preserve: Vec::new(),
        }
    }

    pub fn stamp(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.stamp = Some((column.to_string(), value.into()));
        self
    }

    pub fn preserve(mut self, column: &str) -> Self {
        self.preserve.push(column.to_string());
        self
    }

    /// Whether `column` is overwritten when a row already exists.
    pub fn overwrites(&self, column: &str) -> bool {
        !self.key.iter().any(|k| k == column)
            && !self.preserve.iter().any(|p| p == column)
            && self.stamp.as_ref().map_or(true, |(s, _)| s != column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(String, Value),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_string(), value.into())
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(column, value) => match (row.get(column).join_key(), value.join_key()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }
}

/// One `UPDATE .. SET column = value WHERE conditions` unit.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyMatch {
    pub conditions: Vec<(String, Value)>,
    pub value: Value,
}

impl KeyMatch {
    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|(column, expected)| {
            match (row.get(column).join_key(), expected.join_key()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            }
        })
    }
}

/// Write `column` on every row of the target matching one of `matches`,
/// restricted to rows inside `scope`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
    pub column: String,
    pub matches: Vec<KeyMatch>,
    pub scope: Filter,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    async fn create_table(&self, schema: &TableSchema, mode: CreateMode) -> Result<(), WarehouseError>;

    /// Add nullable columns that are not there yet.
    async fn add_columns(&self, schema: &TableSchema, columns: &[Column]) -> Result<(), WarehouseError>;

    async fn insert_batch(
        &self,
        schema: &TableSchema,
        rows: &[Row],
        conflict: Conflict,
    ) -> Result<LoadCounts, WarehouseError>;

    async fn upsert_batch(
        &self,
        schema: &TableSchema,
        rows: &[Row],
        options: &UpsertOptions,
    ) -> Result<LoadCounts, WarehouseError>;

    async fn select(&self, schema: &TableSchema, filter: &Filter) -> Result<Vec<Row>, WarehouseError>;

    /// Returns the number of rows written.
    async fn assign(&self, schema: &TableSchema, assignment: &Assignment) -> Result<u64, WarehouseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_eq_never_matches_null() {
        let row = Row::new().with("a", Value::Null);
        assert!(!Filter::eq("a", Value::Null).matches(&row));
        assert!(Filter::All.matches(&row));
    }

    #[test]
    fn test_upsert_options_overwrites() {
        let options = UpsertOptions::on(&["product_id".to_string()])
            .stamp("last_updated_date", Value::Null)
            .preserve("created_date");
        assert!(options.overwrites("product_name"));
        assert!(!options.overwrites("product_id"));
        assert!(!options.overwrites("created_date"));
        assert!(!options.overwrites("last_updated_date"));
    }
}
