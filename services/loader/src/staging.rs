//! Staging Store - the run's records, one row per exploded position.

use crate::error::WarehouseError;
use crate::normalizer::NormalizedRow;
use crate::schema::{Column, ColumnType, TableSchema};
use crate::value::{Row, Value};
use crate::warehouse::{Conflict, CreateMode, Filter, Warehouse};
use chrono::NaiveDate;
use std::collections::HashSet;
use tracing::info;

pub const LOAD_BATCH_DATE: &str = "load_batch_date";
pub const SOURCE_POSITION: &str = "source_position";
pub const EXPLODE_INDEX: &str = "explode_index";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Drop and recreate the table, then write.
    Replace,
    /// Create if missing and add rows; earlier batches stay.
    Append,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageCounts {
    pub written: u64,
}

#[derive(Debug, Clone)]
pub struct StagingStore {
    base: TableSchema,
    schema: TableSchema,
    key_columns: Vec<Column>,
}

impl StagingStore {
    /// `record_schema` is the normalised column set; bookkeeping columns and
    /// one nullable key column per entry in `key_columns` are added.
    pub fn new(table: &str, record_schema: &TableSchema, key_columns: &[&str]) -> Self {
        let base = TableSchema::new(table)
            .columns(record_schema.columns.iter().cloned())
            .column(Column::required(LOAD_BATCH_DATE, ColumnType::Date))
            .column(Column::required(SOURCE_POSITION, ColumnType::Integer))
            .column(Column::required(EXPLODE_INDEX, ColumnType::Integer))
            .ordered_by(&[LOAD_BATCH_DATE, SOURCE_POSITION, EXPLODE_INDEX]);
        let key_columns: Vec<Column> = key_columns.iter().map(|k| Column::key_ref(k)).collect();
        let schema = base.clone().columns(key_columns.iter().cloned());
        Self {
            base,
            schema,
            key_columns,
        }
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Full column set, key columns included.
    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn is_key_column(&self, column: &str) -> bool {
        self.key_columns.iter().any(|c| c.name == column)
    }

    /// The standard read predicate: this run's batch.
    pub fn batch(run_date: NaiveDate) -> Filter {
        Filter::eq(LOAD_BATCH_DATE, run_date)
    }

    pub fn to_rows(rows: &[NormalizedRow], run_date: NaiveDate) -> Vec<Row> {
        rows.iter()
            .map(|n| {
                n.row
                    .clone()
                    .with(LOAD_BATCH_DATE, run_date)
                    .with(SOURCE_POSITION, n.source_position as i64)
                    .with(EXPLODE_INDEX, n.explode_index as i64)
            })
            .collect()
    }

    /// No deduplication happens here; duplicates are resolved downstream.
    pub async fn write(
        &self,
        warehouse: &dyn Warehouse,
        rows: &[NormalizedRow],
        run_date: NaiveDate,
        mode: WriteMode,
    ) -> Result<StageCounts, WarehouseError> {
        let create = match mode {
            WriteMode::Replace => CreateMode::Replace,
            WriteMode::Append => CreateMode::IfNotExists,
        };
        warehouse.create_table(&self.base, create).await?;
        let counts = warehouse
            .insert_batch(&self.base, &Self::to_rows(rows, run_date), Conflict::Fail)
            .await?;
        warehouse.add_columns(&self.base, &self.key_columns).await?;

        info!(table = %self.name(), written = counts.inserted, mode = ?mode, "staging written");
        Ok(StageCounts {
            written: counts.inserted,
        })
    }

    pub async fn read(&self, warehouse: &dyn Warehouse, filter: &Filter) -> Result<Vec<Row>, WarehouseError> {
        warehouse.select(&self.schema, filter).await
    }

    /// Distinct non-null tuples of `columns` among rows matching `filter`.
    pub async fn count_distinct(
        &self,
        warehouse: &dyn Warehouse,
        filter: &Filter,
        columns: &[String],
    ) -> Result<u64, WarehouseError> {
        let rows = self.read(warehouse, filter).await?;
        let distinct: HashSet<Vec<String>> = rows.iter().filter_map(|r| r.key_tuple(columns)).collect();
        Ok(distinct.len() as u64)
    }
}

/// Staging order key of a row: `(load_batch_date, source_position, explode_index)`.
pub fn origin(row: &Row) -> (Option<NaiveDate>, i64, i64) {
    (
        row.get(LOAD_BATCH_DATE).as_date(),
        row.get(SOURCE_POSITION).as_i64().unwrap_or_default(),
        row.get(EXPLODE_INDEX).as_i64().unwrap_or_default(),
    )
}

pub fn describe_origin(row: &Row) -> String {
    let (date, position, index) = origin(row);
    format!(
        "{}#{}.{}",
        date.map(Value::from).unwrap_or(Value::Null),
        position,
        index
    )
}
