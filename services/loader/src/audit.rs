//! Count reconciliation written to `etl_audit_log` after each load.

use crate::error::WarehouseError;
use crate::schema::{Column, ColumnType, TableSchema};
use crate::value::{Row, Value};
use crate::warehouse::{Conflict, CreateMode, Warehouse};
use chrono::NaiveDate;
use std::fmt;
use tracing::{info, warn};

pub const AUDIT_TABLE: &str = "etl_audit_log";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditStatus {
    Pass,
    Fail,
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditStatus::Pass => write!(f, "PASS"),
            AuditStatus::Fail => write!(f, "FAIL"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuditLogEntry {
    pub table_name: String,
    pub staged_count: u64,
    pub insert_count: u64,
    pub update_count: u64,
    pub status: AuditStatus,
    pub log_date: NaiveDate,
}

impl AuditLogEntry {
    /// PASS iff every staged key was either inserted or updated.
    pub fn new(table_name: &str, staged_count: u64, insert_count: u64, update_count: u64, log_date: NaiveDate) -> Self {
        let status = if staged_count == insert_count + update_count {
            AuditStatus::Pass
        } else {
            AuditStatus::Fail
        };
        Self {
            table_name: table_name.to_string(),
            staged_count,
            insert_count,
            update_count,
            status,
            log_date,
        }
    }

    fn to_row(&self) -> Row {
        Row::new()
            .with("table_name", self.table_name.as_str())
            .with("staging_count", self.staged_count as i64)
            .with("insert_count", self.insert_count as i64)
            .with("update_count", self.update_count as i64)
            .with("status", self.status.to_string())
            .with("log_date", Value::Date(self.log_date))
    }
}

#[derive(Debug, Clone)]
pub struct AuditLog {
    schema: TableSchema,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        let schema = TableSchema::new(AUDIT_TABLE)
            .with_surrogate_key("log_id")
            .column(Column::required("table_name", ColumnType::Text))
            .column(Column::integer("staging_count"))
            .column(Column::integer("insert_count"))
            .column(Column::integer("update_count"))
            .column(Column::required("status", ColumnType::Text))
            .column(Column::date("log_date"));
        Self { schema }
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    /// Append one entry. The caller decides whether a failure here matters.
    pub async fn record(
        &self,
        warehouse: &dyn Warehouse,
        table_name: &str,
        staged_count: u64,
        insert_count: u64,
        update_count: u64,
        run_date: NaiveDate,
    ) -> Result<AuditLogEntry, WarehouseError> {
        let entry = AuditLogEntry::new(table_name, staged_count, insert_count, update_count, run_date);
        warehouse.create_table(&self.schema, CreateMode::IfNotExists).await?;
        warehouse.insert_batch(&self.schema, &[entry.to_row()], Conflict::Fail).await?;

        match entry.status {
            AuditStatus::Pass => info!(
                table = %entry.table_name,
                staged = entry.staged_count,
                inserted = entry.insert_count,
                updated = entry.update_count,
                "audit PASS"
            ),
            AuditStatus::Fail => warn!(
                table = %entry.table_name,
                staged = entry.staged_count,
                inserted = entry.insert_count,
                updated = entry.update_count,
                "audit FAIL"
            ),
        }
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::MemoryWarehouse;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn test_status_is_pass_iff_counts_reconcile() {
        assert_eq!(AuditLogEntry::new("dim_user", 5, 3, 2, day()).status, AuditStatus::Pass);
        assert_eq!(AuditLogEntry::new("dim_user", 5, 3, 1, day()).status, AuditStatus::Fail);
        assert_eq!(AuditLogEntry::new("dim_user", 0, 0, 0, day()).status, AuditStatus::Pass);
    }

    #[tokio::test]
    async fn test_record_appends_row() {
        let wh = MemoryWarehouse::relational();
        let log = AuditLog::new();
        log.record(&wh, "dim_product", 4, 4, 0, day()).await.unwrap();
        log.record(&wh, "dim_user", 4, 2, 1, day()).await.unwrap();

        let rows = wh.rows(AUDIT_TABLE);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("status"), &Value::from("PASS"));
        assert_eq!(rows[1].get("status"), &Value::from("FAIL"));
        assert_eq!(rows[1].get("log_id"), &Value::Int(2));
    }
}
