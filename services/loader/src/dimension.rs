//! Dimension Loader - projects staged rows into a dimension table.

use crate::error::{PlanError, WarehouseError};
use crate::schema::{Column, ColumnType, TableSchema};
use crate::staging::StagingStore;
use crate::value::Row;
use crate::warehouse::{Conflict, CreateMode, LoadCounts, UpsertOptions, Warehouse};
use chrono::NaiveDate;
use std::collections::HashSet;
use tracing::{info, warn};

pub const CREATED_DATE: &str = "created_date";
pub const LAST_UPDATED_DATE: &str = "last_updated_date";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionMode {
    /// Existing keys get their attributes overwritten and `last_updated_date` stamped.
    Upsert,
    /// Existing keys are skipped.
    InsertOnly,
}

#[derive(Debug, Clone)]
pub struct DimensionSpec {
    pub schema: TableSchema,
    /// `(staging column, dimension column)`.
    pub mapping: Vec<(String, String)>,
    pub business_key: Vec<String>,
    pub mode: DimensionMode,
}

impl DimensionSpec {
    pub fn new(table: &str, surrogate_key: &str, mode: DimensionMode) -> Self {
        let mut schema = TableSchema::new(table)
            .with_surrogate_key(surrogate_key)
            .column(Column::date(CREATED_DATE));
        if mode == DimensionMode::Upsert {
            schema = schema.column(Column::date(LAST_UPDATED_DATE));
        }
        Self {
            schema,
            mapping: Vec::new(),
            business_key: Vec::new(),
            mode,
        }
    }

    /// A business-key part. Null parts make the whole key null.
    pub fn key(mut self, staging_column: &str, column: Column) -> Self {
        self.business_key.push(column.name.clone());
        self.schema.unique_key = self.business_key.clone();
        self.attribute(staging_column, column)
    }

    pub fn attribute(mut self, staging_column: &str, mut column: Column) -> Self {
        if self.business_key.contains(&column.name) {
            column.nullable = false;
        }
        self.mapping.push((staging_column.to_string(), column.name.clone()));
        self.schema = self.schema.column(column);
        self
    }

    /// A nullable key reference filled later by propagation.
    pub fn reference(mut self, column: &str) -> Self {
        self.schema = self.schema.column(Column::key_ref(column));
        self
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn surrogate_key(&self) -> Option<&str> {
        self.schema.surrogate_key.as_deref()
    }

    /// Staging columns that make up the business key.
    pub fn staging_key(&self) -> Vec<String> {
        self.business_key
            .iter()
            .filter_map(|dim| self.mapping.iter().find(|(_, d)| d == dim).map(|(s, _)| s.clone()))
            .collect()
    }

    pub fn validate(&self, staging: &TableSchema) -> Result<(), PlanError> {
        if self.business_key.is_empty() {
            return Err(PlanError::Invalid(format!("dimension '{}' has no business key", self.name())));
        }
        for (staging_column, _) in &self.mapping {
            staging.require(&format!("dimension {}", self.name()), staging_column)?;
        }
        Ok(())
    }

    /// Project staged rows; first occurrence of a business key wins. Returns
    /// the rows and the number of staged rows whose key had a null part.
    pub fn project(&self, staged: &[Row], run_date: NaiveDate) -> (Vec<Row>, u64) {
        let mut seen: HashSet<Vec<String>> = HashSet::new();
        let mut rows = Vec::new();
        let mut null_keys = 0;
        for source in staged {
            let mut row: Row = self
                .mapping
                .iter()
                .map(|(s, d)| (d.clone(), source.get(s).clone()))
                .collect();
            let Some(key) = row.key_tuple(&self.business_key) else {
                null_keys += 1;
                continue;
            };
            if seen.insert(key) {
                row.set(CREATED_DATE, run_date);
                rows.push(row);
            }
        }
        (rows, null_keys)
    }

    pub async fn load(
        &self,
        warehouse: &dyn Warehouse,
        staging: &StagingStore,
        run_date: NaiveDate,
    ) -> Result<LoadCounts, WarehouseError> {
        warehouse.create_table(&self.schema, CreateMode::IfNotExists).await?;

        let staged = staging.read(warehouse, &StagingStore::batch(run_date)).await?;
        let (rows, null_keys) = self.project(&staged, run_date);
        if null_keys > 0 {
            warn!(table = %self.name(), rows = null_keys, "staged rows with a null business key skipped");
        }

        let mut counts = match self.mode {
            DimensionMode::Upsert => {
                // Propagated key references belong to the resolver.
                let options = self
                    .schema
                    .columns
                    .iter()
                    .filter(|c| c.ty == ColumnType::KeyRef)
                    .fold(UpsertOptions::on(&self.business_key), |o, c| o.preserve(&c.name))
                    .stamp(LAST_UPDATED_DATE, run_date)
                    .preserve(CREATED_DATE);
                warehouse.upsert_batch(&self.schema, &rows, &options).await?
            }
            DimensionMode::InsertOnly => {
                let counts = warehouse.insert_batch(&self.schema, &rows, Conflict::Skip).await?;
                if counts.skipped > 0 {
                    info!(table = %self.name(), skipped = counts.skipped, "existing keys left untouched");
                }
                counts
            }
        };
        counts.skipped += null_keys;

        info!(
            table = %self.name(),
            inserted = counts.inserted,
            updated = counts.updated,
            skipped = counts.skipped,
            "dimension loaded"
        );
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::NormalizedRow;
    use crate::staging::WriteMode;
    use crate::value::Value;
    use crate::warehouse::MemoryWarehouse;

    fn user_dim(mode: DimensionMode) -> DimensionSpec {
        DimensionSpec::new("dim_user", "user_key", mode)
            .key("user_id", Column::new("user_id", ColumnType::Text))
            .attribute("user_name", Column::text("user_name"))
    }

    fn staging() -> StagingStore {
        let record = TableSchema::new("record").columns([Column::text("user_id"), Column::text("user_name")]);
        StagingStore::new("stg", &record, &["user_key"])
    }

    fn rows(users: &[(Option<&str>, &str)]) -> Vec<NormalizedRow> {
        users
            .iter()
            .enumerate()
            .map(|(i, (id, name))| NormalizedRow {
                source_position: i,
                explode_index: 0,
                row: Row::new().with("user_id", *id).with("user_name", *name),
            })
            .collect()
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
    }

    #[test]
    fn test_business_key_column_is_required() {
        let spec = user_dim(DimensionMode::Upsert);
        assert!(!spec.schema.find("user_id").unwrap().nullable);
        assert_eq!(spec.schema.unique_key, vec!["user_id".to_string()]);
        assert!(spec.schema.has(LAST_UPDATED_DATE));
        assert!(!user_dim(DimensionMode::InsertOnly).schema.has(LAST_UPDATED_DATE));
    }

    #[test]
    fn test_project_first_occurrence_wins() {
        let staged = vec![
            Row::new().with("user_id", "u1").with("user_name", "first"),
            Row::new().with("user_id", "u1").with("user_name", "second"),
            Row::new().with("user_name", "anonymous"),
        ];
        let (rows, nulls) = user_dim(DimensionMode::Upsert).project(&staged, day(1));
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("user_name"), &Value::from("first"));
        assert_eq!(nulls, 1);
    }

    #[test]
    fn test_validate_catches_staging_typo() {
        let spec = DimensionSpec::new("dim_user", "user_key", DimensionMode::Upsert)
            .key("usr_id", Column::text("user_id"));
        assert!(matches!(
            spec.validate(staging().schema()),
            Err(PlanError::UnknownColumn { .. })
        ));
    }

    #[tokio::test]
    async fn test_upsert_rerun_updates_instead_of_duplicating() {
        let wh = MemoryWarehouse::columnar();
        let stg = staging();
        let spec = user_dim(DimensionMode::Upsert);

        stg.write(&wh, &rows(&[(Some("u1"), "a"), (Some("u2"), "b")]), day(1), WriteMode::Append)
            .await
            .unwrap();
        let first = spec.load(&wh, &stg, day(1)).await.unwrap();
        assert_eq!((first.inserted, first.updated), (2, 0));

        stg.write(&wh, &rows(&[(Some("u1"), "renamed")]), day(2), WriteMode::Append)
            .await
            .unwrap();
        let second = spec.load(&wh, &stg, day(2)).await.unwrap();
        assert_eq!((second.inserted, second.updated), (0, 1));

        let stored = wh.rows("dim_user");
        assert_eq!(stored.len(), 2);
        let u1 = stored.iter().find(|r| r.get("user_id") == &Value::from("u1")).unwrap();
        assert_eq!(u1.get("user_name"), &Value::from("renamed"));
        assert_eq!(u1.get(CREATED_DATE), &Value::from(day(1)));
        assert_eq!(u1.get(LAST_UPDATED_DATE), &Value::from(day(2)));
    }

    #[tokio::test]
    async fn test_insert_only_skips_existing_keys() {
        let wh = MemoryWarehouse::relational();
        let stg = staging();
        let spec = user_dim(DimensionMode::InsertOnly);

        stg.write(&wh, &rows(&[(Some("u1"), "a")]), day(1), WriteMode::Replace).await.unwrap();
        spec.load(&wh, &stg, day(1)).await.unwrap();
        stg.write(&wh, &rows(&[(Some("u1"), "changed"), (None, "x")]), day(1), WriteMode::Replace)
            .await
            .unwrap();
        let counts = spec.load(&wh, &stg, day(1)).await.unwrap();

        assert_eq!(counts, LoadCounts { inserted: 0, updated: 0, skipped: 2 });
        assert_eq!(wh.rows("dim_user")[0].get("user_name"), &Value::from("a"));
    }
}
