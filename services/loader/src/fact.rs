//! Fact Loader - fact rows from fully-resolved staging rows only.

use crate::dimension::CREATED_DATE;
use crate::error::{PlanError, WarehouseError};
use crate::resolver::ResolutionPlan;
use crate::schema::{Column, ColumnType, TableSchema};
use crate::staging::{describe_origin, StagingStore};
use crate::value::{Row, Value};
use crate::warehouse::{Conflict, CreateMode, UpsertOptions, Warehouse};
use chrono::NaiveDate;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

/// Measures computed at load time.
#[derive(Debug, Clone, PartialEq)]
pub enum Derived {
    /// `output = left * right`, null when either side is null.
    Product {
        output: String,
        left: String,
        right: String,
    },
}

impl Derived {
    pub fn product(output: &str, left: &str, right: &str) -> Self {
        Derived::Product {
            output: output.to_string(),
            left: left.to_string(),
            right: right.to_string(),
        }
    }

    fn output(&self) -> &str {
        match self {
            Derived::Product { output, .. } => output,
        }
    }

    fn inputs(&self) -> Vec<&str> {
        match self {
            Derived::Product { left, right, .. } => vec![left.as_str(), right.as_str()],
        }
    }

    fn apply(&self, row: &mut Row) {
        match self {
            Derived::Product { output, left, right } => {
                let value = match (row.get(left).as_f64(), row.get(right).as_f64()) {
                    (Some(l), Some(r)) => Value::from(l * r),
                    _ => Value::Null,
                };
                row.set(output.clone(), value);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FactPolicy {
    /// Every run adds rows. Re-running the same batch duplicates them.
    Append,
    /// One row per key; the last staged row wins.
    MergeOn(Vec<String>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FactCounts {
    /// Rows offered to the warehouse (distinct keys under `MergeOn`).
    pub candidates: u64,
    pub inserted: u64,
    pub updated: u64,
    /// Staged rows excluded for a null foreign key.
    pub rejected: u64,
}

#[derive(Debug, Clone)]
pub struct FactSpec {
    pub schema: TableSchema,
    /// `(staging key column, fact column)`.
    pub foreign_keys: Vec<(String, String)>,
    /// `(staging column, fact column)` for measures and attributes.
    pub mapping: Vec<(String, String)>,
    pub derived: Vec<Derived>,
    pub policy: FactPolicy,
    /// Drop staged rows whose projected keys and measures repeat an earlier row.
    pub distinct: bool,
}

impl FactSpec {
    pub fn new(table: &str, surrogate_key: &str, policy: FactPolicy) -> Self {
        let mut schema = TableSchema::new(table).with_surrogate_key(surrogate_key);
        if let FactPolicy::MergeOn(key) = &policy {
            schema.unique_key = key.clone();
        }
        Self {
            schema,
            foreign_keys: Vec::new(),
            mapping: Vec::new(),
            derived: Vec::new(),
            policy,
            distinct: false,
        }
    }

    pub fn foreign_key(mut self, staging_column: &str, column: &str) -> Self {
        self.foreign_keys.push((staging_column.to_string(), column.to_string()));
        self.schema = self.schema.column(Column::required(column, ColumnType::KeyRef));
        self
    }

    pub fn measure(mut self, staging_column: &str, column: Column) -> Self {
        self.mapping.push((staging_column.to_string(), column.name.clone()));
        self.schema = self.schema.column(column);
        self
    }

    pub fn derive(mut self, derived: Derived) -> Self {
        self.schema = self.schema.column(Column::float(derived.output()));
        self.derived.push(derived);
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Adds the load date; call last so it ends the column list.
    pub fn dated(mut self) -> Self {
        self.schema = self.schema.column(Column::date(CREATED_DATE));
        self
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn validate(&self, staging: &TableSchema, plan: &ResolutionPlan) -> Result<(), PlanError> {
        let context = format!("fact {}", self.name());
        for (key_column, _) in &self.foreign_keys {
            if !plan.resolves(key_column) {
                return Err(PlanError::UnresolvedDependency {
                    target: self.name().to_string(),
                    key_column: key_column.clone(),
                });
            }
            staging.require(&context, key_column)?;
        }
        for (staging_column, _) in &self.mapping {
            staging.require(&context, staging_column)?;
        }
        for derived in &self.derived {
            for input in derived.inputs() {
                self.schema.require(&context, input)?;
            }
        }
        if let FactPolicy::MergeOn(key) = &self.policy {
            if key.is_empty() {
                return Err(PlanError::Invalid(format!("{}: empty merge key", context)));
            }
            for column in key {
                self.schema.require(&context, column)?;
            }
        }
        Ok(())
    }

    /// Split staged rows into fact rows and the count excluded for a null
    /// foreign key.
    pub fn project(&self, staged: &[Row], run_date: NaiveDate) -> (Vec<Row>, u64) {
        let mut rows = Vec::with_capacity(staged.len());
        let mut rejected = 0;
        let mut seen: HashSet<Vec<Option<String>>> = HashSet::new();
        for source in staged {
            let missing: Vec<&str> = self
                .foreign_keys
                .iter()
                .filter(|(s, _)| source.get(s).is_null())
                .map(|(s, _)| s.as_str())
                .collect();
            if !missing.is_empty() {
                rejected += 1;
                debug!(
                    table = %self.name(),
                    origin = %describe_origin(source),
                    columns = ?missing,
                    "fact row excluded: unresolved foreign key"
                );
                continue;
            }

            let mut row: Row = self
                .foreign_keys
                .iter()
                .chain(self.mapping.iter())
                .map(|(s, f)| (f.clone(), source.get(s).clone()))
                .collect();
            if self.distinct && !seen.insert(row.columns().map(|(_, v)| v.join_key()).collect()) {
                continue;
            }
            for derived in &self.derived {
                derived.apply(&mut row);
            }
            if self.schema.has(CREATED_DATE) {
                row.set(CREATED_DATE, run_date);
            }
            rows.push(row);
        }
        (rows, rejected)
    }

    pub async fn load(
        &self,
        warehouse: &dyn Warehouse,
        staging: &StagingStore,
        run_date: NaiveDate,
    ) -> Result<FactCounts, WarehouseError> {
        warehouse.create_table(&self.schema, CreateMode::IfNotExists).await?;
        let staged = staging.read(warehouse, &StagingStore::batch(run_date)).await?;
        let (rows, rejected) = self.project(&staged, run_date);
        if rejected > 0 {
            warn!(table = %self.name(), rejected, "staged rows with unresolved foreign keys excluded");
        }

        let mut counts = FactCounts {
            rejected,
            ..FactCounts::default()
        };
        match &self.policy {
            FactPolicy::Append => {
                counts.candidates = rows.len() as u64;
                let loaded = warehouse.insert_batch(&self.schema, &rows, Conflict::Fail).await?;
                counts.inserted = loaded.inserted;
            }
            FactPolicy::MergeOn(key) => {
                let rows = last_per_key(rows, key);
                counts.candidates = rows.len() as u64;
                let options = UpsertOptions::on(key).preserve(CREATED_DATE);
                let loaded = warehouse.upsert_batch(&self.schema, &rows, &options).await?;
                counts.inserted = loaded.inserted;
                counts.updated = loaded.updated;
            }
        }

        info!(
            table = %self.name(),
            inserted = counts.inserted,
            updated = counts.updated,
            rejected = counts.rejected,
            "fact loaded"
        );
        Ok(counts)
    }
}

/// Last row per key in staging order, kept at the position of its key's
/// first appearance.
fn last_per_key(rows: Vec<Row>, key: &[String]) -> Vec<Row> {
    let mut slot: HashMap<Vec<String>, usize> = HashMap::new();
    let mut out: Vec<Row> = Vec::new();
    let mut keyless: HashSet<usize> = HashSet::new();
    for row in rows {
        match row.key_tuple(key) {
            Some(tuple) => match slot.get(&tuple) {
                Some(&i) => out[i] = row,
                None => {
                    slot.insert(tuple, out.len());
                    out.push(row);
                }
            },
            None => {
                keyless.insert(out.len());
                out.push(row);
            }
        }
    }
    // A null merge key cannot be upserted.
    out.into_iter()
        .enumerate()
        .filter(|(i, _)| !keyless.contains(i))
        .map(|(_, row)| row)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sale() -> FactSpec {
        FactSpec::new("fact_sale", "sale_key", FactPolicy::Append)
            .foreign_key("product_key", "product_key")
            .foreign_key("user_key", "user_key")
            .measure("price", Column::float("price"))
            .measure("quantity", Column::integer("quantity"))
            .derive(Derived::product("total_sale", "price", "quantity"))
            .dated()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[test]
    fn test_unresolved_foreign_key_is_excluded() {
        let staged = vec![
            Row::new().with("product_key", 1_i64).with("user_key", 2_i64).with("price", 10.0).with("quantity", 3_i64),
            Row::new().with("product_key", 1_i64).with("price", 10.0).with("quantity", 1_i64),
        ];
        let (rows, rejected) = sale().project(&staged, day());
        assert_eq!(rows.len(), 1);
        assert_eq!(rejected, 1);
        assert!(rows.iter().all(|r| !r.get("product_key").is_null() && !r.get("user_key").is_null()));
    }

    #[test]
    fn test_total_sale_is_price_times_quantity() {
        let staged = vec![Row::new()
            .with("product_key", 1_i64)
            .with("user_key", 2_i64)
            .with("price", 109.95)
            .with("quantity", 4_i64)];
        let (rows, _) = sale().project(&staged, day());
        assert_eq!(rows[0].get("total_sale"), &Value::Float(109.95 * 4.0));
        assert_eq!(rows[0].get(CREATED_DATE), &Value::from(day()));
    }

    #[test]
    fn test_derived_null_when_input_missing() {
        let staged = vec![Row::new().with("product_key", 1_i64).with("user_key", 2_i64).with("quantity", 4_i64)];
        let (rows, _) = sale().project(&staged, day());
        assert!(rows[0].get("total_sale").is_null());
    }

    #[test]
    fn test_distinct_drops_repeated_rows() {
        let spec = FactSpec::new("fact_gross", "gross_key", FactPolicy::Append)
            .foreign_key("movie_key", "movie_key")
            .foreign_key("actor_key", "actor_key")
            .measure("gross", Column::float("gross"))
            .distinct();
        let row = Row::new().with("movie_key", 1_i64).with("actor_key", 2_i64).with("gross", 10.0);
        let other = Row::new().with("movie_key", 1_i64).with("actor_key", 3_i64).with("gross", 10.0);
        let (rows, _) = spec.project(&[row.clone(), other, row.with("genre", "Drama")], day());
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn test_last_per_key_keeps_latest() {
        let rows = vec![
            Row::new().with("product_key", 1_i64).with("price", 1.0),
            Row::new().with("product_key", 2_i64).with("price", 2.0),
            Row::new().with("product_key", 1_i64).with("price", 3.0),
        ];
        let kept = last_per_key(rows, &["product_key".to_string()]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].get("price"), &Value::Float(3.0));
        assert_eq!(kept[1].get("price"), &Value::Float(2.0));
    }

    #[test]
    fn test_merge_key_sets_unique_constraint() {
        let spec = FactSpec::new("fact_price", "price_key", FactPolicy::MergeOn(vec!["product_key".to_string()]))
            .foreign_key("product_key", "product_key");
        assert_eq!(spec.schema.unique_key, vec!["product_key".to_string()]);
    }
}
