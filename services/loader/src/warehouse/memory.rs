//! In-process warehouse. Emulates the columnar store (UUID keys) by
//! default and the relational one with `relational()`. Unique keys are
//! enforced the way the Postgres adapter's constraints enforce them, and every
//! call either applies completely or not at all.

use super::{
    Assignment, Capabilities, Conflict, CreateMode, Filter, KeyStrategy, LoadCounts, UpsertOptions,
    Warehouse,
};
use crate::error::WarehouseError;
use crate::schema::{Column, TableSchema};
use crate::value::{Row, Value};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct MemTable {
    schema: TableSchema,
    rows: Vec<Row>,
    next_key: i64,
}

impl MemTable {
    fn new(schema: &TableSchema) -> Self {
        Self {
            schema: schema.clone(),
            rows: Vec::new(),
            next_key: 1,
        }
    }

    fn generate_key(&mut self, strategy: KeyStrategy) -> Value {
        match strategy {
            KeyStrategy::Serial => {
                let key = self.next_key;
                self.next_key += 1;
                Value::Int(key)
            }
            KeyStrategy::Uuid => Value::Text(Uuid::new_v4().to_string()),
        }
    }

    fn position_of(&self, key: &[String], tuple: &[String]) -> Option<usize> {
        self.rows
            .iter()
            .position(|r| r.key_tuple(key).as_deref() == Some(tuple))
    }

    /// Writes the stored column set, rejecting names the table does not have.
    fn shape(&self, row: &Row) -> Result<Row, WarehouseError> {
        if let Some((name, _)) = row.columns().find(|(name, _)| !self.schema.has(name)) {
            return Err(WarehouseError::schema(
                &self.schema.name,
                format!("column \"{}\" does not exist", name),
            ));
        }
        self.schema.validate(row).map_err(|e| WarehouseError::query(&self.schema.name, e.to_string()))?;
        Ok(self.schema.project(row))
    }
}

#[derive(Debug)]
pub struct MemoryWarehouse {
    capabilities: Capabilities,
    tables: Mutex<BTreeMap<String, MemTable>>,
}

impl MemoryWarehouse {
    /// Columnar capability set: UUID surrogate keys.
    pub fn columnar() -> Self {
        Self::with_capabilities(Capabilities {
            key_strategy: KeyStrategy::Uuid,
        })
    }

    /// Relational capability set: serial keys.
    pub fn relational() -> Self {
        Self::with_capabilities(Capabilities {
            key_strategy: KeyStrategy::Serial,
        })
    }

    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of a table's rows in insertion order. Empty when the table
    /// does not exist.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .ok()
            .and_then(|tables| tables.get(table).map(|t| t.rows.clone()))
            .unwrap_or_default()
    }

    pub fn has_table(&self, table: &str) -> bool {
        self.lock().map(|tables| tables.contains_key(table)).unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, MemTable>>, WarehouseError> {
        self.tables
            .lock()
            .map_err(|_| WarehouseError::Connectivity("in-memory warehouse state is poisoned".to_string()))
    }

    /// Run `f` against a copy of the table and commit only on success.
    fn with_table<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut MemTable) -> Result<T, WarehouseError>,
    ) -> Result<T, WarehouseError> {
        let mut tables = self.lock()?;
        let current = tables
            .get(name)
            .ok_or_else(|| WarehouseError::schema(name, format!("relation \"{}\" does not exist", name)))?;
        let mut working = current.clone();
        let out = f(&mut working)?;
        tables.insert(name.to_string(), working);
        Ok(out)
    }
}

/// Order used by `select`: nulls last, numbers numerically.
fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Date(x), Value::Date(y)) => x.cmp(y),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            _ => a.to_string().cmp(&b.to_string()),
        },
    }
}

#[async_trait]
impl Warehouse for MemoryWarehouse {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn create_table(&self, schema: &TableSchema, mode: CreateMode) -> Result<(), WarehouseError> {
        let mut tables = self.lock()?;
        match mode {
            CreateMode::Replace => {
                tables.insert(schema.name.clone(), MemTable::new(schema));
            }
            CreateMode::IfNotExists => {
                tables
                    .entry(schema.name.clone())
                    .or_insert_with(|| MemTable::new(schema));
            }
        }
        Ok(())
    }

    async fn add_columns(&self, schema: &TableSchema, columns: &[Column]) -> Result<(), WarehouseError> {
        self.with_table(&schema.name, |table| {
            for column in columns {
                if !table.schema.has(&column.name) {
                    let mut added = column.clone();
                    added.nullable = true;
                    table.schema.columns.push(added);
                }
            }
            Ok(())
        })
    }

    async fn insert_batch(
        &self,
        schema: &TableSchema,
        rows: &[Row],
        conflict: Conflict,
    ) -> Result<LoadCounts, WarehouseError> {
        let strategy = self.capabilities.key_strategy;
        self.with_table(&schema.name, |table| {
            let unique = table.schema.unique_key.clone();
            let mut seen: HashSet<Vec<String>> = table
                .rows
                .iter()
                .filter_map(|r| r.key_tuple(&unique))
                .collect();
            let mut counts = LoadCounts::default();

            for row in rows {
                let mut shaped = table.shape(row)?;
                // NULL key parts never collide, as with a SQL UNIQUE constraint.
                if !unique.is_empty() {
                    if let Some(tuple) = shaped.key_tuple(&unique) {
                        if !seen.insert(tuple.clone()) {
                            match conflict {
                                Conflict::Skip => {
                                    counts.skipped += 1;
                                    continue;
                                }
                                Conflict::Fail => {
                                    return Err(WarehouseError::constraint(
                                        &table.schema.name,
                                        format!("duplicate key ({}) = ({})", unique.join(", "), tuple.join(", ")),
                                    ));
                                }
                            }
                        }
                    }
                }
                if let Some(key) = table.schema.surrogate_key.clone() {
                    if shaped.get(&key).is_null() {
                        let generated = table.generate_key(strategy);
                        shaped.set(key, generated);
                    }
                }
                table.rows.push(shaped);
                counts.inserted += 1;
            }
            Ok(counts)
        })
    }

    async fn upsert_batch(
        &self,
        schema: &TableSchema,
        rows: &[Row],
        options: &UpsertOptions,
    ) -> Result<LoadCounts, WarehouseError> {
        let strategy = self.capabilities.key_strategy;
        self.with_table(&schema.name, |table| {
            if options.key.is_empty() || options.key != table.schema.unique_key {
                return Err(WarehouseError::schema(
                    &table.schema.name,
                    format!(
                        "no unique constraint matching ({})",
                        options.key.join(", ")
                    ),
                ));
            }
            let mut touched: HashSet<Vec<String>> = HashSet::new();
            let mut counts = LoadCounts::default();

            for row in rows {
                let mut shaped = table.shape(row)?;
                let Some(tuple) = shaped.key_tuple(&options.key) else {
                    return Err(WarehouseError::constraint(
                        &table.schema.name,
                        format!("null value in conflict key ({})", options.key.join(", ")),
                    ));
                };
                if !touched.insert(tuple.clone()) {
                    return Err(WarehouseError::constraint(
                        &table.schema.name,
                        format!("key ({}) affected twice in one statement", tuple.join(", ")),
                    ));
                }

                match table.position_of(&options.key, &tuple) {
                    Some(index) => {
                        let existing = &mut table.rows[index];
                        for column in table.schema.insertable() {
                            if options.overwrites(&column.name) {
                                existing.set(column.name.clone(), shaped.get(&column.name).clone());
                            }
                        }
                        if let Some((column, value)) = &options.stamp {
                            existing.set(column.clone(), value.clone());
                        }
                        counts.updated += 1;
                    }
                    None => {
                        if let Some(key) = table.schema.surrogate_key.clone() {
                            if shaped.get(&key).is_null() {
                                let generated = table.generate_key(strategy);
                                shaped.set(key, generated);
                            }
                        }
                        table.rows.push(shaped);
                        counts.inserted += 1;
                    }
                }
            }
            Ok(counts)
        })
    }

    async fn select(&self, schema: &TableSchema, filter: &Filter) -> Result<Vec<Row>, WarehouseError> {
        let tables = self.lock()?;
        let table = tables.get(&schema.name).ok_or_else(|| {
            WarehouseError::schema(&schema.name, format!("relation \"{}\" does not exist", schema.name))
        })?;
        if let Some(column) = schema.columns.iter().find(|c| !table.schema.has(&c.name)) {
            return Err(WarehouseError::schema(
                &schema.name,
                format!("column \"{}\" does not exist", column.name),
            ));
        }

        let mut rows: Vec<Row> = table
            .rows
            .iter()
            .filter(|r| filter.matches(r))
            .map(|r| schema.project(r))
            .collect();
        // Insertion order already follows serial keys; only explicit orders sort.
        if !schema.order_by.is_empty() {
            rows.sort_by(|a, b| {
                schema
                    .order_by
                    .iter()
                    .map(|c| compare(a.get(c), b.get(c)))
                    .find(|o| *o != Ordering::Equal)
                    .unwrap_or(Ordering::Equal)
            });
        }
        Ok(rows)
    }

    async fn assign(&self, schema: &TableSchema, assignment: &Assignment) -> Result<u64, WarehouseError> {
        self.with_table(&schema.name, |table| {
            if !table.schema.has(&assignment.column) {
                return Err(WarehouseError::schema(
                    &table.schema.name,
                    format!("column \"{}\" does not exist", assignment.column),
                ));
            }
            let mut written = 0;
            // One UPDATE per match; a later match overwrites an earlier one.
            for key_match in &assignment.matches {
                for row in table
                    .rows
                    .iter_mut()
                    .filter(|r| assignment.scope.matches(r) && key_match.matches(r))
                {
                    row.set(assignment.column.clone(), key_match.value.clone());
                    written += 1;
                }
            }
            Ok(written)
        })
    }
}
