//! Relational adapter over a sqlx Postgres pool.
//!
//! Business keys are `UNIQUE` constraints, surrogate keys are `BIGSERIAL`, and
//! upserts are `INSERT .. ON CONFLICT DO UPDATE`. Every call runs in a single
//! transaction.

use super::{
    Assignment, Capabilities, Conflict, CreateMode, Filter, KeyMatch, KeyStrategy, LoadCounts,
    UpsertOptions, Warehouse,
};
use crate::error::WarehouseError;
use crate::schema::{Column, ColumnType, TableSchema};
use crate::value::{Row, Value};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row as _};
use tracing::{debug, info};

/// Postgres caps bind parameters per statement at 65535.
const MAX_BIND_PARAMS: usize = 65_535;

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

pub struct PostgresWarehouse {
    pool: PgPool,
}

impl PostgresWarehouse {
    /// Open a pool. With `schema`, every pooled connection gets that
    /// `search_path`.
    pub async fn connect(
        url: &str,
        max_connections: u32,
        schema: Option<&str>,
    ) -> Result<Self, WarehouseError> {
        let search_path = schema.map(|s| format!("SET search_path TO {}", quote_ident(s)));
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .after_connect(move |conn, _meta| {
                let search_path = search_path.clone();
                Box::pin(async move {
                    if let Some(sql) = search_path {
                        sqlx::query(&sql).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .connect(url)
            .await
            .map_err(|e| WarehouseError::Connectivity(e.to_string()))?;

        info!(max_connections, schema = ?schema, "connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
        debug!("postgres pool closed");
    }
}

// =============================================================================
// SQL rendering
// =============================================================================

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn column_list<'a>(columns: impl IntoIterator<Item = &'a str>) -> String {
    columns
        .into_iter()
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn sql_type(ty: ColumnType) -> &'static str {
    match ty {
        ColumnType::Text => "TEXT",
        ColumnType::Integer | ColumnType::KeyRef => "BIGINT",
        ColumnType::Float => "DOUBLE PRECISION",
        ColumnType::Boolean => "BOOLEAN",
        ColumnType::Date => "DATE",
        ColumnType::SurrogateKey => "BIGSERIAL",
    }
}

pub fn column_ddl(column: &Column) -> String {
    let mut ddl = format!("{} {}", quote_ident(&column.name), sql_type(column.ty));
    if column.ty == ColumnType::SurrogateKey {
        ddl.push_str(" PRIMARY KEY");
    } else if !column.nullable {
        ddl.push_str(" NOT NULL");
    }
    ddl
}

pub fn create_table_sql(schema: &TableSchema) -> String {
    let mut parts: Vec<String> = schema.columns.iter().map(column_ddl).collect();
    if !schema.unique_key.is_empty() {
        let key = column_list(schema.unique_key.iter().map(String::as_str));
        // Bridges have no surrogate key; their pair is the primary key.
        if schema.surrogate_key.is_none() {
            parts.push(format!("PRIMARY KEY ({})", key));
        } else {
            parts.push(format!("UNIQUE ({})", key));
        }
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        quote_ident(&schema.name),
        parts.join(", ")
    )
}

pub fn drop_table_sql(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(table))
}

pub fn add_column_sql(table: &str, column: &Column) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
        quote_ident(table),
        quote_ident(&column.name),
        sql_type(column.ty)
    )
}

fn values_clause(rows: usize, width: usize) -> String {
    (0..rows)
        .map(|r| {
            let params: Vec<String> = (1..=width).map(|c| format!("${}", r * width + c)).collect();
            format!("({})", params.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

pub fn insert_sql(table: &str, columns: &[&str], rows: usize, conflict: Conflict) -> String {
    let mut sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_ident(table),
        column_list(columns.iter().copied()),
        values_clause(rows, columns.len())
    );
    if conflict == Conflict::Skip {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }
    sql
}

/// With a stamp, its value is bound after every row parameter.
pub fn upsert_sql(table: &str, columns: &[&str], rows: usize, options: &UpsertOptions) -> String {
    let mut sets: Vec<String> = columns
        .iter()
        .filter(|c| options.overwrites(c))
        .map(|c| format!("{0} = EXCLUDED.{0}", quote_ident(c)))
        .collect();
    if let Some((stamp, _)) = &options.stamp {
        sets.push(format!("{} = ${}", quote_ident(stamp), rows * columns.len() + 1));
    }
    if sets.is_empty() {
        // DO NOTHING would hide the row from RETURNING.
        let first = options.key.first().map(String::as_str).unwrap_or_default();
        sets.push(format!("{0} = EXCLUDED.{0}", quote_ident(first)));
    }
    format!(
        "INSERT INTO {} ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {} RETURNING (xmax = 0) AS inserted",
        quote_ident(table),
        column_list(columns.iter().copied()),
        values_clause(rows, columns.len()),
        column_list(options.key.iter().map(String::as_str)),
        sets.join(", ")
    )
}

pub fn select_sql(schema: &TableSchema, filter: &Filter) -> String {
    let mut sql = format!(
        "SELECT {} FROM {}",
        column_list(schema.columns.iter().map(|c| c.name.as_str())),
        quote_ident(&schema.name)
    );
    if let Filter::Eq(column, _) = filter {
        sql.push_str(&format!(" WHERE {} = $1", quote_ident(column)));
    }
    let order = schema.read_order();
    if !order.is_empty() {
        sql.push_str(&format!(" ORDER BY {}", column_list(order.iter().map(String::as_str))));
    }
    sql
}

pub fn update_sql(table: &str, column: &str, key_match: &KeyMatch, scope: &Filter) -> String {
    let mut conditions: Vec<String> = key_match
        .conditions
        .iter()
        .enumerate()
        .map(|(i, (c, _))| format!("{} = ${}", quote_ident(c), i + 2))
        .collect();
    if let Filter::Eq(c, _) = scope {
        conditions.push(format!("{} = ${}", quote_ident(c), key_match.conditions.len() + 2));
    }
    let mut sql = format!("UPDATE {} SET {} = $1", quote_ident(table), quote_ident(column));
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }
    sql
}

// =============================================================================
// Binding and decoding
// =============================================================================

fn bind_value<'q>(query: PgQuery<'q>, ty: ColumnType, value: &Value) -> PgQuery<'q> {
    match ty {
        ColumnType::Text => query.bind(match value {
            Value::Null => None,
            Value::Text(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }),
        ColumnType::Integer | ColumnType::SurrogateKey | ColumnType::KeyRef => query.bind(
            value
                .as_i64()
                .or_else(|| value.as_text().and_then(|s| s.parse::<i64>().ok())),
        ),
        ColumnType::Float => query.bind(value.as_f64()),
        ColumnType::Boolean => query.bind(match value {
            Value::Bool(b) => Some(*b),
            _ => None,
        }),
        ColumnType::Date => query.bind(value.as_date()),
    }
}

fn decode_row(schema: &TableSchema, pg: &PgRow) -> Result<Row, sqlx::Error> {
    let mut row = Row::new();
    for column in &schema.columns {
        let name = column.name.as_str();
        let value = match column.ty {
            ColumnType::Text => Value::from(pg.try_get::<Option<String>, _>(name)?),
            ColumnType::Integer | ColumnType::SurrogateKey | ColumnType::KeyRef => {
                Value::from(pg.try_get::<Option<i64>, _>(name)?)
            }
            ColumnType::Float => Value::from(pg.try_get::<Option<f64>, _>(name)?),
            ColumnType::Boolean => Value::from(pg.try_get::<Option<bool>, _>(name)?),
            ColumnType::Date => Value::from(pg.try_get::<Option<NaiveDate>, _>(name)?),
        };
        row.set(name, value);
    }
    Ok(row)
}

fn column_type(schema: &TableSchema, column: &str) -> Result<ColumnType, WarehouseError> {
    schema
        .find(column)
        .map(|c| c.ty)
        .ok_or_else(|| WarehouseError::schema(&schema.name, format!("column \"{}\" does not exist", column)))
}

pub fn map_sqlx_error(table: &str, err: sqlx::Error) -> WarehouseError {
    match &err {
        sqlx::Error::Database(db) => {
            if db.is_unique_violation() || db.is_foreign_key_violation() || db.is_check_violation() {
                return WarehouseError::constraint(table, db.message());
            }
            match db.code().as_deref() {
                // undefined_table, undefined_column
                Some("42P01") | Some("42703") => WarehouseError::schema(table, db.message()),
                _ => WarehouseError::query(table, db.message()),
            }
        }
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed => WarehouseError::Connectivity(err.to_string()),
        _ => WarehouseError::query(table, err.to_string()),
    }
}

/// Rows per statement so that `columns` binds per row plus `extra` trailing
/// binds stay under the parameter cap.
fn rows_per_chunk(columns: usize, extra: usize) -> usize {
    ((MAX_BIND_PARAMS - extra) / columns.max(1)).max(1)
}

/// Insertable columns plus the rows chunked under the bind parameter cap.
fn chunked<'a>(
    schema: &'a TableSchema,
    rows: &'a [Row],
    extra: usize,
) -> (Vec<&'a Column>, std::slice::Chunks<'a, Row>) {
    let columns: Vec<&Column> = schema.insertable().collect();
    let per_chunk = rows_per_chunk(columns.len(), extra);
    (columns, rows.chunks(per_chunk))
}

#[async_trait]
impl Warehouse for PostgresWarehouse {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            key_strategy: KeyStrategy::Serial,
        }
    }

    async fn create_table(&self, schema: &TableSchema, mode: CreateMode) -> Result<(), WarehouseError> {
        let table = schema.name.as_str();
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(table, e))?;
        if mode == CreateMode::Replace {
            sqlx::query(&drop_table_sql(table))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(table, e))?;
        }
        sqlx::query(&create_table_sql(schema))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(table, e))?;
        tx.commit().await.map_err(|e| map_sqlx_error(table, e))?;
        Ok(())
    }

    async fn add_columns(&self, schema: &TableSchema, columns: &[Column]) -> Result<(), WarehouseError> {
        let table = schema.name.as_str();
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(table, e))?;
        for column in columns {
            sqlx::query(&add_column_sql(table, column))
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error(table, e))?;
        }
        tx.commit().await.map_err(|e| map_sqlx_error(table, e))?;
        Ok(())
    }

    async fn insert_batch(
        &self,
        schema: &TableSchema,
        rows: &[Row],
        conflict: Conflict,
    ) -> Result<LoadCounts, WarehouseError> {
        let table = schema.name.as_str();
        let mut counts = LoadCounts::default();
        if rows.is_empty() {
            return Ok(counts);
        }
        let (columns, chunks) = chunked(schema, rows, 0);
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(table, e))?;
        for chunk in chunks {
            let sql = insert_sql(table, &names, chunk.len(), conflict);
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for column in &columns {
                    query = bind_value(query, column.ty, row.get(&column.name));
                }
            }
            let result = query.execute(&mut *tx).await.map_err(|e| map_sqlx_error(table, e))?;
            counts.inserted += result.rows_affected();
            counts.skipped += chunk.len() as u64 - result.rows_affected();
        }
        tx.commit().await.map_err(|e| map_sqlx_error(table, e))?;
        Ok(counts)
    }

    async fn upsert_batch(
        &self,
        schema: &TableSchema,
        rows: &[Row],
        options: &UpsertOptions,
    ) -> Result<LoadCounts, WarehouseError> {
        let table = schema.name.as_str();
        let mut counts = LoadCounts::default();
        if rows.is_empty() {
            return Ok(counts);
        }
        let stamp = match &options.stamp {
            Some((column, value)) => Some((column_type(schema, column)?, value)),
            None => None,
        };
        let (columns, chunks) = chunked(schema, rows, usize::from(stamp.is_some()));
        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();

        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(table, e))?;
        for chunk in chunks {
            let sql = upsert_sql(table, &names, chunk.len(), options);
            let mut query = sqlx::query(&sql);
            for row in chunk {
                for column in &columns {
                    query = bind_value(query, column.ty, row.get(&column.name));
                }
            }
            if let Some((ty, value)) = stamp {
                query = bind_value(query, ty, value);
            }
            let returned = query.fetch_all(&mut *tx).await.map_err(|e| map_sqlx_error(table, e))?;
            for pg in &returned {
                let inserted: bool = pg.try_get("inserted").map_err(|e| map_sqlx_error(table, e))?;
                if inserted {
                    counts.inserted += 1;
                } else {
                    counts.updated += 1;
                }
            }
        }
        tx.commit().await.map_err(|e| map_sqlx_error(table, e))?;
        Ok(counts)
    }

    async fn select(&self, schema: &TableSchema, filter: &Filter) -> Result<Vec<Row>, WarehouseError> {
        let table = schema.name.as_str();
        let sql = select_sql(schema, filter);
        let mut query = sqlx::query(&sql);
        if let Filter::Eq(column, value) = filter {
            query = bind_value(query, column_type(schema, column)?, value);
        }
        let fetched = query.fetch_all(&self.pool).await.map_err(|e| map_sqlx_error(table, e))?;
        fetched
            .iter()
            .map(|pg| decode_row(schema, pg).map_err(|e| map_sqlx_error(table, e)))
            .collect()
    }

    async fn assign(&self, schema: &TableSchema, assignment: &Assignment) -> Result<u64, WarehouseError> {
        let table = schema.name.as_str();
        let target = column_type(schema, &assignment.column)?;
        let scope = match &assignment.scope {
            Filter::Eq(column, value) => Some((column_type(schema, column)?, value)),
            Filter::All => None,
        };

        let mut written = 0;
        let mut tx = self.pool.begin().await.map_err(|e| map_sqlx_error(table, e))?;
        for key_match in &assignment.matches {
            let sql = update_sql(table, &assignment.column, key_match, &assignment.scope);
            let mut query = bind_value(sqlx::query(&sql), target, &key_match.value);
            for (column, value) in &key_match.conditions {
                query = bind_value(query, column_type(schema, column)?, value);
            }
            if let Some((ty, value)) = scope {
                query = bind_value(query, ty, value);
            }
            let result = query.execute(&mut *tx).await.map_err(|e| map_sqlx_error(table, e))?;
            written += result.rows_affected();
        }
        tx.commit().await.map_err(|e| map_sqlx_error(table, e))?;
        Ok(written)
    }
}
