//! Explicit table schemas. Every row written to staging, a dimension or a fact
//! is checked against one of these before it reaches the warehouse.

use crate::error::{PlanError, TransformError};
use crate::value::{Row, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Integer,
    Float,
    Boolean,
    Date,
    /// Generated key owned by the table (serial or UUID, per warehouse).
    SurrogateKey,
    /// Nullable reference to another table's surrogate key.
    KeyRef,
}

impl ColumnType {
    pub fn label(self) -> &'static str {
        match self {
            ColumnType::Text => "text",
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::SurrogateKey => "surrogate key",
            ColumnType::KeyRef => "key reference",
        }
    }

    /// Whether `value` may be stored in a column of this type.
    /// Key columns accept both key shapes (serial integers and UUID text).
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (ColumnType::Text, Value::Text(_)) => true,
            (ColumnType::Integer, Value::Int(_)) => true,
            (ColumnType::Float, Value::Float(_) | Value::Int(_)) => true,
            (ColumnType::Boolean, Value::Bool(_)) => true,
            (ColumnType::Date, Value::Date(_)) => true,
            (ColumnType::SurrogateKey | ColumnType::KeyRef, Value::Int(_) | Value::Text(_)) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: true,
        }
    }

    pub fn required(name: &str, ty: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            nullable: false,
        }
    }

    pub fn text(name: &str) -> Self {
        Self::new(name, ColumnType::Text)
    }

    pub fn integer(name: &str) -> Self {
        Self::new(name, ColumnType::Integer)
    }

    pub fn float(name: &str) -> Self {
        Self::new(name, ColumnType::Float)
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, ColumnType::Date)
    }

    pub fn key_ref(name: &str) -> Self {
        Self::new(name, ColumnType::KeyRef)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub surrogate_key: Option<String>,
    /// Uniqueness constraint; business key for dimensions, merge key for facts,
    /// the key pair for bridges.
    pub unique_key: Vec<String>,
    /// Read order for `select`; falls back to the surrogate key.
    pub order_by: Vec<String>,
}

impl TableSchema {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            columns: Vec::new(),
            surrogate_key: None,
            unique_key: Vec::new(),
            order_by: Vec::new(),
        }
    }

    pub fn ordered_by(mut self, columns: &[&str]) -> Self {
        self.order_by = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Columns `select` orders by.
    pub fn read_order(&self) -> Vec<String> {
        if !self.order_by.is_empty() {
            self.order_by.clone()
        } else {
            self.surrogate_key.iter().cloned().collect()
        }
    }

    /// Add the generated key column. It is always the first column.
    pub fn with_surrogate_key(mut self, name: &str) -> Self {
        self.columns
            .insert(0, Column::required(name, ColumnType::SurrogateKey));
        self.surrogate_key = Some(name.to_string());
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn columns(mut self, columns: impl IntoIterator<Item = Column>) -> Self {
        self.columns.extend(columns);
        self
    }

    pub fn unique(mut self, key: &[&str]) -> Self {
        self.unique_key = key.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn find(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has(&self, name: &str) -> bool {
        self.find(name).is_some()
    }

    /// Columns a caller supplies on insert (everything except the generated key).
    pub fn insertable(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|c| c.ty != ColumnType::SurrogateKey)
    }

    pub fn require(&self, context: &str, column: &str) -> Result<(), PlanError> {
        if self.has(column) {
            Ok(())
        } else {
            Err(PlanError::UnknownColumn {
                context: context.to_string(),
                table: self.name.clone(),
                column: column.to_string(),
            })
        }
    }

    /// Keep only schema columns, filling the absent ones with `Null`.
    pub fn project(&self, row: &Row) -> Row {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), row.get(&c.name).clone()))
            .collect()
    }

    /// Check a row against the schema. The generated key may be absent.
    pub fn validate(&self, row: &Row) -> Result<(), TransformError> {
        for (name, value) in row.columns() {
            let column = self.find(name).ok_or_else(|| TransformError::UnknownColumn {
                table: self.name.clone(),
                column: name.clone(),
            })?;
            if !column.ty.accepts(value) {
                return Err(TransformError::TypeMismatch {
                    column: name.clone(),
                    expected: column.ty.label(),
                    found: value.to_string(),
                });
            }
        }
        for column in self.insertable() {
            if !column.nullable && row.get(&column.name).is_null() {
                return Err(TransformError::NullNotAllowed {
                    column: column.name.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn product() -> TableSchema {
        TableSchema::new("dim_product")
            .with_surrogate_key("product_key")
            .column(Column::required("product_id", ColumnType::Text))
            .column(Column::float("rating"))
            .unique(&["product_id"])
    }

    #[test]
    fn test_surrogate_key_is_first_and_not_insertable() {
        let schema = product();
        assert_eq!(schema.columns[0].name, "product_key");
        assert!(schema.insertable().all(|c| c.name != "product_key"));
    }

    #[test]
    fn test_validate_rejects_unknown_column() {
        let row = Row::new().with("product_id", "B1").with("prodct_name", "typo");
        let err = product().validate(&row).unwrap_err();
        assert!(matches!(err, TransformError::UnknownColumn { .. }));
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let row = Row::new()
            .with("product_id", "B1")
            .with("rating", NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert!(matches!(
            product().validate(&row),
            Err(TransformError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_null_in_required_column() {
        let row = Row::new().with("rating", 4.5);
        assert_eq!(
            product().validate(&row),
            Err(TransformError::NullNotAllowed {
                column: "product_id".to_string()
            })
        );
    }

    #[test]
    fn test_float_column_accepts_int() {
        let row = Row::new().with("product_id", "B1").with("rating", 4_i64);
        assert!(product().validate(&row).is_ok());
    }

    #[test]
    fn test_project_fills_missing_with_null() {
        let projected = product().project(&Row::new().with("product_id", "B1").with("extra", 1_i64));
        assert!(projected.get("rating").is_null());
        assert!(!projected.contains("extra"));
        assert_eq!(projected.len(), 3);
    }
}
