//! Record Normalizer - turns loosely-typed source records into flat staging rows
//!
//! Order of operations per record:
//! 1. explode correlated multi-valued fields (zip within a group, multiply across groups)
//! 2. unpivot repeated columns into one value column
//! 3. flatten nested objects (`outer.inner`, or lifted without prefix)
//! 4. rename, unify nulls, coerce, fill defaults
//! 5. conform to the record schema and validate
//!
//! This module is DETERMINISTIC: same record + same config = same rows.

use crate::error::{PlanError, TransformError};
use crate::schema::{ColumnType, TableSchema};
use crate::value::{Row, Value};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime};
use serde_json::{Map, Value as Json};

/// One extracted record as returned by a source collaborator.
pub type SourceRecord = Map<String, Json>;

const CURRENCY_GLYPHS: &[char] = &['₹', '$', '€', '£', '¥', '₽', '₩', '₦', '฿', '₺', '₫', '₴'];
const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"];
const DATETIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"];

/// Fields that hold positionally-correlated multi-values: the i-th `user_id`
/// belongs with the i-th `review_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplodeGroup {
    pub fields: Vec<String>,
    pub delimiter: char,
    pub trim: bool,
}

impl ExplodeGroup {
    pub fn new(fields: &[&str]) -> Self {
        Self {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            delimiter: ',',
            trim: true,
        }
    }

    pub fn delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = delimiter;
        self
    }
}

/// Melt repeated columns (`star1..star4`) into a single `value_column`.
#[derive(Debug, Clone, PartialEq)]
pub struct Unpivot {
    pub columns: Vec<String>,
    pub value_column: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FlattenRule {
    pub field: String,
    /// Keep `<field>.` in front of the lifted names.
    pub prefix: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Coercion {
    /// Locale-formatted money: currency glyphs and thousands separators stripped.
    Amount,
    Integer,
    Float,
    Date,
    Text,
    Capitalize,
    TitleCase,
    Mask(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizerConfig {
    pub explode: Vec<ExplodeGroup>,
    pub unpivot: Option<Unpivot>,
    pub flatten: Vec<FlattenRule>,
    pub renames: Vec<(String, String)>,
    pub coercions: Vec<(String, Coercion)>,
    pub defaults: Vec<(String, Value)>,
}

impl NormalizerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn explode(mut self, group: ExplodeGroup) -> Self {
        self.explode.push(group);
        self
    }

    pub fn unpivot(mut self, columns: &[&str], value_column: &str) -> Self {
        self.unpivot = Some(Unpivot {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            value_column: value_column.to_string(),
        });
        self
    }

    /// Lift the inner keys of `field` without its name in front.
    pub fn lift(mut self, field: &str) -> Self {
        self.flatten.push(FlattenRule {
            field: field.to_string(),
            prefix: false,
        });
        self
    }

    pub fn rename(mut self, from: &str, to: &str) -> Self {
        self.renames.push((from.to_string(), to.to_string()));
        self
    }

    pub fn coerce(mut self, column: &str, coercion: Coercion) -> Self {
        self.coercions.push((column.to_string(), coercion));
        self
    }

    pub fn default_value(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.defaults.push((column.to_string(), value.into()));
        self
    }
}

/// A staged candidate with its positional origin.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub source_position: usize,
    pub explode_index: usize,
    pub row: Row,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub source_position: usize,
    pub error: TransformError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedBatch {
    pub rows: Vec<NormalizedRow>,
    pub rejected: Vec<RejectedRecord>,
    /// Records left out by the load window.
    pub filtered: usize,
}

#[derive(Debug, Clone)]
pub struct Normalizer {
    config: NormalizerConfig,
    schema: TableSchema,
}

impl Normalizer {
    /// `schema` describes the normalised record columns; renames, coercions
    /// and defaults must all target columns it defines.
    pub fn new(config: NormalizerConfig, schema: TableSchema) -> Result<Self, PlanError> {
        for (_, to) in &config.renames {
            schema.require("rename", to)?;
        }
        for (column, _) in &config.coercions {
            schema.require("coercion", column)?;
        }
        for (column, _) in &config.defaults {
            schema.require("default", column)?;
        }
        if let Some(unpivot) = &config.unpivot {
            let target = renamed(&config.renames, &unpivot.value_column);
            schema.require("unpivot", target)?;
        }
        Ok(Self { config, schema })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn normalize(&self, record: &SourceRecord) -> Result<Vec<Row>, TransformError> {
        let mut fanned = vec![record.clone()];
        for group in &self.config.explode {
            let mut next = Vec::with_capacity(fanned.len());
            for candidate in &fanned {
                next.extend(explode_group(candidate, group)?);
            }
            fanned = next;
        }

        if let Some(unpivot) = &self.config.unpivot {
            fanned = fanned
                .iter()
                .flat_map(|candidate| apply_unpivot(candidate, unpivot))
                .collect();
        }

        fanned
            .into_iter()
            .map(|candidate| self.to_row(flatten(candidate, &self.config.flatten)))
            .collect()
    }

    /// Normalise every record; a failing record is set aside with its
    /// position and never aborts the batch.
    pub fn normalize_batch(&self, records: &[SourceRecord]) -> NormalizedBatch {
        self.normalize_batch_where(records, |_| Ok(true))
    }

    /// Like `normalize_batch`, keeping only records `admit` accepts.
    /// Positions still index the full extract.
    pub fn normalize_batch_where<F>(&self, records: &[SourceRecord], admit: F) -> NormalizedBatch
    where
        F: Fn(&SourceRecord) -> Result<bool, TransformError>,
    {
        let mut batch = NormalizedBatch::default();
        for (source_position, record) in records.iter().enumerate() {
            match admit(record) {
                Ok(true) => {}
                Ok(false) => {
                    batch.filtered += 1;
                    continue;
                }
                Err(error) => {
                    batch.rejected.push(RejectedRecord {
                        source_position,
                        error,
                    });
                    continue;
                }
            }
            match self.normalize(record) {
                Ok(rows) => {
                    batch.rows.extend(rows.into_iter().enumerate().map(|(explode_index, row)| {
                        NormalizedRow {
                            source_position,
                            explode_index,
                            row,
                        }
                    }));
                }
                Err(error) => batch.rejected.push(RejectedRecord {
                    source_position,
                    error,
                }),
            }
        }
        batch
    }

    fn to_row(&self, flat: Map<String, Json>) -> Result<Row, TransformError> {
        let mut row: Row = flat
            .iter()
            .map(|(k, v)| {
                (
                    renamed(&self.config.renames, k).to_string(),
                    unify_null(Value::from_json(v)),
                )
            })
            .collect();

        for (column, coercion) in &self.config.coercions {
            let value = row.get(column).clone();
            row.set(column.clone(), unify_null(coercion.apply(column, value)?));
        }

        for (column, default) in &self.config.defaults {
            if row.get(column).is_null() {
                row.set(column.clone(), default.clone());
            }
        }

        let mut conformed = Row::new();
        for column in &self.schema.columns {
            let value = conform(&column.name, column.ty, row.get(&column.name).clone())?;
            conformed.set(column.name.clone(), value);
        }
        self.schema.validate(&conformed)?;
        Ok(conformed)
    }
}

fn renamed<'a>(renames: &'a [(String, String)], name: &'a str) -> &'a str {
    renames
        .iter()
        .find(|(from, _)| from == name)
        .map(|(_, to)| to.as_str())
        .unwrap_or(name)
}

fn explode_group(record: &SourceRecord, group: &ExplodeGroup) -> Result<Vec<SourceRecord>, TransformError> {
    // A missing or null field carries no positional information and is
    // broadcast as null to every position.
    let splits: Vec<(&String, Option<Vec<Json>>)> = group
        .fields
        .iter()
        .map(|field| {
            let parts = match record.get(field) {
                None | Some(Json::Null) => None,
                Some(Json::String(s)) => Some(
                    s.split(group.delimiter)
                        .map(|p| {
                            let part = if group.trim { p.trim() } else { p };
                            Json::String(part.to_string())
                        })
                        .collect(),
                ),
                Some(Json::Array(items)) => Some(
                    items
                        .iter()
                        .map(|item| match item {
                            Json::String(s) if group.trim => Json::String(s.trim().to_string()),
                            other => other.clone(),
                        })
                        .collect(),
                ),
                Some(other) => Some(vec![other.clone()]),
            };
            (field, parts)
        })
        .collect();

    let lengths: Vec<(String, usize)> = splits
        .iter()
        .filter_map(|(field, parts)| parts.as_ref().map(|p| ((*field).clone(), p.len())))
        .collect();

    let Some(&(_, width)) = lengths.first() else {
        return Ok(vec![record.clone()]);
    };
    if lengths.iter().any(|(_, len)| *len != width) {
        return Err(TransformError::ExplodeLengthMismatch { lengths });
    }

    let width = width.max(1);
    Ok((0..width)
        .map(|i| {
            let mut out = record.clone();
            for (field, parts) in &splits {
                let value = parts
                    .as_ref()
                    .and_then(|p| p.get(i).cloned())
                    .unwrap_or(Json::Null);
                out.insert((*field).clone(), value);
            }
            out
        })
        .collect())
}

fn apply_unpivot(record: &SourceRecord, unpivot: &Unpivot) -> Vec<SourceRecord> {
    let mut base = record.clone();
    for column in &unpivot.columns {
        base.remove(column);
    }
    unpivot
        .columns
        .iter()
        .map(|column| {
            let mut out = base.clone();
            let value = record.get(column).cloned().unwrap_or(Json::Null);
            out.insert(unpivot.value_column.clone(), value);
            out
        })
        .collect()
}

/// Merge every object-valued field into the parent. Top-level scalars win
/// over lifted names that collide with them.
fn flatten(record: SourceRecord, rules: &[FlattenRule]) -> Map<String, Json> {
    let (nested, scalars): (Vec<_>, Vec<_>) = record
        .into_iter()
        .partition(|(_, v)| matches!(v, Json::Object(_)));

    let mut out: Map<String, Json> = scalars.into_iter().collect();
    for (field, value) in nested {
        if let Json::Object(inner) = value {
            let prefix = rules
                .iter()
                .find(|r| r.field == field)
                .map(|r| r.prefix)
                .unwrap_or(true);
            flatten_into(&mut out, prefix.then_some(field.as_str()), inner);
        }
    }
    out
}

fn flatten_into(out: &mut Map<String, Json>, prefix: Option<&str>, inner: Map<String, Json>) {
    for (key, value) in inner {
        let name = match prefix {
            Some(p) => format!("{}.{}", p, key),
            None => key,
        };
        match value {
            Json::Object(nested) => flatten_into(out, Some(&name), nested),
            other => {
                out.entry(name).or_insert(other);
            }
        }
    }
}

/// Collapse every "missing" representation into `Value::Null`.
pub fn unify_null(value: Value) -> Value {
    match value {
        Value::Text(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty()
                || trimmed.eq_ignore_ascii_case("nan")
                || trimmed.eq_ignore_ascii_case("null")
            {
                Value::Null
            } else {
                Value::Text(s)
            }
        }
        Value::Float(f) if f.is_nan() => Value::Null,
        other => other,
    }
}

/// Parse a locale-formatted number: `"₹1,234.50"` -> 1234.5, `"2,500"` -> 2500.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let stripped: String = raw
        .chars()
        .filter(|c| !CURRENCY_GLYPHS.contains(c) && *c != ',' && !c.is_whitespace())
        .collect();
    // Currency codes written as letters ("PLN 12", "Rs.500", "12 zł").
    let unprefixed = stripped.trim_start_matches(char::is_alphabetic);
    let unprefixed = match unprefixed.strip_prefix('.') {
        Some(rest) if unprefixed.len() < stripped.len() => rest,
        _ => unprefixed,
    };
    let cleaned = unprefixed.trim_end_matches(char::is_alphabetic);
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok().filter(|f| f.is_finite())
}

pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
        .or_else(|| {
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|dt| dt.date())
        })
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

fn title_case(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_word = false;
    for c in s.chars() {
        if c.is_alphabetic() {
            if in_word {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            in_word = true;
        } else {
            out.push(c);
            in_word = false;
        }
    }
    out
}

fn unparseable(field: &str, value: &Value, expected: &'static str) -> TransformError {
    TransformError::Unparseable {
        field: field.to_string(),
        raw: value.to_string(),
        expected,
    }
}

impl Coercion {
    pub fn apply(&self, field: &str, value: Value) -> Result<Value, TransformError> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self {
            Coercion::Amount | Coercion::Float => match &value {
                Value::Float(_) | Value::Int(_) => Ok(Value::from(value.as_f64())),
                Value::Text(s) => parse_amount(s)
                    .map(Value::Float)
                    .ok_or_else(|| unparseable(field, &value, "number")),
                _ => Err(unparseable(field, &value, "number")),
            },
            Coercion::Integer => {
                let number = match &value {
                    Value::Text(s) => parse_amount(s),
                    other => other.as_f64(),
                };
                number
                    .filter(|f| f.fract() == 0.0 && (i64::MIN as f64..i64::MAX as f64).contains(f))
                    .map(|f| Value::Int(f as i64))
                    .ok_or_else(|| unparseable(field, &value, "integer"))
            }
            Coercion::Date => match &value {
                Value::Date(_) => Ok(value),
                Value::Text(s) => parse_date(s)
                    .map(Value::Date)
                    .ok_or_else(|| unparseable(field, &value, "date")),
                _ => Err(unparseable(field, &value, "date")),
            },
            Coercion::Text => Ok(Value::Text(value.to_string())),
            Coercion::Capitalize => Ok(Value::Text(capitalize(&value.to_string()))),
            Coercion::TitleCase => Ok(Value::Text(title_case(&value.to_string()))),
            Coercion::Mask(mask) => Ok(Value::Text(mask.clone())),
        }
    }
}

/// Bring a value to the declared column type.
fn conform(column: &str, ty: ColumnType, value: Value) -> Result<Value, TransformError> {
    match ty {
        ColumnType::Text => Coercion::Text.apply(column, value),
        ColumnType::Integer => Coercion::Integer.apply(column, value),
        ColumnType::Float => Coercion::Float.apply(column, value),
        ColumnType::Date => Coercion::Date.apply(column, value),
        ColumnType::Boolean | ColumnType::SurrogateKey | ColumnType::KeyRef => Ok(value),
    }
}

/// Source-side load window: keep records whose `column` date equals
/// `run_date - offset_days`. This is an equality filter, not a high-water
/// mark; a day that no run covers is not picked up later.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceWindow {
    pub column: String,
    pub offset_days: i64,
}

impl SourceWindow {
    pub fn new(column: &str, offset_days: i64) -> Self {
        Self {
            column: column.to_string(),
            offset_days,
        }
    }

    pub fn target(&self, run_date: NaiveDate) -> NaiveDate {
        run_date - Duration::days(self.offset_days)
    }

    pub fn admits(&self, record: &SourceRecord, run_date: NaiveDate) -> Result<bool, TransformError> {
        let raw = record.get(&self.column).map(Value::from_json).unwrap_or(Value::Null);
        match Coercion::Date.apply(&self.column, unify_null(raw))? {
            Value::Date(d) => Ok(d == self.target(run_date)),
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Column;
    use rstest::rstest;
    use serde_json::json;

    fn record(value: Json) -> SourceRecord {
        match value {
            Json::Object(map) => map,
            _ => panic!("test record must be an object"),
        }
    }

    fn review_normalizer() -> Normalizer {
        let schema = TableSchema::new("reviews").columns([
            Column::text("product_id"),
            Column::text("user_id"),
            Column::text("review_id"),
            Column::float("actual_price"),
            Column::integer("rating_count"),
        ]);
        let config = NormalizerConfig::new()
            .explode(ExplodeGroup::new(&["user_id", "review_id"]))
            .coerce("actual_price", Coercion::Amount)
            .default_value("rating_count", 1_i64);
        Normalizer::new(config, schema).unwrap()
    }

    // -------------------------------------------------------------------------
    // EXPLODE
    // -------------------------------------------------------------------------

    #[test]
    fn test_explode_zips_correlated_fields() {
        let rows = review_normalizer()
            .normalize(&record(json!({"product_id": "B1", "user_id": "1,2", "review_id": "A,B"})))
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("user_id"), &Value::from("1"));
        assert_eq!(rows[0].get("review_id"), &Value::from("A"));
        assert_eq!(rows[1].get("user_id"), &Value::from("2"));
        assert_eq!(rows[1].get("review_id"), &Value::from("B"));
        assert!(rows.iter().all(|r| r.get("product_id") == &Value::from("B1")));
    }

    #[test]
    fn test_explode_mismatched_lengths_rejects_record() {
        let err = review_normalizer()
            .normalize(&record(json!({"user_id": "1,2,3", "review_id": "A,B"})))
            .unwrap_err();

        assert_eq!(
            err,
            TransformError::ExplodeLengthMismatch {
                lengths: vec![("user_id".to_string(), 3), ("review_id".to_string(), 2)]
            }
        );
    }

    #[test]
    fn test_explode_trims_values() {
        let rows = review_normalizer()
            .normalize(&record(json!({"user_id": "1, 2", "review_id": "A ,B"})))
            .unwrap();
        assert_eq!(rows[1].get("user_id"), &Value::from("2"));
        assert_eq!(rows[0].get("review_id"), &Value::from("A"));
    }

    #[test]
    fn test_explode_missing_field_is_broadcast_as_null() {
        let rows = review_normalizer()
            .normalize(&record(json!({"user_id": "1,2"})))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.get("review_id").is_null()));
    }

    #[test]
    fn test_explode_array_of_objects_then_lift() {
        let schema = TableSchema::new("sales").columns([
            Column::integer("id"),
            Column::integer("productId"),
            Column::integer("quantity"),
        ]);
        let config = NormalizerConfig::new()
            .explode(ExplodeGroup::new(&["products"]))
            .lift("products");
        let n = Normalizer::new(config, schema).unwrap();

        let rows = n
            .normalize(&record(json!({
                "id": 7,
                "products": [{"productId": 1, "quantity": 4}, {"productId": 2, "quantity": 1}]
            })))
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("productId"), &Value::Int(1));
        assert_eq!(rows[0].get("quantity"), &Value::Int(4));
        assert_eq!(rows[1].get("productId"), &Value::Int(2));
        assert_eq!(rows[1].get("id"), &Value::Int(7));
    }

    #[test]
    fn test_separate_groups_multiply_with_unpivot() {
        let schema = TableSchema::new("movies").columns([
            Column::text("title"),
            Column::text("genre"),
            Column::text("actor_name"),
        ]);
        let config = NormalizerConfig::new()
            .explode(ExplodeGroup::new(&["genre"]))
            .unpivot(&["star1", "star2"], "actor_name");
        let n = Normalizer::new(config, schema).unwrap();

        let rows = n
            .normalize(&record(json!({
                "title": "Heat", "genre": "Crime, Drama", "star1": "Al Pacino", "star2": "Robert De Niro"
            })))
            .unwrap();

        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| !r.contains("star1")));
        assert_eq!(rows[0].get("genre"), &Value::from("Crime"));
        assert_eq!(rows[0].get("actor_name"), &Value::from("Al Pacino"));
        assert_eq!(rows[3].get("genre"), &Value::from("Drama"));
        assert_eq!(rows[3].get("actor_name"), &Value::from("Robert De Niro"));
    }

    // -------------------------------------------------------------------------
    // FLATTEN
    // -------------------------------------------------------------------------

    #[test]
    fn test_flatten_dotted_and_lifted_names() {
        let schema = TableSchema::new("users").columns([
            Column::text("city"),
            Column::float("geolocation_lat"),
            Column::text("firstname"),
        ]);
        let config = NormalizerConfig::new()
            .lift("address")
            .lift("name")
            .rename("geolocation.lat", "geolocation_lat");
        let n = Normalizer::new(config, schema).unwrap();

        let rows = n
            .normalize(&record(json!({
                "address": {"city": "kilcoole", "geolocation": {"lat": "-37.3159", "long": "81.1496"}},
                "name": {"firstname": "john", "lastname": "doe"}
            })))
            .unwrap();

        assert_eq!(rows[0].get("city"), &Value::from("kilcoole"));
        assert_eq!(rows[0].get("geolocation_lat"), &Value::Float(-37.3159));
        assert_eq!(rows[0].get("firstname"), &Value::from("john"));
    }

    #[test]
    fn test_flatten_default_keeps_outer_prefix() {
        let flat = flatten(record(json!({"rating": {"rate": 3.9, "count": 120}, "id": 1})), &[]);
        assert_eq!(flat.get("rating.rate"), Some(&json!(3.9)));
        assert_eq!(flat.get("rating.count"), Some(&json!(120)));
        assert!(!flat.contains_key("rating"));
    }

    // -------------------------------------------------------------------------
    // COERCION AND NULLS
    // -------------------------------------------------------------------------

    #[rstest]
    #[case("₹1,234.50", Some(1234.5))]
    #[case("2,500", Some(2500.0))]
    #[case("$ 99", Some(99.0))]
    #[case("PLN 12.30", Some(12.3))]
    #[case("Rs.500", Some(500.0))]
    #[case("Rs. 1,200", Some(1200.0))]
    #[case("USD 1,234.50", Some(1234.5))]
    #[case("500 PLN", Some(500.0))]
    #[case(".75", Some(0.75))]
    #[case("12abc34", None)]
    #[case("", None)]
    fn test_parse_amount(#[case] raw: &str, #[case] expected: Option<f64>) {
        assert_eq!(parse_amount(raw), expected);
    }

    #[rstest]
    #[case("2024-03-05")]
    #[case("05/03/2024")]
    #[case("2024-03-05 10:11:12")]
    #[case("2024-03-05T10:11:12Z")]
    fn test_parse_date_formats(#[case] raw: &str) {
        assert_eq!(parse_date(raw), NaiveDate::from_ymd_opt(2024, 3, 5));
    }

    #[test]
    fn test_empty_amount_becomes_null_and_rating_count_defaults() {
        let rows = review_normalizer()
            .normalize(&record(json!({"product_id": "B1", "actual_price": "", "rating_count": "nan"})))
            .unwrap();
        assert!(rows[0].get("actual_price").is_null());
        assert_eq!(rows[0].get("rating_count"), &Value::Int(1));
    }

    #[test]
    fn test_unparseable_amount_fails_record() {
        let err = review_normalizer()
            .normalize(&record(json!({"actual_price": "free"})))
            .unwrap_err();
        assert!(matches!(err, TransformError::Unparseable { expected: "number", .. }));
    }

    #[test]
    fn test_integer_like_amount_in_integer_column() {
        let rows = review_normalizer()
            .normalize(&record(json!({"rating_count": "24,269"})))
            .unwrap();
        assert_eq!(rows[0].get("rating_count"), &Value::Int(24269));
    }

    #[test]
    fn test_integer_out_of_range_fails_record() {
        let err = Coercion::Integer.apply("no_of_votes", Value::Text("1e30".into())).unwrap_err();
        assert!(matches!(err, TransformError::Unparseable { expected: "integer", .. }));
        assert_eq!(
            Coercion::Integer.apply("no_of_votes", Value::Float(-9.0e18)).unwrap(),
            Value::Int(-9_000_000_000_000_000_000)
        );
    }

    #[test]
    fn test_capitalize_and_title_case() {
        assert_eq!(capitalize("jOHN"), "John");
        assert_eq!(title_case("new road 7682"), "New Road 7682");
        assert_eq!(title_case("o'neil street"), "O'Neil Street");
    }

    #[test]
    fn test_unify_null_variants() {
        assert!(unify_null(Value::from("  ")).is_null());
        assert!(unify_null(Value::from("NaN")).is_null());
        assert!(unify_null(Value::Float(f64::NAN)).is_null());
        assert_eq!(unify_null(Value::from("x")), Value::from("x"));
    }

    // -------------------------------------------------------------------------
    // BATCH, DETERMINISM, CONFIG VALIDATION
    // -------------------------------------------------------------------------

    #[test]
    fn test_batch_sets_bad_record_aside() {
        let records = vec![
            record(json!({"product_id": "B1", "user_id": "1,2", "review_id": "A,B"})),
            record(json!({"product_id": "B2", "actual_price": "n/a"})),
            record(json!({"product_id": "B3"})),
        ];
        let batch = review_normalizer().normalize_batch(&records);

        assert_eq!(batch.rows.len(), 3);
        assert_eq!(batch.rejected.len(), 1);
        assert_eq!(batch.rejected[0].source_position, 1);
        assert_eq!(batch.rows[1].explode_index, 1);
        assert_eq!(batch.rows[2].source_position, 2);
    }

    #[test]
    fn test_batch_where_keeps_original_positions() {
        let records = vec![
            record(json!({"product_id": "B1"})),
            record(json!({"product_id": "B2"})),
            record(json!({"product_id": "B3"})),
        ];
        let batch = review_normalizer()
            .normalize_batch_where(&records, |r| Ok(r.get("product_id") != Some(&json!("B2"))));

        assert_eq!(batch.filtered, 1);
        assert_eq!(batch.rows.len(), 2);
        assert_eq!(batch.rows[1].source_position, 2);
    }

    #[test]
    fn test_normalize_determinism() {
        let n = review_normalizer();
        let r = record(json!({"product_id": "B1", "user_id": "1,2", "review_id": "A,B", "actual_price": "₹399"}));
        let baseline = n.normalize(&r).unwrap();
        for _ in 0..10 {
            assert_eq!(n.normalize(&r).unwrap(), baseline);
        }
    }

    #[test]
    fn test_config_with_unknown_column_is_rejected() {
        let schema = TableSchema::new("t").column(Column::text("a"));
        let config = NormalizerConfig::new().coerce("b", Coercion::Amount);
        assert!(matches!(
            Normalizer::new(config, schema),
            Err(PlanError::UnknownColumn { .. })
        ));
    }

    #[test]
    fn test_source_window_yesterday() {
        let run_date = NaiveDate::from_ymd_opt(2024, 6, 2).unwrap();
        let window = SourceWindow::new("modified_date", 1);
        assert!(window.admits(&record(json!({"modified_date": "2024-06-01"})), run_date).unwrap());
        assert!(!window.admits(&record(json!({"modified_date": "2024-05-31"})), run_date).unwrap());
        assert!(!window.admits(&record(json!({})), run_date).unwrap());
        assert!(window.admits(&record(json!({"modified_date": "junk"})), run_date).is_err());
    }
}
