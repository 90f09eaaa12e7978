//! Source readers. Each turns landed bytes or a local file into
//! `SourceRecord`s for the normalizer.

use crate::error::SourceError;
use crate::normalizer::SourceRecord;
use calamine::{open_workbook_auto, Data, Reader};
use serde_json::{Map, Number, Value as Json};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Json,
    Ndjson,
    Csv,
    Spreadsheet,
}

impl Format {
    /// Guess from a file name or blob key.
    pub fn detect(name: &str) -> Option<Self> {
        let extension = Path::new(name)
            .extension()?
            .to_string_lossy()
            .to_ascii_lowercase();
        match extension.as_str() {
            "json" => Some(Format::Json),
            "ndjson" | "jsonl" => Some(Format::Ndjson),
            "csv" => Some(Format::Csv),
            "xlsx" | "xlsm" | "xlsb" | "xls" | "ods" => Some(Format::Spreadsheet),
            _ => None,
        }
    }
}

fn into_record(value: Json, position: usize) -> Result<SourceRecord, SourceError> {
    match value {
        Json::Object(map) => Ok(map),
        _ => Err(SourceError::NotAnObject { position }),
    }
}

/// A JSON array of objects. A lone object is read as a single record.
pub fn read_json(bytes: &[u8]) -> Result<Vec<SourceRecord>, SourceError> {
    match serde_json::from_slice::<Json>(bytes)? {
        Json::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(position, item)| into_record(item, position))
            .collect(),
        other => Ok(vec![into_record(other, 0)?]),
    }
}

/// One JSON object per line; blank lines are ignored.
pub fn read_ndjson(bytes: &[u8]) -> Result<Vec<SourceRecord>, SourceError> {
    let text = decode_text(bytes);
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(position, line)| into_record(serde_json::from_str(line)?, position))
        .collect()
}

/// UTF-8 (BOM stripped) with a Windows-1252 fallback for exports that are
/// not valid UTF-8.
pub fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.strip_prefix('\u{feff}').unwrap_or(text).to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Header row names the fields; every cell is kept as text.
pub fn read_csv(bytes: &[u8]) -> Result<Vec<SourceRecord>, SourceError> {
    let text = decode_text(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut records = Vec::new();
    for result in reader.records() {
        let row = result?;
        let record: SourceRecord = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.is_empty())
            .map(|(i, h)| {
                let cell = row.get(i).map(|c| Json::String(c.to_string())).unwrap_or(Json::Null);
                (h.clone(), cell)
            })
            .collect();
        records.push(record);
    }
    Ok(records)
}

fn cell_to_json(cell: &Data) -> Json {
    match cell {
        Data::Empty | Data::Error(_) => Json::Null,
        Data::String(s) => Json::String(s.clone()),
        Data::Int(i) => Json::Number((*i).into()),
        Data::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
        Data::Bool(b) => Json::Bool(*b),
        Data::DateTime(dt) => dt
            .as_datetime()
            .map(|d| Json::String(d.format("%Y-%m-%d %H:%M:%S").to_string()))
            .unwrap_or(Json::Null),
        Data::DateTimeIso(s) | Data::DurationIso(s) => Json::String(s.clone()),
    }
}

/// First sheet of a workbook (xlsx, xls, xlsb, ods), first row as header.
pub fn read_spreadsheet(path: &Path) -> Result<Vec<SourceRecord>, SourceError> {
    let mut workbook = open_workbook_auto(path)?;
    let sheet_names = workbook.sheet_names().to_vec();
    let Some(first) = sheet_names.first() else {
        return Err(SourceError::Spreadsheet("workbook has no sheets".to_string()));
    };
    let range = workbook.worksheet_range(first)?;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok(Vec::new());
    };
    let headers: Vec<String> = header
        .iter()
        .map(|cell| match cell {
            Data::String(s) => s.trim().to_string(),
            Data::Empty => String::new(),
            other => other.to_string(),
        })
        .collect();

    Ok(rows
        .map(|cells| {
            headers
                .iter()
                .zip(cells)
                .filter(|(h, _)| !h.is_empty())
                .map(|(h, cell)| (h.clone(), cell_to_json(cell)))
                .collect()
        })
        .collect())
}

pub fn read_bytes(format: Format, bytes: &[u8]) -> Result<Vec<SourceRecord>, SourceError> {
    match format {
        Format::Json => read_json(bytes),
        Format::Ndjson => read_ndjson(bytes),
        Format::Csv => read_csv(bytes),
        Format::Spreadsheet => Err(SourceError::Spreadsheet(
            "spreadsheets are read from a path".to_string(),
        )),
    }
}

pub fn read_path(path: &Path) -> Result<Vec<SourceRecord>, SourceError> {
    let name = path.to_string_lossy();
    let format = Format::detect(&name).ok_or_else(|| {
        SourceError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("unrecognised source format: {}", name),
        ))
    })?;
    match format {
        Format::Spreadsheet => read_spreadsheet(path),
        other => read_bytes(other, &std::fs::read(path)?),
    }
}

/// Inner lookup-join of two record sets on `left_field = right_field`.
/// Right-hand fields whose names are already on the left are skipped, and
/// left records without a match are dropped.
pub fn join_records(
    left: &[SourceRecord],
    right: &[SourceRecord],
    left_field: &str,
    right_field: &str,
) -> Vec<SourceRecord> {
    let mut index: HashMap<String, &SourceRecord> = HashMap::new();
    for record in right {
        if let Some(key) = record.get(right_field).and_then(json_key) {
            index.entry(key).or_insert(record);
        }
    }

    left.iter()
        .filter_map(|record| {
            let key = record.get(left_field).and_then(json_key)?;
            let matched = index.get(&key)?;
            let mut joined: Map<String, Json> = record.clone();
            for (field, value) in matched.iter() {
                if !joined.contains_key(field) {
                    joined.insert(field.clone(), value.clone());
                }
            }
            Some(joined)
        })
        .collect()
}

/// One record per object in the array `field`, with that object's fields
/// merged in and the array itself dropped. Records without the array pass
/// through unchanged.
pub fn unnest(records: &[SourceRecord], field: &str) -> Vec<SourceRecord> {
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let Some(Json::Array(items)) = record.get(field) else {
            out.push(record.clone());
            continue;
        };
        let mut base = record.clone();
        base.remove(field);
        for item in items {
            let mut line = base.clone();
            if let Json::Object(inner) = item {
                for (key, value) in inner {
                    line.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
            out.push(line);
        }
    }
    out
}

fn json_key(value: &Json) -> Option<String> {
    match value {
        Json::Null => None,
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_read_json_array() {
        let records = read_json(br#"[{"id": 1}, {"id": 2}]"#).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].get("id"), Some(&json!(2)));
    }

    #[test]
    fn test_read_json_rejects_scalar_items() {
        assert!(matches!(
            read_json(br#"[{"id": 1}, 5]"#),
            Err(SourceError::NotAnObject { position: 1 })
        ));
    }

    #[test]
    fn test_read_ndjson_skips_blank_lines() {
        let records = read_ndjson(b"{\"a\": 1}\n\n{\"a\": 2}\n").unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_read_csv_with_bom() {
        let records = read_csv("\u{feff}product_id,actual_price\nB1,\"₹1,099\"\nB2,\n".as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("product_id"), Some(&json!("B1")));
        assert_eq!(records[0].get("actual_price"), Some(&json!("₹1,099")));
        assert_eq!(records[1].get("actual_price"), Some(&json!("")));
    }

    #[test]
    fn test_decode_windows_1252_fallback() {
        // "Café" with 0xE9 for é
        assert_eq!(decode_text(&[0x43, 0x61, 0x66, 0xE9]), "Café");
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(Format::detect("amazon.xlsx"), Some(Format::Spreadsheet));
        assert_eq!(Format::detect("carts/20240601.ndjson"), Some(Format::Ndjson));
        assert_eq!(Format::detect("movies.CSV"), Some(Format::Csv));
        assert_eq!(Format::detect("README"), None);
    }

    #[test]
    fn test_join_records_inner_and_no_overwrite() {
        let carts = read_json(br#"[{"id": 1, "userId": 7}, {"id": 2, "userId": 99}]"#).unwrap();
        let users = read_json(br#"[{"id": 7, "email": "a@b.c"}]"#).unwrap();

        let joined = join_records(&carts, &users, "userId", "id");
        assert_eq!(joined.len(), 1);
        assert_eq!(joined[0].get("id"), Some(&json!(1)));
        assert_eq!(joined[0].get("email"), Some(&json!("a@b.c")));
    }

    #[test]
    fn test_unnest_cart_lines() {
        let carts = read_json(
            br#"[{"id": 1, "userId": 7, "products": [{"productId": 3, "quantity": 2}, {"productId": 4, "quantity": 1}]}]"#,
        )
        .unwrap();
        let lines = unnest(&carts, "products");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1].get("productId"), Some(&json!(4)));
        assert_eq!(lines[1].get("userId"), Some(&json!(7)));
        assert!(!lines[0].contains_key("products"));
    }
}
