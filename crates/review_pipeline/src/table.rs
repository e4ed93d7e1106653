use std::{
    fs::{self, File},
    io::{BufRead, BufReader},
    path::Path,
};

use flate2::read::GzDecoder;
use indexmap::IndexMap;
use serde_json::{Number, Value};
use thiserror::Error;

use crate::schema::{DataType, Field, Schema, SchemaError};

/// One record: field name to JSON value, in schema order.
pub type Row = IndexMap<String, Value>;

/// Errors raised while reading or writing tables.
#[derive(Debug, Error)]
pub enum TableError {
    /// I/O error (filesystem).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed JSON record.
    #[error("json error on line {line}: {source}")]
    Json {
        /// 1-based line number.
        line: usize,
        /// Parser error.
        source: serde_json::Error,
    },
    /// A JSON line was valid but not an object.
    #[error("line {0} is not a JSON object")]
    NotAnObject(usize),
    /// CSV reader/writer failure.
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    /// Column lookup failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Immutable-by-convention table: a schema plus rows conforming to it.
///
/// Every transform returns a new table and leaves its input untouched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    schema: Schema,
    rows: Vec<Row>,
}

impl Table {
    /// Builds a table, reordering each row to the schema.
    ///
    /// Missing fields become `null`; fields absent from the schema are dropped.
    #[must_use]
    pub fn new(schema: Schema, rows: Vec<Row>) -> Self {
        let rows = rows
            .into_iter()
            .map(|row| conform_row(&schema, row))
            .collect();
        Self { schema, rows }
    }

    /// Builds a table with a schema inferred from the rows.
    #[must_use]
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let schema = Schema::infer(&rows);
        Self::new(schema, rows)
    }

    /// Parses line-delimited JSON objects, skipping blank lines.
    pub fn from_json_lines(reader: impl BufRead) -> Result<Self, TableError> {
        let mut rows = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = serde_json::from_str(&line).map_err(|source| TableError::Json {
                line: idx + 1,
                source,
            })?;
            match value {
                Value::Object(map) => rows.push(map.into_iter().collect()),
                _ => return Err(TableError::NotAnObject(idx + 1)),
            }
        }
        Ok(Self::from_rows(rows))
    }

    /// Reads a line-delimited JSON file; `.gz` files are decompressed.
    pub fn read_json_lines(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        if path.extension().and_then(|ext| ext.to_str()) == Some("gz") {
            Self::from_json_lines(BufReader::new(GzDecoder::new(file)))
        } else {
            Self::from_json_lines(BufReader::new(file))
        }
    }

    /// Table schema.
    #[must_use]
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Rows in order.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Values of one top-level column.
    pub fn column(&self, name: &str) -> Result<Vec<&Value>, SchemaError> {
        self.schema.require(name)?;
        Ok(self
            .rows
            .iter()
            .map(|row| row.get(name).unwrap_or(&Value::Null))
            .collect())
    }

    /// Copies the rows at `indices`, in that order.
    #[must_use]
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            schema: self.schema.clone(),
            rows: indices
                .iter()
                .filter_map(|&idx| self.rows.get(idx).cloned())
                .collect(),
        }
    }

    /// Removes a column, returning the remaining table and its values.
    pub fn take_column(self, name: &str) -> Result<(Self, Vec<Value>), SchemaError> {
        self.schema.require(name)?;
        let fields = self
            .schema
            .fields()
            .iter()
            .filter(|field| field.name != name)
            .cloned()
            .collect();
        let mut values = Vec::with_capacity(self.rows.len());
        let rows = self
            .rows
            .into_iter()
            .map(|mut row| {
                values.push(row.shift_remove(name).unwrap_or(Value::Null));
                row
            })
            .collect();
        Ok((
            Self {
                schema: Schema::new(fields),
                rows,
            },
            values,
        ))
    }

    /// Drops every row holding a `null` in any top-level column.
    #[must_use]
    pub fn drop_nulls(self) -> Self {
        Self {
            rows: self
                .rows
                .into_iter()
                .filter(|row| row.values().all(|value| !value.is_null()))
                .collect(),
            schema: self.schema,
        }
    }

    /// Writes the table as CSV with a header row, overwriting `path`.
    ///
    /// Nulls become empty cells; nested values are written as JSON.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), TableError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(self.schema.names())?;
        for row in &self.rows {
            writer.write_record(self.schema.names().map(|name| {
                row.get(name).map_or_else(String::new, render_cell)
            }))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Reads a CSV file with a header row.
    ///
    /// Column types are inferred per column: `Long` when every non-empty cell
    /// is an integer, `Double` when every one is numeric, else `String`.
    /// Empty cells are `null`.
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self, TableError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut cells: Vec<Vec<String>> = Vec::new();
        for record in reader.records() {
            cells.push(record?.iter().map(str::to_string).collect());
        }

        let types: Vec<DataType> = (0..headers.len())
            .map(|col| {
                infer_csv_column(cells.iter().filter_map(|record| record.get(col)))
            })
            .collect();
        let schema = Schema::new(
            headers
                .iter()
                .zip(&types)
                .map(|(name, ty)| Field::new(name, ty.clone()))
                .collect(),
        );
        let rows = cells
            .into_iter()
            .map(|record| {
                headers
                    .iter()
                    .zip(&types)
                    .enumerate()
                    .map(|(col, (name, ty))| {
                        let cell = record.get(col).map_or("", String::as_str);
                        (name.clone(), parse_cell(cell, ty))
                    })
                    .collect()
            })
            .collect();
        Ok(Self { schema, rows })
    }

    /// Assembles a table from rows the caller already built in schema order.
    pub(crate) fn from_conforming(schema: Schema, rows: Vec<Row>) -> Self {
        Self { schema, rows }
    }
}

fn conform_row(schema: &Schema, mut row: Row) -> Row {
    schema
        .fields()
        .iter()
        .map(|field| {
            let value = row.shift_remove(&field.name).unwrap_or(Value::Null);
            (field.name.clone(), field.data_type.conform(value))
        })
        .collect()
}

/// Renders a value the way it appears in a CSV cell or a concatenated key.
pub(crate) fn render_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        nested => nested.to_string(),
    }
}

fn infer_csv_column<'a>(cells: impl Iterator<Item = &'a String>) -> DataType {
    let mut ty = DataType::Null;
    for cell in cells.filter(|cell| !cell.is_empty()) {
        let observed = if cell.parse::<i64>().is_ok() {
            DataType::Long
        } else if cell.parse::<f64>().is_ok_and(f64::is_finite) {
            DataType::Double
        } else {
            DataType::String
        };
        ty = ty.merge(observed);
        if ty == DataType::String {
            break;
        }
    }
    ty
}

fn parse_cell(cell: &str, ty: &DataType) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    match ty {
        DataType::Long => cell
            .parse::<i64>()
            .map_or(Value::Null, |n| Value::Number(n.into())),
        DataType::Double => cell
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map_or(Value::Null, Value::Number),
        _ => Value::String(cell.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;
    use tempfile::tempdir;

    const RAW: &str = r#"{"overall": 5.0, "asin": "B1", "style": {"Gift Amount:": " 25"}, "reviewText": "Great"}

{"overall": 3.0, "asin": "B2", "reviewText": "Meh", "vote": "4"}
"#;

    #[test]
    fn reads_json_lines_and_fills_missing_fields() {
        let table = Table::from_json_lines(Cursor::new(RAW)).unwrap();
        assert_eq!(table.len(), 2);
        let names: Vec<_> = table.schema().names().collect();
        assert_eq!(names, vec!["overall", "asin", "style", "reviewText", "vote"]);
        assert_eq!(table.rows()[1]["style"], Value::Null);
        assert_eq!(table.rows()[0]["vote"], Value::Null);
    }

    #[test]
    fn rejects_non_object_lines() {
        let err = Table::from_json_lines(Cursor::new("{\"a\":1}\n[1,2]\n")).unwrap_err();
        assert!(matches!(err, TableError::NotAnObject(2)));
    }

    #[test]
    fn reads_gzip_input() {
        use flate2::{write::GzEncoder, Compression};
        use std::io::Write;

        let dir = tempdir().unwrap();
        let path = dir.path().join("reviews.json.gz");
        let mut encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        encoder.write_all(RAW.as_bytes()).unwrap();
        encoder.finish().unwrap();

        let table = Table::read_json_lines(&path).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn take_column_and_drop_nulls() {
        let table = Table::from_json_lines(Cursor::new(RAW)).unwrap();
        let (inputs, targets) = table.take_column("overall").unwrap();
        assert_eq!(targets, vec![json!(5.0), json!(3.0)]);
        assert!(inputs.schema().field("overall").is_none());
        assert_eq!(inputs.clone().drop_nulls().len(), 0);
        assert_eq!(inputs.select_rows(&[1]).rows()[0]["asin"], json!("B2"));
    }

    #[test]
    fn csv_round_trip_infers_column_types() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out/flat.csv");
        let rows: Vec<Row> = vec![
            [
                ("identifier".to_string(), json!("B1_A1_1")),
                ("Gift_Amount".to_string(), json!(25)),
                ("reviewText".to_string(), json!("5")),
            ]
            .into_iter()
            .collect(),
            [
                ("identifier".to_string(), json!("B2_A2_2")),
                ("Gift_Amount".to_string(), Value::Null),
                ("reviewText".to_string(), json!("fine, thanks")),
            ]
            .into_iter()
            .collect(),
        ];
        Table::from_rows(rows).write_csv(&path).unwrap();

        let table = Table::read_csv(&path).unwrap();
        assert_eq!(
            table.schema().simple_string(),
            "struct<identifier:string,Gift_Amount:bigint,reviewText:string>"
        );
        assert_eq!(table.rows()[0]["Gift_Amount"], json!(25));
        assert_eq!(table.rows()[0]["reviewText"], json!("5"));
        assert_eq!(table.rows()[1]["Gift_Amount"], Value::Null);
        assert_eq!(table.rows()[1]["reviewText"], json!("fine, thanks"));
    }
}
