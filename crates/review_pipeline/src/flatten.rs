//! Cleaning and flattening of raw gift-card review records.

use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    context::ExecutionContext,
    rewrite::{rewrite_child, rewrite_child_rowwise, ChildRewrite, RewriteError},
    schema::{DataType, Field, Schema, SchemaError},
    table::{render_cell, Row, Table, TableError},
};

/// Struct column holding the purchase style attributes.
pub const STYLE_COLUMN: &str = "style";
/// Raw, space-padded gift amount child of `style`.
pub const GIFT_AMOUNT_CHILD: &str = "Gift Amount:";
/// Cleaned integer gift amount child of `style`.
pub const GIFT_AMOUNT_COLUMN: &str = "Gift_Amount";
/// Flat table key.
pub const IDENTIFIER_COLUMN: &str = "identifier";
/// Free-text review column.
pub const REVIEW_TEXT_COLUMN: &str = "reviewText";
/// Star rating column (regression target).
pub const RATING_COLUMN: &str = "overall";
/// Columns concatenated (with `_`) into the identifier.
pub const IDENTIFIER_PARTS: [&str; 3] = ["asin", "reviewerID", "unixReviewTime"];

/// Which rewrite path cleans the nested gift amount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewritePath {
    /// Column-expression rewrite with inferred output type.
    #[default]
    Expression,
    /// Row-level rewrite with a declared `bigint` output type.
    RowLevel,
}

/// Casts a value to a 32-bit integer after removing all spaces.
///
/// Anything that does not parse, or falls outside the `i32` range, becomes
/// `null`.
#[must_use]
pub fn cast_to_int(value: &Value) -> Value {
    let parsed = match value {
        Value::String(text) => {
            let compact: String = text.chars().filter(|c| *c != ' ').collect();
            compact.parse::<i32>().ok()
        }
        Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
        _ => None,
    };
    parsed.map_or(Value::Null, |n| Value::Number(n.into()))
}

/// Replaces `style."Gift Amount:"` with an integer `style.Gift_Amount`.
pub fn clean_gift_amount(
    ctx: &ExecutionContext,
    table: &Table,
    path: RewritePath,
) -> Result<Table, RewriteError> {
    let rewrite = ChildRewrite::new(STYLE_COLUMN, GIFT_AMOUNT_CHILD)
        .mapping(&cast_to_int)
        .rename_to(GIFT_AMOUNT_COLUMN);
    match path {
        RewritePath::Expression => rewrite_child(table, &rewrite),
        RewritePath::RowLevel => {
            rewrite_child_rowwise(ctx, table, &rewrite.new_child_type(DataType::Long))
        }
    }
}

/// Projects cleaned records into the flat, identifier-keyed layout.
///
/// Output columns: `identifier`, every `style` child promoted to the top
/// level, `overall`, `reviewText`. Identifier parts that are `null` or
/// missing are skipped when joining.
pub fn flatten_reviews(table: &Table) -> Result<Table, SchemaError> {
    let schema = table.schema();
    let rating = schema.require(RATING_COLUMN)?.clone();
    let text = schema.require(REVIEW_TEXT_COLUMN)?.clone();
    let style_children: Vec<Field> = match schema.field(STYLE_COLUMN) {
        Some(_) => schema.struct_children(STYLE_COLUMN)?.to_vec(),
        None => Vec::new(),
    };

    let mut fields = Vec::with_capacity(style_children.len() + 3);
    fields.push(Field::new(IDENTIFIER_COLUMN, DataType::String));
    fields.extend(style_children.iter().cloned());
    fields.push(rating);
    fields.push(text);
    let flat_schema = Schema::new(fields);

    let rows = table
        .rows()
        .iter()
        .map(|row| {
            let mut flat = Row::with_capacity(flat_schema.fields().len());
            flat.insert(IDENTIFIER_COLUMN.to_string(), Value::String(identifier(row)));
            let style = row.get(STYLE_COLUMN).and_then(Value::as_object);
            for child in &style_children {
                let value = style
                    .and_then(|map| map.get(&child.name))
                    .cloned()
                    .unwrap_or(Value::Null);
                flat.insert(child.name.clone(), value);
            }
            for column in [RATING_COLUMN, REVIEW_TEXT_COLUMN] {
                flat.insert(
                    column.to_string(),
                    row.get(column).cloned().unwrap_or(Value::Null),
                );
            }
            flat
        })
        .collect();
    Ok(Table::new(flat_schema, rows))
}

/// Flattened reviews keyed by `identifier`, as read back from the CSV export.
#[derive(Debug, Clone)]
pub struct FlatReviews {
    table: Table,
    index: IndexMap<String, usize>,
}

impl FlatReviews {
    /// Wraps a flat table; `identifier`, `overall` and `reviewText` must exist.
    ///
    /// Identifiers are normalised to strings. A repeated identifier keeps
    /// every row but the index points at the last one.
    pub fn from_table(table: Table) -> Result<Self, SchemaError> {
        let schema = table.schema();
        for column in [IDENTIFIER_COLUMN, RATING_COLUMN, REVIEW_TEXT_COLUMN] {
            schema.require(column)?;
        }
        let fields = schema
            .fields()
            .iter()
            .map(|field| {
                if field.name == IDENTIFIER_COLUMN {
                    Field::new(IDENTIFIER_COLUMN, DataType::String)
                } else {
                    field.clone()
                }
            })
            .collect();
        let rows: Vec<Row> = table
            .rows()
            .iter()
            .cloned()
            .map(|mut row| {
                if let Some(id) = row.get_mut(IDENTIFIER_COLUMN) {
                    if !id.is_null() && !id.is_string() {
                        *id = Value::String(render_cell(id));
                    }
                }
                row
            })
            .collect();
        Ok(Self::index(Table::new(Schema::new(fields), rows)))
    }

    fn index(table: Table) -> Self {
        let index = table
            .rows()
            .iter()
            .enumerate()
            .filter_map(|(idx, row)| {
                row.get(IDENTIFIER_COLUMN)
                    .and_then(Value::as_str)
                    .map(|id| (id.to_string(), idx))
            })
            .collect();
        Self { table, index }
    }

    /// Underlying table.
    #[must_use]
    pub const fn table(&self) -> &Table {
        &self.table
    }

    /// Unwraps the table.
    #[must_use]
    pub fn into_table(self) -> Table {
        self.table
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.len()
    }

    /// Whether there are no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Row with the given identifier.
    #[must_use]
    pub fn get(&self, identifier: &str) -> Option<&Row> {
        self.index
            .get(identifier)
            .and_then(|&idx| self.table.rows().get(idx))
    }

    /// Keeps only rows without `null` values.
    #[must_use]
    pub fn drop_incomplete(self) -> Self {
        let before = self.table.len();
        let table = self.table.drop_nulls();
        tracing::debug!("dropped {} incomplete rows", before - table.len());
        Self::index(table)
    }
}

/// Reads a CSV written from [`flatten_reviews`] output.
pub fn read_flattened_csv(path: impl AsRef<Path>) -> Result<FlatReviews, TableError> {
    let table = Table::read_csv(path)?;
    Ok(FlatReviews::from_table(table)?)
}

fn identifier(row: &Row) -> String {
    IDENTIFIER_PARTS
        .iter()
        .filter_map(|part| row.get(*part).filter(|value| !value.is_null()))
        .map(render_cell)
        .collect::<Vec<_>>()
        .join("_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    const RAW: &str = r#"{"overall": 5.0, "reviewerID": "A1", "asin": "B1", "unixReviewTime": 1376352000, "style": {"Gift Amount:": " 25 "}, "reviewText": "Great"}
{"overall": 1.0, "reviewerID": "A2", "asin": "B2", "unixReviewTime": 1376352001, "style": {"Gift Amount:": "lots"}, "reviewText": "Bad"}
{"overall": 4.0, "reviewerID": "A3", "asin": "B3", "reviewText": "Fine"}"#;

    fn raw() -> Table {
        Table::from_json_lines(Cursor::new(RAW)).unwrap()
    }

    #[test]
    fn cast_to_int_strips_spaces() {
        assert_eq!(cast_to_int(&json!(" 2 5 ")), json!(25));
        assert_eq!(cast_to_int(&json!("abc")), Value::Null);
        assert_eq!(cast_to_int(&json!(7)), json!(7));
        assert_eq!(cast_to_int(&json!(7.5)), Value::Null);
        assert_eq!(cast_to_int(&Value::Null), Value::Null);
        assert_eq!(cast_to_int(&json!(" 3000000000 ")), Value::Null);
        assert_eq!(cast_to_int(&json!("-2147483648")), json!(i32::MIN));
        assert_eq!(cast_to_int(&json!(3_000_000_000_u64)), Value::Null);
    }

    #[test]
    fn cleans_gift_amount_on_both_paths() {
        let ctx = ExecutionContext::new(2).unwrap();
        for path in [RewritePath::Expression, RewritePath::RowLevel] {
            let cleaned = clean_gift_amount(&ctx, &raw(), path).unwrap();
            let style = &cleaned.rows()[0][STYLE_COLUMN];
            assert_eq!(style[GIFT_AMOUNT_COLUMN], json!(25), "{path:?}");
            assert!(style.get(GIFT_AMOUNT_CHILD).is_none(), "{path:?}");
            assert_eq!(cleaned.rows()[1][STYLE_COLUMN][GIFT_AMOUNT_COLUMN], Value::Null);
            assert_eq!(
                cleaned.schema().child(STYLE_COLUMN, GIFT_AMOUNT_COLUMN).unwrap().data_type,
                DataType::Long
            );
        }
    }

    #[test]
    fn flattens_into_identifier_keyed_rows() {
        let ctx = ExecutionContext::new(1).unwrap();
        let cleaned = clean_gift_amount(&ctx, &raw(), RewritePath::Expression).unwrap();
        let flat = flatten_reviews(&cleaned).unwrap();

        let names: Vec<_> = flat.schema().names().collect();
        assert_eq!(names, vec!["identifier", "Gift_Amount", "overall", "reviewText"]);
        assert_eq!(flat.rows()[0]["identifier"], json!("B1_A1_1376352000"));
        assert_eq!(flat.rows()[0]["Gift_Amount"], json!(25));
        assert_eq!(flat.rows()[2]["identifier"], json!("B3_A3"));
        assert_eq!(flat.rows()[2]["Gift_Amount"], Value::Null);
        assert_eq!(flat.clone().drop_nulls().len(), 1);
    }

    #[test]
    fn csv_round_trip_keys_rows_by_identifier() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/flattened.csv");
        let ctx = ExecutionContext::new(1).unwrap();
        let cleaned = clean_gift_amount(&ctx, &raw(), RewritePath::RowLevel).unwrap();
        flatten_reviews(&cleaned).unwrap().write_csv(&path).unwrap();

        let flat = read_flattened_csv(&path).unwrap();
        assert_eq!(flat.len(), 3);
        let first = flat.get("B1_A1_1376352000").unwrap();
        assert_eq!(first["Gift_Amount"], json!(25));
        assert_eq!(first["overall"], json!(5.0));
        assert_eq!(first["reviewText"], json!("Great"));

        let complete = flat.drop_incomplete();
        assert_eq!(complete.len(), 1);
        assert!(complete.get("B3_A3").is_none());
        assert!(complete.get("B1_A1_1376352000").is_some());
    }

    #[test]
    fn numeric_identifiers_become_strings() {
        let table = Table::from_json_lines(Cursor::new(
            "{\"identifier\": 17, \"overall\": 3, \"reviewText\": \"ok\"}",
        ))
        .unwrap();
        let flat = FlatReviews::from_table(table).unwrap();
        assert_eq!(flat.get("17").unwrap()["identifier"], json!("17"));
        assert_eq!(
            flat.table().schema().field(IDENTIFIER_COLUMN).unwrap().data_type,
            DataType::String
        );
    }

    #[test]
    fn flatten_requires_rating_and_text() {
        let table = Table::from_json_lines(Cursor::new("{\"overall\": 5}")).unwrap();
        assert_eq!(
            flatten_reviews(&table).unwrap_err(),
            SchemaError::UnknownColumn(REVIEW_TEXT_COLUMN.into())
        );
    }
}
