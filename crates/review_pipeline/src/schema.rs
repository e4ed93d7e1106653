use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::table::Row;

/// Column data type, covering what line-delimited JSON review dumps produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "of", rename_all = "snake_case")]
pub enum DataType {
    /// Only nulls were observed.
    Null,
    /// `true` / `false`.
    Boolean,
    /// 64-bit integer.
    Long,
    /// 64-bit float.
    Double,
    /// UTF-8 text.
    String,
    /// Homogeneous list.
    Array(Box<DataType>),
    /// Named child fields, one nesting level deep for the rewriter.
    Struct(Vec<Field>),
}

impl DataType {
    /// Infers the type of a single JSON value.
    #[must_use]
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Long,
            Value::Number(_) => Self::Double,
            Value::String(_) => Self::String,
            Value::Array(items) => Self::Array(Box::new(
                items
                    .iter()
                    .fold(Self::Null, |acc, item| acc.merge(Self::of(item))),
            )),
            Value::Object(map) => Self::Struct(
                map.iter()
                    .map(|(name, value)| Field::new(name, Self::of(value)))
                    .collect(),
            ),
        }
    }

    /// Widens two observed types into one that holds both.
    ///
    /// Conflicting scalars fall back to `String`.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (Self::Null, t) | (t, Self::Null) => t,
            (Self::Long, Self::Double) | (Self::Double, Self::Long) => Self::Double,
            (Self::Array(a), Self::Array(b)) => Self::Array(Box::new(a.merge(*b))),
            (Self::Struct(a), Self::Struct(b)) => Self::Struct(merge_fields(a, b)),
            _ => Self::String,
        }
    }

    /// Children of a struct type.
    #[must_use]
    pub fn struct_fields(&self) -> Option<&[Field]> {
        match self {
            Self::Struct(fields) => Some(fields),
            _ => None,
        }
    }

    /// Spark-style short type name (`bigint`, `struct<a:string>`, ...).
    #[must_use]
    pub fn simple_string(&self) -> String {
        match self {
            Self::Null => "null".into(),
            Self::Boolean => "boolean".into(),
            Self::Long => "bigint".into(),
            Self::Double => "double".into(),
            Self::String => "string".into(),
            Self::Array(elem) => format!("array<{}>", elem.simple_string()),
            Self::Struct(fields) => render_struct(fields),
        }
    }

    /// Reorders a struct value to follow this type's field order.
    ///
    /// Missing children become `null`, unknown children are dropped. Scalars
    /// pass through untouched.
    #[must_use]
    pub fn conform(&self, value: Value) -> Value {
        match (self, value) {
            (Self::Struct(fields), Value::Object(mut map)) => {
                let mut ordered = Map::with_capacity(fields.len());
                for field in fields {
                    let child = map.remove(&field.name).unwrap_or(Value::Null);
                    ordered.insert(field.name.clone(), field.data_type.conform(child));
                }
                Value::Object(ordered)
            }
            (_, value) => value,
        }
    }
}

/// Named, typed column or struct child.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    /// Field name.
    pub name: String,
    /// Declared type.
    pub data_type: DataType,
    /// Whether nulls are allowed.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

const fn default_nullable() -> bool {
    true
}

impl Field {
    /// Creates a nullable field.
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

/// Errors raised when a column path does not resolve against a schema.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchemaError {
    /// Top-level column missing.
    #[error("unknown column `{0}`")]
    UnknownColumn(String),
    /// Column exists but is not a struct.
    #[error("column `{column}` is not a struct (found {found})")]
    NotAStruct {
        /// Column name.
        column: String,
        /// Rendered actual type.
        found: String,
    },
    /// Struct column lacks the requested child.
    #[error("struct column `{parent}` has no child `{child}`")]
    UnknownChild {
        /// Parent column.
        parent: String,
        /// Missing child.
        child: String,
    },
}

/// Ordered list of top-level fields.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    /// Creates a schema from fields.
    #[must_use]
    pub fn new(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Infers a schema by merging the observed type of every row.
    ///
    /// Field order follows first appearance.
    pub fn infer<'a>(rows: impl IntoIterator<Item = &'a Row>) -> Self {
        let fields = rows.into_iter().fold(Vec::new(), |acc, row| {
            let observed = row
                .iter()
                .map(|(name, value)| Field::new(name, DataType::of(value)))
                .collect();
            merge_fields(acc, observed)
        });
        Self { fields }
    }

    /// All fields in order.
    #[must_use]
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Field names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    /// Looks up a top-level field.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Looks up a top-level field or fails.
    pub fn require(&self, name: &str) -> Result<&Field, SchemaError> {
        self.field(name)
            .ok_or_else(|| SchemaError::UnknownColumn(name.to_string()))
    }

    /// Children of a struct column.
    pub fn struct_children(&self, parent: &str) -> Result<&[Field], SchemaError> {
        let field = self.require(parent)?;
        field
            .data_type
            .struct_fields()
            .ok_or_else(|| SchemaError::NotAStruct {
                column: parent.to_string(),
                found: field.data_type.simple_string(),
            })
    }

    /// A single child of a struct column.
    pub fn child(&self, parent: &str, child: &str) -> Result<&Field, SchemaError> {
        self.struct_children(parent)?
            .iter()
            .find(|field| field.name == child)
            .ok_or_else(|| SchemaError::UnknownChild {
                parent: parent.to_string(),
                child: child.to_string(),
            })
    }

    /// Returns a copy whose struct column `parent` holds exactly `children`.
    pub fn with_struct_children(
        &self,
        parent: &str,
        children: Vec<Field>,
    ) -> Result<Self, SchemaError> {
        self.struct_children(parent)?;
        let fields = self
            .fields
            .iter()
            .map(|field| {
                if field.name == parent {
                    Field {
                        data_type: DataType::Struct(children.clone()),
                        ..field.clone()
                    }
                } else {
                    field.clone()
                }
            })
            .collect();
        Ok(Self { fields })
    }

    /// Structural schema patch for row-level rewrites.
    ///
    /// Renames `child` to `new_name` in place, retyping it when `new_type` is
    /// given. With `append` the original child is kept and the new one is
    /// added after the existing children instead.
    pub fn patch_child(
        &self,
        parent: &str,
        child: &str,
        new_name: &str,
        new_type: Option<DataType>,
        append: bool,
    ) -> Result<Self, SchemaError> {
        let original = self.child(parent, child)?;
        let patched = Field {
            name: new_name.to_string(),
            data_type: new_type.unwrap_or_else(|| original.data_type.clone()),
            nullable: original.nullable,
        };
        let mut children: Vec<Field> = self
            .struct_children(parent)?
            .iter()
            .filter(|field| field.name != new_name || field.name == child)
            .cloned()
            .collect();
        if append {
            children.push(patched);
        } else if let Some(slot) = children.iter_mut().find(|field| field.name == child) {
            *slot = patched;
        }
        self.with_struct_children(parent, children)
    }

    /// Spark-style textual description, e.g. `struct<a:string,b:bigint>`.
    #[must_use]
    pub fn simple_string(&self) -> String {
        render_struct(&self.fields)
    }
}

fn render_struct(fields: &[Field]) -> String {
    let inner = fields
        .iter()
        .map(|field| format!("{}:{}", field.name, field.data_type.simple_string()))
        .collect::<Vec<_>>()
        .join(",");
    format!("struct<{inner}>")
}

fn merge_fields(mut base: Vec<Field>, observed: Vec<Field>) -> Vec<Field> {
    for field in observed {
        if let Some(existing) = base.iter_mut().find(|f| f.name == field.name) {
            let merged = std::mem::replace(&mut existing.data_type, DataType::Null)
                .merge(field.data_type);
            existing.data_type = merged;
        } else {
            base.push(field);
        }
    }
    base
}
