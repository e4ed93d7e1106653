//! Rewrites of a single child field inside a struct column.
//!
//! Only one level of nesting is supported: `parent` is a top-level struct
//! column and `child` one of its direct fields.
//!
//! Two paths exist. [`rewrite_child`] behaves like a column expression: the
//! new child's type is inferred from the mapped values and the rebuilt struct
//! lists the new child first. [`rewrite_child_rowwise`] maps whole rows on the
//! context's worker pool and patches the schema structurally, which suits
//! mappings whose output type the caller wants to declare up front.

use rayon::prelude::*;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::{
    context::ExecutionContext,
    schema::{DataType, Field, SchemaError},
    table::{Row, Table},
};

/// Value transform applied to a child field.
pub type Mapping = dyn Fn(&Value) -> Value + Sync;

/// Mapping used when none is given.
#[must_use]
pub fn identity(value: &Value) -> Value {
    value.clone()
}

/// Configuration errors of the rewriter. All are fatal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RewriteError {
    /// Parent/child lookup failure.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// `add_as_new_child` without a distinct new name.
    #[error("cannot add the column `{child}` twice to `{parent}`")]
    DuplicateChild {
        /// Parent column.
        parent: String,
        /// Child that would be duplicated.
        child: String,
    },
    /// Parallel argument lists of a batched rewrite disagree.
    #[error(
        "lengths of new child names ({new_children}), child names ({children}) and mappings ({mappings}) have to match"
    )]
    LengthMismatch {
        /// Number of child names.
        children: usize,
        /// Number of new child names.
        new_children: usize,
        /// Number of per-child mappings.
        mappings: usize,
    },
}

/// One child rewrite: which field, how to map it, and where to put it.
#[derive(Clone)]
pub struct ChildRewrite<'a> {
    parent: String,
    child: String,
    mapping: Option<&'a Mapping>,
    new_child: Option<String>,
    add_as_new_child: bool,
    new_child_type: Option<DataType>,
}

impl std::fmt::Debug for ChildRewrite<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildRewrite")
            .field("parent", &self.parent)
            .field("child", &self.child)
            .field("mapped", &self.mapping.is_some())
            .field("new_child", &self.new_child)
            .field("add_as_new_child", &self.add_as_new_child)
            .field("new_child_type", &self.new_child_type)
            .finish()
    }
}

impl<'a> ChildRewrite<'a> {
    /// Rewrites `parent.child` in place with the identity mapping.
    #[must_use]
    pub fn new(parent: impl Into<String>, child: impl Into<String>) -> Self {
        Self {
            parent: parent.into(),
            child: child.into(),
            mapping: None,
            new_child: None,
            add_as_new_child: false,
            new_child_type: None,
        }
    }

    /// Sets the value mapping.
    #[must_use]
    pub fn mapping(mut self, mapping: &'a Mapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    /// Sets an optional value mapping.
    #[must_use]
    pub fn maybe_mapping(mut self, mapping: Option<&'a Mapping>) -> Self {
        self.mapping = mapping;
        self
    }

    /// Stores the result under a different child name.
    #[must_use]
    pub fn rename_to(mut self, new_child: impl Into<String>) -> Self {
        self.new_child = Some(new_child.into());
        self
    }

    /// Keeps the original child and adds the mapped value next to it.
    #[must_use]
    pub fn add_as_new_child(mut self, add: bool) -> Self {
        self.add_as_new_child = add;
        self
    }

    /// Declared type of the new child (row-level path only).
    #[must_use]
    pub fn new_child_type(mut self, data_type: DataType) -> Self {
        self.new_child_type = Some(data_type);
        self
    }

    fn validate(&self) -> Result<(), RewriteError> {
        let distinct = self
            .new_child
            .as_deref()
            .is_some_and(|name| name != self.child);
        if self.add_as_new_child && !distinct {
            return Err(RewriteError::DuplicateChild {
                parent: self.parent.clone(),
                child: self.child.clone(),
            });
        }
        Ok(())
    }

    fn target_name(&self) -> &str {
        self.new_child.as_deref().unwrap_or(&self.child)
    }

    fn apply(&self, value: &Value) -> Value {
        self.mapping.map_or_else(|| identity(value), |map| map(value))
    }
}

/// Mappings for a batched rewrite.
#[derive(Default)]
pub enum Mappings<'a> {
    /// Identity for every child.
    #[default]
    Identity,
    /// One mapping shared by every child.
    Single(&'a Mapping),
    /// One optional mapping per child.
    PerChild(Vec<Option<&'a Mapping>>),
}

/// Column-expression rewrite of one child field.
///
/// The parent struct of the result lists the mapped child first, followed by
/// the remaining original children. A resolved child name equal to the parent
/// name (ignoring case) gets a trailing `_`. Rows whose parent is `null` see
/// `null` children, so the mapping is applied to `null` there.
pub fn rewrite_child(table: &Table, rewrite: &ChildRewrite<'_>) -> Result<Table, RewriteError> {
    rewrite.validate()?;
    let schema = table.schema();
    schema.child(&rewrite.parent, &rewrite.child)?;

    let mut target = rewrite.target_name().to_string();
    if target.to_lowercase() == rewrite.parent.to_lowercase() {
        tracing::warn!(
            "Modifying {target} to {target}_ due to name collision with parent {}",
            rewrite.parent
        );
        target.push('_');
    }

    let mapped: Vec<Value> = table
        .rows()
        .iter()
        .map(|row| rewrite.apply(child_value(row, &rewrite.parent, &rewrite.child)))
        .collect();
    let new_type = mapped
        .iter()
        .fold(DataType::Null, |acc, value| acc.merge(DataType::of(value)));

    let kept: Vec<Field> = schema
        .struct_children(&rewrite.parent)?
        .iter()
        .filter(|field| rewrite.add_as_new_child || field.name != rewrite.child)
        .filter(|field| field.name != target)
        .cloned()
        .collect();
    let mut children = Vec::with_capacity(kept.len() + 1);
    children.push(Field::new(target.clone(), new_type));
    children.extend(kept);
    let new_schema = schema.with_struct_children(&rewrite.parent, children.clone())?;

    let rows = table
        .rows()
        .iter()
        .zip(mapped)
        .map(|(row, value)| {
            let old = row.get(&rewrite.parent).and_then(Value::as_object);
            let mut rebuilt = Map::with_capacity(children.len());
            rebuilt.insert(target.clone(), value);
            for field in &children[1..] {
                let child = old
                    .and_then(|map| map.get(&field.name))
                    .cloned()
                    .unwrap_or(Value::Null);
                rebuilt.insert(field.name.clone(), child);
            }
            replace_parent(row, &rewrite.parent, Value::Object(rebuilt))
        })
        .collect();
    Ok(Table::from_conforming(new_schema, rows))
}

/// Batched form of [`rewrite_child`] over parallel lists.
///
/// `new_children` defaults to `children`. Lengths are checked before any
/// rewrite runs, so a mismatch never leaves a partial result.
pub fn rewrite_children(
    table: &Table,
    parent: &str,
    children: &[&str],
    mappings: Mappings<'_>,
    new_children: Option<&[&str]>,
    add_as_new_children: bool,
) -> Result<Table, RewriteError> {
    let new_children = new_children.unwrap_or(children);
    let mappings: Vec<Option<&Mapping>> = match mappings {
        Mappings::Identity => vec![None; children.len()],
        Mappings::Single(mapping) => vec![Some(mapping); children.len()],
        Mappings::PerChild(list) => list,
    };
    if new_children.len() != children.len() || mappings.len() != children.len() {
        return Err(RewriteError::LengthMismatch {
            children: children.len(),
            new_children: new_children.len(),
            mappings: mappings.len(),
        });
    }

    let mut current = table.clone();
    for ((child, new_child), mapping) in children.iter().zip(new_children).zip(mappings) {
        let rewrite = ChildRewrite::new(parent, *child)
            .maybe_mapping(mapping)
            .rename_to(*new_child)
            .add_as_new_child(add_as_new_children);
        current = rewrite_child(&current, &rewrite)?;
    }
    Ok(current)
}

/// Row-level rewrite with a structural schema patch.
///
/// Rows are mapped on the context's worker pool. A row whose parent value is
/// absent passes through unchanged. The child keeps its position (or is
/// appended with `add_as_new_child`) and its declared type unless
/// [`ChildRewrite::new_child_type`] overrides it.
pub fn rewrite_child_rowwise(
    ctx: &ExecutionContext,
    table: &Table,
    rewrite: &ChildRewrite<'_>,
) -> Result<Table, RewriteError> {
    rewrite.validate()?;
    let target = rewrite.target_name();
    let new_schema = table.schema().patch_child(
        &rewrite.parent,
        &rewrite.child,
        target,
        rewrite.new_child_type.clone(),
        rewrite.add_as_new_child,
    )?;
    tracing::debug!(
        "patched schema {} -> {}",
        table.schema().simple_string(),
        new_schema.simple_string()
    );
    let parent_type = new_schema.require(&rewrite.parent)?.data_type.clone();

    let rows: Vec<Row> = ctx.install(|| {
        table
            .rows()
            .par_iter()
            .map(|row| {
                let Some(Value::Object(old)) = row.get(&rewrite.parent) else {
                    return row.clone();
                };
                let mut parent = old.clone();
                let value = rewrite.apply(old.get(&rewrite.child).unwrap_or(&Value::Null));
                if !rewrite.add_as_new_child {
                    parent.remove(&rewrite.child);
                }
                parent.insert(target.to_string(), value);
                replace_parent(row, &rewrite.parent, parent_type.conform(Value::Object(parent)))
            })
            .collect()
    });
    Ok(Table::from_conforming(new_schema, rows))
}

fn child_value<'r>(row: &'r Row, parent: &str, child: &str) -> &'r Value {
    row.get(parent)
        .and_then(|value| value.get(child))
        .unwrap_or(&Value::Null)
}

fn replace_parent(row: &Row, parent: &str, value: Value) -> Row {
    let mut row = row.clone();
    if let Some(slot) = row.get_mut(parent) {
        *slot = value;
    }
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Cursor;

    fn table(lines: &str) -> Table {
        Table::from_json_lines(Cursor::new(lines.to_string())).unwrap()
    }

    fn children_of(table: &Table, parent: &str) -> Vec<String> {
        table
            .schema()
            .struct_children(parent)
            .unwrap()
            .iter()
            .map(|field| field.name.clone())
            .collect()
    }

    fn upper(value: &Value) -> Value {
        value
            .as_str()
            .map_or(Value::Null, |s| Value::String(s.to_uppercase()))
    }

    const ABC: &str = r#"{"id": 1, "p": {"a": "x", "b": 2, "c": true}}
{"id": 2, "p": {"a": "y", "b": 3, "c": false}}"#;

    #[test]
    fn maps_one_child_and_keeps_siblings() {
        let input = table(ABC);
        let out = rewrite_child(&input, &ChildRewrite::new("p", "a").mapping(&upper)).unwrap();

        assert_eq!(children_of(&out, "p"), vec!["a", "b", "c"]);
        assert_eq!(out.rows()[0]["p"], json!({"a": "X", "b": 2, "c": true}));
        assert_eq!(out.rows()[1]["id"], json!(2));
        assert_eq!(
            out.schema().field("id"),
            input.schema().field("id"),
            "other columns unchanged"
        );
        assert_eq!(input.rows()[0]["p"]["a"], json!("x"), "input untouched");
    }

    #[test]
    fn renamed_child_goes_first_and_original_is_dropped() {
        let out = rewrite_child(
            &table(ABC),
            &ChildRewrite::new("p", "b").rename_to("b2"),
        )
        .unwrap();
        assert_eq!(children_of(&out, "p"), vec!["b2", "a", "c"]);
    }

    #[test]
    fn add_as_new_child_keeps_the_original() {
        let out = rewrite_child(
            &table(ABC),
            &ChildRewrite::new("p", "a")
                .mapping(&upper)
                .rename_to("a_upper")
                .add_as_new_child(true),
        )
        .unwrap();
        assert_eq!(children_of(&out, "p"), vec!["a_upper", "a", "b", "c"]);
        assert_eq!(out.rows()[1]["p"]["a_upper"], json!("Y"));
        assert_eq!(out.rows()[1]["p"]["a"], json!("y"));
    }

    #[test]
    fn add_as_new_child_requires_a_distinct_name() {
        let input = table(ABC);
        let missing = ChildRewrite::new("p", "a").add_as_new_child(true);
        let same = ChildRewrite::new("p", "a").rename_to("a").add_as_new_child(true);
        for rewrite in [missing, same] {
            assert_eq!(
                rewrite_child(&input, &rewrite).unwrap_err(),
                RewriteError::DuplicateChild {
                    parent: "p".into(),
                    child: "a".into()
                }
            );
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLog(std::sync::Arc<parking_lot::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLog {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[test]
    fn collision_with_parent_name_gets_suffix_and_warns() {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let out = tracing::subscriber::with_default(subscriber, || {
            rewrite_child(&table(ABC), &ChildRewrite::new("p", "a").rename_to("P")).unwrap()
        });
        assert_eq!(children_of(&out, "p"), vec!["P_", "b", "c"]);
        let text = log.text();
        assert!(text.contains("WARN"), "{text}");
        assert!(
            text.contains("Modifying P to P_ due to name collision with parent p"),
            "{text}"
        );
    }

    #[test]
    fn unknown_parent_or_child_fails() {
        let input = table(ABC);
        assert!(matches!(
            rewrite_child(&input, &ChildRewrite::new("q", "a")),
            Err(RewriteError::Schema(SchemaError::UnknownColumn(_)))
        ));
        assert!(matches!(
            rewrite_child(&input, &ChildRewrite::new("p", "z")),
            Err(RewriteError::Schema(SchemaError::UnknownChild { .. }))
        ));
        assert!(matches!(
            rewrite_child(&input, &ChildRewrite::new("id", "a")),
            Err(RewriteError::Schema(SchemaError::NotAStruct { .. }))
        ));
    }

    #[test]
    fn null_parent_yields_null_children_on_expression_path() {
        let input = table("{\"p\": {\"a\": \"x\", \"b\": 1}}\n{\"p\": null}");
        let out = rewrite_child(&input, &ChildRewrite::new("p", "a").mapping(&upper)).unwrap();
        assert_eq!(out.rows()[1]["p"], json!({"a": null, "b": null}));
    }

    #[test]
    fn batched_rewrite_applies_each_child() {
        let out = rewrite_children(
            &table(ABC),
            "p",
            &["a", "b"],
            Mappings::Single(&identity),
            Some(&["a1", "b1"]),
            false,
        )
        .unwrap();
        assert_eq!(children_of(&out, "p"), vec!["b1", "a1", "c"]);
        assert_eq!(out.rows()[0]["p"]["b1"], json!(2));
    }

    #[test]
    fn batched_rewrite_can_keep_the_originals() {
        let upper_ref: &Mapping = &upper;
        let out = rewrite_children(
            &table(ABC),
            "p",
            &["a", "b"],
            Mappings::PerChild(vec![Some(upper_ref), None]),
            Some(&["a_upper", "b_copy"]),
            true,
        )
        .unwrap();
        assert_eq!(
            children_of(&out, "p"),
            vec!["b_copy", "a_upper", "a", "b", "c"]
        );
        assert_eq!(
            out.rows()[0]["p"],
            json!({"b_copy": 2, "a_upper": "X", "a": "x", "b": 2, "c": true})
        );
        assert_eq!(out.rows()[1]["p"]["a_upper"], json!("Y"));
    }

    #[test]
    fn batched_rewrite_rejects_length_mismatch() {
        let input = table(ABC);
        let err = rewrite_children(&input, "p", &["a", "b"], Mappings::Identity, Some(&["a1"]), false)
            .unwrap_err();
        assert_eq!(
            err,
            RewriteError::LengthMismatch {
                children: 2,
                new_children: 1,
                mappings: 2
            }
        );

        let upper_ref: &Mapping = &upper;
        let err = rewrite_children(
            &input,
            "p",
            &["a", "b"],
            Mappings::PerChild(vec![Some(upper_ref)]),
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, RewriteError::LengthMismatch { mappings: 1, .. }));
    }

    #[test]
    fn rowwise_passes_absent_parent_through() {
        let ctx = ExecutionContext::new(2).unwrap();
        let input = table("{\"id\": 1, \"p\": {\"a\": \"x\", \"b\": 1}}\n{\"id\": 2, \"p\": null}\n{\"id\": 3}");
        let out = rewrite_child_rowwise(
            &ctx,
            &input,
            &ChildRewrite::new("p", "a").mapping(&upper).rename_to("A"),
        )
        .unwrap();

        assert_eq!(out.rows()[0]["p"], json!({"A": "X", "b": 1}));
        assert_eq!(out.rows()[1], input.rows()[1]);
        assert_eq!(out.rows()[2], input.rows()[2]);
        assert_eq!(out.schema().simple_string(), "struct<id:bigint,p:struct<A:string,b:bigint>>");
    }

    #[test]
    fn rowwise_retypes_and_appends() {
        let ctx = ExecutionContext::new(1).unwrap();
        let len = |value: &Value| value.as_str().map_or(Value::Null, |s| json!(s.len()));
        let out = rewrite_child_rowwise(
            &ctx,
            &table(ABC),
            &ChildRewrite::new("p", "a")
                .mapping(&len)
                .rename_to("a_len")
                .add_as_new_child(true)
                .new_child_type(DataType::Long),
        )
        .unwrap();
        assert_eq!(
            out.schema().simple_string(),
            "struct<id:bigint,p:struct<a:string,b:bigint,c:boolean,a_len:bigint>>"
        );
        let keys: Vec<_> = out.rows()[0]["p"].as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b", "c", "a_len"]);
        assert_eq!(out.rows()[0]["p"]["a_len"], json!(1));
    }
}
