//! Tabular store.
//!
//! A row-keyed attribute table with a typed geometry column and an open
//! schema. The connector owns two instances, `vectors` and `rasters`. Columns
//! appear as rows bring them in (or through the explicit schema-evolution
//! operations used by label makers and downloaders); each column's value kind
//! is pinned by the first concrete value seen for it.
//!
//! Batch operations are atomic: every row is validated before the first row
//! is written.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use geo::Geometry;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{GeographError, Result};

/// Value kind pinned to a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    /// No concrete value seen yet.
    Null,
    /// Boolean values.
    Bool,
    /// Integer or floating point values.
    Number,
    /// String values.
    String,
    /// JSON arrays.
    Array,
    /// JSON objects.
    Object,
}

impl fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        };
        write!(f, "{name}")
    }
}

fn kind_of(value: &Value) -> ColumnKind {
    match value {
        Value::Null => ColumnKind::Null,
        Value::Bool(_) => ColumnKind::Bool,
        Value::Number(_) => ColumnKind::Number,
        Value::String(_) => ColumnKind::String,
        Value::Array(_) => ColumnKind::Array,
        Value::Object(_) => ColumnKind::Object,
    }
}

/// One table row: a geometry plus free-form attributes.
///
/// Attributes may be sparse; a missing column reads as JSON null.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// The row geometry, always in the connector's canonical CRS.
    pub geometry: Geometry<f64>,
    /// Attribute values by column name.
    pub attrs: BTreeMap<String, Value>,
}

/// A validated input row for [`AttributeTable::insert_rows`].
#[derive(Debug, Clone)]
pub struct TableRow {
    /// Unique row id.
    pub id: String,
    /// Geometry in the canonical CRS.
    pub geometry: Geometry<f64>,
    /// Attribute values by column name.
    pub attrs: BTreeMap<String, Value>,
}

/// Row-keyed attribute table with a geometry column.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeTable {
    name: String,
    id_column: String,
    rows: HashMap<String, Row>,
    /// Row ids in insertion order.
    order: Vec<String>,
    columns: BTreeMap<String, ColumnKind>,
}

impl AttributeTable {
    /// Create an empty table.
    ///
    /// `name` is used in error messages; `id_column` is the property the row
    /// id is written to on the wire.
    pub fn new(name: &str, id_column: &str) -> Self {
        Self {
            name: name.to_string(),
            id_column: id_column.to_string(),
            rows: HashMap::new(),
            order: Vec::new(),
            columns: BTreeMap::new(),
        }
    }

    /// An empty table with the same name and schema.
    pub fn empty_like(&self) -> Self {
        Self {
            name: self.name.clone(),
            id_column: self.id_column.clone(),
            rows: HashMap::new(),
            order: Vec::new(),
            columns: self.columns.clone(),
        }
    }

    /// Table name (`vectors` or `rasters`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the wire property the row id is stored in.
    pub fn id_column(&self) -> &str {
        &self.id_column
    }

    /// Insert a batch of rows atomically.
    ///
    /// Fails without side effects on duplicate ids (within the batch or
    /// against existing rows), reserved column names, or column kind
    /// mismatches. New columns widen the schema; existing columns missing
    /// from a row default to null on read.
    pub fn insert_rows(&mut self, rows: Vec<TableRow>) -> Result<()> {
        let mut schema = self.columns.clone();
        let mut batch_ids: HashMap<&str, ()> = HashMap::with_capacity(rows.len());

        for row in &rows {
            if self.rows.contains_key(&row.id) || batch_ids.insert(&row.id, ()).is_some() {
                return Err(GeographError::DuplicateId {
                    id: row.id.clone(),
                    scope: self.name.clone(),
                });
            }
            crate::geometry::validate(&row.id, &row.geometry)?;
            for (column, value) in &row.attrs {
                self.check_not_reserved(column)?;
                Self::check_kind(&self.name, &mut schema, column, value)?;
            }
        }

        self.columns = schema;
        for row in rows {
            self.order.push(row.id.clone());
            self.rows.insert(
                row.id,
                Row {
                    geometry: row.geometry,
                    attrs: row.attrs,
                },
            );
        }
        Ok(())
    }

    /// Drop a batch of rows atomically. Any missing id fails the whole call.
    pub fn drop_rows(&mut self, ids: &[String]) -> Result<()> {
        for id in ids {
            if !self.rows.contains_key(id) {
                return Err(GeographError::UnknownId {
                    id: id.clone(),
                    scope: self.name.clone(),
                });
            }
        }
        for id in ids {
            self.rows.remove(id);
        }
        self.order.retain(|id| !ids.contains(id));
        Ok(())
    }

    /// Look up a row.
    pub fn get_row(&self, id: &str) -> Option<&Row> {
        self.rows.get(id)
    }

    /// Look up one cell. `None` means the row does not exist; a missing
    /// attribute on an existing row reads as null.
    pub fn get_cell(&self, id: &str, column: &str) -> Option<&Value> {
        self.rows
            .get(id)
            .map(|row| row.attrs.get(column).unwrap_or(&Value::Null))
    }

    /// Write one cell. Unknown columns widen the schema.
    pub fn set_cell(&mut self, id: &str, column: &str, value: Value) -> Result<()> {
        self.check_not_reserved(column)?;
        if !self.rows.contains_key(id) {
            return Err(GeographError::UnknownId {
                id: id.to_string(),
                scope: self.name.clone(),
            });
        }
        Self::check_kind(&self.name, &mut self.columns, column, &value)?;
        self.rows
            .get_mut(id)
            .expect("row presence checked above")
            .attrs
            .insert(column.to_string(), value);
        Ok(())
    }

    /// Whether a row exists.
    pub fn has_row(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in insertion order.
    pub fn iter_rows(&self) -> impl Iterator<Item = (&str, &Row)> {
        self.order
            .iter()
            .map(|id| (id.as_str(), &self.rows[id.as_str()]))
    }

    /// Row ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Insertion position of a row.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|r| r == id)
    }

    /// Known columns and their pinned kinds.
    pub fn columns(&self) -> &BTreeMap<String, ColumnKind> {
        &self.columns
    }

    // ------------------------------------------------------------------------
    // Schema evolution
    // ------------------------------------------------------------------------

    /// Add a column, filling every existing row with `default`.
    pub fn add_column(&mut self, column: &str, default: Value) -> Result<()> {
        self.check_not_reserved(column)?;
        if self.columns.contains_key(column) {
            return Err(GeographError::ColumnExists {
                column: column.to_string(),
                table: self.name.clone(),
            });
        }
        self.columns.insert(column.to_string(), kind_of(&default));
        for row in self.rows.values_mut() {
            row.attrs.insert(column.to_string(), default.clone());
        }
        Ok(())
    }

    /// Rename a column in the schema and in every row.
    pub fn rename_column(&mut self, from: &str, to: &str) -> Result<()> {
        self.check_not_reserved(from)?;
        self.check_not_reserved(to)?;
        let kind = self
            .columns
            .remove(from)
            .ok_or_else(|| GeographError::UnknownColumn {
                column: from.to_string(),
                table: self.name.clone(),
            })?;
        if self.columns.contains_key(to) {
            self.columns.insert(from.to_string(), kind);
            return Err(GeographError::ColumnExists {
                column: to.to_string(),
                table: self.name.clone(),
            });
        }
        self.columns.insert(to.to_string(), kind);
        for row in self.rows.values_mut() {
            if let Some(value) = row.attrs.remove(from) {
                row.attrs.insert(to.to_string(), value);
            }
        }
        Ok(())
    }

    /// Drop a column from the schema and from every row.
    pub fn drop_column(&mut self, column: &str) -> Result<()> {
        self.check_not_reserved(column)?;
        if self.columns.remove(column).is_none() {
            return Err(GeographError::UnknownColumn {
                column: column.to_string(),
                table: self.name.clone(),
            });
        }
        for row in self.rows.values_mut() {
            row.attrs.remove(column);
        }
        Ok(())
    }

    /// Require a column to exist, for schema checks by collaborators.
    pub fn require_column(&self, column: &str) -> Result<()> {
        if self.columns.contains_key(column) {
            Ok(())
        } else {
            Err(GeographError::MissingColumn {
                column: column.to_string(),
                table: self.name.clone(),
            })
        }
    }

    /// Restore the schema from the wire; used by persistence so empty tables
    /// keep their columns across a round-trip.
    pub(crate) fn restore_columns(&mut self, columns: BTreeMap<String, ColumnKind>) {
        self.columns = columns;
    }

    /// Replace one row's geometry; used by the connector when reprojecting.
    pub(crate) fn set_geometry(&mut self, id: &str, geometry: Geometry<f64>) -> Result<()> {
        let row = self.rows.get_mut(id).ok_or_else(|| GeographError::UnknownId {
            id: id.to_string(),
            scope: self.name.clone(),
        })?;
        row.geometry = geometry;
        Ok(())
    }

    fn check_not_reserved(&self, column: &str) -> Result<()> {
        if column == "geometry" || column == self.id_column {
            return Err(GeographError::ReservedColumn {
                column: column.to_string(),
                table: self.name.clone(),
            });
        }
        Ok(())
    }

    fn check_kind(
        table: &str,
        schema: &mut BTreeMap<String, ColumnKind>,
        column: &str,
        value: &Value,
    ) -> Result<()> {
        let kind = kind_of(value);
        match schema.get(column).copied() {
            None => {
                schema.insert(column.to_string(), kind);
                Ok(())
            }
            Some(ColumnKind::Null) => {
                if kind != ColumnKind::Null {
                    schema.insert(column.to_string(), kind);
                }
                Ok(())
            }
            Some(existing) => {
                if kind == ColumnKind::Null || kind == existing {
                    Ok(())
                } else {
                    Err(GeographError::ColumnKindMismatch {
                        column: column.to_string(),
                        table: table.to_string(),
                        expected: existing.to_string(),
                        actual: kind.to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;
    use serde_json::json;

    fn square(offset: f64) -> Geometry<f64> {
        Geometry::Polygon(polygon![
            (x: offset, y: offset),
            (x: offset + 1.0, y: offset),
            (x: offset + 1.0, y: offset + 1.0),
            (x: offset, y: offset + 1.0),
            (x: offset, y: offset),
        ])
    }

    fn row(id: &str, attrs: &[(&str, Value)]) -> TableRow {
        TableRow {
            id: id.to_string(),
            geometry: square(0.0),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }

    #[test]
    fn test_insert_and_iterate_in_order() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        table
            .insert_rows(vec![
                row("b", &[("type", json!("field"))]),
                row("a", &[("type", json!("lake"))]),
            ])
            .unwrap();

        let ids: Vec<&str> = table.iter_rows().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(table.position("a"), Some(1));
    }

    #[test]
    fn test_duplicate_id_in_batch_is_atomic() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        let err = table
            .insert_rows(vec![row("a", &[]), row("a", &[])])
            .unwrap_err();
        assert!(matches!(err, GeographError::DuplicateId { .. }));
        assert!(table.is_empty());
    }

    #[test]
    fn test_kind_mismatch_is_atomic() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        table
            .insert_rows(vec![row("a", &[("type", json!("field"))])])
            .unwrap();

        let err = table
            .insert_rows(vec![
                row("b", &[("type", json!("lake"))]),
                row("c", &[("type", json!(3))]),
            ])
            .unwrap_err();
        assert!(matches!(err, GeographError::ColumnKindMismatch { .. }));
        assert_eq!(table.len(), 1);
        assert!(!table.has_row("b"));
    }

    #[test]
    fn test_missing_value_reads_as_null() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        table
            .insert_rows(vec![
                row("a", &[("type", json!("field"))]),
                row("b", &[]),
            ])
            .unwrap();
        assert_eq!(table.get_cell("b", "type"), Some(&Value::Null));
        assert_eq!(table.get_cell("ghost", "type"), None);
    }

    #[test]
    fn test_null_then_concrete_pins_kind() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        table.insert_rows(vec![row("a", &[("src", json!(null))])]).unwrap();
        table.insert_rows(vec![row("b", &[("src", json!("S2"))])]).unwrap();
        let err = table
            .insert_rows(vec![row("c", &[("src", json!(1))])])
            .unwrap_err();
        assert!(matches!(err, GeographError::ColumnKindMismatch { .. }));
    }

    #[test]
    fn test_drop_rows_atomic() {
        let mut table = AttributeTable::new("rasters", "raster_name");
        table.insert_rows(vec![row("a", &[]), row("b", &[])]).unwrap();

        let err = table
            .drop_rows(&["a".to_string(), "ghost".to_string()])
            .unwrap_err();
        assert!(matches!(err, GeographError::UnknownId { .. }));
        assert_eq!(table.len(), 2);

        table.drop_rows(&["a".to_string()]).unwrap();
        assert!(!table.has_row("a"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_set_cell_widens_schema() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        table.insert_rows(vec![row("a", &[])]).unwrap();
        table.set_cell("a", "score", json!(0.5)).unwrap();
        assert_eq!(table.columns()["score"], ColumnKind::Number);
        assert_eq!(table.get_cell("a", "score"), Some(&json!(0.5)));
    }

    #[test]
    fn test_reserved_columns_rejected() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        table.insert_rows(vec![row("a", &[])]).unwrap();

        let err = table.set_cell("a", "geometry", json!("nope")).unwrap_err();
        assert!(matches!(err, GeographError::ReservedColumn { .. }));
        let err = table
            .insert_rows(vec![row("b", &[("feature_name", json!("x"))])])
            .unwrap_err();
        assert!(matches!(err, GeographError::ReservedColumn { .. }));
    }

    #[test]
    fn test_rename_and_drop_column() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        table
            .insert_rows(vec![row("a", &[("type", json!("field"))])])
            .unwrap();

        table.rename_column("type", "class").unwrap();
        assert_eq!(table.get_cell("a", "class"), Some(&json!("field")));
        assert_eq!(table.get_cell("a", "type"), Some(&Value::Null));
        assert!(table.require_column("type").is_err());

        table.drop_column("class").unwrap();
        assert!(table.columns().is_empty());
        assert_eq!(table.get_cell("a", "class"), Some(&Value::Null));
    }

    #[test]
    fn test_rename_to_existing_column_fails() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        table
            .insert_rows(vec![row("a", &[("x", json!(1)), ("y", json!(2))])])
            .unwrap();
        let err = table.rename_column("x", "y").unwrap_err();
        assert!(matches!(err, GeographError::ColumnExists { .. }));
        // schema unchanged after the failed rename
        assert!(table.require_column("x").is_ok());
    }

    #[test]
    fn test_add_column_fills_existing_rows() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        table.insert_rows(vec![row("a", &[]), row("b", &[])]).unwrap();
        table.add_column("prob_of_class_field", json!(0.0)).unwrap();
        assert_eq!(table.get_cell("b", "prob_of_class_field"), Some(&json!(0.0)));
    }

    #[test]
    fn test_empty_like_keeps_schema() {
        let mut table = AttributeTable::new("vectors", "feature_name");
        table
            .insert_rows(vec![row("a", &[("type", json!("field"))])])
            .unwrap();
        let empty = table.empty_like();
        assert!(empty.is_empty());
        assert_eq!(empty.columns(), table.columns());
    }
}
