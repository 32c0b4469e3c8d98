//! Connector serialization.
//!
//! Storage layout inside a data directory `D`:
//!
//! ```text
//! D/
//! ├── rasters/            # raster files (owned by the caller)
//! ├── labels/             # label files (owned by label makers)
//! └── connector/
//!     ├── vectors.geojson # vectors table, GeoJSON feature collection
//!     ├── rasters.geojson # rasters table, GeoJSON feature collection
//!     ├── graph.json      # bipartite graph wire format
//!     ├── attrs.json      # dataset attrs + format version
//!     └── failures.json   # failed download attempts (absent when none)
//! ```
//!
//! Writes are atomic at the directory level: every file goes to a `.tmp`
//! sibling first, and the renames happen only after all writes succeeded.
//! The spatial index is not persisted; it is bulk-loaded from the table
//! geometries on load.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::collaborators::DownloadFailure;
use crate::connector::{
    Connector, DatasetAttrs, CONNECTOR_DIR_NAME, DEFAULT_CRS_EPSG, RASTER_ID_COLUMN,
    VECTOR_ID_COLUMN,
};
use crate::errors::{GeographError, Result};
use crate::geometry;
use crate::graph::{BipartiteGraph, WireGraph};
use crate::index::SpatialIndex;
use crate::table::{AttributeTable, ColumnKind, TableRow};

/// Filename of the serialized vectors table.
pub const VECTORS_FILENAME: &str = "vectors.geojson";

/// Filename of the serialized rasters table.
pub const RASTERS_FILENAME: &str = "rasters.geojson";

/// Filename of the serialized graph.
pub const GRAPH_FILENAME: &str = "graph.json";

/// Filename of the dataset attributes.
pub const ATTRS_FILENAME: &str = "attrs.json";

/// Filename of the download-failure records.
pub const FAILURES_FILENAME: &str = "failures.json";

/// Version written to `attrs.json`; a different on-disk version is an error.
pub const FORMAT_VERSION: u32 = 1;

// ============================================================================
// Wire structs
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct WireAttrs {
    format_version: u32,
    #[serde(flatten)]
    attrs: DatasetAttrs,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFeature {
    #[serde(rename = "type")]
    kind: String,
    geometry: Value,
    properties: JsonMap<String, Value>,
}

/// GeoJSON-style feature collection with the row id in a dedicated property
/// column. An empty table serializes as an explicit empty collection.
#[derive(Debug, Serialize, Deserialize)]
struct WireCollection {
    #[serde(rename = "type")]
    kind: String,
    id_column: String,
    columns: BTreeMap<String, ColumnKind>,
    features: Vec<WireFeature>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFailures {
    failures: Vec<DownloadFailure>,
}

// ============================================================================
// Save
// ============================================================================

/// Write a connector to its data directory.
pub(crate) fn save(connector: &Connector) -> Result<()> {
    let connector_dir = connector.connector_dir();
    fs::create_dir_all(&connector_dir)?;

    let files = [
        (
            connector_dir.join(VECTORS_FILENAME),
            serde_json::to_string_pretty(&table_to_wire(&connector.vectors))?,
        ),
        (
            connector_dir.join(RASTERS_FILENAME),
            serde_json::to_string_pretty(&table_to_wire(&connector.rasters))?,
        ),
        (
            connector_dir.join(GRAPH_FILENAME),
            serde_json::to_string_pretty(&connector.graph.to_wire())?,
        ),
        (
            connector_dir.join(ATTRS_FILENAME),
            serde_json::to_string_pretty(&WireAttrs {
                format_version: FORMAT_VERSION,
                attrs: connector.attrs.clone(),
            })?,
        ),
    ];

    // write everything to .tmp siblings, then rename; a failure mid-write
    // leaves the previous save intact
    for (path, content) in &files {
        fs::write(tmp_path(path), content)?;
    }
    if connector.failures.is_empty() {
        match fs::remove_file(connector_dir.join(FAILURES_FILENAME)) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    } else {
        let wire = WireFailures {
            failures: connector.failures.values().cloned().collect(),
        };
        let path = connector_dir.join(FAILURES_FILENAME);
        fs::write(tmp_path(&path), serde_json::to_string_pretty(&wire)?)?;
        fs::rename(tmp_path(&path), &path)?;
    }
    for (path, _) in &files {
        fs::rename(tmp_path(path), path)?;
    }

    tracing::info!(
        dir = %connector_dir.display(),
        vectors = connector.vectors.len(),
        rasters = connector.rasters.len(),
        edges = connector.graph.edge_count(),
        "saved connector"
    );
    Ok(())
}

// ============================================================================
// Load
// ============================================================================

/// Read a connector from a data directory.
///
/// A directory with none of the component files is a valid empty connector;
/// partial presence is an inconsistency error.
pub(crate) fn load(data_dir: &Path) -> Result<Connector> {
    let connector_dir = data_dir.join(CONNECTOR_DIR_NAME);
    let component_files = [
        VECTORS_FILENAME,
        RASTERS_FILENAME,
        GRAPH_FILENAME,
        ATTRS_FILENAME,
    ];
    let missing: Vec<&str> = component_files
        .iter()
        .filter(|name| !connector_dir.join(name).exists())
        .copied()
        .collect();

    if missing.len() == component_files.len() {
        tracing::info!(dir = %data_dir.display(), "no connector files found, starting empty");
        return Connector::from_scratch(data_dir, DEFAULT_CRS_EPSG, Vec::new(), None);
    }
    if !missing.is_empty() {
        return Err(GeographError::DataDirInconsistent {
            connector_dir,
            missing: missing.join(", "),
        });
    }

    let attrs_path = connector_dir.join(ATTRS_FILENAME);
    let wire_attrs: WireAttrs = read_json(&attrs_path)?;
    if wire_attrs.format_version != FORMAT_VERSION {
        return Err(GeographError::UnsupportedFormatVersion {
            path: attrs_path,
            found: wire_attrs.format_version,
            expected: FORMAT_VERSION,
        });
    }
    wire_attrs.attrs.validate()?;

    let vectors = read_table(
        &connector_dir.join(VECTORS_FILENAME),
        "vectors",
        VECTOR_ID_COLUMN,
    )?;
    let rasters = read_table(
        &connector_dir.join(RASTERS_FILENAME),
        "rasters",
        RASTER_ID_COLUMN,
    )?;

    let graph_path = connector_dir.join(GRAPH_FILENAME);
    let wire_graph: WireGraph = read_json(&graph_path)?;
    let graph =
        BipartiteGraph::from_wire(wire_graph).map_err(|err| GeographError::CorruptConnectorFile {
            path: graph_path,
            message: err.to_string(),
        })?;

    let bounds = vectors
        .iter_rows()
        .chain(rasters.iter_rows())
        .map(|(id, row)| Ok((id.to_string(), geometry::bounds(id, &row.geometry)?)))
        .collect::<Result<Vec<_>>>()?;
    let index = SpatialIndex::bulk_load(bounds)?;

    let failures_path = connector_dir.join(FAILURES_FILENAME);
    let failures = if failures_path.exists() {
        let wire: WireFailures = read_json(&failures_path)?;
        wire.failures
            .into_iter()
            .map(|f| (f.raster_id.clone(), f))
            .collect()
    } else {
        BTreeMap::new()
    };

    tracing::debug!(
        dir = %data_dir.display(),
        vectors = vectors.len(),
        rasters = rasters.len(),
        edges = graph.edge_count(),
        "loaded connector"
    );

    Ok(Connector {
        data_dir: data_dir.to_path_buf(),
        attrs: wire_attrs.attrs,
        vectors,
        rasters,
        graph,
        index,
        failures,
    })
}

// ============================================================================
// Helpers
// ============================================================================

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|err| GeographError::CorruptConnectorFile {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

fn table_to_wire(table: &AttributeTable) -> WireCollection {
    let features = table
        .iter_rows()
        .map(|(id, row)| {
            let mut properties = JsonMap::new();
            properties.insert(table.id_column().to_string(), Value::String(id.to_string()));
            for (key, value) in &row.attrs {
                properties.insert(key.clone(), value.clone());
            }
            WireFeature {
                kind: "Feature".to_string(),
                geometry: geometry::to_geojson(&row.geometry),
                properties,
            }
        })
        .collect();
    WireCollection {
        kind: "FeatureCollection".to_string(),
        id_column: table.id_column().to_string(),
        columns: table.columns().clone(),
        features,
    }
}

fn read_table(path: &Path, name: &str, id_column: &str) -> Result<AttributeTable> {
    let wire: WireCollection = read_json(path)?;
    let corrupt = |message: String| GeographError::CorruptConnectorFile {
        path: path.to_path_buf(),
        message,
    };

    let mut rows = Vec::with_capacity(wire.features.len());
    for feature in wire.features {
        let id = feature
            .properties
            .get(&wire.id_column)
            .and_then(Value::as_str)
            .ok_or_else(|| corrupt(format!("feature without `{}` property", wire.id_column)))?
            .to_string();
        let geometry = geometry::from_geojson(&id, &feature.geometry)
            .map_err(|err| corrupt(err.to_string()))?;
        let attrs: BTreeMap<String, Value> = feature
            .properties
            .into_iter()
            .filter(|(key, _)| key != &wire.id_column)
            .collect();
        rows.push(TableRow {
            id,
            geometry,
            attrs,
        });
    }

    let mut table = AttributeTable::new(name, id_column);
    table
        .insert_rows(rows)
        .map_err(|err| corrupt(err.to_string()))?;
    table.restore_columns(wire.columns);
    Ok(table)
}
