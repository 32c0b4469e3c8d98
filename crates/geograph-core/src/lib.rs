//! # geograph-core
//!
//! Core library binding two georeferenced tabular relations, vector
//! features and rasters, into one consistent object-centric dataset.
//!
//! The central structure is the containment/intersection bipartite graph
//! maintained between the two relations: its edges reflect the geometric
//! truth of the tables at every moment, under arbitrary incremental
//! mutation, while an R-tree keeps candidate discovery fast enough for
//! interactive dataset building.
//!
//! ## Main Types
//!
//! - [`Connector`] – the orchestrator and single entry point for mutation
//! - [`BipartiteGraph`] – the authoritative relation between rasters and features
//! - [`AttributeTable`] – the tabular store backing `vectors` and `rasters`
//! - [`GeographError`] – domain-specific error type
//!
//! ## Modules
//!
//! - [`connector`] – the Connector implementation and public contract
//! - [`collaborators`] – downloader / label-maker capability traits
//! - [`geometry`] – geometry adapter (predicates, validation, reprojection)
//! - [`graph`] – the bipartite relation graph
//! - [`index`] – the spatial index
//! - [`table`] – the tabular store
//! - [`persistence`] – wire formats and the save/load round-trip
//!
//! ## Example
//!
//! ```ignore
//! use geograph_core::{Connector, RasterRecord, VectorRecord};
//!
//! let mut connector = Connector::from_scratch("data", 4326, vec![], None)?;
//! connector.add_rasters(vec![RasterRecord::new("scene_0", footprint)], None)?;
//! connector.add_vectors(vec![VectorRecord::new("field_7", geometry)], None)?;
//!
//! assert_eq!(connector.rasters_containing("field_7")?, vec!["scene_0"]);
//! connector.save()?;
//! ```

// Modules
pub mod collaborators;
pub mod connector;
pub mod errors;
pub mod geometry;
pub mod graph;
pub mod index;
pub mod persistence;
pub mod table;

// Re-exports for convenience
pub use collaborators::{
    DownloadError, DownloadFailure, DownloadParams, DownloadReport, LabelMaker, RasterDownloader,
};
pub use connector::{
    Connector, DatasetAttrs, LabelMode, RasterRecord, VectorRecord, CLASS_PROB_PREFIX,
    CONNECTOR_DIR_NAME, DEFAULT_CRS_EPSG, DEFAULT_TASK_CLASS, LABELS_DIR_NAME, RASTERS_DIR_NAME,
    RASTER_COUNT_COLUMN, RASTER_ID_COLUMN, TYPE_COLUMN, VECTOR_ID_COLUMN,
};
pub use errors::{GeographError, Result};
pub use geometry::{FootprintRelation, EPSG_WEB_MERCATOR, EPSG_WGS84};
pub use graph::{BipartiteGraph, EdgeLabel, EdgeRecord, VertexKind, WireEdge, WireGraph, WireVertex};
pub use index::SpatialIndex;
pub use persistence::{
    ATTRS_FILENAME, FAILURES_FILENAME, FORMAT_VERSION, GRAPH_FILENAME, RASTERS_FILENAME,
    VECTORS_FILENAME,
};
pub use table::{AttributeTable, ColumnKind, Row, TableRow};
