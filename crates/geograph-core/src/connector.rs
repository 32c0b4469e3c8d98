//! The connector: one consistent object-centric dataset.
//!
//! A [`Connector`] binds two georeferenced tabular relations, vector
//! features and rasters, through a bipartite containment/intersection graph.
//! It owns the tables, the spatial index, and the graph, and is the only
//! writer to all three: every mutation reprojects incoming geometries into
//! the canonical CRS, narrows candidate pairs through the index, classifies
//! them with precise predicates, and keeps the derived `raster_count` column
//! in step with the edge set.
//!
//! Mutating calls are all-or-nothing: every fallible check runs before the
//! first state write. The one documented exception is
//! [`Connector::download_rasters`], where per-item partial success is kept so
//! a crashed download does not discard hours of completed ones.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use geo::{Geometry, Rect};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map as JsonMap, Value};
use tracing::{debug, info, warn};

use crate::collaborators::{
    DownloadFailure, DownloadParams, DownloadReport, LabelMaker, RasterDownloader,
};
use crate::errors::{GeographError, Result};
use crate::geometry::{self, FootprintRelation};
use crate::graph::{BipartiteGraph, EdgeLabel, VertexKind};
use crate::index::SpatialIndex;
use crate::table::{AttributeTable, TableRow};

// ============================================================================
// Constants
// ============================================================================

/// Default canonical CRS (WGS84).
pub const DEFAULT_CRS_EPSG: u32 = geometry::EPSG_WGS84;

/// Default task class when none are given.
pub const DEFAULT_TASK_CLASS: &str = "object";

/// Derived per-feature column counting incoming `contains` edges.
pub const RASTER_COUNT_COLUMN: &str = "raster_count";

/// Class-label column used in categorical label mode.
pub const TYPE_COLUMN: &str = "type";

/// Per-class probability column prefix used in soft-categorical label mode.
pub const CLASS_PROB_PREFIX: &str = "prob_of_class_";

/// Wire property holding the feature id.
pub const VECTOR_ID_COLUMN: &str = "feature_name";

/// Wire property holding the raster id.
pub const RASTER_ID_COLUMN: &str = "raster_name";

/// Subdirectory of the data dir holding raster files (owned by the caller).
pub const RASTERS_DIR_NAME: &str = "rasters";

/// Subdirectory of the data dir holding label files (owned by label makers).
pub const LABELS_DIR_NAME: &str = "labels";

/// Subdirectory of the data dir holding the connector component files.
pub const CONNECTOR_DIR_NAME: &str = "connector";

// ============================================================================
// Dataset attributes
// ============================================================================

/// Dataset-wide attributes, persisted as `attrs.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetAttrs {
    /// EPSG code of the canonical CRS all geometries are stored in.
    pub crs_epsg: u32,
    /// Vector feature classes the machine-learning task predicts.
    pub task_classes: Vec<String>,
    /// Class for features that define background regions, outside the task.
    pub background_class: Option<String>,
    /// Free-form user attributes, preserved across round-trips.
    #[serde(flatten)]
    pub extra: JsonMap<String, Value>,
}

impl DatasetAttrs {
    /// Check class lists for duplicates and task/background collisions.
    pub fn validate(&self) -> Result<()> {
        let unique: HashSet<&str> = self.task_classes.iter().map(String::as_str).collect();
        if unique.len() != self.task_classes.len() {
            return Err(GeographError::InvalidAttrs {
                reason: "task_classes contains duplicates".to_string(),
            });
        }
        if let Some(background) = &self.background_class {
            if unique.contains(background.as_str()) {
                return Err(GeographError::InvalidAttrs {
                    reason: format!("background class `{background}` is also a task class"),
                });
            }
        }
        Ok(())
    }
}

/// Label-making mode, deciding which columns the vectors table must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMode {
    /// One categorical class per feature, in the `type` column.
    Categorical,
    /// Per-class probabilities, one `prob_of_class_<C>` column per task class.
    SoftCategorical,
}

// ============================================================================
// Input records
// ============================================================================

/// A vector feature to insert through [`Connector::add_vectors`].
#[derive(Debug, Clone)]
pub struct VectorRecord {
    /// Unique id, disjoint from raster ids.
    pub id: String,
    /// Feature geometry (point, polygon, or multipolygon).
    pub geometry: Geometry<f64>,
    /// EPSG code the geometry is expressed in; `None` asserts the canonical
    /// CRS.
    pub epsg: Option<u32>,
    /// Free-form attributes.
    pub attrs: BTreeMap<String, Value>,
}

impl VectorRecord {
    /// New record with no attributes, in the canonical CRS.
    pub fn new(id: impl Into<String>, geometry: Geometry<f64>) -> Self {
        Self {
            id: id.into(),
            geometry,
            epsg: None,
            attrs: BTreeMap::new(),
        }
    }

    /// Declare the CRS the geometry is expressed in.
    pub fn with_epsg(mut self, epsg: u32) -> Self {
        self.epsg = Some(epsg);
        self
    }

    /// Set the categorical class (`type` column).
    pub fn with_class(self, class: impl Into<String>) -> Self {
        self.with_attr(TYPE_COLUMN, json!(class.into()))
    }

    /// Set one attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

/// A raster to insert through [`Connector::add_rasters`].
#[derive(Debug, Clone)]
pub struct RasterRecord {
    /// Unique id, typically the on-disk basename stem.
    pub id: String,
    /// The raster footprint polygon.
    pub geometry: Geometry<f64>,
    /// EPSG code the footprint is expressed in; `None` asserts the canonical
    /// CRS.
    pub epsg: Option<u32>,
    /// Free-form metadata (timestamps, provenance, band info).
    pub attrs: BTreeMap<String, Value>,
}

impl RasterRecord {
    /// New record with no attributes, in the canonical CRS.
    pub fn new(id: impl Into<String>, geometry: Geometry<f64>) -> Self {
        Self {
            id: id.into(),
            geometry,
            epsg: None,
            attrs: BTreeMap::new(),
        }
    }

    /// Declare the CRS the footprint is expressed in.
    pub fn with_epsg(mut self, epsg: u32) -> Self {
        self.epsg = Some(epsg);
        self
    }

    /// Set one attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: Value) -> Self {
        self.attrs.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Vectors,
    Rasters,
}

struct PreparedRow {
    id: String,
    geometry: Geometry<f64>,
    rect: Rect<f64>,
    attrs: BTreeMap<String, Value>,
}

// ============================================================================
// Connector
// ============================================================================

/// Object-centric dataset of vector features and rasters.
#[derive(Debug, Clone)]
pub struct Connector {
    pub(crate) data_dir: PathBuf,
    pub(crate) attrs: DatasetAttrs,
    pub(crate) vectors: AttributeTable,
    pub(crate) rasters: AttributeTable,
    pub(crate) graph: BipartiteGraph,
    pub(crate) index: SpatialIndex,
    /// Failed download attempts, keyed by raster id (or requesting feature
    /// id when no raster id exists). Not part of the spatial index.
    pub(crate) failures: BTreeMap<String, DownloadFailure>,
}

impl Connector {
    // ------------------------------------------------------------------------
    // Construction
    // ------------------------------------------------------------------------

    /// Create a new, empty connector for a data directory.
    ///
    /// Nothing is written to disk until [`Connector::save`]. An empty
    /// `task_classes` defaults to the single class
    /// [`DEFAULT_TASK_CLASS`].
    pub fn from_scratch(
        data_dir: impl Into<PathBuf>,
        crs_epsg: u32,
        task_classes: Vec<String>,
        background_class: Option<String>,
    ) -> Result<Self> {
        let task_classes = if task_classes.is_empty() {
            vec![DEFAULT_TASK_CLASS.to_string()]
        } else {
            task_classes
        };
        Self::with_attrs(
            data_dir,
            DatasetAttrs {
                crs_epsg,
                task_classes,
                background_class,
                extra: JsonMap::new(),
            },
        )
    }

    /// Create a new, empty connector with explicit dataset attributes.
    pub fn with_attrs(data_dir: impl Into<PathBuf>, attrs: DatasetAttrs) -> Result<Self> {
        attrs.validate()?;
        let mut vectors = AttributeTable::new("vectors", VECTOR_ID_COLUMN);
        vectors.add_column(RASTER_COUNT_COLUMN, json!(0))?;
        Ok(Self {
            data_dir: data_dir.into(),
            attrs,
            vectors,
            rasters: AttributeTable::new("rasters", RASTER_ID_COLUMN),
            graph: BipartiteGraph::new(),
            index: SpatialIndex::new(),
            failures: BTreeMap::new(),
        })
    }

    /// Load a connector previously saved to a data directory.
    pub fn from_data_dir(data_dir: impl Into<PathBuf>) -> Result<Self> {
        crate::persistence::load(&data_dir.into())
    }

    /// Save the connector to its data directory.
    ///
    /// Runs the consistency audit first; the component files are written to
    /// `.tmp` siblings and renamed only after every write succeeded.
    pub fn save(&self) -> Result<()> {
        self.check_consistency()?;
        crate::persistence::save(self)
    }

    /// An empty connector with the same attrs and table schemas, for a new
    /// data directory.
    pub fn empty_like(&self, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            attrs: self.attrs.clone(),
            vectors: self.vectors.empty_like(),
            rasters: self.rasters.empty_like(),
            graph: BipartiteGraph::new(),
            index: SpatialIndex::new(),
            failures: BTreeMap::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Read-only views and paths
    // ------------------------------------------------------------------------

    /// The vectors table.
    pub fn vectors(&self) -> &AttributeTable {
        &self.vectors
    }

    /// The rasters table.
    pub fn rasters(&self) -> &AttributeTable {
        &self.rasters
    }

    /// The containment/intersection graph.
    pub fn graph(&self) -> &BipartiteGraph {
        &self.graph
    }

    /// Dataset-wide attributes.
    pub fn attrs(&self) -> &DatasetAttrs {
        &self.attrs
    }

    /// EPSG code of the canonical CRS.
    pub fn crs_epsg(&self) -> u32 {
        self.attrs.crs_epsg
    }

    /// Recorded failed download attempts.
    pub fn failures(&self) -> &BTreeMap<String, DownloadFailure> {
        &self.failures
    }

    /// The data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Directory holding raster files (owned by the caller).
    pub fn rasters_dir(&self) -> PathBuf {
        self.data_dir.join(RASTERS_DIR_NAME)
    }

    /// Directory holding label files (owned by label makers).
    pub fn labels_dir(&self) -> PathBuf {
        self.data_dir.join(LABELS_DIR_NAME)
    }

    /// Directory holding the connector component files.
    pub fn connector_dir(&self) -> PathBuf {
        self.data_dir.join(CONNECTOR_DIR_NAME)
    }

    /// Path of a raster file, without extension.
    pub fn raster_path(&self, raster_id: &str) -> PathBuf {
        self.rasters_dir().join(raster_id)
    }

    /// Path of a label file, without extension.
    pub fn label_path(&self, raster_id: &str) -> PathBuf {
        self.labels_dir().join(raster_id)
    }

    // ------------------------------------------------------------------------
    // Mutation: vectors
    // ------------------------------------------------------------------------

    /// Add vector features.
    ///
    /// Geometries are reprojected into the canonical CRS; edges to all
    /// overlapping rasters are created with the correct label, and each new
    /// feature's `raster_count` is materialized. With a label maker, labels
    /// of every raster touching a new feature are recomputed afterwards.
    pub fn add_vectors(
        &mut self,
        records: Vec<VectorRecord>,
        label_maker: Option<&mut dyn LabelMaker>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let entries = records
            .into_iter()
            .map(|r| (r.id, r.geometry, r.epsg, r.attrs))
            .collect();
        let prepared = self.prepare_batch(entries, Side::Vectors)?;
        info!(count = prepared.len(), "adding vector features");

        let rows = prepared
            .iter()
            .map(|p| {
                let mut attrs = p.attrs.clone();
                attrs.insert(RASTER_COUNT_COLUMN.to_string(), json!(0));
                TableRow {
                    id: p.id.clone(),
                    geometry: p.geometry.clone(),
                    attrs,
                }
            })
            .collect();
        self.vectors.insert_rows(rows)?;

        for p in &prepared {
            self.index.insert(&p.id, &p.rect)?;
            self.graph.add_vertex(&p.id, VertexKind::Vector)?;

            let mut candidates: Vec<String> = self
                .index
                .query(&p.rect)
                .into_iter()
                .filter(|id| self.rasters.has_row(id))
                .collect();
            candidates.sort_by_key(|id| self.rasters.position(id));

            let mut contains_count = 0i64;
            for raster_id in candidates {
                let relation = {
                    let footprint = &self
                        .rasters
                        .get_row(&raster_id)
                        .expect("candidate filtered against rasters table")
                        .geometry;
                    geometry::classify_footprint(footprint, &p.geometry)
                };
                match relation {
                    FootprintRelation::Contains => {
                        self.graph
                            .add_edge(&raster_id, &p.id, EdgeLabel::Contains, JsonMap::new())?;
                        contains_count += 1;
                    }
                    FootprintRelation::Intersects => {
                        self.graph
                            .add_edge(&raster_id, &p.id, EdgeLabel::Intersects, JsonMap::new())?;
                    }
                    FootprintRelation::Disjoint => {}
                }
            }
            self.vectors
                .set_cell(&p.id, RASTER_COUNT_COLUMN, json!(contains_count))?;
            debug!(feature = %p.id, contains = contains_count, "connected feature");
        }

        if let Some(label_maker) = label_maker {
            let mut affected = Vec::new();
            for p in &prepared {
                for raster_id in self.graph.neighbors(&p.id, None)? {
                    if !affected.contains(&raster_id) {
                        affected.push(raster_id);
                    }
                }
            }
            self.recompute_labels(label_maker, &affected)?;
        }
        Ok(())
    }

    /// Drop vector features, their index entries, and all incident edges.
    pub fn drop_vectors(
        &mut self,
        ids: &[String],
        label_maker: Option<&mut dyn LabelMaker>,
    ) -> Result<()> {
        let ids = dedupe(ids);
        for id in &ids {
            if !self.vectors.has_row(id) {
                return Err(GeographError::UnknownId {
                    id: id.clone(),
                    scope: "vectors".to_string(),
                });
            }
        }
        info!(count = ids.len(), "dropping vector features");

        let mut affected = Vec::new();
        for id in &ids {
            for raster_id in self.graph.neighbors(id, None)? {
                if !affected.contains(&raster_id) {
                    affected.push(raster_id);
                }
            }
        }
        for id in &ids {
            self.graph.remove_vertex(id)?;
            self.index.remove(id)?;
        }
        self.vectors.drop_rows(&ids)?;

        if let Some(label_maker) = label_maker {
            self.recompute_labels(label_maker, &affected)?;
        }
        Ok(())
    }

    /// Rewrite one feature's geometry.
    ///
    /// Modeled as drop + re-add of the same attribute row, so that all edges
    /// and the `raster_count` column are recomputed from scratch.
    pub fn update_vector_geometry(
        &mut self,
        id: &str,
        geometry: Geometry<f64>,
        epsg: Option<u32>,
    ) -> Result<()> {
        let row = self
            .vectors
            .get_row(id)
            .ok_or_else(|| GeographError::UnknownId {
                id: id.to_string(),
                scope: "vectors".to_string(),
            })?;
        let mut attrs = row.attrs.clone();
        attrs.remove(RASTER_COUNT_COLUMN);

        // validate the replacement before touching any state
        geometry::validate(id, &geometry)?;
        let from = epsg.unwrap_or(self.attrs.crs_epsg);
        let canonical = geometry::reproject(id, &geometry, from, self.attrs.crs_epsg)?;
        geometry::validate(id, &canonical)?;

        self.drop_vectors(&[id.to_string()], None)?;
        self.add_vectors(
            vec![VectorRecord {
                id: id.to_string(),
                geometry: canonical,
                epsg: None,
                attrs,
            }],
            None,
        )
    }

    // ------------------------------------------------------------------------
    // Mutation: rasters
    // ------------------------------------------------------------------------

    /// Add rasters.
    ///
    /// Mirror of [`Connector::add_vectors`]: each new raster is connected to
    /// all overlapping features, and `raster_count` is incremented for every
    /// feature the new footprint contains. With a label maker, labels for the
    /// new rasters are created afterwards.
    pub fn add_rasters(
        &mut self,
        records: Vec<RasterRecord>,
        label_maker: Option<&mut dyn LabelMaker>,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let entries = records
            .into_iter()
            .map(|r| (r.id, r.geometry, r.epsg, r.attrs))
            .collect();
        let prepared = self.prepare_batch(entries, Side::Rasters)?;
        info!(count = prepared.len(), "adding rasters");

        let rows = prepared
            .iter()
            .map(|p| TableRow {
                id: p.id.clone(),
                geometry: p.geometry.clone(),
                attrs: p.attrs.clone(),
            })
            .collect();
        self.rasters.insert_rows(rows)?;

        for p in &prepared {
            self.index.insert(&p.id, &p.rect)?;
            self.graph.add_vertex(&p.id, VertexKind::Raster)?;

            let mut candidates: Vec<String> = self
                .index
                .query(&p.rect)
                .into_iter()
                .filter(|id| self.vectors.has_row(id))
                .collect();
            candidates.sort_by_key(|id| self.vectors.position(id));

            for feature_id in candidates {
                let relation = {
                    let feature = &self
                        .vectors
                        .get_row(&feature_id)
                        .expect("candidate filtered against vectors table")
                        .geometry;
                    geometry::classify_footprint(&p.geometry, feature)
                };
                match relation {
                    FootprintRelation::Contains => {
                        self.graph
                            .add_edge(&p.id, &feature_id, EdgeLabel::Contains, JsonMap::new())?;
                        let count = self.raster_count_of(&feature_id);
                        self.vectors
                            .set_cell(&feature_id, RASTER_COUNT_COLUMN, json!(count + 1))?;
                    }
                    FootprintRelation::Intersects => {
                        self.graph
                            .add_edge(&p.id, &feature_id, EdgeLabel::Intersects, JsonMap::new())?;
                    }
                    FootprintRelation::Disjoint => {}
                }
            }
        }

        if let Some(label_maker) = label_maker {
            let new_ids: Vec<String> = prepared.iter().map(|p| p.id.clone()).collect();
            self.make_labels(label_maker, &new_ids)?;
        }
        Ok(())
    }

    /// Drop rasters, their index entries, and all incident edges,
    /// decrementing `raster_count` for every feature they contained.
    pub fn drop_rasters(
        &mut self,
        ids: &[String],
        label_maker: Option<&mut dyn LabelMaker>,
    ) -> Result<()> {
        let ids = dedupe(ids);
        for id in &ids {
            if !self.rasters.has_row(id) {
                return Err(GeographError::UnknownId {
                    id: id.clone(),
                    scope: "rasters".to_string(),
                });
            }
        }
        info!(count = ids.len(), "dropping rasters");

        for id in &ids {
            for feature_id in self.graph.neighbors(id, Some(EdgeLabel::Contains))? {
                let count = self.raster_count_of(&feature_id);
                self.vectors
                    .set_cell(&feature_id, RASTER_COUNT_COLUMN, json!((count - 1).max(0)))?;
            }
            self.graph.remove_vertex(id)?;
            self.index.remove(id)?;
        }
        self.rasters.drop_rows(&ids)?;

        if let Some(label_maker) = label_maker {
            label_maker
                .delete_labels(self, &ids)
                .map_err(|source| GeographError::Collaborator {
                    id: ids.join(", "),
                    source,
                })?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // CRS
    // ------------------------------------------------------------------------

    /// Change the canonical CRS, reprojecting every stored geometry.
    ///
    /// Fails without side effects if any geometry cannot be reprojected. The
    /// graph is carried over; the spatial index is rebuilt from the new
    /// bounds.
    pub fn set_crs_epsg(&mut self, epsg: u32) -> Result<()> {
        if epsg == self.attrs.crs_epsg {
            return Ok(());
        }
        let from = self.attrs.crs_epsg;
        info!(from_epsg = from, to_epsg = epsg, "reprojecting connector");

        let mut reprojected: Vec<(Side, String, Geometry<f64>, Rect<f64>)> = Vec::new();
        for (side, table) in [(Side::Vectors, &self.vectors), (Side::Rasters, &self.rasters)] {
            for (id, row) in table.iter_rows() {
                let geometry = geometry::reproject(id, &row.geometry, from, epsg)?;
                geometry::validate(id, &geometry)?;
                let rect = geometry::bounds(id, &geometry)?;
                reprojected.push((side, id.to_string(), geometry, rect));
            }
        }

        let bounds: Vec<(String, Rect<f64>)> = reprojected
            .iter()
            .map(|(_, id, _, rect)| (id.clone(), *rect))
            .collect();
        for (side, id, geometry, _) in reprojected {
            match side {
                Side::Vectors => self.vectors.set_geometry(&id, geometry)?,
                Side::Rasters => self.rasters.set_geometry(&id, geometry)?,
            }
        }
        self.index = SpatialIndex::bulk_load(bounds)?;
        self.attrs.crs_epsg = epsg;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Rasters whose footprint fully contains the feature.
    pub fn rasters_containing(&self, feature_id: &str) -> Result<Vec<String>> {
        self.expect_vector(feature_id)?;
        self.graph.neighbors(feature_id, Some(EdgeLabel::Contains))
    }

    /// Rasters with any overlap with the feature (containment included).
    pub fn rasters_intersecting(&self, feature_id: &str) -> Result<Vec<String>> {
        self.expect_vector(feature_id)?;
        self.graph.neighbors(feature_id, None)
    }

    /// Features fully contained in the raster footprint.
    pub fn vectors_contained_in(&self, raster_id: &str) -> Result<Vec<String>> {
        self.expect_raster(raster_id)?;
        self.graph.neighbors(raster_id, Some(EdgeLabel::Contains))
    }

    /// Features with any overlap with the raster footprint.
    pub fn vectors_intersecting(&self, raster_id: &str) -> Result<Vec<String>> {
        self.expect_raster(raster_id)?;
        self.graph.neighbors(raster_id, None)
    }

    /// Whether at least one raster fully contains the feature.
    pub fn have_raster_for(&self, feature_id: &str) -> Result<bool> {
        self.expect_vector(feature_id)?;
        Ok(self.raster_count_of(feature_id) > 0)
    }

    /// Whether the raster footprint fully contains the feature.
    pub fn does_raster_contain(&self, raster_id: &str, feature_id: &str) -> Result<bool> {
        self.expect_raster(raster_id)?;
        self.expect_vector(feature_id)?;
        match self.graph.edge(raster_id, feature_id) {
            Ok(record) => Ok(record.label == EdgeLabel::Contains),
            Err(GeographError::EdgeNotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Whether the feature is fully contained in the raster footprint.
    pub fn is_contained_in(&self, feature_id: &str, raster_id: &str) -> Result<bool> {
        self.does_raster_contain(raster_id, feature_id)
    }

    /// Set one attribute on an existing edge, e.g. download provenance.
    pub fn set_edge_attr(
        &mut self,
        raster_id: &str,
        feature_id: &str,
        key: &str,
        value: Value,
    ) -> Result<()> {
        self.graph.set_edge_attr(raster_id, feature_id, key, value)
    }

    // ------------------------------------------------------------------------
    // Collaborators
    // ------------------------------------------------------------------------

    /// Drive a downloader until each feature meets the target raster count.
    ///
    /// Every produced raster row is integrated as its own atomic mutation.
    /// Failures are recorded in the failures table and aggregated into the
    /// report; already-integrated rasters from the same run are kept.
    pub fn download_rasters(
        &mut self,
        downloader: &mut dyn RasterDownloader,
        feature_ids: &[String],
        params: &DownloadParams,
    ) -> Result<DownloadReport> {
        for feature_id in feature_ids {
            self.expect_vector(feature_id)?;
        }

        let mut report = DownloadReport::default();
        for feature_id in feature_ids {
            if self.raster_count_of(feature_id) >= params.target_raster_count {
                report.skipped.push(feature_id.clone());
                continue;
            }
            loop {
                let before = self.raster_count_of(feature_id);
                if before >= params.target_raster_count {
                    break;
                }
                match downloader.download(self, feature_id, params) {
                    Ok(records) if records.is_empty() => {
                        self.record_failure(
                            feature_id.clone(),
                            feature_id,
                            "no rasters found for feature",
                            &mut report,
                        );
                        break;
                    }
                    Ok(records) => {
                        for record in records {
                            let raster_id = record.id.clone();
                            match self.add_rasters(vec![record], None) {
                                Ok(()) => {
                                    if self.graph.has_edge(&raster_id, feature_id) {
                                        self.graph.set_edge_attr(
                                            &raster_id,
                                            feature_id,
                                            "requested_by",
                                            json!(feature_id),
                                        )?;
                                    }
                                    report.downloaded.push(raster_id);
                                }
                                Err(err) => {
                                    self.record_failure(
                                        raster_id,
                                        feature_id,
                                        &err.to_string(),
                                        &mut report,
                                    );
                                }
                            }
                        }
                        // a batch that did not raise the count will not
                        // converge; stop asking for this feature
                        if self.raster_count_of(feature_id) <= before {
                            break;
                        }
                    }
                    Err(err) => {
                        let key = err.raster_id.unwrap_or_else(|| feature_id.clone());
                        self.record_failure(key, feature_id, &format!("{:#}", err.source), &mut report);
                        break;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Check that the vectors table carries the columns a label mode needs.
    pub fn validate_label_schema(&self, mode: LabelMode) -> Result<()> {
        match mode {
            LabelMode::Categorical => self.vectors.require_column(TYPE_COLUMN),
            LabelMode::SoftCategorical => {
                for class in &self.attrs.task_classes {
                    self.vectors
                        .require_column(&format!("{CLASS_PROB_PREFIX}{class}"))?;
                }
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------------
    // Consistency audit
    // ------------------------------------------------------------------------

    /// Audit the cross-structure invariants.
    ///
    /// Verifies the index/table bijection, the graph-vertex/table bijection,
    /// edge soundness and completeness against the precise predicates, and
    /// the `raster_count` materialization. Run automatically on
    /// [`Connector::save`]; only reachable failures are internal bugs or
    /// direct tampering with the structures outside the mutation API.
    pub fn check_consistency(&self) -> Result<()> {
        let table_total = self.vectors.len() + self.rasters.len();
        if self.index.len() != table_total {
            return Err(GeographError::InvariantViolation {
                detail: format!(
                    "spatial index holds {} entries, tables hold {} rows",
                    self.index.len(),
                    table_total
                ),
            });
        }
        if self.graph.vertex_count() != table_total {
            return Err(GeographError::InvariantViolation {
                detail: format!(
                    "graph holds {} vertices, tables hold {} rows",
                    self.graph.vertex_count(),
                    table_total
                ),
            });
        }
        for (id, kind) in self
            .vectors
            .ids()
            .map(|id| (id, VertexKind::Vector))
            .chain(self.rasters.ids().map(|id| (id, VertexKind::Raster)))
        {
            if !self.index.contains_id(id) {
                return Err(GeographError::InvariantViolation {
                    detail: format!("id `{id}` missing from spatial index"),
                });
            }
            if self.graph.vertex_kind(id) != Some(kind) {
                return Err(GeographError::InvariantViolation {
                    detail: format!("id `{id}` missing from graph or has wrong kind"),
                });
            }
        }

        // edge soundness and completeness, narrowed through the (just
        // verified) index
        for (raster_id, raster_row) in self.rasters.iter_rows() {
            let rect = geometry::bounds(raster_id, &raster_row.geometry)?;
            let mut expected: BTreeMap<String, EdgeLabel> = BTreeMap::new();
            for candidate in self.index.query(&rect) {
                let Some(feature_row) = self.vectors.get_row(&candidate) else {
                    continue;
                };
                match geometry::classify_footprint(&raster_row.geometry, &feature_row.geometry) {
                    FootprintRelation::Contains => {
                        expected.insert(candidate, EdgeLabel::Contains);
                    }
                    FootprintRelation::Intersects => {
                        expected.insert(candidate, EdgeLabel::Intersects);
                    }
                    FootprintRelation::Disjoint => {}
                }
            }
            let mut actual: BTreeMap<String, EdgeLabel> = BTreeMap::new();
            for feature_id in self.graph.neighbors(raster_id, None)? {
                let label = self.graph.edge(raster_id, &feature_id)?.label;
                actual.insert(feature_id, label);
            }
            if expected != actual {
                return Err(GeographError::InvariantViolation {
                    detail: format!("edge set for raster `{raster_id}` does not match geometry"),
                });
            }
        }

        for (feature_id, _) in self.vectors.iter_rows() {
            let materialized = self.raster_count_of(feature_id);
            let edges = self
                .graph
                .neighbors(feature_id, Some(EdgeLabel::Contains))?
                .len() as i64;
            if materialized != edges {
                return Err(GeographError::InvariantViolation {
                    detail: format!(
                        "feature `{feature_id}` has raster_count {materialized}, {edges} contains edges"
                    ),
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Internal helpers
    // ------------------------------------------------------------------------

    fn raster_count_of(&self, feature_id: &str) -> i64 {
        self.vectors
            .get_cell(feature_id, RASTER_COUNT_COLUMN)
            .and_then(Value::as_i64)
            .unwrap_or(0)
    }

    fn expect_vector(&self, id: &str) -> Result<()> {
        if self.vectors.has_row(id) {
            Ok(())
        } else {
            Err(GeographError::UnknownId {
                id: id.to_string(),
                scope: "vectors".to_string(),
            })
        }
    }

    fn expect_raster(&self, id: &str) -> Result<()> {
        if self.rasters.has_row(id) {
            Ok(())
        } else {
            Err(GeographError::UnknownId {
                id: id.to_string(),
                scope: "rasters".to_string(),
            })
        }
    }

    /// Validate a batch against both id namespaces, reserved columns, and
    /// geometry/CRS rules, before any state is touched.
    fn prepare_batch(
        &self,
        entries: Vec<(String, Geometry<f64>, Option<u32>, BTreeMap<String, Value>)>,
        side: Side,
    ) -> Result<Vec<PreparedRow>> {
        let (own, other, reserved): (&AttributeTable, &AttributeTable, &[&str]) = match side {
            Side::Vectors => (&self.vectors, &self.rasters, &[RASTER_COUNT_COLUMN]),
            Side::Rasters => (&self.rasters, &self.vectors, &[]),
        };

        let mut seen: HashSet<String> = HashSet::with_capacity(entries.len());
        let mut prepared = Vec::with_capacity(entries.len());
        for (id, geometry, epsg, attrs) in entries {
            if own.has_row(&id) || !seen.insert(id.clone()) {
                return Err(GeographError::DuplicateId {
                    id,
                    scope: own.name().to_string(),
                });
            }
            if other.has_row(&id) {
                return Err(GeographError::IdNamespaceCollision { id });
            }
            for column in attrs.keys() {
                if reserved.contains(&column.as_str()) {
                    return Err(GeographError::ReservedColumn {
                        column: column.clone(),
                        table: own.name().to_string(),
                    });
                }
            }

            geometry::validate(&id, &geometry)?;
            if side == Side::Rasters && matches!(geometry, Geometry::Point(_)) {
                return Err(GeographError::InvalidGeometry {
                    id,
                    reason: "raster footprint must be a polygon".to_string(),
                });
            }
            let from = epsg.unwrap_or(self.attrs.crs_epsg);
            let canonical = geometry::reproject(&id, &geometry, from, self.attrs.crs_epsg)?;
            geometry::validate(&id, &canonical)?;
            let rect = geometry::bounds(&id, &canonical)?;

            prepared.push(PreparedRow {
                id,
                geometry: canonical,
                rect,
                attrs,
            });
        }
        Ok(prepared)
    }

    fn recompute_labels(
        &mut self,
        label_maker: &mut dyn LabelMaker,
        raster_ids: &[String],
    ) -> Result<()> {
        if raster_ids.is_empty() {
            return Ok(());
        }
        label_maker
            .recompute_labels(self, raster_ids)
            .map_err(|source| GeographError::Collaborator {
                id: raster_ids.join(", "),
                source,
            })
    }

    fn make_labels(
        &mut self,
        label_maker: &mut dyn LabelMaker,
        raster_ids: &[String],
    ) -> Result<()> {
        if raster_ids.is_empty() {
            return Ok(());
        }
        label_maker
            .make_labels(self, raster_ids)
            .map_err(|source| GeographError::Collaborator {
                id: raster_ids.join(", "),
                source,
            })
    }

    fn record_failure(
        &mut self,
        key: String,
        feature_id: &str,
        error: &str,
        report: &mut DownloadReport,
    ) {
        warn!(raster = %key, feature = %feature_id, error, "download attempt failed");
        let failure = DownloadFailure {
            raster_id: key.clone(),
            feature_id: feature_id.to_string(),
            error: error.to_string(),
            failed_at: Utc::now(),
        };
        report.failures.push(failure.clone());
        self.failures.insert(key, failure);
    }
}

fn dedupe(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}
