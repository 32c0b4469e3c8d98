//! Bipartite relation graph.
//!
//! The authoritative record of which rasters contain or intersect which
//! vector features. Vertices carry one of two kinds, edges run from a raster
//! to a feature and carry exactly one label plus a free-form attribute bag
//! (e.g. provenance of the downloads that produced a raster).
//!
//! The graph stores only string ids; row data lives in the tables. Neighbor
//! enumeration is deterministic: ids come back in edge insertion order.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

use crate::errors::{GeographError, Result};

/// Scope string used in identifier errors raised by the graph.
const GRAPH_SCOPE: &str = "graph";

// ============================================================================
// Vertex and edge vocabulary
// ============================================================================

/// The two vertex classes of the bipartite graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VertexKind {
    /// A vector feature (row of the vectors table).
    Vector,
    /// A raster footprint (row of the rasters table).
    Raster,
}

impl fmt::Display for VertexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vector => write!(f, "vector"),
            Self::Raster => write!(f, "raster"),
        }
    }
}

/// Relation label on an edge. `Contains` is the stronger relation; an edge
/// never carries both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeLabel {
    /// The raster footprint covers the feature (boundary-closed).
    Contains,
    /// The geometries overlap but the footprint does not cover the feature.
    Intersects,
}

impl fmt::Display for EdgeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Contains => write!(f, "contains"),
            Self::Intersects => write!(f, "intersects"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Vertex {
    kind: VertexKind,
    /// Opposite-kind neighbor ids in edge insertion order.
    neighbors: Vec<String>,
    /// Unknown wire fields, preserved across round-trips.
    extra: JsonMap<String, Value>,
}

/// Label and attribute bag of one edge.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRecord {
    /// The relation label.
    pub label: EdgeLabel,
    /// Free-form per-edge attributes.
    pub attrs: JsonMap<String, Value>,
    /// Unknown wire fields, preserved across round-trips.
    extra: JsonMap<String, Value>,
}

// ============================================================================
// BipartiteGraph
// ============================================================================

/// Labeled bipartite graph between raster and feature ids.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BipartiteGraph {
    vertices: HashMap<String, Vertex>,
    /// Vertex ids in insertion order; drives wire output.
    order: Vec<String>,
    /// Keyed by `(raster_id, feature_id)`.
    edges: HashMap<(String, String), EdgeRecord>,
    /// Unknown document-level wire fields.
    extra: JsonMap<String, Value>,
}

impl BipartiteGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex. Fails if the id already exists in either kind.
    pub fn add_vertex(&mut self, id: &str, kind: VertexKind) -> Result<()> {
        if self.vertices.contains_key(id) {
            return Err(GeographError::DuplicateId {
                id: id.to_string(),
                scope: GRAPH_SCOPE.to_string(),
            });
        }
        self.vertices.insert(
            id.to_string(),
            Vertex {
                kind,
                neighbors: Vec::new(),
                extra: JsonMap::new(),
            },
        );
        self.order.push(id.to_string());
        Ok(())
    }

    /// Remove a vertex together with all incident edges.
    pub fn remove_vertex(&mut self, id: &str) -> Result<()> {
        let vertex = self
            .vertices
            .remove(id)
            .ok_or_else(|| GeographError::UnknownId {
                id: id.to_string(),
                scope: GRAPH_SCOPE.to_string(),
            })?;

        for neighbor in &vertex.neighbors {
            if let Some(v) = self.vertices.get_mut(neighbor) {
                v.neighbors.retain(|n| n != id);
            }
            self.edges.remove(&edge_key(id, vertex.kind, neighbor));
        }
        self.order.retain(|v| v != id);
        Ok(())
    }

    /// Add a labeled edge from a raster to a feature.
    ///
    /// Both endpoints must already exist with the right kinds. At most one
    /// edge may exist between a pair of endpoints, regardless of label.
    pub fn add_edge(
        &mut self,
        raster_id: &str,
        feature_id: &str,
        label: EdgeLabel,
        attrs: JsonMap<String, Value>,
    ) -> Result<()> {
        self.expect_kind(raster_id, VertexKind::Raster)?;
        self.expect_kind(feature_id, VertexKind::Vector)?;

        let key = (raster_id.to_string(), feature_id.to_string());
        if self.edges.contains_key(&key) {
            return Err(GeographError::EdgeExists {
                raster: raster_id.to_string(),
                feature: feature_id.to_string(),
            });
        }

        self.edges.insert(
            key,
            EdgeRecord {
                label,
                attrs,
                extra: JsonMap::new(),
            },
        );
        self.vertices
            .get_mut(raster_id)
            .expect("endpoint checked above")
            .neighbors
            .push(feature_id.to_string());
        self.vertices
            .get_mut(feature_id)
            .expect("endpoint checked above")
            .neighbors
            .push(raster_id.to_string());
        Ok(())
    }

    /// Remove the edge between a raster and a feature.
    ///
    /// With `missing_ok`, removing an absent edge is a no-op; otherwise it is
    /// an error.
    pub fn remove_edge(&mut self, raster_id: &str, feature_id: &str, missing_ok: bool) -> Result<()> {
        let key = (raster_id.to_string(), feature_id.to_string());
        if self.edges.remove(&key).is_none() {
            if missing_ok {
                return Ok(());
            }
            return Err(GeographError::EdgeNotFound {
                raster: raster_id.to_string(),
                feature: feature_id.to_string(),
            });
        }
        if let Some(v) = self.vertices.get_mut(raster_id) {
            v.neighbors.retain(|n| n != feature_id);
        }
        if let Some(v) = self.vertices.get_mut(feature_id) {
            v.neighbors.retain(|n| n != raster_id);
        }
        Ok(())
    }

    /// Opposite-kind neighbors of a vertex, optionally filtered by label,
    /// in edge insertion order.
    pub fn neighbors(&self, id: &str, filter: Option<EdgeLabel>) -> Result<Vec<String>> {
        let vertex = self.vertices.get(id).ok_or_else(|| GeographError::UnknownId {
            id: id.to_string(),
            scope: GRAPH_SCOPE.to_string(),
        })?;

        let neighbors = vertex
            .neighbors
            .iter()
            .filter(|neighbor| match filter {
                None => true,
                Some(label) => {
                    self.edges
                        .get(&edge_key(id, vertex.kind, neighbor))
                        .map(|e| e.label == label)
                        .unwrap_or(false)
                }
            })
            .cloned()
            .collect();
        Ok(neighbors)
    }

    /// Label and attributes of the edge between a raster and a feature.
    pub fn edge(&self, raster_id: &str, feature_id: &str) -> Result<&EdgeRecord> {
        self.edges
            .get(&(raster_id.to_string(), feature_id.to_string()))
            .ok_or_else(|| GeographError::EdgeNotFound {
                raster: raster_id.to_string(),
                feature: feature_id.to_string(),
            })
    }

    /// Whether an edge exists between the endpoints, with any label.
    pub fn has_edge(&self, raster_id: &str, feature_id: &str) -> bool {
        self.edges
            .contains_key(&(raster_id.to_string(), feature_id.to_string()))
    }

    /// Set one attribute on an existing edge.
    pub fn set_edge_attr(
        &mut self,
        raster_id: &str,
        feature_id: &str,
        key: &str,
        value: Value,
    ) -> Result<()> {
        let record = self
            .edges
            .get_mut(&(raster_id.to_string(), feature_id.to_string()))
            .ok_or_else(|| GeographError::EdgeNotFound {
                raster: raster_id.to_string(),
                feature: feature_id.to_string(),
            })?;
        record.attrs.insert(key.to_string(), value);
        Ok(())
    }

    /// Kind of a vertex, if it exists.
    pub fn vertex_kind(&self, id: &str) -> Option<VertexKind> {
        self.vertices.get(id).map(|v| v.kind)
    }

    /// Whether a vertex exists.
    pub fn has_vertex(&self, id: &str) -> bool {
        self.vertices.contains_key(id)
    }

    /// Ids of all vertices of the given kind, in insertion order.
    pub fn vertices_of_kind(&self, kind: VertexKind) -> Vec<&str> {
        self.order
            .iter()
            .filter(|id| self.vertices[id.as_str()].kind == kind)
            .map(String::as_str)
            .collect()
    }

    /// Total number of vertices.
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Total number of edges.
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// All edges as `(raster_id, feature_id, record)`, in a deterministic
    /// order: raster vertices in insertion order, each raster's features in
    /// edge insertion order.
    pub fn edges_in_order(&self) -> Vec<(&str, &str, &EdgeRecord)> {
        let mut out = Vec::with_capacity(self.edges.len());
        for id in &self.order {
            let vertex = &self.vertices[id.as_str()];
            if vertex.kind != VertexKind::Raster {
                continue;
            }
            for feature in &vertex.neighbors {
                let record = &self.edges[&(id.clone(), feature.clone())];
                out.push((id.as_str(), feature.as_str(), record));
            }
        }
        out
    }

    fn expect_kind(&self, id: &str, kind: VertexKind) -> Result<()> {
        match self.vertices.get(id) {
            Some(v) if v.kind == kind => Ok(()),
            _ => Err(GeographError::UnknownId {
                id: id.to_string(),
                scope: format!("{GRAPH_SCOPE} ({kind} vertices)"),
            }),
        }
    }

    // ------------------------------------------------------------------------
    // Wire format
    // ------------------------------------------------------------------------

    /// Convert to the JSON wire representation.
    pub fn to_wire(&self) -> WireGraph {
        let vertices = self
            .order
            .iter()
            .map(|id| {
                let v = &self.vertices[id.as_str()];
                WireVertex {
                    id: id.clone(),
                    kind: v.kind,
                    extra: v.extra.clone(),
                }
            })
            .collect();
        let edges = self
            .edges_in_order()
            .into_iter()
            .map(|(raster, feature, record)| WireEdge {
                raster: raster.to_string(),
                feature: feature.to_string(),
                label: record.label,
                attrs: record.attrs.clone(),
                extra: record.extra.clone(),
            })
            .collect();
        WireGraph {
            vertices,
            edges,
            extra: self.extra.clone(),
        }
    }

    /// Rebuild a graph from its wire representation.
    pub fn from_wire(wire: WireGraph) -> Result<Self> {
        let mut graph = Self::new();
        graph.extra = wire.extra;
        for vertex in wire.vertices {
            graph.add_vertex(&vertex.id, vertex.kind)?;
            graph
                .vertices
                .get_mut(&vertex.id)
                .expect("vertex just added")
                .extra = vertex.extra;
        }
        for edge in wire.edges {
            graph.add_edge(&edge.raster, &edge.feature, edge.label, edge.attrs)?;
            graph
                .edges
                .get_mut(&(edge.raster, edge.feature))
                .expect("edge just added")
                .extra = edge.extra;
        }
        Ok(graph)
    }
}

fn edge_key(id: &str, kind: VertexKind, neighbor: &str) -> (String, String) {
    match kind {
        VertexKind::Raster => (id.to_string(), neighbor.to_string()),
        VertexKind::Vector => (neighbor.to_string(), id.to_string()),
    }
}

// ============================================================================
// Wire structs
// ============================================================================

/// Wire form of one vertex.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireVertex {
    /// Vertex id.
    pub id: String,
    /// Vertex kind.
    pub kind: VertexKind,
    /// Unknown fields, preserved.
    #[serde(flatten)]
    pub extra: JsonMap<String, Value>,
}

/// Wire form of one edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEdge {
    /// Raster endpoint.
    pub raster: String,
    /// Feature endpoint.
    pub feature: String,
    /// Relation label.
    pub label: EdgeLabel,
    /// Per-edge attribute bag.
    #[serde(default)]
    pub attrs: JsonMap<String, Value>,
    /// Unknown fields, preserved.
    #[serde(flatten)]
    pub extra: JsonMap<String, Value>,
}

/// Wire form of the whole graph (`graph.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireGraph {
    /// All vertices, in insertion order.
    pub vertices: Vec<WireVertex>,
    /// All edges, in deterministic order.
    pub edges: Vec<WireEdge>,
    /// Unknown document-level fields, preserved.
    #[serde(flatten)]
    pub extra: JsonMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, Value)]) -> JsonMap<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn small_graph() -> BipartiteGraph {
        let mut g = BipartiteGraph::new();
        g.add_vertex("r1", VertexKind::Raster).unwrap();
        g.add_vertex("r2", VertexKind::Raster).unwrap();
        g.add_vertex("f1", VertexKind::Vector).unwrap();
        g.add_vertex("f2", VertexKind::Vector).unwrap();
        g.add_edge("r1", "f1", EdgeLabel::Contains, JsonMap::new())
            .unwrap();
        g.add_edge("r1", "f2", EdgeLabel::Intersects, JsonMap::new())
            .unwrap();
        g.add_edge("r2", "f1", EdgeLabel::Intersects, JsonMap::new())
            .unwrap();
        g
    }

    #[test]
    fn test_duplicate_vertex_fails() {
        let mut g = BipartiteGraph::new();
        g.add_vertex("a", VertexKind::Raster).unwrap();
        let err = g.add_vertex("a", VertexKind::Vector).unwrap_err();
        assert!(matches!(err, GeographError::DuplicateId { .. }));
    }

    #[test]
    fn test_duplicate_edge_fails_regardless_of_label() {
        let mut g = small_graph();
        let err = g
            .add_edge("r1", "f1", EdgeLabel::Intersects, JsonMap::new())
            .unwrap_err();
        assert!(matches!(err, GeographError::EdgeExists { .. }));
    }

    #[test]
    fn test_edge_requires_correct_kinds() {
        let mut g = small_graph();
        // endpoints swapped
        let err = g
            .add_edge("f1", "r1", EdgeLabel::Contains, JsonMap::new())
            .unwrap_err();
        assert!(matches!(err, GeographError::UnknownId { .. }));
    }

    #[test]
    fn test_neighbors_in_insertion_order() {
        let g = small_graph();
        assert_eq!(g.neighbors("r1", None).unwrap(), vec!["f1", "f2"]);
        assert_eq!(g.neighbors("f1", None).unwrap(), vec!["r1", "r2"]);
    }

    #[test]
    fn test_neighbors_filtered_by_label() {
        let g = small_graph();
        assert_eq!(
            g.neighbors("f1", Some(EdgeLabel::Contains)).unwrap(),
            vec!["r1"]
        );
        assert_eq!(
            g.neighbors("f1", Some(EdgeLabel::Intersects)).unwrap(),
            vec!["r2"]
        );
        assert!(g
            .neighbors("f2", Some(EdgeLabel::Contains))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_remove_vertex_removes_incident_edges() {
        let mut g = small_graph();
        g.remove_vertex("r1").unwrap();

        assert!(!g.has_vertex("r1"));
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.neighbors("f1", None).unwrap(), vec!["r2"]);
        assert!(g.neighbors("f2", None).unwrap().is_empty());
    }

    #[test]
    fn test_remove_edge_missing_ok_flag() {
        let mut g = small_graph();
        g.remove_edge("r2", "f2", true).unwrap();
        let err = g.remove_edge("r2", "f2", false).unwrap_err();
        assert!(matches!(err, GeographError::EdgeNotFound { .. }));
    }

    #[test]
    fn test_edge_attrs_round_trip() {
        let mut g = BipartiteGraph::new();
        g.add_vertex("r1", VertexKind::Raster).unwrap();
        g.add_vertex("f1", VertexKind::Vector).unwrap();
        g.add_edge(
            "r1",
            "f1",
            EdgeLabel::Contains,
            attrs(&[("source_downloads", json!(["S2A_tile_0"]))]),
        )
        .unwrap();
        g.set_edge_attr("r1", "f1", "requested_by", json!("f1"))
            .unwrap();

        let record = g.edge("r1", "f1").unwrap();
        assert_eq!(record.label, EdgeLabel::Contains);
        assert_eq!(record.attrs["source_downloads"], json!(["S2A_tile_0"]));
        assert_eq!(record.attrs["requested_by"], json!("f1"));
    }

    #[test]
    fn test_wire_round_trip_preserves_unknown_fields() {
        let raw = json!({
            "vertices": [
                {"id": "r1", "kind": "raster", "sensor": "S2"},
                {"id": "f1", "kind": "vector"}
            ],
            "edges": [
                {"raster": "r1", "feature": "f1", "label": "contains",
                 "attrs": {"n": 1}, "checked_by": "qa"}
            ],
            "generator": "v9"
        });

        let wire: WireGraph = serde_json::from_value(raw).unwrap();
        let graph = BipartiteGraph::from_wire(wire).unwrap();
        let out = serde_json::to_value(graph.to_wire()).unwrap();

        assert_eq!(out["vertices"][0]["sensor"], json!("S2"));
        assert_eq!(out["edges"][0]["checked_by"], json!("qa"));
        assert_eq!(out["generator"], json!("v9"));
    }

    #[test]
    fn test_wire_round_trip_structural_equality() {
        let g = small_graph();
        let rebuilt = BipartiteGraph::from_wire(g.to_wire()).unwrap();
        assert_eq!(g, rebuilt);
    }

    #[test]
    fn test_edges_in_order_is_deterministic() {
        let g = small_graph();
        let listed: Vec<(String, String)> = g
            .edges_in_order()
            .into_iter()
            .map(|(r, f, _)| (r.to_string(), f.to_string()))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("r1".to_string(), "f1".to_string()),
                ("r1".to_string(), "f2".to_string()),
                ("r2".to_string(), "f1".to_string()),
            ]
        );
    }
}
