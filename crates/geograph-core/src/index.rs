//! Spatial index over raster footprints and feature geometries.
//!
//! A string-keyed R-tree of bounding boxes. The index only narrows candidate
//! pairs for precise predicate evaluation; the graph is authoritative. It is
//! rebuilt with a bulk load whenever a connector is read from disk.

use std::collections::HashMap;

use geo::Rect;
use rstar::{RTree, RTreeObject, AABB};

use crate::errors::{GeographError, Result};

/// One indexed bounding box.
#[derive(Debug, Clone, PartialEq)]
struct IndexEntry {
    id: String,
    envelope: AABB<[f64; 2]>,
}

impl RTreeObject for IndexEntry {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.envelope
    }
}

fn envelope_of(rect: &Rect<f64>) -> AABB<[f64; 2]> {
    AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y])
}

/// Bounding-box index keyed by row id.
#[derive(Debug, Clone, Default)]
pub struct SpatialIndex {
    tree: RTree<IndexEntry>,
    envelopes: HashMap<String, AABB<[f64; 2]>>,
}

impl SpatialIndex {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bulk-load an index from `(id, bounds)` pairs.
    ///
    /// Used at load time; noticeably faster than repeated inserts. Fails on
    /// duplicate ids.
    pub fn bulk_load<I>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Rect<f64>)>,
    {
        let mut envelopes = HashMap::new();
        let mut entries = Vec::new();
        for (id, rect) in pairs {
            let envelope = envelope_of(&rect);
            if envelopes.insert(id.clone(), envelope).is_some() {
                return Err(GeographError::DuplicateId {
                    id,
                    scope: "spatial index".to_string(),
                });
            }
            entries.push(IndexEntry { id, envelope });
        }
        Ok(Self {
            tree: RTree::bulk_load(entries),
            envelopes,
        })
    }

    /// Insert a new id with its bounds. Duplicate ids are an error.
    pub fn insert(&mut self, id: &str, rect: &Rect<f64>) -> Result<()> {
        if self.envelopes.contains_key(id) {
            return Err(GeographError::DuplicateId {
                id: id.to_string(),
                scope: "spatial index".to_string(),
            });
        }
        let envelope = envelope_of(rect);
        self.envelopes.insert(id.to_string(), envelope);
        self.tree.insert(IndexEntry {
            id: id.to_string(),
            envelope,
        });
        Ok(())
    }

    /// Remove an id. Missing ids are an error.
    pub fn remove(&mut self, id: &str) -> Result<()> {
        let envelope = self
            .envelopes
            .remove(id)
            .ok_or_else(|| GeographError::UnknownId {
                id: id.to_string(),
                scope: "spatial index".to_string(),
            })?;
        let _ = self.tree.remove(&IndexEntry {
            id: id.to_string(),
            envelope,
        });
        Ok(())
    }

    /// All ids whose bounding box intersects `rect`.
    ///
    /// A superset of the exactly-intersecting ids: callers must re-check with
    /// precise predicates.
    pub fn query(&self, rect: &Rect<f64>) -> Vec<String> {
        self.tree
            .locate_in_envelope_intersecting(&envelope_of(rect))
            .map(|entry| entry.id.clone())
            .collect()
    }

    /// Whether the id is indexed.
    pub fn contains_id(&self, id: &str) -> bool {
        self.envelopes.contains_key(id)
    }

    /// Number of indexed entries.
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }

    /// Iterator over all indexed ids, in no particular order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.envelopes.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::coord;

    fn rect(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Rect<f64> {
        Rect::new(coord! { x: xmin, y: ymin }, coord! { x: xmax, y: ymax })
    }

    #[test]
    fn test_insert_and_query() {
        let mut index = SpatialIndex::new();
        index.insert("a", &rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        index.insert("b", &rect(20.0, 20.0, 30.0, 30.0)).unwrap();

        let hits = index.query(&rect(5.0, 5.0, 6.0, 6.0));
        assert_eq!(hits, vec!["a".to_string()]);
    }

    #[test]
    fn test_duplicate_insert_fails() {
        let mut index = SpatialIndex::new();
        index.insert("a", &rect(0.0, 0.0, 1.0, 1.0)).unwrap();
        let err = index.insert("a", &rect(2.0, 2.0, 3.0, 3.0)).unwrap_err();
        assert!(matches!(err, GeographError::DuplicateId { .. }));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_missing_fails() {
        let mut index = SpatialIndex::new();
        let err = index.remove("ghost").unwrap_err();
        assert!(matches!(err, GeographError::UnknownId { .. }));
    }

    #[test]
    fn test_remove_drops_from_queries() {
        let mut index = SpatialIndex::new();
        index.insert("a", &rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        index.remove("a").unwrap();

        assert!(index.is_empty());
        assert!(index.query(&rect(0.0, 0.0, 10.0, 10.0)).is_empty());
    }

    #[test]
    fn test_query_touching_boxes() {
        // bbox-level filtering is inclusive of shared edges
        let mut index = SpatialIndex::new();
        index.insert("a", &rect(0.0, 0.0, 10.0, 10.0)).unwrap();
        let hits = index.query(&rect(10.0, 3.0, 12.0, 7.0));
        assert_eq!(hits, vec!["a".to_string()]);
    }

    #[test]
    fn test_bulk_load_matches_incremental() {
        let pairs = vec![
            ("a".to_string(), rect(0.0, 0.0, 1.0, 1.0)),
            ("b".to_string(), rect(0.5, 0.5, 2.0, 2.0)),
            ("c".to_string(), rect(5.0, 5.0, 6.0, 6.0)),
        ];
        let bulk = SpatialIndex::bulk_load(pairs.clone()).unwrap();

        let mut incremental = SpatialIndex::new();
        for (id, r) in &pairs {
            incremental.insert(id, r).unwrap();
        }

        let mut bulk_hits = bulk.query(&rect(0.0, 0.0, 1.0, 1.0));
        let mut incr_hits = incremental.query(&rect(0.0, 0.0, 1.0, 1.0));
        bulk_hits.sort();
        incr_hits.sort();
        assert_eq!(bulk_hits, incr_hits);
        assert_eq!(bulk.len(), 3);
    }

    #[test]
    fn test_bulk_load_duplicate_fails() {
        let pairs = vec![
            ("a".to_string(), rect(0.0, 0.0, 1.0, 1.0)),
            ("a".to_string(), rect(2.0, 2.0, 3.0, 3.0)),
        ];
        assert!(SpatialIndex::bulk_load(pairs).is_err());
    }
}
