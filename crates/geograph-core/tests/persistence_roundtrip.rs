//! Integration tests for the save/load round-trip.
//!
//! Structural equality of tables, graph edges, and edge attributes must
//! survive the directory round-trip, including empty-table degeneracy,
//! unknown wire fields, and bit-identical canonical-CRS geometries.

use std::fs;

use geo::{polygon, Geometry};
use serde_json::{json, Value};
use tempfile::TempDir;

use geograph_core::{
    Connector, DownloadError, DownloadParams, EdgeLabel, RasterDownloader, RasterRecord,
    VectorRecord, ATTRS_FILENAME, CONNECTOR_DIR_NAME, DEFAULT_CRS_EPSG, GRAPH_FILENAME,
    VECTORS_FILENAME,
};

fn square(xmin: f64, ymin: f64, size: f64) -> Geometry<f64> {
    Geometry::Polygon(polygon![
        (x: xmin, y: ymin),
        (x: xmin + size, y: ymin),
        (x: xmin + size, y: ymin + size),
        (x: xmin, y: ymin + size),
        (x: xmin, y: ymin),
    ])
}

/// 10 adjacent rasters in a strip, 100 small features walking across them.
///
/// Features at `x % 10 <= 8` are contained in exactly one raster; features
/// at `x % 10 == 9` straddle two rasters (or run off the strip's end) and
/// only intersect.
fn strip_dataset(data_dir: &std::path::Path) -> Connector {
    let mut c = Connector::from_scratch(
        data_dir,
        DEFAULT_CRS_EPSG,
        vec!["field".to_string()],
        Some("background".to_string()),
    )
    .unwrap();

    let rasters: Vec<RasterRecord> = (0..10)
        .map(|k| {
            RasterRecord::new(format!("r{k}"), square(k as f64 * 10.0, 0.0, 10.0))
                .with_attr("band_count", json!(13))
        })
        .collect();
    c.add_rasters(rasters, None).unwrap();

    let features: Vec<VectorRecord> = (0..100)
        .map(|i| {
            VectorRecord::new(format!("f{i:03}"), square(i as f64, 4.0, 2.0)).with_class("field")
        })
        .collect();
    c.add_vectors(features, None).unwrap();
    c
}

#[test]
fn test_bulk_round_trip_is_structurally_equal() {
    let dir = TempDir::new().unwrap();
    let original = strip_dataset(dir.path());

    // 90 contained features with one edge each; the 10 stragglers produce
    // two intersect edges except the last, which runs off the strip
    let contains = original
        .graph()
        .edges_in_order()
        .iter()
        .filter(|(_, _, e)| e.label == EdgeLabel::Contains)
        .count();
    let intersects = original.graph().edge_count() - contains;
    assert_eq!(contains, 90);
    assert_eq!(intersects, 19);

    original.save().unwrap();
    let loaded = Connector::from_data_dir(dir.path()).unwrap();

    assert_eq!(loaded.vectors(), original.vectors());
    assert_eq!(loaded.rasters(), original.rasters());
    assert_eq!(loaded.graph(), original.graph());
    assert_eq!(loaded.attrs(), original.attrs());
    loaded.check_consistency().unwrap();
}

#[test]
fn test_loaded_connector_stays_mutable() {
    let dir = TempDir::new().unwrap();
    strip_dataset(dir.path()).save().unwrap();

    let mut loaded = Connector::from_data_dir(dir.path()).unwrap();
    loaded.drop_rasters(&["r0".to_string()], None).unwrap();
    loaded
        .add_vectors(vec![VectorRecord::new("extra", square(15.0, 4.0, 2.0))], None)
        .unwrap();

    assert_eq!(loaded.rasters_containing("extra").unwrap(), vec!["r1"]);
    loaded.check_consistency().unwrap();
    loaded.save().unwrap();
    Connector::from_data_dir(dir.path())
        .unwrap()
        .check_consistency()
        .unwrap();
}

#[test]
fn test_empty_connector_round_trip() {
    let dir = TempDir::new().unwrap();
    let c = Connector::from_scratch(dir.path(), DEFAULT_CRS_EPSG, vec![], None).unwrap();
    c.save().unwrap();

    // the empty tables serialize as explicit empty collections
    let raw: Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join(CONNECTOR_DIR_NAME).join(VECTORS_FILENAME)).unwrap(),
    )
    .unwrap();
    assert_eq!(raw["type"], json!("FeatureCollection"));
    assert_eq!(raw["features"], json!([]));

    let loaded = Connector::from_data_dir(dir.path()).unwrap();
    assert!(loaded.vectors().is_empty());
    assert!(loaded.rasters().is_empty());
    assert_eq!(loaded.attrs(), c.attrs());
    loaded.check_consistency().unwrap();
}

#[test]
fn test_canonical_crs_geometry_is_bit_identical() {
    let dir = TempDir::new().unwrap();
    let mut c = Connector::from_scratch(dir.path(), DEFAULT_CRS_EPSG, vec![], None).unwrap();

    // awkward fractions that must survive the JSON round-trip exactly
    let geometry = Geometry::Polygon(polygon![
        (x: 0.1, y: 0.2),
        (x: 10.000000000000002, y: 0.3),
        (x: 9.7, y: 7.123456789012345),
        (x: 0.1, y: 0.2),
    ]);
    c.add_vectors(vec![VectorRecord::new("f", geometry.clone())], None)
        .unwrap();
    c.save().unwrap();

    let loaded = Connector::from_data_dir(dir.path()).unwrap();
    assert_eq!(loaded.vectors().get_row("f").unwrap().geometry, geometry);
}

#[test]
fn test_unknown_graph_fields_survive_save_load_save() {
    let dir = TempDir::new().unwrap();
    let mut c = Connector::from_scratch(dir.path(), DEFAULT_CRS_EPSG, vec![], None).unwrap();
    c.add_rasters(vec![RasterRecord::new("r", square(0.0, 0.0, 10.0))], None)
        .unwrap();
    c.add_vectors(vec![VectorRecord::new("f", square(4.0, 4.0, 2.0))], None)
        .unwrap();
    c.save().unwrap();

    // a future version annotates the graph file; this build must carry the
    // annotations through untouched
    let graph_path = dir.path().join(CONNECTOR_DIR_NAME).join(GRAPH_FILENAME);
    let mut raw: Value = serde_json::from_str(&fs::read_to_string(&graph_path).unwrap()).unwrap();
    raw["checksum"] = json!("abc123");
    raw["vertices"][0]["annotated"] = json!(true);
    raw["edges"][0]["reviewed"] = json!("yes");
    fs::write(&graph_path, serde_json::to_string_pretty(&raw).unwrap()).unwrap();

    let reloaded = Connector::from_data_dir(dir.path()).unwrap();
    reloaded.save().unwrap();

    let rewritten: Value = serde_json::from_str(&fs::read_to_string(&graph_path).unwrap()).unwrap();
    assert_eq!(rewritten["checksum"], json!("abc123"));
    assert_eq!(rewritten["vertices"][0]["annotated"], json!(true));
    assert_eq!(rewritten["edges"][0]["reviewed"], json!("yes"));
}

#[test]
fn test_extra_dataset_attrs_survive_round_trip() {
    let dir = TempDir::new().unwrap();
    let c = Connector::from_scratch(dir.path(), DEFAULT_CRS_EPSG, vec![], None).unwrap();
    c.save().unwrap();

    let attrs_path = dir.path().join(CONNECTOR_DIR_NAME).join(ATTRS_FILENAME);
    let mut raw: Value = serde_json::from_str(&fs::read_to_string(&attrs_path).unwrap()).unwrap();
    raw["campaign"] = json!("alps-2024");
    fs::write(&attrs_path, serde_json::to_string_pretty(&raw).unwrap()).unwrap();

    let loaded = Connector::from_data_dir(dir.path()).unwrap();
    assert_eq!(loaded.attrs().extra["campaign"], json!("alps-2024"));

    loaded.save().unwrap();
    let rewritten: Value = serde_json::from_str(&fs::read_to_string(&attrs_path).unwrap()).unwrap();
    assert_eq!(rewritten["campaign"], json!("alps-2024"));
}

#[test]
fn test_download_failures_survive_round_trip() {
    struct AlwaysFails;
    impl RasterDownloader for AlwaysFails {
        fn download(
            &mut self,
            _connector: &Connector,
            feature_id: &str,
            _params: &DownloadParams,
        ) -> Result<Vec<RasterRecord>, DownloadError> {
            Err(DownloadError::for_raster(
                format!("{feature_id}_scene"),
                anyhow::anyhow!("no quota left"),
            ))
        }
    }

    let dir = TempDir::new().unwrap();
    let mut c = Connector::from_scratch(dir.path(), DEFAULT_CRS_EPSG, vec![], None).unwrap();
    c.add_vectors(vec![VectorRecord::new("f", square(0.0, 0.0, 2.0))], None)
        .unwrap();
    c.download_rasters(&mut AlwaysFails, &["f".to_string()], &DownloadParams::default())
        .unwrap();
    assert_eq!(c.failures().len(), 1);
    c.save().unwrap();

    let loaded = Connector::from_data_dir(dir.path()).unwrap();
    assert_eq!(loaded.failures(), c.failures());
    let failure = &loaded.failures()["f_scene"];
    assert_eq!(failure.feature_id, "f");
    assert!(failure.error.contains("no quota left"));
}
