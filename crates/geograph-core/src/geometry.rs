//! Geometry adapter.
//!
//! A thin uniform interface over the `geo` crate for the operations the
//! connector needs: bounds, boundary-closed containment, intersection,
//! validation, and reprojection between the supported CRSs.
//!
//! Containment is deliberately the DE-9IM *covers* relation rather than
//! *contains*: a feature touching a raster footprint's boundary from the
//! inside still counts as contained.

use geo::{coord, Area, BoundingRect, Coord, CoordsIter, Geometry, Intersects, Rect, Relate, Validation};
use serde_json::{json, Value};

use crate::errors::{GeographError, Result};

/// EPSG code for WGS84 geographic coordinates.
pub const EPSG_WGS84: u32 = 4326;

/// EPSG code for spherical web-mercator.
pub const EPSG_WEB_MERCATOR: u32 = 3857;

/// Earth radius used by the spherical mercator projection, in metres.
const EARTH_RADIUS_M: f64 = 6_378_137.0;

// ============================================================================
// Validation
// ============================================================================

/// Validate a geometry for use in the connector.
///
/// Accepted kinds are points, polygons, and multipolygons. Empty
/// geometries, zero-area polygons, non-finite coordinates, and
/// self-intersecting rings are rejected.
pub fn validate(id: &str, geometry: &Geometry<f64>) -> Result<()> {
    match geometry {
        Geometry::Point(_) | Geometry::Polygon(_) | Geometry::MultiPolygon(_) => {}
        other => {
            return Err(GeographError::InvalidGeometry {
                id: id.to_string(),
                reason: format!("unsupported geometry kind: {}", kind_name(other)),
            });
        }
    }

    if geometry.coords_count() == 0 {
        return Err(GeographError::InvalidGeometry {
            id: id.to_string(),
            reason: "empty geometry".to_string(),
        });
    }

    if geometry
        .coords_iter()
        .any(|c| !c.x.is_finite() || !c.y.is_finite())
    {
        return Err(GeographError::InvalidGeometry {
            id: id.to_string(),
            reason: "non-finite coordinates".to_string(),
        });
    }

    if matches!(geometry, Geometry::Polygon(_) | Geometry::MultiPolygon(_))
        && area(geometry) == 0.0
    {
        return Err(GeographError::InvalidGeometry {
            id: id.to_string(),
            reason: "zero-area polygon".to_string(),
        });
    }

    if !geometry.is_valid() {
        return Err(GeographError::InvalidGeometry {
            id: id.to_string(),
            reason: "malformed or self-intersecting ring".to_string(),
        });
    }

    Ok(())
}

/// Unsigned area of a geometry, in CRS units. Zero for points.
pub fn area(geometry: &Geometry<f64>) -> f64 {
    geometry.unsigned_area()
}

/// Axis-aligned bounding rectangle of a geometry.
pub fn bounds(id: &str, geometry: &Geometry<f64>) -> Result<Rect<f64>> {
    geometry
        .bounding_rect()
        .ok_or_else(|| GeographError::InvalidGeometry {
            id: id.to_string(),
            reason: "empty geometry has no bounds".to_string(),
        })
}

// ============================================================================
// Predicates
// ============================================================================

/// Boundary-closed containment: does `a` cover `b`?
pub fn covers(a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
    a.relate(b).is_covers()
}

/// Boundary-inclusive intersection test.
pub fn intersects(a: &Geometry<f64>, b: &Geometry<f64>) -> bool {
    a.intersects(b)
}

/// How a raster footprint relates to a feature geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FootprintRelation {
    /// The footprint covers the feature (boundary-closed).
    Contains,
    /// The interiors share two-dimensional area, but no containment.
    Intersects,
    /// Disjoint, or only a zero-area contact from outside.
    Disjoint,
}

/// Classify a footprint/feature pair with a single DE-9IM evaluation.
///
/// A feature on the footprint boundary counts as contained; a zero-area
/// contact from outside (shared edge or corner) yields no relation at all.
pub fn classify_footprint(
    footprint: &Geometry<f64>,
    feature: &Geometry<f64>,
) -> FootprintRelation {
    use geo::coordinate_position::CoordPos;
    use geo::dimensions::Dimensions;

    let matrix = footprint.relate(feature);
    if matrix.is_covers() {
        FootprintRelation::Contains
    } else if matrix.get(CoordPos::Inside, CoordPos::Inside) == Dimensions::TwoDimensional {
        FootprintRelation::Intersects
    } else {
        FootprintRelation::Disjoint
    }
}

// ============================================================================
// Reprojection
// ============================================================================

/// Reproject a geometry between two EPSG codes.
///
/// An identical CRS pair is an identity no-op. The supported transforms are
/// EPSG:4326 <-> EPSG:3857; any other pair is an [`GeographError::UnsupportedCrs`].
/// Output coordinates are re-checked for finiteness so that e.g. a pole
/// pushed through the mercator forward transform fails the whole row.
pub fn reproject(
    id: &str,
    geometry: &Geometry<f64>,
    from_epsg: u32,
    to_epsg: u32,
) -> Result<Geometry<f64>> {
    use geo::MapCoords;

    if from_epsg == to_epsg {
        return Ok(geometry.clone());
    }

    let projected = match (from_epsg, to_epsg) {
        (EPSG_WGS84, EPSG_WEB_MERCATOR) => geometry.map_coords(wgs84_to_mercator),
        (EPSG_WEB_MERCATOR, EPSG_WGS84) => geometry.map_coords(mercator_to_wgs84),
        _ => {
            return Err(GeographError::UnsupportedCrs { from_epsg, to_epsg });
        }
    };

    if projected
        .coords_iter()
        .any(|c| !c.x.is_finite() || !c.y.is_finite())
    {
        return Err(GeographError::ReprojectionFailed {
            id: id.to_string(),
            from_epsg,
            to_epsg,
        });
    }

    Ok(projected)
}

/// Forward spherical mercator: lon/lat degrees to metres.
fn wgs84_to_mercator(c: Coord<f64>) -> Coord<f64> {
    let x = EARTH_RADIUS_M * c.x.to_radians();
    let y = EARTH_RADIUS_M * ((90.0 + c.y) * std::f64::consts::PI / 360.0).tan().ln();
    coord! { x: x, y: y }
}

/// Inverse spherical mercator: metres to lon/lat degrees.
fn mercator_to_wgs84(c: Coord<f64>) -> Coord<f64> {
    let lon = (c.x / EARTH_RADIUS_M).to_degrees();
    let lat = (2.0 * (c.y / EARTH_RADIUS_M).exp().atan()).to_degrees() - 90.0;
    coord! { x: lon, y: lat }
}

// ============================================================================
// GeoJSON geometry encoding
// ============================================================================

/// Encode a geometry as a GeoJSON geometry object.
pub fn to_geojson(geometry: &Geometry<f64>) -> Value {
    match geometry {
        Geometry::Point(p) => json!({
            "type": "Point",
            "coordinates": [p.x(), p.y()],
        }),
        Geometry::Polygon(p) => json!({
            "type": "Polygon",
            "coordinates": polygon_coordinates(p),
        }),
        Geometry::MultiPolygon(mp) => json!({
            "type": "MultiPolygon",
            "coordinates": mp.0.iter().map(polygon_coordinates).collect::<Vec<_>>(),
        }),
        // validate() keeps other kinds out of the tables
        other => json!({
            "type": kind_name(other),
            "coordinates": Value::Null,
        }),
    }
}

/// Decode a GeoJSON geometry object.
pub fn from_geojson(id: &str, value: &Value) -> Result<Geometry<f64>> {
    let invalid = |reason: &str| GeographError::InvalidGeometry {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("geometry object has no `type`"))?;
    let coordinates = value
        .get("coordinates")
        .ok_or_else(|| invalid("geometry object has no `coordinates`"))?;

    match kind {
        "Point" => {
            let position = decode_position(id, coordinates)?;
            Ok(Geometry::Point(geo::Point(position)))
        }
        "Polygon" => Ok(Geometry::Polygon(decode_polygon(id, coordinates)?)),
        "MultiPolygon" => {
            let polygons = coordinates
                .as_array()
                .ok_or_else(|| invalid("MultiPolygon coordinates must be an array"))?
                .iter()
                .map(|p| decode_polygon(id, p))
                .collect::<Result<Vec<_>>>()?;
            Ok(Geometry::MultiPolygon(geo::MultiPolygon(polygons)))
        }
        other => Err(invalid(&format!("unsupported geometry kind: {other}"))),
    }
}

fn polygon_coordinates(polygon: &geo::Polygon<f64>) -> Vec<Vec<[f64; 2]>> {
    std::iter::once(polygon.exterior())
        .chain(polygon.interiors().iter())
        .map(|ring| ring.coords().map(|c| [c.x, c.y]).collect())
        .collect()
}

fn decode_position(id: &str, value: &Value) -> Result<Coord<f64>> {
    let pair = value
        .as_array()
        .filter(|a| a.len() >= 2)
        .ok_or_else(|| GeographError::InvalidGeometry {
            id: id.to_string(),
            reason: "position must be an [x, y] array".to_string(),
        })?;
    let x = pair[0].as_f64();
    let y = pair[1].as_f64();
    match (x, y) {
        (Some(x), Some(y)) => Ok(coord! { x: x, y: y }),
        _ => Err(GeographError::InvalidGeometry {
            id: id.to_string(),
            reason: "position coordinates must be numbers".to_string(),
        }),
    }
}

fn decode_polygon(id: &str, value: &Value) -> Result<geo::Polygon<f64>> {
    let rings = value
        .as_array()
        .filter(|a| !a.is_empty())
        .ok_or_else(|| GeographError::InvalidGeometry {
            id: id.to_string(),
            reason: "Polygon coordinates must be a non-empty array of rings".to_string(),
        })?
        .iter()
        .map(|ring| {
            let coords = ring
                .as_array()
                .ok_or_else(|| GeographError::InvalidGeometry {
                    id: id.to_string(),
                    reason: "ring must be an array of positions".to_string(),
                })?
                .iter()
                .map(|p| decode_position(id, p))
                .collect::<Result<Vec<_>>>()?;
            Ok(geo::LineString::from(coords))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut rings = rings.into_iter();
    let exterior = rings.next().expect("ring list checked non-empty");
    Ok(geo::Polygon::new(exterior, rings.collect()))
}

fn kind_name(geometry: &Geometry<f64>) -> &'static str {
    match geometry {
        Geometry::Point(_) => "Point",
        Geometry::Line(_) => "Line",
        Geometry::LineString(_) => "LineString",
        Geometry::Polygon(_) => "Polygon",
        Geometry::MultiPoint(_) => "MultiPoint",
        Geometry::MultiLineString(_) => "MultiLineString",
        Geometry::MultiPolygon(_) => "MultiPolygon",
        Geometry::GeometryCollection(_) => "GeometryCollection",
        Geometry::Rect(_) => "Rect",
        Geometry::Triangle(_) => "Triangle",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn unit_square() -> Geometry<f64> {
        Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 10.0, y: 10.0),
            (x: 0.0, y: 10.0),
            (x: 0.0, y: 0.0),
        ])
    }

    #[test]
    fn test_validate_accepts_square() {
        validate("f1", &unit_square()).unwrap();
    }

    #[test]
    fn test_validate_rejects_empty_multipolygon() {
        let empty = Geometry::MultiPolygon(geo::MultiPolygon::<f64>(vec![]));
        let err = validate("f1", &empty).unwrap_err();
        assert!(matches!(err, GeographError::InvalidGeometry { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_area_polygon() {
        let degenerate = Geometry::Polygon(polygon![
            (x: 0.0, y: 0.0),
            (x: 5.0, y: 0.0),
            (x: 10.0, y: 0.0),
            (x: 0.0, y: 0.0),
        ]);
        let err = validate("f1", &degenerate).unwrap_err();
        assert!(matches!(err, GeographError::InvalidGeometry { .. }));
    }

    #[test]
    fn test_validate_rejects_line_string() {
        let line = Geometry::LineString(geo::LineString::from(vec![(0.0, 0.0), (1.0, 1.0)]));
        assert!(validate("f1", &line).is_err());
    }

    #[test]
    fn test_boundary_touching_counts_as_covered() {
        // A polygon sharing an edge with the footprint boundary.
        let edge_hugger = Geometry::Polygon(polygon![
            (x: 8.0, y: 3.0),
            (x: 10.0, y: 3.0),
            (x: 10.0, y: 7.0),
            (x: 8.0, y: 7.0),
            (x: 8.0, y: 3.0),
        ]);
        assert!(covers(&unit_square(), &edge_hugger));
        assert!(intersects(&unit_square(), &edge_hugger));
    }

    #[test]
    fn test_overhang_is_intersecting_not_covered() {
        let overhang = Geometry::Polygon(polygon![
            (x: 9.0, y: 3.0),
            (x: 13.0, y: 3.0),
            (x: 13.0, y: 7.0),
            (x: 9.0, y: 7.0),
            (x: 9.0, y: 3.0),
        ]);
        assert!(!covers(&unit_square(), &overhang));
        assert!(intersects(&unit_square(), &overhang));
    }

    #[test]
    fn test_disjoint_geometries() {
        let far = Geometry::Point(geo::Point::new(100.0, 100.0));
        assert!(!covers(&unit_square(), &far));
        assert!(!intersects(&unit_square(), &far));
    }

    #[test]
    fn test_classify_footprint_variants() {
        let inside = Geometry::Point(geo::Point::new(5.0, 5.0));
        let on_boundary = Geometry::Point(geo::Point::new(10.0, 5.0));
        let overhang = Geometry::Polygon(polygon![
            (x: 9.0, y: 3.0),
            (x: 13.0, y: 3.0),
            (x: 13.0, y: 7.0),
            (x: 9.0, y: 7.0),
            (x: 9.0, y: 3.0),
        ]);
        // shares the x=10 edge from the outside: zero-area contact
        let outside_neighbor = Geometry::Polygon(polygon![
            (x: 10.0, y: 3.0),
            (x: 14.0, y: 3.0),
            (x: 14.0, y: 7.0),
            (x: 10.0, y: 7.0),
            (x: 10.0, y: 3.0),
        ]);

        let square = unit_square();
        assert_eq!(classify_footprint(&square, &inside), FootprintRelation::Contains);
        assert_eq!(
            classify_footprint(&square, &on_boundary),
            FootprintRelation::Contains
        );
        assert_eq!(
            classify_footprint(&square, &overhang),
            FootprintRelation::Intersects
        );
        assert_eq!(
            classify_footprint(&square, &outside_neighbor),
            FootprintRelation::Disjoint
        );
    }

    #[test]
    fn test_reproject_identity_is_noop() {
        let square = unit_square();
        let same = reproject("f1", &square, EPSG_WGS84, EPSG_WGS84).unwrap();
        assert_eq!(square, same);
    }

    #[test]
    fn test_reproject_mercator_round_trip() {
        let point = Geometry::Point(geo::Point::new(13.4, 52.5));
        let forward = reproject("f1", &point, EPSG_WGS84, EPSG_WEB_MERCATOR).unwrap();
        let back = reproject("f1", &forward, EPSG_WEB_MERCATOR, EPSG_WGS84).unwrap();

        let Geometry::Point(p) = back else {
            panic!("expected point");
        };
        assert!((p.x() - 13.4).abs() < 1e-9);
        assert!((p.y() - 52.5).abs() < 1e-9);
    }

    #[test]
    fn test_reproject_unsupported_pair() {
        let err = reproject("f1", &unit_square(), EPSG_WGS84, 25832).unwrap_err();
        assert!(matches!(err, GeographError::UnsupportedCrs { .. }));
    }

    #[test]
    fn test_reproject_pole_fails() {
        // mercator sends the south pole to -infinity
        let pole = Geometry::Point(geo::Point::new(0.0, -90.0));
        let err = reproject("f1", &pole, EPSG_WGS84, EPSG_WEB_MERCATOR).unwrap_err();
        assert!(matches!(err, GeographError::ReprojectionFailed { .. }));
    }

    #[test]
    fn test_geojson_round_trip_polygon() {
        let square = unit_square();
        let encoded = to_geojson(&square);
        let decoded = from_geojson("f1", &encoded).unwrap();
        assert_eq!(square, decoded);
    }

    #[test]
    fn test_geojson_round_trip_point() {
        let point = Geometry::Point(geo::Point::new(5.25, -3.5));
        let decoded = from_geojson("f1", &to_geojson(&point)).unwrap();
        assert_eq!(point, decoded);
    }

    #[test]
    fn test_geojson_rejects_garbage() {
        let err = from_geojson("f1", &json!({"type": "Polygon"})).unwrap_err();
        assert!(matches!(err, GeographError::InvalidGeometry { .. }));
    }

    #[test]
    fn test_bounds_of_square() {
        let rect = bounds("f1", &unit_square()).unwrap();
        assert_eq!(rect.min().x, 0.0);
        assert_eq!(rect.max().y, 10.0);
    }
}
