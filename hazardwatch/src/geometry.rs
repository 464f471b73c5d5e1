//! Spherical distance, bearing and polyline projection.
//!
//! Everything here is pure. Malformed input (NaN coordinates, empty
//! polylines) yields `None` instead of panicking, so one bad record never
//! aborts a batch.
use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula, in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A point on the globe in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lng: f64,
}

impl LatLng {
    /// Create a new point.
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Build a point from a GeoJSON style `[lng, lat]` pair.
    #[must_use]
    pub const fn from_lng_lat([lng, lat]: [f64; 2]) -> Self {
        Self { lat, lng }
    }

    /// Finite and inside the usual latitude/longitude ranges.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

#[cfg(feature = "geo")]
impl From<LatLng> for geo::Point<f64> {
    fn from(value: LatLng) -> Self {
        geo::point! { x: value.lng, y: value.lat }
    }
}

#[cfg(feature = "geo")]
impl From<geo::Point<f64>> for LatLng {
    fn from(value: geo::Point<f64>) -> Self {
        Self::new(value.y(), value.x())
    }
}

/// Great-circle distance in meters between `a` and `b`.
#[must_use]
pub fn distance(a: LatLng, b: LatLng) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Initial bearing from `a` towards `b`, in degrees within `[0, 360)`.
#[must_use]
pub fn bearing(a: LatLng, b: LatLng) -> f64 {
    let d_lng = (b.lng - a.lng).to_radians();
    let (lat1, lat2) = (a.lat.to_radians(), b.lat.to_radians());

    let x = d_lng.sin() * lat2.cos();
    let y = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * d_lng.cos();

    let deg = x.atan2(y).to_degrees().rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs
    if deg >= 360.0 {
        0.0
    } else {
        deg
    }
}

/// Total arc length of a polyline in meters.
#[must_use]
pub fn polyline_length(polyline: &[LatLng]) -> f64 {
    polyline.windows(2).map(|w| distance(w[0], w[1])).sum()
}

/// Result of projecting a point onto a single segment.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SegmentProjection {
    /// Closest point on the segment.
    pub closest_point: LatLng,
    /// Haversine distance from the input point to `closest_point`.
    pub distance: f64,
    /// How far into the segment `closest_point` lies, within `[0, 1]`.
    pub fraction: f64,
}

/// Project `point` onto the segment `start..end`.
///
/// The projection parameter is solved on raw latitude/longitude deltas,
/// which is accurate enough at the tens-to-hundreds of meters tolerances
/// route matching works with. Degenerate segments project onto `start`.
#[must_use]
pub fn project_to_segment(point: LatLng, start: LatLng, end: LatLng) -> Option<SegmentProjection> {
    if !(point.is_valid() && start.is_valid() && end.is_valid()) {
        return None;
    }

    let (dx, dy) = (end.lat - start.lat, end.lng - start.lng);
    let len_sq = dx.mul_add(dx, dy * dy);

    let fraction = if len_sq == 0.0 {
        0.0
    } else {
        let dot = (point.lat - start.lat).mul_add(dx, (point.lng - start.lng) * dy);
        (dot / len_sq).clamp(0.0, 1.0)
    };

    let closest_point = LatLng::new(
        fraction.mul_add(dx, start.lat),
        fraction.mul_add(dy, start.lng),
    );

    Some(SegmentProjection {
        closest_point,
        distance: distance(point, closest_point),
        fraction,
    })
}

/// Result of projecting a point onto a polyline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolylineProjection {
    /// Distance from the point to the closest point on the polyline.
    pub distance: f64,
    /// Arc length from the first vertex to `closest_point`.
    pub distance_along_route: f64,
    /// `distance_along_route` divided by total length, 0 for zero-length lines.
    pub progress: f64,
    /// Index of the segment containing `closest_point`.
    pub segment_index: usize,
    /// Closest point on the polyline.
    pub closest_point: LatLng,
}

/// Project `point` onto `polyline`, keeping the closest segment.
///
/// Returns `None` for an empty polyline or invalid coordinates.
#[must_use]
pub fn project_to_polyline(point: LatLng, polyline: &[LatLng]) -> Option<PolylineProjection> {
    match polyline {
        [] => None,
        [only] => project_to_segment(point, *only, *only).map(|p| PolylineProjection {
            distance: p.distance,
            distance_along_route: 0.0,
            progress: 0.0,
            segment_index: 0,
            closest_point: p.closest_point,
        }),
        _ => {
            let mut best: Option<PolylineProjection> = None;
            let mut travelled = 0.0;

            for (i, w) in polyline.windows(2).enumerate() {
                let seg_len = distance(w[0], w[1]);
                let proj = project_to_segment(point, w[0], w[1])?;

                if best.map_or(true, |b| proj.distance < b.distance) {
                    best = Some(PolylineProjection {
                        distance: proj.distance,
                        distance_along_route: proj.fraction.mul_add(seg_len, travelled),
                        progress: 0.0,
                        segment_index: i,
                        closest_point: proj.closest_point,
                    });
                }

                travelled += seg_len;
            }

            best.map(|mut b| {
                if travelled > 0.0 {
                    b.progress = (b.distance_along_route / travelled).clamp(0.0, 1.0);
                }
                b
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        bearing, distance, polyline_length, project_to_polyline, project_to_segment, LatLng,
    };

    /// Degrees of latitude spanning `meters` on the haversine sphere.
    fn lat_span(meters: f64) -> f64 {
        (meters / super::EARTH_RADIUS_M).to_degrees()
    }

    #[test]
    fn distance_to_self_is_zero() {
        let a = LatLng::new(58.1467, 8.0059);
        assert_eq!(distance(a, a), 0.0);
    }

    #[test]
    fn distance_is_symmetric() {
        let oslo = LatLng::new(59.9139, 10.7522);
        let bergen = LatLng::new(60.3913, 5.3221);

        assert!((distance(oslo, bergen) - distance(bergen, oslo)).abs() < 1e-6);
        // roughly 305 km as the crow flies
        assert!((distance(oslo, bergen) - 305_000.0).abs() < 5_000.0);
    }

    #[test]
    fn bearing_cardinal_directions() {
        let origin = LatLng::new(0.0, 0.0);

        assert!(bearing(origin, LatLng::new(1.0, 0.0)).abs() < 1e-9);
        assert!((bearing(origin, LatLng::new(0.0, 1.0)) - 90.0).abs() < 1e-9);
        assert!((bearing(origin, LatLng::new(-1.0, 0.0)) - 180.0).abs() < 1e-9);
        assert!((bearing(origin, LatLng::new(0.0, -1.0)) - 270.0).abs() < 1e-9);
    }

    #[test]
    fn segment_start_projects_onto_itself() {
        let start = LatLng::new(58.0, 8.0);
        let end = LatLng::new(58.01, 8.02);
        let p = project_to_segment(start, start, end).unwrap();

        assert_eq!(p.fraction, 0.0);
        assert_eq!(p.distance, 0.0);
    }

    #[test]
    fn segment_clamps_beyond_end() {
        let start = LatLng::new(58.0, 8.0);
        let end = LatLng::new(58.01, 8.0);
        let p = project_to_segment(LatLng::new(58.02, 8.0), start, end).unwrap();

        assert_eq!(p.fraction, 1.0);
        assert_eq!(p.closest_point, end);
        assert!((p.distance - distance(end, LatLng::new(58.02, 8.0))).abs() < 1e-6);
    }

    #[test]
    fn degenerate_segment() {
        let a = LatLng::new(58.0, 8.0);
        let p = project_to_segment(LatLng::new(58.001, 8.0), a, a).unwrap();

        assert_eq!(p.fraction, 0.0);
        assert_eq!(p.closest_point, a);
    }

    #[test]
    fn nan_is_no_match() {
        let a = LatLng::new(58.0, 8.0);
        let nan = LatLng::new(f64::NAN, 8.0);

        assert!(project_to_segment(nan, a, a).is_none());
        assert!(project_to_polyline(nan, &[a, LatLng::new(58.1, 8.0)]).is_none());
        assert!(project_to_polyline(a, &[]).is_none());
    }

    #[test]
    fn arc_length_projection() {
        let a = LatLng::new(58.0, 8.0);
        let b = LatLng::new(58.0 + lat_span(1000.0), 8.0);
        let c = LatLng::new(58.0 + lat_span(2000.0), 8.0);
        let mid = LatLng::new(58.0 + lat_span(500.0), 8.0);

        let p = project_to_polyline(mid, &[a, b, c]).unwrap();

        assert!((p.distance_along_route - 500.0).abs() < 1.0);
        assert!((p.progress - 0.25).abs() < 1e-3);
        assert_eq!(p.segment_index, 0);
        assert!(p.distance < 1.0);
        assert!((polyline_length(&[a, b, c]) - 2000.0).abs() < 1.0);
    }

    #[test]
    fn progress_grows_along_polyline() {
        let line: Vec<_> = (0..5)
            .map(|i| LatLng::new(58.0 + lat_span(f64::from(i) * 400.0), 8.0))
            .collect();

        let mut last = 0.0;
        for i in 0..=16 {
            let probe = LatLng::new(58.0 + lat_span(f64::from(i) * 100.0), 8.003);
            let p = project_to_polyline(probe, &line).unwrap();
            assert!(p.progress >= last);
            last = p.progress;
        }
    }

    #[test]
    fn single_vertex_polyline() {
        let only = LatLng::new(58.0, 8.0);
        let p = project_to_polyline(LatLng::new(58.001, 8.0), &[only]).unwrap();

        assert_eq!(p.progress, 0.0);
        assert_eq!(p.distance_along_route, 0.0);
        assert!((p.distance - 111.2).abs() < 1.0);
    }

    #[cfg(feature = "geo")]
    #[test]
    fn agrees_with_geo() {
        use geo::prelude::HaversineDistance;

        let a = LatLng::new(58.1467, 8.0059);
        let b = LatLng::new(58.0294, 7.4609);
        let theirs = geo::Point::from(a).haversine_distance(&geo::Point::from(b));

        // geo uses a slightly larger mean radius
        assert!((distance(a, b) - theirs).abs() / theirs < 1e-5);
    }
}
