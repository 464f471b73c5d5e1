//! Matching hazards against a planned route.
use std::{rc::Rc, time::Instant};

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;
#[cfg(feature = "tracing")]
use tracing::{info, instrument, warn};

use crate::{
    geometry::{polyline_length, project_to_polyline, LatLng},
    hazard::{Hazard, HazardCache, SharedCache},
    report::{ReportContext, ReportingPipeline, RouteSummary},
    scanner::{EventHub, ScanEvent, ScanMethod, ScanStats},
};

fn line_string() -> String {
    "LineString".to_owned()
}

/// Path geometry as returned by a routing provider: a GeoJSON LineString
/// with `[lng, lat]` vertices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteGeometry {
    /// GeoJSON geometry type, always `LineString`.
    #[serde(rename = "type", default = "line_string")]
    pub kind: String,
    /// Vertices as `[lng, lat]`.
    pub coordinates: Vec<[f64; 2]>,
    /// Total length in meters, as computed by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    /// Expected travel time in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
}

impl RouteGeometry {
    /// A LineString through `polyline`, with its arc length as distance.
    #[must_use]
    pub fn from_polyline(polyline: &[LatLng]) -> Self {
        Self {
            kind: line_string(),
            coordinates: polyline.iter().map(|p| [p.lng, p.lat]).collect(),
            distance: Some(polyline_length(polyline)),
            duration: None,
        }
    }

    /// Vertices as [`LatLng`].
    #[must_use]
    pub fn polyline(&self) -> Vec<LatLng> {
        self.coordinates.iter().copied().map(LatLng::from_lng_lat).collect()
    }

    /// The provider's distance, or the arc length of the vertices.
    #[must_use]
    pub fn length(&self) -> f64 {
        self.distance.unwrap_or_else(|| polyline_length(&self.polyline()))
    }
}

/// A hazard within tolerance of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteMatch {
    /// The matched hazard.
    #[serde(flatten)]
    pub hazard: Hazard,
    /// Meters between the hazard and the closest point on the route.
    pub distance_from_route: f64,
    /// Meters from the route start to the closest point.
    pub distance_along_route: f64,
    /// `distance_along_route` over the route length, in `[0, 1]`.
    pub progress: f64,
    /// Closest point on the route.
    pub closest_point: LatLng,
}

impl RouteMatch {
    /// Project `hazard` onto `polyline`.
    #[must_use]
    pub fn project(hazard: &Hazard, polyline: &[LatLng]) -> Option<Self> {
        let projection = project_to_polyline(hazard.location(), polyline)?;
        Some(Self {
            hazard: hazard.clone(),
            distance_from_route: projection.distance,
            distance_along_route: projection.distance_along_route,
            progress: projection.progress,
            closest_point: projection.closest_point,
        })
    }
}

/// A match as reported by a route-scan service. Services that only know
/// the distance from the route leave the rest to local projection.
#[derive(Debug, Deserialize)]
struct RemoteMatch {
    #[serde(flatten)]
    hazard: Hazard,
    distance_from_route: f64,
    #[serde(default)]
    distance_along_route: Option<f64>,
    #[serde(default)]
    progress: Option<f64>,
    #[serde(default)]
    closest_point: Option<LatLng>,
}

/// Decode a route-scan response, `{"matches": [...]}` or the older
/// `{"pins_on_route": [...]}`.
///
/// # Errors
///
/// Fails if any entry cannot be decoded.
pub fn decode_remote_matches(response: &Value, polyline: &[LatLng]) -> Result<Vec<RouteMatch>, serde_json::Error> {
    let Some(items) = response.get("matches").or_else(|| response.get("pins_on_route")) else {
        return Ok(Vec::new());
    };

    let remote = Vec::<RemoteMatch>::deserialize(items)?;
    Ok(remote
        .into_iter()
        .map(|r| {
            let local = RouteMatch::project(&r.hazard, polyline);
            let closest = r
                .closest_point
                .or_else(|| local.as_ref().map(|l| l.closest_point))
                .unwrap_or_else(|| r.hazard.location());
            RouteMatch {
                distance_along_route: r
                    .distance_along_route
                    .or_else(|| local.as_ref().map(|l| l.distance_along_route))
                    .unwrap_or(0.0),
                progress: r
                    .progress
                    .or_else(|| local.as_ref().map(|l| l.progress))
                    .unwrap_or(0.0),
                closest_point: closest,
                distance_from_route: r.distance_from_route,
                hazard: r.hazard,
            }
        })
        .collect())
}

/// Failure of a delegated route scan.
#[derive(Debug, Error)]
pub enum RouteError {
    /// The request could not be made.
    #[cfg(feature = "http")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The service answered with a non-success status.
    #[error("route service returned status {0}")]
    Status(u16),
    /// The response body could not be decoded.
    #[error("invalid route service response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Something that can find hazards along a route, such as a remote service.
pub trait RouteAnalyzer {
    /// Candidate matches for `geometry`. The result is filtered and ordered
    /// by the caller.
    fn analyze<'a>(
        &'a self,
        geometry: &'a RouteGeometry,
        tolerance: f64,
    ) -> LocalBoxFuture<'a, Result<Vec<RouteMatch>, RouteError>>;
}

/// Hazards in `cache` within `tolerance` meters of `polyline`, in route
/// order.
#[must_use]
pub fn match_route(cache: &HazardCache, polyline: &[LatLng], tolerance: f64) -> Vec<RouteMatch> {
    let candidates = cache.iter().filter_map(|h| RouteMatch::project(h, polyline)).collect();
    within_tolerance(candidates, tolerance)
}

fn within_tolerance(mut matches: Vec<RouteMatch>, tolerance: f64) -> Vec<RouteMatch> {
    matches.retain(|m| m.distance_from_route <= tolerance);
    matches.sort_by(|a, b| a.distance_along_route.total_cmp(&b.distance_along_route));
    matches
}

/// Scans planned routes and reports the hazards on them.
#[derive(Debug, Clone)]
pub struct RouteMatcher {
    cache: SharedCache,
    pipeline: ReportingPipeline,
    hub: Rc<EventHub>,
}

impl RouteMatcher {
    /// A matcher with its own event channel.
    #[must_use]
    pub fn new(cache: SharedCache, pipeline: ReportingPipeline) -> Self {
        Self::with_hub(cache, pipeline, EventHub::new())
    }

    pub(crate) fn with_hub(cache: SharedCache, pipeline: ReportingPipeline, hub: Rc<EventHub>) -> Self {
        Self { cache, pipeline, hub }
    }

    /// Receive scan events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.hub.subscribe()
    }

    /// Scan counters.
    #[must_use]
    pub fn stats(&self) -> ScanStats {
        self.hub.stats()
    }

    /// Scan `polyline` against the local hazard cache.
    ///
    /// Every match is reported with the route-planning context; hazards
    /// already reported today are left out of the report queue but still
    /// returned.
    #[cfg_attr(feature = "tracing", instrument(skip_all, fields(vertices = polyline.len())))]
    pub fn scan_route(&self, polyline: &[LatLng], tolerance: f64) -> Vec<RouteMatch> {
        let started = Instant::now();
        let matches = match_route(&self.cache.borrow(), polyline, tolerance);
        self.finish(matches, ScanMethod::Local, started)
    }

    /// Delegate the scan to `analyzer`. On failure a
    /// [`ScanEvent::ScanError`] is emitted and nothing is returned.
    pub async fn scan_route_with(
        &self,
        analyzer: &dyn RouteAnalyzer,
        geometry: &RouteGeometry,
        tolerance: f64,
    ) -> Vec<RouteMatch> {
        let started = Instant::now();
        match analyzer.analyze(geometry, tolerance).await {
            Ok(candidates) => {
                let matches = within_tolerance(candidates, tolerance);
                self.finish(matches, ScanMethod::Remote, started)
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                warn!("remote route scan failed: {e}");
                self.hub.emit(ScanEvent::ScanError(e.to_string()));
                Vec::new()
            }
        }
    }

    /// Record a planned route for analytics. Returns the report id.
    pub fn report_route(&self, summary: &RouteSummary) -> String {
        self.pipeline.report_route(summary)
    }

    fn finish(&self, matches: Vec<RouteMatch>, method: ScanMethod, started: Instant) -> Vec<RouteMatch> {
        for m in &matches {
            let mut metadata = Map::new();
            metadata.insert("location".into(), json!(m.hazard.location()));
            metadata.insert("distance_from_route".into(), json!(m.distance_from_route));
            metadata.insert("distance_along_route".into(), json!(m.distance_along_route));
            metadata.insert("route_progress".into(), json!(m.progress));
            self.pipeline
                .report_hazard(&m.hazard.id, ReportContext::RoutePlanning, metadata);
        }

        self.hub.record(true, matches.len(), started.elapsed());
        #[cfg(feature = "tracing")]
        info!(found = matches.len(), ?method, "route scanned");
        self.hub.emit(ScanEvent::RouteScanned {
            matches: matches.clone(),
            method,
        });
        matches
    }
}
