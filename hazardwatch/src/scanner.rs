//! Live proximity scanning of a moving observer.
use std::{
    cell::RefCell,
    rc::Rc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use time::format_description::well_known::Rfc3339;
use tokio::{
    sync::broadcast,
    time::{Interval, MissedTickBehavior},
};
#[cfg(feature = "tracing")]
use tracing::{debug, info};

use crate::{
    geometry::{bearing, distance, LatLng},
    hazard::{Hazard, HazardCache, SharedCache},
    location::Position,
    report::{ReportContext, ReportingPipeline},
    retry::duration_millis_serde,
    route::{RouteMatch, RouteMatcher},
};

/// Matches at or below this distance are reported as pin alerts.
pub const ALERT_DISTANCE_M: f64 = 1000.0;

const EVENT_CAPACITY: usize = 128;

/// Scanner tuning.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Hazards further away than this are ignored.
    pub radius_m: f64,
    /// Minimum movement since the last scan before scanning again.
    pub movement_threshold_m: f64,
    /// Default tolerance for route scans.
    pub route_tolerance_m: f64,
    /// How often [`ProximityScanner::tick`] fires while scanning.
    #[serde(with = "duration_millis_serde")]
    pub poll_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            radius_m: 2000.0,
            movement_threshold_m: 100.0,
            route_tolerance_m: 500.0,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// A hazard near the observer.
#[derive(Debug, Clone, PartialEq)]
pub struct ProximityMatch {
    /// The hazard found.
    pub hazard: Hazard,
    /// Meters from the observer.
    pub distance: f64,
    /// Initial bearing from the observer, in degrees.
    pub bearing: f64,
}

/// How a route scan was computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanMethod {
    /// Against the local hazard cache.
    Local,
    /// By a remote route analyzer.
    Remote,
}

/// Emitted to [`ProximityScanner::subscribe`] and
/// [`RouteMatcher::subscribe`] receivers.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// A proximity scan finished.
    ProximityResults {
        /// Where the scan was made.
        position: Position,
        /// Matches within the radius, nearest first.
        matches: Vec<ProximityMatch>,
        /// Time spent scanning.
        duration: Duration,
    },
    /// A close hazard was reported for the first time today.
    PinAlert(ProximityMatch),
    /// A route scan finished.
    RouteScanned {
        /// Matches within tolerance, in route order.
        matches: Vec<RouteMatch>,
        /// How the scan was computed.
        method: ScanMethod,
    },
    /// A scan could not be completed.
    ScanError(String),
}

/// Scan counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanStats {
    /// Proximity and route scans.
    pub total_scans: u64,
    /// Scans around an observer position.
    pub proximity_scans: u64,
    /// Scans along a planned route.
    pub route_scans: u64,
    /// Matches over all scans.
    pub hazards_found: u64,
    /// How long the most recent scan took.
    pub last_scan_duration: Option<Duration>,
}

/// Event channel and counters shared between a scanner and its route
/// matchers.
#[derive(Debug)]
pub(crate) struct EventHub {
    events: broadcast::Sender<ScanEvent>,
    stats: RefCell<ScanStats>,
}

impl EventHub {
    pub(crate) fn new() -> Rc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Rc::new(Self {
            events,
            stats: RefCell::new(ScanStats::default()),
        })
    }

    pub(crate) fn emit(&self, event: ScanEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.events.subscribe()
    }

    pub(crate) fn record(&self, route: bool, found: usize, took: Duration) {
        let mut stats = self.stats.borrow_mut();
        stats.total_scans += 1;
        if route {
            stats.route_scans += 1;
        } else {
            stats.proximity_scans += 1;
        }
        stats.hazards_found += found as u64;
        stats.last_scan_duration = Some(took);
    }

    pub(crate) fn stats(&self) -> ScanStats {
        *self.stats.borrow()
    }
}

/// Whether the scanner reacts to positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Positions and ticks are ignored.
    Idle,
    /// Positions and ticks trigger scans.
    Scanning,
}

/// All hazards within `radius` meters of `at`, nearest first.
///
/// Returns nothing for an invalid location.
#[must_use]
pub fn nearby(cache: &HazardCache, at: LatLng, radius: f64) -> Vec<ProximityMatch> {
    if !at.is_valid() {
        return Vec::new();
    }

    let mut matches: Vec<_> = cache
        .iter()
        .filter_map(|hazard| {
            let d = distance(at, hazard.location());
            (d <= radius).then(|| ProximityMatch {
                hazard: hazard.clone(),
                distance: d,
                bearing: bearing(at, hazard.location()),
            })
        })
        .collect();

    matches.sort_by(|a, b| a.distance.total_cmp(&b.distance));
    matches
}

/// Evaluates the observer's position against the hazard cache, throttled by
/// a movement threshold, and raises pin alerts for close hazards.
///
/// ```
/// # use hazardwatch::{clock::ManualClock, hazard::HazardCache, report::*, scanner::*, store::MemoryStore};
/// # use futures::{future::LocalBoxFuture, FutureExt};
/// # struct Nowhere;
/// # impl ReportSink for Nowhere {
/// #     fn submit<'a>(&'a self, _: ReportKind, _: &'a str, _: &'a [Report]) -> LocalBoxFuture<'a, Result<(), SubmitError>> {
/// #         async { Ok(()) }.boxed_local()
/// #     }
/// # }
/// # let clock = ManualClock::new(time::OffsetDateTime::UNIX_EPOCH);
/// let pipeline = ReportingPipeline::new(PipelineConfig::default(), MemoryStore::new(), Nowhere, clock);
/// let mut scanner = ProximityScanner::new(HazardCache::new().into_shared(), pipeline);
///
/// scanner.start(ScanConfig::default());
/// assert_eq!(scanner.state(), ScanState::Scanning);
/// ```
#[derive(Debug)]
pub struct ProximityScanner {
    cache: SharedCache,
    pipeline: ReportingPipeline,
    hub: Rc<EventHub>,
    config: ScanConfig,
    state: ScanState,
    latest: Option<Position>,
    last_scan: Option<LatLng>,
    poll: Option<Interval>,
}

impl ProximityScanner {
    /// Create an idle scanner.
    #[must_use]
    pub fn new(cache: SharedCache, pipeline: ReportingPipeline) -> Self {
        Self {
            cache,
            pipeline,
            hub: EventHub::new(),
            config: ScanConfig::default(),
            state: ScanState::Idle,
            latest: None,
            last_scan: None,
            poll: None,
        }
    }

    /// A route matcher sharing this scanner's cache, pipeline, event
    /// channel and statistics.
    #[must_use]
    pub fn route_matcher(&self) -> RouteMatcher {
        RouteMatcher::with_hub(self.cache.clone(), self.pipeline.clone(), self.hub.clone())
    }

    /// Start scanning with `config`, scanning the latest known position
    /// right away.
    pub fn start(&mut self, config: ScanConfig) {
        #[cfg(feature = "tracing")]
        info!(?config, "proximity scanning started");
        self.config = config;
        self.state = ScanState::Scanning;
        self.poll = None;
        self.on_tick();
    }

    /// Stop scanning. Forgets where the last scan was made.
    pub fn stop(&mut self) {
        #[cfg(feature = "tracing")]
        info!("proximity scanning stopped");
        self.state = ScanState::Idle;
        self.poll = None;
        self.last_scan = None;
    }

    /// Replace the configuration. Takes effect with the next scan.
    pub fn update_config(&mut self, config: ScanConfig) {
        if config.poll_interval != self.config.poll_interval {
            self.poll = None;
        }
        self.config = config;
    }

    /// Current configuration.
    #[must_use]
    pub const fn config(&self) -> ScanConfig {
        self.config
    }

    /// Whether the scanner is running.
    #[must_use]
    pub const fn state(&self) -> ScanState {
        self.state
    }

    /// Counters shared with route matchers made by this scanner.
    #[must_use]
    pub fn stats(&self) -> ScanStats {
        self.hub.stats()
    }

    /// Receive scan events from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ScanEvent> {
        self.hub.subscribe()
    }

    /// Feed a new position. Returns the matches if a scan was made.
    pub fn on_position(&mut self, position: Position) -> Option<Vec<ProximityMatch>> {
        self.latest = Some(position);
        self.on_tick()
    }

    /// Re-evaluate the latest position under the movement threshold.
    pub fn on_tick(&mut self) -> Option<Vec<ProximityMatch>> {
        if self.state != ScanState::Scanning {
            return None;
        }
        let position = self.latest?;

        let moved_enough = self.last_scan.map_or(true, |last| {
            !position.is_valid() || distance(last, position.location()) >= self.config.movement_threshold_m
        });
        if !moved_enough {
            return None;
        }

        Some(self.scan(&position))
    }

    /// Resolves on every poll interval while scanning; never while idle.
    pub async fn tick(&mut self) {
        if self.state != ScanState::Scanning {
            return futures::future::pending().await;
        }

        let period = self.config.poll_interval;
        let poll = self.poll.get_or_insert_with(|| {
            let mut poll = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
            poll
        });
        poll.tick().await;
    }

    fn scan(&mut self, position: &Position) -> Vec<ProximityMatch> {
        let started = Instant::now();
        let matches = nearby(&self.cache.borrow(), position.location(), self.config.radius_m);
        let took = started.elapsed();

        self.hub.record(false, matches.len(), took);
        #[cfg(feature = "tracing")]
        debug!(found = matches.len(), ?took, "proximity scan");

        self.hub.emit(ScanEvent::ProximityResults {
            position: *position,
            matches: matches.clone(),
            duration: took,
        });

        if !position.is_valid() {
            return matches;
        }

        for m in matches.iter().filter(|m| m.distance <= ALERT_DISTANCE_M) {
            let mut metadata = Map::new();
            metadata.insert("location".into(), json!(position.location()));
            metadata.insert("distance".into(), json!(m.distance));
            metadata.insert("bearing".into(), json!(m.bearing));
            if let Ok(ts) = position.timestamp.format(&Rfc3339) {
                metadata.insert("timestamp".into(), json!(ts));
            }

            if self.pipeline.report_hazard(&m.hazard.id, ReportContext::Proximity, metadata) {
                #[cfg(feature = "tracing")]
                info!(id = %m.hazard.id, distance = m.distance.round(), "pin alert");
                self.hub.emit(ScanEvent::PinAlert(m.clone()));
            }
        }

        self.last_scan = Some(position.location());
        matches
    }
}
