use std::{
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};

use anyhow::Context;
use futures::StreamExt;
use geo::prelude::{HaversineDistance, VincentyDistance};
use hazardwatch::{
    clock::SystemClock,
    geometry::LatLng,
    hazard::{Hazard, HazardCache, SharedCache},
    http::{CatalogClient, HttpSink, RemoteRouteAnalyzer},
    location::{PositionTracker, ResilientPositions},
    report::{HookEvent, PipelineConfig, PipelineEvent, ReportingPipeline, RouteSummary},
    retry::RetryPolicy,
    route::{RouteGeometry, RouteMatch},
    scanner::{ProximityScanner, ScanConfig, ScanEvent},
    store::FileStore,
};
use serde::Deserialize;
use structopt::StructOpt;
use tokio::{sync::broadcast::error::RecvError, task::LocalSet};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod delivery;
mod track;

use delivery::Delivery;
use track::TrackFile;

#[derive(Debug, StructOpt)]
#[structopt(about = "Proximity alerts for road hazards along a recorded track")]
struct Opt {
    /// Recorded track, one JSON position per line.
    #[structopt(parse(from_os_str))]
    track: PathBuf,

    /// Hazard backend base URL. Without it reports are only logged.
    #[structopt(long, env = "HAZARDWATCH_API")]
    api: Option<String>,

    /// Catalog snapshot to load when running without a backend.
    #[structopt(long, parse(from_os_str))]
    catalog: Option<PathBuf>,

    /// Route geometry (GeoJSON LineString) to preview before driving.
    #[structopt(long, parse(from_os_str))]
    route: Option<PathBuf>,

    /// Let the backend scan the route instead of the local cache.
    #[structopt(long)]
    remote_route: bool,

    /// Where reporting state is kept between runs.
    #[structopt(long, env = "HAZARDWATCH_STATE", default_value = "hazardwatch-state.json", parse(from_os_str))]
    state: PathBuf,

    #[structopt(long, env = "HAZARDWATCH_USER")]
    user_id: Option<String>,

    /// Alert radius in meters.
    #[structopt(long, default_value = "2000")]
    radius: f64,

    /// Movement before rescanning, in meters.
    #[structopt(long, default_value = "100")]
    threshold: f64,

    /// Route tolerance in meters.
    #[structopt(long, default_value = "500")]
    tolerance: f64,

    /// Milliseconds between replayed fixes.
    #[structopt(long, default_value = "1000")]
    pace_ms: u64,

    /// Seconds between catalog syncs.
    #[structopt(long, default_value = "30")]
    sync_secs: u64,

    /// Seconds to keep delivering reports after the track ends.
    #[structopt(long, default_value = "10")]
    drain_secs: u64,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    hazards: Vec<Hazard>,
}

fn precise_distance(a: LatLng, b: LatLng) -> f64 {
    let (a, b): (geo::Point<f64>, geo::Point<f64>) = (a.into(), b.into());
    a.vincenty_distance(&b)
        .unwrap_or_else(|_| a.haversine_distance(&b))
}

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let opt = Opt::from_args();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    LocalSet::new().block_on(&rt, run(opt))
}

async fn load_catalog(
    opt: &Opt,
    catalog: Option<&CatalogClient>,
    cache: &SharedCache,
    cursor: &mut Option<String>,
) -> anyhow::Result<()> {
    if let Some(client) = catalog {
        let outcome = client.sync(cache, cursor).await.context("initial catalog sync")?;
        info!(hazards = outcome.added, "catalog loaded");
    } else if let Some(path) = &opt.catalog {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let file: CatalogFile = serde_json::from_str(&raw)?;
        let kept = cache.borrow_mut().load(file.hazards);
        info!(hazards = kept, "catalog loaded from {}", path.display());
    } else {
        warn!("no backend and no catalog, nothing to alert on");
    }

    Ok(())
}

async fn preview_route(opt: &Opt, path: &Path, scanner: &ProximityScanner) -> anyhow::Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let geometry: RouteGeometry = serde_json::from_str(&raw)?;
    let polyline = geometry.polyline();
    let matcher = scanner.route_matcher();

    let matches: Vec<RouteMatch> = match (&opt.api, opt.remote_route) {
        (Some(api), true) => {
            matcher
                .scan_route_with(&RemoteRouteAnalyzer::new(api.as_str()), &geometry, opt.tolerance)
                .await
        }
        _ => matcher.scan_route(&polyline, opt.tolerance),
    };

    println!("{} hazard(s) on route ({:.1} km)", matches.len(), geometry.length() / 1000.);
    for m in &matches {
        println!(
            "  {:>5.1} km  {:?} {}  {} m off route",
            m.distance_along_route / 1000.,
            m.hazard.kind,
            m.hazard.id,
            m.distance_from_route.round()
        );
    }

    matcher.report_route(&RouteSummary {
        start: polyline.first().copied(),
        destination: polyline.last().copied(),
        distance: Some(geometry.length()),
        estimated_time: geometry.duration,
        ..RouteSummary::default()
    });

    Ok(())
}

async fn run(opt: Opt) -> anyhow::Result<()> {
    let cache = HazardCache::new().into_shared();
    let store = FileStore::open(&opt.state).with_context(|| format!("opening {}", opt.state.display()))?;
    let catalog = opt.api.as_deref().map(CatalogClient::new);
    let delivery = opt
        .api
        .as_deref()
        .map_or(Delivery::Log, |api| Delivery::Http(HttpSink::new(api)));

    let pipeline = ReportingPipeline::new(
        PipelineConfig {
            user_id: opt.user_id.clone(),
            ..PipelineConfig::default()
        },
        store,
        delivery,
        SystemClock,
    );
    pipeline.add_hook(HookEvent::ReportFailed, |event| {
        if let PipelineEvent::ReportFailed { report, error } = event {
            error!(id = %report.id, "report dropped: {error}");
        }
    });
    pipeline.add_hook(HookEvent::DayRotated, |_| info!("new day, alerts re-armed"));

    let mut cursor = None;
    load_catalog(&opt, catalog.as_ref(), &cache, &mut cursor).await?;

    let mut scanner = ProximityScanner::new(cache.clone(), pipeline.clone());

    let mut events = scanner.subscribe();
    let printer = tokio::task::spawn_local(async move {
        loop {
            match events.recv().await {
                Ok(ScanEvent::PinAlert(m)) => println!(
                    "ALERT {:?} {} in {} m, bearing {:.0}°",
                    m.hazard.kind,
                    m.hazard.id,
                    m.distance.round(),
                    m.bearing
                ),
                Ok(ScanEvent::ProximityResults { matches, duration, position }) => {
                    if let Some(nearest) = matches.first() {
                        debug!(
                            found = matches.len(),
                            nearest = precise_distance(position.location(), nearest.hazard.location()).round(),
                            ?duration,
                            "scan"
                        );
                    }
                }
                Ok(ScanEvent::ScanError(e)) => warn!("scan failed: {e}"),
                Ok(ScanEvent::RouteScanned { .. }) => {}
                Err(RecvError::Lagged(n)) => warn!(missed = n, "event printer lagging"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    if let Some(path) = &opt.route {
        preview_route(&opt, path, &scanner).await?;
    }

    let runner = {
        let pipeline = pipeline.clone();
        tokio::task::spawn_local(async move { pipeline.run().await })
    };

    let mut positions = ResilientPositions::new(
        TrackFile::new(&opt.track, Duration::from_millis(opt.pace_ms)),
        Rc::new(SystemClock),
        RetryPolicy::default(),
    );
    let mut tracker = PositionTracker::new();
    let mut sync = tokio::time::interval(Duration::from_secs(opt.sync_secs.max(1)));
    sync.tick().await;

    scanner.start(ScanConfig {
        radius_m: opt.radius,
        movement_threshold_m: opt.threshold,
        route_tolerance_m: opt.tolerance,
        ..ScanConfig::default()
    });

    loop {
        tokio::select! {
            next = positions.next() => match next {
                Some(Ok(position)) => {
                    let motion = tracker.push(position);
                    debug!(speed = motion.speed, heading = motion.heading, "fix");
                    scanner.on_position(position);
                }
                Some(Err(e)) if e.is_retryable() => warn!("location: {e}"),
                Some(Err(e)) => error!("location: {e}"),
                None => {
                    info!("track finished");
                    break;
                }
            },
            () = scanner.tick() => {
                scanner.on_tick();
            }
            _ = sync.tick(), if catalog.is_some() => {
                if let Some(client) = &catalog {
                    match client.sync(&cache, &mut cursor).await {
                        Ok(outcome) => debug!(?outcome, "catalog synced"),
                        Err(e) => warn!("catalog sync failed: {e}"),
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    scanner.stop();

    // the runner may be mid-drain; wait until it is gone so the final drain
    // is not turned away
    runner.abort();
    if let Err(e) = runner.await {
        if !e.is_cancelled() {
            error!("report runner failed: {e}");
        }
    }

    let timed_out = tokio::time::timeout(Duration::from_secs(opt.drain_secs), pipeline.drain())
        .await
        .is_err();
    let pending = pipeline.pending();
    if pending > 0 {
        warn!(pending, timed_out, "reports left undelivered, retrying next run");
    }

    let scans = scanner.stats();
    let reports = pipeline.stats();
    info!(
        scans = scans.proximity_scans,
        hazards_found = scans.hazards_found,
        reported = reports.total_reports,
        duplicates = reports.duplicates_blocked,
        delivered = reports.backend_successes,
        "done"
    );

    drop(scanner);
    printer.abort();
    Ok(())
}
