//! Deduplicated, persisted and reliably delivered hazard reports.
//!
//! A hazard id is accepted at most once per local calendar day. Accepted
//! reports are written to a [`KeyValueStore`] before [`ReportingPipeline::report_hazard`]
//! returns and queued for delivery through a [`ReportSink`]. A single drain
//! loop submits the queue in batches; failed reports go back to the front of
//! the queue after an exponential backoff until their retries run out.
use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    panic::{self, AssertUnwindSafe},
    rc::Rc,
    time::Duration,
};

use futures::future::LocalBoxFuture;
use rand::{distributions::Alphanumeric, rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Notify;
#[cfg(feature = "tracing")]
use tracing::{debug, error, info, warn};

use crate::{
    clock::{crossed_day, Clock},
    geometry::LatLng,
    retry::RetryPolicy,
    store::{KeyValueStore, StoreError},
};

const DEDUP_KEY: &str = "hazardwatch.dedup";
const HISTORY_KEY: &str = "hazardwatch.history";
const HAZARDS_KEY: &str = "hazardwatch.hazards";
const STATS_KEY: &str = "hazardwatch.stats";
const DEVICE_KEY: &str = "hazardwatch.device_id";

/// What a report is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    /// A hazard was encountered or previewed.
    PinAlert,
    /// A route was planned.
    RouteCreated,
    /// A custom analytics event.
    Event,
}

impl ReportKind {
    /// Backend path the kind is submitted to.
    #[must_use]
    pub const fn endpoint(self) -> &'static str {
        match self {
            Self::PinAlert => "reports/pin-alert",
            Self::RouteCreated => "reports/route-created",
            Self::Event => "reports/event",
        }
    }
}

/// Why a hazard was reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportContext {
    /// The observer came close to the hazard.
    Proximity,
    /// The hazard lies on a planned route.
    RoutePlanning,
}

/// A single report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Unique report id.
    pub id: String,
    /// Report kind.
    pub kind: ReportKind,
    /// Hazard the report is about, for pin alerts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hazard_id: Option<String>,
    /// Why the hazard was reported, for pin alerts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ReportContext>,
    /// Event name, for custom events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// When the report was created.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Free-form details (location, distance, bearing, route data, ...).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Report {
    /// The JSON object the backend expects for this report.
    #[must_use]
    pub fn to_wire(&self, user_id: &str) -> Value {
        let timestamp = self
            .timestamp
            .format(&Rfc3339)
            .unwrap_or_else(|_| self.timestamp.unix_timestamp().to_string());
        let field = |key: &str| self.metadata.get(key).cloned().unwrap_or(Value::Null);

        match self.kind {
            ReportKind::PinAlert => json!({
                "hazard_id": self.hazard_id,
                "user_id": user_id,
                "location": field("location"),
                "timestamp": timestamp,
                "context": self.context,
                "distance": field("distance"),
                "bearing": field("bearing"),
            }),
            ReportKind::RouteCreated => json!({
                "user_id": user_id,
                "start": field("start"),
                "destination": field("destination"),
                "distance": field("distance"),
                "estimated_time": field("estimated_time"),
                "profile": field("profile"),
                "timestamp": timestamp,
            }),
            ReportKind::Event => json!({
                "user_id": user_id,
                "event_type": self.event_type,
                "data": self.metadata,
                "timestamp": timestamp,
            }),
        }
    }
}

/// A planned route, reported for analytics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSummary {
    /// Where the route starts.
    pub start: Option<LatLng>,
    /// Where the route ends.
    pub destination: Option<LatLng>,
    /// Total length in meters.
    pub distance: Option<f64>,
    /// Expected travel time in seconds.
    pub estimated_time: Option<f64>,
    /// Routing profile.
    pub profile: String,
}

impl Default for RouteSummary {
    fn default() -> Self {
        Self {
            start: None,
            destination: None,
            distance: None,
            estimated_time: None,
            profile: "driving".to_owned(),
        }
    }
}

/// Delivery state of a recorded report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Queued or waiting for a retry.
    Pending,
    /// Accepted by the backend.
    Delivered,
    /// Dropped after running out of retries.
    Failed,
}

/// A report as kept in the persisted history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportRecord {
    /// The report itself.
    #[serde(flatten)]
    pub report: Report,
    /// Delivery state.
    pub status: DeliveryStatus,
    /// Retries made so far.
    #[serde(default)]
    pub retries: u32,
}

/// How often a hazard has been reported over all days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HazardHistory {
    /// Time of the latest accepted report.
    #[serde(with = "time::serde::rfc3339")]
    pub last_reported: OffsetDateTime,
    /// Accepted reports, duplicates not included.
    pub report_count: u32,
}

/// Failure to hand a batch to the backend.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The request could not be made.
    #[cfg(feature = "http")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The backend answered with a non-success status.
    #[error("backend returned status {0}")]
    Status(u16),
    /// The backend refused the batch.
    #[error("backend rejected the batch: {0}")]
    Rejected(String),
}

/// Where batches of reports are delivered.
pub trait ReportSink {
    /// Submit `reports`, all of kind `kind`, on behalf of `user_id`.
    fn submit<'a>(
        &'a self,
        kind: ReportKind,
        user_id: &'a str,
        reports: &'a [Report],
    ) -> LocalBoxFuture<'a, Result<(), SubmitError>>;
}

/// Events observers can hook into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    /// A pin alert was accepted.
    PinReported,
    /// A route report was accepted.
    RouteReported,
    /// A custom event was accepted.
    EventReported,
    /// A pin alert was suppressed as a same-day duplicate.
    DuplicateBlocked,
    /// A report was dropped after running out of retries.
    ReportFailed,
    /// The dedup set was cleared for a new day.
    DayRotated,
}

/// Payload passed to hooks.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// See [`HookEvent::PinReported`].
    PinReported(Report),
    /// See [`HookEvent::RouteReported`].
    RouteReported(Report),
    /// See [`HookEvent::EventReported`].
    EventReported(Report),
    /// See [`HookEvent::DuplicateBlocked`].
    DuplicateBlocked {
        /// Suppressed hazard.
        hazard_id: String,
        /// Context of the suppressed report.
        context: ReportContext,
    },
    /// See [`HookEvent::ReportFailed`].
    ReportFailed {
        /// The dropped report.
        report: Report,
        /// The last submission error.
        error: String,
    },
    /// See [`HookEvent::DayRotated`].
    DayRotated {
        /// When the rotation happened.
        at: OffsetDateTime,
    },
}

impl PipelineEvent {
    /// The hook key this event is delivered under.
    #[must_use]
    pub const fn hook(&self) -> HookEvent {
        match self {
            Self::PinReported(_) => HookEvent::PinReported,
            Self::RouteReported(_) => HookEvent::RouteReported,
            Self::EventReported(_) => HookEvent::EventReported,
            Self::DuplicateBlocked { .. } => HookEvent::DuplicateBlocked,
            Self::ReportFailed { .. } => HookEvent::ReportFailed,
            Self::DayRotated { .. } => HookEvent::DayRotated,
        }
    }
}

/// Handle returned by [`ReportingPipeline::add_hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

type HookFn = Rc<dyn Fn(&PipelineEvent)>;

/// Tuning knobs for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Reports per submission.
    pub batch_size: usize,
    /// Backoff between delivery attempts.
    pub retry: RetryPolicy,
    /// Pause between consecutive batches.
    pub batch_pause: Duration,
    /// Records kept in the persisted history.
    pub max_history: usize,
    /// How often [`ReportingPipeline::run`] checks for a new day.
    pub rotation_interval: Duration,
    /// User id sent to the backend. Falls back to an anonymous device id.
    pub user_id: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            retry: RetryPolicy {
                base_delay: Duration::from_secs(2),
                max_delay: Duration::from_secs(60),
                max_retries: 3,
            },
            batch_pause: Duration::from_millis(100),
            max_history: 1000,
            rotation_interval: Duration::from_secs(60 * 60),
            user_id: None,
        }
    }
}

/// Counters kept across restarts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineStats {
    /// Accepted reports of any kind.
    pub total_reports: u64,
    /// Accepted pin alerts.
    pub pin_reports: u64,
    /// Accepted route reports.
    pub route_reports: u64,
    /// Accepted custom events.
    pub event_reports: u64,
    /// Pin alerts suppressed as duplicates.
    pub duplicates_blocked: u64,
    /// Reports the backend accepted.
    pub backend_successes: u64,
    /// Reports in failed submissions, counted per attempt.
    pub backend_failures: u64,
    /// Reports dropped after their last retry.
    pub reports_failed: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DedupState {
    today: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    last_rotation: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
struct Queued {
    report: Report,
    retries: u32,
}

struct Inner {
    config: PipelineConfig,
    store: Box<dyn KeyValueStore>,
    user_id: String,
    today: HashSet<String>,
    last_rotation: Option<OffsetDateTime>,
    /// Set when restoring state crossed a day, until `run` announces it.
    rotated_at_start: Option<OffsetDateTime>,
    hazards: HashMap<String, HazardHistory>,
    history: VecDeque<ReportRecord>,
    queue: VecDeque<Queued>,
    /// The batch being submitted. Survives a cancelled drain.
    in_flight: Vec<Queued>,
    retrying: Vec<(OffsetDateTime, Queued)>,
    stats: PipelineStats,
    hooks: Vec<(HookId, HookEvent, HookFn)>,
    next_hook: u64,
}

/// The reporting pipeline. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ReportingPipeline {
    inner: Rc<RefCell<Inner>>,
    processing: Rc<Cell<bool>>,
    sink: Rc<dyn ReportSink>,
    clock: Rc<dyn Clock>,
    wake: Rc<Notify>,
}

impl ReportingPipeline {
    /// Build a pipeline, restoring dedup state, history and statistics from
    /// `store` and re-queueing anything that was still pending.
    ///
    /// If the day changed since the state was saved, the dedup set is
    /// cleared right away. The matching [`HookEvent::DayRotated`] is raised
    /// when [`ReportingPipeline::run`] starts, so hooks added in between see
    /// it.
    pub fn new(
        config: PipelineConfig,
        store: impl KeyValueStore + 'static,
        sink: impl ReportSink + 'static,
        clock: impl Clock + 'static,
    ) -> Self {
        let clock: Rc<dyn Clock> = Rc::new(clock);
        let mut store: Box<dyn KeyValueStore> = Box::new(store);
        let now = clock.now();

        let dedup: DedupState = load(&*store, DEDUP_KEY).unwrap_or_default();
        let hazards = load(&*store, HAZARDS_KEY).unwrap_or_default();
        let history: VecDeque<ReportRecord> = load(&*store, HISTORY_KEY).unwrap_or_default();
        let stats = load(&*store, STATS_KEY).unwrap_or_default();

        let user_id = match &config.user_id {
            Some(id) => id.clone(),
            None => format!("anonymous_{}", device_id(&mut *store, now)),
        };

        let queue: VecDeque<_> = history
            .iter()
            .filter(|r| r.status == DeliveryStatus::Pending)
            .map(|r| Queued {
                report: r.report.clone(),
                retries: r.retries,
            })
            .collect();

        #[cfg(feature = "tracing")]
        info!(
            today = dedup.today.len(),
            history = history.len(),
            requeued = queue.len(),
            "restored reporting state"
        );

        let mut inner = Inner {
            config,
            store,
            user_id,
            today: dedup.today.into_iter().collect(),
            last_rotation: dedup.last_rotation,
            rotated_at_start: None,
            hazards,
            history,
            queue,
            in_flight: Vec::new(),
            retrying: Vec::new(),
            stats,
            hooks: Vec::new(),
            next_hook: 0,
        };

        // a first start only records the day
        let first_start = inner.last_rotation.is_none();
        if inner.rotate(now) && !first_start {
            inner.rotated_at_start = Some(now);
        }

        let pipeline = Self {
            inner: Rc::new(RefCell::new(inner)),
            processing: Rc::new(Cell::new(false)),
            sink: Rc::new(sink),
            clock,
            wake: Rc::new(Notify::new()),
        };

        if pipeline.pending() > 0 {
            pipeline.wake.notify_one();
        }
        pipeline
    }

    /// Report a hazard. Returns `false` if the hazard was already reported
    /// today, whatever the context was then.
    pub fn report_hazard(
        &self,
        hazard_id: &str,
        context: ReportContext,
        metadata: Map<String, Value>,
    ) -> bool {
        let event = {
            let mut inner = self.inner.borrow_mut();

            if inner.today.contains(hazard_id) {
                inner.stats.duplicates_blocked += 1;
                inner.save_stats();
                #[cfg(feature = "tracing")]
                debug!(hazard_id, ?context, "duplicate blocked");
                PipelineEvent::DuplicateBlocked {
                    hazard_id: hazard_id.to_owned(),
                    context,
                }
            } else {
                let now = self.clock.now();
                let report = Report {
                    id: report_id(now),
                    kind: ReportKind::PinAlert,
                    hazard_id: Some(hazard_id.to_owned()),
                    context: Some(context),
                    event_type: None,
                    timestamp: now,
                    metadata,
                };

                inner.today.insert(hazard_id.to_owned());
                let seen = inner.hazards.entry(hazard_id.to_owned()).or_insert(HazardHistory {
                    last_reported: now,
                    report_count: 0,
                });
                seen.last_reported = now;
                seen.report_count += 1;
                inner.stats.pin_reports += 1;
                inner.accept(report.clone());
                inner.save_dedup();
                inner.save_hazards();

                #[cfg(feature = "tracing")]
                info!(hazard_id, ?context, id = %report.id, "hazard reported");
                PipelineEvent::PinReported(report)
            }
        };

        let accepted = matches!(event, PipelineEvent::PinReported(_));
        if accepted {
            self.wake.notify_one();
        }
        self.emit(&event);
        accepted
    }

    /// Report a planned route. Route reports are never deduplicated.
    pub fn report_route(&self, summary: &RouteSummary) -> String {
        let now = self.clock.now();
        let metadata = match serde_json::to_value(summary) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        let report = Report {
            id: report_id(now),
            kind: ReportKind::RouteCreated,
            hazard_id: None,
            context: None,
            event_type: None,
            timestamp: now,
            metadata,
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.stats.route_reports += 1;
            inner.accept(report.clone());
        }

        self.wake.notify_one();
        let id = report.id.clone();
        self.emit(&PipelineEvent::RouteReported(report));
        id
    }

    /// Report a custom analytics event. Events are never deduplicated and
    /// are delivered to their own endpoint.
    pub fn report_event(&self, event_type: &str, data: Map<String, Value>) -> String {
        let now = self.clock.now();
        let report = Report {
            id: report_id(now),
            kind: ReportKind::Event,
            hazard_id: None,
            context: None,
            event_type: Some(event_type.to_owned()),
            timestamp: now,
            metadata: data,
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.stats.event_reports += 1;
            inner.accept(report.clone());
        }

        #[cfg(feature = "tracing")]
        debug!(event_type, id = %report.id, "event reported");
        self.wake.notify_one();
        let id = report.id.clone();
        self.emit(&PipelineEvent::EventReported(report));
        id
    }

    /// Whether `hazard_id` was already reported today.
    #[must_use]
    pub fn is_duplicate_today(&self, hazard_id: &str) -> bool {
        self.inner.borrow().today.contains(hazard_id)
    }

    /// Clear the dedup set if the local calendar day changed since the last
    /// rotation. Returns whether it did.
    pub fn check_day_rotation(&self) -> bool {
        let now = self.clock.now();
        if !self.inner.borrow_mut().rotate(now) {
            return false;
        }

        self.emit(&PipelineEvent::DayRotated { at: now });
        true
    }

    /// When `hazard_id` was last accepted, on any day.
    #[must_use]
    pub fn last_report_time(&self, hazard_id: &str) -> Option<OffsetDateTime> {
        self.inner.borrow().hazards.get(hazard_id).map(|h| h.last_reported)
    }

    /// How many reports for `hazard_id` were accepted over all days.
    #[must_use]
    pub fn report_count(&self, hazard_id: &str) -> u32 {
        self.inner.borrow().hazards.get(hazard_id).map_or(0, |h| h.report_count)
    }

    /// Register `callback` for `event`. Panics inside the callback are
    /// caught and logged.
    pub fn add_hook(&self, event: HookEvent, callback: impl Fn(&PipelineEvent) + 'static) -> HookId {
        let mut inner = self.inner.borrow_mut();
        let id = HookId(inner.next_hook);
        inner.next_hook += 1;
        inner.hooks.push((id, event, Rc::new(callback)));
        id
    }

    /// Unregister a hook. Returns whether it was registered.
    pub fn remove_hook(&self, id: HookId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let before = inner.hooks.len();
        inner.hooks.retain(|(h, _, _)| *h != id);
        inner.hooks.len() != before
    }

    fn emit(&self, event: &PipelineEvent) {
        let key = event.hook();
        let hooks: Vec<HookFn> = self
            .inner
            .borrow()
            .hooks
            .iter()
            .filter(|(_, e, _)| *e == key)
            .map(|(_, _, f)| f.clone())
            .collect();

        for hook in hooks {
            if panic::catch_unwind(AssertUnwindSafe(|| hook(event))).is_err() {
                #[cfg(feature = "tracing")]
                error!(?key, "hook panicked");
            }
        }
    }

    /// Deliver everything queued, waiting out retry backoffs, until nothing
    /// is left. Returns immediately if another drain is already running.
    ///
    /// Dropping the future mid-submission puts the batch back at the front
    /// of the queue for the next drain.
    pub async fn drain(&self) {
        let Some(_guard) = ProcessingGuard::acquire(&self.processing) else {
            #[cfg(feature = "tracing")]
            debug!("drain already running");
            return;
        };
        self.inner.borrow_mut().requeue_in_flight();

        loop {
            let now = self.clock.now();
            let step = self.inner.borrow_mut().next_step(now);

            match step {
                Step::Done => break,
                Step::Wait(delay) => {
                    tokio::select! {
                        () = self.clock.sleep(delay) => {}
                        () = self.wake.notified() => {}
                    }
                }
                Step::Deliver(batch) => {
                    self.deliver(batch).await;

                    let pause = {
                        let inner = self.inner.borrow();
                        (!inner.queue.is_empty()).then_some(inner.config.batch_pause)
                    };
                    if let Some(pause) = pause {
                        self.clock.sleep(pause).await;
                    }
                }
            }
        }
    }

    async fn deliver(&self, batch: Vec<Queued>) {
        let user_id = self.inner.borrow().user_id.clone();

        for kind in [ReportKind::PinAlert, ReportKind::RouteCreated, ReportKind::Event] {
            let group: Vec<Queued> = batch.iter().filter(|q| q.report.kind == kind).cloned().collect();
            if group.is_empty() {
                continue;
            }

            let reports: Vec<Report> = group.iter().map(|q| q.report.clone()).collect();
            let result = self.sink.submit(kind, &user_id, &reports).await;

            let failed = {
                let mut inner = self.inner.borrow_mut();
                inner.in_flight.retain(|q| q.report.kind != kind);
                match result {
                    Ok(()) => {
                        #[cfg(feature = "tracing")]
                        debug!(?kind, count = reports.len(), "batch delivered");
                        inner.delivered(&reports);
                        Vec::new()
                    }
                    Err(e) => {
                        #[cfg(feature = "tracing")]
                        warn!(?kind, count = reports.len(), "batch submission failed: {e}");
                        let error = e.to_string();
                        inner
                            .schedule_retries(group, self.clock.now())
                            .into_iter()
                            .map(|report| PipelineEvent::ReportFailed {
                                report,
                                error: error.clone(),
                            })
                            .collect()
                    }
                }
            };

            for event in &failed {
                self.emit(event);
            }
        }
    }

    /// Long-running task: drains whenever reports arrive and checks for a
    /// new day on the configured interval.
    pub async fn run(&self) {
        let missed = self.inner.borrow_mut().rotated_at_start.take();
        if let Some(at) = missed {
            self.emit(&PipelineEvent::DayRotated { at });
        }

        let period = self.inner.borrow().config.rotation_interval;
        let mut rotation = tokio::time::interval(period);

        loop {
            tokio::select! {
                () = self.wake.notified() => self.drain().await,
                _ = rotation.tick() => {
                    self.check_day_rotation();
                }
            }
        }
    }

    /// Whether a drain loop is currently running.
    #[must_use]
    pub fn is_processing(&self) -> bool {
        self.processing.get()
    }

    /// Reports queued, being submitted or waiting for a retry.
    #[must_use]
    pub fn pending(&self) -> usize {
        let inner = self.inner.borrow();
        inner.queue.len() + inner.in_flight.len() + inner.retrying.len()
    }

    /// Counters since the last [`ReportingPipeline::clear_all`].
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        self.inner.borrow().stats
    }

    /// Persisted report history, oldest first.
    #[must_use]
    pub fn history(&self) -> Vec<ReportRecord> {
        self.inner.borrow().history.iter().cloned().collect()
    }

    /// Number of hazards reported today.
    #[must_use]
    pub fn reported_today(&self) -> usize {
        self.inner.borrow().today.len()
    }

    /// The id reports are submitted under.
    #[must_use]
    pub fn user_id(&self) -> String {
        self.inner.borrow().user_id.clone()
    }

    /// Forget everything: dedup set, per-hazard counts, history, queue and
    /// statistics.
    pub fn clear_all(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.today.clear();
        inner.hazards.clear();
        inner.history.clear();
        inner.queue.clear();
        inner.in_flight.clear();
        inner.retrying.clear();
        inner.stats = PipelineStats::default();
        inner.save_dedup();
        inner.save_hazards();
        inner.save_history();
        inner.save_stats();
    }
}

impl fmt::Debug for ReportingPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("ReportingPipeline")
            .field("today", &inner.today.len())
            .field("queue", &inner.queue.len())
            .field("retrying", &inner.retrying.len())
            .field("processing", &self.processing.get())
            .field("stats", &inner.stats)
            .finish_non_exhaustive()
    }
}

enum Step {
    Deliver(Vec<Queued>),
    Wait(Duration),
    Done,
}

impl Inner {
    /// Clear the dedup set if `now` is on a later day than the last
    /// rotation.
    fn rotate(&mut self, now: OffsetDateTime) -> bool {
        if self.last_rotation.is_some_and(|last| !crossed_day(last, now)) {
            return false;
        }

        #[cfg(feature = "tracing")]
        info!(cleared = self.today.len(), "new day, clearing reported hazards");
        self.today.clear();
        self.last_rotation = Some(now);
        self.save_dedup();
        true
    }

    fn requeue_in_flight(&mut self) {
        #[cfg(feature = "tracing")]
        if !self.in_flight.is_empty() {
            debug!(count = self.in_flight.len(), "re-queueing interrupted batch");
        }
        for queued in self.in_flight.drain(..).rev() {
            self.queue.push_front(queued);
        }
    }

    fn accept(&mut self, report: Report) {
        self.stats.total_reports += 1;
        self.history.push_back(ReportRecord {
            report: report.clone(),
            status: DeliveryStatus::Pending,
            retries: 0,
        });
        while self.history.len() > self.config.max_history {
            self.history.pop_front();
        }
        self.queue.push_back(Queued { report, retries: 0 });
        self.save_history();
        self.save_stats();
    }

    fn next_step(&mut self, now: OffsetDateTime) -> Step {
        // due retries jump the queue, earliest first
        self.retrying.sort_by_key(|(due, _)| *due);
        let due = self.retrying.partition_point(|(due, _)| *due <= now);
        for (_, queued) in self.retrying.drain(..due).rev() {
            self.queue.push_front(queued);
        }

        if !self.queue.is_empty() {
            let n = self.config.batch_size.max(1).min(self.queue.len());
            let batch: Vec<Queued> = self.queue.drain(..n).collect();
            self.in_flight.clone_from(&batch);
            return Step::Deliver(batch);
        }

        match self.retrying.first() {
            Some((due, _)) => Step::Wait((*due - now).try_into().unwrap_or(Duration::ZERO)),
            None => Step::Done,
        }
    }

    fn delivered(&mut self, reports: &[Report]) {
        self.stats.backend_successes += reports.len() as u64;
        for report in reports {
            self.set_status(&report.id, DeliveryStatus::Delivered, None);
        }
        self.save_history();
        self.save_stats();
    }

    /// Put failed reports up for another attempt. Returns those that ran
    /// out of retries.
    fn schedule_retries(&mut self, group: Vec<Queued>, now: OffsetDateTime) -> Vec<Report> {
        self.stats.backend_failures += group.len() as u64;
        let mut dropped = Vec::new();

        for mut queued in group {
            if self.config.retry.allows(queued.retries) {
                queued.retries += 1;
                let due = now + self.config.retry.delay(queued.retries);
                self.set_status(&queued.report.id, DeliveryStatus::Pending, Some(queued.retries));
                self.retrying.push((due, queued));
            } else {
                #[cfg(feature = "tracing")]
                error!(id = %queued.report.id, retries = queued.retries, "giving up on report");
                self.stats.reports_failed += 1;
                self.set_status(&queued.report.id, DeliveryStatus::Failed, None);
                dropped.push(queued.report);
            }
        }

        self.save_history();
        self.save_stats();
        dropped
    }

    fn set_status(&mut self, id: &str, status: DeliveryStatus, retries: Option<u32>) {
        if let Some(record) = self.history.iter_mut().find(|r| r.report.id == id) {
            record.status = status;
            if let Some(retries) = retries {
                record.retries = retries;
            }
        }
    }

    fn save_dedup(&mut self) {
        let state = DedupState {
            today: self.today.iter().cloned().collect(),
            last_rotation: self.last_rotation,
        };
        save(self.store.as_mut(), DEDUP_KEY, &state);
    }

    fn save_hazards(&mut self) {
        save(self.store.as_mut(), HAZARDS_KEY, &self.hazards);
    }

    fn save_history(&mut self) {
        save(self.store.as_mut(), HISTORY_KEY, &self.history);
    }

    fn save_stats(&mut self) {
        save(self.store.as_mut(), STATS_KEY, &self.stats);
    }
}

/// Clears the processing flag when the drain loop ends, however it ends.
struct ProcessingGuard<'a>(&'a Cell<bool>);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a Cell<bool>) -> Option<Self> {
        if flag.replace(true) {
            return None;
        }
        Some(Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

fn load<T: for<'de> Deserialize<'de>>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let decoded = store
        .get(key)
        .and_then(|raw| raw.map(|s| serde_json::from_str(&s)).transpose().map_err(StoreError::from));

    match decoded {
        Ok(value) => value,
        Err(_e) => {
            #[cfg(feature = "tracing")]
            warn!(key, "discarding unreadable state: {_e}");
            None
        }
    }
}

fn save<T: Serialize>(store: &mut dyn KeyValueStore, key: &str, value: &T) {
    let result = serde_json::to_string(value)
        .map_err(StoreError::from)
        .and_then(|s| store.set(key, s));

    if let Err(_e) = result {
        #[cfg(feature = "tracing")]
        error!(key, "persisting reporting state failed: {_e}");
    }
}

fn random_suffix() -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}

fn report_id(now: OffsetDateTime) -> String {
    format!("rpt_{}_{}", now.unix_timestamp_nanos() / 1_000_000, random_suffix())
}

fn device_id(store: &mut dyn KeyValueStore, now: OffsetDateTime) -> String {
    if let Some(id) = load::<String>(store, DEVICE_KEY) {
        return id;
    }

    let id = format!("dev_{}_{}", now.unix_timestamp_nanos() / 1_000_000, random_suffix());
    save(store, DEVICE_KEY, &id);
    id
}

#[cfg(test)]
mod tests {
    use std::{
        cell::{Cell, RefCell},
        rc::Rc,
        time::Duration,
    };

    use futures::{future::LocalBoxFuture, FutureExt};
    use serde_json::{json, Map};
    use time::macros::datetime;
    use tokio::{sync::Notify, task::LocalSet};

    use super::{
        DeliveryStatus, HookEvent, PipelineConfig, PipelineEvent, ProcessingGuard, Report,
        ReportContext, ReportKind, ReportSink, ReportingPipeline, RouteSummary, SubmitError,
    };
    use crate::{clock::ManualClock, geometry::LatLng, retry::RetryPolicy, store::MemoryStore};

    /// Records every submission. The first `failures` calls fail.
    #[derive(Clone, Default)]
    struct RecordingSink {
        calls: Rc<RefCell<Vec<(ReportKind, Vec<String>)>>>,
        failures: Rc<Cell<u32>>,
        gate: Option<Rc<Notify>>,
    }

    impl ReportSink for RecordingSink {
        fn submit<'a>(
            &'a self,
            kind: ReportKind,
            _user_id: &'a str,
            reports: &'a [Report],
        ) -> LocalBoxFuture<'a, Result<(), SubmitError>> {
            async move {
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
                self.calls
                    .borrow_mut()
                    .push((kind, reports.iter().map(|r| r.id.clone()).collect()));
                let failures = self.failures.get();
                if failures > 0 {
                    self.failures.set(failures - 1);
                    Err(SubmitError::Status(503))
                } else {
                    Ok(())
                }
            }
            .boxed_local()
        }
    }

    fn clock() -> ManualClock {
        ManualClock::new(datetime!(2024-06-01 12:00 +02:00))
    }

    fn pipeline(store: &MemoryStore, sink: &RecordingSink, clock: &ManualClock) -> ReportingPipeline {
        let config = PipelineConfig {
            user_id: Some("tester".into()),
            ..PipelineConfig::default()
        };
        ReportingPipeline::new(config, store.clone(), sink.clone(), clock.clone())
    }

    fn counter(p: &ReportingPipeline, event: HookEvent) -> Rc<RefCell<u32>> {
        let count = Rc::new(RefCell::new(0));
        let c = count.clone();
        p.add_hook(event, move |_| *c.borrow_mut() += 1);
        count
    }

    #[test]
    fn same_day_duplicates_are_blocked() {
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &RecordingSink::default(), &clock);
        let blocked = counter(&p, HookEvent::DuplicateBlocked);

        assert!(p.report_hazard("pin-001", ReportContext::Proximity, Map::new()));
        assert!(!p.report_hazard("pin-001", ReportContext::Proximity, Map::new()));
        // keyed by hazard id alone
        assert!(!p.report_hazard("pin-001", ReportContext::RoutePlanning, Map::new()));
        assert_eq!(*blocked.borrow(), 2);
        assert_eq!(p.stats().duplicates_blocked, 2);

        clock.advance(Duration::from_secs(60 * 60));
        assert!(!p.check_day_rotation());

        // 12:00 + 13h is past local midnight
        clock.advance(Duration::from_secs(12 * 60 * 60));
        assert!(p.check_day_rotation());
        assert!(p.report_hazard("pin-001", ReportContext::Proximity, Map::new()));
    }

    #[test]
    fn state_survives_restart() {
        let store = MemoryStore::new();
        let sink = RecordingSink::default();
        let clock = clock();

        let first = pipeline(&store, &sink, &clock);
        assert!(first.report_hazard("pin-001", ReportContext::Proximity, Map::new()));
        let user = first.user_id();
        drop(first);

        let second = pipeline(&store, &sink, &clock);
        assert!(second.is_duplicate_today("pin-001"));
        assert!(!second.report_hazard("pin-001", ReportContext::Proximity, Map::new()));
        assert_eq!(second.history().len(), 1);
        assert_eq!(second.pending(), 1, "undelivered report is re-queued");
        assert_eq!(second.stats().pin_reports, 1);
        assert_eq!(second.user_id(), user);
    }

    #[tokio::test]
    async fn restart_after_midnight_rotates() {
        let store = MemoryStore::new();
        let sink = RecordingSink::default();
        let clock = clock();

        let first = pipeline(&store, &sink, &clock);
        assert!(first.report_hazard("pin-001", ReportContext::Proximity, Map::new()));
        drop(first);

        clock.advance(Duration::from_secs(13 * 60 * 60));
        let second = pipeline(&store, &sink, &clock);
        let rotated = counter(&second, HookEvent::DayRotated);

        assert!(!second.is_duplicate_today("pin-001"));
        assert!(second.report_hazard("pin-001", ReportContext::Proximity, Map::new()));
        assert!(!second.check_day_rotation());

        // the rotation found on start is announced by run()
        let _ = tokio::time::timeout(Duration::from_millis(20), second.run()).await;
        assert_eq!(*rotated.borrow(), 1);
        assert_eq!(second.pending(), 0);
    }

    #[tokio::test]
    async fn first_start_is_not_a_rotation() {
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &RecordingSink::default(), &clock);
        let rotated = counter(&p, HookEvent::DayRotated);

        let _ = tokio::time::timeout(Duration::from_millis(5), p.run()).await;
        assert_eq!(*rotated.borrow(), 0);
    }

    #[test]
    fn per_hazard_history_survives_restart() {
        let store = MemoryStore::new();
        let sink = RecordingSink::default();
        let clock = clock();

        let p = pipeline(&store, &sink, &clock);
        assert_eq!(p.report_count("pin-001"), 0);
        assert_eq!(p.last_report_time("pin-001"), None);

        p.report_hazard("pin-001", ReportContext::Proximity, Map::new());
        // duplicates are not counted
        p.report_hazard("pin-001", ReportContext::RoutePlanning, Map::new());
        assert_eq!(p.report_count("pin-001"), 1);

        clock.advance(Duration::from_secs(13 * 60 * 60));
        assert!(p.check_day_rotation());
        assert!(p.report_hazard("pin-001", ReportContext::Proximity, Map::new()));
        drop(p);

        let again = pipeline(&store, &sink, &clock);
        assert_eq!(again.report_count("pin-001"), 2);
        assert_eq!(again.last_report_time("pin-001"), Some(datetime!(2024-06-02 01:00 +02:00)));
        assert_eq!(again.report_count("pin-002"), 0);

        again.clear_all();
        assert_eq!(again.report_count("pin-001"), 0);
    }

    #[test]
    fn custom_events_share_the_queue() {
        let sink = RecordingSink::default();
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &sink, &clock);
        let seen = counter(&p, HookEvent::EventReported);

        let mut data = Map::new();
        data.insert("screen".into(), json!("settings"));
        let id = p.report_event("app_opened", data);
        p.report_hazard("pin-001", ReportContext::Proximity, Map::new());

        assert_eq!(*seen.borrow(), 1);
        assert_eq!(p.stats().event_reports, 1);
        assert_eq!(p.stats().total_reports, 2);

        let wire = p.history()[0].report.to_wire("tester");
        assert_eq!(wire["event_type"], "app_opened");
        assert_eq!(wire["data"]["screen"], "settings");
        assert_eq!(wire["user_id"], "tester");

        tokio_test::block_on(p.drain());
        let calls = sink.calls.borrow();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], (ReportKind::Event, vec![id]));
        assert_eq!(ReportKind::Event.endpoint(), "reports/event");
    }

    #[test]
    fn anonymous_device_id_is_stable() {
        let store = MemoryStore::new();
        let clock = clock();
        let sink = RecordingSink::default();

        let a = ReportingPipeline::new(PipelineConfig::default(), store.clone(), sink.clone(), clock.clone());
        let b = ReportingPipeline::new(PipelineConfig::default(), store, sink, clock);

        assert!(a.user_id().starts_with("anonymous_dev_"));
        assert_eq!(a.user_id(), b.user_id());
    }

    #[test]
    fn delivers_in_batches_by_kind() {
        let sink = RecordingSink::default();
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &sink, &clock);

        for i in 0..12 {
            p.report_hazard(&format!("pin-{i:03}"), ReportContext::Proximity, Map::new());
        }
        p.report_route(&RouteSummary {
            distance: Some(42_000.0),
            ..RouteSummary::default()
        });

        tokio_test::block_on(p.drain());

        let calls = sink.calls.borrow();
        let sizes: Vec<_> = calls.iter().map(|(k, ids)| (*k, ids.len())).collect();
        assert_eq!(
            sizes,
            vec![(ReportKind::PinAlert, 10), (ReportKind::PinAlert, 2), (ReportKind::RouteCreated, 1)]
        );
        assert_eq!(p.pending(), 0);
        assert!(p.history().iter().all(|r| r.status == DeliveryStatus::Delivered));
        assert_eq!(p.stats().backend_successes, 13);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let sink = RecordingSink::default();
        sink.failures.set(u32::MAX);
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &sink, &clock);
        let failed = counter(&p, HookEvent::ReportFailed);

        p.report_hazard("pin-001", ReportContext::Proximity, Map::new());
        tokio_test::block_on(p.drain());

        // first attempt plus three retries
        assert_eq!(sink.calls.borrow().len(), 4);
        assert_eq!(*failed.borrow(), 1);
        assert_eq!(p.pending(), 0);
        assert_eq!(p.history()[0].status, DeliveryStatus::Failed);
        assert_eq!(p.history()[0].retries, 3);
        assert_eq!(clock.slept(), Duration::from_secs(2 + 4 + 8));
    }

    #[test]
    fn retried_reports_jump_the_queue() {
        let sink = RecordingSink::default();
        sink.failures.set(1);
        let clock = clock();
        let config = PipelineConfig {
            batch_size: 1,
            retry: RetryPolicy {
                base_delay: Duration::from_millis(50),
                ..RetryPolicy::default()
            },
            ..PipelineConfig::default()
        };
        let p = ReportingPipeline::new(config, MemoryStore::new(), sink.clone(), clock.clone());

        for id in ["a", "b", "c"] {
            p.report_hazard(id, ReportContext::Proximity, Map::new());
        }
        let ids: Vec<String> = p.history().into_iter().map(|r| r.report.id).collect();

        tokio_test::block_on(p.drain());

        // "a" fails, its backoff ends during the pause after the failed
        // batch, so it goes out before "b"
        let order: Vec<String> = sink.calls.borrow().iter().map(|(_, batch)| batch[0].clone()).collect();
        assert_eq!(order, vec![ids[0].clone(), ids[0].clone(), ids[1].clone(), ids[2].clone()]);
        assert_eq!(p.history()[0].retries, 1);
        assert_eq!(p.stats().backend_failures, 1);
        assert_eq!(p.stats().backend_successes, 3);
    }

    #[test]
    fn overlapping_drains_do_not_double_submit() {
        let gate = Rc::new(Notify::new());
        let sink = RecordingSink {
            gate: Some(gate.clone()),
            ..RecordingSink::default()
        };
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &sink, &clock);
        p.report_hazard("pin-001", ReportContext::Proximity, Map::new());

        tokio_test::block_on(async {
            futures::join!(p.drain(), async {
                assert!(p.is_processing());
                p.drain().await;
                gate.notify_one();
            });
        });

        assert_eq!(sink.calls.borrow().len(), 1);
        assert!(!p.is_processing());
        assert_eq!(p.pending(), 0);
    }

    #[tokio::test]
    async fn drain_after_aborting_the_runner_delivers() {
        let gate = Rc::new(Notify::new());
        let sink = RecordingSink {
            gate: Some(gate.clone()),
            ..RecordingSink::default()
        };
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &sink, &clock);

        LocalSet::new()
            .run_until(async {
                let runner = tokio::task::spawn_local({
                    let p = p.clone();
                    async move { p.run().await }
                });
                p.report_hazard("pin-001", ReportContext::Proximity, Map::new());
                while !p.is_processing() {
                    tokio::task::yield_now().await;
                }

                // runner is stuck in submit; shut down the way the binary does
                runner.abort();
                assert!(runner.await.unwrap_err().is_cancelled());
                assert!(!p.is_processing());
                assert_eq!(p.pending(), 1);

                gate.notify_one();
                p.drain().await;
            })
            .await;

        assert_eq!(sink.calls.borrow().len(), 1);
        assert_eq!(p.pending(), 0);
        assert_eq!(p.history()[0].status, DeliveryStatus::Delivered);
    }

    #[test]
    fn guard_clears_flag_while_state_is_borrowed() {
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &RecordingSink::default(), &clock);

        let guard = ProcessingGuard::acquire(&p.processing);
        assert!(guard.is_some());
        assert!(p.is_processing());
        assert!(ProcessingGuard::acquire(&p.processing).is_none());

        let _state = p.inner.borrow_mut();
        drop(guard);
        assert!(!p.is_processing());
    }

    #[test]
    fn panicking_hook_is_contained() {
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &RecordingSink::default(), &clock);
        p.add_hook(HookEvent::PinReported, |_| panic!("analytics down"));
        let seen = counter(&p, HookEvent::PinReported);

        assert!(p.report_hazard("pin-001", ReportContext::Proximity, Map::new()));
        assert_eq!(*seen.borrow(), 1);
    }

    #[test]
    fn removed_hook_is_silent() {
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &RecordingSink::default(), &clock);
        let count = Rc::new(RefCell::new(Vec::new()));
        let c = count.clone();
        let id = p.add_hook(HookEvent::PinReported, move |e| {
            if let PipelineEvent::PinReported(r) = e {
                c.borrow_mut().push(r.hazard_id.clone());
            }
        });

        p.report_hazard("a", ReportContext::Proximity, Map::new());
        assert!(p.remove_hook(id));
        p.report_hazard("b", ReportContext::Proximity, Map::new());

        assert_eq!(*count.borrow(), vec![Some("a".to_string())]);
    }

    #[test]
    fn wire_format() {
        let clock = clock();
        let p = pipeline(&MemoryStore::new(), &RecordingSink::default(), &clock);
        let mut meta = Map::new();
        meta.insert("location".into(), json!(LatLng::new(58.14, 8.0)));
        meta.insert("distance".into(), json!(812.5));
        meta.insert("bearing".into(), json!(12.0));
        p.report_hazard("pin-001", ReportContext::Proximity, meta);

        let pin = p.history()[0].report.to_wire("tester");
        assert_eq!(pin["hazard_id"], "pin-001");
        assert_eq!(pin["context"], "proximity");
        assert_eq!(pin["location"]["lat"], 58.14);
        assert_eq!(pin["timestamp"], "2024-06-01T12:00:00+02:00");

        p.report_route(&RouteSummary::default());
        let route = p.history()[1].report.to_wire("tester");
        assert_eq!(route["profile"], "driving");
        assert_eq!(route["user_id"], "tester");
    }
}
