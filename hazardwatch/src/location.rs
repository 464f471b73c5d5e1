//! Observer positions and the device streams that produce them.
use std::{
    collections::VecDeque,
    fmt,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
};

use futures::{future::LocalBoxFuture, ready, FutureExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
#[cfg(feature = "tracing")]
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    geometry::{self, LatLng},
    retry::RetryPolicy,
};

/// Number of recent positions kept for speed and heading derivation.
pub const HISTORY_LEN: usize = 10;

/// A single fix from the location device.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Latitude.
    pub lat: f64,
    /// Longitude.
    pub lng: f64,
    /// Horizontal accuracy (meters).
    #[serde(default)]
    pub accuracy: f64,
    /// Heading reported by the device (degrees).
    #[serde(default)]
    pub heading: Option<f64>,
    /// Speed reported by the device (m/s).
    #[serde(default)]
    pub speed: Option<f64>,
    /// Time of the fix.
    #[serde(with = "unix_millis_serde")]
    pub timestamp: OffsetDateTime,
}

impl Position {
    /// A bare fix at `location`.
    #[must_use]
    pub const fn new(location: LatLng, timestamp: OffsetDateTime) -> Self {
        Self {
            lat: location.lat,
            lng: location.lng,
            accuracy: 0.0,
            heading: None,
            speed: None,
            timestamp,
        }
    }

    /// Where the fix was taken.
    #[must_use]
    pub const fn location(&self) -> LatLng {
        LatLng::new(self.lat, self.lng)
    }

    /// Whether the coordinates are in range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.location().is_valid()
    }
}

mod unix_millis_serde {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use time::OffsetDateTime;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S>(value: &OffsetDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_i64((value.unix_timestamp_nanos() / 1_000_000) as i64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<OffsetDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = i64::deserialize(deserializer)?;
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
            .map_err(de::Error::custom)
    }
}

/// Speed and heading derived from the recent track.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Motion {
    /// Meters per second.
    pub speed: f64,
    /// Degrees within `[0, 360)`.
    pub heading: f64,
}

/// Keeps the last few positions and derives motion from them.
#[derive(Debug, Clone, Default)]
pub struct PositionTracker {
    history: VecDeque<Position>,
    motion: Motion,
}

impl PositionTracker {
    /// A tracker without fixes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fix and return the updated motion estimate.
    ///
    /// A positive device speed is trusted over the computed one. Heading
    /// is always taken from the last two fixes once there are two.
    pub fn push(&mut self, position: Position) -> Motion {
        match self.history.back() {
            None => {
                self.motion = Motion {
                    speed: position.speed.unwrap_or(0.0),
                    heading: position.heading.unwrap_or(0.0),
                };
            }
            Some(prev) => {
                let secs = (position.timestamp - prev.timestamp).as_seconds_f64();
                if secs > 0.0 {
                    let computed = geometry::distance(prev.location(), position.location()) / secs;
                    self.motion = Motion {
                        speed: position.speed.filter(|s| *s > 0.0).unwrap_or(computed),
                        heading: geometry::bearing(prev.location(), position.location()),
                    };
                }
            }
        }

        self.history.push_back(position);
        if self.history.len() > HISTORY_LEN {
            self.history.pop_front();
        }

        self.motion
    }

    /// Most recent fix.
    #[must_use]
    pub fn current(&self) -> Option<&Position> {
        self.history.back()
    }

    /// Latest motion estimate.
    #[must_use]
    pub const fn motion(&self) -> Motion {
        self.motion
    }

    /// Recent fixes, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Position> {
        self.history.iter()
    }
}

/// Things that go wrong with the location device.
#[derive(Debug, Error)]
pub enum LocationError {
    /// Permission denied or no device. Needs user action.
    #[error("location device unavailable: {0}")]
    DeviceUnavailable(String),
    /// The device did not produce a fix in time.
    #[error("location device timed out")]
    DeviceTimeout,
    /// The device could not determine a position.
    #[error("position unavailable")]
    PositionUnavailable,
    /// A fix could not be decoded.
    #[error("decode position failed: {0}")]
    Decode(#[from] serde_json::Error),
    /// The source could not be read.
    #[error("read position source failed: {0}")]
    Io(#[from] std::io::Error),
    /// Retryable errors kept coming after every retry was used.
    #[error("giving up after {retries} retries: {last}")]
    RetriesExhausted {
        /// Retries made.
        retries: u32,
        /// The last error seen.
        last: Box<LocationError>,
    },
}

impl LocationError {
    /// Whether reconnecting could help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::DeviceTimeout | Self::PositionUnavailable)
    }
}

/// Something that can open a stream of positions, e.g. a GPS receiver or a
/// recorded track.
pub trait LocationSource {
    /// The stream of fixes. Ending the stream means the source is done.
    type Stream: Stream<Item = Result<Position, LocationError>> + Unpin;

    /// Open (or reopen) the source.
    fn connect(&self) -> LocalBoxFuture<'static, Result<Self::Stream, LocationError>>;
}

/// A position stream that reopens its source after retryable errors.
///
/// Every error is still yielded so the caller can surface it. Retryable
/// errors are followed by a reconnect after a capped exponential backoff;
/// once the retry budget is spent, or on a fatal error, the stream yields
/// that error and ends. A successful fix resets the budget.
pub struct ResilientPositions<S: LocationSource> {
    source: Rc<S>,
    clock: Rc<dyn Clock>,
    policy: RetryPolicy,
    retries: u32,
    state: State<S::Stream>,
}

enum State<S> {
    Connecting(LocalBoxFuture<'static, Result<S, LocationError>>),
    Connected(S),
    Backoff(LocalBoxFuture<'static, ()>),
    Done,
}

impl<S: LocationSource> ResilientPositions<S> {
    /// Start connecting to `source`.
    pub fn new(source: S, clock: Rc<dyn Clock>, policy: RetryPolicy) -> Self {
        let source = Rc::new(source);
        Self {
            state: State::Connecting(source.connect()),
            source,
            clock,
            policy,
            retries: 0,
        }
    }

    fn fail(&mut self, err: LocationError) -> LocationError {
        if !err.is_retryable() {
            #[cfg(feature = "tracing")]
            warn!("location source failed: {err}");
            self.state = State::Done;
            return err;
        }

        if !self.policy.allows(self.retries) {
            self.state = State::Done;
            return LocationError::RetriesExhausted {
                retries: self.retries,
                last: Box::new(err),
            };
        }

        self.retries += 1;
        let delay = self.policy.delay(self.retries);
        #[cfg(feature = "tracing")]
        debug!(retry = self.retries, ?delay, "location error, backing off: {err}");
        self.state = State::Backoff(self.clock.sleep(delay));
        err
    }
}

impl<S: LocationSource> Stream for ResilientPositions<S> {
    type Item = Result<Position, LocationError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let next = match &mut self.state {
                State::Connecting(fut) => match ready!(fut.poll_unpin(cx)) {
                    Ok(stream) => State::Connected(stream),
                    Err(e) => return Poll::Ready(Some(Err(self.fail(e)))),
                },
                State::Connected(stream) => match ready!(stream.poll_next_unpin(cx)) {
                    Some(Ok(position)) => {
                        self.retries = 0;
                        return Poll::Ready(Some(Ok(position)));
                    }
                    Some(Err(e)) => return Poll::Ready(Some(Err(self.fail(e)))),
                    None => {
                        self.state = State::Done;
                        return Poll::Ready(None);
                    }
                },
                State::Backoff(sleep) => {
                    ready!(sleep.poll_unpin(cx));
                    State::Connecting(self.source.connect())
                }
                State::Done => return Poll::Ready(None),
            };

            self.state = next;
        }
    }
}

impl<S: LocationSource> fmt::Debug for ResilientPositions<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            State::Connecting(_) => "Connecting",
            State::Connected(_) => "Connected",
            State::Backoff(_) => "Backoff",
            State::Done => "Done",
        };
        f.debug_struct("ResilientPositions")
            .field("state", &state)
            .field("retries", &self.retries)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, collections::VecDeque, rc::Rc, time::Duration};

    use futures::{future::LocalBoxFuture, stream, FutureExt, StreamExt};
    use time::macros::datetime;

    use super::{LocationError, LocationSource, Position, PositionTracker, ResilientPositions};
    use crate::{clock::ManualClock, geometry::LatLng, retry::RetryPolicy};

    type Script = Vec<Result<Position, LocationError>>;

    /// Hands out one scripted session per connect.
    struct Scripted {
        sessions: RefCell<VecDeque<Script>>,
        connects: Rc<RefCell<u32>>,
    }

    impl Scripted {
        fn new(sessions: Vec<Script>) -> Self {
            Self {
                sessions: RefCell::new(sessions.into()),
                connects: Rc::default(),
            }
        }
    }

    impl LocationSource for Scripted {
        type Stream = stream::Iter<std::vec::IntoIter<Result<Position, LocationError>>>;

        fn connect(&self) -> LocalBoxFuture<'static, Result<Self::Stream, LocationError>> {
            *self.connects.borrow_mut() += 1;
            let session = self.sessions.borrow_mut().pop_front().unwrap_or_default();
            futures::future::ready(Ok(stream::iter(session))).boxed_local()
        }
    }

    fn fix(lat: f64) -> Position {
        Position::new(LatLng::new(lat, 8.0), datetime!(2024-06-01 12:00 UTC))
    }

    #[test]
    fn derives_speed_and_heading() {
        let mut tracker = PositionTracker::new();
        let t0 = datetime!(2024-06-01 12:00 UTC);

        tracker.push(Position::new(LatLng::new(58.0, 8.0), t0));
        let motion = tracker.push(Position::new(
            LatLng::new(58.001, 8.0),
            t0 + Duration::from_secs(10),
        ));

        // 0.001 degrees of latitude is about 111 m
        assert!((motion.speed - 11.12).abs() < 0.05);
        assert!(motion.heading.abs() < 1e-6);
    }

    #[test]
    fn device_speed_wins() {
        let mut tracker = PositionTracker::new();
        let t0 = datetime!(2024-06-01 12:00 UTC);

        tracker.push(Position::new(LatLng::new(58.0, 8.0), t0));
        let mut second = Position::new(LatLng::new(58.0, 8.001), t0 + Duration::from_secs(5));
        second.speed = Some(25.0);

        let motion = tracker.push(second);
        assert_eq!(motion.speed, 25.0);
        assert!((motion.heading - 90.0).abs() < 0.1);
    }

    #[test]
    fn history_is_bounded() {
        let mut tracker = PositionTracker::new();
        for i in 0..25 {
            tracker.push(fix(58.0 + f64::from(i) * 0.001));
        }

        assert_eq!(tracker.history().count(), super::HISTORY_LEN);
        assert!((tracker.current().unwrap().lat - 58.024).abs() < 1e-9);
    }

    #[test]
    fn parses_device_json() {
        let p: Position = serde_json::from_str(
            r#"{"lat":58.1467,"lng":8.0059,"accuracy":5,"heading":null,"timestamp":1717243200000}"#,
        )
        .unwrap();

        assert_eq!(p.timestamp, datetime!(2024-06-01 12:00 UTC));
        assert_eq!(p.speed, None);
    }

    #[test]
    fn reconnects_after_timeout() {
        let source = Scripted::new(vec![
            vec![Ok(fix(58.0)), Err(LocationError::DeviceTimeout)],
            vec![Ok(fix(58.1))],
        ]);
        let connects = source.connects.clone();
        let clock = ManualClock::new(datetime!(2024-06-01 12:00 UTC));

        let items: Vec<_> = tokio_test::block_on(
            ResilientPositions::new(source, Rc::new(clock.clone()), RetryPolicy::default()).collect(),
        );

        assert_eq!(items.len(), 3);
        assert!(matches!(items[1], Err(LocationError::DeviceTimeout)));
        assert_eq!(items[2].as_ref().unwrap().lat, 58.1);
        assert_eq!(*connects.borrow(), 2);
        assert_eq!(clock.slept(), Duration::from_secs(2));
    }

    #[test]
    fn gives_up_after_budget() {
        let sessions = (0..10)
            .map(|_| vec![Err(LocationError::PositionUnavailable)])
            .collect();
        let clock = ManualClock::new(datetime!(2024-06-01 12:00 UTC));

        let items: Vec<_> = tokio_test::block_on(
            ResilientPositions::new(
                Scripted::new(sessions),
                Rc::new(clock.clone()),
                RetryPolicy::default(),
            )
            .collect(),
        );

        // three retryable errors, then the terminal one
        assert_eq!(items.len(), 4);
        assert!(matches!(
            items[3],
            Err(LocationError::RetriesExhausted { retries: 3, .. })
        ));
        assert_eq!(clock.slept(), Duration::from_secs(2 + 4 + 8));
    }

    #[test]
    fn denied_is_fatal() {
        let clock = ManualClock::new(datetime!(2024-06-01 12:00 UTC));
        let items: Vec<_> = tokio_test::block_on(
            ResilientPositions::new(
                Scripted::new(vec![vec![Err(LocationError::DeviceUnavailable("denied".into()))]]),
                Rc::new(clock),
                RetryPolicy::default(),
            )
            .collect(),
        );

        assert_eq!(items.len(), 1);
        assert!(matches!(items[0], Err(LocationError::DeviceUnavailable(_))));
    }
}
