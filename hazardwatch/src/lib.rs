#![warn(
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    missing_debug_implementations,
    unreachable_pub
)]
#![allow(clippy::module_name_repetitions)]

//! Geospatial hazard matching and alert reporting.
//!
//! A [`hazard::HazardCache`] holds the known hazards. A
//! [`scanner::ProximityScanner`] checks a moving observer against it, a
//! [`route::RouteMatcher`] checks a planned route, and both hand what they
//! find to a [`report::ReportingPipeline`], which deduplicates per day,
//! persists and delivers the reports.

pub mod clock;
pub mod geometry;
pub mod hazard;
#[cfg(feature = "http")]
pub mod http;
pub mod location;
pub mod report;
pub mod retry;
pub mod route;
pub mod scanner;
pub mod store;
