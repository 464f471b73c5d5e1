//! HTTP clients for the hazard backend: catalog sync, report delivery and
//! remote route scans.
use futures::{future::LocalBoxFuture, FutureExt};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
#[cfg(feature = "tracing")]
use tracing::{debug, instrument, warn};

use crate::{
    hazard::{DeltaError, DeltaOutcome, DeltaSet, Hazard, SharedCache},
    report::{Report, ReportKind, ReportSink, SubmitError},
    route::{decode_remote_matches, RouteAnalyzer, RouteError, RouteGeometry, RouteMatch},
};

/// An error that can occur while syncing the hazard catalog.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The request could not be made.
    #[error("reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    /// The catalog answered with a non-success status.
    #[error("catalog returned status {0}")]
    Status(u16),
    /// The response body was not JSON.
    #[error("invalid catalog response: {0}")]
    Decode(#[from] serde_json::Error),
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{path}", base.trim_end_matches('/'))
}

/// The sync cursor a response carries, as a string.
fn cursor(body: &Value) -> Option<String> {
    match body.get("timestamp")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// A full catalog snapshot.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Every hazard that decoded.
    pub hazards: Vec<Hazard>,
    /// Pass to [`CatalogClient::fetch_changes`] to get what changed since.
    pub cursor: Option<String>,
}

/// Catalog changes since a cursor.
#[derive(Debug)]
pub struct Changes {
    /// Entries that decoded.
    pub delta: DeltaSet,
    /// Entries that could not be decoded.
    pub rejected: Vec<DeltaError>,
    /// Cursor for the next call, if the backend sent one.
    pub cursor: Option<String>,
}

/// Client for `GET /hazards` and `GET /hazards/changes`.
#[derive(Debug, Clone)]
pub struct CatalogClient {
    client: Client,
    base: String,
}

impl CatalogClient {
    /// A client for the backend at `base`.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base)
    }

    /// Like `new`, reusing an existing [`Client`].
    #[must_use]
    pub fn with_client(client: Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }

    async fn get_json(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, SyncError> {
        let res = self.client.get(url).query(query).send().await?;
        if !res.status().is_success() {
            return Err(SyncError::Status(res.status().as_u16()));
        }
        Ok(res.json().await?)
    }

    /// Fetch every hazard. Entries that fail to decode are skipped.
    ///
    /// # Errors
    ///
    /// Fails on network errors, non-success statuses and bodies that are
    /// not JSON.
    #[cfg_attr(feature = "tracing", instrument(skip(self)))]
    pub async fn fetch_all(&self) -> Result<Snapshot, SyncError> {
        let body = self.get_json(&endpoint(&self.base, "hazards"), &[]).await?;

        let hazards = body
            .get("hazards")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| match Hazard::deserialize(item) {
                        Ok(h) => Some(h),
                        Err(_e) => {
                            #[cfg(feature = "tracing")]
                            warn!("skipping catalog entry: {_e}");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Snapshot {
            hazards,
            cursor: cursor(&body),
        })
    }

    /// Fetch what changed since `since`.
    ///
    /// # Errors
    ///
    /// Fails on network errors, non-success statuses and bodies that are
    /// not JSON. Malformed entries are returned in [`Changes::rejected`].
    #[cfg_attr(feature = "tracing", instrument(skip(self)))]
    pub async fn fetch_changes(&self, since: &str) -> Result<Changes, SyncError> {
        let body = self
            .get_json(&endpoint(&self.base, "hazards/changes"), &[("since", since)])
            .await?;
        let (delta, rejected) = DeltaSet::from_value_lenient(&body);

        Ok(Changes {
            delta,
            rejected,
            cursor: cursor(&body),
        })
    }

    /// Bring `cache` up to date. Without a cursor the whole catalog is
    /// loaded; otherwise only the changes are merged. The cursor is advanced
    /// on success.
    ///
    /// # Errors
    ///
    /// See [`CatalogClient::fetch_all`] and [`CatalogClient::fetch_changes`].
    pub async fn sync(&self, cache: &SharedCache, cursor: &mut Option<String>) -> Result<DeltaOutcome, SyncError> {
        match cursor.as_deref() {
            None => {
                let snapshot = self.fetch_all().await?;
                let added = cache.borrow_mut().load(snapshot.hazards);
                #[cfg(feature = "tracing")]
                debug!(added, "loaded catalog snapshot");
                *cursor = snapshot.cursor;
                Ok(DeltaOutcome {
                    added,
                    ..DeltaOutcome::default()
                })
            }
            Some(since) => {
                let changes = self.fetch_changes(since).await?;
                let mut outcome = cache.borrow_mut().apply_delta(&changes.delta);
                outcome.skipped += changes.rejected.len();
                #[cfg(feature = "tracing")]
                for e in &changes.rejected {
                    warn!("malformed delta entry: {e}");
                }
                if changes.cursor.is_some() {
                    *cursor = changes.cursor;
                }
                Ok(outcome)
            }
        }
    }
}

/// Delivers report batches to `POST /reports/pin-alert` and
/// `POST /reports/route-created`.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: Client,
    base: String,
}

impl HttpSink {
    /// A client for the backend at `base`.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base)
    }

    /// Like `new`, reusing an existing [`Client`].
    #[must_use]
    pub fn with_client(client: Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

fn check(status: StatusCode) -> Result<(), u16> {
    if status.is_success() {
        Ok(())
    } else {
        Err(status.as_u16())
    }
}

/// Error bodies look like `{"error": "..."}`; anything else only keeps the
/// status.
fn rejection(status: u16, body: Option<&Value>) -> SubmitError {
    match body.and_then(|b| b.get("error")?.as_str()) {
        Some(message) => SubmitError::Rejected(format!("{status}: {message}")),
        None => SubmitError::Status(status),
    }
}

impl ReportSink for HttpSink {
    fn submit<'a>(
        &'a self,
        kind: ReportKind,
        user_id: &'a str,
        reports: &'a [Report],
    ) -> LocalBoxFuture<'a, Result<(), SubmitError>> {
        async move {
            let body = json!({
                "reports": reports.iter().map(|r| r.to_wire(user_id)).collect::<Vec<_>>(),
            });
            let res = self
                .client
                .post(endpoint(&self.base, kind.endpoint()))
                .json(&body)
                .send()
                .await?;
            let Err(status) = check(res.status()) else {
                return Ok(());
            };

            let body = res.json::<Value>().await.ok();
            Err(rejection(status, body.as_ref()))
        }
        .boxed_local()
    }
}

/// Delegates route scans to `POST /route/scan`.
#[derive(Debug, Clone)]
pub struct RemoteRouteAnalyzer {
    client: Client,
    base: String,
}

impl RemoteRouteAnalyzer {
    /// A client for the backend at `base`.
    #[must_use]
    pub fn new(base: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base)
    }

    /// Like `new`, reusing an existing [`Client`].
    #[must_use]
    pub fn with_client(client: Client, base: impl Into<String>) -> Self {
        Self {
            client,
            base: base.into(),
        }
    }
}

impl RouteAnalyzer for RemoteRouteAnalyzer {
    fn analyze<'a>(
        &'a self,
        geometry: &'a RouteGeometry,
        tolerance: f64,
    ) -> LocalBoxFuture<'a, Result<Vec<RouteMatch>, RouteError>> {
        async move {
            let res = self
                .client
                .post(endpoint(&self.base, "route/scan"))
                .json(&json!({ "geometry": geometry, "tolerance": tolerance }))
                .send()
                .await?;
            check(res.status()).map_err(RouteError::Status)?;

            let body: Value = res.json().await?;
            Ok(decode_remote_matches(&body, &geometry.polyline())?)
        }
        .boxed_local()
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{check, cursor, endpoint, rejection};
    use crate::report::SubmitError;

    #[test]
    fn joins_paths() {
        assert_eq!(endpoint("http://localhost:8080/api/", "hazards"), "http://localhost:8080/api/hazards");
        assert_eq!(endpoint("http://h", "reports/pin-alert"), "http://h/reports/pin-alert");
    }

    #[test]
    fn cursor_from_string_or_number() {
        assert_eq!(cursor(&json!({"timestamp": "2024-06-01T10:00:00Z"})).as_deref(), Some("2024-06-01T10:00:00Z"));
        assert_eq!(cursor(&json!({"timestamp": 1717236000})).as_deref(), Some("1717236000"));
        assert_eq!(cursor(&json!({"hazards": []})), None);
    }

    #[test]
    fn only_2xx_is_success() {
        assert_eq!(check(StatusCode::OK), Ok(()));
        assert_eq!(check(StatusCode::NO_CONTENT), Ok(()));
        assert_eq!(check(StatusCode::SERVICE_UNAVAILABLE), Err(503));
        assert_eq!(check(StatusCode::FOUND), Err(302));
    }

    #[test]
    fn error_body_becomes_rejection() {
        let err = rejection(400, Some(&json!({"error": "reports must be an array"})));
        assert!(matches!(&err, SubmitError::Rejected(m) if m == "400: reports must be an array"));

        assert!(matches!(rejection(502, None), SubmitError::Status(502)));
        assert!(matches!(rejection(500, Some(&json!({"message": "oops"}))), SubmitError::Status(500)));
        assert!(matches!(rejection(500, Some(&json!({"error": 17}))), SubmitError::Status(500)));
    }
}
