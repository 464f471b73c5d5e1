use futures::{future::LocalBoxFuture, FutureExt};
use hazardwatch::{
    http::HttpSink,
    report::{Report, ReportKind, ReportSink, SubmitError},
};
use tracing::info;

/// Where reports end up: the backend, or the log when running offline.
#[derive(Debug)]
pub enum Delivery {
    Http(HttpSink),
    Log,
}

impl ReportSink for Delivery {
    fn submit<'a>(
        &'a self,
        kind: ReportKind,
        user_id: &'a str,
        reports: &'a [Report],
    ) -> LocalBoxFuture<'a, Result<(), SubmitError>> {
        match self {
            Self::Http(sink) => sink.submit(kind, user_id, reports),
            Self::Log => async move {
                for report in reports {
                    info!(endpoint = kind.endpoint(), body = %report.to_wire(user_id), "report");
                }
                Ok(())
            }
            .boxed_local(),
        }
    }
}
