//! Mapping of NAS failures onto gRPC status codes.
//!
//! Every failure talking to the NAS is caller-retryable, so it surfaces as
//! `Unavailable` with the failing step as context.

use tonic::Status;
use tracing::error;
use truenas_api::NasError;

/// Wrap a NAS failure as `Unavailable`, naming the step that failed.
pub fn nas_unavailable(context: &str, err: &NasError) -> Status {
    error!(error = %err, "{}", context);
    Status::unavailable(format!("{}: {}", context, err))
}

/// `?`-friendly conversion of NAS results.
pub trait NasResultExt<T> {
    /// Map any NAS error to `Unavailable` with `context`.
    fn or_unavailable(self, context: &str) -> Result<T, Status>;

    /// Treat a 404 as success, map any other error to `Unavailable`.
    fn ignore_not_found(self, context: &str) -> Result<Option<T>, Status>;
}

impl<T> NasResultExt<T> for truenas_api::Result<T> {
    fn or_unavailable(self, context: &str) -> Result<T, Status> {
        self.map_err(|e| nas_unavailable(context, &e))
    }

    fn ignore_not_found(self, context: &str) -> Result<Option<T>, Status> {
        match self {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(nas_unavailable(context, &e)),
        }
    }
}

/// Short label for a status code, used as the failure label in metrics.
pub fn code_label(status: &Status) -> &'static str {
    match status.code() {
        tonic::Code::InvalidArgument => "invalid_argument",
        tonic::Code::NotFound => "not_found",
        tonic::Code::AlreadyExists => "already_exists",
        tonic::Code::Unavailable => "unavailable",
        tonic::Code::Internal => "internal",
        tonic::Code::Unimplemented => "unimplemented",
        tonic::Code::FailedPrecondition => "failed_precondition",
        _ => "other",
    }
}
