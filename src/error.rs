//! Errors surfaced by the configuration database.

use nested_enum_utils::common_fields;
use snafu::{Backtrace, Snafu};

/// Boxed error carried by [`DalError::Internal`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure of a database operation.
#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum DalError {
    /// The curl, or the residual part of it, does not resolve to any node.
    #[snafu(display("curl '{curl}' does not exist"))]
    RecordNotFound { curl: String },
    /// The record parser rejected a record.
    #[snafu(display("XML error in record '{curl}' ({path}): {detail}"))]
    RecordMalformed {
        curl: String,
        path: String,
        detail: String,
    },
    /// The call arrived after shutdown.
    #[snafu(display("service is shut down"))]
    ServiceUnavailable {},
    /// Unexpected failure during assembly, object activation or persistence.
    #[snafu(display("{operation} failed for curl '{curl}'"))]
    Internal {
        operation: &'static str,
        curl: String,
        source: BoxError,
    },
}

impl DalError {
    /// The curl this error refers to, if any.
    pub fn curl(&self) -> Option<&str> {
        match self {
            Self::RecordNotFound { curl, .. }
            | Self::RecordMalformed { curl, .. }
            | Self::Internal { curl, .. } => Some(curl),
            Self::ServiceUnavailable { .. } => None,
        }
    }

    /// Whether this is a [`DalError::RecordNotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::RecordNotFound { .. })
    }
}
