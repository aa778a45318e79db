use axum::{
    Json,
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::{dao::DaoError, error::DalError, listener::DeliveryError};

pub type AppResult<T> = Result<T, AppError>;

/// Error response body of the HTTP API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    #[serde(with = "serde_status_code")]
    status: StatusCode,
    detail: Option<String>,
}

impl Default for AppError {
    fn default() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: None,
        }
    }
}

impl AppError {
    /// Create a new [`AppError`].
    pub fn new(status_code: StatusCode, message: Option<impl ToString>) -> AppError {
        Self {
            status: status_code,
            detail: message.map(|m| m.to_string()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let json = Json(self.clone());
        (self.status, json).into_response()
    }
}

impl From<DalError> for AppError {
    fn from(value: DalError) -> Self {
        let status = match &value {
            DalError::RecordNotFound { .. } => StatusCode::NOT_FOUND,
            DalError::RecordMalformed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            DalError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, Some(value))
    }
}

impl From<DaoError> for AppError {
    fn from(value: DaoError) -> Self {
        let status = match &value {
            DaoError::Destroyed { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DaoError::FieldNotFound { .. } => StatusCode::NOT_FOUND,
        };
        Self::new(status, Some(value))
    }
}

impl From<DeliveryError> for AppError {
    fn from(value: DeliveryError) -> Self {
        Self::new(StatusCode::BAD_REQUEST, Some(value))
    }
}

impl From<QueryRejection> for AppError {
    fn from(value: QueryRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, Some(value))
    }
}

impl From<PathRejection> for AppError {
    fn from(value: PathRejection) -> Self {
        Self::new(StatusCode::BAD_REQUEST, Some(value))
    }
}

impl From<JsonRejection> for AppError {
    fn from(value: JsonRejection) -> Self {
        Self::new(value.status(), Some(value.body_text()))
    }
}

/// Serialize/Deserializer for status codes.
///
/// The status code is encoded as a string, as in JSON API error objects.
pub mod serde_status_code {
    use axum::http::StatusCode;
    use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Unexpected};

    /// Serialize [StatusCode]s.
    pub fn serialize<S: Serializer>(status: &StatusCode, ser: S) -> Result<S::Ok, S::Error> {
        String::serialize(&status.as_u16().to_string(), ser)
    }

    /// Deserialize [StatusCode]s.
    pub fn deserialize<'de, D>(de: D) -> Result<StatusCode, D::Error>
    where
        D: Deserializer<'de>,
    {
        let str = String::deserialize(de)?;
        StatusCode::from_bytes(str.as_bytes()).map_err(|_| {
            serde::de::Error::invalid_value(
                Unexpected::Str(str.as_str()),
                &"A valid http status code",
            )
        })
    }
}
