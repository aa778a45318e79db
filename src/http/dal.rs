//! Handlers exposing the configuration database operations

use axum::{
    Json,
    extract::{
        FromRequestParts, Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{StatusCode, header::CONTENT_TYPE, request::Parts},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{AppError, AppResult};
use crate::{state::AppState, subscriptions::ListenerId};

const XML_CONTENT_TYPE: &str = "application/xml";

/// The `curl` query parameter. A missing parameter addresses the root.
#[derive(Debug, Default, Deserialize)]
pub struct CurlQuery {
    #[serde(default)]
    pub curl: String,
}

/// Extracts a [`CurlQuery`], rejecting with an [`AppError`].
#[derive(Debug)]
pub struct Curl(pub String);

impl<S> FromRequestParts<S> for Curl
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(query) = Query::<CurlQuery>::from_request_parts(parts, state).await?;
        Ok(Curl(query.curl))
    }
}

#[derive(Debug, Deserialize)]
pub struct FieldQuery {
    pub curl: String,
    pub field: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DaoResponse {
    pub curl: String,
    pub handle: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub reference: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub id: ListenerId,
}

/// GET handler returning the assembled document of a curl
pub async fn get_document(State(state): State<AppState>, Curl(curl): Curl) -> AppResult<Response> {
    let document = state.dal.get_document(&curl).await?;
    Ok(([(CONTENT_TYPE, XML_CONTENT_TYPE)], document.to_string()).into_response())
}

/// POST handler binding the DAO of a curl
pub async fn get_dao(
    State(state): State<AppState>,
    Curl(curl): Curl,
) -> AppResult<Json<DaoResponse>> {
    let dao = state.dal.get_dao(&curl).await?;
    Ok(Json(DaoResponse {
        curl: dao.curl().to_string(),
        handle: dao.id(),
    }))
}

/// GET handler reading one field through the bound DAO
pub async fn get_field(
    State(state): State<AppState>,
    query: Result<Query<FieldQuery>, QueryRejection>,
) -> AppResult<String> {
    let Query(FieldQuery { curl, field }) = query?;
    let dao = state.dal.get_dao(&curl).await?;
    Ok(dao.get_field(&field)?)
}

pub async fn list_nodes(State(state): State<AppState>, Curl(curl): Curl) -> AppResult<String> {
    Ok(state.dal.list_nodes(&curl).await?)
}

pub async fn list_daos(State(state): State<AppState>, Curl(curl): Curl) -> AppResult<String> {
    Ok(state.dal.list_daos(&curl).await?)
}

pub async fn clear(State(state): State<AppState>, Curl(curl): Curl) -> AppResult<StatusCode> {
    state.dal.clear_cache(&curl).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn clear_all(State(state): State<AppState>) -> AppResult<StatusCode> {
    state.dal.clear_cache_all().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST handler registering a callback URL as change listener
pub async fn add_listener(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> AppResult<Json<RegisterResponse>> {
    let Json(RegisterRequest { reference }) = body?;
    let listener = state.dal.connect_listener(&reference)?;
    let id = state.dal.add_change_listener(listener).await?;
    debug!("registered listener {id} at {reference}");
    Ok(Json(RegisterResponse { id }))
}

pub async fn subscribe(
    State(state): State<AppState>,
    id: Result<Path<ListenerId>, PathRejection>,
    Curl(curl): Curl,
) -> AppResult<StatusCode> {
    let Path(id) = id?;
    state.dal.listen_for_changes(&curl, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove_listener(
    State(state): State<AppState>,
    id: Result<Path<ListenerId>, PathRejection>,
) -> AppResult<StatusCode> {
    let Path(id) = id?;
    state.dal.remove_change_listener(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn configuration_name(State(state): State<AppState>) -> AppResult<&'static str> {
    Ok(state.dal.configuration_name().await?)
}

pub async fn shutdown(State(state): State<AppState>) -> AppResult<StatusCode> {
    state.dal.shutdown().await?;
    Ok(StatusCode::NO_CONTENT)
}
