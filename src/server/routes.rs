//! HTTP routes
//!
//! `/api/*` is the management surface; `/iptv/*` is what players use.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Local;
use serde::Deserialize;
use tokio::io::DuplexStream;
use tokio_util::io::ReaderStream;

use super::error::ApiError;
use super::state::AppState;
use crate::catalog::{self, ChannelCatalog, ChannelGroup, PlaylistFormat};
use crate::config::Config;
use crate::epg::{self, DiypGuide, Programme};
use crate::net::{self, InterfaceMap};
use crate::relay::RelayInfo;

/// Build the router over `state`
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/channel-groups",
            get(list_channel_groups).put(replace_channel_groups),
        )
        .route("/api/relays", get(list_relays))
        .route("/api/relays/{addr}", delete(drop_relay))
        .route("/api/relays/{addr}/{client}", delete(drop_relay_client))
        .route("/api/epg", post(refresh_epg))
        .route("/api/epg/{channel}", get(channel_epg))
        .route("/api/config", get(get_config).put(replace_config))
        .route("/api/interfaces-and-ips", get(interfaces_and_ips))
        .route("/api/restart", post(restart))
        .route("/iptv/channels", get(playlist))
        .route("/iptv/epg", get(diyp_epg))
        .route("/iptv/relay/{addr}", get(relay_stream))
        .route("/iptv/channel/{name}", get(channel_stream))
        .with_state(state)
}

async fn list_channel_groups(State(state): State<AppState>) -> Json<Vec<ChannelGroup>> {
    Json(state.catalog.list().to_vec())
}

async fn replace_channel_groups(
    State(state): State<AppState>,
    payload: Result<Json<Vec<ChannelGroup>>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(groups) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    ChannelCatalog::validate(&groups)?;

    if let Some(file) = &state.file {
        file.save_channel_groups(groups.clone()).await?;
    }
    state.catalog.replace(groups)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn list_relays(State(state): State<AppState>) -> Json<Vec<RelayInfo>> {
    Json(state.relays.list())
}

async fn drop_relay(State(state): State<AppState>, Path(addr): Path<String>) -> StatusCode {
    if state.relays.drop_connection(&addr) {
        tracing::info!(source = %addr, "Relay connection dropped by operator");
    }
    StatusCode::NO_CONTENT
}

async fn drop_relay_client(
    State(state): State<AppState>,
    Path((addr, client)): Path<(String, String)>,
) -> StatusCode {
    state.relays.drop_client(&addr, &client);
    StatusCode::NO_CONTENT
}

#[derive(Debug, Deserialize)]
struct DateQuery {
    date: Option<String>,
}

fn optional_date(date: Option<&str>) -> Result<Option<chrono::NaiveDate>, ApiError> {
    match date.filter(|d| !d.is_empty()) {
        Some(d) => epg::parse_date(d)
            .map(Some)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid date: {}", d))),
        None => Ok(None),
    }
}

/// Cached listings of a catalog channel
///
/// Names outside the catalog get an empty listing without touching the
/// cache, so arbitrary names cannot grow it.
async fn listings(state: &AppState, channel: &str) -> Arc<Vec<Programme>> {
    if state.catalog.find_channel(channel).is_none() {
        tracing::debug!(channel = %channel, "EPG requested for unknown channel");
        return Arc::default();
    }
    state.epg.get(channel).await
}

async fn channel_epg(
    State(state): State<AppState>,
    Path(channel): Path<String>,
    Query(query): Query<DateQuery>,
) -> Result<Json<Vec<Programme>>, ApiError> {
    let date = optional_date(query.date.as_deref())?;
    let programmes = listings(&state, &channel).await;

    let programmes = match date {
        Some(date) => epg::programmes_on(&programmes, date, &Local),
        None => programmes.to_vec(),
    };
    Ok(Json(programmes))
}

async fn refresh_epg(State(state): State<AppState>) -> StatusCode {
    state.epg.clear();
    StatusCode::NO_CONTENT
}

async fn get_config(State(state): State<AppState>) -> Json<Config> {
    Json(state.config.get().as_ref().clone())
}

async fn replace_config(
    State(state): State<AppState>,
    payload: Result<Json<Config>, JsonRejection>,
) -> Result<Json<Config>, ApiError> {
    let Json(config) = payload.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    config.validate()?;

    if let Some(file) = &state.file {
        file.save_config(config.clone()).await?;
    }
    let current = state.config.replace(config)?;

    Ok(Json(current.as_ref().clone()))
}

async fn interfaces_and_ips() -> Json<InterfaceMap> {
    Json(net::interfaces_and_ips())
}

async fn restart(State(state): State<AppState>) -> StatusCode {
    tracing::info!("Restart requested");
    state.restart.notify_one();
    StatusCode::ACCEPTED
}

#[derive(Debug, Deserialize)]
struct PlaylistQuery {
    fmt: Option<String>,
}

async fn playlist(
    State(state): State<AppState>,
    Query(query): Query<PlaylistQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let format: PlaylistFormat = query
        .fmt
        .as_deref()
        .unwrap_or("")
        .parse()
        .map_err(ApiError::BadRequest)?;

    let server_addr = advertised_addr(&state.config.get().server_addr, &headers);
    let body = catalog::render(&state.catalog.list(), &server_addr, format);

    Ok(([(header::CONTENT_TYPE, format.content_type())], body).into_response())
}

/// Address players should use to reach this server
///
/// A wildcard listen address is useless in a playlist, so the request's
/// `Host` header is used instead.
fn advertised_addr(server_addr: &str, headers: &HeaderMap) -> String {
    let wildcard = server_addr
        .parse::<SocketAddr>()
        .map(|addr| addr.ip().is_unspecified())
        .unwrap_or(true);

    if wildcard {
        if let Some(host) = headers.get(header::HOST).and_then(|h| h.to_str().ok()) {
            return host.to_string();
        }
    }
    server_addr.to_string()
}

#[derive(Debug, Deserialize)]
struct DiypQuery {
    ch: Option<String>,
    date: Option<String>,
}

async fn diyp_epg(
    State(state): State<AppState>,
    Query(query): Query<DiypQuery>,
) -> Result<Json<DiypGuide>, ApiError> {
    let channel = query
        .ch
        .filter(|c| !c.is_empty())
        .ok_or_else(|| ApiError::BadRequest("missing channel name".into()))?;
    let date = optional_date(query.date.as_deref())?
        .ok_or_else(|| ApiError::BadRequest("missing date".into()))?;

    let programmes = listings(&state, &channel).await;
    Ok(Json(DiypGuide::build(&channel, date, &programmes, &Local)))
}

fn client_addr(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn ts_response(reader: DuplexStream) -> Response {
    (
        [(header::CONTENT_TYPE, "video/MP2T")],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response()
}

async fn relay_stream(
    State(state): State<AppState>,
    Path(addr): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let client = client_addr(&request);
    let (writer, reader) = tokio::io::duplex(state.config.get().buffer_size());

    state.relays.attach(&addr, client, writer)?;
    Ok(ts_response(reader))
}

/// Relay a channel by name, trying its sources in order
async fn channel_stream(
    State(state): State<AppState>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let channel = state
        .catalog
        .find_channel(&name)
        .ok_or_else(|| ApiError::NotFound(format!("channel not found: {}", name)))?;
    if channel.sources.is_empty() {
        return Err(ApiError::NotFound(format!("channel has no sources: {}", name)));
    }

    let client = client_addr(&request);
    let buffer_size = state.config.get().buffer_size();
    let mut last_error = String::new();

    for source in &channel.sources {
        if source.to_ascii_lowercase().starts_with("http") {
            return Ok(Redirect::temporary(source).into_response());
        }

        let (writer, reader) = tokio::io::duplex(buffer_size);
        match state.relays.attach(source, client.clone(), writer) {
            Ok(_) => return Ok(ts_response(reader)),
            Err(e) => {
                tracing::warn!(
                    channel = %name,
                    source = %source,
                    error = %e,
                    "Source unavailable, trying next"
                );
                last_error = e.to_string();
            }
        }
    }

    Err(ApiError::BadGateway(format!(
        "no usable source for {}: {}",
        name, last_error
    )))
}
