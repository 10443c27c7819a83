//! HTTP request handlers
//!
//! Pure orchestration: validate the request record, resolve a session from
//! the pool, take its mutex for the duration of engine work, dispatch,
//! attach the debug bundle when asked, release, reply. Every engine
//! response carries `session_id` and `is_new_session`.

use super::types::{
    AppointmentRequest, BulkInfoRequest, ContainerDetailRequest, GetAppointmentsRequest,
    GetContainersRequest, GetSessionRequest, SessionRef, SessionSelector,
};
use super::AppState;
use crate::appointment::{ContainerType, SubSession};
use crate::detail::DETECTION_METHOD;
use crate::error::{ErrorKind, GatewayError};
use crate::janitor;
use crate::listing::{ensure_on_page, ScrollMode, StopReason};
use crate::pool::Acquired;
use crate::portal::urls;
use crate::session::Credentials;

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/version", get(version))
        .route("/get_session", post(get_session))
        .route("/get_containers", post(get_containers))
        .route("/get_container_timeline", post(get_container_timeline))
        .route("/get_booking_number", post(get_booking_number))
        .route("/get_appointments", post(get_appointments))
        .route("/get_info_bulk", post(get_info_bulk))
        .route("/check_appointments", post(check_appointments))
        .route("/make_appointment", post(make_appointment))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", delete(close_session))
        .route("/cleanup", post(cleanup))
        .route("/files/:name", get(serve_file))
        .fallback(unknown_endpoint)
        .with_state(state)
}

// ============================================================
// Session resolution
// ============================================================

async fn resolve_session(
    state: &AppState,
    selector: &SessionSelector,
) -> Result<Acquired, GatewayError> {
    match selector.resolve(state.config.captcha_default_key.as_deref())? {
        SessionRef::ById(id) => state.pool.acquire_by_id(&id).await,
        SessionRef::ByCredentials(credentials) => state.pool.acquire(&credentials).await,
    }
}

/// Stamp the fields every engine response carries, plus the debug bundle
/// when the request asked for one.
fn finalize(
    state: &AppState,
    mut body: Value,
    session_id: &str,
    is_new: bool,
    debug: bool,
    tag: &str,
) -> Json<Value> {
    if let Some(obj) = body.as_object_mut() {
        obj.insert("session_id".into(), json!(session_id));
        obj.insert("is_new_session".into(), json!(is_new));
        if debug {
            match state.store.bundle_debug(session_id, tag) {
                Ok(name) => {
                    obj.insert(
                        "debug_bundle_url".into(),
                        json!(state.config.file_url(&name)),
                    );
                }
                Err(e) => {
                    tracing::warn!(session_id, error = %e, "debug bundle failed");
                }
            }
        }
    }
    Json(body)
}

fn stop_reason_str(reason: StopReason) -> &'static str {
    match reason {
        StopReason::Exhausted => "exhausted",
        StopReason::CountReached => "count_reached",
        StopReason::TargetFound => "target_found",
    }
}

/// Exported files are served by bare filename; prefix them with the
/// session id so names cannot collide across sessions.
fn served_name(session: &crate::session::BrowserSession, file: &str) -> String {
    if file.starts_with(&session.session_id) {
        return file.to_string();
    }
    let renamed = format!("{}_{}", session.session_id, file);
    let dir = &session.download_dir;
    match std::fs::rename(dir.join(file), dir.join(&renamed)) {
        Ok(()) => renamed,
        Err(e) => {
            tracing::warn!(file, error = %e, "could not rename export for serving");
            file.to_string()
        }
    }
}

// ============================================================
// Health, version, session management
// ============================================================

async fn health(State(state): State<AppState>) -> Json<Value> {
    let active = state.pool.active_count().await;
    let max = state.pool.max_sessions();
    let persistent = state.pool.persistent_count().await;
    Json(json!({
        "status": "ok",
        "active_sessions": active,
        "max_sessions": max,
        "session_capacity": format!("{active}/{max}"),
        "persistent_sessions": persistent,
        "timestamp": Utc::now(),
    }))
}

async fn version() -> &'static str {
    concat!("portside ", env!("CARGO_PKG_VERSION"))
}

async fn get_session(
    State(state): State<AppState>,
    Json(req): Json<GetSessionRequest>,
) -> Result<Json<Value>, GatewayError> {
    let captcha_key = req
        .captcha_api_key
        .filter(|k| !k.is_empty())
        .or_else(|| state.config.captcha_default_key.clone())
        .ok_or_else(|| GatewayError::missing_field("captcha_api_key"))?;
    let credentials = Credentials {
        username: req.username,
        password: req.password,
        captcha_key,
    };

    let acquired = state.pool.acquire(&credentials).await?;
    let session_id = acquired.session_id.clone();
    let is_new = acquired.is_new;
    drop(acquired);
    state.pool.release(&session_id).await;

    let created_at = state
        .pool
        .snapshot()
        .await
        .into_iter()
        .find(|s| s.session_id == session_id)
        .map(|s| s.created_at);

    Ok(Json(json!({
        "success": true,
        "session_id": session_id,
        "is_new": is_new,
        "username": credentials.username,
        "created_at": created_at,
    })))
}

async fn list_sessions(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.pool.snapshot().await;
    Json(json!({
        "success": true,
        "count": sessions.len(),
        "sessions": sessions,
    }))
}

async fn close_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    if !state.pool.close_session(&session_id).await {
        return Err(GatewayError::new(
            ErrorKind::SessionNotFound,
            format!("no session {session_id}"),
        ));
    }
    state.sub_sessions.discard_for_browser_session(&session_id);
    Ok(Json(json!({ "success": true, "closed": session_id })))
}

async fn cleanup(State(state): State<AppState>) -> Json<Value> {
    let removed = janitor::sweep(state.store.root(), state.config.file_ttl);
    Json(json!({ "success": true, "removed_files": removed }))
}

async fn unknown_endpoint() -> GatewayError {
    GatewayError::new(ErrorKind::UnknownEndpoint, "no such endpoint")
}

// ============================================================
// Listing endpoints
// ============================================================

async fn get_containers(
    State(state): State<AppState>,
    Json(req): Json<GetContainersRequest>,
) -> Result<Json<Value>, GatewayError> {
    let mode = req.scroll.mode()?;
    let acquired = resolve_session(&state, &req.session).await?;
    let session_id = acquired.session_id.clone();
    let is_new = acquired.is_new;

    let result = containers_inner(&state, &acquired, &mode).await;
    drop(acquired);
    state.pool.release(&session_id).await;

    match result {
        Ok(body) => Ok(finalize(&state, body, &session_id, is_new, req.debug, "containers")),
        Err(e) => Err(e.with_session(session_id)),
    }
}

async fn containers_inner(
    state: &AppState,
    acquired: &Acquired,
    mode: &ScrollMode,
) -> Result<Value, GatewayError> {
    let session = &acquired.guard;
    let driver = session.driver.as_ref();

    ensure_on_page(driver, &state.config.portal_url, urls::CONTAINERS_PATH).await?;
    let outcome = state.listing.run(driver, mode).await?;

    let mut body = json!({
        "success": true,
        "containers_count": outcome.count,
        "scroll_cycles": outcome.scroll_cycles,
        "stopped_reason": stop_reason_str(outcome.stop_reason),
    });
    if let Some(obj) = body.as_object_mut() {
        if outcome.fast_path {
            obj.insert("fast_path".into(), json!(true));
        }
        if let Some(target) = &outcome.found_target {
            obj.insert("found_target".into(), json!(target));
        }
        // The export selects every row and waits out a spreadsheet
        // download; a target lookup already has its answer and skips it.
        if !matches!(mode, ScrollMode::Target(_)) {
            let (file, _selected) =
                state.listing.export(driver, &session.download_dir).await?;
            let name = served_name(session, &file);
            obj.insert("file_url".into(), json!(state.config.file_url(&name)));
        }
    }
    Ok(body)
}

async fn get_appointments(
    State(state): State<AppState>,
    Json(req): Json<GetAppointmentsRequest>,
) -> Result<Json<Value>, GatewayError> {
    let mode = req.scroll.mode()?;
    let acquired = resolve_session(&state, &req.session).await?;
    let session_id = acquired.session_id.clone();
    let is_new = acquired.is_new;

    let result = appointments_inner(&state, &acquired, &mode).await;
    drop(acquired);
    state.pool.release(&session_id).await;

    match result {
        Ok(body) => Ok(finalize(&state, body, &session_id, is_new, req.debug, "appointments")),
        Err(e) => Err(e.with_session(session_id)),
    }
}

async fn appointments_inner(
    state: &AppState,
    acquired: &Acquired,
    mode: &ScrollMode,
) -> Result<Value, GatewayError> {
    let session = &acquired.guard;
    let driver = session.driver.as_ref();

    ensure_on_page(driver, &state.config.portal_url, urls::APPOINTMENTS_PATH).await?;
    let outcome = state.listing.run(driver, mode).await?;

    let mut body = json!({
        "success": true,
        "scroll_cycles": outcome.scroll_cycles,
        "stopped_reason": stop_reason_str(outcome.stop_reason),
    });
    if let Some(obj) = body.as_object_mut() {
        if outcome.fast_path {
            obj.insert("fast_path".into(), json!(true));
        }
        if let Some(target) = &outcome.found_target {
            obj.insert("found_target".into(), json!(target));
        }
        // Same rule as the container listing: a target lookup never pays
        // for the export.
        if !matches!(mode, ScrollMode::Target(_)) {
            let (file, selected) =
                state.listing.export(driver, &session.download_dir).await?;
            let name = served_name(session, &file);
            obj.insert("file_url".into(), json!(state.config.file_url(&name)));
            obj.insert("selected_count".into(), json!(selected));
        }
    }
    Ok(body)
}

// ============================================================
// Container detail endpoints
// ============================================================

async fn get_container_timeline(
    State(state): State<AppState>,
    Json(req): Json<ContainerDetailRequest>,
) -> Result<Json<Value>, GatewayError> {
    let acquired = resolve_session(&state, &req.session).await?;
    let session_id = acquired.session_id.clone();
    let is_new = acquired.is_new;

    let result = async {
        let session = &acquired.guard;
        let driver = session.driver.as_ref();
        ensure_on_page(driver, &state.config.portal_url, urls::CONTAINERS_PATH).await?;
        state.detail.search_and_expand(driver, &req.container_id).await?;
        let (passed, timeline) = state.detail.check_pregate(driver).await?;
        Ok::<Value, GatewayError>(json!({
            "success": true,
            "container_id": req.container_id,
            "passed_pregate": passed,
            "timeline": timeline,
            "detection_method": DETECTION_METHOD,
        }))
    }
    .await;
    drop(acquired);
    state.pool.release(&session_id).await;

    match result {
        Ok(body) => Ok(finalize(&state, body, &session_id, is_new, req.debug, "timeline")),
        Err(e) => Err(e.with_session(session_id)),
    }
}

async fn get_booking_number(
    State(state): State<AppState>,
    Json(req): Json<ContainerDetailRequest>,
) -> Result<Json<Value>, GatewayError> {
    let acquired = resolve_session(&state, &req.session).await?;
    let session_id = acquired.session_id.clone();
    let is_new = acquired.is_new;

    let result = async {
        let session = &acquired.guard;
        let driver = session.driver.as_ref();
        ensure_on_page(driver, &state.config.portal_url, urls::CONTAINERS_PATH).await?;
        state.detail.search_and_expand(driver, &req.container_id).await?;
        let booking = state.detail.booking_number(driver).await?;
        Ok::<Value, GatewayError>(json!({
            "success": true,
            "container_id": req.container_id,
            "booking_number": booking,
        }))
    }
    .await;
    drop(acquired);
    state.pool.release(&session_id).await;

    match result {
        Ok(body) => Ok(finalize(&state, body, &session_id, is_new, req.debug, "booking")),
        Err(e) => Err(e.with_session(session_id)),
    }
}

async fn get_info_bulk(
    State(state): State<AppState>,
    Json(req): Json<BulkInfoRequest>,
) -> Result<Json<Value>, GatewayError> {
    let acquired = resolve_session(&state, &req.session).await?;
    let session_id = acquired.session_id.clone();
    let is_new = acquired.is_new;

    let result = async {
        let session = &acquired.guard;
        let driver = session.driver.as_ref();
        ensure_on_page(driver, &state.config.portal_url, urls::CONTAINERS_PATH).await?;
        let outcome = state
            .detail
            .bulk(driver, &req.import_containers, &req.export_containers)
            .await;
        Ok::<Value, GatewayError>(json!({ "success": true, "results": outcome }))
    }
    .await;
    drop(acquired);
    state.pool.release(&session_id).await;

    match result {
        Ok(body) => Ok(finalize(&state, body, &session_id, is_new, req.debug, "bulk")),
        Err(e) => Err(e.with_session(session_id)),
    }
}

// ============================================================
// Appointment endpoints
// ============================================================

async fn check_appointments(
    State(state): State<AppState>,
    Json(req): Json<AppointmentRequest>,
) -> Result<Json<Value>, GatewayError> {
    appointment_flow(state, req, false).await
}

/// Submits remote state. Never retried automatically past the Submit
/// click; the sub-session is consumed either way.
async fn make_appointment(
    State(state): State<AppState>,
    Json(req): Json<AppointmentRequest>,
) -> Result<Json<Value>, GatewayError> {
    appointment_flow(state, req, true).await
}

async fn appointment_flow(
    state: AppState,
    req: AppointmentRequest,
    submit: bool,
) -> Result<Json<Value>, GatewayError> {
    let resumed = req
        .appointment_session_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .map(str::to_owned);

    let (acquired, mut sub) = match resumed {
        Some(appt_id) => {
            let mut sub = state.sub_sessions.resume(&appt_id).ok_or_else(|| {
                GatewayError::new(
                    ErrorKind::SessionExpired,
                    "unknown or expired appointment session",
                )
            })?;
            if sub.container_type != req.container_type {
                return Err(GatewayError::new(
                    ErrorKind::InvalidType,
                    "container_type does not match the appointment session",
                )
                .with_appointment(appt_id, sub.phase.as_u8()));
            }
            let acquired = match state.pool.acquire_by_id(&sub.browser_session_id).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    // The browser this workflow rode on is gone.
                    state.sub_sessions.remove(&appt_id);
                    return Err(e);
                }
            };
            sub.data.merge(req.fields);
            sub.data.normalize(sub.container_type);
            (acquired, sub)
        }
        None => {
            let acquired = resolve_session(&state, &req.session).await?;
            let mut data = req.fields;
            data.normalize(req.container_type);
            let sub =
                state
                    .sub_sessions
                    .create(&acquired.session_id, req.container_type, data);
            (acquired, sub)
        }
    };

    let session_id = acquired.session_id.clone();
    let is_new = acquired.is_new;
    let result = state
        .wizard
        .run(&acquired.guard, &state.store, &mut sub, submit)
        .await;
    drop(acquired);
    state.pool.release(&session_id).await;

    match result {
        Ok(outcome) => {
            if outcome.submitted {
                state.sub_sessions.remove(&sub.appt_id);
            } else {
                state.sub_sessions.put(sub.clone());
            }
            let body = appointment_body(&state, &sub, &outcome, submit);
            let tag = if submit { "make-appointment" } else { "check-appointments" };
            Ok(finalize(&state, body, &session_id, is_new, req.debug, tag))
        }
        Err(e) => {
            // A submit failure or a lost wizard is not resumable; anything
            // else keeps its sub-session alive for the TTL.
            if matches!(e.kind, ErrorKind::SessionExpired | ErrorKind::SubmitFailed) {
                state.sub_sessions.remove(&sub.appt_id);
            } else {
                state.sub_sessions.put(sub.clone());
            }
            Err(e
                .with_appointment(sub.appt_id.clone(), sub.phase.as_u8())
                .with_session(session_id))
        }
    }
}

fn appointment_body(
    state: &AppState,
    sub: &SubSession,
    outcome: &crate::appointment::AppointmentOutcome,
    submit: bool,
) -> Value {
    let mut body = if submit {
        json!({
            "success": true,
            "appointment_confirmed": outcome.submitted,
            "appointment_details": {
                "container_type": sub.container_type,
                "appointment_time": sub.data.appointment_time,
                "container_id": sub.data.container_id,
                "booking_number": sub.data.booking_number,
                "terminal": sub.data.terminal,
                "move_type": sub.data.move_type,
            },
        })
    } else {
        match sub.container_type {
            ContainerType::Import => {
                let times = outcome.available_times.clone().unwrap_or_default();
                json!({
                    "success": true,
                    "available_times": times,
                    "count": times.len(),
                    "phase_data": sub.data,
                    "current_phase": sub.phase.as_u8(),
                })
            }
            ContainerType::Export => json!({
                "success": true,
                "calendar_found": outcome.calendar_found.unwrap_or(false),
                "phase_data": sub.data,
                "current_phase": sub.phase.as_u8(),
            }),
        }
    };

    if let Some(obj) = body.as_object_mut() {
        obj.insert("appointment_session_id".into(), json!(sub.appt_id));
        if let Some(shot) = &outcome.dropdown_screenshot {
            obj.insert(
                "dropdown_screenshot_url".into(),
                json!(state.config.file_url(shot)),
            );
        }
        if let Some(shot) = &outcome.calendar_screenshot {
            obj.insert(
                "calendar_screenshot_url".into(),
                json!(state.config.file_url(shot)),
            );
        }
    }
    body
}

// ============================================================
// Artifact serving
// ============================================================

async fn serve_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, GatewayError> {
    let path = state.store.resolve(&name).ok_or_else(|| {
        GatewayError::new(ErrorKind::FileNotFound, format!("no artifact named {name}"))
    })?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|e| GatewayError::internal(format!("open artifact: {e}")))?;
    let stream = tokio_util::io::ReaderStream::new(file);
    let mime = mime_guess::from_path(&path).first_or_octet_stream();

    Response::builder()
        .header(CONTENT_TYPE, mime.as_ref())
        .body(axum::body::Body::from_stream(stream))
        .map_err(|e| GatewayError::internal(e.to_string()))
}
