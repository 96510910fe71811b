//! Reference backend HTTP server (single port).

use crate::backend::state::{self, BackendState, Failure};
use crate::config::{resolve_token_delay, Config};
use anyhow::{Context, Result};
use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;

type JsonResult = Result<Json<Value>, Failure>;

#[derive(Deserialize)]
struct RegisterBody {
    email: String,
    password: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct LoginBody {
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct GoogleBody {
    #[allow(dead_code)]
    token: String,
}

#[derive(Deserialize)]
struct PatientBody {
    name: String,
    #[serde(default)]
    mrn: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Deserialize)]
struct ChatQuery {
    #[serde(default)]
    patient_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Deserialize)]
struct MessagesQuery {
    chat_id: String,
}

#[derive(Deserialize)]
struct GenerateBody {
    chat_id: String,
    prompt: String,
    #[serde(default)]
    image_url: Option<String>,
}

/// Doctor id from `Authorization: Bearer <token>`, or 401.
async fn doctor_id(state: &BackendState, headers: &HeaderMap) -> Result<String, Failure> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or((StatusCode::UNAUTHORIZED, "Missing bearer token".to_string()))?;
    state.authenticate(token).await
}

/// All routes over the given state. Exposed so tests can serve it on their own listener.
pub fn router(state: BackendState) -> Router {
    Router::new()
        .route("/health", get(health_http))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/google", post(google_auth))
        .route("/auth/refresh", post(refresh))
        .route("/auth/me", get(me))
        .route("/patients", get(list_patients).post(create_patient))
        .route("/patients/:id", get(patient_profile).delete(delete_patient))
        .route("/chats", get(list_chats).post(create_chat))
        .route("/chats/general", get(list_general_chats).post(create_general_chat))
        .route("/chats/:id/messages", get(chat_messages))
        .route("/messages", get(list_messages))
        .route("/upload", post(upload))
        .route("/storage/:name", get(storage))
        .route("/stream", post(stream_reply))
        .with_state(state)
}

/// Bind and serve until Ctrl+C / SIGTERM.
pub async fn run_backend(config: Config) -> Result<()> {
    let bind_addr = format!("{}:{}", config.backend.bind.trim(), config.backend.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    let state = BackendState::new().with_token_delay(resolve_token_delay(&config));
    log::info!("reference backend listening on {}", bind_addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("reference backend exited")?;
    log::info!("reference backend stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

/// GET /health.
async fn health_http() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn register(State(state): State<BackendState>, Json(body): Json<RegisterBody>) -> JsonResult {
    state
        .register(&body.email, &body.password, body.name.as_deref())
        .await
        .map(Json)
}

async fn login(State(state): State<BackendState>, Json(body): Json<LoginBody>) -> JsonResult {
    state.login(&body.email, &body.password).await.map(Json)
}

/// POST /auth/google: token verification needs Google credentials, which this backend does not have.
async fn google_auth(Json(_body): Json<GoogleBody>) -> JsonResult {
    Err((
        StatusCode::UNAUTHORIZED,
        "Invalid Google token: verification not configured".to_string(),
    ))
}

async fn refresh(State(state): State<BackendState>, headers: HeaderMap) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    state.refresh(&id).await.map(Json)
}

async fn me(State(state): State<BackendState>, headers: HeaderMap) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    state.me(&id).await.map(Json)
}

async fn list_patients(State(state): State<BackendState>, headers: HeaderMap) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    Ok(Json(state.list_patients(&id).await))
}

async fn create_patient(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Json(body): Json<PatientBody>,
) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    state
        .create_patient(&id, &body.name, body.mrn, body.notes)
        .await
        .map(Json)
}

async fn patient_profile(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Path(patient_id): Path<String>,
) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    state.patient_profile(&id, &patient_id).await.map(Json)
}

async fn delete_patient(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Path(patient_id): Path<String>,
) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    state.delete_patient(&id, &patient_id).await.map(Json)
}

async fn list_chats(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Query(q): Query<ChatQuery>,
) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    Ok(Json(state.list_chats(&id, q.patient_id.as_deref(), false).await))
}

async fn create_chat(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Query(q): Query<ChatQuery>,
) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    let title = q.title.as_deref().unwrap_or("Consult");
    state
        .create_chat(&id, q.patient_id.as_deref(), title)
        .await
        .map(Json)
}

async fn list_general_chats(State(state): State<BackendState>, headers: HeaderMap) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    Ok(Json(state.list_chats(&id, None, true).await))
}

async fn create_general_chat(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Query(q): Query<ChatQuery>,
) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    let title = q.title.as_deref().unwrap_or("General Chat");
    state.create_chat(&id, None, title).await.map(Json)
}

async fn chat_messages(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Path(chat_id): Path<String>,
) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    state.list_messages(&id, &chat_id).await.map(Json)
}

async fn list_messages(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Query(q): Query<MessagesQuery>,
) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    state.list_messages(&id, &q.chat_id).await.map(Json)
}

/// POST /upload: multipart with a `file` field.
async fn upload(
    State(state): State<BackendState>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> JsonResult {
    let id = doctor_id(&state, &headers).await?;
    let bad_request = |e: axum::extract::multipart::MultipartError| (StatusCode::BAD_REQUEST, e.to_string());
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or("upload").to_string();
        let bytes = field.bytes().await.map_err(bad_request)?;
        let size = bytes.len();
        let mime = state::guess_mime(&file_name);
        let stored = state.store_file(&id, &file_name, bytes.to_vec()).await;
        return Ok(Json(json!({
            "url": format!("/storage/{}", stored),
            "filename": file_name,
            "size": size,
            "mime_type": mime,
            "is_audio": mime.starts_with("audio/"),
            "is_image": mime.starts_with("image/"),
        })));
    }
    Err((StatusCode::BAD_REQUEST, "Missing file field".to_string()))
}

/// GET /storage/{name}: serve an uploaded file.
async fn storage(State(state): State<BackendState>, Path(name): Path<String>) -> Response {
    match state.file(&name).await {
        Some(f) => ([(header::CONTENT_TYPE, f.mime_type)], f.bytes).into_response(),
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

/// POST /stream: reply streamed as `data: <token>\n\n` frames, then an end event.
async fn stream_reply(
    State(state): State<BackendState>,
    headers: HeaderMap,
    Json(body): Json<GenerateBody>,
) -> Result<Response, Failure> {
    let id = doctor_id(&state, &headers).await?;
    let reply = state
        .begin_reply(&id, &body.chat_id, &body.prompt, body.image_url)
        .await?;
    let delay = state.token_delay();
    let tokens = state::tokenize(&reply);
    let frames = stream::iter(tokens).then(move |token| async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok::<_, Infallible>(Bytes::from(format!("data: {}\n\n", token)))
    });
    let chat_id = body.chat_id;
    let end = stream::once(async move {
        state.finish_reply(&chat_id, &reply).await;
        Ok::<_, Infallible>(Bytes::from_static(b"event: end\ndata: [DONE]\n\n"))
    });
    let body = Body::from_stream(frames.chain(end));
    Ok(([(header::CONTENT_TYPE, "text/event-stream")], body).into_response())
}
