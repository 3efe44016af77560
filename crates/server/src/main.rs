use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::de::DeserializeOwned;
use sequence::StudyCatalog;
use server_api::{ApiContext, SessionUpdate};
use shared::{
    domain::{ParticipantId, StudyId},
    error::{ApiError, ErrorCode},
    protocol::{
        NextParticipantRequest, NextParticipantResponse, SessionView, StartSessionRequest,
        StudyEvent, StudyHeader, StudyStats, StudySummary,
    },
};
use storage::Storage;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod settings;

use settings::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    events: broadcast::Sender<StudyEvent>,
}

type HttpError = (StatusCode, Json<ApiError>);

const MAX_REQUEST_BYTES: usize = 16 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings()?;
    let filter = EnvFilter::try_new(&settings.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let catalog = StudyCatalog::load_dir(&settings.studies_dir).map_err(|error| {
        error!(
            studies_dir = %settings.studies_dir.display(),
            error = %format!("{error:#}"),
            "failed to load study specifications"
        );
        error
    })?;
    if catalog.is_empty() {
        warn!(studies_dir = %settings.studies_dir.display(), "no studies loaded");
    }

    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let (events, _) = broadcast::channel(settings.event_buffer.max(1));
    let state = AppState {
        api: ApiContext::new(storage, catalog),
        events,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/studies", get(http_list_studies))
        .route("/studies/:study_id", get(http_study_header))
        .route("/studies/:study_id/stats", get(http_study_stats))
        .route("/studies/:study_id/participants", post(http_start_session))
        .route(
            "/studies/:study_id/participants/:participant_id",
            get(http_session_view),
        )
        .route(
            "/studies/:study_id/participants/:participant_id/advance",
            post(http_advance),
        )
        .route(
            "/studies/:study_id/participants/:participant_id/retreat",
            post(http_retreat),
        )
        .route(
            "/studies/:study_id/participants/:participant_id/complete",
            post(http_complete),
        )
        .route(
            "/studies/:study_id/next_participant",
            post(http_next_participant),
        )
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::SpecInvalid | ErrorCode::AssignmentUnavailable | ErrorCode::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn http_error(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

/// Empty bodies mean "all defaults".
fn optional_json<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, HttpError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        http_error(ApiError::new(
            ErrorCode::Validation,
            format!("invalid request body: {e}"),
        ))
    })
}

fn publish(state: &AppState, event: Option<StudyEvent>) {
    if let Some(event) = event {
        // No subscribers is not an error.
        let _ = state.events.send(event);
    }
}

fn respond(state: &AppState, (view, event): SessionUpdate) -> Json<SessionView> {
    publish(state, event);
    Json(view)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|error| {
        warn!(%error, "health check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::Internal, "storage unavailable")),
        )
    })?;
    Ok("ok")
}

async fn http_list_studies(State(state): State<Arc<AppState>>) -> Json<Vec<StudySummary>> {
    Json(server_api::list_studies(&state.api))
}

async fn http_study_header(
    State(state): State<Arc<AppState>>,
    Path(study_id): Path<String>,
) -> Result<Json<StudyHeader>, HttpError> {
    let header = server_api::study_header(&state.api, &StudyId::new(study_id)).map_err(http_error)?;
    Ok(Json(header))
}

async fn http_study_stats(
    State(state): State<Arc<AppState>>,
    Path(study_id): Path<String>,
) -> Result<Json<StudyStats>, HttpError> {
    let stats = server_api::study_stats(&state.api, &StudyId::new(study_id))
        .await
        .map_err(http_error)?;
    Ok(Json(stats))
}

async fn http_start_session(
    State(state): State<Arc<AppState>>,
    Path(study_id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<SessionView>), HttpError> {
    let request: StartSessionRequest = optional_json(&body)?;
    let (view, event) =
        server_api::start_session(&state.api, &StudyId::new(study_id), request.participant_id)
            .await
            .map_err(http_error)?;
    let status = if event.is_some() {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, respond(&state, (view, event))))
}

async fn http_session_view(
    State(state): State<Arc<AppState>>,
    Path((study_id, participant_id)): Path<(String, String)>,
) -> Result<Json<SessionView>, HttpError> {
    let view = server_api::session_view(
        &state.api,
        &StudyId::new(study_id),
        &ParticipantId::new(participant_id),
    )
    .await
    .map_err(http_error)?;
    Ok(Json(view))
}

async fn http_advance(
    State(state): State<Arc<AppState>>,
    Path((study_id, participant_id)): Path<(String, String)>,
) -> Result<Json<SessionView>, HttpError> {
    let update = server_api::advance(
        &state.api,
        &StudyId::new(study_id),
        &ParticipantId::new(participant_id),
    )
    .await
    .map_err(http_error)?;
    Ok(respond(&state, update))
}

async fn http_retreat(
    State(state): State<Arc<AppState>>,
    Path((study_id, participant_id)): Path<(String, String)>,
) -> Result<Json<SessionView>, HttpError> {
    let update = server_api::retreat(
        &state.api,
        &StudyId::new(study_id),
        &ParticipantId::new(participant_id),
    )
    .await
    .map_err(http_error)?;
    Ok(respond(&state, update))
}

async fn http_complete(
    State(state): State<Arc<AppState>>,
    Path((study_id, participant_id)): Path<(String, String)>,
) -> Result<Json<SessionView>, HttpError> {
    let update = server_api::complete(
        &state.api,
        &StudyId::new(study_id),
        &ParticipantId::new(participant_id),
    )
    .await
    .map_err(http_error)?;
    Ok(respond(&state, update))
}

async fn http_next_participant(
    State(state): State<Arc<AppState>>,
    Path(study_id): Path<String>,
    body: Bytes,
) -> Result<Json<NextParticipantResponse>, HttpError> {
    let request: NextParticipantRequest = optional_json(&body)?;
    let (next, event) = server_api::next_participant(
        &state.api,
        &StudyId::new(study_id),
        request.current_participant_id.as_ref(),
    )
    .await
    .map_err(http_error)?;
    publish(&state, event);
    Ok(Json(next))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: axum::extract::ws::WebSocket) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        loop {
            let event = match events_rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged; dropping events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
