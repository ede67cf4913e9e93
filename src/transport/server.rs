//! Node RPC Server
//!
//! Axum router exposing the node-to-node surface (protocol messages, the
//! leader kick, heartbeats, the bidirectional session stream) and the
//! coordinator-facing session API. Bodies are JSON with hex payloads and
//! capped at the 10 MiB frame limit.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket},
    extract::{DefaultBodyLimit, Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::types::{
    CreateDkgSessionRequest, CreateSigningSessionRequest, ErrorBody, HeartbeatRequest,
    HeartbeatResponse, KeygenMessageRequest, MessageAck, SessionStreamMessage, SignRequest,
    SignResponse, SigningMessageRequest, StartDkgRequest, StartDkgResponse, MAX_FRAME_BYTES,
};
use crate::common::{now_secs, MpcError};
use crate::config::{MpcConfig, NodeType};
use crate::coordinator::Coordinator;
use crate::keys::KeyService;
use crate::party::{KeygenLaunch, PartyManager, SigningLaunch};
use crate::participant::Participant;
use crate::session::SessionManager;
use crate::storage::traits::NodeStore;
use crate::types::session::{Session, SessionKind};

/// Application state shared across handlers
pub struct AppState {
    pub node_id: String,
    pub node_type: NodeType,
    pub sessions: Arc<SessionManager>,
    pub keys: Arc<KeyService>,
    pub parties: Arc<PartyManager>,
    pub participant: Arc<Participant>,
    /// Present on coordinator nodes only
    pub coordinator: Option<Arc<Coordinator>>,
    pub nodes: Arc<dyn NodeStore>,
}

type HandlerError = (StatusCode, Json<ErrorBody>);

/// Map a core error onto its wire status and `{code, recoverable}` body
fn error_response(err: &MpcError) -> HandlerError {
    let status = match err {
        MpcError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        MpcError::InsufficientNodes { .. } => StatusCode::CONFLICT,
        MpcError::KeyNotFound(_) | MpcError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        MpcError::ForeignKeyViolation(_) => StatusCode::CONFLICT,
        MpcError::QueueFull(_) => StatusCode::SERVICE_UNAVAILABLE,
        MpcError::ProtocolTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorBody::new(
            err.error_code(),
            err.to_string(),
            err.is_recoverable(),
        )),
    )
}

/// Create the router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        // node-to-node surface
        .route("/v1/node/keygen-message", post(keygen_message_handler))
        .route("/v1/node/signing-message", post(signing_message_handler))
        .route("/v1/node/start-dkg", post(start_dkg_handler))
        .route("/v1/node/heartbeat", post(heartbeat_handler))
        // session stream
        .route("/v1/sessions/join", get(join_session_handler))
        // coordinator-facing session API
        .route("/v1/sessions/dkg", post(create_dkg_session_handler))
        .route("/v1/sessions/signing", post(create_signing_session_handler))
        .route(
            "/v1/sessions/:session_id",
            get(get_session_handler).delete(cancel_session_handler),
        )
        .route("/v1/sessions/:session_id/sign", post(sign_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_FRAME_BYTES))
        .layer(TraceLayer::new_for_http())
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    node_id: String,
    node_type: &'static str,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        node_id: state.node_id.clone(),
        node_type: state.node_type.as_str(),
    })
}

fn decode_payload(payload_hex: &str) -> Result<Vec<u8>, HandlerError> {
    hex::decode(payload_hex).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new(
                "INVALID_REQUEST",
                format!("payload is not hex: {}", e),
                false,
            )),
        )
    })
}

/// Inbound DKG round message
async fn keygen_message_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<KeygenMessageRequest>,
) -> Result<Json<MessageAck>, HandlerError> {
    let payload = decode_payload(&request.payload)?;
    state
        .participant
        .handle_protocol_message(
            &request.session_id,
            &request.from_node_id,
            payload,
            request.is_broadcast,
        )
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(MessageAck {
        accepted: true,
        message: "message accepted".to_string(),
    }))
}

/// Inbound signing round message
async fn signing_message_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SigningMessageRequest>,
) -> Result<Json<MessageAck>, HandlerError> {
    let payload = decode_payload(&request.payload)?;
    state
        .participant
        .handle_protocol_message(
            &request.session_id,
            &request.from_node_id,
            payload,
            request.is_broadcast,
        )
        .await
        .map_err(|e| error_response(&e))?;

    Ok(Json(MessageAck {
        accepted: true,
        message: "message accepted".to_string(),
    }))
}

/// Leader kick: schedule DKG and return immediately
///
/// Failures are reported in the body with `started: false`; the HTTP status
/// stays 200 so the coordinator can log the outcome without retry logic.
async fn start_dkg_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartDkgRequest>,
) -> Json<StartDkgResponse> {
    info!(
        key_id = %request.key_id,
        algorithm = %request.algorithm,
        curve = %request.curve,
        threshold = request.threshold,
        total_nodes = request.total_nodes,
        node_ids = ?request.node_ids,
        this_node_id = %state.node_id,
        "StartDKG RPC received"
    );

    let protocol = match request.protocol {
        Some(protocol) => protocol,
        None => match state.sessions.get_session(&request.key_id).await {
            Ok(session) => session.protocol.protocol(),
            Err(e) => {
                return Json(StartDkgResponse {
                    started: false,
                    message: e.to_string(),
                })
            }
        },
    };

    if protocol.algorithm() != request.algorithm || protocol.curve() != request.curve {
        return Json(StartDkgResponse {
            started: false,
            message: format!(
                "protocol {} runs {}/{}, request asked for {}/{}",
                protocol,
                protocol.algorithm(),
                protocol.curve(),
                request.algorithm,
                request.curve
            ),
        });
    }

    let launch = KeygenLaunch {
        key_id: request.key_id.clone(),
        protocol,
        threshold: request.threshold,
        total_nodes: request.total_nodes,
        node_ids: request.node_ids.clone(),
    };

    match state.parties.start_keygen(launch).await {
        Ok(true) => Json(StartDkgResponse {
            started: true,
            message: "DKG scheduled".to_string(),
        }),
        Ok(false) => Json(StartDkgResponse {
            started: false,
            message: "DKG already started for this session".to_string(),
        }),
        Err(e) => Json(StartDkgResponse {
            started: false,
            message: e.to_string(),
        }),
    }
}

/// Liveness probe; refreshes the node's last-seen time when it is known
async fn heartbeat_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<HeartbeatRequest>,
) -> Json<HeartbeatResponse> {
    if let Ok(Some(mut node)) = state.nodes.get_node(&request.node_id).await {
        node.last_seen = now_secs();
        node.status = crate::types::message::NodeStatus::Active;
        if let Err(e) = state.nodes.upsert_node(&node).await {
            warn!(node_id = %request.node_id, error = %e, "Failed to refresh node record");
        }
    }

    Json(HeartbeatResponse {
        alive: true,
        coordinator_id: state.node_id.clone(),
        received_at: now_secs(),
        instructions: Default::default(),
    })
}

fn coordinator_of(state: &AppState) -> Result<Arc<Coordinator>, HandlerError> {
    state.coordinator.clone().ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody::new(
                "INVALID_REQUEST",
                format!("node {} is not a coordinator", state.node_id),
                false,
            )),
        )
    })
}

/// Coordinator-facing: create a DKG session
async fn create_dkg_session_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateDkgSessionRequest>,
) -> Result<Json<Session>, HandlerError> {
    let coordinator = coordinator_of(&state)?;
    coordinator
        .create_dkg_session(&request)
        .await
        .map(Json)
        .map_err(|e| error_response(&e))
}

/// Coordinator-facing: create a signing session
async fn create_signing_session_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSigningSessionRequest>,
) -> Result<Json<Session>, HandlerError> {
    let coordinator = coordinator_of(&state)?;
    coordinator
        .create_signing_session(&request)
        .await
        .map(Json)
        .map_err(|e| error_response(&e))
}

async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, HandlerError> {
    state
        .sessions
        .get_session(&session_id)
        .await
        .map(Json)
        .map_err(|e| error_response(&e))
}

async fn cancel_session_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Session>, HandlerError> {
    state
        .sessions
        .cancel_session(&session_id)
        .await
        .map_err(|e| error_response(&e))?;
    state
        .sessions
        .get_session(&session_id)
        .await
        .map(Json)
        .map_err(|e| error_response(&e))
}

/// Kick local signing for a session and return the canonical signature
async fn sign_handler(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(request): Json<SignRequest>,
) -> Result<Json<SignResponse>, HandlerError> {
    let session = state
        .sessions
        .get_session(&session_id)
        .await
        .map_err(|e| error_response(&e))?;

    if session.kind() != SessionKind::Signing {
        return Err(error_response(&MpcError::invalid(format!(
            "session {} is not a signing session",
            session_id
        ))));
    }

    let message_hex = request.message_hex.trim_start_matches("0x");
    let message = decode_payload(message_hex)?;
    if message.is_empty() {
        return Err(error_response(&MpcError::invalid("message payload is empty")));
    }

    let node_ids = if request.node_ids.is_empty() {
        session.participating_nodes.clone()
    } else {
        request.node_ids.clone()
    };

    // engaging in the session activates it
    state
        .sessions
        .join_session(&session_id, &state.node_id)
        .await
        .map_err(|e| error_response(&e))?;

    let launch = SigningLaunch {
        session_id: session_id.clone(),
        key_id: session.key_id.clone(),
        protocol: session.protocol.protocol(),
        message,
        node_ids,
    };
    let signature = state
        .parties
        .execute_signing(launch)
        .await
        .map_err(|e| error_response(&e))?;

    // first completer wins; the sticky status rejects the rest
    if let Err(e) = state
        .sessions
        .complete_signing(&session_id, &signature.hex)
        .await
    {
        warn!(session_id = %session_id, error = %e, "Signing completed locally but session completion was rejected");
    }

    let public_key = state
        .keys
        .get_key(&session.key_id)
        .await
        .map(|k| k.public_key)
        .unwrap_or_default();

    Ok(Json(SignResponse {
        session_id,
        r: signature.r.clone(),
        s: signature.s.clone(),
        signature: signature.hex.clone(),
        public_key,
    }))
}

/// Bidirectional session stream
async fn join_session_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| session_stream(state, socket))
}

async fn send_frame(socket: &mut WebSocket, frame: &SessionStreamMessage) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(_) => false,
    }
}

async fn session_stream(state: Arc<AppState>, mut socket: WebSocket) {
    // first client frame must be a join request
    let (session_id, node_id) = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<SessionStreamMessage>(&text) {
                    Ok(SessionStreamMessage::JoinRequest {
                        session_id,
                        node_id,
                    }) => break (session_id, node_id),
                    _ => {
                        send_frame(
                            &mut socket,
                            &SessionStreamMessage::Error {
                                code: "INVALID_REQUEST".to_string(),
                                message: "first message must be a join request".to_string(),
                                recoverable: false,
                            },
                        )
                        .await;
                        return;
                    }
                }
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            _ => return,
        }
    };

    if let Err(e) = state.sessions.join_session(&session_id, &node_id).await {
        send_frame(
            &mut socket,
            &SessionStreamMessage::Error {
                code: e.error_code().to_string(),
                message: e.to_string(),
                recoverable: e.is_recoverable(),
            },
        )
        .await;
        return;
    }

    let session = match state.sessions.get_session(&session_id).await {
        Ok(session) => session,
        Err(e) => {
            send_frame(
                &mut socket,
                &SessionStreamMessage::Error {
                    code: e.error_code().to_string(),
                    message: e.to_string(),
                    recoverable: e.is_recoverable(),
                },
            )
            .await;
            return;
        }
    };

    if !send_frame(
        &mut socket,
        &SessionStreamMessage::Confirmation {
            session_id: session.session_id.clone(),
            status: session.status,
            threshold: session.threshold,
            total_nodes: session.total_nodes,
            participants: session.participating_nodes.clone(),
            current_round: session.current_round,
            confirmed_at: now_secs(),
        },
    )
    .await
    {
        return;
    }

    info!(session_id = %session_id, node_id = %node_id, "Node joined session stream");

    while let Some(Ok(message)) = socket.recv().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => return,
            _ => continue,
        };

        match serde_json::from_str::<SessionStreamMessage>(&text) {
            Ok(SessionStreamMessage::ShareMessage {
                share_data, round, ..
            }) => {
                let payload = match hex::decode(&share_data) {
                    Ok(payload) => payload,
                    Err(e) => {
                        send_frame(
                            &mut socket,
                            &SessionStreamMessage::Error {
                                code: "INVALID_REQUEST".to_string(),
                                message: format!("share data is not hex: {}", e),
                                recoverable: false,
                            },
                        )
                        .await;
                        continue;
                    }
                };
                let is_broadcast = round == -1;
                if let Err(e) = state
                    .participant
                    .handle_protocol_message(&session_id, &node_id, payload, is_broadcast)
                    .await
                {
                    // single-message failures never end the stream
                    send_frame(
                        &mut socket,
                        &SessionStreamMessage::Error {
                            code: e.error_code().to_string(),
                            message: e.to_string(),
                            recoverable: e.is_recoverable(),
                        },
                    )
                    .await;
                }
            }
            Ok(SessionStreamMessage::HeartbeatRequest { .. }) => {
                send_frame(
                    &mut socket,
                    &SessionStreamMessage::HeartbeatAck {
                        alive: true,
                        received_at: now_secs(),
                    },
                )
                .await;
            }
            _ => {} // ignore other frames
        }
    }
}

/// Bind and serve; TLS 1.3 mutual auth when configured, plaintext otherwise
pub async fn serve(state: Arc<AppState>, cfg: &MpcConfig) -> crate::common::Result<()> {
    let router = create_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.rpc_port));

    match &cfg.tls {
        Some(tls_config) => {
            let server_config = super::tls::server_config(tls_config)?;
            info!(address = %addr, tls = true, "Starting MPC node server");
            axum_server::bind_rustls(
                addr,
                axum_server::tls_rustls::RustlsConfig::from_config(Arc::new(server_config)),
            )
            .serve(router.into_make_service())
            .await
            .map_err(|e| MpcError::internal(format!("server error: {}", e)))
        }
        None => {
            info!(address = %addr, tls = false, "Starting MPC node server");
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .map_err(|e| MpcError::internal(format!("bind {}: {}", addr, e)))?;
            axum::serve(listener, router)
                .await
                .map_err(|e| MpcError::internal(format!("server error: {}", e)))
        }
    }
}
