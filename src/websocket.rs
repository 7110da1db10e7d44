//! # WebSocket Assessment Endpoint
//!
//! Clients connect to `/ws/assessment`, send one JSON configuration frame, stream binary
//! PCM audio and finish with `{"type":"end"}`. The protocol itself is handled by
//! [`AssessmentSession`]; this module only adapts actix's actor model to it.
//!
//! ## One connection:
//! ```text
//!              ┌──────────── AssessmentSocket (actor) ────────────┐
//!  client ──>  │ StreamHandler<ws::Message> ──try_send──> inbound │ ──> ReaderWorker
//!  client <──  │ StreamHandler<OutboundCommand> <──── outbound    │ <── Responder
//!              └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle:
//! 1. **Upgrade**: origin check, session id, session slot reserved (or not)
//! 2. **started()**: heartbeat timer, outbound stream attached, session task spawned
//! 3. **Messages**: text/binary frames go to the bounded inbound queue; ping/pong are
//!    answered here and never reach the session
//! 4. **stopped()**: the inbound queue is closed, which the session sees as a disconnect
//!
//! When the session is done it drops its outbound sender, which finishes the outbound
//! stream and stops the actor.

use crate::assessment::{
    AssessmentSession, ChannelReceiver, ChannelSender, InboundItem, OutboundCommand, Responder,
    StatusFrame, TransportError, TransportMessage,
};
use crate::config::SessionConfig;
use crate::error::{AppError, SessionError};
use crate::recognition::RecognitionEngine;
use crate::state::{AppState, SessionPermit};

use actix::prelude::*;
use actix_web::{http::header, web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

/// Status frames waiting for the actor to write them.
const OUTBOUND_BUFFER: usize = 64;

/// Everything the actor needs to launch its session once it is running.
struct SessionLaunch {
    engine: Arc<dyn RecognitionEngine>,
    state: web::Data<AppState>,
    permit: Option<SessionPermit>,
    inbound_rx: mpsc::Receiver<InboundItem>,
}

/// Actor owning one client WebSocket.
pub struct AssessmentSocket {
    session_id: String,
    limits: SessionConfig,
    last_heartbeat: Instant,
    /// Closed (set to `None`) when the actor stops or the queue overflows
    inbound: Option<mpsc::Sender<InboundItem>>,
    launch: Option<SessionLaunch>,
}

impl AssessmentSocket {
    fn new(
        session_id: String,
        engine: Arc<dyn RecognitionEngine>,
        state: web::Data<AppState>,
        permit: Option<SessionPermit>,
    ) -> Self {
        let limits = state.config().session.clone();
        let (inbound_tx, inbound_rx) = mpsc::channel(limits.inbound_queue_frames);
        Self {
            session_id,
            limits,
            last_heartbeat: Instant::now(),
            inbound: Some(inbound_tx),
            launch: Some(SessionLaunch {
                engine,
                state,
                permit,
                inbound_rx,
            }),
        }
    }

    fn start_heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let client_timeout = self.limits.client_timeout();
        ctx.run_interval(self.limits.heartbeat_interval(), move |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > client_timeout {
                warn!(
                    "Session {}: no client activity for {:?}, closing connection",
                    act.session_id, client_timeout
                );
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn launch_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(launch) = self.launch.take() else {
            return;
        };

        let Some(permit) = launch.permit else {
            let err = SessionError::Capacity(format!(
                "{} sessions already active",
                launch.state.config().performance.max_concurrent_sessions
            ));
            warn!("Session {}: {}", self.session_id, err);
            if let Ok(json) = serde_json::to_string(&StatusFrame::error(err.client_message())) {
                ctx.text(json);
            }
            ctx.close(Some(ws::CloseReason {
                code: ws::CloseCode::Again,
                description: Some("server busy".to_string()),
            }));
            ctx.stop();
            return;
        };

        let (outbound_tx, outbound_rx) = mpsc::channel::<OutboundCommand>(OUTBOUND_BUFFER);
        ctx.add_stream(ReceiverStream::new(outbound_rx));

        let responder = Arc::new(Responder::new(
            self.session_id.clone(),
            Box::new(ChannelSender::new(outbound_tx)),
            self.limits.write_timeout(),
        ));
        let session = AssessmentSession::new(
            self.session_id.clone(),
            launch.engine,
            responder,
            self.limits.clone(),
        );
        let receiver = Box::new(ChannelReceiver::new(launch.inbound_rx));
        let state = launch.state;

        actix::spawn(async move {
            let report = session.run_guarded(receiver).await;
            info!(
                session_id = %report.session_id,
                outcome = ?report.outcome,
                success = report.outcome.is_success(),
                state = ?report.final_state,
                eval_mode = ?report.eval_mode,
                frames_in = report.frames_received,
                bytes_in = report.bytes_received,
                frames_out = report.frames_sent,
                recording = ?report.recording,
                "Assessment session closed"
            );
            state.record_session_outcome(report.outcome);
            drop(permit);
        });
    }

    /// Hand a client frame to the session without ever blocking the actor.
    fn forward(&mut self, item: InboundItem, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(inbound) = self.inbound.as_ref() else {
            return;
        };

        match inbound.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                error!(
                    "Session {}: inbound queue full ({} frames), dropping connection",
                    self.session_id, self.limits.inbound_queue_frames
                );
                self.inbound = None;
                ctx.stop();
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Session {}: session no longer reading, frame dropped", self.session_id);
                self.inbound = None;
            }
        }
    }
}

impl Actor for AssessmentSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Session {}: WebSocket connection started", self.session_id);
        self.start_heartbeat(ctx);
        self.launch_session(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.inbound = None;
        info!("Session {}: WebSocket connection stopped", self.session_id);
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AssessmentSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_heartbeat = Instant::now();

        match msg {
            Ok(ws::Message::Text(text)) => {
                self.forward(Ok(TransportMessage::Text(text.to_string())), ctx);
            }
            Ok(ws::Message::Binary(data)) => {
                self.forward(Ok(TransportMessage::Binary(data.to_vec())), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                info!("Session {}: client closed: {:?}", self.session_id, reason);
                let description = reason.as_ref().and_then(|r| r.description.clone());
                self.forward(Ok(TransportMessage::Close(description)), ctx);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Session {}: unexpected continuation frame", self.session_id);
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("Session {}: WebSocket protocol error: {}", self.session_id, err);
                self.forward(Err(TransportError::Protocol(err.to_string())), ctx);
                ctx.stop();
            }
        }
    }
}

/// Frames from the session.
impl StreamHandler<OutboundCommand> for AssessmentSocket {
    fn handle(&mut self, command: OutboundCommand, ctx: &mut Self::Context) {
        match command {
            OutboundCommand::Text(json) => ctx.text(json),
            OutboundCommand::Close => {
                ctx.close(Some(ws::CloseCode::Normal.into()));
                ctx.stop();
            }
        }
    }

    fn finished(&mut self, ctx: &mut Self::Context) {
        debug!("Session {}: outbound stream finished", self.session_id);
        ctx.stop();
    }
}

/// Browsers always send `Origin`; other clients usually don't and are let through.
fn origin_allowed(origin: Option<&str>, allowed: &[String]) -> bool {
    if allowed.is_empty() {
        return true;
    }
    match origin {
        None => true,
        Some(origin) => {
            let origin = origin.trim_end_matches('/');
            allowed
                .iter()
                .any(|a| a == "*" || a.trim_end_matches('/').eq_ignore_ascii_case(origin))
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Rejects disallowed origins with 403 before upgrading. A server at capacity still
/// upgrades, then answers with a single error frame and closes, so browser clients get a
/// readable reason instead of a failed handshake.
pub async fn assessment_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
    engine: web::Data<dyn RecognitionEngine>,
) -> Result<HttpResponse, actix_web::Error> {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !origin_allowed(origin, &state.config().server.allowed_origins) {
        warn!("Rejected WebSocket upgrade from origin {:?}", origin);
        return Err(AppError::Forbidden(format!("origin {:?} is not allowed", origin)).into());
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    info!(
        "New assessment connection {} from {:?}",
        session_id,
        req.connection_info().peer_addr()
    );

    let permit = state.try_acquire_session();
    let socket = AssessmentSocket::new(session_id, engine.into_inner(), state, permit);
    ws::start(socket, &req, stream)
}
