//! # WebSocket Session Actor
//!
//! One actor per accepted connection. The actor mailbox is the session's
//! serialization point: inbound frames are handled strictly in arrival
//! order, and every outbound write funnels through the actor's context, so
//! concurrent producers (the frame handler, ASR replies, debug blobs) can
//! never interleave a write.
//!
//! ## Session Phases:
//! 1. **AWAIT_AUTH**: the first message must present a valid one-use
//!    ticket within 5 seconds; anything else closes the socket with 1008.
//! 2. **STREAMING**: `audio_stream_start` / `audio_chunk` /
//!    `audio_stream_end` drive the stream engine; ASR submissions and
//!    archiver forwards are spawned fire-and-forget so the frame cadence
//!    never waits on upstream I/O.
//!
//! In-flight ASR requests are not cancelled on disconnect; their replies
//! are dropped when the mailbox is gone.

use crate::archive::{spawn_archiver, ArchiverConfig, ArchiverHandle, ObjectStore};
use crate::asr::AsrDispatcher;
use crate::auth::ticket::{consume_ticket, ticket_prefix};
use crate::auth::TicketStore;
use crate::state::AppState;
use crate::ws::messages::{wire_timestamp, ClientMessage, ServerMessage, VadState};
use crate::ws::stream::{StreamAction, StreamEngine};

use actix::prelude::*;
use actix_web_actors::ws;
use actix_web_actors::ws::{CloseCode, CloseReason};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// How long a connection may sit unauthenticated.
pub const AUTH_DEADLINE: Duration = Duration::from_secs(5);

/// Everything a session needs from the process, bundled for the connection
/// handler to clone in.
#[derive(Clone)]
pub struct SessionDeps {
    pub ticket_store: Arc<dyn TicketStore>,
    pub object_store: Option<Arc<dyn ObjectStore>>,
    pub dispatcher: AsrDispatcher,
    pub archiver_config: ArchiverConfig,
    pub app_state: AppState,
}

/// Per-connection actor: authentication phase, then the streaming phase.
pub struct SessionActor {
    /// Internal id used for archive keys and logs (not client-visible)
    session_id: String,

    /// Set exactly once, on successful ticket consumption
    subject: Option<String>,

    authenticated: bool,

    /// A ticket consume is in flight; its outcome arrives as a mailbox message
    auth_in_flight: bool,

    connected_at: Instant,

    auth_timer: Option<SpawnHandle>,

    engine: StreamEngine,

    archiver: Option<ArchiverHandle>,

    deps: SessionDeps,
}

impl SessionActor {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            subject: None,
            authenticated: false,
            auth_in_flight: false,
            connected_at: Instant::now(),
            auth_timer: None,
            engine: StreamEngine::new(),
            archiver: None,
            deps,
        }
    }

    fn send_message(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(json) => ctx.text(json),
            Err(e) => error!(session_id = %self.session_id, error = %e, "failed to serialize frame"),
        }
    }

    /// Best-effort `auth_error` frame, then a 1008 close. The frame may or
    /// may not beat the close over TCP; clients must not rely on it.
    fn fail_auth(&self, ctx: &mut ws::WebsocketContext<Self>, error: &str, close_reason: &str) {
        self.send_message(
            ctx,
            &ServerMessage::AuthError {
                error: error.to_string(),
                timestamp: wire_timestamp(),
            },
        );
        ctx.close(Some(CloseReason {
            code: CloseCode::Policy,
            description: Some(close_reason.to_string()),
        }));
        ctx.stop();
    }

    fn handle_auth(&mut self, ticket: Option<String>, ctx: &mut ws::WebsocketContext<Self>) {
        let ticket = match ticket {
            Some(t) if !t.is_empty() => t,
            _ => {
                self.fail_auth(
                    ctx,
                    "Missing ticket in authentication message",
                    "Invalid authentication",
                );
                return;
            }
        };

        if self.auth_in_flight {
            warn!(session_id = %self.session_id, "duplicate auth message while validation in flight");
            return;
        }
        self.auth_in_flight = true;

        debug!(
            session_id = %self.session_id,
            ticket_prefix = %ticket_prefix(&ticket),
            "validating connection ticket"
        );

        let store = self.deps.ticket_store.clone();
        let addr = ctx.address();
        tokio::spawn(async move {
            let result = consume_ticket(store.as_ref(), &ticket).await;
            addr.do_send(AuthOutcome { result });
        });
    }

    /// One decoded inbound audio frame, run through the stream engine; the
    /// returned actions are carried out here.
    fn handle_audio_chunk(
        &mut self,
        data: Option<String>,
        vad_state: Option<String>,
        vad_offset_ms: Option<i64>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        let payload = match data.as_deref() {
            None | Some("") => Vec::new(),
            Some(encoded) => match BASE64_STANDARD.decode(encoded) {
                Ok(bytes) => bytes,
                Err(e) => {
                    // Still count the frame: the 128 ms cadence is a contract
                    warn!(session_id = %self.session_id, error = %e, "failed to decode base64 audio payload");
                    Vec::new()
                }
            },
        };

        let vad = vad_state.as_deref().and_then(VadState::from_wire);
        let actions = self.engine.handle_chunk(payload, vad, vad_offset_ms);

        for action in actions {
            match action {
                StreamAction::Emit(msg) => self.send_message(ctx, &msg),
                StreamAction::Archive {
                    payload,
                    vad_state,
                    vad_offset_ms,
                } => {
                    if let Some(archiver) = &self.archiver {
                        archiver.process(payload, vad_state, vad_offset_ms);
                    }
                }
                StreamAction::SubmitAsr {
                    segments,
                    speech_start_ms,
                    speech_end_ms,
                    is_prefetch,
                } => {
                    let dispatcher = self.deps.dispatcher.clone();
                    let addr = ctx.address();
                    tokio::spawn(async move {
                        let frames = dispatcher
                            .transcribe(segments, speech_start_ms, speech_end_ms, is_prefetch)
                            .await;
                        if !frames.is_empty() {
                            // Dropped silently if the session is gone
                            addr.do_send(DeliverFrames(frames));
                        }
                    });
                }
            }
        }
    }

    fn handle_streaming_message(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match msg {
            ClientMessage::AudioStreamStart => {
                self.engine.reset();
                let user_id = self.subject.clone().unwrap_or_default();
                self.send_message(
                    ctx,
                    &ServerMessage::AudioStreamStartAck {
                        timestamp: wire_timestamp(),
                        user_id,
                    },
                );
            }
            ClientMessage::AudioChunk {
                data,
                vad_state,
                vad_offset_ms,
                ..
            } => {
                self.handle_audio_chunk(data, vad_state, vad_offset_ms, ctx);
            }
            ClientMessage::AudioStreamEnd => {
                self.send_message(
                    ctx,
                    &ServerMessage::AudioStreamEndAck {
                        received_chunks: self.engine.frame_count(),
                        timestamp: wire_timestamp(),
                    },
                );
            }
            // `auth` after authentication: the phase machine never returns
            // to AWAIT_AUTH, so it falls through the unknown-type reply
            ClientMessage::Auth { .. } => {
                ctx.text(
                    json!({
                        "error": "Unknown message type received",
                        "unknownType": "auth",
                        "receivedMessage": {"type": "auth"},
                        "timestamp": wire_timestamp(),
                    })
                    .to_string(),
                );
            }
        }
    }

    fn handle_text(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                let preview: String = text.chars().take(100).collect();
                ctx.text(
                    json!({
                        "error": "Failed to parse message as JSON",
                        "parseError": e.to_string(),
                        "receivedData": preview,
                        "timestamp": wire_timestamp(),
                    })
                    .to_string(),
                );
                return;
            }
        };

        let message = serde_json::from_value::<ClientMessage>(value.clone());

        if !self.authenticated {
            match message {
                Ok(ClientMessage::Auth { ticket }) => self.handle_auth(ticket, ctx),
                _ => {
                    self.fail_auth(
                        ctx,
                        "Must authenticate first with auth message",
                        "Authentication required",
                    );
                }
            }
            return;
        }

        match message {
            Ok(msg) => self.handle_streaming_message(msg, ctx),
            Err(e) => {
                let msg_type = value.get("type").cloned().unwrap_or(serde_json::Value::Null);
                debug!(session_id = %self.session_id, error = %e, "unparseable streaming message");
                ctx.text(
                    json!({
                        "error": "Unknown message type received",
                        "unknownType": msg_type,
                        "receivedMessage": value,
                        "timestamp": wire_timestamp(),
                    })
                    .to_string(),
                );
            }
        }
    }
}

/// Ticket validation outcome, posted back into the mailbox.
#[derive(Message)]
#[rtype(result = "()")]
struct AuthOutcome {
    result: Result<Option<String>, String>,
}

/// Wire frames produced off-actor (ASR results, debug blobs).
#[derive(Message)]
#[rtype(result = "()")]
struct DeliverFrames(Vec<ServerMessage>);

impl Actor for SessionActor {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "WebSocket session opened");
        self.deps.app_state.increment_active_sessions();

        self.auth_timer = Some(ctx.run_later(AUTH_DEADLINE, |act, ctx| {
            if !act.authenticated {
                warn!(session_id = %act.session_id, "authentication deadline elapsed");
                act.fail_auth(
                    ctx,
                    "Authentication timeout - connection closed",
                    "Authentication timeout",
                );
            }
        }));
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        if let Some(handle) = self.auth_timer.take() {
            ctx.cancel_future(handle);
        }
        if let Some(archiver) = self.archiver.take() {
            archiver.shutdown();
        }
        self.deps.app_state.decrement_active_sessions();

        info!(
            session_id = %self.session_id,
            subject = self.subject.as_deref().unwrap_or("unauthenticated"),
            duration_seconds = self.connected_at.elapsed().as_secs(),
            frames = self.engine.frame_count(),
            "WebSocket session closed"
        );
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionActor {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => self.handle_text(&text, ctx),
            Ok(ws::Message::Binary(data)) => {
                // The protocol is text-JSON only; audio travels base64-inline
                warn!(session_id = %self.session_id, bytes = data.len(), "unexpected binary frame");
                ctx.text(
                    json!({
                        "error": "Binary frames are not supported",
                        "timestamp": wire_timestamp(),
                    })
                    .to_string(),
                );
            }
            Ok(ws::Message::Ping(data)) => ctx.pong(&data),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(session_id = %self.session_id, ?reason, "client closed connection");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %self.session_id, "unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<AuthOutcome> for SessionActor {
    type Result = ();

    fn handle(&mut self, msg: AuthOutcome, ctx: &mut Self::Context) {
        self.auth_in_flight = false;

        let subject = match msg.result {
            Ok(Some(subject)) => subject,
            Ok(None) => {
                self.fail_auth(ctx, "Invalid or expired ticket", "Authentication failed");
                return;
            }
            Err(e) => {
                error!(session_id = %self.session_id, error = %e, "ticket store failure");
                self.fail_auth(ctx, "Invalid or expired ticket", "Authentication failed");
                return;
            }
        };

        self.authenticated = true;
        self.subject = Some(subject.clone());
        if let Some(handle) = self.auth_timer.take() {
            ctx.cancel_future(handle);
        }

        // Archival is best-effort: without a configured store the session
        // simply runs transcription-only.
        match &self.deps.object_store {
            Some(store) => {
                self.archiver = Some(spawn_archiver(
                    &self.session_id,
                    self.deps.archiver_config.clone(),
                    store.clone(),
                ));
            }
            None => {
                warn!(session_id = %self.session_id, "no object store configured; session runs without archival");
            }
        }

        info!(session_id = %self.session_id, subject = %subject, "session authenticated");
        self.send_message(
            ctx,
            &ServerMessage::AuthSuccess {
                user_id: subject,
                timestamp: wire_timestamp(),
            },
        );
    }
}

impl Handler<DeliverFrames> for SessionActor {
    type Result = ();

    fn handle(&mut self, msg: DeliverFrames, ctx: &mut Self::Context) {
        for frame in &msg.0 {
            match frame {
                ServerMessage::TranscriptionResult { .. } => {
                    self.deps.app_state.record_transcription(true);
                }
                ServerMessage::TranscriptionError { .. } => {
                    self.deps.app_state.record_transcription(false);
                }
                _ => {}
            }
            self.send_message(ctx, frame);
        }
    }
}
