//! # Media Stream WebSocket Handler
//!
//! One actor per telephony media stream. Each actor owns the paired connection to
//! the speech agent and every piece of per-call state.
//!
//! ## Connection Lifecycle:
//! 1. **Accept**: the telephony provider connects to `/media`
//! 2. **Dial**: the actor opens a connection to the speech agent and arms the
//!    connect timer
//! 3. **Handshake**: on open the timer is cancelled and the agent settings are sent first
//! 4. **Relay**: telephony text frames go through the inbound relay, agent messages
//!    through the outbound relay
//! 5. **Teardown**: a telephony close stops the actor, which closes the agent side.
//!    An agent close is only logged, since the provider may still send `stop`
//!
//! ## Actor Model:
//! Both sockets feed the same actor context, so telephony and agent messages are
//! handled one at a time and the frame buffer needs no lock.

use crate::audio::processor::{FragmentFilter, NoiseGate};
use crate::audio::session::CallSession;
use crate::relay::inbound::InboundRelay;
use crate::relay::outbound::OutboundRelay;
use crate::relay::{SpeechPeer, TelephonyPeer};
use crate::speech_client::{self, SpeechConnection, SpeechLink, SpeechStream};
use crate::state::{AppState, RelayMetrics};

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{Error as TungsteniteError, Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Keep-alive message understood by the speech agent.
const KEEPALIVE_MESSAGE: &str = r#"{"type":"KeepAlive"}"#;

/// WebSocket actor supervising one call.
pub struct MediaStreamSocket {
    session: CallSession,
    inbound: InboundRelay,
    outbound: OutboundRelay,
    speech: SpeechConnection,

    /// Pending connect timer; `take()`n exactly once
    connect_timer: Option<SpawnHandle>,

    speech_url: String,
    speech_api_key: String,
    agent_settings: Arc<Value>,
    connect_timeout: Duration,
    keepalive_interval: Option<Duration>,
    metrics: Arc<RelayMetrics>,
}

impl MediaStreamSocket {
    /// Create a supervisor using the configuration current at accept time.
    pub fn new(app_state: &AppState) -> Self {
        let config = app_state.get_config();
        let metrics = app_state.metrics.clone();

        let gate = config
            .audio
            .noise_gate_enabled
            .then(|| NoiseGate::new(config.audio.to_gate_config()));
        let inbound = InboundRelay::new(
            config.audio.frame_size,
            FragmentFilter::new(config.audio.to_filter_config()),
            gate,
            metrics.clone(),
        );

        Self {
            session: CallSession::new(Uuid::new_v4().to_string()),
            inbound,
            outbound: OutboundRelay::new(app_state.functions.clone(), metrics.clone()),
            speech: SpeechConnection::Connecting,
            connect_timer: None,
            speech_url: config.speech.url.clone(),
            speech_api_key: config.speech.api_key.clone(),
            agent_settings: app_state.agent_settings.clone(),
            connect_timeout: config.speech.connect_timeout(),
            keepalive_interval: config.speech.keepalive_interval(),
            metrics,
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.session.connection_id
    }

    /// Cancel the connect timer if it is still armed. Repeated calls do nothing.
    fn cancel_connect_timer(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(handle) = self.connect_timer.take() {
            ctx.cancel_future(handle);
        }
    }

    /// The speech agent accepted the connection: send settings, then start relaying.
    fn on_speech_open(
        &mut self,
        link: SpeechLink,
        stream: SpeechStream,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if !matches!(self.speech, SpeechConnection::Connecting) {
            // Telephony side already went away
            link.close();
            return;
        }

        self.cancel_connect_timer(ctx);

        let settings = match serde_json::to_string(&*self.agent_settings) {
            Ok(settings) => settings,
            Err(err) => {
                error!(
                    connection_id = %self.connection_id(),
                    "Failed to encode agent settings: {}",
                    err
                );
                link.close();
                self.speech = SpeechConnection::Closed;
                ctx.stop();
                return;
            }
        };

        let mut connection = SpeechConnection::Open(link);
        if let Err(err) = connection.send_json(settings) {
            error!(connection_id = %self.connection_id(), "Failed to send agent settings: {}", err);
            self.speech = SpeechConnection::Closed;
            ctx.stop();
            return;
        }

        ctx.add_stream(stream);
        self.speech = connection;
        info!(connection_id = %self.connection_id(), "Speech agent connected, settings sent");
    }

    fn on_speech_closed(&mut self, reason: &str) {
        if !matches!(self.speech, SpeechConnection::Closed) {
            info!(
                connection_id = %self.connection_id(),
                stream_sid = ?self.session.stream_sid(),
                "Speech agent connection closed: {}",
                reason
            );
        }
        self.speech = SpeechConnection::Closed;
    }

    fn relay_from_speech(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        let mut telephony = ContextSink(ctx);
        self.outbound
            .handle_message(data, &self.session, &mut telephony, &mut self.speech);
    }
}

/// Telephony-side sender backed by the actor's own WebSocket context.
struct ContextSink<'a>(&'a mut ws::WebsocketContext<MediaStreamSocket>);

impl TelephonyPeer for ContextSink<'_> {
    fn send_text(&mut self, text: String) {
        self.0.text(text);
    }
}

impl Actor for MediaStreamSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.metrics.session_opened();
        info!(connection_id = %self.connection_id(), "Telephony media stream connected");

        self.connect_timer = Some(ctx.run_later(self.connect_timeout, |act, ctx| {
            act.connect_timer = None;
            if !act.speech.is_ready() {
                warn!(
                    connection_id = %act.connection_id(),
                    "Speech agent did not connect within {:?}, closing call",
                    act.connect_timeout
                );
                ctx.close(Some(ws::CloseReason {
                    code: ws::CloseCode::Away,
                    description: Some("speech agent unavailable".to_string()),
                }));
                ctx.stop();
            }
        }));

        let url = self.speech_url.clone();
        let api_key = self.speech_api_key.clone();
        let dial = async move { speech_client::connect(&url, &api_key).await };
        ctx.spawn(dial.into_actor(self).map(|result, act, ctx| match result {
            Ok((link, stream)) => act.on_speech_open(link, stream, ctx),
            Err(err) => {
                // The connect timer closes the call
                error!(
                    connection_id = %act.connection_id(),
                    "Speech agent connection failed: {:#}",
                    err
                );
            }
        }));

        if let Some(interval) = self.keepalive_interval {
            ctx.run_interval(interval, |act, _ctx| {
                if act.speech.is_ready() {
                    if let Err(err) = act.speech.send_json(KEEPALIVE_MESSAGE.to_string()) {
                        debug!(
                            connection_id = %act.connection_id(),
                            "Keep-alive not sent: {}",
                            err
                        );
                    }
                }
            });
        }
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        self.cancel_connect_timer(ctx);
        self.speech.close();
        self.metrics.session_closed();

        let duration_ms = (Utc::now() - self.session.created_at).num_milliseconds();
        info!(
            connection_id = %self.connection_id(),
            stream_sid = ?self.session.stream_sid(),
            phase = self.session.phase().as_str(),
            messages = self.session.message_count(),
            media_events = self.session.media_count(),
            pending_bytes = self.inbound.pending_bytes(),
            duration_ms,
            "Telephony media stream closed"
        );
    }
}

/// Telephony-side frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.inbound.handle_text(&text, &mut self.session, &mut self.speech);
            }
            Ok(ws::Message::Binary(data)) => {
                warn!(
                    connection_id = %self.connection_id(),
                    bytes = data.len(),
                    "Ignoring binary frame from telephony peer"
                );
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) | Ok(ws::Message::Nop) => {}
            Ok(ws::Message::Close(reason)) => {
                info!(connection_id = %self.connection_id(), "Telephony peer closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(
                    connection_id = %self.connection_id(),
                    "Received unexpected continuation frame"
                );
            }
            Err(err) => {
                error!(
                    connection_id = %self.connection_id(),
                    "Telephony WebSocket protocol error: {}",
                    err
                );
                ctx.stop();
            }
        }
    }
}

/// Speech-agent frames.
impl StreamHandler<Result<Message, TungsteniteError>> for MediaStreamSocket {
    fn handle(&mut self, msg: Result<Message, TungsteniteError>, ctx: &mut Self::Context) {
        match msg {
            Ok(Message::Text(text)) => self.relay_from_speech(text.as_bytes(), ctx),
            Ok(Message::Binary(data)) => self.relay_from_speech(&data, ctx),
            Ok(Message::Close(frame)) => {
                let reason = frame
                    .map(|f| format!("{} {}", f.code, f.reason))
                    .unwrap_or_else(|| "no close frame".to_string());
                self.on_speech_closed(&reason);
            }
            // Ping/pong replies are handled by the socket itself
            Ok(_) => {}
            Err(err) => {
                error!(
                    connection_id = %self.connection_id(),
                    "Speech agent socket error: {}",
                    err
                );
                self.on_speech_closed("socket error");
            }
        }
    }

    /// The call continues; only the telephony side ends it.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        self.on_speech_closed("stream ended");
    }
}

/// WebSocket endpoint for telephony media streams.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to a fresh [`MediaStreamSocket`].
pub async fn media_stream(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New media stream connection from: {:?}", req.connection_info().peer_addr());

    ws::start(MediaStreamSocket::new(&app_state), &req, stream)
}
