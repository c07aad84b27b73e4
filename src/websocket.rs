//! # View Feed WebSocket
//!
//! Pushes the live [`ViewState`] to presentation clients connected at `/ws/view`.
//!
//! ## Protocol:
//! 1. **Connect**: The client immediately receives `{"type":"view","view":{...}}`
//!    with the current state
//! 2. **Updates**: Every change to the view is pushed as another full `view` message
//! 3. **Heartbeat**: The server pings every 30s and drops clients silent for 60s
//! 4. **Client messages**: `{"type":"refresh"}` asks for the current state again;
//!    anything else is ignored
//!
//! ## Actor Model:
//! Each connection is an actix actor. The view store's broadcast receiver is
//! wrapped in a `BroadcastStream` and attached to the actor as a second stream,
//! so updates arrive through the same mailbox as client frames.

use crate::state::AppState;
use crate::view::ViewState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages sent to feed clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage<'a> {
    View { view: &'a ViewState },
    /// The client fell behind and `skipped` updates were dropped; the next
    /// `view` message is complete, so nothing needs to be replayed
    Lagged { skipped: u64 },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Refresh,
}

pub struct ViewFeed {
    state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl ViewFeed {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_view(&self, view: &ViewState, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(&FeedMessage::View { view }) {
            Ok(json) => ctx.text(json),
            Err(err) => warn!(error = %err, "Could not serialize view update"),
        }
    }
}

impl Actor for ViewFeed {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.state.increment_view_subscribers();
        debug!("View feed client connected");

        // Subscribe before the snapshot so no update can fall between the two
        let updates = BroadcastStream::new(self.state.view().subscribe());
        ctx.add_stream(updates);
        let snapshot = self.state.view().snapshot();
        self.send_view(&snapshot, ctx);

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("View feed heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.state.decrement_view_subscribers();
        debug!("View feed client disconnected");
    }
}

impl StreamHandler<Result<ViewState, BroadcastStreamRecvError>> for ViewFeed {
    fn handle(
        &mut self,
        item: Result<ViewState, BroadcastStreamRecvError>,
        ctx: &mut Self::Context,
    ) {
        match item {
            Ok(view) => self.send_view(&view, ctx),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "View feed client lagging");
                if let Ok(json) = serde_json::to_string(&FeedMessage::Lagged { skipped }) {
                    ctx.text(json);
                }
            }
        }
    }

    // The broadcast sender lives as long as the app, so ending here only
    // happens on shutdown; keep the socket until the client or heartbeat ends it
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ViewFeed {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(ClientMessage::Refresh) => {
                        let snapshot = self.state.view().snapshot();
                        self.send_view(&snapshot, ctx);
                    }
                    Err(_) => debug!("Ignoring unrecognized view feed message"),
                }
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "View feed closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Binary(_)) | Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!(error = %err, "View feed protocol error");
                ctx.stop();
            }
        }
    }
}

/// Upgrade `GET /ws/view` to a feed connection.
pub async fn view_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "New view feed connection");
    ws::start(ViewFeed::new(state), &req, stream)
}
