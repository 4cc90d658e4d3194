use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap};
use axum::response::Response;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tracing::{debug, info, warn};

use ambilight_engine::emitter::{ChannelEmitter, Emitter};
use ambilight_engine::registry::ConnectionId;

use crate::routes::AppState;

/// How long queued events may take to flush after the client goes away.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr, user_agent))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    addr: SocketAddr,
    user_agent: Option<String>,
) {
    let conn = ConnectionId::next();
    state.connections.insert(conn, addr.to_string(), user_agent);
    info!(%conn, %addr, "client connected");

    let (sink, stream) = socket.split();
    run_connection(conn, sink, stream, state).await;
}

/// Drive one registered connection until its inbound stream ends.
///
/// Outbound events from the control plane and the session worker go through
/// a [`ChannelEmitter`] drained by a dedicated writer task, so neither ever
/// waits on the socket. On exit the session is retired and the connection
/// record removed.
pub(crate) async fn run_connection<S, R, E>(
    conn: ConnectionId,
    sink: S,
    mut stream: R,
    state: AppState,
) where
    S: Sink<Message> + Send + 'static,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let (emitter, mut rx) = ChannelEmitter::channel(state.color_backlog);
    let emitter: Arc<dyn Emitter> = Arc::new(emitter);

    let mut writer = tokio::spawn(async move {
        tokio::pin!(sink);
        while let Some(event) = rx.recv().await {
            let text = match event.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(%conn, error = %e, "failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                debug!(%conn, "socket closed while sending");
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                state
                    .control
                    .handle_text(conn, &text, Arc::clone(&emitter))
                    .await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%conn, error = %e, "socket read failed");
                break;
            }
        }
    }

    state.control.disconnect(conn).await;
    state.connections.remove(conn);

    drop(emitter);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        debug!(%conn, "writer did not drain in time");
        writer.abort();
    }
    info!(%conn, open = state.connections.len(), "client disconnected");
}
