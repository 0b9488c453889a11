use std::sync::Arc;

use async_trait::async_trait;
use axum_tws::{Message, WebSocket};
use futures::{
    SinkExt, Stream, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::SocketError,
    handler::{Frame, SocketHandler},
    registry::{Client, ClientId, ClientSink},
    state::AppState,
};

/// Outbound half of a WebSocket. Direct replies and broadcasts both go
/// through the same lock, so frames to one client never interleave.
pub struct WsSink {
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl WsSink {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

#[async_trait]
impl ClientSink for WsSink {
    async fn send_text(&self, text: &str) -> Result<(), SocketError> {
        self.sink
            .lock()
            .await
            .send(Message::text(text.to_owned()))
            .await
            .map_err(|e| SocketError::Send(e.to_string()))
    }
}

/// Data frames only; ping/pong are answered by the transport and a close
/// frame is followed by the end of the stream.
fn frames(stream: SplitStream<WebSocket>) -> impl Stream<Item = Result<Frame, SocketError>> {
    stream.filter_map(|msg| async move {
        match msg {
            Ok(msg) if msg.is_text() => msg.as_text().map(|text| Ok(Frame::Text(text.to_owned()))),
            Ok(msg) if msg.is_binary() => Some(Ok(Frame::Binary(msg.into_payload().to_vec()))),
            Ok(msg) => {
                if msg.is_close() {
                    debug!("Received close frame");
                }
                None
            }
            Err(e) => Some(Err(SocketError::Receive(e.to_string()))),
        }
    })
}

#[instrument(skip(socket, state), fields(connection_id = %client_id))]
pub async fn handle_socket(socket: WebSocket, state: Arc<AppState>, client_id: ClientId) {
    info!("New WebSocket connection established");

    let (sink, stream) = socket.split();
    let client = Client::new(client_id, Arc::new(WsSink::new(sink)));

    match SocketHandler::new(state, client).run(frames(stream)).await {
        Ok(()) => info!("WebSocket connection terminated"),
        Err(e) => warn!("WebSocket connection terminated: {}", e),
    }
}
