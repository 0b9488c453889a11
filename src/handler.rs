use std::pin::pin;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::SocketError,
    protocol::{ClientMessage, ProtocolError, ServerMessage, SetPixel},
    registry::{Client, ClientId, ClientRegistry},
    state::AppState,
};

/// A data frame as it came off the transport. Control frames never get here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

/// Removes the client from the registry when dropped, so a connection is
/// deregistered on every exit path, unwinding included.
struct Registration {
    registry: Arc<ClientRegistry>,
    client_id: ClientId,
}

impl Registration {
    fn new(registry: Arc<ClientRegistry>, client: Client) -> Self {
        let client_id = client.id();
        registry.register(client);
        Self {
            registry,
            client_id,
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(&self.client_id);
        debug!(client_id = %self.client_id, "Connection closed, client deregistered");
    }
}

/// Drives one connection: register and greet, then answer frames until the
/// inbound stream ends or a send to this client fails.
pub struct SocketHandler {
    state: Arc<AppState>,
    client: Client,
}

impl SocketHandler {
    pub fn new(state: Arc<AppState>, client: Client) -> Self {
        Self { state, client }
    }

    #[instrument(skip_all, fields(connection_id = %self.client.id()))]
    pub async fn run<S>(self, frames: S) -> Result<(), SocketError>
    where
        S: Stream<Item = Result<Frame, SocketError>>,
    {
        let _registration = Registration::new(self.state.registry.clone(), self.client.clone());

        self.reply(&ServerMessage::Hello {
            width: self.state.canvas.width(),
            height: self.state.canvas.height(),
        })
        .await?;
        info!("Client active");

        let mut frames = pin!(frames);
        let mut message_count: u64 = 0;

        while let Some(frame) = frames.next().await {
            message_count += 1;
            debug!("Received message #{}", message_count);
            self.handle_frame(frame?).await?;
        }

        info!("Inbound stream ended after {} messages", message_count);
        Ok(())
    }

    async fn handle_frame(&self, frame: Frame) -> Result<(), SocketError> {
        let parsed = match frame {
            Frame::Text(text) => ClientMessage::from_text(&text),
            Frame::Binary(data) => ClientMessage::from_binary(&data),
        };

        let reply = match parsed {
            Ok(message) => self.dispatch(message).await?,
            Err(err) => {
                debug!("Rejected message: {}", err);
                Some(err.into())
            }
        };

        match reply {
            Some(reply) => self.reply(&reply).await,
            None => Ok(()),
        }
    }

    /// Returns the direct reply for the sender, if there is one.
    async fn dispatch(&self, message: ClientMessage) -> Result<Option<ServerMessage>, SocketError> {
        match message {
            ClientMessage::Ping => Ok(Some(ServerMessage::Pong)),
            ClientMessage::SetPixel(pixel) => self.set_pixel(pixel).await,
            ClientMessage::GetCanvas => {
                let data = self.state.canvas.snapshot().await;
                Ok(Some(ServerMessage::Canvas {
                    width: data.width(),
                    height: data.height(),
                    data,
                }))
            }
            ClientMessage::Unknown(kind) => {
                debug!(kind = %kind, "Unknown message type");
                Ok(Some(ProtocolError::unknown_type(&kind).into()))
            }
        }
    }

    async fn set_pixel(
        &self,
        SetPixel { x, y, color }: SetPixel,
    ) -> Result<Option<ServerMessage>, SocketError> {
        let canvas = &self.state.canvas;
        let written = match (x.index(), y.index()) {
            (Some(col), Some(row)) => match canvas.set_pixel(col, row, color).await {
                Ok(()) => Some((col, row)),
                Err(err) => {
                    debug!(error = %err, "Rejected pixel outside canvas");
                    None
                }
            },
            _ => {
                debug!(%x, %y, "Rejected coordinates beyond i64");
                None
            }
        };
        let Some((x, y)) = written else {
            return Ok(Some(
                ProtocolError::out_of_bounds(&x, &y, canvas.width(), canvas.height()).into(),
            ));
        };

        debug!(x, y, color = %color, "Pixel set, broadcasting update");

        // The sender is a registry member too and sees its own update here.
        let report = self
            .state
            .broadcaster
            .broadcast(&ServerMessage::PixelUpdate { x, y, color })
            .await?;
        if report.pruned > 0 {
            warn!("{} clients pruned during pixel broadcast", report.pruned);
        }

        Ok(None)
    }

    async fn reply(&self, message: &ServerMessage) -> Result<(), SocketError> {
        let text = message.encode()?;
        self.client.send_text(&text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::Rgb;
    use crate::registry::testing::{dead_client, drain, fake_client};
    use futures::stream;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    const HELLO_SMALL: &str = r#"{"type":"hello","width":16,"height":16}"#;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(16, 16))
    }

    fn text(s: &str) -> Result<Frame, SocketError> {
        Ok(Frame::Text(s.to_string()))
    }

    fn parse(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    /// Runs one connection over `frames` to completion and returns what the
    /// client was sent, hello first.
    async fn run_client(
        state: &Arc<AppState>,
        frames: Vec<Result<Frame, SocketError>>,
    ) -> (Client, Result<(), SocketError>, Vec<String>) {
        let (client, mut rx) = fake_client();
        let handler = SocketHandler::new(state.clone(), client.clone());
        let result = handler.run(stream::iter(frames)).await;
        (client, result, drain(&mut rx))
    }

    /// Registers a passive observer that only listens to broadcasts.
    fn observer(state: &Arc<AppState>) -> (Client, mpsc::UnboundedReceiver<String>) {
        let (client, rx) = fake_client();
        state.registry.register(client.clone());
        (client, rx)
    }

    #[tokio::test]
    async fn hello_then_pong_for_both_ping_forms() {
        let state = state();

        let (client, result, sent) =
            run_client(&state, vec![text("ping"), text(r#"{"type":"ping"}"#)]).await;

        assert!(result.is_ok());
        assert_eq!(sent, vec![HELLO_SMALL, r#"{"type":"pong"}"#, r#"{"type":"pong"}"#]);
        assert!(!state.registry.contains(&client.id()));
    }

    #[tokio::test]
    async fn hello_uses_full_canvas_dimensions() {
        let state = Arc::new(AppState::new(512, 512));

        let (_, _, sent) = run_client(&state, vec![]).await;

        assert_eq!(sent, vec![r#"{"type":"hello","width":512,"height":512}"#]);
    }

    #[tokio::test]
    async fn set_pixel_is_broadcast_to_everyone_including_sender() {
        let state = state();
        let (_, mut other_rx) = observer(&state);
        let (_, mut another_rx) = observer(&state);

        let (_, result, sent) = run_client(
            &state,
            vec![text(r#"{"type":"set_pixel","x":10,"y":12,"color":[255,0,0]}"#)],
        )
        .await;

        let update = r#"{"type":"pixel_update","x":10,"y":12,"color":[255,0,0]}"#;
        assert!(result.is_ok());
        assert_eq!(sent, vec![HELLO_SMALL, update]);
        assert_eq!(drain(&mut other_rx), vec![update]);
        assert_eq!(drain(&mut another_rx), vec![update]);
        assert_eq!(state.canvas.get_pixel(10, 12).await, Ok(Rgb::new(255, 0, 0)));
    }

    #[tokio::test]
    async fn get_canvas_reflects_update_and_goes_to_sender_only() {
        let state = state();
        let (_, mut other_rx) = observer(&state);

        let (_, _, sent) = run_client(
            &state,
            vec![
                text(r#"{"type":"set_pixel","x":10,"y":3,"color":[255,0,0]}"#),
                text(r#"{"type":"get_canvas"}"#),
            ],
        )
        .await;

        assert_eq!(sent.len(), 3);
        let canvas = parse(&sent[2]);
        assert_eq!(canvas["type"], "canvas");
        assert_eq!(canvas["width"], 16);
        assert_eq!(canvas["height"], 16);
        assert_eq!(canvas["data"].as_array().unwrap().len(), 16);
        assert_eq!(canvas["data"][3][10], json!([255, 0, 0]));
        assert_eq!(canvas["data"][10][3], json!([0, 0, 0]));

        // the observer only saw the broadcast
        let seen = drain(&mut other_rx);
        assert_eq!(seen.len(), 1);
        assert_eq!(parse(&seen[0])["type"], "pixel_update");
    }

    #[tokio::test]
    async fn out_of_bounds_is_reported_to_sender_only() {
        let state = state();
        let (_, mut other_rx) = observer(&state);
        let before = state.canvas.snapshot().await;

        let (_, result, sent) = run_client(
            &state,
            vec![text(r#"{"type":"set_pixel","x":600,"y":2,"color":[1,2,3]}"#)],
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(sent.len(), 2);
        let err = parse(&sent[1]);
        assert_eq!(err["type"], "error");
        assert_eq!(err["error"], "out_of_bounds");
        assert_eq!(err["message"], "Pixel (600,2) outside canvas 16x16");
        assert!(drain(&mut other_rx).is_empty());
        assert_eq!(state.canvas.snapshot().await, before);
    }

    #[tokio::test]
    async fn integers_past_i64_are_out_of_bounds() {
        let state = state();
        let (_, mut other_rx) = observer(&state);
        let before = state.canvas.snapshot().await;

        let (_, result, sent) = run_client(
            &state,
            vec![
                text(r#"{"type":"set_pixel","x":9223372036854775808,"y":2,"color":[1,2,3]}"#),
                text(r#"{"type":"set_pixel","x":1,"y":100000000000000000000,"color":[1,2,3]}"#),
                text(r#"{"type":"set_pixel","x":-9223372036854775808,"y":2,"color":[1,2,3]}"#),
            ],
        )
        .await;

        assert!(result.is_ok());
        let replies: Vec<Value> = sent[1..].iter().map(|raw| parse(raw)).collect();
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|reply| reply["error"] == "out_of_bounds"));
        assert_eq!(
            replies[0]["message"],
            "Pixel (9223372036854775808,2) outside canvas 16x16"
        );
        assert_eq!(
            replies[1]["message"],
            "Pixel (1,100000000000000000000) outside canvas 16x16"
        );
        assert_eq!(
            replies[2]["message"],
            "Pixel (-9223372036854775808,2) outside canvas 16x16"
        );
        assert!(drain(&mut other_rx).is_empty());
        assert_eq!(state.canvas.snapshot().await, before);
    }

    #[tokio::test]
    async fn negative_zero_paints_the_origin() {
        let state = state();

        let (_, result, sent) = run_client(
            &state,
            vec![text(r#"{"type":"set_pixel","x":-0,"y":-0,"color":[-0,2,3]}"#)],
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(
            parse(&sent[1]),
            json!({"type": "pixel_update", "x": 0, "y": 0, "color": [0, 2, 3]})
        );
        assert_eq!(state.canvas.get_pixel(0, 0).await, Ok(Rgb::new(0, 2, 3)));
    }

    #[tokio::test]
    async fn validation_errors_keep_the_connection_open() {
        let state = state();
        let (_, mut other_rx) = observer(&state);

        let (_, result, sent) = run_client(
            &state,
            vec![
                text("not json"),
                text(r#"{"type":"set_pixel","x":1,"y":1,"color":[1,2]}"#),
                text(r#"{"type":"explode"}"#),
                Ok(Frame::Binary(b"ping".to_vec())),
                text("ping"),
            ],
        )
        .await;

        assert!(result.is_ok());
        let kinds: Vec<Value> = sent[1..].iter().map(|raw| parse(raw)).collect();
        assert_eq!(kinds[0]["error"], "invalid_json");
        assert_eq!(kinds[0]["message"], "Message must be JSON");
        assert_eq!(kinds[1]["error"], "invalid_arguments");
        assert_eq!(kinds[2]["error"], "unknown_type");
        assert_eq!(kinds[2]["message"], "Unknown type: explode");
        assert_eq!(kinds[3]["error"], "invalid_json");
        assert_eq!(kinds[4], json!({"type": "pong"}));
        assert!(drain(&mut other_rx).is_empty());
    }

    #[tokio::test]
    async fn binary_json_frames_are_accepted() {
        let state = state();

        let (_, _, sent) = run_client(
            &state,
            vec![Ok(Frame::Binary(br#"{"type":"ping"}"#.to_vec()))],
        )
        .await;

        assert_eq!(sent, vec![HELLO_SMALL, r#"{"type":"pong"}"#]);
    }

    #[tokio::test]
    async fn repeated_identical_set_pixel_broadcasts_twice() {
        let state = state();
        let (_, mut other_rx) = observer(&state);
        let msg = r#"{"type":"set_pixel","x":0,"y":0,"color":[7,7,7]}"#;

        run_client(&state, vec![text(msg), text(msg)]).await;

        let update = r#"{"type":"pixel_update","x":0,"y":0,"color":[7,7,7]}"#;
        assert_eq!(drain(&mut other_rx), vec![update, update]);
        assert_eq!(state.canvas.get_pixel(0, 0).await, Ok(Rgb::new(7, 7, 7)));
    }

    #[tokio::test]
    async fn receive_error_ends_connection_and_deregisters() {
        let state = state();

        let (client, result, sent) = run_client(
            &state,
            vec![
                text("ping"),
                Err(SocketError::Receive("reset by peer".to_string())),
                text("ping"),
            ],
        )
        .await;

        assert!(matches!(result, Err(SocketError::Receive(_))));
        assert_eq!(sent, vec![HELLO_SMALL, r#"{"type":"pong"}"#]);
        assert!(!state.registry.contains(&client.id()));
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn failed_hello_deregisters() {
        let state = state();
        let client = dead_client();
        let handler = SocketHandler::new(state.clone(), client.clone());

        let result = handler.run(stream::iter(vec![text("ping")])).await;

        assert!(matches!(result, Err(SocketError::Send(_))));
        assert!(!state.registry.contains(&client.id()));
    }

    #[tokio::test]
    async fn client_is_registered_while_active() {
        let state = state();
        let (client, mut rx) = fake_client();
        let (tx, frames) = mpsc::unbounded_channel::<Result<Frame, SocketError>>();
        let frames = futures::stream::unfold(frames, |mut frames| async move {
            frames.recv().await.map(|frame| (frame, frames))
        });

        let task = tokio::spawn(SocketHandler::new(state.clone(), client.clone()).run(frames));

        // hello arrives only after registration
        assert_eq!(rx.recv().await.as_deref(), Some(HELLO_SMALL));
        assert!(state.registry.contains(&client.id()));

        tx.send(text("ping")).unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some(r#"{"type":"pong"}"#));

        drop(tx);
        task.await.unwrap().unwrap();
        assert!(!state.registry.contains(&client.id()));
    }

    #[tokio::test]
    async fn dead_observer_is_pruned_on_next_update() {
        let state = state();
        let dead = dead_client();
        state.registry.register(dead.clone());
        let (_, mut other_rx) = observer(&state);

        let (_, result, sent) = run_client(
            &state,
            vec![text(r#"{"type":"set_pixel","x":1,"y":1,"color":[0,0,255]}"#)],
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(sent.len(), 2);
        assert_eq!(drain(&mut other_rx).len(), 1);
        assert!(!state.registry.contains(&dead.id()));
    }
}
