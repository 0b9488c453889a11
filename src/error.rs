/// Transport-level failures. Any of these ends the connection it happened on.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("WebSocket send error: {0}")]
    Send(String),
    #[error("WebSocket receive error: {0}")]
    Receive(String),
    #[error("Message encode error: {0}")]
    Encode(#[from] serde_json::Error),
}
