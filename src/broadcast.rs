use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::{error::SocketError, protocol::ServerMessage, registry::ClientRegistry};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub pruned: usize,
}

/// Fans one message out to every registered client. A client whose send
/// fails is removed from the registry; nothing else reaps dead connections.
pub struct Broadcaster {
    registry: Arc<ClientRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    #[instrument(skip_all)]
    pub async fn broadcast(&self, message: &ServerMessage) -> Result<BroadcastReport, SocketError> {
        let members = self.registry.snapshot_members();
        if members.is_empty() {
            debug!("No registered clients, skipping broadcast");
            return Ok(BroadcastReport::default());
        }

        let payload = message.encode()?;

        let results = join_all(members.iter().map(|client| {
            let payload = payload.as_str();
            async move { (client.id(), client.send_text(payload).await) }
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (client_id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(%client_id, "Dropping client after failed send: {}", e);
                    if self.registry.unregister(&client_id) {
                        report.pruned += 1;
                    }
                }
            }
        }

        debug!(
            "Broadcast delivered to {} clients, pruned {}",
            report.delivered, report.pruned
        );

        Ok(report)
    }
}
