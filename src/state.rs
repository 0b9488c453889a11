use std::sync::Arc;

use crate::{broadcast::Broadcaster, canvas::Canvas, registry::ClientRegistry};

pub struct AppState {
    pub canvas: Arc<Canvas>,
    pub registry: Arc<ClientRegistry>,
    pub broadcaster: Broadcaster,
}

impl AppState {
    pub fn new(width: usize, height: usize) -> AppState {
        let canvas = Arc::new(Canvas::new(width, height));
        let registry = Arc::new(ClientRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());

        AppState {
            canvas,
            registry,
            broadcaster,
        }
    }
}
