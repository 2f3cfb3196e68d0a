use std::collections::HashMap;

use log::{info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::models::websocket::ServerEvent;

/// Fan-out registry for live push connections. Delivery is best effort: a
/// connection that can no longer be written to is dropped from the set while
/// the event still reaches everyone else.
pub struct BroadcastHub {
    connections: Mutex<HashMap<Uuid, UnboundedSender<ServerEvent>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register(&self) -> (Uuid, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        self.connections.lock().await.insert(id, tx);
        info!("Registered push connection: {}", id);
        (id, rx)
    }

    pub async fn unregister(&self, id: Uuid) {
        if self.connections.lock().await.remove(&id).is_some() {
            info!("Unregistered push connection: {}", id);
        }
    }

    pub async fn publish(&self, event: &ServerEvent) {
        let mut connections = self.connections.lock().await;
        let mut closed = Vec::new();
        for (id, tx) in connections.iter() {
            if tx.send(event.clone()).is_err() {
                warn!("Push connection {} is gone. Dropping it from the hub.", id);
                closed.push(*id);
            }
        }
        for id in closed {
            connections.remove(&id);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}
