use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::connection::Connection;

type Channels = Arc<RwLock<HashMap<String, HashMap<String, Arc<Connection>>>>>;

/// Local index of which connections are attached to which room on this
/// process. Lookups hand out copies so callers never write to sockets while
/// the lock is held.
#[derive(Clone, Default)]
pub struct Registry {
    channels: Channels,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe(&self, connection: &Arc<Connection>, channels: &[&str]) {
        let mut map = self.channels.write().await;
        for channel in channels {
            map.entry((*channel).to_string())
                .or_default()
                .insert(connection.id().to_string(), Arc::clone(connection));
        }
    }

    /// Removes the connection from each channel; channels left empty are
    /// dropped so the map only holds rooms with live local members.
    pub async fn unsubscribe(&self, connection: &Connection, channels: &[&str]) {
        let mut map = self.channels.write().await;
        for channel in channels {
            if let Some(subscribers) = map.get_mut(*channel) {
                subscribers.remove(connection.id());
                if subscribers.is_empty() {
                    map.remove(*channel);
                }
            }
        }
    }

    pub async fn get_subscribers(&self, channel: &str) -> Vec<Arc<Connection>> {
        let map = self.channels.read().await;
        map.get(channel)
            .map(|subscribers| subscribers.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every registered connection, each listed once.
    pub async fn connections(&self) -> Vec<Arc<Connection>> {
        let map = self.channels.read().await;
        let mut unique: HashMap<&str, Arc<Connection>> = HashMap::new();
        for connection in map.values().flat_map(HashMap::values) {
            unique.insert(connection.id(), Arc::clone(connection));
        }
        unique.into_values().collect()
    }

    #[cfg(test)]
    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }
}
