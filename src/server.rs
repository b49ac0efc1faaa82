use std::sync::Arc;
use std::time::Duration;

use futures_util::{future, SinkExt, StreamExt};
use log::{debug, error, info, warn};
use warp::ws::{Message as WsMessage, WebSocket};

use crate::broker::{BrokerError, BrokerMessage, MessageBroker, MessageHandler};
use crate::connection::{ConnectionManager, ConnectionSettings, Frame, TransportError};
use crate::messages::{room_from_channel, ROOM_PATTERN};
use crate::pool::WorkerPool;
use crate::registry::Registry;
use crate::store::RoomStore;

/// Process-wide relay: owns the local subscriber registry, the fan-out pool
/// and the broker subscription, and hands sockets to the connection manager.
#[derive(Clone)]
pub struct Server {
    registry: Registry,
    broker: Arc<dyn MessageBroker>,
    store: Arc<dyn RoomStore>,
    pool: Arc<WorkerPool>,
    connections: ConnectionManager,
}

impl Server {
    pub fn new(
        store: Arc<dyn RoomStore>,
        broker: Arc<dyn MessageBroker>,
        max_workers: usize,
        settings: ConnectionSettings,
    ) -> Self {
        let registry = Registry::new();
        let connections = ConnectionManager::new(
            registry.clone(),
            Arc::clone(&broker),
            Arc::clone(&store),
            settings,
        );
        Server {
            registry,
            broker,
            store,
            pool: Arc::new(WorkerPool::new(max_workers)),
            connections,
        }
    }

    pub fn store(&self) -> &Arc<dyn RoomStore> {
        &self.store
    }

    #[cfg(test)]
    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    /// Subscribes to every room's channel. Call once at boot.
    pub async fn start(&self) -> Result<(), BrokerError> {
        let registry = self.registry.clone();
        let pool = Arc::clone(&self.pool);
        let handler: MessageHandler = Arc::new(move |msg: BrokerMessage| {
            Self::handle_message(&registry, &pool, msg);
        });
        self.broker.subscribe(ROOM_PATTERN, handler).await?;
        info!("relay subscribed to '{ROOM_PATTERN}'");
        Ok(())
    }

    fn handle_message(registry: &Registry, pool: &WorkerPool, msg: BrokerMessage) {
        let Some(room_id) = room_from_channel(&msg.channel) else {
            debug!("ignoring message on channel '{}'", msg.channel);
            return;
        };
        let task = Self::fan_out(registry.clone(), room_id.to_string(), msg.payload);
        if let Err(e) = pool.submit(task) {
            warn!("dropping message for room {room_id}: {e}");
        }
    }

    /// Writes `payload` to every local connection in the room. A failed
    /// recipient is logged and skipped.
    async fn fan_out(registry: Registry, room_id: String, payload: Vec<u8>) {
        let text = match String::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!("dropping non-utf8 payload for room {room_id}: {e}");
                return;
            }
        };
        for connection in registry.get_subscribers(&room_id).await {
            if let Err(e) = connection.send_text(text.clone()) {
                warn!("failed to deliver to {}: {e}", connection.id());
            }
        }
    }

    pub async fn handle_connection(&self, ws: WebSocket, name: String, room_id: String) {
        let (ws_tx, ws_rx) = ws.split();
        let stream = ws_rx.map(|msg| msg.map(Frame::from).map_err(TransportError::from));
        let sink = ws_tx
            .sink_map_err(TransportError::from)
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(WsMessage::from(frame))));

        self.connections.run(name, room_id, stream, sink).await;
    }

    /// Drains the pool, closes the broker subscription, then cancels every
    /// connection and waits for each to leave its room. Both waits are
    /// bounded by `drain_timeout`.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if tokio::time::timeout(drain_timeout, self.pool.stop_wait())
            .await
            .is_err()
        {
            warn!("worker pool did not drain within {drain_timeout:?}");
        }

        if let Err(e) = self.broker.close().await {
            error!("failed to close broker subscription: {e}");
        }

        let remaining = self.registry.connections().await.len();
        info!("closing {remaining} remaining connections");
        if tokio::time::timeout(drain_timeout, self.connections.close_all())
            .await
            .is_err()
        {
            warn!("connections did not close within {drain_timeout:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::broker::{MemoryBroker, MemoryTransport};
    use crate::connection::testing::socket;
    use crate::connection::Connection;
    use crate::messages::{Message, NEW_MEMBER};
    use crate::store::MemoryStore;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);
    const WAIT: Duration = Duration::from_secs(2);

    fn server(transport: &Arc<MemoryTransport>, store: &Arc<MemoryStore>) -> Server {
        Server::new(
            Arc::clone(store) as Arc<dyn RoomStore>,
            Arc::new(MemoryBroker::connect(Arc::clone(transport))),
            4,
            ConnectionSettings::default(),
        )
    }

    async fn attach(server: &Server, id: &str, room: &str) -> mpsc::UnboundedReceiver<Frame> {
        let (connection, outbound) = Connection::new(id.to_string(), room.to_string());
        server.registry.subscribe(&Arc::new(connection), &[room]).await;
        outbound
    }

    async fn next_text(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Option<String> {
        loop {
            match tokio::time::timeout(WAIT, rx.recv()).await.ok().flatten()? {
                Frame::Text(text) => return Some(text),
                _ => continue,
            }
        }
    }

    #[test_log::test(tokio::test)]
    async fn fan_out_reaches_only_the_target_room() {
        let transport = MemoryTransport::new(64);
        let store = Arc::new(MemoryStore::new());
        let server = server(&transport, &store);
        server.start().await.unwrap();

        let mut a = attach(&server, "A", "abc").await;
        let mut b = attach(&server, "B", "abc").await;
        let mut c = attach(&server, "C", "xyz").await;

        server
            .broker
            .publish(b"payload".to_vec(), "messages:abc")
            .await
            .unwrap();

        assert_eq!(next_text(&mut a).await.as_deref(), Some("payload"));
        assert_eq!(next_text(&mut b).await.as_deref(), Some("payload"));
        server.shutdown(WAIT).await;
        assert!(c.try_recv().is_err());
    }

    #[test_log::test(tokio::test)]
    async fn failed_recipient_does_not_block_others() {
        let transport = MemoryTransport::new(64);
        let store = Arc::new(MemoryStore::new());
        let server = server(&transport, &store);
        server.start().await.unwrap();

        let dead = attach(&server, "A", "abc").await;
        drop(dead);
        let mut alive = attach(&server, "B", "abc").await;

        server
            .broker
            .publish(b"payload".to_vec(), "messages:abc")
            .await
            .unwrap();

        assert_eq!(next_text(&mut alive).await.as_deref(), Some("payload"));
    }

    #[test_log::test(tokio::test)]
    async fn rooms_span_processes() {
        let transport = MemoryTransport::new(64);
        let store = Arc::new(MemoryStore::new());
        let first = server(&transport, &store);
        let second = server(&transport, &store);
        first.start().await.unwrap();
        second.start().await.unwrap();
        let room = store
            .create_room("Movie night".into(), "https://youtube.com".into(), DAY)
            .await
            .unwrap();

        let (mut alice, alice_stream, alice_sink) = socket();
        let (mut bob, bob_stream, bob_sink) = socket();
        let alice_run = tokio::spawn({
            let first = first.clone();
            let room_id = room.id.clone();
            async move {
                first
                    .connections()
                    .run("Alice".into(), room_id, alice_stream, alice_sink)
                    .await;
            }
        });

        let joined = Message::decode(&next_text(&mut alice.outbound).await.unwrap()).unwrap();
        assert_eq!(joined.method, NEW_MEMBER);
        assert_eq!(joined.params["name"], json!("Alice"));

        let bob_run = tokio::spawn({
            let second = second.clone();
            let room_id = room.id.clone();
            async move {
                second
                    .connections()
                    .run("Bob".into(), room_id, bob_stream, bob_sink)
                    .await;
            }
        });
        let bob_joined = Message::decode(&next_text(&mut alice.outbound).await.unwrap()).unwrap();
        assert_eq!(bob_joined.params["name"], json!("Bob"));
        let _ = next_text(&mut bob.outbound).await;

        bob.send_text(r#"{"id":"1","method":"new_message","params":{"content":"hello"}}"#);
        let on_alice = Message::decode(&next_text(&mut alice.outbound).await.unwrap()).unwrap();
        let on_bob = Message::decode(&next_text(&mut bob.outbound).await.unwrap()).unwrap();
        assert_eq!(on_alice, on_bob);
        assert_eq!(on_alice.user_id, bob_joined.user_id);
        assert_eq!(on_alice.params["content"], json!("hello"));

        bob.inbound.send(Ok(Frame::Close)).unwrap();
        bob_run.await.unwrap();
        let left = Message::decode(&next_text(&mut alice.outbound).await.unwrap()).unwrap();
        assert_eq!(left.method, "logout_member");
        assert_eq!(left.user_id, bob_joined.user_id);

        alice.inbound.send(Ok(Frame::Close)).unwrap();
        alice_run.await.unwrap();
        assert!(store.get_room(&room.id).await.unwrap().members.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_returns_after_members_have_left() {
        let transport = MemoryTransport::new(64);
        let store = Arc::new(MemoryStore::new());
        let server = server(&transport, &store);
        server.start().await.unwrap();
        let room = store
            .create_room("Movie night".into(), "https://youtube.com".into(), DAY)
            .await
            .unwrap();

        let (_client, stream, sink) = socket();
        let run = tokio::spawn({
            let server = server.clone();
            let room_id = room.id.clone();
            async move {
                server
                    .connections()
                    .run("Alice".into(), room_id, stream, sink)
                    .await;
            }
        });
        while store.get_room(&room.id).await.unwrap().members.is_empty() {
            tokio::task::yield_now().await;
        }

        server.shutdown(WAIT).await;
        assert!(store.get_room(&room.id).await.unwrap().members.is_empty());
        assert!(server.registry.connections().await.is_empty());

        // runtime teardown drops whatever is left of the socket task
        run.abort();
        let _ = run.await;
        assert!(store.get_room(&room.id).await.unwrap().members.is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn shutdown_drains_and_closes_connections() {
        let transport = MemoryTransport::new(64);
        let store = Arc::new(MemoryStore::new());
        let server = server(&transport, &store);
        server.start().await.unwrap();

        let (_client, stream, sink) = socket();
        let run = tokio::spawn({
            let server = server.clone();
            async move {
                server
                    .connections()
                    .run("Alice".into(), "abc".into(), stream, sink)
                    .await;
            }
        });
        while server.registry.get_subscribers("abc").await.is_empty() {
            tokio::task::yield_now().await;
        }

        server.shutdown(WAIT).await;
        tokio::time::timeout(WAIT, run).await.unwrap().unwrap();

        assert!(server.registry.connections().await.is_empty());
        assert!(server.pool.submit(async {}).is_err());
        assert_eq!(
            server.broker.publish(b"x".to_vec(), "messages:abc").await,
            Err(BrokerError::NoRecipients)
        );
    }
}
