use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use log::{debug, error, info, warn};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::broker::MessageBroker;
use crate::messages::{room_channel, Message, Request, LOGOUT_MEMBER, NEW_MEMBER};
use crate::registry::Registry;
use crate::room::{random_letters, Member};
use crate::store::RoomStore;

/// How long the writer gets to flush and close the socket on teardown.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("read timed out")]
    Timeout,
    #[error("connection cancelled")]
    Cancelled,
    #[error("websocket error: {0}")]
    Protocol(String),
}

impl From<warp::Error> for TransportError {
    fn from(e: warp::Error) -> Self {
        TransportError::Protocol(e.to_string())
    }
}

/// Socket frames as seen by the relay, independent of the websocket library.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong(Vec<u8>),
    Close,
}

impl From<warp::ws::Message> for Frame {
    fn from(msg: warp::ws::Message) -> Self {
        if msg.is_close() {
            Frame::Close
        } else if msg.is_ping() {
            Frame::Ping(msg.into_bytes())
        } else if msg.is_pong() {
            Frame::Pong(msg.into_bytes())
        } else if let Ok(text) = msg.to_str() {
            Frame::Text(text.to_string())
        } else {
            Frame::Binary(msg.into_bytes())
        }
    }
}

impl From<Frame> for warp::ws::Message {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => warp::ws::Message::text(text),
            Frame::Binary(bytes) => warp::ws::Message::binary(bytes),
            Frame::Ping(bytes) => warp::ws::Message::ping(bytes),
            Frame::Pong(bytes) => warp::ws::Message::pong(bytes),
            Frame::Close => warp::ws::Message::close(),
        }
    }
}

/// Handle to one attached socket.
///
/// All writes go through an outbound queue drained by a single writer task,
/// so keepalive pings and relayed messages never interleave on the wire.
#[derive(Debug)]
pub struct Connection {
    id: String,
    room_id: String,
    outbound: mpsc::UnboundedSender<Frame>,
    cancel: CancellationToken,
}

impl Connection {
    pub fn new(id: String, room_id: String) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        Self::with_cancel(id, room_id, CancellationToken::new())
    }

    fn with_cancel(
        id: String,
        room_id: String,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let connection = Connection {
            id,
            room_id,
            outbound,
            cancel,
        };
        (connection, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.send(Frame::Text(text))
    }

    pub fn ping(&self) -> Result<(), TransportError> {
        self.send(Frame::Ping(b"ping".to_vec()))
    }

    /// Ends the connection's serve phase. Safe to call more than once.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub keepalive_interval: Duration,
    pub read_timeout: Option<Duration>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings {
            keepalive_interval: Duration::from_secs(30),
            read_timeout: Some(Duration::from_secs(90)),
        }
    }
}

/// Drives one user's socket from join to leave.
///
/// Every run is tracked so [`ConnectionManager::close_all`] can wait for the
/// disconnect phase of each one before the process exits.
#[derive(Clone)]
pub struct ConnectionManager {
    registry: Registry,
    broker: Arc<dyn MessageBroker>,
    store: Arc<dyn RoomStore>,
    settings: ConnectionSettings,
    closing: CancellationToken,
    running: TaskTracker,
}

impl ConnectionManager {
    pub fn new(
        registry: Registry,
        broker: Arc<dyn MessageBroker>,
        store: Arc<dyn RoomStore>,
        settings: ConnectionSettings,
    ) -> Self {
        ConnectionManager {
            registry,
            broker,
            store,
            settings,
            closing: CancellationToken::new(),
            running: TaskTracker::new(),
        }
    }

    /// Serves the connection until the peer leaves, the socket fails or the
    /// connection is cancelled. Room existence and `name` are checked by the
    /// caller.
    pub async fn run<St, Si>(&self, name: String, room_id: String, stream: St, sink: Si)
    where
        St: Stream<Item = Result<Frame, TransportError>> + Unpin + Send,
        Si: Sink<Frame, Error = TransportError> + Unpin + Send + 'static,
    {
        self.running
            .track_future(self.serve(name, room_id, stream, sink))
            .await;
    }

    /// Cancels every connection, including ones still joining or started
    /// later, and waits until all of them have left their rooms.
    pub async fn close_all(&self) {
        self.closing.cancel();
        self.running.close();
        info!("waiting for {} connections to leave", self.running.len());
        self.running.wait().await;
    }

    async fn serve<St, Si>(&self, name: String, room_id: String, stream: St, sink: Si)
    where
        St: Stream<Item = Result<Frame, TransportError>> + Unpin + Send,
        Si: Sink<Frame, Error = TransportError> + Unpin + Send + 'static,
    {
        let mut member = Member::new(&room_id, name);
        let (connection, outbound) =
            Connection::with_cancel(member.id.clone(), room_id, self.closing.child_token());
        let connection = Arc::new(connection);
        let writer = tokio::spawn(write_frames(
            sink,
            outbound,
            connection.cancel.clone(),
            connection.id.clone(),
        ));

        self.connect(&connection, &member).await;
        let keepalive = tokio::spawn(keepalive(
            Arc::clone(&connection),
            self.settings.keepalive_interval,
        ));

        let reason = self.read_frames(&connection, &mut member, stream).await;
        info!("connection {} ended: {reason}", connection.id);

        self.disconnect(&connection, &member, keepalive, writer).await;
    }

    async fn connect(&self, connection: &Arc<Connection>, member: &Member) {
        self.registry
            .subscribe(connection, &[connection.room_id()])
            .await;

        if let Err(e) = self
            .store
            .add_member(connection.room_id(), member.clone())
            .await
        {
            error!("failed to add {} to room {}: {e}", member.id, connection.room_id);
        }

        let mut params = Map::new();
        params.insert("id".to_string(), json!(member.id));
        params.insert("name".to_string(), json!(member.name));
        params.insert("color".to_string(), json!(member.color));
        self.publish_event(connection, NEW_MEMBER, params).await;
        info!("{} joined room {}", member.id, connection.room_id);
    }

    async fn disconnect(
        &self,
        connection: &Arc<Connection>,
        member: &Member,
        keepalive: JoinHandle<()>,
        mut writer: JoinHandle<()>,
    ) {
        connection.cancel();
        if let Err(e) = keepalive.await {
            error!("keepalive for {} failed: {e}", connection.id);
        }

        let _ = connection.send(Frame::Close);
        match timeout(CLOSE_GRACE, &mut writer).await {
            Ok(Err(e)) => error!("writer for {} failed: {e}", connection.id),
            Err(_) => {
                warn!("writer for {} did not close in time", connection.id);
                writer.abort();
            }
            Ok(Ok(())) => {}
        }

        self.registry
            .unsubscribe(connection, &[connection.room_id()])
            .await;

        if let Err(e) = self
            .store
            .remove_member(connection.room_id(), &member.id)
            .await
        {
            error!("failed to remove {} from room {}: {e}", member.id, connection.room_id);
        }

        let mut params = Map::new();
        params.insert("id".to_string(), json!(member.id));
        self.publish_event(connection, LOGOUT_MEMBER, params).await;
        info!("{} left room {}", member.id, connection.room_id);
    }

    async fn publish_event(
        &self,
        connection: &Connection,
        method: &str,
        params: Map<String, Value>,
    ) {
        let event = Message::event(method, &connection.id, &connection.room_id, params);
        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode {method} event: {e}");
                return;
            }
        };
        if let Err(e) = self
            .broker
            .publish(payload.into_bytes(), &room_channel(&connection.room_id))
            .await
        {
            error!("failed to publish {method} for {}: {e}", connection.id);
        }
    }

    /// Reads until the connection has to end and returns why.
    async fn read_frames<St>(
        &self,
        connection: &Connection,
        member: &mut Member,
        mut stream: St,
    ) -> TransportError
    where
        St: Stream<Item = Result<Frame, TransportError>> + Unpin + Send,
    {
        loop {
            let frame = tokio::select! {
                () = connection.cancel.cancelled() => return TransportError::Cancelled,
                frame = self.next_frame(&mut stream) => frame,
            };
            match frame {
                Ok(Frame::Text(text)) => self.handle_frame(connection, member, &text).await,
                Ok(Frame::Close) => return TransportError::Closed,
                Ok(Frame::Binary(_)) => {
                    warn!("dropping binary frame from {}", connection.id);
                }
                Ok(Frame::Ping(_) | Frame::Pong(_)) => {}
                Err(e) => return e,
            }
        }
    }

    async fn next_frame<St>(&self, stream: &mut St) -> Result<Frame, TransportError>
    where
        St: Stream<Item = Result<Frame, TransportError>> + Unpin + Send,
    {
        let next = match self.settings.read_timeout {
            Some(limit) => timeout(limit, stream.next())
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => stream.next().await,
        };
        next.unwrap_or(Err(TransportError::Closed))
    }

    async fn handle_frame(&self, connection: &Connection, member: &mut Member, text: &str) {
        let mut message = match Message::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("dropping frame from {}: {e}", connection.id);
                return;
            }
        };
        message.stamp(&member.id, &connection.room_id, Utc::now());
        let request = match message.validate() {
            Ok(request) => request,
            Err(e) => {
                warn!("dropping request from {}: {e}", connection.id);
                return;
            }
        };

        match &request {
            Request::NewMessage { .. } => message.id = random_letters(5),
            Request::RenameMember { name } => {
                member.name.clone_from(name);
                if let Err(e) = self
                    .store
                    .update_member(&connection.room_id, member.clone())
                    .await
                {
                    error!("failed to rename {}: {e}", member.id);
                    return;
                }
            }
            Request::UpdateRoom { title, video_url } => {
                if let Err(e) = self
                    .store
                    .update_room(&connection.room_id, title.clone(), video_url.clone())
                    .await
                {
                    error!("failed to update room {}: {e}", connection.room_id);
                    return;
                }
            }
            Request::GetMe => {
                message.params.insert("id".to_string(), json!(member.id));
                message.params.insert("name".to_string(), json!(member.name));
                message.params.insert("color".to_string(), json!(member.color));
            }
            Request::GetMembers => match self.store.get_room(&connection.room_id).await {
                Ok(room) => {
                    message.params.insert("members".to_string(), json!(room.members));
                }
                Err(e) => {
                    error!("failed to list members of {}: {e}", connection.room_id);
                    return;
                }
            },
            _ => {}
        }

        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to encode {} from {}: {e}", message.method, connection.id);
                return;
            }
        };

        if request.is_private() {
            if let Err(e) = connection.send_text(payload) {
                warn!("failed to answer {}: {e}", connection.id);
            }
        } else if let Err(e) = self
            .broker
            .publish(payload.into_bytes(), &room_channel(&connection.room_id))
            .await
        {
            warn!("failed to publish {} from {}: {e}", message.method, connection.id);
        }
    }
}

async fn keepalive(connection: Arc<Connection>, every: Duration) {
    let mut ticker = interval_at(Instant::now() + every, every);
    loop {
        tokio::select! {
            () = connection.cancel.cancelled() => return,
            _ = ticker.tick() => {
                if let Err(e) = connection.ping() {
                    warn!("ping to {} failed: {e}", connection.id);
                    connection.cancel();
                    return;
                }
            }
        }
    }
}

async fn write_frames<Si>(
    mut sink: Si,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
    id: String,
) where
    Si: Sink<Frame, Error = TransportError> + Unpin + Send,
{
    while let Some(frame) = outbound.recv().await {
        if frame == Frame::Close {
            if let Err(e) = sink.close().await {
                debug!("closing socket of {id}: {e}");
            }
            return;
        }
        if let Err(e) = sink.send(frame).await {
            warn!("failed to write to {id}: {e}");
            cancel.cancel();
            return;
        }
    }
}
