use std::pin::pin;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info};
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, ConnectionInfo, RedisError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broker::{deliver, BrokerError, BrokerMessage, Handlers, MessageBroker, MessageHandler};

impl From<RedisError> for BrokerError {
    fn from(e: RedisError) -> Self {
        BrokerError::Transport(e.to_string())
    }
}

type Ack = oneshot::Sender<Result<(), BrokerError>>;

/// Subscription changes run on the receive loop, which owns the pub/sub
/// connection.
enum Command {
    Subscribe { pattern: String, done: Ack },
    Unsubscribe { patterns: Vec<String>, done: Ack },
}

/// [`MessageBroker`] over a Redis server shared by every relay process.
///
/// Publishing goes through a multiplexed connection; pattern subscriptions
/// live on a dedicated pub/sub connection read by one receive loop.
pub struct RedisBroker {
    node_id: Uuid,
    publisher: MultiplexedConnection,
    commands: mpsc::UnboundedSender<Command>,
    handlers: Handlers,
    cancel: CancellationToken,
}

impl RedisBroker {
    pub async fn connect(info: ConnectionInfo) -> Result<Self, BrokerError> {
        let client = redis::Client::open(info)?;
        let publisher = client.get_multiplexed_async_connection().await?;
        let pubsub = client.get_async_pubsub().await?;

        let node_id = Uuid::new_v4();
        let handlers = Handlers::default();
        let cancel = CancellationToken::new();
        let (commands, requests) = mpsc::unbounded_channel();
        tokio::spawn(serve_messages(
            node_id,
            pubsub,
            requests,
            handlers.clone(),
            cancel.clone(),
        ));
        info!("broker node {node_id} connected to redis");

        Ok(RedisBroker {
            node_id,
            publisher,
            commands,
            handlers,
            cancel,
        })
    }

    async fn request(&self, command: impl FnOnce(Ack) -> Command) -> Result<(), BrokerError> {
        if self.cancel.is_cancelled() {
            return Err(BrokerError::Closed);
        }
        let (done, result) = oneshot::channel();
        self.commands
            .send(command(done))
            .map_err(|_| BrokerError::Closed)?;
        result.await.map_err(|_| BrokerError::Closed)?
    }
}

async fn serve_messages(
    node_id: Uuid,
    mut pubsub: PubSub,
    mut requests: mpsc::UnboundedReceiver<Command>,
    handlers: Handlers,
    cancel: CancellationToken,
) {
    loop {
        let command = {
            let mut messages = pin!(pubsub.on_message());
            tokio::select! {
                () = cancel.cancelled() => break,
                command = requests.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
                msg = messages.next() => match msg {
                    Some(msg) => {
                        deliver(
                            &handlers,
                            BrokerMessage {
                                channel: msg.get_channel_name().to_string(),
                                payload: msg.get_payload_bytes().to_vec(),
                            },
                        );
                        continue;
                    }
                    None => {
                        error!("broker node {node_id} lost its redis subscription");
                        cancel.cancel();
                        break;
                    }
                },
            }
        };

        match command {
            Command::Subscribe { pattern, done } => {
                let result = pubsub.psubscribe(&pattern).await;
                let _ = done.send(result.map_err(BrokerError::from));
            }
            Command::Unsubscribe { patterns, done } => {
                let result = pubsub.punsubscribe(&patterns).await;
                let _ = done.send(result.map_err(BrokerError::from));
            }
        }
    }
    debug!("broker node {node_id} receive loop stopped");
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn publish(&self, payload: Vec<u8>, channel: &str) -> Result<(), BrokerError> {
        let mut publisher = self.publisher.clone();
        let receivers: i64 = publisher.publish(channel, payload).await?;
        if receivers == 0 {
            return Err(BrokerError::NoRecipients);
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<(), BrokerError> {
        // registered first so nothing that arrives right after PSUBSCRIBE is lost
        self.handlers
            .write()
            .await
            .insert(pattern.to_string(), handler);
        let subscribed = self
            .request(|done| Command::Subscribe {
                pattern: pattern.to_string(),
                done,
            })
            .await;
        if subscribed.is_err() {
            self.handlers.write().await.remove(pattern);
        } else {
            debug!("broker node {} subscribed to '{pattern}'", self.node_id);
        }
        subscribed
    }

    async fn unsubscribe(&self, patterns: &[&str]) -> Result<(), BrokerError> {
        if patterns.is_empty() {
            return Ok(());
        }
        {
            let mut handlers = self.handlers.write().await;
            for pattern in patterns {
                handlers.remove(*pattern);
            }
        }
        self.request(|done| Command::Unsubscribe {
            patterns: patterns.iter().map(ToString::to_string).collect(),
            done,
        })
        .await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.cancel.cancel();
        self.handlers.write().await.clear();
        Ok(())
    }
}

impl Drop for RedisBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
